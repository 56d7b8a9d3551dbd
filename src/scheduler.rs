// src/scheduler.rs

use crate::store::now_secs;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Time to wait before renewing a token that expires at `expires_at`:
/// `max(0, expires_at - now - skew)`.
pub fn renewal_delay(expires_at: u64, now: u64, skew: Duration) -> Duration {
    Duration::from_secs(expires_at.saturating_sub(now).saturating_sub(skew.as_secs()))
}

/// A single one-shot renewal timer.
///
/// Arming replaces the previous timer. Cancelling stops a timer that has not
/// fired yet; a renewal that already started is not interrupted.
pub struct RenewalScheduler {
    skew: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RenewalScheduler {
    pub fn new(skew: Duration) -> Self {
        Self {
            skew,
            timer: Mutex::new(None),
        }
    }

    /// Schedules `task` to run `skew` before `expires_at`. Must be called within a tokio runtime.
    pub fn arm<F, Fut>(&self, expires_at: u64, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = renewal_delay(expires_at, now_secs(), self.skew);
        debug!("Renewal scheduled in {:?}", delay);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detach so that cancelling the timer never aborts an in-flight renewal.
            tokio::spawn(task());
        });
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
            debug!("Renewal timer cancelled");
        }
    }

    /// Whether a timer is armed and has not fired yet.
    pub fn is_armed(&self) -> bool {
        self.timer.lock().as_ref().is_some_and(|timer| !timer.is_finished())
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}
