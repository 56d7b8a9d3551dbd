// src/transport/browser.rs

use super::{RedirectTransport, TransportOutcome};
use crate::error::KurveError;
use crate::request::{AuthRequest, ProviderResponse};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

/// Moves the top-level user agent to a URL (a window location assignment,
/// a webview load, a system browser launch).
pub trait Navigator: Send + Sync {
    fn navigate(&self, url: &Url);
}

/// Loads a URL where the user cannot see it and reports where the
/// provider redirected it.
#[async_trait]
pub trait SilentFrame: Send + Sync {
    /// Returns the final redirect URL, whose fragment carries the response.
    async fn load(&self, url: &Url) -> Result<Url, KurveError>;
}

/// Interactive transport: navigates the top-level user agent.
#[derive(Clone)]
pub struct BrowserRedirect {
    navigator: Arc<dyn Navigator>,
}

impl BrowserRedirect {
    pub fn new(navigator: Arc<dyn Navigator>) -> Self {
        Self { navigator }
    }
}

#[async_trait]
impl RedirectTransport for BrowserRedirect {
    async fn initiate(&self, request: &AuthRequest) -> Result<TransportOutcome, KurveError> {
        debug!(state = %request.state.state, "Navigating to the authorization endpoint");
        self.navigator.navigate(&request.url);
        Ok(TransportOutcome::Navigated(request.url.clone()))
    }

    fn sign_out(&self, logout_url: &Url) {
        self.navigator.navigate(logout_url);
    }
}

/// Silent transport: loads the request in a hidden frame and reads the
/// response from the frame's final fragment.
#[derive(Clone)]
pub struct BrowserSilentIframe {
    frame: Arc<dyn SilentFrame>,
    timeout: Duration,
}

impl BrowserSilentIframe {
    pub fn new(frame: Arc<dyn SilentFrame>) -> Self {
        Self {
            frame,
            timeout: Duration::from_secs(10),
        }
    }

    /// How long to wait for the frame to redirect back. Defaults to 10 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl RedirectTransport for BrowserSilentIframe {
    #[instrument(skip(self, request), fields(state = %request.state.state), err)]
    async fn initiate(&self, request: &AuthRequest) -> Result<TransportOutcome, KurveError> {
        let landed = match tokio::time::timeout(self.timeout, self.frame.load(&request.url)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Hidden frame did not redirect back within {:?}", self.timeout);
                return Err(KurveError::Network(format!(
                    "silent request timed out after {:?}",
                    self.timeout
                )));
            }
        };
        let response = ProviderResponse::from_redirect(landed.as_str())?;
        Ok(TransportOutcome::Response(response))
    }
}
