// src/store.rs

use moka::sync::Cache;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Key-value storage behind the token cache and the request correlation.
///
/// In client mode the identity uses a [`MemoryStore`]. In node mode the
/// application supplies a store (session, shared cache, database) so that
/// state survives between the request that starts a login and the request
/// that carries the callback. The store must be safe for whatever
/// concurrency the host runs requests under.
pub trait TokenStore: Send + Sync {
    /// Stores `value` under `key` until `expiry` (seconds since the Unix epoch).
    fn persist(&self, key: &str, value: &str, expiry: u64);

    /// Returns the value stored under `key`, or `None`.
    fn retrieve(&self, key: &str) -> Option<String>;

    /// Removes `key`. Stores without deletion can overwrite the entry with an
    /// already-expired empty value, which is what the default does.
    fn remove(&self, key: &str) {
        self.persist(key, "", 0);
    }
}

/// In-memory [`TokenStore`]. Entries past their expiry read as absent.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Cache<String, (String, u64)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Cache::new(1_000),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl TokenStore for MemoryStore {
    fn persist(&self, key: &str, value: &str, expiry: u64) {
        self.entries.insert(key.to_string(), (value.to_string(), expiry));
    }

    fn retrieve(&self, key: &str) -> Option<String> {
        let (value, expiry) = self.entries.get(key)?;
        if expiry <= now_secs() {
            self.entries.invalidate(key);
            return None;
        }
        Some(value)
    }

    fn remove(&self, key: &str) {
        self.entries.invalidate(key);
    }
}

/// Seconds since the Unix epoch.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
