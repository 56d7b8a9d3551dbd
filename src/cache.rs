// src/cache.rs

use crate::codec::{self, DecodedClaims};
use crate::error::KurveError;
use crate::store::{now_secs, TokenStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const TOKEN_PREFIX: &str = "kurve.token.";

/// The cache lookup key for a token.
///
/// v1 endpoints request tokens for a resource URI; v2 endpoints request a set
/// of scopes. Scope sets are normalized (trimmed, lower-cased, de-duplicated,
/// ordered) so that the same scopes requested in any order share one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKey {
    Resource(String),
    Scopes(BTreeSet<String>),
}

impl ResourceKey {
    pub fn resource(uri: impl Into<String>) -> Self {
        ResourceKey::Resource(uri.into())
    }

    pub fn scopes<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ResourceKey::Scopes(
            scopes
                .into_iter()
                .flat_map(|s| {
                    s.as_ref()
                        .split_whitespace()
                        .map(str::to_lowercase)
                        .collect::<Vec<_>>()
                })
                .collect(),
        )
    }

    /// Space-separated scope string, as sent in the `scope` parameter.
    pub fn scope_string(&self) -> Option<String> {
        match self {
            ResourceKey::Scopes(scopes) => Some(scopes.iter().cloned().collect::<Vec<_>>().join(" ")),
            ResourceKey::Resource(_) => None,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Resource(uri) => write!(f, "resource:{uri}"),
            ResourceKey::Scopes(_) => write!(f, "scopes:{}", self.scope_string().unwrap_or_default()),
        }
    }
}

impl From<&str> for ResourceKey {
    fn from(uri: &str) -> Self {
        ResourceKey::resource(uri)
    }
}

/// A cached token. Records are replaced as a whole, never updated in place.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenRecord {
    pub raw_token: String,
    /// Claims, when the token is JWT-shaped. Opaque access tokens have none.
    pub claims: Option<DecodedClaims>,
    /// Expiry, in seconds since the Unix epoch.
    pub expires_at: u64,
    pub resource_key: ResourceKey,
    /// Refresh token issued alongside, in node mode.
    pub refresh_token: Option<String>,
}

impl TokenRecord {
    /// Builds a record for a token returned by the provider.
    ///
    /// The expiry is the token's `exp` claim when it decodes, otherwise
    /// `now + expires_in`. A token with neither is rejected.
    pub fn from_token(
        raw_token: String,
        resource_key: ResourceKey,
        expires_in: Option<u64>,
    ) -> Result<Self, KurveError> {
        let claims = codec::decode(&raw_token).ok();
        let expires_at = claims
            .as_ref()
            .and_then(DecodedClaims::exp)
            .or_else(|| expires_in.map(|secs| now_secs() + secs))
            .ok_or_else(|| KurveError::MalformedToken("token carries no expiry".to_string()))?;
        Ok(Self {
            raw_token,
            claims,
            expires_at,
            resource_key,
            refresh_token: None,
        })
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_secs())
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("resource_key", &self.resource_key)
            .field("expires_at", &self.expires_at)
            .field("raw_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Default, Serialize, Deserialize)]
struct Index {
    keys: BTreeSet<String>,
    expiry: u64,
}

/// Resource-keyed token cache on top of a [`TokenStore`].
///
/// Records are serialized to JSON and written through the store with their
/// expiry, so the in-memory store and an application-supplied store behave
/// the same. Every key lives under `namespace`, so caches of different
/// sessions can share one store without seeing each other's tokens. An index
/// entry per namespace tracks the keys written so `clear` can remove entries
/// persisted by earlier requests.
#[derive(Clone)]
pub struct TokenCache {
    store: Arc<dyn TokenStore>,
    namespace: String,
    index_lock: Arc<Mutex<()>>,
}

impl TokenCache {
    pub fn new(store: Arc<dyn TokenStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            index_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn storage_key(&self, key: &ResourceKey) -> String {
        format!("{TOKEN_PREFIX}{}.{key}", self.namespace)
    }

    fn index_key(&self) -> String {
        format!("{TOKEN_PREFIX}{}.index", self.namespace)
    }

    /// Returns the unexpired record for `key`. Expired or unreadable entries are misses.
    pub fn get(&self, key: &ResourceKey) -> Option<TokenRecord> {
        let raw = self.store.retrieve(&self.storage_key(key))?;
        if raw.is_empty() {
            return None;
        }
        let record: TokenRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring unreadable cache entry for {}: {}", key, e);
                return None;
            }
        };
        if record.is_expired() {
            debug!("Cache entry for {} is expired", key);
            return None;
        }
        Some(record)
    }

    /// Stores `record` under its resource key, replacing any previous record.
    pub fn set(&self, record: &TokenRecord) -> Result<(), KurveError> {
        let storage_key = self.storage_key(&record.resource_key);
        let value = serde_json::to_string(record)
            .map_err(|e| KurveError::InvalidConfiguration(format!("cannot serialize token record: {e}")))?;

        let _guard = self.index_lock.lock();
        self.store.persist(&storage_key, &value, record.expires_at);
        let mut index = self.read_index();
        index.keys.insert(storage_key);
        index.expiry = index.expiry.max(record.expires_at);
        self.write_index(&index);
        debug!("Cached token for {} until {}", record.resource_key, record.expires_at);
        Ok(())
    }

    pub fn remove(&self, key: &ResourceKey) {
        let storage_key = self.storage_key(key);
        let _guard = self.index_lock.lock();
        self.store.remove(&storage_key);
        let mut index = self.read_index();
        if index.keys.remove(&storage_key) {
            self.write_index(&index);
        }
    }

    /// Removes every record of this namespace.
    pub fn clear(&self) {
        let _guard = self.index_lock.lock();
        let index = self.read_index();
        for key in &index.keys {
            self.store.remove(key);
        }
        self.store.remove(&self.index_key());
        debug!("Cleared {} cached tokens", index.keys.len());
    }

    fn read_index(&self) -> Index {
        self.store
            .retrieve(&self.index_key())
            .filter(|raw| !raw.is_empty())
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn write_index(&self, index: &Index) {
        match serde_json::to_string(index) {
            Ok(value) => self.store.persist(&self.index_key(), &value, index.expiry),
            Err(e) => warn!("Failed to serialize token index: {}", e),
        }
    }
}
