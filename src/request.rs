// src/request.rs

use crate::cache::ResourceKey;
use crate::codec::IdToken;
use crate::config::{Config, EndpointVersion, Mode};
use crate::error::KurveError;
use crate::store::{now_secs, TokenStore};
use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tracing::debug;
use url::Url;
use uuid::Uuid;

const REQUEST_PREFIX: &str = "kurve.request.";

/// Tenant id of Microsoft personal accounts.
const CONSUMERS_TENANT_ID: &str = "9188040d-6c67-4c5b-b112-36a304b66dad";

/// Whether the user may be shown UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prompt {
    Interactive,
    /// `prompt=none`: the provider must answer without user interaction.
    Silent,
}

/// One authorization attempt, correlated with its response by `state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequestState {
    pub state: String,
    pub nonce: String,
    pub resource_key: ResourceKey,
    pub prompt: Prompt,
    /// Whether the provider should return an ID token alongside the access token.
    pub wants_id_token: bool,
    pub tenant: Option<String>,
    pub policy: Option<String>,
    pub created_at: u64,
    pub expires_at: u64,
}

impl AuthRequestState {
    /// Creates a request with a fresh random state and nonce.
    pub fn new(resource_key: ResourceKey, prompt: Prompt, ttl_secs: u64) -> Self {
        let created_at = now_secs();
        Self {
            state: Uuid::new_v4().simple().to_string(),
            nonce: URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>()),
            resource_key,
            prompt,
            wants_id_token: prompt == Prompt::Interactive,
            tenant: None,
            policy: None,
            created_at,
            expires_at: created_at + ttl_secs,
        }
    }

    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant;
        self
    }

    pub fn with_policy(mut self, policy: Option<String>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_id_token(mut self, wants_id_token: bool) -> Self {
        self.wants_id_token = wants_id_token;
        self
    }
}

/// Credentials redeemed at the token endpoint instead of a browser round trip.
#[derive(Clone, PartialEq, Eq)]
pub enum Grant {
    AuthorizationCode(String),
    RefreshToken(String),
}

impl std::fmt::Debug for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Grant::AuthorizationCode(_) => f.write_str("AuthorizationCode(<redacted>)"),
            Grant::RefreshToken(_) => f.write_str("RefreshToken(<redacted>)"),
        }
    }
}

/// Everything a transport needs to carry a request to the provider.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub state: AuthRequestState,
    pub url: Url,
    pub grant: Option<Grant>,
}

/// Hints that let a silent request pick the signed-in account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginHints {
    pub login_hint: Option<String>,
    pub domain_hint: Option<String>,
}

impl LoginHints {
    pub fn from_id_token(id_token: &IdToken) -> Self {
        let domain_hint = id_token.tenant_id.as_deref().map(|tid| {
            if tid == CONSUMERS_TENANT_ID {
                "consumers".to_string()
            } else {
                "organizations".to_string()
            }
        });
        Self {
            login_hint: id_token.preferred_username.clone().or_else(|| id_token.email.clone()),
            domain_hint,
        }
    }
}

/// Builds the authorization endpoint URL for `request`.
pub fn authorize_url(config: &Config, request: &AuthRequestState, hints: &LoginHints) -> Result<Url, KurveError> {
    let mut url = config.endpoint(request.tenant.as_deref(), "authorize")?;
    let (response_type, response_mode) = match (&config.mode, request.wants_id_token) {
        (Mode::Node { .. }, _) => ("code", "query"),
        (Mode::Client, true) => ("id_token token", "fragment"),
        (Mode::Client, false) => ("token", "fragment"),
    };
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", config.redirect_uri.as_str())
            .append_pair("response_type", response_type);
        match (config.endpoint_version, &request.resource_key) {
            (EndpointVersion::V1, ResourceKey::Resource(resource)) => {
                query.append_pair("scope", "openid").append_pair("resource", resource);
            }
            (_, key) => {
                let mut scopes = key.scope_string().unwrap_or_default();
                if !scopes.split(' ').any(|s| s == "openid") {
                    scopes = format!("openid {scopes}").trim_end().to_string();
                }
                query.append_pair("scope", &scopes);
            }
        }
        query
            .append_pair("state", &request.state)
            .append_pair("nonce", &request.nonce)
            .append_pair("response_mode", response_mode);
        if let Some(policy) = request.policy.as_deref().or(config.policy.as_deref()) {
            query.append_pair("p", policy);
        }
        if request.prompt == Prompt::Silent {
            query.append_pair("prompt", "none");
            if let Some(login_hint) = &hints.login_hint {
                query.append_pair("login_hint", login_hint);
            }
            if let Some(domain_hint) = &hints.domain_hint {
                query.append_pair("domain_hint", domain_hint);
            }
        }
    }
    Ok(url)
}

/// Builds the provider logout URL.
pub fn logout_url(config: &Config) -> Result<Url, KurveError> {
    let mut url = config.endpoint(None, "logout")?;
    if let Some(redirect) = &config.post_logout_redirect_uri {
        url.query_pairs_mut()
            .append_pair("post_logout_redirect_uri", redirect.as_str());
    }
    Ok(url)
}

/// What the provider sent back, from a redirect fragment, a query string or the token endpoint.
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ProviderResponse {
    pub id_token: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl ProviderResponse {
    /// Parses `#a=b&c=d`, `?a=b`, `a=b`, or a full redirect URL.
    pub fn from_redirect(input: &str) -> Result<Self, KurveError> {
        let encoded = match Url::parse(input) {
            Ok(url) => url
                .fragment()
                .or_else(|| url.query())
                .unwrap_or_default()
                .to_string(),
            Err(_) => input.trim_start_matches(['#', '?']).to_string(),
        };
        serde_urlencoded::from_str(&encoded)
            .map_err(|e| KurveError::MalformedToken(format!("unreadable redirect response: {e}")))
    }

    /// The provider error carried in the response, if any.
    pub fn error(&self, status: Option<u16>) -> Option<KurveError> {
        self.error
            .clone()
            .map(|error| KurveError::from_provider(status, error, self.error_description.clone()))
    }
}

impl std::fmt::Debug for ProviderResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("ProviderResponse")
            .field("id_token", &redact(&self.id_token))
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("code", &redact(&self.code))
            .field("expires_in", &self.expires_in)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("error_description", &self.error_description)
            .finish()
    }
}

/// v1 token endpoints send `expires_in` as a string, v2 as a number.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Number(u64),
        Text(String),
    }
    match Option::<Lenient>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Lenient::Number(n)) => Ok(Some(n)),
        Some(Lenient::Text(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Pending authorization requests, kept in the store keyed by `state`.
#[derive(Clone)]
pub struct RequestCorrelation {
    store: Arc<dyn TokenStore>,
}

impl RequestCorrelation {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    pub fn save(&self, request: &AuthRequestState) -> Result<(), KurveError> {
        let value = serde_json::to_string(request)
            .map_err(|e| KurveError::InvalidConfiguration(format!("cannot serialize request: {e}")))?;
        self.store
            .persist(&format!("{REQUEST_PREFIX}{}", request.state), &value, request.expires_at);
        debug!(state = %request.state, "Saved pending authorization request");
        Ok(())
    }

    /// Consumes the pending request for `state`. A request can be taken once.
    pub fn take(&self, state: &str) -> Option<AuthRequestState> {
        let key = format!("{REQUEST_PREFIX}{state}");
        let raw = self.store.retrieve(&key)?;
        self.store.remove(&key);
        let request: AuthRequestState = serde_json::from_str(&raw).ok()?;
        if request.state != state || request.expires_at <= now_secs() {
            return None;
        }
        Some(request)
    }

    /// Reads the pending request for `state` without consuming it.
    pub fn peek(&self, state: &str) -> Option<AuthRequestState> {
        let raw = self.store.retrieve(&format!("{REQUEST_PREFIX}{state}"))?;
        serde_json::from_str::<AuthRequestState>(&raw)
            .ok()
            .filter(|request| request.expires_at > now_secs())
    }

    pub fn discard(&self, state: &str) {
        self.store.remove(&format!("{REQUEST_PREFIX}{state}"));
    }
}
