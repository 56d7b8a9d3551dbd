// src/transport/node.rs

use super::{RedirectTransport, TransportOutcome};
use crate::cache::ResourceKey;
use crate::config::{Config, EndpointVersion, Mode};
use crate::error::KurveError;
use crate::request::{AuthRequest, Grant, Prompt, ProviderResponse};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Server-side transport for confidential clients.
///
/// Interactive requests without a grant are handed back as
/// [`TransportOutcome::Navigated`] so the host can answer its inbound request
/// with a redirect. Requests carrying an authorization code or a refresh
/// token are redeemed at the token endpoint with the client secret.
#[derive(Clone)]
pub struct NodeAuthorizationCodeExchange {
    // Internally ref-counted to allow for cheap cloning.
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    client_secret: String,
    http_client: reqwest::Client,
}

impl NodeAuthorizationCodeExchange {
    /// Creates the transport. The configuration must be in node mode.
    pub fn new(config: Config) -> Result<Self, KurveError> {
        Self::with_client(config, reqwest::Client::new())
    }

    /// Creates the transport with a preconfigured HTTP client (proxies, TLS roots, timeouts).
    pub fn with_client(config: Config, http_client: reqwest::Client) -> Result<Self, KurveError> {
        let client_secret = match &config.mode {
            Mode::Node { client_secret } => client_secret.clone(),
            Mode::Client => {
                return Err(KurveError::InvalidConfiguration(
                    "the code exchange needs a client secret (node mode)".to_string(),
                ))
            }
        };
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client_secret,
                http_client,
            }),
        })
    }

    fn form(&self, request: &AuthRequest, grant: &Grant) -> Vec<(&'static str, String)> {
        let config = &self.inner.config;
        let mut form = vec![
            ("client_id", config.client_id.clone()),
            ("client_secret", self.inner.client_secret.clone()),
        ];
        match grant {
            Grant::AuthorizationCode(code) => {
                form.push(("grant_type", "authorization_code".to_string()));
                form.push(("code", code.clone()));
                form.push(("redirect_uri", config.redirect_uri.to_string()));
            }
            Grant::RefreshToken(token) => {
                form.push(("grant_type", "refresh_token".to_string()));
                form.push(("refresh_token", token.clone()));
            }
        }
        match (config.endpoint_version, &request.state.resource_key) {
            (EndpointVersion::V1, ResourceKey::Resource(resource)) => form.push(("resource", resource.clone())),
            (_, key) => {
                let mut scopes = key.scope_string().unwrap_or_default();
                if !scopes.split(' ').any(|s| s == "offline_access") {
                    scopes = format!("{scopes} offline_access").trim_start().to_string();
                }
                form.push(("scope", scopes));
            }
        }
        form
    }

    /// Redeems `grant` at the token endpoint.
    #[instrument(skip(self, request, grant), fields(state = %request.state.state), err)]
    async fn redeem(&self, request: &AuthRequest, grant: &Grant) -> Result<ProviderResponse, KurveError> {
        let config = &self.inner.config;
        let mut token_endpoint = config.endpoint(request.state.tenant.as_deref(), "token")?;
        if let Some(policy) = request.state.policy.as_deref().or(config.policy.as_deref()) {
            token_endpoint.query_pairs_mut().append_pair("p", policy);
        }
        debug!("Redeeming {:?} at {}", grant, token_endpoint);

        let response = self
            .inner
            .http_client
            .post(token_endpoint)
            .form(&self.form(request, grant))
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;

        let parsed: Result<ProviderResponse, _> = serde_json::from_slice(&body);
        match parsed {
            Ok(token_response) => {
                if let Some(error) = token_response.error(Some(status.as_u16())) {
                    warn!("Token endpoint returned an error: {}", error);
                    return Err(error);
                }
                if !status.is_success() {
                    return Err(KurveError::Network(format!("token endpoint answered {status}")));
                }
                Ok(token_response)
            }
            Err(e) if status.is_success() => Err(KurveError::MalformedToken(format!(
                "unreadable token endpoint response: {e}"
            ))),
            Err(_) => Err(KurveError::Network(format!("token endpoint answered {status}"))),
        }
    }
}

#[async_trait]
impl RedirectTransport for NodeAuthorizationCodeExchange {
    async fn initiate(&self, request: &AuthRequest) -> Result<TransportOutcome, KurveError> {
        match (&request.grant, request.state.prompt) {
            (Some(grant), _) => {
                let mut response = self.redeem(request, grant).await?;
                // The token endpoint does not echo state; the request is its own correlation.
                response.state.get_or_insert_with(|| request.state.state.clone());
                Ok(TransportOutcome::Response(response))
            }
            (None, Prompt::Interactive) => Ok(TransportOutcome::Navigated(request.url.clone())),
            (None, Prompt::Silent) => Err(KurveError::InteractionRequired(
                "no refresh token available for a silent request".to_string(),
            )),
        }
    }
}
