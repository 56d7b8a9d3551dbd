// src/config.rs

use crate::cache::ResourceKey;
use crate::error::KurveError;
use crate::store::{MemoryStore, TokenStore};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com/";
const DEFAULT_TENANT: &str = "common";
const DEFAULT_RESOURCE: &str = "https://graph.microsoft.com";
const DEFAULT_SCOPES: &str = "openid profile";

/// The Azure AD endpoint generation to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointVersion {
    /// `oauth2/authorize`, tokens requested per resource URI.
    #[default]
    V1,
    /// `oauth2/v2.0/authorize`, tokens requested per scope set.
    V2,
}

/// How the identity crosses the authorization boundary. Selected once at construction.
#[derive(Clone, PartialEq, Eq)]
pub enum Mode {
    /// Implicit flow in a browser-like host; tokens come back in the URL fragment.
    Client,
    /// Server-side authorization-code flow with a confidential client.
    Node { client_secret: String },
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Client => f.write_str("Client"),
            Mode::Node { .. } => f.debug_struct("Node").field("client_secret", &"<redacted>").finish(),
        }
    }
}

/// The configuration of an [`Identity`](crate::identity::Identity).
///
/// Construct it with [`ConfigBuilder`].
#[derive(Clone)]
pub struct Config {
    pub client_id: String,
    pub redirect_uri: Url,
    /// Authority host, e.g. `https://login.microsoftonline.com/`.
    pub authority: Url,
    /// Tenant id or domain, `common`, or a B2C tenant.
    pub tenant: String,
    /// B2C policy sent as the `p` parameter.
    pub policy: Option<String>,
    pub endpoint_version: EndpointVersion,
    pub mode: Mode,
    /// Resource used for the root token on v1 endpoints.
    pub default_resource: String,
    /// Scopes used for the root token on v2 endpoints.
    pub default_scopes: Vec<String>,
    /// Lead time before expiry at which silent renewal fires. Defaults to 5 minutes.
    pub renewal_skew: Duration,
    /// How long a pending authorization request stays valid. Defaults to 10 minutes.
    pub request_ttl: Duration,
    pub post_logout_redirect_uri: Option<Url>,
    pub store: Arc<dyn TokenStore>,
}

impl Config {
    /// The key under which the login's own token is cached.
    pub fn root_key(&self) -> ResourceKey {
        match self.endpoint_version {
            EndpointVersion::V1 => ResourceKey::resource(self.default_resource.clone()),
            EndpointVersion::V2 => ResourceKey::scopes(&self.default_scopes),
        }
    }

    /// `{authority}{tenant}/oauth2[/v2.0]/{endpoint}`.
    pub(crate) fn endpoint(&self, tenant: Option<&str>, endpoint: &str) -> Result<Url, KurveError> {
        let tenant = tenant.unwrap_or(&self.tenant);
        let path = match self.endpoint_version {
            EndpointVersion::V1 => format!("{tenant}/oauth2/{endpoint}"),
            EndpointVersion::V2 => format!("{tenant}/oauth2/v2.0/{endpoint}"),
        };
        self.authority
            .join(&path)
            .map_err(|e| KurveError::InvalidUrl(e.to_string()))
    }

    pub fn is_node(&self) -> bool {
        matches!(self.mode, Mode::Node { .. })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("authority", &self.authority.as_str())
            .field("tenant", &self.tenant)
            .field("policy", &self.policy)
            .field("endpoint_version", &self.endpoint_version)
            .field("mode", &self.mode)
            .field("renewal_skew", &self.renewal_skew)
            .finish_non_exhaustive()
    }
}

/// Deserializable settings, for configuration loaded from a file or the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySettings {
    pub client_id: String,
    pub redirect_uri: String,
    pub authority: Option<String>,
    pub tenant: Option<String>,
    pub policy: Option<String>,
    #[serde(default)]
    pub endpoint_version: EndpointVersion,
    /// Setting a secret selects node mode.
    pub client_secret: Option<String>,
    pub default_resource: Option<String>,
    pub default_scopes: Option<Vec<String>>,
    pub renewal_skew_seconds: Option<u64>,
    pub request_ttl_seconds: Option<u64>,
    pub post_logout_redirect_uri: Option<String>,
}

/// A builder for creating a `Config` instance.
#[derive(Default)]
pub struct ConfigBuilder {
    client_id: Option<String>,
    redirect_uri: Option<Url>,
    authority: Option<Url>,
    tenant: Option<String>,
    policy: Option<String>,
    endpoint_version: EndpointVersion,
    client_secret: Option<String>,
    default_resource: Option<String>,
    default_scopes: Option<Vec<String>>,
    renewal_skew: Option<Duration>,
    request_ttl: Option<Duration>,
    post_logout_redirect_uri: Option<Url>,
    store: Option<Arc<dyn TokenStore>>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a builder from deserialized settings.
    pub fn from_settings(settings: IdentitySettings) -> Result<Self, KurveError> {
        let mut builder = Self::new()
            .client_id(settings.client_id)
            .redirect_uri(&settings.redirect_uri)?
            .endpoint_version(settings.endpoint_version);
        if let Some(authority) = settings.authority {
            builder = builder.authority(&authority)?;
        }
        if let Some(tenant) = settings.tenant {
            builder = builder.tenant(tenant);
        }
        if let Some(policy) = settings.policy {
            builder = builder.policy(policy);
        }
        if let Some(secret) = settings.client_secret {
            builder = builder.client_secret(secret);
        }
        if let Some(resource) = settings.default_resource {
            builder = builder.default_resource(resource);
        }
        if let Some(scopes) = settings.default_scopes {
            builder = builder.default_scopes(scopes);
        }
        if let Some(secs) = settings.renewal_skew_seconds {
            builder = builder.renewal_skew(Duration::from_secs(secs));
        }
        if let Some(secs) = settings.request_ttl_seconds {
            builder = builder.request_ttl(Duration::from_secs(secs));
        }
        if let Some(uri) = settings.post_logout_redirect_uri {
            builder = builder.post_logout_redirect_uri(&uri)?;
        }
        Ok(builder)
    }

    /// Sets the application (client) id. This is a required field.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the redirect URI registered for the application. This is a required field.
    pub fn redirect_uri(mut self, uri: &str) -> Result<Self, KurveError> {
        self.redirect_uri = Some(Url::parse(uri).map_err(|e| KurveError::InvalidUrl(e.to_string()))?);
        Ok(self)
    }

    /// Overrides the authority host. Defaults to `https://login.microsoftonline.com/`.
    pub fn authority(mut self, uri: &str) -> Result<Self, KurveError> {
        let mut url = Url::parse(uri).map_err(|e| KurveError::InvalidUrl(e.to_string()))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        self.authority = Some(url);
        Ok(self)
    }

    /// Defaults to `common`.
    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn endpoint_version(mut self, version: EndpointVersion) -> Self {
        self.endpoint_version = version;
        self
    }

    /// Switches to node mode with the given confidential client secret.
    pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn default_resource(mut self, resource: impl Into<String>) -> Self {
        self.default_resource = Some(resource.into());
        self
    }

    pub fn default_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_scopes = Some(scopes.into_iter().map(Into::into).collect());
        self
    }

    pub fn renewal_skew(mut self, skew: Duration) -> Self {
        self.renewal_skew = Some(skew);
        self
    }

    pub fn request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = Some(ttl);
        self
    }

    pub fn post_logout_redirect_uri(mut self, uri: &str) -> Result<Self, KurveError> {
        self.post_logout_redirect_uri =
            Some(Url::parse(uri).map_err(|e| KurveError::InvalidUrl(e.to_string()))?);
        Ok(self)
    }

    /// Sets the store behind the token cache and pending requests.
    /// Defaults to a fresh [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Consumes the builder and returns a `Config` object.
    ///
    /// # Errors
    ///
    /// Returns an error if `client_id` or `redirect_uri` is missing, or if a
    /// B2C policy is combined with the v1 endpoint.
    pub fn build(self) -> Result<Config, KurveError> {
        let client_id = self
            .client_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| KurveError::MissingConfiguration("client_id".to_string()))?;
        let redirect_uri = self
            .redirect_uri
            .ok_or_else(|| KurveError::MissingConfiguration("redirect_uri".to_string()))?;
        if self.policy.is_some() && self.endpoint_version == EndpointVersion::V1 {
            return Err(KurveError::InvalidConfiguration(
                "B2C policies require the v2 endpoint".to_string(),
            ));
        }
        let authority = match self.authority {
            Some(url) => url,
            None => Url::parse(DEFAULT_AUTHORITY).map_err(|e| KurveError::InvalidUrl(e.to_string()))?,
        };
        let mode = match self.client_secret {
            Some(client_secret) => Mode::Node { client_secret },
            None => Mode::Client,
        };

        Ok(Config {
            client_id,
            redirect_uri,
            authority,
            tenant: self.tenant.unwrap_or_else(|| DEFAULT_TENANT.to_string()),
            policy: self.policy,
            endpoint_version: self.endpoint_version,
            mode,
            default_resource: self.default_resource.unwrap_or_else(|| DEFAULT_RESOURCE.to_string()),
            default_scopes: self
                .default_scopes
                .unwrap_or_else(|| DEFAULT_SCOPES.split(' ').map(str::to_string).collect()),
            renewal_skew: self.renewal_skew.unwrap_or(Duration::from_secs(5 * 60)),
            request_ttl: self.request_ttl.unwrap_or(Duration::from_secs(10 * 60)),
            post_logout_redirect_uri: self.post_logout_redirect_uri,
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
            .client_id("client-1")
            .redirect_uri("https://app.example.com/callback")
            .unwrap()
    }

    #[test]
    fn build_applies_defaults() {
        let config = builder().build().unwrap();
        assert_eq!(config.tenant, "common");
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.renewal_skew, Duration::from_secs(300));
        assert_eq!(config.root_key(), ResourceKey::resource("https://graph.microsoft.com"));
        assert_eq!(
            config.endpoint(None, "authorize").unwrap().as_str(),
            "https://login.microsoftonline.com/common/oauth2/authorize"
        );
    }

    #[test]
    fn missing_client_id_is_rejected() {
        let result = ConfigBuilder::new()
            .redirect_uri("https://app.example.com/callback")
            .unwrap()
            .build();
        assert!(matches!(result, Err(KurveError::MissingConfiguration(field)) if field == "client_id"));
    }

    #[test]
    fn client_secret_selects_node_mode() {
        let config = builder().client_secret("s3cret").build().unwrap();
        assert!(config.is_node());
        assert!(!format!("{:?}", config).contains("s3cret"));
    }

    #[test]
    fn v2_endpoints_and_root_scopes() {
        let config = builder()
            .endpoint_version(EndpointVersion::V2)
            .authority("http://127.0.0.1:8080/base")
            .unwrap()
            .tenant("contoso.onmicrosoft.com")
            .default_scopes(["profile", "openid", "User.Read"])
            .build()
            .unwrap();
        assert_eq!(
            config.endpoint(None, "token").unwrap().as_str(),
            "http://127.0.0.1:8080/base/contoso.onmicrosoft.com/oauth2/v2.0/token"
        );
        assert_eq!(config.root_key(), ResourceKey::scopes(["openid", "profile", "user.read"]));
    }

    #[test]
    fn policy_requires_v2() {
        assert!(matches!(
            builder().policy("B2C_1_signin").build(),
            Err(KurveError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn settings_deserialize_into_a_builder() {
        let settings: IdentitySettings = serde_json::from_value(serde_json::json!({
            "client_id": "client-1",
            "redirect_uri": "https://app.example.com/callback",
            "endpoint_version": "v2",
            "client_secret": "s",
            "renewal_skew_seconds": 120
        }))
        .unwrap();
        let config = ConfigBuilder::from_settings(settings).unwrap().build().unwrap();
        assert_eq!(config.endpoint_version, EndpointVersion::V2);
        assert_eq!(config.renewal_skew, Duration::from_secs(120));
        assert!(config.is_node());
    }
}
