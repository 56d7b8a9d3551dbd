// src/error.rs

use thiserror::Error;

/// The primary error type for the `kurve-identity` library.
///
/// Every failure of a login, callback or token acquisition is delivered as a
/// value of this type, either as the `Err` of the returned future or as the
/// argument of the completion callback.
#[derive(Debug, Error)]
pub enum KurveError {
    /// A token could not be split, base64url-decoded or parsed as JSON claims.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// The `state` echoed by the identity provider does not match any pending request.
    #[error("State mismatch: the response does not correspond to a pending authorization request")]
    StateMismatch,

    /// The `nonce` claim of the ID token does not match the nonce of the request.
    #[error("Nonce mismatch: the nonce in the token does not match the expected nonce")]
    NonceMismatch,

    /// A silent request cannot complete without the user; an interactive login is needed.
    #[error("Interaction required: {0}")]
    InteractionRequired(String),

    /// The token endpoint or hidden frame could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// An HTTP request to the token endpoint failed.
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The identity provider answered with an OAuth2 error.
    #[error("Provider error '{error}': {}", .description.as_deref().unwrap_or("no description"))]
    Provider {
        /// HTTP status of the token endpoint response, when there was one.
        status: Option<u16>,
        error: String,
        description: Option<String>,
    },

    /// `login_async` was called while another login is waiting for its callback.
    #[error("A login is already in progress")]
    LoginAlreadyInProgress,

    /// A token was requested before the identity was authenticated.
    #[error("Not authenticated: log in before requesting tokens")]
    NotAuthenticated,

    /// A pending login was abandoned because the identity logged out.
    #[error("The pending login was cancelled")]
    LoginCancelled,

    /// A response arrived for a request that is no longer current and was discarded.
    #[error("Discarded a response for a superseded request")]
    StaleResponse,

    /// A silent transport navigated away instead of answering in-band.
    #[error("The silent transport navigated away instead of returning a response")]
    UnexpectedNavigation,

    /// A provided URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A required configuration field is missing.
    #[error("A required configuration field is missing: {0}")]
    MissingConfiguration(String),

    /// A configuration value is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl KurveError {
    /// The HTTP status associated with the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            KurveError::HttpError(e) => e.status().map(|s| s.as_u16()),
            KurveError::Provider { status, .. } => *status,
            _ => None,
        }
    }

    /// A short, stable label for the failure kind.
    pub fn status_text(&self) -> &'static str {
        match self {
            KurveError::MalformedToken(_) => "malformed_token",
            KurveError::StateMismatch => "state_mismatch",
            KurveError::NonceMismatch => "nonce_mismatch",
            KurveError::InteractionRequired(_) => "interaction_required",
            KurveError::Network(_) | KurveError::HttpError(_) => "network_error",
            KurveError::Provider { .. } => "provider_error",
            KurveError::LoginAlreadyInProgress => "login_in_progress",
            KurveError::NotAuthenticated => "not_authenticated",
            KurveError::LoginCancelled => "login_cancelled",
            KurveError::StaleResponse => "stale_response",
            KurveError::UnexpectedNavigation => "unexpected_navigation",
            KurveError::InvalidUrl(_)
            | KurveError::MissingConfiguration(_)
            | KurveError::InvalidConfiguration(_) => "configuration_error",
        }
    }

    /// Whether the caller should fall back to an interactive login.
    pub fn is_interaction_required(&self) -> bool {
        matches!(self, KurveError::InteractionRequired(_))
    }

    /// A copy of this error for a second receiver. HTTP errors lose their
    /// source and become `Network`.
    pub(crate) fn duplicate(&self) -> KurveError {
        match self {
            KurveError::MalformedToken(m) => KurveError::MalformedToken(m.clone()),
            KurveError::StateMismatch => KurveError::StateMismatch,
            KurveError::NonceMismatch => KurveError::NonceMismatch,
            KurveError::InteractionRequired(m) => KurveError::InteractionRequired(m.clone()),
            KurveError::Network(m) => KurveError::Network(m.clone()),
            KurveError::HttpError(e) => KurveError::Network(e.to_string()),
            KurveError::Provider { status, error, description } => KurveError::Provider {
                status: *status,
                error: error.clone(),
                description: description.clone(),
            },
            KurveError::LoginAlreadyInProgress => KurveError::LoginAlreadyInProgress,
            KurveError::NotAuthenticated => KurveError::NotAuthenticated,
            KurveError::LoginCancelled => KurveError::LoginCancelled,
            KurveError::StaleResponse => KurveError::StaleResponse,
            KurveError::UnexpectedNavigation => KurveError::UnexpectedNavigation,
            KurveError::InvalidUrl(m) => KurveError::InvalidUrl(m.clone()),
            KurveError::MissingConfiguration(m) => KurveError::MissingConfiguration(m.clone()),
            KurveError::InvalidConfiguration(m) => KurveError::InvalidConfiguration(m.clone()),
        }
    }

    /// Maps an OAuth2 `error` code returned by the provider.
    pub(crate) fn from_provider(status: Option<u16>, error: String, description: Option<String>) -> Self {
        match error.as_str() {
            "interaction_required" | "login_required" | "consent_required" => {
                KurveError::InteractionRequired(description.unwrap_or(error))
            }
            // AADSTS50058/65001: silent sign-in failed, surfaced as invalid_grant on the token endpoint.
            "invalid_grant"
                if description
                    .as_deref()
                    .is_some_and(|d| d.contains("AADSTS50058") || d.contains("AADSTS65001")) =>
            {
                KurveError::InteractionRequired(description.unwrap_or(error))
            }
            _ => KurveError::Provider { status, error, description },
        }
    }
}
