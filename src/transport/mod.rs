// src/transport/mod.rs

//! How authorization requests reach the identity provider and how its
//! answers come back.

pub mod browser;
pub mod node;

use crate::error::KurveError;
use crate::request::{AuthRequest, ProviderResponse};
use async_trait::async_trait;
use url::Url;

pub use browser::{BrowserRedirect, BrowserSilentIframe, Navigator, SilentFrame};
pub use node::NodeAuthorizationCodeExchange;

/// The result of handing a request to a transport.
#[derive(Debug)]
pub enum TransportOutcome {
    /// The user agent was sent to this URL. The answer arrives later through
    /// a callback handler.
    Navigated(Url),
    /// The provider answered in-band.
    Response(ProviderResponse),
}

/// Carries an [`AuthRequest`] across the network boundary.
#[async_trait]
pub trait RedirectTransport: Send + Sync {
    async fn initiate(&self, request: &AuthRequest) -> Result<TransportOutcome, KurveError>;

    /// Sends the user agent to the provider's logout endpoint. No-op where there is no user agent.
    fn sign_out(&self, _logout_url: &Url) {}
}
