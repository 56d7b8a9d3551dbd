// src/lib.rs

//! Identity token lifecycle for Azure AD v1/v2 and Azure AD B2C: interactive
//! login, callback validation, a per-resource token cache and silent renewal.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod request;
pub mod scheduler;
pub mod store;
pub mod transport;

/// The public prelude for the `kurve-identity` crate.
///
/// This module re-exports the most commonly used types for convenience.
pub mod prelude {
    pub use crate::cache::ResourceKey;
    pub use crate::codec::IdToken;
    pub use crate::config::{Config, ConfigBuilder, EndpointVersion, IdentitySettings};
    pub use crate::error::KurveError;
    pub use crate::identity::{CallbackRequest, Identity, LoginOptions, LoginState, NodeCallback, RenewalEvent};
    pub use crate::store::{MemoryStore, TokenStore};
    pub use crate::transport::{Navigator, RedirectTransport, SilentFrame};
}
