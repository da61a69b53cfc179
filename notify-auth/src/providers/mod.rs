//! OAuth identity providers: per-type profile normalization, the HTTP
//! adapter for one configured provider, and the live registry of adapters.

pub mod adapter;
pub mod profile;
pub mod registry;

pub use adapter::{OAuthAdapter, ProviderTokens};
pub use profile::{derive_username, normalize_profile, NormalizedProfile};
pub use registry::{ProviderChange, ProviderRegistry, ProviderSummary, RegistrationOutcome};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Missing credentials or key material. Never shown to callers.
    #[error("Provider misconfigured: {0}")]
    Misconfigured(String),

    #[error("Provider request failed: {0}")]
    Upstream(String),

    #[error("Provider returned an unusable profile: {0}")]
    InvalidProfile(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}
