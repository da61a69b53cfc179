//! Services layer for notify-auth.
//!
//! Token issuing with runtime JWT settings, sessions, access tokens,
//! identity linking and local account flows, all over the
//! `CredentialStore` seam.

pub mod access_token;
pub mod account;
pub mod email;
pub mod error;
pub mod identity;
pub mod jwt;
pub mod session;
pub mod settings;
pub mod store;
mod sweep;

pub use access_token::{
    AccessTokenManager, CreatedAccessToken, NewAccessToken, ValidatedAccessToken,
    ACCESS_TOKEN_PREFIX, SYSTEM_TOKEN_PREFIX,
};
pub use account::{AccountService, Registration};
pub use email::{EmailProvider, MockEmailService, NotificationClient};
pub use error::{ServiceError, ServiceResult};
pub use identity::IdentityLinker;
pub use jwt::{AccessTokenClaims, RefreshTokenClaims, TokenError, TokenIssuer, TokenPair};
pub use session::{AuthenticatedSession, SessionManager, SessionTokens};
pub use settings::{spawn_jwt_settings_reload, JwtSettingsReloader};
pub use store::{
    CredentialStore, IdentityRemoval, InMemoryCredentialStore, PgCredentialStore, StoreError,
};
pub use sweep::spawn_session_sweep;
