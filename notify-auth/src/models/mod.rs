pub mod access_token;
pub mod provider_config;
pub mod user;
pub mod user_identity;
pub mod user_session;

pub use access_token::{AccessTokenInfo, UserAccessToken, WATCH_SCOPE};
pub use provider_config::OAuthProviderConfig;
pub use user::{User, UserResponse};
pub use user_identity::{IdentityResponse, ProviderType, UserIdentity};
pub use user_session::{DeviceInfo, SessionInfo, SessionState, UserSession};
