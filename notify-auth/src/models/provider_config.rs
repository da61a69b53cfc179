//! OAuth provider configuration rows, edited outside this service.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::ProviderType;

#[derive(Debug, Clone, FromRow)]
pub struct OAuthProviderConfig {
    pub provider_id: String,
    pub provider_type: ProviderType,
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub callback_url: Option<String>,
    pub enabled: bool,
    pub authorization_url: Option<String>,
    pub token_url: Option<String>,
    pub user_info_url: Option<String>,
    /// Custom providers: JSON object mapping normalized fields to profile paths.
    pub profile_fields: Option<serde_json::Value>,
    pub apple_team_id: Option<String>,
    pub apple_key_id: Option<String>,
    pub apple_private_key_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OAuthProviderConfig {
    /// Registry key: provider ids are matched case-insensitively.
    pub fn key(&self) -> String {
        normalize_provider_key(&self.provider_id)
    }
}

/// Same folding as the `normalize_oauth_provider_id` trigger in Postgres.
pub fn normalize_provider_key(provider_id: &str) -> String {
    provider_id.trim().to_lowercase()
}
