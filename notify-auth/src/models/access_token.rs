//! Access token model - long-lived opaque bearer credentials.
//!
//! Only an Argon2 hash of the secret is stored. The plaintext is persisted
//! as well when the owner opted in at creation time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Reserved scope; a user holds at most one token carrying it.
pub const WATCH_SCOPE: &str = "watch";

#[derive(Debug, Clone, FromRow)]
pub struct UserAccessToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub token_hash: String,
    pub token: Option<String>,
    /// Empty means unrestricted.
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserAccessToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn is_watch_token(&self) -> bool {
        self.scopes.iter().any(|s| s == WATCH_SCOPE)
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenInfo {
    pub id: Uuid,
    pub name: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub is_expired: bool,
    pub secret_stored: bool,
}

impl From<UserAccessToken> for AccessTokenInfo {
    fn from(t: UserAccessToken) -> Self {
        Self {
            is_expired: t.is_expired_at(Utc::now()),
            secret_stored: t.token.is_some(),
            id: t.id,
            name: t.name,
            scopes: t.scopes,
            expires_at: t.expires_at,
            last_used: t.last_used,
            created_at: t.created_at,
        }
    }
}
