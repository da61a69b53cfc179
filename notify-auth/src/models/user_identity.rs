//! User identity model - links between users and external OAuth accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// OAuth provider families understood by the registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, sqlx::Type,
)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Github,
    Google,
    Discord,
    Apple,
    Custom,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Github => "github",
            ProviderType::Google => "google",
            ProviderType::Discord => "discord",
            ProviderType::Apple => "apple",
            ProviderType::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(ProviderType::Github),
            "google" => Ok(ProviderType::Google),
            "discord" => Ok(ProviderType::Discord),
            "apple" => Ok(ProviderType::Apple),
            "custom" => Ok(ProviderType::Custom),
            _ => Err(format!("Invalid provider type: {}", s)),
        }
    }
}

/// User identity entity. One per (user, provider type).
#[derive(Debug, Clone, FromRow)]
pub struct UserIdentity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_type: ProviderType,
    pub provider_user_id: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    /// Serialized provider profile as last seen.
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserIdentity {
    pub fn new(
        user_id: Uuid,
        provider_type: ProviderType,
        provider_user_id: String,
        email: Option<String>,
        avatar_url: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            provider_type,
            provider_user_id,
            email,
            avatar_url,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh cached email/avatar; returns whether anything changed.
    pub fn refresh_cache(&mut self, email: Option<&str>, avatar_url: Option<&str>) -> bool {
        let mut changed = false;
        if let Some(email) = email {
            if self.email.as_deref() != Some(email) {
                self.email = Some(email.to_string());
                changed = true;
            }
        }
        if let Some(avatar) = avatar_url {
            if self.avatar_url.as_deref() != Some(avatar) {
                self.avatar_url = Some(avatar.to_string());
                changed = true;
            }
        }
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IdentityResponse {
    pub id: Uuid,
    pub provider_type: ProviderType,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<UserIdentity> for IdentityResponse {
    fn from(i: UserIdentity) -> Self {
        Self {
            id: i.id,
            provider_type: i.provider_type,
            email: i.email,
            avatar_url: i.avatar_url,
            created_at: i.created_at,
        }
    }
}
