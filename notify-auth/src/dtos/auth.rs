use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::{DeviceInfo, UserResponse};
use crate::services::SessionTokens;

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "user@example.com")]
    pub email: String,

    #[validate(length(min = 2, max = 64, message = "Username must be 2-64 characters"))]
    #[schema(example = "ada")]
    pub username: Option<String>,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    #[schema(example = "password123", min_length = 8)]
    pub password: String,

    pub first_name: Option<String>,
    pub last_name: Option<String>,

    #[serde(flatten)]
    pub device: DeviceInfo,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// Email address or username.
    #[serde(alias = "email", alias = "username")]
    #[validate(length(min = 1, message = "Email or username is required"))]
    #[schema(example = "user@example.com")]
    pub identifier: String,

    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "password123")]
    pub password: String,

    #[serde(flatten)]
    pub device: DeviceInfo,
}

/// Body is optional; the `refresh_token` cookie is used when absent.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRequest {
    #[validate(length(min = 1, message = "Code is required"))]
    pub code: String,
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[schema(example = "Bearer")]
    pub token_type: String,
    /// Access token lifetime in seconds.
    #[schema(example = 900)]
    pub expires_in: i64,
    pub refresh_expires_at: DateTime<Utc>,
    pub session_id: Uuid,
    pub user: UserResponse,
}

impl From<SessionTokens> for AuthResponse {
    fn from(s: SessionTokens) -> Self {
        Self {
            access_token: s.tokens.access_token,
            refresh_token: s.tokens.refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: s.tokens.access_expires_in,
            refresh_expires_at: s.tokens.refresh_expires_at,
            session_id: s.session_id,
            user: s.user.into(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub user: UserResponse,
    pub session_id: Option<Uuid>,
    pub access_token_id: Option<Uuid>,
    /// Empty when unrestricted.
    pub scopes: Vec<String>,
    pub unrestricted: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RevokedResponse {
    #[schema(example = 2)]
    pub revoked: u64,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetPasswordRequest {
    /// Required when the account already has a password.
    pub current_password: Option<String>,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    #[schema(example = "newpassword123", min_length = 8)]
    pub new_password: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct PasswordResetRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "user@example.com")]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PasswordResetConfirm {
    #[validate(length(min = 1, message = "Code is required"))]
    pub code: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    #[schema(example = "newpassword123", min_length = 8)]
    pub new_password: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ConfirmEmailRequest {
    #[validate(length(min = 1, message = "Code is required"))]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    #[validate(length(min = 1, message = "Capability is required"))]
    #[schema(example = "message-bucket-creation")]
    pub capability: String,

    #[schema(example = "bucket-123")]
    pub resource_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub allowed: bool,
    pub user_id: Uuid,
    #[schema(example = "message-bucket-creation:bucket-123")]
    pub scope: String,
}
