use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::models::AccessTokenInfo;
use crate::services::{CreatedAccessToken, NewAccessToken};

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccessTokenRequest {
    #[validate(length(min = 1, max = 128, message = "Name must be 1-128 characters"))]
    #[schema(example = "CI pipeline")]
    pub name: String,

    /// Empty or omitted means unrestricted.
    #[serde(default)]
    #[schema(example = json!(["message-bucket-creation:bucket-123"]))]
    pub scopes: Vec<String>,

    pub expires_at: Option<DateTime<Utc>>,

    /// Keep the plaintext so it can be fetched again later.
    #[serde(default)]
    pub store_secret: bool,
}

impl From<CreateAccessTokenRequest> for NewAccessToken {
    fn from(r: CreateAccessTokenRequest) -> Self {
        Self {
            name: r.name,
            scopes: r.scopes,
            expires_at: r.expires_at,
            store_secret: r.store_secret,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccessTokenResponse {
    /// Shown once.
    #[schema(example = "ntk_3f9a...")]
    pub token: String,
    #[serde(flatten)]
    pub info: AccessTokenInfo,
}

impl From<CreatedAccessToken> for CreateAccessTokenResponse {
    fn from(c: CreatedAccessToken) -> Self {
        Self {
            token: c.token,
            info: c.info,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AccessTokenSecretResponse {
    pub token: String,
}
