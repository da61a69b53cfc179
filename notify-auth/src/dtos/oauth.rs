use serde::{Deserialize, Serialize};
use utoipa::IntoParams;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OAuthStartQuery {
    /// Where to send the browser or app when the flow completes.
    pub redirect: Option<String>,
    pub locale: Option<String>,
    /// Link the provider account to the authenticated caller.
    #[serde(default)]
    pub connect: bool,
}

/// Provider callback, as query string (GET) or form body (Apple form_post).
#[derive(Debug, Default, Deserialize)]
pub struct OAuthCallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    /// Apple sends the user's name here on first authorization only.
    pub user: Option<String>,
}

/// Round-tripped through the provider as base64url JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OAuthState {
    pub redirect: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_to_user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Also kept in a cookie; both must match on the callback.
    pub nonce: String,
}
