use axum::{extract::State, Json};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;

use super::with_session_cookies;
use crate::{
    dtos::{
        auth::{AuthResponse, ExchangeRequest},
        ErrorResponse,
    },
    utils::ValidatedJson,
    AppState,
};

/// Trade a single-use exchange code from an OAuth redirect for tokens
#[utoipa::path(
    post,
    path = "/auth/exchange",
    request_body = ExchangeRequest,
    responses(
        (status = 200, description = "Token pair for the redirected session", body = AuthResponse),
        (status = 400, description = "Invalid or expired code", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn exchange_code(
    State(state): State<AppState>,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<ExchangeRequest>,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    let session = state.sessions.redeem(&req.code, req.session_id).await?;
    let jar = with_session_cookies(jar, &state.config.cookies, &session.tokens);
    Ok((jar, Json(AuthResponse::from(session))))
}
