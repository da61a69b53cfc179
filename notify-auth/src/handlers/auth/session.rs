use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;
use std::net::SocketAddr;
use uuid::Uuid;

use super::{request_device, with_session_cookies, without_session_cookies};
use crate::{
    dtos::{
        auth::{AuthResponse, LoginRequest, MeResponse, RefreshRequest, RevokedResponse},
        ErrorResponse, MessageResponse,
    },
    middleware::{auth::AuthMethod, auth::REFRESH_TOKEN_COOKIE, AuthUser},
    models::SessionInfo,
    services::ServiceError,
    utils::{Password, ValidatedJson},
    AppState,
};

/// Login with email or username and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    let device = request_device(&headers, peer.map(|c| c.0), req.device, "local");
    let session = state
        .accounts
        .login(&req.identifier, &Password::new(req.password), &device)
        .await?;

    let jar = with_session_cookies(jar, &state.config.cookies, &session.tokens);
    Ok((jar, Json(AuthResponse::from(session))))
}

/// Rotate the refresh token of a session
///
/// The refresh token comes from the body or, failing that, the
/// `refresh_token` cookie.
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Token refreshed", body = AuthResponse),
        (status = 401, description = "Invalid, rotated or revoked refresh token", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Option<Json<RefreshRequest>>,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    let token = body
        .and_then(|Json(req)| req.refresh_token)
        .or_else(|| jar.get(REFRESH_TOKEN_COOKIE).map(|c| c.value().to_string()))
        .filter(|t| !t.is_empty())
        .ok_or(ServiceError::Unauthenticated)?;

    let session = state.sessions.refresh(&token).await?;
    let jar = with_session_cookies(jar, &state.config.cookies, &session.tokens);
    Ok((jar, Json(AuthResponse::from(session))))
}

/// End the current session and clear cookies
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 401, description = "Not authenticated", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    jar: CookieJar,
) -> Result<(CookieJar, Json<MessageResponse>), AppError> {
    if let Some(session_id) = ctx.session_id() {
        state.sessions.revoke(ctx.user.id, session_id).await?;
    }
    // An access-token caller may still hold a browser session.
    if let Some(cookie) = jar.get(REFRESH_TOKEN_COOKIE) {
        state.sessions.revoke_refresh_token(cookie.value()).await?;
    }

    let jar = without_session_cookies(jar, &state.config.cookies);
    Ok((jar, Json(MessageResponse::new("Logged out successfully"))))
}

/// Current user and credential
#[utoipa::path(
    get,
    path = "/auth/me",
    responses(
        (status = 200, description = "Authenticated caller", body = MeResponse),
        (status = 401, description = "Not authenticated", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn me(AuthUser(ctx): AuthUser) -> Json<MeResponse> {
    let access_token_id = match &ctx.method {
        AuthMethod::AccessToken { token_id } => Some(*token_id),
        AuthMethod::Session { .. } => None,
    };
    Json(MeResponse {
        session_id: ctx.session_id(),
        access_token_id,
        scopes: ctx.grant.scopes().to_vec(),
        unrestricted: ctx.grant.is_unrestricted(),
        user: ctx.user.into(),
    })
}

/// Active sessions of the caller
#[utoipa::path(
    get,
    path = "/auth/sessions",
    responses(
        (status = 200, description = "Active sessions", body = [SessionInfo]),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
        (status = 403, description = "Requires an unrestricted credential", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(("bearer_auth" = []))
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
) -> Result<Json<Vec<SessionInfo>>, AppError> {
    let sessions = state.sessions.list(ctx.user.id, ctx.session_id()).await?;
    Ok(Json(sessions))
}

/// Revoke one of the caller's sessions
#[utoipa::path(
    delete,
    path = "/auth/sessions/{id}",
    params(("id" = Uuid, Path, description = "Session id")),
    responses(
        (status = 204, description = "Session revoked"),
        (status = 403, description = "Requires an unrestricted credential", body = ErrorResponse),
        (status = 404, description = "No such active session", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(("bearer_auth" = []))
)]
pub async fn revoke_session(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    if !state.sessions.revoke(ctx.user.id, session_id).await? {
        return Err(ServiceError::NotFound("Session not found".into()).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Log out every other device
#[utoipa::path(
    post,
    path = "/auth/sessions/revoke-others",
    responses(
        (status = 200, description = "Other sessions revoked", body = RevokedResponse),
        (status = 403, description = "Requires an unrestricted session credential", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(("bearer_auth" = []))
)]
pub async fn revoke_other_sessions(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
) -> Result<Json<RevokedResponse>, AppError> {
    let AuthMethod::Session {
        refresh_token_id, ..
    } = &ctx.method
    else {
        return Err(ServiceError::Forbidden("A session credential is required".into()).into());
    };
    let revoked = state
        .sessions
        .revoke_all_except(ctx.user.id, refresh_token_id)
        .await?;
    Ok(Json(RevokedResponse { revoked }))
}
