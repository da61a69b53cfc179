use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;
use std::net::SocketAddr;

use super::{request_device, with_session_cookies};
use crate::{
    dtos::{
        auth::{AuthResponse, ConfirmEmailRequest, RegisterRequest},
        ErrorResponse, MessageResponse,
    },
    middleware::AuthUser,
    models::UserResponse,
    services::Registration,
    utils::{Password, ValidatedJson},
    AppState,
};

/// Register a password account and start a session
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered and logged in", body = AuthResponse),
        (status = 409, description = "Email or username already taken", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn register(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let device = request_device(&headers, peer.map(|c| c.0), req.device, "local");
    let registration = Registration {
        email: req.email,
        username: req.username,
        password: Password::new(req.password),
        first_name: req.first_name,
        last_name: req.last_name,
    };

    let session = state
        .accounts
        .register(registration, &device, &state.config.redirects.frontend_url)
        .await?;

    let jar = with_session_cookies(jar, &state.config.cookies, &session.tokens);
    Ok((StatusCode::CREATED, jar, Json(AuthResponse::from(session))))
}

/// Confirm an email address with the emailed code
#[utoipa::path(
    post,
    path = "/auth/email/confirm",
    request_body = ConfirmEmailRequest,
    responses(
        (status = 200, description = "Email confirmed", body = UserResponse),
        (status = 400, description = "Invalid or expired code", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn confirm_email(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ConfirmEmailRequest>,
) -> Result<Json<UserResponse>, AppError> {
    let user = state.accounts.confirm_email(&req.code).await?;
    Ok(Json(user.into()))
}

/// Send a new confirmation email to the caller
#[utoipa::path(
    post,
    path = "/auth/email/confirm/request",
    responses(
        (status = 202, description = "Confirmation email sent", body = MessageResponse),
        (status = 403, description = "Requires an unrestricted credential", body = ErrorResponse),
        (status = 409, description = "Email already confirmed", body = ErrorResponse),
        (status = 429, description = "Requested too recently", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn request_email_confirmation(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    state
        .accounts
        .request_email_confirmation(ctx.user.id, &state.config.redirects.frontend_url)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("Confirmation email sent")),
    ))
}
