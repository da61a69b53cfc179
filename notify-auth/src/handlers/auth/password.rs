use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use service_core::error::AppError;

use crate::{
    dtos::{
        auth::{PasswordResetConfirm, PasswordResetRequest, SetPasswordRequest},
        ErrorResponse, MessageResponse,
    },
    middleware::AuthUser,
    utils::{Password, ValidatedJson},
    AppState,
};

/// Set a password, or change it by presenting the current one
#[utoipa::path(
    post,
    path = "/auth/password",
    request_body = SetPasswordRequest,
    responses(
        (status = 200, description = "Password updated", body = MessageResponse),
        (status = 403, description = "Current password is incorrect, or scoped credential", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn set_password(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ValidatedJson(req): ValidatedJson<SetPasswordRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let current = req.current_password.map(Password::new);
    state
        .accounts
        .set_password(ctx.user.id, current.as_ref(), &Password::new(req.new_password))
        .await?;
    Ok(Json(MessageResponse::new("Password updated")))
}

/// Request a password reset email
#[utoipa::path(
    post,
    path = "/auth/password-reset/request",
    request_body = PasswordResetRequest,
    responses(
        (status = 202, description = "Reset email sent if the account exists", body = MessageResponse),
        (status = 429, description = "Requested too recently", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn request_password_reset(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<PasswordResetRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .accounts
        .request_password_reset(&req.email, &state.config.redirects.frontend_url)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new(
            "If the email exists, a password reset link has been sent",
        )),
    ))
}

/// Set a new password with a reset code; ends every session
#[utoipa::path(
    post,
    path = "/auth/password-reset/confirm",
    request_body = PasswordResetConfirm,
    responses(
        (status = 200, description = "Password reset", body = MessageResponse),
        (status = 400, description = "Invalid or expired code", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn confirm_password_reset(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<PasswordResetConfirm>,
) -> Result<Json<MessageResponse>, AppError> {
    state
        .accounts
        .reset_password(&req.code, &Password::new(req.new_password))
        .await?;
    Ok(Json(MessageResponse::new("Password has been reset")))
}
