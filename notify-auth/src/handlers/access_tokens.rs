use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::{
        access_tokens::{
            AccessTokenSecretResponse, CreateAccessTokenRequest, CreateAccessTokenResponse,
        },
        ErrorResponse,
    },
    middleware::AuthUser,
    models::AccessTokenInfo,
    utils::ValidatedJson,
    AppState,
};

/// List the caller's access tokens
#[utoipa::path(
    get,
    path = "/auth/access-tokens",
    responses(
        (status = 200, description = "Token metadata, never the secret", body = [AccessTokenInfo]),
        (status = 403, description = "Requires an unrestricted credential", body = ErrorResponse)
    ),
    tag = "Access Tokens",
    security(("bearer_auth" = []))
)]
pub async fn list_access_tokens(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
) -> Result<Json<Vec<AccessTokenInfo>>, AppError> {
    Ok(Json(state.access_tokens.list(ctx.user.id).await?))
}

/// Create an access token
///
/// The secret is returned once. Omit `scopes` for an unrestricted token.
#[utoipa::path(
    post,
    path = "/auth/access-tokens",
    request_body = CreateAccessTokenRequest,
    responses(
        (status = 201, description = "Token created", body = CreateAccessTokenResponse),
        (status = 403, description = "Requires an unrestricted credential", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Access Tokens",
    security(("bearer_auth" = []))
)]
pub async fn create_access_token(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ValidatedJson(req): ValidatedJson<CreateAccessTokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    let created = state.access_tokens.create(ctx.user.id, req.into()).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateAccessTokenResponse::from(created)),
    ))
}

/// Delete an access token
#[utoipa::path(
    delete,
    path = "/auth/access-tokens/{id}",
    params(("id" = Uuid, Path, description = "Access token id")),
    responses(
        (status = 204, description = "Deleted, or already gone"),
        (status = 403, description = "Requires an unrestricted credential", body = ErrorResponse)
    ),
    tag = "Access Tokens",
    security(("bearer_auth" = []))
)]
pub async fn delete_access_token(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(token_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.access_tokens.delete(ctx.user.id, token_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Fetch a stored token secret
#[utoipa::path(
    get,
    path = "/auth/access-tokens/{id}/secret",
    params(("id" = Uuid, Path, description = "Access token id")),
    responses(
        (status = 200, description = "Stored secret", body = AccessTokenSecretResponse),
        (status = 404, description = "Unknown token or secret not stored", body = ErrorResponse)
    ),
    tag = "Access Tokens",
    security(("bearer_auth" = []))
)]
pub async fn get_access_token_secret(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(token_id): Path<Uuid>,
) -> Result<Json<AccessTokenSecretResponse>, AppError> {
    let token = state.access_tokens.get_secret(ctx.user.id, token_id).await?;
    Ok(Json(AccessTokenSecretResponse { token }))
}
