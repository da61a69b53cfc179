use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;

use crate::{
    dtos::ErrorResponse,
    middleware::AuthUser,
    models::{IdentityResponse, ProviderType},
    services::ServiceError,
    AppState,
};

/// Linked sign-in identities
#[utoipa::path(
    get,
    path = "/auth/identities",
    responses(
        (status = 200, description = "Identities linked to the caller", body = [IdentityResponse]),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
        (status = 403, description = "Requires an unrestricted credential", body = ErrorResponse)
    ),
    tag = "Identities",
    security(("bearer_auth" = []))
)]
pub async fn list_identities(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
) -> Result<Json<Vec<IdentityResponse>>, AppError> {
    Ok(Json(state.identities.list_identities(ctx.user.id).await?))
}

/// Disconnect a provider identity
///
/// Refused for the last identity of an account without a password.
#[utoipa::path(
    delete,
    path = "/auth/identities/{provider}",
    params(("provider" = String, Path, description = "Provider type, e.g. github")),
    responses(
        (status = 204, description = "Identity removed"),
        (status = 403, description = "Would lock the account out, or scoped credential", body = ErrorResponse),
        (status = 404, description = "No identity for that provider", body = ErrorResponse)
    ),
    tag = "Identities",
    security(("bearer_auth" = []))
)]
pub async fn disconnect_identity(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(provider): Path<String>,
) -> Result<StatusCode, AppError> {
    let provider: ProviderType = provider
        .parse()
        .map_err(|_| ServiceError::NotFound("Identity not found".into()))?;
    state
        .identities
        .disconnect_identity(ctx.user.id, provider)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
