use axum::{extract::State, Json};
use service_core::error::AppError;

use crate::{
    dtos::{
        auth::{AuthorizeRequest, AuthorizeResponse},
        ErrorResponse,
    },
    middleware::{AuthUser, RequiredScope},
    utils::ValidatedJson,
    AppState,
};

/// Check a capability for the presented credential
///
/// Other services call this with the caller's credential forwarded. A
/// denial is a 403, so a 200 always carries `allowed: true`.
#[utoipa::path(
    post,
    path = "/auth/authorize",
    request_body = AuthorizeRequest,
    responses(
        (status = 200, description = "Allowed", body = AuthorizeResponse),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
        (status = 403, description = "Insufficient scopes", body = ErrorResponse)
    ),
    tag = "Authorization",
    security(("bearer_auth" = []))
)]
pub async fn authorize(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ValidatedJson(req): ValidatedJson<AuthorizeRequest>,
) -> Result<Json<AuthorizeResponse>, AppError> {
    let required = match req.resource_id.filter(|r| !r.is_empty()) {
        Some(resource) => RequiredScope::for_resource(req.capability, resource),
        None => RequiredScope::new(req.capability),
    };
    state.authorizer.authorize(&ctx, &required).await?;

    Ok(Json(AuthorizeResponse {
        allowed: true,
        user_id: ctx.user.id,
        scope: required.to_string(),
    }))
}
