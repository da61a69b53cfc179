use axum::{extract::State, Json};

use crate::{providers::ProviderSummary, AppState};

/// Registered OAuth providers
#[utoipa::path(
    get,
    path = "/auth/providers",
    responses(
        (status = 200, description = "Providers available for sign-in", body = [ProviderSummary])
    ),
    tag = "OAuth"
)]
pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderSummary>> {
    Json(state.providers.list())
}
