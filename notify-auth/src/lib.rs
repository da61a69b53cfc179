pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod providers;
pub mod services;
pub mod utils;

use axum::{
    http::{header, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, RequestId},
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::AuthConfig;
use crate::middleware::{auth_middleware, require_unrestricted, ScopeAuthorizer};
use crate::providers::ProviderRegistry;
use crate::services::{
    AccessTokenManager, AccountService, CredentialStore, EmailProvider, IdentityLinker,
    SessionManager, TokenIssuer,
};
use crate::utils::SecretHasher;

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::auth::registration::register,
        handlers::auth::registration::confirm_email,
        handlers::auth::registration::request_email_confirmation,
        handlers::auth::session::login,
        handlers::auth::session::refresh,
        handlers::auth::session::logout,
        handlers::auth::session::me,
        handlers::auth::session::list_sessions,
        handlers::auth::session::revoke_session,
        handlers::auth::session::revoke_other_sessions,
        handlers::auth::exchange::exchange_code,
        handlers::auth::password::set_password,
        handlers::auth::password::request_password_reset,
        handlers::auth::password::confirm_password_reset,
        handlers::auth::social::oauth_start,
        handlers::auth::social::oauth_callback,
        handlers::access_tokens::list_access_tokens,
        handlers::access_tokens::create_access_token,
        handlers::access_tokens::delete_access_token,
        handlers::access_tokens::get_access_token_secret,
        handlers::identities::list_identities,
        handlers::identities::disconnect_identity,
        handlers::providers::list_providers,
        handlers::authz::authorize,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::MessageResponse,
            dtos::auth::RegisterRequest,
            dtos::auth::LoginRequest,
            dtos::auth::RefreshRequest,
            dtos::auth::ExchangeRequest,
            dtos::auth::AuthResponse,
            dtos::auth::MeResponse,
            dtos::auth::RevokedResponse,
            dtos::auth::SetPasswordRequest,
            dtos::auth::PasswordResetRequest,
            dtos::auth::PasswordResetConfirm,
            dtos::auth::ConfirmEmailRequest,
            dtos::auth::AuthorizeRequest,
            dtos::auth::AuthorizeResponse,
            dtos::access_tokens::CreateAccessTokenRequest,
            dtos::access_tokens::CreateAccessTokenResponse,
            dtos::access_tokens::AccessTokenSecretResponse,
            models::UserResponse,
            models::SessionInfo,
            models::AccessTokenInfo,
            models::IdentityResponse,
            models::ProviderType,
            providers::ProviderSummary,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Registration, login and token rotation"),
        (name = "Sessions", description = "Device sessions of the caller"),
        (name = "Access Tokens", description = "Long-lived opaque tokens with optional scopes"),
        (name = "Identities", description = "Linked OAuth identities"),
        (name = "OAuth", description = "Provider sign-in and account linking"),
        (name = "Authorization", description = "Capability checks for other services"),
        (name = "Observability", description = "Service health"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT or ntk_ access token")
                        .build(),
                ),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: AuthConfig,
    pub store: Arc<dyn CredentialStore>,
    pub issuer: Arc<TokenIssuer>,
    pub sessions: Arc<SessionManager>,
    pub accounts: Arc<AccountService>,
    pub access_tokens: Arc<AccessTokenManager>,
    pub identities: Arc<IdentityLinker>,
    pub providers: Arc<ProviderRegistry>,
    pub authorizer: Arc<ScopeAuthorizer>,
    pub login_rate_limiter: IpRateLimiter,
    pub register_rate_limiter: IpRateLimiter,
    pub password_reset_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wire the services over one store. The provider registry starts
    /// empty; the caller decides when to sync or start its watcher.
    pub fn new(
        config: AuthConfig,
        store: Arc<dyn CredentialStore>,
        email: Arc<dyn EmailProvider>,
        hasher: Arc<SecretHasher>,
        http: reqwest::Client,
    ) -> Self {
        let issuer = Arc::new(TokenIssuer::new(config.jwt.clone()));
        let sessions = Arc::new(SessionManager::new(store.clone(), issuer.clone()));
        let accounts = Arc::new(AccountService::new(
            store.clone(),
            sessions.clone(),
            hasher.clone(),
            email.clone(),
        ));
        let access_tokens = Arc::new(AccessTokenManager::new(store.clone(), hasher));
        let identities = Arc::new(IdentityLinker::new(store.clone(), email));
        let providers = Arc::new(ProviderRegistry::new(store.clone(), http));

        Self {
            login_rate_limiter: create_ip_rate_limiter(config.rate_limit.login),
            register_rate_limiter: create_ip_rate_limiter(config.rate_limit.register),
            password_reset_rate_limiter: create_ip_rate_limiter(config.rate_limit.password_reset),
            config,
            store,
            issuer,
            sessions,
            accounts,
            access_tokens,
            identities,
            providers,
            authorizer: Arc::new(ScopeAuthorizer::default()),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let login_route = Router::new()
        .route("/auth/login", post(handlers::login))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let register_route = Router::new()
        .route("/auth/register", post(handlers::register))
        .layer(from_fn_with_state(
            state.register_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let reset_request_route = Router::new()
        .route(
            "/auth/password-reset/request",
            post(handlers::request_password_reset),
        )
        .layer(from_fn_with_state(
            state.password_reset_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    // Account management needs the owner's full rights, not a scoped token.
    let account_routes = Router::new()
        .route("/auth/sessions", get(handlers::list_sessions))
        .route("/auth/sessions/:id", delete(handlers::revoke_session))
        .route(
            "/auth/sessions/revoke-others",
            post(handlers::revoke_other_sessions),
        )
        .route("/auth/password", post(handlers::set_password))
        .route(
            "/auth/email/confirm/request",
            post(handlers::request_email_confirmation),
        )
        .route("/auth/identities", get(handlers::list_identities))
        .route(
            "/auth/identities/:provider",
            delete(handlers::disconnect_identity),
        )
        .route(
            "/auth/access-tokens",
            get(handlers::list_access_tokens).post(handlers::create_access_token),
        )
        .route(
            "/auth/access-tokens/:id",
            delete(handlers::delete_access_token),
        )
        .route(
            "/auth/access-tokens/:id/secret",
            get(handlers::get_access_token_secret),
        )
        .layer(from_fn(require_unrestricted));

    let authenticated_routes = Router::new()
        .route("/auth/logout", post(handlers::logout))
        .route("/auth/me", get(handlers::me))
        .route("/auth/authorize", post(handlers::authorize))
        .merge(account_routes)
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    let allowed_origins: Vec<HeaderValue> = state
        .config
        .redirects
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(origin = %o, error = %e, "Invalid CORS origin ignored");
                None
            }
        })
        .collect();

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .route("/auth/refresh", post(handlers::refresh))
        .route("/auth/exchange", post(handlers::exchange_code))
        .route(
            "/auth/password-reset/confirm",
            post(handlers::confirm_password_reset),
        )
        .route("/auth/email/confirm", post(handlers::confirm_email))
        .route("/auth/providers", get(handlers::list_providers))
        .route("/auth/oauth/:provider", get(handlers::oauth_start))
        .route(
            "/auth/oauth/:provider/callback",
            get(handlers::oauth_callback).post(handlers::oauth_callback_form),
        )
        .merge(login_route)
        .merge(register_route)
        .merge(reset_request_route)
        .merge(authenticated_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .extensions()
                    .get::<RequestId>()
                    .map(|id| id.0.as_str())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    user_id = tracing::field::Empty,
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(allowed_origins)
                .allow_credentials(true)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Database unreachable")
    ),
    tag = "Observability"
)]
pub async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Store health check failed");
        AppError::ServiceUnavailable("Database unavailable".to_string())
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "environment": format!("{:?}", state.config.environment),
        "providers": state.providers.list().len(),
    })))
}
