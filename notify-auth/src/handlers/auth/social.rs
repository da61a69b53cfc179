//! OAuth login and account linking through the provider registry.
//!
//! The flow state travels through the provider as base64url JSON and is
//! bound to the browser by a nonce cookie. Completion never puts tokens in
//! the redirect: a login gets a single-use exchange code in the fragment,
//! a connect flow gets `connected=true`.

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, Uri},
    response::Redirect,
    Form,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use subtle::ConstantTimeEq;

use super::request_device;
use crate::{
    config::{CookieConfig, RedirectConfig},
    dtos::oauth::{OAuthCallbackParams, OAuthStartQuery, OAuthState},
    middleware::auth::extract_credential,
    models::DeviceInfo,
    services::ServiceError,
    utils::generate_code,
    AppState,
};

const NONCE_COOKIE: &str = "oauth_nonce";
const PKCE_COOKIE: &str = "oauth_pkce";
const FLOW_COOKIE_PATH: &str = "/auth/oauth";
const FLOW_COOKIE_MINUTES: i64 = 10;

pub fn encode_state(state: &OAuthState) -> Result<String, AppError> {
    let json = serde_json::to_vec(state).map_err(|e| {
        AppError::InternalError(anyhow::anyhow!("Failed to serialize OAuth state: {}", e))
    })?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode_state(raw: &str) -> Option<OAuthState> {
    let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// The requested target when it is the app scheme or under an allowed
/// origin; otherwise the frontend.
pub fn resolve_redirect(redirects: &RedirectConfig, requested: Option<&str>) -> String {
    let Some(requested) = requested.map(str::trim).filter(|r| !r.is_empty()) else {
        return redirects.frontend_url.clone();
    };

    let scheme = redirects.mobile_app_scheme.trim();
    let is_app = !scheme.is_empty() && requested.starts_with(&format!("{}://", scheme));
    let is_allowed_origin = redirects.allowed_origins.iter().any(|origin| {
        let origin = origin.trim_end_matches('/');
        requested == origin
            || ['/', '?', '#']
                .iter()
                .any(|sep| requested.starts_with(&format!("{}{}", origin, sep)))
    });

    if is_app || is_allowed_origin {
        requested.to_string()
    } else {
        tracing::warn!("OAuth redirect target not allowed; using frontend URL");
        redirects.frontend_url.clone()
    }
}

fn with_fragment(target: &str, params: &[(&str, String)]) -> String {
    let base = target.split('#').next().unwrap_or(target);
    let fragment = serde_urlencoded::to_string(params).unwrap_or_default();
    format!("{}#{}", base, fragment)
}

/// Apple answers with a cross-site form POST, so flow cookies must be
/// `SameSite=None` whenever they can be `Secure`.
fn flow_cookie(name: &'static str, value: String, cookies: &CookieConfig) -> Cookie<'static> {
    let same_site = if cookies.secure {
        SameSite::None
    } else {
        SameSite::Lax
    };
    let mut cookie = Cookie::build((name, value))
        .path(FLOW_COOKIE_PATH)
        .http_only(true)
        .secure(cookies.secure)
        .same_site(same_site)
        .max_age(time::Duration::minutes(FLOW_COOKIE_MINUTES))
        .build();
    if let Some(domain) = &cookies.domain {
        cookie.set_domain(domain.clone());
    }
    cookie
}

fn clear_flow_cookies(jar: CookieJar, cookies: &CookieConfig) -> CookieJar {
    jar.remove(flow_cookie(NONCE_COOKIE, String::new(), cookies))
        .remove(flow_cookie(PKCE_COOKIE, String::new(), cookies))
}

/// Start an OAuth flow
#[utoipa::path(
    get,
    path = "/auth/oauth/{provider}",
    params(
        ("provider" = String, Path, description = "Provider id"),
        OAuthStartQuery
    ),
    responses(
        (status = 303, description = "Redirect to the provider"),
        (status = 401, description = "Connect flow without a valid session"),
        (status = 404, description = "Provider not registered")
    ),
    tag = "OAuth"
)]
#[tracing::instrument(skip_all, fields(provider = %provider))]
pub async fn oauth_start(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<OAuthStartQuery>,
    headers: HeaderMap,
    uri: Uri,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect), AppError> {
    let adapter = state
        .providers
        .get(&provider)
        .ok_or_else(|| ServiceError::NotFound("Provider not found".into()))?;

    let (connect_to_user_id, access_token) = if query.connect {
        let token = extract_credential(&headers, uri.query()).ok_or(ServiceError::Unauthenticated)?;
        let auth = state.sessions.authenticate_access_token(&token).await?;
        (Some(auth.user.id), Some(token))
    } else {
        (None, None)
    };

    let nonce = generate_code(16);
    let flow = OAuthState {
        redirect: resolve_redirect(&state.config.redirects, query.redirect.as_deref()),
        locale: query.locale,
        connect_to_user_id,
        access_token,
        nonce: nonce.clone(),
    };
    let encoded = encode_state(&flow)?;

    let verifier = adapter.supports_pkce().then(|| generate_code(32));
    let challenge = verifier
        .as_deref()
        .map(|v| URL_SAFE_NO_PAD.encode(Sha256::digest(v.as_bytes())));
    let url = adapter.authorization_url(&encoded, challenge.as_deref());

    let cookies = &state.config.cookies;
    let mut jar = jar.add(flow_cookie(NONCE_COOKIE, nonce, cookies));
    if let Some(verifier) = verifier {
        jar = jar.add(flow_cookie(PKCE_COOKIE, verifier, cookies));
    }

    tracing::info!(connect = query.connect, "OAuth flow started");
    Ok((jar, Redirect::to(&url)))
}

/// Provider callback (query string)
#[utoipa::path(
    get,
    path = "/auth/oauth/{provider}/callback",
    params(("provider" = String, Path, description = "Provider id")),
    responses(
        (status = 303, description = "Redirect to the app with an exchange code or an error"),
        (status = 400, description = "Missing or forged state")
    ),
    tag = "OAuth"
)]
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(params): Query<OAuthCallbackParams>,
) -> Result<(CookieJar, Redirect), AppError> {
    complete_callback(&state, &provider, peer.map(|c| c.0), &headers, jar, params).await
}

/// Provider callback (form_post)
pub async fn oauth_callback_form(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    jar: CookieJar,
    Form(params): Form<OAuthCallbackParams>,
) -> Result<(CookieJar, Redirect), AppError> {
    complete_callback(&state, &provider, peer.map(|c| c.0), &headers, jar, params).await
}

#[tracing::instrument(skip_all, fields(provider = %provider))]
async fn complete_callback(
    state: &AppState,
    provider: &str,
    peer: Option<SocketAddr>,
    headers: &HeaderMap,
    jar: CookieJar,
    params: OAuthCallbackParams,
) -> Result<(CookieJar, Redirect), AppError> {
    let nonce_cookie = jar.get(NONCE_COOKIE).map(|c| c.value().to_string());
    let verifier = jar.get(PKCE_COOKIE).map(|c| c.value().to_string());
    let jar = clear_flow_cookies(jar, &state.config.cookies);

    let flow = params.state.as_deref().and_then(decode_state);
    let target = resolve_redirect(
        &state.config.redirects,
        flow.as_ref().map(|f| f.redirect.as_str()),
    );

    if let Some(error) = params.error {
        tracing::warn!(error = %error, "Provider returned an error");
        return Ok((jar, Redirect::to(&with_fragment(&target, &[("error", error)]))));
    }

    let flow = flow.ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Invalid OAuth state")))?;
    let nonce_matches = nonce_cookie
        .as_deref()
        .is_some_and(|cookie| bool::from(cookie.as_bytes().ct_eq(flow.nonce.as_bytes())));
    if !nonce_matches {
        tracing::warn!("OAuth state nonce mismatch");
        return Err(AppError::BadRequest(anyhow::anyhow!("Invalid OAuth state")));
    }
    let code = params
        .code
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Missing authorization code")))?;

    let fragment = match finish_flow(
        state,
        provider,
        &flow,
        &code,
        verifier.as_deref(),
        params.user.as_deref(),
        headers,
        peer,
    )
    .await
    {
        Ok(params) => params,
        Err(e) => vec![("error", callback_error_code(e).to_string())],
    };

    Ok((jar, Redirect::to(&with_fragment(&target, &fragment))))
}

#[allow(clippy::too_many_arguments)]
async fn finish_flow(
    state: &AppState,
    provider: &str,
    flow: &OAuthState,
    code: &str,
    verifier: Option<&str>,
    apple_user: Option<&str>,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Result<Vec<(&'static str, String)>, ServiceError> {
    let adapter = state
        .providers
        .get(provider)
        .ok_or_else(|| ServiceError::NotFound("Provider not found".into()))?;
    let key = adapter.key();

    let tokens = adapter.exchange_code(code, verifier).await?;
    let profile = adapter.fetch_profile(&tokens, apple_user).await?;

    if let Some(user_id) = flow.connect_to_user_id {
        // The connect request must still come from a live session.
        let token = flow
            .access_token
            .as_deref()
            .ok_or(ServiceError::Unauthenticated)?;
        let auth = state.sessions.authenticate_access_token(token).await?;
        if auth.user.id != user_id {
            return Err(ServiceError::Unauthenticated);
        }

        state
            .identities
            .find_or_create_user_from_provider(adapter.provider_type(), &profile, Some(user_id))
            .await?;
        return Ok(vec![("connected", "true".to_string()), ("provider", key)]);
    }

    let user = state
        .identities
        .find_or_create_user_from_provider(adapter.provider_type(), &profile, None)
        .await?;
    let device = request_device(headers, peer, DeviceInfo::default(), &key);
    let session = state.sessions.start_session(&user, &device).await?;
    let exchange = state.sessions.issue_exchange_code(session.session_id).await?;

    tracing::info!(user_id = %user.id, session_id = %session.session_id, "OAuth login completed");
    let mut fragment = vec![
        ("code", exchange),
        ("sessionId", session.session_id.to_string()),
    ];
    if let Some(locale) = &flow.locale {
        fragment.push(("locale", locale.clone()));
    }
    Ok(fragment)
}

fn callback_error_code(err: ServiceError) -> &'static str {
    match err {
        ServiceError::Conflict(_) => "identity_conflict",
        ServiceError::Unauthenticated => "authentication_failed",
        ServiceError::NotFound(_) => "unknown_provider",
        ServiceError::MisconfiguredProvider(detail) => {
            tracing::error!(detail = %detail, "OAuth provider misconfigured");
            "provider_unavailable"
        }
        other => {
            tracing::error!(error = %other, "OAuth callback failed");
            "server_error"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;

    fn redirects() -> RedirectConfig {
        RedirectConfig {
            mobile_app_scheme: "notify".into(),
            frontend_url: "https://app.example.com".into(),
            allowed_origins: vec!["https://app.example.com".into(), "https://admin.example.com/".into()],
        }
    }

    #[test]
    fn redirect_targets_are_checked() {
        let r = redirects();
        assert_eq!(
            resolve_redirect(&r, Some("notify://auth/done")),
            "notify://auth/done"
        );
        assert_eq!(
            resolve_redirect(&r, Some("https://admin.example.com/settings")),
            "https://admin.example.com/settings"
        );
        assert_eq!(
            resolve_redirect(&r, Some("https://app.example.com.evil.io/")),
            "https://app.example.com"
        );
        assert_eq!(resolve_redirect(&r, Some("javascript:alert(1)")), "https://app.example.com");
        assert_eq!(resolve_redirect(&r, None), "https://app.example.com");
    }

    #[test]
    fn state_survives_encoding() -> Result<(), AppError> {
        let state = OAuthState {
            redirect: "notify://done".into(),
            locale: Some("de".into()),
            connect_to_user_id: Some(uuid::Uuid::new_v4()),
            access_token: Some("eyJ...".into()),
            nonce: "abc".into(),
        };
        let encoded = encode_state(&state)?;
        assert!(!encoded.contains('='));
        assert_eq!(decode_state(&encoded), Some(state));
        assert_eq!(decode_state("not base64!"), None);
        Ok(())
    }

    #[test]
    fn fragment_replaces_existing_one() {
        let url = with_fragment(
            "notify://done#old",
            &[("code", "c0de".to_string()), ("sessionId", "s1".to_string())],
        );
        assert_eq!(url, "notify://done#code=c0de&sessionId=s1");
    }

    #[test]
    fn flow_cookies_allow_cross_site_post_when_secure() {
        let config = AuthConfig::default();
        let cookie = flow_cookie(NONCE_COOKIE, "n".into(), &config.cookies);
        assert_eq!(cookie.same_site(), Some(SameSite::None));

        let insecure = CookieConfig {
            secure: false,
            ..config.cookies
        };
        let cookie = flow_cookie(NONCE_COOKIE, "n".into(), &insecure);
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
    }
}
