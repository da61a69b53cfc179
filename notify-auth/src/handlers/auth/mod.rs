pub mod exchange;
pub mod password;
pub mod registration;
pub mod session;
pub mod social;

pub use exchange::exchange_code;
pub use password::{confirm_password_reset, request_password_reset, set_password};
pub use registration::{confirm_email, register, request_email_confirmation};
pub use session::{
    list_sessions, login, logout, me, refresh, revoke_other_sessions, revoke_session,
};
pub use social::{oauth_callback, oauth_callback_form, oauth_start};

use axum::http::{header, HeaderMap};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::Utc;
use std::net::SocketAddr;

use crate::config::CookieConfig;
use crate::middleware::auth::{ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE};
use crate::models::DeviceInfo;
use crate::services::TokenPair;

const REFRESH_COOKIE_PATH: &str = "/auth";

fn base_cookie(name: &'static str, value: String, cookies: &CookieConfig) -> Cookie<'static> {
    let mut cookie = Cookie::build((name, value))
        .http_only(true)
        .secure(cookies.secure)
        .same_site(cookies.same_site)
        .build();
    if let Some(domain) = &cookies.domain {
        cookie.set_domain(domain.clone());
    }
    cookie
}

/// Access and refresh cookies for the web flow.
pub(crate) fn with_session_cookies(
    jar: CookieJar,
    cookies: &CookieConfig,
    tokens: &TokenPair,
) -> CookieJar {
    let mut access = base_cookie(ACCESS_TOKEN_COOKIE, tokens.access_token.clone(), cookies);
    access.set_path("/");
    access.set_max_age(time::Duration::seconds(tokens.access_expires_in));

    let mut refresh = base_cookie(REFRESH_TOKEN_COOKIE, tokens.refresh_token.clone(), cookies);
    refresh.set_path(REFRESH_COOKIE_PATH);
    let remaining = (tokens.refresh_expires_at - Utc::now()).num_seconds().max(0);
    refresh.set_max_age(time::Duration::seconds(remaining));

    jar.add(access).add(refresh)
}

pub(crate) fn without_session_cookies(jar: CookieJar, cookies: &CookieConfig) -> CookieJar {
    let mut access = base_cookie(ACCESS_TOKEN_COOKIE, String::new(), cookies);
    access.set_path("/");
    let mut refresh = base_cookie(REFRESH_TOKEN_COOKIE, String::new(), cookies);
    refresh.set_path(REFRESH_COOKIE_PATH);
    jar.remove(access).remove(refresh)
}

/// Fill in request metadata the client cannot be trusted to report.
pub(crate) fn request_device(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    device: DeviceInfo,
    login_provider: &str,
) -> DeviceInfo {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    DeviceInfo {
        ip_address: forwarded.or_else(|| peer.map(|p| p.ip().to_string())),
        user_agent,
        login_provider: Some(login_provider.to_string()),
        ..device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use axum_extra::extract::cookie::SameSite;

    #[test]
    fn session_cookies_follow_config() {
        let cookies = CookieConfig {
            domain: Some("example.com".into()),
            same_site: SameSite::Strict,
            secure: true,
        };
        let tokens = TokenPair {
            access_token: "a".into(),
            refresh_token: "r".into(),
            token_id: "jti".into(),
            access_expires_in: 900,
            refresh_expires_at: Utc::now() + chrono::Duration::days(7),
        };

        let jar = with_session_cookies(CookieJar::new(), &cookies, &tokens);
        let access = jar.get(ACCESS_TOKEN_COOKIE).map(|c| c.clone().into_owned());
        let refresh = jar.get(REFRESH_TOKEN_COOKIE).map(|c| c.clone().into_owned());

        let access = access.expect("access cookie");
        assert!(access.http_only().unwrap_or(false));
        assert_eq!(access.secure(), Some(true));
        assert_eq!(access.same_site(), Some(SameSite::Strict));
        assert_eq!(access.domain(), Some("example.com"));
        assert_eq!(refresh.expect("refresh cookie").path(), Some(REFRESH_COOKIE_PATH));
    }

    #[test]
    fn forwarded_address_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8"));

        let device = request_device(
            &headers,
            Some(SocketAddr::from(([127, 0, 0, 1], 9000))),
            DeviceInfo::default(),
            "local",
        );
        assert_eq!(device.ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(device.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(device.login_provider.as_deref(), Some("local"));
    }
}
