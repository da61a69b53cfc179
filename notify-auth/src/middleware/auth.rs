use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

use super::scope_auth::Grant;
use crate::models::User;
use crate::services::{ServiceError, ACCESS_TOKEN_PREFIX, SYSTEM_TOKEN_PREFIX};
use crate::AppState;

pub const ACCESS_TOKEN_COOKIE: &str = "access_token";
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";
const ACCESS_TOKEN_QUERY: &str = "access_token";

/// A bearer credential, classified by prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
    Jwt(&'a str),
    AccessToken(&'a str),
    /// Belongs to the system-token verifier, not to this gateway.
    System(&'a str),
}

pub fn classify_credential(token: &str) -> Credential<'_> {
    if token.starts_with(SYSTEM_TOKEN_PREFIX) {
        Credential::System(token)
    } else if token.starts_with(ACCESS_TOKEN_PREFIX) {
        Credential::AccessToken(token)
    } else {
        Credential::Jwt(token)
    }
}

#[derive(Deserialize)]
struct CredentialQuery {
    access_token: Option<String>,
}

/// Bearer header, then `access_token` query parameter, then cookie.
pub fn extract_credential(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string);
    if from_header.is_some() {
        return from_header;
    }

    let from_query = query
        .and_then(|q| serde_urlencoded::from_str::<CredentialQuery>(q).ok())
        .and_then(|q| q.access_token)
        .filter(|token| !token.is_empty());
    if from_query.is_some() {
        return from_query;
    }

    CookieJar::from_headers(headers)
        .get(ACCESS_TOKEN_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|token| !token.is_empty())
}

#[derive(Debug, Clone)]
pub enum AuthMethod {
    Session {
        session_id: Uuid,
        /// Current refresh `jti` of the session.
        refresh_token_id: String,
    },
    AccessToken {
        token_id: Uuid,
    },
}

/// Resolved caller, attached to the request by [`auth_middleware`].
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
    pub method: AuthMethod,
    pub grant: Grant,
}

impl AuthContext {
    /// A JWT session acts with the account owner's full rights.
    pub fn for_session(user: User, session_id: Uuid, refresh_token_id: String) -> Self {
        Self {
            user,
            method: AuthMethod::Session {
                session_id,
                refresh_token_id,
            },
            grant: Grant::Unrestricted,
        }
    }

    pub fn for_access_token(user: User, token_id: Uuid, scopes: Vec<String>) -> Self {
        Self {
            user,
            method: AuthMethod::AccessToken { token_id },
            grant: Grant::from_scopes(scopes),
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match &self.method {
            AuthMethod::Session { session_id, .. } => Some(*session_id),
            AuthMethod::AccessToken { .. } => None,
        }
    }
}

/// A system token left untouched for the narrower verifier that owns it.
#[derive(Debug, Clone)]
pub struct SystemCredential(pub String);

/// Middleware to require authentication. Any failure is a 401.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_credential(req.headers(), req.uri().query())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing credentials")))?;

    let ctx = match classify_credential(&token) {
        Credential::System(_) => {
            tracing::debug!("System credential passed through");
            req.extensions_mut().insert(SystemCredential(token.clone()));
            return Ok(next.run(req).await);
        }
        Credential::AccessToken(secret) => {
            let validated = state
                .access_tokens
                .validate(secret)
                .await?
                .ok_or(ServiceError::Unauthenticated)?;
            AuthContext::for_access_token(validated.user, validated.token_id, validated.scopes)
        }
        Credential::Jwt(jwt) => {
            let auth = state.sessions.authenticate_access_token(jwt).await?;
            AuthContext::for_session(auth.user, auth.session.id, auth.session.token_id)
        }
    };

    tracing::Span::current().record("user_id", tracing::field::display(ctx.user.id));
    req.extensions_mut().insert(ctx);
    Ok(next.run(req).await)
}

/// Extractor for the authenticated caller.
pub struct AuthUser(pub AuthContext);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = parts.extensions.get::<AuthContext>().ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Authentication required"))
        })?;
        Ok(AuthUser(ctx.clone()))
    }
}
