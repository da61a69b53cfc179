//! Capability checks for opaque access tokens.
//!
//! A grant is either unrestricted or an allow-list of scope strings. An
//! access token stored with no scopes is unrestricted, and so is any JWT
//! session. [`Grant::from_scopes`] is the only place that rule lives.

use async_trait::async_trait;
use axum::{extract::Request, middleware::Next, response::Response};
use service_core::error::AppError;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::auth::AuthContext;
use crate::services::{ServiceError, ServiceResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    Unrestricted,
    Restricted(Vec<String>),
}

impl Grant {
    pub fn from_scopes(scopes: Vec<String>) -> Self {
        if scopes.is_empty() {
            Grant::Unrestricted
        } else {
            Grant::Restricted(scopes)
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Grant::Unrestricted)
    }

    /// Exact string match against `capability` or `capability:resource`.
    pub fn allows(&self, required: &RequiredScope) -> bool {
        match self {
            Grant::Unrestricted => true,
            Grant::Restricted(scopes) => {
                let wanted = required.to_string();
                scopes.iter().any(|granted| *granted == wanted)
            }
        }
    }

    pub fn scopes(&self) -> &[String] {
        match self {
            Grant::Unrestricted => &[],
            Grant::Restricted(scopes) => scopes,
        }
    }
}

/// A capability, optionally bound to one resource id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredScope {
    pub capability: String,
    pub resource_id: Option<String>,
}

impl RequiredScope {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            resource_id: None,
        }
    }

    pub fn for_resource(capability: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            resource_id: Some(resource_id.into()),
        }
    }
}

impl fmt::Display for RequiredScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource_id {
            Some(resource) => write!(f, "{}:{}", self.capability, resource),
            None => f.write_str(&self.capability),
        }
    }
}

/// Does `user_id` own the resource named by a resource-scoped capability?
#[async_trait]
pub trait ResourceOwnership: Send + Sync {
    async fn owns(&self, user_id: Uuid, capability: &str, resource_id: &str)
        -> ServiceResult<bool>;
}

/// Leaves the ownership decision to the service that owns the resource.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeferToOwningService;

#[async_trait]
impl ResourceOwnership for DeferToOwningService {
    async fn owns(&self, _user_id: Uuid, _capability: &str, _resource_id: &str) -> ServiceResult<bool> {
        Ok(true)
    }
}

pub struct ScopeAuthorizer {
    ownership: Arc<dyn ResourceOwnership>,
}

impl Default for ScopeAuthorizer {
    fn default() -> Self {
        Self::new(Arc::new(DeferToOwningService))
    }
}

impl ScopeAuthorizer {
    pub fn new(ownership: Arc<dyn ResourceOwnership>) -> Self {
        Self { ownership }
    }

    pub async fn authorize(&self, ctx: &AuthContext, required: &RequiredScope) -> ServiceResult<()> {
        if !ctx.grant.allows(required) {
            tracing::warn!(
                user_id = %ctx.user.id,
                required_scope = %required,
                granted_scopes = ?ctx.grant.scopes(),
                "Insufficient scopes"
            );
            return Err(ServiceError::Forbidden(format!(
                "Insufficient scopes. Required: {}",
                required
            )));
        }

        if let Some(resource) = &required.resource_id {
            if !self
                .ownership
                .owns(ctx.user.id, &required.capability, resource)
                .await?
            {
                tracing::warn!(
                    user_id = %ctx.user.id,
                    required_scope = %required,
                    "Resource not owned by caller"
                );
                return Err(ServiceError::Forbidden("Access to resource denied".into()));
            }
        }
        Ok(())
    }
}

/// Route guard for management endpoints that a scoped token must not reach.
pub async fn require_unrestricted(req: Request, next: Next) -> Result<Response, AppError> {
    let ctx = req.extensions().get::<AuthContext>().ok_or_else(|| {
        AppError::Unauthorized(anyhow::anyhow!("Authentication required"))
    })?;
    if !ctx.grant.is_unrestricted() {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "This action requires an unrestricted credential"
        )));
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    fn ctx(scopes: &[&str]) -> AuthContext {
        AuthContext::for_access_token(
            User::new("a@example.com".into(), "a".into()),
            Uuid::new_v4(),
            scopes.iter().map(|s| s.to_string()).collect(),
        )
    }

    struct DenyAll;

    #[async_trait]
    impl ResourceOwnership for DenyAll {
        async fn owns(&self, _: Uuid, _: &str, _: &str) -> ServiceResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn empty_scopes_mean_unrestricted() {
        assert_eq!(Grant::from_scopes(vec![]), Grant::Unrestricted);
        assert!(Grant::from_scopes(vec![]).allows(&RequiredScope::new("anything")));
    }

    #[test]
    fn resource_scopes_match_exactly() {
        let grant = Grant::from_scopes(vec!["message-bucket-creation:bucket-123".into()]);

        assert!(grant.allows(&RequiredScope::for_resource(
            "message-bucket-creation",
            "bucket-123"
        )));
        assert!(!grant.allows(&RequiredScope::for_resource(
            "message-bucket-creation",
            "bucket-1234"
        )));
        assert!(!grant.allows(&RequiredScope::for_resource(
            "message-bucket-creation",
            "bucket-12"
        )));
        assert!(!grant.allows(&RequiredScope::new("message-bucket-creation")));
    }

    #[tokio::test]
    async fn authorizer_checks_ownership_for_resources() {
        let authorizer = ScopeAuthorizer::new(Arc::new(DenyAll));
        let unrestricted = ctx(&[]);

        assert!(authorizer
            .authorize(&unrestricted, &RequiredScope::new("message-read"))
            .await
            .is_ok());
        let denied = authorizer
            .authorize(
                &unrestricted,
                &RequiredScope::for_resource("message-read", "bucket-1"),
            )
            .await;
        assert!(matches!(denied, Err(ServiceError::Forbidden(_))));
    }

    #[tokio::test]
    async fn default_authorizer_enforces_scopes_only() {
        let authorizer = ScopeAuthorizer::default();
        let scoped = ctx(&["message-read:bucket-1"]);

        assert!(authorizer
            .authorize(&scoped, &RequiredScope::for_resource("message-read", "bucket-1"))
            .await
            .is_ok());
        assert!(authorizer
            .authorize(&scoped, &RequiredScope::for_resource("message-read", "bucket-2"))
            .await
            .is_err());
    }
}
