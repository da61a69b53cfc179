//! Long-lived opaque bearer tokens with optional scopes.
//!
//! Secrets look like `ntk_<64 hex>`. Only an Argon2 hash of the hex part is
//! kept, so validation has to try every stored hash: an O(n) scan over all
//! issued tokens. Fine at the expected cardinality; an indexable lookup key
//! derived from the secret is the obvious next step if the table grows.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::error::{ServiceError, ServiceResult};
use super::store::{CredentialStore, StoreError};
use crate::models::{AccessTokenInfo, User, UserAccessToken};
use crate::utils::{generate_code, SecretHasher};

/// Marks an opaque access token.
pub const ACCESS_TOKEN_PREFIX: &str = "ntk_";
/// Marks a system token; those are verified elsewhere.
pub const SYSTEM_TOKEN_PREFIX: &str = "sys_";

const SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct NewAccessToken {
    pub name: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Also persist the plaintext so it can be fetched again later.
    pub store_secret: bool,
}

/// Returned once at creation; `token` is never shown again unless stored.
#[derive(Debug)]
pub struct CreatedAccessToken {
    pub token: String,
    pub info: AccessTokenInfo,
}

#[derive(Debug, Clone)]
pub struct ValidatedAccessToken {
    pub user: User,
    pub token_id: Uuid,
    pub scopes: Vec<String>,
}

pub struct AccessTokenManager {
    store: Arc<dyn CredentialStore>,
    hasher: Arc<SecretHasher>,
}

impl AccessTokenManager {
    pub fn new(store: Arc<dyn CredentialStore>, hasher: Arc<SecretHasher>) -> Self {
        Self { store, hasher }
    }

    #[instrument(skip(self, request), fields(user_id = %user_id))]
    pub async fn create(
        &self,
        user_id: Uuid,
        request: NewAccessToken,
    ) -> ServiceResult<CreatedAccessToken> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(ServiceError::Validation("Token name is required".into()));
        }
        if request.expires_at.is_some_and(|exp| exp <= Utc::now()) {
            return Err(ServiceError::Validation(
                "Expiry must be in the future".into(),
            ));
        }
        let scopes = normalize_scopes(request.scopes);

        let body = generate_code(SECRET_BYTES);
        let secret = format!("{}{}", ACCESS_TOKEN_PREFIX, body);
        let now = Utc::now();
        let token = UserAccessToken {
            id: Uuid::new_v4(),
            user_id,
            name,
            token_hash: self.hasher.hash(&body)?,
            token: request.store_secret.then(|| secret.clone()),
            scopes,
            expires_at: request.expires_at,
            last_used: None,
            created_at: now,
            updated_at: now,
        };

        if token.is_watch_token() {
            self.insert_watch_token(&token).await?;
        } else {
            self.store.insert_access_token(&token).await?;
        }

        tracing::info!(
            token_id = %token.id,
            scoped = !token.scopes.is_empty(),
            secret_stored = request.store_secret,
            "Access token created"
        );
        Ok(CreatedAccessToken {
            token: secret,
            info: AccessTokenInfo::from(token),
        })
    }

    /// Replace the user's watch token. A concurrent creation can slip in
    /// between delete and insert; the partial unique index rejects it and we
    /// try once more.
    async fn insert_watch_token(&self, token: &UserAccessToken) -> ServiceResult<()> {
        for attempt in 0..2 {
            let removed = self.store.delete_watch_tokens(token.user_id).await?;
            if removed > 0 {
                tracing::info!(removed = removed, "Previous watch token deleted");
            }
            match self.store.insert_access_token(token).await {
                Ok(()) => return Ok(()),
                Err(StoreError::UniqueViolation(_)) if attempt == 0 => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::Conflict("Watch token is being replaced".into()))
    }

    /// Resolve an opaque secret to its owner and scopes. `Ok(None)` for
    /// anything that does not match a live token.
    #[instrument(skip_all)]
    pub async fn validate(&self, secret: &str) -> ServiceResult<Option<ValidatedAccessToken>> {
        let Some(body) = secret.strip_prefix(ACCESS_TOKEN_PREFIX) else {
            return Ok(None);
        };
        if body.len() != SECRET_BYTES * 2 || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(None);
        }

        let now = Utc::now();
        let candidates = self.store.list_all_access_tokens().await?;
        let matched = candidates
            .into_iter()
            .filter(|t| !t.is_expired_at(now))
            .find(|t| self.hasher.verify(body, &t.token_hash));

        let Some(token) = matched else {
            return Ok(None);
        };

        self.store.touch_access_token(token.id, now).await?;
        let Some(user) = self.store.find_user_by_id(token.user_id).await? else {
            return Ok(None);
        };

        Ok(Some(ValidatedAccessToken {
            user,
            token_id: token.id,
            scopes: token.scopes,
        }))
    }

    pub async fn list(&self, user_id: Uuid) -> ServiceResult<Vec<AccessTokenInfo>> {
        let tokens = self.store.list_access_tokens(user_id).await?;
        Ok(tokens.into_iter().map(AccessTokenInfo::from).collect())
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, user_id: Uuid, token_id: Uuid) -> ServiceResult<bool> {
        let deleted = self.store.delete_access_token(user_id, token_id).await?;
        if deleted {
            tracing::info!("Access token deleted");
        }
        Ok(deleted)
    }

    /// Plaintext secret, only for tokens created with `store_secret`.
    pub async fn get_secret(&self, user_id: Uuid, token_id: Uuid) -> ServiceResult<String> {
        self.store
            .find_access_token(user_id, token_id)
            .await?
            .and_then(|t| t.token)
            .ok_or_else(|| ServiceError::NotFound("Token secret not available".into()))
    }
}

fn normalize_scopes(scopes: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(scopes.len());
    for scope in scopes {
        let scope = scope.trim();
        if !scope.is_empty() && !out.iter().any(|s| s == scope) {
            out.push(scope.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WATCH_SCOPE;
    use crate::services::store::InMemoryCredentialStore;
    use chrono::Duration;

    async fn setup() -> Result<(AccessTokenManager, User), anyhow::Error> {
        let store: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::new());
        let user = User::new("ada@example.com".into(), "ada".into());
        store.insert_user(&user).await?;
        let manager = AccessTokenManager::new(store, Arc::new(SecretHasher::fast()?));
        Ok((manager, user))
    }

    fn named(name: &str) -> NewAccessToken {
        NewAccessToken {
            name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn created_secret_validates_and_touches_last_used() -> Result<(), anyhow::Error> {
        let (manager, user) = setup().await?;
        let created = manager.create(user.id, named("ci")).await?;

        assert!(created.token.starts_with(ACCESS_TOKEN_PREFIX));
        assert_eq!(created.token.len(), ACCESS_TOKEN_PREFIX.len() + 64);

        let validated = manager
            .validate(&created.token)
            .await?
            .ok_or_else(|| anyhow::anyhow!("token did not validate"))?;
        assert_eq!(validated.user.id, user.id);
        assert!(validated.scopes.is_empty());

        let listed = manager.list(user.id).await?;
        assert!(listed[0].last_used.is_some());
        assert!(!listed[0].secret_stored);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_or_malformed_secrets_do_not_validate() -> Result<(), anyhow::Error> {
        let (manager, user) = setup().await?;
        manager.create(user.id, named("ci")).await?;

        assert!(manager.validate("ntk_deadbeef").await?.is_none());
        assert!(manager
            .validate(&format!("ntk_{}", "0".repeat(64)))
            .await?
            .is_none());
        assert!(manager.validate("not-a-token").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn expired_tokens_are_skipped() -> Result<(), anyhow::Error> {
        let (manager, user) = setup().await?;
        let created = manager
            .create(
                user.id,
                NewAccessToken {
                    name: "short".into(),
                    expires_at: Some(Utc::now() + Duration::milliseconds(200)),
                    ..Default::default()
                },
            )
            .await?;

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(manager.validate(&created.token).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn new_watch_token_replaces_previous() -> Result<(), anyhow::Error> {
        let (manager, user) = setup().await?;
        let watch = || NewAccessToken {
            name: "watch".into(),
            scopes: vec![WATCH_SCOPE.into()],
            ..Default::default()
        };

        let first = manager.create(user.id, watch()).await?;
        let second = manager.create(user.id, watch()).await?;
        manager.create(user.id, named("other")).await?;

        let listed = manager.list(user.id).await?;
        assert_eq!(listed.len(), 2);
        assert!(manager.validate(&first.token).await?.is_none());
        assert!(manager.validate(&second.token).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn secret_is_retrievable_only_when_stored() -> Result<(), anyhow::Error> {
        let (manager, user) = setup().await?;
        let stored = manager
            .create(
                user.id,
                NewAccessToken {
                    name: "kept".into(),
                    store_secret: true,
                    ..Default::default()
                },
            )
            .await?;
        let hidden = manager.create(user.id, named("hidden")).await?;

        assert_eq!(manager.get_secret(user.id, stored.info.id).await?, stored.token);
        assert!(matches!(
            manager.get_secret(user.id, hidden.info.id).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            manager.get_secret(Uuid::new_v4(), stored.info.id).await,
            Err(ServiceError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_owner_scoped() -> Result<(), anyhow::Error> {
        let (manager, user) = setup().await?;
        let created = manager.create(user.id, named("ci")).await?;

        assert!(!manager.delete(Uuid::new_v4(), created.info.id).await?);
        assert!(manager.delete(user.id, created.info.id).await?);
        assert!(!manager.delete(user.id, created.info.id).await?);
        Ok(())
    }

    #[test]
    fn scopes_are_trimmed_and_deduplicated() {
        let scopes = normalize_scopes(vec![
            " a ".into(),
            "a".into(),
            "".into(),
            "b:1".into(),
        ]);
        assert_eq!(scopes, vec!["a".to_string(), "b:1".to_string()]);
    }
}
