//! Session lifecycle: one row per logical login, refresh-token rotation in
//! place and the exchange-code handshake used by redirect flows.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::error::{ServiceError, ServiceResult};
use super::jwt::{AccessTokenClaims, TokenIssuer, TokenPair};
use super::store::CredentialStore;
use crate::models::{DeviceInfo, SessionInfo, User, UserSession};
use crate::utils::{generate_code, hash_code};

/// Exchange codes are redeemable for this long after being issued.
pub const EXCHANGE_CODE_TTL_SECONDS: i64 = 30;
/// Unredeemed codes are scrubbed after this delay.
pub const EXCHANGE_CODE_CLEANUP_SECONDS: u64 = 31;
/// Sessions idle for longer than this are deleted by the sweep.
pub const SESSION_INACTIVITY_DAYS: i64 = 14;

/// Result of a login, refresh or code redemption.
#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub session_id: Uuid,
    pub user: User,
    pub tokens: TokenPair,
}

/// Identity resolved from a verified access JWT.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub user: User,
    pub session: UserSession,
    pub claims: AccessTokenClaims,
}

pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    issuer: Arc<TokenIssuer>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CredentialStore>, issuer: Arc<TokenIssuer>) -> Self {
        Self { store, issuer }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Update the row named by `device.session_id` in place when it exists
    /// and belongs to `user_id`; otherwise insert a row under that same id,
    /// since tokens carrying it as `sid` may already be minted. Without a
    /// supplied id a fresh row is created.
    #[instrument(skip(self, token_id, device), fields(user_id = %user_id))]
    pub async fn create_or_update_session(
        &self,
        user_id: Uuid,
        token_id: &str,
        expires_at: chrono::DateTime<Utc>,
        device: &DeviceInfo,
    ) -> ServiceResult<UserSession> {
        let mut session = UserSession::new(user_id, token_id.to_string(), expires_at, device);

        if let Some(session_id) = device.session_id {
            match self.store.find_session(session_id).await? {
                Some(mut existing) if existing.user_id == user_id => {
                    let now = Utc::now();
                    existing.token_id = token_id.to_string();
                    existing.expires_at = expires_at;
                    existing.is_active = true;
                    existing.last_activity = now;
                    existing.updated_at = now;
                    existing.apply_device(device);
                    if self.store.update_session(&existing).await? {
                        tracing::debug!(session_id = %existing.id, "Session updated in place");
                        return Ok(existing);
                    }
                    tracing::debug!(session_id = %session_id, "Session vanished before update; recreating");
                }
                Some(_) => {
                    tracing::warn!(session_id = %session_id, "Session id belongs to another user");
                    return Err(ServiceError::Conflict("Session id already in use".into()));
                }
                None => {}
            }
            session.id = session_id;
        }

        self.store.insert_session(&session).await?;
        tracing::info!(session_id = %session.id, "Session created");
        Ok(session)
    }

    /// Mint a token pair for `user` and persist the session that owns it.
    #[instrument(skip(self, user, device), fields(user_id = %user.id))]
    pub async fn start_session(
        &self,
        user: &User,
        device: &DeviceInfo,
    ) -> ServiceResult<SessionTokens> {
        let session_id = match device.session_id {
            Some(id) => match self.store.find_session(id).await? {
                Some(existing) if existing.user_id == user.id => id,
                _ => Uuid::new_v4(),
            },
            None => Uuid::new_v4(),
        };

        let expires_at = Utc::now() + self.issuer.refresh_ttl();
        let tokens = self
            .issuer
            .issue_token_pair(user, session_id, Some(expires_at))?;

        let device = DeviceInfo {
            session_id: Some(session_id),
            ..device.clone()
        };
        let session = self
            .create_or_update_session(user.id, &tokens.token_id, expires_at, &device)
            .await?;

        Ok(SessionTokens {
            session_id: session.id,
            user: user.clone(),
            tokens,
        })
    }

    /// Rotate the session's refresh token. The session keeps its id and its
    /// absolute expiry; the previous refresh token stops working.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> ServiceResult<SessionTokens> {
        let claims = self.issuer.verify_refresh(refresh_token).map_err(|e| {
            tracing::debug!(error = %e, "Refresh token rejected");
            ServiceError::Unauthenticated
        })?;

        let session = self
            .store
            .find_session_by_token_id(&claims.jti)
            .await?
            .ok_or(ServiceError::Unauthenticated)?;

        if session.user_id.to_string() != claims.sub {
            tracing::warn!(
                session_id = %session.id,
                "Refresh token subject does not match session owner; revoking session"
            );
            self.store
                .deactivate_session(session.user_id, session.id)
                .await?;
            return Err(ServiceError::Unauthenticated);
        }

        if !session.is_valid() {
            return Err(ServiceError::Unauthenticated);
        }

        let user = self
            .store
            .find_user_by_id(session.user_id)
            .await?
            .ok_or(ServiceError::Unauthenticated)?;

        let tokens = self
            .issuer
            .issue_token_pair(&user, session.id, Some(session.expires_at))?;

        // Loses to a concurrent refresh or revocation of the same session.
        let rotated = self
            .store
            .rotate_session_token(session.id, &claims.jti, &tokens.token_id, Utc::now())
            .await?
            .ok_or(ServiceError::Unauthenticated)?;

        tracing::info!(session_id = %rotated.id, user_id = %user.id, "Session refreshed");
        Ok(SessionTokens {
            session_id: rotated.id,
            user,
            tokens,
        })
    }

    /// Verify an access JWT and require its session to still be live.
    pub async fn authenticate_access_token(
        &self,
        token: &str,
    ) -> ServiceResult<AuthenticatedSession> {
        let claims = self
            .issuer
            .verify_access(token)
            .map_err(|_| ServiceError::Unauthenticated)?;

        let session_id =
            Uuid::parse_str(&claims.sid).map_err(|_| ServiceError::Unauthenticated)?;
        let session = self
            .store
            .find_session(session_id)
            .await?
            .filter(|s| s.is_valid() && s.user_id.to_string() == claims.sub)
            .ok_or(ServiceError::Unauthenticated)?;

        let user = self
            .store
            .find_user_by_id(session.user_id)
            .await?
            .ok_or(ServiceError::Unauthenticated)?;

        Ok(AuthenticatedSession {
            user,
            session,
            claims,
        })
    }

    #[instrument(skip(self))]
    pub async fn revoke(&self, user_id: Uuid, session_id: Uuid) -> ServiceResult<bool> {
        let revoked = self.store.deactivate_session(user_id, session_id).await?;
        if revoked {
            tracing::info!("Session revoked");
        }
        Ok(revoked)
    }

    pub async fn revoke_by_refresh_token(&self, token_id: &str) -> ServiceResult<bool> {
        Ok(self.store.deactivate_session_by_token_id(token_id).await?)
    }

    /// Revoke the session carrying `refresh_token`, if it verifies.
    pub async fn revoke_refresh_token(&self, refresh_token: &str) -> ServiceResult<bool> {
        match self.issuer.verify_refresh(refresh_token) {
            Ok(claims) => self.revoke_by_refresh_token(&claims.jti).await,
            Err(_) => Ok(false),
        }
    }

    #[instrument(skip(self, keep_token_id))]
    pub async fn revoke_all_except(&self, user_id: Uuid, keep_token_id: &str) -> ServiceResult<u64> {
        let count = self
            .store
            .deactivate_sessions_except(user_id, keep_token_id)
            .await?;
        tracing::info!(revoked = count, "Other sessions revoked");
        Ok(count)
    }

    pub async fn revoke_all(&self, user_id: Uuid) -> ServiceResult<u64> {
        Ok(self.store.deactivate_user_sessions(user_id).await?)
    }

    pub async fn list(
        &self,
        user_id: Uuid,
        current_session_id: Option<Uuid>,
    ) -> ServiceResult<Vec<SessionInfo>> {
        let sessions = self.store.list_active_sessions(user_id, Utc::now()).await?;
        Ok(sessions
            .into_iter()
            .map(|s| {
                let is_current = Some(s.id) == current_session_id;
                SessionInfo {
                    is_current,
                    ..SessionInfo::from(s)
                }
            })
            .collect())
    }

    pub async fn set_exchange_code(
        &self,
        session_id: Uuid,
        code: &str,
        requested_at: chrono::DateTime<Utc>,
    ) -> ServiceResult<()> {
        let code_hash = hash_code(code);
        if !self
            .store
            .set_exchange_code(session_id, &code_hash, requested_at)
            .await?
        {
            return Err(ServiceError::NotFound("Session not found".into()));
        }
        self.spawn_exchange_cleanup(session_id, code_hash);
        Ok(())
    }

    /// Generate a fresh exchange code for a session. Only the digest is
    /// stored; the returned code travels in the redirect.
    pub async fn issue_exchange_code(&self, session_id: Uuid) -> ServiceResult<String> {
        let code = generate_code(32);
        self.set_exchange_code(session_id, &code, Utc::now()).await?;
        Ok(code)
    }

    /// Trade an exchange code for a fresh pair on the same session. The code
    /// is cleared atomically before tokens are minted, so it redeems once.
    #[instrument(skip(self, code))]
    pub async fn redeem(
        &self,
        code: &str,
        expected_session_id: Option<Uuid>,
    ) -> ServiceResult<SessionTokens> {
        let not_before = Utc::now() - Duration::seconds(EXCHANGE_CODE_TTL_SECONDS);
        let session = self
            .store
            .take_exchange_code(&hash_code(code), expected_session_id, not_before)
            .await?
            .ok_or(ServiceError::InvalidOrExpiredCode)?;

        let user = self
            .store
            .find_user_by_id(session.user_id)
            .await?
            .ok_or(ServiceError::InvalidOrExpiredCode)?;

        let tokens = self
            .issuer
            .issue_token_pair(&user, session.id, Some(session.expires_at))?;
        let rotated = self
            .store
            .rotate_session_token(session.id, &session.token_id, &tokens.token_id, Utc::now())
            .await?
            .ok_or(ServiceError::InvalidOrExpiredCode)?;

        tracing::info!(session_id = %rotated.id, user_id = %user.id, "Exchange code redeemed");
        Ok(SessionTokens {
            session_id: rotated.id,
            user,
            tokens,
        })
    }

    fn spawn_exchange_cleanup(&self, session_id: Uuid, code_hash: String) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(EXCHANGE_CODE_CLEANUP_SECONDS)).await;
            match store.clear_exchange_code(session_id, &code_hash).await {
                Ok(true) => tracing::debug!(session_id = %session_id, "Unredeemed exchange code cleared"),
                Ok(false) => {}
                Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Exchange code cleanup failed"),
            }
        });
    }

    /// Delete sessions idle for more than [`SESSION_INACTIVITY_DAYS`].
    #[instrument(skip(self))]
    pub async fn sweep_inactive(&self) -> ServiceResult<u64> {
        let cutoff = Utc::now() - Duration::days(SESSION_INACTIVITY_DAYS);
        let deleted = self.store.delete_sessions_inactive_since(cutoff).await?;
        tracing::info!(deleted = deleted, "Inactive sessions swept");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::services::store::InMemoryCredentialStore;

    async fn setup() -> Result<(SessionManager, Arc<dyn CredentialStore>, User), anyhow::Error> {
        let store: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::new());
        let issuer = Arc::new(TokenIssuer::new(AuthConfig::default().jwt));
        let user = User::new("ada@example.com".into(), "ada".into());
        store.insert_user(&user).await?;
        Ok((SessionManager::new(Arc::clone(&store), issuer), store, user))
    }

    #[tokio::test]
    async fn refresh_keeps_session_and_expiry() -> Result<(), anyhow::Error> {
        let (sessions, store, user) = setup().await?;
        let login = sessions.start_session(&user, &DeviceInfo::default()).await?;
        let before = store
            .find_session(login.session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session missing"))?;

        let refreshed = sessions.refresh(&login.tokens.refresh_token).await?;
        let after = store
            .find_session(login.session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session missing"))?;

        assert_eq!(refreshed.session_id, login.session_id);
        assert_eq!(after.expires_at, before.expires_at);
        assert_ne!(after.token_id, before.token_id);
        assert!(sessions.refresh(&login.tokens.refresh_token).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn revoked_session_cannot_refresh() -> Result<(), anyhow::Error> {
        let (sessions, _store, user) = setup().await?;
        let login = sessions.start_session(&user, &DeviceInfo::default()).await?;

        assert!(sessions.revoke(user.id, login.session_id).await?);
        assert!(!sessions.revoke(user.id, login.session_id).await?);
        assert!(matches!(
            sessions.refresh(&login.tokens.refresh_token).await,
            Err(ServiceError::Unauthenticated)
        ));
        assert!(sessions
            .authenticate_access_token(&login.tokens.access_token)
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn supplied_session_id_is_kept_on_insert() -> Result<(), anyhow::Error> {
        let (sessions, store, user) = setup().await?;
        let session_id = Uuid::new_v4();
        let expires_at = Utc::now() + sessions.issuer().refresh_ttl();
        let tokens = sessions
            .issuer()
            .issue_token_pair(&user, session_id, Some(expires_at))?;

        let device = DeviceInfo {
            session_id: Some(session_id),
            ..DeviceInfo::default()
        };
        let session = sessions
            .create_or_update_session(user.id, &tokens.token_id, expires_at, &device)
            .await?;

        assert_eq!(session.id, session_id);
        assert!(store.find_session(session_id).await?.is_some());
        let authenticated = sessions
            .authenticate_access_token(&tokens.access_token)
            .await?;
        assert_eq!(authenticated.session.id, session_id);
        Ok(())
    }

    #[tokio::test]
    async fn foreign_session_id_is_refused() -> Result<(), anyhow::Error> {
        let (sessions, store, user) = setup().await?;
        let owned = sessions.start_session(&user, &DeviceInfo::default()).await?;
        let other = User::new("eve@example.com".into(), "eve".into());
        store.insert_user(&other).await?;

        let device = DeviceInfo {
            session_id: Some(owned.session_id),
            ..DeviceInfo::default()
        };
        let result = sessions
            .create_or_update_session(other.id, "other-jti", Utc::now(), &device)
            .await;
        assert!(matches!(result, Err(ServiceError::Conflict(_))));

        let untouched = store
            .find_session(owned.session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session missing"))?;
        assert_eq!(untouched.user_id, user.id);
        assert_eq!(untouched.token_id, owned.tokens.token_id);
        Ok(())
    }

    #[tokio::test]
    async fn supplied_session_id_is_updated_in_place() -> Result<(), anyhow::Error> {
        let (sessions, store, user) = setup().await?;
        let first = sessions.start_session(&user, &DeviceInfo::default()).await?;

        let device = DeviceInfo {
            session_id: Some(first.session_id),
            browser: Some("Firefox".into()),
            ..Default::default()
        };
        let second = sessions.start_session(&user, &device).await?;

        assert_eq!(second.session_id, first.session_id);
        assert_eq!(store.list_active_sessions(user.id, Utc::now()).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn exchange_code_redeems_once_on_same_session() -> Result<(), anyhow::Error> {
        let (sessions, store, user) = setup().await?;
        let login = sessions.start_session(&user, &DeviceInfo::default()).await?;
        let code = sessions.issue_exchange_code(login.session_id).await?;

        let redeemed = sessions.redeem(&code, Some(login.session_id)).await?;
        assert_eq!(redeemed.session_id, login.session_id);
        assert!(matches!(
            sessions.redeem(&code, None).await,
            Err(ServiceError::InvalidOrExpiredCode)
        ));
        assert_eq!(store.list_active_sessions(user.id, Utc::now()).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stale_exchange_code_is_rejected() -> Result<(), anyhow::Error> {
        let (sessions, _store, user) = setup().await?;
        let login = sessions.start_session(&user, &DeviceInfo::default()).await?;
        let requested_at = Utc::now() - Duration::seconds(EXCHANGE_CODE_TTL_SECONDS + 1);
        sessions
            .set_exchange_code(login.session_id, "stale-code", requested_at)
            .await?;

        assert!(matches!(
            sessions.redeem("stale-code", None).await,
            Err(ServiceError::InvalidOrExpiredCode)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn exchange_code_bound_to_other_session_is_rejected() -> Result<(), anyhow::Error> {
        let (sessions, _store, user) = setup().await?;
        let login = sessions.start_session(&user, &DeviceInfo::default()).await?;
        let code = sessions.issue_exchange_code(login.session_id).await?;

        assert!(sessions.redeem(&code, Some(Uuid::new_v4())).await.is_err());
        assert!(sessions.redeem(&code, Some(login.session_id)).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn sweep_removes_idle_sessions_only() -> Result<(), anyhow::Error> {
        let (sessions, store, user) = setup().await?;
        let fresh = sessions.start_session(&user, &DeviceInfo::default()).await?;
        let mut idle = UserSession::new(
            user.id,
            "idle-jti".into(),
            Utc::now() + Duration::days(1),
            &DeviceInfo::default(),
        );
        idle.last_activity = Utc::now() - Duration::days(SESSION_INACTIVITY_DAYS + 1);
        store.insert_session(&idle).await?;

        assert_eq!(sessions.sweep_inactive().await?, 1);
        assert!(store.find_session(idle.id).await?.is_none());
        assert!(store.find_session(fresh.session_id).await?.is_some());
        Ok(())
    }
}
