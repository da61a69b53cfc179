//! PostgreSQL credential store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{CredentialStore, IdentityRemoval, StoreError, StoreResult};
use crate::models::{
    provider_config::normalize_provider_key, OAuthProviderConfig, ProviderType, User,
    UserAccessToken, UserIdentity, UserSession, WATCH_SCOPE,
};
use crate::providers::ProviderChange;

const USER_COLUMNS: &str = "id, email, username, password_hash, has_password, email_confirmed, \
     reset_code_hash, reset_requested_at, email_confirmation_code_hash, \
     email_confirmation_requested_at, first_name, last_name, avatar, created_at, updated_at";

const IDENTITY_COLUMNS: &str = "id, user_id, provider_type, provider_user_id, email, avatar_url, \
     metadata, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, user_id, token_id, expires_at, last_activity, is_active, \
     device_name, operating_system, browser, ip_address, user_agent, login_provider, \
     exchange_code_hash, exchange_code_requested_at, created_at, updated_at";

const TOKEN_COLUMNS: &str = "id, user_id, name, token_hash, token, scopes, expires_at, last_used, \
     created_at, updated_at";

const PROVIDER_COLUMNS: &str = "provider_id, provider_type, name, client_id, client_secret, scopes, \
     callback_url, enabled, authorization_url, token_url, user_info_url, profile_fields, \
     apple_team_id, apple_key_id, apple_private_key_path, updated_at";

const PROVIDER_CHANGE_CHANNEL: &str = "oauth_provider_changes";
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Connection pool wrapper implementing [`CredentialStore`].
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        info!(max_connections = max_connections, "Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> StoreResult<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Forward `oauth_provider_changes` notifications to the registry until
    /// the receiving side goes away.
    pub async fn listen_provider_changes(
        &self,
        changes: mpsc::Sender<ProviderChange>,
    ) -> StoreResult<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(PROVIDER_CHANGE_CHANNEL).await?;
        info!(channel = PROVIDER_CHANGE_CHANNEL, "Listening for provider changes");

        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Some(change) = ProviderChange::from_notification(notification.payload())
                        else {
                            warn!(payload = notification.payload(), "Unrecognized provider change");
                            continue;
                        };
                        if changes.send(change).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // The periodic resync covers anything missed meanwhile.
                        warn!(error = %e, "Provider change listener error; retrying");
                        tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                    }
                }
            }
        }))
    }

    async fn fetch_user(&self, predicate: &str, value: &str) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, predicate);
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?)
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ==================== Users ====================

    async fn find_user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        self.fetch_user("lower(email) = lower($1)", email).await
    }

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        self.fetch_user("lower(username) = lower($1)", username).await
    }

    async fn find_user_by_reset_code(&self, code_hash: &str) -> StoreResult<Option<User>> {
        self.fetch_user("reset_code_hash = $1", code_hash).await
    }

    async fn find_user_by_confirmation_code(
        &self,
        code_hash: &str,
    ) -> StoreResult<Option<User>> {
        self.fetch_user("email_confirmation_code_hash = $1", code_hash)
            .await
    }

    #[instrument(skip(self, user), fields(user_id = %user.id))]
    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, username, password_hash, has_password, email_confirmed,
                reset_code_hash, reset_requested_at, email_confirmation_code_hash,
                email_confirmation_requested_at, first_name, last_name, avatar, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.has_password)
        .bind(user.email_confirmed)
        .bind(&user.reset_code_hash)
        .bind(user.reset_requested_at)
        .bind(&user.email_confirmation_code_hash)
        .bind(user.email_confirmation_requested_at)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.avatar)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, user), fields(user_id = %user.id))]
    async fn update_user(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE users SET email = $2, username = $3, password_hash = $4, has_password = $5,
                email_confirmed = $6, reset_code_hash = $7, reset_requested_at = $8,
                email_confirmation_code_hash = $9, email_confirmation_requested_at = $10,
                first_name = $11, last_name = $12, avatar = $13, updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.has_password)
        .bind(user.email_confirmed)
        .bind(&user.reset_code_hash)
        .bind(user.reset_requested_at)
        .bind(&user.email_confirmation_code_hash)
        .bind(user.email_confirmation_requested_at)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.avatar)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Identities ====================

    async fn find_identity_by_provider_user_id(
        &self,
        provider: ProviderType,
        provider_user_id: &str,
    ) -> StoreResult<Option<UserIdentity>> {
        let sql = format!(
            "SELECT {} FROM user_identities WHERE provider_type = $1 AND provider_user_id = $2",
            IDENTITY_COLUMNS
        );
        Ok(sqlx::query_as::<_, UserIdentity>(&sql)
            .bind(provider)
            .bind(provider_user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_identity_by_email(
        &self,
        provider: ProviderType,
        email: &str,
    ) -> StoreResult<Option<UserIdentity>> {
        let sql = format!(
            "SELECT {} FROM user_identities WHERE provider_type = $1 AND lower(email) = lower($2) \
             ORDER BY created_at LIMIT 1",
            IDENTITY_COLUMNS
        );
        Ok(sqlx::query_as::<_, UserIdentity>(&sql)
            .bind(provider)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_identity_for_user(
        &self,
        user_id: Uuid,
        provider: ProviderType,
    ) -> StoreResult<Option<UserIdentity>> {
        let sql = format!(
            "SELECT {} FROM user_identities WHERE user_id = $1 AND provider_type = $2",
            IDENTITY_COLUMNS
        );
        Ok(sqlx::query_as::<_, UserIdentity>(&sql)
            .bind(user_id)
            .bind(provider)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_identities(&self, user_id: Uuid) -> StoreResult<Vec<UserIdentity>> {
        let sql = format!(
            "SELECT {} FROM user_identities WHERE user_id = $1 ORDER BY created_at",
            IDENTITY_COLUMNS
        );
        Ok(sqlx::query_as::<_, UserIdentity>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?)
    }

    #[instrument(skip(self, identity), fields(user_id = %identity.user_id, provider = %identity.provider_type))]
    async fn insert_identity(&self, identity: &UserIdentity) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_identities (id, user_id, provider_type, provider_user_id, email,
                avatar_url, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(identity.id)
        .bind(identity.user_id)
        .bind(identity.provider_type)
        .bind(&identity.provider_user_id)
        .bind(&identity.email)
        .bind(&identity.avatar_url)
        .bind(&identity.metadata)
        .bind(identity.created_at)
        .bind(identity.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_identity(&self, identity: &UserIdentity) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE user_identities
            SET provider_user_id = $2, email = $3, avatar_url = $4, metadata = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(identity.id)
        .bind(&identity.provider_user_id)
        .bind(&identity.email)
        .bind(&identity.avatar_url)
        .bind(&identity.metadata)
        .bind(identity.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_identity(
        &self,
        user_id: Uuid,
        provider: ProviderType,
    ) -> StoreResult<IdentityRemoval> {
        let mut tx = self.pool.begin().await?;

        // The user row lock serializes removals for one account; a second
        // caller re-reads the identities after the first commits.
        let has_password: Option<bool> =
            sqlx::query_scalar("SELECT has_password FROM users WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(has_password) = has_password else {
            return Ok(IdentityRemoval::NotFound);
        };

        let linked: Vec<ProviderType> =
            sqlx::query_scalar("SELECT provider_type FROM user_identities WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&mut *tx)
                .await?;
        if !linked.contains(&provider) {
            return Ok(IdentityRemoval::NotFound);
        }
        if !has_password && linked.len() <= 1 {
            return Ok(IdentityRemoval::LastSignInMethod);
        }

        sqlx::query("DELETE FROM user_identities WHERE user_id = $1 AND provider_type = $2")
            .bind(user_id)
            .bind(provider)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(IdentityRemoval::Removed)
    }

    // ==================== Sessions ====================

    #[instrument(skip(self, session), fields(session_id = %session.id, user_id = %session.user_id))]
    async fn insert_session(&self, session: &UserSession) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_sessions (id, user_id, token_id, expires_at, last_activity, is_active,
                device_name, operating_system, browser, ip_address, user_agent, login_provider,
                exchange_code_hash, exchange_code_requested_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.token_id)
        .bind(session.expires_at)
        .bind(session.last_activity)
        .bind(session.is_active)
        .bind(&session.device_name)
        .bind(&session.operating_system)
        .bind(&session.browser)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(&session.login_provider)
        .bind(&session.exchange_code_hash)
        .bind(session.exchange_code_requested_at)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_session(&self, session: &UserSession) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_sessions
            SET token_id = $2, expires_at = $3, last_activity = $4, is_active = $5,
                device_name = $6, operating_system = $7, browser = $8, ip_address = $9,
                user_agent = $10, login_provider = $11, updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(session.id)
        .bind(&session.token_id)
        .bind(session.expires_at)
        .bind(session.last_activity)
        .bind(session.is_active)
        .bind(&session.device_name)
        .bind(&session.operating_system)
        .bind(&session.browser)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(&session.login_provider)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_session(&self, session_id: Uuid) -> StoreResult<Option<UserSession>> {
        let sql = format!("SELECT {} FROM user_sessions WHERE id = $1", SESSION_COLUMNS);
        Ok(sqlx::query_as::<_, UserSession>(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_session_by_token_id(
        &self,
        token_id: &str,
    ) -> StoreResult<Option<UserSession>> {
        let sql = format!(
            "SELECT {} FROM user_sessions WHERE token_id = $1",
            SESSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, UserSession>(&sql)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_active_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<UserSession>> {
        let sql = format!(
            "SELECT {} FROM user_sessions WHERE user_id = $1 AND is_active AND expires_at > $2 \
             ORDER BY last_activity DESC",
            SESSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, UserSession>(&sql)
            .bind(user_id)
            .bind(now)
            .fetch_all(&self.pool)
            .await?)
    }

    #[instrument(skip(self, current_token_id, next_token_id))]
    async fn rotate_session_token(
        &self,
        session_id: Uuid,
        current_token_id: &str,
        next_token_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UserSession>> {
        let sql = format!(
            "UPDATE user_sessions SET token_id = $3, last_activity = $4, updated_at = $4 \
             WHERE id = $1 AND token_id = $2 AND is_active AND expires_at > $4 \
             RETURNING {}",
            SESSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, UserSession>(&sql)
            .bind(session_id)
            .bind(current_token_id)
            .bind(next_token_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn deactivate_session(&self, user_id: Uuid, session_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE user_sessions SET is_active = FALSE, updated_at = NOW() \
             WHERE id = $1 AND user_id = $2 AND is_active",
        )
        .bind(session_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_session_by_token_id(&self, token_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE user_sessions SET is_active = FALSE, updated_at = NOW() \
             WHERE token_id = $1 AND is_active",
        )
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_sessions_except(
        &self,
        user_id: Uuid,
        keep_token_id: &str,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE user_sessions SET is_active = FALSE, updated_at = NOW() \
             WHERE user_id = $1 AND token_id <> $2 AND is_active",
        )
        .bind(user_id)
        .bind(keep_token_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn deactivate_user_sessions(&self, user_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE user_sessions SET is_active = FALSE, updated_at = NOW() \
             WHERE user_id = $1 AND is_active",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn set_exchange_code(
        &self,
        session_id: Uuid,
        code_hash: &str,
        requested_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE user_sessions \
             SET exchange_code_hash = $2, exchange_code_requested_at = $3, updated_at = $3 \
             WHERE id = $1 AND is_active",
        )
        .bind(session_id)
        .bind(code_hash)
        .bind(requested_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, code_hash))]
    async fn take_exchange_code(
        &self,
        code_hash: &str,
        session_id: Option<Uuid>,
        not_before: DateTime<Utc>,
    ) -> StoreResult<Option<UserSession>> {
        let sql = format!(
            "UPDATE user_sessions \
             SET exchange_code_hash = NULL, exchange_code_requested_at = NULL, \
                 last_activity = NOW(), updated_at = NOW() \
             WHERE exchange_code_hash = $1 AND exchange_code_requested_at >= $2 \
               AND is_active AND expires_at > NOW() AND ($3::uuid IS NULL OR id = $3) \
             RETURNING {}",
            SESSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, UserSession>(&sql)
            .bind(code_hash)
            .bind(not_before)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn clear_exchange_code(&self, session_id: Uuid, code_hash: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE user_sessions SET exchange_code_hash = NULL, exchange_code_requested_at = NULL \
             WHERE id = $1 AND exchange_code_hash = $2",
        )
        .bind(session_id)
        .bind(code_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_sessions_inactive_since(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE last_activity < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ==================== Access tokens ====================

    #[instrument(skip(self, token), fields(token_id = %token.id, user_id = %token.user_id))]
    async fn insert_access_token(&self, token: &UserAccessToken) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_access_tokens (id, user_id, name, token_hash, token, scopes,
                expires_at, last_used, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.name)
        .bind(&token.token_hash)
        .bind(&token.token)
        .bind(&token.scopes)
        .bind(token.expires_at)
        .bind(token.last_used)
        .bind(token.created_at)
        .bind(token.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_access_tokens(&self, user_id: Uuid) -> StoreResult<Vec<UserAccessToken>> {
        let sql = format!(
            "SELECT {} FROM user_access_tokens WHERE user_id = $1 ORDER BY created_at DESC",
            TOKEN_COLUMNS
        );
        Ok(sqlx::query_as::<_, UserAccessToken>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn list_all_access_tokens(&self) -> StoreResult<Vec<UserAccessToken>> {
        let sql = format!("SELECT {} FROM user_access_tokens", TOKEN_COLUMNS);
        Ok(sqlx::query_as::<_, UserAccessToken>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn find_access_token(
        &self,
        user_id: Uuid,
        token_id: Uuid,
    ) -> StoreResult<Option<UserAccessToken>> {
        let sql = format!(
            "SELECT {} FROM user_access_tokens WHERE id = $1 AND user_id = $2",
            TOKEN_COLUMNS
        );
        Ok(sqlx::query_as::<_, UserAccessToken>(&sql)
            .bind(token_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn delete_access_token(&self, user_id: Uuid, token_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM user_access_tokens WHERE id = $1 AND user_id = $2")
            .bind(token_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_watch_tokens(&self, user_id: Uuid) -> StoreResult<u64> {
        let result =
            sqlx::query("DELETE FROM user_access_tokens WHERE user_id = $1 AND $2 = ANY(scopes)")
                .bind(user_id)
                .bind(WATCH_SCOPE)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn touch_access_token(&self, token_id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE user_access_tokens SET last_used = $2 WHERE id = $1")
            .bind(token_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Provider configuration ====================

    async fn list_provider_configs(&self) -> StoreResult<Vec<OAuthProviderConfig>> {
        let sql = format!(
            "SELECT {} FROM oauth_provider_configs ORDER BY provider_id",
            PROVIDER_COLUMNS
        );
        Ok(sqlx::query_as::<_, OAuthProviderConfig>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn find_provider_config(
        &self,
        provider_id: &str,
    ) -> StoreResult<Option<OAuthProviderConfig>> {
        let sql = format!(
            "SELECT {} FROM oauth_provider_configs WHERE provider_id = $1",
            PROVIDER_COLUMNS
        );
        Ok(sqlx::query_as::<_, OAuthProviderConfig>(&sql)
            .bind(normalize_provider_key(provider_id))
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn upsert_provider_config(&self, config: &OAuthProviderConfig) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_provider_configs (provider_id, provider_type, name, client_id,
                client_secret, scopes, callback_url, enabled, authorization_url, token_url,
                user_info_url, profile_fields, apple_team_id, apple_key_id,
                apple_private_key_path, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (provider_id) DO UPDATE SET
                provider_type = EXCLUDED.provider_type, name = EXCLUDED.name,
                client_id = EXCLUDED.client_id, client_secret = EXCLUDED.client_secret,
                scopes = EXCLUDED.scopes, callback_url = EXCLUDED.callback_url,
                enabled = EXCLUDED.enabled, authorization_url = EXCLUDED.authorization_url,
                token_url = EXCLUDED.token_url, user_info_url = EXCLUDED.user_info_url,
                profile_fields = EXCLUDED.profile_fields, apple_team_id = EXCLUDED.apple_team_id,
                apple_key_id = EXCLUDED.apple_key_id,
                apple_private_key_path = EXCLUDED.apple_private_key_path,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(config.key())
        .bind(config.provider_type)
        .bind(&config.name)
        .bind(&config.client_id)
        .bind(&config.client_secret)
        .bind(&config.scopes)
        .bind(&config.callback_url)
        .bind(config.enabled)
        .bind(&config.authorization_url)
        .bind(&config.token_url)
        .bind(&config.user_info_url)
        .bind(&config.profile_fields)
        .bind(&config.apple_team_id)
        .bind(&config.apple_key_id)
        .bind(&config.apple_private_key_path)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_provider_config(&self, provider_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM oauth_provider_configs WHERE provider_id = $1")
            .bind(normalize_provider_key(provider_id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_auth_settings(&self) -> StoreResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM auth_settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn put_auth_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_settings (key, value, updated_at) VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
