//! Credential store: persistence seam for users, identities, sessions,
//! access tokens and provider configuration.
//!
//! Every method that changes state conditionally (rotation, revocation,
//! exchange-code redemption) is a single round trip so concurrent callers
//! are serialized by the backend rather than by the service layer.

mod memory;
mod postgres;

pub use memory::InMemoryCredentialStore;
pub use postgres::PgCredentialStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    OAuthProviderConfig, ProviderType, User, UserAccessToken, UserIdentity, UserSession,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if db_err.is_unique_violation() {
                let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                return StoreError::UniqueViolation(constraint);
            }
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of [`CredentialStore::delete_identity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRemoval {
    Removed,
    NotFound,
    /// Refused: it is the only way a passwordless user can sign in.
    LastSignInMethod,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn health_check(&self) -> StoreResult<()>;

    // ==================== Users ====================

    async fn find_user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>>;
    /// Case-insensitive.
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    /// Case-insensitive.
    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>>;
    async fn find_user_by_reset_code(&self, code_hash: &str) -> StoreResult<Option<User>>;
    async fn find_user_by_confirmation_code(&self, code_hash: &str)
        -> StoreResult<Option<User>>;
    async fn insert_user(&self, user: &User) -> StoreResult<()>;
    async fn update_user(&self, user: &User) -> StoreResult<()>;

    // ==================== Identities ====================

    async fn find_identity_by_provider_user_id(
        &self,
        provider: ProviderType,
        provider_user_id: &str,
    ) -> StoreResult<Option<UserIdentity>>;
    async fn find_identity_by_email(
        &self,
        provider: ProviderType,
        email: &str,
    ) -> StoreResult<Option<UserIdentity>>;
    async fn find_identity_for_user(
        &self,
        user_id: Uuid,
        provider: ProviderType,
    ) -> StoreResult<Option<UserIdentity>>;
    async fn list_identities(&self, user_id: Uuid) -> StoreResult<Vec<UserIdentity>>;
    async fn insert_identity(&self, identity: &UserIdentity) -> StoreResult<()>;
    async fn update_identity(&self, identity: &UserIdentity) -> StoreResult<()>;
    /// Delete the user's identity for `provider` unless the user has no
    /// password and no other identity. Check and delete are one critical
    /// section, so concurrent removals cannot both pass the check.
    async fn delete_identity(
        &self,
        user_id: Uuid,
        provider: ProviderType,
    ) -> StoreResult<IdentityRemoval>;

    // ==================== Sessions ====================

    async fn insert_session(&self, session: &UserSession) -> StoreResult<()>;
    /// Overwrites the row with the same id; false when it does not exist.
    async fn update_session(&self, session: &UserSession) -> StoreResult<bool>;
    async fn find_session(&self, session_id: Uuid) -> StoreResult<Option<UserSession>>;
    async fn find_session_by_token_id(&self, token_id: &str)
        -> StoreResult<Option<UserSession>>;
    async fn list_active_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<UserSession>>;
    /// Swap `token_id` from `current` to `next` only while the session is
    /// active, unexpired and still on `current`.
    async fn rotate_session_token(
        &self,
        session_id: Uuid,
        current_token_id: &str,
        next_token_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UserSession>>;
    async fn deactivate_session(&self, user_id: Uuid, session_id: Uuid) -> StoreResult<bool>;
    async fn deactivate_session_by_token_id(&self, token_id: &str) -> StoreResult<bool>;
    async fn deactivate_sessions_except(
        &self,
        user_id: Uuid,
        keep_token_id: &str,
    ) -> StoreResult<u64>;
    async fn deactivate_user_sessions(&self, user_id: Uuid) -> StoreResult<u64>;
    async fn set_exchange_code(
        &self,
        session_id: Uuid,
        code_hash: &str,
        requested_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
    /// Atomically clear and return the session holding `code_hash` when the
    /// code was requested at or after `not_before` (and belongs to
    /// `session_id` when given). At most one caller wins per code.
    async fn take_exchange_code(
        &self,
        code_hash: &str,
        session_id: Option<Uuid>,
        not_before: DateTime<Utc>,
    ) -> StoreResult<Option<UserSession>>;
    /// Clear the code only if it is still the one given.
    async fn clear_exchange_code(&self, session_id: Uuid, code_hash: &str) -> StoreResult<bool>;
    async fn delete_sessions_inactive_since(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    // ==================== Access tokens ====================

    async fn insert_access_token(&self, token: &UserAccessToken) -> StoreResult<()>;
    async fn list_access_tokens(&self, user_id: Uuid) -> StoreResult<Vec<UserAccessToken>>;
    async fn list_all_access_tokens(&self) -> StoreResult<Vec<UserAccessToken>>;
    async fn find_access_token(
        &self,
        user_id: Uuid,
        token_id: Uuid,
    ) -> StoreResult<Option<UserAccessToken>>;
    async fn delete_access_token(&self, user_id: Uuid, token_id: Uuid) -> StoreResult<bool>;
    async fn delete_watch_tokens(&self, user_id: Uuid) -> StoreResult<u64>;
    async fn touch_access_token(&self, token_id: Uuid, now: DateTime<Utc>) -> StoreResult<()>;

    // ==================== Provider configuration ====================

    async fn list_provider_configs(&self) -> StoreResult<Vec<OAuthProviderConfig>>;
    async fn find_provider_config(
        &self,
        provider_id: &str,
    ) -> StoreResult<Option<OAuthProviderConfig>>;
    async fn upsert_provider_config(&self, config: &OAuthProviderConfig) -> StoreResult<()>;
    async fn delete_provider_config(&self, provider_id: &str) -> StoreResult<bool>;

    // ==================== Runtime settings ====================

    /// Operator overrides from `auth_settings`, keyed by setting name.
    async fn list_auth_settings(&self) -> StoreResult<HashMap<String, String>>;
    async fn put_auth_setting(&self, key: &str, value: &str) -> StoreResult<()>;
}
