//! In-process credential store for tests and local development.
//!
//! All tables sit behind one mutex, so each method (including the
//! conditional updates) observes and mutates a consistent snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::{CredentialStore, IdentityRemoval, StoreError, StoreResult};
use crate::models::{
    provider_config::normalize_provider_key, OAuthProviderConfig, ProviderType, User,
    UserAccessToken, UserIdentity, UserSession, WATCH_SCOPE,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    identities: HashMap<Uuid, UserIdentity>,
    sessions: HashMap<Uuid, UserSession>,
    access_tokens: HashMap<Uuid, UserAccessToken>,
    providers: HashMap<String, OAuthProviderConfig>,
    settings: HashMap<String, String>,
}

impl Tables {
    fn check_user_unique(&self, user: &User) -> StoreResult<()> {
        for other in self.users.values().filter(|u| u.id != user.id) {
            if other.email.eq_ignore_ascii_case(&user.email) {
                return Err(StoreError::UniqueViolation("users_email_key".into()));
            }
            if other.username.eq_ignore_ascii_case(&user.username) {
                return Err(StoreError::UniqueViolation("users_username_key".into()));
            }
        }
        Ok(())
    }

    fn check_identity_unique(&self, identity: &UserIdentity) -> StoreResult<()> {
        for other in self.identities.values().filter(|i| i.id != identity.id) {
            if other.provider_type != identity.provider_type {
                continue;
            }
            if other.user_id == identity.user_id {
                return Err(StoreError::UniqueViolation(
                    "user_identities_user_provider_key".into(),
                ));
            }
            if other.provider_user_id == identity.provider_user_id {
                return Err(StoreError::UniqueViolation(
                    "user_identities_provider_subject_key".into(),
                ));
            }
        }
        Ok(())
    }
}

fn codes_match(stored: Option<&str>, candidate: &str) -> bool {
    stored.is_some_and(|s| bool::from(s.as_bytes().ct_eq(candidate.as_bytes())))
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    tables: Mutex<Tables>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| StoreError::Backend(format!("In-memory store mutex poisoned: {}", e)))
    }

    fn find_user<F>(&self, pred: F) -> StoreResult<Option<User>>
    where
        F: Fn(&User) -> bool,
    {
        Ok(self.tables()?.users.values().find(|u| pred(u)).cloned())
    }

    fn find_identity<F>(&self, pred: F) -> StoreResult<Option<UserIdentity>>
    where
        F: Fn(&UserIdentity) -> bool,
    {
        Ok(self.tables()?.identities.values().find(|i| pred(i)).cloned())
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn health_check(&self) -> StoreResult<()> {
        self.tables().map(|_| ())
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.tables()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        self.find_user(|u| u.email.eq_ignore_ascii_case(email))
    }

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        self.find_user(|u| u.username.eq_ignore_ascii_case(username))
    }

    async fn find_user_by_reset_code(&self, code_hash: &str) -> StoreResult<Option<User>> {
        self.find_user(|u| codes_match(u.reset_code_hash.as_deref(), code_hash))
    }

    async fn find_user_by_confirmation_code(
        &self,
        code_hash: &str,
    ) -> StoreResult<Option<User>> {
        self.find_user(|u| codes_match(u.email_confirmation_code_hash.as_deref(), code_hash))
    }

    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        let mut tables = self.tables()?;
        if tables.users.contains_key(&user.id) {
            return Err(StoreError::UniqueViolation("users_pkey".into()));
        }
        tables.check_user_unique(user)?;
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_user(&self, user: &User) -> StoreResult<()> {
        let mut tables = self.tables()?;
        tables.check_user_unique(user)?;
        if let Some(slot) = tables.users.get_mut(&user.id) {
            *slot = user.clone();
        }
        Ok(())
    }

    async fn find_identity_by_provider_user_id(
        &self,
        provider: ProviderType,
        provider_user_id: &str,
    ) -> StoreResult<Option<UserIdentity>> {
        self.find_identity(|i| i.provider_type == provider && i.provider_user_id == provider_user_id)
    }

    async fn find_identity_by_email(
        &self,
        provider: ProviderType,
        email: &str,
    ) -> StoreResult<Option<UserIdentity>> {
        self.find_identity(|i| {
            i.provider_type == provider
                && i.email.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(email))
        })
    }

    async fn find_identity_for_user(
        &self,
        user_id: Uuid,
        provider: ProviderType,
    ) -> StoreResult<Option<UserIdentity>> {
        self.find_identity(|i| i.user_id == user_id && i.provider_type == provider)
    }

    async fn list_identities(&self, user_id: Uuid) -> StoreResult<Vec<UserIdentity>> {
        let mut identities: Vec<UserIdentity> = self
            .tables()?
            .identities
            .values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect();
        identities.sort_by_key(|i| i.created_at);
        Ok(identities)
    }

    async fn insert_identity(&self, identity: &UserIdentity) -> StoreResult<()> {
        let mut tables = self.tables()?;
        tables.check_identity_unique(identity)?;
        tables.identities.insert(identity.id, identity.clone());
        Ok(())
    }

    async fn update_identity(&self, identity: &UserIdentity) -> StoreResult<()> {
        let mut tables = self.tables()?;
        tables.check_identity_unique(identity)?;
        if let Some(slot) = tables.identities.get_mut(&identity.id) {
            *slot = identity.clone();
        }
        Ok(())
    }

    async fn delete_identity(
        &self,
        user_id: Uuid,
        provider: ProviderType,
    ) -> StoreResult<IdentityRemoval> {
        let mut tables = self.tables()?;
        let Some(has_password) = tables.users.get(&user_id).map(|u| u.has_password) else {
            return Ok(IdentityRemoval::NotFound);
        };
        let linked: Vec<(Uuid, ProviderType)> = tables
            .identities
            .values()
            .filter(|i| i.user_id == user_id)
            .map(|i| (i.id, i.provider_type))
            .collect();
        let Some(&(identity_id, _)) = linked.iter().find(|(_, p)| *p == provider) else {
            return Ok(IdentityRemoval::NotFound);
        };
        if !has_password && linked.len() <= 1 {
            return Ok(IdentityRemoval::LastSignInMethod);
        }
        tables.identities.remove(&identity_id);
        Ok(IdentityRemoval::Removed)
    }

    async fn insert_session(&self, session: &UserSession) -> StoreResult<()> {
        let mut tables = self.tables()?;
        if tables.sessions.contains_key(&session.id) {
            return Err(StoreError::UniqueViolation("user_sessions_pkey".into()));
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &UserSession) -> StoreResult<bool> {
        let mut tables = self.tables()?;
        match tables.sessions.get_mut(&session.id) {
            Some(slot) => {
                *slot = session.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_session(&self, session_id: Uuid) -> StoreResult<Option<UserSession>> {
        Ok(self.tables()?.sessions.get(&session_id).cloned())
    }

    async fn find_session_by_token_id(
        &self,
        token_id: &str,
    ) -> StoreResult<Option<UserSession>> {
        Ok(self
            .tables()?
            .sessions
            .values()
            .find(|s| s.token_id == token_id)
            .cloned())
    }

    async fn list_active_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<UserSession>> {
        let mut sessions: Vec<UserSession> = self
            .tables()?
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active && s.expires_at > now)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    async fn rotate_session_token(
        &self,
        session_id: Uuid,
        current_token_id: &str,
        next_token_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UserSession>> {
        let mut tables = self.tables()?;
        let Some(session) = tables.sessions.get_mut(&session_id) else {
            return Ok(None);
        };
        if !session.is_active || session.expires_at <= now || session.token_id != current_token_id
        {
            return Ok(None);
        }
        session.token_id = next_token_id.to_string();
        session.last_activity = now;
        session.updated_at = now;
        Ok(Some(session.clone()))
    }

    async fn deactivate_session(&self, user_id: Uuid, session_id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables()?;
        match tables.sessions.get_mut(&session_id) {
            Some(s) if s.user_id == user_id && s.is_active => {
                s.is_active = false;
                s.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate_session_by_token_id(&self, token_id: &str) -> StoreResult<bool> {
        let mut tables = self.tables()?;
        match tables
            .sessions
            .values_mut()
            .find(|s| s.token_id == token_id && s.is_active)
        {
            Some(s) => {
                s.is_active = false;
                s.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deactivate_sessions_except(
        &self,
        user_id: Uuid,
        keep_token_id: &str,
    ) -> StoreResult<u64> {
        let mut tables = self.tables()?;
        let now = Utc::now();
        let mut affected = 0;
        for s in tables.sessions.values_mut() {
            if s.user_id == user_id && s.is_active && s.token_id != keep_token_id {
                s.is_active = false;
                s.updated_at = now;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn deactivate_user_sessions(&self, user_id: Uuid) -> StoreResult<u64> {
        let mut tables = self.tables()?;
        let now = Utc::now();
        let mut affected = 0;
        for s in tables.sessions.values_mut() {
            if s.user_id == user_id && s.is_active {
                s.is_active = false;
                s.updated_at = now;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn set_exchange_code(
        &self,
        session_id: Uuid,
        code_hash: &str,
        requested_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables()?;
        match tables.sessions.get_mut(&session_id) {
            Some(s) if s.is_active => {
                s.exchange_code_hash = Some(code_hash.to_string());
                s.exchange_code_requested_at = Some(requested_at);
                s.updated_at = requested_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn take_exchange_code(
        &self,
        code_hash: &str,
        session_id: Option<Uuid>,
        not_before: DateTime<Utc>,
    ) -> StoreResult<Option<UserSession>> {
        let mut tables = self.tables()?;
        let now = Utc::now();
        let Some(session) = tables.sessions.values_mut().find(|s| {
            codes_match(s.exchange_code_hash.as_deref(), code_hash)
                && session_id.map_or(true, |id| id == s.id)
                && s.exchange_code_requested_at.is_some_and(|at| at >= not_before)
                && s.is_active
                && s.expires_at > now
        }) else {
            return Ok(None);
        };
        session.exchange_code_hash = None;
        session.exchange_code_requested_at = None;
        session.last_activity = now;
        session.updated_at = now;
        Ok(Some(session.clone()))
    }

    async fn clear_exchange_code(&self, session_id: Uuid, code_hash: &str) -> StoreResult<bool> {
        let mut tables = self.tables()?;
        match tables.sessions.get_mut(&session_id) {
            Some(s) if codes_match(s.exchange_code_hash.as_deref(), code_hash) => {
                s.exchange_code_hash = None;
                s.exchange_code_requested_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_sessions_inactive_since(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables()?;
        let before = tables.sessions.len();
        tables.sessions.retain(|_, s| s.last_activity >= cutoff);
        Ok((before - tables.sessions.len()) as u64)
    }

    async fn insert_access_token(&self, token: &UserAccessToken) -> StoreResult<()> {
        let mut tables = self.tables()?;
        if token.is_watch_token()
            && tables
                .access_tokens
                .values()
                .any(|t| t.user_id == token.user_id && t.is_watch_token())
        {
            return Err(StoreError::UniqueViolation(
                "user_access_tokens_one_watch_per_user".into(),
            ));
        }
        tables.access_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn list_access_tokens(&self, user_id: Uuid) -> StoreResult<Vec<UserAccessToken>> {
        let mut tokens: Vec<UserAccessToken> = self
            .tables()?
            .access_tokens
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tokens.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tokens)
    }

    async fn list_all_access_tokens(&self) -> StoreResult<Vec<UserAccessToken>> {
        Ok(self.tables()?.access_tokens.values().cloned().collect())
    }

    async fn find_access_token(
        &self,
        user_id: Uuid,
        token_id: Uuid,
    ) -> StoreResult<Option<UserAccessToken>> {
        Ok(self
            .tables()?
            .access_tokens
            .get(&token_id)
            .filter(|t| t.user_id == user_id)
            .cloned())
    }

    async fn delete_access_token(&self, user_id: Uuid, token_id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables()?;
        let owned = tables
            .access_tokens
            .get(&token_id)
            .is_some_and(|t| t.user_id == user_id);
        if owned {
            tables.access_tokens.remove(&token_id);
        }
        Ok(owned)
    }

    async fn delete_watch_tokens(&self, user_id: Uuid) -> StoreResult<u64> {
        let mut tables = self.tables()?;
        let before = tables.access_tokens.len();
        tables
            .access_tokens
            .retain(|_, t| !(t.user_id == user_id && t.scopes.iter().any(|s| s == WATCH_SCOPE)));
        Ok((before - tables.access_tokens.len()) as u64)
    }

    async fn touch_access_token(&self, token_id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        if let Some(t) = self.tables()?.access_tokens.get_mut(&token_id) {
            t.last_used = Some(now);
        }
        Ok(())
    }

    async fn list_provider_configs(&self) -> StoreResult<Vec<OAuthProviderConfig>> {
        let mut configs: Vec<OAuthProviderConfig> =
            self.tables()?.providers.values().cloned().collect();
        configs.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        Ok(configs)
    }

    async fn find_provider_config(
        &self,
        provider_id: &str,
    ) -> StoreResult<Option<OAuthProviderConfig>> {
        Ok(self
            .tables()?
            .providers
            .get(&normalize_provider_key(provider_id))
            .cloned())
    }

    async fn upsert_provider_config(&self, config: &OAuthProviderConfig) -> StoreResult<()> {
        self.tables()?
            .providers
            .insert(config.key(), config.clone());
        Ok(())
    }

    async fn delete_provider_config(&self, provider_id: &str) -> StoreResult<bool> {
        Ok(self
            .tables()?
            .providers
            .remove(&normalize_provider_key(provider_id))
            .is_some())
    }

    async fn list_auth_settings(&self) -> StoreResult<HashMap<String, String>> {
        Ok(self.tables()?.settings.clone())
    }

    async fn put_auth_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        self.tables()?
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
