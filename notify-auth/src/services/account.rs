//! Local account flows: registration, password login, password management,
//! password reset and email confirmation.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::email::EmailProvider;
use super::error::{ServiceError, ServiceResult};
use super::session::{SessionManager, SessionTokens};
use super::store::{CredentialStore, StoreError};
use crate::models::{DeviceInfo, User};
use crate::providers::profile::sanitize_username;
use crate::utils::{generate_code, hash_code, Password, SecretHasher};

pub const MIN_PASSWORD_LENGTH: usize = 8;
/// A new reset or confirmation email is refused this soon after the last.
pub const CODE_REQUEST_COOLDOWN_SECONDS: i64 = 60;
pub const RESET_CODE_TTL_HOURS: i64 = 1;
pub const CONFIRMATION_CODE_TTL_HOURS: i64 = 24;

const CODE_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct Registration {
    pub email: String,
    pub username: Option<String>,
    pub password: Password,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

pub struct AccountService {
    store: Arc<dyn CredentialStore>,
    sessions: Arc<SessionManager>,
    hasher: Arc<SecretHasher>,
    email: Arc<dyn EmailProvider>,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        sessions: Arc<SessionManager>,
        hasher: Arc<SecretHasher>,
        email: Arc<dyn EmailProvider>,
    ) -> Self {
        Self {
            store,
            sessions,
            hasher,
            email,
        }
    }

    /// Create a password account, send the confirmation email and log the
    /// new user in.
    #[instrument(skip(self, registration, device, base_url))]
    pub async fn register(
        &self,
        registration: Registration,
        device: &DeviceInfo,
        base_url: &str,
    ) -> ServiceResult<SessionTokens> {
        let email = registration.email.trim().to_lowercase();
        check_password(&registration.password)?;

        if self.store.find_user_by_email(&email).await?.is_some() {
            return Err(ServiceError::Conflict("Email already registered".into()));
        }

        let username = match registration.username.as_deref().map(str::trim) {
            Some(requested) if !requested.is_empty() => {
                let username = sanitize_username(requested);
                if username.is_empty() {
                    return Err(ServiceError::Validation("Invalid username".into()));
                }
                if self.store.find_user_by_username(&username).await?.is_some() {
                    return Err(ServiceError::Conflict("Username already taken".into()));
                }
                username
            }
            _ => self.username_from_email(&email).await?,
        };

        let password_hash = self.hasher.hash_password(&registration.password)?;
        let mut user = User::with_password(email, username, password_hash);
        user.fill_profile_blanks(
            registration.first_name.as_deref(),
            registration.last_name.as_deref(),
            None,
        );
        let code = generate_code(CODE_BYTES);
        user.email_confirmation_code_hash = Some(hash_code(&code));
        user.email_confirmation_requested_at = Some(Utc::now());

        self.store.insert_user(&user).await.map_err(|e| match e {
            StoreError::UniqueViolation(constraint) if constraint.contains("username") => {
                ServiceError::Conflict("Username already taken".into())
            }
            StoreError::UniqueViolation(_) => {
                ServiceError::Conflict("Email already registered".into())
            }
            other => other.into(),
        })?;
        tracing::info!(user_id = %user.id, "User registered");

        if let Err(e) = self
            .email
            .send_confirmation_email(&user.email, &code, base_url)
            .await
        {
            tracing::warn!(user_id = %user.id, error = %e, "Confirmation email failed");
        }

        let device = DeviceInfo {
            login_provider: Some("local".into()),
            ..device.clone()
        };
        self.sessions.start_session(&user, &device).await
    }

    async fn username_from_email(&self, email: &str) -> ServiceResult<String> {
        let local = email.split('@').next().unwrap_or_default();
        let mut base = sanitize_username(local);
        if base.is_empty() {
            base = "user".into();
        }
        if self.store.find_user_by_username(&base).await?.is_none() {
            return Ok(base);
        }
        for _ in 0..4 {
            let candidate = format!("{}-{}", base, generate_code(3));
            if self.store.find_user_by_username(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(ServiceError::Conflict("Username already taken".into()))
    }

    /// Password login by email or username. Every failure is the same
    /// `Unauthenticated`.
    #[instrument(skip_all)]
    pub async fn login(
        &self,
        identifier: &str,
        password: &Password,
        device: &DeviceInfo,
    ) -> ServiceResult<SessionTokens> {
        let identifier = identifier.trim();
        let user = if identifier.contains('@') {
            self.store.find_user_by_email(identifier).await?
        } else {
            self.store.find_user_by_username(identifier).await?
        };

        // Unknown and passwordless accounts pay for a dummy verification so
        // response time does not reveal which identifiers exist.
        let hash = user.as_ref().and_then(|u| u.password_hash.as_deref());
        let verified = self.hasher.verify_password_or_dummy(password, hash);
        let user = match user {
            Some(user) if verified => user,
            Some(user) => {
                tracing::info!(user_id = %user.id, "Password login rejected");
                return Err(ServiceError::Unauthenticated);
            }
            None => return Err(ServiceError::Unauthenticated),
        };

        let device = DeviceInfo {
            login_provider: Some("local".into()),
            ..device.clone()
        };
        let tokens = self.sessions.start_session(&user, &device).await?;
        tracing::info!(user_id = %user.id, session_id = %tokens.session_id, "User logged in");
        Ok(tokens)
    }

    /// Set or change the password. Users that already have one must present
    /// it; passwordless (OAuth-only) users may set one directly.
    #[instrument(skip(self, current, new_password))]
    pub async fn set_password(
        &self,
        user_id: Uuid,
        current: Option<&Password>,
        new_password: &Password,
    ) -> ServiceResult<()> {
        check_password(new_password)?;
        let mut user = self
            .store
            .find_user_by_id(user_id)
            .await?
            .ok_or(ServiceError::Unauthenticated)?;

        if let Some(hash) = user.password_hash.as_deref().filter(|_| user.has_password) {
            let ok = current.is_some_and(|p| self.hasher.verify_password(p, hash));
            if !ok {
                return Err(ServiceError::Forbidden("Current password is incorrect".into()));
            }
        }

        user.set_password_hash(self.hasher.hash_password(new_password)?);
        self.store.update_user(&user).await?;
        tracing::info!("Password updated");
        Ok(())
    }

    /// Always answers `Ok` for unknown addresses.
    #[instrument(skip(self, email, base_url))]
    pub async fn request_password_reset(&self, email: &str, base_url: &str) -> ServiceResult<()> {
        let Some(mut user) = self.store.find_user_by_email(email.trim()).await? else {
            tracing::debug!("Password reset requested for unknown email");
            return Ok(());
        };

        let now = Utc::now();
        throttle(user.reset_requested_at, now)?;

        let code = generate_code(CODE_BYTES);
        user.reset_code_hash = Some(hash_code(&code));
        user.reset_requested_at = Some(now);
        user.updated_at = now;
        self.store.update_user(&user).await?;

        if let Err(e) = self
            .email
            .send_password_reset_email(&user.email, &code, base_url)
            .await
        {
            tracing::warn!(user_id = %user.id, error = %e, "Password reset email failed");
        }
        tracing::info!(user_id = %user.id, "Password reset requested");
        Ok(())
    }

    /// Consume a reset code, set the new password and end every session.
    #[instrument(skip_all)]
    pub async fn reset_password(&self, code: &str, new_password: &Password) -> ServiceResult<()> {
        check_password(new_password)?;
        let mut user = self
            .store
            .find_user_by_reset_code(&hash_code(code))
            .await?
            .ok_or(ServiceError::InvalidOrExpiredCode)?;

        if !issued_within(user.reset_requested_at, Duration::hours(RESET_CODE_TTL_HOURS)) {
            return Err(ServiceError::InvalidOrExpiredCode);
        }

        user.set_password_hash(self.hasher.hash_password(new_password)?);
        user.reset_code_hash = None;
        user.reset_requested_at = None;
        self.store.update_user(&user).await?;

        let revoked = self.sessions.revoke_all(user.id).await?;
        tracing::info!(user_id = %user.id, revoked = revoked, "Password reset completed");
        Ok(())
    }

    #[instrument(skip(self, base_url))]
    pub async fn request_email_confirmation(
        &self,
        user_id: Uuid,
        base_url: &str,
    ) -> ServiceResult<()> {
        let mut user = self
            .store
            .find_user_by_id(user_id)
            .await?
            .ok_or(ServiceError::Unauthenticated)?;
        if user.email_confirmed {
            return Err(ServiceError::Conflict("Email already confirmed".into()));
        }

        let now = Utc::now();
        throttle(user.email_confirmation_requested_at, now)?;

        let code = generate_code(CODE_BYTES);
        user.email_confirmation_code_hash = Some(hash_code(&code));
        user.email_confirmation_requested_at = Some(now);
        user.updated_at = now;
        self.store.update_user(&user).await?;

        self.email
            .send_confirmation_email(&user.email, &code, base_url)
            .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn confirm_email(&self, code: &str) -> ServiceResult<User> {
        let mut user = self
            .store
            .find_user_by_confirmation_code(&hash_code(code))
            .await?
            .ok_or(ServiceError::InvalidOrExpiredCode)?;

        if !issued_within(
            user.email_confirmation_requested_at,
            Duration::hours(CONFIRMATION_CODE_TTL_HOURS),
        ) {
            return Err(ServiceError::InvalidOrExpiredCode);
        }

        user.email_confirmed = true;
        user.email_confirmation_code_hash = None;
        user.email_confirmation_requested_at = None;
        user.updated_at = Utc::now();
        self.store.update_user(&user).await?;
        tracing::info!(user_id = %user.id, "Email confirmed");
        Ok(user)
    }
}

fn check_password(password: &Password) -> ServiceResult<()> {
    if password.as_str().chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ServiceError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

fn throttle(last_requested: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ServiceResult<()> {
    let cooldown = Duration::seconds(CODE_REQUEST_COOLDOWN_SECONDS);
    match last_requested {
        Some(at) if now - at < cooldown => Err(ServiceError::RateLimited {
            retry_after_seconds: Some((cooldown - (now - at)).num_seconds().max(1) as u64),
        }),
        _ => Ok(()),
    }
}

fn issued_within(issued_at: Option<DateTime<Utc>>, ttl: Duration) -> bool {
    issued_at.is_some_and(|at| Utc::now() - at < ttl)
}
