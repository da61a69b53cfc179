//! Identity linking: resolve a normalized provider profile to a local user,
//! creating or merging accounts and attaching `UserIdentity` rows.

use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::email::EmailProvider;
use super::error::{ServiceError, ServiceResult};
use super::store::{CredentialStore, IdentityRemoval, StoreError};
use crate::models::{IdentityResponse, ProviderType, User, UserIdentity};
use crate::providers::{derive_username, NormalizedProfile};
use crate::utils::generate_code;

const USERNAME_ATTEMPTS: usize = 5;

pub struct IdentityLinker {
    store: Arc<dyn CredentialStore>,
    email: Arc<dyn EmailProvider>,
}

impl IdentityLinker {
    pub fn new(store: Arc<dyn CredentialStore>, email: Arc<dyn EmailProvider>) -> Self {
        Self { store, email }
    }

    /// Resolve `profile` to a user. With `current_user_id` this is a connect
    /// flow: the identity is attached to that user or the call fails with
    /// `Conflict` when another account already owns it.
    #[instrument(skip(self, profile), fields(provider = %provider))]
    pub async fn find_or_create_user_from_provider(
        &self,
        provider: ProviderType,
        profile: &NormalizedProfile,
        current_user_id: Option<Uuid>,
    ) -> ServiceResult<User> {
        if profile.id.trim().is_empty() {
            return Err(ServiceError::Unauthenticated);
        }
        let email = normalized_email(profile);

        if let Some(identity) = self.find_identity(provider, profile, email.as_deref()).await? {
            if current_user_id.is_some_and(|current| current != identity.user_id) {
                tracing::warn!(
                    owner_id = %identity.user_id,
                    "Identity already linked to another account"
                );
                return Err(ServiceError::Conflict(format!(
                    "This {} account is already linked to another user",
                    provider
                )));
            }
            let mut user = self
                .store
                .find_user_by_id(identity.user_id)
                .await?
                .ok_or(ServiceError::Unauthenticated)?;
            self.refresh_identity(identity, profile, email.as_deref()).await;
            self.merge_profile(&mut user, profile).await;
            return Ok(user);
        }

        if let Some(user_id) = current_user_id {
            return self.connect(user_id, provider, profile, email).await;
        }

        let mut user = match self.match_existing_user(profile, email.as_deref()).await? {
            Some(user) => user,
            None => self.create_user(provider, profile, email.as_deref()).await?,
        };
        self.link(user.id, provider, profile, email.as_deref()).await?;
        self.merge_profile(&mut user, profile).await;
        Ok(user)
    }

    async fn find_identity(
        &self,
        provider: ProviderType,
        profile: &NormalizedProfile,
        email: Option<&str>,
    ) -> ServiceResult<Option<UserIdentity>> {
        if let Some(identity) = self
            .store
            .find_identity_by_provider_user_id(provider, &profile.id)
            .await?
        {
            return Ok(Some(identity));
        }
        match email {
            Some(email) if profile.email_verified => {
                Ok(self.store.find_identity_by_email(provider, email).await?)
            }
            _ => Ok(None),
        }
    }

    async fn connect(
        &self,
        user_id: Uuid,
        provider: ProviderType,
        profile: &NormalizedProfile,
        email: Option<String>,
    ) -> ServiceResult<User> {
        let mut user = self
            .store
            .find_user_by_id(user_id)
            .await?
            .ok_or(ServiceError::Unauthenticated)?;

        if self
            .store
            .find_identity_for_user(user_id, provider)
            .await?
            .is_some()
        {
            return Err(ServiceError::Conflict(format!(
                "A {} account is already connected",
                provider
            )));
        }

        self.link(user_id, provider, profile, email.as_deref()).await?;
        self.merge_profile(&mut user, profile).await;
        tracing::info!(user_id = %user_id, "Identity connected");
        Ok(user)
    }

    /// Email first, and only a verified one; the derived username is only
    /// trusted when the provider gave no email at all. An unverified email
    /// never resolves to an existing account.
    async fn match_existing_user(
        &self,
        profile: &NormalizedProfile,
        email: Option<&str>,
    ) -> ServiceResult<Option<User>> {
        match email {
            Some(email) if profile.email_verified => {
                Ok(self.store.find_user_by_email(email).await?)
            }
            Some(_) => Ok(None),
            None => match derive_username(profile) {
                Some(username) => Ok(self.store.find_user_by_username(&username).await?),
                None => Ok(None),
            },
        }
    }

    async fn create_user(
        &self,
        provider: ProviderType,
        profile: &NormalizedProfile,
        email: Option<&str>,
    ) -> ServiceResult<User> {
        let base = derive_username(profile)
            .unwrap_or_else(|| format!("{}-{}", provider, generate_code(4)));
        // An unverified address already owned by someone else is not ours to take.
        let mut email = match email {
            Some(address)
                if !profile.email_verified
                    && self.store.find_user_by_email(address).await?.is_some() =>
            {
                None
            }
            other => other,
        };

        for attempt in 0..USERNAME_ATTEMPTS {
            let username = if attempt == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, generate_code(3))
            };
            if self.store.find_user_by_username(&username).await?.is_some() {
                continue;
            }

            let address = email
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}@{}.users.noreply", username, provider));
            let mut user = User::new(address, username);
            user.email_confirmed = email.is_none() || profile.email_verified;
            user.fill_profile_blanks(
                profile.first_name.as_deref(),
                profile.last_name.as_deref(),
                profile.avatar_url.as_deref(),
            );

            match self.store.insert_user(&user).await {
                Ok(()) => {
                    tracing::info!(user_id = %user.id, "User created from provider profile");
                    if let Err(e) = self.email.send_welcome_email(&user.email, &user.username).await {
                        tracing::warn!(user_id = %user.id, error = %e, "Welcome email failed");
                    }
                    return Ok(user);
                }
                // Lost a race on a verified email: the other request's user wins.
                Err(StoreError::UniqueViolation(constraint))
                    if constraint.contains("email") && profile.email_verified =>
                {
                    if let Some(existing) = self.store.find_user_by_email(&user.email).await? {
                        return Ok(existing);
                    }
                    return Err(ServiceError::Conflict("Email already registered".into()));
                }
                Err(StoreError::UniqueViolation(constraint)) if constraint.contains("email") => {
                    email = None;
                    continue;
                }
                Err(StoreError::UniqueViolation(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServiceError::Conflict(
            "Could not allocate a username for this account".into(),
        ))
    }

    /// Insert the identity row. A unique violation from a concurrent link of
    /// the same account to the same user is treated as already done.
    async fn link(
        &self,
        user_id: Uuid,
        provider: ProviderType,
        profile: &NormalizedProfile,
        email: Option<&str>,
    ) -> ServiceResult<()> {
        let mut identity = UserIdentity::new(
            user_id,
            provider,
            profile.id.clone(),
            email.map(str::to_string),
            profile.avatar_url.clone(),
        );
        identity.metadata = serde_json::to_string(profile).ok();

        match self.store.insert_identity(&identity).await {
            Ok(()) => {
                tracing::info!(user_id = %user_id, "Identity linked");
                Ok(())
            }
            Err(StoreError::UniqueViolation(constraint)) => {
                let existing = self
                    .store
                    .find_identity_by_provider_user_id(provider, &profile.id)
                    .await?;
                match existing {
                    Some(existing) if existing.user_id == user_id => {
                        tracing::debug!(user_id = %user_id, "Identity already linked");
                        Ok(())
                    }
                    _ => {
                        tracing::warn!(constraint = %constraint, "Identity link rejected");
                        Err(ServiceError::Conflict(format!(
                            "This {} account is already linked to another user",
                            provider
                        )))
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best effort: a failed bookkeeping write must not fail the login.
    async fn refresh_identity(
        &self,
        mut identity: UserIdentity,
        profile: &NormalizedProfile,
        email: Option<&str>,
    ) {
        let mut changed = identity.refresh_cache(email, profile.avatar_url.as_deref());
        if identity.provider_user_id != profile.id {
            identity.provider_user_id = profile.id.clone();
            identity.updated_at = Utc::now();
            changed = true;
        }
        if !changed {
            return;
        }
        identity.metadata = serde_json::to_string(profile).ok();
        if let Err(e) = self.store.update_identity(&identity).await {
            tracing::warn!(identity_id = %identity.id, error = %e, "Identity refresh failed");
        }
    }

    /// Fill blank profile fields and promote email confirmation. Never
    /// overwrites names or avatar the user already has.
    async fn merge_profile(&self, user: &mut User, profile: &NormalizedProfile) {
        let mut changed = user.fill_profile_blanks(
            profile.first_name.as_deref(),
            profile.last_name.as_deref(),
            profile.avatar_url.as_deref(),
        );
        if profile.email_verified && profile.email.is_some() && !user.email_confirmed {
            user.email_confirmed = true;
            user.updated_at = Utc::now();
            changed = true;
        }
        if !changed {
            return;
        }
        if let Err(e) = self.store.update_user(user).await {
            tracing::warn!(user_id = %user.id, error = %e, "Profile merge failed");
        }
    }

    pub async fn list_identities(&self, user_id: Uuid) -> ServiceResult<Vec<IdentityResponse>> {
        Ok(self
            .store
            .list_identities(user_id)
            .await?
            .into_iter()
            .map(IdentityResponse::from)
            .collect())
    }

    /// Remove the user's identity for `provider`. The last identity of a
    /// passwordless user cannot be removed.
    #[instrument(skip(self), fields(user_id = %user_id, provider = %provider))]
    pub async fn disconnect_identity(
        &self,
        user_id: Uuid,
        provider: ProviderType,
    ) -> ServiceResult<()> {
        match self.store.delete_identity(user_id, provider).await? {
            IdentityRemoval::Removed => {}
            IdentityRemoval::NotFound => {
                return Err(ServiceError::NotFound("Identity not found".into()));
            }
            IdentityRemoval::LastSignInMethod => {
                return Err(ServiceError::Forbidden(
                    "Set a password before disconnecting your last sign-in method".into(),
                ));
            }
        }
        tracing::info!("Identity disconnected");
        Ok(())
    }
}

fn normalized_email(profile: &NormalizedProfile) -> Option<String> {
    profile
        .email
        .as_deref()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| e.contains('@'))
}
