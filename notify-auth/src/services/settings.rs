use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::error::{ServiceError, ServiceResult};
use super::jwt::TokenIssuer;
use super::store::CredentialStore;
use crate::config::JwtSettings;

/// Applies `auth_settings` overrides to the live token issuer.
///
/// The environment values are the base; stored rows win key by key. A row
/// set that does not validate leaves the issuer on its current settings.
pub struct JwtSettingsReloader {
    store: Arc<dyn CredentialStore>,
    issuer: Arc<TokenIssuer>,
    base: JwtSettings,
}

impl JwtSettingsReloader {
    pub fn new(store: Arc<dyn CredentialStore>, issuer: Arc<TokenIssuer>, base: JwtSettings) -> Self {
        Self {
            store,
            issuer,
            base,
        }
    }

    /// Read the overrides once and rotate the issuer if they changed
    /// anything. Returns whether a rotation happened.
    pub async fn reload(&self) -> ServiceResult<bool> {
        let overrides = self.store.list_auth_settings().await?;
        let settings = self
            .base
            .with_overrides(&overrides)
            .map_err(ServiceError::Validation)?;
        Ok(self.issuer.rotate_if_changed(settings))
    }
}

/// Poll the overrides every `period`. The first poll runs immediately so
/// stored secrets replace the environment ones before traffic arrives.
pub fn spawn_jwt_settings_reload(
    reloader: Arc<JwtSettingsReloader>,
    period: Duration,
) -> JoinHandle<()> {
    tracing::info!(period_seconds = period.as_secs(), "JWT settings reload scheduled");

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match reloader.reload().await {
                Ok(true) => tracing::info!("JWT settings reloaded from store"),
                Ok(false) => {}
                Err(ServiceError::Validation(reason)) => {
                    tracing::error!(reason = %reason, "Ignoring invalid JWT settings override");
                }
                Err(e) => tracing::warn!(error = %e, "JWT settings reload failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, SETTING_JWT_REFRESH_EXPIRY_DAYS, SETTING_JWT_SECRET};
    use crate::models::User;
    use crate::services::store::InMemoryCredentialStore;
    use uuid::Uuid;

    fn reloader() -> (Arc<InMemoryCredentialStore>, Arc<TokenIssuer>, JwtSettingsReloader) {
        let store = Arc::new(InMemoryCredentialStore::new());
        let base = AuthConfig::default().jwt;
        let issuer = Arc::new(TokenIssuer::new(base.clone()));
        let reloader = JwtSettingsReloader::new(store.clone(), Arc::clone(&issuer), base);
        (store, issuer, reloader)
    }

    #[tokio::test]
    async fn stored_secret_rotates_the_issuer() -> Result<(), anyhow::Error> {
        let (store, issuer, reloader) = reloader();
        let user = User::new("ada@example.com".into(), "ada".into());
        let before = issuer.issue_token_pair(&user, Uuid::new_v4(), None)?;

        assert!(!reloader.reload().await?);
        assert!(issuer.verify_access(&before.access_token).is_ok());

        store
            .put_auth_setting(SETTING_JWT_SECRET, "rotated-access-secret")
            .await?;
        assert!(reloader.reload().await?);
        assert!(issuer.verify_access(&before.access_token).is_err());
        // Refresh secret was not overridden.
        assert!(issuer.verify_refresh(&before.refresh_token).is_ok());

        let after = issuer.issue_token_pair(&user, Uuid::new_v4(), None)?;
        assert!(!reloader.reload().await?);
        assert!(issuer.verify_access(&after.access_token).is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn invalid_override_keeps_current_settings() -> Result<(), anyhow::Error> {
        let (store, issuer, reloader) = reloader();
        let user = User::new("ada@example.com".into(), "ada".into());
        let pair = issuer.issue_token_pair(&user, Uuid::new_v4(), None)?;

        store
            .put_auth_setting(SETTING_JWT_REFRESH_EXPIRY_DAYS, "-1")
            .await?;
        assert!(matches!(
            reloader.reload().await,
            Err(ServiceError::Validation(_))
        ));
        assert!(issuer.verify_access(&pair.access_token).is_ok());
        assert_eq!(issuer.refresh_ttl(), chrono::Duration::days(7));
        Ok(())
    }
}
