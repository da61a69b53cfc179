//! Live set of OAuth adapters kept in sync with `oauth_provider_configs`.
//!
//! Adapters are never mutated: an update builds a fresh adapter and swaps
//! the `Arc` under the provider key, so a handshake already holding the old
//! one finishes against the config it started with.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use super::{OAuthAdapter, ProviderError};
use crate::models::{provider_config::normalize_provider_key, OAuthProviderConfig, ProviderType};
use crate::services::store::{CredentialStore, StoreError};

const STARTUP_ATTEMPTS: u32 = 3;
const STARTUP_BACKOFF_STEP: Duration = Duration::from_secs(2);

/// Change notification for one provider row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderChange {
    Upserted(String),
    Removed(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePayload {
    op: String,
    provider_id: String,
}

impl ProviderChange {
    /// Parse a `pg_notify` payload: `{"op": "upserted"|"removed", "providerId": ..}`.
    pub fn from_notification(payload: &str) -> Option<Self> {
        let ChangePayload { op, provider_id } = serde_json::from_str(payload).ok()?;
        match op.as_str() {
            "upserted" => Some(ProviderChange::Upserted(provider_id)),
            "removed" => Some(ProviderChange::Removed(provider_id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered,
    Updated,
    Unchanged,
    Unregistered,
    /// Disabled and not registered; nothing to do.
    Skipped,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSummary {
    pub id: String,
    pub name: String,
    pub provider_type: ProviderType,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub active: usize,
    pub failed: usize,
    pub removed: usize,
}

pub struct ProviderRegistry {
    adapters: DashMap<String, Arc<OAuthAdapter>>,
    store: Arc<dyn CredentialStore>,
    http: reqwest::Client,
    builds: AtomicU64,
}

impl ProviderRegistry {
    pub fn new(store: Arc<dyn CredentialStore>, http: reqwest::Client) -> Self {
        Self {
            adapters: DashMap::new(),
            store,
            http,
            builds: AtomicU64::new(0),
        }
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<OAuthAdapter>> {
        self.adapters
            .get(&normalize_provider_key(provider_id))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn list(&self) -> Vec<ProviderSummary> {
        let mut providers: Vec<ProviderSummary> = self
            .adapters
            .iter()
            .map(|entry| ProviderSummary {
                id: entry.key().clone(),
                name: entry.value().config().name.clone(),
                provider_type: entry.value().provider_type(),
            })
            .collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        providers
    }

    /// Number of adapters built since start. A no-op update leaves it alone.
    pub fn adapter_builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    fn build(&self, config: OAuthProviderConfig) -> Result<Arc<OAuthAdapter>, ProviderError> {
        let adapter = OAuthAdapter::from_config(config, self.http.clone())?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(adapter))
    }

    pub fn register_provider(
        &self,
        config: OAuthProviderConfig,
    ) -> Result<RegistrationOutcome, ProviderError> {
        let key = config.key();
        if self.adapters.contains_key(&key) {
            return self.update_provider(config);
        }
        if !config.enabled {
            return Ok(RegistrationOutcome::Skipped);
        }

        let adapter = self.build(config)?;
        self.adapters.insert(key.clone(), adapter);
        tracing::info!(provider = %key, "OAuth provider registered");
        Ok(RegistrationOutcome::Registered)
    }

    pub fn update_provider(
        &self,
        config: OAuthProviderConfig,
    ) -> Result<RegistrationOutcome, ProviderError> {
        let key = config.key();
        if !config.enabled {
            return Ok(if self.unregister_provider(&key) {
                RegistrationOutcome::Unregistered
            } else {
                RegistrationOutcome::Skipped
            });
        }

        let Some(current) = self.get(&key) else {
            return self.register_provider(config);
        };

        let changed = changed_fields(current.config(), &config);
        if changed.is_empty() {
            tracing::debug!(provider = %key, "OAuth provider unchanged");
            return Ok(RegistrationOutcome::Unchanged);
        }

        // On failure the previous adapter stays live.
        let adapter = self.build(config)?;
        self.adapters.insert(key.clone(), adapter);
        tracing::info!(provider = %key, changed = ?changed, "OAuth provider updated");
        Ok(RegistrationOutcome::Updated)
    }

    pub fn unregister_provider(&self, provider_id: &str) -> bool {
        let key = normalize_provider_key(provider_id);
        let removed = self.adapters.remove(&key).is_some();
        if removed {
            tracing::info!(provider = %key, "OAuth provider unregistered");
        }
        removed
    }

    /// Reconcile with the provider table. One bad provider never blocks the
    /// rest; rows that vanished or got disabled are unregistered.
    pub async fn sync_all(&self) -> Result<SyncReport, StoreError> {
        let configs = self.store.list_provider_configs().await?;
        let mut report = SyncReport::default();
        let mut live = HashSet::new();

        for config in configs {
            let key = config.key();
            let enabled = config.enabled;
            match self.update_provider(config) {
                Ok(_) if enabled => {
                    live.insert(key);
                    report.active += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(provider = %key, error = %e, "OAuth provider registration failed");
                    report.failed += 1;
                    // A broken update keeps the previous adapter.
                    if self.adapters.contains_key(&key) {
                        live.insert(key);
                    }
                }
            }
        }

        let stale: Vec<String> = self
            .adapters
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| !live.contains(key))
            .collect();
        for key in stale {
            if self.unregister_provider(&key) {
                report.removed += 1;
            }
        }

        Ok(report)
    }

    pub async fn apply_change(&self, change: ProviderChange) {
        match change {
            ProviderChange::Upserted(id) => match self.store.find_provider_config(&id).await {
                Ok(Some(config)) => {
                    if let Err(e) = self.update_provider(config) {
                        tracing::error!(provider = %id, error = %e, "OAuth provider update failed");
                    }
                }
                Ok(None) => {
                    self.unregister_provider(&id);
                }
                Err(e) => {
                    tracing::error!(provider = %id, error = %e, "Could not load OAuth provider config");
                }
            },
            ProviderChange::Removed(id) => {
                self.unregister_provider(&id);
            }
        }
    }

    /// Initial load with retries, then apply change notifications and a
    /// periodic full resync until the channel closes.
    pub fn start(
        self: Arc<Self>,
        startup_delay: Duration,
        resync_every: Duration,
        mut changes: mpsc::Receiver<ProviderChange>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Let the store finish its own start-up seeding first.
            tokio::time::sleep(startup_delay).await;
            self.initial_sync().await;

            let mut resync = tokio::time::interval_at(
                tokio::time::Instant::now() + resync_every,
                resync_every,
            );
            resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Some(change) => self.apply_change(change).await,
                        None => {
                            tracing::info!("Provider change channel closed; watcher stopping");
                            break;
                        }
                    },
                    _ = resync.tick() => {
                        if let Err(e) = self.sync_all().await {
                            tracing::warn!(error = %e, "Provider resync failed");
                        }
                    }
                }
            }
        })
    }

    async fn initial_sync(&self) {
        for attempt in 1..=STARTUP_ATTEMPTS {
            match self.sync_all().await {
                Ok(report) => {
                    tracing::info!(
                        active = report.active,
                        failed = report.failed,
                        "OAuth providers loaded"
                    );
                    return;
                }
                Err(e) if attempt < STARTUP_ATTEMPTS => {
                    let backoff = STARTUP_BACKOFF_STEP * attempt;
                    tracing::warn!(
                        attempt = attempt,
                        retry_in_seconds = backoff.as_secs(),
                        error = %e,
                        "Loading OAuth providers failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "Loading OAuth providers failed; continuing without OAuth"
                    );
                }
            }
        }
    }
}

/// Settings that differ between the live adapter's config and `next`.
pub fn changed_fields(
    current: &OAuthProviderConfig,
    next: &OAuthProviderConfig,
) -> Vec<&'static str> {
    let mut changed = Vec::new();
    let mut check = |name: &'static str, differs: bool| {
        if differs {
            changed.push(name);
        }
    };
    check("provider_type", current.provider_type != next.provider_type);
    check("name", current.name != next.name);
    check("client_id", current.client_id != next.client_id);
    check("client_secret", current.client_secret != next.client_secret);
    check("callback_url", current.callback_url != next.callback_url);
    check("scopes", current.scopes != next.scopes);
    check("authorization_url", current.authorization_url != next.authorization_url);
    check("token_url", current.token_url != next.token_url);
    check("user_info_url", current.user_info_url != next.user_info_url);
    check("profile_fields", current.profile_fields != next.profile_fields);
    check("apple_team_id", current.apple_team_id != next.apple_team_id);
    check("apple_key_id", current.apple_key_id != next.apple_key_id);
    check(
        "apple_private_key_path",
        current.apple_private_key_path != next.apple_private_key_path,
    );
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::InMemoryCredentialStore;
    use chrono::Utc;

    fn github(secret: &str) -> OAuthProviderConfig {
        OAuthProviderConfig {
            provider_id: "GitHub".into(),
            provider_type: ProviderType::Github,
            name: "GitHub".into(),
            client_id: "client-id".into(),
            client_secret: secret.into(),
            scopes: vec!["read:user".into()],
            callback_url: Some("https://api.example.com/auth/oauth/github/callback".into()),
            enabled: true,
            authorization_url: None,
            token_url: None,
            user_info_url: None,
            profile_fields: None,
            apple_team_id: None,
            apple_key_id: None,
            apple_private_key_path: None,
            updated_at: Utc::now(),
        }
    }

    fn registry() -> (ProviderRegistry, Arc<dyn CredentialStore>) {
        let store: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::new());
        (
            ProviderRegistry::new(Arc::clone(&store), reqwest::Client::new()),
            store,
        )
    }

    #[test]
    fn notification_payloads() {
        assert_eq!(
            ProviderChange::from_notification(r#"{"op":"upserted","providerId":"github"}"#),
            Some(ProviderChange::Upserted("github".into()))
        );
        assert_eq!(
            ProviderChange::from_notification(r#"{"op":"removed","providerId":"acme"}"#),
            Some(ProviderChange::Removed("acme".into()))
        );
        assert_eq!(ProviderChange::from_notification(r#"{"op":"truncate"}"#), None);
        assert_eq!(ProviderChange::from_notification("garbage"), None);
    }

    #[test]
    fn noop_update_keeps_adapter() -> Result<(), ProviderError> {
        let (registry, _) = registry();
        assert_eq!(
            registry.register_provider(github("s1"))?,
            RegistrationOutcome::Registered
        );
        let before = registry.get("github").map(|a| Arc::as_ptr(&a));

        // Only the timestamp differs.
        assert_eq!(
            registry.update_provider(github("s1"))?,
            RegistrationOutcome::Unchanged
        );
        assert_eq!(registry.adapter_builds(), 1);
        assert_eq!(registry.get("github").map(|a| Arc::as_ptr(&a)), before);
        Ok(())
    }

    #[test]
    fn secret_change_swaps_adapter() -> Result<(), ProviderError> {
        let (registry, _) = registry();
        registry.register_provider(github("s1"))?;

        assert_eq!(
            registry.update_provider(github("s2"))?,
            RegistrationOutcome::Updated
        );
        assert_eq!(registry.adapter_builds(), 2);
        assert_eq!(
            registry.get("GITHUB").map(|a| a.config().client_secret.clone()),
            Some("s2".to_string())
        );
        Ok(())
    }

    #[test]
    fn duplicate_registration_becomes_update() -> Result<(), ProviderError> {
        let (registry, _) = registry();
        registry.register_provider(github("s1"))?;
        assert_eq!(
            registry.register_provider(github("s1"))?,
            RegistrationOutcome::Unchanged
        );
        Ok(())
    }

    #[test]
    fn disabling_unregisters() -> Result<(), ProviderError> {
        let (registry, _) = registry();
        registry.register_provider(github("s1"))?;

        let mut disabled = github("s1");
        disabled.enabled = false;
        assert_eq!(
            registry.update_provider(disabled)?,
            RegistrationOutcome::Unregistered
        );
        assert!(registry.get("github").is_none());
        assert!(!registry.unregister_provider("github"));
        Ok(())
    }

    #[test]
    fn failed_update_keeps_previous_adapter() -> Result<(), ProviderError> {
        let (registry, _) = registry();
        registry.register_provider(github("s1"))?;

        assert!(registry.update_provider(github("")).is_err());
        assert_eq!(
            registry.get("github").map(|a| a.config().client_secret.clone()),
            Some("s1".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn sync_isolates_failures_and_drops_deleted_rows() -> Result<(), anyhow::Error> {
        let (registry, store) = registry();

        let mut google = github("g");
        google.provider_id = "google".into();
        google.provider_type = ProviderType::Google;
        let mut broken = github("");
        broken.provider_id = "broken".into();

        store.upsert_provider_config(&github("s1")).await?;
        store.upsert_provider_config(&google).await?;
        store.upsert_provider_config(&broken).await?;

        let report = registry.sync_all().await?;
        assert_eq!(report.active, 2);
        assert_eq!(report.failed, 1);
        assert!(registry.get("broken").is_none());

        store.delete_provider_config("google").await?;
        let report = registry.sync_all().await?;
        assert_eq!(report.removed, 1);
        assert!(registry.get("google").is_none());
        assert!(registry.get("github").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn change_notifications_are_applied() -> Result<(), anyhow::Error> {
        let (registry, store) = registry();
        store.upsert_provider_config(&github("s1")).await?;

        registry
            .apply_change(ProviderChange::Upserted("github".into()))
            .await;
        assert!(registry.get("github").is_some());

        registry
            .apply_change(ProviderChange::Removed("github".into()))
            .await;
        assert!(registry.get("github").is_none());
        Ok(())
    }
}
