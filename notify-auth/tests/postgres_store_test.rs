//! `PgCredentialStore` against a real database.
//!
//! Run with `TEST_DATABASE_URL` pointing at a scratch Postgres and
//! `cargo test -- --ignored`.

use notify_auth::config::SETTING_JWT_SECRET;
use notify_auth::models::{ProviderType, User, UserIdentity};
use notify_auth::services::{CredentialStore, IdentityRemoval, PgCredentialStore};
use std::sync::Arc;
use uuid::Uuid;

async fn store() -> Result<PgCredentialStore, anyhow::Error> {
    let url = std::env::var("TEST_DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("TEST_DATABASE_URL must be set"))?;
    let store = PgCredentialStore::connect(&url, 4).await?;
    store.run_migrations().await?;
    Ok(store)
}

async fn oauth_only_user(
    store: &PgCredentialStore,
    providers: &[ProviderType],
) -> Result<User, anyhow::Error> {
    let tag = Uuid::new_v4().simple().to_string();
    let user = User::new(format!("{}@example.com", tag), tag.clone());
    store.insert_user(&user).await?;
    for provider in providers {
        let external_id = format!("{}-{}", provider, tag);
        let identity = UserIdentity::new(user.id, *provider, external_id, None, None);
        store.insert_identity(&identity).await?;
    }
    Ok(user)
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn provider_type_round_trips_as_text() -> Result<(), anyhow::Error> {
    let store = store().await?;
    let user = oauth_only_user(&store, &[ProviderType::Discord]).await?;

    let stored: String =
        sqlx::query_scalar("SELECT provider_type FROM user_identities WHERE user_id = $1")
            .bind(user.id)
            .fetch_one(store.pool())
            .await?;
    assert_eq!(stored, "discord");

    let found = store
        .find_identity_for_user(user.id, ProviderType::Discord)
        .await?;
    assert_eq!(found.map(|i| i.provider_type), Some(ProviderType::Discord));
    Ok(())
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn provider_rows_written_by_hand_are_folded() -> Result<(), anyhow::Error> {
    let store = store().await?;
    let raw_id = format!("  Acme-{}  ", Uuid::new_v4().simple());
    let folded = raw_id.trim().to_lowercase();

    sqlx::query(
        "INSERT INTO oauth_provider_configs (provider_id, provider_type, name, client_id) \
         VALUES ($1, 'custom', 'Acme', 'client')",
    )
    .bind(&raw_id)
    .execute(store.pool())
    .await?;

    let by_folded = store.find_provider_config(&folded).await?;
    assert_eq!(by_folded.map(|c| c.provider_id), Some(folded.clone()));
    assert!(store.find_provider_config(&raw_id).await?.is_some());
    assert!(store.delete_provider_config(&folded).await?);
    Ok(())
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn concurrent_disconnects_leave_one_identity() -> Result<(), anyhow::Error> {
    let store = Arc::new(store().await?);
    let user = oauth_only_user(&store, &[ProviderType::Github, ProviderType::Google]).await?;

    let (github, google) = tokio::join!(
        store.delete_identity(user.id, ProviderType::Github),
        store.delete_identity(user.id, ProviderType::Google),
    );
    let mut outcomes = vec![github?, google?];
    outcomes.sort_by_key(|o| *o == IdentityRemoval::Removed);
    assert_eq!(
        outcomes,
        vec![IdentityRemoval::LastSignInMethod, IdentityRemoval::Removed]
    );
    assert_eq!(store.list_identities(user.id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn auth_settings_upsert() -> Result<(), anyhow::Error> {
    let store = store().await?;
    store.put_auth_setting(SETTING_JWT_SECRET, "first").await?;
    store.put_auth_setting(SETTING_JWT_SECRET, "second").await?;

    let settings = store.list_auth_settings().await?;
    assert_eq!(
        settings.get(SETTING_JWT_SECRET).map(String::as_str),
        Some("second")
    );

    sqlx::query("DELETE FROM auth_settings WHERE key = $1")
        .bind(SETTING_JWT_SECRET)
        .execute(store.pool())
        .await?;
    Ok(())
}
