//! Provider registry surface, OAuth flow entry points and identity linking.

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use chrono::Utc;
use common::{token, TestApp};
use notify_auth::{
    models::{DeviceInfo, OAuthProviderConfig, ProviderType},
    providers::{NormalizedProfile, ProviderChange},
    services::CredentialStore,
};

fn github_config() -> OAuthProviderConfig {
    OAuthProviderConfig {
        provider_id: "github".into(),
        provider_type: ProviderType::Github,
        name: "GitHub".into(),
        client_id: "gh-client".into(),
        client_secret: "gh-secret".into(),
        scopes: vec!["read:user".into(), "user:email".into()],
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

async fn app_with_github() -> TestApp {
    let app = TestApp::spawn();
    app.store
        .upsert_provider_config(&github_config())
        .await
        .expect("seed provider");
    app.state.providers.sync_all().await.expect("sync providers");
    app
}

#[tokio::test]
async fn providers_follow_the_table() {
    let app = app_with_github().await;

    let listed = app.get("/auth/providers", None).await;
    assert_eq!(listed.status, StatusCode::OK);
    assert_eq!(listed.body[0]["id"], "github");
    assert_eq!(listed.body[0]["providerType"], "github");

    // Re-saving an identical row must not rebuild the adapter.
    let builds = app.state.providers.adapter_builds();
    app.state
        .providers
        .apply_change(ProviderChange::Upserted("github".into()))
        .await;
    assert_eq!(app.state.providers.adapter_builds(), builds);

    app.store
        .delete_provider_config("github")
        .await
        .expect("delete provider");
    let report = app.state.providers.sync_all().await.expect("resync");
    assert_eq!(report.removed, 1);

    let listed = app.get("/auth/providers", None).await;
    assert_eq!(listed.body.as_array().map(Vec::len), Some(0));
    assert_eq!(
        app.get("/auth/oauth/github", None).await.status,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn oauth_start_redirects_with_state_and_pkce() {
    let app = app_with_github().await;

    let response = app
        .get(
            "/auth/oauth/github?redirect=https%3A%2F%2Fevil.example.net%2F&locale=de",
            None,
        )
        .await;
    assert_eq!(response.status, StatusCode::SEE_OTHER);

    let location = response.location().expect("redirect target");
    assert!(location.starts_with("https://github.com/login/oauth/authorize?"));
    assert!(location.contains("client_id=gh-client"));
    assert!(location.contains("code_challenge_method=S256"));

    let cookies = response.set_cookies();
    assert!(cookies.iter().any(|c| c.starts_with("oauth_nonce=")));
    assert!(cookies.iter().any(|c| c.starts_with("oauth_pkce=")));

    // The untrusted redirect was replaced by the frontend.
    let state = location
        .split('&')
        .find_map(|p| p.strip_prefix("state="))
        .expect("state param");
    let state = urlencoding::decode(state).expect("decodable").into_owned();
    let decoded =
        notify_auth::handlers::auth::social::decode_state(&state).expect("valid state");
    assert_eq!(decoded.redirect, "https://app.example.com");
    assert_eq!(decoded.locale.as_deref(), Some("de"));
    assert_eq!(decoded.connect_to_user_id, None);
}

#[tokio::test]
async fn connect_flow_requires_session() {
    let app = app_with_github().await;

    let anonymous = app.get("/auth/oauth/github?connect=true", None).await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);

    let registered = app.register("tim@example.com", "tim").await;
    let access = token(&registered, "accessToken");
    let connected = app
        .get("/auth/oauth/github?connect=true", Some(&access))
        .await;
    assert_eq!(connected.status, StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn callback_rejects_forged_state() {
    let app = app_with_github().await;

    let start = app.get("/auth/oauth/github", None).await;
    let location = start.location().expect("redirect target");
    let state = location
        .split('&')
        .find_map(|p| p.strip_prefix("state="))
        .expect("state param")
        .to_string();

    // No nonce cookie: the state cannot be tied to this browser.
    let forged = app
        .get(
            &format!("/auth/oauth/github/callback?code=abc&state={}", state),
            None,
        )
        .await;
    assert_eq!(forged.status, StatusCode::BAD_REQUEST);

    let missing = app
        .get("/auth/oauth/github/callback?code=abc", None)
        .await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn callback_forwards_provider_errors() {
    let app = app_with_github().await;

    let request = Request::builder()
        .uri("/auth/oauth/github/callback?error=access_denied")
        .body(Body::empty())
        .expect("request");
    let response = app.send(request).await;
    assert_eq!(response.status, StatusCode::SEE_OTHER);
    assert_eq!(
        response.location().as_deref(),
        Some("https://app.example.com#error=access_denied")
    );

    let start = app.get("/auth/oauth/github", None).await;
    let nonce_cookie = start
        .set_cookies()
        .into_iter()
        .find(|c| c.starts_with("oauth_nonce="))
        .and_then(|c| c.split(';').next().map(str::to_string))
        .expect("nonce cookie");
    let location = start.location().expect("redirect target");
    let state = location
        .split('&')
        .find_map(|p| p.strip_prefix("state="))
        .expect("state param")
        .to_string();

    // Apple-style form_post reaches the same completion.
    let request = Request::builder()
        .method("POST")
        .uri("/auth/oauth/github/callback")
        .header(header::COOKIE, nonce_cookie)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(format!("error=server_error&state={}", state)))
        .expect("request");
    let response = app.send(request).await;
    assert_eq!(response.status, StatusCode::SEE_OTHER);
    assert_eq!(
        response.location().as_deref(),
        Some("https://app.example.com#error=server_error")
    );
}

#[tokio::test]
async fn last_identity_of_passwordless_user_is_kept() {
    let app = TestApp::spawn();

    let profile = NormalizedProfile {
        id: "gh-42".into(),
        email: Some("octo@example.com".into()),
        email_verified: true,
        handle: Some("octocat".into()),
        ..Default::default()
    };
    let user = app
        .state
        .identities
        .find_or_create_user_from_provider(ProviderType::Github, &profile, None)
        .await
        .expect("user created from profile");
    assert!(!user.has_password);
    assert!(user.email_confirmed);

    let session = app
        .state
        .sessions
        .start_session(&user, &DeviceInfo::default())
        .await
        .expect("session");
    let access = session.tokens.access_token;

    let identities = app.get("/auth/identities", Some(&access)).await;
    assert_eq!(identities.status, StatusCode::OK);
    assert_eq!(identities.body[0]["providerType"], "github");

    let blocked = app.delete("/auth/identities/github", Some(&access)).await;
    assert_eq!(blocked.status, StatusCode::FORBIDDEN);

    let unknown = app.delete("/auth/identities/discord", Some(&access)).await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);

    // With a password set the identity may go.
    let set = app
        .post(
            "/auth/password",
            Some(&access),
            serde_json::json!({ "newPassword": common::PASSWORD }),
        )
        .await;
    assert_eq!(set.status, StatusCode::OK, "{}", set.body);

    let removed = app.delete("/auth/identities/github", Some(&access)).await;
    assert_eq!(removed.status, StatusCode::NO_CONTENT);

    // The same provider account signs in to the same user again.
    let again = app
        .state
        .identities
        .find_or_create_user_from_provider(ProviderType::Github, &profile, None)
        .await
        .expect("relinked by email");
    assert_eq!(again.id, user.id);
}
