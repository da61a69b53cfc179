//! Opaque access tokens: creation, scoped authorization and management.

mod common;

use axum::http::StatusCode;
use common::{token, TestApp};
use serde_json::json;

async fn session_token(app: &TestApp) -> String {
    let registered = app.register("ops@example.com", "ops").await;
    token(&registered, "accessToken")
}

#[tokio::test]
async fn scoped_token_matches_exactly() {
    let app = TestApp::spawn();
    let jwt = session_token(&app).await;

    let created = app
        .post(
            "/auth/access-tokens",
            Some(&jwt),
            json!({
                "name": "bucket bot",
                "scopes": ["message-bucket-creation:bucket-123"]
            }),
        )
        .await;
    assert_eq!(created.status, StatusCode::CREATED, "{}", created.body);
    let secret = token(&created.body, "token");
    assert!(secret.starts_with("ntk_"));
    assert_eq!(created.body["secretStored"], false);

    let allowed = app
        .post(
            "/auth/authorize",
            Some(&secret),
            json!({ "capability": "message-bucket-creation", "resourceId": "bucket-123" }),
        )
        .await;
    assert_eq!(allowed.status, StatusCode::OK, "{}", allowed.body);
    assert_eq!(allowed.body["allowed"], true);
    assert_eq!(allowed.body["scope"], "message-bucket-creation:bucket-123");

    for request in [
        json!({ "capability": "message-bucket-creation", "resourceId": "bucket-456" }),
        json!({ "capability": "message-bucket-creation" }),
        json!({ "capability": "message-bucket-creation", "resourceId": "bucket-12" }),
    ] {
        let denied = app.post("/auth/authorize", Some(&secret), request).await;
        assert_eq!(denied.status, StatusCode::FORBIDDEN, "{}", denied.body);
    }

    let me = app.get("/auth/me", Some(&secret)).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["unrestricted"], false);
    assert_eq!(me.body["sessionId"], serde_json::Value::Null);
}

#[tokio::test]
async fn scoped_token_cannot_manage_tokens() {
    let app = TestApp::spawn();
    let jwt = session_token(&app).await;

    let scoped = app
        .post(
            "/auth/access-tokens",
            Some(&jwt),
            json!({ "name": "narrow", "scopes": ["notifications-read"] }),
        )
        .await;
    let scoped = token(&scoped.body, "token");

    let listed = app.get("/auth/access-tokens", Some(&scoped)).await;
    assert_eq!(listed.status, StatusCode::FORBIDDEN);

    let created = app
        .post(
            "/auth/access-tokens",
            Some(&scoped),
            json!({ "name": "escalate" }),
        )
        .await;
    assert_eq!(created.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unrestricted_token_acts_for_owner() {
    let app = TestApp::spawn();
    let jwt = session_token(&app).await;

    let created = app
        .post(
            "/auth/access-tokens",
            Some(&jwt),
            json!({ "name": "ci", "storeSecret": true }),
        )
        .await;
    assert_eq!(created.status, StatusCode::CREATED);
    let secret = token(&created.body, "token");
    let id = token(&created.body, "id");

    // Query-string credentials work for clients that cannot set headers.
    let listed = app
        .get(&format!("/auth/access-tokens?access_token={}", secret), None)
        .await;
    assert_eq!(listed.status, StatusCode::OK);
    let tokens = listed.body.as_array().cloned().unwrap_or_default();
    assert_eq!(tokens.len(), 1);
    assert!(tokens[0].get("tokenHash").is_none());
    assert!(tokens[0].get("token").is_none());

    let stored = app
        .get(&format!("/auth/access-tokens/{}/secret", id), Some(&jwt))
        .await;
    assert_eq!(stored.status, StatusCode::OK);
    assert_eq!(stored.body["token"], secret);

    let allowed = app
        .post(
            "/auth/authorize",
            Some(&secret),
            json!({ "capability": "anything", "resourceId": "at-all" }),
        )
        .await;
    assert_eq!(allowed.status, StatusCode::OK);

    let deleted = app
        .delete(&format!("/auth/access-tokens/{}", id), Some(&jwt))
        .await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);
    let again = app
        .delete(&format!("/auth/access-tokens/{}", id), Some(&jwt))
        .await;
    assert_eq!(again.status, StatusCode::NO_CONTENT);

    assert_eq!(
        app.get("/auth/me", Some(&secret)).await.status,
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn secret_is_unavailable_unless_stored() {
    let app = TestApp::spawn();
    let jwt = session_token(&app).await;

    let created = app
        .post("/auth/access-tokens", Some(&jwt), json!({ "name": "once" }))
        .await;
    let id = token(&created.body, "id");

    let stored = app
        .get(&format!("/auth/access-tokens/{}/secret", id), Some(&jwt))
        .await;
    assert_eq!(stored.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scoped_token_cannot_manage_account() {
    let app = TestApp::spawn();
    let registered = app.register("ops@example.com", "ops").await;
    let jwt = token(&registered, "accessToken");
    let session_id = token(&registered, "sessionId");

    let created = app
        .post(
            "/auth/access-tokens",
            Some(&jwt),
            json!({ "name": "reader", "scopes": ["message-read:bucket-1"] }),
        )
        .await;
    let scoped = token(&created.body, "token");

    let password = app
        .post(
            "/auth/password",
            Some(&scoped),
            json!({ "currentPassword": common::PASSWORD, "newPassword": "taken-over-123" }),
        )
        .await;
    assert_eq!(password.status, StatusCode::FORBIDDEN);

    let confirm = app
        .post("/auth/email/confirm/request", Some(&scoped), json!({}))
        .await;
    assert_eq!(confirm.status, StatusCode::FORBIDDEN);

    let others = app
        .post("/auth/sessions/revoke-others", Some(&scoped), json!({}))
        .await;
    assert_eq!(others.status, StatusCode::FORBIDDEN);

    for (path, status) in [
        ("/auth/sessions".to_string(), app.get("/auth/sessions", Some(&scoped)).await.status),
        ("/auth/identities".to_string(), app.get("/auth/identities", Some(&scoped)).await.status),
        (
            format!("/auth/sessions/{}", session_id),
            app.delete(&format!("/auth/sessions/{}", session_id), Some(&scoped))
                .await
                .status,
        ),
        (
            "/auth/identities/github".to_string(),
            app.delete("/auth/identities/github", Some(&scoped)).await.status,
        ),
    ] {
        assert_eq!(status, StatusCode::FORBIDDEN, "{}", path);
    }

    // Nothing changed: the session survives and the old password still works.
    assert_eq!(app.get("/auth/me", Some(&jwt)).await.status, StatusCode::OK);
    app.login("ops@example.com").await;

    // The scoped token still does what it was issued for.
    let allowed = app
        .post(
            "/auth/authorize",
            Some(&scoped),
            json!({ "capability": "message-read", "resourceId": "bucket-1" }),
        )
        .await;
    assert_eq!(allowed.status, StatusCode::OK);
}
