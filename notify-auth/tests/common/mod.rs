//! In-process harness for notify-auth integration tests.
//!
//! Runs the real router over the in-memory store with recorded emails and
//! cheap password hashing, so no database or network is needed.

#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use notify_auth::{
    build_router,
    config::AuthConfig,
    services::{CredentialStore, InMemoryCredentialStore, MockEmailService},
    utils::SecretHasher,
    AppState,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

pub const PASSWORD: &str = "correct-horse-battery";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<InMemoryCredentialStore>,
    pub email: Arc<MockEmailService>,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn set_cookies(&self) -> Vec<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }

    pub fn location(&self) -> Option<String> {
        self.headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AuthConfig) -> Self {
        let store = Arc::new(InMemoryCredentialStore::new());
        let email = Arc::new(MockEmailService::new());
        let hasher = SecretHasher::fast().expect("argon2 test params");

        let state = AppState::new(
            config,
            store.clone() as Arc<dyn CredentialStore>,
            email.clone(),
            Arc::new(hasher),
            reqwest::Client::new(),
        );
        let router = build_router(state.clone());

        Self {
            router,
            state,
            store,
            email,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// JSON request with an optional bearer credential.
    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("valid request");

        self.send(request).await
    }

    pub async fn get(&self, uri: &str, bearer: Option<&str>) -> TestResponse {
        self.call(Method::GET, uri, bearer, None).await
    }

    pub async fn post(&self, uri: &str, bearer: Option<&str>, body: Value) -> TestResponse {
        self.call(Method::POST, uri, bearer, Some(body)).await
    }

    pub async fn delete(&self, uri: &str, bearer: Option<&str>) -> TestResponse {
        self.call(Method::DELETE, uri, bearer, None).await
    }

    /// Register and return the auth response body.
    pub async fn register(&self, email: &str, username: &str) -> Value {
        let response = self
            .post(
                "/auth/register",
                None,
                json!({
                    "email": email,
                    "username": username,
                    "password": PASSWORD,
                    "deviceName": "test-runner"
                }),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        response.body
    }

    pub async fn login(&self, identifier: &str) -> Value {
        let response = self
            .post(
                "/auth/login",
                None,
                json!({ "identifier": identifier, "password": PASSWORD }),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK, "{}", response.body);
        response.body
    }
}

pub fn test_config() -> AuthConfig {
    let mut config = AuthConfig::default();
    config.log_level = "error".to_string();
    config.redirects.frontend_url = "https://app.example.com".to_string();
    config.redirects.allowed_origins = vec!["https://app.example.com".to_string()];
    config.redirects.mobile_app_scheme = "notify".to_string();
    config
}

pub fn token(body: &Value, field: &str) -> String {
    body[field]
        .as_str()
        .unwrap_or_else(|| panic!("missing {} in {}", field, body))
        .to_string()
}
