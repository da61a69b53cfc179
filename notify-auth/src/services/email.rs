//! Outbound account emails. Delivery belongs to the notification service;
//! this side only composes the message and hands it over.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::instrument;

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send_confirmation_email(
        &self,
        to_email: &str,
        code: &str,
        base_url: &str,
    ) -> Result<(), anyhow::Error>;

    async fn send_password_reset_email(
        &self,
        to_email: &str,
        code: &str,
        base_url: &str,
    ) -> Result<(), anyhow::Error>;

    async fn send_welcome_email(&self, to_email: &str, username: &str)
        -> Result<(), anyhow::Error>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmailRequest<'a> {
    to: &'a str,
    subject: &'a str,
    body_text: String,
    body_html: String,
    source: &'static str,
}

/// HTTP client for the notification service's email endpoint.
#[derive(Clone)]
pub struct NotificationClient {
    http: reqwest::Client,
    endpoint: String,
}

impl NotificationClient {
    pub fn new(base_url: &str) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build notification HTTP client: {}", e))?;
        let endpoint = format!("{}/notifications/email", base_url.trim_end_matches('/'));

        tracing::info!(endpoint = %endpoint, "Notification client configured");
        Ok(Self { http, endpoint })
    }

    #[instrument(skip(self, body_text, body_html), fields(subject = %subject))]
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body_text: String,
        body_html: String,
    ) -> Result<(), anyhow::Error> {
        let request = EmailRequest {
            to,
            subject,
            body_text,
            body_html,
            source: "notify-auth",
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to reach notification service");
                anyhow::anyhow!("Notification service error: {}", e)
            })?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, "Notification service rejected email");
            return Err(anyhow::anyhow!(
                "Notification service returned {}",
                status
            ));
        }

        tracing::info!("Email queued via notification service");
        Ok(())
    }
}

#[async_trait]
impl EmailProvider for NotificationClient {
    async fn send_confirmation_email(
        &self,
        to_email: &str,
        code: &str,
        base_url: &str,
    ) -> Result<(), anyhow::Error> {
        let link = format!("{}/confirm-email?code={}", base_url, code);

        let html_body = format!(
            r###"<html>
                <body style="font-family: Arial, sans-serif;">
                    <h2>Confirm your email</h2>
                    <p>Please click the link below to confirm your email address:</p>
                    <p><a href="{}">Confirm Email</a></p>
                    <p style="color: #666; font-size: 12px;">
                        This link will expire in 24 hours. If you didn't request this, please ignore this email.
                    </p>
                </body>
            </html>"###,
            link
        );
        let plain_body = format!(
            "Confirm your email\n\n\
            Please visit the following link to confirm your email address:\n\n\
            {}\n\n\
            This link will expire in 24 hours. If you didn't request this, please ignore this email.",
            link
        );

        self.send_email(to_email, "Confirm Your Email Address", plain_body, html_body)
            .await
    }

    async fn send_password_reset_email(
        &self,
        to_email: &str,
        code: &str,
        base_url: &str,
    ) -> Result<(), anyhow::Error> {
        let link = format!("{}/reset-password?code={}", base_url, code);

        let html_body = format!(
            r###"<html>
                <body style="font-family: Arial, sans-serif;">
                    <h2>Password Reset Request</h2>
                    <p>We received a request to reset your password. Click the link below to set a new password:</p>
                    <p><a href="{}">Reset Password</a></p>
                    <p style="color: #666; font-size: 12px;">
                        This link will expire in 1 hour. If you didn't request this, please ignore this email.
                    </p>
                </body>
            </html>"###,
            link
        );
        let plain_body = format!(
            "Password Reset Request\n\n\
            We received a request to reset your password. Please visit the following link to set a new password:\n\n\
            {}\n\n\
            This link will expire in 1 hour. If you didn't request this, please ignore this email.",
            link
        );

        self.send_email(to_email, "Reset Your Password", plain_body, html_body)
            .await
    }

    async fn send_welcome_email(
        &self,
        to_email: &str,
        username: &str,
    ) -> Result<(), anyhow::Error> {
        let html_body = format!(
            r###"<html>
                <body style="font-family: Arial, sans-serif;">
                    <h2>Welcome, {}!</h2>
                    <p>Your account is ready. You can start creating buckets and receiving notifications right away.</p>
                </body>
            </html>"###,
            username
        );
        let plain_body = format!(
            "Welcome, {}!\n\nYour account is ready. You can start creating buckets and receiving notifications right away.",
            username
        );

        self.send_email(to_email, "Welcome", plain_body, html_body)
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentEmail {
    Confirmation { to: String, code: String },
    PasswordReset { to: String, code: String },
    Welcome { to: String, username: String },
}

/// Records emails instead of sending them. Used in tests and when no
/// notification service is configured.
#[derive(Default)]
pub struct MockEmailService {
    sent: Mutex<Vec<SentEmail>>,
}

impl MockEmailService {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, email: SentEmail) -> Result<(), anyhow::Error> {
        self.sent
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock email mutex poisoned: {}", e))?
            .push(email);
        Ok(())
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Most recent password-reset code sent to `to`.
    pub fn last_reset_code(&self, to: &str) -> Option<String> {
        self.sent().into_iter().rev().find_map(|e| match e {
            SentEmail::PasswordReset { to: t, code } if t == to => Some(code),
            _ => None,
        })
    }

    /// Most recent confirmation code sent to `to`.
    pub fn last_confirmation_code(&self, to: &str) -> Option<String> {
        self.sent().into_iter().rev().find_map(|e| match e {
            SentEmail::Confirmation { to: t, code } if t == to => Some(code),
            _ => None,
        })
    }
}

#[async_trait]
impl EmailProvider for MockEmailService {
    async fn send_confirmation_email(
        &self,
        to_email: &str,
        code: &str,
        _base_url: &str,
    ) -> Result<(), anyhow::Error> {
        tracing::info!("Mock: confirmation email recorded");
        self.record(SentEmail::Confirmation {
            to: to_email.to_string(),
            code: code.to_string(),
        })
    }

    async fn send_password_reset_email(
        &self,
        to_email: &str,
        code: &str,
        _base_url: &str,
    ) -> Result<(), anyhow::Error> {
        tracing::info!("Mock: password reset email recorded");
        self.record(SentEmail::PasswordReset {
            to: to_email.to_string(),
            code: code.to_string(),
        })
    }

    async fn send_welcome_email(
        &self,
        to_email: &str,
        username: &str,
    ) -> Result<(), anyhow::Error> {
        tracing::info!("Mock: welcome email recorded");
        self.record(SentEmail::Welcome {
            to: to_email.to_string(),
            username: username.to_string(),
        })
    }
}
