use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::ExposeSecret;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard};
use thiserror::Error;
use uuid::Uuid;

use crate::config::JwtSettings;
use crate::models::User;

/// Claims for access tokens (short-lived)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject (user ID)
    pub sub: String,
    pub email: String,
    /// Per-issuance id shared with the refresh token
    pub jti: String,
    /// Session row id
    pub sid: String,
    pub exp: i64,
    pub iat: i64,
}

/// Claims for refresh tokens (long-lived)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenClaims {
    pub sub: String,
    /// Matches `user_sessions.token_id`
    pub jti: String,
    pub sid: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Invalid token signature")]
    InvalidSignature,
    #[error("Token expired")]
    Expired,
}

/// Freshly minted pair. `token_id` is the jti both tokens carry.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_id: String,
    pub access_expires_in: i64,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Mints and verifies the HS256 access/refresh pair.
///
/// Access and refresh tokens use independent secrets so a leaked access
/// secret cannot forge refresh tokens. Settings sit behind a lock and can be
/// swapped with [`TokenIssuer::rotate`].
pub struct TokenIssuer {
    settings: RwLock<JwtSettings>,
}

impl TokenIssuer {
    pub fn new(settings: JwtSettings) -> Self {
        tracing::info!(
            access_token_expiry_minutes = settings.access_token_expiry_minutes,
            refresh_token_expiry_days = settings.refresh_token_expiry_days,
            "Token issuer initialized with HS256 secrets"
        );
        Self {
            settings: RwLock::new(settings),
        }
    }

    fn settings(&self) -> RwLockReadGuard<'_, JwtSettings> {
        // Writers only swap a whole value, so a poisoned lock still holds a
        // consistent one.
        self.settings.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Replace secrets and lifetimes. Tokens signed with the old secrets stop
    /// verifying immediately.
    pub fn rotate(&self, settings: JwtSettings) {
        let mut guard = self.settings.write().unwrap_or_else(|p| p.into_inner());
        *guard = settings;
        tracing::info!("JWT settings rotated");
    }

    /// Rotate only when `settings` differ from the current ones. Returns
    /// whether a rotation happened.
    pub fn rotate_if_changed(&self, settings: JwtSettings) -> bool {
        if self.settings().same_as(&settings) {
            return false;
        }
        self.rotate(settings);
        true
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::days(self.settings().refresh_token_expiry_days)
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.settings().access_token_expiry_minutes * 60
    }

    /// Mint a pair for `user` bound to session `session_id` with a new jti.
    /// The refresh token never outlives `refresh_not_after` when given.
    pub fn issue_token_pair(
        &self,
        user: &User,
        session_id: Uuid,
        refresh_not_after: Option<DateTime<Utc>>,
    ) -> Result<TokenPair, anyhow::Error> {
        let settings = self.settings();
        let now = Utc::now();
        let token_id = Uuid::new_v4().to_string();

        let access_exp = now + Duration::minutes(settings.access_token_expiry_minutes);
        let mut refresh_exp = now + Duration::days(settings.refresh_token_expiry_days);
        if let Some(limit) = refresh_not_after {
            refresh_exp = refresh_exp.min(limit);
        }

        let access_claims = AccessTokenClaims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            jti: token_id.clone(),
            sid: session_id.to_string(),
            exp: access_exp.timestamp(),
            iat: now.timestamp(),
        };
        let refresh_claims = RefreshTokenClaims {
            sub: user.id.to_string(),
            jti: token_id.clone(),
            sid: session_id.to_string(),
            exp: refresh_exp.timestamp(),
            iat: now.timestamp(),
        };

        let header = Header::new(Algorithm::HS256);
        let access_token = encode(
            &header,
            &access_claims,
            &EncodingKey::from_secret(settings.access_secret.expose_secret().as_bytes()),
        )
        .map_err(|e| anyhow::anyhow!("Failed to encode access token: {}", e))?;
        let refresh_token = encode(
            &header,
            &refresh_claims,
            &EncodingKey::from_secret(settings.refresh_secret.expose_secret().as_bytes()),
        )
        .map_err(|e| anyhow::anyhow!("Failed to encode refresh token: {}", e))?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_id,
            access_expires_in: settings.access_token_expiry_minutes * 60,
            refresh_expires_at: refresh_exp,
        })
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessTokenClaims, TokenError> {
        let secret = self.settings().access_secret.expose_secret().clone();
        verify(token, secret.as_bytes())
    }

    pub fn verify_refresh(&self, token: &str) -> Result<RefreshTokenClaims, TokenError> {
        let secret = self.settings().refresh_secret.expose_secret().clone();
        verify(token, secret.as_bytes())
    }
}

fn verify<T: DeserializeOwned>(token: &str, secret: &[u8]) -> Result<T, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;

    decode::<T>(token, &DecodingKey::from_secret(secret), &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::InvalidSignature,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn settings(access: &str, refresh: &str) -> JwtSettings {
        JwtSettings {
            access_secret: SecretString::new(access.to_string()),
            refresh_secret: SecretString::new(refresh.to_string()),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        }
    }

    fn user() -> User {
        User::new("ada@example.com".into(), "ada".into())
    }

    #[test]
    fn pair_shares_jti_and_session() -> Result<(), anyhow::Error> {
        let issuer = TokenIssuer::new(settings("access-secret", "refresh-secret"));
        let session_id = Uuid::new_v4();
        let pair = issuer.issue_token_pair(&user(), session_id, None)?;

        let access = issuer.verify_access(&pair.access_token)?;
        let refresh = issuer.verify_refresh(&pair.refresh_token)?;
        assert_eq!(access.jti, pair.token_id);
        assert_eq!(refresh.jti, pair.token_id);
        assert_eq!(refresh.sid, session_id.to_string());
        assert_eq!(access.email, "ada@example.com");
        Ok(())
    }

    #[test]
    fn secrets_are_not_interchangeable() -> Result<(), anyhow::Error> {
        let issuer = TokenIssuer::new(settings("access-secret", "refresh-secret"));
        let pair = issuer.issue_token_pair(&user(), Uuid::new_v4(), None)?;

        assert_eq!(
            issuer.verify_access(&pair.refresh_token).err(),
            Some(TokenError::InvalidSignature)
        );
        assert_eq!(
            issuer.verify_refresh(&pair.access_token).err(),
            Some(TokenError::InvalidSignature)
        );
        Ok(())
    }

    #[test]
    fn expired_tokens_are_reported_as_expired() -> Result<(), anyhow::Error> {
        let issuer = TokenIssuer::new(settings("access-secret", "refresh-secret"));
        let past = Utc::now() - Duration::minutes(5);
        let pair = issuer.issue_token_pair(&user(), Uuid::new_v4(), Some(past))?;

        assert_eq!(
            issuer.verify_refresh(&pair.refresh_token).err(),
            Some(TokenError::Expired)
        );
        Ok(())
    }

    #[test]
    fn rotation_invalidates_old_tokens() -> Result<(), anyhow::Error> {
        let issuer = TokenIssuer::new(settings("access-secret", "refresh-secret"));
        let pair = issuer.issue_token_pair(&user(), Uuid::new_v4(), None)?;

        issuer.rotate(settings("new-access", "new-refresh"));
        assert!(issuer.verify_access(&pair.access_token).is_err());
        Ok(())
    }

    #[test]
    fn identical_settings_do_not_rotate() -> Result<(), anyhow::Error> {
        let issuer = TokenIssuer::new(settings("access-secret", "refresh-secret"));
        let pair = issuer.issue_token_pair(&user(), Uuid::new_v4(), None)?;

        assert!(!issuer.rotate_if_changed(settings("access-secret", "refresh-secret")));
        assert!(issuer.verify_access(&pair.access_token).is_ok());
        assert!(issuer.rotate_if_changed(settings("access-secret", "other-refresh")));
        assert!(issuer.verify_refresh(&pair.refresh_token).is_err());
        Ok(())
    }
}
