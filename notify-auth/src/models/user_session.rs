//! User session model - one row per logical login (device).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Session entity.
///
/// `token_id` is the `jti` of the most recently issued refresh token; it is
/// rotated in place on refresh while `expires_at` stays fixed.
#[derive(Debug, Clone, FromRow)]
pub struct UserSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
    pub device_name: Option<String>,
    pub operating_system: Option<String>,
    pub browser: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub login_provider: Option<String>,
    pub exchange_code_hash: Option<String>,
    pub exchange_code_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Revoked,
    Expired,
}

impl UserSession {
    pub fn new(
        user_id: Uuid,
        token_id: String,
        expires_at: DateTime<Utc>,
        device: &DeviceInfo,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            token_id,
            expires_at,
            last_activity: now,
            is_active: true,
            device_name: device.device_name.clone(),
            operating_system: device.operating_system.clone(),
            browser: device.browser.clone(),
            ip_address: device.ip_address.clone(),
            user_agent: device.user_agent.clone(),
            login_provider: device.login_provider.clone(),
            exchange_code_hash: None,
            exchange_code_requested_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> SessionState {
        if !self.is_active {
            SessionState::Revoked
        } else if self.expires_at <= now {
            SessionState::Expired
        } else {
            SessionState::Active
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state_at(Utc::now()) == SessionState::Active
    }

    /// Overwrite device metadata with whatever the caller supplied.
    pub fn apply_device(&mut self, device: &DeviceInfo) {
        let merge = |slot: &mut Option<String>, value: &Option<String>| {
            if value.is_some() {
                slot.clone_from(value);
            }
        };
        merge(&mut self.device_name, &device.device_name);
        merge(&mut self.operating_system, &device.operating_system);
        merge(&mut self.browser, &device.browser);
        merge(&mut self.ip_address, &device.ip_address);
        merge(&mut self.user_agent, &device.user_agent);
        merge(&mut self.login_provider, &device.login_provider);
    }
}

/// Device metadata captured at login. `session_id` selects an existing row
/// to update instead of inserting a new one.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(skip)]
    pub session_id: Option<Uuid>,
    pub device_name: Option<String>,
    pub operating_system: Option<String>,
    pub browser: Option<String>,
    #[serde(skip)]
    pub ip_address: Option<String>,
    #[serde(skip)]
    pub user_agent: Option<String>,
    #[serde(skip)]
    pub login_provider: Option<String>,
}

/// Session info for API responses.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: Uuid,
    pub device_name: Option<String>,
    pub operating_system: Option<String>,
    pub browser: Option<String>,
    pub ip_address: Option<String>,
    pub login_provider: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub is_current: bool,
}

impl From<UserSession> for SessionInfo {
    fn from(s: UserSession) -> Self {
        Self {
            id: s.id,
            device_name: s.device_name,
            operating_system: s.operating_system,
            browser: s.browser,
            ip_address: s.ip_address,
            login_provider: s.login_provider,
            last_activity: s.last_activity,
            expires_at: s.expires_at,
            created_at: s.created_at,
            is_current: false, // Set by caller
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn state_reflects_revocation_before_expiry() {
        let now = Utc::now();
        let mut session = UserSession::new(
            Uuid::new_v4(),
            "jti".into(),
            now - Duration::seconds(1),
            &DeviceInfo::default(),
        );
        assert_eq!(session.state_at(now), SessionState::Expired);
        session.is_active = false;
        assert_eq!(session.state_at(now), SessionState::Revoked);
    }

    #[test]
    fn apply_device_keeps_unknown_fields() {
        let mut session = UserSession::new(
            Uuid::new_v4(),
            "jti".into(),
            Utc::now(),
            &DeviceInfo {
                device_name: Some("Pixel".into()),
                ..Default::default()
            },
        );
        session.apply_device(&DeviceInfo {
            browser: Some("Firefox".into()),
            ..Default::default()
        });
        assert_eq!(session.device_name.as_deref(), Some("Pixel"));
        assert_eq!(session.browser.as_deref(), Some("Firefox"));
    }
}
