//! User model - platform accounts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// User entity.
///
/// Reset and confirmation codes are kept as SHA-256 digests so they can be
/// looked up by value without storing the code itself.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub password_hash: Option<String>,
    pub has_password: bool,
    pub email_confirmed: bool,
    pub reset_code_hash: Option<String>,
    pub reset_requested_at: Option<DateTime<Utc>>,
    pub email_confirmation_code_hash: Option<String>,
    pub email_confirmation_requested_at: Option<DateTime<Utc>>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a user without a password (OAuth sign-up).
    pub fn new(email: String, username: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email,
            username,
            password_hash: None,
            has_password: false,
            email_confirmed: false,
            reset_code_hash: None,
            reset_requested_at: None,
            email_confirmation_code_hash: None,
            email_confirmation_requested_at: None,
            first_name: None,
            last_name: None,
            avatar: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a user with a local password.
    pub fn with_password(email: String, username: String, password_hash: String) -> Self {
        Self {
            password_hash: Some(password_hash),
            has_password: true,
            ..Self::new(email, username)
        }
    }

    pub fn set_password_hash(&mut self, password_hash: String) {
        self.password_hash = Some(password_hash);
        self.has_password = true;
        self.updated_at = Utc::now();
    }

    /// Fill profile fields the user has not set yet; never overwrites.
    pub fn fill_profile_blanks(
        &mut self,
        first_name: Option<&str>,
        last_name: Option<&str>,
        avatar: Option<&str>,
    ) -> bool {
        let mut changed = false;
        changed |= fill_blank(&mut self.first_name, first_name);
        changed |= fill_blank(&mut self.last_name, last_name);
        changed |= fill_blank(&mut self.avatar, avatar);
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }

    pub fn sanitized(&self) -> UserResponse {
        UserResponse::from(self.clone())
    }
}

fn fill_blank(slot: &mut Option<String>, value: Option<&str>) -> bool {
    let blank = slot.as_deref().map(str::trim).map_or(true, str::is_empty);
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) if blank => {
            *slot = Some(v.to_string());
            true
        }
        _ => false,
    }
}

/// User response for API (without secrets or codes).
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub has_password: bool,
    pub email_confirmed: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            email: u.email,
            username: u.username,
            has_password: u.has_password,
            email_confirmed: u.email_confirmed,
            first_name: u.first_name,
            last_name: u.last_name,
            avatar: u.avatar,
            created_at: u.created_at,
        }
    }
}
