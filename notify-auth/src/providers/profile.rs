//! Provider profiles mapped onto one shape. One pure function per provider
//! type; the payloads have nothing structural in common.

use serde::Serialize;
use serde_json::Value;

use super::ProviderError;
use crate::models::ProviderType;

const MAX_USERNAME_LEN: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedProfile {
    pub id: String,
    pub email: Option<String>,
    /// Whether the provider vouches for `email`.
    pub email_verified: bool,
    pub display_name: Option<String>,
    /// Provider handle (GitHub login, Discord username).
    pub handle: Option<String>,
    pub avatar_url: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

pub fn normalize_profile(
    provider: ProviderType,
    raw: &Value,
    field_map: Option<&Value>,
) -> Result<NormalizedProfile, ProviderError> {
    let profile = match provider {
        ProviderType::Github => github_profile(raw),
        ProviderType::Google => google_profile(raw),
        ProviderType::Discord => discord_profile(raw),
        ProviderType::Apple => apple_profile(raw),
        ProviderType::Custom => custom_profile(raw, field_map),
    };

    if profile.id.is_empty() {
        return Err(ProviderError::InvalidProfile(format!(
            "{} profile has no subject id",
            provider
        )));
    }
    Ok(profile)
}

fn github_profile(raw: &Value) -> NormalizedProfile {
    // `emails` is merged in by the adapter from /user/emails when available.
    let primary = raw.get("emails").and_then(Value::as_array).and_then(|emails| {
        emails.iter().find(|e| {
            e.get("primary").and_then(Value::as_bool) == Some(true)
                && e.get("verified").and_then(Value::as_bool) == Some(true)
        })
    });
    let (email, email_verified) = match primary.and_then(|e| text(e, "email")) {
        Some(email) => (Some(email), true),
        // The public profile email is only shown once GitHub verified it.
        None => {
            let email = text(raw, "email");
            let verified = email.is_some();
            (email, verified)
        }
    };

    let display_name = text(raw, "name");
    let (first_name, last_name) = split_name(display_name.as_deref());
    NormalizedProfile {
        id: id_string(raw.get("id")),
        email,
        email_verified,
        display_name,
        handle: text(raw, "login"),
        avatar_url: text(raw, "avatar_url"),
        first_name,
        last_name,
    }
}

fn google_profile(raw: &Value) -> NormalizedProfile {
    let id = match raw.get("sub") {
        Some(sub) => id_string(Some(sub)),
        None => id_string(raw.get("id")),
    };
    let email_verified = flag(raw, "email_verified") || flag(raw, "verified_email");
    NormalizedProfile {
        id,
        email: text(raw, "email"),
        email_verified,
        display_name: text(raw, "name"),
        handle: None,
        avatar_url: text(raw, "picture"),
        first_name: text(raw, "given_name"),
        last_name: text(raw, "family_name"),
    }
}

fn discord_profile(raw: &Value) -> NormalizedProfile {
    let id = id_string(raw.get("id"));
    let avatar_url = text(raw, "avatar")
        .map(|hash| format!("https://cdn.discordapp.com/avatars/{}/{}.png", id, hash));
    NormalizedProfile {
        email: text(raw, "email"),
        email_verified: flag(raw, "verified"),
        display_name: text(raw, "global_name").or_else(|| text(raw, "username")),
        handle: text(raw, "username"),
        avatar_url,
        first_name: None,
        last_name: None,
        id,
    }
}

/// `raw` is the id_token claim set, optionally with the `user` object Apple
/// posts on first authorization merged in under `"user"`.
fn apple_profile(raw: &Value) -> NormalizedProfile {
    let name = raw.get("user").and_then(|u| u.get("name"));
    let first_name = name.and_then(|n| text(n, "firstName"));
    let last_name = name.and_then(|n| text(n, "lastName"));
    let display_name = match (&first_name, &last_name) {
        (Some(f), Some(l)) => Some(format!("{} {}", f, l)),
        (Some(f), None) => Some(f.clone()),
        (None, Some(l)) => Some(l.clone()),
        (None, None) => None,
    };
    NormalizedProfile {
        id: id_string(raw.get("sub")),
        email: text(raw, "email"),
        email_verified: flag(raw, "email_verified"),
        display_name,
        handle: None,
        avatar_url: None,
        first_name,
        last_name,
    }
}

/// Generic OAuth2 profile. `field_map` maps normalized field names to
/// dotted paths in the payload, e.g. `{"id": "data.user_id"}`.
fn custom_profile(raw: &Value, field_map: Option<&Value>) -> NormalizedProfile {
    let path_for = |field: &str, default: &'static str| -> String {
        field_map
            .and_then(|m| m.get(field))
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    };
    let lookup = |field: &str, default: &'static str| lookup_path(raw, &path_for(field, default));

    let id = lookup("id", "id")
        .or_else(|| lookup_path(raw, "sub"))
        .map(|v| id_string(Some(&v)))
        .unwrap_or_default();
    let as_text = |v: Option<Value>| v.and_then(|v| v.as_str().map(str::trim).filter(|s| !s.is_empty()).map(String::from));

    let display_name = as_text(lookup("name", "name"));
    let mut first_name = as_text(lookup("first_name", "given_name"));
    let mut last_name = as_text(lookup("last_name", "family_name"));
    if first_name.is_none() && last_name.is_none() {
        (first_name, last_name) = split_name(display_name.as_deref());
    }

    NormalizedProfile {
        id,
        email: as_text(lookup("email", "email")),
        email_verified: lookup("email_verified", "email_verified")
            .is_some_and(|v| v.as_bool() == Some(true) || v.as_str() == Some("true")),
        display_name,
        handle: as_text(lookup("username", "preferred_username")),
        avatar_url: as_text(lookup("avatar", "picture")),
        first_name,
        last_name,
    }
}

/// Username candidate for a new account: given+family name, else the
/// sanitized display name, else the email local part, else the handle.
pub fn derive_username(profile: &NormalizedProfile) -> Option<String> {
    let full_name = match (&profile.first_name, &profile.last_name) {
        (Some(f), Some(l)) => Some(format!("{}.{}", f, l)),
        _ => None,
    };
    let local_part = profile
        .email
        .as_deref()
        .and_then(|e| e.split('@').next())
        .map(str::to_string);

    [
        full_name,
        profile.display_name.clone(),
        local_part,
        profile.handle.clone(),
    ]
    .into_iter()
    .flatten()
    .map(|candidate| sanitize_username(&candidate))
    .find(|candidate| !candidate.is_empty())
}

/// Lowercase ASCII letters, digits, `.`, `_` and `-`; whitespace becomes `.`.
pub fn sanitize_username(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        let mapped = match c {
            'a'..='z' | '0'..='9' | '_' | '-' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            '.' | ' ' | '\t' => Some('.'),
            _ => None,
        };
        if let Some(m) = mapped {
            if m == '.' && (out.is_empty() || out.ends_with('.')) {
                continue;
            }
            out.push(m);
        }
        if out.len() >= MAX_USERNAME_LEN {
            break;
        }
    }
    out.trim_end_matches('.').to_string()
}

fn lookup_path(raw: &Value, path: &str) -> Option<Value> {
    path.split('.')
        .try_fold(raw, |node, segment| node.get(segment))
        .filter(|v| !v.is_null())
        .cloned()
}

fn text(raw: &Value, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Accepts `true` and `"true"`; Apple sends the latter.
fn flag(raw: &Value, key: &str) -> bool {
    match raw.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn id_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn split_name(full: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(full) = full.map(str::trim).filter(|s| !s.is_empty()) else {
        return (None, None);
    };
    match full.rsplit_once(' ') {
        Some((first, last)) => (Some(first.trim().to_string()), Some(last.to_string())),
        None => (Some(full.to_string()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn github_prefers_verified_primary_email() -> Result<(), ProviderError> {
        let raw = json!({
            "id": 583231,
            "login": "octocat",
            "name": "The Octocat",
            "email": null,
            "avatar_url": "https://avatars.githubusercontent.com/u/583231",
            "emails": [
                {"email": "old@example.com", "primary": false, "verified": true},
                {"email": "octo@example.com", "primary": true, "verified": true}
            ]
        });
        let profile = normalize_profile(ProviderType::Github, &raw, None)?;
        assert_eq!(profile.id, "583231");
        assert_eq!(profile.email.as_deref(), Some("octo@example.com"));
        assert!(profile.email_verified);
        assert_eq!(profile.handle.as_deref(), Some("octocat"));
        assert_eq!(profile.first_name.as_deref(), Some("The"));
        Ok(())
    }

    #[test]
    fn google_maps_openid_claims() -> Result<(), ProviderError> {
        let raw = json!({
            "sub": "1234",
            "email": "ada@example.com",
            "email_verified": true,
            "name": "Ada Lovelace",
            "given_name": "Ada",
            "family_name": "Lovelace",
            "picture": "https://lh3.googleusercontent.com/a"
        });
        let profile = normalize_profile(ProviderType::Google, &raw, None)?;
        assert_eq!(profile.id, "1234");
        assert!(profile.email_verified);
        assert_eq!(profile.last_name.as_deref(), Some("Lovelace"));
        Ok(())
    }

    #[test]
    fn discord_builds_cdn_avatar() -> Result<(), ProviderError> {
        let raw = json!({
            "id": "80351110224678912",
            "username": "nelly",
            "global_name": "Nelly",
            "avatar": "8342729096ea3675442027381ff50dfe",
            "email": "nelly@example.com",
            "verified": true
        });
        let profile = normalize_profile(ProviderType::Discord, &raw, None)?;
        assert_eq!(
            profile.avatar_url.as_deref(),
            Some("https://cdn.discordapp.com/avatars/80351110224678912/8342729096ea3675442027381ff50dfe.png")
        );
        assert_eq!(profile.display_name.as_deref(), Some("Nelly"));
        Ok(())
    }

    #[test]
    fn apple_reads_string_flags_and_first_login_name() -> Result<(), ProviderError> {
        let raw = json!({
            "sub": "001234.abcd",
            "email": "relay@privaterelay.appleid.com",
            "email_verified": "true",
            "user": {"name": {"firstName": "Grace", "lastName": "Hopper"}}
        });
        let profile = normalize_profile(ProviderType::Apple, &raw, None)?;
        assert!(profile.email_verified);
        assert_eq!(profile.display_name.as_deref(), Some("Grace Hopper"));
        Ok(())
    }

    #[test]
    fn custom_follows_field_map() -> Result<(), ProviderError> {
        let raw = json!({
            "data": {"uid": 7, "mail": "x@example.com", "nick": "xavier"}
        });
        let map = json!({"id": "data.uid", "email": "data.mail", "username": "data.nick"});
        let profile = normalize_profile(ProviderType::Custom, &raw, Some(&map))?;
        assert_eq!(profile.id, "7");
        assert_eq!(profile.email.as_deref(), Some("x@example.com"));
        assert_eq!(profile.handle.as_deref(), Some("xavier"));
        assert!(!profile.email_verified);
        Ok(())
    }

    #[test]
    fn missing_subject_is_rejected() {
        let raw = json!({"email": "a@example.com"});
        assert!(matches!(
            normalize_profile(ProviderType::Google, &raw, None),
            Err(ProviderError::InvalidProfile(_))
        ));
    }

    #[test]
    fn username_fallback_chain() {
        let mut profile = NormalizedProfile {
            id: "1".into(),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            display_name: Some("Countess of Lovelace".into()),
            email: Some("ada@example.com".into()),
            ..Default::default()
        };
        assert_eq!(derive_username(&profile).as_deref(), Some("ada.lovelace"));

        profile.last_name = None;
        assert_eq!(
            derive_username(&profile).as_deref(),
            Some("countess.of.lovelace")
        );

        profile.display_name = Some("✨✨".into());
        assert_eq!(derive_username(&profile).as_deref(), Some("ada"));

        profile.email = None;
        profile.handle = Some("ADA_99".into());
        assert_eq!(derive_username(&profile).as_deref(), Some("ada_99"));
    }

    #[test]
    fn sanitize_collapses_separators() {
        assert_eq!(sanitize_username("  John   Q. Public "), "john.q.public");
        assert_eq!(sanitize_username("...x"), "x");
    }
}
