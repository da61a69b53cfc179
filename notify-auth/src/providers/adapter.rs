//! HTTP side of one configured OAuth provider: authorize URL, code exchange
//! and profile fetch. Adapters are immutable; a config change builds a new
//! one.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::profile::{normalize_profile, NormalizedProfile};
use super::ProviderError;
use crate::models::{OAuthProviderConfig, ProviderType};

const APPLE_AUDIENCE: &str = "https://appleid.apple.com";
const GITHUB_EMAILS_URL: &str = "https://api.github.com/user/emails";

struct Endpoints {
    authorize: String,
    token: String,
    user_info: Option<String>,
    default_scopes: &'static [&'static str],
}

fn default_endpoints(provider: ProviderType) -> Option<Endpoints> {
    let endpoints = match provider {
        ProviderType::Github => Endpoints {
            authorize: "https://github.com/login/oauth/authorize".into(),
            token: "https://github.com/login/oauth/access_token".into(),
            user_info: Some("https://api.github.com/user".into()),
            default_scopes: &["read:user", "user:email"],
        },
        ProviderType::Google => Endpoints {
            authorize: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token: "https://oauth2.googleapis.com/token".into(),
            user_info: Some("https://openidconnect.googleapis.com/v1/userinfo".into()),
            default_scopes: &["openid", "email", "profile"],
        },
        ProviderType::Discord => Endpoints {
            authorize: "https://discord.com/oauth2/authorize".into(),
            token: "https://discord.com/api/oauth2/token".into(),
            user_info: Some("https://discord.com/api/users/@me".into()),
            default_scopes: &["identify", "email"],
        },
        ProviderType::Apple => Endpoints {
            authorize: "https://appleid.apple.com/auth/authorize".into(),
            token: "https://appleid.apple.com/auth/token".into(),
            user_info: None,
            default_scopes: &["name", "email"],
        },
        ProviderType::Custom => return None,
    };
    Some(endpoints)
}

/// How the adapter authenticates at the token endpoint.
enum ClientAuth {
    Secret(SecretString),
    /// Apple: a short-lived ES256 JWT signed with the team's `.p8` key.
    AppleKey {
        team_id: String,
        key_id: String,
        key: EncodingKey,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Serialize)]
struct AppleClientSecretClaims<'a> {
    iss: &'a str,
    iat: i64,
    exp: i64,
    aud: &'a str,
    sub: &'a str,
}

pub struct OAuthAdapter {
    config: OAuthProviderConfig,
    authorize_url: String,
    token_url: String,
    user_info_url: Option<String>,
    scopes: Vec<String>,
    callback_url: String,
    client_auth: ClientAuth,
    http: reqwest::Client,
}

impl std::fmt::Debug for OAuthAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthAdapter")
            .field("provider_id", &self.config.provider_id)
            .field("provider_type", &self.config.provider_type)
            .finish_non_exhaustive()
    }
}

impl OAuthAdapter {
    /// Validate `config` and build an adapter for it. Fails with
    /// `Misconfigured` when credentials, URLs or key material are missing.
    pub fn from_config(
        config: OAuthProviderConfig,
        http: reqwest::Client,
    ) -> Result<Self, ProviderError> {
        let id = config.key();
        let missing = |what: &str| ProviderError::Misconfigured(format!("{}: missing {}", id, what));

        if config.client_id.trim().is_empty() {
            return Err(missing("client_id"));
        }
        let callback_url = config
            .callback_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| missing("callback_url"))?;

        let defaults = default_endpoints(config.provider_type);
        let pick = |configured: &Option<String>, fallback: Option<String>| {
            configured
                .clone()
                .filter(|u| !u.trim().is_empty())
                .or(fallback)
        };
        let authorize_url = pick(
            &config.authorization_url,
            defaults.as_ref().map(|d| d.authorize.clone()),
        )
        .ok_or_else(|| missing("authorization_url"))?;
        let token_url = pick(&config.token_url, defaults.as_ref().map(|d| d.token.clone()))
            .ok_or_else(|| missing("token_url"))?;
        let user_info_url = pick(
            &config.user_info_url,
            defaults.as_ref().and_then(|d| d.user_info.clone()),
        );
        if config.provider_type != ProviderType::Apple && user_info_url.is_none() {
            return Err(missing("user_info_url"));
        }

        let scopes = if config.scopes.is_empty() {
            defaults
                .as_ref()
                .map(|d| d.default_scopes.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default()
        } else {
            config.scopes.clone()
        };

        let client_auth = match config.provider_type {
            ProviderType::Apple => {
                let team_id = config.apple_team_id.clone().ok_or_else(|| missing("apple_team_id"))?;
                let key_id = config.apple_key_id.clone().ok_or_else(|| missing("apple_key_id"))?;
                let path = config
                    .apple_private_key_path
                    .clone()
                    .ok_or_else(|| missing("apple_private_key_path"))?;
                let pem = std::fs::read(&path).map_err(|e| {
                    ProviderError::Misconfigured(format!("{}: cannot read Apple key: {}", id, e))
                })?;
                let key = EncodingKey::from_ec_pem(&pem).map_err(|e| {
                    ProviderError::Misconfigured(format!("{}: invalid Apple key: {}", id, e))
                })?;
                ClientAuth::AppleKey {
                    team_id,
                    key_id,
                    key,
                }
            }
            _ => {
                if config.client_secret.trim().is_empty() {
                    return Err(missing("client_secret"));
                }
                ClientAuth::Secret(SecretString::new(config.client_secret.clone()))
            }
        };

        Ok(Self {
            config,
            authorize_url,
            token_url,
            user_info_url,
            scopes,
            callback_url,
            client_auth,
            http,
        })
    }

    pub fn key(&self) -> String {
        self.config.key()
    }

    pub fn provider_type(&self) -> ProviderType {
        self.config.provider_type
    }

    pub fn config(&self) -> &OAuthProviderConfig {
        &self.config
    }

    /// Apple only supports PKCE for native flows.
    pub fn supports_pkce(&self) -> bool {
        self.config.provider_type != ProviderType::Apple
    }

    /// Apple posts the callback as a form when name/email scopes are asked.
    pub fn uses_form_post(&self) -> bool {
        self.config.provider_type == ProviderType::Apple
    }

    pub fn authorization_url(&self, state: &str, pkce_challenge: Option<&str>) -> String {
        let scope = self.scopes.join(" ");
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.callback_url.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("state", state),
        ];
        if let Some(challenge) = pkce_challenge.filter(|_| self.supports_pkce()) {
            params.push(("code_challenge", challenge));
            params.push(("code_challenge_method", "S256"));
        }
        if self.uses_form_post() {
            params.push(("response_mode", "form_post"));
        }

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let separator = if self.authorize_url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.authorize_url, separator, query)
    }

    fn client_secret(&self) -> Result<String, ProviderError> {
        match &self.client_auth {
            ClientAuth::Secret(secret) => Ok(secret.expose_secret().clone()),
            ClientAuth::AppleKey {
                team_id,
                key_id,
                key,
            } => {
                let now = Utc::now();
                let claims = AppleClientSecretClaims {
                    iss: team_id,
                    iat: now.timestamp(),
                    exp: (now + Duration::minutes(5)).timestamp(),
                    aud: APPLE_AUDIENCE,
                    sub: &self.config.client_id,
                };
                let mut header = Header::new(Algorithm::ES256);
                header.kid = Some(key_id.clone());
                encode(&header, &claims, key).map_err(|e| {
                    ProviderError::Misconfigured(format!("failed to sign Apple client secret: {}", e))
                })
            }
        }
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<ProviderTokens, ProviderError> {
        let client_secret = self.client_secret()?;
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.callback_url.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ];
        if let Some(verifier) = pkce_verifier.filter(|_| self.supports_pkce()) {
            form.push(("code_verifier", verifier));
        }

        let response = self
            .http
            .post(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::Upstream(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ProviderError::Upstream(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        response
            .json::<ProviderTokens>()
            .await
            .map_err(|e| ProviderError::Upstream(format!("unreadable token response: {}", e)))
    }

    /// Fetch and normalize the user's profile. `apple_user` is the `user`
    /// form field Apple sends on the first authorization only.
    pub async fn fetch_profile(
        &self,
        tokens: &ProviderTokens,
        apple_user: Option<&str>,
    ) -> Result<NormalizedProfile, ProviderError> {
        let raw = match self.config.provider_type {
            ProviderType::Apple => {
                let id_token = tokens.id_token.as_deref().ok_or_else(|| {
                    ProviderError::InvalidProfile("Apple response has no id_token".into())
                })?;
                let mut claims = id_token_claims(id_token)?;
                if let (Some(user), Value::Object(map)) = (apple_user, &mut claims) {
                    if let Ok(parsed) = serde_json::from_str::<Value>(user) {
                        map.insert("user".into(), parsed);
                    }
                }
                claims
            }
            ProviderType::Github => {
                let mut profile = self.get_json(self.user_info_url()?, &tokens.access_token).await?;
                // Emails need the user:email scope; a failure here is not fatal.
                match self.get_json(GITHUB_EMAILS_URL, &tokens.access_token).await {
                    Ok(emails) => {
                        if let Value::Object(map) = &mut profile {
                            map.insert("emails".into(), emails);
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "GitHub emails unavailable"),
                }
                profile
            }
            _ => self.get_json(self.user_info_url()?, &tokens.access_token).await?,
        };

        normalize_profile(
            self.config.provider_type,
            &raw,
            self.config.profile_fields.as_ref(),
        )
    }

    fn user_info_url(&self) -> Result<&str, ProviderError> {
        self.user_info_url
            .as_deref()
            .ok_or_else(|| ProviderError::Misconfigured(format!("{}: missing user_info_url", self.key())))
    }

    async fn get_json(&self, url: &str, access_token: &str) -> Result<Value, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, "notify-auth")
            .send()
            .await
            .map_err(|e| ProviderError::Upstream(format!("profile request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ProviderError::Upstream(format!(
                "profile endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::InvalidProfile(format!("unreadable profile: {}", e)))
    }
}

/// Claims of an id_token received directly from the provider's token
/// endpoint over TLS. Signature checking is left to the provider SDK layer.
fn id_token_claims(id_token: &str) -> Result<Value, ProviderError> {
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| ProviderError::InvalidProfile("malformed id_token".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| ProviderError::InvalidProfile(format!("id_token payload: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ProviderError::InvalidProfile(format!("id_token claims: {}", e)))
}
