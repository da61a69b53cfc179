use axum_extra::extract::cookie::SameSite;
use secrecy::{ExposeSecret, SecretString};
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::middleware::rate_limit::RateLimitRule;
use std::collections::HashMap;
use std::env;

/// Fallbacks for unset signing secrets. Good enough for a laptop, never for
/// a deployment; `unsafe_defaults` reports any that are still in effect.
const SENTINEL_ACCESS_SECRET: &str = "notify-auth-insecure-access-secret";
const SENTINEL_REFRESH_SECRET: &str = "notify-auth-insecure-refresh-secret";

/// `auth_settings` keys that override the JWT environment values.
pub const SETTING_JWT_SECRET: &str = "jwt_secret";
pub const SETTING_JWT_REFRESH_SECRET: &str = "jwt_refresh_secret";
pub const SETTING_JWT_ACCESS_EXPIRY_MINUTES: &str = "jwt_access_token_expiry_minutes";
pub const SETTING_JWT_REFRESH_EXPIRY_DAYS: &str = "jwt_refresh_token_expiry_days";

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub jwt: JwtSettings,
    pub redirects: RedirectConfig,
    pub cookies: CookieConfig,
    pub notification_service_url: Option<String>,
    pub providers: ProviderRegistryConfig,
    pub rate_limit: RateLimitConfig,
    /// Poll period for `auth_settings` overrides.
    pub settings_reload_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Signing material and lifetimes for the JWT pair. Held by the token issuer
/// behind a lock so it can be replaced at runtime.
#[derive(Debug, Clone)]
pub struct JwtSettings {
    pub access_secret: SecretString,
    pub refresh_secret: SecretString,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

impl JwtSettings {
    /// These settings with any `auth_settings` overrides applied. Rejects
    /// overrides that would leave the issuer unusable.
    pub fn with_overrides(&self, overrides: &HashMap<String, String>) -> Result<Self, String> {
        let mut merged = self.clone();
        if let Some(secret) = overrides.get(SETTING_JWT_SECRET) {
            merged.access_secret = SecretString::new(secret.clone());
        }
        if let Some(secret) = overrides.get(SETTING_JWT_REFRESH_SECRET) {
            merged.refresh_secret = SecretString::new(secret.clone());
        }
        if let Some(raw) = overrides.get(SETTING_JWT_ACCESS_EXPIRY_MINUTES) {
            merged.access_token_expiry_minutes = raw
                .trim()
                .parse()
                .map_err(|e| format!("{}: {}", SETTING_JWT_ACCESS_EXPIRY_MINUTES, e))?;
        }
        if let Some(raw) = overrides.get(SETTING_JWT_REFRESH_EXPIRY_DAYS) {
            merged.refresh_token_expiry_days = raw
                .trim()
                .parse()
                .map_err(|e| format!("{}: {}", SETTING_JWT_REFRESH_EXPIRY_DAYS, e))?;
        }

        if merged.access_secret.expose_secret().is_empty()
            || merged.refresh_secret.expose_secret().is_empty()
        {
            return Err("JWT secrets must not be empty".into());
        }
        if merged.access_secret.expose_secret() == merged.refresh_secret.expose_secret() {
            return Err("Access and refresh secrets must differ".into());
        }
        if merged.access_token_expiry_minutes <= 0 || merged.refresh_token_expiry_days <= 0 {
            return Err("Token lifetimes must be positive".into());
        }
        Ok(merged)
    }

    pub fn same_as(&self, other: &JwtSettings) -> bool {
        self.access_secret.expose_secret() == other.access_secret.expose_secret()
            && self.refresh_secret.expose_secret() == other.refresh_secret.expose_secret()
            && self.access_token_expiry_minutes == other.access_token_expiry_minutes
            && self.refresh_token_expiry_days == other.refresh_token_expiry_days
    }
}

#[derive(Debug, Clone)]
pub struct RedirectConfig {
    pub mobile_app_scheme: String,
    pub frontend_url: String,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub domain: Option<String>,
    pub same_site: SameSite,
    pub secure: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderRegistryConfig {
    pub startup_delay_seconds: u64,
    pub resync_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login: RateLimitRule,
    pub register: RateLimitRule,
    pub password_reset: RateLimitRule,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "notify-auth".to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: "postgres://localhost/notify".to_string(),
                max_connections: 10,
            },
            jwt: JwtSettings {
                access_secret: SecretString::new(SENTINEL_ACCESS_SECRET.to_string()),
                refresh_secret: SecretString::new(SENTINEL_REFRESH_SECRET.to_string()),
                access_token_expiry_minutes: 15,
                refresh_token_expiry_days: 7,
            },
            redirects: RedirectConfig {
                mobile_app_scheme: "notify".to_string(),
                frontend_url: "http://localhost:3000".to_string(),
                allowed_origins: vec!["http://localhost:3000".to_string()],
            },
            cookies: CookieConfig {
                domain: None,
                same_site: SameSite::Lax,
                secure: true,
            },
            notification_service_url: None,
            providers: ProviderRegistryConfig {
                startup_delay_seconds: 5,
                resync_seconds: 300,
            },
            rate_limit: RateLimitConfig {
                login: RateLimitRule::new(5, 900),
                register: RateLimitRule::new(3, 3600),
                password_reset: RateLimitRule::new(3, 3600),
            },
            settings_reload_seconds: 60,
        }
    }
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let defaults = AuthConfig::default();

        let config = AuthConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("notify-auth"), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", Some(defaults.database.url.as_str()), is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
            },
            jwt: JwtSettings {
                access_secret: SecretString::new(get_env(
                    "JWT_SECRET",
                    Some(SENTINEL_ACCESS_SECRET),
                    is_prod,
                )?),
                refresh_secret: SecretString::new(get_env(
                    "JWT_REFRESH_SECRET",
                    Some(SENTINEL_REFRESH_SECRET),
                    is_prod,
                )?),
                access_token_expiry_minutes: parse_env("JWT_ACCESS_TOKEN_EXPIRY_MINUTES", 15)?,
                refresh_token_expiry_days: parse_env("JWT_REFRESH_TOKEN_EXPIRY_DAYS", 7)?,
            },
            redirects: RedirectConfig {
                mobile_app_scheme: get_env("MOBILE_APP_SCHEME", Some("notify"), false)?,
                frontend_url: get_env("FRONTEND_URL", Some("http://localhost:3000"), is_prod)?,
                allowed_origins: get_env(
                    "ALLOWED_REDIRECT_ORIGINS",
                    Some("http://localhost:3000"),
                    false,
                )?
                .split(',')
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            },
            cookies: CookieConfig {
                domain: env::var("COOKIE_DOMAIN").ok().filter(|s| !s.is_empty()),
                same_site: parse_same_site(&get_env("COOKIE_SAME_SITE", Some("lax"), false)?)?,
                secure: parse_env("COOKIE_SECURE", true)?,
            },
            notification_service_url: env::var("NOTIFICATION_SERVICE_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            providers: ProviderRegistryConfig {
                startup_delay_seconds: parse_env("PROVIDER_REGISTRY_STARTUP_DELAY_SECONDS", 5)?,
                resync_seconds: parse_env("PROVIDER_REGISTRY_RESYNC_SECONDS", 300)?,
            },
            rate_limit: RateLimitConfig {
                login: RateLimitRule::new(
                    parse_env("RATE_LIMIT_LOGIN_ATTEMPTS", 5)?,
                    parse_env("RATE_LIMIT_LOGIN_WINDOW_SECONDS", 900)?,
                ),
                register: RateLimitRule::new(
                    parse_env("RATE_LIMIT_REGISTER_ATTEMPTS", 3)?,
                    parse_env("RATE_LIMIT_REGISTER_WINDOW_SECONDS", 3600)?,
                ),
                password_reset: RateLimitRule::new(
                    parse_env("RATE_LIMIT_PASSWORD_RESET_ATTEMPTS", 3)?,
                    parse_env("RATE_LIMIT_PASSWORD_RESET_WINDOW_SECONDS", 3600)?,
                ),
            },
            settings_reload_seconds: parse_env("AUTH_SETTINGS_RELOAD_SECONDS", 60)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        if self.settings_reload_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "AUTH_SETTINGS_RELOAD_SECONDS must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            let unsafe_defaults = self.unsafe_defaults();
            if !unsafe_defaults.is_empty() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Insecure fallback values are not allowed in production: {}",
                    unsafe_defaults.join(", ")
                )));
            }

            if !self.cookies.secure {
                tracing::error!("COOKIE_SECURE is disabled in production");
            }
        }

        Ok(())
    }

    /// Names of settings still carrying a weak built-in fallback.
    pub fn unsafe_defaults(&self) -> Vec<&'static str> {
        let mut found = Vec::new();
        if self.jwt.access_secret.expose_secret() == SENTINEL_ACCESS_SECRET {
            found.push("JWT_SECRET");
        }
        if self.jwt.refresh_secret.expose_secret() == SENTINEL_REFRESH_SECRET {
            found.push("JWT_REFRESH_SECRET");
        }
        if self.jwt.access_secret.expose_secret() == self.jwt.refresh_secret.expose_secret() {
            found.push("JWT_REFRESH_SECRET (same as JWT_SECRET)");
        }
        found
    }

    pub fn is_prod(&self) -> bool {
        self.environment == Environment::Prod
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_same_site(value: &str) -> Result<SameSite, AppError> {
    match value.to_lowercase().as_str() {
        "lax" => Ok(SameSite::Lax),
        "strict" => Ok(SameSite::Strict),
        "none" => Ok(SameSite::None),
        other => Err(AppError::ConfigError(anyhow::anyhow!(
            "Invalid COOKIE_SAME_SITE: {}",
            other
        ))),
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "prod" | "production" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
