use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::oauth2::provider::Provider;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Lifetimes for the tokens the broker mints.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl_secs: i64,
    #[serde(default = "default_refresh_token_ttl")]
    pub refresh_token_ttl_secs: i64,
    /// Leeway applied to `exp` only. Signatures get none.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_token_ttl_secs: default_access_token_ttl(),
            refresh_token_ttl_secs: default_refresh_token_ttl(),
            clock_skew_secs: default_clock_skew(),
        }
    }
}

/// Signing key rotation schedule and storage.
#[derive(Clone, Deserialize)]
pub struct KeyConfig {
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: i64,
    /// How long a rotated-out key stays in the JWKS. Must outlive every
    /// access token it signed.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: i64,
    #[serde(default = "default_rsa_bits")]
    pub rsa_bits: usize,
    /// Optional PEM (PKCS#8 or PKCS#1) used as the first active key instead
    /// of generating one at startup.
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
    /// Base64 of 32 random bytes. When set, private keys are written to the
    /// database sealed with AES-256-GCM instead of as plain PEM.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

impl std::fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyConfig")
            .field("rotation_interval_secs", &self.rotation_interval_secs)
            .field("grace_period_secs", &self.grace_period_secs)
            .field("rsa_bits", &self.rsa_bits)
            .field("private_key_path", &self.private_key_path)
            .field("maintenance_interval_secs", &self.maintenance_interval_secs)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            rotation_interval_secs: default_rotation_interval(),
            grace_period_secs: default_grace_period(),
            rsa_bits: default_rsa_bits(),
            private_key_path: None,
            maintenance_interval_secs: default_maintenance_interval(),
            encryption_key: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SessionConfig {
    /// Hard upper bound on a session, however often it is refreshed.
    #[serde(default = "default_max_session_lifetime")]
    pub max_lifetime_secs: i64,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_true")]
    pub cookie_secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_lifetime_secs: default_max_session_lifetime(),
            cookie_name: default_cookie_name(),
            cookie_secure: true,
        }
    }
}

/// Authorization flow and upstream call tuning.
#[derive(Clone, Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: i64,
    /// Deadline for one provider call, retries included.
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Base URL providers redirect back to. Defaults to `issuer_url`.
    #[serde(default)]
    pub callback_base_url: Option<String>,
    /// Origins the post-login `redirect` may point at. Empty allows any.
    #[serde(default)]
    pub allowed_redirect_origins: Vec<String>,
    /// Upper bound on unfinished authorization flows held in memory.
    #[serde(default = "default_max_pending_states")]
    pub max_pending_states: usize,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: default_state_ttl(),
            exchange_timeout_ms: default_exchange_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            callback_base_url: None,
            allowed_redirect_origins: Vec::new(),
            max_pending_states: default_max_pending_states(),
        }
    }
}

/// One upstream identity provider. Endpoints may be omitted for the
/// well-known providers (`google`, `github`).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProviderConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub authorize_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub userinfo_url: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// `iss` of every access token and the public base URL of the broker.
    #[serde(default = "default_issuer_url")]
    pub issuer_url: String,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            listen_addr: default_listen_addr(),
            issuer_url: default_issuer_url(),
            tokens: TokenConfig::default(),
            keys: KeyConfig::default(),
            sessions: SessionConfig::default(),
            oauth: OAuthConfig::default(),
            providers: HashMap::new(),
        }
    }
}

impl AppConfig {
    pub fn callback_base_url(&self) -> &str {
        self.oauth
            .callback_base_url
            .as_deref()
            .unwrap_or(&self.issuer_url)
            .trim_end_matches('/')
    }

    /// Check cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if url::Url::parse(&self.issuer_url).is_err() {
            return Err(ConfigError::Validation(format!(
                "issuer_url is not a valid URL: {}",
                self.issuer_url
            )));
        }
        if self.tokens.access_token_ttl_secs <= 0 || self.tokens.refresh_token_ttl_secs <= 0 {
            return Err(ConfigError::Validation(
                "token lifetimes must be positive".into(),
            ));
        }
        if self.tokens.clock_skew_secs < 0 {
            return Err(ConfigError::Validation(
                "tokens.clock_skew_secs must not be negative".into(),
            ));
        }
        if self.keys.grace_period_secs
            <= self.tokens.access_token_ttl_secs + self.tokens.clock_skew_secs
        {
            return Err(ConfigError::Validation(
                "keys.grace_period_secs must exceed the access token lifetime".into(),
            ));
        }
        if self.keys.rotation_interval_secs <= 0 {
            return Err(ConfigError::Validation(
                "keys.rotation_interval_secs must be positive".into(),
            ));
        }
        if self.keys.rsa_bits < 2048 {
            return Err(ConfigError::Validation(
                "keys.rsa_bits must be at least 2048".into(),
            ));
        }
        if let Some(key) = self.keys.encryption_key.as_deref() {
            crate::keys::storage::KeySealer::from_base64(key)
                .map_err(|e| ConfigError::Validation(format!("keys.encryption_key: {e}")))?;
        }
        if self.sessions.max_lifetime_secs <= 0 {
            return Err(ConfigError::Validation(
                "sessions.max_lifetime_secs must be positive".into(),
            ));
        }
        if self.tokens.refresh_token_ttl_secs > self.sessions.max_lifetime_secs {
            return Err(ConfigError::Validation(
                "tokens.refresh_token_ttl_secs must not exceed sessions.max_lifetime_secs".into(),
            ));
        }
        if self.oauth.state_ttl_secs <= 0 {
            return Err(ConfigError::Validation(
                "oauth.state_ttl_secs must be positive".into(),
            ));
        }
        if self.oauth.max_pending_states == 0 {
            return Err(ConfigError::Validation(
                "oauth.max_pending_states must be positive".into(),
            ));
        }
        if self.oauth.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "oauth.max_attempts must be at least 1".into(),
            ));
        }
        for (id, provider) in &self.providers {
            Provider::from_config(id, provider)?;
        }
        Ok(())
    }
}

fn default_access_token_ttl() -> i64 {
    15 * 60
}

fn default_refresh_token_ttl() -> i64 {
    30 * 24 * 3600
}

fn default_clock_skew() -> i64 {
    5
}

fn default_rotation_interval() -> i64 {
    24 * 3600
}

fn default_grace_period() -> i64 {
    48 * 3600
}

fn default_rsa_bits() -> usize {
    2048
}

fn default_maintenance_interval() -> u64 {
    300
}

fn default_max_session_lifetime() -> i64 {
    30 * 24 * 3600
}

fn default_cookie_name() -> String {
    "openpass_session".to_string()
}

fn default_true() -> bool {
    true
}

fn default_state_ttl() -> i64 {
    10 * 60
}

fn default_max_pending_states() -> usize {
    100_000
}

fn default_exchange_timeout() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_database_url() -> String {
    "sqlite://openpass.db?mode=rwc".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:4000".to_string()
}

fn default_issuer_url() -> String {
    "http://localhost:4000".to_string()
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any variable matching the key path separated by double underscores
/// (e.g. `TOKENS__ACCESS_TOKEN_TTL_SECS`, `PROVIDERS__GOOGLE__CLIENT_SECRET`)
/// overrides the file value. `JWT_ISSUER` is honoured as a shorthand for
/// `issuer_url`.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from("config.yaml")
}

pub fn load_config_from(path: &str) -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(Environment::default().separator("__"))
        .set_override_option("issuer_url", std::env::var("JWT_ISSUER").ok())?
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

/// Convenience helper for binaries wanting panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AppConfig {
        AppConfig::default()
    }

    #[test]
    fn defaults_are_valid() {
        base().validate().unwrap();
    }

    #[test]
    fn grace_must_outlive_access_tokens() {
        let mut cfg = base();
        cfg.keys.grace_period_secs = cfg.tokens.access_token_ttl_secs;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_small_rsa_keys() {
        let mut cfg = base();
        cfg.keys.rsa_bits = 1024;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn callback_base_defaults_to_issuer() {
        let mut cfg = base();
        assert_eq!(cfg.callback_base_url(), "http://localhost:4000");
        cfg.oauth.callback_base_url = Some("https://auth.example.com/".into());
        assert_eq!(cfg.callback_base_url(), "https://auth.example.com");
    }

    #[test]
    fn unknown_provider_without_endpoints_is_rejected() {
        let mut cfg = base();
        cfg.providers.insert(
            "acme".into(),
            ProviderConfig {
                client_id: "id".into(),
                ..Default::default()
            },
        );
        assert!(cfg.validate().is_err());
    }
}
