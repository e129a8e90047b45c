//! Configuration management for the herald gateway.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_delivery::{
    validate_destinations, ClientConfig, DeadLetterConfig, DestinationConfig, TemplateCacheConfig,
};
use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitConfig;

const CONFIG_FILE: &str = "herald.toml";
const ENV_PREFIX: &str = "HERALD_";

/// Complete gateway configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed `HERALD_`, nested with `__` (highest)
/// 2. Configuration file (`herald.toml`)
/// 3. Built-in defaults (lowest)
///
/// Destinations are normally declared in the file; everything else has a
/// working default.
///
/// # Example
///
/// ```no_run
/// use herald_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Gateway will bind to {}:{}", config.server.host, config.server.port);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings.
    ///
    /// Environment variables: `HERALD_SERVER__HOST`, `HERALD_SERVER__PORT`,
    /// `HERALD_SERVER__REQUEST_TIMEOUT_SECS`
    pub server: ServerSettings,
    /// Inbound credentials. Empty disables authentication.
    pub auth: AuthSettings,
    /// Failed-auth throttling.
    pub rate_limit: RateLimitSettings,
    /// Compiled transform cache.
    pub template_cache: TemplateCacheSettings,
    /// Archive of undeliverable units.
    pub dead_letter: DeadLetterSettings,
    /// Outbound HTTP client.
    pub client: ClientSettings,
    /// Delivery targets.
    pub destinations: Vec<DestinationConfig>,
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Inbound request timeout.
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8080, request_timeout_secs: 30 }
    }
}

/// Inbound credentials.
///
/// A request is accepted when it presents any configured bearer token, or
/// the configured basic-auth pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Accepted bearer tokens.
    pub bearer_tokens: Vec<String>,
    /// Basic-auth user name.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
}

impl AuthSettings {
    /// Whether any credential is configured.
    pub fn is_enabled(&self) -> bool {
        !self.bearer_tokens.is_empty() || self.username.is_some()
    }
}

/// Failed-auth throttling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Failed attempts within the window that trigger a ban.
    pub max_attempts: u32,
    /// Counting window.
    pub window_secs: u64,
    /// Ban length.
    pub ban_secs: u64,
    /// Sweep cadence.
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self { max_attempts: 5, window_secs: 60, ban_secs: 900, cleanup_interval_secs: 300 }
    }
}

/// Template cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateCacheSettings {
    /// Maximum compiled engines held.
    pub max_size: usize,
    /// Entry lifetime from creation.
    pub ttl_secs: u64,
    /// Sweep cadence.
    pub sweep_interval_secs: u64,
}

impl Default for TemplateCacheSettings {
    fn default() -> Self {
        Self { max_size: 100, ttl_secs: 3600, sweep_interval_secs: 300 }
    }
}

/// Dead-letter store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterSettings {
    /// When false, failed units are only logged.
    pub enabled: bool,
    /// Maximum records held.
    pub max_size: usize,
    /// Record lifetime from dead time.
    pub ttl_secs: u64,
    /// Sweep and snapshot cadence.
    pub flush_interval_secs: u64,
    /// Snapshot file, restored at startup and rewritten on each sweep.
    pub persist_path: Option<PathBuf>,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
            ttl_secs: 86_400,
            flush_interval_secs: 300,
            persist_path: None,
        }
    }
}

/// Outbound client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// User agent sent to destinations.
    pub user_agent: String,
    /// Redirects followed.
    pub max_redirects: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            timeout_secs: defaults.timeout.as_secs(),
            user_agent: defaults.user_agent,
            max_redirects: defaults.max_redirects,
        }
    }
}

impl Config {
    /// Loads configuration from defaults, `herald.toml`, and `HERALD_*`
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Fails if a source cannot be parsed or the merged result is invalid.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Like [`Config::load`], reading the file at `path`. A missing file is
    /// treated as empty.
    ///
    /// # Errors
    ///
    /// Fails if a source cannot be parsed or the merged result is invalid.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parses the listener address.
    ///
    /// # Errors
    ///
    /// Fails if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.server.host, self.server.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Inbound request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Converts to the rate limiter's configuration.
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_attempts: self.rate_limit.max_attempts,
            window: Duration::from_secs(self.rate_limit.window_secs),
            ban_duration: Duration::from_secs(self.rate_limit.ban_secs),
            cleanup_interval: Duration::from_secs(self.rate_limit.cleanup_interval_secs),
        }
    }

    /// Converts to the template cache's configuration.
    pub fn to_template_cache_config(&self) -> TemplateCacheConfig {
        TemplateCacheConfig {
            max_size: self.template_cache.max_size,
            ttl: Duration::from_secs(self.template_cache.ttl_secs),
            sweep_interval: Duration::from_secs(self.template_cache.sweep_interval_secs),
        }
    }

    /// Converts to the dead-letter store's configuration.
    pub fn to_dead_letter_config(&self) -> DeadLetterConfig {
        DeadLetterConfig {
            enabled: self.dead_letter.enabled,
            max_size: self.dead_letter.max_size,
            ttl: Duration::from_secs(self.dead_letter.ttl_secs),
            flush_interval: Duration::from_secs(self.dead_letter.flush_interval_secs),
            persist_path: self.dead_letter.persist_path.clone(),
        }
    }

    /// Converts to the outbound client's configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.client.timeout_secs),
            user_agent: self.client.user_agent.clone(),
            max_redirects: self.client.max_redirects,
        }
    }

    /// Looks up a destination by name.
    pub fn destination(&self, name: &str) -> Option<&DestinationConfig> {
        self.destinations.iter().find(|destination| destination.name == name)
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Describes the first invalid value found.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be greater than 0");
        }

        if self.server.request_timeout_secs == 0 {
            anyhow::bail!("server.request_timeout_secs must be greater than 0");
        }

        if self.auth.username.is_some() != self.auth.password.is_some() {
            anyhow::bail!("auth.username and auth.password must be set together");
        }

        if self.auth.bearer_tokens.iter().any(|token| token.trim().is_empty()) {
            anyhow::bail!("auth.bearer_tokens must not contain empty tokens");
        }

        if self.rate_limit.max_attempts == 0 {
            anyhow::bail!("rate_limit.max_attempts must be greater than 0");
        }

        if self.rate_limit.window_secs == 0 {
            anyhow::bail!("rate_limit.window_secs must be greater than 0");
        }

        if self.template_cache.max_size == 0 {
            anyhow::bail!("template_cache.max_size must be greater than 0");
        }

        if self.dead_letter.max_size == 0 {
            anyhow::bail!("dead_letter.max_size must be greater than 0");
        }

        if self.client.timeout_secs == 0 {
            anyhow::bail!("client.timeout_secs must be greater than 0");
        }

        validate_destinations(&self.destinations).context("invalid destination configuration")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, env, io::Write, sync::Mutex};

    use herald_delivery::{BackoffStrategy, Encoding};

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct TestEnvGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        vars: Vec<String>,
        originals: HashMap<String, Option<String>>,
    }

    impl TestEnvGuard {
        fn new() -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Self { _lock: lock, vars: Vec::new(), originals: HashMap::new() }
        }

        fn set_var(&mut self, key: &str, value: &str) {
            if !self.vars.contains(&key.to_string()) {
                self.originals.insert(key.to_string(), env::var(key).ok());
                self.vars.push(key.to_string());
            }
            env::set_var(key, value);
        }
    }

    impl Drop for TestEnvGuard {
        fn drop(&mut self) {
            for var in &self.vars {
                match self.originals.get(var) {
                    Some(Some(value)) => env::set_var(var, value),
                    Some(None) => env::remove_var(var),
                    None => {},
                }
            }
        }
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const SAMPLE: &str = r#"
        [server]
        port = 9000

        [auth]
        bearer_tokens = ["s3cret"]

        [dead_letter]
        max_size = 50

        [[destinations]]
        name = "chat"
        url = "https://chat.example.com/hook"
        per_alert = true
        parallel_requests = 4

        [destinations.transform]
        kind = "pointer"
        spec = "/alert/labels"

        [[destinations]]
        name = "siem"
        url = "https://siem.example.com/ingest"
        encoding = "form"

        [destinations.retry]
        max_attempts = 5
        backoff = "linear"
    "#;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8080);
        assert!(!config.auth.is_enabled());

        let limits = config.to_rate_limit_config();
        assert_eq!(limits.max_attempts, 5);
        assert_eq!(limits.window, Duration::from_secs(60));
        assert_eq!(limits.ban_duration, Duration::from_secs(900));

        let cache = config.to_template_cache_config();
        assert_eq!(cache.max_size, 100);
        assert_eq!(cache.ttl, Duration::from_secs(3600));

        let dead_letter = config.to_dead_letter_config();
        assert!(dead_letter.enabled);
        assert_eq!(dead_letter.max_size, 1000);
        assert_eq!(dead_letter.ttl, Duration::from_secs(86_400));
        assert_eq!(config.to_client_config(), ClientConfig::default());
    }

    #[test]
    fn loads_destinations_from_file() {
        let _guard = TestEnvGuard::new();
        let file = write_config(SAMPLE);

        let config = Config::load_from(file.path()).expect("sample config should load");

        assert_eq!(config.server.port, 9000);
        assert!(config.auth.is_enabled());
        assert_eq!(config.dead_letter.max_size, 50);
        assert_eq!(config.destinations.len(), 2);

        let chat = config.destination("chat").unwrap();
        assert!(chat.per_alert);
        assert_eq!(chat.parallel_requests, 4);
        assert_eq!(chat.transform.kind, "pointer");

        let siem = config.destination("siem").unwrap();
        assert_eq!(siem.encoding, Encoding::Form);
        assert_eq!(siem.retry.max_attempts, 5);
        assert_eq!(siem.retry.backoff, BackoffStrategy::Linear);
        assert_eq!(siem.circuit.failure_threshold, 5);

        assert!(config.destination("missing").is_none());
    }

    #[test]
    fn env_overrides_file() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("HERALD_SERVER__PORT", "9191");
        guard.set_var("HERALD_RATE_LIMIT__MAX_ATTEMPTS", "3");
        guard.set_var("HERALD_DEAD_LETTER__ENABLED", "false");
        let file = write_config(SAMPLE);

        let config = Config::load_from(file.path()).expect("config should load with env overrides");

        assert_eq!(config.server.port, 9191);
        assert_eq!(config.rate_limit.max_attempts, 3);
        assert!(!config.dead_letter.enabled);
        assert_eq!(config.dead_letter.max_size, 50);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let _guard = TestEnvGuard::new();
        let dir = tempfile::tempdir().unwrap();

        let config = Config::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn invalid_destination_fails_load() {
        let _guard = TestEnvGuard::new();
        let file = write_config(
            r#"
            [[destinations]]
            name = "chat"
            url = "https://chat.example.com"

            [[destinations]]
            name = "chat"
            url = "https://other.example.com"
            "#,
        );

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate destination name 'chat'"));
    }

    #[test]
    fn invalid_config_validation_fails() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.auth.username = Some("ops".to_string());
        assert!(config.validate().is_err());

        config = Config::default();
        config.auth.bearer_tokens = vec![" ".to_string()];
        assert!(config.validate().is_err());

        config = Config::default();
        config.rate_limit.max_attempts = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.template_cache.max_size = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.dead_letter.max_size = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.destinations.push(DestinationConfig::new("chat", ""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn socket_address_parsing() {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 9000;

        let addr = config.parse_server_addr().expect("Should parse socket address");

        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(addr.port(), 9000);
    }
}
