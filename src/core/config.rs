use crate::core::endpoints::{EndpointSet, Environment};
use crate::core::kernel::listen_key::ListenKeyPolicy;
use crate::core::kernel::ws::{ReconnectPolicy, DEFAULT_HEARTBEAT_INTERVAL};
use secrecy::{ExposeSecret, Secret};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_RECV_WINDOW_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub api_key: Secret<String>,
    pub secret_key: Secret<String>,
    pub environment: Environment,
    pub endpoint_overrides: HashMap<String, String>,
    pub recv_window_ms: u64,
    pub hedge_mode: bool,
    pub reconnect: ReconnectPolicy,
    pub listen_key: ListenKeyPolicy,
    pub heartbeat_interval: Duration,
    /// Reopen streams proactively once a socket is this old
    pub max_connection_age: Option<Duration>,
}

// Custom Serialize implementation - never expose secrets in serialization
impl Serialize for ExchangeConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ExchangeConfig", 9)?;
        state.serialize_field("api_key", "[REDACTED]")?;
        state.serialize_field("secret_key", "[REDACTED]")?;
        state.serialize_field("environment", &self.environment)?;
        state.serialize_field("endpoint_overrides", &self.endpoint_overrides)?;
        state.serialize_field("recv_window_ms", &self.recv_window_ms)?;
        state.serialize_field("hedge_mode", &self.hedge_mode)?;
        state.serialize_field("reconnect", &self.reconnect.enabled)?;
        state.serialize_field("max_reconnect_attempts", &self.reconnect.max_attempts)?;
        state.serialize_field(
            "max_connection_age_secs",
            &self.max_connection_age.map(|age| age.as_secs()),
        )?;
        state.end()
    }
}

impl ExchangeConfig {
    /// Create a new configuration with API credentials
    #[must_use]
    pub fn new(api_key: String, secret_key: String) -> Self {
        Self {
            api_key: Secret::new(api_key),
            secret_key: Secret::new(secret_key),
            environment: Environment::Production,
            endpoint_overrides: HashMap::new(),
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
            hedge_mode: false,
            reconnect: ReconnectPolicy::default(),
            listen_key: ListenKeyPolicy::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_connection_age: None,
        }
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `{PREFIX}_API_KEY` (e.g., `BINANCE_API_KEY`)
    /// - `{PREFIX}_SECRET_KEY` (e.g., `BINANCE_SECRET_KEY`)
    /// - `{PREFIX}_TESTNET` (optional, defaults to false)
    /// - `{PREFIX}_RECONNECT`, `{PREFIX}_RECONNECT_DELAY_MS`, `{PREFIX}_MAX_RECONNECT_ATTEMPTS`
    /// - `{PREFIX}_MAX_LISTEN_KEY_RETRIES`, `{PREFIX}_LISTEN_KEY_RETRY_INTERVAL_MS`
    /// - `{PREFIX}_HEDGE_MODE`, `{PREFIX}_RECV_WINDOW`
    /// - `{PREFIX}_MAX_CONNECTION_AGE_SECS` (optional, unset means no limit)
    pub fn from_env(exchange_prefix: &str) -> Result<Self, ConfigError> {
        let prefix = exchange_prefix.to_uppercase();
        let var = |suffix: &str| format!("{}_{}", prefix, suffix);

        let api_key_var = var("API_KEY");
        let secret_key_var = var("SECRET_KEY");

        let api_key = env::var(&api_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(api_key_var))?;
        let secret_key = env::var(&secret_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(secret_key_var))?;

        let mut config = Self::new(api_key, secret_key);

        if parse_env::<bool>(&var("TESTNET"))?.unwrap_or(false) {
            config.environment = Environment::Testnet;
        }
        if let Some(enabled) = parse_env::<bool>(&var("RECONNECT"))? {
            config.reconnect.enabled = enabled;
        }
        if let Some(delay_ms) = parse_env::<u64>(&var("RECONNECT_DELAY_MS"))? {
            config.reconnect.delay = Duration::from_millis(delay_ms);
        }
        if let Some(max_attempts) = parse_env::<u32>(&var("MAX_RECONNECT_ATTEMPTS"))? {
            config.reconnect.max_attempts = max_attempts;
        }
        if let Some(max_retries) = parse_env::<u32>(&var("MAX_LISTEN_KEY_RETRIES"))? {
            config.listen_key.max_retries = max_retries;
        }
        if let Some(interval_ms) = parse_env::<u64>(&var("LISTEN_KEY_RETRY_INTERVAL_MS"))? {
            config.listen_key.retry_interval = Duration::from_millis(interval_ms);
        }
        if let Some(hedge_mode) = parse_env::<bool>(&var("HEDGE_MODE"))? {
            config.hedge_mode = hedge_mode;
        }
        if let Some(recv_window) = parse_env::<u64>(&var("RECV_WINDOW"))? {
            config.recv_window_ms = recv_window;
        }
        if let Some(age_secs) = parse_env::<u64>(&var("MAX_CONNECTION_AGE_SECS"))? {
            config.max_connection_age = Some(Duration::from_secs(age_secs));
        }

        Ok(config)
    }

    /// Create configuration from .env file and environment variables
    ///
    /// A missing .env file is not an error; system environment variables are used instead.
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(exchange_prefix: &str) -> Result<Self, ConfigError> {
        load_env_file(".env")?;
        Self::from_env(exchange_prefix)
    }

    /// Check if this configuration has valid credentials for authenticated operations
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.api_key.expose_secret().is_empty() && !self.secret_key.expose_secret().is_empty()
    }

    /// Select the environment
    #[must_use]
    pub const fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Shorthand for switching between production and testnet
    #[must_use]
    pub const fn testnet(mut self, testnet: bool) -> Self {
        self.environment = if testnet {
            Environment::Testnet
        } else {
            Environment::Production
        };
        self
    }

    /// Override a logical endpoint (e.g. `futures.base`)
    #[must_use]
    pub fn endpoint_override(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.endpoint_overrides.insert(name.into(), url.into());
        self
    }

    #[must_use]
    pub const fn hedge_mode(mut self, hedge_mode: bool) -> Self {
        self.hedge_mode = hedge_mode;
        self
    }

    #[must_use]
    pub const fn recv_window_ms(mut self, recv_window_ms: u64) -> Self {
        self.recv_window_ms = recv_window_ms;
        self
    }

    #[must_use]
    pub const fn reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub const fn listen_key_policy(mut self, policy: ListenKeyPolicy) -> Self {
        self.listen_key = policy;
        self
    }

    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub const fn max_connection_age(mut self, age: Duration) -> Self {
        self.max_connection_age = Some(age);
        self
    }

    /// Resolve the endpoint set for the configured environment and overrides
    pub fn endpoints(&self) -> Result<EndpointSet, ConfigError> {
        EndpointSet::resolve(self.environment, &self.endpoint_overrides)
    }

    /// Get API key (use carefully - exposes secret)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Get secret key (use carefully - exposes secret)
    pub fn secret_key(&self) -> &str {
        self.secret_key.expose_secret()
    }
}

/// Load a .env file into the process environment, tolerating its absence.
#[cfg(feature = "env-file")]
pub fn load_env_file(path: &str) -> Result<(), ConfigError> {
    match dotenv::from_path(path) {
        Ok(()) => Ok(()),
        Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ConfigError::InvalidConfiguration(format!(
            "Failed to load .env file '{}': {}",
            path, e
        ))),
    }
}

/// Read and parse an optional environment variable.
pub fn parse_env<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ConfigError::InvalidConfiguration(format!("{}='{}': {}", name, raw, e))
        }),
        Err(_) => Ok(None),
    }
}

/// Read and parse a required environment variable.
pub fn require_env<T>(name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    parse_env(name)?.ok_or_else(|| ConfigError::MissingEnvironmentVariable(name.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
