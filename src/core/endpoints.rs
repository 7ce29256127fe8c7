use crate::core::config::ConfigError;
use crate::core::types::StreamKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Testnet,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => f.write_str("production"),
            Self::Testnet => f.write_str("testnet"),
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" | "mainnet" => Ok(Self::Production),
            "testnet" | "test" => Ok(Self::Testnet),
            other => Err(ConfigError::InvalidConfiguration(format!(
                "Unknown environment '{}'",
                other
            ))),
        }
    }
}

pub const FUTURES_BASE: &str = "futures.base";
pub const FUTURES_LISTEN_KEY: &str = "futures.listenKey";
pub const FUTURES_WS_BASE: &str = "futures.wsBase";
pub const FUTURES_COMBINED_STREAM: &str = "futures.combinedStream";
pub const SPOT_BASE: &str = "spot.base";
pub const SPOT_LISTEN_KEY: &str = "spot.listenKey";
pub const SPOT_WS_BASE: &str = "spot.wsBase";

const LOGICAL_NAMES: [&str; 7] = [
    FUTURES_BASE,
    FUTURES_LISTEN_KEY,
    FUTURES_WS_BASE,
    FUTURES_COMBINED_STREAM,
    SPOT_BASE,
    SPOT_LISTEN_KEY,
    SPOT_WS_BASE,
];

fn defaults(environment: Environment) -> [&'static str; 7] {
    match environment {
        Environment::Production => [
            "https://fapi.binance.com",
            "/fapi/v1/listenKey",
            "wss://fstream.binance.com/ws/",
            "wss://fstream.binance.com/stream?streams=",
            "https://api.binance.com",
            "/api/v3/userDataStream",
            "wss://stream.binance.com:9443/ws/",
        ],
        // The testnet has no spot user stream; the "spot" family points at coin-margined futures.
        Environment::Testnet => [
            "https://testnet.binancefuture.com",
            "/fapi/v1/listenKey",
            "wss://stream.binancefuture.com/ws/",
            "wss://stream.binancefuture.com/stream?streams=",
            "https://testnet.binancefuture.com",
            "/dapi/v1/listenKey",
            "wss://dstream.binancefuture.com/ws/",
        ],
    }
}

/// Logical endpoint name to URL/path mapping, resolved once per environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSet {
    environment: Environment,
    urls: HashMap<&'static str, String>,
}

impl EndpointSet {
    /// Resolve the defaults for `environment` and apply `overrides` on top.
    ///
    /// Overrides naming an unknown logical endpoint are rejected rather than ignored.
    pub fn resolve(
        environment: Environment,
        overrides: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut urls: HashMap<&'static str, String> = LOGICAL_NAMES
            .iter()
            .zip(defaults(environment))
            .map(|(name, url)| (*name, url.to_string()))
            .collect();

        for (name, url) in overrides {
            let key = LOGICAL_NAMES
                .iter()
                .find(|known| **known == name.as_str())
                .ok_or_else(|| {
                    ConfigError::InvalidConfiguration(format!(
                        "Unknown endpoint override '{}'",
                        name
                    ))
                })?;
            urls.insert(key, url.clone());
        }

        Ok(Self { environment, urls })
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn get(&self, name: &str) -> Result<&str, ConfigError> {
        self.urls.get(name).map(String::as_str).ok_or_else(|| {
            ConfigError::InvalidConfiguration(format!("Unknown endpoint '{}'", name))
        })
    }

    pub fn rest_base(&self, kind: StreamKind) -> &str {
        self.lookup(match kind {
            StreamKind::Futures => FUTURES_BASE,
            StreamKind::Spot => SPOT_BASE,
        })
    }

    pub fn listen_key_path(&self, kind: StreamKind) -> &str {
        self.lookup(match kind {
            StreamKind::Futures => FUTURES_LISTEN_KEY,
            StreamKind::Spot => SPOT_LISTEN_KEY,
        })
    }

    pub fn ws_base(&self, kind: StreamKind) -> &str {
        self.lookup(match kind {
            StreamKind::Futures => FUTURES_WS_BASE,
            StreamKind::Spot => SPOT_WS_BASE,
        })
    }

    pub fn combined_stream_base(&self) -> &str {
        self.lookup(FUTURES_COMBINED_STREAM)
    }

    // Every name in LOGICAL_NAMES is populated by `resolve`.
    fn lookup(&self, name: &'static str) -> &str {
        self.urls.get(name).map_or("", String::as_str)
    }
}
