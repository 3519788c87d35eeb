//! YAML configuration.
//!
//! Loaded once at startup from the path given as the first CLI argument
//! (default `config.yaml`). Invalid configuration is fatal.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

const DEFAULT_PORT: &str = ":8081";
const DEFAULT_TRUST_THRESHOLD: usize = 3;
const DEFAULT_TRUST_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub ratelimit: RateLimitConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. ":8081".
    #[serde(default = "default_port")]
    pub port: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_rate: f64,
    #[serde(default)]
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_addr")]
    pub addr: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: default_redis_addr(),
            password: String::new(),
            db: 0,
        }
    }
}

impl RedisConfig {
    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.addr, self.db)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub facilitator_url: String,
    #[serde(default)]
    pub wallet_address: String,
    #[serde(default = "default_price")]
    pub price_per_capacity: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub optimistic: OptimisticConfig,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            facilitator_url: String::new(),
            wallet_address: String::new(),
            price_per_capacity: default_price(),
            network: default_network(),
            currency: default_currency(),
            optimistic: OptimisticConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimisticConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Successful payments needed to become trusted.
    #[serde(default = "default_trust_threshold")]
    pub trust_threshold: usize,
    /// Sliding window for counting payments, e.g. "1h".
    #[serde(default = "default_trust_window", with = "humantime_serde")]
    pub trust_window: Duration,
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trust_threshold: default_trust_threshold(),
            trust_window: default_trust_window(),
        }
    }
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

fn default_redis_addr() -> String {
    "localhost:6379".to_string()
}

fn default_price() -> String {
    "$0.001".to_string()
}

fn default_network() -> String {
    "eip155:84532".to_string()
}

fn default_currency() -> String {
    "USDC".to_string()
}

fn default_trust_threshold() -> usize {
    DEFAULT_TRUST_THRESHOLD
}

fn default_trust_window() -> Duration {
    DEFAULT_TRUST_WINDOW
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Read and validate a YAML config file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ratelimit.capacity <= 0.0 {
            return Err(ConfigError::Invalid(
                "ratelimit.capacity must be positive".to_string(),
            ));
        }
        if self.ratelimit.refill_rate <= 0.0 {
            return Err(ConfigError::Invalid(
                "ratelimit.refill_rate must be positive".to_string(),
            ));
        }

        if self.payment.enabled {
            Url::parse(&self.payment.facilitator_url).map_err(|_| {
                ConfigError::Invalid(format!(
                    "payment.facilitator_url is not a valid URL: {:?}",
                    self.payment.facilitator_url
                ))
            })?;
            if self.payment.wallet_address.is_empty() {
                return Err(ConfigError::Invalid(
                    "payment.wallet_address is required when payment is enabled".to_string(),
                ));
            }
            tollgate::parse_price(&self.payment.price_per_capacity).map_err(|e| {
                ConfigError::Invalid(format!("payment.price_per_capacity: {e}"))
            })?;
            if self.payment.optimistic.enabled {
                if self.payment.optimistic.trust_threshold == 0 {
                    return Err(ConfigError::Invalid(
                        "payment.optimistic.trust_threshold must be positive".to_string(),
                    ));
                }
                if self.payment.optimistic.trust_window.is_zero() {
                    return Err(ConfigError::Invalid(
                        "payment.optimistic.trust_window must be positive".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Port number parsed from the ":8081"-style listen address.
    pub fn port(&self) -> Result<u16, ConfigError> {
        let raw = self.server.port.trim_start_matches(':');
        raw.parse().map_err(|_| {
            ConfigError::Invalid(format!("server.port is not a port: {:?}", self.server.port))
        })
    }
}
