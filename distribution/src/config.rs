//! Configuration for the distribution service

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Distribution service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Asset symbol handled by this deployment
    pub asset: String,

    /// Ledger configuration (data dir, precision, RocksDB tuning)
    pub ledger: luckymoney_ledger::Config,

    /// Distribution rules
    pub distribution: DistributionConfig,

    /// Expiration scheduler and reconciler
    pub scheduler: SchedulerConfig,

    /// Withdraw flow
    pub withdraw: WithdrawConfig,

    /// Compensating unlock retry policy
    pub compensation: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "luckymoney".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            asset: "GRAM".to_string(),
            ledger: luckymoney_ledger::Config::default(),
            distribution: DistributionConfig::default(),
            scheduler: SchedulerConfig::default(),
            withdraw: WithdrawConfig::default(),
            compensation: RetryConfig::default(),
        }
    }
}

/// Distribution rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Seconds after creation at which unclaimed funds are refunded (default: 24h)
    pub expire_secs: u64,

    /// Maximum message length in characters
    pub max_message_len: usize,

    /// Reject claims until the owner activates the distribution
    pub require_activation: bool,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            expire_secs: 24 * 60 * 60,
            max_message_len: 128,
            require_activation: false,
        }
    }
}

/// Expiration scheduler and reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick interval in milliseconds
    pub tick_interval_ms: u64,

    /// Maximum concurrent expiry workers
    pub worker_pool_size: usize,

    /// Seconds between reconciliation passes
    pub reconcile_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            worker_pool_size: 8,
            reconcile_interval_secs: 60,
        }
    }
}

/// Withdraw configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WithdrawConfig {
    /// Flat fee charged on top of the withdrawn amount
    pub fee: Decimal,

    /// Seconds to wait for the external network outcome
    pub timeout_secs: u64,
}

impl Default for WithdrawConfig {
    fn default() -> Self {
        Self {
            fee: Decimal::new(10, 2),
            timeout_secs: 60,
        }
    }
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, first one included
    pub attempts: u32,

    /// Delay before the first retry in milliseconds (doubles per attempt)
    pub initial_backoff_ms: u64,

    /// Upper bound on a single delay in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config {
            ledger: luckymoney_ledger::Config::from_env()?,
            ..Default::default()
        };

        if let Ok(asset) = std::env::var("LUCKYMONEY_ASSET") {
            config.asset = asset;
        }

        if let Ok(expire) = std::env::var("LUCKYMONEY_EXPIRE_SECS") {
            config.distribution.expire_secs = parse_env("LUCKYMONEY_EXPIRE_SECS", &expire)?;
        }

        if let Ok(pool) = std::env::var("LUCKYMONEY_WORKER_POOL_SIZE") {
            config.scheduler.worker_pool_size = parse_env("LUCKYMONEY_WORKER_POOL_SIZE", &pool)?;
        }

        if let Ok(fee) = std::env::var("LUCKYMONEY_WITHDRAW_FEE") {
            config.withdraw.fee = parse_env("LUCKYMONEY_WITHDRAW_FEE", &fee)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject unusable settings
    pub fn validate(&self) -> crate::Result<()> {
        self.ledger.validate()?;
        if self.asset.is_empty() {
            return Err(crate::Error::Config("asset must not be empty".to_string()));
        }
        if self.scheduler.worker_pool_size == 0 {
            return Err(crate::Error::Config("worker_pool_size must be at least 1".to_string()));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(crate::Error::Config("tick_interval_ms must be positive".to_string()));
        }
        if self.compensation.attempts == 0 {
            return Err(crate::Error::Config("compensation.attempts must be at least 1".to_string()));
        }
        if self.withdraw.fee < Decimal::ZERO {
            return Err(crate::Error::Config("withdraw fee must not be negative".to_string()));
        }
        Ok(())
    }

    /// Expiry window
    pub fn expire_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.distribution.expire_secs as i64)
    }
}

fn parse_env<T>(name: &str, value: &str) -> crate::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {} '{}': {}", name, value, e)))
}
