//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Fractional digits of the smallest currency unit (2 = cents)
    pub precision: u32,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "luckymoney-ledger".to_string(),
            precision: 2,
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
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
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(precision) = std::env::var("LEDGER_PRECISION") {
            config.precision = precision.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LEDGER_PRECISION '{}': {}", precision, e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the ledger cannot honour
    pub fn validate(&self) -> crate::Result<()> {
        // rust_decimal carries at most 28 fractional digits
        if self.precision > 18 {
            return Err(crate::Error::Config(format!(
                "precision {} exceeds 18 fractional digits",
                self.precision
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "luckymoney-ledger");
        assert_eq!(config.precision, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("precision = 4\n[rocksdb]\nmax_background_jobs = 8\n").unwrap();
        assert_eq!(config.precision, 4);
        assert_eq!(config.rocksdb.max_background_jobs, 8);
        assert_eq!(config.rocksdb.max_write_buffer_number, 3);
        assert_eq!(config.data_dir, PathBuf::from("./data/ledger"));
    }

    #[test]
    fn test_rejects_excessive_precision() {
        let config = Config {
            precision: 30,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
