//! Configuration types for Braid

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Transaction engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XaConfig {
    /// Node identifier mixed into generated transaction and branch ids.
    ///
    /// Operators should give each host its own value. Processes that share
    /// one are still told apart by the per-generator instance bits.
    #[serde(default = "default_node_id")]
    pub node_id: u8,

    /// Time after which an unfinished transaction is rolled back
    #[serde(default = "default_transaction_timeout", with = "humantime_serde")]
    pub transaction_timeout: Duration,

    /// How often the expiry timer scans for overdue transactions
    #[serde(default = "default_expiry_check_interval", with = "humantime_serde")]
    pub expiry_check_interval: Duration,

    /// Read timeout for remote PREPARE/COMMIT/ROLLBACK commands
    #[serde(default = "default_remote_timeout", with = "humantime_serde")]
    pub remote_timeout: Duration,

    /// Commit a lone participant in one phase instead of prepare + commit
    #[serde(default = "default_true")]
    pub one_phase_optimization: bool,

    /// Prepare branches concurrently when a transaction has more than one
    #[serde(default = "default_true")]
    pub parallel_prepare: bool,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_node_id() -> u8 {
    1
}

fn default_transaction_timeout() -> Duration {
    Duration::from_millis(30_000)
}

fn default_expiry_check_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

impl Default for XaConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            transaction_timeout: default_transaction_timeout(),
            expiry_check_interval: default_expiry_check_interval(),
            remote_timeout: default_remote_timeout(),
            one_phase_optimization: true,
            parallel_prepare: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl XaConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&text)?;
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.transaction_timeout.is_zero() {
            errors.push("transaction_timeout must be > 0".to_string());
        }

        if self.expiry_check_interval.is_zero() {
            errors.push("expiry_check_interval must be > 0".to_string());
        }

        if self.remote_timeout.is_zero() {
            errors.push("remote_timeout must be > 0".to_string());
        }

        if self.logging.format != "text" && self.logging.format != "json" {
            errors.push(format!(
                "logging.format must be \"text\" or \"json\", got {:?}",
                self.logging.format
            ));
        }

        // Warnings (logged but not fatal)
        if self.expiry_check_interval > self.transaction_timeout {
            tracing::warn!(
                "expiry_check_interval {:?} exceeds transaction_timeout {:?}; expired transactions will linger",
                self.expiry_check_interval,
                self.transaction_timeout
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    pub level: String,

    /// Log format (json or text)
    pub format: String,

    /// Log file path (None for stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

/// Duration serialization helper
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
