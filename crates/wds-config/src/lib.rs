//! # wds-config
//!
//! Layered configuration loading for the experiment datastore using figment.
//!
//! Configuration sources (in priority order, highest wins):
//! 1. Environment variables (`WDS_*` prefix, `__` as separator)
//! 2. Project-level `.wds/config.toml`
//! 3. User-level `~/.config/wds/config.toml`
//! 4. Built-in defaults
//!
//! # Environment Variable Mapping
//!
//! Figment maps `WDS_DATABASE__PATH` -> `database.path`,
//! `WDS_ALLOCATION__LOCK_TIMEOUT_MS` -> `allocation.lock_timeout_ms`, etc.
//!
//! # Usage
//!
//! ```no_run
//! use wds_config::WdsConfig;
//!
//! let config = WdsConfig::load_with_dotenv().expect("config");
//! println!("database: {}", config.database.path);
//! ```

mod allocation;
mod database;
mod error;
mod retry;

pub use allocation::AllocationConfig;
pub use database::DatabaseConfig;
pub use error::ConfigError;
pub use retry::RetryConfig;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Longest group name the store accepts.
pub const MAX_GROUP_NAME_LEN: usize = 100;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WdsConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl WdsConfig {
    /// Load configuration from all sources (TOML files + environment variables).
    ///
    /// Does NOT call `dotenvy`; use [`Self::load_with_dotenv`] for `.env` support.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if extraction fails or a value is out of range.
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with `.env` file support.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if extraction fails or a value is out of range.
    pub fn load_with_dotenv() -> Result<Self, ConfigError> {
        Self::load_dotenv_from_workspace();
        Self::load()
    }

    /// Build the figment provider chain.
    ///
    /// Public so tests can inspect the figment directly or add providers on top.
    #[must_use]
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                figment = figment.merge(Toml::file(global_path));
            }
        }

        let local_path = PathBuf::from(".wds/config.toml");
        if local_path.exists() {
            figment = figment.merge(Toml::file(local_path));
        }

        figment.merge(Env::prefixed("WDS_").split("__"))
    }

    /// Reject values the engine cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".into(),
                reason: "must be at least 1".into(),
            });
        }
        let name_len = self.allocation.default_group_name.chars().count();
        if !(1..=MAX_GROUP_NAME_LEN).contains(&name_len) {
            return Err(ConfigError::InvalidValue {
                field: "allocation.default_group_name".into(),
                reason: format!("must be 1 to {MAX_GROUP_NAME_LEN} characters, got {name_len}"),
            });
        }
        if self.allocation.default_completion_target < 0 {
            return Err(ConfigError::InvalidValue {
                field: "allocation.default_completion_target".into(),
                reason: "must not be negative".into(),
            });
        }
        if !self.database.is_file_backed() {
            return Err(ConfigError::InvalidValue {
                field: "database.path".into(),
                reason: "must point to a database file".into(),
            });
        }
        Ok(())
    }

    fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("wds").join("config.toml"))
    }

    /// Load `.env` from the workspace root, falling back to the current dir.
    fn load_dotenv_from_workspace() {
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let mut dir = PathBuf::from(manifest_dir);
            // crate -> crates/ -> workspace root
            for _ in 0..3 {
                let env_path = dir.join(".env");
                if env_path.exists() {
                    let _ = dotenvy::from_path(&env_path);
                    return;
                }
                if !dir.pop() {
                    break;
                }
            }
        }

        let _ = dotenvy::dotenv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = WdsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 4);
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = WdsConfig::default();
        config.retry.max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "retry.max_attempts"));
    }

    #[test]
    fn default_group_name_length_checked() {
        let mut config = WdsConfig::default();
        config.allocation.default_group_name = String::new();
        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "allocation.default_group_name")
        );

        config.allocation.default_group_name = "g".repeat(MAX_GROUP_NAME_LEN + 1);
        assert!(config.validate().is_err());

        config.allocation.default_group_name = "é".repeat(MAX_GROUP_NAME_LEN);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn negative_default_target_rejected() {
        let mut config = WdsConfig::default();
        config.allocation.default_completion_target = -1;
        assert!(config.validate().is_err());
    }
}
