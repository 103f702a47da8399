//! Server configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::db::FilesystemDbOptions;
use crate::server::FilesystemOptions;

/// Default configuration constants.
///
/// Collected in one place so deployment profiles only have to override the
/// handful of values they care about.
pub mod defaults {
    /// Default RPC listen address.
    pub const fn default_listen_addr() -> &'static str {
        "0.0.0.0:50128"
    }

    /// Default store location.
    pub const fn default_db_path() -> &'static str {
        "/tmp/gigafs/db"
    }

    /// Default log level.
    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

/// Top-level server configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// Node identity and paths.
    pub node: NodeConfig,

    /// Metadata engine options.
    #[serde(default)]
    pub fs: FilesystemOptions,

    /// Store tuning; environment keys override this section.
    #[serde(default)]
    pub db: FilesystemDbOptions,
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to listen on (IP:port).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Store directory.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_addr() -> String {
    defaults::default_listen_addr().to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from(defaults::default_db_path())
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            db_path: default_db_path(),
            log_level: default_log_level(),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    ReadError(String),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("failed to serialize config: {0}")]
    SerializeError(String),

    #[error("failed to write config: {0}")]
    WriteError(String),

    #[error("configuration validation error: {0}")]
    ValidationError(String),
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{path}: {e}")))?;
        let config: ServerConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteError(format!("{path}: {e}")))?;
        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.listen_addr.is_empty() {
            return Err(ConfigError::ValidationError(
                "listen address cannot be empty".to_string(),
            ));
        }
        match self.node.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "invalid log level: {other}"
                )));
            }
        }
        self.fs
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.node.listen_addr, "0.0.0.0:50128");
        assert_eq!(config.node.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ServerConfig::default();
        config.node.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        config.node.log_level = "debug".to_string();
        config.node.listen_addr = String::new();
        assert!(config.validate().is_err());

        config.node.listen_addr = "127.0.0.1:0".to_string();
        config.fs.dir_index.max_partitions = 100; // not a power of two
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trip() {
        let config = ServerConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(config.node.listen_addr, back.node.listen_addr);
        assert_eq!(config.fs.dir_index.max_partitions, back.fs.dir_index.max_partitions);
        assert_eq!(config.db.block_cache_size, back.db.block_cache_size);
    }
}
