//! Configuration parsing and structures

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::Deserialize;

use crate::cache::SessionCacheConfig;
use crate::env::substitute_env_vars;
use crate::store::MIN_PART_SIZE;

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Session cache shared by region lookups and delegated sessions
    #[serde(default)]
    pub session_cache: SessionCacheConfig,

    /// S3 backend settings
    #[serde(default)]
    pub s3: RawS3Settings,

    /// Named backend connections
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

/// S3 settings before size parsing
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawS3Settings {
    /// Region used when a connection does not name one
    pub default_region: Option<String>,

    /// Region assumed when a container's location cannot be looked up
    pub fallback_region: Option<String>,

    /// Multipart upload part size (e.g., "8MB")
    pub part_size: Option<String>,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub session_cache: SessionCacheConfig,
    pub s3: S3Settings,
    pub connections: Vec<ConnectionConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// S3 backend settings (resolved)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub default_region: String,
    pub fallback_region: String,
    /// Multipart upload part size in bytes
    pub part_size: usize,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            default_region: "us-east-2".to_string(),
            fallback_region: "us-east-1".to_string(),
            part_size: 8 * 1024 * 1024,
        }
    }
}

/// A named set of login parameters for one backend type
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,

    /// Registered backend type ("s3", "workspaces")
    #[serde(rename = "type")]
    pub backend_type: String,

    /// Parameters handed to the backend factory
    #[serde(default)]
    pub params: HashMap<String, String>,
}

// =============================================================================
// Resolution Logic
// =============================================================================

/// Parse size string like "8MB" to bytes
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().to_uppercase();
    let (num_part, multiplier) = if let Some(n) = s.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1)
    } else {
        (s.as_str(), 1)
    };

    num_part.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

impl RawConfig {
    /// Resolve raw config into final config, filling in S3 defaults
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let RawConfig {
            logging,
            session_cache,
            s3,
            connections,
        } = self;

        Ok(Config {
            logging,
            session_cache,
            s3: Self::resolve_s3(s3)?,
            connections,
        })
    }

    fn resolve_s3(raw: RawS3Settings) -> Result<S3Settings, ConfigError> {
        let defaults = S3Settings::default();

        let part_size = match raw.part_size {
            None => defaults.part_size,
            Some(s) => parse_size(&s)
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| {
                    ConfigError::ValidationError(format!("s3.part_size: invalid size {:?}", s))
                })?,
        };

        Ok(S3Settings {
            default_region: raw.default_region.unwrap_or(defaults.default_region),
            fallback_region: raw.fallback_region.unwrap_or(defaults.fallback_region),
            part_size,
        })
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.clone(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, substituting `${VAR}` references first
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        let raw: RawConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Look up a connection by name
    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.name == name)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one connection is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for connection in &self.connections {
            if connection.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Connection name cannot be empty".to_string(),
                ));
            }
            if !names.insert(connection.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate connection name: {}",
                    connection.name
                )));
            }
        }

        if self.s3.part_size < MIN_PART_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "s3.part_size must be at least {} bytes (got {})",
                MIN_PART_SIZE, self.s3.part_size
            )));
        }

        if self.session_cache.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "session_cache.capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
