//! Configuration parsing.
//!
//! The configuration is a value object constructed once at process start
//! (from a TOML file) and passed by reference into the engine and gateway
//! constructors. Business logic never reads ambient global state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OnboardConfig {
    /// Local database and media settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// External account directory settings.
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Upstream feed settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Mail settings.
    #[serde(default)]
    pub mail: MailConfig,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
}

impl OnboardConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// Local database and media settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the `SQLite` database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Root directory for stored attachment bytes.
    #[serde(default = "default_media_root")]
    pub media_root: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            media_root: default_media_root(),
        }
    }
}

/// External account directory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Base endpoint of the external store. Empty disables provisioning
    /// (every run becomes a logged no-op).
    #[serde(default)]
    pub endpoint: String,

    /// Per-call timeout in seconds.
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,

    /// Origin marker stamped on every record this system writes.
    #[serde(default = "default_origin_marker")]
    pub origin_marker: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_secs: default_remote_timeout_secs(),
            origin_marker: default_origin_marker(),
        }
    }
}

/// Upstream feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Feed URL returning the candidate-request array. Empty disables the
    /// pull (lists serve local data only).
    #[serde(default)]
    pub feed_url: String,

    /// Fetch timeout in seconds. Bounds the stall a list call can suffer.
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            feed_url: String::new(),
            timeout_secs: default_remote_timeout_secs(),
        }
    }
}

/// Mail settings (producer side only; delivery is out-of-band).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// From-address stamped on outbound mail.
    #[serde(default = "default_from_address")]
    pub from_address: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from_address: default_from_address(),
        }
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Two-factor code validity window in seconds.
    #[serde(default = "default_two_factor_validity_secs")]
    pub two_factor_validity_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            two_factor_validity_secs: default_two_factor_validity_secs(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("onboard.db")
}

fn default_media_root() -> PathBuf {
    PathBuf::from("media")
}

fn default_remote_timeout_secs() -> u64 {
    15
}

fn default_origin_marker() -> String {
    "onboard".to_string()
}

fn default_from_address() -> String {
    "noreply@onboard.local".to_string()
}

fn default_two_factor_validity_secs() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = OnboardConfig::default();
        assert_eq!(config.database.path, PathBuf::from("onboard.db"));
        assert_eq!(config.upstream.timeout_secs, 15);
        assert_eq!(config.directory.timeout_secs, 15);
        assert_eq!(config.auth.two_factor_validity_secs, 600);
        assert!(config.upstream.feed_url.is_empty());
    }

    #[test]
    fn parses_partial_toml() {
        let config = OnboardConfig::from_toml(
            r#"
            [database]
            path = "/var/lib/onboard/requests.db"

            [upstream]
            feed_url = "https://feed.example.test/records"
            timeout_secs = 5

            [directory]
            endpoint = "https://accounts.example.test/api"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.database.path,
            PathBuf::from("/var/lib/onboard/requests.db")
        );
        assert_eq!(config.upstream.timeout_secs, 5);
        assert_eq!(config.directory.endpoint, "https://accounts.example.test/api");
        // Untouched sections keep their defaults.
        assert_eq!(config.auth.two_factor_validity_secs, 600);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(OnboardConfig::from_toml("[database").is_err());
    }
}
