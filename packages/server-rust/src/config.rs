//! Server configuration: explicit option structs, JSON file loading, and
//! per-environment overlay files.
//!
//! A base file plus `--environment prod` looks for `<stem>.prod.json`
//! next to it and merges its top-level fields over the base before
//! deserializing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file {}: {source}", path.display())]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid JSON for [`ServerConfig`].
    #[error("cannot parse config file {}: {source}", path.display())]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying serde error.
        source: serde_json::Error,
    },
    /// A field value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// All recognized server options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Connection slots; further clients get a `CAPACITY` error frame.
    pub max_concurrent_connections: u32,
    /// Per-connection read/write deadline.
    pub connection_timeout_ms: u32,
    /// TCP keepalive probe interval.
    pub keep_alive_interval_ms: u32,
    /// Socket receive buffer; values below 64 KiB are raised to 64 KiB.
    pub receive_buffer_size: u32,
    /// Socket send buffer; values below 64 KiB are raised to 64 KiB.
    pub send_buffer_size: u32,
    /// Root directory for persisted collections.
    pub data_path: PathBuf,
    /// Cache capacity in entries.
    pub max_cache_item_count: u32,
    /// Cache capacity in bytes.
    pub max_cache_size_bytes: u64,
    /// Default cache entry TTL.
    pub default_cache_ttl_ms: u64,
    /// Whether commands require a prior successful authentication.
    pub require_authentication: bool,
    /// Master password checked by the bundled authenticator.
    pub master_password: Option<String>,
    /// Token lifetime issued by the bundled authenticator.
    pub token_expiration_hours: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
            max_concurrent_connections: 10_000,
            connection_timeout_ms: 30_000,
            keep_alive_interval_ms: 60_000,
            receive_buffer_size: 65_536,
            send_buffer_size: 65_536,
            data_path: PathBuf::from("data"),
            max_cache_item_count: 10_000,
            max_cache_size_bytes: 100 * 1024 * 1024,
            default_cache_ttl_ms: 1_800_000,
            require_authentication: false,
            master_password: None,
            token_expiration_hours: 24,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `path`, overlaying the environment file
    /// (`<stem>.<environment>.json`) when one exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on unreadable files, parse failures, or
    /// out-of-range values.
    pub fn load(path: &Path, environment: Option<&str>) -> Result<Self, ConfigError> {
        let mut base = read_json(path)?;
        if let Some(env) = environment {
            let overlay_path = sibling_for_environment(path, env);
            if overlay_path.exists() {
                let overlay = read_json(&overlay_path)?;
                merge(&mut base, overlay);
            } else {
                tracing::debug!(path = %overlay_path.display(), "no environment overlay file");
            }
        }
        let config: Self = serde_json::from_value(base).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_connections == 0 {
            return Err(ConfigError::Invalid(
                "maxConcurrentConnections must be > 0".into(),
            ));
        }
        if self.max_cache_item_count == 0 {
            return Err(ConfigError::Invalid("maxCacheItemCount must be > 0".into()));
        }
        if self.max_cache_size_bytes == 0 {
            return Err(ConfigError::Invalid("maxCacheSizeBytes must be > 0".into()));
        }
        if self.default_cache_ttl_ms == 0 {
            return Err(ConfigError::Invalid("defaultCacheTtlMs must be > 0".into()));
        }
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connectionTimeoutMs must be > 0".into()));
        }
        Ok(())
    }

    /// The per-connection I/O deadline.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.connection_timeout_ms))
    }

    /// The keepalive probe interval.
    #[must_use]
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.keep_alive_interval_ms))
    }

    /// Receive buffer size, floored at 64 KiB.
    #[must_use]
    pub fn effective_receive_buffer(&self) -> usize {
        (self.receive_buffer_size as usize).max(65_536)
    }

    /// Send buffer size, floored at 64 KiB.
    #[must_use]
    pub fn effective_send_buffer(&self) -> usize {
        (self.send_buffer_size as usize).max(65_536)
    }
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn sibling_for_environment(path: &Path, environment: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map_or_else(|| "config".to_string(), |s| s.to_string_lossy().into_owned());
    path.with_file_name(format!("{stem}.{environment}.json"))
}

/// Shallow merge: overlay's top-level fields replace the base's.
fn merge(base: &mut Value, overlay: Value) {
    if let (Value::Object(base_map), Value::Object(overlay_map)) = (base, overlay) {
        for (k, v) in overlay_map {
            base_map.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9090);
        assert_eq!(config.max_concurrent_connections, 10_000);
        assert_eq!(config.connection_timeout_ms, 30_000);
        assert_eq!(config.data_path, PathBuf::from("data"));
        assert_eq!(config.max_cache_item_count, 10_000);
        assert_eq!(config.max_cache_size_bytes, 100 * 1024 * 1024);
        assert_eq!(config.default_cache_ttl_ms, 1_800_000);
        assert!(!config.require_authentication);
    }

    #[test]
    fn buffers_are_floored_at_64k() {
        let config = ServerConfig {
            receive_buffer_size: 1024,
            send_buffer_size: 128 * 1024,
            ..ServerConfig::default()
        };
        assert_eq!(config.effective_receive_buffer(), 65_536);
        assert_eq!(config.effective_send_buffer(), 128 * 1024);
    }

    #[test]
    fn validation_rejects_zero_capacities() {
        let config = ServerConfig {
            max_concurrent_connections: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_cache_size_bytes: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_with_environment_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("server.json");
        std::fs::write(&base, r#"{"port": 7000, "host": "127.0.0.1"}"#).unwrap();
        std::fs::write(
            dir.path().join("server.test.json"),
            r#"{"port": 7001}"#,
        )
        .unwrap();

        let config = ServerConfig::load(&base, Some("test")).unwrap();
        assert_eq!(config.port, 7001);
        assert_eq!(config.host, "127.0.0.1");

        let config = ServerConfig::load(&base, None).unwrap();
        assert_eq!(config.port, 7000);
    }

    #[test]
    fn missing_overlay_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("server.json");
        std::fs::write(&base, "{}").unwrap();
        let config = ServerConfig::load(&base, Some("nope")).unwrap();
        assert_eq!(config.port, 9090);
    }
}
