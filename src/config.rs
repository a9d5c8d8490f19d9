//! Runtime configuration for tscached.
//!
//! Configuration loads from a JSON file or is constructed programmatically.
//! All cache tuning knobs (series TTL, staleness threshold) live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "tscached", about = "Read-through caching proxy for time-series queries")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "tscached.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,

    /// Backing-store settings.
    pub redis: RedisConfig,

    /// Upstream query service settings.
    pub upstream: UpstreamConfig,

    /// Cache behavior tuning.
    pub cache: CacheConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8008").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8008".to_string(),
        }
    }
}

/// Backing-store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
        }
    }
}

impl RedisConfig {
    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

/// Upstream time-series query service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
        }
    }
}

impl UpstreamConfig {
    /// Full query endpoint URL.
    pub fn query_url(&self) -> String {
        format!(
            "http://{}:{}/api/v1/datapoints/query",
            self.host, self.port
        )
    }
}

/// Cache behavior tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL in seconds applied to series records on persist.
    pub expiry_secs: u64,

    /// A cached descriptor older than this many seconds is considered stale
    /// and triggers a delta fetch instead of a pure cache read.
    pub staleness_threshold_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiry_secs: 10_800, // 3 hours
            staleness_threshold_secs: 300,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.expiry_secs, 10_800);
        assert_eq!(cfg.cache.staleness_threshold_secs, 300);
        assert_eq!(cfg.redis.url(), "redis://localhost:6379");
    }

    #[test]
    fn test_upstream_query_url() {
        let cfg = UpstreamConfig {
            host: "kairos.internal".to_string(),
            port: 8088,
        };
        assert_eq!(
            cfg.query_url(),
            "http://kairos.internal:8088/api/v1/datapoints/query"
        );
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"cache": {"staleness_threshold_secs": 60}}"#).unwrap();
        assert_eq!(cfg.cache.staleness_threshold_secs, 60);
        assert_eq!(cfg.cache.expiry_secs, 10_800);
        assert_eq!(cfg.server.listen, "0.0.0.0:8008");
    }
}
