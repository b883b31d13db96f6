//! Configuration settings for marketsync.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides, e.g. `MARKETSYNC__FEED__URL`.
const ENV_PREFIX: &str = "MARKETSYNC";

/// Main configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Streaming feed configuration.
    pub feed: FeedConfig,
    /// Cache TTLs.
    pub cache: CacheConfig,
    /// Pending-operation replay policy.
    pub queue: QueueConfig,
    /// Connectivity probing.
    pub network: NetworkConfig,
    /// Persistent storage location.
    pub storage: StorageConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default location, falling back to defaults.
    pub fn load_or_default() -> crate::Result<Self> {
        Self::load(None)
    }

    /// Load configuration from file, then apply environment overrides.
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(path: Option<PathBuf>) -> crate::Result<Self> {
        let config_path = path.unwrap_or_else(default_config_path);
        Self::load_with_env(&config_path, ENV_PREFIX)
    }

    fn load_with_env(config_path: &Path, prefix: &str) -> crate::Result<Self> {
        let config: Self = ::config::Config::builder()
            .add_source(::config::File::from(config_path).required(false))
            .add_source(
                ::config::Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self, path: Option<PathBuf>) -> crate::Result<()> {
        let config_path = path.unwrap_or_else(default_config_path);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::config(e.to_string()))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Reject values that would make the service misbehave at runtime.
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.feed.url.starts_with("ws://") || self.feed.url.starts_with("wss://")) {
            return Err(crate::Error::config(format!(
                "feed.url must be a ws:// or wss:// URL, got '{}'",
                self.feed.url
            )));
        }
        if self.feed.backoff == BackoffKind::Exponential && self.feed.backoff_multiplier < 1.0 {
            return Err(crate::Error::config(
                "feed.backoff_multiplier must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.feed.jitter_factor) {
            return Err(crate::Error::config(
                "feed.jitter_factor must be between 0.0 and 1.0",
            ));
        }
        if self.queue.max_attempts == Some(0) {
            return Err(crate::Error::config(
                "queue.max_attempts must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> PathBuf {
    super::config_dir()
        .map(|p| p.join("config.toml"))
        .unwrap_or_else(|_| PathBuf::from("config.toml"))
}

/// Reconnect delay strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// Delay grows by `backoff_multiplier` per attempt, capped and jittered.
    Exponential,
}

/// Streaming feed configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// WebSocket URL of the market-data feed.
    pub url: String,
    /// Delay before a retry (first retry for exponential backoff), in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Retries allowed after a failure before settling in `Disconnected`.
    pub max_reconnect_attempts: u32,
    /// Delay strategy between retries.
    pub backoff: BackoffKind,
    /// Growth factor for exponential backoff.
    pub backoff_multiplier: f64,
    /// Upper bound for exponential backoff, in milliseconds.
    pub max_reconnect_delay_ms: u64,
    /// Jitter as a fraction of the delay (exponential backoff only).
    pub jitter_factor: f64,
    /// Symbols to subscribe to on startup.
    pub symbols: Vec<String>,
}

impl FeedConfig {
    /// Base reconnect interval.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Cap on the reconnect delay.
    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://stream.marketsync.local/ws".to_string(),
            reconnect_interval_ms: 3_000,
            max_reconnect_attempts: 5,
            backoff: BackoffKind::Fixed,
            backoff_multiplier: 2.0,
            max_reconnect_delay_ms: 60_000,
            jitter_factor: 0.1,
            symbols: Vec::new(),
        }
    }
}

/// Time-to-live per cache domain, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Price snapshot TTL.
    pub prices_ttl_secs: u64,
    /// Portfolio TTL.
    pub portfolio_ttl_secs: u64,
    /// Trade history TTL.
    pub trades_ttl_secs: u64,
    /// Alerts TTL.
    pub alerts_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prices_ttl_secs: 300,
            portfolio_ttl_secs: 300,
            trades_ttl_secs: 600,
            alerts_ttl_secs: 3_600,
        }
    }
}

/// Replay policy for operations buffered while offline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Failed replays after which an operation is dropped. `None` retries forever.
    pub max_attempts: Option<u32>,
}

/// Connectivity probing for hosts without a platform connectivity API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `host:port` to probe. Probing is disabled when unset.
    pub probe_addr: Option<String>,
    /// Seconds between probes.
    pub probe_interval_secs: u64,
    /// Seconds before a probe counts as failed.
    pub probe_timeout_secs: u64,
    /// Whether to assume connectivity before the first report.
    pub assume_online: bool,
}

impl NetworkConfig {
    /// Interval between probes.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Timeout for a single probe.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_addr: None,
            probe_interval_secs: 10,
            probe_timeout_secs: 3,
            assume_online: true,
        }
    }
}

/// Persistent storage location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the file store. Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the directory the file store should use.
    pub fn resolve_data_dir(&self) -> crate::Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => super::data_dir().map(|dir| dir.join("store")),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Also write a daily-rotated log file under the log directory.
    pub log_to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "marketsync=info".to_string(),
            log_to_file: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            Config::load_with_env(&dir.path().join("absent.toml"), "MARKETSYNC_TEST_NONE")
                .unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.feed.url = "ws://localhost:9001/feed".to_string();
        config.feed.symbols = vec!["BTC".to_string(), "ETH".to_string()];
        config.queue.max_attempts = Some(7);
        config.save(Some(path.clone())).unwrap();

        let loaded = Config::load_with_env(&path, "MARKETSYNC_TEST_NONE").unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\nprices_ttl_secs = 30\n").unwrap();

        let loaded = Config::load_with_env(&path, "MARKETSYNC_TEST_NONE").unwrap();
        assert_eq!(loaded.cache.prices_ttl_secs, 30);
        assert_eq!(loaded.cache.trades_ttl_secs, 600);
        assert_eq!(loaded.feed, FeedConfig::default());
    }

    #[test]
    fn test_validate_rejects_http_url() {
        let mut config = Config::default();
        config.feed.url = "https://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_queue_cap() {
        let mut config = Config::default();
        config.queue.max_attempts = Some(0);
        assert!(config.validate().is_err());
    }
}
