//! Tracker configuration loaded from TOML with serde.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. `TRACKER_CONFIG` names the file to load and
//! `TRACKER_BIND_ADDR` overrides the listen address.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Bind address for the HTTP surface.
    pub bind_addr: String,

    /// Files at or below this size (bytes) are stored inline.
    pub inline_threshold: u64,

    /// Physical bytes reserved per logical byte for a pending upload.
    pub replication_factor: u64,

    /// Number of providers used by the replica fallback strategy.
    pub replica_count: usize,

    /// Smallest provider pool that supports erasure coding.
    pub min_erasure_providers: usize,

    /// Provider snapshot refresh period.
    pub chooser_refresh_secs: u64,

    /// TTL for providers fetched outside the snapshot.
    pub provider_cache_ttl_secs: u64,

    /// Minimum accumulated capacity (bytes) for a provider to be eligible.
    pub min_provider_capacity: u64,

    /// Providers silent for longer than this are not eligible. Disabled when absent.
    pub provider_max_silence_secs: Option<u64>,

    /// Lifetime of a replicate task.
    pub task_ttl_secs: u64,

    /// Longest silent gap not counted as downtime.
    pub na_threshold_secs: u64,

    /// Margin trimmed from each side of a computed downtime window.
    pub na_offset_secs: u64,

    /// Period of the availability sweep job.
    pub na_sweep_interval_secs: u64,

    /// Default deadline for request-scoped operations.
    pub request_timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            bind_addr: "127.0.0.1:45900".to_string(),
            inline_threshold: 8 * 1024,
            replication_factor: 3,
            replica_count: 3,
            min_erasure_providers: 6,
            chooser_refresh_secs: 180,
            provider_cache_ttl_secs: 60,
            min_provider_capacity: 1,
            provider_max_silence_secs: None,
            task_ttl_secs: 86_400,
            na_threshold_secs: 300,
            na_offset_secs: 60,
            na_sweep_interval_secs: 3_600,
            request_timeout_ms: 5_000,
        }
    }
}

impl TrackerConfig {
    /// Rejects combinations the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replication_factor == 0 {
            return Err(ConfigError::Invalid("replication_factor must be > 0".into()));
        }
        if self.replica_count == 0 {
            return Err(ConfigError::Invalid("replica_count must be > 0".into()));
        }
        if self.min_erasure_providers < 3 {
            return Err(ConfigError::Invalid(
                "min_erasure_providers must be >= 3".into(),
            ));
        }
        if self.na_threshold_secs == 0 {
            return Err(ConfigError::Invalid("na_threshold_secs must be > 0".into()));
        }
        if self.na_offset_secs >= self.na_threshold_secs {
            return Err(ConfigError::Invalid(
                "na_offset_secs must be smaller than na_threshold_secs".into(),
            ));
        }
        if self.chooser_refresh_secs == 0 || self.na_sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("job intervals must be > 0".into()));
        }
        Ok(())
    }

    pub fn chooser_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.chooser_refresh_secs)
    }

    pub fn provider_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.provider_cache_ttl_secs)
    }

    pub fn na_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.na_sweep_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Loads from `TRACKER_CONFIG` if set, else defaults; applies
    /// `TRACKER_BIND_ADDR` and validates.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("TRACKER_CONFIG") {
            Ok(path) => load_from_file(path)?,
            Err(_) => TrackerConfig::default(),
        };
        if let Ok(addr) = std::env::var("TRACKER_BIND_ADDR") {
            cfg.bind_addr = addr;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Load config from a TOML file path.
/// If file is missing or parse fails, an error is returned.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<TrackerConfig, ConfigError> {
    let s = fs::read_to_string(path.as_ref())?;
    let cfg: TrackerConfig = toml::from_str(&s)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let def = TrackerConfig::default();
        assert!(def.validate().is_ok());
        assert_eq!(def.chooser_refresh_interval(), Duration::from_secs(180));
    }

    #[test]
    fn test_load_from_file_partial() {
        use std::io::Write;
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let toml = r#"
            bind_addr = "0.0.0.0:9000"
            inline_threshold = 1024
            provider_max_silence_secs = 600
        "#;
        let mut f = tmp.reopen().expect("reopen");
        write!(f, "{}", toml).expect("write");
        let cfg = load_from_file(tmp.path()).expect("load");
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.inline_threshold, 1024);
        assert_eq!(cfg.provider_max_silence_secs, Some(600));
        // untouched fields keep defaults
        assert_eq!(cfg.replica_count, 3);
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = load_from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_validate_rejects_offset_above_threshold() {
        let cfg = TrackerConfig {
            na_threshold_secs: 60,
            na_offset_secs: 60,
            ..TrackerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
