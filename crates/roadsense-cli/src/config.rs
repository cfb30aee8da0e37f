//! `roadsense.toml`: file-backed configuration with a default for every key.

use roadsense_geo::BoundingBox;
use roadsense_pipeline::{DetectionMode, DetectionSettings, FeedSources, PublishSettings};
use roadsense_store::{LockPolicy, is_valid_claim_ttl};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "roadsense.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store: StoreConfig,
    pub feeds: FeedsConfig,
    pub detection: DetectionConfig,
    pub publish: PublishConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub lock_wait_ms: u64,
    /// A lock file older than this was left by a killed process.
    pub lock_stale_seconds: u64,
    pub claim_ttl_seconds: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".roadsense/collisions.jsonl"),
            lock_wait_ms: 2_000,
            lock_stale_seconds: roadsense_store::DEFAULT_STALE_LOCK_AFTER.as_secs(),
            claim_ttl_seconds: roadsense_store::DEFAULT_CLAIM_TTL_SECONDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedsConfig {
    pub situations: PathBuf,
    pub routes: PathBuf,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            situations: PathBuf::from(".roadsense/situations.geojson"),
            routes: PathBuf::from(".roadsense/routes.geojson"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
    pub tolerance_km: f64,
    pub mode: DetectionMode,
    /// `[min_lon, min_lat, max_lon, max_lat]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<BoundingBox>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            tolerance_km: 0.3,
            mode: DetectionMode::Incremental,
            area: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishConfig {
    pub base_topic: String,
    pub send_timeout_ms: u64,
    pub cycle_timeout_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            base_topic: "vts/collisions".to_string(),
            send_timeout_ms: 5_000,
            cycle_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Outbox,
    Stdout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub outbox_path: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Outbox,
            outbox_path: PathBuf::from(".roadsense/outbox.jsonl"),
        }
    }
}

impl Config {
    /// Load from `path`, or from `./roadsense.toml` when it exists, or defaults.
    ///
    /// An explicitly requested file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        if !required && !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text, &path)
    }

    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let tolerance = self.detection.tolerance_km;
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "detection.tolerance_km must be finite and positive, got {tolerance}"
            )));
        }
        if let Some(area) = &self.detection.area
            && !(area.min_lon < area.max_lon && area.min_lat < area.max_lat)
        {
            return Err(ConfigError::Invalid(
                "detection.area must be [min_lon, min_lat, max_lon, max_lat]".to_string(),
            ));
        }
        if self.publish.base_topic.trim().trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid(
                "publish.base_topic must not be empty".to_string(),
            ));
        }
        if self.publish.send_timeout_ms == 0 || self.publish.cycle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "publish timeouts must be positive".to_string(),
            ));
        }
        if !is_valid_claim_ttl(self.store.claim_ttl_seconds) {
            return Err(ConfigError::Invalid(format!(
                "store.claim_ttl_seconds must be in [{}, {}], got {}",
                roadsense_store::MIN_CLAIM_TTL_SECONDS,
                roadsense_store::MAX_CLAIM_TTL_SECONDS,
                self.store.claim_ttl_seconds
            )));
        }
        if self.store.lock_stale_seconds == 0 {
            return Err(ConfigError::Invalid(
                "store.lock_stale_seconds must be positive".to_string(),
            ));
        }
        let claim_ms = self.store.claim_ttl_seconds.unsigned_abs() * 1000;
        let hold_ms = self
            .publish
            .send_timeout_ms
            .saturating_add(self.store.lock_wait_ms);
        if hold_ms.saturating_mul(2) > claim_ms {
            return Err(ConfigError::Invalid(format!(
                "publish.send_timeout_ms + store.lock_wait_ms ({hold_ms}) must be at most half of store.claim_ttl_seconds ({claim_ms} ms)"
            )));
        }
        Ok(())
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy::waiting(Duration::from_millis(self.store.lock_wait_ms))
            .with_stale_after(Duration::from_secs(self.store.lock_stale_seconds))
    }

    pub fn feed_sources(&self) -> FeedSources {
        FeedSources {
            situations: self.feeds.situations.clone(),
            routes: self.feeds.routes.clone(),
        }
    }

    pub fn detection_settings(&self) -> DetectionSettings {
        DetectionSettings {
            tolerance_km: self.detection.tolerance_km,
            mode: self.detection.mode,
            area: self.detection.area,
        }
    }

    pub fn publish_settings(&self) -> PublishSettings {
        PublishSettings {
            base_topic: self.publish.base_topic.clone(),
            send_timeout: Duration::from_millis(self.publish.send_timeout_ms),
            cycle_timeout: Duration::from_millis(self.publish.cycle_timeout_ms),
        }
    }
}
