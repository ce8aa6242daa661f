//! SDK configuration.
//!
//! All knobs the factory honors, with their defaults. `SdkConfig` is
//! serde-friendly so deployments can keep it in a YAML file and load it with
//! [`SdkConfig::from_file`]; the impression listener is the one field that
//! can only be attached programmatically.
//!
//! ## Example YAML configuration
//!
//! ```yaml
//! features_refresh_rate_secs: 30
//! segments_refresh_rate_secs: 60
//! impressions_mode: optimized
//! streaming_enabled: true
//! flag_sets_filter: ["backend", "checkout"]
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SdkError;
use crate::impressions::{ImpressionListener, ImpressionsMode};

/// Runtime configuration for a factory.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SdkConfig {
    /// HTTP connect timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// HTTP read timeout in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Flag feed poll cadence in seconds.
    #[serde(default = "default_features_refresh_rate_secs")]
    pub features_refresh_rate_secs: u64,

    /// Segment feed poll cadence in seconds.
    #[serde(default = "default_segments_refresh_rate_secs")]
    pub segments_refresh_rate_secs: u64,

    /// Impression flush cadence in seconds.
    #[serde(default = "default_impressions_refresh_rate_secs")]
    pub impressions_refresh_rate_secs: u64,

    /// Per-feature impression-count flush cadence in seconds.
    #[serde(default = "default_impression_counts_refresh_rate_secs")]
    pub impression_counts_refresh_rate_secs: u64,

    /// Unique-keys flush cadence in seconds (NONE impressions mode).
    #[serde(default = "default_unique_keys_refresh_rate_secs")]
    pub unique_keys_refresh_rate_secs: u64,

    /// Event flush cadence in seconds.
    #[serde(default = "default_events_push_rate_secs")]
    pub events_push_rate_secs: u64,

    /// Telemetry flush cadence in seconds.
    #[serde(default = "default_metrics_refresh_rate_secs")]
    pub metrics_refresh_rate_secs: u64,

    /// Spread every poll interval uniformly across 0.5×..2× its base rate.
    #[serde(default)]
    pub randomize_intervals: bool,

    /// When non-zero, `build_factory` blocks up to this many milliseconds
    /// for the first sync before returning.
    #[serde(default)]
    pub ready_ms: u64,

    #[serde(default)]
    pub impressions_mode: ImpressionsMode,

    /// Bounded impression queue capacity; overflow drops the oldest entry.
    #[serde(default = "default_impressions_queue_size")]
    pub impressions_queue_size: usize,

    /// Bounded event queue capacity; overflow drops the oldest entry.
    #[serde(default = "default_events_queue_size")]
    pub events_queue_size: usize,

    /// Use the streaming channel when the backend allows it.
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,

    /// Attach host name / host IP metadata headers to outbound requests.
    #[serde(default = "default_true")]
    pub ip_addresses_enabled: bool,

    /// When set, only flags tagged with one of these sets are fetched,
    /// stored, and evaluable.
    #[serde(default)]
    pub flag_sets_filter: Option<Vec<String>>,

    #[serde(default = "default_sdk_api_base_url")]
    pub sdk_api_base_url: String,

    #[serde(default = "default_events_api_base_url")]
    pub events_api_base_url: String,

    #[serde(default = "default_auth_api_base_url")]
    pub auth_api_base_url: String,

    #[serde(default = "default_streaming_api_base_url")]
    pub streaming_api_base_url: String,

    /// Localhost-mode flag file. Defaults to `$HOME/.split`.
    #[serde(default)]
    pub localhost_file: Option<String>,

    /// Grace window for final flushes during `destroy`, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Synchronous hook invoked for each emitted impression, off the
    /// evaluation hot path. Attach programmatically; never serialized.
    #[serde(skip)]
    pub impression_listener: Option<Arc<dyn ImpressionListener>>,
}

impl SdkConfig {
    /// Load a YAML configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SdkError> {
        let content = fs::read_to_string(&path).map_err(|source| SdkError::LocalhostFile {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string.
    pub fn from_yaml(yaml: &str) -> Result<Self, SdkError> {
        let config: SdkConfig =
            serde_yaml::from_str(yaml).map_err(|e| SdkError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), SdkError> {
        fn nonzero(value: u64, name: &str) -> Result<(), SdkError> {
            if value == 0 {
                return Err(SdkError::InvalidConfig(format!("{name} must be >= 1")));
            }
            Ok(())
        }
        nonzero(self.connection_timeout_ms, "connection_timeout_ms")?;
        nonzero(self.read_timeout_ms, "read_timeout_ms")?;
        nonzero(self.features_refresh_rate_secs, "features_refresh_rate_secs")?;
        nonzero(self.segments_refresh_rate_secs, "segments_refresh_rate_secs")?;
        nonzero(
            self.impressions_refresh_rate_secs,
            "impressions_refresh_rate_secs",
        )?;
        nonzero(self.events_push_rate_secs, "events_push_rate_secs")?;
        nonzero(self.metrics_refresh_rate_secs, "metrics_refresh_rate_secs")?;
        if self.impressions_queue_size == 0 {
            return Err(SdkError::InvalidConfig(
                "impressions_queue_size must be >= 1".to_string(),
            ));
        }
        if self.events_queue_size == 0 {
            return Err(SdkError::InvalidConfig(
                "events_queue_size must be >= 1".to_string(),
            ));
        }
        for (url, name) in [
            (&self.sdk_api_base_url, "sdk_api_base_url"),
            (&self.events_api_base_url, "events_api_base_url"),
            (&self.auth_api_base_url, "auth_api_base_url"),
            (&self.streaming_api_base_url, "streaming_api_base_url"),
        ] {
            if url.trim().is_empty() {
                return Err(SdkError::InvalidConfig(format!("{name} must not be empty")));
            }
        }
        if let Some(filter) = &self.flag_sets_filter {
            if filter.iter().any(|set| set.trim().is_empty()) {
                return Err(SdkError::InvalidConfig(
                    "flag_sets_filter entries must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn features_refresh_rate(&self) -> Duration {
        Duration::from_secs(self.features_refresh_rate_secs)
    }

    pub fn segments_refresh_rate(&self) -> Duration {
        Duration::from_secs(self.segments_refresh_rate_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Flag-set filter as a trimmed CSV for the `sets` query parameter.
    pub fn flag_sets_csv(&self) -> Option<String> {
        let filter = self.flag_sets_filter.as_ref()?;
        if filter.is_empty() {
            return None;
        }
        let mut sets: Vec<&str> = filter.iter().map(|s| s.trim()).collect();
        sets.sort_unstable();
        sets.dedup();
        Some(sets.join(","))
    }
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            features_refresh_rate_secs: default_features_refresh_rate_secs(),
            segments_refresh_rate_secs: default_segments_refresh_rate_secs(),
            impressions_refresh_rate_secs: default_impressions_refresh_rate_secs(),
            impression_counts_refresh_rate_secs: default_impression_counts_refresh_rate_secs(),
            unique_keys_refresh_rate_secs: default_unique_keys_refresh_rate_secs(),
            events_push_rate_secs: default_events_push_rate_secs(),
            metrics_refresh_rate_secs: default_metrics_refresh_rate_secs(),
            randomize_intervals: false,
            ready_ms: 0,
            impressions_mode: ImpressionsMode::default(),
            impressions_queue_size: default_impressions_queue_size(),
            events_queue_size: default_events_queue_size(),
            streaming_enabled: true,
            ip_addresses_enabled: true,
            flag_sets_filter: None,
            sdk_api_base_url: default_sdk_api_base_url(),
            events_api_base_url: default_events_api_base_url(),
            auth_api_base_url: default_auth_api_base_url(),
            streaming_api_base_url: default_streaming_api_base_url(),
            localhost_file: None,
            shutdown_grace_ms: default_shutdown_grace_ms(),
            impression_listener: None,
        }
    }
}

impl fmt::Debug for SdkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkConfig")
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("features_refresh_rate_secs", &self.features_refresh_rate_secs)
            .field("segments_refresh_rate_secs", &self.segments_refresh_rate_secs)
            .field(
                "impressions_refresh_rate_secs",
                &self.impressions_refresh_rate_secs,
            )
            .field("events_push_rate_secs", &self.events_push_rate_secs)
            .field("metrics_refresh_rate_secs", &self.metrics_refresh_rate_secs)
            .field("randomize_intervals", &self.randomize_intervals)
            .field("ready_ms", &self.ready_ms)
            .field("impressions_mode", &self.impressions_mode)
            .field("impressions_queue_size", &self.impressions_queue_size)
            .field("events_queue_size", &self.events_queue_size)
            .field("streaming_enabled", &self.streaming_enabled)
            .field("ip_addresses_enabled", &self.ip_addresses_enabled)
            .field("flag_sets_filter", &self.flag_sets_filter)
            .field("sdk_api_base_url", &self.sdk_api_base_url)
            .field("events_api_base_url", &self.events_api_base_url)
            .field("auth_api_base_url", &self.auth_api_base_url)
            .field("streaming_api_base_url", &self.streaming_api_base_url)
            .field("localhost_file", &self.localhost_file)
            .field("shutdown_grace_ms", &self.shutdown_grace_ms)
            .field("impression_listener", &self.impression_listener.is_some())
            .finish()
    }
}

// Helper functions for serde defaults
fn default_connection_timeout_ms() -> u64 {
    1500
}
fn default_read_timeout_ms() -> u64 {
    1500
}
fn default_features_refresh_rate_secs() -> u64 {
    30
}
fn default_segments_refresh_rate_secs() -> u64 {
    60
}
fn default_impressions_refresh_rate_secs() -> u64 {
    60
}
fn default_impression_counts_refresh_rate_secs() -> u64 {
    1800
}
fn default_unique_keys_refresh_rate_secs() -> u64 {
    900
}
fn default_events_push_rate_secs() -> u64 {
    60
}
fn default_metrics_refresh_rate_secs() -> u64 {
    3600
}
fn default_impressions_queue_size() -> usize {
    5000
}
fn default_events_queue_size() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_sdk_api_base_url() -> String {
    "https://sdk.flagkit.dev/api".to_string()
}
fn default_events_api_base_url() -> String {
    "https://events.flagkit.dev/api".to_string()
}
fn default_auth_api_base_url() -> String {
    "https://auth.flagkit.dev/api/v2/auth".to_string()
}
fn default_streaming_api_base_url() -> String {
    "https://streaming.flagkit.dev/sse".to_string()
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}
