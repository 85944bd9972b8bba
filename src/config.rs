//! Configuration for the export pipeline

use crate::buffer::{DEFAULT_CAPACITY, MAX_CAPACITY};
use crate::errors::{ExportError, Result};
use crate::telemetry::Temporality;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Sentinel for `export_timeout_ms` that turns the per-cycle timeout off.
pub const NO_TIMEOUT: i64 = -1;

/// Requested aggregation temporality for sums and histograms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalityPreference {
    Delta,
    Cumulative,
    #[default]
    Unspecified,
}

impl TemporalityPreference {
    /// Delta is only honored when the receiving side accepts it.
    pub fn resolve(self, supports_delta: bool) -> Temporality {
        match self {
            TemporalityPreference::Delta if supports_delta => Temporality::Delta,
            TemporalityPreference::Delta => {
                warn!("Collector does not accept delta temporality, exporting cumulative");
                Temporality::Cumulative
            }
            TemporalityPreference::Cumulative | TemporalityPreference::Unspecified => Temporality::Cumulative,
        }
    }
}

impl FromStr for TemporalityPreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "delta" | "lowmemory" => Ok(TemporalityPreference::Delta),
            "cumulative" => Ok(TemporalityPreference::Cumulative),
            "" | "unspecified" => Ok(TemporalityPreference::Unspecified),
            other => Err(format!("unknown temporality preference '{}'", other)),
        }
    }
}

impl fmt::Display for TemporalityPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TemporalityPreference::Delta => "delta",
            TemporalityPreference::Cumulative => "cumulative",
            TemporalityPreference::Unspecified => "unspecified",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Reported as the `service.name` resource attribute
    pub service_name: String,

    /// Base URL of the OTLP/HTTP receiver
    pub endpoint: String,

    /// Time between export cycle starts
    pub export_interval_ms: u64,

    /// Per-cycle timeout, or -1 for none
    pub export_timeout_ms: i64,

    /// Size of each writer's scratch buffer in bytes
    pub buffer_capacity: usize,

    pub temporality_preference: TemporalityPreference,

    /// Whether the receiver accepts delta temporality
    pub collector_supports_delta: bool,

    /// Spans held between cycles before the oldest are dropped
    pub max_queue_size: usize,

    /// Spans drained into a single batch
    pub max_export_batch_size: usize,

    /// Maximum retry attempts for failed transmissions
    pub max_retries: u32,

    /// Base delay between retries, doubled per attempt
    pub retry_backoff_ms: u64,

    /// Per-request HTTP timeout
    pub http_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "unknown_service".to_string(),
            endpoint: "http://localhost:4318".to_string(),
            export_interval_ms: 60_000,
            export_timeout_ms: 30_000,
            buffer_capacity: DEFAULT_CAPACITY,
            temporality_preference: TemporalityPreference::Unspecified,
            collector_supports_delta: true,
            max_queue_size: 2048,
            max_export_batch_size: 512,
            max_retries: 3,
            retry_backoff_ms: 1000,
            http_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from the standard `OTEL_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(service_name) = lookup("OTEL_SERVICE_NAME") {
            config.service_name = service_name;
        }

        if let Some(endpoint) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.endpoint = endpoint;
        }

        if let Some(ms) = parse_first(&lookup, &["OTEL_METRIC_EXPORT_INTERVAL", "OTEL_BSP_SCHEDULE_DELAY"]) {
            config.export_interval_ms = ms;
        }

        if let Some(ms) = parse_first(&lookup, &["OTEL_METRIC_EXPORT_TIMEOUT", "OTEL_BSP_EXPORT_TIMEOUT"]) {
            config.export_timeout_ms = ms;
        }

        if let Some(preference) = parse_first(&lookup, &["OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE"]) {
            config.temporality_preference = preference;
        }

        if let Some(size) = parse_first(&lookup, &["OTEL_BSP_MAX_QUEUE_SIZE"]) {
            config.max_queue_size = size;
        }

        if let Some(size) = parse_first(&lookup, &["OTEL_BSP_MAX_EXPORT_BATCH_SIZE"]) {
            config.max_export_batch_size = size;
        }

        if let Some(ms) = parse_first(&lookup, &["OTEL_EXPORTER_OTLP_TIMEOUT"]) {
            config.http_timeout_ms = ms;
        }

        if let Some(capacity) = parse_first(&lookup, &["OTLP_EXPORT_BUFFER_CAPACITY"]) {
            config.buffer_capacity = capacity;
        }

        if let Some(supported) = lookup("OTLP_COLLECTOR_SUPPORTS_DELTA") {
            config.collector_supports_delta = supported.to_lowercase() == "true";
        }

        if let Some(retries) = parse_first(&lookup, &["OTLP_EXPORT_MAX_RETRIES"]) {
            config.max_retries = retries;
        }

        if let Some(ms) = parse_first(&lookup, &["OTLP_EXPORT_RETRY_BACKOFF_MS"]) {
            config.retry_backoff_ms = ms;
        }

        config
    }

    /// Load configuration from a JSON file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.service_name.is_empty() {
            return Err("service_name cannot be empty".to_string());
        }

        if self.endpoint.is_empty() {
            return Err("endpoint cannot be empty".to_string());
        }

        if self.export_interval_ms < 1 {
            return Err("export_interval_ms must be at least 1".to_string());
        }

        if self.export_timeout_ms != NO_TIMEOUT && self.export_timeout_ms < 1 {
            return Err(format!(
                "export_timeout_ms must be at least 1, or {} to disable it",
                NO_TIMEOUT
            ));
        }

        if self.buffer_capacity == 0 {
            return Err("buffer_capacity must be greater than 0".to_string());
        }

        if self.buffer_capacity > MAX_CAPACITY {
            return Err(format!("buffer_capacity cannot exceed {} bytes", MAX_CAPACITY));
        }

        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".to_string());
        }

        if self.max_export_batch_size == 0 {
            return Err("max_export_batch_size must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Like [`Config::validate`], as a crate error.
    pub fn validated(self) -> Result<Self> {
        self.validate().map_err(ExportError::Config)?;
        Ok(self)
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_millis(self.export_interval_ms)
    }

    /// `None` when the timeout is disabled.
    pub fn export_timeout(&self) -> Option<Duration> {
        u64::try_from(self.export_timeout_ms).ok().map(Duration::from_millis)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn temporality(&self) -> Temporality {
        self.temporality_preference.resolve(self.collector_supports_delta)
    }
}

fn parse_first<T, F>(lookup: &F, keys: &[&str]) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(raw) = lookup(key) {
            match raw.trim().parse() {
                Ok(value) => return Some(value),
                Err(_) => warn!("Ignoring unparsable value '{}' for {}", raw, key),
            }
        }
    }
    None
}
