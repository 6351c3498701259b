//! Integration configuration.
//!
//! Options arrive from the host as a flat JSON mapping. Every option has a
//! default, so an empty mapping is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{TracesError, TracesResult, ValidationError};

/// Default output root for persisted segments.
pub const DEFAULT_SINK_DIR: &str = "/config/assist_traces/ndjson";
/// Default output directory for exported datasets.
pub const DEFAULT_DATASET_DIR: &str = "/config/assist_traces/datasets";
/// Default writer queue capacity.
pub const DEFAULT_QUEUE_SIZE: usize = 4096;
/// Default segment size cap in MiB.
pub const DEFAULT_MAX_FILE_MB: u64 = 64;
/// Default correlation window in seconds.
pub const DEFAULT_CORRELATION_WINDOW_SECS: f64 = 30.0;

/// Time granularity of segment partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partitioning {
    /// `<YYYY>/<MM>/<DD>`
    #[default]
    Daily,
    /// `<YYYY>/<MM>/<DD>/<HH>`
    Hourly,
}

/// How aggressively trace text is scrubbed before it is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactionLevel {
    /// Persist text as captured.
    None,
    /// Pattern-based scrubbing plus configured names.
    #[default]
    Basic,
    /// Basic, plus identity-bearing keys are scrubbed everywhere.
    Strict,
}

/// Configuration for the trace integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracesConfig {
    /// Master switch. When false, ingestion is accepted and ignored.
    pub enabled: bool,
    /// Output root for persisted segments.
    pub sink_dir: PathBuf,
    /// Output directory for exported datasets.
    pub dataset_dir: PathBuf,
    /// Partition granularity.
    pub partitioning: Partitioning,
    /// Redaction applied before persistence.
    pub redaction_level: RedactionLevel,
    /// Writer queue capacity.
    pub queue_size: usize,
    /// Segment size cap in MiB.
    pub max_file_mb: u64,
    /// Correlation window in seconds.
    pub correlation_window_secs: f64,
    /// Names scrubbed as `<NAME_i>`.
    pub known_names: Vec<String>,
}

impl Default for TracesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sink_dir: PathBuf::from(DEFAULT_SINK_DIR),
            dataset_dir: PathBuf::from(DEFAULT_DATASET_DIR),
            partitioning: Partitioning::Daily,
            redaction_level: RedactionLevel::Basic,
            queue_size: DEFAULT_QUEUE_SIZE,
            max_file_mb: DEFAULT_MAX_FILE_MB,
            correlation_window_secs: DEFAULT_CORRELATION_WINDOW_SECS,
            known_names: Vec::new(),
        }
    }
}

impl TracesConfig {
    /// Parses and validates a host options mapping.
    ///
    /// `null` is treated as an empty mapping.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown enum values or out-of-range numbers.
    pub fn from_options(options: &Value) -> TracesResult<Self> {
        if options.is_null() {
            return Self::default().validate();
        }
        let cfg: Self = serde_json::from_value(options.clone()).map_err(|e| {
            TracesError::Validation(ValidationError::InvalidOption {
                option: "options".to_string(),
                reason: e.to_string(),
            })
        })?;
        cfg.validate()
    }

    /// Checks numeric bounds.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first offending option.
    pub fn validate(self) -> TracesResult<Self> {
        if self.queue_size == 0 {
            return Err(invalid("queue_size", "must be at least 1"));
        }
        if self.max_file_mb == 0 {
            return Err(invalid("max_file_mb", "must be at least 1"));
        }
        if !(self.correlation_window_secs.is_finite() && self.correlation_window_secs > 0.0) {
            return Err(invalid("correlation_window_secs", "must be a positive number of seconds"));
        }
        if self.sink_dir.as_os_str().is_empty() {
            return Err(invalid("sink_dir", "must not be empty"));
        }
        Ok(self)
    }

    /// Segment size cap in bytes.
    #[must_use]
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_mb.saturating_mul(1024 * 1024)
    }

    /// Correlation window as a `Duration`.
    #[must_use]
    pub fn correlation_window(&self) -> Duration {
        Duration::from_secs_f64(self.correlation_window_secs)
    }
}

fn invalid(option: &str, reason: &str) -> TracesError {
    TracesError::Validation(ValidationError::InvalidOption {
        option: option.to_string(),
        reason: reason.to_string(),
    })
}
