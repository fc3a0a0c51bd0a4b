//! Error types for the pose estimator.
//!
//! Per-observation errors ([ObservationError], [UpdateError]) are always handled
//! locally by dropping the observation and continuing; they are returned to the
//! caller for bookkeeping and logging only. None of them halt the estimator.

use thiserror::Error;

/// Reasons an incoming observation is rejected at ingestion.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObservationError {
    /// Non-finite or structurally invalid input.
    #[error("malformed observation from '{sensor_id}': {reason}")]
    Malformed { sensor_id: String, reason: String },
    /// Timestamp regressed relative to the last accepted observation of the same sensor.
    #[error("stale observation from '{sensor_id}': t={timestamp} precedes last accepted t={last}")]
    Stale {
        sensor_id: String,
        timestamp: f64,
        last: f64,
    },
}

/// Reasons a validated observation could not be applied by the estimator.
///
/// A skipped update is treated as a missed observation by the validity monitor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpdateError {
    /// The innovation covariance is singular, non-finite or its condition number is
    /// above the configured ceiling.
    #[error("ill-conditioned innovation covariance (condition number {condition_number:e})")]
    IllConditioned { condition_number: f64 },
    /// The normalized innovation squared exceeded the chi-square gate.
    #[error("innovation rejected: NIS {nis:.3} above gate {gate:.3}")]
    InnovationRejected { nis: f64, gate: f64 },
    /// The measurement model cannot be linearized at the current estimate
    /// (e.g. the vehicle sits on top of the landmark it is ranging to).
    #[error("degenerate measurement geometry: {0}")]
    DegenerateGeometry(String),
    /// Applying the correction would leave the nominal state non-finite.
    #[error("update produced a non-finite state")]
    NonFinite,
}

/// Errors raised while loading or validating an [crate::config::EstimatorConfig].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration parse error: {0}")]
    Parse(String),
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Top-level error returned by [crate::localizer::Localizer::process].
///
/// Both variants are non-fatal: the observation was dropped and the estimator
/// carries on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocalizerError {
    #[error(transparent)]
    Rejected(#[from] ObservationError),
    #[error(transparent)]
    Skipped(#[from] UpdateError),
}

/// Errors starting a [crate::localizer::LocalizerThread].
#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn localizer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Back-pressure and lifecycle errors of [crate::localizer::LocalizerThread::submit].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("localizer input queue is full")]
    QueueFull,
    #[error("localizer thread has stopped")]
    Disconnected,
}

/// Errors decoding a fixed-size binary pose record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("record length mismatch: expected {expected} bytes, found {found}")]
    Length { expected: usize, found: usize },
    #[error("record version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u16, found: u16 },
}
