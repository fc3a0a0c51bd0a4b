//! Observation ingestion.
//!
//! Raw sensor readings arrive from drivers as flat vectors. [Ingestor::ingest] checks their
//! structure and values, enforces non-decreasing timestamps per sensor, and turns them into
//! [Observation]s that the estimator can consume. Rejected readings are dropped, never buffered
//! or retried; they are only counted in [IngestStats].

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::fmt::{self, Display};

use crate::config::EstimatorConfig;
use crate::error::ObservationError;
use crate::linalg::{is_positive_semidefinite, max_asymmetry};
use crate::measurements::landmark_index;

/// Relative tolerance for the symmetry check on observation covariances.
pub const SYMMETRY_TOLERANCE: f64 = 1e-9;
/// Smallest eigenvalue allowed in an observation covariance, relative to its largest.
pub const PSD_TOLERANCE: f64 = 1e-9;

/// The sensor families the estimator understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Map-frame `[x, y, z]`
    Position,
    /// `[roll, pitch, yaw]`
    Attitude,
    /// `[landmark_index, range, azimuth, elevation]`
    RangeBearing,
    /// Body-frame twist `[vx, vy, vz, wx, wy, wz]`
    Odometry,
}
impl SensorKind {
    /// Expected length of the measurement vector.
    pub fn measurement_len(&self) -> usize {
        match self {
            SensorKind::Position | SensorKind::Attitude => 3,
            SensorKind::RangeBearing => 4,
            SensorKind::Odometry => 6,
        }
    }
    /// Expected side length of the (square) measurement covariance.
    pub fn noise_dim(&self) -> usize {
        match self {
            SensorKind::Position | SensorKind::Attitude | SensorKind::RangeBearing => 3,
            SensorKind::Odometry => 6,
        }
    }
}
impl Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SensorKind::Position => "position",
            SensorKind::Attitude => "attitude",
            SensorKind::RangeBearing => "range_bearing",
            SensorKind::Odometry => "odometry",
        };
        write!(f, "{}", s)
    }
}

/// A reading as handed over by a sensor driver, before any validation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub sensor_id: String,
    pub kind: SensorKind,
    /// Observation-clock time in seconds
    pub timestamp: f64,
    pub measurement: Vec<f64>,
    /// Row-major square covariance
    pub covariance: Vec<f64>,
}
impl RawObservation {
    pub fn new(
        sensor_id: &str,
        kind: SensorKind,
        timestamp: f64,
        measurement: Vec<f64>,
        covariance: Vec<f64>,
    ) -> Self {
        RawObservation {
            sensor_id: sensor_id.to_string(),
            kind,
            timestamp,
            measurement,
            covariance,
        }
    }
    /// Convenience constructor taking the covariance diagonal only.
    pub fn with_diagonal(
        sensor_id: &str,
        kind: SensorKind,
        timestamp: f64,
        measurement: Vec<f64>,
        variances: &[f64],
    ) -> Self {
        let n = variances.len();
        let mut covariance = vec![0.0; n * n];
        for (i, v) in variances.iter().enumerate() {
            covariance[i * n + i] = *v;
        }
        RawObservation::new(sensor_id, kind, timestamp, measurement, covariance)
    }
}

/// A validated observation, consumed once by the estimator.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub sensor_id: String,
    pub kind: SensorKind,
    pub timestamp: f64,
    pub measurement: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

/// Running counters of the ingestion outcomes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub accepted: u64,
    pub malformed: u64,
    pub stale: u64,
}
impl IngestStats {
    pub fn rejected(&self) -> u64 {
        self.malformed + self.stale
    }
}

/// Validates raw readings and tracks the last accepted timestamp of every sensor.
#[derive(Clone, Debug)]
pub struct Ingestor {
    landmark_count: usize,
    last_timestamps: HashMap<String, f64>,
    stats: IngestStats,
}
impl Ingestor {
    pub fn new(config: &EstimatorConfig) -> Self {
        Ingestor {
            landmark_count: config.landmarks.len(),
            last_timestamps: HashMap::new(),
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Last accepted timestamp for `sensor_id`, if any.
    pub fn last_timestamp(&self, sensor_id: &str) -> Option<f64> {
        self.last_timestamps.get(sensor_id).copied()
    }

    /// Validate `raw` and convert it into an [Observation].
    ///
    /// Checks run in this order: vector and covariance lengths, finiteness of every value and of
    /// the timestamp, kind-specific contents (landmark index and positive range), the covariance
    /// (non-negative diagonal, symmetric, positive semidefinite), and finally per-sensor
    /// timestamp ordering. Equal timestamps are accepted.
    pub fn ingest(&mut self, raw: &RawObservation) -> Result<Observation, ObservationError> {
        if let Err(reason) = self.check_structure(raw) {
            self.stats.malformed += 1;
            warn!(
                "Dropping malformed {} observation from '{}': {}",
                raw.kind, raw.sensor_id, reason
            );
            return Err(ObservationError::Malformed {
                sensor_id: raw.sensor_id.clone(),
                reason,
            });
        }
        if let Some(&last) = self.last_timestamps.get(&raw.sensor_id) {
            if raw.timestamp < last {
                self.stats.stale += 1;
                debug!(
                    "Dropping stale observation from '{}': t={} < last accepted t={}",
                    raw.sensor_id, raw.timestamp, last
                );
                return Err(ObservationError::Stale {
                    sensor_id: raw.sensor_id.clone(),
                    timestamp: raw.timestamp,
                    last,
                });
            }
        }
        self.last_timestamps.insert(raw.sensor_id.clone(), raw.timestamp);
        self.stats.accepted += 1;
        let n = raw.kind.noise_dim();
        Ok(Observation {
            sensor_id: raw.sensor_id.clone(),
            kind: raw.kind,
            timestamp: raw.timestamp,
            measurement: DVector::from_column_slice(&raw.measurement),
            covariance: DMatrix::from_row_slice(n, n, &raw.covariance),
        })
    }

    fn check_structure(&self, raw: &RawObservation) -> Result<(), String> {
        let expected = raw.kind.measurement_len();
        if raw.measurement.len() != expected {
            return Err(format!(
                "measurement has {} values, expected {}",
                raw.measurement.len(),
                expected
            ));
        }
        let n = raw.kind.noise_dim();
        if raw.covariance.len() != n * n {
            return Err(format!(
                "covariance has {} values, expected {}",
                raw.covariance.len(),
                n * n
            ));
        }
        if !raw.timestamp.is_finite() {
            return Err(format!("non-finite timestamp {}", raw.timestamp));
        }
        if raw.measurement.iter().any(|v| !v.is_finite()) {
            return Err("non-finite measurement value".to_string());
        }
        if raw.covariance.iter().any(|v| !v.is_finite()) {
            return Err("non-finite covariance value".to_string());
        }
        if raw.kind == SensorKind::RangeBearing {
            match landmark_index(raw.measurement[0]) {
                Some(i) if i < self.landmark_count => {}
                _ => {
                    return Err(format!(
                        "landmark index {} does not name one of {} landmarks",
                        raw.measurement[0], self.landmark_count
                    ));
                }
            }
            if raw.measurement[1] <= 0.0 {
                return Err(format!("range must be positive, got {}", raw.measurement[1]));
            }
        }
        let covariance = DMatrix::from_row_slice(n, n, &raw.covariance);
        if covariance.diagonal().iter().any(|v| *v < 0.0) {
            return Err("negative variance on covariance diagonal".to_string());
        }
        let asymmetry = max_asymmetry(&covariance);
        if asymmetry > SYMMETRY_TOLERANCE {
            return Err(format!("covariance is not symmetric (relative error {asymmetry:e})"));
        }
        if !is_positive_semidefinite(&covariance, PSD_TOLERANCE) {
            return Err("covariance is not positive semidefinite".to_string());
        }
        Ok(())
    }
}
