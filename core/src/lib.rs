//! Bounded localization pose estimation
//!
//! This crate fuses timestamped sensor observations into a map-frame pose estimate (position,
//! orientation and a 6×6 covariance) and validates its own output before handing it to callers.
//! It is intended as the localization core of a mobile robot: sensor drivers, dataset loading and
//! telemetry live outside of it. The estimator never raises data-quality errors synchronously;
//! instead every published [Pose] carries a `valid` flag that callers must check.
//!
//! The primary dependency is [`nalgebra`](https://crates.io/crates/nalgebra), which provides the
//! linear algebra for the filter. Configuration is loaded with `serde` from JSON, YAML or TOML and
//! logging goes through the [`log`](https://crates.io/crates/log) facade.
//!
//! ## Crate overview
//!
//! - [config]: Immutable estimator configuration (map bounds, tolerances, noise, landmarks).
//! - [error]: Error taxonomy for rejected observations, skipped updates and configuration.
//! - [ingest]: Observation ingestion; validates raw readings and enforces per-sensor ordering.
//! - [measurements]: Measurement models (position, attitude, range/bearing) and odometry input.
//! - [linearize]: Analytic Jacobians for the motion and measurement models.
//! - [linalg]: Linear algebra helpers (robust SPD solves, condition numbers).
//! - [kalman]: The error-state extended Kalman filter that maintains the estimate.
//! - [health]: The validity monitor that flags the estimate valid or invalid.
//! - [service]: Lock-light publication of pose snapshots to any number of readers.
//! - [localizer]: The single-writer pipeline tying the above together, plus a threaded runner.
//! - [sim]: Replay of recorded observations and synthetic scenario generation.
//!
//! ## State definition
//!
//! The nominal state is a map-frame position $p$ (meters) and a unit quaternion $q$ rotating body
//! vectors into the map frame. The filter tracks a six dimensional error state
//!
//! $$
//! \delta x = [\delta p_x, \delta p_y, \delta p_z, \delta\theta_x, \delta\theta_y, \delta\theta_z]
//! $$
//!
//! where the attitude error is a small rotation expressed in the body frame, $q_{true} = q \otimes
//! \mathrm{Exp}(\delta\theta)$. For small errors $\delta\theta$ coincides with roll, pitch and yaw
//! perturbations, which is why the published covariance is documented over
//! `[x, y, z, roll, pitch, yaw]`.
//!
//! ## Data flow
//!
//! ```text
//! RawObservation -> Ingestor -> PoseEstimator (predict/update) -> HealthMonitor -> PosePublisher
//!                                                                                  |
//!                                                           PoseReader::current_pose()
//! ```
pub mod config;
pub mod error;
pub mod health;
pub mod ingest;
pub mod kalman;
pub mod linalg;
pub mod linearize;
pub mod localizer;
pub mod measurements;
pub mod service;
pub mod sim;

use nalgebra::{DMatrix, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use std::f64::consts::PI;
use std::fmt::{self, Display};


/// Dimension of the pose error state and of the published covariance.
pub const POSE_DIM: usize = 6;
/// Number of entries in a row-major 6×6 covariance.
pub const COVARIANCE_LEN: usize = POSE_DIM * POSE_DIM;
/// Numerical ceiling for covariance entries. Prediction may grow the covariance up to this value
/// but never beyond, so no infinity can reach a caller.
pub const COVARIANCE_SATURATION: f64 = 1e12;

/// Orientation quaternion as published to callers.
///
/// Unlike [nalgebra::UnitQuaternion] this type does not enforce unit norm; the validity monitor
/// checks the norm explicitly so that a denormalized estimate can be detected and flagged.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}
impl Default for Quaternion {
    fn default() -> Self {
        Quaternion::identity()
    }
}
impl Quaternion {
    pub const fn identity() -> Self {
        Quaternion {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
    pub fn norm_squared(&self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w
    }
    /// True when `| ‖q‖² − 1 | ≤ tolerance`.
    pub fn is_normalized(&self, tolerance: f64) -> bool {
        (self.norm_squared() - 1.0).abs() <= tolerance
    }
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.w.is_finite()
    }
    /// Convert to a unit quaternion, renormalizing. Returns `None` for a zero or non-finite input.
    pub fn to_unit(&self) -> Option<UnitQuaternion<f64>> {
        if !self.is_finite() {
            return None;
        }
        let q = nalgebra::Quaternion::new(self.w, self.x, self.y, self.z);
        UnitQuaternion::try_new(q, 1e-12)
    }
}
impl From<UnitQuaternion<f64>> for Quaternion {
    fn from(q: UnitQuaternion<f64>) -> Self {
        Quaternion {
            x: q.i,
            y: q.j,
            z: q.k,
            w: q.w,
        }
    }
}
impl From<&UnitQuaternion<f64>> for Quaternion {
    fn from(q: &UnitQuaternion<f64>) -> Self {
        Quaternion::from(*q)
    }
}

/// Row-major 6×6 covariance over `[x, y, z, roll, pitch, yaw]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Covariance(pub [f64; COVARIANCE_LEN]);
impl Default for Covariance {
    fn default() -> Self {
        Covariance([0.0; COVARIANCE_LEN])
    }
}
impl Covariance {
    /// Build a covariance from a slice of exactly 36 values.
    ///
    /// # Panics
    /// If `values.len() != 36`. A wrongly sized covariance is an integration bug, not a data
    /// quality issue, so it aborts immediately.
    pub fn from_slice(values: &[f64]) -> Self {
        assert_eq!(
            values.len(),
            COVARIANCE_LEN,
            "Covariance must have exactly 36 elements (6x6), got {}",
            values.len()
        );
        let mut data = [0.0; COVARIANCE_LEN];
        data.copy_from_slice(values);
        Covariance(data)
    }
    /// Build a covariance from a 6×6 matrix.
    ///
    /// # Panics
    /// If the matrix is not 6×6.
    pub fn from_matrix(m: &DMatrix<f64>) -> Self {
        assert_eq!(
            m.shape(),
            (POSE_DIM, POSE_DIM),
            "Covariance matrix must be 6x6, got {:?}",
            m.shape()
        );
        let mut data = [0.0; COVARIANCE_LEN];
        for i in 0..POSE_DIM {
            for j in 0..POSE_DIM {
                data[i * POSE_DIM + j] = m[(i, j)];
            }
        }
        Covariance(data)
    }
    pub fn from_diagonal(diagonal: &[f64; POSE_DIM]) -> Self {
        let mut data = [0.0; COVARIANCE_LEN];
        for (i, v) in diagonal.iter().enumerate() {
            data[i * POSE_DIM + i] = *v;
        }
        Covariance(data)
    }
    pub fn to_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(POSE_DIM, POSE_DIM, &self.0)
    }
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.0[row * POSE_DIM + col]
    }
    pub fn diagonal(&self) -> [f64; POSE_DIM] {
        let mut d = [0.0; POSE_DIM];
        for (i, v) in d.iter_mut().enumerate() {
            *v = self.0[i * POSE_DIM + i];
        }
        d
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
    pub fn is_symmetric(&self, tolerance: f64) -> bool {
        (0..POSE_DIM).all(|i| {
            ((i + 1)..POSE_DIM).all(|j| (self.get(i, j) - self.get(j, i)).abs() <= tolerance)
        })
    }
}

/// Static, axis-aligned map bounds in meters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: f64,
    pub max_z: f64,
}
impl Default for MapBounds {
    fn default() -> Self {
        MapBounds {
            min_x: -100.0,
            max_x: 100.0,
            min_y: -100.0,
            max_y: 100.0,
            min_z: -10.0,
            max_z: 10.0,
        }
    }
}
impl MapBounds {
    /// Inclusive containment test. Non-finite positions are never contained.
    pub fn contains(&self, position: &Vector3<f64>) -> bool {
        (self.min_x..=self.max_x).contains(&position.x)
            && (self.min_y..=self.max_y).contains(&position.y)
            && (self.min_z..=self.max_z).contains(&position.z)
    }
    /// Bounds are well formed when every limit is finite and each min ≤ max.
    pub fn is_well_formed(&self) -> bool {
        let limits = [
            self.min_x, self.max_x, self.min_y, self.max_y, self.min_z, self.max_z,
        ];
        limits.iter().all(|v| v.is_finite())
            && self.min_x <= self.max_x
            && self.min_y <= self.max_y
            && self.min_z <= self.max_z
    }
}

/// A pose snapshot: position, orientation, uncertainty and validity at an instant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    /// Map-frame position in meters
    pub position: Vector3<f64>,
    /// Body-to-map orientation
    pub orientation: Quaternion,
    /// 6×6 covariance over `[x, y, z, roll, pitch, yaw]`
    pub covariance: Covariance,
    /// Whether the validity monitor currently vouches for this estimate
    pub valid: bool,
    /// Observation-clock time of the estimate in seconds
    pub timestamp: f64,
}
impl Default for Pose {
    fn default() -> Self {
        Pose {
            position: Vector3::zeros(),
            orientation: Quaternion::identity(),
            covariance: Covariance::default(),
            valid: false,
            timestamp: 0.0,
        }
    }
}
impl Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.covariance.diagonal();
        write!(
            f,
            "Pose {{ t: {:.3} s, p: [{:.3}, {:.3}, {:.3}] m, q: [{:.4}, {:.4}, {:.4}, {:.4}], var: [{:.2e}, {:.2e}, {:.2e}, {:.2e}, {:.2e}, {:.2e}], valid: {} }}",
            self.timestamp,
            self.position.x,
            self.position.y,
            self.position.z,
            self.orientation.x,
            self.orientation.y,
            self.orientation.z,
            self.orientation.w,
            d[0],
            d[1],
            d[2],
            d[3],
            d[4],
            d[5],
            self.valid
        )
    }
}
impl Pose {
    /// Identity orientation at `position` with an isotropic `variance` on every axis.
    pub fn initial(position: Vector3<f64>, variance: f64, timestamp: f64) -> Self {
        Pose {
            position,
            orientation: Quaternion::identity(),
            covariance: Covariance::from_diagonal(&[variance; POSE_DIM]),
            valid: false,
            timestamp,
        }
    }
    /// True when every numeric field is finite.
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.orientation.is_finite()
            && self.covariance.is_finite()
            && self.timestamp.is_finite()
    }
    /// Roll, pitch, yaw (XYZ Euler) of the orientation in radians.
    pub fn euler_angles(&self) -> (f64, f64, f64) {
        self.orientation
            .to_unit()
            .map(|q| q.euler_angles())
            .unwrap_or((0.0, 0.0, 0.0))
    }
}

/// Wrap an angle in radians to `[-π, π]`.
///
/// Non-finite input yields NaN rather than looping.
pub fn wrap_to_pi(angle: f64) -> f64 {
    if !angle.is_finite() {
        return f64::NAN;
    }
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped == -PI && angle > 0.0 { PI } else { wrapped }
}
