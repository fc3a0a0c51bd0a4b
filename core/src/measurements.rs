//! Measurement models for the pose estimator.
//!
//! This module defines the generic [MeasurementModel] trait and the concrete models for the
//! sensors the estimator understands: map-frame position fixes, absolute attitude (AHRS style
//! roll/pitch/yaw), and range/bearing observations of known landmarks. Odometry is not a
//! measurement in this sense; it is the control input of the motion model and is represented by
//! [VelocityData].

use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector3};

use std::fmt::{self, Display};

use crate::config::Landmark;
use crate::error::ObservationError;
use crate::ingest::{Observation, SensorKind};
use crate::kalman::NominalState;
use crate::linearize::{self, landmark_in_body, log_so3};
use crate::wrap_to_pi;

/// Generic measurement model trait for all types of measurements
pub trait MeasurementModel {
    /// Get the dimension of the measurement vector
    fn get_dimension(&self) -> usize;
    /// Get the measurement in a vector format
    fn get_vector(&self) -> DVector<f64>;
    /// Get the measurement noise characteristics in a matrix format
    fn get_noise(&self) -> DMatrix<f64>;
    /// Get the expected measurement from the state. Measurement model function
    /// that maps the nominal state to measurement space.
    fn get_expected_measurement(&self, state: &NominalState) -> DVector<f64>;
    /// Innovation `z ⊖ h(x)`. Models with angular components override this to wrap angles.
    fn get_innovation(&self, state: &NominalState) -> DVector<f64> {
        self.get_vector() - self.get_expected_measurement(state)
    }
    /// Jacobian of the measurement with respect to the error state, or `None` when the model
    /// cannot be linearized at this state.
    fn get_jacobian(&self, state: &NominalState) -> Option<DMatrix<f64>>;
}

/// Map-frame position fix (e.g. beacon trilateration or a scan-matcher output)
#[derive(Clone, Debug)]
pub struct PositionMeasurement {
    pub position: Vector3<f64>,
    pub noise: DMatrix<f64>,
}
impl Display for PositionMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PositionMeasurement(x: {}, y: {}, z: {}, noise diag: {:?})",
            self.position.x,
            self.position.y,
            self.position.z,
            self.noise.diagonal().as_slice()
        )
    }
}
impl MeasurementModel for PositionMeasurement {
    fn get_dimension(&self) -> usize {
        3
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.position.as_slice())
    }
    fn get_noise(&self) -> DMatrix<f64> {
        self.noise.clone()
    }
    fn get_expected_measurement(&self, state: &NominalState) -> DVector<f64> {
        DVector::from_column_slice(state.position.as_slice())
    }
    fn get_jacobian(&self, _state: &NominalState) -> Option<DMatrix<f64>> {
        Some(linearize::position_jacobian())
    }
}

/// Absolute attitude as roll, pitch, yaw (XYZ Euler, radians)
#[derive(Clone, Debug)]
pub struct AttitudeMeasurement {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub noise: DMatrix<f64>,
}
impl Display for AttitudeMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AttitudeMeasurement(roll: {}, pitch: {}, yaw: {}, noise diag: {:?})",
            self.roll,
            self.pitch,
            self.yaw,
            self.noise.diagonal().as_slice()
        )
    }
}
impl AttitudeMeasurement {
    pub fn orientation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_euler_angles(self.roll, self.pitch, self.yaw)
    }
}
impl MeasurementModel for AttitudeMeasurement {
    fn get_dimension(&self) -> usize {
        3
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.roll, self.pitch, self.yaw])
    }
    fn get_noise(&self) -> DMatrix<f64> {
        self.noise.clone()
    }
    fn get_expected_measurement(&self, state: &NominalState) -> DVector<f64> {
        let (roll, pitch, yaw) = state.orientation.euler_angles();
        DVector::from_vec(vec![roll, pitch, yaw])
    }
    /// Rotation-vector residual `Log(q⁻¹ ⊗ q_meas)`, free of Euler wrap-around and gimbal issues.
    fn get_innovation(&self, state: &NominalState) -> DVector<f64> {
        let residual = log_so3(&(state.orientation.inverse() * self.orientation()));
        DVector::from_column_slice(residual.as_slice())
    }
    fn get_jacobian(&self, _state: &NominalState) -> Option<DMatrix<f64>> {
        Some(linearize::attitude_jacobian())
    }
}

/// Range, azimuth and elevation of a known landmark, measured in the body frame
#[derive(Clone, Debug)]
pub struct RangeBearingMeasurement {
    /// Map-frame landmark position
    pub landmark: Vector3<f64>,
    pub range: f64,
    pub azimuth: f64,
    pub elevation: f64,
    pub noise: DMatrix<f64>,
}
impl Display for RangeBearingMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RangeBearingMeasurement(landmark: [{}, {}, {}], range: {}, azimuth: {}, elevation: {})",
            self.landmark.x,
            self.landmark.y,
            self.landmark.z,
            self.range,
            self.azimuth,
            self.elevation
        )
    }
}
impl MeasurementModel for RangeBearingMeasurement {
    fn get_dimension(&self) -> usize {
        3
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.range, self.azimuth, self.elevation])
    }
    fn get_noise(&self) -> DMatrix<f64> {
        self.noise.clone()
    }
    fn get_expected_measurement(&self, state: &NominalState) -> DVector<f64> {
        let d = landmark_in_body(&state.position, &state.orientation, &self.landmark);
        let rho = (d.x * d.x + d.y * d.y).sqrt();
        DVector::from_vec(vec![d.norm(), d.y.atan2(d.x), d.z.atan2(rho)])
    }
    fn get_innovation(&self, state: &NominalState) -> DVector<f64> {
        let expected = self.get_expected_measurement(state);
        DVector::from_vec(vec![
            self.range - expected[0],
            wrap_to_pi(self.azimuth - expected[1]),
            wrap_to_pi(self.elevation - expected[2]),
        ])
    }
    fn get_jacobian(&self, state: &NominalState) -> Option<DMatrix<f64>> {
        linearize::range_bearing_jacobian(&state.position, &state.orientation, &self.landmark)
    }
}

/// Body-frame twist used as the control input of the motion model
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct VelocityData {
    /// Linear velocity in m/s, body frame x, y, z axis
    pub linear: Vector3<f64>,
    /// Angular velocity in rad/s, body frame x, y, z axis
    pub angular: Vector3<f64>,
}
impl From<(Vector3<f64>, Vector3<f64>)> for VelocityData {
    fn from(data: (Vector3<f64>, Vector3<f64>)) -> Self {
        VelocityData {
            linear: data.0,
            angular: data.1,
        }
    }
}
impl Display for VelocityData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VelocityData {{ linear: [{:.4}, {:.4}, {:.4}], angular: [{:.4}, {:.4}, {:.4}] }}",
            self.linear[0],
            self.linear[1],
            self.linear[2],
            self.angular[0],
            self.angular[1],
            self.angular[2]
        )
    }
}

/// A validated observation turned into something the estimator can consume.
#[derive(Clone, Debug)]
pub enum Measurement {
    Position(PositionMeasurement),
    Attitude(AttitudeMeasurement),
    RangeBearing(RangeBearingMeasurement),
    Odometry(VelocityData),
}
impl Measurement {
    /// Build the measurement model for an ingested observation.
    ///
    /// Ingestion has already checked the layout, so the only failure left is a landmark index
    /// that does not name one of `landmarks`.
    pub fn from_observation(
        observation: &Observation,
        landmarks: &[Landmark],
    ) -> Result<Measurement, ObservationError> {
        let z = &observation.measurement;
        let noise = observation.covariance.clone();
        let measurement = match observation.kind {
            SensorKind::Position => Measurement::Position(PositionMeasurement {
                position: Vector3::new(z[0], z[1], z[2]),
                noise,
            }),
            SensorKind::Attitude => Measurement::Attitude(AttitudeMeasurement {
                roll: z[0],
                pitch: z[1],
                yaw: z[2],
                noise,
            }),
            SensorKind::RangeBearing => {
                let landmark = landmark_index(z[0])
                    .and_then(|i| landmarks.get(i))
                    .ok_or_else(|| ObservationError::Malformed {
                        sensor_id: observation.sensor_id.clone(),
                        reason: format!("unknown landmark index {}", z[0]),
                    })?;
                Measurement::RangeBearing(RangeBearingMeasurement {
                    landmark: landmark.position(),
                    range: z[1],
                    azimuth: z[2],
                    elevation: z[3],
                    noise,
                })
            }
            SensorKind::Odometry => Measurement::Odometry(VelocityData {
                linear: Vector3::new(z[0], z[1], z[2]),
                angular: Vector3::new(z[3], z[4], z[5]),
            }),
        };
        Ok(measurement)
    }
}

/// Interpret a measurement slot as a landmark index. Only non-negative integral values qualify.
pub fn landmark_index(value: f64) -> Option<usize> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u32::MAX as f64 {
        Some(value as usize)
    } else {
        None
    }
}
