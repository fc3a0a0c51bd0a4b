//! Error-state extended Kalman filter for map-frame pose estimation
//!
//! The filter keeps a nominal state (position and a unit quaternion) and a 6×6 covariance over
//! the error state `δx = [δp, δθ]`. Odometry twists drive the motion model; position, attitude
//! and range/bearing measurements correct it. Corrections are injected multiplicatively into the
//! orientation and the error state is reset after every update, so the nominal quaternion is
//! always renormalized before anything is published.

use crate::config::EstimatorConfig;
use crate::error::UpdateError;
use crate::linalg::{SolveOptions, chol_solve_spd, condition_number, saturate, symmetrize};
use crate::linearize::{exp_so3, motion_jacobian, reset_jacobian};
use crate::measurements::{Measurement, MeasurementModel, VelocityData};
use crate::{COVARIANCE_SATURATION, Covariance, POSE_DIM, Pose, Quaternion};

use std::fmt::{self, Display};

use log::{trace, warn};
use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector3};

/// Upper bound on the number of integration steps of a single prediction. Longer gaps are
/// integrated with proportionally longer steps.
pub const MAX_PREDICT_STEPS: usize = 1000;

/// Nominal (non-error) state of the estimator
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NominalState {
    /// Map-frame position in meters
    pub position: Vector3<f64>,
    /// Body-to-map orientation
    pub orientation: UnitQuaternion<f64>,
}
impl NominalState {
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.orientation.coords.iter().all(|v| v.is_finite())
    }
}
impl Default for NominalState {
    fn default() -> Self {
        NominalState {
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
        }
    }
}

/// Diagnostics of an applied update.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateReport {
    pub innovation: DVector<f64>,
    /// Normalized innovation squared `νᵀ S⁻¹ ν`
    pub nis: f64,
    /// Condition number of the innovation covariance `S`
    pub condition_number: f64,
}

/// Error-state EKF pose estimator.
///
/// # Predict
///
/// $$
/// \begin{aligned}
/// p &\leftarrow p + R(q) v \Delta t \\\\
/// q &\leftarrow q \otimes \mathrm{Exp}(\omega \Delta t) \\\\
/// P &\leftarrow F P F^T + Q \Delta t
/// \end{aligned}
/// $$
///
/// The twist `(v, ω)` is the latest accepted odometry reading. It is treated as zero until the
/// first one arrives and after it is older than the observation timeout. The covariance grows
/// without bound in the absence of corrections, up to the numerical ceiling
/// [COVARIANCE_SATURATION].
///
/// # Update
///
/// $$
/// \begin{aligned}
/// S &= H P H^T + R \\\\
/// K &= P H^T S^{-1} \\\\
/// \delta x &= K \nu \\\\
/// P &\leftarrow G \left[(I - K H) P (I - K H)^T + K R K^T\right] G^T
/// \end{aligned}
/// $$
///
/// with `G` the reset Jacobian. An update is skipped, leaving the filter untouched, when `S` is
/// not finite, not positive definite or its condition number exceeds the configured ceiling, and
/// when the NIS exceeds the innovation gate.
#[derive(Clone, Debug)]
pub struct PoseEstimator {
    state: NominalState,
    covariance: DMatrix<f64>,
    process_noise: DMatrix<f64>,
    velocity: VelocityData,
    velocity_timestamp: Option<f64>,
    velocity_timeout: f64,
    timestamp: f64,
    max_predict_dt: f64,
    max_condition_number: f64,
    innovation_gate: f64,
}
impl Display for PoseEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.state.orientation.euler_angles();
        write!(
            f,
            "PoseEstimator {{ t: {:.3}, p: [{:.3}, {:.3}, {:.3}], rpy: [{:.4}, {:.4}, {:.4}], {} }}",
            self.timestamp,
            self.state.position.x,
            self.state.position.y,
            self.state.position.z,
            roll,
            pitch,
            yaw,
            self.velocity
        )
    }
}
impl PoseEstimator {
    /// Identity orientation at the configured initial position with the maximal initial
    /// covariance.
    pub fn new(config: &EstimatorConfig, timestamp: f64) -> Self {
        PoseEstimator {
            state: NominalState {
                position: config.initial_position(),
                orientation: UnitQuaternion::identity(),
            },
            covariance: DMatrix::identity(POSE_DIM, POSE_DIM) * config.initial_variance,
            process_noise: DMatrix::from_diagonal(&DVector::from_column_slice(
                &config.process_noise,
            )),
            velocity: VelocityData::default(),
            velocity_timestamp: None,
            velocity_timeout: config.observation_timeout_s,
            timestamp,
            max_predict_dt: config.max_predict_dt,
            max_condition_number: config.max_condition_number,
            innovation_gate: config.innovation_gate,
        }
    }

    pub fn state(&self) -> &NominalState {
        &self.state
    }
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }
    pub fn velocity(&self) -> &VelocityData {
        &self.velocity
    }

    /// Move the estimate clock to `timestamp` without propagating. Used to anchor the clock to
    /// the first observation.
    pub fn set_timestamp(&mut self, timestamp: f64) {
        self.timestamp = timestamp;
    }

    /// Replace the motion-model input with an odometry twist measured at `timestamp`.
    pub fn set_velocity(&mut self, velocity: VelocityData, timestamp: f64) {
        self.velocity = velocity;
        self.velocity_timestamp = Some(timestamp);
    }

    /// Propagate the estimate forward to `timestamp`. Times at or before the current estimate
    /// time leave the filter unchanged.
    ///
    /// When the twist expires inside the interval, the motion up to the expiry uses the twist and
    /// the remainder is pure process noise.
    pub fn predict_to(&mut self, timestamp: f64) {
        if !(timestamp > self.timestamp) {
            return;
        }
        if let Some(stamp) = self.velocity_timestamp {
            let expiry = stamp + self.velocity_timeout;
            if expiry < timestamp {
                if expiry > self.timestamp {
                    self.predict(expiry - self.timestamp);
                }
                trace!("Odometry twist from t={} expired", stamp);
                self.velocity = VelocityData::default();
                self.velocity_timestamp = None;
            }
        }
        self.predict(timestamp - self.timestamp);
    }

    /// Predict to the measurement time, then apply it.
    ///
    /// Odometry replaces the twist and yields `Ok(None)`. Every other kind is a correction and
    /// yields its [UpdateReport]. Measurements older than the current estimate are applied at the
    /// current estimate time.
    pub fn apply(
        &mut self,
        measurement: &Measurement,
        timestamp: f64,
    ) -> Result<Option<UpdateReport>, UpdateError> {
        self.predict_to(timestamp);
        match measurement {
            Measurement::Odometry(velocity) => {
                self.set_velocity(*velocity, timestamp);
                Ok(None)
            }
            Measurement::Position(m) => self.update(m).map(Some),
            Measurement::Attitude(m) => self.update(m).map(Some),
            Measurement::RangeBearing(m) => self.update(m).map(Some),
        }
    }

    /// Snapshot of the current estimate.
    pub fn pose(&self, valid: bool) -> Pose {
        Pose {
            position: self.state.position,
            orientation: Quaternion::from(self.state.orientation),
            covariance: Covariance::from_matrix(&self.covariance),
            valid,
            timestamp: self.timestamp,
        }
    }

    /// Error-state covariance (6×6)
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Propagate the estimate by `dt` seconds with the current twist. Non-positive or non-finite
    /// `dt` is a no-op.
    pub fn predict(&mut self, dt: f64) {
        if !(dt > 0.0 && dt.is_finite()) {
            return;
        }
        let steps = ((dt / self.max_predict_dt).ceil() as usize).clamp(1, MAX_PREDICT_STEPS);
        let step = dt / steps as f64;
        for _ in 0..steps {
            self.propagate(step);
        }
        self.timestamp += dt;
    }

    /// Correct the estimate with `measurement`. A failed update leaves the estimate untouched.
    pub fn update<M: MeasurementModel + ?Sized>(
        &mut self,
        measurement: &M,
    ) -> Result<UpdateReport, UpdateError> {
        let dim = measurement.get_dimension();
        let h = measurement.get_jacobian(&self.state).ok_or_else(|| {
            UpdateError::DegenerateGeometry(format!(
                "measurement cannot be linearized at p = [{:.3}, {:.3}, {:.3}]",
                self.state.position.x, self.state.position.y, self.state.position.z
            ))
        })?;
        assert_eq!(
            h.shape(),
            (dim, POSE_DIM),
            "Measurement Jacobian must be {}x{}",
            dim,
            POSE_DIM
        );
        let r = measurement.get_noise();
        assert_eq!(r.shape(), (dim, dim), "Measurement noise must be {}x{}", dim, dim);
        let innovation = measurement.get_innovation(&self.state);

        let pht = &self.covariance * h.transpose();
        let s = symmetrize(&(&h * &pht + &r));
        let cond = condition_number(&s);
        if !(cond <= self.max_condition_number) {
            return Err(UpdateError::IllConditioned {
                condition_number: cond,
            });
        }
        let ill_conditioned = UpdateError::IllConditioned {
            condition_number: cond,
        };
        // S is symmetric, so Kᵀ = S⁻¹ (P Hᵀ)ᵀ
        let gain = chol_solve_spd(&s, &pht.transpose(), SolveOptions::default())
            .ok_or_else(|| ill_conditioned.clone())?
            .transpose();
        let nu = DMatrix::from_column_slice(dim, 1, innovation.as_slice());
        let weighted = chol_solve_spd(&s, &nu, SolveOptions::default())
            .ok_or_else(|| ill_conditioned.clone())?;
        let nis = innovation.dot(&weighted.column(0));
        if !(nis <= self.innovation_gate) {
            return Err(UpdateError::InnovationRejected {
                nis,
                gate: self.innovation_gate,
            });
        }

        let dx = &gain * &innovation;
        if dx.iter().any(|v| !v.is_finite()) {
            return Err(ill_conditioned);
        }
        let dp = Vector3::new(dx[0], dx[1], dx[2]);
        let dtheta = Vector3::new(dx[3], dx[4], dx[5]);
        let mut corrected = NominalState {
            position: self.state.position + dp,
            orientation: self.state.orientation * exp_so3(&dtheta),
        };
        corrected.orientation.renormalize();

        let i_kh = DMatrix::<f64>::identity(POSE_DIM, POSE_DIM) - &gain * &h;
        let joseph = &i_kh * &self.covariance * i_kh.transpose() + &gain * &r * gain.transpose();
        let g = reset_jacobian(&dtheta);
        let covariance = saturate(&(&g * joseph * g.transpose()), COVARIANCE_SATURATION);
        if !corrected.is_finite() {
            return Err(UpdateError::NonFinite);
        }
        self.state = corrected;
        self.covariance = covariance;

        Ok(UpdateReport {
            innovation,
            nis,
            condition_number: cond,
        })
    }

    fn propagate(&mut self, dt: f64) {
        match self.motion_step(dt) {
            Some((state, covariance)) => {
                self.state = state;
                self.covariance = covariance;
            }
            None => {
                warn!(
                    "Dropping odometry twist that drives the estimate non-finite: {}",
                    self.velocity
                );
                self.velocity = VelocityData::default();
                self.velocity_timestamp = None;
                if let Some((state, covariance)) = self.motion_step(dt) {
                    self.state = state;
                    self.covariance = covariance;
                }
            }
        }
    }

    /// One integration step with the current twist, or `None` if it leaves the nominal state
    /// non-finite.
    fn motion_step(&self, dt: f64) -> Option<(NominalState, DMatrix<f64>)> {
        let f = motion_jacobian(
            &self.state.orientation,
            &self.velocity.linear,
            &self.velocity.angular,
            dt,
        );
        // midpoint heading for the translation
        let half_turn = self.state.orientation * exp_so3(&(self.velocity.angular * (0.5 * dt)));
        let mut next = NominalState {
            position: self.state.position + half_turn * self.velocity.linear * dt,
            orientation: self.state.orientation * exp_so3(&(self.velocity.angular * dt)),
        };
        next.orientation.renormalize();
        if !next.is_finite() {
            return None;
        }
        let propagated = &f * &self.covariance * f.transpose() + &self.process_noise * dt;
        Some((next, saturate(&propagated, COVARIANCE_SATURATION)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::{AttitudeMeasurement, PositionMeasurement, RangeBearingMeasurement};
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::FRAC_PI_2;

    fn estimator() -> PoseEstimator {
        PoseEstimator::new(&EstimatorConfig::default(), 0.0)
    }

    fn position_fix(x: f64, y: f64, z: f64, variance: f64) -> PositionMeasurement {
        PositionMeasurement {
            position: Vector3::new(x, y, z),
            noise: DMatrix::identity(3, 3) * variance,
        }
    }

    struct Degenerate;
    impl MeasurementModel for Degenerate {
        fn get_dimension(&self) -> usize {
            2
        }
        fn get_vector(&self) -> DVector<f64> {
            DVector::from_vec(vec![1.0, 1.0])
        }
        fn get_noise(&self) -> DMatrix<f64> {
            DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 0.0]))
        }
        fn get_expected_measurement(&self, _state: &NominalState) -> DVector<f64> {
            DVector::zeros(2)
        }
        fn get_jacobian(&self, _state: &NominalState) -> Option<DMatrix<f64>> {
            Some(DMatrix::zeros(2, POSE_DIM))
        }
    }

    #[test]
    fn new_estimator_starts_at_identity_with_maximal_covariance() {
        let ekf = estimator();
        assert_eq!(*ekf.state(), NominalState::default());
        let p = ekf.covariance();
        for i in 0..POSE_DIM {
            assert_eq!(p[(i, i)], 1e6);
        }
        let pose = ekf.pose(false);
        assert!(!pose.valid);
        assert!(pose.is_finite());
    }

    #[test]
    fn covariance_grows_monotonically_without_observations() {
        let mut ekf = estimator();
        let mut previous = ekf.covariance().diagonal();
        for _ in 0..20 {
            ekf.predict(0.25);
            let current = ekf.covariance().diagonal();
            for i in 0..POSE_DIM {
                assert!(current[i] >= previous[i]);
            }
            assert!(current[0] > previous[0]);
            previous = current;
        }
        assert_approx_eq!(ekf.timestamp(), 5.0, 1e-12);
        // No twist: the nominal state does not move.
        assert_eq!(ekf.state().position, Vector3::zeros());
    }

    #[test]
    fn non_positive_dt_is_a_no_op() {
        let mut ekf = estimator();
        let before = ekf.covariance().clone();
        ekf.predict(0.0);
        ekf.predict(-1.0);
        ekf.predict(f64::NAN);
        assert_eq!(ekf.covariance(), &before);
        assert_eq!(ekf.timestamp(), 0.0);
    }

    #[test]
    fn covariance_saturates_at_ceiling() {
        let config = EstimatorConfig {
            process_noise: [1e6; 6],
            ..EstimatorConfig::default()
        };
        let mut ekf = PoseEstimator::new(&config, 0.0);
        ekf.predict(1e7);
        let p = ekf.covariance();
        assert!(p.iter().all(|v| v.is_finite()));
        for i in 0..POSE_DIM {
            assert!(p[(i, i)] <= COVARIANCE_SATURATION);
        }
        assert_eq!(p[(0, 0)], COVARIANCE_SATURATION);
    }

    #[test]
    fn twist_drives_the_nominal_state() {
        let mut ekf = estimator();
        ekf.set_velocity(
            VelocityData {
                linear: Vector3::new(1.0, 0.0, 0.0),
                angular: Vector3::new(0.0, 0.0, FRAC_PI_2),
            },
            0.0,
        );
        ekf.predict_to(1.0);
        let (_, _, yaw) = ekf.state().orientation.euler_angles();
        assert_approx_eq!(yaw, FRAC_PI_2, 1e-9);
        // Quarter circle of radius 2/π
        let radius = 2.0 / std::f64::consts::PI;
        assert_approx_eq!(ekf.state().position.x, radius, 1e-2);
        assert_approx_eq!(ekf.state().position.y, radius, 1e-2);
        assert_approx_eq!(ekf.state().orientation.norm(), 1.0, 1e-12);
    }

    #[test]
    fn stale_twist_expires() {
        let mut ekf = estimator();
        ekf.set_velocity(
            VelocityData {
                linear: Vector3::new(2.0, 0.0, 0.0),
                angular: Vector3::zeros(),
            },
            0.0,
        );
        // Default timeout is 1 s: only the first second moves the estimate.
        ekf.predict_to(5.0);
        assert_approx_eq!(ekf.state().position.x, 2.0, 1e-9);
        assert_eq!(ekf.velocity(), &VelocityData::default());
        assert_approx_eq!(ekf.timestamp(), 5.0, 1e-12);
    }

    #[test]
    fn position_update_converges() {
        let mut ekf = estimator();
        let report = ekf.update(&position_fix(3.0, -2.0, 0.5, 0.01)).unwrap();
        assert!(report.nis < 1e-3);
        assert_approx_eq!(ekf.state().position.x, 3.0, 1e-6);
        assert_approx_eq!(ekf.state().position.y, -2.0, 1e-6);
        assert_approx_eq!(ekf.state().position.z, 0.5, 1e-6);
        let p = ekf.covariance();
        assert!(p[(0, 0)] < 0.011);
        assert_eq!(p[(3, 3)], 1e6);
        assert_eq!(p, &symmetrize(p));
    }

    #[test]
    fn attitude_update_is_multiplicative() {
        let mut ekf = estimator();
        let meas = AttitudeMeasurement {
            roll: 0.1,
            pitch: -0.05,
            yaw: 2.5,
            noise: DMatrix::identity(3, 3) * 1e-4,
        };
        for _ in 0..3 {
            ekf.update(&meas).unwrap();
        }
        let (roll, pitch, yaw) = ekf.state().orientation.euler_angles();
        assert_approx_eq!(roll, 0.1, 1e-4);
        assert_approx_eq!(pitch, -0.05, 1e-4);
        assert_approx_eq!(yaw, 2.5, 1e-4);
        let q = Quaternion::from(ekf.state().orientation);
        assert!(q.is_normalized(1e-12));
    }

    #[test]
    fn range_bearing_recovers_heading() {
        let mut ekf = estimator();
        let true_yaw: f64 = 0.3;
        let landmark = Vector3::new(10.0, 0.0, 0.0);
        let truth = NominalState {
            position: Vector3::zeros(),
            orientation: UnitQuaternion::from_euler_angles(0.0, 0.0, true_yaw),
        };
        let mut rb = RangeBearingMeasurement {
            landmark,
            range: 0.0,
            azimuth: 0.0,
            elevation: 0.0,
            noise: DMatrix::from_diagonal(&DVector::from_vec(vec![1e-2, 1e-4, 1e-4])),
        };
        let z = rb.get_expected_measurement(&truth);
        rb.range = z[0];
        rb.azimuth = z[1];
        rb.elevation = z[2];
        assert_approx_eq!(rb.azimuth, -true_yaw, 1e-12);
        for _ in 0..5 {
            ekf.update(&position_fix(0.0, 0.0, 0.0, 1e-4)).unwrap();
            ekf.update(&rb).unwrap();
        }
        let (_, _, yaw) = ekf.state().orientation.euler_angles();
        assert_approx_eq!(yaw, true_yaw, 1e-2);
        assert!(ekf.covariance()[(5, 5)] < 1e-2);
    }

    #[test]
    fn ill_conditioned_update_is_skipped() {
        let mut ekf = estimator();
        let before = *ekf.state();
        let before_p = ekf.covariance().clone();
        let err = ekf.update(&Degenerate).unwrap_err();
        assert!(matches!(err, UpdateError::IllConditioned { .. }));
        assert_eq!(*ekf.state(), before);
        assert_eq!(ekf.covariance(), &before_p);
    }

    #[test]
    fn outlier_is_gated() {
        let mut ekf = estimator();
        for _ in 0..5 {
            ekf.update(&position_fix(1.0, 1.0, 0.0, 0.01)).unwrap();
        }
        let before = *ekf.state();
        let err = ekf.update(&position_fix(60.0, 1.0, 0.0, 0.01)).unwrap_err();
        match err {
            UpdateError::InnovationRejected { nis, gate } => {
                assert!(nis > gate);
                assert_eq!(gate, 100.0);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(*ekf.state(), before);
    }

    #[test]
    fn degenerate_geometry_is_reported() {
        let mut ekf = estimator();
        let rb = RangeBearingMeasurement {
            landmark: Vector3::zeros(),
            range: 1.0,
            azimuth: 0.0,
            elevation: 0.0,
            noise: DMatrix::identity(3, 3) * 0.01,
        };
        assert!(matches!(
            ekf.update(&rb),
            Err(UpdateError::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn runaway_twist_is_dropped() {
        let mut ekf = estimator();
        ekf.set_velocity(
            VelocityData {
                linear: Vector3::zeros(),
                angular: Vector3::repeat(1e300),
            },
            0.0,
        );
        ekf.predict_to(0.2);
        assert!(ekf.state().is_finite());
        assert!(ekf.covariance().iter().all(|v| v.is_finite()));
        assert_eq!(ekf.velocity(), &VelocityData::default());
        assert_approx_eq!(ekf.timestamp(), 0.2, 1e-12);

        let meas = AttitudeMeasurement {
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.4,
            noise: DMatrix::identity(3, 3) * 1e-4,
        };
        ekf.update(&meas).unwrap();
        let (_, _, yaw) = ekf.state().orientation.euler_angles();
        assert_approx_eq!(yaw, 0.4, 1e-3);
    }

    #[test]
    fn apply_routes_odometry_and_corrections() {
        let mut ekf = estimator();
        let odom = Measurement::Odometry(VelocityData {
            linear: Vector3::new(1.0, 0.0, 0.0),
            angular: Vector3::zeros(),
        });
        assert_eq!(ekf.apply(&odom, 0.5).unwrap(), None);
        assert_eq!(ekf.timestamp(), 0.5);
        let fix = Measurement::Position(position_fix(0.0, 0.0, 0.0, 0.01));
        let report = ekf.apply(&fix, 1.0).unwrap();
        assert!(report.is_some());
        assert_approx_eq!(ekf.timestamp(), 1.0, 1e-12);
        // A correction older than the estimate is applied without rewinding time.
        ekf.apply(&fix, 0.7).unwrap();
        assert_approx_eq!(ekf.timestamp(), 1.0, 1e-12);
    }
}
