//! Jacobian and linearization utilities for the error-state filter
//!
//! This module provides the analytic Jacobians for the constant-twist motion model and the
//! measurement models used by [crate::kalman::PoseEstimator], together with the small SO(3)
//! helpers (skew, exponential and logarithm maps) they are built from.
//!
//! # State Ordering
//!
//! The error state follows the ordering:
//! ```text
//! δx = [δp_x, δp_y, δp_z, δθ_x, δθ_y, δθ_z]
//! ```
//! where:
//! - `δp`: map-frame position error in meters
//! - `δθ`: body-frame rotation error in radians, `q_true = q ⊗ Exp(δθ)`
//!
//! # Usage Example
//!
//! ```rust
//! use posefuse::linearize::{motion_jacobian, position_jacobian};
//! use nalgebra::{UnitQuaternion, Vector3};
//!
//! let orientation = UnitQuaternion::identity();
//! let linear = Vector3::new(1.0, 0.0, 0.0);
//! let angular = Vector3::new(0.0, 0.0, 0.1);
//!
//! let f_matrix = motion_jacobian(&orientation, &linear, &angular, 0.1);
//! let h_matrix = position_jacobian();
//! assert_eq!(f_matrix.shape(), (6, 6));
//! assert_eq!(h_matrix.shape(), (3, 6));
//! ```
//!
//! # References
//!
//! - Solà, J. "Quaternion kinematics for the error-state Kalman filter" (2017), sections 5.3,
//!   6.2 and 7.2 for the error-state propagation and reset Jacobians.

use nalgebra::{DMatrix, Matrix3, UnitQuaternion, Vector3};

use crate::POSE_DIM;

/// Range and horizontal distance below which range/bearing geometry is considered degenerate (m).
pub const MIN_RANGE_GEOMETRY: f64 = 1e-6;

/// Skew-symmetric matrix such that `skew(a) * b = a × b`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// SO(3) exponential map from a rotation vector to a unit quaternion.
pub fn exp_so3(rotation_vector: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*rotation_vector)
}

/// SO(3) logarithm map from a unit quaternion to the shortest rotation vector.
pub fn log_so3(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}

/// Error-state transition Jacobian (F) for the constant-twist motion model.
///
/// The nominal propagation is
///
/// $$
/// p_{k+1} = p_k + R(q_k) v \Delta t, \qquad q_{k+1} = q_k \otimes \mathrm{Exp}(\omega \Delta t)
/// $$
///
/// with `v` and `ω` the body-frame linear and angular velocity. Linearizing about the nominal
/// state gives
///
/// $$
/// F = \begin{bmatrix} I & -R [v]_\times \Delta t \\\\ 0 & \mathrm{Exp}(\omega \Delta t)^T \end{bmatrix}
/// $$
///
/// # Arguments
/// * `orientation` - Current body-to-map orientation
/// * `linear` - Body-frame linear velocity (m/s)
/// * `angular` - Body-frame angular velocity (rad/s)
/// * `dt` - Time step in seconds
///
/// # Returns
/// 6×6 error-state transition matrix
pub fn motion_jacobian(
    orientation: &UnitQuaternion<f64>,
    linear: &Vector3<f64>,
    angular: &Vector3<f64>,
    dt: f64,
) -> DMatrix<f64> {
    let rotation = orientation.to_rotation_matrix().into_inner();
    let increment = exp_so3(&(angular * dt)).to_rotation_matrix().into_inner();
    let mut f = DMatrix::<f64>::identity(POSE_DIM, POSE_DIM);
    f.view_mut((0, 3), (3, 3))
        .copy_from(&(-rotation * skew(linear) * dt));
    f.view_mut((3, 3), (3, 3))
        .copy_from(&increment.transpose());
    f
}

/// Measurement Jacobian (H) for a direct map-frame position fix: `H = [I 0]`.
pub fn position_jacobian() -> DMatrix<f64> {
    let mut h = DMatrix::<f64>::zeros(3, POSE_DIM);
    h.view_mut((0, 0), (3, 3)).fill_with_identity();
    h
}

/// Measurement Jacobian (H) for an absolute attitude measurement: `H = [0 I]`.
///
/// The matching innovation is the rotation vector `Log(q⁻¹ ⊗ q_meas)`, which to first order
/// equals the body-frame rotation error `δθ`.
pub fn attitude_jacobian() -> DMatrix<f64> {
    let mut h = DMatrix::<f64>::zeros(3, POSE_DIM);
    h.view_mut((0, 3), (3, 3)).fill_with_identity();
    h
}

/// Landmark position expressed in the body frame, `d = R(q)ᵀ (L − p)`.
pub fn landmark_in_body(
    position: &Vector3<f64>,
    orientation: &UnitQuaternion<f64>,
    landmark: &Vector3<f64>,
) -> Vector3<f64> {
    orientation.inverse_transform_vector(&(landmark - position))
}

/// Measurement Jacobian (H) for a range/azimuth/elevation observation of a known landmark.
///
/// With `d = R(q)ᵀ (L − p)`, `r = ‖d‖` and `ρ = √(d_x² + d_y²)`:
///
/// $$
/// \frac{\partial d}{\partial \delta p} = -R^T, \qquad \frac{\partial d}{\partial \delta\theta} = [d]_\times
/// $$
///
/// and the rows of `∂h/∂d` are `dᵀ/r` (range), `[-d_y, d_x, 0]/ρ²` (azimuth) and
/// `[-d_x d_z/(r²ρ), -d_y d_z/(r²ρ), ρ/r²]` (elevation).
///
/// # Returns
/// The 3×6 Jacobian, or `None` when the landmark is too close to the sensor or directly above
/// or below it, where azimuth is undefined.
pub fn range_bearing_jacobian(
    position: &Vector3<f64>,
    orientation: &UnitQuaternion<f64>,
    landmark: &Vector3<f64>,
) -> Option<DMatrix<f64>> {
    let d = landmark_in_body(position, orientation, landmark);
    let range = d.norm();
    let rho = (d.x * d.x + d.y * d.y).sqrt();
    if !(range > MIN_RANGE_GEOMETRY && rho > MIN_RANGE_GEOMETRY) {
        return None;
    }
    let r2 = range * range;
    let rho2 = rho * rho;
    let dh_dd = Matrix3::new(
        d.x / range,
        d.y / range,
        d.z / range,
        -d.y / rho2,
        d.x / rho2,
        0.0,
        -d.x * d.z / (r2 * rho),
        -d.y * d.z / (r2 * rho),
        rho / r2,
    );
    let rotation_t = orientation.to_rotation_matrix().into_inner().transpose();
    let mut h = DMatrix::<f64>::zeros(3, POSE_DIM);
    h.view_mut((0, 0), (3, 3)).copy_from(&(dh_dd * -rotation_t));
    h.view_mut((0, 3), (3, 3)).copy_from(&(dh_dd * skew(&d)));
    Some(h)
}

/// Error-state reset Jacobian applied after injecting a correction `δθ` into the nominal
/// orientation: `G = diag(I, I − [δθ/2]×)`.
pub fn reset_jacobian(delta_theta: &Vector3<f64>) -> DMatrix<f64> {
    let mut g = DMatrix::<f64>::identity(POSE_DIM, POSE_DIM);
    g.view_mut((3, 3), (3, 3))
        .copy_from(&(Matrix3::identity() - skew(&(delta_theta * 0.5))));
    g
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    /// Central finite-difference check of range/bearing expected measurement against the
    /// analytic Jacobian, perturbing the error state.
    fn numeric_range_bearing_jacobian(
        position: &Vector3<f64>,
        orientation: &UnitQuaternion<f64>,
        landmark: &Vector3<f64>,
    ) -> DMatrix<f64> {
        let h = |p: &Vector3<f64>, q: &UnitQuaternion<f64>| {
            let d = landmark_in_body(p, q, landmark);
            let rho = (d.x * d.x + d.y * d.y).sqrt();
            Vector3::new(d.norm(), d.y.atan2(d.x), d.z.atan2(rho))
        };
        let eps = 1e-6;
        let mut jac = DMatrix::<f64>::zeros(3, 6);
        for k in 0..6 {
            let mut delta = [0.0; 6];
            delta[k] = eps;
            let plus = {
                let dp = Vector3::new(delta[0], delta[1], delta[2]);
                let dth = Vector3::new(delta[3], delta[4], delta[5]);
                h(&(position + dp), &(orientation * exp_so3(&dth)))
            };
            let minus = {
                let dp = Vector3::new(-delta[0], -delta[1], -delta[2]);
                let dth = Vector3::new(-delta[3], -delta[4], -delta[5]);
                h(&(position + dp), &(orientation * exp_so3(&dth)))
            };
            let col = (plus - minus) / (2.0 * eps);
            for r in 0..3 {
                jac[(r, k)] = col[r];
            }
        }
        jac
    }

    #[test]
    fn skew_matches_cross_product() {
        let a = Vector3::new(0.3, -1.2, 2.0);
        let b = Vector3::new(-0.7, 0.4, 1.1);
        let lhs = skew(&a) * b;
        let rhs = a.cross(&b);
        for i in 0..3 {
            assert_approx_eq!(lhs[i], rhs[i], 1e-12);
        }
    }

    #[test]
    fn exp_log_round_trip() {
        let v = Vector3::new(0.1, -0.4, 0.25);
        let back = log_so3(&exp_so3(&v));
        for i in 0..3 {
            assert_approx_eq!(back[i], v[i], 1e-12);
        }
        assert_eq!(log_so3(&UnitQuaternion::identity()), Vector3::zeros());
    }

    #[test]
    fn motion_jacobian_is_identity_at_rest() {
        let f = motion_jacobian(
            &UnitQuaternion::from_euler_angles(0.2, 0.1, -1.0),
            &Vector3::zeros(),
            &Vector3::zeros(),
            0.5,
        );
        assert_eq!(f, DMatrix::<f64>::identity(6, 6));
    }

    #[test]
    fn motion_jacobian_couples_attitude_into_position() {
        // Forward motion at identity attitude: a yaw error pushes position sideways.
        let f = motion_jacobian(
            &UnitQuaternion::identity(),
            &Vector3::new(2.0, 0.0, 0.0),
            &Vector3::zeros(),
            0.1,
        );
        // δp_y gains v_x * dt per unit δθ_z
        assert_approx_eq!(f[(1, 5)], 0.2, 1e-12);
        assert_approx_eq!(f[(2, 4)], -0.2, 1e-12);
        assert_approx_eq!(f[(0, 5)], 0.0, 1e-12);
    }

    #[test]
    fn position_and_attitude_jacobians_select_blocks() {
        let hp = position_jacobian();
        let ha = attitude_jacobian();
        for i in 0..3 {
            for j in 0..6 {
                assert_eq!(hp[(i, j)], if i == j { 1.0 } else { 0.0 });
                assert_eq!(ha[(i, j)], if i + 3 == j { 1.0 } else { 0.0 });
            }
        }
    }

    #[test]
    fn range_bearing_jacobian_matches_finite_difference() {
        let position = Vector3::new(1.0, -2.0, 0.5);
        let orientation = UnitQuaternion::from_euler_angles(0.05, -0.1, 0.7);
        let landmark = Vector3::new(6.0, 3.0, 2.0);
        let analytic = range_bearing_jacobian(&position, &orientation, &landmark).unwrap();
        let numeric = numeric_range_bearing_jacobian(&position, &orientation, &landmark);
        for i in 0..3 {
            for j in 0..6 {
                assert_approx_eq!(analytic[(i, j)], numeric[(i, j)], 1e-5);
            }
        }
    }

    #[test]
    fn range_bearing_jacobian_degenerate_geometry() {
        let orientation = UnitQuaternion::identity();
        let p = Vector3::new(1.0, 1.0, 0.0);
        assert!(range_bearing_jacobian(&p, &orientation, &p).is_none());
        // Landmark straight overhead: azimuth undefined
        let above = Vector3::new(1.0, 1.0, 5.0);
        assert!(range_bearing_jacobian(&p, &orientation, &above).is_none());
    }

    #[test]
    fn reset_jacobian_is_identity_for_zero_correction() {
        assert_eq!(
            reset_jacobian(&Vector3::zeros()),
            DMatrix::<f64>::identity(6, 6)
        );
        let g = reset_jacobian(&Vector3::new(0.0, 0.0, 0.2));
        assert_approx_eq!(g[(3, 4)], 0.1, 1e-12);
        assert_approx_eq!(g[(4, 3)], -0.1, 1e-12);
    }
}
