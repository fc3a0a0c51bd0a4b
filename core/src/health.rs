//! Validity monitor for the published pose.
//!
//! [HealthMonitor] is a two-state machine, [Validity::Valid] and [Validity::Invalid], that starts
//! invalid. Any [HealthFault] moves it to invalid; leaving the invalid state requires
//! `recovery_count` consecutive accepted observations that each pass every check. The monitor
//! only reads poses and never mutates the estimator.

use log::{debug, info, warn};
use nalgebra::Vector3;
use thiserror::Error;

use std::fmt::{self, Display};

use crate::config::EstimatorConfig;
use crate::{MapBounds, POSE_DIM, Pose};

/// Reasons the estimate is flagged invalid.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HealthFault {
    /// No accepted observation within the timeout, or too many consecutive misses.
    #[error("observation starvation: {elapsed_s:.3} s since last accepted observation, {misses} consecutive misses")]
    Starved { elapsed_s: f64, misses: usize },
    #[error("covariance on axis {axis} is {value:e}, above limit {limit:e}")]
    CovarianceExceeded { axis: usize, value: f64, limit: f64 },
    #[error("position [{x:.3}, {y:.3}, {z:.3}] is outside the map bounds")]
    OutOfBounds { x: f64, y: f64, z: f64 },
    #[error("orientation is not normalized: |q|^2 = {norm_squared}")]
    Denormalized { norm_squared: f64 },
    #[error("pose contains a non-finite value")]
    NonFinite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
}
impl Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validity::Valid => write!(f, "VALID"),
            Validity::Invalid => write!(f, "INVALID"),
        }
    }
}

/// Thresholds the monitor checks a pose against.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HealthLimits {
    pub map_bounds: MapBounds,
    pub quaternion_norm_tolerance: f64,
    pub max_pose_covariance: f64,
    pub observation_timeout_s: f64,
    pub recovery_count: usize,
    pub max_consecutive_misses: usize,
}
impl Default for HealthLimits {
    fn default() -> Self {
        HealthLimits::from(&EstimatorConfig::default())
    }
}
impl From<&EstimatorConfig> for HealthLimits {
    fn from(config: &EstimatorConfig) -> Self {
        HealthLimits {
            map_bounds: config.map_bounds,
            quaternion_norm_tolerance: config.quaternion_norm_tolerance,
            max_pose_covariance: config.max_pose_covariance,
            observation_timeout_s: config.observation_timeout_s,
            recovery_count: config.recovery_count,
            max_consecutive_misses: config.max_consecutive_misses,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HealthMonitor {
    limits: HealthLimits,
    validity: Validity,
    streak: usize,
    misses: usize,
    last_accepted: Option<f64>,
    last_fault: Option<HealthFault>,
}
impl HealthMonitor {
    pub fn new(limits: HealthLimits) -> Self {
        HealthMonitor {
            limits,
            validity: Validity::Invalid,
            streak: 0,
            misses: 0,
            last_accepted: None,
            last_fault: None,
        }
    }

    pub fn limits(&self) -> &HealthLimits {
        &self.limits
    }
    pub fn validity(&self) -> Validity {
        self.validity
    }
    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }
    /// Consecutive healthy accepted observations since the last fault or miss.
    pub fn streak(&self) -> usize {
        self.streak
    }
    /// Consecutive rejected or skipped observations.
    pub fn misses(&self) -> usize {
        self.misses
    }
    /// The fault behind the current invalid state. `None` while valid and before the first fault.
    pub fn last_fault(&self) -> Option<&HealthFault> {
        self.last_fault.as_ref()
    }

    /// Run every check against `pose` at observation-clock time `now`.
    pub fn check(&self, now: f64, pose: &Pose) -> Result<(), HealthFault> {
        if !pose.is_finite() {
            return Err(HealthFault::NonFinite);
        }
        let elapsed_s = match self.last_accepted {
            Some(t) => now - t,
            None => f64::INFINITY,
        };
        if !(elapsed_s <= self.limits.observation_timeout_s)
            || self.misses >= self.limits.max_consecutive_misses
        {
            return Err(HealthFault::Starved {
                elapsed_s,
                misses: self.misses,
            });
        }
        let norm_squared = pose.orientation.norm_squared();
        if !pose
            .orientation
            .is_normalized(self.limits.quaternion_norm_tolerance)
        {
            return Err(HealthFault::Denormalized { norm_squared });
        }
        let diagonal = pose.covariance.diagonal();
        if let Some(axis) = (0..POSE_DIM).find(|&i| diagonal[i] > self.limits.max_pose_covariance)
        {
            return Err(HealthFault::CovarianceExceeded {
                axis,
                value: diagonal[axis],
                limit: self.limits.max_pose_covariance,
            });
        }
        if !self.limits.map_bounds.contains(&pose.position) {
            return Err(out_of_bounds(&pose.position));
        }
        Ok(())
    }

    /// An observation was accepted and applied; `pose` is the corrected estimate.
    ///
    /// A gap longer than the observation timeout since the previous accepted observation is a
    /// starvation fault even if no tick saw it, so the observation ending the gap starts a new
    /// recovery streak.
    pub fn on_accepted(&mut self, now: f64, pose: &Pose) -> Validity {
        if let Some(t) = self.last_accepted {
            let elapsed_s = now - t;
            if elapsed_s > self.limits.observation_timeout_s {
                self.raise(
                    now,
                    HealthFault::Starved {
                        elapsed_s,
                        misses: self.misses,
                    },
                );
            }
        }
        self.last_accepted = Some(match self.last_accepted {
            Some(t) => t.max(now),
            None => now,
        });
        self.misses = 0;
        match self.check(now, pose) {
            Ok(()) => {
                self.streak += 1;
                if self.validity == Validity::Invalid && self.streak >= self.limits.recovery_count {
                    info!(
                        "Pose estimate VALID after {} consecutive healthy observations (t={:.3})",
                        self.streak, now
                    );
                    self.validity = Validity::Valid;
                    self.last_fault = None;
                }
            }
            Err(fault) => self.raise(now, fault),
        }
        self.validity
    }

    /// An observation was rejected at ingestion or its update was skipped.
    ///
    /// A miss breaks the recovery streak. It invalidates the pose only once the miss count or the
    /// time since the last accepted observation reaches its limit.
    pub fn on_missed(&mut self, now: f64, pose: &Pose) -> Validity {
        self.misses += 1;
        self.streak = 0;
        if self.misses >= self.limits.max_consecutive_misses {
            debug!("{} consecutive missed observations", self.misses);
        }
        if let Err(fault) = self.check(now, pose) {
            self.raise(now, fault);
        }
        self.validity
    }

    /// Periodic check without a new observation, e.g. from a query timer.
    pub fn on_tick(&mut self, now: f64, pose: &Pose) -> Validity {
        if let Err(fault) = self.check(now, pose) {
            self.raise(now, fault);
        }
        self.validity
    }

    fn raise(&mut self, now: f64, fault: HealthFault) {
        self.streak = 0;
        if self.validity == Validity::Valid {
            warn!("Pose estimate INVALID at t={:.3}: {}", now, fault);
        } else {
            debug!("Pose estimate still invalid at t={:.3}: {}", now, fault);
        }
        self.validity = Validity::Invalid;
        self.last_fault = Some(fault);
    }
}

fn out_of_bounds(position: &Vector3<f64>) -> HealthFault {
    HealthFault::OutOfBounds {
        x: position.x,
        y: position.y,
        z: position.z,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Covariance, Quaternion};

    fn limits() -> HealthLimits {
        HealthLimits {
            recovery_count: 3,
            max_consecutive_misses: 4,
            ..HealthLimits::default()
        }
    }

    fn good_pose(t: f64) -> Pose {
        Pose {
            position: Vector3::new(1.0, 2.0, 0.0),
            orientation: Quaternion::identity(),
            covariance: Covariance::from_diagonal(&[0.1; 6]),
            valid: false,
            timestamp: t,
        }
    }

    fn recovered() -> HealthMonitor {
        let mut monitor = HealthMonitor::new(limits());
        for i in 0..3 {
            monitor.on_accepted(i as f64 * 0.1, &good_pose(i as f64 * 0.1));
        }
        assert!(monitor.is_valid());
        monitor
    }

    #[test]
    fn starts_invalid() {
        let monitor = HealthMonitor::new(HealthLimits::default());
        assert_eq!(monitor.validity(), Validity::Invalid);
        assert!(monitor.last_fault().is_none());
        assert!(matches!(
            monitor.check(0.0, &good_pose(0.0)),
            Err(HealthFault::Starved { .. })
        ));
    }

    #[test]
    fn hysteresis_requires_recovery_count() {
        let mut monitor = HealthMonitor::new(limits());
        assert_eq!(monitor.on_accepted(0.0, &good_pose(0.0)), Validity::Invalid);
        assert_eq!(monitor.on_accepted(0.1, &good_pose(0.1)), Validity::Invalid);
        assert_eq!(monitor.streak(), 2);
        assert_eq!(monitor.on_accepted(0.2, &good_pose(0.2)), Validity::Valid);
    }

    #[test]
    fn miss_resets_streak() {
        let mut monitor = HealthMonitor::new(limits());
        monitor.on_accepted(0.0, &good_pose(0.0));
        monitor.on_accepted(0.1, &good_pose(0.1));
        monitor.on_missed(0.15, &good_pose(0.1));
        assert_eq!(monitor.streak(), 0);
        monitor.on_accepted(0.2, &good_pose(0.2));
        monitor.on_accepted(0.3, &good_pose(0.3));
        assert!(!monitor.is_valid());
        monitor.on_accepted(0.4, &good_pose(0.4));
        assert!(monitor.is_valid());
    }

    #[test]
    fn single_miss_keeps_valid() {
        let mut monitor = recovered();
        assert_eq!(monitor.on_missed(0.25, &good_pose(0.2)), Validity::Valid);
        assert_eq!(monitor.misses(), 1);
    }

    #[test]
    fn consecutive_misses_starve() {
        let mut monitor = recovered();
        for _ in 0..3 {
            assert!(monitor.is_valid());
            monitor.on_missed(0.25, &good_pose(0.2));
        }
        assert_eq!(monitor.on_missed(0.25, &good_pose(0.2)), Validity::Invalid);
        assert!(matches!(
            monitor.last_fault(),
            Some(HealthFault::Starved { misses: 4, .. })
        ));
    }

    #[test]
    fn timeout_starves() {
        let mut monitor = recovered();
        assert_eq!(monitor.on_tick(1.0, &good_pose(1.0)), Validity::Valid);
        assert_eq!(monitor.on_tick(1.5, &good_pose(1.5)), Validity::Invalid);
        match monitor.last_fault() {
            Some(HealthFault::Starved { elapsed_s, .. }) => assert!(*elapsed_s > 1.0),
            other => panic!("unexpected fault {:?}", other),
        }
    }

    #[test]
    fn gap_between_observations_starves() {
        let mut monitor = recovered();
        assert_eq!(monitor.on_accepted(2.0, &good_pose(2.0)), Validity::Invalid);
        assert!(matches!(
            monitor.last_fault(),
            Some(HealthFault::Starved { .. })
        ));
        assert_eq!(monitor.streak(), 1);
        monitor.on_accepted(2.1, &good_pose(2.1));
        assert_eq!(monitor.on_accepted(2.2, &good_pose(2.2)), Validity::Valid);
    }

    #[test]
    fn each_pose_fault_invalidates() {
        let cases: Vec<(Pose, fn(&HealthFault) -> bool)> = vec![
            (
                Pose {
                    covariance: Covariance::from_diagonal(&[0.1, 0.1, 0.1, 0.1, 2.0, 0.1]),
                    ..good_pose(0.3)
                },
                |f| matches!(f, HealthFault::CovarianceExceeded { axis: 4, .. }),
            ),
            (
                Pose {
                    position: Vector3::new(150.0, 0.0, 0.0),
                    ..good_pose(0.3)
                },
                |f| matches!(f, HealthFault::OutOfBounds { .. }),
            ),
            (
                Pose {
                    orientation: Quaternion {
                        x: 0.0,
                        y: 0.0,
                        z: 0.1,
                        w: 1.0,
                    },
                    ..good_pose(0.3)
                },
                |f| matches!(f, HealthFault::Denormalized { .. }),
            ),
            (
                Pose {
                    position: Vector3::new(f64::NAN, 0.0, 0.0),
                    ..good_pose(0.3)
                },
                |f| matches!(f, HealthFault::NonFinite),
            ),
        ];
        for (pose, expected) in cases {
            let mut monitor = recovered();
            assert_eq!(monitor.on_accepted(0.3, &pose), Validity::Invalid);
            let fault = monitor.last_fault().unwrap();
            assert!(expected(fault), "unexpected fault {fault}");
            assert_eq!(monitor.streak(), 0);
        }
    }

    #[test]
    fn recovery_clears_fault() {
        let mut monitor = recovered();
        let far = Pose {
            position: Vector3::new(500.0, 0.0, 0.0),
            ..good_pose(0.3)
        };
        monitor.on_accepted(0.3, &far);
        assert!(monitor.last_fault().is_some());
        for i in 4..7 {
            monitor.on_accepted(i as f64 * 0.1, &good_pose(i as f64 * 0.1));
        }
        assert!(monitor.is_valid());
        assert!(monitor.last_fault().is_none());
    }
}
