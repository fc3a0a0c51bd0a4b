//! Estimator configuration.
//!
//! The configuration is loaded once at startup and passed by value into the estimator; it is
//! never mutated afterwards. It can be read from and written to JSON, YAML or TOML, the format
//! being chosen by file extension.
//!
//! ## Example
//!
//! ```
//! use posefuse::config::EstimatorConfig;
//!
//! let cfg = EstimatorConfig::default();
//! assert!(cfg.validate().is_ok());
//! assert_eq!(cfg.max_pose_covariance, 1.0);
//! ```

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::MapBounds;
use crate::error::ConfigError;

/// A known map-frame feature that range/bearing sensors can observe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    /// Human readable identifier, used only in logs
    pub id: String,
    /// Map-frame position in meters
    pub position: [f64; 3],
}
impl Landmark {
    pub fn new(id: &str, x: f64, y: f64, z: f64) -> Self {
        Landmark {
            id: id.to_string(),
            position: [x, y, z],
        }
    }
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.position[0], self.position[1], self.position[2])
    }
}

fn default_quaternion_norm_tolerance() -> f64 {
    1e-3
}
fn default_max_pose_covariance() -> f64 {
    1.0
}
fn default_observation_timeout_s() -> f64 {
    1.0
}
fn default_recovery_count() -> usize {
    5
}
fn default_max_condition_number() -> f64 {
    1e12
}
fn default_max_consecutive_misses() -> usize {
    10
}
fn default_innovation_gate() -> f64 {
    100.0
}
fn default_initial_variance() -> f64 {
    1e6
}
fn default_process_noise() -> [f64; 6] {
    // position (m²/s), attitude (rad²/s)
    [0.05, 0.05, 0.01, 1e-3, 1e-3, 1e-3]
}
fn default_max_predict_dt() -> f64 {
    0.1
}

/// Immutable configuration for the localization pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Region the position estimate must stay within to be valid.
    #[serde(default)]
    pub map_bounds: MapBounds,
    /// Allowed deviation of `‖q‖²` from one.
    #[serde(default = "default_quaternion_norm_tolerance")]
    pub quaternion_norm_tolerance: f64,
    /// Largest diagonal covariance entry a valid pose may carry.
    #[serde(default = "default_max_pose_covariance")]
    pub max_pose_covariance: f64,
    /// Maximum time without an accepted observation before the pose is invalidated (s).
    #[serde(default = "default_observation_timeout_s")]
    pub observation_timeout_s: f64,
    /// Consecutive healthy observations required to leave the invalid state.
    #[serde(default = "default_recovery_count")]
    pub recovery_count: usize,
    /// Ceiling on the innovation covariance condition number; updates above it are skipped.
    #[serde(default = "default_max_condition_number")]
    pub max_condition_number: f64,
    /// Consecutive rejected or skipped observations that count as starvation.
    #[serde(default = "default_max_consecutive_misses")]
    pub max_consecutive_misses: usize,
    /// Chi-square gate on the normalized innovation squared.
    #[serde(default = "default_innovation_gate")]
    pub innovation_gate: f64,
    /// Position the estimator starts from (m).
    #[serde(default)]
    pub initial_position: [f64; 3],
    /// Variance assigned to every axis of the initial covariance.
    #[serde(default = "default_initial_variance")]
    pub initial_variance: f64,
    /// Process noise densities `[x, y, z, roll, pitch, yaw]`, added as `Q·dt` on prediction.
    #[serde(default = "default_process_noise")]
    pub process_noise: [f64; 6],
    /// Longest single prediction step (s); longer gaps are integrated in several steps.
    #[serde(default = "default_max_predict_dt")]
    pub max_predict_dt: f64,
    /// Landmarks addressable by range/bearing observations, by index.
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            map_bounds: MapBounds::default(),
            quaternion_norm_tolerance: default_quaternion_norm_tolerance(),
            max_pose_covariance: default_max_pose_covariance(),
            observation_timeout_s: default_observation_timeout_s(),
            recovery_count: default_recovery_count(),
            max_condition_number: default_max_condition_number(),
            max_consecutive_misses: default_max_consecutive_misses(),
            innovation_gate: default_innovation_gate(),
            initial_position: [0.0; 3],
            initial_variance: default_initial_variance(),
            process_noise: default_process_noise(),
            max_predict_dt: default_max_predict_dt(),
            landmarks: Vec::new(),
        }
    }
}

impl EstimatorConfig {
    pub fn initial_position(&self) -> Vector3<f64> {
        Vector3::new(
            self.initial_position[0],
            self.initial_position[1],
            self.initial_position[2],
        )
    }

    /// Check every field for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.map_bounds.is_well_formed() {
            return Err(ConfigError::Invalid(format!(
                "map bounds must be finite with min <= max: {:?}",
                self.map_bounds
            )));
        }
        let positive = [
            ("quaternion_norm_tolerance", self.quaternion_norm_tolerance),
            ("max_pose_covariance", self.max_pose_covariance),
            ("observation_timeout_s", self.observation_timeout_s),
            ("innovation_gate", self.innovation_gate),
            ("initial_variance", self.initial_variance),
            ("max_predict_dt", self.max_predict_dt),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be finite and positive, got {value}"
                )));
            }
        }
        if !(self.max_condition_number >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "max_condition_number must be >= 1, got {}",
                self.max_condition_number
            )));
        }
        if self.recovery_count == 0 {
            return Err(ConfigError::Invalid(
                "recovery_count must be at least 1".to_string(),
            ));
        }
        if self.max_consecutive_misses == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_misses must be at least 1".to_string(),
            ));
        }
        if self.process_noise.iter().any(|q| !q.is_finite() || *q < 0.0) {
            return Err(ConfigError::Invalid(format!(
                "process_noise must be finite and non-negative, got {:?}",
                self.process_noise
            )));
        }
        if self.initial_position.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "initial_position must be finite, got {:?}",
                self.initial_position
            )));
        }
        for landmark in &self.landmarks {
            if landmark.position.iter().any(|v| !v.is_finite()) {
                return Err(ConfigError::Invalid(format!(
                    "landmark '{}' has a non-finite position",
                    landmark.id
                )));
            }
        }
        Ok(())
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        Ok(toml::from_str(&s)?)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml), then validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let p = path.as_ref();
        let config = match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }?;
        config.validate()?;
        Ok(config)
    }
}

fn extension(p: &Path) -> Option<String> {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}
