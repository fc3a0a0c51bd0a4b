//! Pose query service.
//!
//! A single [PosePublisher] owned by the estimator pipeline swaps in new pose snapshots, and any
//! number of [PoseReader] clones read them from other threads. Publication only swaps an
//! `Arc<Pose>` under a `parking_lot::RwLock`, so readers never wait on filter computation and
//! never see a partially written pose.
//!
//! The finite-value guarantee lives here: whatever the estimator produced, a published pose
//! never contains NaN or infinity.
//!
//! This module also defines the fixed-size binary pose record:
//!
//! | Offset | Size | Field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 2    | record version (`u16`, currently 1)    |
//! | 2      | 56   | x, y, z, qx, qy, qz, qw (`f64`)        |
//! | 58     | 288  | covariance, row-major (36 × `f64`)     |
//! | 346    | 1    | valid flag (`u8`, 0 or 1)              |
//! | 347    | 8    | timestamp (`f64`, seconds)             |
//!
//! All values are little-endian.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use nalgebra::Vector3;
use parking_lot::RwLock;

use crate::error::RecordError;
use crate::{COVARIANCE_LEN, COVARIANCE_SATURATION, Covariance, Pose, Quaternion};

/// Current binary record version.
pub const RECORD_VERSION: u16 = 1;
/// Size of an encoded pose record in bytes.
pub const RECORD_SIZE: usize = 2 + 7 * 8 + COVARIANCE_LEN * 8 + 1 + 8;

struct Shared {
    pose: RwLock<Arc<Pose>>,
    version: AtomicU64,
}

/// Write side of the pose snapshot. There is exactly one per estimator.
pub struct PosePublisher {
    shared: Arc<Shared>,
    last_position: Vector3<f64>,
    last_orientation: Quaternion,
    last_timestamp: f64,
}

/// Read side of the pose snapshot. Cheap to clone and safe to share between threads.
#[derive(Clone)]
pub struct PoseReader {
    shared: Arc<Shared>,
}

impl PosePublisher {
    /// Create a publisher whose first snapshot is `initial` (sanitized like any other pose).
    pub fn new(initial: Pose) -> Self {
        let mut publisher = PosePublisher {
            shared: Arc::new(Shared {
                pose: RwLock::new(Arc::new(Pose::default())),
                version: AtomicU64::new(0),
            }),
            last_position: Vector3::zeros(),
            last_orientation: Quaternion::identity(),
            last_timestamp: 0.0,
        };
        let first = publisher.sanitize(initial);
        *publisher.shared.pose.write() = Arc::new(first);
        publisher
    }

    pub fn reader(&self) -> PoseReader {
        PoseReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Replace the current snapshot with `pose` and bump the version.
    ///
    /// Non-finite fields are replaced before publication: position and orientation by the last
    /// published finite values (identity and the origin before anything was published), the
    /// timestamp by the last published one, covariance entries by [COVARIANCE_SATURATION]. Such
    /// a pose is always published invalid. Returns the snapshot as published.
    pub fn publish(&mut self, pose: Pose) -> Arc<Pose> {
        let snapshot = Arc::new(self.sanitize(pose));
        {
            let mut current = self.shared.pose.write();
            *current = Arc::clone(&snapshot);
            self.shared.version.fetch_add(1, Ordering::Release);
        }
        snapshot
    }

    /// The most recently published snapshot.
    pub fn current(&self) -> Arc<Pose> {
        Arc::clone(&self.shared.pose.read())
    }

    fn sanitize(&mut self, mut pose: Pose) -> Pose {
        let mut repaired = false;
        if pose.position.iter().all(|v| v.is_finite()) {
            self.last_position = pose.position;
        } else {
            pose.position = self.last_position;
            repaired = true;
        }
        if pose.orientation.is_finite() {
            self.last_orientation = pose.orientation;
        } else {
            pose.orientation = self.last_orientation;
            repaired = true;
        }
        if pose.timestamp.is_finite() {
            self.last_timestamp = pose.timestamp;
        } else {
            pose.timestamp = self.last_timestamp;
            repaired = true;
        }
        if !pose.covariance.is_finite() {
            for v in pose.covariance.0.iter_mut().filter(|v| !v.is_finite()) {
                *v = COVARIANCE_SATURATION;
            }
            repaired = true;
        }
        if repaired {
            warn!("Replaced non-finite values in pose at t={:.3}", pose.timestamp);
            pose.valid = false;
        }
        pose
    }
}

impl PoseReader {
    /// Latest published snapshot. Two calls without an intervening publication return the same
    /// `Arc`.
    pub fn current_pose(&self) -> Arc<Pose> {
        Arc::clone(&self.shared.pose.read())
    }

    /// Number of publications so far.
    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::Acquire)
    }

    /// Snapshot and its version, read together.
    pub fn snapshot(&self) -> (Arc<Pose>, u64) {
        let pose = self.shared.pose.read();
        (Arc::clone(&pose), self.shared.version.load(Ordering::Acquire))
    }
}

fn read_f64(bytes: &[u8], offset: usize) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    f64::from_le_bytes(buf)
}

impl Pose {
    /// Encode as a fixed-size little-endian record.
    pub fn to_record(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..2].copy_from_slice(&RECORD_VERSION.to_le_bytes());
        let head = [
            self.position.x,
            self.position.y,
            self.position.z,
            self.orientation.x,
            self.orientation.y,
            self.orientation.z,
            self.orientation.w,
        ];
        let mut offset = 2;
        for v in head.iter().chain(self.covariance.0.iter()) {
            out[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
            offset += 8;
        }
        out[offset] = u8::from(self.valid);
        offset += 1;
        out[offset..offset + 8].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    /// Decode a record produced by [Pose::to_record].
    pub fn from_record(bytes: &[u8]) -> Result<Pose, RecordError> {
        if bytes.len() != RECORD_SIZE {
            return Err(RecordError::Length {
                expected: RECORD_SIZE,
                found: bytes.len(),
            });
        }
        let version = u16::from_le_bytes([bytes[0], bytes[1]]);
        if version != RECORD_VERSION {
            return Err(RecordError::VersionMismatch {
                expected: RECORD_VERSION,
                found: version,
            });
        }
        let mut values = [0.0; 7 + COVARIANCE_LEN];
        for (i, v) in values.iter_mut().enumerate() {
            *v = read_f64(bytes, 2 + i * 8);
        }
        let flag = 2 + values.len() * 8;
        Ok(Pose {
            position: Vector3::new(values[0], values[1], values[2]),
            orientation: Quaternion {
                x: values[3],
                y: values[4],
                z: values[5],
                w: values[6],
            },
            covariance: Covariance::from_slice(&values[7..]),
            valid: bytes[flag] != 0,
            timestamp: read_f64(bytes, flag + 1),
        })
    }
}
