//! The localization pipeline.
//!
//! [Localizer] is the single writer: it owns the ingestor, the estimator and the validity monitor
//! and publishes a snapshot after every change. [LocalizerThread] runs a `Localizer` on its own
//! thread, fed through a bounded channel, while readers query poses from anywhere.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::{debug, info};

use crate::Pose;
use crate::config::EstimatorConfig;
use crate::error::{ConfigError, LocalizerError, ObservationError, StartError, SubmitError};
use crate::health::{HealthFault, HealthLimits, HealthMonitor, Validity};
use crate::ingest::{IngestStats, Ingestor, RawObservation};
use crate::kalman::{PoseEstimator, UpdateReport};
use crate::measurements::Measurement;
use crate::service::{PosePublisher, PoseReader};

/// Single-writer localization pipeline.
///
/// ```
/// use posefuse::config::EstimatorConfig;
/// use posefuse::ingest::{RawObservation, SensorKind};
/// use posefuse::localizer::Localizer;
///
/// let mut localizer = Localizer::new(EstimatorConfig::default()).unwrap();
/// let reader = localizer.reader();
/// for i in 0..5 {
///     let fix = RawObservation::with_diagonal(
///         "beacon", SensorKind::Position, i as f64 * 0.1, vec![1.0, 2.0, 0.0], &[0.01; 3],
///     );
///     localizer.process(&fix).unwrap();
/// }
/// let pose = reader.current_pose();
/// assert!(pose.is_finite());
/// assert!(!pose.valid); // attitude has not been observed yet
/// ```
pub struct Localizer {
    config: EstimatorConfig,
    ingestor: Ingestor,
    estimator: PoseEstimator,
    monitor: HealthMonitor,
    publisher: PosePublisher,
    clock: f64,
    started: bool,
    skipped_updates: u64,
}

impl Localizer {
    /// Build a localizer from a configuration, which is validated first.
    pub fn new(config: EstimatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let estimator = PoseEstimator::new(&config, 0.0);
        let publisher = PosePublisher::new(estimator.pose(false));
        Ok(Localizer {
            ingestor: Ingestor::new(&config),
            monitor: HealthMonitor::new(HealthLimits::from(&config)),
            estimator,
            publisher,
            clock: 0.0,
            started: false,
            skipped_updates: 0,
            config,
        })
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }
    pub fn reader(&self) -> PoseReader {
        self.publisher.reader()
    }
    pub fn current_pose(&self) -> Arc<Pose> {
        self.publisher.current()
    }
    pub fn estimator(&self) -> &PoseEstimator {
        &self.estimator
    }
    pub fn validity(&self) -> Validity {
        self.monitor.validity()
    }
    /// Why the pose is currently invalid, if a fault was detected.
    pub fn last_fault(&self) -> Option<HealthFault> {
        self.monitor.last_fault().cloned()
    }
    pub fn stats(&self) -> IngestStats {
        self.ingestor.stats()
    }
    /// Accepted observations whose update was skipped.
    pub fn skipped_updates(&self) -> u64 {
        self.skipped_updates
    }

    /// Ingest one raw observation and run it through the estimator.
    ///
    /// Every error is non-fatal: the observation is dropped and counted as a miss. A rejected
    /// observation leaves the estimator untouched and only republishes when the validity flag
    /// changes. Odometry returns `Ok(None)`.
    pub fn process(
        &mut self,
        raw: &RawObservation,
    ) -> Result<Option<UpdateReport>, LocalizerError> {
        let (measurement, timestamp) = match self.validate(raw) {
            Ok(m) => m,
            Err(e) => {
                if self.record_miss() {
                    self.publish();
                }
                return Err(e.into());
            }
        };
        if !self.started {
            self.estimator.set_timestamp(timestamp);
            self.clock = timestamp;
            self.started = true;
        }
        self.clock = self.clock.max(timestamp);
        match self.estimator.apply(&measurement, timestamp) {
            Ok(report) => {
                let pose = self.estimator.pose(false);
                self.monitor.on_accepted(self.clock, &pose);
                self.publish();
                Ok(report)
            }
            Err(e) => {
                self.skipped_updates += 1;
                debug!("Skipped update from '{}': {}", raw.sensor_id, e);
                self.record_miss();
                self.publish();
                Err(e.into())
            }
        }
    }

    /// Advance the observation clock to `now` without a new observation.
    ///
    /// The estimate is predicted forward, so its covariance keeps growing, and the monitor
    /// re-checks starvation. Non-finite or past times only re-check the current state.
    pub fn tick(&mut self, now: f64) -> Arc<Pose> {
        if now.is_finite() && self.started {
            self.clock = self.clock.max(now);
            self.estimator.predict_to(self.clock);
        }
        let pose = self.estimator.pose(false);
        self.monitor.on_tick(self.clock, &pose);
        self.publish()
    }

    fn validate(&mut self, raw: &RawObservation) -> Result<(Measurement, f64), ObservationError> {
        let observation = self.ingestor.ingest(raw)?;
        let measurement = Measurement::from_observation(&observation, &self.config.landmarks)?;
        Ok((measurement, observation.timestamp))
    }

    /// Returns true when the validity flag changed.
    fn record_miss(&mut self) -> bool {
        let before = self.monitor.validity();
        let pose = self.estimator.pose(false);
        self.monitor.on_missed(self.clock, &pose) != before
    }

    fn publish(&mut self) -> Arc<Pose> {
        let valid = self.monitor.validity() == Validity::Valid;
        self.publisher.publish(self.estimator.pose(valid))
    }
}

enum Input {
    Observation(RawObservation),
    Tick(f64),
}

/// A [Localizer] running on a dedicated thread.
pub struct LocalizerThread {
    sender: Sender<Input>,
    reader: PoseReader,
    handle: JoinHandle<IngestStats>,
}

impl LocalizerThread {
    /// Start the localizer thread with an input queue of `capacity` entries.
    pub fn spawn(config: EstimatorConfig, capacity: usize) -> Result<Self, StartError> {
        let localizer = Localizer::new(config)?;
        let reader = localizer.reader();
        let (sender, receiver) = bounded(capacity.max(1));
        let handle = thread::Builder::new()
            .name("localizer".into())
            .spawn(move || run(localizer, receiver))?;
        info!("Localizer thread started (queue capacity {})", capacity.max(1));
        Ok(LocalizerThread {
            sender,
            reader,
            handle,
        })
    }

    pub fn reader(&self) -> PoseReader {
        self.reader.clone()
    }

    /// Queue an observation without blocking.
    pub fn submit(&self, raw: RawObservation) -> Result<(), SubmitError> {
        self.send(Input::Observation(raw))
    }

    /// Queue a clock tick without blocking.
    pub fn tick(&self, now: f64) -> Result<(), SubmitError> {
        self.send(Input::Tick(now))
    }

    fn send(&self, input: Input) -> Result<(), SubmitError> {
        self.sender.try_send(input).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::QueueFull,
            TrySendError::Disconnected(_) => SubmitError::Disconnected,
        })
    }

    /// Close the queue, let the thread process everything already queued, then join it.
    pub fn shutdown(self) -> thread::Result<IngestStats> {
        let LocalizerThread { sender, handle, .. } = self;
        drop(sender);
        handle.join()
    }
}

fn run(mut localizer: Localizer, receiver: Receiver<Input>) -> IngestStats {
    for input in receiver.iter() {
        match input {
            Input::Observation(raw) => {
                if let Err(e) = localizer.process(&raw) {
                    debug!("Observation from '{}' dropped: {}", raw.sensor_id, e);
                }
            }
            Input::Tick(now) => {
                localizer.tick(now);
            }
        }
    }
    let stats = localizer.stats();
    info!(
        "Localizer thread stopped: {} accepted, {} malformed, {} stale, {} skipped updates",
        stats.accepted,
        stats.malformed,
        stats.stale,
        localizer.skipped_updates()
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SensorKind;

    fn fix(t: f64, x: f64) -> RawObservation {
        RawObservation::with_diagonal(
            "beacon",
            SensorKind::Position,
            t,
            vec![x, 0.0, 0.0],
            &[0.01; 3],
        )
    }

    fn heading(t: f64) -> RawObservation {
        RawObservation::with_diagonal(
            "ahrs",
            SensorKind::Attitude,
            t,
            vec![0.0, 0.0, 0.2],
            &[1e-3; 3],
        )
    }

    fn converge(localizer: &mut Localizer, from: usize, to: usize) {
        for i in from..to {
            let t = i as f64 * 0.1;
            localizer.process(&fix(t, 2.0)).unwrap();
            localizer.process(&heading(t)).unwrap();
        }
    }

    #[test]
    fn becomes_valid_with_good_data() {
        let mut localizer = Localizer::new(EstimatorConfig::default()).unwrap();
        assert!(!localizer.current_pose().valid);
        converge(&mut localizer, 0, 5);
        let pose = localizer.current_pose();
        assert!(pose.valid, "{:?}", localizer.last_fault());
        assert!(localizer.last_fault().is_none());
        assert_eq!(localizer.stats().accepted, 10);
    }

    #[test]
    fn rejected_observation_keeps_state() {
        let mut localizer = Localizer::new(EstimatorConfig::default()).unwrap();
        converge(&mut localizer, 0, 5);
        let reader = localizer.reader();
        let (before, version) = reader.snapshot();
        let err = localizer.process(&fix(0.6, f64::NAN)).unwrap_err();
        assert!(matches!(
            err,
            LocalizerError::Rejected(ObservationError::Malformed { .. })
        ));
        let (after, after_version) = reader.snapshot();
        assert_eq!(version, after_version);
        assert_eq!(*before, *after);
        assert_eq!(localizer.stats().malformed, 1);
    }

    #[test]
    fn invalid_config_is_refused() {
        let never_recovers = EstimatorConfig {
            max_consecutive_misses: 0,
            ..EstimatorConfig::default()
        };
        assert!(matches!(
            Localizer::new(never_recovers.clone()),
            Err(ConfigError::Invalid(_))
        ));
        let no_hysteresis = EstimatorConfig {
            recovery_count: 0,
            ..EstimatorConfig::default()
        };
        assert!(matches!(
            Localizer::new(no_hysteresis),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            LocalizerThread::spawn(never_recovers, 8),
            Err(StartError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn odometry_sets_twist() {
        let mut localizer = Localizer::new(EstimatorConfig::default()).unwrap();
        let odom = RawObservation::with_diagonal(
            "wheels",
            SensorKind::Odometry,
            0.0,
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            &[1e-3; 6],
        );
        assert_eq!(localizer.process(&odom).unwrap(), None);
        localizer.tick(0.5);
        assert!((localizer.estimator().state().position.x - 0.5).abs() < 1e-9);
    }

    #[test]
    fn thread_drains_on_shutdown() {
        let runner = LocalizerThread::spawn(EstimatorConfig::default(), 64).unwrap();
        let reader = runner.reader();
        for i in 0..20 {
            runner.submit(fix(i as f64 * 0.1, 1.0)).unwrap();
        }
        let stats = runner.shutdown().unwrap();
        assert_eq!(stats.accepted, 20);
        assert_eq!(reader.version(), 20);
        assert_eq!(reader.current_pose().timestamp, 19.0 * 0.1);
    }
}
