//! Configuration for the controller, scheduler and launcher processes.
//!
//! Built from CLI flags / environment in `main`, validated here.

use std::path::PathBuf;

use anyhow::{Result, bail, ensure};
use tokio::time::Duration;

use crate::mode::ReplayPolicy;
use crate::shaper::ShapingProfile;

/// Poll interval for every flag read.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
/// Controller replay tick.
pub const DEFAULT_TICK_MS: u64 = 100;
/// How long the controller waits for the run flag to be raised at all.
pub const DEFAULT_RUN_WAIT_SECS: u64 = 60;
pub const DEFAULT_TIMESTAMP_COLUMN: &str = "Timestamp";
pub const DEFAULT_RATE_COLUMN: &str = "DL_bitrate";
pub const DEFAULT_PROJECT_PREFIX: &str = "istream_player_";
pub const DEFAULT_CONTAINER_IFACE: &str = "eth0";
pub const SESSION_LOG_FILE: &str = "session_log.json";

/// Where each unit's rate comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum RateSource {
    /// Trace files, assigned to units round-robin.
    Traces(Vec<PathBuf>),
    /// One fixed rate for every unit, applied once.
    Static(u64),
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Units are numbered `0..count`.
    pub count: u32,
    pub source: RateSource,
    pub tick: Duration,
    /// Give up if the run flag has not been raised within this long.
    pub run_wait: Duration,
    pub profile: ShapingProfile,
    pub replay_policy: ReplayPolicy,
    pub timestamp_column: String,
    pub rate_column: String,
}

impl ControllerConfig {
    pub fn new(count: u32, source: RateSource) -> Self {
        Self {
            count,
            source,
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            run_wait: Duration::from_secs(DEFAULT_RUN_WAIT_SECS),
            profile: ShapingProfile::default(),
            replay_policy: ReplayPolicy::default(),
            timestamp_column: DEFAULT_TIMESTAMP_COLUMN.to_string(),
            rate_column: DEFAULT_RATE_COLUMN.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.count > 0, "container count must be at least 1");
        ensure!(!self.tick.is_zero(), "tick interval must be non-zero");
        match &self.source {
            RateSource::Traces(paths) if paths.is_empty() => {
                bail!("either --trace or --bandwidth is required")
            }
            RateSource::Static(0) => bail!("static bandwidth must be positive"),
            _ => {}
        }
        ensure!(
            (0.0..=100.0).contains(&self.profile.loss_percent),
            "loss must be within 0-100%"
        );
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub unit: u32,
    /// Rate of the exponential inter-session delay, in 1/s.
    pub lambda: f64,
    pub node_id: Option<u64>,
    pub log_path: PathBuf,
    pub poll_interval: Duration,
    /// Inclusive kbit/s range for a per-session random static bandwidth.
    pub bandwidth_range: Option<(u64, u64)>,
    /// Content URLs to pick from per session.
    pub contents: Vec<String>,
    /// Mixed into the unit seed so separate experiments can differ.
    pub experiment_seed: Option<u64>,
}

impl SchedulerConfig {
    pub fn new(unit: u32, lambda: f64, log_path: PathBuf) -> Self {
        Self {
            unit,
            lambda,
            node_id: None,
            log_path,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            bandwidth_range: None,
            contents: Vec::new(),
            experiment_seed: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.lambda.is_finite() && self.lambda > 0.0,
            "lambda must be a positive number, got {}",
            self.lambda
        );
        ensure!(!self.poll_interval.is_zero(), "poll interval must be non-zero");
        if let Some((min, max)) = self.bandwidth_range {
            ensure!(
                min > 0 && min <= max,
                "bandwidth range must satisfy 0 < min <= max, got {min}..={max}"
            );
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct LaunchConfig {
    pub logs_dir: PathBuf,
    /// `None` runs until interrupted.
    pub duration: Option<Duration>,
    /// Per-unit log directories to pre-create inside the experiment dir.
    pub units: u32,
}

impl LaunchConfig {
    pub fn new(logs_dir: impl Into<PathBuf>, duration: Option<Duration>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            duration,
            units: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_defaults() {
        let cfg = ControllerConfig::new(2, RateSource::Static(1000));
        assert_eq!(cfg.tick, Duration::from_millis(100));
        assert_eq!(cfg.replay_policy, ReplayPolicy::Step);
        assert_eq!(cfg.timestamp_column, "Timestamp");
        cfg.validate().unwrap();
    }

    #[test]
    fn controller_rejects_bad_sources() {
        assert!(ControllerConfig::new(2, RateSource::Traces(vec![])).validate().is_err());
        assert!(ControllerConfig::new(2, RateSource::Static(0)).validate().is_err());
        assert!(ControllerConfig::new(0, RateSource::Static(10)).validate().is_err());
    }

    #[test]
    fn scheduler_validation() {
        let mut cfg = SchedulerConfig::new(0, 0.5, "log.json".into());
        cfg.validate().unwrap();

        cfg.bandwidth_range = Some((5000, 500));
        assert!(cfg.validate().is_err());
        cfg.bandwidth_range = Some((500, 5000));
        cfg.validate().unwrap();

        for lambda in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            cfg.lambda = lambda;
            assert!(cfg.validate().is_err(), "lambda {lambda} accepted");
        }
    }
}
