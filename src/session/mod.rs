//! Per-container session scheduler.
//!
//! Starts sessions at exponentially distributed intervals, but only while
//! the run flag is set and only after the controller reports ready. The
//! unit's activation flag brackets every session so the controller shapes
//! exactly the units that are streaming.

mod log;
mod runner;
mod variant;

use anyhow::{Result, anyhow};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Exp};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::flags::{ControlChannel, Flag, sleep_while, wait_for};
use crate::utils::now_secs;

pub use self::log::{SessionEntry, SessionLog};
pub use self::runner::{
    CommandRunner, ENV_BANDWIDTH, ENV_INPUT, ENV_UNIT, SessionRequest, SessionRunner,
};
pub use self::variant::{Variant, VariantPicker, unit_seed};

pub struct SessionScheduler<R: SessionRunner, F: Flag> {
    config: SchedulerConfig,
    runner: R,
    run: F,
    ready: F,
    active: F,
    rng: StdRng,
    delay: Exp<f64>,
    picker: VariantPicker,
    log: SessionLog,
    sessions_run: usize,
}

impl<R: SessionRunner, F: Flag> SessionScheduler<R, F> {
    pub fn new<C>(config: SchedulerConfig, runner: R, control: &C) -> Result<Self>
    where
        C: ControlChannel<Flag = F>,
    {
        config.validate()?;
        let delay = Exp::new(config.lambda).map_err(|e| anyhow!("invalid lambda {}: {e}", config.lambda))?;
        let rng = StdRng::seed_from_u64(unit_seed(config.unit, config.experiment_seed));
        let picker = VariantPicker::new(config.bandwidth_range, config.contents.clone());
        let log = SessionLog::load_or_default(&config.log_path);

        Ok(Self {
            run: control.run_flag(),
            ready: control.ready_flag(),
            active: control.active_flag(config.unit),
            config,
            runner,
            rng,
            delay,
            picker,
            log,
            sessions_run: 0,
        })
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Next inter-session delay, in seconds.
    pub fn sample_delay(&mut self) -> f64 {
        self.delay.sample(&mut self.rng)
    }

    /// Drop the activation flag, e.g. after an interrupted session.
    pub fn deactivate(&self) {
        if let Err(e) = self.active.write(false) {
            warn!("[{}] could not clear active flag: {e:#}", self.config.unit);
        }
    }

    /// Schedule sessions until the run flag clears. Returns how many
    /// sessions were started.
    pub async fn run(&mut self) -> Result<usize> {
        let unit = self.config.unit;
        let poll = self.config.poll_interval;
        info!("[{unit}] scheduler started (lambda {})", self.config.lambda);

        while self.run.read() {
            let variant = self.picker.pick(&mut self.rng);
            let sleep_secs = self.sample_delay();

            if !wait_for(&self.ready, &self.run, poll).await {
                break;
            }

            if let Some(node_id) = self.config.node_id
                && self.log.record_node_id(node_id)
            {
                debug!(unit, node_id, "recorded node id");
            }
            self.log.push(SessionEntry {
                timestamp: now_secs(),
                sleep_duration: sleep_secs,
                bandwidth_kbps: variant.bandwidth_kbps,
                content: variant.content.clone(),
            });
            if let Err(e) = self.log.save(&self.config.log_path) {
                warn!("[{unit}] could not write session log: {e:#}");
            }

            info!("[{unit}] next session in {sleep_secs:.2}s");
            if !sleep_while(&self.run, Duration::from_secs_f64(sleep_secs), poll).await {
                break;
            }

            let request = SessionRequest {
                unit,
                bandwidth_kbps: variant.bandwidth_kbps,
                content: variant.content,
            };
            if let Err(e) = self.active.write(true) {
                warn!("[{unit}] could not raise active flag: {e:#}");
            }
            self.sessions_run += 1;
            let result = self.runner.run_session(&request).await;
            self.deactivate();
            match result {
                Ok(()) => info!("[{unit}] session {} finished", self.sessions_run),
                Err(e) => warn!("[{unit}] session {} failed: {e:#}", self.sessions_run),
            }
        }

        info!("[{unit}] run flag cleared after {} sessions", self.sessions_run);
        Ok(self.sessions_run)
    }
}
