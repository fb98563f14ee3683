//! Bandwidth controller: binds units to interfaces and replays traces.
//!
//! Lifecycle: `Idle -> Discovering -> Loading -> Running -> Stopped`.
//! `ready` is raised only on entering `Running`, after every interface
//! is bound and every trace is loaded. One control loop owns all
//! bindings and walks them in unit order each tick.

mod binding;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
pub use binding::{BindingSource, DueSample, InterfaceBinding};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, RateSource};
use crate::flags::{ControlChannel, Flag};
use crate::resolver::InterfaceResolver;
use crate::shaper::Shaper;
use crate::trace::{load_trace, validate_trace_files};
use crate::utils::elapsed_secs;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Discovering,
    Loading,
    Running,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Idle => "idle",
            ControllerState::Discovering => "discovering",
            ControllerState::Loading => "loading",
            ControllerState::Running => "running",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// An interface found during discovery, not yet bound to a rate source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredInterface {
    pub unit: u32,
    pub interface: String,
    pub label: String,
}

pub struct BandwidthController<S: Shaper, C: ControlChannel> {
    config: ControllerConfig,
    shaper: S,
    control: C,
    state: ControllerState,
    discovered: Vec<DiscoveredInterface>,
    bindings: Vec<InterfaceBinding<C::Flag>>,
    started: Option<Instant>,
}

impl<S: Shaper, C: ControlChannel> BandwidthController<S, C> {
    pub fn new(config: ControllerConfig, shaper: S, control: C) -> Self {
        Self {
            config,
            shaper,
            control,
            state: ControllerState::Idle,
            discovered: Vec::new(),
            bindings: Vec::new(),
            started: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn discovered(&self) -> &[DiscoveredInterface] {
        &self.discovered
    }

    pub fn bindings(&self) -> &[InterfaceBinding<C::Flag>] {
        &self.bindings
    }

    pub fn shaper(&self) -> &S {
        &self.shaper
    }

    fn transition(&mut self, next: ControllerState) {
        info!("controller: {} -> {}", self.state, next);
        self.state = next;
    }

    /// Resolve every unit's host-side interface.
    ///
    /// Units that cannot be resolved are skipped with a warning. Fails only
    /// if no unit at all could be bound.
    pub fn discover<R: InterfaceResolver>(&mut self, resolver: &R) -> Result<usize> {
        self.transition(ControllerState::Discovering);

        // A ready flag left over from an earlier run must not leak through.
        if let Err(e) = self.control.ready_flag().write(false) {
            warn!("could not reset ready flag: {e:#}");
        }

        self.discovered.clear();
        for unit in 0..self.config.count {
            let containers = match resolver.containers(unit) {
                Ok(containers) => containers,
                Err(e) => {
                    warn!("[{unit}] container lookup failed, skipping: {e:#}");
                    continue;
                }
            };
            if containers.len() > 1 {
                debug!(
                    unit,
                    count = containers.len(),
                    "unit has several containers, binding the first resolvable one"
                );
            }

            let found = containers
                .iter()
                .find_map(|c| resolver.resolve(c).map(|iface| (c, iface)));

            match found {
                Some((container, interface)) => {
                    info!("[{unit}] container: {} -> veth: {}", container.name, interface);
                    self.discovered.push(DiscoveredInterface {
                        unit,
                        interface,
                        label: container.name.clone(),
                    });
                }
                None => warn!(
                    "[{unit}] no host interface found ({} containers), skipping",
                    containers.len()
                ),
            }
        }

        if self.discovered.is_empty() {
            bail!("no container interfaces found for {} units", self.config.count);
        }
        Ok(self.discovered.len())
    }

    /// Attach a rate source to every discovered interface.
    ///
    /// Traces are loaded once each and assigned round-robin by unit id, so a
    /// unit keeps its trace even when another unit failed discovery.
    pub fn load(&mut self, now: Instant) -> Result<()> {
        if matches!(self.config.source, RateSource::Traces(_)) {
            self.transition(ControllerState::Loading);
        }

        let sources: Vec<BindingSource> = match &self.config.source {
            RateSource::Traces(paths) => {
                if paths.is_empty() {
                    bail!("trace mode needs at least one trace file");
                }
                let traces = paths
                    .iter()
                    .map(|path| {
                        load_trace(path, &self.config.timestamp_column, &self.config.rate_column)
                            .map(Arc::new)
                    })
                    .collect::<Result<Vec<_>>>()?;

                self.discovered
                    .iter()
                    .map(|d| {
                        let idx = d.unit as usize % traces.len();
                        info!("[{}] {} -> {}", d.unit, d.label, paths[idx].display());
                        if traces[idx].is_empty() {
                            warn!("[{}] trace {} has no samples", d.unit, paths[idx].display());
                        }
                        BindingSource::Trace(traces[idx].clone())
                    })
                    .collect()
            }
            RateSource::Static(rate) => {
                for d in &self.discovered {
                    info!("[{}] {} -> {} kbit/s", d.unit, d.label, rate);
                }
                vec![BindingSource::Static(*rate); self.discovered.len()]
            }
        };

        self.bindings = self
            .discovered
            .iter()
            .zip(sources)
            .map(|(d, source)| {
                InterfaceBinding::new(
                    d.unit,
                    d.interface.clone(),
                    d.label.clone(),
                    source,
                    self.control.active_flag(d.unit),
                    now,
                )
            })
            .collect();
        Ok(())
    }

    /// Enter `Running`: start every replay epoch at `now`, install static
    /// rates, then raise `ready`.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        self.transition(ControllerState::Running);

        for binding in &mut self.bindings {
            binding.restart(now);
            if let BindingSource::Static(rate) = binding.source {
                match self.shaper.apply(&binding.interface, &self.config.profile.at_rate(rate)) {
                    Ok(()) => {
                        binding.record_applied();
                        info!("{} ({}): {} kbit/s", binding.label, binding.interface, rate);
                    }
                    Err(e) => warn!("[{}] shaping {} failed: {e:#}", binding.unit, binding.interface),
                }
            }
        }

        self.started = Some(now);
        self.control
            .ready_flag()
            .write(true)
            .context("signal controller ready")
    }

    /// One replay step. Returns how many disciplines were installed.
    pub fn tick(&mut self, now: Instant) -> usize {
        if self.state != ControllerState::Running {
            return 0;
        }
        let policy = self.config.replay_policy;
        let since_start = self.started.map_or(0.0, |s| elapsed_secs(s, now));
        let mut applied = 0;

        for binding in &mut self.bindings {
            if !binding.active.read() {
                continue;
            }
            let Some(due) = binding.due(now, policy) else {
                continue;
            };

            let config = self.config.profile.at_rate(due.rate_kbps);
            match self.shaper.apply(&binding.interface, &config) {
                Ok(()) => {
                    applied += 1;
                    binding.record_applied();
                    info!(
                        "[{since_start:.2}s] {} ({}): {} kbit/s",
                        binding.label, binding.interface, due.rate_kbps
                    );
                }
                Err(e) => warn!(
                    "[{}] shaping {} to {} kbit/s failed: {e:#}",
                    binding.unit, binding.interface, due.rate_kbps
                ),
            }
            if due.skipped > 0 {
                debug!(unit = binding.unit, skipped = due.skipped, "skipped overdue samples");
            }

            if binding.advance(&due, now) {
                info!("[{}] restart bandwidth profile", binding.unit);
            }
        }
        applied
    }

    /// Remove every installed discipline and stop for good.
    pub fn stop(&mut self) {
        if self.state == ControllerState::Stopped {
            return;
        }
        for binding in &self.bindings {
            if let Err(e) = self.shaper.clear(&binding.interface) {
                warn!("[{}] clearing {} failed: {e:#}", binding.unit, binding.interface);
            }
            debug!(
                unit = binding.unit,
                applied = binding.applied(),
                wraps = binding.wraps(),
                "binding summary"
            );
        }
        self.transition(ControllerState::Stopped);
    }

    /// Full lifecycle: validate, discover, load, shape until the run flag
    /// clears or `shutdown` resolves, then clean up.
    ///
    /// The run flag only stops the loop after it has been seen set once,
    /// so starting the controller before the launcher raises it is safe.
    /// If it is not raised within `run_wait`, the controller stops anyway.
    pub async fn run<R, F>(&mut self, resolver: &R, shutdown: F) -> Result<()>
    where
        R: InterfaceResolver,
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        if let RateSource::Traces(paths) = &self.config.source {
            validate_trace_files(paths)?;
        }
        self.discover(resolver)?;
        self.load(Instant::now())?;
        if let Err(e) = self.start(Instant::now()) {
            self.stop();
            return Err(e);
        }

        let replaying = matches!(self.config.source, RateSource::Traces(_));
        let run = self.control.run_flag();
        let mut run_seen = false;
        let run_deadline = Instant::now() + self.config.run_wait;
        let mut ticker = time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("termination requested");
                    break;
                }
                _ = ticker.tick() => {
                    if run.read() {
                        run_seen = true;
                    } else if run_seen {
                        info!("run flag cleared");
                        break;
                    } else if Instant::now() >= run_deadline {
                        warn!("run flag not raised within {:?}, stopping", self.config.run_wait);
                        break;
                    }
                    if replaying {
                        self.tick(Instant::now());
                    }
                }
            }
        }

        self.stop();
        Ok(())
    }
}
