#![cfg(any(test, feature = "test-internals"))]
#![allow(dead_code)] // Not every helper is used by every test binary

//! Fakes for the controller's and scheduler's capability traits.

use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use network_sim::ShapingConfig;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::{self, Duration, Instant};

use crate::flags::{Flag, MemoryFlag};
use crate::resolver::{ContainerRef, InterfaceResolver};
use crate::session::{SessionRequest, SessionRunner};
use crate::shaper::Shaper;
use crate::trace::Trace;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Debug, PartialEq)]
pub enum ShaperCall {
    Apply { iface: String, rate_kbit: u64 },
    Clear { iface: String },
}

#[derive(Default)]
struct ShaperState {
    calls: Vec<ShaperCall>,
    /// Root discipline per interface, as a kernel would keep it.
    installed: FxHashMap<String, ShapingConfig>,
    failing: FxHashSet<String>,
}

/// Records every call and keeps one "installed" discipline per interface.
#[derive(Clone, Default)]
pub struct FakeShaper {
    state: Arc<Mutex<ShaperState>>,
}

impl FakeShaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `apply` on `iface` fails from now on.
    pub fn fail_on(&self, iface: &str) {
        lock(&self.state).failing.insert(iface.to_string());
    }

    pub fn calls(&self) -> Vec<ShaperCall> {
        lock(&self.state).calls.clone()
    }

    /// Rates applied to `iface`, in order.
    pub fn rates(&self, iface: &str) -> Vec<u64> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|c| match c {
                ShaperCall::Apply { iface: i, rate_kbit } if i == iface => Some(*rate_kbit),
                _ => None,
            })
            .collect()
    }

    pub fn installed(&self, iface: &str) -> Option<ShapingConfig> {
        lock(&self.state).installed.get(iface).copied()
    }

    pub fn installed_count(&self) -> usize {
        lock(&self.state).installed.len()
    }

    pub fn touched(&self, iface: &str) -> bool {
        lock(&self.state).calls.iter().any(|c| match c {
            ShaperCall::Apply { iface: i, .. } | ShaperCall::Clear { iface: i } => i == iface,
        })
    }
}

impl Shaper for FakeShaper {
    fn apply(&mut self, iface: &str, config: &ShapingConfig) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(ShaperCall::Apply {
            iface: iface.to_string(),
            rate_kbit: config.rate_kbit,
        });
        if state.failing.contains(iface) {
            bail!("tc: cannot find device \"{iface}\"");
        }
        state.installed.insert(iface.to_string(), *config);
        Ok(())
    }

    fn clear(&mut self, iface: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(ShaperCall::Clear {
            iface: iface.to_string(),
        });
        state.installed.remove(iface);
        Ok(())
    }
}

/// Units mapped to containers and containers to interfaces by hand.
#[derive(Clone, Debug, Default)]
pub struct FakeResolver {
    containers: FxHashMap<u32, Vec<ContainerRef>>,
    links: FxHashMap<String, String>,
    broken: FxHashSet<u32>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unit `unit` runs container `player_<unit>` whose peer is `iface`.
    pub fn with_unit(mut self, unit: u32, iface: &str) -> Self {
        let name = format!("player_{unit}");
        self.links.insert(name.clone(), iface.to_string());
        self.containers.entry(unit).or_default().push(ContainerRef {
            id: name.clone(),
            name,
        });
        self
    }

    /// Unit `unit` has a container whose interface cannot be found.
    pub fn with_unresolvable(mut self, unit: u32) -> Self {
        let name = format!("ghost_{unit}");
        self.containers.entry(unit).or_default().push(ContainerRef {
            id: name.clone(),
            name,
        });
        self
    }

    /// Container listing for `unit` errors out.
    pub fn with_broken(mut self, unit: u32) -> Self {
        self.broken.insert(unit);
        self
    }
}

impl InterfaceResolver for FakeResolver {
    fn containers(&self, unit: u32) -> Result<Vec<ContainerRef>> {
        if self.broken.contains(&unit) {
            bail!("docker ps failed: daemon not reachable");
        }
        Ok(self.containers.get(&unit).cloned().unwrap_or_default())
    }

    fn resolve(&self, container: &ContainerRef) -> Option<String> {
        self.links.get(&container.id).cloned()
    }
}

#[derive(Clone, Debug)]
pub struct RecordedSession {
    pub request: SessionRequest,
    pub started: Instant,
    /// Active flag value observed while the session ran.
    pub active_during: bool,
}

/// Session runner that takes `duration` of (tokio) time per session.
#[derive(Clone)]
pub struct FakeRunner {
    sessions: Arc<Mutex<Vec<RecordedSession>>>,
    duration: Duration,
    fail: bool,
    active: Option<MemoryFlag>,
    /// Clear this flag once `stop_after` sessions have run.
    stop: Option<(MemoryFlag, usize)>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            sessions: Arc::default(),
            duration: Duration::ZERO,
            fail: false,
            active: None,
            stop: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Sample `flag` while each session runs.
    pub fn observing(mut self, flag: MemoryFlag) -> Self {
        self.active = Some(flag);
        self
    }

    pub fn stopping(mut self, run: MemoryFlag, after: usize) -> Self {
        self.stop = Some((run, after));
        self
    }

    pub fn sessions(&self) -> Vec<RecordedSession> {
        lock(&self.sessions).clone()
    }
}

impl SessionRunner for FakeRunner {
    async fn run_session(&mut self, request: &SessionRequest) -> Result<()> {
        let active_during = self.active.as_ref().is_some_and(|f| f.read());
        let count = {
            let mut sessions = lock(&self.sessions);
            sessions.push(RecordedSession {
                request: request.clone(),
                started: Instant::now(),
                active_during,
            });
            sessions.len()
        };
        if !self.duration.is_zero() {
            time::sleep(self.duration).await;
        }
        if let Some((run, after)) = &self.stop
            && count >= *after
        {
            run.set(false);
        }
        if self.fail {
            bail!("player exited with exit status: 1");
        }
        Ok(())
    }
}

/// The three-sample trace used throughout the replay tests.
pub fn three_step_trace() -> Trace {
    Trace::from_samples([(0.0, 100), (5.0, 200), (10.0, 50)])
}

/// Write a CSV trace with the default column names.
pub fn write_trace_csv(dir: &std::path::Path, name: &str, rows: &[(&str, u64)]) -> std::path::PathBuf {
    let mut csv = String::from("Timestamp,Longitude,Latitude,DL_bitrate\n");
    for (ts, rate) in rows {
        csv.push_str(&format!("{ts},0.0,0.0,{rate}\n"));
    }
    let path = dir.join(name);
    std::fs::write(&path, csv).unwrap();
    path
}
