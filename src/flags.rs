//! Cross-process coordination flags.
//!
//! Three kinds of boolean flag tie the processes of an experiment together:
//!
//! - `run`: raised by the launcher for the lifetime of the experiment.
//!   Every loop exits once it reads false.
//! - `ready`: raised by the controller once interfaces are bound and
//!   shaping is live. Schedulers wait on it before their first session.
//! - `active[unit]`: raised by a scheduler while its session streams.
//!   The controller only touches interfaces whose unit is active.
//!
//! Flags are polled, never waited on. The file-backed implementation stores
//! `1` or `0`; a missing or unreadable file reads as false.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use tokio::time::{self, Duration, Instant};

/// A persisted boolean readable and writable by independent processes.
pub trait Flag {
    /// Current value. Anything other than a clear "set" is false.
    fn read(&self) -> bool;

    fn write(&self, value: bool) -> Result<()>;
}

/// Source of the run, ready and per-unit activation flags.
pub trait ControlChannel {
    type Flag: Flag;

    fn run_flag(&self) -> Self::Flag;
    fn ready_flag(&self) -> Self::Flag;
    fn active_flag(&self, unit: u32) -> Self::Flag;
}

/// Flag stored as `"1"`/`"0"` in a file.
#[derive(Clone, Debug)]
pub struct FileFlag {
    path: PathBuf,
}

impl FileFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Flag for FileFlag {
    fn read(&self) -> bool {
        fs::read_to_string(&self.path).is_ok_and(|s| s.trim() == "1")
    }

    fn write(&self, value: bool) -> Result<()> {
        write_atomic(&self.path, if value { "1" } else { "0" })
            .with_context(|| format!("write flag {}", self.path.display()))
    }
}

/// Replace `path` with `contents` via a sibling temp file and rename, so a
/// concurrent reader never sees a half-written value.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

/// Well-known flag locations under one control directory.
#[derive(Clone, Debug)]
pub struct ControlDir {
    root: PathBuf,
    run_override: Option<PathBuf>,
}

impl ControlDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run_override: None,
        }
    }

    /// Use `path` for the run flag instead of `<root>/run.flag`.
    pub fn with_run_flag(mut self, path: Option<PathBuf>) -> Self {
        self.run_override = path;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_path(&self) -> PathBuf {
        self.run_override
            .clone()
            .unwrap_or_else(|| self.root.join("run.flag"))
    }

    pub fn ready_path(&self) -> PathBuf {
        self.root.join("ready.flag")
    }

    pub fn active_path(&self, unit: u32) -> PathBuf {
        self.root.join(format!("active_{unit}.flag"))
    }
}

impl ControlChannel for ControlDir {
    type Flag = FileFlag;

    fn run_flag(&self) -> FileFlag {
        FileFlag::new(self.run_path())
    }

    fn ready_flag(&self) -> FileFlag {
        FileFlag::new(self.ready_path())
    }

    fn active_flag(&self, unit: u32) -> FileFlag {
        FileFlag::new(self.active_path(unit))
    }
}

/// In-process flag. Clones share the same value.
#[derive(Clone, Debug, Default)]
pub struct MemoryFlag {
    value: Arc<AtomicBool>,
}

impl MemoryFlag {
    pub fn new(value: bool) -> Self {
        Self {
            value: Arc::new(AtomicBool::new(value)),
        }
    }

    pub fn set(&self, value: bool) {
        self.value.store(value, Ordering::SeqCst);
    }
}

impl Flag for MemoryFlag {
    fn read(&self) -> bool {
        self.value.load(Ordering::SeqCst)
    }

    fn write(&self, value: bool) -> Result<()> {
        self.set(value);
        Ok(())
    }
}

/// In-process control channel; activation flags are created on first use.
#[derive(Clone, Debug, Default)]
pub struct MemoryControl {
    pub run: MemoryFlag,
    pub ready: MemoryFlag,
    active: Arc<Mutex<FxHashMap<u32, MemoryFlag>>>,
}

impl MemoryControl {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ControlChannel for MemoryControl {
    type Flag = MemoryFlag;

    fn run_flag(&self) -> MemoryFlag {
        self.run.clone()
    }

    fn ready_flag(&self) -> MemoryFlag {
        self.ready.clone()
    }

    fn active_flag(&self, unit: u32) -> MemoryFlag {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.entry(unit).or_default().clone()
    }
}

/// Poll `flag` until it is set. Returns `false` without waiting further if
/// `run` clears first.
pub async fn wait_for<F: Flag, G: Flag>(flag: &F, run: &G, poll: Duration) -> bool {
    loop {
        if !run.read() {
            return false;
        }
        if flag.read() {
            return true;
        }
        time::sleep(poll).await;
    }
}

/// Sleep for `duration` in `poll`-sized slices, returning `false` as soon
/// as `run` is observed clear.
pub async fn sleep_while<G: Flag>(run: &G, duration: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if !run.read() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        time::sleep(poll.min(deadline - now)).await;
    }
}
