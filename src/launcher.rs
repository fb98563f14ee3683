//! Experiment launcher: allocates a fresh log directory and holds the run
//! flag up for the experiment's duration.
//!
//! Starting and stopping the containers themselves is left to the caller.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::time::{self, Duration};
use tracing::{info, warn};

use crate::config::LaunchConfig;
use crate::flags::{ControlChannel, Flag};

const EXPERIMENT_PREFIX: &str = "experiment_";

/// Next unused `experiment_<n>` under `base`, one past the highest existing
/// index. Returns the path and its directory name. Does not create it.
pub fn next_experiment_dir(base: &Path) -> Result<(PathBuf, String)> {
    let highest = match std::fs::read_dir(base) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| {
                e.file_name()
                    .to_str()?
                    .strip_prefix(EXPERIMENT_PREFIX)?
                    .parse::<u32>()
                    .ok()
            })
            .max(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e).with_context(|| format!("scan {}", base.display())),
    };

    let name = format!("{EXPERIMENT_PREFIX}{}", highest.map_or(0, |n| n + 1));
    Ok((base.join(&name), name))
}

/// Holds the run flag raised; lowers it when dropped, including during
/// unwinding.
pub struct RunGuard<F: Flag> {
    flag: F,
}

impl<F: Flag> RunGuard<F> {
    pub fn raise(flag: F) -> Result<Self> {
        flag.write(true).context("raise run flag")?;
        Ok(Self { flag })
    }
}

impl<F: Flag> Drop for RunGuard<F> {
    fn drop(&mut self) {
        match self.flag.write(false) {
            Ok(()) => info!("run flag lowered"),
            Err(e) => warn!("could not lower run flag: {e:#}"),
        }
    }
}

/// Run one experiment: new log dir, `ready` reset, `run` raised until the
/// duration elapses or `shutdown` resolves. Returns the experiment dir.
pub async fn run_experiment<C, S>(config: &LaunchConfig, control: &C, shutdown: S) -> Result<PathBuf>
where
    C: ControlChannel,
    S: Future<Output = ()>,
{
    let (dir, name) = next_experiment_dir(&config.logs_dir)?;
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    for unit in 0..config.units {
        let unit_dir = dir.join(unit.to_string());
        std::fs::create_dir_all(&unit_dir).with_context(|| format!("create {}", unit_dir.display()))?;
    }
    info!("experiment {name} logging to {}", dir.display());

    control
        .ready_flag()
        .write(false)
        .context("reset ready flag")?;
    let guard = RunGuard::raise(control.run_flag())?;

    let elapsed = async {
        match config.duration {
            Some(d) => time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = elapsed => info!("experiment {name} finished after {:?}", config.duration.unwrap_or(Duration::ZERO)),
        _ = shutdown => info!("experiment {name} interrupted"),
    }

    drop(guard);
    Ok(dir)
}
