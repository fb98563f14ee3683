//! Running one streaming session through the external player.

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::debug;

/// Content URL override understood by the player wrapper.
pub const ENV_INPUT: &str = "ISTREAM_INPUT";
pub const ENV_BANDWIDTH: &str = "STREAM_NETEM_BANDWIDTH_KBPS";
pub const ENV_UNIT: &str = "STREAM_NETEM_UNIT";

/// Parameters for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRequest {
    pub unit: u32,
    pub bandwidth_kbps: Option<u64>,
    pub content: Option<String>,
}

/// Runs one session to completion.
#[allow(async_fn_in_trait)]
pub trait SessionRunner {
    async fn run_session(&mut self, request: &SessionRequest) -> Result<()>;
}

/// Spawns the player command once per session and waits for it to exit.
#[derive(Clone, Debug)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(command: Vec<String>) -> Result<Self> {
        let mut parts = command.into_iter();
        let Some(program) = parts.next() else {
            bail!("player command is empty");
        };
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn command(&self, request: &SessionRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(ENV_UNIT, request.unit.to_string())
            .kill_on_drop(true);
        if let Some(content) = &request.content {
            cmd.env(ENV_INPUT, content);
        }
        if let Some(bw) = request.bandwidth_kbps {
            cmd.env(ENV_BANDWIDTH, bw.to_string());
        }
        cmd
    }
}

impl SessionRunner for CommandRunner {
    async fn run_session(&mut self, request: &SessionRequest) -> Result<()> {
        debug!(program = self.program, ?request, "starting player");
        let status = self
            .command(request)
            .status()
            .await
            .with_context(|| format!("spawn player {}", self.program))?;
        if !status.success() {
            bail!("player exited with {status}");
        }
        Ok(())
    }
}
