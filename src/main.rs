use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use stream_netem::config::{
    DEFAULT_CONTAINER_IFACE, DEFAULT_POLL_INTERVAL_MS, DEFAULT_PROJECT_PREFIX, DEFAULT_RATE_COLUMN,
    DEFAULT_RUN_WAIT_SECS, DEFAULT_TICK_MS, DEFAULT_TIMESTAMP_COLUMN, SESSION_LOG_FILE,
};
use stream_netem::utils::shutdown_signal;
use stream_netem::{
    BandwidthController, CommandRunner, ControlDir, ControllerConfig, DockerResolver,
    InterfaceResolver, LaunchConfig, NetnsResolver, RateSource, ReplayPolicy, SchedulerConfig,
    SessionScheduler, ShapingProfile, TcShaper,
};
use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for the binary (non-Windows only)
#[cfg(not(windows))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "stream_netem",
    author,
    version,
    disable_version_flag = true,
    about = "Trace-driven bandwidth emulation for streaming experiments"
)]
struct Cli {
    /// Print the version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::SetTrue)]
    print_version: bool,

    #[command(flatten)]
    control: ControlArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Where the coordination flags live
#[derive(Args, Debug)]
struct ControlArgs {
    /// Directory holding ready.flag and active_<unit>.flag
    #[arg(long = "control-dir", env = "CONTROL_DIR", default_value = "./control", global = true)]
    control_dir: PathBuf,
    /// Run flag location (default: <control-dir>/run.flag)
    #[arg(long = "run-flag", env = "CONTROL_FILE", global = true)]
    run_flag: Option<PathBuf>,
    /// Flag poll interval in ms
    #[arg(long = "poll-interval-ms", env = "POLL_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS, global = true)]
    poll_interval_ms: u64,
}

impl ControlArgs {
    fn control_dir(&self) -> ControlDir {
        ControlDir::new(&self.control_dir).with_run_flag(self.run_flag.clone())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Shape every unit's veth from traces (or a fixed rate) while the
    /// experiment runs
    Control(ControlCmd),
    /// Start streaming sessions for one unit at random intervals
    Session(SessionCmd),
    /// Allocate an experiment log dir and hold the run flag for a duration
    Launch(LaunchCmd),
}

#[derive(Args, Debug)]
struct ControlCmd {
    /// Number of units (containers), numbered from 0
    #[arg(long = "count", env = "N_CONTAINERS")]
    count: u32,
    /// Trace CSV, repeatable; assigned to units round-robin
    #[arg(long = "trace", required_unless_present = "bandwidth", conflicts_with = "bandwidth")]
    traces: Vec<PathBuf>,
    /// Fixed rate in kbit/s for every unit instead of traces
    #[arg(long = "bandwidth")]
    bandwidth: Option<u64>,
    /// Replay tick in ms
    #[arg(long = "tick-ms", default_value_t = DEFAULT_TICK_MS)]
    tick_ms: u64,
    /// Stop if the run flag is not raised within this many seconds
    #[arg(long = "run-wait-secs", default_value_t = DEFAULT_RUN_WAIT_SECS)]
    run_wait_secs: u64,
    /// Token bucket burst in kbit
    #[arg(long = "burst")]
    burst_kbit: Option<u32>,
    /// Token bucket latency in ms
    #[arg(long = "latency-ms")]
    latency_ms: Option<u32>,
    /// Extra one-way delay in ms (adds a netem child)
    #[arg(long = "delay-ms", default_value_t = 0)]
    delay_ms: u32,
    /// Random loss in percent (adds a netem child)
    #[arg(long = "loss-percent", default_value_t = 0.0)]
    loss_percent: f32,
    /// What to do when several samples are overdue: step, skip-ahead
    #[arg(long = "replay-policy", value_enum, default_value = "step")]
    replay_policy: ReplayPolicy,
    /// Compose project name prefix; unit n is project <prefix><n>
    #[arg(long = "project-prefix", default_value = DEFAULT_PROJECT_PREFIX)]
    project_prefix: String,
    /// Interface inside each container whose peer is shaped
    #[arg(long = "container-iface", default_value = DEFAULT_CONTAINER_IFACE)]
    container_iface: String,
    /// Resolve units as network namespaces <prefix><n> instead of containers
    #[arg(long = "netns-prefix")]
    netns_prefix: Option<String>,
    #[arg(long = "timestamp-column", default_value = DEFAULT_TIMESTAMP_COLUMN)]
    timestamp_column: String,
    #[arg(long = "rate-column", default_value = DEFAULT_RATE_COLUMN)]
    rate_column: String,
    /// Run tc/ip directly instead of through sudo
    #[arg(long = "no-sudo")]
    no_sudo: bool,
}

#[derive(Args, Debug)]
struct SessionCmd {
    /// This container's unit id
    #[arg(long = "id", env = "ID")]
    id: u32,
    /// Rate of the exponential delay between sessions, in 1/s
    #[arg(long = "lambda", env = "LAMDA")]
    lambda: f64,
    /// Node id recorded once in the session log
    #[arg(long = "node-id", env = "NODE_ID")]
    node_id: Option<u64>,
    /// Directory for session_log.json
    #[arg(long = "log-dir", env = "LOG_DIR", default_value = "./logs")]
    log_dir: PathBuf,
    /// Lower bound of a per-session random bandwidth in kbit/s
    #[arg(long = "bandwidth-min", requires = "bandwidth_max")]
    bandwidth_min: Option<u64>,
    /// Upper bound of a per-session random bandwidth in kbit/s
    #[arg(long = "bandwidth-max", requires = "bandwidth_min")]
    bandwidth_max: Option<u64>,
    /// Content URL to pick from per session, repeatable
    #[arg(long = "content")]
    contents: Vec<String>,
    /// Experiment seed mixed into the unit's RNG seed
    #[arg(long = "seed")]
    seed: Option<u64>,
    /// Player command run once per session
    #[arg(last = true, required = true)]
    player: Vec<String>,
}

#[derive(Args, Debug)]
struct LaunchCmd {
    /// Base directory for experiment_<n> dirs
    #[arg(long = "logs-dir", default_value = "./logs")]
    logs_dir: PathBuf,
    /// Experiment length in seconds (default: until interrupted)
    #[arg(long = "duration", env = "DURATION")]
    duration: Option<u64>,
    /// Pre-create a log dir per unit
    #[arg(long = "units", env = "N_CONTAINERS", default_value_t = 0)]
    units: u32,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Cli::parse();
    if args.print_version {
        let version = env!("CARGO_PKG_VERSION");
        let git_hash = env!("GIT_HASH");
        let git_branch = env!("GIT_BRANCH");
        let git_dirty = env!("GIT_DIRTY");

        println!(
            "{} ({}@{}{}) [{}]",
            version,
            git_branch,
            git_hash,
            git_dirty,
            env!("CARGO_PKG_NAME")
        );
        return Ok(());
    }

    let Some(command) = args.command else {
        anyhow::bail!("a subcommand is required (control, session or launch); see --help");
    };
    let poll = Duration::from_millis(args.control.poll_interval_ms);
    let control = args.control.control_dir();

    match command {
        Command::Control(cmd) => run_control(cmd, control).await.context("controller failed"),
        Command::Session(cmd) => run_session(cmd, control, poll).await.context("scheduler failed"),
        Command::Launch(cmd) => {
            let config = LaunchConfig {
                logs_dir: cmd.logs_dir,
                duration: cmd.duration.map(Duration::from_secs),
                units: cmd.units,
            };
            let dir = stream_netem::launcher::run_experiment(&config, &control, shutdown_signal())
                .await
                .context("launch failed")?;
            println!("{}", dir.display());
            Ok(())
        }
    }
}

async fn run_control(cmd: ControlCmd, control: ControlDir) -> Result<()> {
    let source = match cmd.bandwidth {
        Some(rate) => RateSource::Static(rate),
        None => RateSource::Traces(cmd.traces),
    };
    let defaults = ShapingProfile::default();
    let mut config = ControllerConfig::new(cmd.count, source);
    config.tick = Duration::from_millis(cmd.tick_ms);
    config.run_wait = Duration::from_secs(cmd.run_wait_secs);
    config.replay_policy = cmd.replay_policy;
    config.timestamp_column = cmd.timestamp_column;
    config.rate_column = cmd.rate_column;
    config.profile = ShapingProfile {
        burst_kbit: cmd.burst_kbit.unwrap_or(defaults.burst_kbit),
        latency_ms: cmd.latency_ms.unwrap_or(defaults.latency_ms),
        delay_ms: cmd.delay_ms,
        loss_percent: cmd.loss_percent,
    };
    config.validate()?;

    let sudo = !cmd.no_sudo;
    match cmd.netns_prefix {
        Some(prefix) => {
            let resolver = NetnsResolver::new(prefix, cmd.container_iface, sudo);
            control_loop(config, control, sudo, &resolver).await
        }
        None => {
            let resolver = DockerResolver::new(cmd.project_prefix, cmd.container_iface);
            control_loop(config, control, sudo, &resolver).await
        }
    }
}

async fn control_loop<R: InterfaceResolver>(
    config: ControllerConfig,
    control: ControlDir,
    sudo: bool,
    resolver: &R,
) -> Result<()> {
    info!(
        "controller: {} units, control dir {}",
        config.count,
        control.root().display()
    );
    let mut controller = BandwidthController::new(config, TcShaper::new(sudo), control);
    controller.run(resolver, shutdown_signal()).await
}

async fn run_session(cmd: SessionCmd, control: ControlDir, poll: Duration) -> Result<()> {
    let mut config = SchedulerConfig::new(cmd.id, cmd.lambda, cmd.log_dir.join(SESSION_LOG_FILE));
    config.node_id = cmd.node_id;
    config.poll_interval = poll;
    config.bandwidth_range = cmd.bandwidth_min.zip(cmd.bandwidth_max);
    config.contents = cmd.contents;
    config.experiment_seed = cmd.seed;

    let runner = CommandRunner::new(cmd.player)?;
    let mut scheduler = SessionScheduler::new(config, runner, &control)?;

    let result = tokio::select! {
        result = scheduler.run() => result.map(|n| info!("{n} sessions run")),
        _ = shutdown_signal() => {
            info!("termination requested");
            Ok(())
        }
    };
    // An interrupted session must not leave the unit marked active.
    scheduler.deactivate();
    result
}
