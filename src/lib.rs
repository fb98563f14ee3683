//! Trace-driven bandwidth emulation for streaming experiments.
//!
//! A controller replays recorded throughput traces onto the host-side veth
//! of each player container through `tc`, while per-container schedulers
//! start streaming sessions at random intervals. The processes coordinate
//! only through flag files: `run` (experiment in progress), `ready`
//! (controller finished setup) and `active_<unit>` (a session is playing).

// Use mimalloc as the global allocator for tests (non-Windows only)
#[cfg(not(windows))]
#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod controller;
pub mod flags;
pub mod launcher;
pub mod mode;
pub mod resolver;
pub mod session;
pub mod shaper;
pub mod trace;
pub mod utils;

// Test helpers module - available when test-internals feature is enabled
#[cfg(any(test, feature = "test-internals"))]
pub mod test_helpers;

#[cfg(test)]
pub mod tests;

pub use config::{ControllerConfig, LaunchConfig, RateSource, SchedulerConfig};
pub use controller::{BandwidthController, ControllerState};
pub use flags::{ControlChannel, ControlDir, FileFlag, Flag};
pub use mode::ReplayPolicy;
pub use resolver::{DockerResolver, InterfaceResolver, NetnsResolver};
pub use session::{CommandRunner, SessionRunner, SessionScheduler};
pub use shaper::{Shaper, ShapingProfile, TcShaper};
pub use trace::{Trace, TraceSample, load_trace};
