//! Privileged network plumbing for trace-driven shaping.
//!
//! Wraps Linux `tc` and `ip netns` so the controller can install token
//! bucket disciplines on host-side veth interfaces, and so tests can build
//! container-like namespaces without a container runtime.
//!
//! # Modules
//!
//! - [`impairment`]: TBF (+ optional netem) construction and application
//! - [`topology`]: Namespace and veth management (RAII cleanup on drop)
//! - [`deps`]: Tool and privilege probes
//! - [`test_util`]: Privilege checks and unique name generation for tests

pub mod deps;
pub mod impairment;
pub mod test_util;
pub mod topology;

pub use deps::{SkipReason, check_netem_deps, check_shaping_deps};
pub use impairment::{
    QdiscInfo, ShapingConfig, Tc, apply_shaping, clear_shaping, parse_qdiscs, show_qdiscs,
};
pub use test_util::{check_privileges, unique_ns_name};
pub use topology::Namespace;
