//! Shared utilities for privileged integration tests.
#![allow(dead_code)]

use network_sim::{Namespace, check_netem_deps, check_shaping_deps, unique_ns_name};

/// Returns `true` if tests should be skipped (prints the reason to stderr).
/// Use at the top of every test.
pub fn skip_without_deps() -> bool {
    match check_shaping_deps() {
        Ok(()) => false,
        Err(reason) => {
            eprintln!("Skipping: {reason}");
            true
        }
    }
}

/// Like `skip_without_deps` but also requires netem.
pub fn skip_without_netem_deps() -> bool {
    match check_netem_deps() {
        Ok(()) => false,
        Err(reason) => {
            eprintln!("Skipping: {reason}");
            true
        }
    }
}

/// A namespace standing in for unit `unit`'s container, attached to the
/// host through a veth whose host end is returned.
pub struct FakeUnit {
    pub ns: Namespace,
    pub host_iface: String,
}

/// Create units `0..count` as namespaces `<prefix><unit>`, each with an
/// `eth0` peered to a fresh host-side veth.
pub fn attach_units(prefix: &str, count: u32) -> anyhow::Result<Vec<FakeUnit>> {
    (0..count)
        .map(|unit| {
            let ns = Namespace::new(&format!("{prefix}{unit}"))?;
            let host_iface = unique_ns_name("snh");
            ns.add_host_veth(&host_iface, "eth0", &format!("10.201.{unit}.2/24"))?;
            Ok(FakeUnit { ns, host_iface })
        })
        .collect()
}
