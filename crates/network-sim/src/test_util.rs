use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Returns `true` if namespace and `tc` operations can run here
/// (`ip` present and passwordless `sudo` works).
pub fn check_privileges() -> bool {
    let has_ip = Command::new("ip")
        .arg("netns")
        .output()
        .is_ok_and(|o| o.status.success());

    has_ip
        && Command::new("sudo")
            .args(["-n", "ip", "netns", "list"])
            .output()
            .is_ok_and(|o| o.status.success())
}

/// Unique namespace/interface name, safe for parallel tests.
///
/// Prefix + PID + counter, truncated to 15 chars (netdev name limit).
pub fn unique_ns_name(prefix: &str) -> String {
    let seq = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() % 0xffff;
    let mut name = format!("{prefix}_{pid:x}_{seq}");
    name.truncate(15);
    name
}
