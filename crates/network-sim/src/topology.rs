use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// A Linux network namespace standing in for a container.
///
/// Created on construction with loopback up, deleted on drop (which also
/// removes any veth pair with an end inside it). Commands run through
/// `sudo ip netns exec`.
pub struct Namespace {
    pub name: String,
}

impl Namespace {
    pub fn new(name: &str) -> Result<Self> {
        // Stale namespace from an aborted run
        let _ = sudo(&["ip", "netns", "del", name]);

        sudo_checked(&["ip", "netns", "add", name])
            .with_context(|| format!("create netns '{name}'"))?;
        debug!(ns = name, "created network namespace");

        let _ = sudo(&["ip", "netns", "exec", name, "ip", "link", "set", "lo", "up"]);

        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Run a command inside this namespace, returning raw output.
    pub fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let mut full_args = vec!["ip", "netns", "exec", &self.name, cmd];
        full_args.extend_from_slice(args);
        sudo(&full_args).with_context(|| format!("exec '{cmd}' in ns '{}'", self.name))
    }

    /// Run a command inside this namespace, failing if it exits non-zero.
    pub fn exec_checked(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let mut full_args = vec!["ip", "netns", "exec", &self.name, cmd];
        full_args.extend_from_slice(args);
        sudo_checked(&full_args).with_context(|| format!("exec '{cmd}' in ns '{}'", self.name))
    }

    /// Peer link index (`iflink`) of `iface` as seen from inside this namespace.
    ///
    /// For a veth end this is the host-side ifindex of its partner.
    pub fn iflink(&self, iface: &str) -> Result<u32> {
        let path = format!("/sys/class/net/{iface}/iflink");
        let out = self.exec_checked("cat", &[&path])?;
        let text = String::from_utf8_lossy(&out.stdout);
        text.trim()
            .parse()
            .with_context(|| format!("parse iflink '{}'", text.trim()))
    }

    /// Create a veth pair between two namespaces, both ends addressed and up.
    ///
    /// Interface names must be <= 15 chars (Linux limit).
    pub fn add_veth_link(
        &self,
        peer: &Namespace,
        local_iface: &str,
        peer_iface: &str,
        local_ip: &str,
        peer_ip: &str,
    ) -> Result<()> {
        let _ = sudo(&["ip", "link", "del", local_iface]);

        create_veth_pair(local_iface, peer_iface)?;

        sudo_checked(&["ip", "link", "set", local_iface, "netns", &self.name])
            .context("move local veth")?;
        sudo_checked(&["ip", "link", "set", peer_iface, "netns", &peer.name])
            .context("move peer veth")?;

        self.configure(local_iface, local_iface, local_ip)?;
        peer.configure(peer_iface, peer_iface, peer_ip)?;

        debug!(
            ns_local = self.name,
            ns_peer = peer.name,
            local_ip,
            peer_ip,
            "veth link configured"
        );
        Ok(())
    }

    /// Attach this namespace to the host the way a container runtime does.
    ///
    /// Creates `host_iface` in the host namespace and moves its peer in
    /// here, renamed to `inner_iface` (e.g. `eth0`). The host end is brought
    /// up without an address; it only exists to be shaped.
    pub fn add_host_veth(&self, host_iface: &str, inner_iface: &str, inner_ip: &str) -> Result<()> {
        let _ = sudo(&["ip", "link", "del", host_iface]);

        // Temporary peer name; the real one may clash with a host interface.
        let temp_peer = format!("{}p", &host_iface[..host_iface.len().min(14)]);
        create_veth_pair(host_iface, &temp_peer)?;

        sudo_checked(&["ip", "link", "set", &temp_peer, "netns", &self.name])
            .context("move container veth")?;
        self.configure(&temp_peer, inner_iface, inner_ip)?;
        sudo_checked(&["ip", "link", "set", host_iface, "up"]).context("bring host veth up")?;

        debug!(ns = self.name, host_iface, inner_iface, "host veth attached");
        Ok(())
    }

    fn configure(&self, current: &str, name: &str, ip: &str) -> Result<()> {
        if current != name {
            self.exec_checked("ip", &["link", "set", current, "name", name])
                .with_context(|| format!("rename {current} to {name}"))?;
        }
        self.exec_checked("ip", &["addr", "add", ip, "dev", name])
            .with_context(|| format!("set IP on {name}"))?;
        self.exec_checked("ip", &["link", "set", name, "up"])
            .with_context(|| format!("bring {name} up"))?;
        Ok(())
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        debug!(ns = self.name, "deleting network namespace");
        let _ = sudo(&["ip", "netns", "del", &self.name]);
    }
}

fn create_veth_pair(a: &str, b: &str) -> Result<()> {
    sudo_checked(&["ip", "link", "add", a, "type", "veth", "peer", "name", b])
        .with_context(|| format!("create veth pair {a}/{b}"))?;
    debug!(a, b, "created veth pair");
    Ok(())
}

/// Run `sudo <args>`, returning raw output.
fn sudo(args: &[&str]) -> Result<Output> {
    Command::new("sudo")
        .args(args)
        .output()
        .with_context(|| format!("sudo {}", args.join(" ")))
}

/// Run `sudo <args>`, returning output on success or bailing with stderr.
fn sudo_checked(args: &[&str]) -> Result<Output> {
    let output = sudo(args)?;
    if !output.status.success() {
        bail!(
            "command failed: sudo {}\n{}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{check_privileges, unique_ns_name};

    #[test]
    fn test_host_veth_iflink_matches_host_index() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let ns = Namespace::new(&unique_ns_name("nst_h")).expect("create ns");
        let host_iface = unique_ns_name("vh");
        ns.add_host_veth(&host_iface, "eth0", "10.200.2.2/24")
            .expect("attach host veth");

        let iflink = ns.iflink("eth0").expect("read iflink");
        let index = std::fs::read_to_string(format!("/sys/class/net/{host_iface}/ifindex"))
            .expect("host ifindex");
        assert_eq!(iflink.to_string(), index.trim());
    }

    #[test]
    fn test_veth_ping() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let ns1 = Namespace::new(&unique_ns_name("nst_a")).expect("create ns1");
        let ns2 = Namespace::new(&unique_ns_name("nst_b")).expect("create ns2");

        let id = std::process::id() % 100_000;
        let v_a = format!("va_{id}");
        let v_b = format!("vb_{id}");

        ns1.add_veth_link(&ns2, &v_a, &v_b, "10.200.1.1/24", "10.200.1.2/24")
            .expect("add veth link");

        let out = ns1
            .exec("ping", &["-c", "1", "-W", "1", "10.200.1.2"])
            .expect("ping");
        assert!(
            out.status.success(),
            "ping failed:\n{}",
            String::from_utf8_lossy(&out.stderr)
        );
    }
}
