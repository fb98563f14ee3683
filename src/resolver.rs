//! Map a unit (one container) to the host-side veth carrying its traffic.
//!
//! The binding goes through kernel bookkeeping, not naming conventions: the
//! container's `eth0` reports its peer's ifindex in `iflink`, and that index
//! is looked up in the host's `ip -o link` listing.

use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// A container (or bare namespace) belonging to a unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerRef {
    pub id: String,
    /// Human-readable name for logs.
    pub name: String,
}

/// Discovery of units' containers and their host-side interfaces.
pub trait InterfaceResolver {
    /// Containers belonging to `unit`. Empty if none are running.
    fn containers(&self, unit: u32) -> Result<Vec<ContainerRef>>;

    /// Host-side interface carrying `container`'s egress, if it can be found.
    fn resolve(&self, container: &ContainerRef) -> Option<String>;
}

/// Find the interface whose index is `ifindex` in `ip -o link` output.
///
/// Lines look like `17: veth3a1b2c@if16: <BROADCAST,...> mtu 1500 ...`;
/// the `@peer` suffix and trailing colon are stripped.
pub fn find_link_name(ip_link_output: &str, ifindex: u32) -> Option<String> {
    ip_link_output.lines().find_map(|line| {
        let (index, rest) = line.split_once(':')?;
        if index.trim().parse::<u32>().ok()? != ifindex {
            return None;
        }
        let name = rest.split_whitespace().next()?;
        let name = name.split('@').next()?.trim_end_matches(':');
        (!name.is_empty()).then(|| name.to_string())
    })
}

/// Parse the integer contents of an `iflink` file.
pub fn parse_iflink(raw: &str) -> Option<u32> {
    raw.trim().parse().ok()
}

/// Container ids from `docker ps -q` output, one per non-blank line.
pub fn parse_container_ids(ps_output: &str) -> Vec<&str> {
    ps_output
        .lines()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .collect()
}

/// `docker inspect -f {{.Name}}` reports `/name`; fall back to the id when
/// the name is unavailable.
pub fn container_ref(id: &str, inspected_name: Option<&str>) -> ContainerRef {
    let name = inspected_name
        .map(|n| n.trim().trim_start_matches('/'))
        .filter(|n| !n.is_empty())
        .unwrap_or(id);
    ContainerRef {
        id: id.to_string(),
        name: name.to_string(),
    }
}

/// Resolves units started as docker compose projects `<prefix><unit>`.
#[derive(Clone, Debug)]
pub struct DockerResolver {
    project_prefix: String,
    container_iface: String,
}

impl DockerResolver {
    pub fn new(project_prefix: impl Into<String>, container_iface: impl Into<String>) -> Self {
        Self {
            project_prefix: project_prefix.into(),
            container_iface: container_iface.into(),
        }
    }

    fn inspect(&self, id: &str, format: &str) -> Option<String> {
        let out = run_ok("docker", &["inspect", "-f", format, id])?;
        Some(out.trim().to_string())
    }
}

impl InterfaceResolver for DockerResolver {
    fn containers(&self, unit: u32) -> Result<Vec<ContainerRef>> {
        let filter = format!(
            "label=com.docker.compose.project={}{unit}",
            self.project_prefix
        );
        let output = capture("docker", &["ps", "-q", "--filter", &filter])?;
        checked(&output, "docker ps")?;

        Ok(parse_container_ids(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .map(|id| container_ref(id, self.inspect(id, "{{.Name}}").as_deref()))
            .collect())
    }

    fn resolve(&self, container: &ContainerRef) -> Option<String> {
        let pid = self.inspect(&container.id, "{{.State.Pid}}")?;
        if pid.is_empty() || pid == "0" {
            debug!(container = container.name, "container has no running pid");
            return None;
        }

        let iflink_path = format!("/sys/class/net/{}/iflink", self.container_iface);
        let iflink = parse_iflink(&run_ok("docker", &["exec", &container.id, "cat", &iflink_path])?)?;

        let links = run_ok("ip", &["-o", "link"])?;
        let veth = find_link_name(&links, iflink);
        debug!(container = container.name, pid, iflink, ?veth, "resolved container link");
        veth
    }
}

/// Resolves units living in named network namespaces `<prefix><unit>`.
///
/// For hosts without a container runtime, and for the privileged tests.
#[derive(Clone, Debug)]
pub struct NetnsResolver {
    ns_prefix: String,
    inner_iface: String,
    sudo: bool,
}

impl NetnsResolver {
    pub fn new(ns_prefix: impl Into<String>, inner_iface: impl Into<String>, sudo: bool) -> Self {
        Self {
            ns_prefix: ns_prefix.into(),
            inner_iface: inner_iface.into(),
            sudo,
        }
    }

    fn ip(&self, args: &[&str]) -> Option<String> {
        if self.sudo {
            let mut full = vec!["ip"];
            full.extend_from_slice(args);
            run_ok("sudo", &full)
        } else {
            run_ok("ip", args)
        }
    }
}

impl InterfaceResolver for NetnsResolver {
    fn containers(&self, unit: u32) -> Result<Vec<ContainerRef>> {
        let name = format!("{}{unit}", self.ns_prefix);
        let Some(listing) = self.ip(&["netns", "list"]) else {
            bail!("ip netns list failed");
        };
        let exists = listing
            .lines()
            .any(|l| l.split_whitespace().next() == Some(name.as_str()));

        Ok(if exists {
            vec![ContainerRef {
                id: name.clone(),
                name,
            }]
        } else {
            Vec::new()
        })
    }

    fn resolve(&self, container: &ContainerRef) -> Option<String> {
        let iflink_path = format!("/sys/class/net/{}/iflink", self.inner_iface);
        let raw = self.ip(&["netns", "exec", &container.id, "cat", &iflink_path])?;
        let iflink = parse_iflink(&raw)?;
        find_link_name(&self.ip(&["-o", "link"])?, iflink)
    }
}

fn capture(program: &str, args: &[&str]) -> Result<Output> {
    Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("spawn {program} {}", args.join(" ")))
}

fn checked(output: &Output, what: &str) -> Result<()> {
    if !output.status.success() {
        bail!("{what} failed: {}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(())
}

/// Stdout of a command that exited successfully, `None` otherwise.
fn run_ok(program: &str, args: &[&str]) -> Option<String> {
    let output = capture(program, args).ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
}
