use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::topology::Namespace;

/// Token-bucket shaping, optionally with a netem child for delay/loss.
///
/// The TBF root enforces `rate_kbit` with a fixed burst allowance and a
/// bounded queueing latency. A netem child is chained under it only when
/// `delay_ms` or `loss_percent` is non-zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapingConfig {
    pub rate_kbit: u64,
    pub burst_kbit: u32,
    pub latency_ms: u32,
    pub delay_ms: u32,
    pub loss_percent: f32,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            rate_kbit: 0,
            burst_kbit: 32,
            latency_ms: 400,
            delay_ms: 0,
            loss_percent: 0.0,
        }
    }
}

impl ShapingConfig {
    /// True if a netem child qdisc is needed.
    pub fn has_netem_params(&self) -> bool {
        self.delay_ms > 0 || self.loss_percent > 0.0
    }

    /// `tc` arguments installing the TBF root on `iface`.
    pub fn tbf_args(&self, iface: &str) -> Vec<String> {
        [
            "qdisc", "add", "dev", iface, "root", "handle", "1:", "tbf", "rate",
        ]
        .into_iter()
        .map(String::from)
        .chain([
            format!("{}kbit", self.rate_kbit),
            "burst".into(),
            format!("{}kbit", self.burst_kbit),
            "latency".into(),
            format!("{}ms", self.latency_ms),
        ])
        .collect()
    }

    /// `tc` arguments chaining netem under the TBF root, if any are needed.
    pub fn netem_args(&self, iface: &str) -> Option<Vec<String>> {
        if !self.has_netem_params() {
            return None;
        }

        let mut args: Vec<String> = [
            "qdisc", "add", "dev", iface, "parent", "1:1", "handle", "10:", "netem",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        if self.delay_ms > 0 {
            args.extend(["delay".into(), format!("{}ms", self.delay_ms)]);
        }
        if self.loss_percent > 0.0 {
            args.extend(["loss".into(), format!("{}%", self.loss_percent)]);
        }
        Some(args)
    }
}

/// Where `tc` runs: the host namespace or a named netns, with or without sudo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tc {
    netns: Option<String>,
    sudo: bool,
}

impl Tc {
    pub fn host(sudo: bool) -> Self {
        Self { netns: None, sudo }
    }

    /// `tc` inside `ns` (always via sudo, like every other namespace command).
    pub fn in_namespace(ns: &Namespace) -> Self {
        Self {
            netns: Some(ns.name.clone()),
            sudo: true,
        }
    }

    /// Full argv for `tc <args>` under this target, program first.
    pub fn argv<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 6);
        if self.sudo {
            argv.push("sudo".to_string());
        }
        if let Some(ns) = &self.netns {
            argv.extend(["ip", "netns", "exec", ns].map(String::from));
        }
        argv.push("tc".to_string());
        argv.extend(args.iter().map(|a| a.as_ref().to_string()));
        argv
    }

    /// Run `tc <args>`, returning raw output.
    pub fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<Output> {
        let argv = self.argv(args);
        debug!(cmd = argv.join(" "), "tc");
        Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .with_context(|| format!("spawn {}", argv.join(" ")))
    }

    /// Run `tc <args>`, bailing with stderr and the full command on failure.
    pub fn run_checked<S: AsRef<str>>(&self, args: &[S], ctx: &str) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            bail!(
                "{ctx}: {}\n{}",
                self.argv(args).join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output)
    }
}

/// Replace whatever root qdisc `iface` has with the discipline in `config`.
///
/// The delete is best-effort: a missing root qdisc is not an error. Two
/// calls in a row leave exactly one TBF root (plus its netem child, if any).
pub fn apply_shaping(tc: &Tc, iface: &str, config: &ShapingConfig) -> Result<()> {
    if config.rate_kbit == 0 {
        bail!("refusing to shape {iface} to 0 kbit");
    }

    let _ = tc.run(&["qdisc", "del", "dev", iface, "root"]);

    tc.run_checked(&config.tbf_args(iface), "apply TBF qdisc")?;

    if let Some(args) = config.netem_args(iface) {
        tc.run_checked(&args, "apply netem child qdisc")?;
    }

    Ok(())
}

/// Remove the root qdisc from `iface`, restoring the kernel default.
pub fn clear_shaping(tc: &Tc, iface: &str) -> Result<()> {
    let output = tc.run(&["qdisc", "del", "dev", iface, "root"])?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    // Nothing installed: already in the desired state.
    if stderr.contains("handle of zero") || stderr.contains("No such file or directory") {
        return Ok(());
    }
    bail!("clear qdisc on {iface}: {}", stderr.trim());
}

/// One line of `tc qdisc show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QdiscInfo {
    pub kind: String,
    pub handle: String,
    /// `None` for the root qdisc.
    pub parent: Option<String>,
}

impl QdiscInfo {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Parse `tc qdisc show dev <iface>` output.
pub fn parse_qdiscs(output: &str) -> Vec<QdiscInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            if fields.next()? != "qdisc" {
                return None;
            }
            let kind = fields.next()?.to_string();
            let handle = fields.next()?.to_string();
            let parent = match fields.next()? {
                "root" => None,
                "parent" => Some(fields.next()?.to_string()),
                _ => return None,
            };
            Some(QdiscInfo {
                kind,
                handle,
                parent,
            })
        })
        .collect()
}

/// Current qdiscs on `iface`.
pub fn show_qdiscs(tc: &Tc, iface: &str) -> Result<Vec<QdiscInfo>> {
    let output = tc.run_checked(&["qdisc", "show", "dev", iface], "show qdiscs")?;
    Ok(parse_qdiscs(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{check_privileges, unique_ns_name};

    fn config(rate: u64) -> ShapingConfig {
        ShapingConfig {
            rate_kbit: rate,
            ..Default::default()
        }
    }

    #[test]
    fn tbf_args_use_fixed_burst_and_latency() {
        assert_eq!(
            config(1500).tbf_args("veth1").join(" "),
            "qdisc add dev veth1 root handle 1: tbf rate 1500kbit burst 32kbit latency 400ms"
        );
    }

    #[test]
    fn netem_only_when_needed() {
        assert!(config(1000).netem_args("veth1").is_none());

        let cfg = ShapingConfig {
            delay_ms: 40,
            loss_percent: 0.5,
            ..config(1000)
        };
        assert_eq!(
            cfg.netem_args("veth1").unwrap().join(" "),
            "qdisc add dev veth1 parent 1:1 handle 10: netem delay 40ms loss 0.5%"
        );

        let loss_only = ShapingConfig {
            loss_percent: 2.0,
            ..config(1000)
        };
        let args = loss_only.netem_args("veth1").unwrap();
        assert!(!args.contains(&"delay".to_string()));
        assert!(args.ends_with(&["loss".to_string(), "2%".to_string()]));
    }

    #[test]
    fn argv_targets() {
        assert_eq!(
            Tc::host(true).argv(&["qdisc", "show"]),
            ["sudo", "tc", "qdisc", "show"]
        );
        assert_eq!(Tc::host(false).argv(&["qdisc"]), ["tc", "qdisc"]);

        let tc = Tc {
            netns: Some("ns0".into()),
            sudo: true,
        };
        assert_eq!(
            tc.argv(&["qdisc"]),
            ["sudo", "ip", "netns", "exec", "ns0", "tc", "qdisc"]
        );
    }

    #[test]
    fn parse_qdisc_show_output() {
        let out = "qdisc tbf 1: root refcnt 2 rate 800Kbit burst 4Kb lat 400ms\n\
                   qdisc netem 10: parent 1:1 limit 1000 delay 40ms\n";
        let qdiscs = parse_qdiscs(out);
        assert_eq!(qdiscs.len(), 2);
        assert!(qdiscs[0].is_root());
        assert_eq!(qdiscs[0].kind, "tbf");
        assert_eq!(qdiscs[1].parent.as_deref(), Some("1:1"));
        assert!(parse_qdiscs("garbage\n\n").is_empty());
    }

    #[test]
    fn zero_rate_rejected_before_running_tc() {
        // The rate check comes first, so no tc binary is needed here.
        let err = apply_shaping(&Tc::host(false), "nonexistent0", &config(0)).unwrap_err();
        assert!(err.to_string().contains("0 kbit"));
    }

    #[test]
    fn test_apply_twice_leaves_one_root() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let ns1 = Namespace::new(&unique_ns_name("nsi_a")).expect("create ns1");
        let ns2 = Namespace::new(&unique_ns_name("nsi_b")).expect("create ns2");
        ns1.add_veth_link(&ns2, "veth_a", "veth_b", "10.201.1.1/24", "10.201.1.2/24")
            .expect("add veth link");

        let tc = Tc::in_namespace(&ns1);
        apply_shaping(&tc, "veth_a", &config(2000)).expect("first apply");
        apply_shaping(&tc, "veth_a", &config(500)).expect("second apply");

        let qdiscs = show_qdiscs(&tc, "veth_a").expect("show qdiscs");
        let roots: Vec<_> = qdiscs.iter().filter(|q| q.is_root()).collect();
        assert_eq!(roots.len(), 1, "qdiscs: {qdiscs:?}");
        assert_eq!(roots[0].kind, "tbf");

        clear_shaping(&tc, "veth_a").expect("clear");
        clear_shaping(&tc, "veth_a").expect("clear is idempotent");
    }
}
