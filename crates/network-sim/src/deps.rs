//! Host capability probes for privileged tests and startup checks.

use std::path::PathBuf;
use std::process::Command;

/// Check if a binary exists in PATH.
pub fn check_binary(name: &str) -> Option<PathBuf> {
    Command::new("sh")
        .args(["-c", &format!("command -v {name}")])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| PathBuf::from(String::from_utf8_lossy(&o.stdout).trim().to_string()))
}

/// Reason why shaping cannot run on this host.
#[derive(Debug, PartialEq, Eq)]
pub enum SkipReason {
    NotRoot,
    MissingTool(String),
    NoNetem,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotRoot => write!(f, "requires root / passwordless sudo"),
            SkipReason::MissingTool(t) => write!(f, "system tool '{t}' not found"),
            SkipReason::NoNetem => write!(
                f,
                "sch_netem kernel module not available (try: sudo modprobe sch_netem)"
            ),
        }
    }
}

/// Tools needed to resolve interfaces and install TBF disciplines.
pub fn check_shaping_deps() -> Result<(), SkipReason> {
    for tool in ["ip", "tc"] {
        if check_binary(tool).is_none() {
            return Err(SkipReason::MissingTool(tool.to_string()));
        }
    }

    if !crate::test_util::check_privileges() {
        return Err(SkipReason::NotRoot);
    }

    Ok(())
}

/// Shaping deps plus netem, for configurations with delay/loss.
pub fn check_netem_deps() -> Result<(), SkipReason> {
    check_shaping_deps()?;

    let modprobe_ok = Command::new("sudo")
        .args(["modprobe", "sch_netem"])
        .output()
        .is_ok_and(|o| o.status.success());
    if !modprobe_ok {
        return Err(SkipReason::NoNetem);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_reason_messages() {
        assert_eq!(
            SkipReason::MissingTool("tc".into()).to_string(),
            "system tool 'tc' not found"
        );
        assert!(SkipReason::NotRoot.to_string().contains("sudo"));
    }

    #[test]
    fn shell_builtin_lookup() {
        assert!(check_binary("sh").is_some());
        assert!(check_binary("definitely-not-a-real-binary-xyz").is_none());
    }
}
