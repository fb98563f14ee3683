//! Installing rate limits on interfaces.

use anyhow::Result;
use network_sim::{ShapingConfig, Tc, apply_shaping, clear_shaping};
use tracing::debug;

/// Everything about a discipline except the rate, which changes per sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShapingProfile {
    pub burst_kbit: u32,
    pub latency_ms: u32,
    pub delay_ms: u32,
    pub loss_percent: f32,
}

impl Default for ShapingProfile {
    fn default() -> Self {
        let defaults = ShapingConfig::default();
        Self {
            burst_kbit: defaults.burst_kbit,
            latency_ms: defaults.latency_ms,
            delay_ms: defaults.delay_ms,
            loss_percent: defaults.loss_percent,
        }
    }
}

impl ShapingProfile {
    pub fn at_rate(&self, rate_kbit: u64) -> ShapingConfig {
        ShapingConfig {
            rate_kbit,
            burst_kbit: self.burst_kbit,
            latency_ms: self.latency_ms,
            delay_ms: self.delay_ms,
            loss_percent: self.loss_percent,
        }
    }
}

/// Applies and removes interface disciplines.
///
/// `apply` must be idempotent: whatever was installed before, afterwards the
/// interface carries exactly the discipline described by `config`.
pub trait Shaper {
    fn apply(&mut self, iface: &str, config: &ShapingConfig) -> Result<()>;

    fn clear(&mut self, iface: &str) -> Result<()>;
}

/// Shapes host interfaces through `tc`.
#[derive(Clone, Debug)]
pub struct TcShaper {
    tc: Tc,
}

impl TcShaper {
    pub fn new(sudo: bool) -> Self {
        Self { tc: Tc::host(sudo) }
    }

    pub fn with_tc(tc: Tc) -> Self {
        Self { tc }
    }
}

impl Shaper for TcShaper {
    fn apply(&mut self, iface: &str, config: &ShapingConfig) -> Result<()> {
        debug!(iface, rate_kbit = config.rate_kbit, "tc apply");
        apply_shaping(&self.tc, iface, config)
    }

    fn clear(&mut self, iface: &str) -> Result<()> {
        debug!(iface, "tc clear");
        clear_shaping(&self.tc, iface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_defaults_match_fixed_constants() {
        let config = ShapingProfile::default().at_rate(750);
        assert_eq!(config.rate_kbit, 750);
        assert_eq!(config.burst_kbit, 32);
        assert_eq!(config.latency_ms, 400);
        assert!(!config.has_netem_params());
    }

    #[test]
    fn profile_carries_netem_params() {
        let profile = ShapingProfile {
            delay_ms: 50,
            ..Default::default()
        };
        assert!(profile.at_rate(1000).has_netem_params());
    }
}
