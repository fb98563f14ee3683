//! Replay policy for overdue trace samples.

use std::fmt;

/// How the controller handles several samples becoming due between ticks.
///
/// Only matters after a stall (paused process, slow `tc`), or for traces
/// sampled more finely than the tick interval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplayPolicy {
    /// Apply at most one sample per unit per tick. Overdue samples are
    /// each applied, in order, on successive ticks.
    #[default]
    Step,

    /// Jump straight to the latest due sample and apply only that one.
    /// Intermediate samples are counted but never installed.
    SkipAhead,
}

impl ReplayPolicy {
    pub const fn is_skip_ahead(self) -> bool {
        matches!(self, ReplayPolicy::SkipAhead)
    }
}

impl fmt::Display for ReplayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayPolicy::Step => write!(f, "step"),
            ReplayPolicy::SkipAhead => write!(f, "skip-ahead"),
        }
    }
}

impl std::str::FromStr for ReplayPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step" => Ok(ReplayPolicy::Step),
            "skip-ahead" => Ok(ReplayPolicy::SkipAhead),
            _ => Err(format!("invalid replay policy '{}': use step or skip-ahead", s)),
        }
    }
}

impl clap::ValueEnum for ReplayPolicy {
    fn value_variants<'a>() -> &'a [Self] {
        &[ReplayPolicy::Step, ReplayPolicy::SkipAhead]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            ReplayPolicy::Step => Some(clap::builder::PossibleValue::new("step")),
            ReplayPolicy::SkipAhead => Some(clap::builder::PossibleValue::new("skip-ahead")),
        }
    }
}
