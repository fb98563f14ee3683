use std::sync::Arc;

use tokio::time::Instant;

use crate::mode::ReplayPolicy;
use crate::trace::Trace;

/// Rate driving one interface.
#[derive(Clone, Debug, PartialEq)]
pub enum BindingSource {
    Trace(Arc<Trace>),
    Static(u64),
}

/// A trace sample that has come due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DueSample {
    pub index: usize,
    pub rate_kbps: u64,
    /// Due samples passed over to reach this one (skip-ahead only).
    pub skipped: usize,
}

/// Replay state for one managed interface.
///
/// Owned by the controller's control loop alone; `cursor` and `epoch` are
/// never shared.
#[derive(Debug)]
pub struct InterfaceBinding<F> {
    pub unit: u32,
    pub interface: String,
    /// Container name, for logs.
    pub label: String,
    pub source: BindingSource,
    /// This unit's activation flag.
    pub active: F,
    cursor: usize,
    epoch: Instant,
    applied: u64,
    wraps: u64,
}

impl<F> InterfaceBinding<F> {
    pub fn new(
        unit: u32,
        interface: String,
        label: String,
        source: BindingSource,
        active: F,
        epoch: Instant,
    ) -> Self {
        Self {
            unit,
            interface,
            label,
            source,
            active,
            cursor: 0,
            epoch,
            applied: 0,
            wraps: 0,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Samples successfully installed so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Times the trace has wrapped around.
    pub fn wraps(&self) -> u64 {
        self.wraps
    }

    pub(crate) fn record_applied(&mut self) {
        self.applied += 1;
    }

    /// Replay from the first sample, with `now` as time zero.
    pub fn restart(&mut self, now: Instant) {
        self.cursor = 0;
        self.epoch = now;
    }

    /// The sample to apply at `now`, if one is due.
    ///
    /// Static sources and empty traces never have anything due.
    pub fn due(&self, now: Instant, policy: ReplayPolicy) -> Option<DueSample> {
        let BindingSource::Trace(trace) = &self.source else {
            return None;
        };
        let elapsed = now.saturating_duration_since(self.epoch).as_secs_f64();

        let first = trace.get(self.cursor)?;
        if elapsed < first.offset_secs {
            return None;
        }

        let mut index = self.cursor;
        if policy.is_skip_ahead() {
            while let Some(next) = trace.get(index + 1)
                && elapsed >= next.offset_secs
            {
                index += 1;
            }
        }

        Some(DueSample {
            index,
            rate_kbps: trace.get(index)?.rate_kbps,
            skipped: index - self.cursor,
        })
    }

    /// Move the cursor past `due`. At the end of the trace, wrap: cursor
    /// back to 0 and epoch reset to `now`. Returns true on wrap.
    pub fn advance(&mut self, due: &DueSample, now: Instant) -> bool {
        let len = match &self.source {
            BindingSource::Trace(trace) => trace.len(),
            BindingSource::Static(_) => return false,
        };

        self.cursor = (due.index + 1).min(len);
        if len > 0 && self.cursor >= len {
            self.restart(now);
            self.wraps += 1;
            return true;
        }
        false
    }
}
