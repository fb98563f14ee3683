//! Bandwidth traces: tabular time series of downlink rates.
//!
//! A trace file is comma-separated with a header row. Two columns matter: a
//! timestamp formatted `YYYY.MM.DD_HH.MM.SS` and an integer rate in kbit/s.
//! Rows that are not valid UTF-8, or that have an unparsable timestamp, a
//! non-integer rate or a rate <= 0, are dropped silently. The first kept row
//! becomes offset zero.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDateTime;
use csv::{ByteRecord, ReaderBuilder, Trim};
use tracing::{debug, info};

pub const TIMESTAMP_FORMAT: &str = "%Y.%m.%d_%H.%M.%S";

/// One point of a trace.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TraceSample {
    /// Seconds since the first kept sample.
    pub offset_secs: f64,
    pub rate_kbps: u64,
}

/// Ordered samples, in input row order. May be empty, in which case
/// replaying it never shapes anything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trace {
    samples: Vec<TraceSample>,
}

impl Trace {
    /// Build from `(offset_secs, rate_kbps)` pairs that are already rebased.
    pub fn from_samples(samples: impl IntoIterator<Item = (f64, u64)>) -> Self {
        Self {
            samples: samples
                .into_iter()
                .map(|(offset_secs, rate_kbps)| TraceSample {
                    offset_secs,
                    rate_kbps,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TraceSample> {
        self.samples.get(index)
    }

    pub fn samples(&self) -> &[TraceSample] {
        &self.samples
    }

    /// Offset of the last sample, i.e. one replay period.
    pub fn duration_secs(&self) -> f64 {
        self.samples.last().map_or(0.0, |s| s.offset_secs)
    }
}

/// Parse a trace timestamp into seconds on a timezone-free clock.
///
/// Only differences between timestamps are used, so the values are
/// treated as UTC.
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp() as f64)
}

/// Fail unless every configured trace file exists.
///
/// Runs once before any interface is touched.
pub fn validate_trace_files(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        if !path.is_file() {
            bail!("trace file not found: {}", path.display());
        }
    }
    Ok(())
}

/// Load a trace file, locating columns by header name.
pub fn load_trace(path: &Path, timestamp_column: &str, rate_column: &str) -> Result<Trace> {
    let file = File::open(path).with_context(|| format!("open trace {}", path.display()))?;
    let trace = parse_trace(file, timestamp_column, rate_column)
        .with_context(|| format!("parse trace {}", path.display()))?;

    info!(
        "loaded trace {}: {} samples over {:.0}s",
        path.display(),
        trace.len(),
        trace.duration_secs()
    );
    Ok(trace)
}

/// Parse trace rows from any reader. See the module docs for the rules.
pub fn parse_trace<R: Read>(reader: R, timestamp_column: &str, rate_column: &str) -> Result<Trace> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let headers = rdr.byte_headers().context("read header")?.clone();
    if headers.is_empty() {
        return Ok(Trace::default());
    }
    let ts_idx = column_index(&headers, timestamp_column)?;
    let rate_idx = column_index(&headers, rate_column)?;

    let mut first: Option<f64> = None;
    let mut samples = Vec::new();
    let mut skipped = 0usize;

    for record in rdr.byte_records() {
        let record = match record {
            Ok(record) => record,
            Err(e) if e.is_io_error() => return Err(e).context("read row"),
            Err(e) => {
                debug!("skipping malformed trace row: {e}");
                skipped += 1;
                continue;
            }
        };

        let Some((absolute, rate)) = parse_row(&record, ts_idx, rate_idx) else {
            skipped += 1;
            continue;
        };

        let zero = *first.get_or_insert(absolute);
        let offset = absolute - zero;
        if offset >= 0.0 {
            samples.push((offset, rate));
        } else {
            skipped += 1;
        }
    }

    debug!(kept = samples.len(), skipped, "parsed trace rows");
    Ok(Trace::from_samples(samples))
}

fn parse_row(record: &ByteRecord, ts_idx: usize, rate_idx: usize) -> Option<(f64, u64)> {
    let field = |idx| record.get(idx).and_then(|raw| std::str::from_utf8(raw).ok());

    let rate: i64 = field(rate_idx)?.parse().ok()?;
    if rate <= 0 {
        return None;
    }
    let absolute = parse_timestamp(field(ts_idx)?)?;
    Some((absolute, rate as u64))
}

fn column_index(headers: &ByteRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|c| c == name.as_bytes())
        .ok_or_else(|| {
            let have: Vec<_> = headers.iter().map(String::from_utf8_lossy).collect();
            anyhow!("missing column '{name}' (have: {})", have.join(", "))
        })
}
