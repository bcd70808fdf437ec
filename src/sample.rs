//! Per-flow progress samples. Ports `sample.h`/`sample.c` (not present in
//! the retrieved original but fully specified by spec.md §3/§4.1/§4.11).

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A periodic snapshot of one flow's cumulative progress.
///
/// Created exclusively by the owning worker thread and appended to that
/// thread's sample list in recording order; never mutated after insertion
/// (spec.md §3 "Sample" invariant).
#[derive(Debug, Clone)]
pub struct Sample {
    pub tid: usize,
    pub flow_id: u64,
    pub bytes_read: i64,
    pub transactions: u64,
    pub timestamp: Instant,
    /// Wall-clock mirror of `timestamp`, used only for CSV/report output
    /// (monotonic `Instant` has no meaningful absolute representation).
    pub wall_time: SystemTime,
    /// Per-transaction latency, for request/response-style workloads. Always
    /// `None` for the stream workloads this crate ships (see SPEC_FULL.md
    /// §3), kept so the field exists at the documented place in the data
    /// model rather than being silently dropped.
    pub latency: Option<LatencySamples>,
}

/// Placeholder for a per-transaction latency histogram; wired for future
/// request/response workloads.
#[derive(Debug, Clone, Default)]
pub struct LatencySamples {
    pub values: Vec<Duration>,
}

impl Sample {
    pub fn new(tid: usize, flow_id: u64, bytes_read: i64, transactions: u64) -> Self {
        Sample {
            tid,
            flow_id,
            bytes_read,
            transactions,
            timestamp: Instant::now(),
            wall_time: SystemTime::now(),
            latency: None,
        }
    }

    pub fn seconds_since_epoch(&self) -> f64 {
        self.wall_time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// Appends a sample to a thread's sample list. Mirrors `add_sample()`:
/// insertion is unordered (push, not insertion-sort); global ordering is
/// imposed later by the aggregator (spec.md §4.1).
pub fn add_sample(samples: &mut Vec<Sample>, sample: Sample) {
    samples.push(sample);
}

/// One CSV row, written by [`crate::stats::dump_all_samples`]. Mirrors
/// `print_sample()`'s column layout from spec.md §6 ("time_s,
/// throughput_Mbps, transactions, ...").
#[derive(Debug)]
pub struct SampleRow {
    pub time_s: f64,
    pub tid: usize,
    pub flow_id: u64,
    pub throughput_mbps: f64,
    pub transactions: u64,
}

impl SampleRow {
    pub fn as_record(&self) -> [String; 5] {
        [
            format!("{:.6}", self.time_s),
            self.tid.to_string(),
            self.flow_id.to_string(),
            format!("{:.3}", self.throughput_mbps),
            self.transactions.to_string(),
        ]
    }
}
