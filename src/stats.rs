//! Post-run statistics aggregation (spec.md §4.11, §8).
//!
//! Ports `calculate_stream_stats`/`report_stream_stats` (`workload.c`) and
//! `print_sample`/`print_samples` (`sample.h`). The correlation-coefficient
//! formula is preserved bit-for-bit even though spec.md §9 acknowledges it
//! is only meaningful for single-flow runs — this crate does not "fix" it,
//! per that Open Question's explicit resolution.

use std::time::Duration;

use csv::Writer;
use tracing::warn;

use crate::sample::{Sample, SampleRow};

/// Aggregated output of one run (spec.md §4.11).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamStats {
    pub num_samples: usize,
    pub throughput_bytes_per_second: f64,
    pub correlation_coefficient: f64,
    pub end_time: Duration,
}

impl StreamStats {
    fn zero() -> Self {
        StreamStats {
            num_samples: 0,
            throughput_bytes_per_second: 0.0,
            correlation_coefficient: 0.0,
            end_time: Duration::ZERO,
        }
    }

    pub fn throughput_mbps(&self) -> f64 {
        self.throughput_bytes_per_second * 8.0 / 1_000_000.0
    }
}

/// Merges every worker thread's ordered sample list into one global
/// timeline and computes throughput/correlation (spec.md §4.11 algorithm,
/// steps 1-5).
pub fn aggregate(thread_samples: &[Vec<Sample>]) -> StreamStats {
    let mut all: Vec<&Sample> = thread_samples.iter().flatten().collect();
    if all.len() < 2 {
        if !all.is_empty() {
            warn!("fewer than two samples; throughput/correlation are meaningless");
        }
        return StreamStats {
            num_samples: all.len(),
            ..StreamStats::zero()
        };
    }

    // Stable sort by (timestamp, tid, flow_id) — step 1.
    all.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.tid.cmp(&b.tid))
            .then(a.flow_id.cmp(&b.flow_id))
    });

    let t0 = all[0].timestamp;
    let baseline = all[0].bytes_read as f64;

    // Per-(tid, flow) running byte counter, seeded with the very first
    // sample (step 2). Any (tid, flow) pair not yet seen during the walk
    // defaults to 0 — only the single global first sample is baselined.
    use std::collections::HashMap;
    let mut counters: HashMap<(usize, u64), i64> = HashMap::new();
    counters.insert((all[0].tid, all[0].flow_id), all[0].bytes_read);
    let mut running_total = all[0].bytes_read as f64;

    let mut sum_xy = 0.0f64;
    let mut sum_xx = 0.0f64;
    let mut sum_yy = 0.0f64;
    let mut last_duration = 0.0f64;
    let mut last_bytes = 0.0f64;

    for sample in &all[1..] {
        let key = (sample.tid, sample.flow_id);
        let prev = counters.get(&key).copied().unwrap_or(0);
        counters.insert(key, sample.bytes_read);
        running_total += (sample.bytes_read - prev) as f64;

        let duration = sample
            .timestamp
            .saturating_duration_since(t0)
            .as_secs_f64();
        let bytes = running_total - baseline;

        sum_xy += duration * bytes;
        sum_xx += duration * duration;
        sum_yy += bytes * bytes;

        last_duration = duration;
        last_bytes = bytes;
    }

    let throughput = if last_duration == 0.0 || last_bytes == 0.0 {
        0.0
    } else {
        last_bytes / last_duration
    };
    let r = if sum_xx > 0.0 && sum_yy > 0.0 {
        sum_xy / (sum_xx * sum_yy).sqrt()
    } else {
        0.0
    };

    StreamStats {
        num_samples: all.len(),
        throughput_bytes_per_second: throughput,
        correlation_coefficient: r,
        end_time: all.last().unwrap().timestamp.saturating_duration_since(t0),
    }
}

/// Writes every sample across every thread to `path` as CSV, sorted by
/// timestamp (spec.md §6 "Sample CSV", `-A`/`--all-samples`). Ports
/// `print_samples`.
pub fn dump_all_samples(path: &std::path::Path, thread_samples: &[Vec<Sample>]) -> std::io::Result<()> {
    let mut all: Vec<&Sample> = thread_samples.iter().flatten().collect();
    all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let t0 = all.first().map(|s| s.timestamp);
    let mut wtr = Writer::from_path(path)?;
    wtr.write_record(["time_s", "tid", "flow_id", "throughput_Mbps", "transactions"])
        .map_err(to_io_error)?;

    let mut prev_bytes: std::collections::HashMap<(usize, u64), i64> = std::collections::HashMap::new();
    for sample in all {
        let key = (sample.tid, sample.flow_id);
        let prev = prev_bytes.get(&key).copied().unwrap_or(sample.bytes_read);
        let delta_bytes = (sample.bytes_read - prev).max(0) as f64;
        prev_bytes.insert(key, sample.bytes_read);

        let time_s = t0
            .map(|t0| sample.timestamp.saturating_duration_since(t0).as_secs_f64())
            .unwrap_or(0.0);
        let row = SampleRow {
            time_s,
            tid: sample.tid,
            flow_id: sample.flow_id,
            throughput_mbps: delta_bytes * 8.0 / 1_000_000.0,
            transactions: sample.transactions,
        };
        wtr.write_record(row.as_record()).map_err(to_io_error)?;
    }
    wtr.flush()
}

fn to_io_error(e: csv::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}

/// Percentiles over a latency histogram, for request/response-style
/// workloads that populate `Sample::latency` (spec.md §3 "optional
/// latency-histogram handle"). The stream workloads this crate ships
/// never set that field, so this always receives an empty slice in
/// practice; kept so the aggregator's surface matches spec.md's
/// `percentiles` rather than silently dropping the concept.
pub fn latency_percentiles(samples: &[Sample], percentiles: &[f64]) -> Vec<(f64, Duration)> {
    let mut values: Vec<Duration> = samples
        .iter()
        .filter_map(|s| s.latency.as_ref())
        .flat_map(|l| l.values.iter().copied())
        .collect();
    values.sort();
    percentiles
        .iter()
        .map(|&p| {
            if values.is_empty() {
                (p, Duration::ZERO)
            } else {
                let idx = ((p / 100.0) * (values.len() - 1) as f64).round() as usize;
                (p, values[idx.min(values.len() - 1)])
            }
        })
        .collect()
}

/// Human-readable report printed at the end of a run (spec.md
/// `report_stream_stats`). Plain `println!`, not a log line — this is the
/// tool's actual product output (SPEC_FULL.md §7).
pub fn print_report(stats: &StreamStats, incidents: u32) {
    println!("num_samples={}", stats.num_samples);
    println!("throughput_Mbps={:.3}", stats.throughput_mbps());
    println!("correlation_coefficient={:.6}", stats.correlation_coefficient);
    println!(
        "end_time={}.{:09}",
        stats.end_time.as_secs(),
        stats.end_time.subsec_nanos()
    );
    if incidents > 0 {
        println!("control_plane_incidents={incidents}");
    }
}
