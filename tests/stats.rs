//! End-to-end checks of `stats::aggregate` against hand-worked numeric
//! scenarios: zero samples, a single flow over two and three samples, and
//! two threads each running one flow.

use std::time::{Duration, Instant};

use rushit::sample::Sample;
use rushit::stats::{aggregate, dump_all_samples};

fn sample_at(t0: Instant, offset: Duration, tid: usize, flow_id: u64, bytes_read: i64) -> Sample {
    let mut s = Sample::new(tid, flow_id, bytes_read, 0);
    s.timestamp = t0 + offset;
    s
}

#[test]
fn zero_samples_is_meaningless_but_harmless() {
    let stats = aggregate(&[]);
    assert_eq!(stats.num_samples, 0);
    assert_eq!(stats.throughput_bytes_per_second, 0.0);
    assert_eq!(stats.correlation_coefficient, 0.0);
}

#[test]
fn two_samples_one_flow() {
    let t0 = Instant::now();
    let thread0 = vec![
        sample_at(t0, Duration::ZERO, 0, 0, 0),
        sample_at(t0, Duration::from_secs(1), 0, 0, 125_000_000),
    ];
    let stats = aggregate(&[thread0]);
    assert_eq!(stats.num_samples, 2);
    assert!((stats.throughput_bytes_per_second - 125_000_000.0).abs() < 1.0);
    assert!((stats.correlation_coefficient - 1.0).abs() < 1e-9);
}

#[test]
fn three_samples_one_flow() {
    let t0 = Instant::now();
    let thread0 = vec![
        sample_at(t0, Duration::ZERO, 0, 0, 0),
        sample_at(t0, Duration::from_secs(1), 0, 0, 50_000_000),
        sample_at(t0, Duration::from_secs(2), 0, 0, 100_000_000),
    ];
    let stats = aggregate(&[thread0]);
    assert_eq!(stats.num_samples, 3);
    assert!((stats.throughput_bytes_per_second - 50_000_000.0).abs() < 1.0);
    assert!((stats.correlation_coefficient - 1.0).abs() < 1e-9);
}

#[test]
fn two_threads_two_flows() {
    let t0 = Instant::now();
    // Thread 0 drives flow 0, thread 1 drives flow 1; both ramp from 0 to
    // 125e6 bytes over one second, so the combined series is perfectly
    // linear but spread across two independent counters.
    let thread0 = vec![
        sample_at(t0, Duration::ZERO, 0, 0, 0),
        sample_at(t0, Duration::from_secs(1), 0, 0, 125_000_000),
    ];
    let thread1 = vec![
        sample_at(t0, Duration::ZERO, 1, 1, 0),
        sample_at(t0, Duration::from_secs(1), 1, 1, 125_000_000),
    ];
    let stats = aggregate(&[thread0, thread1]);
    assert_eq!(stats.num_samples, 4);
    assert!((stats.throughput_bytes_per_second - 250_000_000.0).abs() < 1.0);
    // Not the degenerate r=1.0 of the single-flow cases: folding two
    // independently-ramping counters into one timeline bends the
    // duration/bytes relationship away from a perfect line.
    let expected_r = (0.9_f64).sqrt();
    assert!((stats.correlation_coefficient - expected_r).abs() < 1e-6);
}

#[test]
fn single_sample_is_reported_but_not_aggregated() {
    let t0 = Instant::now();
    let thread0 = vec![sample_at(t0, Duration::ZERO, 0, 0, 42)];
    let stats = aggregate(&[thread0]);
    assert_eq!(stats.num_samples, 1);
    assert_eq!(stats.throughput_bytes_per_second, 0.0);
    assert_eq!(stats.correlation_coefficient, 0.0);
}

#[test]
fn dump_all_samples_writes_one_row_per_sample_sorted_by_time() {
    let t0 = Instant::now();
    let thread0 = vec![
        sample_at(t0, Duration::from_secs(1), 0, 0, 50_000_000),
        sample_at(t0, Duration::ZERO, 0, 0, 0),
    ];
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("samples.csv");

    dump_all_samples(&path, &[thread0]).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let mut lines = contents.lines();
    assert_eq!(
        lines.next().unwrap(),
        "time_s,tid,flow_id,throughput_Mbps,transactions"
    );
    let first_row = lines.next().unwrap();
    assert!(first_row.starts_with("0.000000,0,0,"), "got {first_row:?}");
    let second_row = lines.next().unwrap();
    assert!(second_row.starts_with("1.000000,0,0,"), "got {second_row:?}");
    assert!(lines.next().is_none());
}
