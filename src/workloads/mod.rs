//! Workload entry points sharing the plumbing in `worker.rs`.
//!
//! `dummy_test` validates thread/barrier/stop-signal wiring with no
//! sockets at all; `tcp_stream`/`udp_stream` are the two data-plane
//! workloads this crate ships, ported from the original tool's
//! same-named `*.c` files.

pub mod dummy_test;
pub mod tcp_stream;
pub mod udp_stream;
