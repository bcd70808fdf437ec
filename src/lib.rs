//! `rushit`: a multi-threaded, scriptable TCP/UDP network performance
//! benchmark harness.
//!
//! See `SPEC_FULL.md` for the module map this crate implements.

pub mod control_plane;
pub mod coordinator;
pub mod error;
pub mod flow;
pub mod interval;
pub mod logging;
pub mod options;
pub mod sample;
#[cfg(feature = "script")]
pub mod script;
pub mod socket_ops;
pub mod stats;
pub mod thread;
pub mod worker;
pub mod workloads;
