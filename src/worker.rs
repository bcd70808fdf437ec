//! Shared pieces of the per-thread event loop (spec.md §4.8).
//!
//! The actual `run_client`/`run_server` bodies live in `workloads/`, one
//! pair per protocol, because TCP's listen/accept lifecycle and UDP's
//! pre-bound-flow lifecycle genuinely don't share a single control flow
//! past this point (see `socket_ops::SocketOps::has_accept` and
//! SPEC_FULL.md §4.7/§4.8). What *is* shared — flow distribution, buffer
//! sizing, and the readiness-wait call — lives here.

use std::time::Duration;

use mio::{Events, Poll, Token};
use rand::RngCore;

use crate::options::Options;

/// Reserved token for the stop-signal pipe (spec.md §4.2 `add_lite`).
pub const STOP_TOKEN: Token = Token(0);
/// Reserved token for a server's listening socket, when the protocol has
/// one (TCP). Unused for UDP.
pub const LISTENER_TOKEN: Token = Token(1);
/// First token handed out to an actual flow.
pub const FIRST_FLOW_TOKEN: usize = 2;

/// Splits `num_flows` across `num_threads`, remainder going to the
/// lowest-indexed threads. Direct port of `common.h`'s
/// `flows_in_thread()`.
pub fn flows_in_thread(num_flows: usize, num_threads: usize, tid: usize) -> usize {
    let base = num_flows / num_threads;
    let remainder = num_flows % num_threads;
    base + usize::from(tid < remainder)
}

/// Allocates and, for write-enabled sides, randomly fills the per-flow I/O
/// buffer. Ports `buf_alloc()`/`fill_random()` from `workload.c`/`lib.c`.
pub fn alloc_io_buffer(opts: &Options, fill_random: bool) -> Vec<u8> {
    let mut buf = vec![0u8; opts.io_buffer_size()];
    if fill_random {
        rand::rng().fill_bytes(&mut buf);
    }
    buf
}

/// Polls for readiness events, retrying on `EINTR` (mirrors the original
/// loop around `epoll_wait`; mio itself already retries internally, but
/// the retry here keeps the call site a direct port rather than relying
/// on an implementation detail).
pub fn wait_for_events(
    poll: &mut Poll,
    events: &mut Events,
    timeout: Option<Duration>,
) -> std::io::Result<()> {
    loop {
        match poll.poll(events, timeout) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
