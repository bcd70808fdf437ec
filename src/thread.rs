//! Per-worker-thread state, handed whole into `std::thread::spawn`.
//!
//! Ports `struct thread` from `thread.h`/`thread.c`. The original's
//! `stop_efd` (an `eventfd`) becomes a `mio::unix::pipe` pair (spec.md §9's
//! sanctioned portable equivalent, see SPEC_FULL.md §5); everything else
//! maps field for field.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::time::{Duration, Instant};

use mio::unix::pipe;

use crate::options::Options;
use crate::sample::Sample;

#[cfg(feature = "script")]
use crate::script::slave::ScriptSlave;

/// One worker thread's private state (spec.md §4.8/§4.9).
///
/// The stop-signal pipe's sender half is deliberately *not* a field here:
/// the coordinator holds it (see `coordinator.rs`) so it can be signaled
/// after the `WorkerThread` itself has already been moved into its
/// `std::thread::spawn` closure.
pub struct WorkerThread {
    pub index: usize,
    pub addrs: Vec<SocketAddr>,
    /// Taken by the worker loop on entry; `None` afterward.
    pub stop_rx: Option<pipe::Receiver>,
    pub samples: Vec<Sample>,
    pub opts: Arc<Options>,
    /// Shared by all worker threads and the coordinator; rendezvous
    /// point mirroring `pthread_barrier_wait(&ctx->threads_ready)`.
    pub ready: Arc<Barrier>,
    /// First observed data byte across all threads (`time_start` in the
    /// original, guarded by `time_start_mutex`).
    pub time_start: Arc<DataStart>,
    #[cfg(feature = "script")]
    pub script_slave: ScriptSlave,
}

/// Shared record of the first data byte observed across all worker
/// threads, with a condvar so a waiter (the control plane's deadline
/// timer, spec.md §4.10 point 3) can be woken the instant it's set
/// instead of polling `time_start_mutex` in a loop.
#[derive(Default)]
pub struct DataStart {
    instant: Mutex<Option<Instant>>,
    cv: Condvar,
}

impl DataStart {
    pub fn new() -> Arc<Self> {
        Arc::new(DataStart {
            instant: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    /// Records the first data byte seen across all threads, once, and
    /// wakes anyone blocked in `wait`.
    pub fn mark(&self) {
        let mut guard = self.instant.lock().unwrap();
        if guard.is_none() {
            *guard = Some(Instant::now());
            self.cv.notify_all();
        }
    }

    pub fn get(&self) -> Option<Instant> {
        *self.instant.lock().unwrap()
    }

    /// Blocks until the first data byte is observed, or `timeout` elapses
    /// with none ever arriving (a run where no bytes cross the wire, e.g.
    /// both sides write-only with no peer reading) — in which case this
    /// returns `None`.
    pub fn wait(&self, timeout: Duration) -> Option<Instant> {
        let guard = self.instant.lock().unwrap();
        if let Some(t) = *guard {
            return Some(t);
        }
        let (guard, _) = self.cv.wait_timeout_while(guard, timeout, |g| g.is_none()).unwrap();
        *guard
    }
}

impl WorkerThread {
    /// Builds one worker's state around an already-created stop-signal
    /// receiver; the coordinator owns the matching sender.
    pub fn new(
        index: usize,
        addrs: Vec<SocketAddr>,
        stop_rx: pipe::Receiver,
        opts: Arc<Options>,
        ready: Arc<Barrier>,
        time_start: Arc<DataStart>,
        #[cfg(feature = "script")] script_slave: ScriptSlave,
    ) -> Self {
        WorkerThread {
            index,
            addrs,
            stop_rx: Some(stop_rx),
            samples: Vec::new(),
            opts,
            ready,
            time_start,
            #[cfg(feature = "script")]
            script_slave,
        }
    }

    /// Records the first data byte seen across all threads, once.
    pub fn mark_data_started(&self) {
        self.time_start.mark();
    }
}

/// Free-function form of [`WorkerThread::mark_data_started`], for call
/// sites that only hold the shared `time_start` handle rather than the
/// whole `WorkerThread` (workload `process_one` functions split their
/// borrow of a thread's fields to keep the hook slave borrow disjoint
/// from the sample list borrow).
pub fn mark_data_started(time_start: &DataStart) {
    time_start.mark();
}

/// Tells a worker to stop (`eventfd_write`'s moral equivalent): one byte
/// into the pipe, observed by the worker's `Poll` as a normal readable
/// event on the reserved stop token (spec.md §4.2, §5).
pub fn signal_stop(stop_tx: &mut pipe::Sender) -> std::io::Result<()> {
    stop_tx.write_all(&[1u8])
}
