//! The connectivity-only smoke test: exercises thread startup, the
//! barrier rendezvous, and the stop signal without any accept/connect or
//! read/write traffic.
//!
//! Direct port of `dummy_test.c`'s `run_client`/`run_server`/
//! `worker_thread`, which are themselves explicitly stubs in the original
//! (every data-plane step is a `/* STUB: ... */` comment) — useful for
//! validating the harness plumbing in isolation.

use mio::{Events, Poll, Token};

use crate::flow::add_lite;
use crate::thread::WorkerThread;
use crate::worker::{wait_for_events, STOP_TOKEN};

pub fn run(t: &mut WorkerThread) {
    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("thread {}: Poll::new: {e}", t.index);
            return;
        }
    };
    let mut stop_rx = t.stop_rx.take().expect("stop_rx already taken");
    if let Err(e) = add_lite(poll.registry(), &mut stop_rx, STOP_TOKEN) {
        tracing::error!("thread {}: registering stop pipe: {e}", t.index);
        return;
    }

    let mut events = Events::with_capacity(t.opts.maxevents.max(1) as usize);
    let timeout = t.opts.nonblocking.then(|| std::time::Duration::from_millis(10));

    t.ready.wait();

    let mut stop = false;
    while !stop {
        if let Err(e) = wait_for_events(&mut poll, &mut events, timeout) {
            tracing::error!("thread {}: poll: {e}", t.index);
            break;
        }
        for event in events.iter() {
            if event.token() == STOP_TOKEN {
                stop = true;
                break;
            }
            let _: Token = event.token(); // no other flows exist in this workload
        }
    }
}
