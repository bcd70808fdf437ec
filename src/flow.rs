//! Flow bookkeeping: one entry per live connection, addressed by a stable
//! `mio::Token`.
//!
//! Ports `flow.h`/`flow.c` (`addflow`/`delflow`/`addflow_lite`) from the
//! original tool. The C version uses the flow's own address as the epoll
//! readiness token ("this requires that flow memory not move after
//! registration", spec.md §4.2); mio's `Token` is an opaque integer, so
//! here the flow's slab index plays that role instead — the slab gives the
//! same "stable until removed" guarantee without exposing a raw pointer.

use std::net::SocketAddr;
use std::time::Instant;

use mio::{Interest, Registry, Token};
use slab::Slab;

use crate::interval::Interval;

/// One active connection's state (spec.md §3 "Flow").
///
/// Created on accept/connect, destroyed on peer close or thread stop.
/// Ownership of `socket` is exclusive: there is exactly one `Flow` per fd
/// for the fd's entire lifetime, enforced here simply by Rust ownership
/// (no two `Flow`s can hold the same socket value).
pub struct Flow<S> {
    pub socket: S,
    pub id: u64,
    pub bytes_to_read: u64,
    pub bytes_to_write: u64,
    pub bytes_read: u64,
    pub transactions: u64,
    pub interval: Interval,
    pub owning_thread_index: usize,
    /// Learned peer address for connectionless flows (UDP server side,
    /// which binds rather than connects and so must remember who to
    /// reply to). Always `None` for TCP, where the fd itself fixes the
    /// peer. Not part of spec.md §3's base `Flow` tuple, but required to
    /// give UDP the same one-fd-per-flow shape as TCP without a second,
    /// parallel token→peer side table.
    pub peer: Option<SocketAddr>,
    /// fd identity hook calls should use for this flow, as opposed to
    /// `socket`'s real kernel fd used for the actual I/O. Defaults to the
    /// real fd at construction time; a `socket_hook` that returns a number
    /// (spec.md §4.6 "overriding a file descriptor") replaces it for every
    /// later close/sendmsg/recvmsg/recverr hook call this flow makes.
    pub hook_fd: i32,
}

impl<S> Flow<S> {
    pub fn new(socket: S, id: u64, owning_thread_index: usize, interval: Interval, fd: i32) -> Self {
        Flow {
            socket,
            id,
            bytes_to_read: 0,
            bytes_to_write: 0,
            bytes_read: 0,
            transactions: 0,
            interval,
            owning_thread_index,
            peer: None,
            hook_fd: fd,
        }
    }
}

/// A non-I/O registration, used for the stop-signal pipe (spec.md §4.2
/// `add_lite`, "for out-of-band fds such as the stop signal").
pub struct LiteToken(pub Token);

/// Per-thread map from readiness token to flow state.
///
/// On `remove`, unsubscribes from readiness *before* the caller drops the
/// flow, matching spec.md §4.2: "removal must happen strictly after the
/// last readiness callback... closing the fd is the caller's
/// responsibility."
pub struct FlowRegistry<S> {
    flows: Slab<Flow<S>>,
    /// Reserved token below which no flow is ever allocated; used for the
    /// stop-signal sentinel and (for servers) the listening socket.
    reserved: usize,
}

impl<S: mio::event::Source> FlowRegistry<S> {
    pub fn new(reserved: usize) -> Self {
        FlowRegistry {
            flows: Slab::new(),
            reserved,
        }
    }

    /// Registers a new flow and returns the token identifying it.
    pub fn add(
        &mut self,
        registry: &Registry,
        mut flow: Flow<S>,
        events: Interest,
    ) -> std::io::Result<Token> {
        let entry = self.flows.vacant_entry();
        let token = Token(self.reserved + entry.key());
        registry.register(&mut flow.socket, token, events)?;
        entry.insert(flow);
        Ok(token)
    }

    pub fn get(&self, token: Token) -> Option<&Flow<S>> {
        token.0.checked_sub(self.reserved).and_then(|i| self.flows.get(i))
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Flow<S>> {
        token
            .0
            .checked_sub(self.reserved)
            .and_then(move |i| self.flows.get_mut(i))
    }

    /// Removes and returns a flow, deregistering it first.
    pub fn remove(&mut self, registry: &Registry, token: Token) -> Option<Flow<S>> {
        let idx = token.0.checked_sub(self.reserved)?;
        if !self.flows.contains(idx) {
            return None;
        }
        let mut flow = self.flows.remove(idx);
        let _ = registry.deregister(&mut flow.socket);
        Some(flow)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Token, &mut Flow<S>)> {
        let reserved = self.reserved;
        self.flows
            .iter_mut()
            .map(move |(i, f)| (Token(reserved + i), f))
    }

    pub fn drain(&mut self, registry: &Registry) -> Vec<Flow<S>> {
        let mut drained = Vec::with_capacity(self.flows.len());
        let keys: Vec<usize> = self.flows.iter().map(|(k, _)| k).collect();
        for k in keys {
            let mut flow = self.flows.remove(k);
            let _ = registry.deregister(&mut flow.socket);
            drained.push(flow);
        }
        drained
    }
}

/// Registers the stop-signal source with a fixed, reserved token (spec.md
/// §4.2 `add_lite`): no `Flow` payload, just readiness plumbing.
pub fn add_lite<S: mio::event::Source>(
    registry: &Registry,
    source: &mut S,
    token: Token,
) -> std::io::Result<()> {
    registry.register(source, token, Interest::READABLE)
}

pub fn now() -> Instant {
    Instant::now()
}
