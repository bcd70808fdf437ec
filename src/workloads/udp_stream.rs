//! UDP stream workload: connectionless counterpart to `tcp_stream`.
//!
//! Ports `udp_stream.c`. UDP has no accept/listen lifecycle
//! (`UdpOps::has_accept()` is `false`), so both sides pre-create one
//! socket per flow up front instead of a listener spawning flows as
//! connections arrive. The client `connect()`s each flow's socket to a
//! fixed server port (so `send`/`recv` need no address); the server only
//! `bind()`s, since it must accept a flow's first datagram from whatever
//! ephemeral port the client's connect picked, and learns the peer from
//! that first `recv_from` (spec.md §4.7 "UDP... connectionless... flows
//! are pre-bound sockets").

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll};
use socket2::SockAddr;
use tracing::{error, warn};

use crate::flow::{add_lite, now, Flow, FlowRegistry};
use crate::interval::Interval;
use crate::sample::{add_sample, Sample};
use crate::socket_ops::{drain_error_queue, run_close_hook, run_open_hook, AddrInfoView, SocketOps, UdpOps};
use crate::thread::{mark_data_started, DataStart, WorkerThread};
use crate::worker::{alloc_io_buffer, flows_in_thread, wait_for_events, FIRST_FLOW_TOKEN, STOP_TOKEN};

#[cfg(feature = "script")]
use crate::script::slave::ScriptSlave;
#[cfg(not(feature = "script"))]
use crate::socket_ops::ScriptSlave;

fn poll_timeout(nonblocking: bool) -> Option<Duration> {
    nonblocking.then(|| Duration::from_millis(10))
}

/// Port a given flow (the `local_idx`-th flow owned by thread `tid`)
/// binds/connects to. With `SO_REUSEPORT` every flow in a thread shares
/// the thread's port (spec.md §6 `--reuseport`); otherwise each flow
/// needs its own port, offset from the thread's base port so flows in
/// the same thread don't collide (`Options::data_port_for_thread`
/// already offsets threads from each other).
fn flow_port(opts: &crate::options::Options, tid: usize, local_idx: usize) -> u16 {
    let base = opts.data_port_for_thread(tid);
    if opts.reuseport {
        base
    } else {
        base.wrapping_add(local_idx as u16)
    }
}

fn bound_socket(opts: &crate::options::Options, port: u16) -> std::io::Result<UdpSocket> {
    let ops = UdpOps;
    let raw = ops.open(opts.address_family())?;
    ops.configure(&raw, opts)?;
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let addr: SockAddr = addr.into();
    raw.bind(&addr)?;
    let std_socket: std::net::UdpSocket = raw.into();
    UdpSocket::from_std(std_socket)
}

pub fn run_client(t: &mut WorkerThread) {
    let mut opts = (*t.opts).clone();
    opts.configure_for_role(true);
    let addrs = t.addrs.clone();
    let n_flows = flows_in_thread(opts.num_flows, opts.num_threads, t.index);

    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => return error!("thread {}: Poll::new: {e}", t.index),
    };
    let mut stop_rx = t.stop_rx.take().expect("stop_rx already taken");
    if let Err(e) = add_lite(poll.registry(), &mut stop_rx, STOP_TOKEN) {
        return error!("thread {}: stop pipe: {e}", t.index);
    }

    let interest = interest_for(&opts);
    let mut flows = FlowRegistry::<UdpSocket>::new(FIRST_FLOW_TOKEN);
    let mut next_flow_id = (t.index as u64) << 32;

    for local_idx in 0..n_flows {
        let Some(&server_addr) = addrs.first() else {
            error!("thread {}: no resolved server address", t.index);
            break;
        };
        let port = flow_port(&opts, t.index, local_idx);
        let target = SocketAddr::new(server_addr.ip(), port);
        match bound_socket(&opts, 0).and_then(|s| {
            s.connect(target)?;
            Ok(s)
        }) {
            Ok(socket) => {
                let fd = socket.as_raw_fd();
                let hook_fd = match run_open_hook(
                    slave_for_hook(t),
                    fd,
                    AddrInfoView { peer: Some(target), local: None },
                ) {
                    Ok(over) => over.unwrap_or(fd),
                    Err(e) => {
                        warn!("thread {}: client_socket hook: {e}", t.index);
                        fd
                    }
                };
                let interval = Interval::new(opts.interval_duration(), now());
                let mut flow = Flow::new(socket, next_flow_id, t.index, interval, fd);
                flow.hook_fd = hook_fd;
                flow.peer = Some(target);
                next_flow_id += 1;
                if let Err(e) = flows.add(poll.registry(), flow, interest) {
                    warn!("thread {}: registering flow: {e}", t.index);
                }
            }
            Err(e) => warn!("thread {}: connect flow {local_idx}: {e}", t.index),
        }
    }

    let mut buf = alloc_io_buffer(&opts, opts.enable_write);
    let mut events = Events::with_capacity(opts.maxevents.max(1));
    let timeout = poll_timeout(opts.nonblocking);

    t.ready.wait();

    let mut stop = false;
    while !stop {
        if let Err(e) = wait_for_events(&mut poll, &mut events, timeout) {
            error!("thread {}: poll: {e}", t.index);
            break;
        }
        for event in events.iter() {
            if event.token() == STOP_TOKEN {
                stop = true;
                break;
            }
            process_one(
                t.index,
                &mut t.samples,
                &t.time_start,
                slave_for_hook(t),
                event,
                &mut flows,
                &mut buf,
                &opts,
            );
        }
    }

    for flow in flows.drain(poll.registry()) {
        note_close_hook(slave_for_hook(t), flow.hook_fd, AddrInfoView::default());
    }
}

pub fn run_server(t: &mut WorkerThread) {
    let mut opts = (*t.opts).clone();
    opts.configure_for_role(false);
    let n_flows = flows_in_thread(opts.num_flows, opts.num_threads, t.index);

    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => return error!("thread {}: Poll::new: {e}", t.index),
    };
    let mut stop_rx = t.stop_rx.take().expect("stop_rx already taken");
    if let Err(e) = add_lite(poll.registry(), &mut stop_rx, STOP_TOKEN) {
        return error!("thread {}: stop pipe: {e}", t.index);
    }

    let interest = interest_for(&opts);
    let mut flows = FlowRegistry::<UdpSocket>::new(FIRST_FLOW_TOKEN);
    let mut next_flow_id = (t.index as u64) << 32;

    for local_idx in 0..n_flows.max(1) {
        let port = flow_port(&opts, t.index, local_idx);
        match bound_socket(&opts, port) {
            Ok(socket) => {
                let fd = socket.as_raw_fd();
                let hook_fd = match run_open_hook(slave_for_hook(t), fd, AddrInfoView::default()) {
                    Ok(over) => over.unwrap_or(fd),
                    Err(e) => {
                        warn!("thread {}: server_socket hook: {e}", t.index);
                        fd
                    }
                };
                let interval = Interval::new(opts.interval_duration(), now());
                let mut flow = Flow::new(socket, next_flow_id, t.index, interval, fd);
                flow.hook_fd = hook_fd;
                next_flow_id += 1;
                if let Err(e) = flows.add(poll.registry(), flow, interest) {
                    warn!("thread {}: registering bound socket: {e}", t.index);
                }
            }
            Err(e) => warn!("thread {}: bind port {port}: {e}", t.index),
        }
    }

    let mut buf = alloc_io_buffer(&opts, opts.enable_write);
    let mut events = Events::with_capacity(opts.maxevents.max(1));
    let timeout = poll_timeout(opts.nonblocking);

    t.ready.wait();

    let mut stop = false;
    while !stop {
        if let Err(e) = wait_for_events(&mut poll, &mut events, timeout) {
            error!("thread {}: poll: {e}", t.index);
            break;
        }
        for event in events.iter() {
            if event.token() == STOP_TOKEN {
                stop = true;
                break;
            }
            process_one(
                t.index,
                &mut t.samples,
                &t.time_start,
                slave_for_hook(t),
                event,
                &mut flows,
                &mut buf,
                &opts,
            );
        }
    }

    for flow in flows.drain(poll.registry()) {
        note_close_hook(slave_for_hook(t), flow.hook_fd, AddrInfoView::default());
    }
}

fn interest_for(opts: &crate::options::Options) -> Interest {
    match (opts.enable_read, opts.enable_write) {
        (true, true) => Interest::READABLE.add(Interest::WRITABLE),
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => Interest::READABLE,
    }
}

#[cfg(feature = "script")]
fn slave_for_hook(t: &mut WorkerThread) -> Option<&mut ScriptSlave> {
    Some(&mut t.script_slave)
}
#[cfg(not(feature = "script"))]
fn slave_for_hook(_t: &mut WorkerThread) -> Option<&mut ScriptSlave> {
    None
}

/// Per-flow readiness handling, connectionless variant: no RDHUP/peer
/// close exists for UDP, so a flow only ever goes away on thread stop
/// (spec.md §7 "per-flow fatal" doesn't apply the same way to datagrams).
/// The error-queue drain still applies (spec.md §4.8): a UDP socket can
/// carry a queued `ECONNREFUSED`/ICMP error the same way TCP does.
#[allow(clippy::too_many_arguments)]
fn process_one(
    tid: usize,
    samples: &mut Vec<Sample>,
    time_start: &DataStart,
    mut slave: Option<&mut ScriptSlave>,
    event: &mio::event::Event,
    flows: &mut FlowRegistry<UdpSocket>,
    buf: &mut [u8],
    opts: &crate::options::Options,
) {
    let token = event.token();
    let Some(flow) = flows.get_mut(token) else { return };

    if opts.enable_read && event.is_readable() {
        loop {
            match flow.socket.recv_from(buf) {
                Ok((n, peer)) => {
                    if flow.peer.is_none() {
                        flow.peer = Some(peer);
                    }
                    mark_data_started(time_start);
                    let hook_fd = flow.hook_fd;
                    match note_recvmsg(slave.as_deref_mut(), hook_fd, n) {
                        Some(v) if v < 0 => break,
                        Some(v) => flow.bytes_read += v as u64,
                        None => flow.bytes_read += n as u64,
                    }
                    flow.transactions += 1;
                    let flow_id = flow.id;
                    let bytes_read = flow.bytes_read as i64;
                    let transactions = flow.transactions;
                    if flow.interval.due(now()) {
                        add_sample(samples, Sample::new(tid, flow_id, bytes_read, transactions));
                    }
                    if !opts.edge_trigger {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("thread {tid}: recv: {e}");
                    break;
                }
            }
        }
    }

    if opts.enable_write && event.is_writable() {
        if let Some(peer) = flow.peer {
            loop {
                match flow.socket.send_to(buf, peer) {
                    Ok(n) => {
                        let hook_fd = flow.hook_fd;
                        if let Some(v) = note_sendmsg(slave.as_deref_mut(), hook_fd, n) {
                            if v < 0 {
                                break;
                            }
                        }
                        if opts.delay > 0 {
                            std::thread::sleep(Duration::from_nanos(opts.delay));
                        }
                        if !opts.edge_trigger {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("thread {tid}: send: {e}");
                        break;
                    }
                }
            }
        }
    }

    if event.is_error() {
        let real_fd = flow.socket.as_raw_fd();
        let hook_fd = flow.hook_fd;
        match drain_error_queue(real_fd, buf) {
            Ok(n) => {
                if let Some(v) = note_recverr(slave.as_deref_mut(), hook_fd, n) {
                    if v < 0 {
                        warn!("thread {tid}: readerr hook reported no error queued");
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!("thread {tid}: readerr: {e}"),
        }
    }
}

fn note_close_hook(slave: Option<&mut ScriptSlave>, fd: i32, ai: AddrInfoView) {
    match run_close_hook(slave, fd, ai) {
        Ok(_) => {}
        Err(e) => warn!("close hook: {e}"),
    }
}

fn note_recvmsg(slave: Option<&mut ScriptSlave>, fd: i32, n: usize) -> Option<i64> {
    #[cfg(feature = "script")]
    if let Some(s) = slave {
        match s.recvmsg_hook(fd, n, 0) {
            Ok(v) => return Some(v as i64),
            Err(e) if !e.is_soft() => warn!("recvmsg hook: {e}"),
            Err(_) => {}
        }
    }
    #[cfg(not(feature = "script"))]
    let _ = (slave, fd, n);
    None
}

fn note_sendmsg(slave: Option<&mut ScriptSlave>, fd: i32, n: usize) -> Option<i64> {
    #[cfg(feature = "script")]
    if let Some(s) = slave {
        match s.sendmsg_hook(fd, n, 0) {
            Ok(v) => return Some(v as i64),
            Err(e) if !e.is_soft() => warn!("sendmsg hook: {e}"),
            Err(_) => {}
        }
    }
    #[cfg(not(feature = "script"))]
    let _ = (slave, fd, n);
    None
}

fn note_recverr(slave: Option<&mut ScriptSlave>, fd: i32, n: usize) -> Option<i64> {
    #[cfg(feature = "script")]
    if let Some(s) = slave {
        match s.recverr_hook(fd, n, 0) {
            Ok(v) => return Some(v as i64),
            Err(e) if !e.is_soft() => warn!("recverr hook: {e}"),
            Err(_) => {}
        }
    }
    #[cfg(not(feature = "script"))]
    let _ = (slave, fd, n);
    None
}

#[cfg(all(test, feature = "script"))]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::script::engine::{RunMode, ScriptEngine};
    use clap::Parser;
    use mio::Token;

    fn base_opts() -> Options {
        let mut opts = Options::parse_from(["rushit"]);
        opts.enable_read = true;
        opts.enable_write = false;
        opts.edge_trigger = false;
        opts
    }

    fn connected_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpSocket::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        a.connect(b.local_addr().unwrap()).unwrap();
        b.connect(a.local_addr().unwrap()).unwrap();
        (a, b)
    }

    /// A `client_recvmsg` hook override must replace the real `recv_from`'s
    /// byte count in `flow.bytes_read`, mirroring the TCP workload's
    /// equivalent test (spec.md §4.6).
    #[test]
    fn recvmsg_hook_override_replaces_accounted_byte_count() {
        let (client, server) = connected_pair();
        client.send(b"hello world").unwrap();

        let engine = ScriptEngine::new(RunMode::Client).unwrap();
        engine
            .run_string("client_recvmsg(function(fd, len, flags) return 999 end)\nrun()", || {})
            .unwrap();
        let mut slave = ScriptSlave::new(&engine).unwrap();

        let opts = base_opts();
        let fd = server.as_raw_fd();
        let interval = Interval::new(opts.interval_duration(), now());
        let flow = Flow::new(server, 1, 0, interval, fd);
        let mut flows = FlowRegistry::<UdpSocket>::new(FIRST_FLOW_TOKEN);
        let mut poll = Poll::new().unwrap();
        flows.add(poll.registry(), flow, Interest::READABLE).unwrap();

        let mut events = Events::with_capacity(8);
        loop {
            poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
            if events.iter().any(|e| e.is_readable()) {
                break;
            }
        }
        let event = events.iter().find(|e| e.is_readable()).unwrap();

        let mut samples = Vec::new();
        let time_start = DataStart::new();
        let mut buf = vec![0u8; 64];
        process_one(0, &mut samples, &time_start, Some(&mut slave), event, &mut flows, &mut buf, &opts);

        let flow = flows.get(Token(FIRST_FLOW_TOKEN)).unwrap();
        assert_eq!(flow.bytes_read, 999);
    }

    #[test]
    fn recverr_hook_override_is_forwarded() {
        let engine = ScriptEngine::new(RunMode::Client).unwrap();
        engine
            .run_string("client_recverr(function(fd, len, flags) return 5 end)\nrun()", || {})
            .unwrap();
        let mut slave = ScriptSlave::new(&engine).unwrap();
        assert_eq!(note_recverr(Some(&mut slave), 3, 0), Some(5));
    }
}
