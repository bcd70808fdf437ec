//! TCP stream workload: client connects `num_flows` streams and
//! reads/writes continuously; server accepts connections and does the
//! same. Direct port of `tcp_stream.c`'s `process_events`/`server_accept`/
//! `worker_thread`.

use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll};
use socket2::SockAddr;
use tracing::{error, warn};

use crate::flow::{add_lite, now, Flow, FlowRegistry};
use crate::interval::Interval;
use crate::sample::{add_sample, Sample};
use crate::socket_ops::{drain_error_queue, run_close_hook, run_open_hook, AddrInfoView, SocketOps, TcpOps};
use crate::thread::{mark_data_started, DataStart, WorkerThread};
use crate::worker::{alloc_io_buffer, flows_in_thread, wait_for_events, FIRST_FLOW_TOKEN, STOP_TOKEN};

#[cfg(feature = "script")]
use crate::script::slave::ScriptSlave;
#[cfg(not(feature = "script"))]
use crate::socket_ops::ScriptSlave;

fn poll_timeout(nonblocking: bool) -> Option<Duration> {
    nonblocking.then(|| Duration::from_millis(10))
}

fn connect_one(ops: &TcpOps, addr: SocketAddr, opts: &crate::options::Options) -> std::io::Result<TcpStream> {
    let family_sock = ops.open(opts.address_family())?;
    ops.configure(&family_sock, opts)?;
    ops.connect(&family_sock, addr)?;
    let std_stream: std::net::TcpStream = family_sock.into();
    Ok(TcpStream::from_std(std_stream))
}

fn listener_for(opts: &crate::options::Options, tid: usize) -> std::io::Result<TcpListener> {
    let ops = TcpOps;
    let addr: SocketAddr = format!("0.0.0.0:{}", opts.data_port_for_thread(tid)).parse().unwrap();
    let raw = ops.open(opts.address_family())?;
    ops.configure(&raw, opts)?;
    let addr: SockAddr = addr.into();
    raw.bind(&addr)?;
    raw.listen(opts.listen_backlog)?;
    let std_listener: std::net::TcpListener = raw.into();
    TcpListener::from_std(std_listener)
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
    let mut flows = FlowRegistry::<TcpStream>::new(FIRST_FLOW_TOKEN);
    let mut next_flow_id = (t.index as u64) << 32;

    let ops = TcpOps;
    for _ in 0..n_flows {
        let Some(&addr) = addrs.first() else {
            error!("thread {}: no resolved server address", t.index);
            break;
        };
        match connect_one(&ops, addr, &opts) {
            Ok(mut stream) => {
                let fd = stream.as_raw_fd();
                let hook_fd = match run_open_hook(
                    slave_for_hook(t),
                    fd,
                    AddrInfoView { peer: Some(addr), local: None },
                ) {
                    Ok(over) => over.unwrap_or(fd),
                    Err(e) => {
                        warn!("thread {}: client_socket hook: {e}", t.index);
                        fd
                    }
                };
                let interval = Interval::new(opts.interval_duration(), now());
                let mut flow = Flow::new(stream, next_flow_id, t.index, interval, fd);
                flow.hook_fd = hook_fd;
                next_flow_id += 1;
                if let Err(e) = flows.add(poll.registry(), flow, interest) {
                    warn!("thread {}: registering flow: {e}", t.index);
                }
            }
            Err(e) => warn!("thread {}: connect: {e}", t.index),
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
                poll.registry(),
                event,
                &mut flows,
                &mut buf,
                &opts,
            );
        }
    }

    for mut flow in flows.drain(poll.registry()) {
        note_close_hook(slave_for_hook(t), flow.hook_fd, AddrInfoView::default());
        let _ = flow.socket.shutdown(std::net::Shutdown::Both);
    }
}

pub fn run_server(t: &mut WorkerThread) {
    let mut opts = (*t.opts).clone();
    opts.configure_for_role(false);
    let n_flows_cap = flows_in_thread(opts.num_flows, opts.num_threads, t.index);

    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => return error!("thread {}: Poll::new: {e}", t.index),
    };
    let mut stop_rx = t.stop_rx.take().expect("stop_rx already taken");
    if let Err(e) = add_lite(poll.registry(), &mut stop_rx, STOP_TOKEN) {
        return error!("thread {}: stop pipe: {e}", t.index);
    }

    let mut listener = match listener_for(&opts, t.index) {
        Ok(l) => l,
        Err(e) => return error!("thread {}: listen: {e}", t.index),
    };
    if let Err(e) = poll
        .registry()
        .register(&mut listener, crate::worker::LISTENER_TOKEN, Interest::READABLE)
    {
        return error!("thread {}: registering listener: {e}", t.index);
    }

    let interest = interest_for(&opts);
    let mut flows = FlowRegistry::<TcpStream>::new(FIRST_FLOW_TOKEN);
    let mut next_flow_id = (t.index as u64) << 32;

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
            if event.token() == crate::worker::LISTENER_TOKEN {
                if flows.len() >= n_flows_cap.max(1) * 64 {
                    // Unbounded accept would let one thread hoard
                    // connections meant for others; generous cap, not a
                    // hard spec requirement.
                    continue;
                }
                loop {
                    match listener.accept() {
                        Ok((mut stream, peer)) => {
                            let fd = stream.as_raw_fd();
                            let hook_fd = match run_open_hook(
                                slave_for_hook(t),
                                fd,
                                AddrInfoView { peer: Some(peer), local: None },
                            ) {
                                Ok(over) => over.unwrap_or(fd),
                                Err(e) => {
                                    warn!("thread {}: server_socket hook: {e}", t.index);
                                    fd
                                }
                            };
                            let interval = Interval::new(opts.interval_duration(), now());
                            let mut flow = Flow::new(stream, next_flow_id, t.index, interval, fd);
                            flow.hook_fd = hook_fd;
                            next_flow_id += 1;
                            if let Err(e) = flows.add(poll.registry(), flow, interest) {
                                warn!("thread {}: registering accepted flow: {e}", t.index);
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!("thread {}: accept: {e}", t.index);
                            break;
                        }
                    }
                }
                continue;
            }
            process_one(
                t.index,
                &mut t.samples,
                &t.time_start,
                slave_for_hook(t),
                poll.registry(),
                event,
                &mut flows,
                &mut buf,
                &opts,
            );
        }
    }

    for mut flow in flows.drain(poll.registry()) {
        note_close_hook(slave_for_hook(t), flow.hook_fd, AddrInfoView::default());
        let _ = flow.socket.shutdown(std::net::Shutdown::Both);
    }
    let _ = poll.registry().deregister(&mut listener);
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

/// Per-flow readiness handling: read/write/RDHUP/error-queue drain.
/// Direct port of `process_events`'s per-event body in `tcp_stream.c`.
///
/// Takes the thread's fields individually (index/samples/time_start)
/// rather than `&mut WorkerThread`, so the caller's `&mut t.script_slave`
/// borrow for `slave` can coexist with `&mut t.samples` here — they are
/// disjoint fields of the same struct, but only direct field borrows let
/// the compiler see that; a single `&mut WorkerThread` parameter would
/// force them to alias.
#[allow(clippy::too_many_arguments)]
fn process_one(
    tid: usize,
    samples: &mut Vec<Sample>,
    time_start: &DataStart,
    mut slave: Option<&mut ScriptSlave>,
    registry: &mio::Registry,
    event: &mio::event::Event,
    flows: &mut FlowRegistry<TcpStream>,
    buf: &mut [u8],
    opts: &crate::options::Options,
) {
    let token = event.token();

    if event.is_read_closed() || event.is_write_closed() {
        if let Some(mut flow) = flows.remove(registry, token) {
            note_close_hook(slave, flow.hook_fd, AddrInfoView::default());
            let _ = flow.socket.shutdown(std::net::Shutdown::Both);
        }
        return;
    }

    if opts.enable_read && event.is_readable() {
        loop {
            let Some(flow) = flows.get_mut(token) else { return };
            match flow.socket.read(buf) {
                Ok(0) => {
                    if let Some(mut flow) = flows.remove(registry, token) {
                        note_close_hook(slave, flow.hook_fd, AddrInfoView::default());
                        let _ = flow.socket.shutdown(std::net::Shutdown::Both);
                    }
                    return;
                }
                Ok(n) => {
                    mark_data_started(time_start);
                    let hook_fd = flow.hook_fd;
                    match note_recvmsg(slave.as_deref_mut(), hook_fd, n) {
                        // Hook reports this read shouldn't count (spec.md
                        // §4.6 "overriding a byte count"); treat it like the
                        // read never landed and stop draining this event.
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
                    warn!("thread {tid}: read: {e}");
                    break;
                }
            }
        }
    }

    if opts.enable_write && event.is_writable() {
        loop {
            let Some(flow) = flows.get_mut(token) else { return };
            match flow.socket.write(buf) {
                Ok(n) => {
                    let hook_fd = flow.hook_fd;
                    if let Some(v) = note_sendmsg(slave.as_deref_mut(), hook_fd, n) {
                        if v < 0 {
                            // Hook forced an error/would-block outcome for
                            // this write; skip the delay and stop draining.
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
                    warn!("thread {tid}: write: {e}");
                    break;
                }
            }
        }
    }

    // Error queue (spec.md §4.8 "drain the error queue with a recv hook;
    // EAGAIN continues"), independent of the readable/writable branches
    // above — mirrors `tcp_stream.c`'s standalone `EPOLLERR` check.
    if event.is_error() {
        if let Some(flow) = flows.get_mut(token) {
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
}

fn note_close_hook(slave: Option<&mut ScriptSlave>, fd: i32, ai: AddrInfoView) {
    match run_close_hook(slave, fd, ai) {
        Ok(_) => {}
        Err(e) => warn!("close hook: {e}"),
    }
}

/// Calls the recv hook with the real read's byte count and forwards its
/// return value (spec.md §4.6: "a hook that returns a number is forwarded
/// to the caller... overriding a byte count"). `None` means no hook ran or
/// it failed softly — the caller should keep the real count.
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

    /// A connected client/server pair of `mio::net::TcpStream`s over
    /// loopback, accepted from a dedicated blocking `std` listener thread
    /// (mirrors `tests/tcp.rs`'s `connect` test in the pack this crate was
    /// built from).
    fn loopback_pair() -> (TcpStream, TcpStream) {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || std_listener.accept().unwrap().0);

        let std_client = std::net::TcpStream::connect(addr).unwrap();
        let std_server = handle.join().unwrap();
        std_client.set_nonblocking(true).unwrap();
        std_server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(std_client), TcpStream::from_std(std_server))
    }

    fn base_opts() -> Options {
        let mut opts = Options::parse_from(["rushit"]);
        opts.enable_read = true;
        opts.enable_write = false;
        opts.edge_trigger = false;
        opts
    }

    /// Registers `server` as the only flow in a fresh registry and polls
    /// until it becomes readable, returning everything `process_one` needs.
    fn one_flow_readable(
        server: TcpStream,
        poll: &mut Poll,
    ) -> (FlowRegistry<TcpStream>, Events) {
        let opts = base_opts();
        let fd = server.as_raw_fd();
        let interval = Interval::new(opts.interval_duration(), now());
        let flow = Flow::new(server, 1, 0, interval, fd);
        let mut flows = FlowRegistry::<TcpStream>::new(FIRST_FLOW_TOKEN);
        flows.add(poll.registry(), flow, Interest::READABLE).unwrap();

        let mut events = Events::with_capacity(8);
        loop {
            poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
            if events.iter().any(|e| e.is_readable()) {
                break;
            }
        }
        (flows, events)
    }

    /// A `client_recvmsg` hook that returns a fixed override must replace
    /// the real read's byte count in `flow.bytes_read`, not just run
    /// alongside it (spec.md §4.6 "overriding a byte count").
    #[test]
    fn recvmsg_hook_override_replaces_accounted_byte_count() {
        let (mut client, server) = loopback_pair();
        client.write_all(b"hello world").unwrap();

        let engine = ScriptEngine::new(RunMode::Client).unwrap();
        engine
            .run_string("client_recvmsg(function(fd, len, flags) return 999 end)\nrun()", || {})
            .unwrap();
        let mut slave = ScriptSlave::new(&engine).unwrap();

        let mut poll = Poll::new().unwrap();
        let (mut flows, events) = one_flow_readable(server, &mut poll);
        let event = events.iter().find(|e| e.is_readable()).unwrap();

        let opts = base_opts();
        let mut samples = Vec::new();
        let time_start = DataStart::new();
        let mut buf = vec![0u8; 64];
        process_one(
            0,
            &mut samples,
            &time_start,
            Some(&mut slave),
            poll.registry(),
            event,
            &mut flows,
            &mut buf,
            &opts,
        );

        let flow = flows.get(Token(FIRST_FLOW_TOKEN)).unwrap();
        assert_eq!(flow.bytes_read, 999);
        assert!(time_start.get().is_some(), "a real byte arrived, so time_start must be marked");
    }

    /// With no hook registered, the real read's byte count is what gets
    /// accounted — the override path must not fire on its own.
    #[test]
    fn no_hook_means_real_byte_count_is_accounted() {
        let (mut client, server) = loopback_pair();
        client.write_all(b"hello world").unwrap();

        let mut poll = Poll::new().unwrap();
        let (mut flows, events) = one_flow_readable(server, &mut poll);
        let event = events.iter().find(|e| e.is_readable()).unwrap();

        let opts = base_opts();
        let mut samples = Vec::new();
        let time_start = DataStart::new();
        let mut buf = vec![0u8; 64];
        process_one(
            0, &mut samples, &time_start, None, poll.registry(), event, &mut flows, &mut buf, &opts,
        );

        let flow = flows.get(Token(FIRST_FLOW_TOKEN)).unwrap();
        assert_eq!(flow.bytes_read, "hello world".len() as u64);
    }

    #[test]
    fn recverr_hook_override_is_forwarded() {
        let engine = ScriptEngine::new(RunMode::Client).unwrap();
        engine
            .run_string("client_recverr(function(fd, len, flags) return 7 end)\nrun()", || {})
            .unwrap();
        let mut slave = ScriptSlave::new(&engine).unwrap();
        assert_eq!(note_recverr(Some(&mut slave), 3, 0), Some(7));
    }

    #[test]
    fn recverr_with_no_hook_returns_none() {
        assert_eq!(note_recverr(None, 3, 0), None);
    }
}
