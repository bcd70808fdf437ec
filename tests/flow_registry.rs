//! `FlowRegistry` must deregister a flow's source before handing its
//! ownership back, so a flow removed in response to one readiness event
//! cannot generate another.

use std::io::Write;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use mio::unix::pipe;
use mio::{Events, Interest, Poll, Token};

use rushit::flow::{Flow, FlowRegistry};
use rushit::interval::Interval;

#[test]
fn removed_flow_stops_generating_readiness_events() {
    let mut poll = Poll::new().unwrap();
    let (mut sender, receiver) = pipe::new().unwrap();

    let mut registry: FlowRegistry<pipe::Receiver> = FlowRegistry::new(1);
    let fd = receiver.as_raw_fd();
    let flow = Flow::new(
        receiver,
        1,
        0,
        Interval::new(Duration::from_secs(1), Instant::now()),
        fd,
    );
    let token = registry
        .add(poll.registry(), flow, Interest::READABLE)
        .unwrap();

    sender.write_all(b"x").unwrap();

    let mut events = Events::with_capacity(8);
    poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
    assert!(events.iter().any(|e| e.token() == token));

    let removed = registry.remove(poll.registry(), token);
    assert!(removed.is_some());
    assert!(registry.get(token).is_none());

    sender.write_all(b"y").unwrap();
    let mut events2 = Events::with_capacity(8);
    poll.poll(&mut events2, Some(Duration::from_millis(200)))
        .unwrap();
    assert!(!events2.iter().any(|e| e.token() == token));
}

#[test]
fn lite_registration_does_not_allocate_a_flow() {
    let mut poll = Poll::new().unwrap();
    let (mut sender, mut receiver) = pipe::new().unwrap();
    let stop_token = Token(0);

    rushit::flow::add_lite(poll.registry(), &mut receiver, stop_token).unwrap();
    sender.write_all(b"stop").unwrap();

    let mut events = Events::with_capacity(8);
    poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
    assert!(events.iter().any(|e| e.token() == stop_token));
}
