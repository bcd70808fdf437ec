//! Handshake behavior of `ControlPlane`: a secret mismatch is rejected and
//! counted as an incident without tearing down the listener, and a correct
//! handshake flips both sides to `Active`.

use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use rushit::control_plane::{ControlFrame, ControlPlane, State};
use rushit::thread::DataStart;

fn frame(magic: u32) -> ControlFrame {
    ControlFrame {
        magic,
        num_flows: 1,
        test_length: 10,
        buffer_size: 4096,
        request_size: 0,
        response_size: 0,
        interval_nsec: 0,
    }
}

#[test]
fn rejects_bad_secret_then_accepts_good_one() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ControlPlane::new();

    let accepted = thread::scope(|scope| {
        let server_ref = &server;
        let handle = scope.spawn(move || server_ref.accept_handshake(&listener, 0xC0FFEE));

        let client = ControlPlane::new();
        let bad = client.connect_handshake(addr, frame(0xBAD));
        assert!(bad.is_err());

        let good = client.connect_handshake(addr, frame(0xC0FFEE));
        assert!(good.is_ok());
        assert_eq!(client.state(), State::Active);

        handle.join().unwrap()
    });

    let accepted = accepted.expect("handshake with the correct secret must be accepted");
    assert_eq!(accepted.magic, 0xC0FFEE);
    assert_eq!(accepted.num_flows, 1);
    assert_eq!(server.state(), State::Active);
    assert_eq!(server.incidents(), 1);
}

#[test]
fn frame_round_trips_through_bytes() {
    let f = frame(0x1234_5678);
    let bytes = f.to_bytes();
    let back = ControlFrame::from_bytes(&bytes).unwrap();
    assert_eq!(f, back);
}

#[test]
fn short_frame_is_rejected() {
    let err = ControlFrame::from_bytes(&[0u8; 4]);
    assert!(err.is_err());
}

/// The deadline must run from the instant the first data byte is observed,
/// not from the call to `wait_until_done` — a late-arriving first byte
/// should push the total wait out by the delay before it arrived.
#[test]
fn wait_until_done_arms_deadline_from_first_byte_not_from_call() {
    let control_plane = ControlPlane::new();
    let data_start = DataStart::new();
    let test_length = Duration::from_millis(200);
    let setup_delay = Duration::from_millis(150);

    let data_start_for_marker = data_start.clone();
    thread::spawn(move || {
        std::thread::sleep(setup_delay);
        data_start_for_marker.mark();
    });

    let began = Instant::now();
    control_plane.wait_until_done(&data_start, test_length);
    let total = began.elapsed();

    assert_eq!(control_plane.state(), State::Done);
    assert!(
        total >= setup_delay + test_length,
        "expected total wait >= {:?}, got {:?}",
        setup_delay + test_length,
        total
    );
}

/// If no data byte ever arrives, the run still ends after `test_length`
/// rather than hanging forever.
#[test]
fn wait_until_done_gives_up_if_no_byte_ever_arrives() {
    let control_plane = ControlPlane::new();
    let data_start = DataStart::new();
    let test_length = Duration::from_millis(100);

    let began = Instant::now();
    control_plane.wait_until_done(&data_start, test_length);
    let total = began.elapsed();

    assert_eq!(control_plane.state(), State::Done);
    assert!(total >= test_length);
    assert!(total < test_length * 3);
}
