//! Client/server handshake that gates the start of the data plane
//! (spec.md §4.10, §6 "Control frame").
//!
//! Runs over a plain blocking `TcpStream`, a single short-lived connection
//! predating worker startup — never multiplexed through a worker's `Poll`.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::ControlPlaneError;
use crate::thread::DataStart;

/// States: WAITING → ACTIVE → DONE. The only backward transition is
/// WAITING→WAITING via a rejected handshake (spec.md §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Waiting,
    Active,
    Done,
}

/// The fixed parameter frame exchanged during the handshake (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame {
    pub magic: u32,
    pub num_flows: u32,
    pub test_length: u32,
    pub buffer_size: u32,
    pub request_size: u32,
    pub response_size: u32,
    pub interval_nsec: u64,
}

impl ControlFrame {
    pub const LEN: usize = 4 * 6 + 8;

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.num_flows.to_le_bytes());
        buf[8..12].copy_from_slice(&self.test_length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.buffer_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.request_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.response_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.interval_nsec.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ControlPlaneError> {
        if buf.len() != Self::LEN {
            return Err(ControlPlaneError::ShortFrame(buf.len()));
        }
        let u32_at = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        Ok(ControlFrame {
            magic: u32_at(0),
            num_flows: u32_at(4),
            test_length: u32_at(8),
            buffer_size: u32_at(12),
            request_size: u32_at(16),
            response_size: u32_at(20),
            interval_nsec: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        })
    }
}

/// Drives the handshake and tracks run state plus the rejected-handshake
/// incident counter (spec.md §4.10, §6 item 5).
pub struct ControlPlane {
    state: Mutex<State>,
    incidents: AtomicU32,
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlane {
    pub fn new() -> Self {
        ControlPlane {
            state: Mutex::new(State::Waiting),
            incidents: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    pub fn incidents(&self) -> u32 {
        self.incidents.load(Ordering::SeqCst)
    }

    /// Server side: accepts connections on `listener` until one presents
    /// the expected `magic`, echoes the frame back, and transitions to
    /// `Active`. Connections with a mismatched secret increment the
    /// incident counter and are dropped without aborting the listener.
    pub fn accept_handshake(
        &self,
        listener: &TcpListener,
        magic: u32,
    ) -> Result<ControlFrame, ControlPlaneError> {
        loop {
            let (mut stream, peer) = listener.accept()?;
            let mut buf = [0u8; ControlFrame::LEN];
            if let Err(e) = stream.read_exact(&mut buf) {
                warn!("control plane: short read from {peer}: {e}");
                continue;
            }
            let frame = match ControlFrame::from_bytes(&buf) {
                Ok(f) => f,
                Err(e) => {
                    warn!("control plane: malformed frame from {peer}: {e}");
                    self.incidents.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
            };
            if frame.magic != magic {
                warn!("control plane: secret mismatch from {peer}");
                self.incidents.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            stream.write_all(&frame.to_bytes())?;
            *self.state.lock().unwrap() = State::Active;
            info!("control plane: handshake accepted from {peer}");
            return Ok(frame);
        }
    }

    /// Client side: connects to `addr`, sends `frame`, and expects it
    /// echoed back unmodified.
    pub fn connect_handshake(
        &self,
        addr: SocketAddr,
        frame: ControlFrame,
    ) -> Result<(), ControlPlaneError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(&frame.to_bytes())?;
        let mut buf = [0u8; ControlFrame::LEN];
        stream.read_exact(&mut buf)?;
        let echoed = ControlFrame::from_bytes(&buf)?;
        if echoed.magic != frame.magic {
            self.incidents.fetch_add(1, Ordering::SeqCst);
            return Err(ControlPlaneError::SecretMismatch);
        }
        *self.state.lock().unwrap() = State::Active;
        Ok(())
    }

    /// Blocks until `test_length` has elapsed since the instant `data_start`
    /// first observed a data byte, then moves to `Done` (spec.md §4.10
    /// point 3: "arm a deadline of `test_length` seconds from the instant
    /// the first data byte is observed", not from this call or the
    /// `Active` transition — connection setup latency on either side would
    /// otherwise shift the window). If no byte is ever observed within
    /// `test_length` of being called, the run is treated as done anyway
    /// rather than hanging forever.
    pub fn wait_until_done(&self, data_start: &DataStart, test_length: Duration) {
        match data_start.wait(test_length) {
            Some(start) => {
                let elapsed = start.elapsed();
                if elapsed < test_length {
                    std::thread::sleep(test_length - elapsed);
                }
            }
            None => warn!("control plane: test length elapsed with no data byte ever observed"),
        }
        *self.state.lock().unwrap() = State::Done;
    }

    pub fn mark_done(&self) {
        *self.state.lock().unwrap() = State::Done;
    }
}
