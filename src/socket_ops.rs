//! Socket operation vtable (spec.md §4.7).
//!
//! Ports `struct socket_ops` from `workload.h` and the `tcp_socket_ops`/
//! `udp_socket_ops` instances. Every operation but `open` is optional in
//! the original ("absent means no-op, return success"); here that's a
//! default trait method instead of a null function pointer.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::trace;

use crate::error::ScriptError;
use crate::options::{AddressFamily, Options};
#[cfg(feature = "script")]
use crate::script::slave::ScriptSlave;

/// Stand-in so hook-composition signatures stay the same shape whether or
/// not the `script` feature is enabled. Never actually constructed: with
/// the feature off, callers always pass `None`.
#[cfg(not(feature = "script"))]
pub struct ScriptSlave;

#[cfg(not(feature = "script"))]
impl ScriptSlave {
    pub fn socket_hook(&mut self, _fd: i32, _ai: AddrInfoView) -> Result<i32, ScriptError> {
        Err(ScriptError::HookEmpty)
    }

    pub fn close_hook(&mut self, _fd: i32, _ai: AddrInfoView) -> Result<i32, ScriptError> {
        Err(ScriptError::HookEmpty)
    }
}

/// A lightweight stand-in for the original's `struct addrinfo *` as passed
/// to socket-lifecycle hooks. See SPEC_FULL.md §9 ("Foreign-pointer cast
/// replacement") for why this is a safe view rather than a raw pointer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddrInfoView {
    pub local: Option<SocketAddr>,
    pub peer: Option<SocketAddr>,
}

/// Socket-lifecycle and datagram operations shared by TCP and UDP
/// workloads. `open` is the only operation every implementation must
/// provide; the rest default to a no-op success, matching spec.md §4.7.
pub trait SocketOps: Send + Sync {
    /// Creates the raw (not yet bound/connected) socket for this protocol.
    fn open(&self, family: AddressFamily) -> std::io::Result<Socket>;

    /// Applies run-time socket options (`SO_REUSEPORT`, `SO_REUSEADDR`,
    /// non-blocking mode, ...). Default: non-blocking only.
    fn configure(&self, sock: &Socket, _opts: &Options) -> std::io::Result<()> {
        sock.set_nonblocking(true)
    }

    fn bind(&self, sock: &Socket, addr: SocketAddr) -> std::io::Result<()> {
        sock.bind(&addr.into())
    }

    fn listen(&self, _sock: &Socket, _backlog: i32) -> std::io::Result<()> {
        Ok(())
    }

    fn connect(&self, sock: &Socket, addr: SocketAddr) -> std::io::Result<()> {
        match sock.connect(&addr.into()) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// True if this protocol has a listen/accept lifecycle (TCP); false
    /// for connectionless protocols whose "flows" are pre-bound sockets
    /// (UDP) — see SPEC_FULL.md's note on `udp_stream.c` having no accept
    /// path at all.
    fn has_accept(&self) -> bool;
}

pub struct TcpOps;
pub struct UdpOps;

impl SocketOps for TcpOps {
    fn open(&self, family: AddressFamily) -> std::io::Result<Socket> {
        let domain = domain_for(family);
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
    }

    fn configure(&self, sock: &Socket, opts: &Options) -> std::io::Result<()> {
        sock.set_reuse_address(true)?;
        #[cfg(unix)]
        {
            let _ = opts;
        }
        sock.set_nonblocking(true)
    }

    fn listen(&self, sock: &Socket, backlog: i32) -> std::io::Result<()> {
        sock.listen(backlog)
    }

    fn has_accept(&self) -> bool {
        true
    }
}

impl SocketOps for UdpOps {
    fn open(&self, family: AddressFamily) -> std::io::Result<Socket> {
        let domain = domain_for(family);
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
    }

    fn configure(&self, sock: &Socket, opts: &Options) -> std::io::Result<()> {
        if opts.reuseport {
            sock.set_reuse_port(true)?;
        }
        sock.set_reuse_address(true)?;
        sock.set_nonblocking(true)
    }

    fn has_accept(&self) -> bool {
        false
    }
}

fn domain_for(family: AddressFamily) -> Domain {
    match family {
        AddressFamily::Ipv6 => Domain::IPV6,
        _ => Domain::IPV4,
    }
}

/// Composes `ops.open()`/caller-supplied bind+connect with the socket
/// lifecycle hook, mirroring `do_socket_open()`: the hook runs after the fd
/// exists, and `EHOOKEMPTY`/`EHOOKRETVAL` are both treated as success
/// (spec.md §4.7). A hook that returns a number is forwarded as `Some(n)`
/// for the caller to use as that flow's fd override (spec.md §4.6
/// "overriding a file descriptor") — never discarded.
pub fn run_open_hook(
    slave: Option<&mut ScriptSlave>,
    fd: impl AsRawFd,
    ai: AddrInfoView,
) -> Result<Option<i32>, ScriptError> {
    let Some(slave) = slave else {
        return Ok(None);
    };
    match slave.socket_hook(fd.as_raw_fd(), ai) {
        Ok(n) => Ok(Some(n)),
        Err(e) if e.is_soft() => {
            trace!("socket hook: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Composes the pre-close hook with the actual close, mirroring
/// `do_socket_close()`. The hook's return value is forwarded the same way
/// `run_open_hook`'s is, for callers that want it; a flow tearing down has
/// no further hook call to apply an fd override to, so most callers ignore
/// the `Some` case but still see a hard `Err` rather than have it silently
/// swallowed.
pub fn run_close_hook(
    slave: Option<&mut ScriptSlave>,
    fd: impl AsRawFd,
    ai: AddrInfoView,
) -> Result<Option<i32>, ScriptError> {
    let Some(slave) = slave else {
        return Ok(None);
    };
    match slave.close_hook(fd.as_raw_fd(), ai) {
        Ok(n) => Ok(Some(n)),
        Err(e) if e.is_soft() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Drains one datagram from `fd`'s socket error queue (`MSG_ERRQUEUE`),
/// mirroring `do_readerr`'s use of the same flag to pull a queued error
/// without touching the normal read path. `ErrorKind::WouldBlock` means
/// nothing is queued (spec.md §4.8 "`EAGAIN` continues").
pub fn drain_error_queue(fd: i32, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_ERRQUEUE,
        )
    };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn drain_error_queue_on_idle_socket_is_would_block() {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        sock.set_nonblocking(true).unwrap();
        sock.bind(&SocketAddr::from(([127, 0, 0, 1], 0)).into()).unwrap();
        let mut buf = [0u8; 128];
        let err = drain_error_queue(sock.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
