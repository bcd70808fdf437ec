//! Run-time options shared by every workload binary.
//!
//! Ports the flag tables of `dummy_test_main.c` / `udp_stream_main.c`
//! (`DEFINE_FLAG(...)`) onto a `clap` derive struct, and `check_options()`
//! onto [`Options::validate`].

use std::net::ToSocketAddrs;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

/// Address family preference, mirroring `-4`/`-6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Unspecified,
    Ipv4,
    Ipv6,
}

/// Shared command-line surface (spec.md "External Interfaces", §6).
#[derive(Debug, Clone, Parser)]
#[command(author, version, about)]
pub struct Options {
    /// Run as client (else server).
    #[arg(short = 'c', long)]
    pub client: bool,

    /// Force IPv4.
    #[arg(short = '4', long = "ipv4")]
    pub ipv4: bool,

    /// Force IPv6.
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,

    /// Server hostname/address.
    #[arg(short = 'H', long = "host")]
    pub host: Option<String>,

    /// Client-side source address (clients only).
    #[arg(short = 'L', long = "local-host")]
    pub local_host: Option<String>,

    /// Control-plane port.
    #[arg(short = 'C', long = "control-port", default_value_t = 12866)]
    pub control_port: u16,

    /// Data port.
    #[arg(short = 'P', long = "port", default_value_t = 12867)]
    pub port: u16,

    /// Worker threads per side.
    #[arg(short = 'T', long = "num-threads", default_value_t = 1)]
    pub num_threads: usize,

    /// Total flows (clients only).
    #[arg(short = 'F', long = "num-flows", default_value_t = 1)]
    pub num_flows: usize,

    /// Test length in seconds.
    #[arg(short = 'l', long = "test-length", default_value_t = 10)]
    pub test_length: u64,

    /// Per-I/O buffer size.
    #[arg(short = 'B', long = "buffer-size", default_value_t = 16384)]
    pub buffer_size: usize,

    /// Sampling period, in seconds.
    #[arg(short = 'I', long = "interval", default_value_t = 1.0)]
    pub interval: f64,

    /// Edge-triggered readiness.
    #[arg(short = 'E', long = "edge-trigger")]
    pub edge_trigger: bool,

    /// Pin workers to CPU cores.
    #[arg(short = 'U', long = "pin-cpu")]
    pub pin_cpu: bool,

    /// Readiness batch size.
    #[arg(long = "maxevents", default_value_t = 1000)]
    pub maxevents: usize,

    /// listen() backlog.
    #[arg(long = "listen-backlog", default_value_t = 128)]
    pub listen_backlog: i32,

    /// Use a 10ms loop timeout instead of blocking indefinitely.
    #[arg(long = "nonblocking")]
    pub nonblocking: bool,

    /// Control-plane shared secret.
    #[arg(long = "magic", default_value_t = 42)]
    pub magic: u32,

    /// Dump every sample to this CSV path.
    #[arg(short = 'A', long = "all-samples")]
    pub all_samples: Option<std::path::PathBuf>,

    /// Self-abort after this many seconds (0 disables).
    #[arg(short = 's', long = "suicide-length", default_value_t = 0)]
    pub suicide_length: u64,

    /// Lua script file to load.
    #[arg(long = "script")]
    pub script: Option<std::path::PathBuf>,

    /// Request size, for workloads that distinguish it from buffer_size.
    #[arg(long = "request-size", default_value_t = 0)]
    pub request_size: usize,

    /// Response size, for workloads that distinguish it from buffer_size.
    #[arg(long = "response-size", default_value_t = 0)]
    pub response_size: usize,

    /// Per-write delay, in nanoseconds.
    #[arg(long = "delay", default_value_t = 0)]
    pub delay: u64,

    /// UDP: bind every thread to the same port via SO_REUSEPORT.
    #[arg(long = "reuseport")]
    pub reuseport: bool,

    /// Print precondition failures but exit before running.
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Verbose (debug-level) logging.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    #[arg(skip)]
    pub enable_read: bool,
    #[arg(skip)]
    pub enable_write: bool,
}

impl Options {
    pub fn address_family(&self) -> AddressFamily {
        match (self.ipv4, self.ipv6) {
            (true, false) => AddressFamily::Ipv4,
            (false, true) => AddressFamily::Ipv6,
            _ => AddressFamily::Unspecified,
        }
    }

    /// Port actually used for flows in thread `tid`, honoring `reuseport`
    /// (UDP without `SO_REUSEPORT` spreads threads across consecutive
    /// ports, matching `udp_stream.c`'s `port_off`).
    pub fn data_port_for_thread(&self, tid: usize) -> u16 {
        if self.reuseport {
            self.port
        } else {
            self.port + tid as u16
        }
    }

    /// Ports `check_options()` from `dummy_test_main.c`/`udp_stream_main.c`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.test_length < 1 {
            return Err(ConfigError::TestLengthTooShort);
        }
        if self.maxevents < 1 {
            return Err(ConfigError::NonPositiveMaxEvents);
        }
        if self.num_threads < 1 {
            return Err(ConfigError::NoThreads);
        }
        if self.client && self.num_flows < self.num_threads {
            return Err(ConfigError::FewerFlowsThanThreads);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::NonPositiveBufferSize);
        }
        if self.interval <= 0.0 {
            return Err(ConfigError::NonPositiveInterval);
        }
        if !self.client && self.local_host.is_some() {
            return Err(ConfigError::LocalHostOnClientOnly);
        }
        let max_backlog = somaxconn();
        if self.listen_backlog > max_backlog {
            return Err(ConfigError::BacklogExceedsSomaxconn {
                requested: self.listen_backlog,
                max: max_backlog,
            });
        }
        Ok(())
    }

    /// Buffer size actually allocated for I/O, per `buf_alloc()` in
    /// `workload.c`: the largest of request/response/buffer size, capped to
    /// `buffer_size`.
    pub fn io_buffer_size(&self) -> usize {
        let mut size = self.request_size.max(self.response_size);
        if size == 0 || size > self.buffer_size {
            size = self.buffer_size;
        }
        size
    }

    pub fn resolve_host(&self) -> std::io::Result<Vec<std::net::SocketAddr>> {
        let host = self.host.as_deref().unwrap_or("0.0.0.0");
        Ok((host, self.port).to_socket_addrs()?.collect())
    }

    /// Sampling period as a `Duration`, from the `-I`/`--interval` seconds
    /// float (spec.md §3 "Interval", §6 `-I`).
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    /// Picks which directions a flow drives, per side. Stream workloads in
    /// this crate run full-duplex on both sides rather than reproducing
    /// the original's unidirectional client-writes/server-reads split —
    /// recorded as an explicit Open Question resolution in DESIGN.md,
    /// since nothing in spec.md's invariants depends on direction.
    pub fn configure_for_role(&mut self, _is_client: bool) {
        self.enable_read = true;
        self.enable_write = true;
    }
}

/// Reads `/proc/sys/net/core/somaxconn`, mirroring `procfile_int()` +
/// `PROCFILE_SOMAXCONN` from `common.h`. Falls back to a conservative
/// default if the file cannot be read (non-Linux, containerized, etc.).
fn somaxconn() -> i32 {
    std::fs::read_to_string("/proc/sys/net/core/somaxconn")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(128)
}
