//! The thread coordinator: the one place that knows how to stand up a
//! whole run — control plane, script engine, worker threads, and the
//! teardown/reporting sequence that follows.
//!
//! Ports `run_main_thread`/`create_worker_threads`/`start_worker_threads`/
//! `stop_worker_threads`/`run_worker_threads`/`report_rusage` from
//! `thread.c`. `Coordinator::run` is generic over the workload: each
//! binary (`tcp_stream`, `udp_stream`, `dummy_test`) hands it a pair of
//! `fn(&mut WorkerThread)` entry points rather than this module knowing
//! about sockets at all.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::control_plane::{ControlFrame, ControlPlane};
use crate::error::RunError;
use crate::options::{AddressFamily, Options};
use crate::sample::Sample;
use crate::stats::StreamStats;
use crate::thread::{self, DataStart, WorkerThread};

#[cfg(feature = "script")]
use crate::script::engine::{RunMode, ScriptEngine};
#[cfg(feature = "script")]
use crate::script::slave::ScriptSlave;

/// What a finished worker hands back to the coordinator, mirroring the
/// pieces of `struct thread` that outlive the worker itself.
struct WorkerOutput {
    samples: Vec<Sample>,
    #[cfg(feature = "script")]
    script_slave: ScriptSlave,
}

/// Everything `start_worker_threads` produces once the barrier is
/// released, handed back out of the "run()" closure (see
/// [`Coordinator::run`]'s `run_func`).
struct SpawnResult {
    stop_txs: Vec<mio::unix::pipe::Sender>,
    handles: Vec<JoinHandle<WorkerOutput>>,
}

/// Outcome of a full run, ready for a binary's `main` to print or exit on.
pub struct RunReport {
    pub stats: StreamStats,
    pub control_plane_incidents: u32,
}

/// Owns nothing but the parsed options; every other piece of run state is
/// local to a single [`Coordinator::run`] call (spec.md §4.9's "created by
/// the coordinator, destroyed after join" lifetime).
pub struct Coordinator {
    opts: Arc<Options>,
}

impl Coordinator {
    pub fn new(opts: Options) -> Self {
        Coordinator {
            opts: Arc::new(opts),
        }
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Runs one full client or server session end to end, per spec.md's
    /// `run_main_thread` narrative: rusage interval creation, master
    /// engine creation, control plane handshake, barrier setup, per-worker
    /// thread construction (CPU-pinned if requested), the test-length
    /// wait, stop signaling, join, stats reporting, and collector pull.
    pub fn run(
        &self,
        client_workload: fn(&mut WorkerThread),
        server_workload: fn(&mut WorkerThread),
    ) -> Result<RunReport, RunError> {
        let opts = self.opts.clone();
        opts.validate()?;

        if opts.num_threads > num_cpus::get() {
            warn!(
                "running {} worker threads on a machine with {} logical CPUs",
                opts.num_threads,
                num_cpus::get()
            );
        }

        if opts.dry_run {
            info!("dry run: configuration accepted, not starting a session");
            return Ok(RunReport {
                stats: StreamStats {
                    num_samples: 0,
                    throughput_bytes_per_second: 0.0,
                    correlation_coefficient: 0.0,
                    end_time: Duration::ZERO,
                },
                control_plane_incidents: 0,
            });
        }

        if opts.suicide_length > 0 {
            spawn_suicide_timeout(Duration::from_secs(opts.suicide_length));
        }

        let addrs = if opts.client {
            opts.resolve_host()?
        } else {
            vec![SocketAddr::new(unspecified_ip(opts.address_family()), opts.port)]
        };

        let control_plane = Arc::new(ControlPlane::new());
        let frame = ControlFrame {
            magic: opts.magic,
            num_flows: opts.num_flows as u32,
            test_length: opts.test_length as u32,
            buffer_size: opts.buffer_size as u32,
            request_size: opts.request_size as u32,
            response_size: opts.response_size as u32,
            interval_nsec: opts.interval_duration().as_nanos() as u64,
        };

        if opts.client {
            let control_addr = SocketAddr::new(addrs[0].ip(), opts.control_port);
            info!("control plane: connecting to {control_addr}");
            control_plane.connect_handshake(control_addr, frame)?;
        } else {
            let listener = TcpListener::bind((addrs[0].ip(), opts.control_port))?;
            info!("control plane: listening on {}", listener.local_addr()?);
            control_plane.accept_handshake(&listener, opts.magic)?;
        }

        #[cfg(feature = "script")]
        let engine: Option<Arc<ScriptEngine>> = {
            let run_mode = if opts.client { RunMode::Client } else { RunMode::Server };
            Some(Arc::new(ScriptEngine::new(run_mode)?))
        };

        let ready = Arc::new(Barrier::new(opts.num_threads + 1));
        let time_start = DataStart::new();

        let cpu_list = if opts.pin_cpu {
            match cpu_cores_from_proc() {
                Ok(cores) if !cores.is_empty() => cores,
                Ok(_) => {
                    warn!("CPU pinning requested but /proc/cpuinfo listed no usable cores");
                    Vec::new()
                }
                Err(e) => {
                    warn!("CPU pinning requested but /proc/cpuinfo could not be read: {e}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let spawn_result: Arc<Mutex<Option<SpawnResult>>> = Arc::new(Mutex::new(None));

        let run_func = {
            let spawn_result = spawn_result.clone();
            let addrs = addrs.clone();
            let opts = opts.clone();
            let ready = ready.clone();
            let time_start = time_start.clone();
            let cpu_list = cpu_list.clone();
            #[cfg(feature = "script")]
            let engine = engine.clone();
            let is_client = opts.client;

            move || {
                let mut stop_txs = Vec::with_capacity(opts.num_threads);
                let mut handles = Vec::with_capacity(opts.num_threads);

                for i in 0..opts.num_threads {
                    let (stop_tx, stop_rx) = match mio::unix::pipe::new() {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("thread {i}: stop pipe: {e}");
                            continue;
                        }
                    };

                    #[cfg(feature = "script")]
                    let slave = match ScriptSlave::new(engine.as_ref().unwrap()) {
                        Ok(s) => s,
                        Err(e) => {
                            error!("thread {i}: building script slave: {e}");
                            continue;
                        }
                    };

                    let wt = WorkerThread::new(
                        i,
                        addrs.clone(),
                        stop_rx,
                        opts.clone(),
                        ready.clone(),
                        time_start.clone(),
                        #[cfg(feature = "script")]
                        slave,
                    );

                    let cpu = if cpu_list.is_empty() {
                        None
                    } else {
                        Some(cpu_list[i % cpu_list.len()])
                    };

                    let spawned = std::thread::Builder::new()
                        .name(format!("rushit-worker-{i}"))
                        .spawn(move || {
                            if let Some(cpu) = cpu {
                                pin_current_thread(cpu);
                            }
                            let mut wt = wt;
                            if is_client {
                                client_workload(&mut wt);
                            } else {
                                server_workload(&mut wt);
                            }
                            WorkerOutput {
                                samples: wt.samples,
                                #[cfg(feature = "script")]
                                script_slave: wt.script_slave,
                            }
                        });

                    match spawned {
                        Ok(handle) => {
                            stop_txs.push(stop_tx);
                            handles.push(handle);
                        }
                        Err(e) => error!("thread {i}: spawn: {e}"),
                    }
                }

                ready.wait();
                *spawn_result.lock().unwrap() = Some(SpawnResult { stop_txs, handles });
            }
        };

        #[cfg(feature = "script")]
        {
            if let Some(path) = &opts.script {
                let engine = engine.as_ref().unwrap();
                engine.run_file(path, run_func)?;
            } else {
                run_func();
            }
        }
        #[cfg(not(feature = "script"))]
        {
            run_func();
        }

        let SpawnResult { mut stop_txs, handles } = spawn_result
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| {
                RunError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no worker threads were started (script never called run())",
                ))
            })?;

        let rusage_start = rusage_snapshot();
        let wall_start = Instant::now();
        control_plane.wait_until_done(&time_start, Duration::from_secs(opts.test_length));
        let elapsed = wall_start.elapsed();
        let rusage_end = rusage_snapshot();
        let time_to_first_byte = time_start.get().map(|t| t.saturating_duration_since(wall_start));

        for stop_tx in stop_txs.iter_mut() {
            if let Err(e) = thread::signal_stop(stop_tx) {
                warn!("signaling worker to stop: {e}");
            }
        }

        let mut thread_samples = Vec::with_capacity(handles.len());
        #[cfg(feature = "script")]
        let mut slaves = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(out) => {
                    thread_samples.push(out.samples);
                    #[cfg(feature = "script")]
                    slaves.push(out.script_slave);
                }
                Err(_) => {
                    error!("a worker thread panicked");
                    thread_samples.push(Vec::new());
                }
            }
        }

        let stats = crate::stats::aggregate(&thread_samples);
        if let Some(path) = &opts.all_samples {
            if let Err(e) = crate::stats::dump_all_samples(path, &thread_samples) {
                warn!("writing sample CSV to {}: {e}", path.display());
            }
        }
        crate::stats::print_report(&stats, control_plane.incidents());
        print_rusage_report(rusage_start, rusage_end, elapsed, opts.num_threads, time_to_first_byte);

        #[cfg(feature = "script")]
        if let Some(engine) = &engine {
            for id in engine.collector_ids() {
                for slave in &slaves {
                    match slave.collected_value(&id) {
                        Ok(Some(value)) => {
                            if let Err(e) = engine.append_collected(&id, &value) {
                                warn!("appending collected value for {id}: {e}");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("reading collected value for {id}: {e}"),
                    }
                }
                match engine.collector_values(&id) {
                    Ok(values) => info!("collector {id}: {} value(s) collected", values.len()),
                    Err(e) => warn!("reading back collector {id}: {e}"),
                }
            }
        }

        Ok(RunReport {
            stats,
            control_plane_incidents: control_plane.incidents(),
        })
    }
}

fn unspecified_ip(family: AddressFamily) -> std::net::IpAddr {
    match family {
        AddressFamily::Ipv6 => std::net::IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        _ => std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
}

/// `-s`/`--suicide-length`: a detached watchdog that kills the whole
/// process if a run hangs past its expected length (spec.md §6, added
/// item; ported from `create_suicide_timeout` in `udp_stream_main.c`).
fn spawn_suicide_timeout(length: Duration) {
    std::thread::spawn(move || {
        std::thread::sleep(length);
        error!("suicide timeout of {length:?} elapsed; aborting");
        std::process::exit(1);
    });
}

/// A `getrusage(2)` snapshot, diffed across a run for [`print_rusage_report`].
/// Mirrors `struct rusage_interval`'s two endpoints (spec.md §3).
#[derive(Debug, Clone, Copy, Default)]
struct RusageSnapshot {
    user: Duration,
    system: Duration,
}

fn rusage_snapshot() -> RusageSnapshot {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if ret != 0 {
        warn!("getrusage: {}", std::io::Error::last_os_error());
        return RusageSnapshot::default();
    }
    RusageSnapshot {
        user: Duration::new(usage.ru_utime.tv_sec as u64, (usage.ru_utime.tv_usec as u32) * 1000),
        system: Duration::new(usage.ru_stime.tv_sec as u64, (usage.ru_stime.tv_usec as u32) * 1000),
    }
}

/// Ports `report_rusage()`: CPU time consumed by the whole process over
/// the run, as a fraction of the wall-clock capacity available across all
/// worker threads, plus the time from the rusage snapshot to the first
/// observed data byte (`report_rusage()` prints `time_start` explicitly;
/// here that's the wall-clock offset rather than a raw timespec, since
/// `Instant` carries no epoch to print directly).
fn print_rusage_report(
    start: RusageSnapshot,
    end: RusageSnapshot,
    elapsed: Duration,
    num_threads: usize,
    time_to_first_byte: Option<Duration>,
) {
    let user_s = (end.user.as_secs_f64() - start.user.as_secs_f64()).max(0.0);
    let sys_s = (end.system.as_secs_f64() - start.system.as_secs_f64()).max(0.0);
    let capacity = elapsed.as_secs_f64() * num_threads.max(1) as f64;
    let (user_pct, sys_pct) = if capacity > 0.0 {
        (user_s / capacity * 100.0, sys_s / capacity * 100.0)
    } else {
        (0.0, 0.0)
    };
    println!("utime_s={user_s:.3}");
    println!("stime_s={sys_s:.3}");
    println!("utime_percent={user_pct:.2}");
    println!("stime_percent={sys_pct:.2}");
    match time_to_first_byte {
        Some(d) => println!("time_start_s={:.6}", d.as_secs_f64()),
        None => println!("time_start_s=nan"),
    }
}

/// Reads `/proc/cpuinfo`, grouping logical processors by `(physical id,
/// core id)` and keeping the first processor seen for each physical core
/// — the same grouping `get_cpuinfo`/`get_cpuset` in `thread.c` build,
/// so pinning spreads workers across cores rather than hyperthread
/// siblings of the same core.
#[cfg(target_os = "linux")]
fn cpu_cores_from_proc() -> std::io::Result<Vec<usize>> {
    use std::collections::HashSet;

    let text = std::fs::read_to_string("/proc/cpuinfo")?;
    let mut seen = HashSet::new();
    let mut cores = Vec::new();

    let mut processor: Option<usize> = None;
    let mut physical_id: Option<usize> = None;
    let mut core_id: Option<usize> = None;

    for line in text.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if let (Some(p), Some(phys), Some(core)) = (processor, physical_id, core_id) {
                if seen.insert((phys, core)) {
                    cores.push(p);
                }
            }
            processor = None;
            physical_id = None;
            core_id = None;
            continue;
        }
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match key.trim() {
            "processor" => processor = value.parse().ok(),
            "physical id" => physical_id = value.parse().ok(),
            "core id" => core_id = value.parse().ok(),
            _ => {}
        }
    }

    Ok(cores)
}

#[cfg(not(target_os = "linux"))]
fn cpu_cores_from_proc() -> std::io::Result<Vec<usize>> {
    Ok(Vec::new())
}

/// Pins the calling thread to `cpu` via `sched_setaffinity`. Called from
/// inside each spawned worker, mirroring the original pinning its own
/// thread right after `pthread_create` returns.
#[cfg(target_os = "linux")]
fn pin_current_thread(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!("sched_setaffinity(cpu={cpu}): {}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(_cpu: usize) {}
