//! `rushit-tcp-stream`: TCP throughput workload entry point.
//!
//! Thin shell around [`rushit::coordinator::Coordinator`]; all the actual
//! work lives in `workloads::tcp_stream` and `coordinator.rs`.

use clap::Parser;

use rushit::coordinator::Coordinator;
use rushit::options::Options;
use rushit::workloads::tcp_stream::{run_client, run_server};

fn main() {
    let opts = Options::parse();
    rushit::logging::init(opts.verbose);

    if let Err(e) = opts.validate() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let coordinator = Coordinator::new(opts);
    match coordinator.run(run_client, run_server) {
        Ok(report) => {
            if report.control_plane_incidents > 0 {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
