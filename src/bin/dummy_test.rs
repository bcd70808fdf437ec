//! `rushit-dummy-test`: exercises thread/barrier/stop-signal wiring with no
//! sockets involved, for sanity-checking a build or a script file.

use clap::Parser;

use rushit::coordinator::Coordinator;
use rushit::options::Options;
use rushit::workloads::dummy_test::run;

fn main() {
    let opts = Options::parse();
    rushit::logging::init(opts.verbose);

    if let Err(e) = opts.validate() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let coordinator = Coordinator::new(opts);
    match coordinator.run(run, run) {
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
