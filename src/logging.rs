//! Structured logging setup.
//!
//! Replaces `logging.h`'s `logging_init`/`logging_exit`/`PLOG_FATAL`/
//! `LOG_ERROR` macros with `tracing`. `PRINT()` calls in the original (the
//! tool's actual stats output, not a log line) stay as plain `println!` at
//! the call sites in `stats.rs`/`coordinator.rs` — that distinction is
//! intentional, see SPEC_FULL.md §7.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. Call once from `main()`.
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
