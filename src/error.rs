//! Error types for the harness.
//!
//! The original tool returns negative `errno`-like integers across module
//! boundaries (`-EHOOKEMPTY`, `-ENOMEM`, ...). Here each boundary gets its
//! own small enum instead, but the same distinction between fatal and
//! "use the default path" outcomes is preserved.

use std::io;

use thiserror::Error;

/// Raised by [`crate::options::Options::validate`] when a precondition from
/// `check_options()` in the original `*_main.c` files is violated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("test length must be at least 1 second")]
    TestLengthTooShort,
    #[error("number of readiness events per wait() call must be positive")]
    NonPositiveMaxEvents,
    #[error("there must be at least 1 thread")]
    NoThreads,
    #[error("there should not be fewer flows than threads")]
    FewerFlowsThanThreads,
    #[error("buffer size must be positive")]
    NonPositiveBufferSize,
    #[error("interval must be positive")]
    NonPositiveInterval,
    #[error("local_host may only be set for clients")]
    LocalHostOnClientOnly,
    #[error("listen backlog ({requested}) cannot exceed somaxconn ({max})")]
    BacklogExceedsSomaxconn { requested: i32, max: i32 },
}

/// Outcome of invoking a script hook. Mirrors `enum script_hook_error`
/// (`EHOOK*`) from the original `script.h`.
///
/// `HookEmpty` and `HookRetval` are soft: callers treat them as "fall back
/// to the default path", not as failures that abort the run.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("no hook registered for this slot")]
    HookEmpty,
    #[error("hook did not return a number")]
    HookRetval,
    #[error("hook runtime error: {0}")]
    HookRun(String),
    #[error("hook syntax error: {0}")]
    HookSyntax(String),
    #[error("hook memory allocation error: {0}")]
    HookMem(String),
    #[error("hook error handler error: {0}")]
    HookErr(String),
    #[error("unsupported Lua value crossed the serialization boundary: {0}")]
    UnsupportedType(&'static str),
}

impl ScriptError {
    /// True for the two outcomes that mean "use the default path", as
    /// opposed to a genuine script fault.
    pub fn is_soft(&self) -> bool {
        matches!(self, ScriptError::HookEmpty | ScriptError::HookRetval)
    }
}

#[cfg(feature = "script")]
impl From<mlua::Error> for ScriptError {
    fn from(err: mlua::Error) -> Self {
        use mlua::Error as E;
        match err {
            E::SyntaxError { message, .. } => ScriptError::HookSyntax(message),
            E::MemoryError(msg) => ScriptError::HookMem(msg),
            E::RuntimeError(msg) => ScriptError::HookRun(msg),
            other => ScriptError::HookErr(other.to_string()),
        }
    }
}

/// Errors raised while driving the control-plane handshake.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("control frame had an unexpected length: got {0} bytes")]
    ShortFrame(usize),
    #[error("control-plane secret mismatch")]
    SecretMismatch,
}

/// Top-level error for a full coordinator run, wrapping whichever
/// module-boundary error actually fired.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[cfg(feature = "script")]
    #[error(transparent)]
    Script(#[from] ScriptError),
}
