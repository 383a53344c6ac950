//! Typed error hierarchy and exit-code mapping.
//!
//! Three enums cover the three failure surfaces:
//! - `SessionError` — session lookup and auto-detection (exit 3)
//! - `PipelineError` — bad prescription/strategy arguments (exit 2)
//! - `GuardError` — guard refusals: breaker tripped or lock held (exit 4)
//!
//! Everything else surfaces as a plain `anyhow` error and exits 1.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Cannot find session '{0}'. Use 'slimline list' to see available sessions.")]
    NotFound(String),

    #[error("Session prefix '{0}' matches more than one session")]
    AmbiguousPrefix(String),

    #[error("Could not auto-detect the current session. Run from a project directory with an active session, or pass a session id.")]
    NoCurrentSession,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown prescription '{0}'. Options: gentle, standard, aggressive")]
    UnknownPrescription(String),

    #[error("Unknown strategy '{0}'. Use 'slimline formulary' to list strategies.")]
    UnknownStrategy(String),

    #[error("Unknown thinking mode '{0}'. Options: remove, truncate, signature-only")]
    UnknownThinkingMode(String),
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Another guard is already running for this session (PID {pid})")]
    LockHeld { pid: u32 },

    #[error("Circuit breaker tripped: {events} prunes within {window_secs}s. Observing only; manual intervention required.")]
    BreakerTripped { events: usize, window_secs: u64 },
}

/// Exit codes: 0 success, 1 generic failure, 2 bad argument, 3 session not
/// found, 4 guard refused.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<PipelineError>().is_some() {
            return 2;
        }
        if cause.downcast_ref::<SessionError>().is_some() {
            return 3;
        }
        if cause.downcast_ref::<GuardError>().is_some() {
            return 4;
        }
    }
    1
}
