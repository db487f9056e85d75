//! Supervises a subject program for integration tests.
//!
//! The subject is spawned in its own process group with stdout and stderr
//! drained on background tasks. A run ends when the subject exits, when a
//! sentinel file appears, or when the deadline passes. Whatever is still
//! running is then stopped with SIGTERM and, after a grace period, SIGKILL.
//! The result is reported as an exit code plus captured output.

pub mod command;
pub mod config;
pub mod control;
pub mod detector;
pub mod drain;
pub mod reports;
pub mod supervisor;
pub mod terminate;

pub use command::Command;
pub use control::{Controller, Platform};
pub use detector::{DeadlineSpec, Outcome, SUCCESS_CODE, TIMEOUT_CODE, UNKNOWN_EXIT_CODE};
pub use supervisor::{
    run, run_to_completion, run_until_signaled, run_until_signaled_or, RunError, RunResult,
};
