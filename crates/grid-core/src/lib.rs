//! Shared core for the compute grid front door.
//!
//! This crate holds everything the admission-and-scheduling path needs independent of the
//! transport: identity token validation and role derivation, the task model, the priority
//! scheduler with aging/retry/backoff, the dispatch circuit breaker, and the executor registry.
//!
//! # API notes
//! `grid-core` is an internal crate (`publish = false`). Its public API uses a few third-party
//! types (`chrono::DateTime<Utc>`, `serde_json::Value`) as part of the grid contract.

use std::fmt;

pub mod auth;
pub mod breaker;
pub mod executor;
pub mod role;
pub mod scheduler;
pub mod task;

pub use role::{Principal, Role};
pub use task::{Priority, TaskId, TaskResult, TaskState};

pub type Result<T> = std::result::Result<T, Error>;

/// Setup-time error (config load, registry build, key source construction).
///
/// Per-call failures use the typed errors in [`auth::AuthError`] and
/// [`scheduler::SchedulerError`] instead.
#[derive(Debug)]
pub struct Error {
    inner: anyhow::Error,
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: anyhow::anyhow!(message.into()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self { inner: value }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Self {
            inner: anyhow::Error::from(value),
        }
    }
}
