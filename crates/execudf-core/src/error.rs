//! Error types for execudf-core.

use std::time::Duration;

use thiserror::Error;

/// Result type for execudf-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while invoking an executable function.
///
/// Every variant is surfaced to the calling query; nothing here is retried
/// behind the caller's back.
#[derive(Debug, Error)]
pub enum Error {
    /// A blocking step (write, read, wait, pool acquisition) ran out of time.
    #[error("executable timed out after {}ms while {stage}", timeout.as_millis())]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },

    /// The worker exited with a non-zero code.
    #[error("Child process was exited with return code {0}")]
    NonZeroExit(i32),

    /// The worker was terminated by a signal before reporting an exit code.
    #[error("Child process was terminated by signal {0}")]
    Signalled(i32),

    /// The worker wrote to stderr and the function throws on stderr.
    ///
    /// Carries at most the first [`THROW_CAPTURE_LIMIT`] bytes, followed by a
    /// truncation marker when the worker wrote more.
    ///
    /// [`THROW_CAPTURE_LIMIT`]: crate::process::THROW_CAPTURE_LIMIT
    #[error("Executable generates stderr: {0}")]
    StderrProduced(String),

    /// Malformed data on the worker's stdout, or an unencodable input row.
    #[error("format error: {0}")]
    Format(String),

    /// The worker returned a different number of rows than it was sent.
    #[error("row count mismatch: sent {expected} rows, executable returned {actual}")]
    RowCountMismatch { expected: usize, actual: usize },

    /// Parameters of a parametrized function do not match its declaration.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// The worker process could not be started.
    #[error("failed to spawn executable: {0}")]
    Spawn(String),

    /// The query uses a non-deterministic function under the `throw` policy.
    #[error(
        "query result cannot be cached: function '{function}' is non-deterministic; \
         set nondeterministic_function_handling to 'save' or 'ignore' to cache or skip caching"
    )]
    CacheDeterminism { function: String },

    /// The function's process pool has been shut down.
    #[error("process pool for function '{0}' is shut down")]
    PoolClosed(String),

    /// Invalid descriptor or function catalog.
    #[error("configuration error: {0}")]
    Config(String),

    /// Pipe or process IO failure that is not a timeout.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`Error`], for callers that branch on the
/// failure kind rather than the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Timeout,
    NonZeroExit,
    Signalled,
    StderrProduced,
    FormatError,
    RowCountMismatch,
    ParameterError,
    ProcessSpawnError,
    CacheDeterminismError,
    PoolClosed,
    ConfigError,
    Io,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::NonZeroExit(_) => FailureKind::NonZeroExit,
            Self::Signalled(_) => FailureKind::Signalled,
            Self::StderrProduced(_) => FailureKind::StderrProduced,
            Self::Format(_) => FailureKind::FormatError,
            Self::RowCountMismatch { .. } => FailureKind::RowCountMismatch,
            Self::Parameter(_) => FailureKind::ParameterError,
            Self::Spawn(_) => FailureKind::ProcessSpawnError,
            Self::CacheDeterminism { .. } => FailureKind::CacheDeterminismError,
            Self::PoolClosed(_) => FailureKind::PoolClosed,
            Self::Config(_) => FailureKind::ConfigError,
            Self::Io(_) => FailureKind::Io,
        }
    }

    pub(crate) fn timeout(stage: &'static str, timeout: Duration) -> Self {
        Self::Timeout { stage, timeout }
    }
}
