//! Worker processes: spawning, stderr capture, single-shot calls and pools.
//!
//! Every call is bounded twice: each blocking step by the function's
//! `command_timeout`, and the call as a whole by its
//! `max_command_execution_time`. [`Deadline`] carries both.

mod command;
mod handle;
mod pool;
mod single_shot;
mod stderr;

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::descriptor::FunctionDescriptor;
use crate::error::{Error, Result};
use crate::types::RowBatch;

pub use command::{CommandLine, SHELL};
pub use handle::{ProcessHandle, check_exit};
pub use pool::{PoolLease, PoolStats, ProcessPool};
pub use single_shot::run_single_shot;
pub use stderr::{CaptureKind, StderrCapture, StderrDiagnostic, THROW_CAPTURE_LIMIT};

/// Time budget of one call.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    step: Duration,
    end: Instant,
}

impl Deadline {
    /// A budget of `step` per blocking step and `total` for the call,
    /// starting now.
    pub fn new(step: Duration, total: Duration) -> Self {
        Self {
            step,
            end: Instant::now() + total,
        }
    }

    pub fn for_function(descriptor: &FunctionDescriptor) -> Self {
        Self::new(descriptor.command_timeout(), descriptor.max_execution_time())
    }

    /// Time left for the next step.
    pub fn remaining(&self) -> Duration {
        self.step
            .min(self.end.saturating_duration_since(Instant::now()))
    }

    /// Run one blocking step, failing with [`Error::Timeout`] when it does
    /// not finish within the remaining budget.
    pub async fn run<F, T>(&self, stage: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let budget = self.remaining();
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(stage, budget)),
        }
    }
}

/// Raw outcome of one exchange with a worker, before policies are applied.
#[derive(Debug)]
pub struct Exchange {
    /// Decoded result rows, or why they could not be decoded.
    pub rows: Result<RowBatch>,
    /// Exit check under the function's exit policy. Pooled workers that stay
    /// alive report `Ok`.
    pub exit: Result<()>,
    pub stderr: Option<StderrDiagnostic>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_step_bound() {
        let deadline = Deadline::new(Duration::from_millis(50), Duration::from_secs(10));
        assert!(deadline.remaining() <= Duration::from_millis(50));

        let err = deadline
            .run("reading stdout", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                stage: "reading stdout",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_deadline_total_bound() {
        let deadline = Deadline::new(Duration::from_secs(10), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(deadline.remaining(), Duration::ZERO);
        let result = deadline.run("waiting", async { Ok(1) }).await;
        // A ready future still completes with a zero budget.
        assert_eq!(result.unwrap(), 1);
    }
}
