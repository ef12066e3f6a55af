//! Capture of a worker's stderr according to the function's stderr policy.

use std::collections::VecDeque;
use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::descriptor::StderrPolicy;

/// Bytes kept for a `Throw` policy error message.
pub const THROW_CAPTURE_LIMIT: usize = 64 * 1024;

/// Which part of the stderr stream a diagnostic holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// Everything the worker wrote.
    Full,
    /// The first bytes; the tail was truncated.
    Head,
    /// The last bytes; the head was truncated.
    Tail,
}

/// Captured stderr of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StderrDiagnostic {
    pub kind: CaptureKind,
    /// Captured text, lossily decoded as UTF-8.
    pub text: String,
    /// Bytes kept from the stream.
    pub captured_bytes: usize,
    /// Bytes the worker wrote in total.
    pub total_bytes: usize,
}

impl StderrDiagnostic {
    pub fn truncated_bytes(&self) -> usize {
        self.total_bytes - self.captured_bytes
    }
}

impl fmt::Display for StderrDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CaptureKind::Full => f.write_str(&self.text),
            CaptureKind::Head => write!(
                f,
                "{}...<{} bytes truncated>",
                self.text,
                self.truncated_bytes()
            ),
            CaptureKind::Tail => write!(
                f,
                "<{} bytes truncated>...{}",
                self.truncated_bytes(),
                self.text
            ),
        }
    }
}

/// Accumulates stderr bytes, keeping only what the policy needs.
#[derive(Debug)]
pub struct StderrCapture {
    policy: StderrPolicy,
    head: Vec<u8>,
    tail: VecDeque<u8>,
    total: usize,
}

impl StderrCapture {
    pub fn new(policy: StderrPolicy) -> Self {
        Self {
            policy,
            head: Vec::new(),
            tail: VecDeque::new(),
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len();
        match self.policy {
            StderrPolicy::Ignore => {}
            StderrPolicy::Throw => keep_head(&mut self.head, chunk, THROW_CAPTURE_LIMIT),
            StderrPolicy::LogFirst(limit) => keep_head(&mut self.head, chunk, limit),
            StderrPolicy::LogLast(limit) => {
                self.tail.extend(chunk);
                let excess = self.tail.len().saturating_sub(limit);
                self.tail.drain(..excess);
            }
        }
    }

    /// Total bytes seen so far.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Take what was captured and reset for the next call.
    ///
    /// Returns `None` when the worker wrote nothing or the policy ignores
    /// stderr.
    pub fn take(&mut self) -> Option<StderrDiagnostic> {
        let total = std::mem::take(&mut self.total);
        let head = std::mem::take(&mut self.head);
        let tail: Vec<u8> = std::mem::take(&mut self.tail).into();
        if total == 0 || self.policy == StderrPolicy::Ignore {
            return None;
        }

        let (bytes, truncated_kind) = match self.policy {
            StderrPolicy::LogLast(_) => (tail, CaptureKind::Tail),
            _ => (head, CaptureKind::Head),
        };
        let kind = if bytes.len() < total {
            truncated_kind
        } else {
            CaptureKind::Full
        };
        Some(StderrDiagnostic {
            kind,
            text: String::from_utf8_lossy(&bytes).into_owned(),
            captured_bytes: bytes.len(),
            total_bytes: total,
        })
    }
}

fn keep_head(head: &mut Vec<u8>, chunk: &[u8], limit: usize) {
    let room = limit.saturating_sub(head.len());
    head.extend_from_slice(&chunk[..room.min(chunk.len())]);
}

/// Read `reader` to end-of-file into `capture`.
pub async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    capture: &mut StderrCapture,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        capture.push(&buf[..n]);
    }
}
