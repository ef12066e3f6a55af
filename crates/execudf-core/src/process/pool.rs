//! A fixed-size pool of long-lived workers for one function.
//!
//! Members are spawned lazily by the acquisition that finds no idle member,
//! or eagerly by [`ProcessPool::warm_up`]. A permit from a fair semaphore is
//! held for as long as a member is checked out, so waiters are served in
//! arrival order. Each member is bound to the command line it was spawned
//! with; different parameter bindings of one function share the pool's
//! `pool_size` slots, and a binding that needs a slot while the pool is full
//! evicts the oldest idle member. Members that fail in a way that may have
//! desynchronized their pipes are retired.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStderr;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::descriptor::FunctionDescriptor;
use crate::error::{Error, Result};
use crate::format::{RowCodec, chunk};
use crate::types::RowBatch;

use super::command::CommandLine;
use super::handle::{ProcessHandle, check_exit};
use super::stderr::{self, StderrCapture};
use super::{Deadline, Exchange};

/// How long a member that broke its output stream gets to report an exit
/// status.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub size: usize,
    /// Members currently alive or being spawned, idle or checked out.
    pub live: usize,
    pub idle: usize,
    pub checked_out: usize,
    /// Highest `checked_out` seen since the pool was created.
    pub peak_checked_out: usize,
    pub spawned: usize,
    pub retired: usize,
}

struct PooledProcess {
    handle: ProcessHandle,
    command: CommandLine,
    stderr: ChildStderr,
    capture: StderrCapture,
}

pub struct ProcessPool {
    function: Arc<FunctionDescriptor>,
    permits: Arc<Semaphore>,
    /// Oldest first.
    idle: Mutex<Vec<PooledProcess>>,
    /// Slots taken by live members and by spawns in progress.
    live: AtomicUsize,
    closed: AtomicBool,
    checked_out: AtomicUsize,
    peak_checked_out: AtomicUsize,
    spawned: AtomicUsize,
    retired: AtomicUsize,
}

impl ProcessPool {
    pub fn new(function: Arc<FunctionDescriptor>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(function.pool_size)),
            function,
            idle: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            checked_out: AtomicUsize::new(0),
            peak_checked_out: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
        }
    }

    pub fn function(&self) -> &FunctionDescriptor {
        &self.function
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.function.pool_size,
            live: self.live.load(Ordering::SeqCst),
            idle: self.idle().len(),
            checked_out: self.checked_out.load(Ordering::SeqCst),
            peak_checked_out: self.peak_checked_out.load(Ordering::SeqCst),
            spawned: self.spawned.load(Ordering::SeqCst),
            retired: self.retired.load(Ordering::SeqCst),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<PooledProcess>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a member running `command`, waiting for one to become free.
    pub async fn acquire(
        self: &Arc<Self>,
        command: &CommandLine,
        deadline: &Deadline,
    ) -> Result<PoolLease> {
        if self.is_closed() {
            return Err(Error::PoolClosed(self.function.name.clone()));
        }

        let permit = deadline
            .run("waiting for a free process in the pool", async {
                self.permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::PoolClosed(self.function.name.clone()))
            })
            .await?;

        let now = self.checked_out.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_checked_out.fetch_max(now, Ordering::SeqCst);
        let mut lease = PoolLease {
            pool: Arc::clone(self),
            process: None,
            _permit: permit,
        };

        loop {
            let candidate = self.take_idle(command);
            let Some(mut process) = candidate else {
                break;
            };
            if process.handle.is_alive() {
                lease.process = Some(process);
                return Ok(lease);
            }
            self.retire(process, "exited while idle").await;
        }

        lease.process = Some(self.spawn_member(command).await?);
        Ok(lease)
    }

    /// Send one batch to a member running `command` and read its result
    /// batch.
    ///
    /// The member is returned to the pool when the exchange left its pipes
    /// in a known state, and retired otherwise.
    pub async fn invoke(
        self: &Arc<Self>,
        command: &CommandLine,
        input: &RowBatch,
        deadline: &Deadline,
    ) -> Result<Exchange> {
        let mut lease = self.acquire(command, deadline).await?;
        match lease.exchange(input, deadline).await {
            Ok(exchange) => {
                let reusable = exchange.exit.is_ok()
                    && lease.is_alive()
                    && match &exchange.rows {
                        Ok(rows) => rows.len() == input.len(),
                        Err(Error::Format(_)) => !self.function.retire_on_format_error,
                        Err(_) => false,
                    };
                if reusable {
                    lease.release();
                } else {
                    lease.retire("call failed").await;
                }
                Ok(exchange)
            }
            Err(e) => {
                lease.retire(&e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Spawn members running `command` into the free slots. Returns how
    /// many were spawned.
    pub async fn warm_up(&self, command: &CommandLine) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::PoolClosed(self.function.name.clone()));
        }
        let mut spawned = 0;
        while self.reserve_slot() {
            let process = self.start_member(command)?;
            self.idle().push(process);
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Close the pool: fail pending and future acquisitions, terminate idle
    /// members, and retire checked-out members when they come back.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        let members = std::mem::take(&mut *self.idle());
        for process in members {
            self.retire(process, "pool shut down").await;
        }
        tracing::debug!(function = %self.function.name, "process pool shut down");
    }

    /// Most recently used idle member running `command`.
    fn take_idle(&self, command: &CommandLine) -> Option<PooledProcess> {
        let mut idle = self.idle();
        let index = idle.iter().rposition(|p| &p.command == command)?;
        Some(idle.remove(index))
    }

    fn reserve_slot(&self) -> bool {
        let size = self.function.pool_size;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < size).then_some(n + 1))
            .is_ok()
    }

    /// Spawn a member for a caller that holds a permit.
    ///
    /// When every slot is taken, at least one member is idle, since the
    /// caller's permit is not backing a checked-out member yet.
    async fn spawn_member(&self, command: &CommandLine) -> Result<PooledProcess> {
        while !self.reserve_slot() {
            let oldest = {
                let mut idle = self.idle();
                (!idle.is_empty()).then(|| idle.remove(0))
            };
            match oldest {
                Some(process) => {
                    self.retire(process, "evicted for another parameter binding")
                        .await;
                }
                // A concurrent spawn has reserved a slot but not pooled its member yet.
                None => tokio::task::yield_now().await,
            }
        }
        self.start_member(command)
    }

    /// Spawn into a slot that is already reserved.
    fn start_member(&self, command: &CommandLine) -> Result<PooledProcess> {
        let spawned = ProcessHandle::spawn(command, self.function.termination_timeout())
            .and_then(|mut handle| {
                let stderr = handle.take_stderr()?;
                Ok((handle, stderr))
            });
        let (handle, stderr) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.spawned.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            function = %self.function.name,
            pid = handle.pid(),
            command = %command.display(),
            "spawned pool member"
        );
        Ok(PooledProcess {
            handle,
            command: command.clone(),
            stderr,
            capture: StderrCapture::new(self.function.stderr_policy),
        })
    }

    fn put_back(&self, mut process: PooledProcess) {
        if self.is_closed() || !process.handle.is_alive() {
            self.retire_detached(process);
            return;
        }
        self.idle().push(process);
    }

    async fn retire(&self, mut process: PooledProcess, reason: &str) {
        self.retired.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            function = %self.function.name,
            pid = process.handle.pid(),
            "retiring pool member: {}",
            reason
        );
        terminate_member(&mut process).await;
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    /// Retire without awaiting, for paths that cannot await.
    fn retire_detached(&self, mut process: PooledProcess) {
        self.retired.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { terminate_member(&mut process).await });
            }
            // Dropping the handle kills the process group.
            Err(_) => drop(process),
        }
    }
}

async fn terminate_member(process: &mut PooledProcess) {
    if let Err(e) = process.handle.terminate().await {
        tracing::warn!(
            pid = process.handle.pid(),
            "failed to terminate pool member: {}",
            e
        );
    }
}

/// Move whatever `pipe` already holds into `capture`, without waiting for
/// more. Tokio keeps child pipes non-blocking, so the first read that would
/// block ends the loop.
fn drain_ready(pipe: &ChildStderr, capture: &mut StderrCapture) {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;

        let fd = pipe.as_raw_fd();
        let mut buf = [0u8; 8192];
        loop {
            // SAFETY: `fd` stays open while `pipe` is borrowed, and `buf` is
            // valid for `buf.len()` bytes.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                capture.push(&buf[..n as usize]);
                continue;
            }
            if n < 0 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted
            {
                continue;
            }
            return;
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pipe, capture);
    }
}

/// Exclusive use of one pool member.
///
/// A lease dropped without [`release`](Self::release) retires its member.
pub struct PoolLease {
    pool: Arc<ProcessPool>,
    process: Option<PooledProcess>,
    // Released after the member is back in the idle set.
    _permit: OwnedSemaphorePermit,
}

impl PoolLease {
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.handle.pid())
    }

    pub fn is_alive(&mut self) -> bool {
        self.process
            .as_mut()
            .is_some_and(|p| p.handle.is_alive())
    }

    /// Write one encoded batch and read one batch back.
    ///
    /// Stdin stays open. The output batch is delimited by its chunk header,
    /// or by the input row count when headers are off. Stderr written before
    /// the batch completes belongs to this call.
    pub async fn exchange(&mut self, input: &RowBatch, deadline: &Deadline) -> Result<Exchange> {
        let function = Arc::clone(&self.pool.function);
        let codec = RowCodec::new(&function);
        let payload = codec.encode(input, function.send_chunk_header)?;
        let PooledProcess {
            handle,
            stderr: pipe,
            capture,
            ..
        } = self
            .process
            .as_mut()
            .ok_or_else(|| Error::PoolClosed(function.name.clone()))?;

        let streamed = {
            let (stdin, stdout) = handle.pipes()?;
            let write = async {
                stdin.write_all(&payload).await?;
                stdin.flush().await?;
                Ok::<_, Error>(())
            };
            let read = async {
                if function.send_chunk_header {
                    chunk::read_frame(stdout).await
                } else {
                    chunk::read_lines(stdout, input.len()).await
                }
            };
            let batch = deadline.run("exchanging rows with pooled executable", async {
                tokio::try_join!(write, read)
            });
            tokio::pin!(batch);

            // Keep the stderr pipe from filling up while the batch is in flight.
            let mut buf = vec![0u8; 8192];
            let mut stderr_open = true;
            loop {
                tokio::select! {
                    biased;
                    result = &mut batch => break result,
                    read = pipe.read(&mut buf), if stderr_open => match read {
                        Ok(0) | Err(_) => stderr_open = false,
                        Ok(n) => capture.push(&buf[..n]),
                    },
                }
            }
        };

        let (rows, exit) = match streamed {
            Ok(((), output)) => (codec.decode(&output), Ok(())),
            Err(e @ Error::Timeout { .. }) => return Err(e),
            Err(e) => {
                // The stream broke; the worker has most likely exited.
                match tokio::time::timeout(EXIT_GRACE, handle.wait()).await {
                    Ok(Ok(status)) => {
                        let _ = tokio::time::timeout(EXIT_GRACE, stderr::drain(&mut *pipe, capture))
                            .await;
                        (Err(e), check_exit(status, function.on_nonzero_exit))
                    }
                    _ => (Err(e), Ok(())),
                }
            }
        };

        // Stderr the worker wrote before its last stdout byte is in the pipe by now.
        drain_ready(pipe, capture);
        let stderr = capture.take();

        Ok(Exchange { rows, exit, stderr })
    }

    /// Return the member to the pool.
    pub fn release(mut self) {
        if let Some(process) = self.process.take() {
            self.pool.put_back(process);
        }
    }

    /// Terminate the member; the pool replaces it on a later acquisition.
    pub async fn retire(mut self, reason: &str) {
        if let Some(process) = self.process.take() {
            self.pool.retire(process, reason).await;
        }
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            self.pool.retire_detached(process);
        }
        self.pool.checked_out.fetch_sub(1, Ordering::SeqCst);
    }
}
