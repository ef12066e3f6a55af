//! A spawned worker process and its three pipes.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::descriptor::ExitCodePolicy;
use crate::error::{Error, Result};

use super::command::CommandLine;

/// Handle to one worker process.
///
/// All pipes are created by the spawn itself, before the worker runs any
/// code. Dropping a live handle kills the worker's whole process group.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr: Option<ChildStderr>,
    termination_timeout: Duration,
    /// Set once the process has been reaped.
    exited: bool,
    /// Set once nothing is left running in the process group.
    group_cleared: bool,
}

impl ProcessHandle {
    /// Spawn a worker for `command`.
    pub fn spawn(command: &CommandLine, termination_timeout: Duration) -> Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }
        // Own process group, so termination reaches the worker's children too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Spawn(format!("'{}': {}", command.program.display(), e))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Spawn("worker exited before it could be tracked".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("failed to get worker stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Spawn("failed to get worker stderr".to_string()))?;

        tracing::debug!(pid, command = %command.display(), "spawned executable");

        Ok(Self {
            child,
            pid,
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout)),
            stderr: Some(stderr),
            termination_timeout,
            exited: false,
            group_cleared: false,
        })
    }

    /// Process ID of the worker.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn stdin(&mut self) -> Result<&mut ChildStdin> {
        self.stdin
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::other("worker stdin already closed")))
    }

    /// Take the input pipe; dropping it signals end-of-input to the worker.
    pub fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.stdin
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("worker stdin already closed")))
    }

    pub fn stdout(&mut self) -> Result<&mut BufReader<ChildStdout>> {
        self.stdout
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::other("worker stdout already taken")))
    }

    pub fn take_stderr(&mut self) -> Result<ChildStderr> {
        self.stderr
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("worker stderr already taken")))
    }

    /// Split borrow of the input and output pipes, for concurrent use.
    pub fn pipes(&mut self) -> Result<(&mut ChildStdin, &mut BufReader<ChildStdout>)> {
        match (self.stdin.as_mut(), self.stdout.as_mut()) {
            (Some(stdin), Some(stdout)) => Ok((stdin, stdout)),
            _ => Err(Error::Io(std::io::Error::other("worker pipes already closed"))),
        }
    }

    /// Exit status if the worker has already exited.
    pub fn try_exit(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exited = true;
                Some(status)
            }
            _ => None,
        }
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        !self.exited && self.try_exit().is_none()
    }

    /// Wait for the worker to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.exited = true;
        Ok(status)
    }

    /// Stop the worker and everything in its process group.
    ///
    /// Closes the pipes, sends SIGTERM to the group, waits up to the
    /// termination timeout, then sends SIGKILL and reaps. Children left in
    /// the group are stopped the same way even when the worker itself has
    /// already exited. On return nothing in the group is running, or the
    /// error says why it could not be confirmed.
    pub async fn terminate(&mut self) -> Result<()> {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;

        if self.is_alive() {
            self.stop_leader().await?;
        }
        self.clear_group().await;
        Ok(())
    }

    async fn stop_leader(&mut self) -> Result<()> {
        signal_group(self.pid, Signal::Terminate);
        if let Ok(status) = tokio::time::timeout(self.termination_timeout, self.child.wait()).await
        {
            self.exited = true;
            tracing::debug!(pid = self.pid, ?status, "executable terminated");
            return status.map(|_| ()).map_err(Error::Io);
        }

        tracing::warn!(
            pid = self.pid,
            "executable ignored SIGTERM for {:?}, killing",
            self.termination_timeout
        );
        signal_group(self.pid, Signal::Kill);
        if let Err(e) = self.child.kill().await {
            // The group kill may already have reaped it.
            if self.try_exit().is_none() {
                return Err(Error::Io(e));
            }
        }
        self.exited = true;
        Ok(())
    }

    /// Stop whatever the worker left behind in its process group.
    async fn clear_group(&mut self) {
        if self.group_cleared {
            return;
        }
        if group_alive(self.pid) {
            tracing::debug!(pid = self.pid, "stopping leftover processes of executable");
            signal_group(self.pid, Signal::Terminate);
            let deadline = tokio::time::Instant::now() + self.termination_timeout;
            while group_alive(self.pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(GROUP_POLL_INTERVAL).await;
            }
            if group_alive(self.pid) {
                tracing::warn!(
                    pid = self.pid,
                    "leftover processes ignored SIGTERM for {:?}, killing",
                    self.termination_timeout
                );
                signal_group(self.pid, Signal::Kill);
            }
        }
        self.group_cleared = true;
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // The group may outlive the worker.
        if !self.group_cleared {
            signal_group(self.pid, Signal::Kill);
        }
    }
}

/// How often `terminate` checks whether leftover group members are gone.
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// Deliver a signal to the worker's process group.
fn signal_group(pid: u32, signal: Signal) {
    #[cfg(unix)]
    {
        let signo = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) with a negative pid signals the process group the
        // worker leads; it touches no memory of this process.
        let rc = unsafe { libc::kill(-(pid as i32), signo) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // ESRCH means the group is already gone, which is fine
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pid, ?signal, "failed to signal executable: {}", err);
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}

/// Whether any process of the worker's group still exists.
fn group_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: signal 0 only checks that the group exists.
        unsafe { libc::kill(-(pid as i32), 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Apply the exit code policy to a worker's exit status.
pub fn check_exit(status: ExitStatus, policy: ExitCodePolicy) -> Result<()> {
    if status.success() || policy == ExitCodePolicy::Ignore {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(Error::NonZeroExit(code));
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(Error::Signalled(signal));
        }
    }

    Err(Error::Io(std::io::Error::other(format!(
        "executable ended abnormally: {}",
        status
    ))))
}
