//! One fresh worker process per call.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::descriptor::FunctionDescriptor;
use crate::error::{Error, Result};
use crate::format::RowCodec;
use crate::types::RowBatch;

use super::command::CommandLine;
use super::handle::{ProcessHandle, check_exit};
use super::stderr::{self, StderrCapture};
use super::{Deadline, Exchange};

/// Spawn `command`, feed it `input`, read its whole output and reap it.
///
/// Timeouts, spawn failures and pipe errors are returned as `Err`; the
/// worker is terminated before returning. Everything else is reported in
/// the [`Exchange`] for the caller to judge.
pub async fn run_single_shot(
    descriptor: &FunctionDescriptor,
    command: &CommandLine,
    input: &RowBatch,
    deadline: &Deadline,
) -> Result<Exchange> {
    let codec = RowCodec::new(descriptor);
    let payload = codec.encode(input, descriptor.send_chunk_header)?;

    let mut handle = ProcessHandle::spawn(command, descriptor.termination_timeout())?;
    let stderr_task = spawn_stderr_drain(&mut handle, descriptor)?;

    let result = exchange(&mut handle, &codec, descriptor, payload, stderr_task, deadline).await;
    if let Err(e) = &result {
        tracing::debug!(
            function = %descriptor.name,
            pid = handle.pid(),
            "terminating executable after failure: {}",
            e
        );
    }
    if let Err(e) = handle.terminate().await {
        tracing::warn!(
            function = %descriptor.name,
            pid = handle.pid(),
            "failed to terminate executable: {}",
            e
        );
    }
    result
}

fn spawn_stderr_drain(
    handle: &mut ProcessHandle,
    descriptor: &FunctionDescriptor,
) -> Result<JoinHandle<StderrCapture>> {
    let pipe = handle.take_stderr()?;
    let mut capture = StderrCapture::new(descriptor.stderr_policy);
    let pid = handle.pid();
    Ok(tokio::spawn(async move {
        if let Err(e) = stderr::drain(pipe, &mut capture).await {
            tracing::debug!(pid, "stderr read failed: {}", e);
        }
        capture
    }))
}

async fn exchange(
    handle: &mut ProcessHandle,
    codec: &RowCodec<'_>,
    descriptor: &FunctionDescriptor,
    payload: Vec<u8>,
    stderr_task: JoinHandle<StderrCapture>,
    deadline: &Deadline,
) -> Result<Exchange> {
    let mut stdin = handle.take_stdin()?;
    let output = {
        let stdout = handle.stdout()?;
        let write = async move {
            match stdin.write_all(&payload).await {
                // A worker may legitimately stop reading early.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(Error::Io(e)),
                Ok(()) => {
                    let _ = stdin.shutdown().await;
                }
            }
            Ok(())
        };
        let read = async {
            let mut output = Vec::new();
            stdout.read_to_end(&mut output).await?;
            Ok::<_, Error>(output)
        };
        let ((), output) = deadline
            .run("exchanging rows with executable", async {
                tokio::try_join!(write, read)
            })
            .await?;
        output
    };

    let status = deadline
        .run("waiting for executable to exit", handle.wait())
        .await?;
    let mut capture = deadline
        .run("reading executable stderr", async {
            stderr_task
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))
        })
        .await?;

    Ok(Exchange {
        rows: codec.decode_stream(&output, descriptor.send_chunk_header),
        exit: check_exit(status, descriptor.on_nonzero_exit),
        stderr: capture.take(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::descriptor::{ArgumentSpec, ExitCodePolicy, StderrPolicy};
    use crate::types::{DataType, Value};

    fn echo(script: &str) -> FunctionDescriptor {
        FunctionDescriptor::new(
            "echo",
            [script],
            vec![ArgumentSpec::new(DataType::UInt64)],
            DataType::String,
        )
        .with_execute_direct(false)
    }

    fn command(descriptor: &FunctionDescriptor) -> CommandLine {
        CommandLine::resolve(&descriptor.command, descriptor.execute_direct, None).unwrap()
    }

    fn input(n: u64) -> RowBatch {
        (1..=n).map(|i| vec![Value::UInt64(i)]).collect()
    }

    async fn run(descriptor: &FunctionDescriptor, rows: &RowBatch) -> Result<Exchange> {
        let deadline = Deadline::for_function(descriptor);
        run_single_shot(descriptor, &command(descriptor), rows, &deadline).await
    }

    #[tokio::test]
    async fn test_echo_rows() {
        let descriptor = echo(r#"while IFS= read -r x; do echo "Key $x"; done"#);
        let exchange = run(&descriptor, &input(2)).await.unwrap();
        let rows = exchange.rows.unwrap();
        assert_eq!(
            rows.single_column().cloned().collect::<Vec<_>>(),
            vec![Value::from("Key 1"), Value::from("Key 2")]
        );
        assert!(exchange.exit.is_ok());
        assert!(exchange.stderr.is_none());
    }

    #[tokio::test]
    async fn test_exit_code_reported_alongside_rows() {
        let descriptor = echo(r#"while IFS= read -r x; do echo "Key $x"; done; exit 1"#);
        let exchange = run(&descriptor, &input(1)).await.unwrap();
        assert!(exchange.rows.is_ok());
        assert!(matches!(exchange.exit, Err(Error::NonZeroExit(1))));

        let ignoring = descriptor.with_exit_policy(ExitCodePolicy::Ignore);
        let exchange = run(&ignoring, &input(1)).await.unwrap();
        assert!(exchange.exit.is_ok());
    }

    #[tokio::test]
    async fn test_stderr_captured() {
        let descriptor = echo(r#"cat >/dev/null; echo "Fake error" >&2; echo "Key 1""#)
            .with_stderr_policy(StderrPolicy::LogFirst(3));
        let exchange = run(&descriptor, &input(1)).await.unwrap();
        let stderr = exchange.stderr.unwrap();
        assert_eq!(stderr.text, "Fak");
        assert_eq!(stderr.total_bytes, 11);
    }

    #[tokio::test]
    async fn test_worker_ignoring_input_is_not_an_error() {
        let descriptor = echo(r#"echo "Key 1""#);
        let exchange = run(&descriptor, &input(1)).await.unwrap();
        assert_eq!(exchange.rows.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_terminates_worker() {
        let descriptor = echo("sleep 30").with_command_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = run(&descriptor, &input(1)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_chunked_output() {
        let descriptor = echo(r#"read -r n; cat >/dev/null; printf '6\nKey 1\n'"#)
            .with_chunk_header(true);
        let exchange = run(&descriptor, &input(1)).await.unwrap();
        assert_eq!(
            exchange.rows.unwrap().single_column().cloned().collect::<Vec<_>>(),
            vec![Value::from("Key 1")]
        );
    }
}
