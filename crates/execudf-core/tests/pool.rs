//! Integration tests for pooled executable functions.
//!
//! Pooled workers keep stdin open and answer one batch at a time.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use execudf_core::{
    ArgumentSpec, CallContext, DataType, Error, Format, FunctionDescriptor, Invoker,
    InvokerConfig, ParameterSpec, RowBatch, StderrPolicy, Value,
};
use tokio::task::JoinSet;

const ECHO: &str = r#"while IFS= read -r x; do echo "Key $x"; done"#;

/// Answers each chunk-framed batch with a chunk-framed batch.
const CHUNKED_ECHO: &str = r#"
while IFS= read -r n; do
    out=''
    while [ "$n" -gt 0 ]; do
        IFS= read -r x
        n=$((n - ${#x} - 1))
        out="${out}Key $x
"
    done
    printf '%s\n%s' "${#out}" "$out"
done
"#;

fn pooled(name: &str, script: &str, pool_size: usize) -> FunctionDescriptor {
    FunctionDescriptor::new(
        name,
        [script],
        vec![ArgumentSpec::new(DataType::UInt64)],
        DataType::String,
    )
    .with_execute_direct(false)
    .with_pool_size(pool_size)
}

fn column(values: impl IntoIterator<Item = u64>) -> RowBatch {
    values.into_iter().map(|v| vec![Value::UInt64(v)]).collect()
}

fn strings(batch: &RowBatch) -> Vec<String> {
    batch.single_column().map(|v| v.to_string()).collect()
}

fn stats(invoker: &Invoker, name: &str) -> execudf_core::PoolStats {
    invoker
        .pool_stats(name)
        .unwrap_or_else(|| panic!("no pool for {}", name))
}

#[tokio::test]
async fn test_pool_serves_successive_batches() {
    let invoker = Invoker::new(InvokerConfig::default());
    let function = Arc::new(pooled("test_function_pool", ECHO, 1));

    for batch in [vec![1, 2], vec![3], vec![4, 5, 6]] {
        let expected: Vec<String> = batch.iter().map(|i| format!("Key {}", i)).collect();
        let invocation = invoker.invoke(&function, &column(batch)).await.unwrap();
        assert_eq!(strings(&invocation.rows), expected);
    }

    let stats = stats(&invoker, "test_function_pool");
    assert_eq!(stats.spawned, 1);
    assert_eq!(stats.retired, 0);
    invoker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_share_pool() {
    let invoker = Arc::new(Invoker::new(InvokerConfig::default()));
    let function = Arc::new(pooled("test_function_pool_concurrent", ECHO, 4));

    let mut calls = JoinSet::new();
    for i in 0..100u64 {
        let invoker = Arc::clone(&invoker);
        let function = Arc::clone(&function);
        calls.spawn(async move {
            let ctx = CallContext::new(format!("q{}", i));
            let invocation = invoker
                .invoke_with(&function, &column([i]), &ctx)
                .await?;
            Ok::<_, Error>((i, invocation))
        });
    }

    let mut completed = 0;
    while let Some(joined) = calls.join_next().await {
        let (i, invocation) = joined.unwrap().unwrap();
        assert_eq!(strings(&invocation.rows), vec![format!("Key {}", i)]);
        completed += 1;
    }
    assert_eq!(completed, 100);

    let stats = stats(&invoker, "test_function_pool_concurrent");
    println!("pool stats after 100 calls: {:?}", stats);
    assert!(stats.peak_checked_out <= 4);
    assert!(stats.spawned <= 4);
    assert_eq!(stats.checked_out, 0);
    invoker.shutdown().await;
}

#[tokio::test]
async fn test_chunk_header_pool() {
    let invoker = Invoker::new(InvokerConfig::default());
    let function = Arc::new(
        pooled("test_function_pool_chunk_header", CHUNKED_ECHO, 2).with_chunk_header(true),
    );

    for batch in [vec![1], vec![10, 200, 3000]] {
        let expected: Vec<String> = batch.iter().map(|i| format!("Key {}", i)).collect();
        let invocation = invoker.invoke(&function, &column(batch)).await.unwrap();
        assert_eq!(strings(&invocation.rows), expected);
    }
    assert_eq!(stats(&invoker, "test_function_pool_chunk_header").retired, 0);
    invoker.shutdown().await;
}

#[tokio::test]
async fn test_json_named_pool() {
    let invoker = Invoker::new(InvokerConfig::default());
    let function = Arc::new(
        FunctionDescriptor::new(
            "test_function_sum_json_named_pool",
            [r#"while IFS=':,}' read -r _ a _ b _; do echo "{\"result\":$((a + b))}"; done"#],
            vec![
                ArgumentSpec::named("lhs", DataType::UInt64),
                ArgumentSpec::named("rhs", DataType::UInt64),
            ],
            DataType::UInt64,
        )
        .with_format(Format::JsonEachRowNamed)
        .with_execute_direct(false)
        .with_pool_size(4),
    );
    let input: RowBatch = (0..3u64)
        .map(|i| vec![Value::UInt64(i), Value::UInt64(i)])
        .collect();
    let invocation = invoker.invoke(&function, &input).await.unwrap();
    assert_eq!(strings(&invocation.rows), vec!["0", "2", "4"]);
    invoker.shutdown().await;
}

#[tokio::test]
async fn test_timeout_retires_member() {
    let invoker = Invoker::new(InvokerConfig::default());
    let function = Arc::new(
        pooled(
            "test_function_pool_hang",
            "while IFS= read -r x; do sleep 30; done",
            1,
        )
        .with_command_timeout(Duration::from_millis(300))
        .with_termination_timeout(Duration::from_secs(1)),
    );

    let err = invoker.invoke(&function, &column([1])).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{:?}", err);

    let stats = stats(&invoker, "test_function_pool_hang");
    assert_eq!(stats.retired, 1);
    assert_eq!(stats.checked_out, 0);
    assert_eq!(stats.idle, 0);
    invoker.shutdown().await;
}

#[tokio::test]
async fn test_exit_mid_stream_reports_exit_code() {
    let invoker = Invoker::new(InvokerConfig::default());
    let function = Arc::new(pooled(
        "test_function_pool_exit",
        "IFS= read -r x; exit 1",
        1,
    ));

    let err = invoker.invoke(&function, &column([1])).await.unwrap_err();
    assert!(matches!(err, Error::NonZeroExit(1)), "{:?}", err);
    assert_eq!(stats(&invoker, "test_function_pool_exit").retired, 1);

    // The next call gets a fresh member and fails the same way.
    let err = invoker.invoke(&function, &column([2])).await.unwrap_err();
    assert!(matches!(err, Error::NonZeroExit(1)), "{:?}", err);
    assert_eq!(stats(&invoker, "test_function_pool_exit").spawned, 2);
    invoker.shutdown().await;
}

#[tokio::test]
async fn test_format_error_retires_member() {
    let invoker = Invoker::new(InvokerConfig::default());
    let script = "while IFS= read -r x; do echo \"bad $x\"; done";
    let function = Arc::new(
        FunctionDescriptor::new(
            "test_function_pool_malformed",
            [script],
            vec![ArgumentSpec::new(DataType::UInt64)],
            DataType::UInt64,
        )
        .with_execute_direct(false)
        .with_pool_size(1),
    );

    for i in 0..2 {
        let err = invoker.invoke(&function, &column([i])).await.unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{:?}", err);
    }
    let stats = stats(&invoker, "test_function_pool_malformed");
    assert_eq!(stats.retired, 2);
    assert_eq!(stats.spawned, 2);
    invoker.shutdown().await;
}

#[tokio::test]
async fn test_format_error_keeps_member_when_configured() {
    let invoker = Invoker::new(InvokerConfig::default());
    let script = "while IFS= read -r x; do echo \"bad $x\"; done";
    let function = Arc::new(
        FunctionDescriptor::new(
            "test_function_pool_malformed_kept",
            [script],
            vec![ArgumentSpec::new(DataType::UInt64)],
            DataType::UInt64,
        )
        .with_execute_direct(false)
        .with_pool_size(1)
        .with_retire_on_format_error(false),
    );

    for i in 0..2 {
        let err = invoker.invoke(&function, &column([i])).await.unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{:?}", err);
    }
    let stats = stats(&invoker, "test_function_pool_malformed_kept");
    assert_eq!(stats.retired, 0);
    assert_eq!(stats.spawned, 1);
    invoker.shutdown().await;
}

#[tokio::test]
async fn test_warm_up_and_shutdown() {
    let invoker = Invoker::new(InvokerConfig::default());
    let function = Arc::new(pooled("test_function_pool_warm", ECHO, 3));

    let spawned = invoker
        .warm_up(&function, &CallContext::default())
        .await
        .unwrap();
    assert_eq!(spawned, 3);
    assert_eq!(stats(&invoker, "test_function_pool_warm").idle, 3);

    let invocation = invoker.invoke(&function, &column([1])).await.unwrap();
    assert_eq!(strings(&invocation.rows), vec!["Key 1"]);
    assert_eq!(stats(&invoker, "test_function_pool_warm").spawned, 3);

    invoker.shutdown().await;
    assert!(invoker.pool_stats("test_function_pool_warm").is_none());

    // A call after shutdown starts a new pool.
    let invocation = invoker.invoke(&function, &column([2])).await.unwrap();
    assert_eq!(strings(&invocation.rows), vec!["Key 2"]);
    invoker.shutdown().await;
}

#[tokio::test]
async fn test_changed_descriptor_gets_new_pool() {
    let invoker = Invoker::new(InvokerConfig::default());
    let first = Arc::new(pooled("test_function_pool_changed", ECHO, 1));
    invoker.invoke(&first, &column([1])).await.unwrap();

    let second = Arc::new(
        pooled("test_function_pool_changed", ECHO, 1).with_command_timeout(Duration::from_secs(5)),
    );
    invoker.invoke(&second, &column([1])).await.unwrap();

    let stats = stats(&invoker, "test_function_pool_changed");
    assert_eq!(stats.spawned, 1);
    invoker.shutdown().await;
}

/// Writes one stderr line per row before answering it.
const NOISY_ECHO: &str =
    r#"while IFS= read -r x; do echo "Fake error $x" >&2; echo "Key $x"; done"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stderr_throws_for_the_call_that_wrote_it() {
    let invoker = Invoker::new(InvokerConfig::default());
    let function = Arc::new(pooled("test_function_pool_stderr", NOISY_ECHO, 1));

    for i in 0..100u64 {
        let err = invoker.invoke(&function, &column([i])).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Executable generates stderr: Fake error {}", i)
        );
    }
    // Stderr alone does not desynchronize the member.
    assert_eq!(stats(&invoker, "test_function_pool_stderr").spawned, 1);
    invoker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stderr_log_first_pool() {
    let invoker = Invoker::new(InvokerConfig::default());
    let function = Arc::new(
        pooled("test_function_pool_stderr_log_first", NOISY_ECHO, 2)
            .with_stderr_policy(StderrPolicy::LogFirst(7)),
    );

    for batch in [vec![1, 2], vec![3]] {
        let expected: Vec<String> = batch.iter().map(|i| format!("Key {}", i)).collect();
        let first = batch[0];
        let total = batch.len() * format!("Fake error {}\n", first).len();
        let invocation = invoker.invoke(&function, &column(batch)).await.unwrap();
        assert_eq!(strings(&invocation.rows), expected);

        let stderr = invocation.stderr.unwrap();
        assert_eq!(stderr.text, "Fake er");
        assert_eq!(stderr.total_bytes, total);
    }
    invoker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stderr_ignored_pool() {
    let invoker = Invoker::new(InvokerConfig::default());
    let function = Arc::new(
        pooled("test_function_pool_stderr_ignored", NOISY_ECHO, 2)
            .with_stderr_policy(StderrPolicy::Ignore),
    );

    for i in 0..10u64 {
        let invocation = invoker.invoke(&function, &column([i])).await.unwrap();
        assert_eq!(strings(&invocation.rows), vec![format!("Key {}", i)]);
        assert!(invocation.stderr.is_none());
    }
    invoker.shutdown().await;
}

#[tokio::test]
async fn test_parameter_bindings_share_pool_slots() {
    let invoker = Invoker::new(InvokerConfig::default());
    let function = Arc::new(
        FunctionDescriptor::new(
            "test_function_pool_parameter",
            [
                r#"echo_param() { while IFS= read -r x; do echo "Key $x $1"; done; }; echo_param"#,
                "{test_parameter:UInt64}",
            ],
            vec![ArgumentSpec::new(DataType::UInt64)],
            DataType::String,
        )
        .with_parameters(vec![ParameterSpec {
            name: "test_parameter".to_string(),
            data_type: DataType::UInt64,
        }])
        .with_execute_direct(false)
        .with_pool_size(2),
    );

    for n in 0..50u64 {
        let ctx = CallContext::new("q-param").with_parameters(vec![Value::UInt64(n)]);
        let invocation = invoker
            .invoke_with(&function, &column([1]), &ctx)
            .await
            .unwrap();
        assert_eq!(strings(&invocation.rows), vec![format!("Key 1 {}", n)]);

        let stats = stats(&invoker, "test_function_pool_parameter");
        assert!(stats.live <= 2, "{:?}", stats);
    }

    let stats = stats(&invoker, "test_function_pool_parameter");
    assert_eq!(stats.live, 2);
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.spawned, 50);
    assert_eq!(stats.retired, 48);
    invoker.shutdown().await;
}
