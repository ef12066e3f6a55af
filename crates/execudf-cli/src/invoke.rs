//! Invoke command implementation.
//!
//! Reads tab-separated argument rows from stdin, calls the function once
//! for the whole batch and writes tab-separated results to stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use execudf_core::{
    ArgumentSpec, CallContext, Format, FunctionCatalog, FunctionDescriptor, Invoker,
    InvokerConfig, RowBatch, RowCodec, Value,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Execute the invoke command.
pub async fn execute(
    config: &Path,
    function: &str,
    params: Vec<String>,
    query_id: Option<String>,
    scripts_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let catalog = FunctionCatalog::load(config)?;
    let descriptor = catalog
        .get(function)
        .cloned()
        .with_context(|| format!("function '{}' is not defined in {}", function, config.display()))?;

    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("failed to read rows from stdin")?;
    let rows = read_rows(&descriptor, &input)?;

    let query_id = query_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let ctx = CallContext::new(&query_id)
        .with_parameters(params.into_iter().map(Value::from).collect());
    tracing::debug!(%query_id, function, rows = rows.len(), "invoking");

    let invoker = Invoker::with_catalog(InvokerConfig { scripts_dir }, catalog);
    let outcome = tokio::select! {
        outcome = invoker.invoke_with(&descriptor, &rows, &ctx) => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    invoker.shutdown().await;

    let Some(outcome) = outcome else {
        anyhow::bail!("interrupted");
    };
    let invocation = outcome?;

    let output = write_rows(&descriptor, &invocation.rows)?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&output).await?;
    stdout.flush().await?;
    Ok(())
}

/// Tab-separated view of a function's arguments.
fn read_rows(descriptor: &FunctionDescriptor, input: &[u8]) -> anyhow::Result<RowBatch> {
    let tsv = FunctionDescriptor {
        format: Format::TabSeparated,
        ..descriptor.clone()
    };
    RowCodec::new(&tsv)
        .decode_arguments(input)
        .context("invalid input rows")
}

/// Tab-separated rendering of a function's results.
fn write_rows(descriptor: &Arc<FunctionDescriptor>, rows: &RowBatch) -> anyhow::Result<Vec<u8>> {
    let results = FunctionDescriptor::new(
        descriptor.name.as_str(),
        descriptor.command.iter().map(String::as_str),
        vec![ArgumentSpec::new(descriptor.result_type.clone())],
        descriptor.result_type.clone(),
    );
    Ok(RowCodec::new(&results).encode(rows, false)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use execudf_core::DataType;

    fn sum() -> FunctionDescriptor {
        FunctionDescriptor::new(
            "sum",
            ["sum.sh"],
            vec![
                ArgumentSpec::named("lhs", DataType::UInt64),
                ArgumentSpec::named("rhs", DataType::UInt64),
            ],
            DataType::UInt64,
        )
        .with_format(Format::JsonEachRowNamed)
    }

    #[test]
    fn test_rows_are_read_as_tab_separated() {
        let rows = read_rows(&sum(), b"1\t2\n3\t4\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.rows()[1], vec![Value::UInt64(3), Value::UInt64(4)]);
        assert!(read_rows(&sum(), b"1\n").is_err());
    }

    #[test]
    fn test_results_are_written_as_tab_separated() {
        let descriptor = Arc::new(sum());
        let rows = RowBatch::from(vec![vec![Value::UInt64(3)], vec![Value::UInt64(7)]]);
        assert_eq!(write_rows(&descriptor, &rows).unwrap(), b"3\n7\n".to_vec());
    }
}
