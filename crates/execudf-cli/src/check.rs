//! Check command implementation.
//!
//! Validates a function catalog and prints one line per function.

use std::path::Path;

use execudf_core::FunctionCatalog;

/// Execute the check command.
pub fn execute(config: &Path) -> anyhow::Result<()> {
    let catalog = FunctionCatalog::load(config)?;

    for function in catalog.iter() {
        let mode = if function.is_pooled() {
            format!("pool of {}", function.pool_size)
        } else {
            "single-shot".to_string()
        };
        let arguments: Vec<String> = function
            .argument_types
            .iter()
            .map(|a| match &a.name {
                Some(name) => format!("{} {}", name, a.data_type),
                None => a.data_type.to_string(),
            })
            .collect();
        println!(
            "{}({}) -> {}  [{}, {}, {}]",
            function.name,
            arguments.join(", "),
            function.result_type,
            function.format,
            mode,
            if function.deterministic {
                "deterministic"
            } else {
                "non-deterministic"
            }
        );
    }

    println!("{} function(s) OK", catalog.len());
    Ok(())
}
