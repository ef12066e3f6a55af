//! Admit command implementation.
//!
//! Prints `admit` or `deny` for a query calling the given functions, or
//! fails when the session policy rejects a non-deterministic function.

use std::path::Path;

use anyhow::Context;
use execudf_core::{FunctionCatalog, NondeterministicFunctionHandling, admit_plan};

/// Execute the admit command.
pub fn execute(config: &Path, policy: &str, functions: &[String]) -> anyhow::Result<()> {
    let catalog = FunctionCatalog::load(config)?;
    let policy: NondeterministicFunctionHandling = policy.parse()?;

    let descriptors = if functions.is_empty() {
        catalog.iter().cloned().collect::<Vec<_>>()
    } else {
        functions
            .iter()
            .map(|name| {
                catalog
                    .get(name)
                    .cloned()
                    .with_context(|| format!("function '{}' is not defined", name))
            })
            .collect::<anyhow::Result<Vec<_>>>()?
    };

    let decision = admit_plan(descriptors.iter().map(|d| d.as_ref()), policy);
    tracing::debug!(?decision, %policy, "cache admission");
    let use_cache = decision.into_result()?;
    println!("{}", if use_cache { "admit" } else { "deny" });
    Ok(())
}
