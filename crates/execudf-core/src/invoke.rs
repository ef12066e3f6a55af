//! Invocation coordinator.
//!
//! Picks single-shot or pooled execution for a function, bounds the call by
//! the function's timeouts, applies the stderr and exit code policies and
//! checks row correspondence.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::catalog::FunctionCatalog;
use crate::descriptor::{FunctionDescriptor, StderrPolicy};
use crate::error::{Error, Result};
use crate::params;
use crate::process::{
    CaptureKind, CommandLine, Deadline, Exchange, PoolStats, ProcessPool, StderrDiagnostic,
    run_single_shot,
};
use crate::types::{RowBatch, Value};

/// Coordinator-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokerConfig {
    /// Directory that relative program paths of direct commands resolve
    /// against. Workers also run with it as working directory.
    #[serde(default)]
    pub scripts_dir: Option<PathBuf>,
}

/// Per-call context supplied by the query engine.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Originating query, used to tag diagnostics.
    pub query_id: Option<String>,
    /// Values for a parametrized function's declared parameters.
    pub parameters: Vec<Value>,
}

impl CallContext {
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: Some(query_id.into()),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Successful result of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// One row per input row, in input order.
    pub rows: RowBatch,
    /// Stderr that was logged under a `log_first`/`log_last` policy.
    pub stderr: Option<StderrDiagnostic>,
}

/// Runs executable functions and owns their process pools.
///
/// Pools are created on first use and keyed by function name. Parameter
/// bindings of a parametrized function share their function's pool.
pub struct Invoker {
    config: InvokerConfig,
    catalog: RwLock<Arc<FunctionCatalog>>,
    pools: Mutex<FxHashMap<String, Arc<ProcessPool>>>,
}

impl Invoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self::with_catalog(config, FunctionCatalog::default())
    }

    pub fn with_catalog(config: InvokerConfig, catalog: FunctionCatalog) -> Self {
        Self {
            config,
            catalog: RwLock::new(Arc::new(catalog)),
            pools: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Current function catalog.
    pub fn catalog(&self) -> Arc<FunctionCatalog> {
        Arc::clone(&self.catalog.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn pools(&self) -> MutexGuard<'_, FxHashMap<String, Arc<ProcessPool>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Call a catalog function by name.
    pub async fn call(&self, name: &str, input: &RowBatch, ctx: &CallContext) -> Result<Invocation> {
        let descriptor = self
            .catalog()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown executable function '{}'", name)))?;
        self.invoke_with(&descriptor, input, ctx).await
    }

    /// Call `descriptor` without a query context or parameters.
    pub async fn invoke(
        &self,
        descriptor: &Arc<FunctionDescriptor>,
        input: &RowBatch,
    ) -> Result<Invocation> {
        self.invoke_with(descriptor, input, &CallContext::default())
            .await
    }

    pub async fn invoke_with(
        &self,
        descriptor: &Arc<FunctionDescriptor>,
        input: &RowBatch,
        ctx: &CallContext,
    ) -> Result<Invocation> {
        let parameters = params::validate(descriptor, &ctx.parameters)?;
        let rendered = params::render_command(descriptor, &parameters)?;
        let command = CommandLine::resolve(
            &rendered,
            descriptor.execute_direct,
            self.config.scripts_dir.as_deref(),
        )?;

        if input.is_empty() {
            return Ok(Invocation {
                rows: RowBatch::new(),
                stderr: None,
            });
        }

        let deadline = Deadline::for_function(descriptor);
        let exchange = if descriptor.is_pooled() {
            self.pool_for(descriptor)
                .invoke(&command, input, &deadline)
                .await?
        } else {
            run_single_shot(descriptor, &command, input, &deadline).await?
        };

        settle(descriptor, ctx, input.len(), exchange)
    }

    /// Fill the free slots of `descriptor`'s pool with members for the
    /// parameters in `ctx`.
    pub async fn warm_up(
        &self,
        descriptor: &Arc<FunctionDescriptor>,
        ctx: &CallContext,
    ) -> Result<usize> {
        if !descriptor.is_pooled() {
            return Ok(0);
        }
        let parameters = params::validate(descriptor, &ctx.parameters)?;
        let rendered = params::render_command(descriptor, &parameters)?;
        let command = CommandLine::resolve(
            &rendered,
            descriptor.execute_direct,
            self.config.scripts_dir.as_deref(),
        )?;
        self.pool_for(descriptor).warm_up(&command).await
    }

    fn pool_for(&self, descriptor: &Arc<FunctionDescriptor>) -> Arc<ProcessPool> {
        let mut pools = self.pools();
        if let Some(pool) = pools.get(&descriptor.name) {
            if !pool.is_closed() && pool.function() == descriptor.as_ref() {
                return Arc::clone(pool);
            }
        }

        let pool = Arc::new(ProcessPool::new(Arc::clone(descriptor)));
        tracing::debug!(
            function = %descriptor.name,
            size = descriptor.pool_size,
            "created process pool"
        );
        if let Some(stale) = pools.insert(descriptor.name.clone(), Arc::clone(&pool)) {
            // The descriptor changed under the same name; retire the old pool.
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { stale.shutdown().await });
            }
        }
        pool
    }

    /// Counters of function `name`'s pool, if it has one.
    pub fn pool_stats(&self, name: &str) -> Option<PoolStats> {
        self.pools().get(name).map(|pool| pool.stats())
    }

    /// Shut down and forget every pool.
    pub async fn shutdown(&self) {
        let pools: Vec<_> = self.pools().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.shutdown().await;
        }
    }

    /// Replace the catalog and drop every pool built from the old one.
    pub async fn reload(&self, catalog: FunctionCatalog) {
        let functions = catalog.len();
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
        self.shutdown().await;
        tracing::debug!(functions, "reloaded executable functions");
    }
}

/// Turn a raw exchange into the call's outcome under the function's
/// policies.
fn settle(
    descriptor: &FunctionDescriptor,
    ctx: &CallContext,
    expected: usize,
    exchange: Exchange,
) -> Result<Invocation> {
    let Exchange { rows, exit, stderr } = exchange;

    let stderr = match (descriptor.stderr_policy, stderr) {
        (_, None) | (StderrPolicy::Ignore, _) => None,
        (StderrPolicy::Throw, Some(diagnostic)) => {
            return Err(Error::StderrProduced(
                diagnostic.to_string().trim_end().to_string(),
            ));
        }
        (_, Some(diagnostic)) => {
            log_stderr(descriptor, ctx, &diagnostic);
            Some(diagnostic)
        }
    };

    exit?;
    let rows = rows?;
    if rows.len() != expected {
        return Err(Error::RowCountMismatch {
            expected,
            actual: rows.len(),
        });
    }
    Ok(Invocation { rows, stderr })
}

fn log_stderr(descriptor: &FunctionDescriptor, ctx: &CallContext, diagnostic: &StderrDiagnostic) {
    let query_id = ctx.query_id.as_deref().unwrap_or("");
    let function = descriptor.name.as_str();
    let total_bytes = diagnostic.total_bytes;
    let truncated_bytes = diagnostic.truncated_bytes();
    match diagnostic.kind {
        CaptureKind::Head => tracing::warn!(
            function,
            query_id,
            total_bytes,
            truncated_bytes,
            "Executable generates stderr at the beginning: {}",
            diagnostic.text
        ),
        CaptureKind::Tail => tracing::warn!(
            function,
            query_id,
            total_bytes,
            truncated_bytes,
            "Executable generates stderr at the end: {}",
            diagnostic.text
        ),
        CaptureKind::Full => tracing::warn!(
            function,
            query_id,
            total_bytes,
            "Executable generates stderr: {}",
            diagnostic.text
        ),
    }
}
