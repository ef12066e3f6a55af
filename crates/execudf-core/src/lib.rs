//! Core engine for SQL functions backed by external executables.
//!
//! This crate provides:
//! - Row framing for the tab-separated and JSON-each-row worker formats
//! - Worker process handles with process-group termination
//! - Single-shot and pooled invocation with per-step and per-call timeouts
//! - Stderr capture and exit code policies
//! - Query result cache admission based on function determinism

pub mod cache;
pub mod catalog;
pub mod descriptor;
pub mod error;
pub mod format;
pub mod invoke;
pub mod params;
pub mod process;
pub mod types;

pub use cache::{CacheAdmission, NondeterministicFunctionHandling, admit, admit_plan};
pub use catalog::FunctionCatalog;
pub use descriptor::{ArgumentSpec, ExitCodePolicy, FunctionDescriptor, ParameterSpec, StderrPolicy};
pub use error::{Error, FailureKind, Result};
pub use format::{Format, RowCodec};
pub use invoke::{CallContext, Invocation, Invoker, InvokerConfig};
pub use process::{PoolStats, StderrDiagnostic};
pub use types::{DataType, Row, RowBatch, Value};
