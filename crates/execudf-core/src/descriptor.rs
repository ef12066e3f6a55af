//! Static configuration of an executable function.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::format::Format;
use crate::params;
use crate::types::DataType;

/// What to do with bytes the worker writes to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StderrPolicy {
    /// Fail the call when anything is written to stderr.
    Throw,
    /// Log at most the first N bytes; the call still succeeds.
    LogFirst(usize),
    /// Log at most the last N bytes; the call still succeeds.
    LogLast(usize),
    /// Discard stderr.
    Ignore,
}

/// Reaction to a worker that exits with a non-zero status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCodePolicy {
    Throw,
    Ignore,
}

/// A declared function argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Key used by the named JSON formats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ArgumentSpec {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            name: None,
        }
    }

    pub fn named(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            data_type,
            name: Some(name.into()),
        }
    }
}

/// A declared parameter of a parametrized function, `f(params)(args)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

/// Immutable description of one executable function.
///
/// Created when the function catalog is loaded and shared behind an `Arc`
/// until the next reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    /// Program and arguments. Tokens may contain `{name:Type}` parameter
    /// placeholders.
    pub command: Vec<String>,
    /// Run `command` directly; otherwise it is joined and run by `/bin/sh -c`.
    #[serde(default = "default_true")]
    pub execute_direct: bool,
    #[serde(default, rename = "arguments")]
    pub argument_types: Vec<ArgumentSpec>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    pub result_type: DataType,
    #[serde(default = "default_result_name")]
    pub result_name: String,
    #[serde(default)]
    pub format: Format,
    #[serde(default)]
    pub send_chunk_header: bool,
    /// Zero runs every call in a fresh process.
    #[serde(default)]
    pub pool_size: usize,
    /// Bound on each blocking step of a call, including pool acquisition.
    #[serde(default = "default_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Bound on a whole call.
    #[serde(default = "default_timeout_ms")]
    pub max_command_execution_time_ms: u64,
    /// Grace between SIGTERM and SIGKILL when terminating a worker.
    #[serde(default = "default_timeout_ms")]
    pub command_termination_timeout_ms: u64,
    #[serde(default)]
    pub deterministic: bool,
    #[serde(default = "default_stderr_policy")]
    pub stderr_policy: StderrPolicy,
    #[serde(default = "default_exit_policy")]
    pub on_nonzero_exit: ExitCodePolicy,
    /// Retire a pooled worker whose output could not be decoded.
    #[serde(default = "default_true")]
    pub retire_on_format_error: bool,
}

fn default_true() -> bool {
    true
}

fn default_result_name() -> String {
    "result".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_stderr_policy() -> StderrPolicy {
    StderrPolicy::Throw
}

fn default_exit_policy() -> ExitCodePolicy {
    ExitCodePolicy::Throw
}

impl FunctionDescriptor {
    /// Create a descriptor with default settings: tab-separated, single-shot,
    /// non-deterministic, throwing on stderr and non-zero exit.
    pub fn new(
        name: impl Into<String>,
        command: impl IntoIterator<Item = impl Into<String>>,
        argument_types: Vec<ArgumentSpec>,
        result_type: DataType,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            execute_direct: true,
            argument_types,
            parameters: Vec::new(),
            result_type,
            result_name: default_result_name(),
            format: Format::default(),
            send_chunk_header: false,
            pool_size: 0,
            command_timeout_ms: default_timeout_ms(),
            max_command_execution_time_ms: default_timeout_ms(),
            command_termination_timeout_ms: default_timeout_ms(),
            deterministic: false,
            stderr_policy: default_stderr_policy(),
            on_nonzero_exit: default_exit_policy(),
            retire_on_format_error: true,
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_chunk_header(mut self, send_chunk_header: bool) -> Self {
        self.send_chunk_header = send_chunk_header;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_execution_time(mut self, timeout: Duration) -> Self {
        self.max_command_execution_time_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_termination_timeout(mut self, timeout: Duration) -> Self {
        self.command_termination_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_stderr_policy(mut self, policy: StderrPolicy) -> Self {
        self.stderr_policy = policy;
        self
    }

    pub fn with_exit_policy(mut self, policy: ExitCodePolicy) -> Self {
        self.on_nonzero_exit = policy;
        self
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<ParameterSpec>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_execute_direct(mut self, execute_direct: bool) -> Self {
        self.execute_direct = execute_direct;
        self
    }

    pub fn with_result_name(mut self, result_name: impl Into<String>) -> Self {
        self.result_name = result_name.into();
        self
    }

    pub fn with_retire_on_format_error(mut self, retire: bool) -> Self {
        self.retire_on_format_error = retire;
        self
    }

    pub fn is_pooled(&self) -> bool {
        self.pool_size > 0
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_command_execution_time_ms)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.command_termination_timeout_ms)
    }

    /// Check the descriptor for inconsistencies that would otherwise only
    /// surface on the first call.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(format!("function '{}': {}", self.name, msg)));

        if self.name.trim().is_empty() {
            return Err(Error::Config("function name is empty".to_string()));
        }
        if self.command.first().is_none_or(|program| program.trim().is_empty()) {
            return fail("command is empty".to_string());
        }
        if self.result_name.is_empty() {
            return fail("result_name is empty".to_string());
        }
        if self.command_timeout_ms == 0 || self.max_command_execution_time_ms == 0 {
            return fail("timeouts must be positive".to_string());
        }

        let mut seen = HashSet::new();
        for (index, argument) in self.argument_types.iter().enumerate() {
            match &argument.name {
                Some(name) if !seen.insert(name.as_str()) => {
                    return fail(format!("duplicate argument name '{}'", name));
                }
                None if self.format == Format::JsonEachRowNamed => {
                    return fail(format!(
                        "argument {} has no name but format {} requires names",
                        index + 1,
                        self.format
                    ));
                }
                _ => {}
            }
        }

        let mut declared = HashSet::new();
        for parameter in &self.parameters {
            if !declared.insert(parameter.name.as_str()) {
                return fail(format!("duplicate parameter '{}'", parameter.name));
            }
        }
        for placeholder in params::placeholders(&self.command)? {
            match self.parameters.iter().find(|p| p.name == placeholder.name) {
                None => {
                    return fail(format!(
                        "command references undeclared parameter '{}'",
                        placeholder.name
                    ));
                }
                Some(p) if p.data_type != placeholder.data_type => {
                    return fail(format!(
                        "parameter '{}' declared as {} but used as {}",
                        p.name, p.data_type, placeholder.data_type
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}
