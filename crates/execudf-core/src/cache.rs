//! Query result cache admission for plans that call executable functions.
//!
//! | deterministic | throw | save  | ignore |
//! |---------------|-------|-------|--------|
//! | true          | Admit | Admit | Admit  |
//! | false         | Error | Admit | Deny   |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::descriptor::FunctionDescriptor;
use crate::error::{Error, Result};

/// Session setting controlling how non-deterministic functions interact with
/// the query result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NondeterministicFunctionHandling {
    /// Fail the query.
    #[default]
    Throw,
    /// Cache the result anyway.
    Save,
    /// Run the query but keep its result out of the cache.
    Ignore,
}

impl NondeterministicFunctionHandling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Throw => "throw",
            Self::Save => "save",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for NondeterministicFunctionHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NondeterministicFunctionHandling {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "throw" => Ok(Self::Throw),
            "save" => Ok(Self::Save),
            "ignore" => Ok(Self::Ignore),
            other => Err(Error::Config(format!(
                "unknown nondeterministic_function_handling '{}', expected throw, save or ignore",
                other
            ))),
        }
    }
}

/// Outcome of the admission check for one plan node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheAdmission {
    /// The result may be read from and written to the cache.
    Admit,
    /// The query runs but its result is not cached.
    Deny,
    /// The query must fail before touching the cache.
    Reject { function: String },
}

impl CacheAdmission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }

    /// `Ok(true)` to use the cache, `Ok(false)` to bypass it, or the
    /// determinism error.
    pub fn into_result(self) -> Result<bool> {
        match self {
            Self::Admit => Ok(true),
            Self::Deny => Ok(false),
            Self::Reject { function } => Err(Error::CacheDeterminism { function }),
        }
    }
}

/// Decide cache admission for a call to `descriptor`.
pub fn admit(
    descriptor: &FunctionDescriptor,
    policy: NondeterministicFunctionHandling,
) -> CacheAdmission {
    use NondeterministicFunctionHandling::*;

    match (descriptor.deterministic, policy) {
        (true, _) | (false, Save) => CacheAdmission::Admit,
        (false, Ignore) => CacheAdmission::Deny,
        (false, Throw) => CacheAdmission::Reject {
            function: descriptor.name.clone(),
        },
    }
}

/// Fold the admission of every executable function in one plan.
///
/// The first rejection wins, then any denial; a plan without executable
/// functions is admitted.
pub fn admit_plan<'a>(
    functions: impl IntoIterator<Item = &'a FunctionDescriptor>,
    policy: NondeterministicFunctionHandling,
) -> CacheAdmission {
    let mut decision = CacheAdmission::Admit;
    for descriptor in functions {
        match admit(descriptor, policy) {
            reject @ CacheAdmission::Reject { .. } => return reject,
            CacheAdmission::Deny => decision = CacheAdmission::Deny,
            CacheAdmission::Admit => {}
        }
    }
    decision
}
