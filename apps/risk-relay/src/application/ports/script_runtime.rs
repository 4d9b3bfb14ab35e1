//! Script Runtime Port (Driven Port)
//!
//! Black-box access to the embedded scripting language: a syntax check and
//! a function call that returns a number or a name/value list.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::expression::CallSpec;

/// Script runtime errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    /// Syntax check failed; carries the diagnostic.
    #[error("{0}")]
    Check(String),

    /// The call raised or the interpreter failed.
    #[error("{0}")]
    Call(String),

    /// The call returned something other than a number or name/value list.
    #[error("it must return a float number or an name/value tuple list")]
    BadReturn,

    /// Interpreter could not be started.
    #[error("failed to run interpreter: {0}")]
    Spawn(String),
}

/// Value returned by a script function.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CallValue {
    /// A single number.
    Number(f64),
    /// Name/value pairs.
    Pairs(Vec<(String, f64)>),
}

/// Port for the scripting collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    /// Syntax-check the script at `path`.
    async fn check(&self, path: &Path) -> Result<(), ScriptError>;

    /// Invoke `call.function` in `call.module` with `call.payload`, resolving
    /// modules from `dir`.
    async fn call(&self, call: &CallSpec, dir: &Path) -> Result<CallValue, ScriptError>;
}
