//! Port Interfaces
//!
//! Contracts for collaborators the relay consumes but does not own.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FileStore`: per-user named risk files
//! - `ScriptRuntime`: syntax check and function call-out for scripts

mod file_store;
mod script_runtime;

pub use file_store::{FileStore, FileStoreError};
pub use script_runtime::{CallValue, ScriptError, ScriptRuntime};

#[cfg(test)]
pub use file_store::MockFileStore;
#[cfg(test)]
pub use script_runtime::MockScriptRuntime;
