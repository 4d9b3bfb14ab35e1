//! Python Script Runtime
//!
//! Runs the configured interpreter as a subprocess. `check` compiles the
//! file with `py_compile`; `call` runs a small driver that imports the module
//! from the user's directory, passes the payload on stdin and prints the
//! result as JSON.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::application::ports::{CallValue, ScriptError, ScriptRuntime};
use crate::domain::expression::CallSpec;

const CALL_DRIVER: &str = r"
import importlib, json, math, sys
sys.path.insert(0, '.')
result = getattr(importlib.import_module(sys.argv[1]), sys.argv[2])(sys.stdin.read())
def number(v):
    v = float(v)
    return None if math.isnan(v) or math.isinf(v) else v
try:
    if isinstance(result, bool):
        raise TypeError
    out = number(result) if isinstance(result, (int, float)) else [[str(k), number(v)] for k, v in result]
except Exception:
    out = 'bad return'
print(json.dumps(out))
";

/// Script runtime backed by a Python interpreter.
#[derive(Debug, Clone)]
pub struct PythonRuntime {
    interpreter: String,
}

impl PythonRuntime {
    /// Create a runtime using `interpreter` (e.g. `python3`).
    #[must_use]
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

/// Last non-empty stderr line, which for a Python traceback is the error.
fn diagnostic(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("script failed")
        .to_string()
}

/// Parse the driver's JSON output. `null` numbers become NaN.
fn parse_call_output(stdout: &[u8]) -> Result<CallValue, ScriptError> {
    let value: serde_json::Value =
        serde_json::from_slice(stdout).map_err(|_| ScriptError::BadReturn)?;
    match value {
        serde_json::Value::Null => Ok(CallValue::Number(f64::NAN)),
        serde_json::Value::Number(n) => {
            n.as_f64().map(CallValue::Number).ok_or(ScriptError::BadReturn)
        }
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::Array(pair) if pair.len() == 2 => {
                    let name = pair[0].as_str().ok_or(ScriptError::BadReturn)?.to_string();
                    let value = if pair[1].is_null() {
                        f64::NAN
                    } else {
                        pair[1].as_f64().ok_or(ScriptError::BadReturn)?
                    };
                    Ok((name, value))
                }
                _ => Err(ScriptError::BadReturn),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(CallValue::Pairs),
        _ => Err(ScriptError::BadReturn),
    }
}

#[async_trait]
impl ScriptRuntime for PythonRuntime {
    async fn check(&self, path: &Path) -> Result<(), ScriptError> {
        let output = Command::new(&self.interpreter)
            .arg("-m")
            .arg("py_compile")
            .arg(path)
            .output()
            .await
            .map_err(|e| ScriptError::Spawn(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ScriptError::Check(diagnostic(&output.stderr)))
        }
    }

    async fn call(&self, call: &CallSpec, dir: &Path) -> Result<CallValue, ScriptError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ScriptError::Call(e.to_string()))?;

        let mut child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(CALL_DRIVER)
            .arg(&call.module)
            .arg(&call.function)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScriptError::Spawn(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(call.payload.as_bytes())
                .await
                .map_err(|e| ScriptError::Call(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ScriptError::Call(e.to_string()))?;
        if !output.status.success() {
            return Err(ScriptError::Call(diagnostic(&output.stderr)));
        }
        parse_call_output(&output.stdout)
    }
}
