//! Script execution.
//!
//! Scripts run as child processes of the worker with inherited standard
//! streams, so everything they print reaches the host's log router.

use crate::error::{error_kinds, CallError, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Default interpreter for script targets.
pub const DEFAULT_INTERPRETER: &str = "sh";

/// Runs script targets with a fixed interpreter.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    interpreter: String,
    base_dir: Option<PathBuf>,
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new(DEFAULT_INTERPRETER)
    }
}

impl ScriptRunner {
    /// Create a runner using `interpreter`.
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            base_dir: None,
        }
    }

    /// Resolve relative script paths against `dir`.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Run `script_path` with `args` as its command-line arguments.
    ///
    /// String arguments are passed verbatim, any other value as its JSON
    /// text. Returns `{"exitCode": 0}` on success.
    pub fn run(&self, script_path: &str, args: &[Value]) -> Result<Value> {
        let path = self.resolve(script_path);
        if !path.is_file() {
            return Err(CallError::new(
                error_kinds::SCRIPT_NOT_FOUND,
                format!("script not found: {}", path.display()),
            ));
        }

        let argv: Vec<String> = args.iter().map(argument_text).collect();
        debug!(
            interpreter = %self.interpreter,
            script = %path.display(),
            argc = argv.len(),
            "running script"
        );

        let status = Command::new(&self.interpreter)
            .arg(&path)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| {
                warn!(error = %e, interpreter = %self.interpreter, "script execution failed");
                CallError::new(
                    error_kinds::SCRIPT_FAILED,
                    format!("failed to execute {}: {}", self.interpreter, e),
                )
            })?;

        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            return Err(CallError::new(
                error_kinds::SCRIPT_FAILED,
                format!("script {} exited with status {}", path.display(), exit_code),
            ));
        }
        Ok(json!({ "exitCode": exit_code }))
    }

    fn resolve(&self, script_path: &str) -> PathBuf {
        let path = Path::new(script_path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

fn argument_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
