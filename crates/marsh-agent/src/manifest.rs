//! Command manifest modules.
//!
//! A manifest is a TOML file describing functions implemented as external
//! commands:
//!
//! ```toml
//! [functions.greet]
//! command = ["sh", "-c", "read input; echo '\"hello\"'"]
//!
//! [functions.count]
//! command = ["python3", "count.py"]
//! env = { LC_ALL = "C" }
//! ```
//!
//! Invoking a function writes `{"args": [...], "kwargs": {...}}` to the
//! command's stdin. Its stdout is the result: parsed as JSON when possible,
//! otherwise returned as a string. Its stderr is inherited, so it shows up in
//! the worker's output stream.

use crate::error::{error_kinds, CallError, Result};
use crate::module::{Arguments, Module, ModuleLoader};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Maximum captured result size in bytes (16 MB).
const MAX_RESULT_SIZE: usize = 16 * 1024 * 1024;

/// One function of a manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    /// Program and arguments.
    pub command: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    functions: BTreeMap<String, CommandSpec>,
}

/// A module whose functions are external commands.
#[derive(Debug)]
pub struct CommandModule {
    base_dir: Option<PathBuf>,
    functions: BTreeMap<String, CommandSpec>,
}

impl CommandModule {
    /// Parse a manifest file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CallError::new(
                error_kinds::MODULE_NOT_FOUND,
                format!("failed to read '{}': {}", path.display(), e),
            )
        })?;
        let manifest: Manifest = toml::from_str(&text).map_err(|e| {
            CallError::new(
                error_kinds::INVALID_MODULE,
                format!("invalid manifest '{}': {}", path.display(), e),
            )
        })?;
        for (name, spec) in &manifest.functions {
            if spec.command.is_empty() {
                return Err(CallError::new(
                    error_kinds::INVALID_MODULE,
                    format!("function {name} in '{}' has an empty command", path.display()),
                ));
            }
        }
        Ok(Self {
            base_dir: path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(Path::to_path_buf),
            functions: manifest.functions,
        })
    }
}

impl Module for CommandModule {
    fn call(&self, function: &str, args: Arguments<'_>) -> Result<Value> {
        let spec = self.functions.get(function).ok_or_else(|| {
            CallError::new(
                error_kinds::FUNCTION_NOT_FOUND,
                format!("manifest has no function {function}"),
            )
        })?;
        let input = json!({ "args": args.positional(), "kwargs": args.keywords() });
        debug!(function = %function, program = %spec.command[0], "running manifest command");

        let mut command = Command::new(&spec.command[0]);
        command.args(&spec.command[1..]).envs(&spec.env);
        if let Some(dir) = &self.base_dir {
            command.current_dir(dir);
        }
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                CallError::new(
                    error_kinds::COMMAND_FAILED,
                    format!("failed to spawn {}: {}", spec.command[0], e),
                )
            })?;

        // Feed stdin from a separate thread so a chatty command cannot
        // deadlock against a full stdout pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let payload = input.to_string();
            std::thread::spawn(move || {
                if let Err(e) = stdin.write_all(payload.as_bytes()) {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        warn!(error = %e, "failed to write command input");
                    }
                }
            })
        });

        let output = child.wait_with_output().map_err(|e| {
            CallError::new(
                error_kinds::COMMAND_FAILED,
                format!("failed to wait for {}: {}", spec.command[0], e),
            )
        })?;
        if let Some(writer) = writer {
            let _ = writer.join();
        }

        if !output.status.success() {
            return Err(CallError::new(
                error_kinds::COMMAND_FAILED,
                format!(
                    "command {} exited with status {}",
                    spec.command[0],
                    output.status.code().unwrap_or(-1)
                ),
            ));
        }
        if output.stdout.len() > MAX_RESULT_SIZE {
            return Err(CallError::new(
                error_kinds::COMMAND_FAILED,
                format!("command output exceeds {MAX_RESULT_SIZE} bytes"),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        trace!(stdout = %stdout, "command output");
        Ok(parse_result(stdout))
    }

    fn functions(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }
}

fn parse_result(stdout: &str) -> Value {
    if stdout.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string()))
}

/// Loads [`CommandModule`]s from `.toml` manifest paths.
///
/// Relative paths are resolved against the base directory, if one is set,
/// and the worker's working directory otherwise.
#[derive(Debug, Default)]
pub struct ManifestLoader {
    base_dir: Option<PathBuf>,
}

impl ManifestLoader {
    /// Create a loader resolving relative paths against the working directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `dir`.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl ModuleLoader for ManifestLoader {
    fn load(&self, path: &str) -> Result<Arc<dyn Module>> {
        let resolved = self.resolve(path);
        let is_manifest = resolved.extension().is_some_and(|ext| ext == "toml");
        if !is_manifest || !resolved.is_file() {
            return Err(CallError::new(
                error_kinds::MODULE_NOT_FOUND,
                format!("no manifest at {}", resolved.display()),
            ));
        }
        debug!(path = %resolved.display(), "loading manifest module");
        Ok(Arc::new(CommandModule::from_file(&resolved)?))
    }
}
