//! Worker process spawning.

use crate::error::{CoreError, Result};
use crate::provision::shell_quote;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// What to start for an environment.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Environment name.
    pub env_name: String,
    /// Runtime directory, used as the working directory.
    pub root_path: PathBuf,
    /// Command run before the worker in the same shell.
    pub activation_command: Option<String>,
    /// Worker program.
    pub program: PathBuf,
    /// Worker arguments.
    pub args: Vec<String>,
}

/// A running worker with its standard streams.
#[derive(Debug)]
pub struct WorkerProcess {
    /// The child process.
    pub child: Child,
    /// Worker stdin, held open for the worker's lifetime.
    pub stdin: Option<ChildStdin>,
    /// Worker stdout.
    pub stdout: ChildStdout,
    /// Worker stderr.
    pub stderr: ChildStderr,
}

impl WorkerProcess {
    /// Take the streams out of a freshly spawned child.
    pub fn from_child(mut child: Child) -> std::io::Result<Self> {
        let missing = |stream: &str| {
            std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("worker {stream} is not piped"),
            )
        };
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let stdin = child.stdin.take();
        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    /// OS process id, while the process has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Starts worker processes.
pub trait Spawner: Send + Sync {
    /// Start the worker described by `request`.
    fn spawn(&self, request: &SpawnRequest) -> Result<WorkerProcess>;
}

/// Spawns workers as local child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpawner;

impl ProcessSpawner {
    /// Build the command for `request` without starting it.
    pub fn command(&self, request: &SpawnRequest) -> Command {
        let mut command = match &request.activation_command {
            Some(activation) => {
                let mut command = Command::new("sh");
                command
                    .arg("-c")
                    .arg(format!("{activation} && exec \"$0\" \"$@\""))
                    .arg(&request.program)
                    .args(&request.args);
                command
            }
            None => {
                let mut command = Command::new(&request.program);
                command.args(&request.args);
                command
            }
        };
        if request.root_path.is_dir() {
            command.current_dir(&request.root_path);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<WorkerProcess> {
        let spawn_error = |source| CoreError::Spawn {
            env: request.env_name.clone(),
            source,
        };
        let args: Vec<String> = request.args.iter().map(|a| shell_quote(a)).collect();
        tracing::debug!(
            env = %request.env_name,
            program = %request.program.display(),
            args = %args.join(" "),
            activation = request.activation_command.is_some(),
            "spawning worker"
        );
        let child = self.command(request).spawn().map_err(spawn_error)?;
        WorkerProcess::from_child(child).map_err(spawn_error)
    }
}
