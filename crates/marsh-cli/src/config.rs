//! Configuration for the `marsh` command.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use marsh_core::{
    EnvironmentConfig, EnvironmentManager, ManagerConfig, ProcessSpawner, ScriptProvisioner,
    DEFAULT_WORKER,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the `marsh` command.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Directory holding provisioned environments.
    pub instance_dir: PathBuf,

    /// Worker program started in every environment.
    pub worker: PathBuf,

    /// Install command templates run when provisioning.
    pub install_commands: Vec<String>,

    /// Activation command template run before the worker.
    pub activation: Option<String>,

    /// Launch deadline.
    pub launch_timeout: Duration,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            instance_dir: PathBuf::from("marsh"),
            worker: PathBuf::from(DEFAULT_WORKER),
            install_commands: Vec::new(),
            activation: None,
            launch_timeout: Duration::from_secs(30),
        }
    }
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `MARSH_INSTANCE_DIR` | `marsh` |
    /// | `MARSH_WORKER` | `marsh-agent` |
    /// | `MARSH_INSTALL_COMMANDS` | none (one template per line) |
    /// | `MARSH_ACTIVATION` | none |
    /// | `MARSH_LAUNCH_TIMEOUT_SECS` | `30` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        Self {
            instance_dir: var("MARSH_INSTANCE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.instance_dir),
            worker: var("MARSH_WORKER")
                .map(PathBuf::from)
                .unwrap_or(default.worker),
            install_commands: var("MARSH_INSTALL_COMMANDS")
                .map(|v| {
                    v.lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(default.install_commands),
            activation: var("MARSH_ACTIVATION")
                .filter(|v| !v.trim().is_empty())
                .or(default.activation),
            launch_timeout: var("MARSH_LAUNCH_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(default.launch_timeout),
        }
    }

    /// Validate configuration but only log warnings instead of failing.
    pub fn validate_warn(&self) {
        if is_path_like(&self.worker) && !self.worker.exists() {
            tracing::warn!("Worker not found: {:?}", self.worker);
        }

        if let Some(parent) = self.instance_dir.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tracing::warn!("Instance directory parent not found: {:?}", parent);
            }
        }
    }

    /// Per-environment configuration.
    pub fn environment_config(&self) -> marsh_core::Result<EnvironmentConfig> {
        EnvironmentConfig::builder()
            .worker_program(&self.worker)
            .launch_timeout(self.launch_timeout)
            .build()
    }

    /// Build the environment manager.
    pub fn manager(&self) -> marsh_core::Result<EnvironmentManager> {
        let mut provisioner = ScriptProvisioner::new(&self.instance_dir);
        for command in &self.install_commands {
            provisioner = provisioner.install_command(command);
        }
        if let Some(activation) = &self.activation {
            provisioner = provisioner.activation(activation);
        }

        let config =
            ManagerConfig::new(&self.instance_dir).with_environment(self.environment_config()?);
        Ok(EnvironmentManager::with_capabilities(
            config,
            Arc::new(provisioner),
            Arc::new(ProcessSpawner),
        ))
    }
}

/// Bare program names are looked up on `PATH` and cannot be checked here.
fn is_path_like(path: &Path) -> bool {
    path.components().count() > 1
}
