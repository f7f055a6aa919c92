//! Provisioning of environment runtimes.
//!
//! A [`Provisioner`] turns an environment name and a [`DependencySpec`] into a
//! runtime directory the worker can be started in. The default
//! [`ScriptProvisioner`] runs configurable install commands through a
//! generated shell script, so any package manager can be plugged in.

use crate::dependency::DependencySpec;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// File recording what was installed into a runtime directory.
pub const DEPENDENCIES_FILE: &str = "dependencies.json";

/// Name of the generated install script.
const INSTALL_SCRIPT: &str = "install.sh";

/// Name of the generated script for [`Provisioner::execute_commands`].
const COMMANDS_SCRIPT: &str = "commands.sh";

/// Message printed by generated scripts when a command fails.
const ERROR_MESSAGE: &str = "Errors encountered during execution. Exited with status:";

/// Result of provisioning an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedRuntime {
    /// Runtime directory; the worker's working directory.
    pub root_path: PathBuf,
    /// Shell command run before the worker is exec'd, if any.
    pub activation_command: Option<String>,
    /// What the runtime now contains.
    pub installed: DependencySpec,
}

/// Creates, extends and removes runtimes.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provision environment `name` so it satisfies `spec`.
    async fn provision(&self, name: &str, spec: &DependencySpec) -> Result<ProvisionedRuntime>;

    /// Adopt an existing runtime directory without installing anything.
    ///
    /// The installed record is read from [`DEPENDENCIES_FILE`] when present.
    async fn load(&self, name: &str, root: &Path) -> Result<ProvisionedRuntime> {
        let installed = adopt(name, root).await?;
        Ok(ProvisionedRuntime {
            root_path: root.to_path_buf(),
            activation_command: None,
            installed,
        })
    }

    /// Install `spec` into an existing runtime.
    ///
    /// Returns the runtime with its installed record updated.
    async fn install(
        &self,
        name: &str,
        runtime: &ProvisionedRuntime,
        spec: &DependencySpec,
    ) -> Result<ProvisionedRuntime>;

    /// Run shell `commands` inside a runtime, after its activation command.
    ///
    /// Returns the combined output lines.
    async fn execute_commands(
        &self,
        name: &str,
        runtime: &ProvisionedRuntime,
        commands: &[String],
    ) -> Result<Vec<String>>;

    /// Remove a provisioned runtime.
    async fn remove(&self, runtime: &ProvisionedRuntime) -> Result<()> {
        match tokio::fs::remove_dir_all(&runtime.root_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Provisioner that runs install command templates in a generated script.
///
/// Templates may use `{name}` (environment name), `{root}` (runtime
/// directory) and `{packages}` (requested packages as separate words).
/// Every substituted value is shell-quoted.
#[derive(Debug, Clone)]
pub struct ScriptProvisioner {
    instance_dir: PathBuf,
    install_commands: Vec<String>,
    update_commands: Vec<String>,
    activation: Option<String>,
    shell: String,
}

impl ScriptProvisioner {
    /// Provision under `<instance_dir>/envs/<name>`.
    pub fn new(instance_dir: impl Into<PathBuf>) -> Self {
        Self {
            instance_dir: instance_dir.into(),
            install_commands: Vec::new(),
            update_commands: Vec::new(),
            activation: None,
            shell: "bash".to_string(),
        }
    }

    /// Add an install command template.
    pub fn install_command(mut self, template: impl Into<String>) -> Self {
        self.install_commands.push(template.into());
        self
    }

    /// Add a template used to install packages into an existing runtime.
    ///
    /// Without any, [`Provisioner::install`] runs the install commands.
    pub fn update_command(mut self, template: impl Into<String>) -> Self {
        self.update_commands.push(template.into());
        self
    }

    /// Set the activation command template.
    pub fn activation(mut self, template: impl Into<String>) -> Self {
        self.activation = Some(template.into());
        self
    }

    /// Shell used to run generated scripts (default: `bash`).
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Runtime directory for `name`.
    pub fn env_dir(&self, name: &str) -> PathBuf {
        self.instance_dir.join("envs").join(name)
    }

    /// Render the install script for `name`.
    pub fn render_script(&self, name: &str, root: &Path, spec: &DependencySpec) -> String {
        render_install(&self.install_commands, name, root, spec)
    }

    fn activation_for(&self, name: &str, root: &Path, installed: &DependencySpec) -> Option<String> {
        self.activation
            .as_deref()
            .map(|template| render_template(template, name, root, installed))
    }

    /// Run a generated script in `root`; on failure the error carries the
    /// script's last error line.
    async fn run_script(&self, name: &str, script: &Path, root: &Path) -> std::result::Result<Vec<String>, String> {
        let mut child = Command::new(&self.shell)
            .arg(script)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to run {}: {e}", self.shell))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut lines = Vec::new();
        let (out, err) = tokio::join!(log_lines(name, stdout), log_lines(name, stderr));
        lines.extend(out);
        lines.extend(err);

        let status = child.wait().await.map_err(|e| e.to_string())?;
        if !status.success() {
            return Err(lines
                .iter()
                .rev()
                .find(|line| line.starts_with(ERROR_MESSAGE))
                .cloned()
                .unwrap_or_else(|| format!("script exited with {status}")));
        }
        Ok(lines)
    }

    /// Write and run the install script for `spec` in `root`.
    async fn run_install(&self, name: &str, root: &Path, templates: &[String], spec: &DependencySpec) -> Result<()> {
        if templates.is_empty() {
            return Ok(());
        }
        let script = root.join(INSTALL_SCRIPT);
        tokio::fs::write(&script, render_install(templates, name, root, spec)).await?;
        self.run_script(name, &script, root)
            .await
            .map(|_| ())
            .map_err(|message| CoreError::Provisioning {
                env: name.to_string(),
                message,
            })
    }
}

#[async_trait]
impl Provisioner for ScriptProvisioner {
    async fn provision(&self, name: &str, spec: &DependencySpec) -> Result<ProvisionedRuntime> {
        validate_name(name)?;
        let root = self.env_dir(name);
        tokio::fs::create_dir_all(&root).await?;

        let previous = read_installed(&root).await;
        if let Some(installed) = &previous {
            if spec.is_satisfied_by(installed) {
                debug!(env = %name, root = %root.display(), "runtime already satisfies dependencies");
                return Ok(ProvisionedRuntime {
                    activation_command: self.activation_for(name, &root, installed),
                    root_path: root,
                    installed: installed.clone(),
                });
            }
        }

        info!(env = %name, packages = %spec.packages(), "provisioning runtime");
        self.run_install(name, &root, &self.install_commands, spec).await?;

        let installed = match previous {
            Some(previous) => previous.merged(spec),
            None => spec.clone(),
        };
        write_installed(&root, &installed).await?;
        info!(env = %name, root = %root.display(), "runtime provisioned");

        Ok(ProvisionedRuntime {
            activation_command: self.activation_for(name, &root, &installed),
            root_path: root,
            installed,
        })
    }

    async fn load(&self, name: &str, root: &Path) -> Result<ProvisionedRuntime> {
        let installed = adopt(name, root).await?;
        info!(env = %name, root = %root.display(), "runtime loaded");
        Ok(ProvisionedRuntime {
            activation_command: self.activation_for(name, root, &installed),
            root_path: root.to_path_buf(),
            installed,
        })
    }

    async fn install(
        &self,
        name: &str,
        runtime: &ProvisionedRuntime,
        spec: &DependencySpec,
    ) -> Result<ProvisionedRuntime> {
        if spec.is_satisfied_by(&runtime.installed) {
            debug!(env = %name, "dependencies already installed");
            return Ok(runtime.clone());
        }

        let root = &runtime.root_path;
        info!(env = %name, packages = %spec.packages(), "installing into runtime");
        let templates = if self.update_commands.is_empty() {
            &self.install_commands
        } else {
            &self.update_commands
        };
        self.run_install(name, root, templates, spec).await?;

        let installed = runtime.installed.merged(spec);
        write_installed(root, &installed).await?;
        Ok(ProvisionedRuntime {
            installed,
            ..runtime.clone()
        })
    }

    async fn execute_commands(
        &self,
        name: &str,
        runtime: &ProvisionedRuntime,
        commands: &[String],
    ) -> Result<Vec<String>> {
        let root = &runtime.root_path;
        let activation = runtime.activation_command.clone().into_iter();
        let body = checked_script(
            &["exec 2>&1".to_string()],
            activation.chain(commands.iter().cloned()),
        );

        let script = root.join(COMMANDS_SCRIPT);
        tokio::fs::write(&script, body).await?;
        debug!(env = %name, count = commands.len(), "executing commands");
        self.run_script(name, &script, root)
            .await
            .map_err(|message| CoreError::CommandFailed {
                env: name.to_string(),
                message,
            })
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::Provisioning {
            env: name.to_string(),
            message: "environment names may only contain letters, digits, '-', '_' and '.'".into(),
        })
    }
}

async fn adopt(name: &str, root: &Path) -> Result<DependencySpec> {
    validate_name(name)?;
    match tokio::fs::metadata(root).await {
        Ok(meta) if meta.is_dir() => Ok(read_installed(root).await.unwrap_or_default()),
        _ => Err(CoreError::Provisioning {
            env: name.to_string(),
            message: format!("the environment {} was not found", root.display()),
        }),
    }
}

async fn read_installed(root: &Path) -> Option<DependencySpec> {
    let bytes = tokio::fs::read(root.join(DEPENDENCIES_FILE)).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(spec) => Some(spec),
        Err(e) => {
            warn!(root = %root.display(), error = %e, "ignoring unreadable dependency record");
            None
        }
    }
}

async fn write_installed(root: &Path, installed: &DependencySpec) -> Result<()> {
    tokio::fs::write(root.join(DEPENDENCIES_FILE), serde_json::to_vec_pretty(installed)?).await?;
    Ok(())
}

async fn log_lines<R: AsyncRead + Unpin>(name: &str, stream: Option<R>) -> Vec<String> {
    let mut seen = Vec::new();
    let Some(stream) = stream else {
        return seen;
    };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(env = %name, "{}", line);
        seen.push(line);
    }
    seen
}

/// Script running `preamble` as is, then every command followed by an
/// exit-status check.
fn checked_script(preamble: &[String], commands: impl Iterator<Item = String>) -> String {
    let mut lines = vec!["#!/usr/bin/env bash".to_string(), String::new()];
    lines.extend(preamble.iter().cloned());
    for command in commands {
        lines.push(command);
        lines.extend(error_check_lines());
    }
    lines.join("\n")
}

fn render_install(templates: &[String], name: &str, root: &Path, spec: &DependencySpec) -> String {
    checked_script(
        &[],
        templates
            .iter()
            .map(|template| render_template(template, name, root, spec)),
    )
}

fn error_check_lines() -> Vec<String> {
    vec![
        String::new(),
        "return_status=$?".to_string(),
        "if [ $return_status -ne 0 ]".to_string(),
        "then".to_string(),
        format!("    echo \"{ERROR_MESSAGE} $return_status\""),
        "    exit 1".to_string(),
        "fi".to_string(),
        String::new(),
    ]
}

fn render_template(template: &str, name: &str, root: &Path, spec: &DependencySpec) -> String {
    let packages = spec
        .dependencies
        .iter()
        .map(|d| shell_quote(&d.to_string()))
        .collect::<Vec<_>>()
        .join(" ");
    template
        .replace("{name}", &shell_quote(name))
        .replace("{root}", &shell_quote(&root.to_string_lossy()))
        .replace("{packages}", &packages)
}

/// Quote `value` for a POSIX shell.
pub(crate) fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("numpy==1.26"), "numpy==1.26");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_render_script_inserts_checks() {
        let provisioner = ScriptProvisioner::new("/srv")
            .install_command("micromamba create -p {root} {packages}")
            .install_command("touch {root}/done");
        let spec = DependencySpec::parse(["numpy==1.26", "requests"]).unwrap();
        let script = provisioner.render_script("e", Path::new("/srv/envs/e"), &spec);

        assert!(script.contains("micromamba create -p /srv/envs/e numpy==1.26 requests"));
        assert_eq!(script.matches("return_status=$?").count(), 2);
        assert!(script.contains(ERROR_MESSAGE));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("data-env_1.2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[tokio::test]
    async fn test_provision_records_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = ScriptProvisioner::new(dir.path())
            .install_command("echo installing {packages} > {root}/log.txt")
            .activation("cd {root}");
        let spec = DependencySpec::parse(["a==1"]).unwrap();

        let runtime = provisioner.provision("e", &spec).await.unwrap();
        assert_eq!(runtime.root_path, dir.path().join("envs").join("e"));
        assert_eq!(runtime.installed, spec);
        assert!(runtime.activation_command.unwrap().starts_with("cd "));

        let log = std::fs::read_to_string(runtime.root_path.join("log.txt")).unwrap();
        assert_eq!(log.trim(), "installing a==1");
        assert_eq!(read_installed(&runtime.root_path).await, Some(spec));
    }

    #[tokio::test]
    async fn test_provision_skips_install_when_satisfied() {
        let dir = tempfile::tempdir().unwrap();
        let spec = DependencySpec::parse(["a==1.2"]).unwrap();
        ScriptProvisioner::new(dir.path())
            .provision("e", &spec)
            .await
            .unwrap();

        // A failing command proves the script is not run again.
        let runtime = ScriptProvisioner::new(dir.path())
            .install_command("exit 1")
            .provision("e", &DependencySpec::parse(["a==1"]).unwrap())
            .await
            .unwrap();
        assert_eq!(runtime.installed, spec);
    }

    #[tokio::test]
    async fn test_provision_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = ScriptProvisioner::new(dir.path())
            .install_command("false")
            .install_command("echo never")
            .provision("e", &DependencySpec::new())
            .await
            .unwrap_err();

        match err {
            CoreError::Provisioning { env, message } => {
                assert_eq!(env, "e");
                assert_eq!(message, format!("{ERROR_MESSAGE} 1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_remove_deletes_root() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = ScriptProvisioner::new(dir.path());
        let runtime = provisioner.provision("e", &DependencySpec::new()).await.unwrap();
        assert!(runtime.root_path.exists());

        provisioner.remove(&runtime).await.unwrap();
        assert!(!runtime.root_path.exists());
        // Removing twice is fine.
        provisioner.remove(&runtime).await.unwrap();
    }

    #[tokio::test]
    async fn test_reprovision_merges_record() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = ScriptProvisioner::new(dir.path()).install_command("true");
        provisioner
            .provision("e", &DependencySpec::parse(["a==1"]).unwrap())
            .await
            .unwrap();
        let runtime = provisioner
            .provision("e", &DependencySpec::parse(["b==2"]).unwrap())
            .await
            .unwrap();

        assert_eq!(runtime.installed.packages(), "a==1 b==2");
        assert_eq!(read_installed(&runtime.root_path).await, Some(runtime.installed.clone()));

        // Both are recorded, so asking for `a` again installs nothing.
        let again = ScriptProvisioner::new(dir.path())
            .install_command("exit 1")
            .provision("e", &DependencySpec::parse(["a"]).unwrap())
            .await
            .unwrap();
        assert_eq!(again.installed, runtime.installed);
    }

    #[tokio::test]
    async fn test_load_adopts_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("elsewhere");
        std::fs::create_dir(&root).unwrap();
        let provisioner = ScriptProvisioner::new(dir.path()).activation("cd {root}");

        let runtime = provisioner.load("e", &root).await.unwrap();
        assert_eq!(runtime.root_path, root);
        assert!(runtime.installed.is_empty());
        assert!(runtime.activation_command.unwrap().starts_with("cd "));

        write_installed(&root, &DependencySpec::parse(["a==1"]).unwrap())
            .await
            .unwrap();
        let runtime = provisioner.load("e", &root).await.unwrap();
        assert_eq!(runtime.installed.packages(), "a==1");

        let err = provisioner
            .load("e", &dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Provisioning { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_install_into_existing_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = ScriptProvisioner::new(dir.path())
            .install_command("echo create > {root}/log.txt")
            .update_command("echo add {packages} >> {root}/log.txt");
        let runtime = provisioner
            .provision("e", &DependencySpec::parse(["a==1"]).unwrap())
            .await
            .unwrap();

        let updated = provisioner
            .install("e", &runtime, &DependencySpec::parse(["b"]).unwrap())
            .await
            .unwrap();
        assert_eq!(updated.installed.packages(), "a==1 b");
        assert_eq!(updated.root_path, runtime.root_path);
        assert_eq!(read_installed(&runtime.root_path).await, Some(updated.installed.clone()));

        // Already satisfied: no script runs.
        let same = provisioner
            .install("e", &updated, &DependencySpec::parse(["a"]).unwrap())
            .await
            .unwrap();
        assert_eq!(same, updated);

        let log = std::fs::read_to_string(runtime.root_path.join("log.txt")).unwrap();
        assert_eq!(log.lines().collect::<Vec<_>>(), ["create", "add b"]);
    }

    #[tokio::test]
    async fn test_execute_commands_after_activation() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = ScriptProvisioner::new(dir.path()).activation("export MARSH_ACTIVE={name}");
        let runtime = provisioner.provision("e", &DependencySpec::new()).await.unwrap();

        let output = provisioner
            .execute_commands(
                "e",
                &runtime,
                &["echo active=$MARSH_ACTIVE".to_string(), "echo oops >&2".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(output, ["active=e", "oops"]);

        let err = provisioner
            .execute_commands("e", &runtime, &["false".to_string(), "echo never".to_string()])
            .await
            .unwrap_err();
        match err {
            CoreError::CommandFailed { env, message } => {
                assert_eq!(env, "e");
                assert_eq!(message, format!("{ERROR_MESSAGE} 1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
