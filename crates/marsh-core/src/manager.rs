//! Environment manager: named registry of environments.

use crate::config::ManagerConfig;
use crate::dependency::DependencySpec;
use crate::environment::{Environment, EnvironmentDescriptor, EnvironmentState};
use crate::error::{CoreError, Result};
use crate::provision::{Provisioner, ScriptProvisioner};
use crate::spawn::{ProcessSpawner, Spawner};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Manages named environments.
///
/// The manager provisions environments through its [`Provisioner`], hands
/// out [`Environment`] handles and keeps track of them until they are
/// deleted or shut down.
///
/// # Thread Safety
///
/// EnvironmentManager uses an async RwLock internally and is safe to share
/// across tasks. Registration holds the write lock while provisioning, so
/// two tasks asking for the same name never provision it twice.
pub struct EnvironmentManager {
    environments: Arc<RwLock<HashMap<String, Environment>>>,
    provisioner: Arc<dyn Provisioner>,
    spawner: Arc<dyn Spawner>,
    config: ManagerConfig,
}

impl EnvironmentManager {
    /// Create a manager provisioning with a [`ScriptProvisioner`] (no
    /// install commands) and spawning local processes.
    pub fn new(config: ManagerConfig) -> Self {
        let provisioner = Arc::new(ScriptProvisioner::new(&config.instance_dir));
        Self::with_capabilities(config, provisioner, Arc::new(ProcessSpawner))
    }

    /// Create a manager with explicit provisioning and spawning capabilities.
    pub fn with_capabilities(
        config: ManagerConfig,
        provisioner: Arc<dyn Provisioner>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        tracing::info!(instance_dir = %config.instance_dir.display(), "Creating environment manager");
        Self {
            environments: Arc::new(RwLock::new(HashMap::new())),
            provisioner,
            spawner,
            config,
        }
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Get the environment `name`, provisioning it if needed.
    ///
    /// An existing environment whose installed dependencies satisfy `spec`
    /// is returned unchanged. Otherwise the runtime is provisioned and a new
    /// environment in the `Created` state is returned; an environment
    /// previously registered under `name` is exited and replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if provisioning fails or the max_environments limit
    /// is reached.
    pub async fn register_or_get(&self, name: &str, spec: &DependencySpec) -> Result<Environment> {
        let mut environments = self.environments.write().await;

        let previous = environments.get(name).cloned();
        if let Some(existing) = &previous {
            if existing.state() != EnvironmentState::Exited && spec.is_satisfied_by(&existing.installed()) {
                tracing::debug!(env = %name, "Reusing environment");
                return Ok(existing.clone());
            }
        } else {
            self.check_capacity(environments.len())?;
        }

        let runtime = self.provisioner.provision(name, spec).await?;
        let env = Environment::new(
            name,
            runtime,
            self.config.environment.clone(),
            self.spawner.clone(),
        );

        if let Some(previous) = previous {
            tracing::info!(env = %name, "Replacing environment with unsatisfied dependencies");
            previous.exit().await;
        }
        environments.insert(name.to_string(), env.clone());

        tracing::info!(env = %name, "Environment registered");
        Ok(env)
    }

    /// Track an existing runtime at `root` under `name` without provisioning.
    ///
    /// An environment already tracked under `name` is returned as is.
    pub async fn load(&self, name: &str, root: &Path) -> Result<Environment> {
        let mut environments = self.environments.write().await;
        if let Some(existing) = environments.get(name) {
            return Ok(existing.clone());
        }
        self.check_capacity(environments.len())?;

        let runtime = self.provisioner.load(name, root).await?;
        let env = Environment::new(
            name,
            runtime,
            self.config.environment.clone(),
            self.spawner.clone(),
        );
        environments.insert(name.to_string(), env.clone());
        tracing::info!(env = %name, root = %root.display(), "Environment loaded");
        Ok(env)
    }

    /// Install `spec` into the tracked environment `name`.
    ///
    /// The environment keeps running; only its installed record changes.
    /// Returns the updated record.
    pub async fn install(&self, name: &str, spec: &DependencySpec) -> Result<DependencySpec> {
        let env = self.get(name).await?;
        let runtime = self.provisioner.install(name, &env.runtime(), spec).await?;
        env.set_installed(runtime.installed.clone());
        tracing::info!(env = %name, packages = %spec.packages(), "Dependencies installed");
        Ok(runtime.installed)
    }

    /// Run shell `commands` inside the tracked environment `name`.
    ///
    /// Returns the output lines.
    pub async fn execute_commands(&self, name: &str, commands: &[String]) -> Result<Vec<String>> {
        let env = self.get(name).await?;
        self.provisioner
            .execute_commands(name, &env.runtime(), commands)
            .await
    }

    fn check_capacity(&self, tracked: usize) -> Result<()> {
        if self.config.max_environments > 0 && tracked >= self.config.max_environments {
            return Err(CoreError::Config(format!(
                "max environment limit reached ({})",
                self.config.max_environments
            )));
        }
        Ok(())
    }

    /// Get a tracked environment.
    pub async fn get(&self, name: &str) -> Result<Environment> {
        let environments = self.environments.read().await;
        environments
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(name.to_string()))
    }

    /// Check if an environment is tracked.
    pub async fn exists(&self, name: &str) -> bool {
        let environments = self.environments.read().await;
        environments.contains_key(name)
    }

    /// Exit an environment, stop tracking it and remove its runtime.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let env = {
            let mut environments = self.environments.write().await;
            environments
                .remove(name)
                .ok_or_else(|| CoreError::NotFound(name.to_string()))?
        };
        env.exit().await;
        self.provisioner.remove(&env.runtime()).await?;
        tracing::info!(env = %name, "Environment deleted");
        Ok(())
    }

    /// Exit every tracked environment.
    ///
    /// Every environment is attempted; failures are collected into one
    /// [`CoreError::Shutdown`].
    pub async fn shutdown_all(&self) -> Result<()> {
        let environments = {
            let mut guard = self.environments.write().await;
            std::mem::take(&mut *guard)
        };

        let count = environments.len();
        tracing::info!(count = count, "Shutting down all environments");

        let mut failures = Vec::new();
        for (name, env) in environments {
            if let Err(e) = env.try_exit().await {
                tracing::error!(env = %name, error = %e, "Failed to shut down environment");
                failures.push((name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Shutdown(failures))
        }
    }

    /// Descriptors of all tracked environments, sorted by name.
    pub async fn list(&self) -> Vec<EnvironmentDescriptor> {
        let environments = self.environments.read().await;
        let mut descriptors: Vec<_> = environments.values().map(Environment::descriptor).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Number of tracked environments.
    pub async fn count(&self) -> usize {
        let environments = self.environments.read().await;
        environments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentConfig;
    use crate::provision::ProvisionedRuntime;
    use crate::spawn::testing::ShellSpawner;
    use marsh_protocol::handshake;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every provisioning; installs exactly what was asked for.
    #[derive(Default)]
    struct FakeProvisioner {
        provisioned: AtomicUsize,
        installs: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn provision(&self, name: &str, spec: &DependencySpec) -> Result<ProvisionedRuntime> {
            if name == "broken" {
                return Err(CoreError::Provisioning {
                    env: name.to_string(),
                    message: "solver failed".into(),
                });
            }
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(ProvisionedRuntime {
                root_path: std::env::temp_dir().join(name),
                activation_command: None,
                installed: spec.clone(),
            })
        }

        async fn install(
            &self,
            _name: &str,
            runtime: &ProvisionedRuntime,
            spec: &DependencySpec,
        ) -> Result<ProvisionedRuntime> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(ProvisionedRuntime {
                installed: runtime.installed.merged(spec),
                ..runtime.clone()
            })
        }

        async fn execute_commands(
            &self,
            name: &str,
            _runtime: &ProvisionedRuntime,
            commands: &[String],
        ) -> Result<Vec<String>> {
            Ok(commands.iter().map(|c| format!("{name}: {c}")).collect())
        }

        async fn remove(&self, _runtime: &ProvisionedRuntime) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager(max: usize) -> (EnvironmentManager, Arc<FakeProvisioner>) {
        let provisioner = Arc::new(FakeProvisioner::default());
        let manager = EnvironmentManager::with_capabilities(
            ManagerConfig::new("/tmp/marsh-test").with_max_environments(max),
            provisioner.clone(),
            Arc::new(ProcessSpawner),
        );
        (manager, provisioner)
    }

    fn spec(items: &[&str]) -> DependencySpec {
        DependencySpec::parse(items).unwrap()
    }

    #[tokio::test]
    async fn test_register_or_get_reuses_satisfied() {
        let (manager, provisioner) = manager(0);
        let first = manager.register_or_get("e", &spec(&["numpy==1.26.4"])).await.unwrap();
        let second = manager.register_or_get("e", &spec(&["numpy==1.26"])).await.unwrap();

        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 1);
        assert_eq!(first.descriptor(), second.descriptor());
        assert_eq!(second.state(), EnvironmentState::Created);
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn test_register_or_get_replaces_unsatisfied() {
        let (manager, provisioner) = manager(0);
        let first = manager.register_or_get("e", &spec(&["numpy"])).await.unwrap();
        let second = manager.register_or_get("e", &spec(&["scipy"])).await.unwrap();

        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 2);
        assert_eq!(first.state(), EnvironmentState::Exited);
        assert_eq!(second.state(), EnvironmentState::Created);
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn test_provisioning_error_propagates() {
        let (manager, _) = manager(0);
        let err = manager
            .register_or_get("broken", &DependencySpec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Provisioning { .. }));
        assert!(!manager.exists("broken").await);
    }

    #[tokio::test]
    async fn test_max_environments() {
        let (manager, _) = manager(1);
        manager.register_or_get("a", &DependencySpec::new()).await.unwrap();
        // Re-registering a tracked name is not a new environment.
        manager.register_or_get("a", &DependencySpec::new()).await.unwrap();
        let err = manager
            .register_or_get("b", &DependencySpec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[tokio::test]
    async fn test_get_list_delete() {
        let (manager, provisioner) = manager(0);
        manager.register_or_get("b", &DependencySpec::new()).await.unwrap();
        manager.register_or_get("a", &DependencySpec::new()).await.unwrap();

        let names: Vec<_> = manager.list().await.into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(manager.get("a").await.unwrap().name(), "a");

        let env = manager.get("a").await.unwrap();
        manager.delete("a").await.unwrap();
        assert_eq!(env.state(), EnvironmentState::Exited);
        assert_eq!(provisioner.removed.load(Ordering::SeqCst), 1);
        assert!(matches!(manager.get("a").await, Err(CoreError::NotFound(_))));
        assert!(matches!(manager.delete("a").await, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_shutdown_all_exits_everything() {
        let (manager, _) = manager(0);
        let a = manager.register_or_get("a", &DependencySpec::new()).await.unwrap();
        let b = manager.register_or_get("b", &DependencySpec::new()).await.unwrap();

        manager.shutdown_all().await.unwrap();
        assert_eq!(a.state(), EnvironmentState::Exited);
        assert_eq!(b.state(), EnvironmentState::Exited);
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test]
    async fn test_load_tracks_existing_runtime() {
        let (manager, provisioner) = manager(0);
        let dir = tempfile::tempdir().unwrap();

        let env = manager.load("l", dir.path()).await.unwrap();
        assert_eq!(env.state(), EnvironmentState::Created);
        assert_eq!(env.descriptor().root_path, dir.path());
        assert!(env.installed().is_empty());
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 0);

        let again = manager.load("l", &dir.path().join("ignored")).await.unwrap();
        assert_eq!(again.descriptor(), env.descriptor());

        let err = manager
            .load("m", &dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Provisioning { .. }), "{err}");
        assert!(!manager.exists("m").await);
    }

    #[tokio::test]
    async fn test_install_extends_tracked_environment() {
        let (manager, provisioner) = manager(0);
        let env = manager.register_or_get("e", &spec(&["numpy==1.26"])).await.unwrap();

        let installed = manager.install("e", &spec(&["scipy"])).await.unwrap();
        assert_eq!(installed.packages(), "numpy==1.26 scipy");
        assert_eq!(env.installed(), installed);
        assert_eq!(provisioner.installs.load(Ordering::SeqCst), 1);

        // The extended environment now satisfies the request and is reused.
        let same = manager.register_or_get("e", &spec(&["scipy"])).await.unwrap();
        assert_eq!(same.descriptor(), env.descriptor());
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 1);

        assert!(matches!(
            manager.install("nope", &spec(&["a"])).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_commands_in_environment() {
        let (manager, _) = manager(0);
        manager.register_or_get("e", &DependencySpec::new()).await.unwrap();

        let output = manager
            .execute_commands("e", &["echo hi".to_string()])
            .await
            .unwrap();
        assert_eq!(output, ["e: echo hi"]);
        assert!(matches!(
            manager.execute_commands("nope", &[]).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_all_collects_failures() {
        // A worker that announces an endpoint nobody serves and ignores
        // the shutdown request.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let line = handshake::endpoint_line(&listener.local_addr().unwrap());
        let config = EnvironmentConfig::builder()
            .worker_program("sh")
            .worker_arg("-c")
            .worker_arg(format!("echo '{line}'; exec sleep 5"))
            .launch_timeout(Duration::from_millis(500))
            .exit_grace(Duration::from_millis(200))
            .build()
            .unwrap();
        let manager = EnvironmentManager::with_capabilities(
            ManagerConfig::new("/tmp/marsh-test").with_environment(config),
            Arc::new(FakeProvisioner::default()),
            Arc::new(ShellSpawner),
        );

        let idle = manager.register_or_get("idle", &DependencySpec::new()).await.unwrap();
        let stubborn = manager.register_or_get("stubborn", &DependencySpec::new()).await.unwrap();
        stubborn.launch(None).await.unwrap();

        match manager.shutdown_all().await.unwrap_err() {
            CoreError::Shutdown(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "stubborn");
                assert!(matches!(failures[0].1, CoreError::ExitTimeout { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(idle.state(), EnvironmentState::Exited);
        assert_eq!(stubborn.state(), EnvironmentState::Exited);
        assert_eq!(manager.count().await, 0);
    }
}
