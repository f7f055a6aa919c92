//! Environment and manager configuration.

use crate::error::CoreError;
use marsh_protocol::DEFAULT_MAX_FRAME_LENGTH;
use std::path::PathBuf;
use std::time::Duration;

/// Default worker program, looked up on `PATH`.
pub const DEFAULT_WORKER: &str = "marsh-agent";

/// Configuration for launching and driving one environment.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Worker program (default: `marsh-agent`).
    pub worker_program: PathBuf,
    /// Extra arguments appended after the environment name.
    pub worker_args: Vec<String>,
    /// Deadline for spawn + handshake (default: 30s).
    pub launch_timeout: Duration,
    /// First connect retry interval (default: 100ms), doubled per attempt.
    pub connect_retry_interval: Duration,
    /// Upper bound for the connect retry interval (default: 1s).
    pub connect_retry_max_interval: Duration,
    /// Maximum connect attempts (default: 50).
    pub max_connect_attempts: u32,
    /// Timeout applied to calls that do not set their own.
    pub default_call_timeout: Option<Duration>,
    /// Time the worker gets to exit after shutdown (default: 2s).
    pub exit_grace: Duration,
    /// How long output stays attributed to a call after its response (default: 10ms).
    pub log_linger: Duration,
    /// Maximum frame size on the channel (default: 64 MiB).
    pub max_frame_length: usize,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            worker_program: PathBuf::from(DEFAULT_WORKER),
            worker_args: Vec::new(),
            launch_timeout: Duration::from_secs(30),
            connect_retry_interval: Duration::from_millis(100),
            connect_retry_max_interval: Duration::from_secs(1),
            max_connect_attempts: 50,
            default_call_timeout: None,
            exit_grace: Duration::from_secs(2),
            log_linger: Duration::from_millis(10),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl EnvironmentConfig {
    /// Create a new config builder.
    pub fn builder() -> EnvironmentConfigBuilder {
        EnvironmentConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.worker_program.as_os_str().is_empty() {
            return Err(CoreError::Config("worker_program is required".into()));
        }
        if self.launch_timeout.is_zero() {
            return Err(CoreError::Config("launch_timeout must be > 0".into()));
        }
        if self.connect_retry_interval.is_zero() {
            return Err(CoreError::Config("connect_retry_interval must be > 0".into()));
        }
        if self.connect_retry_max_interval < self.connect_retry_interval {
            return Err(CoreError::Config(
                "connect_retry_max_interval must be >= connect_retry_interval".into(),
            ));
        }
        if self.max_connect_attempts == 0 {
            return Err(CoreError::Config("max_connect_attempts must be > 0".into()));
        }
        if self.max_frame_length == 0 {
            return Err(CoreError::Config("max_frame_length must be > 0".into()));
        }
        Ok(())
    }

    /// Retry interval before connect attempt `attempt` (1-based).
    pub(crate) fn retry_interval(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.connect_retry_interval
            .saturating_mul(factor)
            .min(self.connect_retry_max_interval)
    }
}

/// Builder for EnvironmentConfig.
#[derive(Debug, Default)]
pub struct EnvironmentConfigBuilder {
    config: EnvironmentConfig,
}

impl EnvironmentConfigBuilder {
    /// Set the worker program.
    pub fn worker_program(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.worker_program = path.into();
        self
    }

    /// Append an extra worker argument.
    pub fn worker_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.worker_args.push(arg.into());
        self
    }

    /// Set the launch deadline.
    pub fn launch_timeout(mut self, timeout: Duration) -> Self {
        self.config.launch_timeout = timeout;
        self
    }

    /// Set the initial and maximum connect retry intervals.
    pub fn connect_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.config.connect_retry_interval = initial;
        self.config.connect_retry_max_interval = max;
        self
    }

    /// Set the maximum number of connect attempts.
    pub fn max_connect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_connect_attempts = attempts;
        self
    }

    /// Set the default call timeout.
    pub fn default_call_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_call_timeout = Some(timeout);
        self
    }

    /// Set the exit grace period.
    pub fn exit_grace(mut self, grace: Duration) -> Self {
        self.config.exit_grace = grace;
        self
    }

    /// Set the log linger period.
    pub fn log_linger(mut self, linger: Duration) -> Self {
        self.config.log_linger = linger;
        self
    }

    /// Set the maximum frame length.
    pub fn max_frame_length(mut self, length: usize) -> Self {
        self.config.max_frame_length = length;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<EnvironmentConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration for the environment manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory holding provisioned environments (default: `./marsh`).
    pub instance_dir: PathBuf,
    /// Configuration applied to every environment.
    pub environment: EnvironmentConfig,
    /// Maximum tracked environments, 0 for unlimited.
    pub max_environments: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            instance_dir: PathBuf::from("marsh"),
            environment: EnvironmentConfig::default(),
            max_environments: 0,
        }
    }
}

impl ManagerConfig {
    /// Create a config rooted at `instance_dir`.
    pub fn new(instance_dir: impl Into<PathBuf>) -> Self {
        Self {
            instance_dir: instance_dir.into(),
            ..Default::default()
        }
    }

    /// Set the per-environment configuration.
    pub fn with_environment(mut self, environment: EnvironmentConfig) -> Self {
        self.environment = environment;
        self
    }

    /// Set the maximum number of tracked environments.
    pub fn with_max_environments(mut self, max: usize) -> Self {
        self.max_environments = max;
        self
    }

    /// Directory in which environment `name` is provisioned.
    pub fn env_dir(&self, name: &str) -> PathBuf {
        self.instance_dir.join("envs").join(name)
    }
}
