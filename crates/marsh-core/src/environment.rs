//! Environment lifecycle.
//!
//! ```text
//!            launch()              exit()
//!  Created ───────────▶ Launched ───────────▶ Exited
//!     │                    │                    ▲
//!     │ launch failure     │ timeout, lost,     │ exit()
//!     ▼                    ▼ protocol error     │
//!   Failed ◀───────────────┘────────────────────┘
//!     │
//!     └── launch() relaunches
//! ```

use crate::channel::{ConnectionChannel, Reply};
use crate::config::EnvironmentConfig;
use crate::dependency::DependencySpec;
use crate::error::{CoreError, Result};
use crate::provision::ProvisionedRuntime;
use crate::proxy::ModuleProxy;
use crate::router::{LogRouter, LogSink, LogSource, RouterTasks, SinkId, StreamClosedHook};
use crate::spawn::{SpawnRequest, Spawner};
use marsh_protocol::{handshake, CallId, CallOutcome, CallRequest, Target};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStdin};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    /// Provisioned, no worker yet.
    Created,
    /// Worker running and connected.
    Launched,
    /// Torn down.
    Exited,
    /// Unusable until relaunched.
    Failed,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Launched => write!(f, "launched"),
            Self::Exited => write!(f, "exited"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why an environment failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The worker could not be launched.
    Launch,
    /// The worker or its connection went away.
    Lost,
    /// A call timed out; the worker's state is unknown.
    Timeout,
    /// The worker violated the protocol.
    Protocol,
}

/// Snapshot of an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDescriptor {
    /// Environment name.
    pub name: String,
    /// Runtime directory.
    pub root_path: PathBuf,
    /// Installed dependencies.
    pub dependencies: DependencySpec,
    /// Current state.
    pub state: EnvironmentState,
}

/// Per-call options for [`Environment::execute`].
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Sink receiving only the lines written while this call is in flight.
    pub log_sink: Option<Arc<dyn LogSink>>,
    /// Overrides the configured default call timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Options with no sink and the default timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a per-call sink.
    pub fn with_log_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.log_sink = Some(Arc::new(sink));
        self
    }

    /// Set the call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Lifecycle {
    state: EnvironmentState,
    failure: Option<(FailureCause, String)>,
    exit_requested: bool,
}

/// Everything owned by one running worker.
struct Session {
    child: Child,
    stdin: Option<ChildStdin>,
    tasks: RouterTasks,
}

struct Inner {
    name: String,
    runtime: ProvisionedRuntime,
    installed: Mutex<DependencySpec>,
    config: EnvironmentConfig,
    spawner: Arc<dyn Spawner>,
    router: LogRouter,
    lifecycle: Mutex<Lifecycle>,
    /// Incremented per launch; stale reader hooks compare against it.
    generation: AtomicU64,
    next_call_id: AtomicU64,
    channel: Mutex<Option<Arc<ConnectionChannel>>>,
    pid: Mutex<Option<u32>>,
    /// Serializes calls.
    exec_lock: tokio::sync::Mutex<()>,
    /// Serializes launch and exit.
    session: tokio::sync::Mutex<Option<Session>>,
}

/// Handle to one isolated runtime and its worker.
///
/// Handles are cheap to clone; all clones refer to the same environment.
/// The worker is killed when the last handle is dropped.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<Inner>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Environment {
    /// Create an environment in the `Created` state.
    pub fn new(
        name: impl Into<String>,
        runtime: ProvisionedRuntime,
        config: EnvironmentConfig,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(Inner {
                router: LogRouter::new(&name),
                name,
                installed: Mutex::new(runtime.installed.clone()),
                runtime,
                config,
                spawner,
                lifecycle: Mutex::new(Lifecycle {
                    state: EnvironmentState::Created,
                    failure: None,
                    exit_requested: false,
                }),
                generation: AtomicU64::new(0),
                next_call_id: AtomicU64::new(1),
                channel: Mutex::new(None),
                pid: Mutex::new(None),
                exec_lock: tokio::sync::Mutex::new(()),
                session: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Environment name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EnvironmentState {
        self.inner.lifecycle.lock().state
    }

    /// Why the environment failed, if it is `Failed`.
    pub fn failure(&self) -> Option<(FailureCause, String)> {
        let lifecycle = self.inner.lifecycle.lock();
        match lifecycle.state {
            EnvironmentState::Failed => lifecycle.failure.clone(),
            _ => None,
        }
    }

    /// Snapshot of name, root, installed dependencies and state.
    pub fn descriptor(&self) -> EnvironmentDescriptor {
        EnvironmentDescriptor {
            name: self.inner.name.clone(),
            root_path: self.inner.runtime.root_path.clone(),
            dependencies: self.installed(),
            state: self.state(),
        }
    }

    /// Process id of the running worker.
    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock()
    }

    /// Dependencies installed in the runtime.
    pub fn installed(&self) -> DependencySpec {
        self.inner.installed.lock().clone()
    }

    pub(crate) fn set_installed(&self, installed: DependencySpec) {
        *self.inner.installed.lock() = installed;
    }

    /// Runtime directory, activation and the current installed record.
    pub(crate) fn runtime(&self) -> ProvisionedRuntime {
        ProvisionedRuntime {
            installed: self.installed(),
            ..self.inner.runtime.clone()
        }
    }

    /// Register a sink receiving every line the worker writes.
    pub fn add_log_sink(&self, sink: impl LogSink + 'static) -> SinkId {
        self.inner.router.add_sink(Arc::new(sink))
    }

    /// Remove a sink registered with [`add_log_sink`](Self::add_log_sink).
    pub fn remove_log_sink(&self, id: SinkId) -> bool {
        self.inner.router.remove_sink(id)
    }

    /// Start the worker and connect to it.
    ///
    /// `log_sink`, when given, is registered as a global sink before the
    /// worker starts, so it sees every line. Launching a launched
    /// environment does nothing; launching a failed one tears down what is
    /// left of the old worker first.
    pub async fn launch(&self, log_sink: Option<Arc<dyn LogSink>>) -> Result<()> {
        let mut session = self.inner.session.lock().await;

        let state = self.state();
        match state {
            EnvironmentState::Exited => {
                return Err(CoreError::InvalidState {
                    env: self.inner.name.clone(),
                    expected: "created, launched or failed".into(),
                    actual: state.to_string(),
                })
            }
            EnvironmentState::Launched => {
                if let Some(sink) = log_sink {
                    self.inner.router.add_sink(sink);
                }
                return Ok(());
            }
            EnvironmentState::Failed => {
                info!(env = %self.inner.name, "relaunching failed environment");
                self.inner.lifecycle.lock().exit_requested = true;
                if let Err(e) = self.teardown(session.take()).await {
                    warn!(env = %self.inner.name, error = %e, "teardown before relaunch failed");
                }
            }
            EnvironmentState::Created => {}
        }

        if let Some(sink) = log_sink {
            self.inner.router.add_sink(sink);
        }

        let start = Instant::now();
        match self.start_worker().await {
            Ok(new_session) => {
                *session = Some(new_session);
                let mut lifecycle = self.inner.lifecycle.lock();
                lifecycle.state = EnvironmentState::Launched;
                lifecycle.failure = None;
                drop(lifecycle);
                info!(
                    env = %self.inner.name,
                    pid = ?self.pid(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "environment launched"
                );
                Ok(())
            }
            Err(e) => {
                warn!(env = %self.inner.name, error = %e, "launch failed");
                self.fail(FailureCause::Launch, e.to_string());
                Err(e)
            }
        }
    }

    /// Spawn the worker, attach the router and complete the handshake.
    async fn start_worker(&self) -> Result<Session> {
        let name = &self.inner.name;
        let config = &self.inner.config;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.lifecycle.lock().exit_requested = false;

        let mut args = vec![name.clone()];
        args.extend(config.worker_args.iter().cloned());
        let request = SpawnRequest {
            env_name: name.clone(),
            root_path: self.inner.runtime.root_path.clone(),
            activation_command: self.inner.runtime.activation_command.clone(),
            program: config.worker_program.clone(),
            args,
        };
        let mut worker = self.inner.spawner.spawn(&request)?;
        *self.inner.pid.lock() = worker.pid();

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let tasks = self.inner.router.attach(
            worker.stdout,
            worker.stderr,
            Some(endpoint_tx),
            self.stream_closed_hook(generation),
        );

        let handshake = async {
            let line = endpoint_rx.await.map_err(|_| HandshakeError::NoEndpoint)?;
            let addr = handshake::parse_endpoint_line(&line).map_err(|e| {
                HandshakeError::Failed(CoreError::Protocol {
                    env: name.clone(),
                    message: e.to_string(),
                })
            })?;
            debug!(env = %name, addr = %addr, "worker announced endpoint");
            self.connect_with_retry(addr).await.map_err(HandshakeError::Failed)
        };

        let outcome = match tokio::time::timeout(config.launch_timeout, handshake).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(HandshakeError::Failed(e))) => Err(e),
            Ok(Err(HandshakeError::NoEndpoint)) => {
                let status = match tokio::time::timeout(Duration::from_millis(500), worker.child.wait()).await {
                    Ok(Ok(status)) => status.to_string(),
                    _ => "no endpoint announced".to_string(),
                };
                Err(CoreError::WorkerExited {
                    env: name.clone(),
                    status,
                })
            }
            Err(_) => Err(CoreError::LaunchTimeout {
                env: name.clone(),
                timeout: config.launch_timeout,
            }),
        };

        match outcome {
            Ok(channel) => {
                *self.inner.channel.lock() = Some(Arc::new(channel));
                Ok(Session {
                    child: worker.child,
                    stdin: worker.stdin,
                    tasks,
                })
            }
            Err(e) => {
                self.inner.lifecycle.lock().exit_requested = true;
                if let Err(kill_err) = worker.child.kill().await {
                    debug!(env = %name, error = %kill_err, "failed to kill worker");
                }
                tasks.join(config.exit_grace).await;
                *self.inner.pid.lock() = None;
                Err(e)
            }
        }
    }

    async fn connect_with_retry(&self, addr: SocketAddr) -> Result<ConnectionChannel> {
        let name = &self.inner.name;
        let config = &self.inner.config;
        let start = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match ConnectionChannel::connect(name, addr, config.max_frame_length).await {
                Ok(channel) => {
                    debug!(
                        env = %name,
                        addr = %addr,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        "connected to worker"
                    );
                    return Ok(channel);
                }
                Err(e) => {
                    if attempts >= config.max_connect_attempts {
                        warn!(
                            env = %name,
                            addr = %addr,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            attempts,
                            "giving up connecting to worker"
                        );
                        return Err(CoreError::LaunchTimeout {
                            env: name.clone(),
                            timeout: start.elapsed(),
                        });
                    }
                    trace!(error = %e, attempt = attempts, "connect attempt failed, retrying");
                    tokio::time::sleep(config.retry_interval(attempts)).await;
                }
            }
        }
    }

    fn stream_closed_hook(&self, generation: u64) -> StreamClosedHook {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |source: LogSource| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let env = Environment { inner };
            if env.inner.lifecycle.lock().exit_requested {
                return;
            }
            if env.state() == EnvironmentState::Launched {
                warn!(env = %env.inner.name, source = %source, "worker output closed unexpectedly");
                env.fail(FailureCause::Lost, "worker exited".into());
            }
        })
    }

    /// Move to `Failed` unless already failed or exited.
    fn fail(&self, cause: FailureCause, reason: String) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if matches!(
            lifecycle.state,
            EnvironmentState::Created | EnvironmentState::Launched
        ) {
            debug!(env = %self.inner.name, cause = ?cause, reason = %reason, "environment failed");
            lifecycle.state = EnvironmentState::Failed;
            lifecycle.failure = Some((cause, reason));
        }
    }

    fn ensure_callable(&self) -> Result<()> {
        let lifecycle = self.inner.lifecycle.lock();
        match lifecycle.state {
            EnvironmentState::Launched => Ok(()),
            EnvironmentState::Failed => match &lifecycle.failure {
                Some((FailureCause::Lost, _)) => Err(CoreError::ConnectionLost {
                    env: self.inner.name.clone(),
                    call_id: None,
                }),
                Some((_, reason)) => Err(CoreError::StaleEnvironment {
                    env: self.inner.name.clone(),
                    reason: reason.clone(),
                }),
                None => Err(CoreError::StaleEnvironment {
                    env: self.inner.name.clone(),
                    reason: "unknown".into(),
                }),
            },
            state => Err(CoreError::InvalidState {
                env: self.inner.name.clone(),
                expected: EnvironmentState::Launched.to_string(),
                actual: state.to_string(),
            }),
        }
    }

    /// Invoke `target` in the worker and wait for its result.
    ///
    /// Calls on one environment run one at a time in the order they acquire
    /// the environment; concurrent callers wait. A timeout, lost connection or
    /// protocol violation leaves the environment `Failed`. An error raised by
    /// the remote function does not.
    pub async fn execute(
        &self,
        target: Target,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: CallOptions,
    ) -> Result<Value> {
        self.ensure_callable()?;
        let _guard = self.inner.exec_lock.lock().await;
        self.ensure_callable()?;

        let channel = self.inner.channel.lock().clone().ok_or_else(|| CoreError::ConnectionLost {
            env: self.inner.name.clone(),
            call_id: None,
        })?;
        let call_id = CallId::new(self.inner.next_call_id.fetch_add(1, Ordering::SeqCst));
        let timeout = options.timeout.or(self.inner.config.default_call_timeout);
        let request = CallRequest {
            call_id,
            target,
            args,
            kwargs,
        };

        let start = Instant::now();
        self.inner.router.begin_call(call_id, options.log_sink);
        let reply = self.await_reply(&channel, &request, timeout).await;
        if reply.is_ok() && !self.inner.config.log_linger.is_zero() {
            tokio::time::sleep(self.inner.config.log_linger).await;
        }
        self.inner.router.end_call(call_id);

        let result = match reply {
            Ok(Reply::Response(response)) => match response.outcome {
                CallOutcome::Result { value } => Ok(value),
                CallOutcome::Error(error) => Err(CoreError::RemoteExecution {
                    env: self.inner.name.clone(),
                    call_id,
                    kind: error.error_kind,
                    message: error.message,
                    traceback: error.traceback,
                }),
            },
            Ok(Reply::Malformed(message)) => {
                self.fail(FailureCause::Protocol, message.clone());
                Err(CoreError::Protocol {
                    env: self.inner.name.clone(),
                    message,
                })
            }
            Err(e) => Err(e),
        };

        debug!(
            env = %self.inner.name,
            call_id = %call_id,
            target = %request.target,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "call finished"
        );
        result
    }

    async fn await_reply(
        &self,
        channel: &ConnectionChannel,
        request: &CallRequest,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        let call_id = request.call_id;
        let lost = |env: &Environment| {
            env.fail(FailureCause::Lost, "connection lost".into());
            CoreError::ConnectionLost {
                env: env.inner.name.clone(),
                call_id: Some(call_id),
            }
        };

        let rx = match channel.send_call(request).await {
            Ok(rx) => rx,
            Err(CoreError::ConnectionLost { .. }) => return Err(lost(self)),
            Err(e) => return Err(e),
        };

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    channel.abandon(call_id);
                    warn!(env = %self.inner.name, call_id = %call_id, timeout = ?limit, "call timed out");
                    self.fail(FailureCause::Timeout, format!("call {call_id} timed out"));
                    return Err(CoreError::ExecutionTimeout {
                        env: self.inner.name.clone(),
                        call_id,
                        timeout: limit,
                    });
                }
            },
            None => rx.await,
        };
        received.map_err(|_| lost(self))
    }

    /// Call `function` of the module at `module_path` with positional args.
    pub async fn call(
        &self,
        module_path: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.execute(
            Target::function(module_path, function),
            args,
            Map::new(),
            CallOptions::default(),
        )
        .await
    }

    /// Run the script at `script_path` with `args` as its arguments.
    pub async fn run_script(&self, script_path: &str, args: Vec<Value>) -> Result<Value> {
        self.execute(
            Target::script(script_path),
            args,
            Map::new(),
            CallOptions::default(),
        )
        .await
    }

    /// A proxy forwarding function calls to the module at `module_path`.
    pub fn import_module(&self, module_path: impl Into<String>) -> ModuleProxy {
        ModuleProxy::new(self.clone(), module_path)
    }

    /// Shut the worker down and move to `Exited`.
    ///
    /// Never fails; teardown problems are logged. Calling it again does
    /// nothing.
    pub async fn exit(&self) {
        if let Err(e) = self.try_exit().await {
            warn!(env = %self.inner.name, error = %e, "error during exit");
        }
    }

    /// Like [`exit`](Self::exit), but reports teardown problems. The
    /// environment is `Exited` either way.
    pub async fn try_exit(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.state == EnvironmentState::Exited {
                return Ok(());
            }
            lifecycle.exit_requested = true;
        }

        let result = self.teardown(session.take()).await;
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.state = EnvironmentState::Exited;
            lifecycle.failure = None;
        }
        info!(env = %self.inner.name, "environment exited");
        result
    }

    /// Stop a worker: shutdown message, grace period, kill, join readers.
    async fn teardown(&self, session: Option<Session>) -> Result<()> {
        let name = &self.inner.name;
        let grace = self.inner.config.exit_grace;
        let channel = self.inner.channel.lock().take();

        let Some(mut session) = session else {
            if let Some(channel) = channel {
                channel.close();
            }
            return Ok(());
        };

        if let Some(channel) = &channel {
            channel.shutdown().await;
        }
        drop(session.stdin.take());

        let mut result = Ok(());
        match tokio::time::timeout(grace, session.child.wait()).await {
            Ok(Ok(status)) => debug!(env = %name, status = %status, "worker exited"),
            Ok(Err(e)) => result = Err(CoreError::Io(e)),
            Err(_) => {
                warn!(env = %name, grace = ?grace, "worker did not exit in time; killing");
                result = match session.child.kill().await {
                    Ok(()) => Err(CoreError::ExitTimeout {
                        env: name.clone(),
                        grace,
                    }),
                    Err(e) => Err(CoreError::Io(e)),
                };
            }
        }

        session.tasks.join(grace).await;
        if let Some(channel) = channel {
            channel.close();
        }
        *self.inner.pid.lock() = None;
        result
    }
}

enum HandshakeError {
    NoEndpoint,
    Failed(CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ChannelSink;
    use crate::spawn::testing::ShellSpawner;
    use tokio::net::TcpListener;

    fn runtime() -> ProvisionedRuntime {
        ProvisionedRuntime {
            root_path: std::env::temp_dir(),
            activation_command: None,
            installed: DependencySpec::new(),
        }
    }

    fn shell_worker(script: &str) -> EnvironmentConfig {
        EnvironmentConfig::builder()
            .worker_program("sh")
            .worker_arg("-c")
            .worker_arg(script)
            .launch_timeout(Duration::from_millis(500))
            .exit_grace(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    fn env_with(config: EnvironmentConfig) -> Environment {
        Environment::new("e", runtime(), config, Arc::new(ShellSpawner))
    }

    #[tokio::test]
    async fn test_new_environment_is_created() {
        let env = env_with(EnvironmentConfig::default());
        assert_eq!(env.state(), EnvironmentState::Created);
        assert_eq!(env.name(), "e");
        assert_eq!(env.pid(), None);
        assert_eq!(env.descriptor().state, EnvironmentState::Created);
    }

    #[tokio::test]
    async fn test_execute_before_launch_is_invalid() {
        let env = env_with(EnvironmentConfig::default());
        let err = env.call("builtin", "add", vec![]).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_worker_exiting_before_endpoint() {
        let env = env_with(shell_worker("echo starting; exit 3"));
        let (sink, mut rx) = ChannelSink::new();
        let err = env.launch(Some(Arc::new(sink))).await.unwrap_err();

        assert!(matches!(err, CoreError::WorkerExited { .. }), "{err}");
        assert_eq!(env.state(), EnvironmentState::Failed);
        assert_eq!(env.failure().map(|(cause, _)| cause), Some(FailureCause::Launch));
        let record = rx.recv().await.unwrap();
        assert_eq!(record.line, "starting");

        let err = env.call("m", "f", vec![]).await.unwrap_err();
        assert!(matches!(err, CoreError::StaleEnvironment { .. }));
    }

    #[tokio::test]
    async fn test_launch_timeout_without_endpoint() {
        let env = env_with(shell_worker("sleep 5"));
        let start = Instant::now();
        let err = env.launch(None).await.unwrap_err();
        assert!(matches!(err, CoreError::LaunchTimeout { .. }), "{err}");
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(env.state(), EnvironmentState::Failed);

        env.exit().await;
        assert_eq!(env.state(), EnvironmentState::Exited);
    }

    #[tokio::test]
    async fn test_exit_is_idempotent() {
        let env = env_with(EnvironmentConfig::default());
        env.exit().await;
        env.exit().await;
        assert_eq!(env.state(), EnvironmentState::Exited);

        let err = env.launch(None).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_log_sinks_register_and_remove() {
        let env = env_with(EnvironmentConfig::default());
        let id = env.add_log_sink(|_: &crate::router::LogRecord| {});
        assert!(env.remove_log_sink(id));
        assert!(!env.remove_log_sink(id));
    }

    #[tokio::test]
    async fn test_try_exit_reports_forced_kill() {
        // Accepts the connection in the backlog but never serves it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let line = handshake::endpoint_line(&listener.local_addr().unwrap());
        let env = env_with(shell_worker(&format!("echo '{line}'; exec sleep 5")));
        env.launch(None).await.unwrap();
        assert_eq!(env.state(), EnvironmentState::Launched);

        let start = Instant::now();
        let err = env.try_exit().await.unwrap_err();
        assert!(matches!(err, CoreError::ExitTimeout { .. }), "{err}");
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(env.state(), EnvironmentState::Exited);
        assert_eq!(env.pid(), None);

        // Already exited: nothing left to report.
        env.try_exit().await.unwrap();
    }
}
