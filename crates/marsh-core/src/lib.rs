//! # marsh-core
//!
//! Host side of marsh: provision isolated runtimes, start a worker in each
//! and call functions inside them as if they were local, while their output
//! streams back live.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    marsh-core (host)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌────────────────────┐     ┌───────────────────────┐    │
//! │  │ EnvironmentManager │────▶│ Provisioner           │    │
//! │  │  - register_or_get │     │ (ScriptProvisioner)   │    │
//! │  │  - delete          │     └───────────────────────┘    │
//! │  │  - shutdown_all    │                                  │
//! │  └────────────────────┘                                  │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌────────────────────┐     ┌───────────────────────┐    │
//! │  │   Environment      │────▶│ Spawner               │    │
//! │  │  - launch()        │     │ (ProcessSpawner)      │    │
//! │  │  - execute()       │     └───────────────────────┘    │
//! │  │  - import_module() │                                  │
//! │  │  - exit()          │     ┌───────────────────────┐    │
//! │  └────────────────────┘────▶│ LogRouter             │◀── worker stdout/stderr
//! │           │                 │  readers + dispatcher │    │
//! │           ▼                 └───────────────────────┘    │
//! │  ┌────────────────────┐                                  │
//! │  │ ConnectionChannel  │  length-prefixed JSON over TCP   │
//! │  └────────────────────┘                                  │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                 marsh-agent (worker)                     │
//! │      announces "ENDPOINT <addr>" on its first line       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use marsh_core::{DependencySpec, EnvironmentManager, ManagerConfig, TracingSink};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> marsh_core::Result<()> {
//! let manager = EnvironmentManager::new(ManagerConfig::new("/tmp/marsh"));
//! let env = manager
//!     .register_or_get("analysis", &DependencySpec::parse(["numpy==1.26"]).unwrap())
//!     .await?;
//! env.launch(Some(Arc::new(TracingSink))).await?;
//!
//! let sum = env.call("builtin", "add", vec![json!(2), json!(3)]).await?;
//! assert_eq!(sum, json!(5));
//!
//! let builtin = env.import_module("builtin");
//! let echoed = builtin.function("echo").arg("hi").call().await?;
//!
//! manager.shutdown_all().await?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod config;
mod dependency;
mod environment;
mod error;
mod manager;
mod provision;
mod proxy;
mod router;
mod spawn;

pub use channel::{ConnectionChannel, Reply, ReplyReceiver};
pub use config::{EnvironmentConfig, EnvironmentConfigBuilder, ManagerConfig, DEFAULT_WORKER};
pub use dependency::{Dependency, DependencySpec};
pub use environment::{
    CallOptions, Environment, EnvironmentDescriptor, EnvironmentState, FailureCause,
};
pub use error::{CoreError, Result};
pub use manager::EnvironmentManager;
pub use provision::{ProvisionedRuntime, Provisioner, ScriptProvisioner, DEPENDENCIES_FILE};
pub use proxy::{ModuleProxy, RemoteFunction};
pub use router::{
    BoxError, ChannelSink, LogRecord, LogRouter, LogSink, LogSource, RouterTasks, SinkId,
    StreamClosedHook, TracingSink,
};
pub use spawn::{ProcessSpawner, SpawnRequest, Spawner, WorkerProcess};

pub use marsh_protocol::{CallId, Target};
