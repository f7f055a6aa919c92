//! # marsh-agent
//!
//! The worker process that runs inside a marsh environment.
//!
//! On start the worker binds a loopback TCP port, announces it on stdout
//! with an `ENDPOINT <addr>` line, accepts exactly one connection from the
//! host and then executes [`CallRequest`](marsh_protocol::CallRequest)s
//! until asked to shut down or disconnected.
//!
//! Everything a function or script prints goes to the worker's own stdout
//! and stderr, which the host captures and routes to log sinks.
//!
//! Modules are resolved by a [`ModuleLoader`]. The binary chains a
//! [`Registry`] holding the [`builtin_module`] with a [`ManifestLoader`]
//! for TOML command manifests.

mod builtin;
mod error;
mod manifest;
mod module;
mod script;
mod server;

pub use builtin::{builtin_module, BUILTIN_MODULE};
pub use error::{error_kinds, CallError, Result};
pub use manifest::{CommandModule, CommandSpec, ManifestLoader};
pub use module::{Arguments, FunctionTable, LoaderChain, Module, ModuleLoader, Registry};
pub use script::{ScriptRunner, DEFAULT_INTERPRETER};
pub use server::{ExecutorServer, StopReason};
