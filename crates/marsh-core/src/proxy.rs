//! Forwarding proxies for remote modules.

use crate::environment::{CallOptions, Environment};
use crate::error::Result;
use crate::router::LogSink;
use marsh_protocol::Target;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// A module inside an environment.
///
/// Every invocation is a fresh round trip through
/// [`Environment::execute`]; nothing about the remote module is cached.
#[derive(Debug, Clone)]
pub struct ModuleProxy {
    env: Environment,
    module_path: String,
}

impl ModuleProxy {
    pub(crate) fn new(env: Environment, module_path: impl Into<String>) -> Self {
        Self {
            env,
            module_path: module_path.into(),
        }
    }

    /// The module path calls are sent to.
    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    /// The environment the module lives in.
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Call `function` with positional and keyword arguments.
    pub async fn invoke(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        self.env
            .execute(
                Target::function(&self.module_path, function),
                args,
                kwargs,
                CallOptions::default(),
            )
            .await
    }

    /// Start building a call to `function`.
    ///
    /// ```ignore
    /// let sum = env.import_module("builtin").function("add").arg(2).arg(3).call().await?;
    /// ```
    pub fn function(&self, function: impl Into<String>) -> RemoteFunction {
        RemoteFunction {
            proxy: self.clone(),
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            options: CallOptions::default(),
        }
    }
}

/// A call being built through [`ModuleProxy::function`].
#[must_use = "a remote function does nothing until `call` is awaited"]
pub struct RemoteFunction {
    proxy: ModuleProxy,
    function: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    options: CallOptions,
}

impl RemoteFunction {
    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Route lines written during this call to `sink`.
    pub fn log_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.options.log_sink = Some(Arc::new(sink));
        self
    }

    /// Set the call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Perform the call.
    pub async fn call(self) -> Result<Value> {
        self.proxy
            .env
            .execute(
                Target::function(self.proxy.module_path.clone(), self.function),
                self.args,
                self.kwargs,
                self.options,
            )
            .await
    }
}
