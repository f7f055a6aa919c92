//! The executor server.
//!
//! Accepts exactly one host connection, then reads length-delimited
//! [`HostMessage`] frames and answers every call with one [`CallResponse`].
//! Calls run one at a time on the blocking pool; the host never has more
//! than one call in flight per environment.

use crate::error::{error_kinds, CallError, Result};
use crate::module::{Arguments, Module, ModuleLoader};
use crate::script::ScriptRunner;
use futures::{SinkExt, StreamExt};
use marsh_protocol::{
    decode, encode, frame_codec, CallId, CallRequest, CallResponse, HostMessage, Target,
    DEFAULT_MAX_FRAME_LENGTH,
};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

/// Why the serve loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The host sent a shutdown request.
    Shutdown,
    /// The host closed the connection.
    Disconnected,
}

/// Serves call requests from a single host.
pub struct ExecutorServer<L> {
    loader: L,
    scripts: ScriptRunner,
    modules: Mutex<HashMap<String, Arc<dyn Module>>>,
}

impl<L: ModuleLoader + 'static> ExecutorServer<L> {
    /// Create a server resolving modules through `loader`.
    pub fn new(loader: L, scripts: ScriptRunner) -> Self {
        Self {
            loader,
            scripts,
            modules: Mutex::new(HashMap::new()),
        }
    }

    /// Accept one connection on `listener` and serve it until shutdown or
    /// disconnect.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<StopReason> {
        let (stream, peer) = listener.accept().await?;
        info!(peer = %peer, "host connected");
        // Later connections are refused once the listener is gone.
        drop(listener);
        self.serve_connection(stream).await
    }

    /// Serve an already accepted connection.
    pub async fn serve_connection(self: Arc<Self>, stream: TcpStream) -> std::io::Result<StopReason> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut frames = FramedRead::new(reader, frame_codec(DEFAULT_MAX_FRAME_LENGTH));
        let mut sink = FramedWrite::new(writer, frame_codec(DEFAULT_MAX_FRAME_LENGTH));

        while let Some(frame) = frames.next().await {
            let frame = frame?;
            let response = match decode::<HostMessage>(&frame) {
                Ok(HostMessage::Shutdown) => {
                    info!("shutdown requested");
                    return Ok(StopReason::Shutdown);
                }
                Ok(HostMessage::Call(request)) => self.clone().dispatch(request).await,
                Err(e) => {
                    warn!(error = %e, "malformed frame");
                    CallResponse::error(
                        CallId::UNATTRIBUTED,
                        CallError::new(error_kinds::PROTOCOL_ERROR, format!("malformed frame: {e}"))
                            .into_remote(),
                    )
                }
            };

            let bytes = encode(&response)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            sink.send(bytes).await?;
        }

        info!("host disconnected");
        Ok(StopReason::Disconnected)
    }

    async fn dispatch(self: Arc<Self>, request: CallRequest) -> CallResponse {
        let call_id = request.call_id;
        let server = self.clone();
        let outcome = tokio::task::spawn_blocking(move || server.handle_call(&request))
            .await
            .unwrap_or_else(|e| {
                Err(CallError::new(
                    error_kinds::PANIC,
                    format!("call task failed: {e}"),
                ))
            });

        // Output printed during the call must reach the pipes before the
        // host sees the response.
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        match outcome {
            Ok(value) => CallResponse::result(call_id, value),
            Err(err) => CallResponse::error(call_id, err.into_remote()),
        }
    }

    /// Execute one request synchronously.
    pub fn handle_call(&self, request: &CallRequest) -> Result<Value> {
        let start = Instant::now();
        debug!(call_id = %request.call_id, target = %request.target, "handling call");

        let outcome = catch_unwind(AssertUnwindSafe(|| self.execute(request)))
            .unwrap_or_else(|payload| Err(CallError::from_panic(payload)));

        match &outcome {
            Ok(_) => debug!(
                call_id = %request.call_id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "call completed"
            ),
            Err(e) => debug!(
                call_id = %request.call_id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                error = %e,
                "call failed"
            ),
        }
        outcome
    }

    fn execute(&self, request: &CallRequest) -> Result<Value> {
        match &request.target {
            Target::Function {
                module_path,
                function_name,
            } => {
                let module = self.module(module_path)?;
                module.call(function_name, Arguments::new(&request.args, &request.kwargs))
            }
            Target::Script { script_path } => self.scripts.run(script_path, &request.args),
        }
    }

    /// Resolve a module, loading it on first use.
    fn module(&self, path: &str) -> Result<Arc<dyn Module>> {
        if let Some(module) = self.cache().get(path) {
            return Ok(module.clone());
        }
        let module = self.loader.load(path)?;
        debug!(module = path, functions = ?module.functions(), "module loaded");
        self.cache().insert(path.to_string(), module.clone());
        Ok(module)
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Module>>> {
        self.modules.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::builtin_module;
    use crate::module::{FunctionTable, Registry};
    use marsh_protocol::CallOutcome;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn server() -> ExecutorServer<Registry> {
        let registry = Registry::new()
            .register("builtin", builtin_module())
            .register(
                "boom",
                FunctionTable::new().function("explode", |_| panic!("kaboom")),
            );
        ExecutorServer::new(registry, ScriptRunner::default())
    }

    fn request(target: Target, args: Vec<Value>) -> CallRequest {
        CallRequest {
            call_id: CallId::new(7),
            target,
            args,
            kwargs: Map::new(),
        }
    }

    #[test]
    fn test_handle_function_call() {
        let value = server()
            .handle_call(&request(Target::function("builtin", "add"), vec![json!(2), json!(3)]))
            .unwrap();
        assert_eq!(value, json!(5));
    }

    #[test]
    fn test_unknown_module_and_function() {
        let server = server();
        let err = server
            .handle_call(&request(Target::function("missing", "f"), vec![]))
            .unwrap_err();
        assert_eq!(err.kind(), error_kinds::MODULE_NOT_FOUND);

        let err = server
            .handle_call(&request(Target::function("builtin", "nope"), vec![]))
            .unwrap_err();
        assert_eq!(err.kind(), error_kinds::FUNCTION_NOT_FOUND);
    }

    #[test]
    fn test_panic_becomes_error() {
        let err = server()
            .handle_call(&request(Target::function("boom", "explode"), vec![]))
            .unwrap_err();
        assert_eq!(err.kind(), error_kinds::PANIC);
        assert!(err.message().contains("kaboom"));
    }

    struct CountingLoader(AtomicUsize);

    impl ModuleLoader for CountingLoader {
        fn load(&self, _path: &str) -> Result<Arc<dyn Module>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(builtin_module()))
        }
    }

    #[test]
    fn test_modules_are_cached() {
        let server = ExecutorServer::new(CountingLoader(AtomicUsize::new(0)), ScriptRunner::default());
        for _ in 0..3 {
            server
                .handle_call(&request(Target::function("m", "echo"), vec![json!(1)]))
                .unwrap();
        }
        assert_eq!(server.loader.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_serve_connection_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(Arc::new(server()).serve(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut frames = FramedRead::new(reader, frame_codec(DEFAULT_MAX_FRAME_LENGTH));
        let mut sink = FramedWrite::new(writer, frame_codec(DEFAULT_MAX_FRAME_LENGTH));

        // Garbage first: the server must answer and keep serving.
        sink.send(bytes::Bytes::from_static(b"not json")).await.unwrap();
        let response: CallResponse = decode(&frames.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(response.call_id, CallId::UNATTRIBUTED);
        assert!(response.is_error());

        let call = HostMessage::Call(request(Target::function("builtin", "echo"), vec![json!("hi")]));
        sink.send(encode(&call).unwrap()).await.unwrap();
        let response: CallResponse = decode(&frames.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(response.call_id, CallId::new(7));
        assert_eq!(response.outcome, CallOutcome::Result { value: json!("hi") });

        sink.send(encode(&HostMessage::Shutdown).unwrap()).await.unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), StopReason::Shutdown);
    }
}
