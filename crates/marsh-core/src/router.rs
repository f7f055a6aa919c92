//! Routing of worker output to log sinks.
//!
//! Each environment owns one [`LogRouter`]. While a worker runs, the router
//! has three tasks:
//!
//! ```text
//!  worker stdout ──▶ reader ─┐
//!                            ├─▶ queue ──▶ dispatcher ──▶ global sinks
//!  worker stderr ──▶ reader ─┘                       └──▶ per-call sink
//! ```
//!
//! Readers tag every line with the call that is in flight at the moment the
//! line is read. Sinks only ever run on the dispatcher task, one record at a
//! time, so a slow or failing sink cannot stall the readers.

use chrono::{DateTime, Utc};
use marsh_protocol::{handshake, CallId};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Boxed error returned by sinks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Which worker stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSource {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Environment name.
    pub env: String,
    /// Call in flight when the line was read.
    pub call_id: Option<CallId>,
    /// Stream the line came from.
    pub source: LogSource,
    /// The line, without its terminator.
    pub line: String,
    /// When the line was read.
    pub timestamp: DateTime<Utc>,
}

/// Receives log records.
///
/// Any `Fn(&LogRecord)` closure is a sink.
pub trait LogSink: Send + Sync {
    /// Handle one record. Errors are logged by the router and otherwise
    /// ignored.
    fn on_record(&self, record: &LogRecord) -> Result<(), BoxError>;
}

impl<F> LogSink for F
where
    F: Fn(&LogRecord) + Send + Sync,
{
    fn on_record(&self, record: &LogRecord) -> Result<(), BoxError> {
        self(record);
        Ok(())
    }
}

/// Forwards records to `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn on_record(&self, record: &LogRecord) -> Result<(), BoxError> {
        match record.call_id {
            Some(call_id) => info!(
                env = %record.env,
                call_id = %call_id,
                source = %record.source,
                "{}",
                record.line
            ),
            None => info!(env = %record.env, source = %record.source, "{}", record.line),
        }
        Ok(())
    }
}

/// Forwards records into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl ChannelSink {
    /// Create a sink and the receiver it feeds.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelSink {
    fn on_record(&self, record: &LogRecord) -> Result<(), BoxError> {
        self.tx
            .send(record.clone())
            .map_err(|_| "log receiver dropped".into())
    }
}

/// Handle for removing a registered global sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// Called when a reader reaches end of input.
pub type StreamClosedHook = Arc<dyn Fn(LogSource) + Send + Sync>;

struct InFlight {
    call_id: CallId,
    sink: Option<Arc<dyn LogSink>>,
}

struct Envelope {
    record: LogRecord,
    call_sink: Option<Arc<dyn LogSink>>,
}

#[derive(Default)]
struct Sinks {
    next_id: AtomicU64,
    global: RwLock<Vec<(SinkId, Arc<dyn LogSink>)>>,
}

/// Per-environment log router.
#[derive(Clone)]
pub struct LogRouter {
    env: Arc<str>,
    sinks: Arc<Sinks>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
}

impl LogRouter {
    /// Create a router for environment `env` with no sinks.
    pub fn new(env: &str) -> Self {
        Self {
            env: Arc::from(env),
            sinks: Arc::new(Sinks::default()),
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Register a global sink.
    pub fn add_sink(&self, sink: Arc<dyn LogSink>) -> SinkId {
        let id = SinkId(self.sinks.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks.global.write().push((id, sink));
        id
    }

    /// Remove a global sink. Returns whether it was registered.
    pub fn remove_sink(&self, id: SinkId) -> bool {
        let mut global = self.sinks.global.write();
        let before = global.len();
        global.retain(|(sink_id, _)| *sink_id != id);
        global.len() != before
    }

    /// Number of registered global sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.global.read().len()
    }

    /// Mark `call_id` as in flight; lines read from now on are attributed
    /// to it and also go to `sink`.
    pub fn begin_call(&self, call_id: CallId, sink: Option<Arc<dyn LogSink>>) {
        *self.in_flight.lock() = Some(InFlight { call_id, sink });
    }

    /// Clear the in-flight marker if it still belongs to `call_id`.
    pub fn end_call(&self, call_id: CallId) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.as_ref().is_some_and(|f| f.call_id == call_id) {
            *in_flight = None;
        }
    }

    /// Call currently in flight.
    pub fn current_call(&self) -> Option<CallId> {
        self.in_flight.lock().as_ref().map(|f| f.call_id)
    }

    /// Start reading a worker's output streams.
    ///
    /// The first stdout line that is a handshake line is also sent to
    /// `endpoint`. `on_closed` runs once per stream at end of input.
    pub fn attach<O, E>(
        &self,
        stdout: O,
        stderr: E,
        endpoint: Option<oneshot::Sender<String>>,
        on_closed: StreamClosedHook,
    ) -> RouterTasks
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let readers = vec![
            tokio::spawn(self.clone().read_stream(
                stdout,
                LogSource::Stdout,
                tx.clone(),
                endpoint,
                on_closed.clone(),
            )),
            tokio::spawn(self.clone().read_stream(stderr, LogSource::Stderr, tx, None, on_closed)),
        ];
        let dispatcher = tokio::spawn(self.clone().dispatch_loop(rx));
        RouterTasks { readers, dispatcher }
    }

    async fn read_stream<R: AsyncRead + Unpin>(
        self,
        stream: R,
        source: LogSource,
        tx: mpsc::UnboundedSender<Envelope>,
        mut endpoint: Option<oneshot::Sender<String>>,
        on_closed: StreamClosedHook,
    ) {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(env = %self.env, source = %source, error = %e, "failed to read worker output");
                    break;
                }
            }
            let line = String::from_utf8_lossy(trim_newline(&buf)).into_owned();

            if endpoint.is_some() && handshake::is_endpoint_line(&line) {
                if let Some(endpoint) = endpoint.take() {
                    let _ = endpoint.send(line.clone());
                }
            }

            let (call_id, call_sink) = match self.in_flight.lock().as_ref() {
                Some(f) => (Some(f.call_id), f.sink.clone()),
                None => (None, None),
            };
            let record = LogRecord {
                env: self.env.to_string(),
                call_id,
                source,
                line,
                timestamp: Utc::now(),
            };
            if tx.send(Envelope { record, call_sink }).is_err() {
                break;
            }
        }
        debug!(env = %self.env, source = %source, "worker stream closed");
        on_closed(source);
    }

    async fn dispatch_loop(self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            self.dispatch(&envelope);
        }
    }

    fn dispatch(&self, envelope: &Envelope) {
        // Snapshot so sinks can be (un)registered from inside a sink.
        let sinks: Vec<Arc<dyn LogSink>> = self
            .sinks
            .global
            .read()
            .iter()
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in &sinks {
            self.deliver(sink.as_ref(), &envelope.record, "global");
        }
        if let Some(sink) = &envelope.call_sink {
            self.deliver(sink.as_ref(), &envelope.record, "per-call");
        }
    }

    fn deliver(&self, sink: &dyn LogSink, record: &LogRecord, scope: &'static str) {
        match catch_unwind(AssertUnwindSafe(|| sink.on_record(record))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(env = %self.env, scope, error = %e, "log sink failed"),
            Err(_) => warn!(env = %self.env, scope, "log sink panicked"),
        }
    }
}

fn trim_newline(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

/// Reader and dispatcher tasks of an attached router.
pub struct RouterTasks {
    readers: Vec<JoinHandle<()>>,
    dispatcher: JoinHandle<()>,
}

impl RouterTasks {
    /// Wait for the readers to reach end of input and the dispatcher to
    /// drain, each within `grace`; abort whatever is still running.
    pub async fn join(self, grace: Duration) {
        for mut reader in self.readers {
            if tokio::time::timeout(grace, &mut reader).await.is_err() {
                warn!("log reader did not finish in time; aborting");
                reader.abort();
            }
        }
        let mut dispatcher = self.dispatcher;
        if tokio::time::timeout(grace, &mut dispatcher).await.is_err() {
            warn!("log dispatcher did not drain in time; aborting");
            dispatcher.abort();
        }
    }
}
