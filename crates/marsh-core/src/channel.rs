//! Framed connection to a worker.
//!
//! The channel owns the write half of the TCP stream and a reader task for
//! the read half. Responses are routed to the waiting call by callId;
//! responses nobody waits for (abandoned after a timeout, or unknown) are
//! discarded.

use crate::error::{CoreError, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use marsh_protocol::{decode, encode, frame_codec, CallId, CallOutcome, CallRequest, CallResponse, HostMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

/// What a waiting call receives.
#[derive(Debug)]
pub enum Reply {
    /// The worker answered.
    Response(CallResponse),
    /// The worker sent something that is not a valid response.
    Malformed(String),
}

/// Receives the reply to one call. Resolves to an error if the connection
/// is lost first.
pub type ReplyReceiver = oneshot::Receiver<Reply>;

struct Shared {
    env: String,
    pending: Mutex<HashMap<CallId, oneshot::Sender<Reply>>>,
    closed: AtomicBool,
}

impl Shared {
    fn route(&self, response: CallResponse) {
        if response.call_id == CallId::UNATTRIBUTED {
            let message = match &response.outcome {
                CallOutcome::Error(e) => e.to_string(),
                CallOutcome::Result { .. } => "response without call id".to_string(),
            };
            warn!(env = %self.env, message = %message, "worker reported a protocol error");
            self.fail_pending(&message);
            return;
        }

        let waiter = self.pending.lock().remove(&response.call_id);
        match waiter {
            Some(tx) => {
                trace!(env = %self.env, call_id = %response.call_id, "routing response");
                // The receiver may have given up in the meantime.
                let _ = tx.send(Reply::Response(response));
            }
            None => {
                warn!(
                    env = %self.env,
                    call_id = %response.call_id,
                    "discarding response for unknown or abandoned call"
                );
            }
        }
    }

    fn fail_pending(&self, message: &str) {
        let waiters: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Reply::Malformed(message.to_string()));
        }
    }

    /// Register a waiter for `call_id`, or `None` once the channel is closed.
    ///
    /// The closed flag is checked under the same lock `close` takes, so a
    /// waiter is never left behind by a concurrent close.
    fn register(&self, call_id: CallId) -> Option<ReplyReceiver> {
        let mut pending = self.pending.lock();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(call_id, tx);
        Some(rx)
    }

    fn close(&self) {
        let mut pending = self.pending.lock();
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with a receive error.
        pending.clear();
    }
}

/// A framed, bidirectional link to one worker.
pub struct ConnectionChannel {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionChannel {
    /// Connect to a worker listening on `addr` (single attempt).
    pub async fn connect(env: &str, addr: SocketAddr, max_frame_length: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(env, stream, max_frame_length))
    }

    /// Wrap an established stream.
    pub fn from_stream(env: &str, stream: TcpStream, max_frame_length: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            env: env.to_string(),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let frames = FramedRead::new(read_half, frame_codec(max_frame_length));
        let reader = tokio::spawn(read_loop(shared.clone(), frames));

        Self {
            shared,
            writer: tokio::sync::Mutex::new(FramedWrite::new(
                write_half,
                frame_codec(max_frame_length),
            )),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Whether the connection has been closed or lost.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Send a call and return the receiver for its reply.
    pub async fn send_call(&self, request: &CallRequest) -> Result<ReplyReceiver> {
        let call_id = request.call_id;
        let lost = || CoreError::ConnectionLost {
            env: self.shared.env.clone(),
            call_id: Some(call_id),
        };
        let frame = encode(&HostMessage::Call(request.clone())).map_err(|e| CoreError::Protocol {
            env: self.shared.env.clone(),
            message: e.to_string(),
        })?;

        let rx = self.shared.register(call_id).ok_or_else(lost)?;

        debug!(env = %self.shared.env, call_id = %call_id, target = %request.target, "sending call");
        if let Err(e) = self.write(frame).await {
            warn!(env = %self.shared.env, call_id = %call_id, error = %e, "failed to send call");
            self.shared.pending.lock().remove(&call_id);
            self.shared.close();
            return Err(lost());
        }
        Ok(rx)
    }

    /// Forget a call; its reply, if one ever arrives, is discarded.
    pub fn abandon(&self, call_id: CallId) {
        if self.shared.pending.lock().remove(&call_id).is_some() {
            debug!(env = %self.shared.env, call_id = %call_id, "abandoned call");
        }
    }

    /// Ask the worker to stop and close the write side.
    ///
    /// Best-effort: failures are logged, since the worker may already be gone.
    pub async fn shutdown(&self) {
        if self.is_closed() {
            return;
        }
        match encode(&HostMessage::Shutdown) {
            Ok(frame) => {
                if let Err(e) = self.write(frame).await {
                    debug!(env = %self.shared.env, error = %e, "could not send shutdown");
                }
            }
            Err(e) => warn!(env = %self.shared.env, error = %e, "could not encode shutdown"),
        }
        if let Err(e) = SinkExt::<Bytes>::close(&mut *self.writer.lock().await).await {
            debug!(env = %self.shared.env, error = %e, "error closing channel");
        }
    }

    /// Stop the reader and fail every outstanding call.
    pub fn close(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.close();
    }

    async fn write(&self, frame: Bytes) -> std::io::Result<()> {
        self.writer.lock().await.send(frame).await
    }
}

impl Drop for ConnectionChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(shared: Arc<Shared>, mut frames: FramedRead<OwnedReadHalf, LengthDelimitedCodec>) {
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(frame) => match decode::<CallResponse>(&frame) {
                Ok(response) => shared.route(response),
                Err(e) => {
                    warn!(env = %shared.env, error = %e, "malformed frame from worker");
                    shared.fail_pending(&format!("malformed frame: {e}"));
                }
            },
            Err(e) => {
                warn!(env = %shared.env, error = %e, "channel read failed");
                break;
            }
        }
    }
    debug!(env = %shared.env, "channel closed by worker");
    shared.close();
}
