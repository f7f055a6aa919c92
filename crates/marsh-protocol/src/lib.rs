//! # marsh-protocol
//!
//! Messages exchanged between the host (`marsh-core`) and the worker
//! (`marsh-agent`) running inside an isolated environment.
//!
//! ## Wire format
//!
//! Every message is a JSON document carried in one length-prefixed frame
//! (4-byte big-endian length, see [`frame_codec`]).
//!
//! ```text
//! host ──▶ worker   {"kind":"call","callId":1,"target":{...},"args":[...],"kwargs":{...}}
//!                   {"kind":"shutdown"}
//! worker ──▶ host   {"callId":1,"kind":"result","value":...}
//!                   {"callId":1,"kind":"error","errorKind":"...","message":"...","traceback":"..."}
//! ```
//!
//! Before any frame is exchanged the worker announces its listening address
//! as the first line of its standard output (see [`handshake`]).

mod codec;
mod error;
pub mod handshake;
mod message;

pub use codec::{decode, encode, frame_codec, DEFAULT_MAX_FRAME_LENGTH};
pub use error::{ProtocolError, Result};
pub use message::{CallId, CallOutcome, CallRequest, CallResponse, HostMessage, RemoteError, Target};
