//! Message types for host/worker communication.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identifier correlating a [`CallRequest`] with its [`CallResponse`].
///
/// Ids are allocated by the host, start at 1 and increase monotonically for
/// the lifetime of an environment. Id 0 is reserved for worker replies that
/// cannot be attributed to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    /// Id used by the worker when a frame could not be parsed.
    pub const UNATTRIBUTED: CallId = CallId(0);

    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a call invokes inside the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    /// A function exported by a module.
    #[serde(rename_all = "camelCase")]
    Function {
        /// Path identifying the module (registry name or manifest path).
        module_path: String,
        /// Name of the function within the module.
        function_name: String,
    },
    /// A script file run as a whole.
    #[serde(rename_all = "camelCase")]
    Script {
        /// Path to the script.
        script_path: String,
    },
}

impl Target {
    /// Target a function in a module.
    pub fn function(module_path: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self::Function {
            module_path: module_path.into(),
            function_name: function_name.into(),
        }
    }

    /// Target a script.
    pub fn script(script_path: impl Into<String>) -> Self {
        Self::Script {
            script_path: script_path.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function {
                module_path,
                function_name,
            } => write!(f, "{module_path}:{function_name}"),
            Self::Script { script_path } => write!(f, "{script_path}"),
        }
    }
}

/// A request to invoke a target with arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    /// Correlation id.
    pub call_id: CallId,
    /// What to invoke.
    pub target: Target,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Messages sent from the host to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostMessage {
    /// Invoke a target.
    Call(CallRequest),
    /// Ask the worker to stop serving and exit.
    Shutdown,
}

/// Structured failure reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteError {
    /// Category of the failure (e.g. `FunctionNotFound`, `Panic`).
    pub error_kind: String,
    /// Human-readable message.
    pub message: String,
    /// Remote traceback text, possibly empty.
    #[serde(default)]
    pub traceback: String,
}

impl RemoteError {
    /// Create an error without traceback.
    pub fn new(error_kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_kind: error_kind.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }

    /// Attach traceback text.
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = traceback.into();
        self
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_kind, self.message)
    }
}

/// Outcome carried by a [`CallResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallOutcome {
    /// The call returned a value.
    Result {
        /// Returned value.
        #[serde(default)]
        value: Value,
    },
    /// The call raised an error.
    Error(RemoteError),
}

/// A reply from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    /// Id of the request this answers.
    pub call_id: CallId,
    /// Result or error.
    #[serde(flatten)]
    pub outcome: CallOutcome,
}

impl CallResponse {
    /// Create a success response.
    pub fn result(call_id: CallId, value: Value) -> Self {
        Self {
            call_id,
            outcome: CallOutcome::Result { value },
        }
    }

    /// Create an error response.
    pub fn error(call_id: CallId, error: RemoteError) -> Self {
        Self {
            call_id,
            outcome: CallOutcome::Error(error),
        }
    }

    /// Check whether this response carries an error.
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, CallOutcome::Error(_))
    }
}
