//! Error types for marsh-core.

use marsh_protocol::CallId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for marsh-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while managing environments and calls.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The provisioner could not create the runtime
    #[error("provisioning of {env} failed: {message}")]
    Provisioning {
        /// Environment name
        env: String,
        /// What went wrong
        message: String,
    },

    /// The worker process could not be started
    #[error("failed to spawn worker for {env}: {source}")]
    Spawn {
        /// Environment name
        env: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// No handshake completed within the launch deadline
    #[error("launch of {env} timed out after {timeout:?}")]
    LaunchTimeout {
        /// Environment name
        env: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// The worker exited before announcing its endpoint
    #[error("worker for {env} exited during launch ({status})")]
    WorkerExited {
        /// Environment name
        env: String,
        /// Exit status description
        status: String,
    },

    /// The worker ignored the shutdown request and had to be killed
    #[error("worker for {env} did not exit within {grace:?} and was killed")]
    ExitTimeout {
        /// Environment name
        env: String,
        /// Grace period that elapsed
        grace: Duration,
    },

    /// Commands run inside an environment failed
    #[error("commands in {env} failed: {message}")]
    CommandFailed {
        /// Environment name
        env: String,
        /// Last error line, or the exit status
        message: String,
    },

    /// The channel to the worker broke
    #[error("connection to {env} lost{}", call_suffix(.call_id))]
    ConnectionLost {
        /// Environment name
        env: String,
        /// Call that was outstanding, if any
        call_id: Option<CallId>,
    },

    /// A call did not complete in time
    #[error("call {call_id} on {env} timed out after {timeout:?}")]
    ExecutionTimeout {
        /// Environment name
        env: String,
        /// The abandoned call
        call_id: CallId,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// The remote function raised an error
    #[error("call {call_id} on {env} failed: {kind}: {message}")]
    RemoteExecution {
        /// Environment name
        env: String,
        /// The failed call
        call_id: CallId,
        /// Remote error kind
        kind: String,
        /// Remote error message
        message: String,
        /// Remote traceback text
        traceback: String,
    },

    /// A message from the worker could not be understood
    #[error("protocol error on {env}: {message}")]
    Protocol {
        /// Environment name
        env: String,
        /// What was wrong with the message
        message: String,
    },

    /// A call was attempted on a failed environment
    #[error("environment {env} is failed ({reason}); relaunch it first")]
    StaleEnvironment {
        /// Environment name
        env: String,
        /// Why the environment failed
        reason: String,
    },

    /// Invalid environment state for operation
    #[error("invalid state for {env}: expected {expected}, got {actual}")]
    InvalidState {
        /// Environment name
        env: String,
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Environment not found
    #[error("environment not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Some environments failed to shut down
    #[error("{} environment(s) failed to shut down: {}", .0.len(), shutdown_summary(.0))]
    Shutdown(Vec<(String, CoreError)>),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Name of the environment the error relates to, if any.
    pub fn env(&self) -> Option<&str> {
        match self {
            Self::Provisioning { env, .. }
            | Self::Spawn { env, .. }
            | Self::LaunchTimeout { env, .. }
            | Self::WorkerExited { env, .. }
            | Self::ExitTimeout { env, .. }
            | Self::CommandFailed { env, .. }
            | Self::ConnectionLost { env, .. }
            | Self::ExecutionTimeout { env, .. }
            | Self::RemoteExecution { env, .. }
            | Self::Protocol { env, .. }
            | Self::StaleEnvironment { env, .. }
            | Self::InvalidState { env, .. } => Some(env),
            Self::NotFound(env) => Some(env),
            _ => None,
        }
    }

    /// Id of the call the error relates to, if any.
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::ConnectionLost { call_id, .. } => *call_id,
            Self::ExecutionTimeout { call_id, .. } | Self::RemoteExecution { call_id, .. } => {
                Some(*call_id)
            }
            _ => None,
        }
    }

    /// Remote traceback text, when the worker reported one.
    pub fn traceback(&self) -> Option<&str> {
        match self {
            Self::RemoteExecution { traceback, .. } if !traceback.is_empty() => Some(traceback),
            _ => None,
        }
    }
}

fn call_suffix(call_id: &Option<CallId>) -> String {
    match call_id {
        Some(id) => format!(" during call {id}"),
        None => String::new(),
    }
}

fn shutdown_summary(failures: &[(String, CoreError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_lost_display() {
        let err = CoreError::ConnectionLost {
            env: "e".into(),
            call_id: Some(CallId::new(4)),
        };
        assert_eq!(err.to_string(), "connection to e lost during call 4");
        assert_eq!(err.env(), Some("e"));
        assert_eq!(err.call_id(), Some(CallId::new(4)));

        let err = CoreError::ConnectionLost {
            env: "e".into(),
            call_id: None,
        };
        assert_eq!(err.to_string(), "connection to e lost");
    }

    #[test]
    fn test_remote_execution_traceback() {
        let err = CoreError::RemoteExecution {
            env: "e".into(),
            call_id: CallId::new(1),
            kind: "ValueError".into(),
            message: "bad".into(),
            traceback: "at line 3".into(),
        };
        assert_eq!(err.traceback(), Some("at line 3"));
        assert!(err.to_string().contains("ValueError: bad"));
    }

    #[test]
    fn test_shutdown_summary() {
        let err = CoreError::Shutdown(vec![
            ("a".into(), CoreError::NotFound("a".into())),
            ("b".into(), CoreError::Config("x".into())),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("2 environment(s)"));
        assert!(text.contains("a: environment not found: a"));
    }
}
