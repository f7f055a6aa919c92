//! Error type reported back to the host for a failed call.

use marsh_protocol::RemoteError;
use std::any::Any;
use thiserror::Error;

/// Error kinds produced by the worker.
pub mod error_kinds {
    /// The module path could not be resolved.
    pub const MODULE_NOT_FOUND: &str = "ModuleNotFound";
    /// The module exists but could not be loaded.
    pub const INVALID_MODULE: &str = "InvalidModule";
    /// The module has no such function.
    pub const FUNCTION_NOT_FOUND: &str = "FunctionNotFound";
    /// Arguments did not match what the function expects.
    pub const INVALID_ARGUMENTS: &str = "InvalidArguments";
    /// A manifest command failed to run or exited unsuccessfully.
    pub const COMMAND_FAILED: &str = "CommandFailed";
    /// The script file does not exist.
    pub const SCRIPT_NOT_FOUND: &str = "ScriptNotFound";
    /// The script exited unsuccessfully.
    pub const SCRIPT_FAILED: &str = "ScriptFailed";
    /// The function panicked.
    pub const PANIC: &str = "Panic";
    /// A frame from the host could not be understood.
    pub const PROTOCOL_ERROR: &str = "ProtocolError";
    /// Any other error returned by a function.
    pub const ERROR: &str = "Error";
}

/// Result type alias for call handling.
pub type Result<T> = std::result::Result<T, CallError>;

/// A failed call, as it will be reported to the host.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    kind: String,
    message: String,
    traceback: String,
}

impl CallError {
    /// Create an error of the given kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }

    /// Attach traceback text.
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = traceback.into();
        self
    }

    /// Convert an error returned by a function.
    ///
    /// A `CallError` anywhere at the top of the chain keeps its kind; any
    /// other error becomes [`error_kinds::ERROR`] with the full source chain
    /// as traceback.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<CallError>() {
            Ok(call_error) => call_error,
            Err(err) => Self {
                kind: error_kinds::ERROR.to_string(),
                message: err.to_string(),
                traceback: format!("{err:?}"),
            },
        }
    }

    /// Convert a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "function panicked".to_string()
        };
        Self::new(error_kinds::PANIC, message)
    }

    /// Error kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Traceback text (may be empty).
    pub fn traceback(&self) -> &str {
        &self.traceback
    }

    /// Convert into the wire representation.
    pub fn into_remote(self) -> RemoteError {
        RemoteError::new(self.kind, self.message).with_traceback(self.traceback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_from_anyhow_keeps_call_error_kind() {
        let err = anyhow::Error::new(CallError::new("Custom", "boom"));
        let call_error = CallError::from_anyhow(err);
        assert_eq!(call_error.kind(), "Custom");
        assert_eq!(call_error.message(), "boom");
    }

    #[test]
    fn test_from_anyhow_records_chain() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("disk full")).context("saving results");
        let call_error = CallError::from_anyhow(err.unwrap_err());
        assert_eq!(call_error.kind(), error_kinds::ERROR);
        assert_eq!(call_error.message(), "saving results");
        assert!(call_error.traceback().contains("disk full"));
    }

    #[test]
    fn test_from_panic_payloads() {
        assert_eq!(CallError::from_panic(Box::new("static")).message(), "static");
        assert_eq!(CallError::from_panic(Box::new(String::from("owned"))).message(), "owned");
        assert_eq!(CallError::from_panic(Box::new(42)).kind(), error_kinds::PANIC);
    }

    #[test]
    fn test_into_remote() {
        let remote = CallError::new(error_kinds::FUNCTION_NOT_FOUND, "no f")
            .with_traceback("tb")
            .into_remote();
        assert_eq!(remote.error_kind, "FunctionNotFound");
        assert_eq!(remote.traceback, "tb");
    }
}
