//! Error types for chanipc
//!
//! Centralized error handling using thiserror.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Structured error carried by a `ResponseError` message.
///
/// The server produces one from any non-opaque failure; the client rebuilds it
/// with message, name and stack preserved.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct RemoteError {
    /// Human-readable error message.
    pub message: String,
    /// Error name (e.g. "Canceled", "UnknownChannel").
    pub name: String,
    /// Stack lines, outermost first. Absent when the error had none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<String>>,
}

impl RemoteError {
    /// Create a structured error with no stack.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
            stack: None,
        }
    }

    /// Attach stack lines.
    pub fn with_stack(mut self, stack: Vec<String>) -> Self {
        self.stack = Some(stack);
        self
    }
}

/// All error types that can occur in chanipc
#[derive(Debug, Error)]
pub enum IpcError {
    /// Structured error returned by the remote channel
    #[error("{0}")]
    Remote(RemoteError),

    /// Opaque error payload returned by the remote channel
    #[error("Remote error: {0}")]
    Opaque(Value),

    /// The call was canceled before it completed
    #[error("Canceled")]
    Canceled,

    /// The router could not resolve a target client
    #[error("Routing error: {0}")]
    Routing(String),

    /// No channel registered under this name
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// The channel does not implement this command
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// The channel client was disposed
    #[error("Channel client disposed")]
    Disposed,

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// A channel implementation panicked while handling a call
    #[error("Channel panicked: {0}")]
    Panic(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IpcError {
    /// Stable error name used on the wire.
    pub fn name(&self) -> &str {
        match self {
            IpcError::Remote(err) => &err.name,
            IpcError::Opaque(_) => "Opaque",
            IpcError::Canceled => "Canceled",
            IpcError::Routing(_) => "RoutingError",
            IpcError::UnknownChannel(_) => "UnknownChannel",
            IpcError::UnknownCommand(_) => "UnknownCommand",
            IpcError::Disposed => "Disposed",
            IpcError::Transport(_) => "TransportError",
            IpcError::Panic(_) => "Panic",
            IpcError::Io(_) => "IoError",
            IpcError::Json(_) => "JsonError",
        }
    }

    /// Whether this error is a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, IpcError::Canceled)
    }

    /// Convert into the structured wire form.
    ///
    /// Returns `None` for opaque payloads, which travel as `ResponseErrorObj`.
    pub fn to_remote(&self) -> Option<RemoteError> {
        match self {
            IpcError::Opaque(_) => None,
            other => Some(other.structured()),
        }
    }

    /// Structured form of any error. The source chain, if any, becomes the stack.
    pub(crate) fn structured(&self) -> RemoteError {
        if let IpcError::Remote(err) = self {
            return err.clone();
        }
        let mut stack = Vec::new();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            stack.push(err.to_string());
            source = err.source();
        }
        let remote = RemoteError::new(self.name(), self.to_string());
        if stack.is_empty() {
            remote
        } else {
            remote.with_stack(stack)
        }
    }
}

impl From<RemoteError> for IpcError {
    fn from(err: RemoteError) -> Self {
        IpcError::Remote(err)
    }
}

/// Result type alias for chanipc operations
pub type Result<T> = std::result::Result<T, IpcError>;
