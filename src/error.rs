//! Error types for dispatch operations.
//!
//! Failures are classified so the orchestrator can decide how far they
//! propagate:
//! - protocol violations close the offending node,
//! - transport failures mark the node inactive,
//! - content errors drop the offending item,
//! - worker errors are logged,
//! - resource exhaustion aborts only the operation in progress.

use std::fmt;

/// Errors that can occur while coordinating nodes.
#[derive(Debug, Clone)]
pub enum DispatchError {
    /// An unexpected message type, or an event the current FSM state rejects.
    ProtocolViolation(String),

    /// Connection refused, reset or otherwise broken.
    Transport(String),

    /// A connection attempt did not complete within its timeout.
    ConnectTimeout {
        /// Address the attempt was made against
        addr: String,
        /// Timeout in milliseconds
        millis: u64,
    },

    /// A malformed item (unknown patch base, bad archive, bad payload).
    Content(String),

    /// An error reported by the worker itself.
    Worker(String),

    /// A size limit was exceeded.
    ResourceExhausted(String),

    /// Internal error occurred.
    Internal(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Self::Transport(msg) => write!(f, "Transport failure: {}", msg),
            Self::ConnectTimeout { addr, millis } => {
                write!(f, "Connection to {} timed out after {} ms", addr, millis)
            }
            Self::Content(msg) => write!(f, "Content error: {}", msg),
            Self::Worker(msg) => write!(f, "Worker error: {}", msg),
            Self::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        // Keep the classification when the error started out as one of ours.
        match err.downcast::<DispatchError>() {
            Ok(inner) => inner,
            Err(err) => Self::Internal(format!("{:#}", err)),
        }
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<bincode::Error> for DispatchError {
    fn from(err: bincode::Error) -> Self {
        Self::Content(format!("malformed payload: {}", err))
    }
}

impl DispatchError {
    /// Whether the failure only concerns the connection it happened on.
    ///
    /// Transport failures leave the node eligible for removal; they never
    /// stop the run.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ConnectTimeout { .. })
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn content(msg: impl Into<String>) -> Self {
        Self::Content(msg.into())
    }
}
