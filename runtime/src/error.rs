//! Error type shared by every runtime operation.

use std::io;
use std::path::PathBuf;

use stratus_messaging::TransportError;
use stratus_types::NodeAddress;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A required resource was absent from the merged registry.
    #[error("missing capability: no {0} registered")]
    MissingCapability(&'static str),

    #[error("malformed runtime descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("worker at {address} unreachable after {attempts} attempt(s): {reason}")]
    WorkerUnreachable {
        address: NodeAddress,
        attempts: u32,
        reason: String,
    },

    #[error("workflow failed to compile: {0}")]
    CompilationError(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("operation was cancelled")]
    Cancelled,

    /// Every attempt faulted and the fault policy allowed no further retry.
    #[error("task faulted {faults} time(s) and its fault policy is exhausted")]
    Faulted { faults: u32 },

    #[error("failed to spawn worker {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("cluster node failed: {0}")]
    Node(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RuntimeError {
    /// True when the error reports cancellation rather than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
