//! Error types for the distributed convolution engine

use std::fmt;
use thiserror::Error;

use crate::worker::WorkerId;

/// Result type alias for distconv operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stage of a run in which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Loading the input image or resolving the kernel
    Load,

    /// Sending a work unit to a worker
    Dispatch,

    /// Receiving a result unit from a worker
    Collect,

    /// Writing the output image
    Save,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Dispatch => "dispatch",
            Stage::Collect => "collect",
            Stage::Save => "save",
        };
        f.write_str(name)
    }
}

/// Error types that can occur while partitioning, shipping or filtering bands
#[derive(Error, Debug)]
pub enum Error {
    /// Bad image or kernel selector, insufficient worker count
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Kernel is empty, even-sized or not square
    #[error("invalid kernel: {0}")]
    InvalidKernel(String),

    /// Rows cannot be split among the requested workers
    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    /// Connection refused, peer vanished mid-exchange, channel closed
    #[error("transport error at {stage} (worker {worker}): {reason}")]
    Transport {
        /// Worker the exchange was addressed to
        worker: WorkerId,
        /// Stage in which the exchange failed
        stage: Stage,
        /// Human readable cause
        reason: String,
    },

    /// Corrupt or undecodable image bytes
    #[error("codec error: {0}")]
    Codec(String),

    /// Malformed frame, wrong magic or out-of-order field
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A worker did not answer within the configured wait
    #[error("timed out at {stage} (worker {worker})")]
    Timeout {
        /// Worker that did not answer
        worker: WorkerId,
        /// Stage that timed out
        stage: Stage,
    },

    /// A worker received the unit but could not produce a result
    #[error("worker {worker} failed: {reason}")]
    Remote {
        /// Worker that reported the failure
        worker: WorkerId,
        /// Failure reported by the worker
        reason: String,
    },

    /// Worker thread panicked
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a transport error for one worker
    pub fn transport(worker: WorkerId, stage: Stage, reason: impl Into<String>) -> Self {
        Error::Transport {
            worker,
            stage,
            reason: reason.into(),
        }
    }

    /// Whether the failure may go away if the exchange is attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } | Error::Timeout { .. } => true,
            Error::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Worker id carried by the error, if any
    pub fn worker(&self) -> Option<WorkerId> {
        match self {
            Error::Transport { worker, .. }
            | Error::Timeout { worker, .. }
            | Error::Remote { worker, .. } => Some(*worker),
            _ => None,
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Codec(err.to_string())
    }
}
