//! Endpoint error types, classifiable by value.

use std::io;
use thiserror::Error;

/// Convenience result alias for endpoint operations.
pub type Result<T> = std::result::Result<T, EndpointError>;

/// How the replication driver must react to an endpoint failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient condition; the failed step may be retried.
    Transient,
    /// Permanent failure; no further work on the affected filesystem.
    Permanent,
    /// The endpoint elects to skip the filesystem; not an error.
    Filtered,
}

/// An error returned by a sender or receiver operation.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Stream or connection level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport failure below the snapshot stream.
    #[error("network error: {msg}")]
    Network {
        /// Description of the transport condition.
        msg: String,
    },

    /// The endpoint filters this filesystem out of replication.
    #[error("endpoint filters filesystem {filesystem}")]
    Filtered {
        /// Path of the filtered filesystem.
        filesystem: String,
    },

    /// The peer violated the send/receive protocol.
    #[error("protocol violation: {msg}")]
    Protocol {
        /// Description of the violation.
        msg: String,
    },

    /// The operation was aborted by the caller's cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Any other endpoint failure.
    #[error("{msg}")]
    Other {
        /// Description of the failure.
        msg: String,
    },
}

impl EndpointError {
    /// Classify this error for the replication driver.
    ///
    /// End-of-stream conditions and transport errors are transient, a
    /// filtered filesystem is a skip, everything else is permanent.
    pub fn class(&self) -> ErrorClass {
        match self {
            EndpointError::Io(err) => match err.kind() {
                io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => ErrorClass::Transient,
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::NotConnected
                | io::ErrorKind::TimedOut => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
            EndpointError::Network { .. } => ErrorClass::Transient,
            EndpointError::Filtered { .. } => ErrorClass::Filtered,
            EndpointError::Protocol { .. } => ErrorClass::Permanent,
            EndpointError::Cancelled => ErrorClass::Permanent,
            EndpointError::Other { .. } => ErrorClass::Permanent,
        }
    }

    /// True if the driver may retry the operation later.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
