//! Error types for the replication driver.

use snapsync_endpoint::EndpointError;
use thiserror::Error;

use crate::diff::Conflict;

/// Errors the driver records on a filesystem or on the overall run.
#[derive(Debug, Error)]
pub enum ReplError {
    /// The sender offers at most one version; no transfer is meaningful.
    #[error("sender does not have any versions")]
    SenderHasNoVersions,

    /// The version histories cannot be reconciled.
    #[error(transparent)]
    Conflict(#[from] Conflict),

    /// An endpoint operation failed.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// The run was cancelled.
    #[error("replication cancelled: {reason}")]
    Cancelled {
        /// The recorded cancellation reason.
        reason: String,
    },
}
