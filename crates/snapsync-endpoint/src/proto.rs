//! Request and response types for the send/receive surface.

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

/// The snapshot byte stream produced by a send and consumed by a receive.
///
/// Dropping the stream closes it.
pub type SnapshotStream = Box<dyn AsyncRead + Send + Unpin>;

/// Request for a snapshot send.
///
/// Exactly one of three shapes is valid:
/// - `resume_token` set: resume a partially transferred send
/// - `to` set, `from` empty: full send of `to`
/// - `from` and `to` set: incremental send of the range (`from`, `to`]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SendReq {
    /// Path of the filesystem to send from.
    pub filesystem: String,
    /// Relative name of the incremental base version.
    pub from: Option<String>,
    /// Relative name of the version to send up to.
    pub to: Option<String>,
    /// Resume token from the receiver, if a prior send was interrupted.
    pub resume_token: Option<String>,
}

/// Sender's response to a send request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SendRes {
    /// Whether the sender honored the resume token in the request.
    pub used_resume_token: bool,
}

/// Request for receiving a snapshot stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveReq {
    /// Path of the filesystem to receive into.
    pub filesystem: String,
    /// Clear any stored resume token before applying the stream.
    pub clear_resume_token: bool,
}
