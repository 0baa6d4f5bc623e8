//! Data model for replicated filesystems and their snapshot versions.

use serde::{Deserialize, Serialize};

/// A point-in-time version of one filesystem.
///
/// Versions are totally ordered by creation time within one filesystem;
/// the relative name is the identifier used on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilesystemVersion {
    /// Relative name as used in send/receive requests (e.g. `@backup_2026-08-02`).
    pub rel_name: String,
    /// Creation time in microseconds since the Unix epoch.
    pub creation_us: u64,
}

impl FilesystemVersion {
    /// Create a new version.
    pub fn new(rel_name: impl Into<String>, creation_us: u64) -> Self {
        Self {
            rel_name: rel_name.into(),
            creation_us,
        }
    }

    /// The relative name used on the wire.
    pub fn rel_name(&self) -> &str {
        &self.rel_name
    }
}

/// A replicated filesystem.
///
/// Identity is the path; it compares byte-exact on both endpoints. The resume
/// token, when present, points at a partially received send on the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    /// Filesystem path, identical on sender and receiver.
    pub path: String,
    /// Receiver-side resume token for a partially completed send, if any.
    pub resume_token: Option<String>,
}

impl Filesystem {
    /// Create a filesystem handle with no resume token.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            resume_token: None,
        }
    }
}

/// Current time in microseconds since the Unix epoch.
pub fn current_time_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
