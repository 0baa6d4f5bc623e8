//! The sender and receiver capability traits consumed by a replication driver.

use async_trait::async_trait;
use std::sync::Arc;

use crate::context::CancelToken;
use crate::error::Result;
use crate::model::{Filesystem, FilesystemVersion};
use crate::proto::{ReceiveReq, SendReq, SendRes, SnapshotStream};

/// The sending side of a replication pair.
#[async_trait]
pub trait Sender: Send + Sync {
    /// List the filesystems this sender replicates.
    async fn list_filesystems(&self, ctx: &CancelToken) -> Result<Vec<Filesystem>>;

    /// List the versions of one filesystem.
    ///
    /// Any failure here, a filter included, fails the planning pass; only
    /// the receiver may opt out of a filesystem.
    async fn list_filesystem_versions(
        &self,
        ctx: &CancelToken,
        path: &str,
    ) -> Result<Vec<FilesystemVersion>>;

    /// Produce a snapshot stream for the requested send.
    ///
    /// A conforming sender always returns a stream; `None` is a protocol
    /// violation the driver treats as permanent.
    async fn send(
        &self,
        ctx: &CancelToken,
        req: SendReq,
    ) -> Result<(SendRes, Option<SnapshotStream>)>;
}

/// The receiving side of a replication pair.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// List the filesystems present on the receiver.
    async fn list_filesystems(&self, ctx: &CancelToken) -> Result<Vec<Filesystem>>;

    /// List the versions of one filesystem.
    ///
    /// May return [`EndpointError::Filtered`](crate::EndpointError::Filtered)
    /// to exclude the filesystem from replication.
    async fn list_filesystem_versions(
        &self,
        ctx: &CancelToken,
        path: &str,
    ) -> Result<Vec<FilesystemVersion>>;

    /// Consume a snapshot stream into the requested filesystem.
    async fn receive(
        &self,
        ctx: &CancelToken,
        req: ReceiveReq,
        stream: SnapshotStream,
    ) -> Result<()>;
}

/// The sender/receiver pair one replication run operates on.
#[derive(Clone)]
pub struct EndpointPair {
    sender: Arc<dyn Sender>,
    receiver: Arc<dyn Receiver>,
}

impl EndpointPair {
    /// Pair up a sender and a receiver.
    pub fn new(sender: Arc<dyn Sender>, receiver: Arc<dyn Receiver>) -> Self {
        Self { sender, receiver }
    }

    /// The sending endpoint.
    pub fn sender(&self) -> &dyn Sender {
        self.sender.as_ref()
    }

    /// The receiving endpoint.
    pub fn receiver(&self) -> &dyn Receiver {
        self.receiver.as_ref()
    }
}

impl std::fmt::Debug for EndpointPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointPair").finish_non_exhaustive()
    }
}
