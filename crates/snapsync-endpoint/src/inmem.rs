//! In-process scripted endpoint for tests and simulation.
//!
//! `InMemEndpoint` implements both [`Sender`] and [`Receiver`] over an
//! in-memory version table. Snapshot streams are real `AsyncRead`s carrying a
//! JSON payload, and per-operation fault queues let a test script failures
//! call by call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::context::CancelToken;
use crate::endpoint::{Receiver, Sender};
use crate::error::{EndpointError, Result};
use crate::model::{Filesystem, FilesystemVersion};
use crate::proto::{ReceiveReq, SendReq, SendRes, SnapshotStream};

/// What a snapshot stream carries between the in-memory endpoints.
#[derive(Debug, Serialize, Deserialize)]
struct StreamPayload {
    filesystem: String,
    from: Option<FilesystemVersion>,
    to: FilesystemVersion,
}

/// Call counters for one in-memory endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InMemStats {
    /// Number of `list_filesystems` calls served or failed.
    pub list_filesystems_calls: u64,
    /// Number of `list_filesystem_versions` calls served or failed.
    pub list_versions_calls: u64,
    /// Number of `send` calls served or failed.
    pub send_calls: u64,
    /// Number of `receive` calls served or failed.
    pub receive_calls: u64,
}

#[derive(Default)]
struct InMemState {
    filesystems: Vec<Filesystem>,
    versions: HashMap<String, Vec<FilesystemVersion>>,
    filtered: HashSet<String>,
    list_filesystems_faults: VecDeque<EndpointError>,
    version_faults: HashMap<String, VecDeque<EndpointError>>,
    send_faults: VecDeque<EndpointError>,
    receive_faults: VecDeque<EndpointError>,
    missing_stream_sends: u32,
    stats: InMemStats,
}

/// A scripted in-process endpoint, usable as sender and receiver.
#[derive(Default)]
pub struct InMemEndpoint {
    state: Mutex<InMemState>,
}

impl InMemEndpoint {
    /// Create an endpoint with no filesystems.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filesystem with the given versions (kept sorted by creation).
    pub async fn add_filesystem(&self, path: &str, mut versions: Vec<FilesystemVersion>) {
        let mut state = self.state.lock().await;
        versions.sort_by_key(|v| v.creation_us);
        state.filesystems.push(Filesystem::new(path));
        state.versions.insert(path.to_string(), versions);
    }

    /// Make version listing for `path` answer with `Filtered`.
    pub async fn mark_filtered(&self, path: &str) {
        self.state.lock().await.filtered.insert(path.to_string());
    }

    /// Queue a failure for the next `list_filesystems` call.
    pub async fn push_list_filesystems_fault(&self, err: EndpointError) {
        self.state.lock().await.list_filesystems_faults.push_back(err);
    }

    /// Queue a failure for the next version listing of `path`.
    pub async fn push_version_fault(&self, path: &str, err: EndpointError) {
        self.state
            .lock()
            .await
            .version_faults
            .entry(path.to_string())
            .or_default()
            .push_back(err);
    }

    /// Queue a failure for the next `send` call.
    pub async fn push_send_fault(&self, err: EndpointError) {
        self.state.lock().await.send_faults.push_back(err);
    }

    /// Queue a failure for the next `receive` call.
    pub async fn push_receive_fault(&self, err: EndpointError) {
        self.state.lock().await.receive_faults.push_back(err);
    }

    /// Make the next `n` send calls return a response without a stream.
    pub async fn set_missing_stream_sends(&self, n: u32) {
        self.state.lock().await.missing_stream_sends = n;
    }

    /// Snapshot of the call counters.
    pub async fn stats(&self) -> InMemStats {
        self.state.lock().await.stats
    }

    /// Versions currently stored for `path`.
    pub async fn versions_of(&self, path: &str) -> Vec<FilesystemVersion> {
        self.state
            .lock()
            .await
            .versions
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    fn check_cancelled(ctx: &CancelToken) -> Result<()> {
        if ctx.is_cancelled() {
            Err(EndpointError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Sender for InMemEndpoint {
    async fn list_filesystems(&self, ctx: &CancelToken) -> Result<Vec<Filesystem>> {
        let mut state = self.state.lock().await;
        state.stats.list_filesystems_calls += 1;
        Self::check_cancelled(ctx)?;
        if let Some(err) = state.list_filesystems_faults.pop_front() {
            return Err(err);
        }
        Ok(state.filesystems.clone())
    }

    async fn list_filesystem_versions(
        &self,
        ctx: &CancelToken,
        path: &str,
    ) -> Result<Vec<FilesystemVersion>> {
        let mut state = self.state.lock().await;
        state.stats.list_versions_calls += 1;
        Self::check_cancelled(ctx)?;
        if let Some(queue) = state.version_faults.get_mut(path) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        if state.filtered.contains(path) {
            return Err(EndpointError::Filtered {
                filesystem: path.to_string(),
            });
        }
        Ok(state.versions.get(path).cloned().unwrap_or_default())
    }

    async fn send(
        &self,
        ctx: &CancelToken,
        req: SendReq,
    ) -> Result<(SendRes, Option<SnapshotStream>)> {
        let mut state = self.state.lock().await;
        state.stats.send_calls += 1;
        Self::check_cancelled(ctx)?;
        if let Some(err) = state.send_faults.pop_front() {
            return Err(err);
        }
        if state.missing_stream_sends > 0 {
            state.missing_stream_sends -= 1;
            return Ok((SendRes::default(), None));
        }
        if req.resume_token.is_some() {
            return Err(EndpointError::Other {
                msg: format!("resume not supported for {}", req.filesystem),
            });
        }
        let to_name = req.to.as_deref().ok_or_else(|| EndpointError::Other {
            msg: format!("send request for {} names no version", req.filesystem),
        })?;
        let versions = state.versions.get(&req.filesystem).ok_or_else(|| {
            EndpointError::Other {
                msg: format!("unknown filesystem {}", req.filesystem),
            }
        })?;
        let to = versions
            .iter()
            .find(|v| v.rel_name == to_name)
            .cloned()
            .ok_or_else(|| EndpointError::Other {
                msg: format!("unknown version {to_name} of {}", req.filesystem),
            })?;
        let from = match req.from.as_deref() {
            Some(name) => Some(
                versions
                    .iter()
                    .find(|v| v.rel_name == name)
                    .cloned()
                    .ok_or_else(|| EndpointError::Other {
                        msg: format!("unknown version {name} of {}", req.filesystem),
                    })?,
            ),
            None => None,
        };
        let payload = StreamPayload {
            filesystem: req.filesystem,
            from,
            to,
        };
        let bytes = serde_json::to_vec(&payload).map_err(|err| EndpointError::Other {
            msg: format!("encode stream payload: {err}"),
        })?;
        let stream: SnapshotStream = Box::new(std::io::Cursor::new(bytes));
        Ok((SendRes::default(), Some(stream)))
    }
}

#[async_trait]
impl Receiver for InMemEndpoint {
    async fn list_filesystems(&self, ctx: &CancelToken) -> Result<Vec<Filesystem>> {
        Sender::list_filesystems(self, ctx).await
    }

    async fn list_filesystem_versions(
        &self,
        ctx: &CancelToken,
        path: &str,
    ) -> Result<Vec<FilesystemVersion>> {
        Sender::list_filesystem_versions(self, ctx, path).await
    }

    async fn receive(
        &self,
        ctx: &CancelToken,
        req: ReceiveReq,
        mut stream: SnapshotStream,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.stats.receive_calls += 1;
            Self::check_cancelled(ctx)?;
            if let Some(err) = state.receive_faults.pop_front() {
                return Err(err);
            }
        }
        // The stream is read outside the state lock; a real receiver would be
        // parked here for the duration of the transfer.
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await?;
        let payload: StreamPayload =
            serde_json::from_slice(&bytes).map_err(|err| EndpointError::Protocol {
                msg: format!("malformed stream payload: {err}"),
            })?;
        if payload.filesystem != req.filesystem {
            return Err(EndpointError::Protocol {
                msg: format!(
                    "stream for {} received into {}",
                    payload.filesystem, req.filesystem
                ),
            });
        }
        let mut state = self.state.lock().await;
        if !state.filesystems.iter().any(|fs| fs.path == req.filesystem) {
            state.filesystems.push(Filesystem::new(&req.filesystem));
        }
        let versions = state.versions.entry(req.filesystem).or_default();
        if !versions.contains(&payload.to) {
            versions.push(payload.to);
            versions.sort_by_key(|v| v.creation_us);
        }
        Ok(())
    }
}
