//! One replication step: a single send/receive pair and its outcome.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use snapsync_endpoint::{
    CancelToken, EndpointError, EndpointPair, ErrorClass, Filesystem, FilesystemVersion,
    ReceiveReq, SendReq,
};

use crate::report::StepReport;

/// Outcome state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// Not executed yet.
    Pending,
    /// Failed with a transient error; will be executed again.
    Retry,
    /// Failed with a permanent error; never executed again.
    PermanentError,
    /// Transferred successfully.
    Completed,
}

#[derive(Debug)]
struct StepStatus {
    state: StepState,
    err: Option<EndpointError>,
}

/// One planned transfer: a full send of `to`, or the incremental range
/// (`from`, `to`].
///
/// `from` and `to` are immutable after planning; the status has its own lock
/// and is written once per execution attempt.
#[derive(Debug)]
pub struct Step {
    from: Option<FilesystemVersion>,
    to: FilesystemVersion,
    status: Mutex<StepStatus>,
}

impl Step {
    /// Create a pending step.
    pub fn new(from: Option<FilesystemVersion>, to: FilesystemVersion) -> Self {
        Self {
            from,
            to,
            status: Mutex::new(StepStatus {
                state: StepState::Pending,
                err: None,
            }),
        }
    }

    /// The incremental base version, if this is an incremental step.
    pub fn from_version(&self) -> Option<&FilesystemVersion> {
        self.from.as_ref()
    }

    /// The version this step transfers up to.
    pub fn to_version(&self) -> &FilesystemVersion {
        &self.to
    }

    /// Current step state.
    pub async fn state(&self) -> StepState {
        self.status.lock().await.state
    }

    /// Snapshot for observers.
    pub async fn report(&self) -> StepReport {
        let status = self.status.lock().await;
        StepReport {
            from: self.from.as_ref().map(|v| v.rel_name.clone()),
            to: self.to.rel_name.clone(),
            state: status.state,
            error: status.err.as_ref().map(|e| e.to_string()),
        }
    }

    fn describe(&self, path: &str) -> String {
        match &self.from {
            None => format!("{path}{} (full)", self.to.rel_name),
            Some(from) => format!("{path}({} => {})", from.rel_name, self.to.rel_name),
        }
    }

    /// Perform the send/receive pair for this step and commit the outcome.
    pub(crate) async fn execute(
        &self,
        fs: &Mutex<Filesystem>,
        ep: &EndpointPair,
        ctx: &CancelToken,
    ) -> StepState {
        let (path, resume_token) = {
            let mut fs = fs.lock().await;
            let token = refresh_resume_token(&mut fs);
            (fs.path.clone(), token)
        };

        let req = if let Some(token) = resume_token {
            SendReq {
                filesystem: path.clone(),
                resume_token: Some(token),
                ..Default::default()
            }
        } else if let Some(from) = &self.from {
            SendReq {
                filesystem: path.clone(),
                from: Some(from.rel_name.clone()),
                to: Some(self.to.rel_name.clone()),
                resume_token: None,
            }
        } else {
            SendReq {
                filesystem: path.clone(),
                to: Some(self.to.rel_name.clone()),
                ..Default::default()
            }
        };

        tracing::debug!(filesystem = %path, step = %self.describe(&path), "initiating send request");
        let (sres, stream) = match ep.sender().send(ctx, req).await {
            Ok(res) => res,
            Err(err) => {
                tracing::error!(filesystem = %path, error = %err, "send request failed");
                return self.commit_error(err).await;
            }
        };
        let Some(stream) = stream else {
            let err = EndpointError::Protocol {
                msg: "send request did not return a stream, broken endpoint implementation"
                    .to_string(),
            };
            tracing::error!(filesystem = %path, error = %err, "send request failed");
            return self.commit_error(err).await;
        };

        let rreq = ReceiveReq {
            filesystem: path.clone(),
            clear_resume_token: !sres.used_resume_token,
        };
        tracing::debug!(filesystem = %path, step = %self.describe(&path), "initiating receive request");
        match ep.receiver().receive(ctx, rreq, stream).await {
            Ok(()) => {
                tracing::debug!(filesystem = %path, step = %self.describe(&path), "receive finished");
                self.commit_completed().await
            }
            Err(err) => {
                // The stream is dropped by the failed receive, which closes
                // it. The root cause may equally be on the sending side.
                tracing::error!(filesystem = %path, error = %err, "receive request failed");
                self.commit_error(err).await
            }
        }
    }

    async fn commit_error(&self, err: EndpointError) -> StepState {
        let state = match err.class() {
            ErrorClass::Transient => StepState::Retry,
            ErrorClass::Permanent | ErrorClass::Filtered => StepState::PermanentError,
        };
        let mut status = self.status.lock().await;
        status.err = Some(err);
        status.state = state;
        state
    }

    async fn commit_completed(&self) -> StepState {
        let mut status = self.status.lock().await;
        status.err = None;
        status.state = StepState::Completed;
        StepState::Completed
    }
}

/// Refresh the filesystem's resume token before building a send request.
///
/// Resumable transfers are not implemented; the stored token is dropped so
/// every attempt requests a fresh send. A resume implementation replaces
/// this with a receiver-side token lookup.
fn refresh_resume_token(fs: &mut Filesystem) -> Option<String> {
    fs.resume_token = None;
    fs.resume_token.clone()
}
