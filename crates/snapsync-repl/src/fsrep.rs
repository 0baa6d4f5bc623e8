//! Per-filesystem replication state machine.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use snapsync_endpoint::{CancelToken, EndpointPair, Filesystem};

use crate::error::ReplError;
use crate::report::FsReport;
use crate::step::{Step, StepState};

/// State of one filesystem's replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsState {
    /// Has pending steps and is waiting to be scheduled.
    Queued,
    /// A step is currently executing.
    Active,
    /// The last step failed transiently; waiting for the retry backoff.
    RetryWait,
    /// Failed permanently; terminal.
    PermanentError,
    /// All steps transferred; terminal.
    Completed,
}

impl FsState {
    /// Terminal states never transition again within one run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FsState::PermanentError | FsState::Completed)
    }

    fn is_settled_for_now(&self) -> bool {
        matches!(
            self,
            FsState::RetryWait | FsState::PermanentError | FsState::Completed
        )
    }
}

/// Scheduler sort key. Queued filesystems order before RetryWait ones;
/// within Queued, the earlier next step wins; within RetryWait, the fewest
/// retries win. The derived `Ord` encodes exactly that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SchedKey {
    /// Ready to run; ordered by the creation time of the next step's target.
    Queued {
        /// Creation time of `pending[0].to` in microseconds.
        next_step_due_us: u64,
    },
    /// Waiting out a retry; ordered by retries since the last completed step.
    RetryWait {
        /// Retries since the last completed step.
        retries: u32,
    },
}

#[derive(Debug)]
struct FsInner {
    state: FsState,
    permanent_error: Option<ReplError>,
    pending: VecDeque<Arc<Step>>,
    completed: Vec<Arc<Step>>,
    active: Option<Arc<Step>>,
    retries_since_last_error: u32,
}

/// Replication of one filesystem: an ordered queue of steps, at most one of
/// them active, plus the retry bookkeeping the overall scheduler uses.
#[derive(Debug)]
pub struct FsReplication {
    path: String,
    fs: Mutex<Filesystem>,
    inner: Mutex<FsInner>,
}

/// Builds an [`FsReplication`] from planned steps.
pub struct FsReplicationBuilder {
    fs: Filesystem,
    steps: VecDeque<Arc<Step>>,
}

impl FsReplicationBuilder {
    /// Append a step; planning adds steps in creation-time order.
    pub fn add_step(mut self, step: Step) -> Self {
        self.steps.push_back(Arc::new(step));
        self
    }

    /// Finish building. With steps the filesystem starts Queued, without any
    /// it is already Completed.
    pub fn build(self) -> Arc<FsReplication> {
        let state = if self.steps.is_empty() {
            FsState::Completed
        } else {
            FsState::Queued
        };
        Arc::new(FsReplication {
            path: self.fs.path.clone(),
            fs: Mutex::new(self.fs),
            inner: Mutex::new(FsInner {
                state,
                permanent_error: None,
                pending: self.steps,
                completed: Vec::new(),
                active: None,
                retries_since_last_error: 0,
            }),
        })
    }
}

impl FsReplication {
    /// Start building a replication for `fs`.
    pub fn builder(fs: Filesystem) -> FsReplicationBuilder {
        FsReplicationBuilder {
            fs,
            steps: VecDeque::new(),
        }
    }

    /// A filesystem that failed during planning; terminal from the start.
    pub fn permanent(fs: Filesystem, err: ReplError) -> Arc<Self> {
        Arc::new(Self {
            path: fs.path.clone(),
            fs: Mutex::new(fs),
            inner: Mutex::new(FsInner {
                state: FsState::PermanentError,
                permanent_error: Some(err),
                pending: VecDeque::new(),
                completed: Vec::new(),
                active: None,
                retries_since_last_error: 0,
            }),
        })
    }

    /// The filesystem path this replication transfers.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current state.
    pub async fn state(&self) -> FsState {
        self.inner.lock().await.state
    }

    /// Retries since the last completed step.
    pub async fn retries_since_last_error(&self) -> u32 {
        self.inner.lock().await.retries_since_last_error
    }

    /// Scheduler key; `None` outside the schedulable states.
    pub(crate) async fn sched_key(&self) -> Option<SchedKey> {
        let inner = self.inner.lock().await;
        match inner.state {
            FsState::Queued => inner.pending.front().map(|step| SchedKey::Queued {
                next_step_due_us: step.to_version().creation_us,
            }),
            FsState::RetryWait => Some(SchedKey::RetryWait {
                retries: inner.retries_since_last_error,
            }),
            _ => None,
        }
    }

    /// Count one more entry into RetryWait.
    pub(crate) async fn note_retry(&self) {
        self.inner.lock().await.retries_since_last_error += 1;
    }

    /// Put a filesystem parked in RetryWait back into the queue. The overall
    /// machine calls this once the retry backoff has elapsed.
    pub(crate) async fn requeue_after_wait(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == FsState::RetryWait {
            inner.state = FsState::Queued;
        }
    }

    /// Run this filesystem until it settles into RetryWait, PermanentError
    /// or Completed, executing pending steps in order.
    pub(crate) async fn drive(&self, ep: &EndpointPair, ctx: &CancelToken) -> FsState {
        loop {
            let pre = self.state().await;
            if pre.is_settled_for_now() {
                return pre;
            }
            let started = Instant::now();
            let post = self.step_once(ep, ctx).await;
            tracing::debug!(
                filesystem = %self.path,
                from = ?pre,
                to = ?post,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "filesystem state transition"
            );
            if post.is_settled_for_now() {
                return post;
            }
        }
    }

    /// Apply one transition. The inner lock is held only to read the plan
    /// and to commit the outcome, never across the transfer itself.
    async fn step_once(&self, ep: &EndpointPair, ctx: &CancelToken) -> FsState {
        let step = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                FsState::Queued => {
                    if inner.active.is_none() {
                        match inner.pending.pop_front() {
                            None => {
                                inner.state = FsState::Completed;
                                return inner.state;
                            }
                            Some(step) => inner.active = Some(step),
                        }
                    }
                    inner.state = FsState::Active;
                    return inner.state;
                }
                FsState::Active => inner
                    .active
                    .clone()
                    .expect("active step is set while in Active state"),
                state @ (FsState::RetryWait | FsState::PermanentError | FsState::Completed) => {
                    return state;
                }
            }
        };

        let outcome = step.execute(&self.fs, ep, ctx).await;

        let mut inner = self.inner.lock().await;
        let step = inner
            .active
            .take()
            .expect("active step is set while in Active state");
        match outcome {
            StepState::Completed => {
                inner.completed.push(step);
                inner.retries_since_last_error = 0;
                inner.state = if inner.pending.is_empty() {
                    FsState::Completed
                } else {
                    FsState::Queued
                };
            }
            StepState::Retry => {
                // The step stays at the head of the queue and is re-executed
                // after the backoff.
                inner.pending.push_front(step);
                inner.state = FsState::RetryWait;
            }
            StepState::PermanentError => {
                inner.pending.push_front(step);
                inner.state = FsState::PermanentError;
            }
            StepState::Pending => unreachable!("step executor never returns Pending"),
        }
        inner.state
    }

    /// Snapshot for observers. Locks are taken one level at a time; the
    /// driver is never blocked behind a report.
    pub async fn report(&self) -> FsReport {
        let (state, retries, permanent_error, pending, completed, active) = {
            let inner = self.inner.lock().await;
            (
                inner.state,
                inner.retries_since_last_error,
                inner.permanent_error.as_ref().map(|e| e.to_string()),
                inner.pending.iter().cloned().collect::<Vec<_>>(),
                inner.completed.clone(),
                inner.active.clone(),
            )
        };
        let mut pending_steps = Vec::with_capacity(pending.len());
        for step in &pending {
            pending_steps.push(step.report().await);
        }
        let mut completed_steps = Vec::with_capacity(completed.len());
        for step in &completed {
            completed_steps.push(step.report().await);
        }
        let active_step = match active {
            Some(step) => Some(step.report().await),
            None => None,
        };
        FsReport {
            path: self.path.clone(),
            state,
            retries_since_last_error: retries,
            permanent_error,
            pending_steps,
            completed_steps,
            active_step,
        }
    }
}
