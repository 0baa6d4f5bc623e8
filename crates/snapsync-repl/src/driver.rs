//! Overall replication state machine and the driver harness that runs it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

use snapsync_endpoint::{
    current_time_us, CancelToken, EndpointError, EndpointPair, ErrorClass,
};

use crate::diff::{incremental_path, resolve_conflict, IncrementalPath};
use crate::error::ReplError;
use crate::fsrep::{FsReplication, FsState};
use crate::report::ReplicationReport;
use crate::step::Step;

/// State of the overall replication run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationState {
    /// Listing filesystems and computing the plan.
    Planning,
    /// Planning failed; waiting before planning again.
    PlanningError,
    /// Working the planned filesystems, one at a time.
    Working,
    /// The active filesystem hit a transient error; waiting before retrying.
    WorkingWait,
    /// Every planned filesystem settled; terminal.
    Completed,
    /// The run was cancelled; terminal.
    ContextDone,
}

/// Tunables of the replication driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// How long to wait after a failed planning pass before planning again.
    pub planning_retry_interval: Duration,
    /// How long to wait before retrying a transiently failed filesystem.
    pub working_retry_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            planning_retry_interval: Duration::from_secs(10),
            working_retry_interval: Duration::from_secs(10),
        }
    }
}

/// Best-effort wakeup for a run sleeping in WorkingWait.
///
/// The signal is lost when no run is waiting; callers treat it as a hint.
/// PlanningError waits are not interruptible, planning failures cool down
/// regardless.
#[derive(Debug, Clone, Default)]
pub struct RetrySignal {
    notify: Arc<Notify>,
}

impl RetrySignal {
    /// Create a signal handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake a run currently sleeping in WorkingWait, if any.
    pub fn trigger(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[derive(Debug)]
struct ReplInner {
    state: ReplicationState,
    pending: Vec<Arc<FsReplication>>,
    completed: Vec<Arc<FsReplication>>,
    active: Option<Arc<FsReplication>>,
    planning_error: Option<EndpointError>,
    context_error: Option<String>,
    sleep_until_us: Option<u64>,
}

/// One replication run over an endpoint pair.
///
/// All state mutations go through a single serialized updater holding the
/// run's lock, so observers always see a consistent snapshot. The lock is
/// never held across endpoint I/O.
#[derive(Debug)]
pub struct Replication {
    config: DriverConfig,
    inner: Mutex<ReplInner>,
}

/// The outcome of one planning pass.
pub(crate) struct Plan {
    pub(crate) pending: Vec<Arc<FsReplication>>,
    pub(crate) completed: Vec<Arc<FsReplication>>,
}

impl Replication {
    /// Create a run with the given tunables, ready to be driven.
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(ReplInner {
                state: ReplicationState::Planning,
                pending: Vec::new(),
                completed: Vec::new(),
                active: None,
                planning_error: None,
                context_error: None,
                sleep_until_us: None,
            }),
        }
    }

    /// Current overall state.
    pub async fn state(&self) -> ReplicationState {
        self.inner.lock().await.state
    }

    /// Run the replication to termination.
    ///
    /// Loops the state machine, logging every transition with its duration,
    /// until the run reaches Completed or ContextDone. `retry_now` wakes a
    /// run sleeping in WorkingWait.
    pub async fn drive(&self, ep: &EndpointPair, ctx: &CancelToken, retry_now: &RetrySignal) {
        loop {
            let pre = self.state().await;
            let started = Instant::now();
            let post = match pre {
                ReplicationState::Planning => self.run_planning(ep, ctx).await,
                ReplicationState::PlanningError => self.run_planning_error(ctx).await,
                ReplicationState::Working => self.run_working(ep, ctx).await,
                ReplicationState::WorkingWait => self.run_working_wait(ctx, retry_now).await,
                ReplicationState::Completed | ReplicationState::ContextDone => {
                    tracing::debug!(final_state = ?pre, "replication finished");
                    return;
                }
            };
            tracing::debug!(
                from = ?pre,
                to = ?post,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "replication state transition"
            );
        }
    }

    /// Serialized state updater; returns the state after the update.
    async fn update(&self, f: impl FnOnce(&mut ReplInner)) -> ReplicationState {
        let mut inner = self.inner.lock().await;
        f(&mut inner);
        inner.state
    }

    async fn enter_context_done(&self, reason: String) -> ReplicationState {
        tracing::info!(reason = %reason, "replication cancelled");
        self.update(|r| {
            r.context_error = Some(reason);
            r.sleep_until_us = None;
            r.state = ReplicationState::ContextDone;
        })
        .await
    }

    async fn run_planning(&self, ep: &EndpointPair, ctx: &CancelToken) -> ReplicationState {
        if let Some(reason) = ctx.reason() {
            return self.enter_context_done(reason).await;
        }
        match build_plan(ep, ctx).await {
            Ok(plan) => {
                self.update(|r| {
                    r.pending = plan.pending;
                    r.completed = plan.completed;
                    r.active = None;
                    r.planning_error = None;
                    r.state = ReplicationState::Working;
                })
                .await
            }
            Err(err) => {
                tracing::error!(error = %err, "replication planning failed");
                self.update(|r| {
                    r.planning_error = Some(err);
                    r.state = ReplicationState::PlanningError;
                })
                .await
            }
        }
    }

    async fn run_planning_error(&self, ctx: &CancelToken) -> ReplicationState {
        let interval = self.config.planning_retry_interval;
        self.update(|r| {
            r.sleep_until_us = Some(current_time_us() + interval.as_micros() as u64);
        })
        .await;
        tokio::select! {
            reason = ctx.cancelled() => self.enter_context_done(reason).await,
            _ = tokio::time::sleep(interval) => {
                self.update(|r| {
                    r.sleep_until_us = None;
                    r.state = ReplicationState::Planning;
                })
                .await
            }
        }
    }

    async fn run_working(&self, ep: &EndpointPair, ctx: &CancelToken) -> ReplicationState {
        if let Some(reason) = ctx.reason() {
            return self.enter_context_done(reason).await;
        }

        let active = { self.inner.lock().await.active.clone() };
        let active = match active {
            Some(fsrep) => fsrep,
            None => match self.select_next().await {
                Some(fsrep) => fsrep,
                None => {
                    return self
                        .update(|r| r.state = ReplicationState::Completed)
                        .await;
                }
            },
        };

        match active.state().await {
            FsState::RetryWait => {
                self.update(|r| r.state = ReplicationState::WorkingWait)
                    .await
            }
            FsState::Queued => {
                // The run's lock is not held while the filesystem transfers.
                let post = active.drive(ep, ctx).await;
                match post {
                    FsState::RetryWait => active.note_retry().await,
                    FsState::Completed | FsState::PermanentError => {
                        self.update(|r| {
                            r.completed.push(active.clone());
                            r.active = None;
                        })
                        .await;
                    }
                    // A completed step resets the retry counter inside the
                    // filesystem machine; the item simply stays active.
                    FsState::Queued => {}
                    FsState::Active => {
                        unreachable!("filesystem driver returned while still active")
                    }
                }
                self.update(|_| {}).await
            }
            state => unreachable!("active filesystem scheduled in state {state:?}"),
        }
    }

    /// Pick the next filesystem to work: Queued before RetryWait, then the
    /// earliest next step, then the fewest retries. Returns `None` when the
    /// queue is empty.
    async fn select_next(&self) -> Option<Arc<FsReplication>> {
        // Only the driver task mutates membership, so keys gathered outside
        // the lock stay consistent with the commit below.
        let pending = { self.inner.lock().await.pending.clone() };
        if pending.is_empty() {
            return None;
        }
        let mut keyed = Vec::with_capacity(pending.len());
        for fsrep in pending {
            let key = fsrep
                .sched_key()
                .await
                .expect("pending filesystems are Queued or RetryWait");
            keyed.push((key, fsrep));
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        let chosen = keyed.remove(0).1;
        self.update(|r| {
            r.pending.retain(|fsrep| !Arc::ptr_eq(fsrep, &chosen));
            r.active = Some(chosen.clone());
        })
        .await;
        Some(chosen)
    }

    async fn run_working_wait(
        &self,
        ctx: &CancelToken,
        retry_now: &RetrySignal,
    ) -> ReplicationState {
        let interval = self.config.working_retry_interval;
        self.update(|r| {
            r.sleep_until_us = Some(current_time_us() + interval.as_micros() as u64);
        })
        .await;
        tokio::select! {
            reason = ctx.cancelled() => self.enter_context_done(reason).await,
            _ = tokio::time::sleep(interval) => self.resume_working().await,
            _ = retry_now.wait() => {
                tracing::debug!("wakeup signal received");
                self.resume_working().await
            }
        }
    }

    /// Return from WorkingWait: the backoff is over, so the parked
    /// filesystem re-enters the queue state and Working re-drives it.
    async fn resume_working(&self) -> ReplicationState {
        let active = { self.inner.lock().await.active.clone() };
        if let Some(fsrep) = active {
            fsrep.requeue_after_wait().await;
        }
        self.update(|r| {
            r.sleep_until_us = None;
            r.state = ReplicationState::Working;
        })
        .await
    }

    /// Snapshot for observers, taken one lock level at a time.
    pub async fn report(&self) -> ReplicationReport {
        let (state, sleep_until_us, planning_error, context_error, pending, completed, active) = {
            let inner = self.inner.lock().await;
            (
                inner.state,
                inner.sleep_until_us,
                inner.planning_error.as_ref().map(|e| e.to_string()),
                inner.context_error.clone(),
                inner.pending.clone(),
                inner.completed.clone(),
                inner.active.clone(),
            )
        };
        let mut pending_reports = Vec::with_capacity(pending.len());
        for fsrep in &pending {
            pending_reports.push(fsrep.report().await);
        }
        let mut completed_reports = Vec::with_capacity(completed.len());
        for fsrep in &completed {
            completed_reports.push(fsrep.report().await);
        }
        let active_report = match active {
            Some(fsrep) => Some(fsrep.report().await),
            None => None,
        };
        ReplicationReport {
            state,
            sleep_until_us,
            planning_error,
            context_error,
            pending: pending_reports,
            completed: completed_reports,
            active: active_report,
        }
    }
}

impl Default for Replication {
    fn default() -> Self {
        Self::new(DriverConfig::default())
    }
}

/// One planning pass: list both sides, derive a path per filesystem, bucket
/// the results. Fails on any endpoint error that is not a filter.
pub(crate) async fn build_plan(
    ep: &EndpointPair,
    ctx: &CancelToken,
) -> Result<Plan, EndpointError> {
    let sender_fss = ep.sender().list_filesystems(ctx).await?;
    let receiver_fss = ep.receiver().list_filesystems(ctx).await?;

    let mut pending = Vec::with_capacity(sender_fss.len());
    let mut completed = Vec::new();

    for fs in sender_fss {
        tracing::info!(filesystem = %fs.path, "assessing filesystem");

        let sender_versions = match ep.sender().list_filesystem_versions(ctx, &fs.path).await {
            Ok(versions) => versions,
            Err(err) => {
                tracing::error!(filesystem = %fs.path, error = %err, "cannot list sender filesystem versions");
                return Err(err);
            }
        };

        if sender_versions.len() <= 1 {
            tracing::error!(filesystem = %fs.path, "sender does not have any versions");
            completed.push(FsReplication::permanent(fs, ReplError::SenderHasNoVersions));
            continue;
        }

        let receiver_has_fs = receiver_fss.iter().any(|rfs| rfs.path == fs.path);
        let receiver_versions = if receiver_has_fs {
            match ep.receiver().list_filesystem_versions(ctx, &fs.path).await {
                Ok(versions) => versions,
                Err(err) if err.class() == ErrorClass::Filtered => {
                    tracing::info!(filesystem = %fs.path, "receiver ignores filesystem");
                    continue;
                }
                Err(err) => {
                    tracing::error!(filesystem = %fs.path, error = %err, "cannot list receiver filesystem versions");
                    return Err(err);
                }
            }
        } else {
            Vec::new()
        };

        let path = match incremental_path(&receiver_versions, &sender_versions) {
            Ok(path) => path,
            Err(conflict) => {
                let (resolved, msg) = resolve_conflict(&conflict);
                match resolved {
                    Some(path) => {
                        tracing::info!(
                            filesystem = %fs.path,
                            conflict = %conflict,
                            resolution = %msg,
                            "conflict resolved automatically"
                        );
                        path
                    }
                    None => {
                        tracing::error!(
                            filesystem = %fs.path,
                            conflict = %conflict,
                            problem = %msg,
                            "cannot resolve conflict"
                        );
                        completed.push(FsReplication::permanent(fs, ReplError::Conflict(conflict)));
                        continue;
                    }
                }
            }
        };

        let mut builder = FsReplication::builder(fs);
        match path {
            IncrementalPath::UpToDate => {}
            IncrementalPath::Full(to) => {
                builder = builder.add_step(Step::new(None, to));
            }
            IncrementalPath::Incremental(chain) => {
                for pair in chain.windows(2) {
                    builder = builder.add_step(Step::new(Some(pair[0].clone()), pair[1].clone()));
                }
            }
        }
        let fsrep = builder.build();
        match fsrep.state().await {
            FsState::Queued => pending.push(fsrep),
            FsState::Completed => completed.push(fsrep),
            state => unreachable!("freshly built filesystem in state {state:?}"),
        }
    }

    Ok(Plan { pending, completed })
}
