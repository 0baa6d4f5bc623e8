//! Read-only snapshots of a replication run for status reporting.
//!
//! Reports are copied out one lock level at a time and are fully
//! serializable, so a status socket can ship them to a client as JSON.

use serde::{Deserialize, Serialize};

use crate::driver::ReplicationState;
use crate::fsrep::FsState;
use crate::step::StepState;

/// Snapshot of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    /// Relative name of the incremental base, if any.
    pub from: Option<String>,
    /// Relative name of the target version.
    pub to: String,
    /// Step state at snapshot time.
    pub state: StepState,
    /// Message of the carried error, if the step failed.
    pub error: Option<String>,
}

/// Snapshot of one filesystem's replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsReport {
    /// Filesystem path.
    pub path: String,
    /// Filesystem state at snapshot time.
    pub state: FsState,
    /// Retries since the last completed step.
    pub retries_since_last_error: u32,
    /// Message of the planning-time permanent error, if any.
    pub permanent_error: Option<String>,
    /// Steps not yet transferred, in execution order.
    pub pending_steps: Vec<StepReport>,
    /// Steps already transferred, in completion order.
    pub completed_steps: Vec<StepReport>,
    /// The currently executing step, if any.
    pub active_step: Option<StepReport>,
}

impl FsReport {
    /// True if this filesystem will make no further progress.
    pub fn is_settled(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Snapshot of the overall replication run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationReport {
    /// Overall state at snapshot time.
    pub state: ReplicationState,
    /// Wakeup deadline in microseconds, while in a wait state.
    pub sleep_until_us: Option<u64>,
    /// Message of the planning error, while in PlanningError.
    pub planning_error: Option<String>,
    /// Cancellation reason, once in ContextDone.
    pub context_error: Option<String>,
    /// Filesystems still queued for work.
    pub pending: Vec<FsReport>,
    /// Filesystems that finished, successfully or permanently failed.
    pub completed: Vec<FsReport>,
    /// The filesystem currently being worked, if any.
    pub active: Option<FsReport>,
}

impl ReplicationReport {
    /// Total number of filesystems in the plan.
    pub fn filesystem_count(&self) -> usize {
        self.pending.len() + self.completed.len() + usize::from(self.active.is_some())
    }

    /// Number of filesystems that ended in a permanent error.
    pub fn permanent_error_count(&self) -> usize {
        self.completed
            .iter()
            .filter(|fs| fs.state == FsState::PermanentError)
            .count()
    }

    /// One-line summary for log lines and status bars.
    pub fn one_line_summary(&self) -> String {
        format!(
            "{:?}: {} filesystems, {} pending, {} completed, {} failed",
            self.state,
            self.filesystem_count(),
            self.pending.len() + usize::from(self.active.is_some()),
            self.completed.len() - self.permanent_error_count(),
            self.permanent_error_count()
        )
    }
}
