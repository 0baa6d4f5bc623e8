#![warn(missing_docs)]

//! Snapsync replication driver: plans a safe incremental path for every
//! filesystem a sender offers and drives each transfer to completion.
//!
//! The core is a two-level state machine. The overall [`Replication`] plans
//! all filesystems, then works them one at a time in deterministic priority
//! order. Each [`FsReplication`] sequences its planned steps, and a
//! [`Step`] performs one send/receive pair, classifying failures into retry
//! versus permanent. Observers read consistent snapshots through
//! [`report::ReplicationReport`]; a supervisor runs everything through
//! [`Replication::drive`].

pub mod diff;
pub mod driver;
pub mod error;
pub mod fsrep;
pub mod report;
pub mod step;

pub use diff::{incremental_path, resolve_conflict, Conflict, IncrementalPath};
pub use driver::{DriverConfig, Replication, ReplicationState, RetrySignal};
pub use error::ReplError;
pub use fsrep::{FsReplication, FsState};
pub use report::{FsReport, ReplicationReport, StepReport};
pub use step::{Step, StepState};
