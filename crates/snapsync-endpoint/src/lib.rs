#![warn(missing_docs)]

//! Snapsync endpoint interface: the capability surface a replication driver
//! consumes to move snapshot trees between a sender and a receiver.
//!
//! This crate owns:
//! - the data model for replicated filesystems and their versions
//! - the send/receive request types and the snapshot byte stream
//! - the `Sender`/`Receiver` traits and the `EndpointPair` handed to a driver
//! - `EndpointError`, classifiable by value into retry/permanent/filtered
//! - `CancelToken`, the cancellation context threaded into every call
//! - an in-process scripted endpoint for tests and simulation

pub mod context;
pub mod endpoint;
pub mod error;
pub mod inmem;
pub mod model;
pub mod proto;

pub use context::CancelToken;
pub use endpoint::{EndpointPair, Receiver, Sender};
pub use error::{EndpointError, ErrorClass, Result};
pub use inmem::{InMemEndpoint, InMemStats};
pub use model::{current_time_us, Filesystem, FilesystemVersion};
pub use proto::{ReceiveReq, SendReq, SendRes, SnapshotStream};
