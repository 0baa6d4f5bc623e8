//! Version algebra: derive the incremental transfer path between a
//! receiver's and a sender's version history, or a typed conflict.

use snapsync_endpoint::FilesystemVersion;
use thiserror::Error;

/// The transfer path that brings a receiver up to the sender's latest
/// version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncrementalPath {
    /// The receiver's latest version is the sender's latest version.
    UpToDate,
    /// The receiver has nothing; start with a full send of this version.
    Full(FilesystemVersion),
    /// A chain of at least two versions; each consecutive pair is one
    /// incremental step.
    Incremental(Vec<FilesystemVersion>),
}

/// Why no incremental path can be derived.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Conflict {
    /// No version is present in both histories.
    #[error("no shared ancestor between sender and receiver version histories")]
    NoSharedAncestor {
        /// Sender versions, sorted by creation time.
        sender_versions: Vec<FilesystemVersion>,
        /// Receiver versions, sorted by creation time.
        receiver_versions: Vec<FilesystemVersion>,
    },

    /// The receiver has versions newer than everything the sender offers.
    #[error("receiver is ahead of sender, latest shared version is {}", shared.rel_name)]
    ReceiverAhead {
        /// The newest version present in both histories.
        shared: FilesystemVersion,
        /// Receiver versions newer than the shared one.
        receiver_heads: Vec<FilesystemVersion>,
    },

    /// Both sides created versions after their newest shared one.
    #[error("sender and receiver diverged after {}", shared.rel_name)]
    Diverged {
        /// The newest version present in both histories.
        shared: FilesystemVersion,
        /// Sender versions newer than the shared one.
        sender_heads: Vec<FilesystemVersion>,
        /// Receiver versions newer than the shared one.
        receiver_heads: Vec<FilesystemVersion>,
    },
}

/// Compute the incremental path from the receiver's history to the sender's.
///
/// Both lists are sorted by creation time before diffing. A sender with at
/// most one version cannot support an incremental transfer and yields
/// [`Conflict::NoSharedAncestor`], as does an empty receiver history; the
/// latter is the one conflict [`resolve_conflict`] recovers from.
pub fn incremental_path(
    receiver: &[FilesystemVersion],
    sender: &[FilesystemVersion],
) -> Result<IncrementalPath, Conflict> {
    let mut receiver = receiver.to_vec();
    receiver.sort_by_key(|v| v.creation_us);
    let mut sender = sender.to_vec();
    sender.sort_by_key(|v| v.creation_us);

    if sender.len() <= 1 || receiver.is_empty() {
        return Err(Conflict::NoSharedAncestor {
            sender_versions: sender,
            receiver_versions: receiver,
        });
    }

    // Newest receiver version that the sender also has.
    let shared = receiver
        .iter()
        .enumerate()
        .rev()
        .find_map(|(rcv_idx, version)| {
            sender
                .iter()
                .position(|s| s == version)
                .map(|snd_idx| (rcv_idx, snd_idx))
        });
    let Some((rcv_idx, snd_idx)) = shared else {
        return Err(Conflict::NoSharedAncestor {
            sender_versions: sender,
            receiver_versions: receiver,
        });
    };

    let receiver_at_shared = rcv_idx == receiver.len() - 1;
    let sender_at_shared = snd_idx == sender.len() - 1;
    match (receiver_at_shared, sender_at_shared) {
        (true, true) => Ok(IncrementalPath::UpToDate),
        (true, false) => Ok(IncrementalPath::Incremental(sender[snd_idx..].to_vec())),
        (false, true) => Err(Conflict::ReceiverAhead {
            shared: receiver[rcv_idx].clone(),
            receiver_heads: receiver[rcv_idx + 1..].to_vec(),
        }),
        (false, false) => Err(Conflict::Diverged {
            shared: receiver[rcv_idx].clone(),
            sender_heads: sender[snd_idx + 1..].to_vec(),
            receiver_heads: receiver[rcv_idx + 1..].to_vec(),
        }),
    }
}

/// Decide whether a conflict can be recovered from without operator help.
///
/// Returns the recovery path and an explanatory message, or `None` and the
/// reason the conflict is fatal for the filesystem. The only recoverable
/// case is a receiver with no versions at all, which turns into a full send
/// of the sender's latest version.
pub fn resolve_conflict(conflict: &Conflict) -> (Option<IncrementalPath>, String) {
    match conflict {
        Conflict::NoSharedAncestor {
            sender_versions,
            receiver_versions,
        } if receiver_versions.is_empty() => match sender_versions.last() {
            Some(latest) => (
                Some(IncrementalPath::Full(latest.clone())),
                format!(
                    "receiver has no versions, planning full send of {}",
                    latest.rel_name
                ),
            ),
            None => (None, "sender has no versions to send".to_string()),
        },
        Conflict::NoSharedAncestor { .. } => (
            None,
            "histories share no version, manual intervention required".to_string(),
        ),
        Conflict::ReceiverAhead { shared, .. } => (
            None,
            format!(
                "receiver already has versions newer than {}, refusing to roll it back",
                shared.rel_name
            ),
        ),
        Conflict::Diverged { shared, .. } => (
            None,
            format!(
                "both sides created versions after {}, manual intervention required",
                shared.rel_name
            ),
        ),
    }
}
