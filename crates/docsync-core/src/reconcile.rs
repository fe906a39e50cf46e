//! Reconciliation policy.
//!
//! Guards applied in fixed priority when a copy of a document arrives from
//! somewhere other than the local user:
//!
//! 1. ownership: anything for another owner is rejected;
//! 2. non-destructive merge: an empty candidate never replaces non-empty
//!    local content;
//! 3. at login (and on refresh or a staleness re-fetch) non-empty remote
//!    content is authoritative; a refresh alone yields to edits made since
//!    it was requested;
//! 4. idempotence: identical content changes nothing.

use crate::document::DocumentContent;
use crate::error::{Result, SyncError};
use crate::owner::OwnerId;

/// Why a candidate was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    ForeignOwner,
    WouldEraseLocal,
    Identical,
    LocalEditedSince,
}

/// Outcome for a copy received from another tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDecision {
    Apply,
    Reject(Rejection),
}

/// Outcome for a document loaded from the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDecision {
    /// Replace local content with the remote copy.
    Replace,
    /// Local and remote already agree.
    InSync,
    /// Keep local content; `owes_save` when the remote should receive it.
    KeepLocal { owes_save: bool, reason: Rejection },
}

pub fn check_owner(current: Option<&OwnerId>, requested: &OwnerId) -> Result<()> {
    match current {
        None => Err(SyncError::NoOwner),
        Some(current) if current != requested => Err(SyncError::OwnershipViolation {
            current: current.clone(),
            requested: requested.clone(),
        }),
        Some(_) => Ok(()),
    }
}

pub fn merge_allowed(local: &DocumentContent, candidate: &DocumentContent) -> bool {
    !candidate.is_empty() || local.is_empty()
}

/// Local content older than the window should be re-fetched. Content that was
/// never stamped is not considered stale.
pub fn is_stale(last_write_ms: Option<u64>, now_ms: u64, window_ms: u64) -> bool {
    last_write_ms.is_some_and(|ts| now_ms.saturating_sub(ts) > window_ms)
}

pub fn decide_peer(
    current: Option<&OwnerId>,
    candidate_owner: &OwnerId,
    local: &DocumentContent,
    candidate: &DocumentContent,
) -> PeerDecision {
    if check_owner(current, candidate_owner).is_err() {
        return PeerDecision::Reject(Rejection::ForeignOwner);
    }
    if !merge_allowed(local, candidate) {
        return PeerDecision::Reject(Rejection::WouldEraseLocal);
    }
    if local == candidate {
        return PeerDecision::Reject(Rejection::Identical);
    }
    PeerDecision::Apply
}

/// `remote` is `None` when the remote has no document.
pub fn decide_remote(
    local: &DocumentContent,
    remote: Option<&DocumentContent>,
    edited_since_request: bool,
) -> RemoteDecision {
    let local_owes = !local.is_empty();
    match remote {
        Some(remote) if remote == local => RemoteDecision::InSync,
        _ if edited_since_request => RemoteDecision::KeepLocal {
            owes_save: true,
            reason: Rejection::LocalEditedSince,
        },
        Some(remote) if merge_allowed(local, remote) => RemoteDecision::Replace,
        _ => RemoteDecision::KeepLocal {
            owes_save: local_owes,
            reason: Rejection::WouldEraseLocal,
        },
    }
}
