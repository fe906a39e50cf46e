//! Per-document status exposed to the UI.

use crate::error::SyncError;
use crate::remote::RemoteId;
use crate::scheduler::FlushState;
use serde::Serialize;

/// Remote synchronisation status. Ephemeral, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub syncing: bool,
    pub last_sync_at: Option<u64>,
    #[serde(serialize_with = "serialize_error")]
    pub last_error: Option<SyncError>,
}

/// Local persistence status, the "last saved" indicator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStatus {
    pub last_saved_at: Option<u64>,
    #[serde(serialize_with = "serialize_error")]
    pub last_error: Option<SyncError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocStatus {
    pub state: FlushState,
    pub save: SaveStatus,
    pub sync: SyncState,
    /// Time until the pending auto-save, if one is scheduled.
    pub countdown_ms: Option<u64>,
    pub remote_id: Option<RemoteId>,
}

#[derive(Serialize)]
struct ErrorView<'a> {
    kind: &'a str,
    message: String,
}

fn serialize_error<S: serde::Serializer>(err: &Option<SyncError>, s: S) -> Result<S::Ok, S::Error> {
    err.as_ref()
        .map(|e| ErrorView {
            kind: e.kind(),
            message: e.to_string(),
        })
        .serialize(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_errors_with_kind() {
        let status = SyncState {
            syncing: false,
            last_sync_at: Some(5),
            last_error: Some(SyncError::Network("timeout".into())),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "syncing": false,
                "lastSyncAt": 5,
                "lastError": {"kind": "NetworkFailure", "message": "Network failure: timeout"}
            })
        );
    }
}
