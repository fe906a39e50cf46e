//! Error taxonomy for the sync engine.
//!
//! Each layer has its own error enum (`StoreError`, `RemoteError`,
//! `BroadcastError`, `ProtocolError`); they all fold into `SyncError`. Errors
//! are recorded in `SaveStatus` / `SyncState`; only `NoOwner` and
//! `OwnershipViolation` are returned from mutating session calls.

use crate::owner::OwnerId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("No owner set; call set_owner first")]
    NoOwner,

    #[error("Ownership violation: session belongs to {current}, request was for {requested}")]
    OwnershipViolation { current: OwnerId, requested: OwnerId },

    #[error("Serialization failure: {0}")]
    Serialization(String),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Auth failure: {0}")]
    Auth(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

impl SyncError {
    /// Remote failures are retried on the retry timer; local ones are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Auth(_) | SyncError::MalformedPayload(_)
        )
    }

    /// Short stable name, used in status output and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::NoOwner => "NoOwner",
            SyncError::OwnershipViolation { .. } => "OwnershipViolation",
            SyncError::Serialization(_) => "SerializationFailure",
            SyncError::Network(_) => "NetworkFailure",
            SyncError::Auth(_) => "AuthFailure",
            SyncError::MalformedPayload(_) => "MalformedPayload",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<crate::store::StoreError> for SyncError {
    fn from(err: crate::store::StoreError) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<crate::remote::RemoteError> for SyncError {
    fn from(err: crate::remote::RemoteError) -> Self {
        use crate::remote::RemoteError;
        match err {
            RemoteError::Network(msg) => SyncError::Network(msg),
            RemoteError::Auth(msg) => SyncError::Auth(msg),
            RemoteError::MalformedPayload(msg) => SyncError::MalformedPayload(msg),
        }
    }
}

impl From<crate::protocol::ProtocolError> for SyncError {
    fn from(err: crate::protocol::ProtocolError) -> Self {
        crate::remote::RemoteError::from(err).into()
    }
}

impl From<crate::broadcast::BroadcastError> for SyncError {
    fn from(err: crate::broadcast::BroadcastError) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
