//! docsync-core: local-first sync of a task list and a note across tabs,
//! reloads and a remote store.
//!
//! This crate provides:
//! - The document model with legacy-format upgrades
//! - A durable key/value layout with backup copies and fingerprints
//! - The remote store contract and the JSON wire protocol of the API
//! - A cross-tab broadcast bus with a storage-signal fallback
//! - Debounced flushing, reconciliation guards and a sans-IO session
//! - An async driver that executes the session's remote work

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod document;
pub mod driver;
pub mod error;
pub mod fingerprint;
pub mod keys;
pub mod owner;
pub mod protocol;
pub mod reconcile;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod store;

pub use broadcast::{
    BroadcastEnvelope, BroadcastHub, Capabilities, ChannelMode, Incoming, Subscription, TabChannel, TabId,
    open_channel,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use document::{Alarm, DocumentContent, DocumentType, NoteContent, Priority, Task, TaskEdit, TaskId};
pub use driver::SyncDriver;
pub use error::{Result, SyncError};
pub use owner::{OwnerId, OwnerIdError};
pub use protocol::{ApiRemote, Credentials, HttpPost, HttpResponse};
pub use remote::{InMemoryRemote, LoadOutcome, RemoteDocument, RemoteError, RemoteId, RemoteStore};
pub use scheduler::FlushState;
pub use session::{LifecycleEvent, RemoteCommand, SyncSession};
pub use state::{DocStatus, SaveStatus, SyncState};
pub use store::{InMemoryKv, KvBackend, LocalStore, StoreError};
