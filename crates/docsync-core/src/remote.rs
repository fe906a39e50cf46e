//! RemoteStore trait: the authoritative copy of each document.
//!
//! The remote is addressed by document type per owner and assigns an opaque
//! `RemoteId` on first save. Later saves pass the id back so the remote
//! updates in place.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing, with offline and failure injection
//! - `DirRemote` (in docsync-cli) - One JSON record per document in a directory
//! - `ApiRemote` - The document API over an `HttpPost` (`JsHttpBridge` in docsync-wasm)

use crate::document::{DocumentContent, DocumentType};
use crate::owner::OwnerId;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Not authorized: {0}")]
    Auth(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Server-assigned document identifier.
///
/// The remote API hands out numeric ids, but they are kept opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for RemoteId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0.parse::<u64>() {
            Ok(n) => s.serialize_u64(n),
            Err(_) => s.serialize_str(&self.0),
        }
    }
}

impl<'de> serde::Deserialize<'de> for RemoteId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        Ok(match Raw::deserialize(d)? {
            Raw::Number(n) => RemoteId(n.to_string()),
            Raw::Text(s) => RemoteId(s),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub remote_id: Option<RemoteId>,
    pub content: DocumentContent,
}

/// Result of a load. `NotFound` is a normal outcome, not a failure, and never
/// a reason to delete local content.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Found(RemoteDocument),
    NotFound,
}

/// Remote document store.
///
/// On native platforms, implementations must be `Send + Sync` for use across threads.
/// On WASM (wasm32), these bounds are relaxed since WASM is single-threaded.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg(not(target_arch = "wasm32"))]
pub trait RemoteStore: Send + Sync {
    async fn load(&self, owner: &OwnerId, ty: DocumentType) -> Result<LoadOutcome>;

    /// Saves `content`, updating `existing` when given. Returns the id the
    /// remote now knows the document by.
    async fn save(
        &self,
        owner: &OwnerId,
        content: &DocumentContent,
        existing: Option<&RemoteId>,
    ) -> Result<RemoteId>;

    async fn delete(&self, owner: &OwnerId, ty: DocumentType, id: &RemoteId) -> Result<()>;
}

/// Remote document store (WASM version without Send + Sync).
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg(target_arch = "wasm32")]
pub trait RemoteStore {
    async fn load(&self, owner: &OwnerId, ty: DocumentType) -> Result<LoadOutcome>;

    /// Saves `content`, updating `existing` when given. Returns the id the
    /// remote now knows the document by.
    async fn save(
        &self,
        owner: &OwnerId,
        content: &DocumentContent,
        existing: Option<&RemoteId>,
    ) -> Result<RemoteId>;

    async fn delete(&self, owner: &OwnerId, ty: DocumentType, id: &RemoteId) -> Result<()>;
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    async fn load(&self, owner: &OwnerId, ty: DocumentType) -> Result<LoadOutcome> {
        (**self).load(owner, ty).await
    }

    async fn save(
        &self,
        owner: &OwnerId,
        content: &DocumentContent,
        existing: Option<&RemoteId>,
    ) -> Result<RemoteId> {
        (**self).save(owner, content, existing).await
    }

    async fn delete(&self, owner: &OwnerId, ty: DocumentType, id: &RemoteId) -> Result<()> {
        (**self).delete(owner, ty, id).await
    }
}

/// In-memory remote for testing.
#[derive(Default)]
pub struct InMemoryRemote {
    docs: RwLock<HashMap<(OwnerId, DocumentType), RemoteDocument>>,
    next_id: AtomicU64,
    offline: AtomicBool,
    failures: Mutex<VecDeque<RemoteError>>,
    saves: AtomicUsize,
    loads: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Self::default()
        }
    }

    /// While offline every call fails with `RemoteError::Network`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Queues an error returned by the next call instead of its result.
    pub fn fail_next(&self, err: RemoteError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(err);
    }

    /// Seeds a document as if another device had saved it.
    pub fn insert(&self, owner: &OwnerId, content: DocumentContent) -> RemoteId {
        let id = self.allocate_id();
        self.docs.write().unwrap_or_else(|e| e.into_inner()).insert(
            (owner.clone(), content.doc_type()),
            RemoteDocument {
                remote_id: Some(id.clone()),
                content,
            },
        );
        id
    }

    pub fn get(&self, owner: &OwnerId, ty: DocumentType) -> Option<RemoteDocument> {
        self.docs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(owner.clone(), ty))
            .cloned()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn allocate_id(&self) -> RemoteId {
        RemoteId(self.next_id.fetch_add(1, Ordering::SeqCst).max(1).to_string())
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("remote unreachable".into()));
        }
        match self.failures.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl RemoteStore for InMemoryRemote {
    async fn load(&self, owner: &OwnerId, ty: DocumentType) -> Result<LoadOutcome> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(match self.get(owner, ty) {
            Some(doc) => LoadOutcome::Found(doc),
            None => LoadOutcome::NotFound,
        })
    }

    async fn save(
        &self,
        owner: &OwnerId,
        content: &DocumentContent,
        existing: Option<&RemoteId>,
    ) -> Result<RemoteId> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let id = match existing {
            Some(id) => id.clone(),
            None => self.allocate_id(),
        };
        self.docs.write().unwrap_or_else(|e| e.into_inner()).insert(
            (owner.clone(), content.doc_type()),
            RemoteDocument {
                remote_id: Some(id.clone()),
                content: content.clone(),
            },
        );
        Ok(id)
    }

    async fn delete(&self, owner: &OwnerId, ty: DocumentType, id: &RemoteId) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        let key = (owner.clone(), ty);
        if docs.get(&key).and_then(|d| d.remote_id.as_ref()) == Some(id) {
            docs.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::NoteContent;

    fn owner() -> OwnerId {
        OwnerId::new("42").unwrap()
    }

    #[tokio::test]
    async fn test_save_assigns_and_reuses_id() {
        let remote = InMemoryRemote::new();
        let content = DocumentContent::Note(NoteContent::new("hi", ""));
        let id = remote.save(&owner(), &content, None).await.unwrap();
        let again = remote.save(&owner(), &content, Some(&id)).await.unwrap();
        assert_eq!(id, again);
        assert_eq!(remote.save_count(), 2);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let remote = InMemoryRemote::new();
        let outcome = remote.load(&owner(), DocumentType::TaskList).await.unwrap();
        assert_eq!(outcome, LoadOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_offline_and_injected_failures() {
        let remote = InMemoryRemote::new();
        remote.set_offline(true);
        assert!(matches!(
            remote.load(&owner(), DocumentType::Note).await,
            Err(RemoteError::Network(_))
        ));
        remote.set_offline(false);

        remote.fail_next(RemoteError::Auth("expired".into()));
        assert_eq!(
            remote.load(&owner(), DocumentType::Note).await,
            Err(RemoteError::Auth("expired".into()))
        );
        assert!(remote.load(&owner(), DocumentType::Note).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_removes_matching_id_only() {
        let remote = InMemoryRemote::new();
        let id = remote.insert(&owner(), DocumentContent::empty(DocumentType::TaskList));
        remote
            .delete(&owner(), DocumentType::TaskList, &RemoteId::new("999"))
            .await
            .unwrap();
        assert!(remote.get(&owner(), DocumentType::TaskList).is_some());
        remote.delete(&owner(), DocumentType::TaskList, &id).await.unwrap();
        assert!(remote.get(&owner(), DocumentType::TaskList).is_none());
    }

    #[test]
    fn test_remote_id_wire_form() {
        let id: RemoteId = serde_json::from_str("17").unwrap();
        assert_eq!(id.as_str(), "17");
        assert_eq!(serde_json::to_string(&id).unwrap(), "17");
        let text: RemoteId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(serde_json::to_string(&text).unwrap(), "\"abc\"");
    }
}
