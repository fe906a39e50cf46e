//! Local durable store.
//!
//! `KvBackend` is the minimal string key/value surface a host provides
//! (browser `localStorage`, one file per key on disk, or memory for tests).
//! `LocalStore` layers the document layout on top: every write lands as a
//! primary copy, a shadow backup, a timestamp marker and a fingerprint meta
//! record, all addressed through `StorageKey`.
//!
//! Implementations:
//! - `InMemoryKv` - For testing, with an optional byte quota
//! - `FileKv` (in docsync-cli) - One file per key
//! - `JsStorageBridge` (in docsync-wasm) - `localStorage` via JS callbacks

use crate::document::{DocumentContent, DocumentType};
use crate::fingerprint::Fingerprint;
use crate::keys::{KeyRole, StorageKey};
use crate::owner::OwnerId;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage quota exceeded writing {0}")]
    QuotaExceeded(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<crate::document::DocumentError> for StoreError {
    fn from(err: crate::document::DocumentError) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Synchronous string key/value storage.
///
/// On native platforms, implementations must be `Send + Sync`.
/// On WASM (wasm32), these bounds are relaxed since WASM is single-threaded.
#[cfg(not(target_arch = "wasm32"))]
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Synchronous string key/value storage (WASM version without Send + Sync).
#[cfg(target_arch = "wasm32")]
pub trait KvBackend {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

impl<T: KvBackend + ?Sized> KvBackend for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

/// In-memory key/value store for testing.
///
/// An optional quota caps the total bytes of keys plus values, the way
/// browsers cap `localStorage`.
#[derive(Default)]
pub struct InMemoryKv {
    entries: RwLock<HashMap<String, String>>,
    quota: RwLock<Option<usize>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(bytes: usize) -> Self {
        let kv = Self::default();
        kv.set_quota(Some(bytes));
        kv
    }

    pub fn set_quota(&self, bytes: Option<usize>) {
        *self.quota.write().unwrap_or_else(|e| e.into_inner()) = bytes;
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn used_bytes(entries: &HashMap<String, String>) -> usize {
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl KvBackend for InMemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let quota = *self.quota.read().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(limit) = quota {
            let replaced = entries.get(key).map_or(0, |old| key.len() + old.len());
            let after = Self::used_bytes(&entries) - replaced + key.len() + value.len();
            if after > limit {
                return Err(StoreError::QuotaExceeded(key.to_string()));
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Document-level view over a `KvBackend`.
pub struct LocalStore<B> {
    backend: B,
    prefix: String,
}

impl<B: KvBackend> LocalStore<B> {
    pub fn new(backend: B, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, owner: &OwnerId, ty: DocumentType, role: KeyRole) -> String {
        StorageKey::new(owner, ty, role).render(&self.prefix)
    }

    fn get(&self, owner: &OwnerId, ty: DocumentType, role: KeyRole) -> Option<String> {
        match self.backend.get(&self.key(owner, ty, role)) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read {:?} {} for {}: {}", role, ty, owner, e);
                None
            }
        }
    }

    /// Persists `content` under all four roles. Writing content identical to
    /// what is stored is a no-op that returns the stored fingerprint.
    pub fn write(&self, owner: &OwnerId, content: &DocumentContent, now_ms: u64) -> Result<Fingerprint> {
        let ty = content.doc_type();
        let canonical = content.to_canonical_json()?;

        let primary = self.get(owner, ty, KeyRole::Primary);
        let backup = self.get(owner, ty, KeyRole::Backup);
        if primary.as_deref() == Some(canonical.as_str()) && backup.as_deref() == Some(canonical.as_str()) {
            if let Some(fp) = self.fingerprint(owner, ty).filter(|fp| fp.matches_content(&canonical)) {
                debug!("Skipping identical {} write for {}", ty, owner);
                return Ok(fp);
            }
        }

        let fp = Fingerprint::of(&canonical, now_ms);
        let meta = serde_json::to_string(&fp).map_err(|e| StoreError::Serialization(e.to_string()))?;

        // Backup first: a crash between the two leaves the newer copy in the
        // backup, which wins during recovery.
        self.backend.set(&self.key(owner, ty, KeyRole::Backup), &canonical)?;
        self.backend.set(&self.key(owner, ty, KeyRole::Primary), &canonical)?;
        self.backend
            .set(&self.key(owner, ty, KeyRole::Timestamp), &now_ms.to_string())?;
        self.backend.set(&self.key(owner, ty, KeyRole::Meta), &meta)?;
        debug!("Wrote {} for {} ({} bytes)", ty, owner, canonical.len());
        Ok(fp)
    }

    /// Stored content, or the empty document. Legacy encodings are upgraded
    /// and rewritten; unreadable entries read as empty.
    pub fn read(&self, owner: &OwnerId, ty: DocumentType, now_ms: u64) -> DocumentContent {
        let Some(raw) = self.get(owner, ty, KeyRole::Primary) else {
            return DocumentContent::empty(ty);
        };
        match DocumentContent::decode_stored(ty, &raw, now_ms) {
            Ok((content, upgraded)) => {
                if upgraded {
                    debug!("Upgrading legacy {} encoding for {}", ty, owner);
                    if let Err(e) = self.rewrite_content(owner, &content) {
                        warn!("Failed to rewrite upgraded {} for {}: {}", ty, owner, e);
                    }
                }
                content
            }
            Err(e) => {
                warn!("Unreadable {} for {}, treating as empty: {}", ty, owner, e);
                DocumentContent::empty(ty)
            }
        }
    }

    /// Replaces primary and backup without touching the timestamp, so an
    /// upgrade does not make old content look fresh.
    fn rewrite_content(&self, owner: &OwnerId, content: &DocumentContent) -> Result<()> {
        let ty = content.doc_type();
        let canonical = content.to_canonical_json()?;
        self.backend.set(&self.key(owner, ty, KeyRole::Backup), &canonical)?;
        self.backend.set(&self.key(owner, ty, KeyRole::Primary), &canonical)?;
        Ok(())
    }

    pub fn has_primary(&self, owner: &OwnerId, ty: DocumentType) -> bool {
        self.get(owner, ty, KeyRole::Primary).is_some()
    }

    pub fn read_backup(&self, owner: &OwnerId, ty: DocumentType, now_ms: u64) -> Option<DocumentContent> {
        let raw = self.get(owner, ty, KeyRole::Backup)?;
        DocumentContent::decode_stored(ty, &raw, now_ms)
            .map(|(content, _)| content)
            .ok()
    }

    /// Last local write time, falling back to the meta record.
    pub fn timestamp(&self, owner: &OwnerId, ty: DocumentType) -> Option<u64> {
        self.get(owner, ty, KeyRole::Timestamp)
            .and_then(|raw| raw.trim().parse().ok())
            .or_else(|| self.fingerprint(owner, ty).map(|fp| fp.ts))
    }

    pub fn fingerprint(&self, owner: &OwnerId, ty: DocumentType) -> Option<Fingerprint> {
        let raw = self.get(owner, ty, KeyRole::Meta)?;
        serde_json::from_str(&raw).ok()
    }

    /// Removes every entry of the document.
    pub fn clear(&self, owner: &OwnerId, ty: DocumentType) -> Result<()> {
        for role in [KeyRole::Backup, KeyRole::Primary, KeyRole::Timestamp, KeyRole::Meta] {
            self.backend.remove(&self.key(owner, ty, role))?;
        }
        debug!("Cleared {} for {}", ty, owner);
        Ok(())
    }

    /// Copies the `from` document to `to` when `to` has nothing stored and
    /// `from` has content. The source is left in place.
    pub fn adopt(&self, from: &OwnerId, to: &OwnerId, ty: DocumentType, now_ms: u64) -> Result<bool> {
        if from == to || self.has_primary(to, ty) {
            return Ok(false);
        }
        let content = self.read(from, ty, now_ms);
        if content.is_empty() {
            return Ok(false);
        }
        self.write(to, &content, now_ms)?;
        debug!("Adopted {} from {} into {}", ty, from, to);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{NoteContent, Task};

    const NOW: u64 = 1_750_000_000_000;

    fn owner(id: &str) -> OwnerId {
        OwnerId::new(id).unwrap()
    }

    fn store() -> LocalStore<InMemoryKv> {
        LocalStore::new(InMemoryKv::new(), "")
    }

    fn tasks(texts: &[&str]) -> DocumentContent {
        DocumentContent::Tasks(texts.iter().map(|t| Task::new(*t, NOW)).collect())
    }

    #[test]
    fn test_write_populates_all_roles() {
        let s = store();
        let o = owner("42");
        let content = tasks(&["a"]);
        let fp = s.write(&o, &content, NOW).unwrap();

        assert_eq!(
            s.backend().keys(),
            vec![
                "layout_tasks_42",
                "layout_tasks_backup_42",
                "layout_tasks_meta_42",
                "layout_tasks_timestamp_42",
            ]
        );
        assert_eq!(s.read(&o, DocumentType::TaskList, NOW), content);
        assert_eq!(s.read_backup(&o, DocumentType::TaskList, NOW), Some(content));
        assert_eq!(s.timestamp(&o, DocumentType::TaskList), Some(NOW));
        assert_eq!(s.fingerprint(&o, DocumentType::TaskList), Some(fp));
    }

    #[test]
    fn test_identical_write_is_noop() {
        let s = store();
        let o = owner("42");
        let content = tasks(&["a"]);
        let first = s.write(&o, &content, NOW).unwrap();
        let second = s.write(&o, &content, NOW + 1000).unwrap();
        assert_eq!(first, second);
        assert_eq!(s.timestamp(&o, DocumentType::TaskList), Some(NOW));
    }

    #[test]
    fn test_missing_reads_empty() {
        let s = store();
        assert!(s.read(&owner("42"), DocumentType::Note, NOW).is_empty());
        assert_eq!(s.timestamp(&owner("42"), DocumentType::Note), None);
    }

    #[test]
    fn test_garbage_reads_empty() {
        let s = store();
        s.backend().set("layout_tasks_42", "{not json").unwrap();
        assert!(s.read(&owner("42"), DocumentType::TaskList, NOW).is_empty());
    }

    #[test]
    fn test_legacy_note_is_upgraded_in_place() {
        let s = store();
        s.backend().set("layout_notes_42", "plain text").unwrap();
        let content = s.read(&owner("42"), DocumentType::Note, NOW);
        assert_eq!(content, DocumentContent::Note(NoteContent::new("plain text", "")));
        assert_eq!(
            s.backend().get("layout_notes_42").unwrap().as_deref(),
            Some(r#"{"notes":"plain text","transcription":""}"#)
        );
        // upgrade does not stamp a timestamp
        assert_eq!(s.timestamp(&owner("42"), DocumentType::Note), None);
    }

    #[test]
    fn test_clear_removes_everything() {
        let s = store();
        let o = owner("42");
        s.write(&o, &tasks(&["a"]), NOW).unwrap();
        s.write(&o, &DocumentContent::Note(NoteContent::new("n", "")), NOW).unwrap();
        s.clear(&o, DocumentType::TaskList).unwrap();
        assert!(s.backend().keys().iter().all(|k| k.starts_with("layout_notes")));
    }

    #[test]
    fn test_quota_failure_is_an_error() {
        let s = LocalStore::new(InMemoryKv::with_quota(64), "");
        let big = DocumentContent::Note(NoteContent::new("x".repeat(100), ""));
        assert!(matches!(
            s.write(&owner("42"), &big, NOW),
            Err(StoreError::QuotaExceeded(_))
        ));
    }

    #[test]
    fn test_adopt_anonymous_only_when_target_empty() {
        let s = store();
        let anon = OwnerId::anonymous();
        let o = owner("42");
        s.write(&anon, &tasks(&["from anon"]), NOW).unwrap();

        assert!(s.adopt(&anon, &o, DocumentType::TaskList, NOW).unwrap());
        assert_eq!(s.read(&o, DocumentType::TaskList, NOW), s.read(&anon, DocumentType::TaskList, NOW));

        s.write(&anon, &tasks(&["newer anon"]), NOW).unwrap();
        assert!(!s.adopt(&anon, &o, DocumentType::TaskList, NOW).unwrap());
        assert!(!s.adopt(&anon, &o, DocumentType::Note, NOW).unwrap());
    }

    #[test]
    fn test_prefix_namespaces_keys() {
        let s = LocalStore::new(InMemoryKv::new(), "dev_");
        s.write(&owner("1"), &tasks(&["a"]), NOW).unwrap();
        assert!(s.backend().keys().iter().all(|k| k.starts_with("dev_layout_tasks")));
    }
}
