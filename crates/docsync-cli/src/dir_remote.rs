//! Directory-backed remote store.
//!
//! Stands in for the HTTP API when running natively: every document is a
//! JSON file at `{root}/{owner}/{TODO|NOTES}.json` holding its record id and
//! content. Several data directories pointed at the same remote directory
//! behave like several devices of one user.
//!
//! Creating a file named `offline` in the root makes every call fail with a
//! network error, which is handy for exercising retries by hand.

use async_trait::async_trait;
use docsync_core::remote::{LoadOutcome, RemoteDocument, RemoteError, RemoteId, RemoteStore, Result};
use docsync_core::{Clock, DocumentContent, DocumentType, OwnerId, SystemClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    id: RemoteId,
    content: Value,
}

pub struct DirRemote {
    root: PathBuf,
}

impl DirRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, owner: &OwnerId, ty: DocumentType) -> PathBuf {
        self.root
            .join(owner.as_str())
            .join(format!("{}.json", ty.wire_name()))
    }

    async fn check_online(&self) -> Result<()> {
        if fs::try_exists(self.root.join("offline")).await.unwrap_or(false) {
            return Err(RemoteError::Network(format!("{} is offline", self.root.display())));
        }
        Ok(())
    }

    async fn read_record(&self, owner: &OwnerId, ty: DocumentType) -> Result<Option<StoredRecord>> {
        let path = self.record_path(owner, ty);
        match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| RemoteError::MalformedPayload(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RemoteError::Network(e.to_string())),
        }
    }
}

#[async_trait]
impl RemoteStore for DirRemote {
    async fn load(&self, owner: &OwnerId, ty: DocumentType) -> Result<LoadOutcome> {
        self.check_online().await?;
        let Some(record) = self.read_record(owner, ty).await? else {
            return Ok(LoadOutcome::NotFound);
        };
        let content = DocumentContent::from_value(ty, record.content, SystemClock.now_ms())
            .map_err(|e| RemoteError::MalformedPayload(e.to_string()))?;
        Ok(LoadOutcome::Found(RemoteDocument {
            remote_id: Some(record.id),
            content,
        }))
    }

    async fn save(
        &self,
        owner: &OwnerId,
        content: &DocumentContent,
        existing: Option<&RemoteId>,
    ) -> Result<RemoteId> {
        self.check_online().await?;
        let ty = content.doc_type();
        let id = match existing {
            Some(id) => id.clone(),
            None => match self.read_record(owner, ty).await? {
                Some(record) => record.id,
                None => RemoteId::new(uuid::Uuid::new_v4().simple().to_string()),
            },
        };
        let record = StoredRecord {
            id: id.clone(),
            content: content
                .to_value()
                .map_err(|e| RemoteError::MalformedPayload(e.to_string()))?,
        };
        let body = serde_json::to_string_pretty(&record).map_err(|e| RemoteError::MalformedPayload(e.to_string()))?;

        let path = self.record_path(owner, ty);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| RemoteError::Network(e.to_string()))?;
        }
        fs::write(&path, body)
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        debug!("Stored remote {} for {} as {}", ty, owner, id);
        Ok(id)
    }

    async fn delete(&self, owner: &OwnerId, ty: DocumentType, id: &RemoteId) -> Result<()> {
        self.check_online().await?;
        match self.read_record(owner, ty).await? {
            Some(record) if record.id == *id => fs::remove_file(self.record_path(owner, ty))
                .await
                .map_err(|e| RemoteError::Network(e.to_string())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{NoteContent, Task};
    use tempfile::TempDir;

    fn owner() -> OwnerId {
        OwnerId::new("42").unwrap()
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = TempDir::new().unwrap();
        let remote = DirRemote::new(dir.path());
        let content = DocumentContent::Tasks(vec![Task::new("a", 1)]);

        assert_eq!(remote.load(&owner(), DocumentType::TaskList).await.unwrap(), LoadOutcome::NotFound);
        let id = remote.save(&owner(), &content, None).await.unwrap();
        // an id-less save reuses the stored record
        assert_eq!(remote.save(&owner(), &content, None).await.unwrap(), id);

        match remote.load(&owner(), DocumentType::TaskList).await.unwrap() {
            LoadOutcome::Found(doc) => {
                assert_eq!(doc.remote_id, Some(id.clone()));
                assert_eq!(doc.content, content);
            }
            LoadOutcome::NotFound => panic!("expected a document"),
        }

        remote.delete(&owner(), DocumentType::TaskList, &RemoteId::new("other")).await.unwrap();
        assert!(matches!(remote.load(&owner(), DocumentType::TaskList).await.unwrap(), LoadOutcome::Found(_)));
        remote.delete(&owner(), DocumentType::TaskList, &id).await.unwrap();
        assert_eq!(remote.load(&owner(), DocumentType::TaskList).await.unwrap(), LoadOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_offline_marker() {
        let dir = TempDir::new().unwrap();
        let remote = DirRemote::new(dir.path());
        std::fs::write(dir.path().join("offline"), "").unwrap();
        let content = DocumentContent::Note(NoteContent::new("x", ""));
        assert!(matches!(
            remote.save(&owner(), &content, None).await,
            Err(RemoteError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_malformed() {
        let dir = TempDir::new().unwrap();
        let remote = DirRemote::new(dir.path());
        std::fs::create_dir_all(dir.path().join("42")).unwrap();
        std::fs::write(dir.path().join("42").join("NOTES.json"), "{not json").unwrap();
        assert!(matches!(
            remote.load(&owner(), DocumentType::Note).await,
            Err(RemoteError::MalformedPayload(_))
        ));
    }
}
