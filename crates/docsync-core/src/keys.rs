//! Storage key layout.
//!
//! Every persisted entry is addressed by `(owner, type, role)` and rendered by
//! `StorageKey::render` as `{prefix}layout_{tasks|notes}[_{role}]_{owner}`.
//! The layout is shared with existing browser data, so it must stay stable.

use crate::document::DocumentType;
use crate::owner::OwnerId;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    /// Canonical content.
    Primary,
    /// Shadow copy used for crash recovery.
    Backup,
    /// Last local write, milliseconds since the Unix epoch.
    Timestamp,
    /// Fingerprint of the last write.
    Meta,
}

impl KeyRole {
    pub const ALL: [KeyRole; 4] = [KeyRole::Primary, KeyRole::Backup, KeyRole::Timestamp, KeyRole::Meta];

    fn segment(&self) -> Option<&'static str> {
        match self {
            KeyRole::Primary => None,
            KeyRole::Backup => Some("backup"),
            KeyRole::Timestamp => Some("timestamp"),
            KeyRole::Meta => Some("meta"),
        }
    }

    fn from_segment(s: &str) -> Option<Self> {
        match s {
            "backup" => Some(KeyRole::Backup),
            "timestamp" => Some(KeyRole::Timestamp),
            "meta" => Some(KeyRole::Meta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub owner: OwnerId,
    pub doc_type: DocumentType,
    pub role: KeyRole,
}

impl StorageKey {
    pub fn new(owner: &OwnerId, doc_type: DocumentType, role: KeyRole) -> Self {
        Self {
            owner: owner.clone(),
            doc_type,
            role,
        }
    }

    pub fn render(&self, prefix: &str) -> String {
        let ty = self.doc_type.key_segment();
        match self.role.segment() {
            Some(role) => format!("{prefix}layout_{ty}_{role}_{}", self.owner),
            None => format!("{prefix}layout_{ty}_{}", self.owner),
        }
    }

    /// Inverse of `render`. Returns `None` for keys outside this layout.
    pub fn parse(raw: &str, prefix: &str) -> Option<Self> {
        let rest = raw.strip_prefix(prefix)?.strip_prefix("layout_")?;
        let (doc_type, rest) = DocumentType::ALL
            .into_iter()
            .find_map(|ty| Some((ty, rest.strip_prefix(ty.key_segment())?.strip_prefix('_')?)))?;

        let (role, owner) = match rest.split_once('_') {
            Some((segment, owner)) => (KeyRole::from_segment(segment)?, owner),
            None => (KeyRole::Primary, rest),
        };
        let owner = owner.parse().ok()?;
        Some(Self { owner, doc_type, role })
    }
}

impl Display for StorageKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(id: &str) -> OwnerId {
        OwnerId::new(id).unwrap()
    }

    #[test]
    fn test_render_matches_browser_layout() {
        let o = owner("42");
        assert_eq!(
            StorageKey::new(&o, DocumentType::TaskList, KeyRole::Primary).render(""),
            "layout_tasks_42"
        );
        assert_eq!(
            StorageKey::new(&o, DocumentType::TaskList, KeyRole::Backup).render(""),
            "layout_tasks_backup_42"
        );
        assert_eq!(
            StorageKey::new(&o, DocumentType::Note, KeyRole::Meta).render("dev_"),
            "dev_layout_notes_meta_42"
        );
        assert_eq!(
            StorageKey::new(&OwnerId::anonymous(), DocumentType::Note, KeyRole::Timestamp).render(""),
            "layout_notes_timestamp_anon"
        );
    }

    #[test]
    fn test_parse_inverts_render() {
        for ty in DocumentType::ALL {
            for role in KeyRole::ALL {
                for id in ["42", "anon", "backup-7"] {
                    let key = StorageKey::new(&owner(id), ty, role);
                    assert_eq!(StorageKey::parse(&key.render("p_"), "p_"), Some(key));
                }
            }
        }
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert_eq!(StorageKey::parse("layout_todo_font_42", ""), None);
        assert_eq!(StorageKey::parse("layout_tasks_42", "dev_"), None);
        assert_eq!(StorageKey::parse("something_else", ""), None);
        assert_eq!(StorageKey::parse("layout_tasks_backup_user_7", ""), None);
    }
}
