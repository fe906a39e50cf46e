//! OwnerId: the authenticated user whose namespace documents belong to.
//!
//! Owner ids end up inside storage keys, so they are restricted to a
//! key-safe alphabet. `_` separates key segments and is not allowed, or owner
//! `backup_7` would share a key with the backup copy of owner `7`. The
//! reserved id `anon` names the namespace used before anyone logs in.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

const ANONYMOUS: &str = "anon";
const MAX_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OwnerIdError {
    #[error("Owner ID is empty")]
    Empty,
    #[error("Owner ID longer than {MAX_LEN} characters")]
    TooLong,
    #[error("Owner ID contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Identifier of the owner of a document namespace.
///
/// # Examples
/// ```
/// use docsync_core::OwnerId;
///
/// let owner: OwnerId = "42".parse().unwrap();
/// assert_eq!(owner.as_str(), "42");
/// assert!(!owner.is_anonymous());
/// assert!(OwnerId::anonymous().is_anonymous());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Result<Self, OwnerIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(OwnerIdError::Empty);
        }
        if id.len() > MAX_LEN {
            return Err(OwnerIdError::TooLong);
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '@')))
        {
            return Err(OwnerIdError::InvalidChar(c));
        }
        Ok(Self(id))
    }

    /// The namespace used while nobody is logged in.
    pub fn anonymous() -> Self {
        Self(ANONYMOUS.to_string())
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OwnerId {
    type Err = OwnerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// Numeric user ids from the auth collaborator arrive as JSON numbers.
impl serde::Serialize for OwnerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for OwnerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        let raw = match Raw::deserialize(d)? {
            Raw::Text(s) => s,
            Raw::Number(n) => n.to_string(),
        };
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_ids() {
        assert!("42".parse::<OwnerId>().is_ok());
        assert!("jane.doe@example".parse::<OwnerId>().is_ok());
        assert!("user-7.b".parse::<OwnerId>().is_ok());
    }

    #[test]
    fn test_reject_key_unsafe_ids() {
        assert_eq!(OwnerId::new(""), Err(OwnerIdError::Empty));
        assert_eq!(OwnerId::new("a b"), Err(OwnerIdError::InvalidChar(' ')));
        assert_eq!(OwnerId::new("a/b"), Err(OwnerIdError::InvalidChar('/')));
        assert_eq!(OwnerId::new("backup_7"), Err(OwnerIdError::InvalidChar('_')));
        assert_eq!(OwnerId::new("x".repeat(200)), Err(OwnerIdError::TooLong));
    }

    #[test]
    fn test_anonymous() {
        assert!(OwnerId::anonymous().is_anonymous());
        assert!("anon".parse::<OwnerId>().unwrap().is_anonymous());
        assert!(!OwnerId::new("42").unwrap().is_anonymous());
    }

    #[test]
    fn test_serde_accepts_numbers_and_strings() {
        let from_num: OwnerId = serde_json::from_str("42").unwrap();
        let from_str: OwnerId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(from_num, from_str);
        assert_eq!(serde_json::to_string(&from_num).unwrap(), "\"42\"");
        assert!(serde_json::from_str::<OwnerId>("\"bad key\"").is_err());
    }
}
