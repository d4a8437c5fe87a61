//! Identifier newtypes
//!
//! Strongly-typed wrappers for the opaque identifiers exchanged with the
//! remote store. Items that have never been uploaded carry a `local-`
//! prefixed id minted from a UUID; once the remote assigns a canonical id
//! the entry is re-keyed (see `StateManager::adopt_remote_id`).

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Prefix for ids of items that have not been synced to the remote store.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Primary key of an item in the metadata store.
///
/// Either a canonical remote id or a `local-<uuid>` placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Wrap an id string received from the remote store.
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        if id.is_empty() {
            return Err(CoreError::Validation("item id must not be empty".into()));
        }
        Ok(Self(id))
    }

    /// Mint a fresh `local-*` id for an item created before its first upload.
    #[must_use]
    pub fn new_local() -> Self {
        Self(format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()))
    }

    /// True if this id has not yet been replaced by a remote-assigned one.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<RemoteId> for ItemId {
    fn from(remote: RemoteId) -> Self {
        Self(remote.0)
    }
}

/// Identifier assigned by the remote store.
///
/// Unique across the drive when present; absent for purely-local items.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        if id.is_empty() {
            return Err(CoreError::Validation("remote id must not be empty".into()));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque version token from the remote store, used for conflict detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ETag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for an entry in the offline change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(Uuid);

impl ChangeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::Validation(format!("invalid change id: {e}")))
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ChangeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_id_has_prefix() {
        let id = ItemId::new_local();
        assert!(id.is_local());
        assert!(id.as_str().starts_with("local-"));
    }

    #[test]
    fn test_remote_derived_id_is_not_local() {
        let remote = RemoteId::new("01BYE5RZ6QN3ZWBTUFOFD3GSPGOHDJD36K").unwrap();
        let id = ItemId::from(remote);
        assert!(!id.is_local());
    }

    #[test]
    fn test_empty_ids_rejected() {
        assert!(ItemId::new("").is_err());
        assert!(RemoteId::new("").is_err());
    }

    #[test]
    fn test_local_ids_are_unique() {
        assert_ne!(ItemId::new_local(), ItemId::new_local());
    }

    #[test]
    fn test_item_id_ordering_is_lexicographic() {
        let a = ItemId::new("abc").unwrap();
        let b = ItemId::new("abd").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_change_id_roundtrip() {
        let id = ChangeId::new();
        let parsed = ChangeId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }
}
