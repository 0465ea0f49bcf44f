//! Domain model exchanged between the sync engine and the transport.
//!
//! These types are what callers hand to the datastore and write stream, and
//! what they get back. They are independent of the wire format; the
//! serializer in `firestore-remote` translates between them and [`crate::proto`].

use crate::{Error, Result};
use bytes::Bytes;
use core::fmt;
use std::collections::BTreeMap;

/// A document path such as `rooms/eros/messages/1`.
///
/// Keys always have an even, non-zero number of non-empty segments
/// (collection id, document id, ...).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentKey {
    path: String,
}

impl DocumentKey {
    /// Parses a slash-separated document path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the path is empty, has an empty
    /// segment, or has an odd number of segments (i.e. names a collection).
    pub fn from_path(path: &str) -> Result<Self> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(Error::InvalidArgument {
                reason: "document path must not be empty".to_string(),
            });
        }

        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(Error::InvalidArgument {
                reason: format!("document path '{path}' contains an empty segment"),
            });
        }
        if segments.len() % 2 != 0 {
            return Err(Error::InvalidArgument {
                reason: format!(
                    "document path '{path}' has {} segments; document keys need an even number",
                    segments.len()
                ),
            });
        }

        Ok(Self {
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The last path segment.
    pub fn document_id(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// A point in the server's commit timeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotVersion {
    pub seconds: i64,
    pub nanos: i32,
}

impl SnapshotVersion {
    /// The version before any commit.
    pub const NONE: SnapshotVersion = SnapshotVersion {
        seconds: 0,
        nanos: 0,
    };

    pub const fn new(seconds: i64, nanos: i32) -> Self {
        Self { seconds, nanos }
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

pub type ObjectValue = BTreeMap<String, FieldValue>;

/// The value of a single document field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<FieldValue>),
    Map(ObjectValue),
}

/// A condition the server checks before applying a mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

/// One change to one document.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
    },
    /// Replaces only the fields listed in `field_mask`.
    Patch {
        key: DocumentKey,
        value: ObjectValue,
        field_mask: Vec<String>,
        precondition: Precondition,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. } | Mutation::Patch { key, .. } | Mutation::Delete { key, .. } => {
                key
            }
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. } => *precondition,
        }
    }
}

/// The server's verdict on one mutation of an acknowledged batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationResult {
    /// Version at which the mutated document was last updated.
    pub version: SnapshotVersion,
}

/// A decoded write-stream response.
///
/// The handshake response carries only a stream token; acknowledgements also
/// carry the commit version and one result per mutation of the batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResponse {
    pub stream_token: Bytes,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

/// The result of looking up one key: either the document or proof it does
/// not exist at `version`.
#[derive(Clone, Debug, PartialEq)]
pub enum MaybeDocument {
    Document {
        key: DocumentKey,
        version: SnapshotVersion,
        data: ObjectValue,
    },
    NoDocument {
        key: DocumentKey,
        version: SnapshotVersion,
    },
}

impl MaybeDocument {
    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Document { key, .. } | MaybeDocument::NoDocument { key, .. } => key,
        }
    }

    pub fn version(&self) -> SnapshotVersion {
        match self {
            MaybeDocument::Document { version, .. } | MaybeDocument::NoDocument { version, .. } => {
                *version
            }
        }
    }

    pub fn exists(&self) -> bool {
        matches!(self, MaybeDocument::Document { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_key_accepts_even_segment_paths() {
        let key = DocumentKey::from_path("rooms/eros/messages/1").unwrap();
        assert_eq!(key.path(), "rooms/eros/messages/1");
        assert_eq!(key.document_id(), "1");

        let trimmed = DocumentKey::from_path("/rooms/eros/").unwrap();
        assert_eq!(trimmed.path(), "rooms/eros");
    }

    #[test]
    fn document_key_rejects_collections_and_empty_segments() {
        assert!(matches!(
            DocumentKey::from_path("rooms"),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            DocumentKey::from_path("rooms//eros"),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            DocumentKey::from_path(""),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn document_keys_order_by_path() {
        let a = DocumentKey::from_path("a/1").unwrap();
        let b = DocumentKey::from_path("b/1").unwrap();
        assert!(a < b);
    }

    #[test]
    fn mutation_accessors() {
        let key = DocumentKey::from_path("rooms/eros").unwrap();
        let mutation = Mutation::Delete {
            key: key.clone(),
            precondition: Precondition::Exists(true),
        };
        assert_eq!(mutation.key(), &key);
        assert_eq!(mutation.precondition(), Precondition::Exists(true));
        assert_eq!(Mutation::set(key, ObjectValue::new()).precondition(), Precondition::None);
    }
}
