//! # Database Identity and RPC Names
//!
//! This module defines the values that bind a client session to one remote
//! database: which project/database it talks to, which host serves it, and
//! the fully-qualified gRPC method names the transport invokes.
//!
//! ## Overview
//!
//! - [`DatabaseId`] - Project and database identifiers, rendered as the
//!   `projects/{project}/databases/{database}` resource name.
//! - [`DatabaseInfo`] - A [`DatabaseId`] plus the network parameters used to
//!   build the channel.
//! - [`RPC_NAME_WRITE`], [`RPC_NAME_COMMIT`], [`RPC_NAME_LOOKUP`] - gRPC method
//!   paths.

/// Database id used when the caller does not name one.
pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Bidirectional write stream.
pub const RPC_NAME_WRITE: &str = "/google.firestore.v1.Firestore/Write";

/// Unary commit of a mutation batch.
pub const RPC_NAME_COMMIT: &str = "/google.firestore.v1.Firestore/Commit";

/// Server-streaming lookup of documents by key.
pub const RPC_NAME_LOOKUP: &str = "/google.firestore.v1.Firestore/BatchGetDocuments";

/// Identifies one database inside one project.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    project_id: String,
    database_id: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: database_id.into(),
        }
    }

    /// A database id pointing at the project's default database.
    pub fn with_default_database(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn is_default_database(&self) -> bool {
        self.database_id == DEFAULT_DATABASE_ID
    }

    /// Resource name: `projects/{project}/databases/{database}`.
    pub fn name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.project_id, self.database_id
        )
    }
}

/// Everything needed to open a channel to one database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub database_id: DatabaseId,
    /// Distinguishes client instances that share a database (used only for
    /// diagnostics by this crate).
    pub persistence_key: String,
    /// `host[:port]` of the backend.
    pub host: String,
    pub ssl_enabled: bool,
}

impl DatabaseInfo {
    pub fn new(
        database_id: DatabaseId,
        persistence_key: impl Into<String>,
        host: impl Into<String>,
        ssl_enabled: bool,
    ) -> Self {
        Self {
            database_id,
            persistence_key: persistence_key.into(),
            host: host.into(),
            ssl_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_name_includes_project_and_database() {
        let id = DatabaseId::new("p1", "db1");
        assert_eq!(id.name(), "projects/p1/databases/db1");
        assert!(!id.is_default_database());

        let default = DatabaseId::with_default_database("p1");
        assert_eq!(default.name(), "projects/p1/databases/(default)");
        assert!(default.is_default_database());
    }
}
