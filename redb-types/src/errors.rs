use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::models::DatabaseType;

pub mod internal {
    pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;
}

use internal::BoxedError;

/// Classified error raised by adapters and wrapped at component boundaries.
///
/// Adapter-internal helpers propagate their driver errors unchanged; only the
/// boundary (registry, pipeline, engine) wraps them with the originating
/// database type and operation name. The type is kept as a string so that
/// failures naming an unknown technology can still be reported.
#[derive(Error, Debug)]
#[error("{database_type} {operation}: {kind}")]
pub struct DatabaseError {
    pub database_type: String,
    pub operation: String,
    pub kind: ErrorKind,
}

impl DatabaseError {
    pub fn new(
        database_type: impl Into<String>,
        operation: impl Into<String>,
        kind: ErrorKind,
    ) -> Self {
        Self {
            database_type: database_type.into(),
            operation: operation.into(),
            kind,
        }
    }

    /// The canonical "adapter lacks this capability" error.
    pub fn unsupported(database_type: DatabaseType, operation: impl Into<String>) -> Self {
        Self::new(
            database_type.as_str(),
            operation,
            ErrorKind::OperationNotSupported,
        )
    }

    /// Whether a caller at a component boundary should retry with backoff.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("operation not supported")]
    OperationNotSupported,
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] BoxedError),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("{0} `{1}` not found")]
    NotFound(ResourceKind, String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("transaction failed: {0}")]
    TransactionFailed(#[source] BoxedError),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl ErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionFailed(_)
                | ErrorKind::TransactionFailed(_)
                | ErrorKind::DeadlineExceeded
        )
    }

    /// Stable identifier surfaced in structured RPC error payloads.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::OperationNotSupported => "operation_not_supported",
            ErrorKind::ConnectionFailed(_) => "connection_failed",
            ErrorKind::AuthenticationFailed(_) => "authentication_failed",
            ErrorKind::InvalidConfiguration(_) => "invalid_configuration",
            ErrorKind::NotFound(_, _) => "not_found",
            ErrorKind::InvalidQuery(_) => "invalid_query",
            ErrorKind::TransactionFailed(_) => "transaction_failed",
            ErrorKind::PermissionDenied(_) => "permission_denied",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Adapter,
    Database,
    Table,
    Column,
    Mapping,
    Relationship,
    Node,
    Mesh,
    Connection,
    Slot,
    Publication,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Adapter => "adapter",
            ResourceKind::Database => "database",
            ResourceKind::Table => "table",
            ResourceKind::Column => "column",
            ResourceKind::Mapping => "mapping",
            ResourceKind::Relationship => "relationship",
            ResourceKind::Node => "node",
            ResourceKind::Mesh => "mesh",
            ResourceKind::Connection => "connection",
            ResourceKind::Slot => "replication slot",
            ResourceKind::Publication => "publication",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the external metadata store behind [`crate::storage::MetadataStore`].
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0} `{1}` not found in metadata store")]
    NotFound(ResourceKind, String),
    #[error("metadata store unavailable: {0}")]
    Unavailable(#[source] BoxedError),
    #[error("metadata serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ErrorKind::DeadlineExceeded.is_transient());
        assert!(ErrorKind::ConnectionFailed("refused".into()).is_transient());
        assert!(!ErrorKind::OperationNotSupported.is_transient());
        assert!(!ErrorKind::PermissionDenied("nope".to_string()).is_transient());
    }

    #[test]
    fn boundary_wrapping_names_type_and_operation() {
        let err = DatabaseError::unsupported(DatabaseType::Mysql, "replication.connect");
        let message = err.to_string();
        assert!(message.contains("mysql"));
        assert!(message.contains("replication.connect"));
        assert!(message.contains("not supported"));
    }
}
