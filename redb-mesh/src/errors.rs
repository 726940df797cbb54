use redb_types::errors::{ResourceKind, StorageError};
use redb_types::serde_json;
use redb_types::thiserror::{self, Error};

#[derive(Error, Debug)]
pub enum MeshError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("transport failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("invalid node state: {0}")]
    InvalidState(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0} `{1}` not found")]
    NotFound(ResourceKind, String),
    #[error("peer rejected the request: {0}")]
    Rejected(String),
    #[error("deadline exceeded during {0}")]
    DeadlineExceeded(String),
    #[error("no route to node {0}")]
    NoRoute(u64),
    #[error("connection to node {0} is closed")]
    ConnectionClosed(u64),
    #[error("unexpected message during {0}")]
    UnexpectedMessage(&'static str),
}

impl MeshError {
    /// Error-kind name for structured RPC payloads, aligned with the
    /// database error taxonomy where the kinds overlap.
    pub fn kind_name(&self) -> &'static str {
        match self {
            MeshError::Storage(_) => "storage",
            MeshError::Io(_) | MeshError::ConnectionClosed(_) => "connection_failed",
            MeshError::Codec(_) | MeshError::UnexpectedMessage(_) => "invalid_query",
            MeshError::InvalidState(_) => "invalid_state",
            MeshError::PermissionDenied(_) => "permission_denied",
            MeshError::NotFound(_, _) => "not_found",
            MeshError::Rejected(_) => "permission_denied",
            MeshError::DeadlineExceeded(_) => "deadline_exceeded",
            MeshError::NoRoute(_) => "connection_failed",
        }
    }
}
