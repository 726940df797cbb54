use redb_types::errors::{DatabaseError, ResourceKind, StorageError};
use redb_types::models::RelationshipType;
use redb_types::thiserror::{self, Error};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0} `{1}` not found")]
    NotFound(ResourceKind, String),
    #[error("invalid relationship state: {0}")]
    InvalidState(String),
    #[error("relationship type {0:?} is not supported; only replication is implemented")]
    UnsupportedRelationshipType(RelationshipType),
    #[error("pipeline halted: {0}")]
    PipelineHalted(String),
}

impl EngineError {
    /// Error-kind name for structured RPC payloads.
    pub fn kind_name(&self) -> &'static str {
        match self {
            EngineError::Database(e) => e.kind.name(),
            EngineError::Storage(_) => "storage",
            EngineError::NotFound(_, _) => "not_found",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::UnsupportedRelationshipType(_) => "operation_not_supported",
            EngineError::PipelineHalted(_) => "pipeline_halted",
        }
    }
}
