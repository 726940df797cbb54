use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use redb_engine::EngineError;
use redb_mesh::MeshError;
use redb_types::errors::{DatabaseError, ErrorKind, ResourceKind, StorageError};
use redb_types::serde_json::json;
use redb_types::thiserror::{self, Error};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0} `{1}` not found")]
    NotFound(ResourceKind, String),
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn kind_name(&self) -> &'static str {
        match self {
            ApiError::Engine(e) => e.kind_name(),
            ApiError::Mesh(e) => e.kind_name(),
            ApiError::Database(e) => e.kind.name(),
            ApiError::Storage(_) => "storage",
            ApiError::NotFound(_, _) => "not_found",
            ApiError::BadRequest(_) => "invalid_configuration",
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self.kind_name() {
            "not_found" => StatusCode::NOT_FOUND,
            "permission_denied" | "authentication_failed" => StatusCode::FORBIDDEN,
            "invalid_configuration" | "invalid_query" => StatusCode::BAD_REQUEST,
            "invalid_state" => StatusCode::CONFLICT,
            "operation_not_supported" => StatusCode::NOT_IMPLEMENTED,
            "deadline_exceeded" => StatusCode::GATEWAY_TIMEOUT,
            "connection_failed" | "transaction_failed" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.kind_name(),
            "message": self.to_string(),
        }))
    }
}

/// Convenience for handlers validating request fields.
pub fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError::BadRequest(message.into())
}

/// Maps a standalone [`ErrorKind`] (URI parsing and the like) to an API
/// error without a database context.
pub fn from_kind(kind: ErrorKind) -> ApiError {
    ApiError::Database(DatabaseError::new("api", "request", kind))
}
