//! Error types
//!
//! Every failure in the control plane is a `MetaError`. Each variant maps to an
//! `ErrorCode`, and each code maps to exactly one HTTP status.

use axum::http::StatusCode;

use crate::storage::StoreError;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, MetaError>;

/// Coarse error classification exposed to API clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
}

impl ErrorCode {
    /// HTTP status for this code
    pub fn to_http_status(self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Control plane error
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("Parse request failed: {0}")]
    ParseRequest(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Cluster {0} not found")]
    ClusterNotFound(String),
    #[error("Shard {0} not found")]
    ShardNotFound(u32),
    #[error("Node {0} not found")]
    NodeNotFound(String),
    #[error("Table {schema}.{table} not found")]
    TableNotFound { schema: String, table: String },
    #[error("Procedure {0} not found")]
    ProcedureNotFound(u64),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("Resource {key} is held by procedure {holder}")]
    ResourceBusy { key: String, holder: u64 },
    #[error("Stale write rejected: {0}")]
    Conflict(String),
    #[error("Invalid procedure state: {0}")]
    InvalidState(String),
    #[error("Forward to leader failed: {0}")]
    ForwardToLeader(String),
    #[error("Step execution failed: {0}")]
    StepExecution(String),
    #[error("Persist procedure failed: {0}")]
    Persistence(String),
    #[error("Storage error: {0}")]
    Storage(StoreError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MetaError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MetaError::ParseRequest(_) | MetaError::Validation(_) => ErrorCode::BadRequest,
            MetaError::ClusterNotFound(_)
            | MetaError::ShardNotFound(_)
            | MetaError::NodeNotFound(_)
            | MetaError::TableNotFound { .. }
            | MetaError::ProcedureNotFound(_) => ErrorCode::NotFound,
            MetaError::AlreadyExists(_)
            | MetaError::ResourceBusy { .. }
            | MetaError::Conflict(_)
            | MetaError::InvalidState(_) => ErrorCode::Conflict,
            MetaError::ForwardToLeader(_) => ErrorCode::Unavailable,
            MetaError::StepExecution(_)
            | MetaError::Persistence(_)
            | MetaError::Storage(_)
            | MetaError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn to_http_status(&self) -> StatusCode {
        self.code().to_http_status()
    }

    /// Whether a procedure step failing with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetaError::StepExecution(_) | MetaError::Conflict(_))
    }

    pub fn table_not_found(schema: &str, table: &str) -> Self {
        MetaError::TableNotFound {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }
}

impl From<StoreError> for MetaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { key, .. } => MetaError::Conflict(key),
            other => MetaError::Storage(other),
        }
    }
}
