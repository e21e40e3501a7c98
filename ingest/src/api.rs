use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason codes attached to raw records the normalizer refuses to canonicalize.
/// Rejections are logged and counted but never abort the batch they arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum RejectionReason {
    MissingEntityId,
    MissingTimestamp,
    UnparseableTimestamp,
    InvalidFieldValue,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::MissingEntityId => write!(f, "missing entity id"),
            RejectionReason::MissingTimestamp => write!(f, "missing observation timestamp"),
            RejectionReason::UnparseableTimestamp => write!(f, "unparseable observation timestamp"),
            RejectionReason::InvalidFieldValue => write!(f, "field value outside declared range"),
        }
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to decode snapshot payload: {0}")]
    SnapshotDecodingError(String),
    #[error("failed to parse snapshot payload: {0}")]
    SnapshotParsingError(#[from] serde_json::Error),

    #[error("transient source error, will retry: {0}")]
    TransientSource(String),
    #[error("transient store error, will retry: {0}")]
    TransientStore(String),

    #[error("merge conflict for entity {entity_id}, field {field}: {detail}")]
    Conflict {
        entity_id: String,
        field: String,
        detail: String,
    },

    #[error("batch {batch_id} failed after {attempts} attempts in stage {stage}")]
    ExhaustedRetries {
        batch_id: String,
        stage: &'static str,
        attempts: u32,
    },

    #[error("batch cancelled before persisting")]
    Cancelled,

    #[error("unknown entity")]
    EntityNotFound,
    #[error("invalid query window: start must be before end")]
    InvalidWindow,
}

impl IngestError {
    /// Transient errors abort only the affected stage and are retried under
    /// the coordinator's backoff policy. Everything else is terminal for the
    /// operation that raised it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::TransientSource(_) | IngestError::TransientStore(_)
        )
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::SnapshotDecodingError(_)
            | IngestError::SnapshotParsingError(_)
            | IngestError::InvalidWindow => (StatusCode::BAD_REQUEST, self.to_string()),

            IngestError::EntityNotFound => (StatusCode::NOT_FOUND, self.to_string()),

            IngestError::TransientSource(_) | IngestError::TransientStore(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }

            IngestError::Conflict { .. }
            | IngestError::ExhaustedRetries { .. }
            | IngestError::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        }
        .into_response()
    }
}
