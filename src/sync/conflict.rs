//! Conflict detection and per-operation errors
//!
//! A batch operation conflicts when the client's view of an entity is out of
//! date: its `expected_updated_at` no longer matches the server, or it tries
//! to create an id that is already taken. The loser gets the server's current
//! record back so it can merge and retry.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::BatchErrorCode;
use crate::entities::{EntityRecord, EntityType, ValidationError};
use crate::error::AppError;

/// Why an operation was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// `expected_updated_at` does not match the stored value
    Stale {
        expected: Option<DateTime<Utc>>,
        actual: DateTime<Utc>,
    },
    /// A create reused an id that exists
    IdTaken,
    /// A create reused an id that was deleted and is still tombstoned
    IdDeleted,
}

/// Failure of a single batch operation
#[derive(Debug, Clone, Error)]
pub enum OperationError {
    #[error("{0}")]
    NotFound(String),

    #[error("{message}")]
    Conflict {
        message: String,
        kind: ConflictKind,
        server: Option<Box<EntityRecord>>,
    },

    #[error("{0}")]
    Validation(String),

    #[error("write permission required")]
    PermissionDenied,

    #[error("{0}")]
    Internal(String),
}

impl OperationError {
    pub fn code(&self) -> BatchErrorCode {
        match self {
            OperationError::NotFound(_) => BatchErrorCode::NotFound,
            OperationError::Conflict { .. } => BatchErrorCode::Conflict,
            OperationError::Validation(_) => BatchErrorCode::Validation,
            OperationError::PermissionDenied => BatchErrorCode::PermissionDenied,
            OperationError::Internal(_) => BatchErrorCode::Internal,
        }
    }

    pub fn not_found(entity_type: EntityType, id: &str) -> Self {
        OperationError::NotFound(format!("{} {} not found", entity_type, id))
    }

    /// The stored record moved on since the client last saw it
    pub fn stale(expected: Option<DateTime<Utc>>, current: EntityRecord) -> Self {
        OperationError::Conflict {
            message: format!(
                "{} {} was modified at {}",
                current.entity_type,
                current.id,
                current.updated_at.to_rfc3339()
            ),
            kind: ConflictKind::Stale {
                expected,
                actual: current.updated_at,
            },
            server: Some(Box::new(current)),
        }
    }

    /// A create collided with an existing id
    ///
    /// `server` must be `None` when the owner is another workspace.
    pub fn id_taken(entity_type: EntityType, id: &str, server: Option<EntityRecord>) -> Self {
        OperationError::Conflict {
            message: format!("{} id {} already exists", entity_type, id),
            kind: ConflictKind::IdTaken,
            server: server.map(Box::new),
        }
    }

    pub fn id_deleted(entity_type: EntityType, id: &str) -> Self {
        OperationError::Conflict {
            message: format!("{} id {} belongs to a deleted record", entity_type, id),
            kind: ConflictKind::IdDeleted,
            server: None,
        }
    }

    pub fn conflict_kind(&self) -> Option<&ConflictKind> {
        match self {
            OperationError::Conflict { kind, .. } => Some(kind),
            _ => None,
        }
    }

    pub fn into_conflict_data(self) -> Option<EntityRecord> {
        match self {
            OperationError::Conflict { server, .. } => server.map(|s| *s),
            _ => None,
        }
    }
}

impl From<ValidationError> for OperationError {
    fn from(err: ValidationError) -> Self {
        OperationError::Validation(err.to_string())
    }
}

impl From<AppError> for OperationError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Validation(msg) | AppError::BadRequest(msg) => OperationError::Validation(msg),
            AppError::NotFound(msg) => OperationError::NotFound(msg),
            AppError::Forbidden(_) => OperationError::PermissionDenied,
            other => {
                tracing::warn!("Batch operation failed internally: {}", other);
                OperationError::Internal(other.to_string())
            }
        }
    }
}

impl From<sqlx::Error> for OperationError {
    fn from(err: sqlx::Error) -> Self {
        AppError::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn record() -> EntityRecord {
        EntityRecord {
            entity_type: EntityType::Location,
            id: "loc-1".to_string(),
            workspace_id: "ws-1".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            fields: Map::new(),
        }
    }

    #[test]
    fn test_stale_carries_server_state() {
        let current = record();
        let err = OperationError::stale(Some(Utc::now()), current.clone());

        assert_eq!(err.code(), BatchErrorCode::Conflict);
        assert!(err.to_string().contains("loc-1"));
        assert_eq!(err.into_conflict_data(), Some(current));
    }

    #[test]
    fn test_foreign_collision_hides_server_state() {
        let err = OperationError::id_taken(EntityType::Item, "item-9", None);
        assert_eq!(err.code(), BatchErrorCode::Conflict);
        assert_eq!(err.conflict_kind(), Some(&ConflictKind::IdTaken));
        assert!(err.into_conflict_data().is_none());
    }

    #[test]
    fn test_app_error_mapping() {
        let err: OperationError = AppError::Validation("bad".to_string()).into();
        assert_eq!(err.code(), BatchErrorCode::Validation);

        let err: OperationError = AppError::Internal("boom".to_string()).into();
        assert_eq!(err.code(), BatchErrorCode::Internal);
    }
}
