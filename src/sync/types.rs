//! Sync data types
//!
//! Wire types for delta pulls and batch pushes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::conflict::OperationError;
use super::tombstones::Tombstone;
use crate::entities::{EntityRecord, EntitySummary};

/// Types of sync operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

/// A single change pushed by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOperation {
    pub operation: OperationType,
    /// Parsed per operation so an unknown type fails only this operation
    pub entity_type: String,
    /// Required for update/delete; optional client-generated id for create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Field values for create/update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// The `updated_at` the client last saw; omitted means last-write-wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_updated_at: Option<DateTime<Utc>>,
}

impl BatchOperation {
    /// Parse one entry of a batch; a malformed entry fails only itself
    pub fn from_value(raw: &Value) -> Result<Self, OperationError> {
        Self::deserialize(raw)
            .map_err(|e| OperationError::Validation(format!("invalid operation: {}", e)))
    }
}

/// Request body for a batch push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Raw entries, each parsed into a [`BatchOperation`] when it is applied
    pub operations: Vec<Value>,
    /// Commit each operation independently (default) or all-or-nothing
    #[serde(default = "default_allow_partial")]
    pub allow_partial: bool,
}

fn default_allow_partial() -> bool {
    true
}

/// Per-operation failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchErrorCode {
    NotFound,
    Conflict,
    Validation,
    PermissionDenied,
    Internal,
    /// Rolled back because another operation failed an all-or-nothing batch
    Aborted,
}

/// Outcome of one operation, at the same index as its input
#[derive(Debug, Clone, Serialize)]
pub struct BatchOperationResult {
    pub index: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// New server `updated_at` after a create or update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<BatchErrorCode>,
    /// Server state of the entity when the operation conflicted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_data: Option<EntityRecord>,
}

impl BatchOperationResult {
    pub fn succeeded(index: usize, id: String, updated_at: Option<DateTime<Utc>>) -> Self {
        Self {
            index,
            success: true,
            id: Some(id),
            updated_at,
            error: None,
            error_code: None,
            conflict_data: None,
        }
    }

    pub fn failed(index: usize, id: Option<String>, err: OperationError) -> Self {
        let error_code = err.code();
        let error = err.to_string();
        Self {
            index,
            success: false,
            id,
            updated_at: None,
            error: Some(error),
            error_code: Some(error_code),
            conflict_data: err.into_conflict_data(),
        }
    }

    pub fn aborted(index: usize, failed_index: usize) -> Self {
        Self {
            index,
            success: false,
            id: None,
            updated_at: None,
            error: Some(format!(
                "batch rolled back: operation {} failed",
                failed_index
            )),
            error_code: Some(BatchErrorCode::Aborted),
            conflict_data: None,
        }
    }
}

/// Response from a batch push
#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    /// True only when every operation succeeded
    pub success: bool,
    pub results: Vec<BatchOperationResult>,
    pub succeeded_count: usize,
    pub failed_count: usize,
}

impl BatchResponse {
    pub fn from_results(results: Vec<BatchOperationResult>) -> Self {
        let succeeded_count = results.iter().filter(|r| r.success).count();
        let failed_count = results.len() - succeeded_count;
        Self {
            success: failed_count == 0,
            results,
            succeeded_count,
            failed_count,
        }
    }
}

/// Query string of a delta pull
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeltaParams {
    pub modified_since: Option<DateTime<Utc>>,
    /// Comma-separated entity types
    pub entity_types: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncMetadata {
    pub server_time: DateTime<Utc>,
    /// More changes exist past `next_cursor`; pull again immediately
    pub has_more: bool,
    /// Pass as `modified_since` on the next pull
    pub next_cursor: Option<DateTime<Utc>>,
    /// The cursor predates tombstone retention; deletions may have been missed
    pub full_resync_required: bool,
}

/// Response from a delta pull
#[derive(Debug, Clone, Serialize)]
pub struct SyncResponse {
    pub metadata: SyncMetadata,
    pub items: Vec<EntityRecord>,
    pub locations: Vec<EntityRecord>,
    pub containers: Vec<EntityRecord>,
    pub categories: Vec<EntityRecord>,
    pub inventory: Vec<EntityRecord>,
    pub loans: Vec<EntityRecord>,
    pub borrowers: Vec<EntityRecord>,
    pub deleted: Vec<Tombstone>,
}

/// Sync status for a workspace
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub server_time: DateTime<Utc>,
    pub entities: Vec<EntitySummary>,
    pub tombstones: i64,
}

/// Request body for a manual tombstone cleanup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanupRequest {
    /// Defaults to the configured retention
    pub older_than_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupResponse {
    pub removed: u64,
    pub cutoff: DateTime<Utc>,
}

/// Timestamp a row contributes to the sync cursor
pub trait SyncTimestamp {
    fn sync_timestamp(&self) -> DateTime<Utc>;
}

impl SyncTimestamp for EntityRecord {
    fn sync_timestamp(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl SyncTimestamp for Tombstone {
    fn sync_timestamp(&self) -> DateTime<Utc> {
        self.deleted_at
    }
}
