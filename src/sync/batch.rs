//! Batch pushes
//!
//! Applies a client's queued create/update/delete operations in order.
//!
//! - `allow_partial = true`: one transaction per operation; a failure never
//!   blocks later operations.
//! - `allow_partial = false`: one transaction for the whole batch; the first
//!   failure rolls everything back and the rest are reported `ABORTED`.
//!
//! Deleting an entity that is already tombstoned succeeds without writing a
//! second tombstone; deleting an id that never existed is `NOT_FOUND`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::time::Instant;
use uuid::Uuid;

use super::conflict::{ConflictKind, OperationError};
use super::tombstones::TombstoneLedger;
use super::types::{
    BatchOperation, BatchOperationResult, BatchRequest, BatchResponse, OperationType,
};
use crate::config::SyncConfig;
use crate::context::WorkspaceContext;
use crate::db::{clock, timestamp};
use crate::entities::{EntityStore, EntityType, Patch, PatchMode, WriteOutcome};
use crate::error::{AppError, Result};

/// What a successful operation reports back
#[derive(Debug)]
struct Applied {
    id: String,
    updated_at: Option<DateTime<Utc>>,
}

/// Applies batches against the entity store and tombstone ledger
pub struct BatchProcessor<'a> {
    pool: &'a SqlitePool,
    config: &'a SyncConfig,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(pool: &'a SqlitePool, config: &'a SyncConfig) -> Self {
        Self { pool, config }
    }

    /// Process a batch for the caller's workspace
    ///
    /// Fails as a whole only for permission, size, or a failed final commit;
    /// every other problem is reported per operation.
    pub async fn process(
        &self,
        ctx: &WorkspaceContext,
        request: BatchRequest,
    ) -> Result<BatchResponse> {
        ctx.require_write()?;

        if request.operations.len() > self.config.max_batch_operations {
            return Err(AppError::Validation(format!(
                "batch has {} operations; the limit is {}",
                request.operations.len(),
                self.config.max_batch_operations
            )));
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.batch_timeout_secs);
        let response = if request.allow_partial {
            self.process_partial(ctx, &request.operations, deadline).await
        } else {
            self.process_atomic(ctx, &request.operations, deadline).await?
        };

        tracing::info!(
            workspace = %ctx.workspace_id,
            user = %ctx.user_id,
            allow_partial = request.allow_partial,
            succeeded = response.succeeded_count,
            failed = response.failed_count,
            "Batch processed"
        );

        Ok(response)
    }

    async fn process_partial(
        &self,
        ctx: &WorkspaceContext,
        operations: &[Value],
        deadline: Instant,
    ) -> BatchResponse {
        let mut results = Vec::with_capacity(operations.len());

        for (index, raw) in operations.iter().enumerate() {
            if Instant::now() >= deadline {
                results.push(BatchOperationResult::failed(index, raw_id(raw), deadline_exceeded()));
                continue;
            }

            let outcome = self.apply_in_own_transaction(ctx, raw).await;
            results.push(into_result(index, raw, outcome));
        }

        BatchResponse::from_results(results)
    }

    async fn apply_in_own_transaction(
        &self,
        ctx: &WorkspaceContext,
        raw: &Value,
    ) -> std::result::Result<Applied, OperationError> {
        let mut tx = self.pool.begin().await?;
        match apply(&mut tx, ctx, raw).await {
            Ok(applied) => {
                tx.commit().await?;
                Ok(applied)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    async fn process_atomic(
        &self,
        ctx: &WorkspaceContext,
        operations: &[Value],
        deadline: Instant,
    ) -> Result<BatchResponse> {
        let mut tx = self.pool.begin().await?;
        let mut applied = Vec::with_capacity(operations.len());

        for (index, raw) in operations.iter().enumerate() {
            let outcome = if Instant::now() >= deadline {
                Err(deadline_exceeded())
            } else {
                apply(&mut tx, ctx, raw).await
            };

            match outcome {
                Ok(done) => applied.push(done),
                Err(err) => {
                    tx.rollback().await?;
                    log_failure(index, raw, &err);
                    tracing::info!(
                        workspace = %ctx.workspace_id,
                        failed_index = index,
                        "All-or-nothing batch rolled back"
                    );

                    let results = (0..operations.len())
                        .map(|i| {
                            if i == index {
                                BatchOperationResult::failed(i, raw_id(raw), err.clone())
                            } else {
                                BatchOperationResult::aborted(i, index)
                            }
                        })
                        .collect();
                    return Ok(BatchResponse::from_results(results));
                }
            }
        }

        tx.commit().await?;

        let results = applied
            .into_iter()
            .enumerate()
            .map(|(index, done)| BatchOperationResult::succeeded(index, done.id, done.updated_at))
            .collect();
        Ok(BatchResponse::from_results(results))
    }
}

fn deadline_exceeded() -> OperationError {
    OperationError::Internal("batch deadline exceeded".to_string())
}

/// The client's id for an entry, even one that failed to parse
fn raw_id(raw: &Value) -> Option<String> {
    raw.get("id").and_then(Value::as_str).map(str::to_string)
}

fn into_result(
    index: usize,
    raw: &Value,
    outcome: std::result::Result<Applied, OperationError>,
) -> BatchOperationResult {
    match outcome {
        Ok(done) => BatchOperationResult::succeeded(index, done.id, done.updated_at),
        Err(err) => {
            log_failure(index, raw, &err);
            BatchOperationResult::failed(index, raw_id(raw), err)
        }
    }
}

fn log_failure(index: usize, raw: &Value, err: &OperationError) {
    let entity_type = raw.get("entity_type").and_then(Value::as_str).unwrap_or("?");
    match err.conflict_kind() {
        Some(ConflictKind::Stale { expected, actual }) => tracing::debug!(
            index,
            entity_type,
            "Stale write rejected: client expected {:?}, server has {}",
            expected,
            actual
        ),
        Some(kind) => tracing::debug!(index, entity_type, "Create conflict: {:?}", kind),
        None => tracing::debug!(index, entity_type, "Operation failed: {}", err),
    }
}

/// Apply one operation on `conn`; the caller owns the transaction
///
/// Nothing touches the database before [`clock::next_stamp`], so the
/// transaction holds the write lock before it reads.
async fn apply(
    conn: &mut SqliteConnection,
    ctx: &WorkspaceContext,
    raw: &Value,
) -> std::result::Result<Applied, OperationError> {
    if !ctx.role.can_write() {
        return Err(OperationError::PermissionDenied);
    }

    let op = BatchOperation::from_value(raw)?;
    let entity_type: EntityType = op.entity_type.parse()?;
    let now = clock::next_stamp(conn).await?;

    match op.operation {
        OperationType::Create => create(conn, ctx, entity_type, &op, now).await,
        OperationType::Update => update(conn, ctx, entity_type, &op, now).await,
        OperationType::Delete => delete(conn, ctx, entity_type, &op, now).await,
    }
}

async fn create(
    conn: &mut SqliteConnection,
    ctx: &WorkspaceContext,
    entity_type: EntityType,
    op: &BatchOperation,
    now: DateTime<Utc>,
) -> std::result::Result<Applied, OperationError> {
    let data = op
        .data
        .as_ref()
        .ok_or_else(|| OperationError::Validation("create requires data".to_string()))?;
    let patch = Patch::from_json(entity_type.schema(), data, PatchMode::Create)?;

    let id = match op.id.as_deref().map(str::trim) {
        Some("") => return Err(OperationError::Validation("id cannot be empty".to_string())),
        Some(id) => id.to_string(),
        None => Uuid::new_v4().to_string(),
    };

    let mut store = EntityStore::new(conn);
    if let Some(owner) = store.find_owner(entity_type, &id).await? {
        let server = if owner == ctx.workspace_id {
            store.get(&ctx.workspace_id, entity_type, &id).await?
        } else {
            None
        };
        return Err(OperationError::id_taken(entity_type, &id, server));
    }

    if TombstoneLedger::new(conn)
        .find(&ctx.workspace_id, entity_type, &id)
        .await?
        .is_some()
    {
        return Err(OperationError::id_deleted(entity_type, &id));
    }

    check_references(conn, ctx, &patch).await?;

    let record = EntityStore::new(conn)
        .insert(&ctx.workspace_id, entity_type, &id, &patch, now)
        .await?;

    Ok(Applied {
        id,
        updated_at: Some(record.updated_at),
    })
}

async fn update(
    conn: &mut SqliteConnection,
    ctx: &WorkspaceContext,
    entity_type: EntityType,
    op: &BatchOperation,
    now: DateTime<Utc>,
) -> std::result::Result<Applied, OperationError> {
    let id = required_id(op)?;
    let data = op
        .data
        .as_ref()
        .ok_or_else(|| OperationError::Validation("update requires data".to_string()))?;
    let patch = Patch::from_json(entity_type.schema(), data, PatchMode::Update)?;

    check_references(conn, ctx, &patch).await?;

    let outcome = EntityStore::new(conn)
        .update(
            &ctx.workspace_id,
            entity_type,
            id,
            &patch,
            op.expected_updated_at,
            now,
        )
        .await?;

    match outcome {
        WriteOutcome::Applied(record) => Ok(Applied {
            id: record.id,
            updated_at: Some(record.updated_at),
        }),
        WriteOutcome::NotFound => Err(OperationError::not_found(entity_type, id)),
        WriteOutcome::Stale(current) => {
            Err(OperationError::stale(op.expected_updated_at, current))
        }
    }
}

async fn delete(
    conn: &mut SqliteConnection,
    ctx: &WorkspaceContext,
    entity_type: EntityType,
    op: &BatchOperation,
    now: DateTime<Utc>,
) -> std::result::Result<Applied, OperationError> {
    let id = required_id(op)?;

    let outcome = EntityStore::new(conn)
        .delete(&ctx.workspace_id, entity_type, id, op.expected_updated_at)
        .await?;

    match outcome {
        WriteOutcome::Applied(removed) => {
            let deleted_at = timestamp::next_after(&removed.updated_at, now);
            TombstoneLedger::new(conn)
                .record_deletion(
                    &ctx.workspace_id,
                    entity_type,
                    id,
                    Some(ctx.user_id.as_str()),
                    deleted_at,
                )
                .await?;
            Ok(Applied {
                id: id.to_string(),
                updated_at: None,
            })
        }
        WriteOutcome::NotFound => {
            let tombstone = TombstoneLedger::new(conn)
                .find(&ctx.workspace_id, entity_type, id)
                .await?;
            match tombstone {
                Some(_) => Ok(Applied {
                    id: id.to_string(),
                    updated_at: None,
                }),
                None => Err(OperationError::not_found(entity_type, id)),
            }
        }
        WriteOutcome::Stale(current) => {
            Err(OperationError::stale(op.expected_updated_at, current))
        }
    }
}

fn required_id(op: &BatchOperation) -> std::result::Result<&str, OperationError> {
    match op.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(OperationError::Validation(format!(
            "{:?} requires an id",
            op.operation
        ))),
    }
}

/// References must name entities in the caller's workspace
async fn check_references(
    conn: &mut SqliteConnection,
    ctx: &WorkspaceContext,
    patch: &Patch,
) -> std::result::Result<(), OperationError> {
    let mut store = EntityStore::new(conn);
    for (field, target, id) in patch.references() {
        if !store.exists_in_workspace(&ctx.workspace_id, target, id).await? {
            return Err(OperationError::Validation(format!(
                "{} references unknown {} {}",
                field, target, id
            )));
        }
    }
    Ok(())
}
