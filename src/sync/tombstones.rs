//! Deletion ledger
//!
//! Offline clients cannot see a row that is gone, so every delete leaves a
//! tombstone in `deleted_records`. The unique index on
//! `(workspace_id, entity_type, entity_id)` keeps it to one per deletion.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::MAX_RETENTION_DAYS;
use crate::db::{clock, timestamp};
use crate::entities::{ensure_scope, DeltaWindow, EntityType, WorkspaceScoped};
use crate::error::{AppError, Result};

/// A durable deletion marker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tombstone {
    pub id: String,
    pub workspace_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub deleted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
}

impl WorkspaceScoped for Tombstone {
    fn workspace_id(&self) -> &str {
        &self.workspace_id
    }
}

/// Tombstone ledger over a single connection
pub struct TombstoneLedger<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> TombstoneLedger<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Record a deletion; call inside the transaction that removed the row
    pub async fn record_deletion(
        &mut self,
        workspace_id: &str,
        entity_type: EntityType,
        entity_id: &str,
        deleted_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Tombstone> {
        let tombstone = Tombstone {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            entity_type,
            entity_id: entity_id.to_string(),
            deleted_at: timestamp::truncate(at),
            deleted_by: deleted_by.map(str::to_string),
        };

        sqlx::query(
            r#"
            INSERT INTO deleted_records (id, workspace_id, entity_type, entity_id, deleted_at, deleted_by)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tombstone.id)
        .bind(&tombstone.workspace_id)
        .bind(entity_type.as_str())
        .bind(&tombstone.entity_id)
        .bind(timestamp::format(&tombstone.deleted_at))
        .bind(&tombstone.deleted_by)
        .execute(&mut *self.conn)
        .await?;

        Ok(tombstone)
    }

    /// Tombstones inside `window` for the given types, oldest first
    pub async fn list_deleted_since(
        &mut self,
        workspace_id: &str,
        entity_types: &[EntityType],
        window: &DeltaWindow,
    ) -> Result<Vec<Tombstone>> {
        if entity_types.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            r#"
            SELECT id, workspace_id, entity_type, entity_id, deleted_at, deleted_by
            FROM deleted_records
            WHERE workspace_id = ?
            "#,
        );
        let placeholders: Vec<&str> = entity_types.iter().map(|_| "?").collect();
        sql.push_str(&format!(" AND entity_type IN ({})", placeholders.join(", ")));
        if window.since.is_some() {
            sql.push_str(" AND deleted_at > ?");
        }
        if window.until.is_some() {
            sql.push_str(" AND deleted_at <= ?");
        }
        sql.push_str(" ORDER BY deleted_at ASC, id ASC");
        if window.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query_as::<_, TombstoneRow>(&sql).bind(workspace_id);
        for entity_type in entity_types {
            q = q.bind(entity_type.as_str());
        }
        if let Some(since) = &window.since {
            q = q.bind(timestamp::format(since));
        }
        if let Some(until) = &window.until {
            q = q.bind(timestamp::format(until));
        }
        if let Some(limit) = window.limit {
            q = q.bind(i64::from(limit));
        }

        let rows = q.fetch_all(&mut *self.conn).await?;
        let tombstones = rows
            .into_iter()
            .map(TombstoneRow::into_tombstone)
            .collect::<Result<Vec<_>>>()?;

        ensure_scope(workspace_id, tombstones)
    }

    /// The tombstone for one entity, if it was deleted
    pub async fn find(
        &mut self,
        workspace_id: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<Tombstone>> {
        let row = sqlx::query_as::<_, TombstoneRow>(
            r#"
            SELECT id, workspace_id, entity_type, entity_id, deleted_at, deleted_by
            FROM deleted_records
            WHERE workspace_id = ? AND entity_type = ? AND entity_id = ?
            "#,
        )
        .bind(workspace_id)
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(&mut *self.conn)
        .await?;

        row.map(TombstoneRow::into_tombstone).transpose()
    }

    pub async fn count(&mut self, workspace_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM deleted_records WHERE workspace_id = ?")
                .bind(workspace_id)
                .fetch_one(&mut *self.conn)
                .await?;

        Ok(count)
    }

    /// Remove a workspace's tombstones deleted before `cutoff`
    pub async fn cleanup_older_than(
        &mut self,
        workspace_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM deleted_records WHERE workspace_id = ? AND deleted_at < ?")
                .bind(workspace_id)
                .bind(timestamp::format(&cutoff))
                .execute(&mut *self.conn)
                .await?;

        Ok(result.rows_affected())
    }

    /// Remove tombstones deleted before `cutoff` in every workspace
    pub async fn cleanup_all_older_than(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM deleted_records WHERE deleted_at < ?")
            .bind(timestamp::format(&cutoff))
            .execute(&mut *self.conn)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Oldest `deleted_at` that survives a sweep at `now`
///
/// Ages outside `0..=MAX_RETENTION_DAYS` are a validation error.
pub fn retention_cutoff(now: DateTime<Utc>, retention_days: i64) -> Result<DateTime<Utc>> {
    if !(0..=MAX_RETENTION_DAYS).contains(&retention_days) {
        return Err(AppError::Validation(format!(
            "retention must be between 0 and {} days, got {}",
            MAX_RETENTION_DAYS, retention_days
        )));
    }

    Duration::try_days(retention_days)
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| {
            AppError::Validation(format!("retention of {} days is out of range", retention_days))
        })
}

/// Remove tombstones deleted before `cutoff`, in one workspace or in all
///
/// Runs as a sync write, so it also advances the change clock.
pub async fn purge_older_than(
    pool: &SqlitePool,
    workspace_id: Option<&str>,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let mut tx = pool.begin().await?;
    clock::next_stamp(&mut tx).await?;

    let mut ledger = TombstoneLedger::new(&mut tx);
    let removed = match workspace_id {
        Some(workspace_id) => ledger.cleanup_older_than(workspace_id, cutoff).await?,
        None => ledger.cleanup_all_older_than(cutoff).await?,
    };

    tx.commit().await?;
    Ok(removed)
}

/// Run one retention sweep across all workspaces
pub async fn sweep_once(pool: &SqlitePool, retention_days: i64) -> Result<u64> {
    let cutoff = retention_cutoff(timestamp::now(), retention_days)?;
    purge_older_than(pool, None, cutoff).await
}

/// Periodically sweep expired tombstones until the task is aborted
pub fn spawn_retention_sweep(
    pool: SqlitePool,
    retention_days: i64,
    every: StdDuration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match sweep_once(&pool, retention_days).await {
                Ok(0) => tracing::debug!("Tombstone sweep found nothing to remove"),
                Ok(removed) => tracing::info!("Tombstone sweep removed {} records", removed),
                Err(e) => tracing::warn!("Tombstone sweep failed: {}", e),
            }
        }
    })
}

#[derive(sqlx::FromRow)]
struct TombstoneRow {
    id: String,
    workspace_id: String,
    entity_type: String,
    entity_id: String,
    deleted_at: String,
    deleted_by: Option<String>,
}

impl TombstoneRow {
    fn into_tombstone(self) -> Result<Tombstone> {
        Ok(Tombstone {
            id: self.id,
            workspace_id: self.workspace_id,
            entity_type: self.entity_type.parse()?,
            entity_id: self.entity_id,
            deleted_at: timestamp::parse(&self.deleted_at)?,
            deleted_by: self.deleted_by,
        })
    }
}
