//! Delta pulls
//!
//! Returns every entity and tombstone changed after the client's cursor.
//!
//! # Cursor rule
//!
//! Rows are compared with `> modified_since`, so the boundary row is never
//! delivered twice. To keep that safe under truncation:
//!
//! - each stream is read with one extra row to detect truncation
//! - a truncated page never ends inside a group of rows sharing one
//!   timestamp (the group is dropped, or the page widened to hold all of it)
//! - when any stream is truncated, `next_cursor` is the smallest page end
//!   among truncated streams and newer rows of every stream are held back
//!
//! So a response holds exactly the changes in `(modified_since, next_cursor]`.
//!
//! With nothing truncated and nothing returned, the cursor moves to the change
//! clock's last stamp as seen by the same snapshot. Any write not yet visible
//! commits with a later stamp (see [`crate::db::clock`]).

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use super::tombstones::{retention_cutoff, Tombstone, TombstoneLedger};
use super::types::{DeltaParams, SyncMetadata, SyncResponse, SyncStatus, SyncTimestamp};
use crate::config::SyncConfig;
use crate::context::WorkspaceContext;
use crate::db::{clock, timestamp};
use crate::entities::{DeltaWindow, EntityRecord, EntityStore, EntityType};
use crate::error::{AppError, Result};

/// A validated delta request
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaQuery {
    pub modified_since: Option<DateTime<Utc>>,
    pub entity_types: Vec<EntityType>,
    pub limit: u32,
}

impl DeltaQuery {
    pub fn from_params(params: DeltaParams, config: &SyncConfig) -> Result<Self> {
        let limit = params.limit.unwrap_or(config.default_delta_limit);
        if limit == 0 || limit > config.max_delta_limit {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {}",
                config.max_delta_limit
            )));
        }

        let entity_types = match params.entity_types.as_deref().map(str::trim) {
            None | Some("") => EntityType::ALL.to_vec(),
            Some(csv) => {
                let mut types = Vec::new();
                for name in csv.split(',').filter(|s| !s.trim().is_empty()) {
                    let entity_type: EntityType = name.parse()?;
                    if !types.contains(&entity_type) {
                        types.push(entity_type);
                    }
                }
                types.sort();
                types
            }
        };

        Ok(Self {
            modified_since: params.modified_since.map(timestamp::truncate),
            entity_types,
            limit,
        })
    }
}

/// One page of a stream after truncation handling
enum Page<T> {
    Complete(Vec<T>),
    Truncated(Vec<T>),
    /// Every row up to the limit shares this timestamp
    TieOverflow(DateTime<Utc>),
}

/// Trim a `limit + 1` read so it never splits a timestamp group
fn settle<T: SyncTimestamp>(mut rows: Vec<T>, limit: usize) -> Page<T> {
    if rows.len() <= limit {
        return Page::Complete(rows);
    }

    let first_excluded = rows[limit].sync_timestamp();
    rows.truncate(limit);
    while rows
        .last()
        .map_or(false, |row| row.sync_timestamp() == first_excluded)
    {
        rows.pop();
    }

    if rows.is_empty() {
        Page::TieOverflow(first_excluded)
    } else {
        Page::Truncated(rows)
    }
}

struct Stream<T> {
    rows: Vec<T>,
    truncated: bool,
}

impl<T: SyncTimestamp> Stream<T> {
    fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.rows.last().map(|r| r.sync_timestamp())
    }

    fn max_timestamp(&self) -> Option<DateTime<Utc>> {
        self.rows.iter().map(|r| r.sync_timestamp()).max()
    }

    fn hold_back_after(&mut self, cut: DateTime<Utc>) {
        self.rows.retain(|r| r.sync_timestamp() <= cut);
    }
}

async fn entity_stream(
    conn: &mut SqliteConnection,
    workspace_id: &str,
    entity_type: EntityType,
    query: &DeltaQuery,
) -> Result<Stream<EntityRecord>> {
    let mut store = EntityStore::new(conn);
    let window = DeltaWindow {
        since: query.modified_since,
        until: None,
        limit: Some(query.limit + 1),
    };
    let rows = store
        .list_modified_since(workspace_id, entity_type, &window)
        .await?;

    Ok(match settle(rows, query.limit as usize) {
        Page::Complete(rows) => Stream {
            rows,
            truncated: false,
        },
        Page::Truncated(rows) => Stream {
            rows,
            truncated: true,
        },
        Page::TieOverflow(at) => {
            let widened = DeltaWindow {
                since: query.modified_since,
                until: Some(at),
                limit: None,
            };
            Stream {
                rows: store
                    .list_modified_since(workspace_id, entity_type, &widened)
                    .await?,
                truncated: true,
            }
        }
    })
}

async fn tombstone_stream(
    conn: &mut SqliteConnection,
    workspace_id: &str,
    query: &DeltaQuery,
) -> Result<Stream<Tombstone>> {
    let mut ledger = TombstoneLedger::new(conn);
    let window = DeltaWindow {
        since: query.modified_since,
        until: None,
        limit: Some(query.limit + 1),
    };
    let rows = ledger
        .list_deleted_since(workspace_id, &query.entity_types, &window)
        .await?;

    Ok(match settle(rows, query.limit as usize) {
        Page::Complete(rows) => Stream {
            rows,
            truncated: false,
        },
        Page::Truncated(rows) => Stream {
            rows,
            truncated: true,
        },
        Page::TieOverflow(at) => {
            let widened = DeltaWindow {
                since: query.modified_since,
                until: Some(at),
                limit: None,
            };
            Stream {
                rows: ledger
                    .list_deleted_since(workspace_id, &query.entity_types, &widened)
                    .await?,
                truncated: true,
            }
        }
    })
}

/// Changes in the caller's workspace after `query.modified_since`
pub async fn get_delta(
    pool: &SqlitePool,
    ctx: &WorkspaceContext,
    query: &DeltaQuery,
    config: &SyncConfig,
) -> Result<SyncResponse> {
    let server_time = timestamp::now();

    // One read transaction so every stream sees the same snapshot
    let mut tx = pool.begin().await?;
    let last_stamp = clock::last_stamp(&mut tx).await?;
    let mut entities = Vec::with_capacity(query.entity_types.len());
    for &entity_type in &query.entity_types {
        let stream = entity_stream(&mut tx, &ctx.workspace_id, entity_type, query).await?;
        entities.push((entity_type, stream));
    }
    let mut deleted = tombstone_stream(&mut tx, &ctx.workspace_id, query).await?;
    tx.rollback().await?;

    let cut = entities
        .iter()
        .map(|(_, s)| s)
        .filter(|s| s.truncated)
        .filter_map(|s| s.last_timestamp())
        .chain(deleted.truncated.then(|| deleted.last_timestamp()).flatten())
        .min();

    let (has_more, next_cursor) = match cut {
        Some(cut) => {
            for (_, stream) in entities.iter_mut() {
                stream.hold_back_after(cut);
            }
            deleted.hold_back_after(cut);
            (true, cut)
        }
        None => {
            let newest = entities
                .iter()
                .filter_map(|(_, s)| s.max_timestamp())
                .chain(deleted.max_timestamp())
                .max();
            let fallback = query
                .modified_since
                .map_or(last_stamp, |since| since.max(last_stamp));
            (false, newest.unwrap_or(fallback))
        }
    };

    let cutoff = retention_cutoff(server_time, config.tombstone_retention_days)?;
    let full_resync_required = query.modified_since.map_or(false, |since| since < cutoff);

    let mut response = SyncResponse {
        metadata: SyncMetadata {
            server_time,
            has_more,
            next_cursor: Some(next_cursor),
            full_resync_required,
        },
        items: Vec::new(),
        locations: Vec::new(),
        containers: Vec::new(),
        categories: Vec::new(),
        inventory: Vec::new(),
        loans: Vec::new(),
        borrowers: Vec::new(),
        deleted: deleted.rows,
    };
    for (entity_type, stream) in entities {
        let slot = match entity_type {
            EntityType::Item => &mut response.items,
            EntityType::Location => &mut response.locations,
            EntityType::Container => &mut response.containers,
            EntityType::Category => &mut response.categories,
            EntityType::Inventory => &mut response.inventory,
            EntityType::Loan => &mut response.loans,
            EntityType::Borrower => &mut response.borrowers,
        };
        *slot = stream.rows;
    }

    tracing::debug!(
        workspace = %ctx.workspace_id,
        has_more,
        deleted = response.deleted.len(),
        "Delta pull served"
    );

    Ok(response)
}

/// Per-type counts and the tombstone total for a workspace
pub async fn get_status(pool: &SqlitePool, ctx: &WorkspaceContext) -> Result<SyncStatus> {
    let mut conn = pool.acquire().await?;

    let mut entities = Vec::with_capacity(EntityType::ALL.len());
    for entity_type in EntityType::ALL {
        entities.push(
            EntityStore::new(&mut conn)
                .summary(&ctx.workspace_id, entity_type)
                .await?,
        );
    }
    let tombstones = TombstoneLedger::new(&mut conn).count(&ctx.workspace_id).await?;

    Ok(SyncStatus {
        server_time: timestamp::now(),
        entities,
        tombstones,
    })
}
