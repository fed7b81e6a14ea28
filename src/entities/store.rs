//! Entity persistence
//!
//! One store drives all seven entity tables from their [`EntitySchema`].
//! It borrows a connection rather than the pool so the same calls work on a
//! pooled connection and inside a transaction.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{query::Query, Row, Sqlite, SqliteConnection};

use super::schema::{EntitySchema, FieldKind, FieldValue, Patch};
use super::{ensure_scope, EntityRecord, EntityType};
use crate::db::timestamp;
use crate::error::Result;

/// Bounds for a delta read: `since < updated_at <= until`
#[derive(Debug, Clone, Default)]
pub struct DeltaWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The write happened; carries the new (or, for deletes, the removed) record
    Applied(EntityRecord),
    /// No such entity in this workspace
    NotFound,
    /// The stored `updated_at` differs from the expected one; carries the current record
    Stale(EntityRecord),
}

/// Per-type counts for the sync status endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct EntitySummary {
    pub entity_type: EntityType,
    pub count: i64,
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// Entity store over a single connection
pub struct EntityStore<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> EntityStore<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Rows changed inside `window`, oldest first
    pub async fn list_modified_since(
        &mut self,
        workspace_id: &str,
        entity_type: EntityType,
        window: &DeltaWindow,
    ) -> Result<Vec<EntityRecord>> {
        let schema = entity_type.schema();
        let mut sql = format!(
            "SELECT {} FROM {} WHERE workspace_id = ?",
            select_columns(schema),
            schema.table
        );
        if window.since.is_some() {
            sql.push_str(" AND updated_at > ?");
        }
        if window.until.is_some() {
            sql.push_str(" AND updated_at <= ?");
        }
        sql.push_str(" ORDER BY updated_at ASC, id ASC");
        if window.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql).bind(workspace_id);
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
        let records = rows
            .iter()
            .map(|row| record_from_row(schema, row))
            .collect::<Result<Vec<_>>>()?;

        ensure_scope(workspace_id, records)
    }

    /// Get an entity by ID within a workspace
    pub async fn get(
        &mut self,
        workspace_id: &str,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<EntityRecord>> {
        let schema = entity_type.schema();
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ? AND workspace_id = ?",
            select_columns(schema),
            schema.table
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(workspace_id)
            .fetch_optional(&mut *self.conn)
            .await?;

        match row {
            Some(row) => {
                let record = record_from_row(schema, &row)?;
                Ok(ensure_scope(workspace_id, vec![record])?.pop())
            }
            None => Ok(None),
        }
    }

    /// Workspace owning `id`, in any workspace
    ///
    /// Only for collision checks on client-supplied ids; never return the
    /// foreign record itself.
    pub async fn find_owner(&mut self, entity_type: EntityType, id: &str) -> Result<Option<String>> {
        let sql = format!("SELECT workspace_id FROM {} WHERE id = ?", entity_type.schema().table);
        let row: Option<(String,)> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;

        Ok(row.map(|(workspace_id,)| workspace_id))
    }

    pub async fn exists_in_workspace(
        &mut self,
        workspace_id: &str,
        entity_type: EntityType,
        id: &str,
    ) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE id = ? AND workspace_id = ?",
            entity_type.schema().table
        );
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(id)
            .bind(workspace_id)
            .fetch_one(&mut *self.conn)
            .await?;

        Ok(count > 0)
    }

    /// Insert a new entity stamped with `at`
    pub async fn insert(
        &mut self,
        workspace_id: &str,
        entity_type: EntityType,
        id: &str,
        patch: &Patch,
        at: DateTime<Utc>,
    ) -> Result<EntityRecord> {
        let schema = entity_type.schema();
        let at = timestamp::format(&timestamp::truncate(at));

        let mut columns = vec!["id", "workspace_id", "created_at", "updated_at"];
        columns.extend(patch.values.iter().map(|(spec, _)| spec.name));
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            schema.table,
            columns.join(", "),
            placeholders
        );

        let mut q = sqlx::query(&sql)
            .bind(id)
            .bind(workspace_id)
            .bind(at.clone())
            .bind(at);
        for (_, value) in &patch.values {
            q = bind_value(q, value);
        }
        q.execute(&mut *self.conn).await?;

        self.get(workspace_id, entity_type, id).await?.ok_or_else(|| {
            crate::error::AppError::Internal(format!("Failed to fetch created {}", entity_type))
        })
    }

    /// Apply `patch` if the stored `updated_at` matches `expected` (when given)
    ///
    /// Callers hold the write lock (see [`crate::db::clock`]), so the record
    /// read here is current until commit. The `updated_at` guard on the write
    /// still rejects anything that changed underneath.
    pub async fn update(
        &mut self,
        workspace_id: &str,
        entity_type: EntityType,
        id: &str,
        patch: &Patch,
        expected: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome> {
        let current = match self.get(workspace_id, entity_type, id).await? {
            Some(current) => current,
            None => return Ok(WriteOutcome::NotFound),
        };
        if is_stale(&current, expected) {
            return Ok(WriteOutcome::Stale(current));
        }

        let assignments: Vec<String> = patch
            .values
            .iter()
            .map(|(spec, _)| format!("{} = ?", spec.name))
            .chain(std::iter::once("updated_at = ?".to_string()))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ? AND workspace_id = ? AND updated_at = ?",
            entity_type.schema().table,
            assignments.join(", ")
        );

        let next = timestamp::next_after(&current.updated_at, timestamp::truncate(now));
        let mut q = sqlx::query(&sql);
        for (_, value) in &patch.values {
            q = bind_value(q, value);
        }
        let result = q
            .bind(timestamp::format(&next))
            .bind(id)
            .bind(workspace_id)
            .bind(timestamp::format(&current.updated_at))
            .execute(&mut *self.conn)
            .await?;

        if result.rows_affected() == 0 {
            return self.reread(workspace_id, entity_type, id).await;
        }
        Ok(match self.get(workspace_id, entity_type, id).await? {
            Some(updated) => WriteOutcome::Applied(updated),
            None => WriteOutcome::NotFound,
        })
    }

    /// Delete if the stored `updated_at` matches `expected` (when given)
    pub async fn delete(
        &mut self,
        workspace_id: &str,
        entity_type: EntityType,
        id: &str,
        expected: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome> {
        let current = match self.get(workspace_id, entity_type, id).await? {
            Some(current) => current,
            None => return Ok(WriteOutcome::NotFound),
        };
        if is_stale(&current, expected) {
            return Ok(WriteOutcome::Stale(current));
        }

        let sql = format!(
            "DELETE FROM {} WHERE id = ? AND workspace_id = ? AND updated_at = ?",
            entity_type.schema().table
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(workspace_id)
            .bind(timestamp::format(&current.updated_at))
            .execute(&mut *self.conn)
            .await?;

        if result.rows_affected() == 0 {
            return self.reread(workspace_id, entity_type, id).await;
        }
        Ok(WriteOutcome::Applied(current))
    }

    /// Row count and newest `updated_at` for one type in a workspace
    pub async fn summary(
        &mut self,
        workspace_id: &str,
        entity_type: EntityType,
    ) -> Result<EntitySummary> {
        let sql = format!(
            "SELECT COUNT(*), MAX(updated_at) FROM {} WHERE workspace_id = ?",
            entity_type.schema().table
        );
        let (count, last): (i64, Option<String>) = sqlx::query_as(&sql)
            .bind(workspace_id)
            .fetch_one(&mut *self.conn)
            .await?;

        Ok(EntitySummary {
            entity_type,
            count,
            last_updated_at: last.as_deref().map(timestamp::parse).transpose()?,
        })
    }

    /// The guarded write matched nothing; report what is stored now
    async fn reread(
        &mut self,
        workspace_id: &str,
        entity_type: EntityType,
        id: &str,
    ) -> Result<WriteOutcome> {
        Ok(match self.get(workspace_id, entity_type, id).await? {
            Some(current) => WriteOutcome::Stale(current),
            None => WriteOutcome::NotFound,
        })
    }
}

fn is_stale(current: &EntityRecord, expected: Option<DateTime<Utc>>) -> bool {
    match expected {
        Some(expected) => timestamp::truncate(expected) != current.updated_at,
        None => false,
    }
}

fn select_columns(schema: &EntitySchema) -> String {
    let mut columns = vec!["id", "workspace_id", "created_at", "updated_at"];
    columns.extend(schema.fields.iter().map(|f| f.name));
    columns.join(", ")
}

fn bind_value<'q>(
    q: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &FieldValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        FieldValue::Null => q.bind(None::<String>),
        FieldValue::Text(s) => q.bind(s.clone()),
        FieldValue::Integer(n) => q.bind(*n),
        FieldValue::Bool(b) => q.bind(*b),
    }
}

fn record_from_row(schema: &'static EntitySchema, row: &SqliteRow) -> Result<EntityRecord> {
    let mut fields = Map::new();
    for spec in schema.fields {
        let value = match spec.kind {
            FieldKind::Text | FieldKind::Timestamp | FieldKind::Reference(_) => row
                .try_get::<Option<String>, _>(spec.name)?
                .map(Value::from),
            FieldKind::Integer { .. } => row.try_get::<Option<i64>, _>(spec.name)?.map(Value::from),
            FieldKind::Bool => row.try_get::<Option<bool>, _>(spec.name)?.map(Value::from),
        };
        fields.insert(spec.name.to_string(), value.unwrap_or(Value::Null));
    }

    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(EntityRecord {
        entity_type: schema.entity_type,
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        created_at: timestamp::parse(&created_at)?,
        updated_at: timestamp::parse(&updated_at)?,
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::entities::PatchMode;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn item_patch(data: Value, mode: PatchMode) -> Patch {
        Patch::from_json(EntityType::Item.schema(), &data, mode).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut store = EntityStore::new(&mut conn);

        let patch = item_patch(json!({"name": "Drill", "is_archived": false}), PatchMode::Create);
        let record = store
            .insert("ws-1", EntityType::Item, "item-1", &patch, t0())
            .await
            .unwrap();

        assert_eq!(record.updated_at, t0());
        assert_eq!(record.fields.get("name"), Some(&json!("Drill")));
        assert_eq!(record.fields.get("is_archived"), Some(&json!(false)));
        assert_eq!(record.fields.get("sku"), Some(&Value::Null));

        assert!(store.get("ws-2", EntityType::Item, "item-1").await.unwrap().is_none());
        assert_eq!(
            store.find_owner(EntityType::Item, "item-1").await.unwrap().as_deref(),
            Some("ws-1")
        );
    }

    #[tokio::test]
    async fn test_update_checks_expected_version() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut store = EntityStore::new(&mut conn);

        let create = item_patch(json!({"name": "Drill"}), PatchMode::Create);
        store.insert("ws-1", EntityType::Item, "item-1", &create, t0()).await.unwrap();

        let rename = item_patch(json!({"name": "Hammer drill"}), PatchMode::Update);
        let outcome = store
            .update("ws-1", EntityType::Item, "item-1", &rename, Some(t0()), t0() + Duration::seconds(5))
            .await
            .unwrap();
        let updated = match outcome {
            WriteOutcome::Applied(record) => record,
            other => panic!("expected applied, got {:?}", other),
        };
        assert_eq!(updated.updated_at, t0() + Duration::seconds(5));

        let stale = store
            .update("ws-1", EntityType::Item, "item-1", &rename, Some(t0()), t0() + Duration::seconds(9))
            .await
            .unwrap();
        assert_eq!(stale, WriteOutcome::Stale(updated));
    }

    #[tokio::test]
    async fn test_update_never_moves_backward() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut store = EntityStore::new(&mut conn);

        let create = item_patch(json!({"name": "Drill"}), PatchMode::Create);
        store.insert("ws-1", EntityType::Item, "item-1", &create, t0()).await.unwrap();

        let rename = item_patch(json!({"sku": "D-1"}), PatchMode::Update);
        let outcome = store
            .update("ws-1", EntityType::Item, "item-1", &rename, None, t0() - Duration::hours(1))
            .await
            .unwrap();

        match outcome {
            WriteOutcome::Applied(record) => assert!(record.updated_at > t0()),
            other => panic!("expected applied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_is_workspace_scoped() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut store = EntityStore::new(&mut conn);

        let create = item_patch(json!({"name": "Drill"}), PatchMode::Create);
        store.insert("ws-1", EntityType::Item, "item-1", &create, t0()).await.unwrap();

        let foreign = store.delete("ws-2", EntityType::Item, "item-1", None).await.unwrap();
        assert_eq!(foreign, WriteOutcome::NotFound);

        let deleted = store.delete("ws-1", EntityType::Item, "item-1", None).await.unwrap();
        assert!(matches!(deleted, WriteOutcome::Applied(_)));
        assert!(store.get("ws-1", EntityType::Item, "item-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_window_is_strict_below_and_inclusive_above() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut store = EntityStore::new(&mut conn);

        for i in 0..4 {
            let patch = item_patch(json!({"name": format!("Item {}", i)}), PatchMode::Create);
            store
                .insert("ws-1", EntityType::Item, &format!("item-{}", i), &patch, t0() + Duration::seconds(i))
                .await
                .unwrap();
        }

        let window = DeltaWindow {
            since: Some(t0() + Duration::seconds(1)),
            until: Some(t0() + Duration::seconds(3)),
            limit: None,
        };
        let rows = store
            .list_modified_since("ws-1", EntityType::Item, &window)
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["item-2", "item-3"]);

        let summary = store.summary("ws-1", EntityType::Item).await.unwrap();
        assert_eq!(summary.count, 4);
        assert_eq!(summary.last_updated_at, Some(t0() + Duration::seconds(3)));
    }
}
