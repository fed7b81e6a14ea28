//! Workspace-scoped inventory entities
//!
//! Every synced table (items, locations, containers, categories, inventory,
//! borrowers, loans) shares the same envelope: `id`, `workspace_id`,
//! `created_at` and `updated_at`, plus type-specific fields described by a
//! static [`EntitySchema`] table. The sync engine dispatches on
//! [`EntityType`] and never special-cases a table.

mod schema;
mod store;

pub use schema::{EntitySchema, Patch, PatchMode, ValidationError};
pub use store::{DeltaWindow, EntityStore, EntitySummary, WriteOutcome};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};

/// Types of entities that can be synced
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Item,
    Location,
    Container,
    Category,
    Inventory,
    Loan,
    Borrower,
}

impl EntityType {
    /// Every type, in delta response order
    pub const ALL: [EntityType; 7] = [
        EntityType::Item,
        EntityType::Location,
        EntityType::Container,
        EntityType::Category,
        EntityType::Inventory,
        EntityType::Loan,
        EntityType::Borrower,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Item => "item",
            EntityType::Location => "location",
            EntityType::Container => "container",
            EntityType::Category => "category",
            EntityType::Inventory => "inventory",
            EntityType::Loan => "loan",
            EntityType::Borrower => "borrower",
        }
    }

    pub fn schema(&self) -> &'static EntitySchema {
        schema::schema_for(*self)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = AppError;

    /// Accepts the singular name (`item`) or the response key (`items`)
    fn from_str(s: &str) -> Result<Self> {
        let needle = s.trim().to_ascii_lowercase();
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == needle || t.schema().response_key == needle)
            .ok_or_else(|| AppError::Validation(format!("unknown entity type: {}", s.trim())))
    }
}

/// Records that belong to exactly one workspace
pub trait WorkspaceScoped {
    fn workspace_id(&self) -> &str;
}

/// Reject rows that escaped their workspace filter
pub fn ensure_scope<T: WorkspaceScoped>(workspace_id: &str, rows: Vec<T>) -> Result<Vec<T>> {
    if let Some(stray) = rows.iter().find(|r| r.workspace_id() != workspace_id) {
        return Err(AppError::Internal(format!(
            "row from workspace {} returned for workspace {}",
            stray.workspace_id(),
            workspace_id
        )));
    }
    Ok(rows)
}

/// A stored entity of any type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    #[serde(skip)]
    pub entity_type: EntityType,
    pub id: String,
    pub workspace_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Type-specific columns, keyed by column name
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl WorkspaceScoped for EntityRecord {
    fn workspace_id(&self) -> &str {
        &self.workspace_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_parsing() {
        assert_eq!("item".parse::<EntityType>().unwrap(), EntityType::Item);
        assert_eq!("items".parse::<EntityType>().unwrap(), EntityType::Item);
        assert_eq!(" Categories ".parse::<EntityType>().unwrap(), EntityType::Category);
        assert_eq!("inventory".parse::<EntityType>().unwrap(), EntityType::Inventory);
        assert!("favorites".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_entity_type_serde_names() {
        let json = serde_json::to_string(&EntityType::Borrower).unwrap();
        assert_eq!(json, "\"borrower\"");
    }

    #[test]
    fn test_record_serializes_flat() {
        let mut fields = Map::new();
        fields.insert("name".to_string(), Value::from("Drill"));
        let record = EntityRecord {
            entity_type: EntityType::Item,
            id: "item-1".to_string(),
            workspace_id: "ws-1".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            fields,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["name"], "Drill");
        assert_eq!(json["workspace_id"], "ws-1");
        assert!(json.get("entity_type").is_none());
    }

    #[test]
    fn test_ensure_scope_rejects_foreign_rows() {
        let record = EntityRecord {
            entity_type: EntityType::Item,
            id: "item-1".to_string(),
            workspace_id: "ws-other".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            fields: Map::new(),
        };

        assert!(ensure_scope("ws-1", vec![record.clone()]).is_err());
        assert_eq!(ensure_scope("ws-other", vec![record]).unwrap().len(), 1);
    }
}
