//! Static field tables and payload validation

use serde_json::{Map, Value};
use thiserror::Error;

use super::EntityType;
use crate::db::timestamp;

/// Column type of an entity field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    /// Integer with an optional lower bound
    Integer { min: Option<i64> },
    Bool,
    /// RFC 3339 timestamp, normalized on write
    Timestamp,
    /// ID of another entity in the same workspace
    Reference(EntityType),
}

#[derive(Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Table layout for one entity type
#[derive(Debug)]
pub struct EntitySchema {
    pub entity_type: EntityType,
    pub table: &'static str,
    /// Key of this type's array in delta responses
    pub response_key: &'static str,
    pub fields: &'static [FieldSpec],
}

impl EntitySchema {
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

use FieldKind::{Bool, Integer, Reference, Text, Timestamp};

static ITEM: EntitySchema = EntitySchema {
    entity_type: EntityType::Item,
    table: "items",
    response_key: "items",
    fields: &[
        FieldSpec::required("name", Text),
        FieldSpec::optional("sku", Text),
        FieldSpec::optional("description", Text),
        FieldSpec::optional("barcode", Text),
        FieldSpec::optional("category_id", Reference(EntityType::Category)),
        FieldSpec::optional("min_stock_level", Integer { min: Some(0) }),
        FieldSpec::optional("is_archived", Bool),
    ],
};

static LOCATION: EntitySchema = EntitySchema {
    entity_type: EntityType::Location,
    table: "locations",
    response_key: "locations",
    fields: &[
        FieldSpec::required("name", Text),
        FieldSpec::optional("description", Text),
        FieldSpec::optional("parent_location_id", Reference(EntityType::Location)),
        FieldSpec::optional("zone", Text),
        FieldSpec::optional("shelf", Text),
        FieldSpec::optional("bin", Text),
        FieldSpec::optional("short_code", Text),
    ],
};

static CONTAINER: EntitySchema = EntitySchema {
    entity_type: EntityType::Container,
    table: "containers",
    response_key: "containers",
    fields: &[
        FieldSpec::required("name", Text),
        FieldSpec::optional("description", Text),
        FieldSpec::required("location_id", Reference(EntityType::Location)),
        FieldSpec::optional("capacity", Text),
        FieldSpec::optional("short_code", Text),
    ],
};

static CATEGORY: EntitySchema = EntitySchema {
    entity_type: EntityType::Category,
    table: "categories",
    response_key: "categories",
    fields: &[
        FieldSpec::required("name", Text),
        FieldSpec::optional("description", Text),
        FieldSpec::optional("parent_category_id", Reference(EntityType::Category)),
    ],
};

static INVENTORY: EntitySchema = EntitySchema {
    entity_type: EntityType::Inventory,
    table: "inventory",
    response_key: "inventory",
    fields: &[
        FieldSpec::required("item_id", Reference(EntityType::Item)),
        FieldSpec::required("location_id", Reference(EntityType::Location)),
        FieldSpec::optional("container_id", Reference(EntityType::Container)),
        FieldSpec::required("quantity", Integer { min: Some(0) }),
        FieldSpec::optional("condition", Text),
        FieldSpec::optional("status", Text),
        FieldSpec::optional("notes", Text),
    ],
};

static LOAN: EntitySchema = EntitySchema {
    entity_type: EntityType::Loan,
    table: "loans",
    response_key: "loans",
    fields: &[
        FieldSpec::required("inventory_id", Reference(EntityType::Inventory)),
        FieldSpec::required("borrower_id", Reference(EntityType::Borrower)),
        FieldSpec::required("quantity", Integer { min: Some(1) }),
        FieldSpec::optional("loaned_at", Timestamp),
        FieldSpec::optional("due_date", Timestamp),
        FieldSpec::optional("returned_at", Timestamp),
        FieldSpec::optional("notes", Text),
    ],
};

static BORROWER: EntitySchema = EntitySchema {
    entity_type: EntityType::Borrower,
    table: "borrowers",
    response_key: "borrowers",
    fields: &[
        FieldSpec::required("name", Text),
        FieldSpec::optional("email", Text),
        FieldSpec::optional("phone", Text),
        FieldSpec::optional("notes", Text),
    ],
};

pub(super) fn schema_for(entity_type: EntityType) -> &'static EntitySchema {
    match entity_type {
        EntityType::Item => &ITEM,
        EntityType::Location => &LOCATION,
        EntityType::Container => &CONTAINER,
        EntityType::Category => &CATEGORY,
        EntityType::Inventory => &INVENTORY,
        EntityType::Loan => &LOAN,
        EntityType::Borrower => &BORROWER,
    }
}

/// Columns managed by the server
const SYSTEM_FIELDS: [&str; 4] = ["id", "workspace_id", "created_at", "updated_at"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("data must be a JSON object")]
    NotAnObject,

    #[error("field '{0}' is managed by the server")]
    SystemField(String),

    #[error("unknown field '{field}' for {entity_type}")]
    UnknownField {
        entity_type: EntityType,
        field: String,
    },

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' cannot be null")]
    NullField(&'static str),

    #[error("field '{field}' must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("field '{field}' must be at least {min}")]
    BelowMinimum { field: &'static str, min: i64 },

    #[error("update contains no fields")]
    EmptyPatch,
}

/// A validated column value ready for binding
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Bool(bool),
}

/// Whether absent required fields are an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchMode {
    Create,
    Update,
}

/// Validated column assignments for one write
#[derive(Debug, Clone)]
pub struct Patch {
    pub values: Vec<(&'static FieldSpec, FieldValue)>,
}

impl Patch {
    /// Validate client `data` against an entity's field table
    pub fn from_json(
        schema: &'static EntitySchema,
        data: &Value,
        mode: PatchMode,
    ) -> Result<Self, ValidationError> {
        let object: &Map<String, Value> = data.as_object().ok_or(ValidationError::NotAnObject)?;

        let mut values = Vec::with_capacity(object.len());
        for (key, raw) in object {
            if SYSTEM_FIELDS.contains(&key.as_str()) {
                return Err(ValidationError::SystemField(key.clone()));
            }
            let spec = schema.field(key).ok_or_else(|| ValidationError::UnknownField {
                entity_type: schema.entity_type,
                field: key.clone(),
            })?;
            values.push((spec, convert(spec, raw)?));
        }

        match mode {
            PatchMode::Create => {
                if let Some(missing) = schema
                    .fields
                    .iter()
                    .find(|f| f.required && !object.contains_key(f.name))
                {
                    return Err(ValidationError::MissingField(missing.name));
                }
            }
            PatchMode::Update => {
                if values.is_empty() {
                    return Err(ValidationError::EmptyPatch);
                }
            }
        }

        // Keep column order stable so generated SQL is deterministic
        values.sort_by_key(|(spec, _)| schema.fields.iter().position(|f| f == *spec));

        Ok(Self { values })
    }

    /// Non-null references that must resolve inside the workspace
    pub fn references(&self) -> impl Iterator<Item = (&'static str, EntityType, &str)> + '_ {
        self.values.iter().filter_map(|(spec, value)| match (spec.kind, value) {
            (FieldKind::Reference(target), FieldValue::Text(id)) => {
                Some((spec.name, target, id.as_str()))
            }
            _ => None,
        })
    }
}

fn convert(spec: &'static FieldSpec, raw: &Value) -> Result<FieldValue, ValidationError> {
    if raw.is_null() {
        return if spec.required {
            Err(ValidationError::NullField(spec.name))
        } else {
            Ok(FieldValue::Null)
        };
    }

    let wrong = |expected: &'static str| ValidationError::WrongType {
        field: spec.name,
        expected,
    };

    match spec.kind {
        FieldKind::Text => raw
            .as_str()
            .map(|s| FieldValue::Text(s.to_string()))
            .ok_or_else(|| wrong("a string")),
        FieldKind::Reference(_) => match raw.as_str() {
            Some(id) if !id.trim().is_empty() => Ok(FieldValue::Text(id.to_string())),
            _ => Err(wrong("a non-empty id string")),
        },
        FieldKind::Integer { min } => {
            let n = raw.as_i64().ok_or_else(|| wrong("an integer"))?;
            match min {
                Some(min) if n < min => Err(ValidationError::BelowMinimum {
                    field: spec.name,
                    min,
                }),
                _ => Ok(FieldValue::Integer(n)),
            }
        }
        FieldKind::Bool => raw
            .as_bool()
            .map(FieldValue::Bool)
            .ok_or_else(|| wrong("a boolean")),
        FieldKind::Timestamp => raw
            .as_str()
            .and_then(|s| timestamp::parse(s).ok())
            .map(|ts| FieldValue::Text(timestamp::format(&timestamp::truncate(ts))))
            .ok_or_else(|| wrong("an RFC 3339 timestamp")),
    }
}
