//! Entity metadata: what the entity manager knows about a persisted type.
//!
//! Entities travel through the hook pipeline as JSON objects. Their metadata
//! says which properties are plain columns, which are relations, how primary
//! keys are produced and which values are generated on insert or update.

use std::collections::HashMap;
use std::sync::Arc;

use heck::ToSnakeCase;
use serde_json::{Map, Value};

use crate::errors::CrudError;

/// One stored row or a JSON entity, keyed by property or column name.
pub type Row = Map<String, Value>;

/// Column type of a scalar property, used to coerce textual input (route
/// parameters, query strings) into comparable JSON values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Integer,
    Float,
    Text,
    Boolean,
    Uuid,
    DateTime,
    Json,
}

impl ScalarType {
    /// Convert a string value to this type when it parses; other values pass through.
    #[must_use]
    pub fn coerce(self, value: Value) -> Value {
        let Value::String(text) = &value else {
            return value;
        };
        match self {
            Self::Integer => text.trim().parse::<i64>().map_or(value, Value::from),
            Self::Float => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map_or(value, Value::Number),
            Self::Boolean => match text.as_str() {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => value,
            },
            Self::Json => serde_json::from_str(text).unwrap_or(value),
            Self::Text | Self::Uuid | Self::DateTime => value,
        }
    }

    /// Normalize a value read back from storage. SQLite hands booleans back as
    /// integers and JSON documents as text.
    #[must_use]
    pub fn from_storage(self, value: Value) -> Value {
        match (self, value) {
            (Self::Boolean, Value::Number(n)) => Value::Bool(n.as_f64().is_some_and(|v| v != 0.0)),
            (Self::Json, Value::String(text)) => {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
            (_, value) => value,
        }
    }

    /// Shape a value for storage; JSON documents are stored as text.
    #[must_use]
    pub fn to_storage(self, value: Value) -> Value {
        match (self, value) {
            (Self::Json, value @ (Value::Object(_) | Value::Array(_))) => {
                Value::String(value.to_string())
            }
            (ty, value) => ty.coerce(value),
        }
    }
}

/// Value produced by the entity manager instead of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generated {
    /// Random v4 UUID
    Uuid,
    /// Current UTC timestamp, RFC 3339
    Now,
}

impl Generated {
    #[must_use]
    pub fn produce(self) -> Value {
        match self {
            Self::Uuid => Value::String(uuid::Uuid::new_v4().to_string()),
            Self::Now => Value::String(chrono::Utc::now().to_rfc3339()),
        }
    }
}

/// How new primary keys come into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyGeneration {
    /// The entity manager assigns a v4 UUID when the key is missing.
    #[default]
    Uuid,
    /// The storage assigns the next integer on insert.
    Increment,
    /// The client always supplies the key.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Scalar(ScalarType),
    /// Owning side, the foreign key lives in `join_column`.
    ManyToOne {
        target: String,
        join_column: String,
    },
    /// Owning side of a one-to-one, stored like a many-to-one.
    OneToOne {
        target: String,
        join_column: String,
    },
    /// Inverse side of a one-to-one; `mapped_by` names the owner property on `target`.
    OneToOneInverse {
        target: String,
        mapped_by: String,
    },
    /// `mapped_by` names the many-to-one property on `target` pointing back here.
    OneToMany {
        target: String,
        mapped_by: String,
        orphan_removal: bool,
    },
    ManyToMany {
        target: String,
        pivot_table: String,
        join_column: String,
        inverse_join_column: String,
    },
}

impl PropertyKind {
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Scalar(_) => None,
            Self::ManyToOne { target, .. }
            | Self::OneToOne { target, .. }
            | Self::OneToOneInverse { target, .. }
            | Self::OneToMany { target, .. }
            | Self::ManyToMany { target, .. } => Some(target),
        }
    }

    /// Column holding the foreign key on this entity's own table.
    #[must_use]
    pub fn join_column(&self) -> Option<&str> {
        match self {
            Self::ManyToOne { join_column, .. } | Self::OneToOne { join_column, .. } => {
                Some(join_column)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn is_to_many(&self) -> bool {
        matches!(self, Self::OneToMany { .. } | Self::ManyToMany { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMeta {
    pub name: String,
    pub kind: PropertyKind,
    pub unique: bool,
    /// Removed from serialized responses.
    pub hidden: bool,
    pub on_create: Option<Generated>,
    pub on_update: Option<Generated>,
}

impl PropertyMeta {
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            unique: false,
            hidden: false,
            on_create: None,
            on_update: None,
        }
    }

    pub fn scalar(name: impl Into<String>, ty: ScalarType) -> Self {
        Self::new(name, PropertyKind::Scalar(ty))
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    #[must_use]
    pub fn on_create(mut self, generated: Generated) -> Self {
        self.on_create = Some(generated);
        self
    }

    #[must_use]
    pub fn on_update(mut self, generated: Generated) -> Self {
        self.on_update = Some(generated);
        self
    }

    #[must_use]
    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, PropertyKind::Scalar(_))
    }
}

/// Storage-level description of a table, handed to drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_keys: Vec<String>,
    /// Column filled by the storage on insert.
    pub auto_increment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub unique: bool,
}

impl TableDef {
    /// Join table of a many-to-many relation, keyed by both columns.
    #[must_use]
    pub fn pivot(name: &str, owner_column: &str, inverse_column: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: vec![
                ColumnDef {
                    name: owner_column.to_string(),
                    unique: false,
                },
                ColumnDef {
                    name: inverse_column.to_string(),
                    unique: false,
                },
            ],
            primary_keys: vec![owner_column.to_string(), inverse_column.to_string()],
            auto_increment: None,
        }
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

/// Metadata of one entity type.
///
/// ```rust,ignore
/// let post = EntityMeta::new("Post", "posts")
///     .primary_key("id", ScalarType::Integer)
///     .key_generation(KeyGeneration::Increment)
///     .scalar("title", ScalarType::Text)
///     .many_to_one("author", "Author")
///     .one_to_many("comments", "Comment", "post");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMeta {
    pub name: String,
    pub table: String,
    pub primary_keys: Vec<String>,
    pub key_generation: KeyGeneration,
    pub properties: Vec<PropertyMeta>,
}

impl EntityMeta {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            primary_keys: Vec::new(),
            key_generation: KeyGeneration::default(),
            properties: Vec::new(),
        }
    }

    #[must_use]
    pub fn primary_key(mut self, name: &str, ty: ScalarType) -> Self {
        self.primary_keys.push(name.to_string());
        self.properties.push(PropertyMeta::scalar(name, ty));
        self
    }

    #[must_use]
    pub fn key_generation(mut self, generation: KeyGeneration) -> Self {
        self.key_generation = generation;
        self
    }

    #[must_use]
    pub fn scalar(self, name: &str, ty: ScalarType) -> Self {
        self.property(PropertyMeta::scalar(name, ty))
    }

    #[must_use]
    pub fn property(mut self, property: PropertyMeta) -> Self {
        self.properties.push(property);
        self
    }

    /// Many-to-one with the foreign key in `{name}_id`.
    #[must_use]
    pub fn many_to_one(self, name: &str, target: &str) -> Self {
        let join_column = format!("{name}_id");
        self.property(PropertyMeta::new(
            name,
            PropertyKind::ManyToOne {
                target: target.to_string(),
                join_column,
            },
        ))
    }

    /// Owning one-to-one with the foreign key in `{name}_id`.
    #[must_use]
    pub fn one_to_one(self, name: &str, target: &str) -> Self {
        let join_column = format!("{name}_id");
        self.property(PropertyMeta::new(
            name,
            PropertyKind::OneToOne {
                target: target.to_string(),
                join_column,
            },
        ))
    }

    #[must_use]
    pub fn one_to_one_inverse(self, name: &str, target: &str, mapped_by: &str) -> Self {
        self.property(PropertyMeta::new(
            name,
            PropertyKind::OneToOneInverse {
                target: target.to_string(),
                mapped_by: mapped_by.to_string(),
            },
        ))
    }

    #[must_use]
    pub fn one_to_many(self, name: &str, target: &str, mapped_by: &str) -> Self {
        self.property(PropertyMeta::new(
            name,
            PropertyKind::OneToMany {
                target: target.to_string(),
                mapped_by: mapped_by.to_string(),
                orphan_removal: false,
            },
        ))
    }

    /// Like [`one_to_many`](Self::one_to_many) but children dropped from the
    /// collection are deleted instead of detached.
    #[must_use]
    pub fn one_to_many_owned(self, name: &str, target: &str, mapped_by: &str) -> Self {
        self.property(PropertyMeta::new(
            name,
            PropertyKind::OneToMany {
                target: target.to_string(),
                mapped_by: mapped_by.to_string(),
                orphan_removal: true,
            },
        ))
    }

    /// Many-to-many through `pivot_table` with `{entity}_id` / `{target}_id` columns.
    #[must_use]
    pub fn many_to_many(self, name: &str, target: &str, pivot_table: &str) -> Self {
        let join_column = format!("{}_id", self.name.to_snake_case());
        let inverse_join_column = format!("{}_id", target.to_snake_case());
        self.property(PropertyMeta::new(
            name,
            PropertyKind::ManyToMany {
                target: target.to_string(),
                pivot_table: pivot_table.to_string(),
                join_column,
                inverse_join_column,
            },
        ))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PropertyMeta> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn scalars(&self) -> impl Iterator<Item = &PropertyMeta> {
        self.properties.iter().filter(|p| p.is_scalar())
    }

    pub fn relations(&self) -> impl Iterator<Item = &PropertyMeta> {
        self.properties.iter().filter(|p| !p.is_scalar())
    }

    /// First primary key; relations always address their target through it.
    #[must_use]
    pub fn primary_key_name(&self) -> &str {
        self.primary_keys.first().map_or("id", String::as_str)
    }

    /// Coerce textual input for `field` to the field's scalar type.
    #[must_use]
    pub fn coerce(&self, field: &str, value: Value) -> Value {
        match self.get(field).map(|p| &p.kind) {
            Some(PropertyKind::Scalar(ty)) => ty.coerce(value),
            _ => value,
        }
    }

    /// Primary key values of `entity`, when every key is present and not null.
    #[must_use]
    pub fn key_of(&self, entity: &Row) -> Option<Row> {
        let mut key = Row::new();
        for pk in &self.primary_keys {
            match entity.get(pk) {
                Some(Value::Null) | None => return None,
                Some(value) => {
                    key.insert(pk.clone(), value.clone());
                }
            }
        }
        Some(key)
    }

    /// Render a key for messages (`"3"`, `"1/2"`).
    #[must_use]
    pub fn describe_key(&self, entity: &Row) -> String {
        self.primary_keys
            .iter()
            .map(|pk| match entity.get(pk) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "?".to_string(),
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Storage layout: scalar columns plus owning-side foreign keys.
    #[must_use]
    pub fn table_def(&self) -> TableDef {
        let columns = self
            .properties
            .iter()
            .filter_map(|p| match &p.kind {
                PropertyKind::Scalar(_) => Some(ColumnDef {
                    name: p.name.clone(),
                    unique: p.unique,
                }),
                kind => kind.join_column().map(|column| ColumnDef {
                    name: column.to_string(),
                    unique: matches!(kind, PropertyKind::OneToOne { .. }),
                }),
            })
            .collect();
        let auto_increment = (self.key_generation == KeyGeneration::Increment)
            .then(|| self.primary_key_name().to_string());
        TableDef {
            name: self.table.clone(),
            columns,
            primary_keys: self.primary_keys.clone(),
            auto_increment,
        }
    }
}

/// A Rust type that describes a persisted entity, usually via
/// `#[derive(CrudEntity)]`.
pub trait CrudEntity {
    fn entity_meta() -> EntityMeta;
}

/// All entity metadata known to one application.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: HashMap<String, Arc<EntityMeta>>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, meta: EntityMeta) -> Self {
        self.register(meta);
        self
    }

    #[must_use]
    pub fn with_entity<E: CrudEntity>(self) -> Self {
        self.with(E::entity_meta())
    }

    pub fn register(&mut self, meta: EntityMeta) -> Arc<EntityMeta> {
        let meta = Arc::new(meta);
        self.entities.insert(meta.name.clone(), Arc::clone(&meta));
        meta
    }

    /// # Errors
    ///
    /// Returns a validation error when `name` was never registered.
    pub fn get(&self, name: &str) -> Result<&Arc<EntityMeta>, CrudError> {
        self.entities
            .get(name)
            .ok_or_else(|| CrudError::validation(format!("unknown entity '{name}'")))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMeta>> {
        self.entities.values()
    }

    /// Check that every relation points at a registered entity and that
    /// `mapped_by` names an owning property on the other side.
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first broken relation.
    pub fn validate(&self) -> Result<(), CrudError> {
        for meta in self.entities.values() {
            if meta.primary_keys.is_empty() {
                return Err(CrudError::validation(format!(
                    "entity '{}' has no primary key",
                    meta.name
                )));
            }
            for property in meta.relations() {
                let Some(target) = property.kind.target() else {
                    continue;
                };
                let target_meta = self.get(target)?;
                if let PropertyKind::OneToMany { mapped_by, .. }
                | PropertyKind::OneToOneInverse { mapped_by, .. } = &property.kind
                {
                    let owner = target_meta.get(mapped_by).and_then(|p| p.kind.join_column());
                    if owner.is_none() {
                        return Err(CrudError::validation(format!(
                            "'{}.{}' is mapped by '{}.{}', which is not an owning relation",
                            meta.name, property.name, target, mapped_by
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post() -> EntityMeta {
        EntityMeta::new("BlogPost", "posts")
            .primary_key("id", ScalarType::Integer)
            .key_generation(KeyGeneration::Increment)
            .property(PropertyMeta::scalar("slug", ScalarType::Text).unique())
            .many_to_one("author", "Author")
            .many_to_many("tags", "Tag", "post_tags")
    }

    #[test]
    fn test_table_def_includes_join_columns() {
        let table = post().table_def();
        let names: Vec<_> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "slug", "author_id"]);
        assert_eq!(table.auto_increment.as_deref(), Some("id"));
        assert!(table.columns[1].unique);
    }

    #[test]
    fn test_many_to_many_default_columns() {
        let meta = post();
        let Some(PropertyKind::ManyToMany {
            join_column,
            inverse_join_column,
            ..
        }) = meta.get("tags").map(|p| &p.kind)
        else {
            panic!("tags should be many-to-many");
        };
        assert_eq!(join_column, "blog_post_id");
        assert_eq!(inverse_join_column, "tag_id");
    }

    #[test]
    fn test_coerce_by_declared_type() {
        let meta = post();
        assert_eq!(meta.coerce("id", json!("42")), json!(42));
        assert_eq!(meta.coerce("id", json!("abc")), json!("abc"));
        assert_eq!(meta.coerce("slug", json!("42")), json!("42"));
        assert_eq!(ScalarType::Boolean.coerce(json!("true")), json!(true));
    }

    #[test]
    fn test_key_of_requires_every_key() {
        let meta = post();
        let entity = json!({"id": 3, "slug": "x"});
        let key = meta.key_of(entity.as_object().unwrap()).unwrap();
        assert_eq!(Value::Object(key), json!({"id": 3}));
        assert!(meta.key_of(json!({"id": null}).as_object().unwrap()).is_none());
    }

    #[test]
    fn test_schema_validation_rejects_unknown_target() {
        let schema = Schema::new().with(post());
        assert!(schema.validate().is_err());
    }
}
