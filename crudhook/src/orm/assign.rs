//! Deep assignment of request data onto a loaded entity.
//!
//! Scalars are copied, related objects are found (by primary key) or created
//! and assigned recursively, bare keys are checked and attached, and to-many
//! collections become exactly the incoming list. Nothing is written here; the
//! next flush saves the result and drops collection members that are gone.

use serde_json::{Map, Value};

use crate::errors::CrudError;
use crate::orm::manager::{BoxFuture, EntityManager, FindOptions};
use crate::orm::meta::{PropertyKind, Row};

/// Assign `data` onto `entity` (an instance of `entity_name`).
///
/// Primary keys of `entity` are never overwritten. Non-object `data` is ignored.
///
/// # Errors
///
/// Returns [`CrudError::NotFound`] when a bare key names a missing related
/// entity, and query errors from the entity manager.
pub fn assign_entity<'a>(
    em: &'a EntityManager,
    entity_name: &'a str,
    entity: &'a mut Row,
    data: &'a Value,
) -> BoxFuture<'a, Result<(), CrudError>> {
    Box::pin(async move {
        let Value::Object(data) = data else {
            return Ok(());
        };
        let meta = em.meta(entity_name)?;

        for property in meta.scalars() {
            if meta.primary_keys.contains(&property.name) {
                continue;
            }
            if let Some(value) = data.get(&property.name) {
                let value = meta.coerce(&property.name, value.clone());
                entity.insert(property.name.clone(), value);
            }
        }

        for property in meta.relations() {
            let Some(incoming) = data.get(&property.name) else {
                continue;
            };
            let Some(target) = property.kind.target() else {
                continue;
            };
            let name = property.name.clone();
            match (&property.kind, incoming) {
                (PropertyKind::OneToMany { .. } | PropertyKind::ManyToMany { .. }, Value::Array(items)) => {
                    let mut members = Vec::with_capacity(items.len());
                    for item in items {
                        members.push(assign_member(em, target, item).await?);
                    }
                    entity.insert(name, Value::Array(members));
                }
                (PropertyKind::OneToMany { .. } | PropertyKind::ManyToMany { .. }, _) => {}
                (_, Value::Null) => {
                    entity.insert(name, Value::Null);
                }
                (
                    PropertyKind::OneToOne { .. } | PropertyKind::OneToOneInverse { .. },
                    Value::Object(fields),
                ) => {
                    let current = match entity.remove(&name) {
                        Some(Value::Object(current)) => Some(current),
                        Some(key) if !key.is_null() => load(em, target, &key).await?,
                        _ => None,
                    };
                    let mut related = match current {
                        Some(current) => current,
                        None => find_or_create(em, target, fields).await?,
                    };
                    assign_entity(em, target, &mut related, incoming).await?;
                    entity.insert(name, Value::Object(related));
                }
                (_, item) => {
                    let member = assign_member(em, target, item).await?;
                    entity.insert(name, member);
                }
            }
        }
        Ok(())
    })
}

/// Resolve one related value: objects are found or created and assigned,
/// bare keys must exist.
async fn assign_member(em: &EntityManager, target: &str, item: &Value) -> Result<Value, CrudError> {
    match item {
        Value::Object(fields) => {
            let mut related = find_or_create(em, target, fields).await?;
            assign_entity(em, target, &mut related, item).await?;
            Ok(Value::Object(related))
        }
        key => {
            let meta = em.meta(target)?;
            let key = meta.coerce(meta.primary_key_name(), key.clone());
            if load(em, target, &key).await?.is_none() {
                return Err(CrudError::not_found(target, Some(display_key(&key))));
            }
            Ok(key)
        }
    }
}

fn display_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn load(em: &EntityManager, target: &str, key: &Value) -> Result<Option<Row>, CrudError> {
    let meta = em.meta(target)?;
    let mut filter = Map::new();
    filter.insert(meta.primary_key_name().to_string(), key.clone());
    let found = em
        .find_one(target, &Value::Object(filter), &FindOptions::default())
        .await?;
    Ok(match found {
        Some(Value::Object(row)) => Some(row),
        _ => None,
    })
}

/// Load the entity addressed by the keys in `fields`, or start a new one
/// carrying those keys.
async fn find_or_create(
    em: &EntityManager,
    target: &str,
    fields: &Map<String, Value>,
) -> Result<Row, CrudError> {
    let meta = em.meta(target)?;
    let Some(key) = meta.key_of(fields) else {
        return Ok(Row::new());
    };
    let found = em
        .find_one(target, &Value::Object(key.clone()), &FindOptions::default())
        .await?;
    Ok(match found {
        Some(Value::Object(row)) => row,
        _ => key
            .into_iter()
            .map(|(pk, value)| {
                let value = meta.coerce(&pk, value);
                (pk, value)
            })
            .collect(),
    })
}
