//! The entity manager: one unit of work over one transaction.
//!
//! Entities are JSON objects shaped by their [`EntityMeta`]. Scalars map to
//! columns; owning to-one relations hold the related key (or the related
//! object once populated); inverse and to-many relations appear only when
//! populated or when assigned by the caller.
//!
//! Every CRUD request forks its own manager from the application-wide one, so
//! transactions and pending changes are never shared between requests.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use crate::errors::CrudError;
use crate::orm::driver::{Driver, Page, SortOrder, Transaction};
use crate::orm::filter::{Filter, Operator, values_equal};
use crate::orm::meta::{EntityMeta, KeyGeneration, PropertyKind, Row, Schema, TableDef};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which relations to load alongside the found entities.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "PopulateRepr", into = "PopulateRepr")]
pub enum Populate {
    #[default]
    None,
    /// Every relation of the entity, one level deep.
    All,
    /// Dotted relation paths (`"author"`, `"comments.author"`).
    Paths(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PopulateRepr {
    Flag(bool),
    Paths(Vec<String>),
}

impl From<PopulateRepr> for Populate {
    fn from(repr: PopulateRepr) -> Self {
        match repr {
            PopulateRepr::Flag(true) => Self::All,
            PopulateRepr::Flag(false) => Self::None,
            PopulateRepr::Paths(paths) => Self::Paths(paths),
        }
    }
}

impl From<Populate> for PopulateRepr {
    fn from(populate: Populate) -> Self {
        match populate {
            Populate::None => Self::Flag(false),
            Populate::All => Self::Flag(true),
            Populate::Paths(paths) => Self::Paths(paths),
        }
    }
}

/// Options of a find call. Hooks receive them in the `OPTIONS` slot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FindOptions {
    #[serde(default)]
    pub populate: Populate,
    #[serde(default)]
    pub order_by: Vec<(String, SortOrder)>,
    #[serde(default)]
    pub offset: u64,
    /// `None` returns every match.
    #[serde(default)]
    pub limit: Option<u64>,
}

impl FindOptions {
    #[must_use]
    pub fn populate(mut self, populate: Populate) -> Self {
        self.populate = populate;
        self
    }
}

enum Change {
    Persist(Arc<EntityMeta>, Value),
    Remove(Arc<EntityMeta>, Value),
}

/// Queries and changes entities inside one transaction.
pub struct EntityManager {
    schema: Arc<Schema>,
    driver: Arc<dyn Driver>,
    txn: Mutex<Option<Box<dyn Transaction>>>,
    pending: Mutex<Vec<Change>>,
}

impl fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("entities", &self.schema.entities().count())
            .finish_non_exhaustive()
    }
}

fn active(slot: &mut Option<Box<dyn Transaction>>) -> Result<&mut Box<dyn Transaction>, CrudError> {
    slot.as_mut()
        .ok_or_else(|| CrudError::internal("No active transaction", None))
}

impl EntityManager {
    /// # Errors
    ///
    /// Returns a validation error when the schema has broken relations.
    pub fn new(schema: Schema, driver: impl Driver + 'static) -> Result<Self, CrudError> {
        schema.validate()?;
        Ok(Self::from_parts(Arc::new(schema), Arc::new(driver)))
    }

    #[must_use]
    pub fn from_parts(schema: Arc<Schema>, driver: Arc<dyn Driver>) -> Self {
        Self {
            schema,
            driver,
            txn: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// A fresh manager over the same schema and driver, with no transaction
    /// and no pending changes.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self::from_parts(Arc::clone(&self.schema), Arc::clone(&self.driver))
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// # Errors
    ///
    /// Returns a validation error for unknown entity names.
    pub fn meta(&self, entity: &str) -> Result<Arc<EntityMeta>, CrudError> {
        self.schema.get(entity).map(Arc::clone)
    }

    /// # Errors
    ///
    /// Fails when a transaction is already open or the driver refuses one.
    pub async fn begin(&self) -> Result<(), CrudError> {
        let mut slot = self.txn.lock().await;
        if slot.is_some() {
            return Err(CrudError::internal("A transaction is already open", None));
        }
        *slot = Some(self.driver.begin().await?);
        Ok(())
    }

    pub async fn is_in_transaction(&self) -> bool {
        self.txn.lock().await.is_some()
    }

    /// Flush pending changes and commit. Without an open transaction this is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Propagates flush and commit failures; the transaction stays open when
    /// the flush fails so the caller can roll back.
    pub async fn commit(&self) -> Result<(), CrudError> {
        self.flush().await?;
        let txn = self.txn.lock().await.take();
        if let Some(txn) = txn {
            txn.commit().await?;
        }
        Ok(())
    }

    /// Discard pending changes and roll back.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub async fn rollback(&self) -> Result<(), CrudError> {
        self.pending.lock().await.clear();
        let txn = self.txn.lock().await.take();
        if let Some(txn) = txn {
            txn.rollback().await?;
        }
        Ok(())
    }

    /// Lock the transaction slot, opening a transaction when none is active.
    async fn lock_txn(&self) -> Result<MutexGuard<'_, Option<Box<dyn Transaction>>>, CrudError> {
        let mut slot = self.txn.lock().await;
        if slot.is_none() {
            *slot = Some(self.driver.begin().await?);
        }
        Ok(slot)
    }

    fn page(meta: &EntityMeta, options: &FindOptions) -> Result<Page, CrudError> {
        for (column, _) in &options.order_by {
            if !meta.get(column).is_some_and(|p| p.is_scalar()) {
                return Err(CrudError::validation(format!(
                    "cannot sort '{}' by '{column}'",
                    meta.name
                )));
            }
        }
        Ok(Page {
            order_by: options.order_by.clone(),
            offset: options.offset,
            limit: options.limit,
        })
    }

    /// Find entities matching a JSON filter.
    ///
    /// # Errors
    ///
    /// Returns validation errors for unknown entities, properties, operators
    /// or populate paths, and driver errors otherwise.
    pub async fn find(
        &self,
        entity: &str,
        filter: &Value,
        options: &FindOptions,
    ) -> Result<Vec<Value>, CrudError> {
        self.find_rows(entity, filter, options, false)
            .await
            .map(|(items, _)| items)
    }

    /// Find one page of entities plus the number of matches ignoring paging.
    ///
    /// # Errors
    ///
    /// See [`find`](Self::find).
    pub async fn find_and_count(
        &self,
        entity: &str,
        filter: &Value,
        options: &FindOptions,
    ) -> Result<(Vec<Value>, u64), CrudError> {
        self.find_rows(entity, filter, options, true).await
    }

    /// # Errors
    ///
    /// See [`find`](Self::find).
    pub async fn find_one(
        &self,
        entity: &str,
        filter: &Value,
        options: &FindOptions,
    ) -> Result<Option<Value>, CrudError> {
        let options = FindOptions {
            offset: 0,
            limit: Some(1),
            ..options.clone()
        };
        Ok(self.find(entity, filter, &options).await?.into_iter().next())
    }

    /// # Errors
    ///
    /// See [`find`](Self::find).
    pub async fn count(&self, entity: &str, filter: &Value) -> Result<u64, CrudError> {
        let meta = self.meta(entity)?;
        let filter = Filter::parse(filter)?;
        let mut slot = self.lock_txn().await?;
        let mut scope = Scope::new(&self.schema, active(&mut slot)?);
        let resolved = scope.resolve(&meta, &filter).await?;
        scope.txn.count(&meta.table_def(), &resolved).await
    }

    async fn find_rows(
        &self,
        entity: &str,
        filter: &Value,
        options: &FindOptions,
        with_count: bool,
    ) -> Result<(Vec<Value>, u64), CrudError> {
        let meta = self.meta(entity)?;
        let filter = Filter::parse(filter)?;
        let page = Self::page(&meta, options)?;
        let plan = PopulateTree::build(&self.schema, &meta, &options.populate)?;

        let mut slot = self.lock_txn().await?;
        let mut scope = Scope::new(&self.schema, active(&mut slot)?);
        let resolved = scope.resolve(&meta, &filter).await?;
        let mut rows = scope.select_entities(&meta, &resolved, &page).await?;
        scope.populate(&meta, &mut rows, &plan).await?;
        let count = if with_count {
            scope.txn.count(&meta.table_def(), &resolved).await?
        } else {
            rows.len() as u64
        };
        tracing::trace!(entity = %meta.name, found = rows.len(), count, "find");
        Ok((rows.into_iter().map(Value::Object).collect(), count))
    }

    /// Build a new, unsaved entity from request data. Unknown properties are
    /// dropped and textual scalars are coerced to their declared types.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `data` is not an object.
    pub fn create(&self, entity: &str, data: Value) -> Result<Value, CrudError> {
        let meta = self.meta(entity)?;
        let Value::Object(data) = data else {
            return Err(CrudError::validation(format!(
                "'{}' must be created from an object",
                meta.name
            )));
        };
        let built = data
            .into_iter()
            .filter(|(key, _)| meta.get(key).is_some())
            .map(|(key, value)| {
                let value = meta.coerce(&key, value);
                (key, value)
            })
            .collect();
        Ok(Value::Object(built))
    }

    /// Queue an entity (new or loaded) for saving on the next flush. Returns
    /// its position in the unit of work.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown entities.
    pub async fn persist(&self, entity: &str, value: Value) -> Result<usize, CrudError> {
        let meta = self.meta(entity)?;
        let mut pending = self.pending.lock().await;
        pending.push(Change::Persist(meta, value));
        Ok(pending.len() - 1)
    }

    /// Replace a queued entity, e.g. after a hook returned a new version of it.
    ///
    /// # Errors
    ///
    /// Fails when `index` does not name a queued persist.
    pub async fn replace_pending(&self, index: usize, value: Value) -> Result<(), CrudError> {
        match self.pending.lock().await.get_mut(index) {
            Some(Change::Persist(_, queued)) => {
                *queued = value;
                Ok(())
            }
            _ => Err(CrudError::internal(
                format!("no pending entity at position {index}"),
                None,
            )),
        }
    }

    /// Queue an entity for deletion on the next flush.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown entities.
    pub async fn remove(&self, entity: &str, value: Value) -> Result<(), CrudError> {
        let meta = self.meta(entity)?;
        self.pending.lock().await.push(Change::Remove(meta, value));
        Ok(())
    }

    /// Write every queued change. Returns the persisted entities in queue
    /// order, with generated keys and values filled in.
    ///
    /// # Errors
    ///
    /// Stops at the first failing change; earlier writes stay in the
    /// transaction until it is rolled back.
    pub async fn flush(&self) -> Result<Vec<Value>, CrudError> {
        let changes = std::mem::take(&mut *self.pending.lock().await);
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let mut slot = self.lock_txn().await?;
        let mut scope = Scope::new(&self.schema, active(&mut slot)?);
        let mut saved = Vec::new();
        for change in changes {
            match change {
                Change::Persist(meta, value) => {
                    let Value::Object(mut entity) = value else {
                        return Err(CrudError::validation(format!(
                            "'{}' must be persisted as an object",
                            meta.name
                        )));
                    };
                    scope.save(&meta, &mut entity).await?;
                    saved.push(Value::Object(entity));
                }
                Change::Remove(meta, value) => {
                    if let Value::Object(entity) = value {
                        scope.delete(&meta, &entity).await?;
                    }
                }
            }
        }
        tracing::debug!(persisted = saved.len(), "flushed unit of work");
        Ok(saved)
    }

    /// Serialize an entity (or a list of them) for a response: hidden
    /// properties are removed, also inside populated relations.
    #[must_use]
    pub fn to_json(&self, entity: &str, value: Value) -> Value {
        match self.schema.get(entity) {
            Ok(meta) => strip_hidden(&self.schema, meta, value),
            Err(_) => value,
        }
    }
}

fn strip_hidden(schema: &Schema, meta: &EntityMeta, value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| strip_hidden(schema, meta, item))
                .collect(),
        ),
        Value::Object(entity) => Value::Object(
            entity
                .into_iter()
                .filter_map(|(key, value)| {
                    let Some(property) = meta.get(&key) else {
                        return Some((key, value));
                    };
                    if property.hidden {
                        return None;
                    }
                    let value = match property.kind.target().map(|t| schema.get(t)) {
                        Some(Ok(target)) => strip_hidden(schema, target, value),
                        _ => value,
                    };
                    Some((key, value))
                })
                .collect(),
        ),
        other => other,
    }
}

/// Relation paths to load, as a tree of property names.
#[derive(Debug, Default)]
struct PopulateTree {
    children: BTreeMap<String, PopulateTree>,
}

impl PopulateTree {
    fn build(schema: &Schema, meta: &EntityMeta, populate: &Populate) -> Result<Self, CrudError> {
        let mut tree = Self::default();
        match populate {
            Populate::None => {}
            Populate::All => {
                for property in meta.relations() {
                    tree.children.insert(property.name.clone(), Self::default());
                }
            }
            Populate::Paths(paths) => {
                for path in paths {
                    let mut node = &mut tree;
                    let mut current = meta;
                    for segment in path.split('.') {
                        let target = current
                            .get(segment)
                            .and_then(|p| p.kind.target())
                            .ok_or_else(|| {
                                CrudError::validation(format!(
                                    "cannot populate '{path}': '{segment}' is not a relation of '{}'",
                                    current.name
                                ))
                            })?;
                        current = schema.get(target)?;
                        node = node.children.entry(segment.to_string()).or_default();
                    }
                }
            }
        }
        Ok(tree)
    }
}

fn is_key(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Object(_) | Value::Array(_))
}

fn push_unique(keys: &mut Vec<Value>, key: Value) {
    if !keys.iter().any(|k| values_equal(k, &key)) {
        keys.push(key);
    }
}

/// Coerce a filter operand (or every item of an `$in` list) to the type of `field`.
fn coerce_operand(meta: &EntityMeta, field: &str, op: Operator, value: &Value) -> Value {
    match (op, value) {
        (Operator::Like, v) => v.clone(),
        (_, Value::Array(items)) => Value::Array(
            items
                .iter()
                .map(|item| meta.coerce(field, item.clone()))
                .collect(),
        ),
        (_, v) => meta.coerce(field, v.clone()),
    }
}

fn join_row(column: &str, value: Value) -> Row {
    let mut row = Row::new();
    row.insert(column.to_string(), value);
    row
}

/// Borrowed transaction plus schema, the working context of one flush or query.
struct Scope<'t> {
    schema: Arc<Schema>,
    txn: &'t mut Box<dyn Transaction>,
}

impl<'t> Scope<'t> {
    fn new(schema: &Arc<Schema>, txn: &'t mut Box<dyn Transaction>) -> Self {
        Self {
            schema: Arc::clone(schema),
            txn,
        }
    }

    fn target(&self, kind: &PropertyKind) -> Result<Arc<EntityMeta>, CrudError> {
        let name = kind
            .target()
            .ok_or_else(|| CrudError::internal("scalar property has no target", None))?;
        self.schema.get(name).map(Arc::clone)
    }

    /// Join column on `target` behind its `mapped_by` property.
    fn mapped_column(target: &EntityMeta, mapped_by: &str) -> Result<String, CrudError> {
        target
            .get(mapped_by)
            .and_then(|p| p.kind.join_column())
            .map(str::to_string)
            .ok_or_else(|| {
                CrudError::validation(format!(
                    "'{}.{mapped_by}' is not an owning relation",
                    target.name
                ))
            })
    }

    /// Convert a stored row into the entity shape.
    fn hydrate(meta: &EntityMeta, mut row: Row) -> Row {
        let mut entity = Row::new();
        for property in &meta.properties {
            match &property.kind {
                PropertyKind::Scalar(ty) => {
                    if let Some(value) = row.remove(&property.name) {
                        entity.insert(property.name.clone(), ty.from_storage(value));
                    }
                }
                kind => {
                    if let Some(column) = kind.join_column() {
                        let value = row.remove(column).unwrap_or(Value::Null);
                        entity.insert(property.name.clone(), value);
                    }
                }
            }
        }
        entity
    }

    async fn select_entities(
        &mut self,
        meta: &EntityMeta,
        filter: &Filter,
        page: &Page,
    ) -> Result<Vec<Row>, CrudError> {
        let rows = self.txn.select(&meta.table_def(), filter, page).await?;
        Ok(rows.into_iter().map(|row| Self::hydrate(meta, row)).collect())
    }

    async fn column_values(
        &mut self,
        table: &TableDef,
        filter: &Filter,
        column: &str,
    ) -> Result<Vec<Value>, CrudError> {
        let rows = self.txn.select(table, filter, &Page::default()).await?;
        let mut values = Vec::with_capacity(rows.len());
        for mut row in rows {
            if let Some(value) = row.remove(column).filter(|v| !v.is_null()) {
                push_unique(&mut values, value);
            }
        }
        Ok(values)
    }

    /// Rewrite an entity-level filter into columns of `meta`'s table. Relation
    /// paths become `IN` lists of keys found by sub-queries.
    fn resolve<'s>(
        &'s mut self,
        meta: &'s EntityMeta,
        filter: &'s Filter,
    ) -> BoxFuture<'s, Result<Filter, CrudError>> {
        Box::pin(async move {
            Ok(match filter {
                Filter::All => Filter::All,
                Filter::And(parts) | Filter::Or(parts) => {
                    let mut resolved = Vec::with_capacity(parts.len());
                    for part in parts {
                        resolved.push(self.resolve(meta, part).await?);
                    }
                    if matches!(filter, Filter::And(_)) {
                        Filter::And(resolved)
                    } else {
                        Filter::Or(resolved)
                    }
                }
                Filter::Not(inner) => Filter::Not(Box::new(self.resolve(meta, inner).await?)),
                Filter::Compare { field, op, value } => {
                    self.resolve_compare(meta, field, *op, value).await?
                }
            })
        })
    }

    async fn resolve_compare(
        &mut self,
        meta: &EntityMeta,
        field: &str,
        op: Operator,
        value: &Value,
    ) -> Result<Filter, CrudError> {
        let (head, rest) = match field.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (field, None),
        };
        let property = meta.get(head).ok_or_else(|| {
            CrudError::validation(format!("unknown property '{head}' on '{}'", meta.name))
        })?;
        if property.is_scalar() {
            if rest.is_some() {
                return Err(CrudError::validation(format!(
                    "'{field}' goes through '{head}', which is not a relation"
                )));
            }
            return Ok(Filter::compare(head, op, coerce_operand(meta, head, op, value)));
        }

        let target = self.target(&property.kind)?;
        let target_pk = target.primary_key_name().to_string();
        if let (Some(column), None) = (property.kind.join_column(), rest) {
            let operand = coerce_operand(&target, &target_pk, op, value);
            return Ok(Filter::compare(column, op, operand));
        }

        let inner = Filter::compare(rest.unwrap_or(&target_pk), op, value.clone());
        let inner = self.resolve(&target, &inner).await?;
        let target_table = target.table_def();
        let own_pk = meta.primary_key_name().to_string();
        let filter = match &property.kind {
            PropertyKind::ManyToOne { join_column, .. } | PropertyKind::OneToOne { join_column, .. } => {
                let keys = self.column_values(&target_table, &inner, &target_pk).await?;
                Filter::is_in(join_column.as_str(), keys)
            }
            PropertyKind::OneToMany { mapped_by, .. }
            | PropertyKind::OneToOneInverse { mapped_by, .. } => {
                let column = Self::mapped_column(&target, mapped_by)?;
                let keys = self.column_values(&target_table, &inner, &column).await?;
                Filter::is_in(own_pk, keys)
            }
            PropertyKind::ManyToMany {
                pivot_table,
                join_column,
                inverse_join_column,
                ..
            } => {
                let related = self.column_values(&target_table, &inner, &target_pk).await?;
                let pivot = TableDef::pivot(pivot_table, join_column, inverse_join_column);
                let pivot_filter = Filter::is_in(inverse_join_column.as_str(), related);
                let keys = self.column_values(&pivot, &pivot_filter, join_column).await?;
                Filter::is_in(own_pk, keys)
            }
            PropertyKind::Scalar(_) => Filter::compare(head, op, value.clone()),
        };
        Ok(filter)
    }

    /// Load the relations named by `plan` into `entities`.
    fn populate<'s>(
        &'s mut self,
        meta: &'s EntityMeta,
        entities: &'s mut [Row],
        plan: &'s PopulateTree,
    ) -> BoxFuture<'s, Result<(), CrudError>> {
        Box::pin(async move {
            if entities.is_empty() {
                return Ok(());
            }
            let own_pk = meta.primary_key_name().to_string();
            let own_keys: Vec<Value> = entities
                .iter()
                .filter_map(|e| e.get(&own_pk).cloned())
                .collect();

            for (name, subtree) in &plan.children {
                let Some(property) = meta.get(name) else {
                    continue;
                };
                let target = self.target(&property.kind)?;
                let target_pk = target.primary_key_name().to_string();
                let by_key = Page {
                    order_by: vec![(target_pk.clone(), SortOrder::Asc)],
                    ..Page::default()
                };

                match &property.kind {
                    PropertyKind::ManyToOne { .. } | PropertyKind::OneToOne { .. } => {
                        let mut keys = Vec::new();
                        for value in entities.iter().filter_map(|e| e.get(name)) {
                            if is_key(value) {
                                push_unique(&mut keys, value.clone());
                            }
                        }
                        if keys.is_empty() {
                            continue;
                        }
                        let filter = Filter::is_in(target_pk.as_str(), keys);
                        let mut related = self.select_entities(&target, &filter, &by_key).await?;
                        self.populate(&target, &mut related, subtree).await?;
                        for entity in entities.iter_mut() {
                            let Some(key) = entity.get(name).filter(|v| is_key(v)).cloned() else {
                                continue;
                            };
                            let found = related
                                .iter()
                                .find(|r| r.get(&target_pk).is_some_and(|k| values_equal(k, &key)));
                            if let Some(found) = found {
                                entity.insert(name.clone(), Value::Object(found.clone()));
                            }
                        }
                    }
                    PropertyKind::OneToMany { mapped_by, .. }
                    | PropertyKind::OneToOneInverse { mapped_by, .. } => {
                        let column = Self::mapped_column(&target, mapped_by)?;
                        let filter = Filter::is_in(column.as_str(), own_keys.clone());
                        let mut related = self.select_entities(&target, &filter, &by_key).await?;
                        self.populate(&target, &mut related, subtree).await?;
                        let many = property.kind.is_to_many();
                        for entity in entities.iter_mut() {
                            let key = entity.get(&own_pk).cloned().unwrap_or(Value::Null);
                            let mut children = related.iter().filter(|r| {
                                r.get(mapped_by).is_some_and(|k| values_equal(k, &key))
                            });
                            let value = if many {
                                Value::Array(children.map(|c| Value::Object(c.clone())).collect())
                            } else {
                                children.next().map_or(Value::Null, |c| Value::Object(c.clone()))
                            };
                            entity.insert(name.clone(), value);
                        }
                    }
                    PropertyKind::ManyToMany {
                        pivot_table,
                        join_column,
                        inverse_join_column,
                        ..
                    } => {
                        let pivot = TableDef::pivot(pivot_table, join_column, inverse_join_column);
                        let links = self
                            .txn
                            .select(
                                &pivot,
                                &Filter::is_in(join_column.as_str(), own_keys.clone()),
                                &Page::default(),
                            )
                            .await?;
                        let mut keys = Vec::new();
                        for link in &links {
                            if let Some(key) = link.get(inverse_join_column) {
                                push_unique(&mut keys, key.clone());
                            }
                        }
                        let filter = Filter::is_in(target_pk.as_str(), keys);
                        let mut related = self.select_entities(&target, &filter, &by_key).await?;
                        self.populate(&target, &mut related, subtree).await?;
                        for entity in entities.iter_mut() {
                            let key = entity.get(&own_pk).cloned().unwrap_or(Value::Null);
                            let linked: Vec<&Value> = links
                                .iter()
                                .filter(|l| l.get(join_column).is_some_and(|k| values_equal(k, &key)))
                                .filter_map(|l| l.get(inverse_join_column))
                                .collect();
                            let items = related
                                .iter()
                                .filter(|r| {
                                    r.get(&target_pk)
                                        .is_some_and(|k| linked.iter().any(|l| values_equal(k, l)))
                                })
                                .map(|r| Value::Object(r.clone()))
                                .collect();
                            entity.insert(name.clone(), Value::Array(items));
                        }
                    }
                    PropertyKind::Scalar(_) => {}
                }
            }
            Ok(())
        })
    }

    /// Insert or update `entity` and cascade into the relations it carries.
    fn save<'s>(
        &'s mut self,
        meta: &'s EntityMeta,
        entity: &'s mut Row,
    ) -> BoxFuture<'s, Result<(), CrudError>> {
        Box::pin(async move {
            let table = meta.table_def();
            let mut row = Row::new();

            for property in meta.relations() {
                let Some(column) = property.kind.join_column() else {
                    continue;
                };
                let Some(value) = entity.get_mut(&property.name) else {
                    continue;
                };
                let target = self.target(&property.kind)?;
                let target_pk = target.primary_key_name();
                let key = match value {
                    Value::Null => Value::Null,
                    Value::Object(related) => {
                        self.save(&target, related).await?;
                        related.get(target_pk).cloned().unwrap_or(Value::Null)
                    }
                    key => target.coerce(target_pk, key.clone()),
                };
                row.insert(column.to_string(), key);
            }
            for property in meta.scalars() {
                if let (Some(value), PropertyKind::Scalar(ty)) =
                    (entity.get(&property.name), &property.kind)
                {
                    row.insert(property.name.clone(), ty.to_storage(value.clone()));
                }
            }

            let existing = match meta.key_of(&row) {
                Some(key) => {
                    let found = self.txn.count(&table, &Filter::matching(&key)).await?;
                    (found > 0).then_some(key)
                }
                None => None,
            };

            if let Some(key) = existing {
                for property in meta.scalars() {
                    if let Some(generated) = property.on_update {
                        let value = generated.produce();
                        entity.insert(property.name.clone(), value.clone());
                        row.insert(property.name.clone(), value);
                    }
                }
                for pk in &meta.primary_keys {
                    row.remove(pk);
                }
                self.txn.update(&table, &Filter::matching(&key), row).await?;
            } else {
                for property in meta.scalars() {
                    let missing = row.get(&property.name).is_none_or(Value::is_null);
                    if let (Some(generated), true) = (property.on_create, missing) {
                        let value = generated.produce();
                        entity.insert(property.name.clone(), value.clone());
                        row.insert(property.name.clone(), value);
                    }
                }
                for pk in &meta.primary_keys {
                    if !row.get(pk).is_none_or(Value::is_null) {
                        continue;
                    }
                    match meta.key_generation {
                        KeyGeneration::Uuid => {
                            row.insert(pk.clone(), Value::String(uuid::Uuid::new_v4().to_string()));
                        }
                        KeyGeneration::Increment => {
                            row.remove(pk);
                        }
                        KeyGeneration::Manual => {
                            return Err(CrudError::validation(format!(
                                "'{}' needs a value for '{pk}'",
                                meta.name
                            )));
                        }
                    }
                }
                let stored = self.txn.insert(&table, row).await?;
                for pk in &meta.primary_keys {
                    if let Some(value) = stored.get(pk) {
                        entity.insert(pk.clone(), value.clone());
                    }
                }
            }

            let own_key = entity
                .get(meta.primary_key_name())
                .cloned()
                .unwrap_or(Value::Null);
            for property in meta.relations() {
                match &property.kind {
                    PropertyKind::OneToOneInverse { mapped_by, .. } => {
                        let Some(value) = entity.get_mut(&property.name) else {
                            continue;
                        };
                        self.save_inverse_one(&property.kind, mapped_by, &own_key, value)
                            .await?;
                    }
                    PropertyKind::OneToMany {
                        mapped_by,
                        orphan_removal,
                        ..
                    } => {
                        let Some(Value::Array(items)) = entity.get_mut(&property.name) else {
                            continue;
                        };
                        self.save_children(&property.kind, mapped_by, *orphan_removal, &own_key, items)
                            .await?;
                    }
                    PropertyKind::ManyToMany {
                        pivot_table,
                        join_column,
                        inverse_join_column,
                        ..
                    } => {
                        let Some(Value::Array(items)) = entity.get_mut(&property.name) else {
                            continue;
                        };
                        let target = self.target(&property.kind)?;
                        let target_pk = target.primary_key_name();
                        let mut keys = Vec::with_capacity(items.len());
                        for item in items.iter_mut() {
                            let key = match item {
                                Value::Object(related) => {
                                    self.save(&target, related).await?;
                                    related.get(target_pk).cloned().unwrap_or(Value::Null)
                                }
                                key => target.coerce(target_pk, key.clone()),
                            };
                            push_unique(&mut keys, key);
                        }
                        let pivot = TableDef::pivot(pivot_table, join_column, inverse_join_column);
                        self.txn
                            .delete(&pivot, &Filter::eq(join_column.as_str(), own_key.clone()))
                            .await?;
                        for key in keys {
                            let mut link = join_row(join_column, own_key.clone());
                            link.insert(inverse_join_column.clone(), key);
                            self.txn.insert(&pivot, link).await?;
                        }
                    }
                    _ => {}
                }
            }
            Ok(())
        })
    }

    async fn save_inverse_one(
        &mut self,
        kind: &PropertyKind,
        mapped_by: &str,
        own_key: &Value,
        value: &mut Value,
    ) -> Result<(), CrudError> {
        let target = self.target(kind)?;
        let target_pk = target.primary_key_name().to_string();
        let target_table = target.table_def();
        let column = Self::mapped_column(&target, mapped_by)?;

        let keep = match value {
            Value::Null => None,
            Value::Object(related) => {
                related.insert(mapped_by.to_string(), own_key.clone());
                self.save(&target, related).await?;
                related.get(&target_pk).cloned()
            }
            key => {
                let key = target.coerce(&target_pk, key.clone());
                self.txn
                    .update(
                        &target_table,
                        &Filter::eq(target_pk.as_str(), key.clone()),
                        join_row(&column, own_key.clone()),
                    )
                    .await?;
                Some(key)
            }
        };
        let mut previous = vec![Filter::eq(column.as_str(), own_key.clone())];
        if let Some(keep) = keep {
            previous.push(Filter::compare(target_pk.as_str(), Operator::Ne, keep));
        }
        self.txn
            .update(&target_table, &Filter::And(previous), join_row(&column, Value::Null))
            .await?;
        Ok(())
    }

    /// Make the children of a one-to-many exactly `items`; children left out
    /// are detached, or deleted under orphan removal.
    async fn save_children(
        &mut self,
        kind: &PropertyKind,
        mapped_by: &str,
        orphan_removal: bool,
        own_key: &Value,
        items: &mut [Value],
    ) -> Result<(), CrudError> {
        let target = self.target(kind)?;
        let target_pk = target.primary_key_name().to_string();
        let target_table = target.table_def();
        let column = Self::mapped_column(&target, mapped_by)?;

        let mut kept = Vec::with_capacity(items.len());
        for item in items.iter_mut() {
            match item {
                Value::Object(child) => {
                    child.insert(mapped_by.to_string(), own_key.clone());
                    self.save(&target, child).await?;
                    if let Some(key) = child.get(&target_pk) {
                        kept.push(key.clone());
                    }
                }
                key => {
                    let key = target.coerce(&target_pk, key.clone());
                    self.txn
                        .update(
                            &target_table,
                            &Filter::eq(target_pk.as_str(), key.clone()),
                            join_row(&column, own_key.clone()),
                        )
                        .await?;
                    kept.push(key);
                }
            }
        }

        let stale = Filter::And(vec![
            Filter::eq(column.as_str(), own_key.clone()),
            Filter::Not(Box::new(Filter::is_in(target_pk.as_str(), kept))),
        ]);
        if orphan_removal {
            let orphans = self.select_entities(&target, &stale, &Page::default()).await?;
            for orphan in &orphans {
                self.delete(&target, orphan).await?;
            }
        } else {
            self.txn
                .update(&target_table, &stale, join_row(&column, Value::Null))
                .await?;
        }
        Ok(())
    }

    /// Delete `entity`, detaching or deleting what depends on it.
    fn delete<'s>(
        &'s mut self,
        meta: &'s EntityMeta,
        entity: &'s Row,
    ) -> BoxFuture<'s, Result<(), CrudError>> {
        Box::pin(async move {
            let Some(key) = meta.key_of(entity) else {
                return Ok(());
            };
            let own_key = entity
                .get(meta.primary_key_name())
                .cloned()
                .unwrap_or(Value::Null);

            for property in meta.relations() {
                match &property.kind {
                    PropertyKind::OneToMany {
                        mapped_by,
                        orphan_removal: true,
                        ..
                    } => {
                        let target = self.target(&property.kind)?;
                        let column = Self::mapped_column(&target, mapped_by)?;
                        let filter = Filter::eq(column.as_str(), own_key.clone());
                        let children = self.select_entities(&target, &filter, &Page::default()).await?;
                        for child in &children {
                            self.delete(&target, child).await?;
                        }
                    }
                    PropertyKind::OneToMany { mapped_by, .. }
                    | PropertyKind::OneToOneInverse { mapped_by, .. } => {
                        let target = self.target(&property.kind)?;
                        let column = Self::mapped_column(&target, mapped_by)?;
                        self.txn
                            .update(
                                &target.table_def(),
                                &Filter::eq(column.as_str(), own_key.clone()),
                                join_row(&column, Value::Null),
                            )
                            .await?;
                    }
                    PropertyKind::ManyToMany {
                        pivot_table,
                        join_column,
                        inverse_join_column,
                        ..
                    } => {
                        let pivot = TableDef::pivot(pivot_table, join_column, inverse_join_column);
                        self.txn
                            .delete(&pivot, &Filter::eq(join_column.as_str(), own_key.clone()))
                            .await?;
                    }
                    _ => {}
                }
            }

            // Pivot rows owned by other entities that point at this one.
            let inverse_pivots: Vec<TableDef> = self
                .schema
                .entities()
                .flat_map(|other| other.relations())
                .filter_map(|property| match &property.kind {
                    PropertyKind::ManyToMany {
                        target,
                        pivot_table,
                        join_column,
                        inverse_join_column,
                    } if *target == meta.name => Some(TableDef::pivot(
                        pivot_table,
                        join_column,
                        inverse_join_column,
                    )),
                    _ => None,
                })
                .collect();
            for pivot in inverse_pivots {
                let inverse_column = pivot.primary_keys[1].clone();
                self.txn
                    .delete(&pivot, &Filter::eq(inverse_column, own_key.clone()))
                    .await?;
            }

            self.txn.delete(&meta.table_def(), &Filter::matching(&key)).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orm::memory::MemoryDriver;
    use crate::orm::meta::{Generated, PropertyMeta, ScalarType};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new()
            .with(
                EntityMeta::new("Author", "authors")
                    .primary_key("id", ScalarType::Integer)
                    .key_generation(KeyGeneration::Increment)
                    .scalar("name", ScalarType::Text)
                    .property(PropertyMeta::scalar("password", ScalarType::Text).hidden())
                    .one_to_many("posts", "Post", "author"),
            )
            .with(
                EntityMeta::new("Post", "posts")
                    .primary_key("id", ScalarType::Integer)
                    .key_generation(KeyGeneration::Increment)
                    .scalar("title", ScalarType::Text)
                    .property(
                        PropertyMeta::scalar("created_at", ScalarType::DateTime)
                            .on_create(Generated::Now),
                    )
                    .many_to_one("author", "Author")
                    .one_to_many_owned("comments", "Comment", "post")
                    .many_to_many("tags", "Tag", "post_tags"),
            )
            .with(
                EntityMeta::new("Comment", "comments")
                    .primary_key("id", ScalarType::Integer)
                    .key_generation(KeyGeneration::Increment)
                    .scalar("body", ScalarType::Text)
                    .many_to_one("post", "Post"),
            )
            .with(
                EntityMeta::new("Tag", "tags")
                    .primary_key("id", ScalarType::Uuid)
                    .property(PropertyMeta::scalar("label", ScalarType::Text).unique()),
            )
    }

    fn manager() -> (EntityManager, MemoryDriver) {
        let driver = MemoryDriver::new();
        let em = EntityManager::new(schema(), driver.clone()).unwrap();
        (em, driver)
    }

    #[tokio::test]
    async fn test_persist_cascades_new_relations() {
        let (em, driver) = manager();
        let post = em
            .create(
                "Post",
                json!({
                    "title": "Hello",
                    "author": {"name": "ann"},
                    "comments": [{"body": "first"}],
                    "tags": [{"label": "rust"}]
                }),
            )
            .unwrap();
        em.persist("Post", post).await.unwrap();
        let saved = em.flush().await.unwrap();
        em.commit().await.unwrap();

        let post = &saved[0];
        assert_eq!(post["id"], json!(1));
        assert_eq!(post["author"]["id"], json!(1));
        assert!(post["created_at"].is_string());
        assert_eq!(driver.rows("comments").await[0]["post_id"], json!(1));
        assert_eq!(driver.rows("post_tags").await.len(), 1);
    }

    #[tokio::test]
    async fn test_populate_and_relation_filter() {
        let (em, _) = manager();
        let post = json!({"title": "Hello", "author": {"name": "ann"}, "tags": [{"label": "rust"}]});
        em.persist("Post", post).await.unwrap();
        em.persist("Post", json!({"title": "Other", "author": {"name": "bob"}}))
            .await
            .unwrap();
        em.flush().await.unwrap();

        let options = FindOptions::default().populate(Populate::Paths(vec![
            "author".to_string(),
            "tags".to_string(),
        ]));
        let found = em
            .find("Post", &json!({"author": {"name": "ann"}}), &options)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["author"]["name"], json!("ann"));
        assert_eq!(found[0]["tags"][0]["label"], json!("rust"));

        let tagged = em
            .count("Post", &json!({"tags.label": {"$in": ["rust"]}}))
            .await
            .unwrap();
        assert_eq!(tagged, 1);
        em.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_unpopulated_relation_holds_key() {
        let (em, _) = manager();
        em.persist("Post", json!({"title": "x", "author": {"name": "ann"}}))
            .await
            .unwrap();
        em.flush().await.unwrap();
        let post = em
            .find_one("Post", &json!({"id": "1"}), &FindOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(post["author"], json!(1));
        assert!(post.get("comments").is_none());
    }

    #[tokio::test]
    async fn test_removal_cleans_children_and_pivots() {
        let (em, driver) = manager();
        em.persist(
            "Post",
            json!({"title": "x", "comments": [{"body": "a"}], "tags": [{"label": "t"}]}),
        )
        .await
        .unwrap();
        let saved = em.flush().await.unwrap();
        em.remove("Post", saved[0].clone()).await.unwrap();
        em.commit().await.unwrap();

        assert!(driver.rows("posts").await.is_empty());
        assert!(driver.rows("comments").await.is_empty());
        assert!(driver.rows("post_tags").await.is_empty());
        assert_eq!(driver.rows("tags").await.len(), 1);
    }

    #[tokio::test]
    async fn test_to_json_strips_hidden_in_relations() {
        let (em, _) = manager();
        let post = json!({"title": "x", "author": {"name": "ann", "password": "secret"}});
        let json = em.to_json("Post", post);
        assert_eq!(json["author"], json!({"name": "ann"}));
    }

    #[tokio::test]
    async fn test_find_rejects_unknown_property_and_sort() {
        let (em, _) = manager();
        assert!(em
            .find("Post", &json!({"nope": 1}), &FindOptions::default())
            .await
            .is_err());
        let options = FindOptions {
            order_by: vec![("author".to_string(), SortOrder::Asc)],
            ..FindOptions::default()
        };
        assert!(em.find("Post", &json!({}), &options).await.is_err());
    }

    #[test]
    fn test_populate_serde_forms() {
        let all: Populate = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(all, Populate::All);
        let paths: Populate = serde_json::from_value(json!(["author"])).unwrap();
        assert_eq!(paths, Populate::Paths(vec!["author".to_string()]));
        assert_eq!(serde_json::to_value(Populate::None).unwrap(), json!(false));
    }
}
