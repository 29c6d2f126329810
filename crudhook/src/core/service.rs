//! Search, get, create, update and delete with their lifecycle hooks.
//!
//! Every operation forks its own entity manager and runs inside one
//! transaction. Success goes through `BEFORE_COMMIT`, commit and
//! `AFTER_COMMIT`; any error goes through `BEFORE_ROLLBACK`, upload cleanup
//! (create and update), rollback and `AFTER_ROLLBACK`, then is returned.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::args::CrudArgs;
use crate::core::options::CrudOptions;
use crate::core::request::{RequestData, UploadedFile};
use crate::errors::CrudError;
use crate::hooks::{CrudHook, CrudParam, HookRegistry, is_meaningful};
use crate::orm::{EntityManager, EntityMeta, FindOptions, Populate, SortOrder, assign_entity};
use crate::storage::{LocalDiskStore, discard_uploads};

/// Response of a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub items: Vec<Value>,
    /// Matches ignoring offset and limit
    pub count: u64,
    /// Window the items were selected with
    #[serde(skip)]
    pub offset: u64,
    #[serde(skip)]
    pub limit: Option<u64>,
}

/// Runs the CRUD operations of one resource.
pub struct CrudService {
    options: CrudOptions,
    registry: Arc<HookRegistry>,
    em: EntityManager,
    meta: Arc<EntityMeta>,
    primary_keys: Vec<String>,
}

impl std::fmt::Debug for CrudService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrudService")
            .field("options", &self.options)
            .field("primary_keys", &self.primary_keys)
            .finish_non_exhaustive()
    }
}

impl CrudService {
    /// `em` is the application's root manager; each operation forks it.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the entity is not in the schema or a
    /// configured primary key is not one of its properties.
    pub fn new(
        options: CrudOptions,
        registry: Arc<HookRegistry>,
        em: &EntityManager,
    ) -> Result<Self, CrudError> {
        let meta = em.meta(&options.entity)?;
        let primary_keys = options
            .primary_keys
            .clone()
            .unwrap_or_else(|| meta.primary_keys.clone());
        if let Some(unknown) = primary_keys.iter().find(|pk| meta.get(pk).is_none()) {
            return Err(CrudError::validation(format!(
                "'{unknown}' is not a property of '{}'",
                meta.name
            )));
        }
        Ok(Self {
            options,
            registry,
            em: em.fork(),
            meta,
            primary_keys,
        })
    }

    #[must_use]
    pub fn options(&self) -> &CrudOptions {
        &self.options
    }

    #[must_use]
    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    async fn open(&self, request: RequestData) -> Result<CrudArgs, CrudError> {
        let em = Arc::new(self.em.fork());
        em.begin().await?;
        Ok(CrudArgs::new(
            Arc::clone(&self.registry),
            self.options.name.clone(),
            em,
            self.primary_keys.clone(),
            request,
        ))
    }

    /// # Errors
    ///
    /// Returns hook errors, validation errors for bad filters or sort
    /// columns, and database errors.
    pub async fn search(&self, request: RequestData) -> Result<SearchResult, CrudError> {
        let mut args = self.open(request).await?;
        let options = self.search_options(&args);
        args.options = options;
        let outcome = self.run_search(&mut args).await;
        self.settle(&args, outcome, false).await
    }

    fn search_options(&self, args: &CrudArgs) -> FindOptions {
        let query = &args.request.query;
        let (offset, limit) = self.options.defaults.window(query);
        let order_by = match query.sort.as_deref().filter(|s| !s.is_empty()) {
            Some(sort) => vec![(
                sort.to_string(),
                SortOrder::parse(query.order.as_deref().unwrap_or_default()),
            )],
            None => vec![(self.meta.primary_key_name().to_string(), SortOrder::Desc)],
        };
        FindOptions {
            populate: self.options.search_populate(),
            order_by,
            offset,
            limit,
        }
    }

    async fn run_search(&self, args: &mut CrudArgs) -> Result<SearchResult, CrudError> {
        let query = &args.request.query;
        let appendix = query.appendix(&self.options.filter);
        args.filter = query.to_filter(&self.options.filter, appendix);

        args.exec(CrudHook::SearchQuery, CrudParam::Filter).await?;
        args.exec(CrudHook::BeforeSearch, CrudParam::Filter).await?;

        let (items, count) = args
            .em
            .find_and_count(&self.meta.name, &args.filter, &args.options)
            .await?;
        let items = Value::Array(items);
        args.set_entity(items.clone());
        let items = match args.call(CrudHook::AfterSearch, items).await? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        self.commit(args, None).await?;
        Ok(SearchResult {
            items: items
                .into_iter()
                .map(|item| args.em.to_json(&self.meta.name, item))
                .collect(),
            count,
            offset: args.options.offset,
            limit: args.options.limit,
        })
    }

    /// # Errors
    ///
    /// Returns [`CrudError::NotFound`] when nothing matches, plus hook and
    /// database errors.
    pub async fn get(&self, request: RequestData) -> Result<Value, CrudError> {
        let mut args = self.open(request).await?.with_options(FindOptions {
            populate: self.options.populate.for_get(),
            ..FindOptions::default()
        });
        let outcome = self.run_get(&mut args).await;
        self.settle(&args, outcome, false).await
    }

    async fn run_get(&self, args: &mut CrudArgs) -> Result<Value, CrudError> {
        args.exec(CrudHook::GetQuery, CrudParam::Filter).await?;
        self.merge_keys(args);
        args.exec(CrudHook::BeforeGet, CrudParam::Filter).await?;
        args.exec(CrudHook::BeforeView, CrudParam::Filter).await?;

        let entity = args
            .em
            .find_one(&self.meta.name, &args.filter, &args.options)
            .await?
            .ok_or_else(|| self.not_found(args))?;

        args.set_entity(entity);
        args.exec(CrudHook::AfterGet, CrudParam::Entity).await?;
        self.commit(args, Some(CrudParam::Entity)).await?;

        let entity = args.entity().cloned().unwrap_or(Value::Null);
        let mut view = Map::new();
        view.insert(self.options.name.clone(), args.em.to_json(&self.meta.name, entity));
        args.call(CrudHook::AfterView, Value::Object(view)).await
    }

    /// Create one entity from `body[name]`, or one per element of an array
    /// body, unless a `BEFORE_CREATE`/`BEFORE_UPSERT` hook supplied them.
    /// Returns the primary keys: one value per key for a single entity, an
    /// array per key otherwise.
    ///
    /// # Errors
    ///
    /// Returns validation errors for malformed bodies, conflicts for unique
    /// violations, plus hook and database errors.
    pub async fn create(&self, request: RequestData) -> Result<Value, CrudError> {
        let mut args = self.open(request).await?.with_options(FindOptions {
            populate: Populate::All,
            ..FindOptions::default()
        });
        let outcome = self.run_create(&mut args).await;
        self.settle(&args, outcome, true).await
    }

    async fn run_create(&self, args: &mut CrudArgs) -> Result<Value, CrudError> {
        args.exec(CrudHook::BeforeCreate, CrudParam::Entities).await?;
        args.exec(CrudHook::BeforeUpsert, CrudParam::Entities).await?;

        let mut entities = args.entities();
        if entities.is_empty() {
            let entity = &self.meta.name;
            entities = match &args.request.body {
                Value::Array(items) => items
                    .iter()
                    .map(|item| args.em.create(entity, item.clone()))
                    .collect::<Result<_, _>>()?,
                body => {
                    let data = body.get(&self.options.name).cloned().unwrap_or(Value::Null);
                    vec![args.em.create(entity, data)?]
                }
            };
        }

        args.set_entity(Value::Array(entities));
        args.exec(CrudHook::AfterCreate, CrudParam::Entities).await?;
        args.exec(CrudHook::AfterUpsert, CrudParam::Entities).await?;
        args.exec(CrudHook::BeforeFlush, CrudParam::Entities).await?;

        for entity in args.entities() {
            let entity = args.call(CrudHook::BeforePersist, entity).await?;
            let index = args.em.persist(&self.meta.name, entity.clone()).await?;
            let after = args.call(CrudHook::AfterPersist, entity.clone()).await?;
            if after != entity {
                args.em.replace_pending(index, after).await?;
            }
        }
        let saved = args.em.flush().await?;

        args.set_entity(Value::Array(saved));
        args.exec(CrudHook::AfterFlush, CrudParam::Entities).await?;

        let keys = self.created_keys(&args.entities());
        self.commit(args, None).await?;
        Ok(keys)
    }

    fn created_keys(&self, entities: &[Value]) -> Value {
        let key_of = |entity: &Value, pk: &str| entity.get(pk).cloned().unwrap_or(Value::Null);
        let keys = self.primary_keys.iter().map(|pk| {
            let value = match entities {
                [single] => key_of(single, pk),
                many => Value::Array(many.iter().map(|e| key_of(e, pk)).collect()),
            };
            (pk.clone(), value)
        });
        Value::Object(keys.collect())
    }

    /// Deep-assign `body[name]` onto the addressed entity and save it.
    ///
    /// # Errors
    ///
    /// Returns [`CrudError::NotFound`] when the entity does not exist, a
    /// validation error when the body does not wrap the entity under the
    /// resource name, plus hook and database errors.
    pub async fn update(&self, request: RequestData) -> Result<(), CrudError> {
        let mut args = self.open(request).await?.with_options(FindOptions {
            populate: Populate::All,
            ..FindOptions::default()
        });
        let outcome = self.run_update(&mut args).await;
        self.settle(&args, outcome, true).await
    }

    async fn run_update(&self, args: &mut CrudArgs) -> Result<(), CrudError> {
        let Some(found) = self.find_addressed(args).await? else {
            return Err(self.not_found(args));
        };

        args.call_request(CrudHook::BeforeUpdate).await?;
        let payload = args.call_request(CrudHook::BeforeUpsert).await?;

        let data = match payload.body.get(&self.options.name) {
            Some(data) if is_meaningful(data) => data.clone(),
            _ => {
                let present = match &payload.body {
                    Value::Object(body) => body.keys().cloned().collect::<Vec<_>>().join(", "),
                    _ => String::new(),
                };
                return Err(CrudError::validation(format!(
                    "CRUD Update Error: \"body\" does not have a \"{}\", \"body\" contains \"{present}\"",
                    self.options.name
                )));
            }
        };

        let Value::Object(mut entity) = found else {
            return Err(self.not_found(args));
        };
        assign_entity(&args.em, &self.meta.name, &mut entity, &data).await?;

        args.set_entity(Value::Object(entity));
        args.exec(CrudHook::AfterUpdate, CrudParam::Entity).await?;
        args.exec(CrudHook::AfterUpsert, CrudParam::Entity).await?;

        let entity = args.exec(CrudHook::BeforePersist, CrudParam::Entity).await?;
        let index = args.em.persist(&self.meta.name, entity.clone()).await?;
        let after = args.exec(CrudHook::AfterPersist, CrudParam::Entity).await?;
        if after != entity {
            args.em.replace_pending(index, after).await?;
        }

        args.exec(CrudHook::BeforeFlush, CrudParam::Entity).await?;
        if let Some(saved) = args.em.flush().await?.into_iter().next() {
            args.set_entity(saved);
        }
        args.exec(CrudHook::AfterFlush, CrudParam::Entity).await?;

        self.commit(args, None).await
    }

    /// Delete the addressed entity. Deleting an entity that does not exist
    /// succeeds unless the resource uses strict deletes.
    ///
    /// # Errors
    ///
    /// Returns hook and database errors, and [`CrudError::NotFound`] for a
    /// missing entity with strict deletes.
    pub async fn delete(&self, request: RequestData) -> Result<(), CrudError> {
        let mut args = self.open(request).await?.with_options(FindOptions {
            populate: Populate::All,
            ..FindOptions::default()
        });
        let outcome = self.run_delete(&mut args).await;
        self.settle(&args, outcome, false).await
    }

    async fn run_delete(&self, args: &mut CrudArgs) -> Result<(), CrudError> {
        match self.find_addressed(args).await? {
            Some(entity) => {
                args.set_entity(entity);
                let entity = args.exec(CrudHook::BeforeDelete, CrudParam::Entity).await?;
                args.em.remove(&self.meta.name, entity).await?;
                args.em.flush().await?;
                args.call(CrudHook::AfterDelete, Value::Null).await?;
            }
            None if self.options.strict_delete => return Err(self.not_found(args)),
            None => {
                tracing::debug!(resource = %self.options.name, "nothing to delete");
            }
        }
        self.commit(args, None).await
    }

    /// Find the entity addressed by the route: `GET_QUERY`, then the route's
    /// primary keys merged into the filter.
    async fn find_addressed(&self, args: &mut CrudArgs) -> Result<Option<Value>, CrudError> {
        args.exec(CrudHook::GetQuery, CrudParam::Filter).await?;
        self.merge_keys(args);
        args.em
            .find_one(&self.meta.name, &args.filter, &args.options)
            .await
    }

    fn merge_keys(&self, args: &mut CrudArgs) {
        let mut filter = match std::mem::take(&mut args.filter) {
            Value::Object(filter) => filter,
            _ => Map::new(),
        };
        for pk in &self.primary_keys {
            let value = args.request.params.get(pk).cloned().unwrap_or(Value::Null);
            filter.insert(pk.clone(), self.meta.coerce(pk, value));
        }
        args.filter = Value::Object(filter);
    }

    fn not_found(&self, args: &CrudArgs) -> CrudError {
        let key = self
            .primary_keys
            .iter()
            .filter_map(|pk| args.request.params.get(pk))
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/");
        CrudError::not_found(&self.options.name, (!key.is_empty()).then_some(key))
    }

    /// `BEFORE_COMMIT`, commit, `AFTER_COMMIT`. With a slot the hooks' results
    /// are stored in it.
    async fn commit(&self, args: &mut CrudArgs, slot: Option<CrudParam>) -> Result<(), CrudError> {
        match slot {
            Some(slot) => {
                args.exec(CrudHook::BeforeCommit, slot).await?;
                args.em.commit().await?;
                args.exec(CrudHook::AfterCommit, slot).await?;
            }
            None => {
                args.call(CrudHook::BeforeCommit, Value::Null).await?;
                args.em.commit().await?;
                args.call(CrudHook::AfterCommit, Value::Null).await?;
            }
        }
        Ok(())
    }

    /// Pass a success through, or run the rollback path and return the
    /// original error.
    async fn settle<T>(
        &self,
        args: &CrudArgs,
        outcome: Result<T, CrudError>,
        discard_files: bool,
    ) -> Result<T, CrudError> {
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        tracing::debug!(resource = %self.options.name, error = %err, "rolling back");

        if let Err(e) = args.call(CrudHook::BeforeRollback, Value::Null).await {
            tracing::warn!(resource = %self.options.name, error = %e, "before-rollback hook failed");
        }
        if discard_files {
            self.clean_up_uploads(&args.uploads()).await;
        }
        if args.em.is_in_transaction().await {
            if let Err(e) = args.em.rollback().await {
                tracing::warn!(resource = %self.options.name, error = %e, "rollback failed");
            }
        }
        if let Err(e) = args.call(CrudHook::AfterRollback, Value::Null).await {
            tracing::warn!(resource = %self.options.name, error = %e, "after-rollback hook failed");
        }
        Err(err)
    }

    /// Remove the request's uploads from the configured store, or from the
    /// working directory when none is configured.
    async fn clean_up_uploads(&self, files: &[UploadedFile]) {
        if files.is_empty() {
            return;
        }
        match &self.options.storage {
            Some(store) => discard_uploads(store.as_ref(), files).await,
            None => match LocalDiskStore::working_dir() {
                Ok(store) => discard_uploads(&store, files).await,
                Err(e) => {
                    tracing::warn!(resource = %self.options.name, error = %e, "uploads not cleaned up");
                }
            },
        }
    }
}
