use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::request::{RequestData, ResponseHandle, SearchQuery, UploadedFile};
use crate::errors::CrudError;
use crate::hooks::{CrudHook, CrudParam, HookRegistry, SlotSource, SlotValue, emit};
use crate::orm::{EntityManager, FindOptions};

/// The entity (or entities) an operation works on.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Subject {
    #[default]
    None,
    Single(Value),
    Many(Vec<Value>),
}

impl Subject {
    /// Arrays become `Many`, anything else `Single`.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(items) => Self::Many(items),
            Value::Null => Self::None,
            other => Self::Single(other),
        }
    }

    /// The single entity, or the first of many.
    #[must_use]
    pub fn entity(&self) -> Option<&Value> {
        match self {
            Self::None => None,
            Self::Single(entity) => Some(entity),
            Self::Many(entities) => entities.first(),
        }
    }

    #[must_use]
    pub fn entities(&self) -> Vec<Value> {
        match self {
            Self::None => Vec::new(),
            Self::Single(entity) => vec![entity.clone()],
            Self::Many(entities) => entities.clone(),
        }
    }
}

/// The parts of a request that `BEFORE_UPDATE` and `BEFORE_UPSERT` handlers
/// may replace as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub query: SearchQuery,
    #[serde(default)]
    pub body: Value,
}

/// Per-request state handed to hooks, one value per [`CrudParam`] slot.
pub struct CrudArgs {
    registry: Arc<HookRegistry>,
    resource: String,
    pub em: Arc<EntityManager>,
    pub keys: Vec<String>,
    pub request: RequestData,
    pub filter: Value,
    pub subject: Subject,
    pub options: FindOptions,
}

impl CrudArgs {
    #[must_use]
    pub fn new(
        registry: Arc<HookRegistry>,
        resource: impl Into<String>,
        em: Arc<EntityManager>,
        keys: Vec<String>,
        request: RequestData,
    ) -> Self {
        Self {
            registry,
            resource: resource.into(),
            em,
            keys,
            request,
            filter: Value::Object(Map::new()),
            subject: Subject::None,
            options: FindOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: FindOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Dispatch `hook` with the whole bag. Returns the hooks' result, or
    /// `default` when none produced one. Nothing is written back.
    ///
    /// # Errors
    ///
    /// Returns the first hook error.
    pub async fn call(&self, hook: CrudHook, default: Value) -> Result<Value, CrudError> {
        let result = emit(&self.registry, &self.resource, hook, self).await?;
        Ok(result.unwrap_or(default))
    }

    /// Dispatch `hook` and store its result in `slot`. Returns the slot's
    /// value afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first hook error, or a validation error when the result
    /// does not fit the slot.
    pub async fn exec(&mut self, hook: CrudHook, slot: CrudParam) -> Result<Value, CrudError> {
        if let Some(result) = emit(&self.registry, &self.resource, hook, &*self).await? {
            self.set(slot, result)?;
        }
        Ok(self.get(slot))
    }

    /// Dispatch a hook that receives and may replace the request's params,
    /// query and body.
    ///
    /// # Errors
    ///
    /// Returns the first hook error, or a validation error when the result is
    /// not request data.
    pub async fn call_request(&mut self, hook: CrudHook) -> Result<RequestPayload, CrudError> {
        let current = RequestPayload {
            params: self.request.params.clone(),
            query: self.request.query.clone(),
            body: self.request.body.clone(),
        };
        let Some(result) = emit(&self.registry, &self.resource, hook, &*self).await? else {
            return Ok(current);
        };
        let payload: RequestPayload = serde_json::from_value(result)
            .map_err(|e| CrudError::validation(format!("{hook} returned invalid request data: {e}")))?;
        self.request.params.clone_from(&payload.params);
        self.request.query = payload.query.clone();
        self.request.body = payload.body.clone();
        Ok(payload)
    }

    /// Set `ENTITY`/`ENTITIES`: arrays fill both with the list and its first
    /// member, anything else is the single entity.
    pub fn set_entity(&mut self, value: Value) {
        self.subject = Subject::from_value(value);
    }

    #[must_use]
    pub fn entity(&self) -> Option<&Value> {
        self.subject.entity()
    }

    #[must_use]
    pub fn entities(&self) -> Vec<Value> {
        self.subject.entities()
    }

    /// JSON view of a slot.
    #[must_use]
    pub fn get(&self, slot: CrudParam) -> Value {
        self.slot(slot)
            .and_then(|value| value.to_json())
            .unwrap_or(Value::Null)
    }

    /// Replace a slot with a hook result.
    ///
    /// # Errors
    ///
    /// Fails for slots that hold handles (entity manager, request, response)
    /// and for values that do not deserialize into the slot's type.
    pub fn set(&mut self, slot: CrudParam, value: Value) -> Result<(), CrudError> {
        let invalid = |e: serde_json::Error| CrudError::validation(format!("invalid {slot}: {e}"));
        match slot {
            CrudParam::Keys => self.keys = serde_json::from_value(value).map_err(invalid)?,
            CrudParam::Query => self.request.query = serde_json::from_value(value).map_err(invalid)?,
            CrudParam::Params => self.request.params = serde_json::from_value(value).map_err(invalid)?,
            CrudParam::Body => self.request.body = value,
            CrudParam::Filter => self.filter = value,
            CrudParam::Entity => self.subject = Subject::Single(value),
            CrudParam::Entities => {
                self.subject = match value {
                    Value::Array(items) => Subject::Many(items),
                    single => Subject::Single(single),
                };
            }
            CrudParam::File => self.request.file = serde_json::from_value(value).map_err(invalid)?,
            CrudParam::Files => self.request.files = serde_json::from_value(value).map_err(invalid)?,
            CrudParam::Options => self.options = serde_json::from_value(value).map_err(invalid)?,
            CrudParam::EntityManager | CrudParam::Request | CrudParam::Response => {
                return Err(CrudError::validation(format!("the {slot} slot cannot be replaced")));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn response(&self) -> &ResponseHandle {
        &self.request.response
    }

    /// Every uploaded file of the request.
    #[must_use]
    pub fn uploads(&self) -> Vec<UploadedFile> {
        self.request.uploads().cloned().collect()
    }
}

impl SlotSource for CrudArgs {
    fn slot(&self, param: CrudParam) -> Option<SlotValue> {
        match param {
            CrudParam::EntityManager => Some(SlotValue::Session(Arc::clone(&self.em))),
            CrudParam::Keys => Some(SlotValue::Json(Value::Array(
                self.keys.iter().cloned().map(Value::String).collect(),
            ))),
            CrudParam::Request => self.request.request.clone().map(SlotValue::Request),
            CrudParam::Response => Some(SlotValue::Response(self.request.response.clone())),
            CrudParam::Query => Some(SlotValue::Query(self.request.query.clone())),
            CrudParam::Params => Some(SlotValue::Json(Value::Object(self.request.params.clone()))),
            CrudParam::Body => {
                (!self.request.body.is_null()).then(|| SlotValue::Json(self.request.body.clone()))
            }
            CrudParam::Filter => Some(SlotValue::Json(self.filter.clone())),
            CrudParam::Entity => self.entity().cloned().map(SlotValue::Json),
            CrudParam::Entities => match &self.subject {
                Subject::None => None,
                _ => Some(SlotValue::Json(Value::Array(self.entities()))),
            },
            CrudParam::File => self.request.file.clone().map(SlotValue::File),
            CrudParam::Files => {
                (!self.request.files.is_empty()).then(|| SlotValue::Files(self.request.files.clone()))
            }
            CrudParam::Options => Some(SlotValue::Options(self.options.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{FromSlot, ParamDecl, hook_fn};
    use crate::orm::{MemoryDriver, Schema};
    use serde_json::json;

    fn args(registry: HookRegistry) -> CrudArgs {
        let em = EntityManager::new(Schema::new(), MemoryDriver::new()).unwrap();
        CrudArgs::new(
            Arc::new(registry),
            "post",
            Arc::new(em),
            vec!["id".to_string()],
            RequestData::new().with_body(json!({"post": {"title": "x"}})),
        )
    }

    #[test]
    fn test_set_entity_keeps_both_views() {
        let mut bag = args(HookRegistry::new());
        bag.set_entity(json!([{"id": 1}, {"id": 2}]));
        assert_eq!(bag.entity(), Some(&json!({"id": 1})));
        assert_eq!(bag.entities().len(), 2);

        bag.set_entity(json!({"id": 3}));
        assert_eq!(bag.entities(), vec![json!({"id": 3})]);
    }

    #[tokio::test]
    async fn test_exec_entity_updates_entities() {
        let mut registry = HookRegistry::new();
        registry.on(
            "post",
            CrudHook::AfterGet,
            vec![],
            hook_fn(|_| async { Ok(Some(json!({"id": 9}))) }),
        );
        let mut bag = args(registry);
        bag.set_entity(json!([{"id": 1}, {"id": 2}]));
        let value = bag.exec(CrudHook::AfterGet, CrudParam::Entity).await.unwrap();
        assert_eq!(value, json!({"id": 9}));
        assert_eq!(bag.entities(), vec![json!({"id": 9})]);
    }

    #[tokio::test]
    async fn test_exec_entities_updates_entity() {
        let mut registry = HookRegistry::new();
        registry.on(
            "post",
            CrudHook::AfterCreate,
            vec![],
            hook_fn(|_| async { Ok(Some(json!([{"id": 4}, {"id": 5}]))) }),
        );
        let mut bag = args(registry);
        bag.exec(CrudHook::AfterCreate, CrudParam::Entities).await.unwrap();
        assert_eq!(bag.entity(), Some(&json!({"id": 4})));
    }

    #[tokio::test]
    async fn test_exec_without_result_keeps_slot() {
        let mut bag = args(HookRegistry::new());
        bag.set_entity(json!([{"id": 1}, {"id": 2}]));
        bag.exec(CrudHook::AfterFlush, CrudParam::Entities).await.unwrap();
        assert_eq!(bag.entities().len(), 2);
    }

    #[tokio::test]
    async fn test_call_returns_default_without_result() {
        let bag = args(HookRegistry::new());
        let value = bag.call(CrudHook::AfterView, json!("default")).await.unwrap();
        assert_eq!(value, json!("default"));
    }

    #[tokio::test]
    async fn test_falsy_results_fall_back() {
        for falsy in [json!(false), json!(0), json!("")] {
            let mut registry = HookRegistry::new();
            let result = falsy.clone();
            registry.on(
                "post",
                CrudHook::AfterView,
                vec![],
                hook_fn(move |_| {
                    let result = result.clone();
                    async move { Ok(Some(result)) }
                }),
            );
            let result = falsy.clone();
            registry.on(
                "post",
                CrudHook::BeforeSearch,
                vec![],
                hook_fn(move |_| {
                    let result = result.clone();
                    async move { Ok(Some(result)) }
                }),
            );
            let mut bag = args(registry);

            let value = bag.call(CrudHook::AfterView, json!({"post": {"id": 1}})).await.unwrap();
            assert_eq!(value, json!({"post": {"id": 1}}), "{falsy} replaced the default");

            bag.filter = json!({"title": "x"});
            let filter = bag.exec(CrudHook::BeforeSearch, CrudParam::Filter).await.unwrap();
            assert_eq!(filter, json!({"title": "x"}), "{falsy} replaced the filter");
        }
    }

    #[tokio::test]
    async fn test_call_request_replaces_body() {
        let mut registry = HookRegistry::new();
        registry.on(
            "post",
            CrudHook::BeforeUpdate,
            vec![ParamDecl::body(0)],
            hook_fn(|args| async move {
                let body = Value::from_slot(args[0].clone())?;
                let title = body["post"]["title"].as_str().unwrap_or_default().to_uppercase();
                Ok(Some(json!({"body": {"post": {"title": title}}})))
            }),
        );
        let mut bag = args(registry);
        let payload = bag.call_request(CrudHook::BeforeUpdate).await.unwrap();
        assert_eq!(payload.body, json!({"post": {"title": "X"}}));
        assert_eq!(bag.request.body, payload.body);
    }

    #[test]
    fn test_handles_cannot_be_replaced() {
        let mut bag = args(HookRegistry::new());
        assert!(bag.set(CrudParam::EntityManager, json!(null)).is_err());
        assert!(bag.set(CrudParam::Keys, json!("id")).is_err());
    }
}
