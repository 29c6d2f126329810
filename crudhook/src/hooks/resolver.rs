//! Declared hook parameters and their conversion into handler arguments.

use std::sync::Arc;

use axum::http::request::Parts;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::request::{ResponseHandle, SearchQuery, UploadedFile};
use crate::errors::CrudError;
use crate::hooks::types::CrudParam;
use crate::orm::{EntityManager, FindOptions};

/// Result of one hook handler. `Ok(None)` and falsy values (`null`, `false`,
/// zero, `""`) leave the slot untouched; any other value replaces it.
pub type HookResult = Result<Option<Value>, CrudError>;

/// One declared handler parameter: which slot fills position `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDecl {
    pub slot: CrudParam,
    pub index: usize,
    /// Property of a JSON slot to pass instead of the whole value
    pub data: Option<String>,
}

macro_rules! param_constructors {
    ($($fn_name:ident => $slot:ident),* $(,)?) => {
        $(
            #[must_use]
            pub fn $fn_name(index: usize) -> Self {
                Self::new(CrudParam::$slot, index)
            }
        )*
    };
}

impl ParamDecl {
    #[must_use]
    pub fn new(slot: CrudParam, index: usize) -> Self {
        Self {
            slot,
            index,
            data: None,
        }
    }

    param_constructors! {
        entity_manager => EntityManager,
        keys => Keys,
        request => Request,
        response => Response,
        query => Query,
        params => Params,
        body => Body,
        filter => Filter,
        entity => Entity,
        entities => Entities,
        file => File,
        files => Files,
        options => Options,
    }

    /// Select a property of the slot, e.g. `ParamDecl::body(0).data("post")`.
    #[must_use]
    pub fn data(mut self, property: impl Into<String>) -> Self {
        self.data = Some(property.into());
        self
    }
}

/// A slot value as handed to a handler.
#[derive(Debug, Clone)]
pub enum SlotValue {
    Session(Arc<EntityManager>),
    Request(Arc<Parts>),
    Response(ResponseHandle),
    Query(SearchQuery),
    Options(FindOptions),
    File(UploadedFile),
    Files(Vec<UploadedFile>),
    /// Keys, params, body, filter, entity and entities
    Json(Value),
}

impl SlotValue {
    /// JSON view of the value; `None` for handles that have none.
    #[must_use]
    pub fn to_json(&self) -> Option<Value> {
        match self {
            Self::Json(value) => Some(value.clone()),
            Self::Query(query) => serde_json::to_value(query).ok(),
            Self::Options(options) => serde_json::to_value(options).ok(),
            Self::File(file) => serde_json::to_value(file).ok(),
            Self::Files(files) => serde_json::to_value(files).ok(),
            Self::Session(_) | Self::Request(_) | Self::Response(_) => None,
        }
    }
}

/// Anything that can fill parameter slots.
pub trait SlotSource {
    fn slot(&self, param: CrudParam) -> Option<SlotValue>;
}

/// Build the positional argument list of one handler. Positions no
/// declaration names, and slots without a value, are `None`.
pub fn resolve<S>(params: &[ParamDecl], source: &S) -> Vec<Option<SlotValue>>
where
    S: SlotSource + ?Sized,
{
    let len = params.iter().map(|p| p.index + 1).max().unwrap_or(0);
    let mut args = vec![None; len];
    for param in params {
        let value = source.slot(param.slot);
        args[param.index] = match (&param.data, value) {
            (Some(property), Some(SlotValue::Json(json))) => {
                json.get(property).cloned().map(SlotValue::Json)
            }
            (Some(property), Some(other)) => other
                .to_json()
                .and_then(|json| json.get(property).cloned())
                .map(SlotValue::Json),
            (None, value) => value,
            (Some(_), None) => None,
        };
    }
    args
}

fn missing<T>(expected: &str) -> Result<T, CrudError> {
    Err(CrudError::internal(
        format!("hook parameter expected {expected}"),
        None,
    ))
}

/// Conversion of a resolved slot into a typed handler parameter.
pub trait FromSlot: Sized {
    /// # Errors
    ///
    /// Fails when the slot is empty or holds another kind of value.
    fn from_slot(value: Option<SlotValue>) -> Result<Self, CrudError>;
}

impl FromSlot for Value {
    fn from_slot(value: Option<SlotValue>) -> Result<Self, CrudError> {
        Ok(value.and_then(|v| v.to_json()).unwrap_or(Value::Null))
    }
}

impl<T> FromSlot for Option<T>
where
    T: FromSlot,
{
    fn from_slot(value: Option<SlotValue>) -> Result<Self, CrudError> {
        value.map(|v| T::from_slot(Some(v))).transpose()
    }
}

impl FromSlot for Arc<EntityManager> {
    fn from_slot(value: Option<SlotValue>) -> Result<Self, CrudError> {
        match value {
            Some(SlotValue::Session(em)) => Ok(em),
            _ => missing("the entity manager"),
        }
    }
}

impl FromSlot for Arc<Parts> {
    fn from_slot(value: Option<SlotValue>) -> Result<Self, CrudError> {
        match value {
            Some(SlotValue::Request(parts)) => Ok(parts),
            _ => missing("the request"),
        }
    }
}

impl FromSlot for ResponseHandle {
    fn from_slot(value: Option<SlotValue>) -> Result<Self, CrudError> {
        match value {
            Some(SlotValue::Response(handle)) => Ok(handle),
            _ => missing("the response"),
        }
    }
}

impl FromSlot for SearchQuery {
    fn from_slot(value: Option<SlotValue>) -> Result<Self, CrudError> {
        match value {
            Some(SlotValue::Query(query)) => Ok(query),
            other => Slot::from_slot(other).map(Slot::into_inner),
        }
    }
}

impl FromSlot for FindOptions {
    fn from_slot(value: Option<SlotValue>) -> Result<Self, CrudError> {
        match value {
            Some(SlotValue::Options(options)) => Ok(options),
            other => Slot::from_slot(other).map(Slot::into_inner),
        }
    }
}

impl FromSlot for UploadedFile {
    fn from_slot(value: Option<SlotValue>) -> Result<Self, CrudError> {
        match value {
            Some(SlotValue::File(file)) => Ok(file),
            other => Slot::from_slot(other).map(Slot::into_inner),
        }
    }
}

impl FromSlot for Vec<UploadedFile> {
    fn from_slot(value: Option<SlotValue>) -> Result<Self, CrudError> {
        match value {
            Some(SlotValue::Files(files)) => Ok(files),
            None => Ok(Vec::new()),
            other => Slot::from_slot(other).map(Slot::into_inner),
        }
    }
}

/// A JSON slot deserialized into `T`.
///
/// ```rust,ignore
/// async fn check(Slot(post): Slot<NewPost>) -> HookResult { ... }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Slot<T>(pub T);

impl<T> Slot<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> FromSlot for Slot<T>
where
    T: DeserializeOwned,
{
    fn from_slot(value: Option<SlotValue>) -> Result<Self, CrudError> {
        let json = value.and_then(|v| v.to_json()).unwrap_or(Value::Null);
        serde_json::from_value(json)
            .map(Slot)
            .map_err(|e| CrudError::validation(format!("invalid hook argument: {e}")))
    }
}

/// Conversion of a handler's return value into a [`HookResult`].
pub trait IntoHookResult {
    /// # Errors
    ///
    /// Propagates the handler's error.
    fn into_hook_result(self) -> HookResult;
}

impl IntoHookResult for () {
    fn into_hook_result(self) -> HookResult {
        Ok(None)
    }
}

impl IntoHookResult for Value {
    fn into_hook_result(self) -> HookResult {
        Ok(Some(self))
    }
}

impl IntoHookResult for Option<Value> {
    fn into_hook_result(self) -> HookResult {
        Ok(self)
    }
}

impl<T, E> IntoHookResult for Result<T, E>
where
    T: IntoHookResult,
    E: Into<CrudError>,
{
    fn into_hook_result(self) -> HookResult {
        self.map_err(Into::into)?.into_hook_result()
    }
}
