//! Declarative CRUD resources for Axum: five REST routes per entity, a
//! transactional entity manager and a lifecycle hook pipeline that lets
//! application code inspect and replace request state at every stage.

extern crate self as crudhook;

pub mod controller;
pub mod core;
pub mod errors;
pub mod hooks;
pub mod orm;
pub mod pagination;
pub mod storage;

#[cfg(feature = "derive")]
pub use crudhook_derive::*; // Export the proc macros

pub use crate::controller::{CrudMethod, CrudResource, CrudState};
pub use crate::core::{
    CrudArgs, CrudDefaults, CrudOptions, CrudService, PopulateOption, RequestData,
    ResponseHandle, SearchQuery, SearchResult, UploadedFile, UploadedFiles,
};
pub use crate::errors::{CrudError, Intercepted};
pub use crate::hooks::{
    CrudHandler, CrudHook, CrudParam, FromSlot, HookBinding, HookProvider, HookRegistry,
    HookResult, IntoHookResult, ParamDecl, Slot, SlotValue, hook_fn,
};
pub use crate::orm::{
    CrudEntity, EntityManager, EntityMeta, FindOptions, KeyGeneration, MemoryDriver, Populate,
    ScalarType, Schema, SeaOrmDriver,
};
pub use crate::storage::{BlobStore, LocalDiskStore};
pub use serde_with;
