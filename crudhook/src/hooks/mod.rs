//! Lifecycle hooks: the registry of handlers, parameter resolution and
//! dispatch.

pub mod dispatcher;
pub mod registry;
pub mod resolver;
pub mod types;

pub use dispatcher::{emit, is_meaningful};
pub use registry::{CrudHandler, HookBinding, HookProvider, HookRegistry, hook_fn};
pub use resolver::{
    FromSlot, HookResult, IntoHookResult, ParamDecl, Slot, SlotSource, SlotValue, resolve,
};
pub use types::{CrudHook, CrudParam};
