use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::hooks::resolver::{HookResult, ParamDecl, SlotValue};
use crate::hooks::types::CrudHook;

/// A hook handler, called with the arguments resolved from its parameter
/// table.
///
/// Implemented for async closures:
///
/// ```rust,ignore
/// registry.on(
///     "post",
///     CrudHook::BeforeCreate,
///     vec![ParamDecl::body(0)],
///     hook_fn(|args| async move { Ok(None) }),
/// );
/// ```
#[async_trait]
pub trait CrudHandler: Send + Sync {
    async fn handle(&self, args: Vec<Option<SlotValue>>) -> HookResult;
}

#[async_trait]
impl<F, Fut> CrudHandler for F
where
    F: Fn(Vec<Option<SlotValue>>) -> Fut + Send + Sync,
    Fut: Future<Output = HookResult> + Send,
{
    async fn handle(&self, args: Vec<Option<SlotValue>>) -> HookResult {
        (self)(args).await
    }
}

/// Pin down a closure's signature as a handler, so its argument and error
/// types are inferred.
pub fn hook_fn<F, Fut>(f: F) -> F
where
    F: Fn(Vec<Option<SlotValue>>) -> Fut + Send + Sync,
    Fut: Future<Output = HookResult> + Send,
{
    f
}

/// A handler registered for one hook of one resource.
#[derive(Clone)]
pub struct HookBinding {
    pub resource: String,
    pub hook: CrudHook,
    pub params: Vec<ParamDecl>,
    pub handler: Arc<dyn CrudHandler>,
}

impl HookBinding {
    pub fn new(
        resource: impl Into<String>,
        hook: CrudHook,
        params: Vec<ParamDecl>,
        handler: impl CrudHandler + 'static,
    ) -> Self {
        Self {
            resource: resource.into(),
            hook,
            params,
            handler: Arc::new(handler),
        }
    }
}

impl fmt::Debug for HookBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookBinding")
            .field("resource", &self.resource)
            .field("hook", &self.hook)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// A type whose methods are hook handlers, usually generated with
/// `#[crud_hooks(resource = "...")]`.
pub trait HookProvider: Send + Sync + 'static {
    /// Bindings with handlers that call into `self`.
    fn bindings(self: Arc<Self>) -> Vec<HookBinding>;
}

/// Hook bindings per resource, in registration order.
///
/// Built at startup and shared read-only behind an `Arc` while requests run.
#[derive(Debug, Default, Clone)]
pub struct HookRegistry {
    bindings: HashMap<String, Vec<HookBinding>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a binding. Registering the same handler twice makes it run
    /// twice.
    pub fn register(&mut self, binding: HookBinding) -> &mut Self {
        tracing::debug!(resource = %binding.resource, hook = %binding.hook, "registered hook");
        self.bindings
            .entry(binding.resource.clone())
            .or_default()
            .push(binding);
        self
    }

    pub fn on(
        &mut self,
        resource: impl Into<String>,
        hook: CrudHook,
        params: Vec<ParamDecl>,
        handler: impl CrudHandler + 'static,
    ) -> &mut Self {
        self.register(HookBinding::new(resource, hook, params, handler))
    }

    /// Register every handler of a provider.
    pub fn provide<P>(&mut self, provider: Arc<P>) -> &mut Self
    where
        P: HookProvider,
    {
        for binding in provider.bindings() {
            self.register(binding);
        }
        self
    }

    /// Bindings of `hook` for `resource`, in registration order.
    pub fn lookup<'a>(
        &'a self,
        resource: &str,
        hook: CrudHook,
    ) -> impl Iterator<Item = &'a HookBinding> + 'a {
        self.bindings
            .get(resource)
            .into_iter()
            .flatten()
            .filter(move |binding| binding.hook == hook)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}
