use serde_json::Value;

use crate::hooks::registry::HookRegistry;
use crate::hooks::resolver::{HookResult, SlotSource, resolve};
use crate::hooks::types::CrudHook;

/// Run every handler bound to `hook` on `resource`, in registration order.
///
/// The last meaningful result wins (see [`is_meaningful`]). The first error
/// is returned immediately and later handlers do not run. `source` is only
/// read.
///
/// # Errors
///
/// Returns the first handler error.
pub async fn emit<S>(registry: &HookRegistry, resource: &str, hook: CrudHook, source: &S) -> HookResult
where
    S: SlotSource + Sync + ?Sized,
{
    let mut result: Option<Value> = None;
    let mut invoked = 0usize;
    for binding in registry.lookup(resource, hook) {
        let args = resolve(&binding.params, source);
        tracing::trace!(%resource, %hook, index = invoked, "invoking hook handler");
        invoked += 1;
        match binding.handler.handle(args).await {
            Ok(Some(value)) if is_meaningful(&value) => result = Some(value),
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(%resource, %hook, error = %err, "hook handler failed");
                return Err(err);
            }
        }
    }
    if invoked > 0 {
        tracing::debug!(%resource, %hook, handlers = invoked, replaced = result.is_some(), "dispatched hook");
    }
    Ok(result)
}

/// Whether a handler result replaces the current value. `null`, `false`,
/// zero and the empty string do not.
#[must_use]
pub fn is_meaningful(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f.abs() > 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CrudError;
    use crate::hooks::registry::hook_fn;
    use crate::hooks::resolver::{ParamDecl, SlotValue};
    use crate::hooks::types::CrudParam;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Body(Value);

    impl SlotSource for Body {
        fn slot(&self, param: CrudParam) -> Option<SlotValue> {
            (param == CrudParam::Body).then(|| SlotValue::Json(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn test_last_meaningful_result_wins() {
        let mut registry = HookRegistry::new();
        registry
            .on("post", CrudHook::BeforeCreate, vec![], hook_fn(|_| async { Ok(Some(json!("first"))) }))
            .on("post", CrudHook::BeforeCreate, vec![], hook_fn(|_| async { Ok(Some(json!("second"))) }))
            .on("post", CrudHook::BeforeCreate, vec![], hook_fn(|_| async { Ok(Some(Value::Null)) }))
            .on("post", CrudHook::BeforeCreate, vec![], hook_fn(|_| async { Ok(None) }));

        let result = emit(&registry, "post", CrudHook::BeforeCreate, &Body(json!({})))
            .await
            .unwrap();
        assert_eq!(result, Some(json!("second")));
    }

    #[test]
    fn test_falsy_values_are_not_meaningful() {
        for value in [json!(null), json!(false), json!(0), json!(0.0), json!(-0.0), json!("")] {
            assert!(!is_meaningful(&value), "{value} should not replace");
        }
        for value in [json!(true), json!(1), json!(-2.5), json!("x"), json!([]), json!({})] {
            assert!(is_meaningful(&value), "{value} should replace");
        }
    }

    #[tokio::test]
    async fn test_falsy_results_keep_earlier_result() {
        let mut registry = HookRegistry::new();
        registry.on("post", CrudHook::BeforeSearch, vec![], hook_fn(|_| async { Ok(Some(json!({"a": 1}))) }));
        for falsy in [json!(false), json!(0), json!(""), Value::Null] {
            registry.on(
                "post",
                CrudHook::BeforeSearch,
                vec![],
                hook_fn(move |_| {
                    let falsy = falsy.clone();
                    async move { Ok(Some(falsy)) }
                }),
            );
        }

        let result = emit(&registry, "post", CrudHook::BeforeSearch, &Body(json!({})))
            .await
            .unwrap();
        assert_eq!(result, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_no_bindings_is_no_result() {
        let registry = HookRegistry::new();
        let result = emit(&registry, "post", CrudHook::AfterGet, &Body(json!({})))
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_first_error_stops_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HookRegistry::new();
        let counter = Arc::clone(&calls);
        registry
            .on(
                "post",
                CrudHook::BeforeUpdate,
                vec![],
                hook_fn(|_| async { Err(CrudError::validation("rejected")) }),
            )
            .on(
                "post",
                CrudHook::BeforeUpdate,
                vec![],
                hook_fn(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }
                }),
            );

        let err = emit(&registry, "post", CrudHook::BeforeUpdate, &Body(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CrudError::Validation { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handlers_receive_declared_slots() {
        let mut registry = HookRegistry::new();
        registry.on(
            "post",
            CrudHook::BeforeCreate,
            vec![ParamDecl::body(1).data("post")],
            hook_fn(|args| async move {
                assert!(args[0].is_none());
                Ok(args[1].as_ref().and_then(SlotValue::to_json))
            }),
        );
        let result = emit(
            &registry,
            "post",
            CrudHook::BeforeCreate,
            &Body(json!({"post": {"title": "x"}})),
        )
        .await
        .unwrap();
        assert_eq!(result, Some(json!({"title": "x"})));
    }
}
