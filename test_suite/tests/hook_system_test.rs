// Hook providers written with #[crud_hooks] and closures registered by hand.

use std::sync::{Arc, Mutex};

use axum::http::{HeaderValue, StatusCode};
use crudhook::hooks::{CrudHook, ParamDecl};
use crudhook::{
    CrudError, EntityManager, HookRegistry, ResponseHandle, SearchQuery, crud_hooks, hook_fn,
};
use serde_json::{Value, json};

mod common;
use common::{app, create_post, memory_manager, post_options, send};

#[derive(Default)]
struct PostHooks {
    calls: Mutex<Vec<&'static str>>,
}

impl PostHooks {
    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[crud_hooks(resource = "post")]
impl PostHooks {
    /// Build the entity from the body, trimming the title.
    #[before_create]
    async fn trim_title(
        &self,
        #[body("post")] post: Value,
        #[entity_manager] em: Arc<EntityManager>,
    ) -> Result<Value, CrudError> {
        self.record("before_create");
        let mut post = post;
        if let Some(title) = post["title"].as_str() {
            post["title"] = json!(title.trim());
        }
        Ok(json!([em.create("Post", post)?]))
    }

    #[before_search]
    async fn hide_drafts(&self, #[filter] filter: Value, #[query] query: SearchQuery) -> Value {
        if query.extra.contains_key("drafts") {
            return filter;
        }
        let mut filter = filter;
        filter["published"] = json!(true);
        filter
    }

    #[after_get]
    async fn tag_response(&self, #[response] response: ResponseHandle) {
        response.insert_header(
            axum::http::HeaderName::from_static("x-post-hooks"),
            HeaderValue::from_static("after-get"),
        );
    }

    #[after_view]
    async fn add_links(&self, #[entity] post: Value) -> Value {
        let id = post["id"].clone();
        json!({ "post": post, "links": { "self": format!("/api/posts/{id}") } })
    }

    #[before_update]
    async fn guard_title(&self, #[body("post")] post: Value) -> Result<(), CrudError> {
        self.record("before_update");
        if post["title"] == json!("forbidden") {
            return Err(CrudError::http(StatusCode::FORBIDDEN, "title not allowed"));
        }
        Ok(())
    }

    #[before_delete]
    async fn keep_published(&self, #[entity] post: Value) -> Result<(), CrudError> {
        if post["published"] == json!(true) {
            return Err(CrudError::conflict("published posts cannot be deleted"));
        }
        Ok(())
    }

    #[before_rollback]
    async fn on_before_rollback(&self) {
        self.record("before_rollback");
    }

    #[after_rollback]
    async fn on_after_rollback(&self) {
        self.record("after_rollback");
    }

    #[after_commit]
    async fn on_after_commit(&self) {
        self.record("after_commit");
    }
}

fn registry(hooks: &Arc<PostHooks>) -> HookRegistry {
    let mut registry = HookRegistry::new();
    registry.provide(Arc::clone(hooks));
    registry
}

#[tokio::test]
async fn test_before_create_supplies_entities() {
    let hooks = Arc::new(PostHooks::default());
    let (em, driver) = memory_manager();
    let app = app(&em, registry(&hooks), post_options());

    create_post(&app, json!({"title": "  padded  "})).await;
    assert_eq!(driver.rows("posts").await[0]["title"], json!("padded"));
    assert_eq!(hooks.calls(), vec!["before_create", "after_commit"]);
}

#[tokio::test]
async fn test_before_search_filter_replaces_base_filter() {
    let hooks = Arc::new(PostHooks::default());
    let (em, _) = memory_manager();
    let app = app(&em, registry(&hooks), post_options());
    create_post(&app, json!({"title": "draft", "published": false})).await;
    create_post(&app, json!({"title": "live", "published": true})).await;

    let response = send(&app, "GET", "/api/posts", None).await;
    assert_eq!(response.body["count"], json!(1));
    assert_eq!(response.body["items"][0]["title"], json!("live"));

    let response = send(&app, "GET", "/api/posts?drafts=1", None).await;
    assert_eq!(response.body["count"], json!(2));
}

#[tokio::test]
async fn test_after_view_and_response_handle() {
    let hooks = Arc::new(PostHooks::default());
    let (em, _) = memory_manager();
    let app = app(&em, registry(&hooks), post_options());
    let id = create_post(&app, json!({"title": "Hello"})).await;

    let response = send(&app, "GET", &format!("/api/posts/{id}"), None).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers["x-post-hooks"], "after-get");
    assert_eq!(response.body["post"]["title"], json!("Hello"));
    assert_eq!(response.body["links"]["self"], json!(format!("/api/posts/{id}")));
}

#[tokio::test]
async fn test_failing_before_update_rolls_back() {
    let hooks = Arc::new(PostHooks::default());
    let (em, _) = memory_manager();
    let app = app(&em, registry(&hooks), post_options());
    let id = create_post(&app, json!({"title": "Hello"})).await;

    let response = send(
        &app,
        "PATCH",
        &format!("/api/posts/{id}"),
        Some(json!({"post": {"title": "forbidden"}})),
    )
    .await;
    // Update errors use the intercepted mapping
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body, json!(null));
    assert_eq!(
        hooks.calls(),
        vec![
            "before_create",
            "after_commit",
            "before_update",
            "before_rollback",
            "after_rollback"
        ]
    );

    let response = send(&app, "GET", &format!("/api/posts/{id}"), None).await;
    assert_eq!(response.body["post"]["title"], json!("Hello"));
}

#[tokio::test]
async fn test_conflict_from_hook_keeps_entity() {
    let hooks = Arc::new(PostHooks::default());
    let (em, driver) = memory_manager();
    let app = app(&em, registry(&hooks), post_options());
    let id = create_post(&app, json!({"title": "Hello", "published": true})).await;

    let response = send(&app, "DELETE", &format!("/api/posts/{id}"), None).await;
    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(driver.rows("posts").await.len(), 1);
}

#[tokio::test]
async fn test_closure_hooks_last_result_wins() {
    let (em, driver) = memory_manager();
    let mut registry = HookRegistry::new();
    registry
        .on(
            "post",
            CrudHook::BeforePersist,
            vec![ParamDecl::entity(0)],
            hook_fn(|args| async move {
                let mut post: Value = crudhook::FromSlot::from_slot(args[0].clone())?;
                post["title"] = json!("first");
                Ok(Some(post))
            }),
        )
        .on(
            "post",
            CrudHook::AfterPersist,
            vec![ParamDecl::entity(0)],
            hook_fn(|args| async move {
                let mut post: Value = crudhook::FromSlot::from_slot(args[0].clone())?;
                post["title"] = json!("second");
                Ok(Some(post))
            }),
        )
        .on(
            "post",
            CrudHook::AfterPersist,
            vec![],
            hook_fn(|_| async { Ok(None) }),
        );
    let app = app(&em, registry, post_options());

    create_post(&app, json!({"title": "original"})).await;
    assert_eq!(driver.rows("posts").await[0]["title"], json!("second"));
}

#[tokio::test]
async fn test_hooks_are_scoped_to_their_resource() {
    let (em, driver) = memory_manager();
    let mut registry = HookRegistry::new();
    registry.on(
        "tag",
        CrudHook::BeforeCreate,
        vec![],
        hook_fn(|_| async { Err(CrudError::validation("tags are read-only")) }),
    );
    let app = app(&em, registry, post_options());

    create_post(&app, json!({"title": "Hello"})).await;
    assert_eq!(driver.rows("posts").await.len(), 1);
}

#[tokio::test]
async fn test_falsy_hook_results_are_ignored() {
    let (em, _) = memory_manager();
    let mut registry = HookRegistry::new();
    registry
        .on(
            "post",
            CrudHook::BeforeSearch,
            vec![],
            hook_fn(|_| async { Ok(Some(json!(false))) }),
        )
        .on(
            "post",
            CrudHook::AfterView,
            vec![],
            hook_fn(|_| async { Ok(Some(json!(0))) }),
        );
    let app = app(&em, registry, post_options());
    let id = create_post(&app, json!({"title": "Hello"})).await;

    let response = send(&app, "GET", "/api/posts", None).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["count"], json!(1));

    let response = send(&app, "GET", &format!("/api/posts/{id}"), None).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["post"]["title"], json!("Hello"));
}
