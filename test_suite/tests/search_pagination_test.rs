// Search: text matching, exact filters, sorting, paging and Content-Range.

use axum::Router;
use axum::http::StatusCode;
use crudhook::{CrudDefaults, HookRegistry};
use serde_json::{Value, json};
use serial_test::serial;

mod common;
use common::{app, create_post, memory_manager, post_options, send, sqlite_manager};

async fn seed(app: &Router) {
    create_post(app, json!({"title": "Learning Rust", "published": true, "author": {"name": "ann"}})).await;
    create_post(app, json!({"title": "Async Rust", "published": false, "author": {"name": "bob"}})).await;
    create_post(app, json!({"title": "Gardening", "published": true, "author": {"name": "ann"}})).await;
}

fn titles(body: &Value) -> Vec<String> {
    body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["title"].as_str().unwrap().to_string())
        .collect()
}

async fn search_scenarios(app: &Router) {
    seed(app).await;

    // Default order is primary key descending
    let response = send(app, "GET", "/api/posts", None).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["count"], json!(3));
    assert_eq!(titles(&response.body), vec!["Gardening", "Async Rust", "Learning Rust"]);
    assert_eq!(response.headers["content-range"], "post 0-3/3");

    // Text search over every filter column
    let response = send(app, "GET", "/api/posts?search=Rust", None).await;
    assert_eq!(response.body["count"], json!(2));

    let response = send(app, "GET", "/api/posts?search=bob", None).await;
    assert_eq!(titles(&response.body), vec!["Async Rust"]);

    // Search restricted to one category
    let response = send(app, "GET", "/api/posts?search=ann&category=title", None).await;
    assert_eq!(response.body["count"], json!(0));

    // Exact match on a filter column
    let response = send(app, "GET", "/api/posts?author.name=ann", None).await;
    assert_eq!(response.body["count"], json!(2));
    assert_eq!(response.body["items"][0]["author"]["name"], json!("ann"));

    // Sorting
    let response = send(app, "GET", "/api/posts?sort=title&order=asc", None).await;
    assert_eq!(titles(&response.body), vec!["Async Rust", "Gardening", "Learning Rust"]);

    // Paging keeps the full count
    let response = send(app, "GET", "/api/posts?sort=title&order=asc&offset=1&limit=1", None).await;
    assert_eq!(titles(&response.body), vec!["Gardening"]);
    assert_eq!(response.body["count"], json!(3));
    assert_eq!(response.headers["content-range"], "post 1-1/3");
}

#[tokio::test]
async fn test_search_in_memory() {
    let (em, _) = memory_manager();
    let app = app(&em, HookRegistry::new(), post_options());
    search_scenarios(&app).await;
}

#[tokio::test]
#[serial]
async fn test_search_sqlite() {
    let em = sqlite_manager().await;
    let app = app(&em, HookRegistry::new(), post_options());
    search_scenarios(&app).await;
}

#[tokio::test]
async fn test_configured_defaults_apply_to_zero_values() {
    let (em, _) = memory_manager();
    let options = post_options().defaults(CrudDefaults {
        offset: 0,
        limit: Some(2),
    });
    let app = app(&em, HookRegistry::new(), options);
    seed(&app).await;

    let response = send(&app, "GET", "/api/posts?limit=0", None).await;
    assert_eq!(response.body["items"].as_array().unwrap().len(), 2);
    assert_eq!(response.body["count"], json!(3));
    assert_eq!(response.headers["content-range"], "post 0-1/3");
}

#[tokio::test]
async fn test_unknown_sort_column_is_bad_request() {
    let (em, _) = memory_manager();
    let app = app(&em, HookRegistry::new(), post_options());

    let response = send(&app, "GET", "/api/posts?sort=popularity", None).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(response.body["error"].as_str().unwrap().contains("popularity"));
}

#[tokio::test]
async fn test_search_without_filter_columns_ignores_text() {
    let (em, _) = memory_manager();
    let options = crudhook::CrudOptions::new("post", "Post").path("posts");
    let app = app(&em, HookRegistry::new(), options);
    seed(&app).await;

    let response = send(&app, "GET", "/api/posts?search=Rust", None).await;
    assert_eq!(response.body["count"], json!(3));
    // Relations stay unpopulated without filter columns or populate settings
    assert!(response.body["items"][0]["author"].is_number());
}
