#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use crudhook::{
    CrudEntity, CrudOptions, CrudResource, EntityManager, HookRegistry, MemoryDriver,
    PopulateOption, Schema, SeaOrmDriver,
};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr};
use serde::Deserialize;
use serde_json::Value;
use tower::ServiceExt;

#[derive(Debug, Deserialize, CrudEntity)]
#[crudhook(table = "authors", keys = "increment")]
pub struct Author {
    #[crudhook(primary_key)]
    pub id: Option<i64>,
    pub name: String,
    #[crudhook(hidden)]
    pub password: Option<String>,
    #[crudhook(one_to_many = "Post", mapped_by = "author")]
    pub posts: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize, CrudEntity)]
#[crudhook(table = "posts", keys = "increment")]
pub struct Post {
    #[crudhook(primary_key)]
    pub id: Option<i64>,
    pub title: String,
    pub published: Option<bool>,
    #[crudhook(ty = "datetime", on_create = "now")]
    pub created_at: Option<String>,
    #[crudhook(many_to_one = "Author")]
    pub author: Option<Value>,
    #[crudhook(one_to_many = "Comment", mapped_by = "post", orphan_removal)]
    pub comments: Option<Vec<Value>>,
    #[crudhook(many_to_many = "Tag", pivot = "post_tags")]
    pub tags: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize, CrudEntity)]
#[crudhook(table = "comments", keys = "increment")]
pub struct Comment {
    #[crudhook(primary_key)]
    pub id: Option<i64>,
    pub body: String,
    #[crudhook(many_to_one = "Post")]
    pub post: Option<Value>,
}

#[derive(Debug, Deserialize, CrudEntity)]
#[crudhook(table = "tags")]
pub struct Tag {
    #[crudhook(primary_key, ty = "uuid")]
    pub id: Option<String>,
    #[crudhook(unique)]
    pub label: String,
}

const SCHEMA_SQL: &[&str] = &[
    "CREATE TABLE authors (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, password TEXT)",
    "CREATE TABLE posts (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT NOT NULL, published BOOLEAN, created_at TEXT, author_id INTEGER)",
    "CREATE TABLE comments (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT NOT NULL, post_id INTEGER)",
    "CREATE TABLE tags (id TEXT PRIMARY KEY, label TEXT NOT NULL UNIQUE)",
    "CREATE TABLE post_tags (post_id INTEGER NOT NULL, tag_id TEXT NOT NULL)",
];

const TABLES: &[&str] = &["post_tags", "tags", "comments", "posts", "authors"];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn schema() -> Schema {
    Schema::new()
        .with_entity::<Author>()
        .with_entity::<Post>()
        .with_entity::<Comment>()
        .with_entity::<Tag>()
}

// Database URL from the environment, in-memory SQLite otherwise
fn test_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string())
}

pub async fn setup_test_db() -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(test_database_url());
    // A single connection keeps every request on the same in-memory database.
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await?;
    for table in TABLES {
        db.execute_unprepared(&format!("DROP TABLE IF EXISTS {table}"))
            .await?;
    }
    for statement in SCHEMA_SQL {
        db.execute_unprepared(statement).await?;
    }
    Ok(db)
}

pub fn memory_manager() -> (EntityManager, MemoryDriver) {
    let driver = MemoryDriver::new();
    let em = EntityManager::new(schema(), driver.clone()).expect("schema is valid");
    (em, driver)
}

pub async fn sqlite_manager() -> EntityManager {
    let db = setup_test_db()
        .await
        .expect("Failed to setup test database");
    EntityManager::new(schema(), SeaOrmDriver::new(db)).expect("schema is valid")
}

/// `post` resource at `/api/posts`, searchable by title and author name.
pub fn post_options() -> CrudOptions {
    CrudOptions::new("post", "Post")
        .path("posts")
        .filter(["title", "author.name"])
        .populate(PopulateOption::Paths(vec!["author".to_string()]))
}

pub fn app(em: &EntityManager, registry: HookRegistry, options: CrudOptions) -> Router {
    CrudResource::new(options, Arc::new(registry), em)
        .expect("Failed to build resource")
        .router()
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> TestResponse {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            panic!("response is not JSON: {}", String::from_utf8_lossy(&bytes))
        })
    };
    TestResponse {
        status,
        headers,
        body,
    }
}

/// Create a post and return its id.
pub async fn create_post(app: &Router, post: Value) -> i64 {
    let response = send(app, "POST", "/api/posts", Some(serde_json::json!({ "post": post }))).await;
    assert_eq!(
        response.status,
        StatusCode::CREATED,
        "create failed: {}",
        response.body
    );
    response.body["id"].as_i64().expect("created id")
}
