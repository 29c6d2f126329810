//! Blog API with authors, posts and comments
//!
//! ```bash
//! cargo run --example blog
//! ```
//!
//! Then try:
//! - `curl -X POST localhost:3000/api/posts -H 'content-type: application/json' -d '{"post": {"title": "Hello", "author": {"name": "ann"}}}'`
//! - `curl 'localhost:3000/api/posts?search=hello'`
//! - `curl localhost:3000/api/posts/1`

use std::env;
use std::sync::Arc;

use axum::Router;
use crudhook::{
    CrudEntity, CrudError, CrudOptions, CrudResource, EntityManager, HookRegistry, PopulateOption,
    Schema, SeaOrmDriver, crud_hooks,
};
use sea_orm::{ConnectionTrait, Database};
use serde_json::{Value, json};

#[derive(CrudEntity)]
#[crudhook(table = "authors", keys = "increment")]
pub struct Author {
    #[crudhook(primary_key)]
    pub id: i64,
    pub name: String,
    #[crudhook(hidden)]
    pub email: Option<String>,
    #[crudhook(one_to_many = "Post", mapped_by = "author")]
    pub posts: Vec<Value>,
}

#[derive(CrudEntity)]
#[crudhook(table = "posts", keys = "increment")]
pub struct Post {
    #[crudhook(primary_key)]
    pub id: i64,
    pub title: String,
    pub body: Option<String>,
    #[crudhook(ty = "datetime", on_create = "now", on_update = "now")]
    pub updated_at: String,
    #[crudhook(many_to_one = "Author")]
    pub author: Option<Value>,
    #[crudhook(one_to_many = "Comment", mapped_by = "post", orphan_removal)]
    pub comments: Vec<Value>,
}

#[derive(CrudEntity)]
#[crudhook(table = "comments", keys = "increment")]
pub struct Comment {
    #[crudhook(primary_key)]
    pub id: i64,
    pub body: String,
    #[crudhook(many_to_one = "Post")]
    pub post: Option<Value>,
}

const SCHEMA_SQL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS authors (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, email TEXT)",
    "CREATE TABLE IF NOT EXISTS posts (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT NOT NULL, body TEXT, updated_at TEXT, author_id INTEGER)",
    "CREATE TABLE IF NOT EXISTS comments (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT NOT NULL, post_id INTEGER)",
];

struct PostHooks;

#[crud_hooks(resource = "post")]
impl PostHooks {
    /// Titles are required and trimmed.
    #[before_create]
    #[before_update]
    async fn check_title(&self, #[body("post")] post: Value) -> Result<(), CrudError> {
        match post.get("title") {
            Some(Value::String(title)) if title.trim().is_empty() => {
                Err(CrudError::validation("a post needs a title"))
            }
            _ => Ok(()),
        }
    }

    /// Add the number of comments to every post view.
    #[after_view]
    async fn comment_count(&self, #[entity] post: Value) -> Value {
        let comments = post["comments"].as_array().map_or(0, Vec::len);
        json!({ "post": post, "comment_count": comments })
    }

    #[after_commit]
    async fn audit(&self, #[entity] post: Option<Value>) {
        if let Some(post) = post {
            tracing::info!(id = %post["id"], "post committed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,crudhook=debug".into()),
        )
        .init();

    let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string());
    let db = Database::connect(&database_url).await?;
    for statement in SCHEMA_SQL {
        db.execute_unprepared(statement).await?;
    }

    let schema = Schema::new()
        .with_entity::<Author>()
        .with_entity::<Post>()
        .with_entity::<Comment>();
    let em = EntityManager::new(schema, SeaOrmDriver::new(db))?;

    let mut registry = HookRegistry::new();
    registry.provide(Arc::new(PostHooks));
    let registry = Arc::new(registry);

    let posts = CrudResource::new(
        CrudOptions::new("post", "Post")
            .path("posts")
            .filter(["title", "author.name"])
            .populate(PopulateOption::Flag(true)),
        Arc::clone(&registry),
        &em,
    )?;
    let authors = CrudResource::new(
        CrudOptions::new("author", "Author").path("authors").filter(["name"]),
        Arc::clone(&registry),
        &em,
    )?;
    let comments = CrudResource::new(
        CrudOptions::new("comment", "Comment").path("comments"),
        registry,
        &em,
    )?;

    let app = Router::new()
        .merge(posts.router())
        .merge(authors.router())
        .merge(comments.router());

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
    tracing::info!("API: http://0.0.0.0:3000/api/posts");
    axum::serve(listener, app).await?;
    Ok(())
}
