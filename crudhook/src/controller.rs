//! The five REST routes of a resource.
//!
//! | Method   | Path                     | Success | Errors                      |
//! |----------|--------------------------|---------|-----------------------------|
//! | `GET`    | `{prefix}/{path}`        | 200     | default mapping             |
//! | `GET`    | `{prefix}/{path}/{pk..}` | 200     | 404, 409, otherwise 400     |
//! | `POST`   | `{prefix}/{path}`        | 201     | default mapping             |
//! | `PATCH`  | `{prefix}/{path}/{pk..}` | 200     | 404, 409, otherwise 400     |
//! | `DELETE` | `{prefix}/{path}/{pk..}` | 200     | 404, 409, otherwise 400     |

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, delete, get, patch, post};
use axum::{Json, Router};
use serde_json::Value;

use crate::core::options::CrudOptions;
use crate::core::request::{RequestData, ResponseHandle, SearchQuery, UploadedFiles};
use crate::core::service::CrudService;
use crate::errors::{CrudError, Intercepted};
use crate::hooks::HookRegistry;
use crate::orm::EntityManager;
use crate::pagination::content_range;

/// Largest accepted request body, the same as axum's default limit.
const BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Router state of a resource.
pub type CrudState = Arc<CrudService>;

type Decorator = Arc<dyn Fn(MethodRouter<CrudState>) -> MethodRouter<CrudState> + Send + Sync>;

/// Route selector for [`CrudResource::decorate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrudMethod {
    Search,
    Get,
    Create,
    Update,
    /// Create and update
    Upsert,
    Delete,
    All,
}

impl CrudMethod {
    fn covers(self, route: Self) -> bool {
        self == route || self == Self::All || (self == Self::Upsert && matches!(route, Self::Create | Self::Update))
    }
}

/// A CRUD resource: its service plus the Axum routes in front of it.
///
/// ```rust,ignore
/// let posts = CrudResource::new(
///     CrudOptions::new("post", "Post").filter(["title"]),
///     Arc::clone(&registry),
///     &em,
/// )?
/// .decorate(CrudMethod::Upsert, |route| route.route_layer(middleware::from_fn(auth)));
/// let app = Router::new().merge(posts.router());
/// ```
pub struct CrudResource {
    service: CrudState,
    decorators: Vec<(CrudMethod, Decorator)>,
}

impl CrudResource {
    /// # Errors
    ///
    /// Returns a validation error when the options do not match the schema.
    pub fn new(
        options: CrudOptions,
        registry: Arc<HookRegistry>,
        em: &EntityManager,
    ) -> Result<Self, CrudError> {
        Ok(Self {
            service: Arc::new(CrudService::new(options, registry, em)?),
            decorators: Vec::new(),
        })
    }

    /// Wrap the method router of one or more routes, e.g. with
    /// `route_layer`. Decorators apply in the order they were added.
    #[must_use]
    pub fn decorate<F>(mut self, method: CrudMethod, decorator: F) -> Self
    where
        F: Fn(MethodRouter<CrudState>) -> MethodRouter<CrudState> + Send + Sync + 'static,
    {
        self.decorators.push((method, Arc::new(decorator)));
        self
    }

    #[must_use]
    pub fn service(&self) -> CrudState {
        Arc::clone(&self.service)
    }

    fn apply(&self, route: CrudMethod, mut router: MethodRouter<CrudState>) -> MethodRouter<CrudState> {
        for (method, decorator) in &self.decorators {
            if method.covers(route) {
                router = decorator(router);
            }
        }
        router
    }

    /// Collection and item paths, e.g. `/api/post` and `/api/post/{id}`.
    #[must_use]
    pub fn paths(&self) -> (String, String) {
        let options = self.service.options();
        let collection = format!(
            "{}/{}",
            options.prefix.trim_end_matches('/'),
            options.route_path().trim_matches('/')
        );
        let keys = self
            .service
            .primary_keys()
            .iter()
            .map(|pk| format!("{{{pk}}}"))
            .collect::<Vec<_>>()
            .join("/");
        let item = format!("{collection}/{keys}");
        (collection, item)
    }

    #[must_use]
    pub fn router(self) -> Router {
        let (collection, item) = self.paths();
        let collection_routes = self
            .apply(CrudMethod::Search, get(search_handler))
            .merge(self.apply(CrudMethod::Create, post(create_handler)));
        let item_routes = self
            .apply(CrudMethod::Get, get(get_handler))
            .merge(self.apply(CrudMethod::Update, patch(update_handler)))
            .merge(self.apply(CrudMethod::Delete, delete(delete_handler)));
        tracing::debug!(%collection, %item, "mounted CRUD resource");
        Router::new()
            .route(&collection, collection_routes)
            .route(&item, item_routes)
            .with_state(self.service)
    }
}

/// Collect everything the service needs from the request.
async fn read_request(
    params: HashMap<String, String>,
    query: SearchQuery,
    request: Request,
) -> Result<RequestData, CrudError> {
    let (mut parts, body) = request.into_parts();
    let bytes = to_bytes(body, BODY_LIMIT)
        .await
        .map_err(|e| CrudError::validation(format!("failed to read request body: {e}")))?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .map_err(|e| CrudError::validation(format!("invalid JSON body: {e}")))?
    };
    let uploads = parts.extensions.remove::<UploadedFiles>().unwrap_or_default();

    let mut data = RequestData::new()
        .with_query(query)
        .with_body(body)
        .with_files(uploads);
    for (key, value) in params {
        data = data.with_param(key, value);
    }
    data.request = Some(Arc::new(parts));
    Ok(data)
}

fn finish(handle: &ResponseHandle, mut response: Response) -> Response {
    handle.apply(&mut response);
    response
}

async fn search_handler(
    State(service): State<CrudState>,
    Query(query): Query<SearchQuery>,
    request: Request,
) -> Response {
    let data = match read_request(HashMap::new(), query, request).await {
        Ok(data) => data,
        Err(e) => return e.into_response(),
    };
    let handle = data.response.clone();
    match service.search(data).await {
        Ok(result) => {
            let range = content_range(
                result.offset,
                result.limit,
                result.count,
                &service.options().name,
            );
            let mut response = Json(result).into_response();
            if let Some(range) = range {
                response.headers_mut().insert(header::CONTENT_RANGE, range);
            }
            finish(&handle, response)
        }
        Err(e) => e.into_response(),
    }
}

async fn get_handler(
    State(service): State<CrudState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<SearchQuery>,
    request: Request,
) -> Response {
    let data = match read_request(params, query, request).await {
        Ok(data) => data,
        Err(e) => return Intercepted(e).into_response(),
    };
    let handle = data.response.clone();
    match service.get(data).await {
        Ok(view) => finish(&handle, Json(view).into_response()),
        Err(e) => Intercepted(e).into_response(),
    }
}

async fn create_handler(
    State(service): State<CrudState>,
    Query(query): Query<SearchQuery>,
    request: Request,
) -> Response {
    let mut data = match read_request(HashMap::new(), query, request).await {
        Ok(data) => data,
        Err(e) => return e.into_response(),
    };
    if let Some(dto) = &service.options().create_dto {
        data.body = match dto(data.body) {
            Ok(body) => body,
            Err(e) => return e.into_response(),
        };
    }
    let handle = data.response.clone();
    match service.create(data).await {
        Ok(keys) => finish(&handle, (StatusCode::CREATED, Json(keys)).into_response()),
        Err(e) => e.into_response(),
    }
}

async fn update_handler(
    State(service): State<CrudState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<SearchQuery>,
    request: Request,
) -> Response {
    let mut data = match read_request(params, query, request).await {
        Ok(data) => data,
        Err(e) => return Intercepted(e).into_response(),
    };
    if let Some(dto) = &service.options().update_dto {
        data.body = match dto(data.body) {
            Ok(body) => body,
            Err(e) => return Intercepted(e).into_response(),
        };
    }
    let handle = data.response.clone();
    match service.update(data).await {
        Ok(()) => finish(&handle, StatusCode::OK.into_response()),
        Err(e) => Intercepted(e).into_response(),
    }
}

async fn delete_handler(
    State(service): State<CrudState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<SearchQuery>,
    request: Request,
) -> Response {
    let data = match read_request(params, query, request).await {
        Ok(data) => data,
        Err(e) => return Intercepted(e).into_response(),
    };
    let handle = data.response.clone();
    match service.delete(data).await {
        Ok(()) => finish(&handle, StatusCode::OK.into_response()),
        Err(e) => Intercepted(e).into_response(),
    }
}
