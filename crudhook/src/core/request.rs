use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, request::Parts};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use serde_with::{DisplayFromStr, PickFirst, serde_as};

/// Query parameters of the search endpoint.
///
/// # Searching
/// - `search` alone matches `%search%` against every configured filter column
///   (joined with `$or`), for example `?search=rust`.
/// - `search` with `category` matches only that property path, for example
///   `?search=ann&category=author.name`.
///
/// # Exact matches
/// Any configured filter column given as a parameter is matched exactly, for
/// example `?status=published`.
///
/// # Sorting and paging
/// - `sort` names a column and `order` is `asc` or `desc` (default), for
///   example `?sort=title&order=asc`. Without `sort` the first primary key is
///   used, descending.
/// - `offset` and `limit` fall back to the resource defaults when absent or
///   zero.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Every other parameter, candidates for exact matches.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SearchQuery {
    /// Build the base filter of a search.
    ///
    /// `columns` are the resource's filter columns; `appendix` holds exact
    /// matches and is merged into the result.
    #[must_use]
    pub fn to_filter(&self, columns: &[String], appendix: Map<String, Value>) -> Value {
        let mut filter = Map::new();
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            let pattern = json!({ "$like": format!("%{search}%") });
            if let Some(category) = self.category.as_deref().filter(|c| !c.is_empty()) {
                set_path(&mut filter, category, pattern);
            } else if !columns.is_empty() {
                let alternatives = columns
                    .iter()
                    .map(|column| {
                        let mut alternative = Map::new();
                        set_path(&mut alternative, column, pattern.clone());
                        Value::Object(alternative)
                    })
                    .collect();
                filter.insert("$or".to_string(), Value::Array(alternatives));
            }
        }
        merge(&mut filter, appendix);
        Value::Object(filter)
    }

    /// Exact-match values for the filter columns present in the query.
    #[must_use]
    pub fn appendix(&self, columns: &[String]) -> Map<String, Value> {
        columns
            .iter()
            .filter_map(|column| {
                self.extra
                    .get(column)
                    .map(|value| (column.clone(), value.clone()))
            })
            .collect()
    }
}

/// Place `value` at the dotted `path`, creating intermediate objects.
fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                set_path(child, rest, value);
            }
        }
    }
}

/// Deep merge: objects merge key by key, arrays concatenate, anything else is
/// replaced by `source`.
fn merge(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, incoming) in source {
        match (target.get_mut(&key), incoming) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge(existing, incoming),
            (Some(Value::Array(existing)), Value::Array(incoming)) => existing.extend(incoming),
            (_, incoming) => {
                target.insert(key, incoming);
            }
        }
    }
}

/// A file received with the request. Multipart parsing happens outside this
/// crate; middleware stores files in the request extensions as
/// [`UploadedFiles`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadedFile {
    pub field_name: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
    /// Location on local disk, relative to the blob store root
    pub path: Option<PathBuf>,
    /// Object key in a remote store
    pub key: Option<String>,
}

/// Request extension carrying the files of a request.
#[derive(Debug, Clone, Default)]
pub struct UploadedFiles {
    pub file: Option<UploadedFile>,
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Default)]
struct ResponseState {
    status: Option<StatusCode>,
    headers: HeaderMap,
}

/// Lets hooks shape the HTTP response: override the status or add headers.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct ResponseHandle {
    state: Arc<Mutex<ResponseState>>,
}

impl ResponseHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: StatusCode) {
        self.lock().status = Some(status);
    }

    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.lock().headers.insert(name, value);
    }

    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.lock().status
    }

    #[must_use]
    pub fn headers(&self) -> HeaderMap {
        self.lock().headers.clone()
    }

    /// Apply the recorded status and headers to a successful response.
    pub fn apply(&self, response: &mut Response) {
        let state = self.lock();
        if let Some(status) = state.status {
            *response.status_mut() = status;
        }
        for (name, value) in &state.headers {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResponseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything the router extracted from one HTTP request.
#[derive(Debug, Clone, Default)]
pub struct RequestData {
    pub request: Option<Arc<Parts>>,
    pub response: ResponseHandle,
    /// Route parameters, one per primary key
    pub params: Map<String, Value>,
    pub query: SearchQuery,
    pub body: Value,
    pub file: Option<UploadedFile>,
    pub files: Vec<UploadedFile>,
}

impl RequestData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: SearchQuery) -> Self {
        self.query = query;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    #[must_use]
    pub fn with_files(mut self, uploads: UploadedFiles) -> Self {
        self.file = uploads.file;
        self.files = uploads.files;
        self
    }

    /// Uploaded files of the request, single file first.
    pub fn uploads(&self) -> impl Iterator<Item = &UploadedFile> {
        self.file.iter().chain(self.files.iter())
    }
}
