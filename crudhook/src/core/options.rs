use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::request::SearchQuery;
use crate::errors::CrudError;
use crate::orm::Populate;
use crate::storage::BlobStore;

/// Paging defaults of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrudDefaults {
    pub offset: u64,
    /// `None` disables the limit.
    pub limit: Option<u64>,
}

impl Default for CrudDefaults {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: Some(300),
        }
    }
}

impl CrudDefaults {
    /// Offset and limit of a search: the query's values, or the defaults when
    /// absent or zero.
    #[must_use]
    pub fn window(&self, query: &SearchQuery) -> (u64, Option<u64>) {
        (
            query.offset.filter(|o| *o > 0).unwrap_or(self.offset),
            query.limit.filter(|l| *l > 0).or(self.limit),
        )
    }
}

/// Relations to populate, either for every operation or separately for
/// search and get.
///
/// Deserializes from `true`, `["author", "comments"]` or
/// `{"search": ["author"], "get": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PopulateOption {
    Flag(bool),
    Paths(Vec<String>),
    PerOperation {
        #[serde(default)]
        search: Populate,
        #[serde(default)]
        get: Populate,
    },
}

impl Default for PopulateOption {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl PopulateOption {
    fn resolve(&self, for_search: bool) -> Populate {
        match self {
            Self::Flag(false) => Populate::None,
            Self::Flag(true) => Populate::All,
            Self::Paths(paths) => Populate::Paths(paths.clone()),
            Self::PerOperation { search, get } => {
                if for_search {
                    search.clone()
                } else {
                    get.clone()
                }
            }
        }
    }

    #[must_use]
    pub fn for_search(&self) -> Populate {
        self.resolve(true)
    }

    #[must_use]
    pub fn for_get(&self) -> Populate {
        self.resolve(false)
    }
}

/// Validates and normalizes a request body by passing it through a Rust type.
pub type Dto = Arc<dyn Fn(Value) -> Result<Value, CrudError> + Send + Sync>;

fn dto_of<T>() -> Dto
where
    T: DeserializeOwned + Serialize,
{
    Arc::new(|body| {
        let typed: T = serde_json::from_value(body)
            .map_err(|e| CrudError::validation(format!("invalid request body: {e}")))?;
        Ok(serde_json::to_value(typed)?)
    })
}

/// Configuration of one CRUD resource.
///
/// ```rust,ignore
/// let options = CrudOptions::new("post", "Post")
///     .filter(["title", "author.name"])
///     .populate(PopulateOption::Paths(vec!["author".into()]))
///     .create_dto::<CreatePost>();
/// ```
#[derive(Clone)]
pub struct CrudOptions {
    /// Resource name: hooks are registered under it and bodies wrap the
    /// entity under this key.
    pub name: String,
    /// Entity name in the schema
    pub entity: String,
    pub path: Option<String>,
    pub prefix: String,
    /// Defaults to the entity's primary keys
    pub primary_keys: Option<Vec<String>>,
    pub populate: PopulateOption,
    pub filter: Vec<String>,
    pub defaults: CrudDefaults,
    pub create_dto: Option<Dto>,
    pub update_dto: Option<Dto>,
    /// Where uploads are removed from on rollback; the working directory
    /// when unset
    pub storage: Option<Arc<dyn BlobStore>>,
    /// Deleting a missing entity fails with `NotFound` instead of succeeding.
    pub strict_delete: bool,
}

impl fmt::Debug for CrudOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrudOptions")
            .field("name", &self.name)
            .field("entity", &self.entity)
            .field("path", &self.path)
            .field("prefix", &self.prefix)
            .field("primary_keys", &self.primary_keys)
            .field("populate", &self.populate)
            .field("filter", &self.filter)
            .field("defaults", &self.defaults)
            .field("strict_delete", &self.strict_delete)
            .finish_non_exhaustive()
    }
}

impl CrudOptions {
    #[must_use]
    pub fn new(name: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity: entity.into(),
            path: None,
            prefix: "/api".to_string(),
            primary_keys: None,
            populate: PopulateOption::default(),
            filter: Vec::new(),
            defaults: CrudDefaults::default(),
            create_dto: None,
            update_dto: None,
            storage: None,
            strict_delete: false,
        }
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn primary_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn populate(mut self, populate: PopulateOption) -> Self {
        self.populate = populate;
        self
    }

    /// Columns matched by `search`, and matched exactly when given as query
    /// parameters. Dotted paths reach into relations.
    #[must_use]
    pub fn filter<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn defaults(mut self, defaults: CrudDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    #[must_use]
    pub fn create_dto<T>(mut self) -> Self
    where
        T: DeserializeOwned + Serialize,
    {
        self.create_dto = Some(dto_of::<T>());
        self
    }

    #[must_use]
    pub fn update_dto<T>(mut self) -> Self
    where
        T: DeserializeOwned + Serialize,
    {
        self.update_dto = Some(dto_of::<T>());
        self
    }

    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn BlobStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn strict_delete(mut self, strict: bool) -> Self {
        self.strict_delete = strict;
        self
    }

    /// URL path segment, the resource name unless set.
    #[must_use]
    pub fn route_path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }

    /// Relations to populate for a search. With filter columns configured,
    /// these are the relations named by dotted filter columns.
    #[must_use]
    pub fn search_populate(&self) -> Populate {
        if self.filter.is_empty() {
            return self.populate.for_search();
        }
        let mut paths: Vec<String> = Vec::new();
        for column in &self.filter {
            if let Some((path, _)) = column.rsplit_once('.') {
                if !paths.iter().any(|p| p == path) {
                    paths.push(path.to_string());
                }
            }
        }
        if paths.is_empty() {
            Populate::None
        } else {
            Populate::Paths(paths)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Body {
        post: Post,
    }

    #[derive(Serialize, Deserialize)]
    struct Post {
        title: String,
        #[serde(default)]
        published: bool,
    }

    #[test]
    fn test_defaults() {
        let options = CrudOptions::new("post", "Post");
        assert_eq!(options.route_path(), "post");
        assert_eq!(options.prefix, "/api");
        assert_eq!(options.defaults.limit, Some(300));
        assert_eq!(options.defaults.offset, 0);
        assert!(!options.strict_delete);
    }

    #[test]
    fn test_defaults_from_config() {
        let defaults: CrudDefaults = serde_json::from_value(json!({"limit": null})).unwrap();
        assert_eq!(defaults.limit, None);
        let defaults: CrudDefaults = serde_json::from_value(json!({"offset": 10})).unwrap();
        assert_eq!(defaults.limit, Some(300));
    }

    #[test]
    fn test_window_falls_back_to_defaults() {
        let defaults = CrudDefaults::default();
        let query = SearchQuery {
            limit: Some(0),
            ..SearchQuery::default()
        };
        assert_eq!(defaults.window(&query), (0, Some(300)));
        let query = SearchQuery {
            offset: Some(5),
            limit: Some(10),
            ..SearchQuery::default()
        };
        assert_eq!(defaults.window(&query), (5, Some(10)));
    }

    #[test]
    fn test_populate_forms() {
        let all: PopulateOption = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(all.for_get(), Populate::All);

        let per: PopulateOption =
            serde_json::from_value(json!({"search": ["author"], "get": true})).unwrap();
        assert_eq!(per.for_search(), Populate::Paths(vec!["author".to_string()]));
        assert_eq!(per.for_get(), Populate::All);
    }

    #[test]
    fn test_search_populate_from_filter_columns() {
        let options = CrudOptions::new("post", "Post")
            .populate(PopulateOption::Flag(true))
            .filter(["title", "author.name", "author.email"]);
        assert_eq!(
            options.search_populate(),
            Populate::Paths(vec!["author".to_string()])
        );
    }

    #[test]
    fn test_dto_round_trip() {
        let options = CrudOptions::new("post", "Post").create_dto::<Body>();
        let dto = options.create_dto.unwrap();
        let body = dto(json!({"post": {"title": "x", "extra": 1}})).unwrap();
        assert_eq!(body, json!({"post": {"title": "x", "published": false}}));
        assert!(dto(json!({"post": {}})).is_err());
    }
}
