use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CrudError;

/// Lifecycle events emitted by the CRUD orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrudHook {
    SearchQuery,
    BeforeSearch,
    AfterSearch,
    GetQuery,
    BeforeGet,
    AfterGet,
    BeforeView,
    AfterView,
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    BeforeUpsert,
    AfterUpsert,
    BeforePersist,
    AfterPersist,
    BeforeFlush,
    AfterFlush,
    BeforeCommit,
    AfterCommit,
    BeforeRollback,
    AfterRollback,
}

impl CrudHook {
    pub const ALL: [Self; 24] = [
        Self::SearchQuery,
        Self::BeforeSearch,
        Self::AfterSearch,
        Self::GetQuery,
        Self::BeforeGet,
        Self::AfterGet,
        Self::BeforeView,
        Self::AfterView,
        Self::BeforeCreate,
        Self::AfterCreate,
        Self::BeforeUpdate,
        Self::AfterUpdate,
        Self::BeforeDelete,
        Self::AfterDelete,
        Self::BeforeUpsert,
        Self::AfterUpsert,
        Self::BeforePersist,
        Self::AfterPersist,
        Self::BeforeFlush,
        Self::AfterFlush,
        Self::BeforeCommit,
        Self::AfterCommit,
        Self::BeforeRollback,
        Self::AfterRollback,
    ];

    /// Stable kebab-case name, e.g. `"before-create"`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SearchQuery => "search-query",
            Self::BeforeSearch => "before-search",
            Self::AfterSearch => "after-search",
            Self::GetQuery => "get-query",
            Self::BeforeGet => "before-get",
            Self::AfterGet => "after-get",
            Self::BeforeView => "before-view",
            Self::AfterView => "after-view",
            Self::BeforeCreate => "before-create",
            Self::AfterCreate => "after-create",
            Self::BeforeUpdate => "before-update",
            Self::AfterUpdate => "after-update",
            Self::BeforeDelete => "before-delete",
            Self::AfterDelete => "after-delete",
            Self::BeforeUpsert => "before-upsert",
            Self::AfterUpsert => "after-upsert",
            Self::BeforePersist => "before-persist",
            Self::AfterPersist => "after-persist",
            Self::BeforeFlush => "before-flush",
            Self::AfterFlush => "after-flush",
            Self::BeforeCommit => "before-commit",
            Self::AfterCommit => "after-commit",
            Self::BeforeRollback => "before-rollback",
            Self::AfterRollback => "after-rollback",
        }
    }
}

impl fmt::Display for CrudHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrudHook {
    type Err = CrudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|hook| hook.as_str() == s)
            .ok_or_else(|| CrudError::validation(format!("unknown CRUD hook '{s}'")))
    }
}

/// Slots of the per-request state bag that a hook parameter can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrudParam {
    /// The request's entity manager
    EntityManager,
    /// Primary key names of the resource
    Keys,
    Request,
    Response,
    Query,
    Params,
    Body,
    Filter,
    Entity,
    Entities,
    File,
    Files,
    Options,
}

impl CrudParam {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EntityManager => "entity-manager",
            Self::Keys => "keys",
            Self::Request => "request",
            Self::Response => "response",
            Self::Query => "query",
            Self::Params => "params",
            Self::Body => "body",
            Self::Filter => "filter",
            Self::Entity => "entity",
            Self::Entities => "entities",
            Self::File => "file",
            Self::Files => "files",
            Self::Options => "options",
        }
    }
}

impl fmt::Display for CrudParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
