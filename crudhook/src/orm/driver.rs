//! Storage drivers.
//!
//! A driver only knows tables, columns and storage-level [`Filter`]s. Relation
//! paths, populate plans and key generation are resolved by the
//! [`EntityManager`](super::EntityManager) before a driver sees a query.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CrudError;
use crate::orm::filter::Filter;
use crate::orm::meta::{Row, TableDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    /// `"asc"` (any case) is ascending, everything else descending.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        if text.eq_ignore_ascii_case("asc") {
            Self::Asc
        } else {
            Self::Desc
        }
    }
}

/// Ordering and window of a select.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub order_by: Vec<(String, SortOrder)>,
    pub offset: u64,
    /// `None` selects every remaining row.
    pub limit: Option<u64>,
}

/// Opens transactions against one store.
#[async_trait]
pub trait Driver: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the store refuses a new transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>, CrudError>;
}

/// Table-level operations inside one transaction.
///
/// Dropping a transaction without calling [`commit`](Transaction::commit)
/// discards its changes.
#[async_trait]
pub trait Transaction: Send {
    async fn select(
        &mut self,
        table: &TableDef,
        filter: &Filter,
        page: &Page,
    ) -> Result<Vec<Row>, CrudError>;

    async fn count(&mut self, table: &TableDef, filter: &Filter) -> Result<u64, CrudError>;

    /// Insert `row` and return it as stored, including a generated
    /// auto-increment key.
    async fn insert(&mut self, table: &TableDef, row: Row) -> Result<Row, CrudError>;

    /// Apply `changes` to every matching row; returns the number of rows touched.
    async fn update(
        &mut self,
        table: &TableDef,
        filter: &Filter,
        changes: Row,
    ) -> Result<u64, CrudError>;

    async fn delete(&mut self, table: &TableDef, filter: &Filter) -> Result<u64, CrudError>;

    async fn commit(self: Box<Self>) -> Result<(), CrudError>;

    async fn rollback(self: Box<Self>) -> Result<(), CrudError>;
}
