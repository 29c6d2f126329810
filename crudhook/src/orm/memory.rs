//! In-memory storage driver.
//!
//! Transactions are serialized: `begin` takes the store lock and works on a
//! copy of every table, `commit` writes the copy back. Good for tests, demos
//! and prototypes; nothing survives the process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::CrudError;
use crate::orm::driver::{Driver, Page, SortOrder, Transaction};
use crate::orm::filter::{Filter, sort_order, values_equal};
use crate::orm::meta::{Row, TableDef};

#[derive(Debug, Clone, Default)]
struct Store {
    tables: HashMap<String, Vec<Row>>,
    sequences: HashMap<String, i64>,
}

/// Driver keeping every table in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    store: Arc<Mutex<Store>>,
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of `table`, in insertion order.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.store
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn begin(&self) -> Result<Box<dyn Transaction>, CrudError> {
        let guard = Arc::clone(&self.store).lock_owned().await;
        let working = Store::clone(&guard);
        tracing::trace!("memory transaction started");
        Ok(Box::new(MemoryTransaction { guard, working }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Store>,
    working: Store,
}

impl MemoryTransaction {
    fn table_mut(&mut self, table: &TableDef) -> &mut Vec<Row> {
        self.working.tables.entry(table.name.clone()).or_default()
    }

    fn table(&self, table: &TableDef) -> &[Row] {
        self.working
            .tables
            .get(&table.name)
            .map_or(&[], Vec::as_slice)
    }
}

/// Fails when two rows share a value of a unique column or the full primary key.
fn check_unique(table: &TableDef, rows: &[Row]) -> Result<(), CrudError> {
    let unique_columns = table.columns.iter().filter(|c| c.unique).map(|c| &c.name);
    for column in unique_columns {
        for (i, row) in rows.iter().enumerate() {
            let Some(value) = row.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = rows[i + 1..]
                .iter()
                .any(|other| other.get(column).is_some_and(|o| values_equal(o, value)));
            if clash {
                return Err(CrudError::conflict(format!(
                    "UNIQUE constraint failed: {}.{column}",
                    table.name
                )));
            }
        }
    }
    if table.primary_keys.is_empty() {
        return Ok(());
    }
    for (i, row) in rows.iter().enumerate() {
        let same_key = |other: &Row| {
            table.primary_keys.iter().all(|pk| {
                match (row.get(pk), other.get(pk)) {
                    (Some(a), Some(b)) => !a.is_null() && values_equal(a, b),
                    _ => false,
                }
            })
        };
        if rows[i + 1..].iter().any(same_key) {
            return Err(CrudError::conflict(format!(
                "UNIQUE constraint failed: {}.{}",
                table.name,
                table.primary_keys.join(", ")
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn select(
        &mut self,
        table: &TableDef,
        filter: &Filter,
        page: &Page,
    ) -> Result<Vec<Row>, CrudError> {
        let mut rows: Vec<Row> = self
            .table(table)
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        if !page.order_by.is_empty() {
            rows.sort_by(|a, b| {
                page.order_by
                    .iter()
                    .map(|(column, order)| {
                        let ordering = sort_order(
                            a.get(column).unwrap_or(&Value::Null),
                            b.get(column).unwrap_or(&Value::Null),
                        );
                        match order {
                            SortOrder::Asc => ordering,
                            SortOrder::Desc => ordering.reverse(),
                        }
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        let offset = usize::try_from(page.offset).unwrap_or(usize::MAX);
        let limit = page
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&mut self, table: &TableDef, filter: &Filter) -> Result<u64, CrudError> {
        let count = self.table(table).iter().filter(|row| filter.matches(row)).count();
        Ok(count as u64)
    }

    async fn insert(&mut self, table: &TableDef, mut row: Row) -> Result<Row, CrudError> {
        for column in &table.columns {
            row.entry(column.name.clone()).or_insert(Value::Null);
        }
        if let Some(column) = &table.auto_increment {
            let sequence = self.working.sequences.entry(table.name.clone()).or_insert(0);
            match row.get(column).and_then(Value::as_i64) {
                Some(given) => *sequence = (*sequence).max(given),
                None => {
                    *sequence += 1;
                    row.insert(column.clone(), Value::from(*sequence));
                }
            }
        }
        let rows = self.table_mut(table);
        rows.push(row.clone());
        if let Err(err) = check_unique(table, rows) {
            rows.pop();
            return Err(err);
        }
        Ok(row)
    }

    async fn update(
        &mut self,
        table: &TableDef,
        filter: &Filter,
        changes: Row,
    ) -> Result<u64, CrudError> {
        let mut next = self.table(table).to_vec();
        let mut touched = 0;
        for row in next.iter_mut().filter(|row| filter.matches(row)) {
            for (column, value) in &changes {
                row.insert(column.clone(), value.clone());
            }
            touched += 1;
        }
        check_unique(table, &next)?;
        *self.table_mut(table) = next;
        Ok(touched)
    }

    async fn delete(&mut self, table: &TableDef, filter: &Filter) -> Result<u64, CrudError> {
        let rows = self.table_mut(table);
        let before = rows.len();
        rows.retain(|row| !filter.matches(row));
        Ok((before - rows.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), CrudError> {
        let Self { mut guard, working } = *self;
        *guard = working;
        tracing::trace!("memory transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), CrudError> {
        tracing::trace!("memory transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orm::meta::{EntityMeta, KeyGeneration, PropertyMeta, ScalarType};
    use serde_json::json;

    fn posts() -> TableDef {
        EntityMeta::new("Post", "posts")
            .primary_key("id", ScalarType::Integer)
            .key_generation(KeyGeneration::Increment)
            .property(PropertyMeta::scalar("slug", ScalarType::Text).unique())
            .table_def()
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_sequence_and_commits() {
        let driver = MemoryDriver::new();
        let mut txn = driver.begin().await.unwrap();
        let first = txn.insert(&posts(), row(json!({"slug": "a"}))).await.unwrap();
        let second = txn.insert(&posts(), row(json!({"slug": "b"}))).await.unwrap();
        assert_eq!(first["id"], json!(1));
        assert_eq!(second["id"], json!(2));
        txn.commit().await.unwrap();
        assert_eq!(driver.rows("posts").await.len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let driver = MemoryDriver::new();
        let mut txn = driver.begin().await.unwrap();
        txn.insert(&posts(), row(json!({"slug": "a"}))).await.unwrap();
        txn.rollback().await.unwrap();
        assert!(driver.rows("posts").await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_changes() {
        let driver = MemoryDriver::new();
        {
            let mut txn = driver.begin().await.unwrap();
            txn.insert(&posts(), row(json!({"slug": "a"}))).await.unwrap();
        }
        assert!(driver.rows("posts").await.is_empty());
    }

    #[tokio::test]
    async fn test_unique_violation_is_conflict() {
        let driver = MemoryDriver::new();
        let mut txn = driver.begin().await.unwrap();
        txn.insert(&posts(), row(json!({"slug": "a"}))).await.unwrap();
        let err = txn
            .insert(&posts(), row(json!({"slug": "a"})))
            .await
            .unwrap_err();
        assert!(matches!(err, CrudError::Conflict { .. }));
        assert_eq!(txn.count(&posts(), &Filter::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_select_orders_and_pages() {
        let driver = MemoryDriver::new();
        let mut txn = driver.begin().await.unwrap();
        for slug in ["a", "b", "c"] {
            txn.insert(&posts(), row(json!({ "slug": slug }))).await.unwrap();
        }
        let page = Page {
            order_by: vec![("id".to_string(), SortOrder::Desc)],
            offset: 1,
            limit: Some(1),
        };
        let rows = txn.select(&posts(), &Filter::All, &page).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["slug"], json!("b"));
    }

    #[tokio::test]
    async fn test_update_and_delete_by_filter() {
        let driver = MemoryDriver::new();
        let mut txn = driver.begin().await.unwrap();
        txn.insert(&posts(), row(json!({"slug": "a"}))).await.unwrap();
        txn.insert(&posts(), row(json!({"slug": "b"}))).await.unwrap();

        let touched = txn
            .update(
                &posts(),
                &Filter::eq("id", json!(1)),
                row(json!({"slug": "z"})),
            )
            .await
            .unwrap();
        assert_eq!(touched, 1);
        let clash = txn
            .update(&posts(), &Filter::eq("id", json!(2)), row(json!({"slug": "z"})))
            .await;
        assert!(clash.is_err());

        let removed = txn.delete(&posts(), &Filter::eq("slug", json!("z"))).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(txn.count(&posts(), &Filter::All).await.unwrap(), 1);
    }
}
