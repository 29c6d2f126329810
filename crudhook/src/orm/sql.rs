//! Sea-ORM storage driver.
//!
//! Statements are built with `sea_query` for the connection's backend and run
//! inside a [`DatabaseTransaction`]. Rows come back as JSON objects through
//! Sea-ORM's `FromQueryResult` implementation for `serde_json::Value`.

use async_trait::async_trait;
use sea_orm::sea_query::{
    Alias, Asterisk, Condition, Expr, Order, Query, SimpleExpr, Value as SqlValue,
};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, FromQueryResult,
    StatementBuilder, TransactionTrait,
};
use serde_json::Value;

use crate::errors::CrudError;
use crate::orm::driver::{Driver, Page, SortOrder, Transaction};
use crate::orm::filter::{Filter, Operator};
use crate::orm::meta::{Row, TableDef};

/// Driver running every CRUD request in a Sea-ORM transaction.
#[derive(Debug, Clone)]
pub struct SeaOrmDriver {
    db: DatabaseConnection,
}

impl SeaOrmDriver {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl Driver for SeaOrmDriver {
    async fn begin(&self) -> Result<Box<dyn Transaction>, CrudError> {
        let txn = self.db.begin().await?;
        Ok(Box::new(SeaOrmTransaction { txn }))
    }
}

struct SeaOrmTransaction {
    txn: DatabaseTransaction,
}

impl SeaOrmTransaction {
    fn backend(&self) -> DbBackend {
        self.txn.get_database_backend()
    }

    fn build<S: StatementBuilder>(&self, statement: &S) -> sea_orm::Statement {
        let statement = self.backend().build(statement);
        tracing::trace!(sql = %statement, "executing");
        statement
    }
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::String(None),
        Value::Bool(b) => SqlValue::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::from(i),
            None => SqlValue::from(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::from(s.clone()),
        other => SqlValue::from(other.to_string()),
    }
}

fn compare(field: &str, op: Operator, value: &Value) -> SimpleExpr {
    let column = Expr::col(Alias::new(field));
    match (op, value) {
        (Operator::Eq, Value::Null) => column.is_null(),
        (Operator::Ne, Value::Null) => column.is_not_null(),
        (Operator::Eq, v) => column.eq(sql_value(v)),
        (Operator::Ne, v) => column.ne(sql_value(v)),
        (Operator::Gt, v) => column.gt(sql_value(v)),
        (Operator::Gte, v) => column.gte(sql_value(v)),
        (Operator::Lt, v) => column.lt(sql_value(v)),
        (Operator::Lte, v) => column.lte(sql_value(v)),
        (Operator::In | Operator::Nin, v) => {
            let items: Vec<SqlValue> = v.as_array().map_or_else(
                || vec![sql_value(v)],
                |items| items.iter().map(sql_value).collect(),
            );
            match (op, items.is_empty()) {
                (Operator::In, true) => Expr::cust("1 = 0"),
                (Operator::Nin, true) => Expr::cust("1 = 1"),
                (Operator::In, false) => column.is_in(items),
                _ => column.is_not_in(items),
            }
        }
        (Operator::Like, Value::String(pattern)) => column.like(pattern.as_str()),
        (Operator::Like, v) => column.like(v.to_string()),
    }
}

fn condition(filter: &Filter) -> Condition {
    match filter {
        Filter::All => Condition::all(),
        Filter::And(parts) => parts
            .iter()
            .fold(Condition::all(), |c, part| c.add(condition(part))),
        Filter::Or(parts) if parts.is_empty() => Condition::all().add(Expr::cust("1 = 0")),
        Filter::Or(parts) => parts
            .iter()
            .fold(Condition::any(), |c, part| c.add(condition(part))),
        Filter::Not(inner) => condition(inner).not(),
        Filter::Compare { field, op, value } => Condition::all().add(compare(field, *op, value)),
    }
}

fn invalid(err: impl std::fmt::Display) -> CrudError {
    CrudError::internal("Failed to build a statement", Some(err.to_string()))
}

fn into_row(value: Value) -> Row {
    match value {
        Value::Object(row) => row,
        _ => Row::new(),
    }
}

#[async_trait]
impl Transaction for SeaOrmTransaction {
    async fn select(
        &mut self,
        table: &TableDef,
        filter: &Filter,
        page: &Page,
    ) -> Result<Vec<Row>, CrudError> {
        let mut query = Query::select();
        query
            .column(Asterisk)
            .from(Alias::new(&table.name))
            .cond_where(condition(filter));
        for (column, order) in &page.order_by {
            let order = match order {
                SortOrder::Asc => Order::Asc,
                SortOrder::Desc => Order::Desc,
            };
            query.order_by(Alias::new(column), order);
        }
        match page.limit {
            Some(limit) => {
                query.limit(limit);
            }
            // SQLite and MySQL only accept OFFSET after a LIMIT.
            None if page.offset > 0 => {
                query.limit(i64::MAX.unsigned_abs());
            }
            None => {}
        }
        if page.offset > 0 {
            query.offset(page.offset);
        }
        let statement = self.build(&query);
        let rows = Value::find_by_statement(statement).all(&self.txn).await?;
        Ok(rows.into_iter().map(into_row).collect())
    }

    async fn count(&mut self, table: &TableDef, filter: &Filter) -> Result<u64, CrudError> {
        let mut query = Query::select();
        query
            .expr_as(Expr::col(Asterisk).count(), Alias::new("total"))
            .from(Alias::new(&table.name))
            .cond_where(condition(filter));
        let statement = self.build(&query);
        let total: i64 = match self.txn.query_one(statement).await? {
            Some(row) => row.try_get("", "total")?,
            None => 0,
        };
        Ok(total.unsigned_abs())
    }

    async fn insert(&mut self, table: &TableDef, mut row: Row) -> Result<Row, CrudError> {
        let generated = table
            .auto_increment
            .as_ref()
            .filter(|column| row.get(*column).is_none_or(Value::is_null))
            .cloned();
        if let Some(column) = &generated {
            row.remove(column);
        }

        let mut insert = Query::insert();
        insert.into_table(Alias::new(&table.name));
        if row.is_empty() {
            insert.or_default_values();
        } else {
            insert.columns(row.keys().map(Alias::new));
            insert
                .values(row.values().map(|v| SimpleExpr::from(sql_value(v))))
                .map_err(invalid)?;
        }

        let Some(column) = generated else {
            let statement = self.build(&insert);
            self.txn.execute(statement).await?;
            return Ok(row);
        };

        let id = if self.backend() == DbBackend::Postgres {
            insert.returning_col(Alias::new(&column));
            let statement = self.build(&insert);
            match self.txn.query_one(statement).await? {
                Some(result) => result.try_get::<i64>("", &column)?,
                None => return Err(CrudError::internal("Insert returned no row", None)),
            }
        } else {
            let statement = self.build(&insert);
            let result = self.txn.execute(statement).await?;
            i64::try_from(result.last_insert_id()).map_err(invalid)?
        };
        row.insert(column, Value::from(id));
        Ok(row)
    }

    async fn update(
        &mut self,
        table: &TableDef,
        filter: &Filter,
        changes: Row,
    ) -> Result<u64, CrudError> {
        if changes.is_empty() {
            return Ok(0);
        }
        let mut update = Query::update();
        update
            .table(Alias::new(&table.name))
            .values(
                changes
                    .iter()
                    .map(|(column, value)| (Alias::new(column), SimpleExpr::from(sql_value(value)))),
            )
            .cond_where(condition(filter));
        let statement = self.build(&update);
        Ok(self.txn.execute(statement).await?.rows_affected())
    }

    async fn delete(&mut self, table: &TableDef, filter: &Filter) -> Result<u64, CrudError> {
        let mut delete = Query::delete();
        delete
            .from_table(Alias::new(&table.name))
            .cond_where(condition(filter));
        let statement = self.build(&delete);
        Ok(self.txn.execute(statement).await?.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), CrudError> {
        self.txn.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), CrudError> {
        self.txn.rollback().await?;
        Ok(())
    }
}
