//! Query Executor
//!
//! Runs validated statements against the read-only dataset. Failures are
//! captured in the returned `ExecutionResult`, never raised.

use crate::db::DbPool;
use crate::error::Result;
use crate::execution::result::{ExecutionResult, QueryRows};
use crate::sql_validator::ValidatedSql;
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Executor, Row, Statement, TypeInfo, ValueRef};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, statement: &ValidatedSql) -> ExecutionResult;
}

pub struct SqliteExecutor {
    pool: DbPool,
    timeout: Duration,
    max_rows: usize,
}

impl SqliteExecutor {
    pub fn new(pool: DbPool, timeout: Duration, max_rows: usize) -> Self {
        Self {
            pool,
            timeout,
            max_rows,
        }
    }

    async fn run(&self, sql: &str) -> Result<QueryRows> {
        // Connection and transaction are scoped to this call; dropping `tx`
        // (also on timeout or cancellation) rolls back and returns the
        // connection to the pool.
        let mut tx = self.pool.begin().await?;

        let columns: Vec<String> = {
            let statement = (&mut *tx).prepare(sql).await?;
            statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect()
        };

        let mut rows = Vec::new();
        let mut truncated = false;
        {
            let mut stream = sqlx::query(sql).fetch(&mut *tx);
            while let Some(row) = stream.try_next().await? {
                if rows.len() == self.max_rows {
                    truncated = true;
                    break;
                }
                rows.push(decode_row(&row));
            }
        }
        tx.rollback().await?;

        Ok(QueryRows {
            columns,
            rows,
            truncated,
            execution_time_ms: 0,
        })
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn execute(&self, statement: &ValidatedSql) -> ExecutionResult {
        let started = Instant::now();
        debug!("Executing SQL: {}", statement.sql());

        match tokio::time::timeout(self.timeout, self.run(statement.sql())).await {
            Ok(Ok(mut rows)) => {
                rows.execution_time_ms = started.elapsed().as_millis() as u64;
                if rows.truncated {
                    warn!("Result capped at {} rows", self.max_rows);
                }
                info!(
                    "Query returned {} rows in {}ms",
                    rows.len(),
                    rows.execution_time_ms
                );
                ExecutionResult::Rows(rows)
            }
            Ok(Err(e)) => {
                warn!("Query execution failed: {}", e);
                ExecutionResult::error(e.to_string())
            }
            Err(_) => {
                warn!("Query timed out after {:?}", self.timeout);
                ExecutionResult::timeout(format!("query timed out after {:?}", self.timeout))
            }
        }
    }
}

/// Decode every column of a row into JSON values using the storage class
/// SQLite reports for each cell.
pub fn decode_row(row: &SqliteRow) -> Vec<Value> {
    (0..row.len()).map(|index| decode_cell(row, index)).collect()
}

fn decode_cell(row: &SqliteRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_uppercase(),
        Err(_) => return Value::Null,
    };

    let decoded = match type_name.as_str() {
        "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => row.try_get::<i64, _>(index).map(Value::from).ok(),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => row.try_get::<f64, _>(index).map(Value::from).ok(),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|bytes| Value::from(format!("<{} bytes>", bytes.len())))
            .ok(),
        _ => None,
    };

    decoded
        .or_else(|| row.try_get::<String, _>(index).map(Value::from).ok())
        .unwrap_or(Value::Null)
}
