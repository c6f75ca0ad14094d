//! CockroachDB client: a pgx-style pool plus single-statement transactions
//! with serializable-conflict retry.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use metrics::histogram;
use serde_json::{Map, Value};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::Type;
use tokio_postgres::{NoTls, Row};
use tracing::warn;

const MAX_TX_ATTEMPTS: u32 = 5;

#[derive(Debug)]
pub struct CrdbClient {
    pool: Pool,
}

enum TxOutcome {
    Rows(Vec<Row>),
    Count(u64),
}

impl CrdbClient {
    pub fn connect(conn_string: &str) -> Result<Self> {
        let config = conn_string
            .parse::<tokio_postgres::Config>()
            .context("parsing connection string")?;
        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(4)
            .build()
            .context("building connection pool")?;
        Ok(CrdbClient { pool })
    }

    /// Execute a statement in its own transaction; returns affected rows.
    pub async fn exec_tx(&self, stmt: &str) -> Result<u64> {
        match self.run_tx(stmt, false).await? {
            TxOutcome::Count(n) => Ok(n),
            TxOutcome::Rows(_) => unreachable!("exec_tx never asks for rows"),
        }
    }

    /// Run a query in its own transaction; returns all rows.
    pub async fn query_tx(&self, query: &str) -> Result<Vec<Row>> {
        match self.run_tx(query, true).await? {
            TxOutcome::Rows(rows) => Ok(rows),
            TxOutcome::Count(_) => unreachable!("query_tx always asks for rows"),
        }
    }

    async fn run_tx(&self, stmt: &str, want_rows: bool) -> Result<TxOutcome> {
        let started = Instant::now();
        let mut attempt = 0;
        let res = loop {
            attempt += 1;
            match self.try_once(stmt, want_rows).await {
                Ok(out) => break Ok(out),
                Err(e) if is_serialization_conflict(&e) && attempt < MAX_TX_ATTEMPTS => {
                    warn!(attempt, "transaction hit a serialization conflict, retrying");
                    tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                }
                Err(e) => break Err(e),
            }
        };
        let result = if res.is_ok() { "success" } else { "error" };
        histogram!(
            "database_transaction_duration_seconds",
            started.elapsed().as_secs_f64(),
            "result" => result
        );
        res
    }

    async fn try_once(&self, stmt: &str, want_rows: bool) -> Result<TxOutcome> {
        let mut client = self
            .pool
            .get()
            .await
            .context("acquiring connection from pool")?;
        let tx = client.transaction().await?;
        let out = if want_rows {
            TxOutcome::Rows(tx.query(stmt, &[]).await?)
        } else {
            TxOutcome::Count(tx.execute(stmt, &[]).await?)
        };
        tx.commit().await?;
        Ok(out)
    }
}

fn is_serialization_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<tokio_postgres::Error>()
        .and_then(|e| e.code())
        == Some(&SqlState::T_R_SERIALIZATION_FAILURE)
}

/// Convert rows into JSON maps keyed by column name, covering the column
/// types trigger and source queries are expected to produce.
pub fn rows_to_json(rows: &[Row]) -> Vec<Map<String, Value>> {
    rows.iter().map(row_to_json).collect()
}

fn row_to_json(row: &Row) -> Map<String, Value> {
    let mut out = Map::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), column_value(row, idx));
    }
    out
}

fn column_value(row: &Row, idx: usize) -> Value {
    let ty = row.columns()[idx].type_();
    if *ty == Type::BOOL {
        nullable(row.try_get::<_, Option<bool>>(idx).map(|o| o.map(Value::from)))
    } else if *ty == Type::INT2 {
        nullable(row.try_get::<_, Option<i16>>(idx).map(|o| o.map(Value::from)))
    } else if *ty == Type::INT4 {
        nullable(row.try_get::<_, Option<i32>>(idx).map(|o| o.map(Value::from)))
    } else if *ty == Type::INT8 {
        nullable(row.try_get::<_, Option<i64>>(idx).map(|o| o.map(Value::from)))
    } else if *ty == Type::FLOAT4 {
        nullable(row.try_get::<_, Option<f32>>(idx).map(|o| o.map(Value::from)))
    } else if *ty == Type::FLOAT8 {
        nullable(row.try_get::<_, Option<f64>>(idx).map(|o| o.map(Value::from)))
    } else if *ty == Type::UUID {
        nullable(
            row.try_get::<_, Option<uuid::Uuid>>(idx)
                .map(|o| o.map(|u| Value::from(u.to_string()))),
        )
    } else if *ty == Type::TIMESTAMPTZ {
        nullable(
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                .map(|o| o.map(|t| Value::from(t.to_rfc3339()))),
        )
    } else if *ty == Type::TIMESTAMP {
        nullable(
            row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)
                .map(|o| o.map(|t| Value::from(t.to_string()))),
        )
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        nullable(row.try_get::<_, Option<Value>>(idx))
    } else if *ty == Type::BYTEA {
        nullable(
            row.try_get::<_, Option<Vec<u8>>>(idx)
                .map(|o| o.map(|b| Value::from(hex_string(&b)))),
        )
    } else {
        match row.try_get::<_, Option<String>>(idx) {
            Ok(v) => v.map(Value::from).unwrap_or(Value::Null),
            Err(_) => {
                warn!(
                    column = row.columns()[idx].name(),
                    r#type = %ty,
                    "unsupported column type, emitting null"
                );
                Value::Null
            }
        }
    }
}

fn nullable(res: Result<Option<Value>, tokio_postgres::Error>) -> Value {
    res.ok().flatten().unwrap_or(Value::Null)
}

pub(crate) fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encoding() {
        assert_eq!(hex_string(&[0x00, 0xde, 0xad, 0x0f]), "00dead0f");
        assert_eq!(hex_string(&[]), "");
    }
}
