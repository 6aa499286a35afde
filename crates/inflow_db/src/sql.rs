//! sqlx-backed sinks (SQLite, PostgreSQL).
//!
//! Each sink holds a single-connection pool so that temporary tables created by
//! a statement preamble are visible to the rest of the same statement text.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::Either;

use crate::{DatabaseType, Result, Sink, SinkError, SinkResponse, SinkTable, SinkValue};

#[cfg(feature = "sqlite")]
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

enum SqlxPool {
    #[cfg(feature = "sqlite")]
    Sqlite(sqlx::SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(sqlx::PgPool),
}

pub(crate) struct SqlxSink {
    db_type: DatabaseType,
    pool: SqlxPool,
}

impl SqlxSink {
    pub(crate) async fn connect(db_type: DatabaseType, url: &str) -> Result<Self> {
        let pool = match db_type {
            DatabaseType::Sqlite => connect_sqlite(url).await?,
            DatabaseType::Postgres => connect_postgres(url).await?,
            other => {
                return Err(SinkError::connect(format!(
                    "{} is not an sqlx backend",
                    other
                )))
            }
        };
        Ok(Self { db_type, pool })
    }
}

#[cfg(feature = "sqlite")]
async fn connect_sqlite(url: &str) -> Result<SqlxPool> {
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::str::FromStr;

    let options = SqliteConnectOptions::from_str(url)
        .map_err(SinkError::on_connect)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(SQLITE_BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await
        .map_err(SinkError::on_connect)?;
    Ok(SqlxPool::Sqlite(pool))
}

#[cfg(not(feature = "sqlite"))]
async fn connect_sqlite(_url: &str) -> Result<SqlxPool> {
    Err(SinkError::connect(
        "SQLite support not compiled in. Rebuild with the 'sqlite' feature.",
    ))
}

#[cfg(feature = "postgres")]
async fn connect_postgres(url: &str) -> Result<SqlxPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(url)
        .await
        .map_err(SinkError::on_connect)?;
    Ok(SqlxPool::Postgres(pool))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(_url: &str) -> Result<SqlxPool> {
    Err(SinkError::connect(
        "PostgreSQL support not compiled in. Rebuild with the 'postgres' feature.",
    ))
}

#[async_trait]
impl Sink for SqlxSink {
    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn execute(&mut self, statement: &str) -> Result<SinkResponse> {
        match &self.pool {
            #[cfg(feature = "sqlite")]
            SqlxPool::Sqlite(pool) => run_sqlite(pool, statement).await,
            #[cfg(feature = "postgres")]
            SqlxPool::Postgres(pool) => run_postgres(pool, statement).await,
        }
    }
}

/// Splits the row stream into result sets at every statement boundary.
#[derive(Default)]
struct TableCollector {
    response: SinkResponse,
    current: SinkTable,
}

impl TableCollector {
    fn end_statement(&mut self) {
        if !self.current.is_empty() {
            self.response.tables.push(std::mem::take(&mut self.current));
        }
    }

    fn push_row(&mut self, columns: impl FnOnce() -> Vec<String>, values: Vec<SinkValue>) {
        if self.current.columns.is_empty() {
            self.current.columns = columns();
        }
        self.current.rows.push(values);
    }

    fn finish(mut self) -> SinkResponse {
        self.end_statement();
        self.response
    }
}

#[cfg(feature = "sqlite")]
async fn run_sqlite(pool: &sqlx::SqlitePool, statement: &str) -> Result<SinkResponse> {
    use sqlx::{Column, Row};

    let mut collector = TableCollector::default();
    let mut stream = sqlx::raw_sql(statement).fetch_many(pool);
    while let Some(step) = stream.try_next().await.map_err(SinkError::from_sqlx)? {
        match step {
            Either::Left(_) => collector.end_statement(),
            Either::Right(row) => {
                let values = (0..row.columns().len())
                    .map(|idx| sqlite_value(&row, idx))
                    .collect();
                collector.push_row(
                    || row.columns().iter().map(|c| c.name().to_string()).collect(),
                    values,
                );
            }
        }
    }
    Ok(collector.finish())
}

#[cfg(feature = "sqlite")]
fn sqlite_value(row: &sqlx::sqlite::SqliteRow, idx: usize) -> SinkValue {
    use sqlx::Row;

    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(SinkValue::Integer).unwrap_or(SinkValue::Null);
    }
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return SinkValue::Real(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
        return SinkValue::Text(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return SinkValue::Blob(v);
    }
    SinkValue::Null
}

#[cfg(feature = "postgres")]
async fn run_postgres(pool: &sqlx::PgPool, statement: &str) -> Result<SinkResponse> {
    use sqlx::{Column, Row};

    let mut collector = TableCollector::default();
    let mut stream = sqlx::raw_sql(statement).fetch_many(pool);
    while let Some(step) = stream.try_next().await.map_err(SinkError::from_sqlx)? {
        match step {
            Either::Left(_) => collector.end_statement(),
            Either::Right(row) => {
                let values = (0..row.columns().len())
                    .map(|idx| postgres_value(&row, idx))
                    .collect();
                collector.push_row(
                    || row.columns().iter().map(|c| c.name().to_string()).collect(),
                    values,
                );
            }
        }
    }
    Ok(collector.finish())
}

#[cfg(feature = "postgres")]
fn postgres_value(row: &sqlx::postgres::PgRow, idx: usize) -> SinkValue {
    use sqlx::Row;

    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(SinkValue::Integer).unwrap_or(SinkValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|v| SinkValue::Integer(i64::from(v))).unwrap_or(SinkValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|v| SinkValue::Integer(i64::from(v))).unwrap_or(SinkValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(SinkValue::Real).unwrap_or(SinkValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(SinkValue::Boolean).unwrap_or(SinkValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(SinkValue::Text).unwrap_or(SinkValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(SinkValue::Blob).unwrap_or(SinkValue::Null);
    }
    SinkValue::Null
}
