//! Sink capability for inflow.
//!
//! The service only ever hands a sink plain statement text; everything the
//! statement needs is embedded as escaped literals by the caller. A sink answers
//! with the result sets it produced or a [`SinkError`] that says whether the
//! failure happened before the statement ran (connect) or while running it (exec).
//!
//! # Usage
//!
//! ```rust,ignore
//! use inflow_db::{SinkConnector, UrlConnector};
//!
//! let mut sink = UrlConnector.connect("sqlite://inflow.db?mode=rwc").await?;
//! let response = sink.execute("SELECT 1 AS hold_seconds").await?;
//! assert_eq!(response.hold_seconds(), Some(1));
//! ```

mod error;
pub mod memory;
#[cfg(feature = "mssql")]
mod mssql;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod sql;
mod types;

pub use error::{Result, SinkError};
pub use memory::{MemoryConnector, MemoryScript, MemorySink};
pub use types::{DatabaseType, SinkResponse, SinkTable, SinkValue, HOLD_SECONDS_COLUMN};

use async_trait::async_trait;
use tracing::info;

/// One outbound connection able to run statements.
#[async_trait]
pub trait Sink: Send {
    fn database_type(&self) -> DatabaseType;

    /// Run a (possibly multi-statement) text and collect every result set.
    async fn execute(&mut self, statement: &str) -> Result<SinkResponse>;
}

/// Opens sinks. Connection failures are always [`SinkError::Connect`].
#[async_trait]
pub trait SinkConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Sink>>;
}

/// Connector that picks the backend from the URL scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlConnector;

#[async_trait]
impl SinkConnector for UrlConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Sink>> {
        let db_type = DatabaseType::from_url(url)
            .ok_or_else(|| SinkError::connect(format!("unsupported sink url \"{}\"", url)))?;

        let sink: Box<dyn Sink> = match db_type {
            DatabaseType::Memory => Box::new(MemorySink::new(MemoryScript::default())),
            DatabaseType::Sqlite | DatabaseType::Postgres => {
                connect_sqlx(db_type, url).await?
            }
            DatabaseType::Mssql => connect_mssql(url).await?,
        };

        info!(database = %db_type, "Sink connected");
        Ok(sink)
    }
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
async fn connect_sqlx(db_type: DatabaseType, url: &str) -> Result<Box<dyn Sink>> {
    Ok(Box::new(sql::SqlxSink::connect(db_type, url).await?))
}

#[cfg(not(any(feature = "sqlite", feature = "postgres")))]
async fn connect_sqlx(db_type: DatabaseType, _url: &str) -> Result<Box<dyn Sink>> {
    Err(SinkError::connect(format!(
        "{} support not compiled in. Rebuild with the 'sqlite' or 'postgres' feature.",
        db_type
    )))
}

#[cfg(feature = "mssql")]
async fn connect_mssql(url: &str) -> Result<Box<dyn Sink>> {
    Ok(Box::new(mssql::MssqlSink::connect(url).await?))
}

#[cfg(not(feature = "mssql"))]
async fn connect_mssql(_url: &str) -> Result<Box<dyn Sink>> {
    Err(SinkError::connect(
        "SQL Server support not compiled in. Rebuild with the 'mssql' feature.",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_url_connects_with_any_feature_set() {
        let sink = UrlConnector.connect("memory://").await.unwrap();
        assert_eq!(sink.database_type(), DatabaseType::Memory);
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_connect_class() {
        let err = UrlConnector.connect("oracle://db").await.err().unwrap();
        assert!(matches!(err, SinkError::Connect(_)));
    }

    #[cfg(not(any(feature = "sqlite", feature = "postgres")))]
    #[tokio::test]
    async fn test_sqlx_backends_missing_is_connect_class() {
        let err = UrlConnector.connect("sqlite://x.db").await.err().unwrap();
        assert!(matches!(err, SinkError::Connect(_)));
    }
}
