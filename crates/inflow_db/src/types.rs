//! Value types returned by a sink.

use std::fmt;

/// Column name a statement can return to ask for a later retry of the file.
pub const HOLD_SECONDS_COLUMN: &str = "hold_seconds";

/// Supported sink database types, detected from the connection URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    Sqlite,
    Postgres,
    Mssql,
    /// In-process sink that records statements (dry run and tests).
    Memory,
}

impl DatabaseType {
    /// Detect the database type from a connection URL.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split_once(':').map(|(scheme, _)| scheme)?;
        match scheme.to_ascii_lowercase().as_str() {
            "sqlite" => Some(Self::Sqlite),
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mssql" | "sqlserver" => Some(Self::Mssql),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sqlite => "SQLite",
            Self::Postgres => "PostgreSQL",
            Self::Mssql => "SQL Server",
            Self::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
}

impl SinkValue {
    /// Best-effort integer view used for control columns.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SinkValue::Integer(v) => Some(*v),
            SinkValue::Real(v) if v.is_finite() => Some(v.trunc() as i64),
            SinkValue::Text(s) => s.trim().parse().ok(),
            SinkValue::Boolean(b) => Some(i64::from(*b)),
            _ => None,
        }
    }
}

impl From<i64> for SinkValue {
    fn from(v: i64) -> Self {
        SinkValue::Integer(v)
    }
}

impl From<f64> for SinkValue {
    fn from(v: f64) -> Self {
        SinkValue::Real(v)
    }
}

impl From<&str> for SinkValue {
    fn from(v: &str) -> Self {
        SinkValue::Text(v.to_string())
    }
}

impl From<String> for SinkValue {
    fn from(v: String) -> Self {
        SinkValue::Text(v)
    }
}

/// One result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SinkValue>>,
}

impl SinkTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_row(mut self, row: Vec<SinkValue>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }
}

/// Every result set produced by one executed statement, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkResponse {
    pub tables: Vec<SinkTable>,
}

impl SinkResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: SinkTable) -> Self {
        self.tables.push(table);
        self
    }

    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|table| table.rows.len()).sum()
    }

    /// Positive `hold_seconds` from the last row of the last result set.
    ///
    /// Statements use this to ask for the file to be retried later without
    /// treating the load as failed.
    pub fn hold_seconds(&self) -> Option<u64> {
        let table = self.tables.last()?;
        let idx = table.column_index(HOLD_SECONDS_COLUMN)?;
        let row = table.rows.last()?;
        let seconds = row.get(idx)?.as_i64()?;
        u64::try_from(seconds).ok().filter(|s| *s > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hold_table(value: SinkValue) -> SinkTable {
        SinkTable::new(vec!["id".into(), "HOLD_SECONDS".into()])
            .with_row(vec![SinkValue::Integer(1), SinkValue::Integer(0)])
            .with_row(vec![SinkValue::Integer(2), value])
    }

    #[test]
    fn test_database_type_from_url() {
        assert_eq!(
            DatabaseType::from_url("sqlite://data.db"),
            Some(DatabaseType::Sqlite)
        );
        assert_eq!(
            DatabaseType::from_url("postgresql://localhost/db"),
            Some(DatabaseType::Postgres)
        );
        assert_eq!(
            DatabaseType::from_url("mssql://sa:pw@localhost:1433/db"),
            Some(DatabaseType::Mssql)
        );
        assert_eq!(DatabaseType::from_url("memory://"), Some(DatabaseType::Memory));
        assert_eq!(DatabaseType::from_url("oracle://x"), None);
        assert_eq!(DatabaseType::from_url("no scheme"), None);
    }

    #[test]
    fn test_hold_seconds_reads_last_row_of_last_table() {
        let response = SinkResponse::empty()
            .with_table(SinkTable::new(vec!["hold_seconds".into()]).with_row(vec![99.into()]))
            .with_table(hold_table(SinkValue::Text("45".into())));
        assert_eq!(response.hold_seconds(), Some(45));
    }

    #[test]
    fn test_hold_seconds_ignores_non_positive_and_missing() {
        let zero = SinkResponse::empty().with_table(hold_table(SinkValue::Integer(0)));
        assert_eq!(zero.hold_seconds(), None);

        let negative = SinkResponse::empty().with_table(hold_table(SinkValue::Integer(-5)));
        assert_eq!(negative.hold_seconds(), None);

        let null = SinkResponse::empty().with_table(hold_table(SinkValue::Null));
        assert_eq!(null.hold_seconds(), None);

        let no_column = SinkResponse::empty()
            .with_table(SinkTable::new(vec!["id".into()]).with_row(vec![1.into()]));
        assert_eq!(no_column.hold_seconds(), None);

        assert_eq!(SinkResponse::empty().hold_seconds(), None);
    }
}
