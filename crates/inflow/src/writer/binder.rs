//! Statement preambles.
//!
//! Every statement sent to the sink is a dialect-specific preamble that binds
//! the values (file parts, digest counters or error lines) followed by the
//! user's statement text. SQL Server gets `@variables` and a `#temp` table;
//! SQLite and PostgreSQL get session temp tables with snake_case columns.

use inflow_db::DatabaseType;

use super::transform::Payload;
use crate::types::{DigestCounts, FileStamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binder {
    Mssql,
    Sqlite,
    Postgres,
}

/// Escape a value for use inside a single-quoted SQL literal.
pub fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// Preamble and statement, newline separated.
pub fn compose(preamble: &str, statement: &str) -> String {
    format!("{}\n{}", preamble, statement)
}

impl Binder {
    pub fn for_database(database: DatabaseType) -> Self {
        match database {
            DatabaseType::Mssql => Binder::Mssql,
            DatabaseType::Postgres => Binder::Postgres,
            DatabaseType::Sqlite | DatabaseType::Memory => Binder::Sqlite,
        }
    }

    fn text(self, value: &str) -> String {
        match self {
            Binder::Mssql => format!("N'{}'", escape(value)),
            Binder::Sqlite | Binder::Postgres => format!("'{}'", escape(value)),
        }
    }

    fn data(self, payload: &Payload) -> String {
        match (self, payload) {
            (_, Payload::Marker) => self.text(""),
            (_, Payload::Text(text)) => self.text(text),
            (Binder::Mssql, Payload::Hex(hex)) => format!("0x{}", hex),
            (Binder::Sqlite, Payload::Hex(hex)) => format!("X'{}'", hex),
            (Binder::Postgres, Payload::Hex(hex)) => format!("decode('{}', 'hex')", hex),
        }
    }

    fn drop_temp(self, table: &str) -> String {
        match self {
            Binder::Sqlite => format!("DROP TABLE IF EXISTS temp.{};", table),
            Binder::Postgres => format!("DROP TABLE IF EXISTS pg_temp.{};", table),
            Binder::Mssql => format!(
                "IF OBJECT_ID('tempdb..#{0}') IS NOT NULL DROP TABLE #{0};",
                table
            ),
        }
    }

    /// Binds the file's directory, stem, extension (with its dot) and data.
    pub fn file(self, stamp: &FileStamp, payload: &Payload) -> String {
        let dir = stamp.dir.display().to_string();
        let (stem, ext) = stamp.split_name();
        let data = self.data(payload);

        match self {
            Binder::Mssql => {
                let data_type = match payload {
                    Payload::Marker => "NVARCHAR(1)",
                    Payload::Text(_) => "NVARCHAR(MAX)",
                    Payload::Hex(_) => "VARBINARY(MAX)",
                };
                [
                    format!("DECLARE @filePath NVARCHAR(MAX); SET @filePath = {};", self.text(&dir)),
                    format!(
                        "DECLARE @fileNameWithoutExt NVARCHAR(MAX); SET @fileNameWithoutExt = {};",
                        self.text(stem)
                    ),
                    format!("DECLARE @fileExt NVARCHAR(MAX); SET @fileExt = {};", self.text(ext)),
                    format!("DECLARE @data {}; SET @data = {};", data_type, data),
                ]
                .join("\n")
            }
            Binder::Sqlite | Binder::Postgres => [
                self.drop_temp("inflow_file"),
                format!(
                    "CREATE TEMP TABLE inflow_file AS SELECT {} AS file_path, {} AS file_name_without_ext, {} AS file_ext, {} AS data;",
                    self.text(&dir),
                    self.text(stem),
                    self.text(ext),
                    data
                ),
            ]
            .join("\n"),
        }
    }

    pub fn digest(self, counts: DigestCounts, message: &str) -> String {
        match self {
            Binder::Mssql => [
                format!("DECLARE @countSuccess INT; SET @countSuccess = {};", counts.success),
                format!("DECLARE @countError INT; SET @countError = {};", counts.error),
                format!("DECLARE @countQueue INT; SET @countQueue = {};", counts.queue),
                format!("DECLARE @message NVARCHAR(MAX); SET @message = {};", self.text(message)),
            ]
            .join("\n"),
            Binder::Sqlite | Binder::Postgres => [
                self.drop_temp("inflow_digest"),
                format!(
                    "CREATE TEMP TABLE inflow_digest AS SELECT {} AS count_success, {} AS count_error, {} AS count_queue, {} AS message;",
                    counts.success,
                    counts.error,
                    counts.queue,
                    self.text(message)
                ),
            ]
            .join("\n"),
        }
    }

    /// Binds error lines as rows of `inflow_errors` (`#inflow_errors` on SQL
    /// Server) in their original order.
    pub fn errors(self, lines: &[String]) -> String {
        let mut out = vec![self.drop_temp("inflow_errors")];
        match self {
            Binder::Mssql => {
                out.push(
                    "CREATE TABLE #inflow_errors ([id] INT IDENTITY(1,1), [message] NVARCHAR(MAX));"
                        .to_string(),
                );
                if !lines.is_empty() {
                    out.push("INSERT INTO #inflow_errors ([message])".to_string());
                    let selects: Vec<String> = lines
                        .iter()
                        .map(|line| format!("SELECT {}", self.text(line)))
                        .collect();
                    out.push(format!("{};", selects.join(" UNION ALL\n")));
                }
            }
            Binder::Sqlite | Binder::Postgres => {
                out.push("CREATE TEMP TABLE inflow_errors (id INTEGER, message TEXT);".to_string());
                if !lines.is_empty() {
                    let rows: Vec<String> = lines
                        .iter()
                        .enumerate()
                        .map(|(idx, line)| format!("({}, {})", idx + 1, self.text(line)))
                        .collect();
                    out.push(format!(
                        "INSERT INTO inflow_errors (id, message) VALUES\n{};",
                        rows.join(",\n")
                    ));
                }
            }
        }
        out.join("\n")
    }
}
