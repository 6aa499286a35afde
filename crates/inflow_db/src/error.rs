//! Error types for the sink layer.

use thiserror::Error;

/// Sink operation result type.
pub type Result<T> = std::result::Result<T, SinkError>;

/// Sink errors, split by whether the statement ever reached the database.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Socket, TLS, pool or authentication failure. The statement was not run
    /// and may be retried unchanged once the connection recovers.
    #[error("connect error: {0}")]
    Connect(String),

    /// The database accepted the connection but rejected the statement.
    #[error("exec error: {0}")]
    Exec(String),
}

impl SinkError {
    /// Create a connect-class error.
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Create an exec-class error.
    pub fn exec(msg: impl Into<String>) -> Self {
        Self::Exec(msg.into())
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect(_))
    }

    /// Classify an sqlx error.
    ///
    /// SQLSTATE classes `08` (connection exception) and `28` (invalid
    /// authorization) count as connect-class along with transport and pool errors.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => Self::Connect(err.to_string()),
            sqlx::Error::Database(db) => match db.code() {
                Some(code) if code.starts_with("08") || code.starts_with("28") => {
                    Self::Connect(err.to_string())
                }
                _ => Self::Exec(err.to_string()),
            },
            _ => Self::Exec(err.to_string()),
        }
    }

    /// Wrap an error raised while opening a connection; always connect-class.
    pub fn on_connect(err: impl std::fmt::Display) -> Self {
        Self::Connect(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlx_transport_errors_are_connect_class() {
        assert!(SinkError::from_sqlx(sqlx::Error::PoolTimedOut).is_connect());
        assert!(SinkError::from_sqlx(sqlx::Error::PoolClosed).is_connect());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(SinkError::from_sqlx(sqlx::Error::Io(io)).is_connect());
    }

    #[test]
    fn test_sqlx_row_errors_are_exec_class() {
        assert!(!SinkError::from_sqlx(sqlx::Error::RowNotFound).is_connect());
        assert!(!SinkError::from_sqlx(sqlx::Error::Protocol("bad".into())).is_connect());
    }

    #[test]
    fn test_display_keeps_message() {
        assert_eq!(
            SinkError::exec("no such table: x").to_string(),
            "exec error: no such table: x"
        );
    }
}
