//! Error types for the inflow service.

use thiserror::Error;

use crate::config::ConfigError;
use crate::writer::TransformError;

/// Service result type.
pub type Result<T> = std::result::Result<T, InflowError>;

/// Top-level service errors.
///
/// Actor loops never surface these; they log per-item failures and keep going.
/// This type is for start-up and for the few helpers that callers may want to
/// inspect.
#[derive(Error, Debug)]
pub enum InflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sink error: {0}")]
    Sink(#[from] inflow_db::SinkError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),
}
