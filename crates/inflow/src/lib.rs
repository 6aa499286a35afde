//! Inflow: watches directories for files that have stopped changing and loads
//! them into a relational sink.
//!
//! The pipeline is a set of actors wired together by [`service::Service`]:
//!
//! - **scanner**: lists the watched directories and promotes files whose size
//!   and timestamps held still for several passes
//! - **dispatch**: queues ready files and hands each to the least-loaded writer
//! - **writer**: one sink connection per worker; binds the file into a
//!   statement and runs it
//! - **mover**: moves finished files into dated success/error folders
//! - **calendar**: holds and stops the pipeline on a weekly schedule
//! - **telemetry**: level log files plus error and digest rows in the sink

pub mod calendar;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod mover;
pub mod scanner;
pub mod service;
pub mod telemetry;
pub mod types;
pub mod writer;

pub use calendar::HoldState;
pub use config::{Settings, CONFIG_FILE_NAME};
pub use error::{InflowError, Result};
pub use service::{Service, ServiceHandle, STOP_GRACE};
pub use telemetry::Telemetry;
