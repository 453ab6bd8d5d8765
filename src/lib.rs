//! Capture, classify, store and search the output of wrapped processes.
//!
//! Output lines are classified by severity, persisted in an embedded
//! SQLite store and mirrored into an FTS5 index that can always be rebuilt
//! from the stored rows.

pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod git;
pub mod index;
pub mod ingest;
pub mod models;
pub mod query;
pub mod retention;
pub mod runner;
pub mod session;
pub mod tools;

pub use classify::{classify, split_lines};
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use ingest::{ExitKind, ProcessLogger};
pub use models::{
    LogEntry, LogLevel, LogSource, LogStatistics, LogSummary, NewProcess, Process, ProcessStatus,
    PruneReport, RebuildReport, SessionSummary,
};
pub use query::SearchFilter;
pub use session::NewSessionSummary;
