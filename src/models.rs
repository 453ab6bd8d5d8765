use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current time truncated to the precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 form, so string order matches time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            ProcessStatus::Running => false,
            ProcessStatus::Completed | ProcessStatus::Failed => true,
        }
    }

    /// Terminal status for a process that exited with `exit_code`.
    pub fn for_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            ProcessStatus::Completed
        } else {
            ProcessStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
        }
    }
}

macro_rules! text_enum {
    ($ty:ident { $($text:literal => $variant:ident),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                match value.as_str()? {
                    $($text => Ok($ty::$variant),)+
                    other => Err(FromSqlError::Other(
                        format!("unknown {} '{}'", stringify!($ty), other).into(),
                    )),
                }
            }
        }
    };
}

text_enum!(ProcessStatus { "running" => Running, "completed" => Completed, "failed" => Failed });
text_enum!(LogLevel { "info" => Info, "warn" => Warn, "error" => Error, "debug" => Debug });
text_enum!(LogSource { "stdout" => Stdout, "stderr" => Stderr });

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "debug" => Ok(LogLevel::Debug),
            other => Err(format!(
                "unknown level '{}' (expected info, warn, error or debug)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    pub name: String,
    pub command: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
}

/// Input for [`crate::db::Database::create_process`].
#[derive(Debug, Clone)]
pub struct NewProcess {
    pub name: String,
    pub command: String,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Option<i64>,
    pub process_id: String,
    /// Filled by queries that join the owning process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub raw_output: String,
    pub source: LogSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Option<i64>,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub project: String,
    pub llm_model: Option<String>,
    pub files_changed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSummary {
    pub hours: u64,
    pub total_processes: u64,
    pub active_processes: u64,
    pub total_entries: u64,
    pub entries_in_window: u64,
    pub errors_in_window: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStatistics {
    pub total_logs: u64,
    pub total_processes: u64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    pub disk_usage_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub deleted_logs: u64,
    pub deleted_processes: u64,
    pub cutoff: DateTime<Utc>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub log_entries: u64,
    pub session_summaries: u64,
}

#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub root: String,
    pub project: String,
    pub branch: Option<String>,
    pub files_changed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_sort_lexically() {
        let a = parse_timestamp("2026-01-01T00:00:00Z").unwrap();
        let b = a + chrono::Duration::milliseconds(5);
        let c = a + chrono::Duration::hours(30);
        let (fa, fb, fc) = (format_timestamp(&a), format_timestamp(&b), format_timestamp(&c));
        assert_eq!(fa.len(), fb.len());
        assert!(fa < fb && fb < fc);
        assert_eq!(fa, "2026-01-01T00:00:00.000000Z");
    }

    #[test]
    fn now_round_trips_through_text() {
        let ts = now();
        assert_eq!(parse_timestamp(&format_timestamp(&ts)), Some(ts));
    }

    #[test]
    fn level_parsing_accepts_warning_alias() {
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(" error ".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert!("fatal".parse::<LogLevel>().is_err());
    }

    #[test]
    fn exit_code_maps_to_terminal_status() {
        assert_eq!(ProcessStatus::for_exit_code(0), ProcessStatus::Completed);
        assert_eq!(ProcessStatus::for_exit_code(2), ProcessStatus::Failed);
        assert_eq!(ProcessStatus::for_exit_code(-1), ProcessStatus::Failed);
        assert!(!ProcessStatus::Running.is_terminal());
    }

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&LogSource::Stderr).unwrap(), "\"stderr\"");
        assert_eq!(serde_json::to_string(&ProcessStatus::Failed).unwrap(), "\"failed\"");
    }
}
