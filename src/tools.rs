//! Typed operations for the tool-calling layer.
//!
//! Each operation takes a serde-deserializable parameter struct, validates
//! it before touching the store and returns a serializable value. Use
//! [`respond`] to turn any outcome into a [`ToolResponse`].

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{
    now, LogEntry, LogLevel, LogStatistics, LogSummary, Process, PruneReport, RebuildReport,
    SessionSummary,
};
use crate::query::SearchFilter;
use crate::session::NewSessionSummary;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

fn default_search_limit() -> usize {
    50
}
fn default_error_limit() -> usize {
    20
}
fn default_tail_lines() -> usize {
    20
}
fn default_error_hours() -> u64 {
    1
}
fn default_summary_hours() -> u64 {
    24
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchLogsParams {
    #[serde(default)]
    pub query: String,
    pub process: Option<String>,
    pub level: Option<String>,
    pub since: Option<String>,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecentErrorsParams {
    #[serde(default = "default_error_hours")]
    pub hours: u64,
    #[serde(default = "default_error_limit")]
    pub limit: usize,
    pub process: Option<String>,
}

impl Default for RecentErrorsParams {
    fn default() -> Self {
        RecentErrorsParams {
            hours: default_error_hours(),
            limit: default_error_limit(),
            process: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListProcessesParams {
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TailParams {
    #[serde(default)]
    pub process: String,
    #[serde(default = "default_tail_lines")]
    pub lines: usize,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummaryParams {
    #[serde(default = "default_summary_hours")]
    pub hours: u64,
}

impl Default for SummaryParams {
    fn default() -> Self {
        SummaryParams {
            hours: default_summary_hours(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PruneParams {
    pub max_age_hours: Option<u64>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SaveSessionParams {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub project: String,
    pub llm_model: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchSessionsParams {
    #[serde(default)]
    pub query: String,
    pub project: Option<String>,
    #[serde(default = "default_error_limit")]
    pub limit: usize,
}

/// What the dispatch layer hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResponse {
    pub is_error: bool,
    pub text: String,
}

pub fn respond<T: Serialize>(result: Result<T>) -> ToolResponse {
    let rendered = result.and_then(|value| Ok(serde_json::to_string_pretty(&value)?));
    match rendered {
        Ok(text) => ToolResponse { is_error: false, text },
        Err(e) => ToolResponse {
            is_error: true,
            text: format!("Error: {}", e),
        },
    }
}

fn require_limit(field: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(Error::validation(format!("{} must be at least 1", field)));
    }
    Ok(value)
}

fn require_text<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::validation(format!("{} is required", field)));
    }
    Ok(value)
}

fn parse_level(raw: Option<&str>) -> Result<Option<LogLevel>> {
    raw.map(|l| l.parse::<LogLevel>().map_err(Error::Validation))
        .transpose()
}

/// An RFC 3339 timestamp or a relative duration such as `90s`, `30m`,
/// `2h` or `7d`.
pub fn parse_since(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    let invalid = || {
        Error::validation(format!(
            "since must be an RFC 3339 timestamp or a duration like 30m, 2h, 7d; got '{}'",
            raw
        ))
    };
    if raw.len() < 2 || !raw.is_char_boundary(raw.len() - 1) {
        return Err(invalid());
    }
    let (amount, unit) = raw.split_at(raw.len() - 1);
    let amount: i64 = amount.parse().map_err(|_| invalid())?;
    if amount < 0 {
        return Err(invalid());
    }
    let duration = match unit {
        "s" => Duration::try_seconds(amount),
        "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        "d" => Duration::try_days(amount),
        _ => None,
    }
    .ok_or_else(invalid)?;

    now().checked_sub_signed(duration).ok_or_else(invalid)
}

pub fn search_logs(db: &Database, params: &SearchLogsParams) -> Result<Vec<LogEntry>> {
    let query = require_text("query", &params.query)?;
    let limit = require_limit("limit", params.limit)?;
    let filter = SearchFilter {
        process_name: params.process.clone().filter(|p| !p.trim().is_empty()),
        level: parse_level(params.level.as_deref())?,
        since: params.since.as_deref().map(parse_since).transpose()?,
    };
    db.search_logs(query, limit, &filter)
}

pub fn get_recent_errors(db: &Database, params: &RecentErrorsParams) -> Result<Vec<LogEntry>> {
    let limit = require_limit("limit", params.limit)?;
    db.get_recent_errors(params.hours, limit, params.process.as_deref())
}

pub fn list_processes(db: &Database, params: &ListProcessesParams) -> Result<Vec<Process>> {
    db.list_processes(params.active_only)
}

pub fn tail_process_logs(db: &Database, params: &TailParams) -> Result<Vec<LogEntry>> {
    let process = require_text("process", &params.process)?;
    let lines = require_limit("lines", params.lines)?;
    let level = parse_level(params.level.as_deref())?;
    db.get_process_logs(process, lines, level)
}

pub fn get_log_summary(db: &Database, params: &SummaryParams) -> Result<LogSummary> {
    db.get_log_summary(params.hours)
}

pub fn prune_old_logs(db: &Database, params: &PruneParams) -> Result<PruneReport> {
    let max_age_hours = params
        .max_age_hours
        .ok_or_else(|| Error::validation("max_age_hours is required"))?;
    db.prune_old_logs(max_age_hours, params.dry_run)
}

pub fn get_log_statistics(db: &Database) -> Result<LogStatistics> {
    db.get_log_statistics()
}

pub fn save_session_summary(db: &Database, params: SaveSessionParams) -> Result<SessionSummary> {
    db.save_session_summary(NewSessionSummary {
        title: params.title,
        description: params.description,
        tags: params.tags,
        project: params.project,
        llm_model: params.llm_model,
        files_changed: params.files_changed,
    })
}

pub fn search_session_summaries(
    db: &Database,
    params: &SearchSessionsParams,
) -> Result<Vec<SessionSummary>> {
    let query = require_text("query", &params.query)?;
    let limit = require_limit("limit", params.limit)?;
    db.search_session_summaries(query, params.project.as_deref(), limit)
}

pub fn rebuild_search_index(db: &Database) -> Result<RebuildReport> {
    db.rebuild_search_index()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ProcessLogger;
    use crate::models::{LogSource, NewProcess};

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        let logger = ProcessLogger::start(
            &db,
            NewProcess {
                name: "svc".to_string(),
                command: "svc --port 80".to_string(),
                pid: Some(7),
            },
        )
        .unwrap();
        logger
            .log_chunk("upstream timeout\nretrying", LogSource::Stdout)
            .unwrap();
        db
    }

    #[test]
    fn params_take_documented_defaults() {
        let search: SearchLogsParams = serde_json::from_str(r#"{"query": "x"}"#).unwrap();
        assert_eq!(search.limit, 50);
        let errors: RecentErrorsParams = serde_json::from_str("{}").unwrap();
        assert_eq!((errors.hours, errors.limit), (1, 20));
        let tail: TailParams = serde_json::from_str(r#"{"process": "svc"}"#).unwrap();
        assert_eq!(tail.lines, 20);
        let summary: SummaryParams = serde_json::from_str("{}").unwrap();
        assert_eq!(summary.hours, 24);
        let prune: PruneParams = serde_json::from_str("{}").unwrap();
        assert!(!prune.dry_run);
        let list: ListProcessesParams = serde_json::from_str("{}").unwrap();
        assert!(!list.active_only);
    }

    #[test]
    fn missing_required_inputs_are_validation_errors() {
        let db = seeded();
        assert!(matches!(
            prune_old_logs(&db, &PruneParams::default()),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            search_logs(&db, &SearchLogsParams::default()),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            tail_process_logs(&db, &TailParams::default()),
            Err(Error::Validation(_))
        ));
        let bad_level = SearchLogsParams {
            query: "timeout".into(),
            level: Some("loud".into()),
            limit: 5,
            ..Default::default()
        };
        assert!(matches!(search_logs(&db, &bad_level), Err(Error::Validation(_))));
    }

    #[test]
    fn since_accepts_relative_and_absolute() {
        let two_hours = parse_since("2h").unwrap();
        let expected = now() - Duration::hours(2);
        assert!((expected - two_hours).num_seconds().abs() <= 1);

        let abs = parse_since("2026-03-01T12:00:00Z").unwrap();
        assert_eq!(abs.to_rfc3339(), "2026-03-01T12:00:00+00:00");

        for bad in ["", "h", "5w", "-3h", "yesterday"] {
            assert!(matches!(parse_since(bad), Err(Error::Validation(_))), "{}", bad);
        }
    }

    #[test]
    fn responses_flag_errors() {
        let db = seeded();
        let ok = respond(search_logs(
            &db,
            &SearchLogsParams {
                query: "timeout".into(),
                since: Some("1h".into()),
                limit: 10,
                ..Default::default()
            },
        ));
        assert!(!ok.is_error);
        assert!(ok.text.contains("upstream timeout"));

        let err = respond(prune_old_logs(&db, &PruneParams::default()));
        assert!(err.is_error);
        assert_eq!(err.text, "Error: invalid input: max_age_hours is required");
    }

    #[test]
    fn tail_and_statistics_through_tools() {
        let db = seeded();
        let tail = tail_process_logs(
            &db,
            &TailParams {
                process: "svc".into(),
                lines: 2,
                level: None,
            },
        )
        .unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "retrying");

        let stats = get_log_statistics(&db).unwrap();
        assert_eq!(stats.total_logs, 3);
        assert_eq!(stats.total_processes, 1);
    }

    #[test]
    fn sessions_through_tools() {
        let db = seeded();
        let saved = save_session_summary(
            &db,
            SaveSessionParams {
                title: "Tune retries".into(),
                tags: vec!["network".into()],
                project: "svc".into(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(saved.project, "svc");

        let found = search_session_summaries(
            &db,
            &SearchSessionsParams {
                query: "network".into(),
                project: None,
                limit: 5,
            },
        )
        .unwrap();
        assert_eq!(found.len(), 1);
    }
}
