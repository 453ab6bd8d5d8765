use crate::db::{entry_from_row, optional_timestamp_column, Database, ENTRY_COLUMNS};
use crate::error::{Error, Result};
use crate::index::{is_index_error, is_query_syntax_error, prepare_match_query, quote_terms};
use crate::models::{format_timestamp, now, LogEntry, LogLevel, LogStatistics, LogSummary};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

/// Optional filters applied on top of a text search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub process_name: Option<String>,
    pub level: Option<LogLevel>,
    pub since: Option<DateTime<Utc>>,
}

/// Start of a window reaching `hours` back from now.
pub fn window_start(hours: u64) -> Result<DateTime<Utc>> {
    i64::try_from(hours)
        .ok()
        .and_then(Duration::try_hours)
        .and_then(|d| now().checked_sub_signed(d))
        .ok_or_else(|| Error::validation(format!("{} hours is out of range", hours)))
}

/// Entry query over `log_entries l JOIN processes p`, newest first.
struct EntryQuery {
    from: &'static str,
    conditions: Vec<String>,
    params: Vec<Box<dyn rusqlite::ToSql>>,
}

impl EntryQuery {
    fn scan() -> Self {
        EntryQuery {
            from: "log_entries l JOIN processes p ON p.id = l.process_id",
            conditions: Vec::new(),
            params: Vec::new(),
        }
    }

    fn text_search(match_expr: String) -> Self {
        let mut q = EntryQuery {
            from: "log_entries_fts
                   JOIN log_entries l ON l.id = log_entries_fts.rowid
                   JOIN processes p ON p.id = l.process_id",
            conditions: Vec::new(),
            params: Vec::new(),
        };
        q.push("log_entries_fts MATCH ?", match_expr);
        q
    }

    fn push<T: rusqlite::ToSql + 'static>(&mut self, condition: &str, value: T) {
        self.conditions.push(condition.to_string());
        self.params.push(Box::new(value));
    }

    fn with_filter(mut self, filter: &SearchFilter) -> Self {
        if let Some(name) = &filter.process_name {
            self.push("p.name = ?", name.clone());
        }
        if let Some(level) = filter.level {
            self.push("l.level = ?", level);
        }
        if let Some(since) = &filter.since {
            self.push("l.timestamp >= ?", format_timestamp(since));
        }
        self
    }

    fn run(self, db: &Database, limit: usize) -> rusqlite::Result<Vec<LogEntry>> {
        let mut sql = format!("SELECT {} FROM {}", ENTRY_COLUMNS, self.from);
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY l.timestamp DESC, l.id DESC LIMIT ?");

        let mut stmt = db.conn().prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = self
            .params
            .iter()
            .map(|b| &**b as &dyn rusqlite::ToSql)
            .chain(std::iter::once(&limit as &dyn rusqlite::ToSql))
            .collect();

        let entries = stmt
            .query_map(&param_refs[..], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

impl Database {
    /// Newest `limit` entries across every run named `name`.
    pub fn get_process_logs(
        &self,
        name: &str,
        limit: usize,
        level: Option<LogLevel>,
    ) -> Result<Vec<LogEntry>> {
        let filter = SearchFilter {
            process_name: Some(name.to_string()),
            level,
            since: None,
        };
        Ok(EntryQuery::scan().with_filter(&filter).run(self, limit)?)
    }

    /// Full-text search intersected with `filter`, newest first.
    ///
    /// Accepts FTS5 syntax (`AND`, `OR`, `NOT`, `"quoted phrases"`,
    /// `prefix*`). An expression FTS5 cannot parse is retried once with
    /// every token quoted.
    pub fn search_logs(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<LogEntry>> {
        let expr = prepare_match_query(query)?;
        if self.index_degraded() {
            warn!("searching a degraded index; results may be incomplete");
        }

        let first = EntryQuery::text_search(expr.clone())
            .with_filter(filter)
            .run(self, limit);

        let result = match first {
            Err(e) if is_query_syntax_error(&e) => {
                let quoted = quote_terms(&expr);
                debug!(query = %expr, retry = %quoted, "fts5 rejected query, retrying quoted");
                EntryQuery::text_search(quoted).with_filter(filter).run(self, limit)
            }
            other => other,
        };

        result.map_err(|e| {
            if is_index_error(&e) {
                self.mark_index_degraded();
                Error::IndexDegraded(e.to_string())
            } else {
                Error::Storage(e)
            }
        })
    }

    /// Error entries from the last `hours`. Does not touch the text index.
    pub fn get_recent_errors(
        &self,
        hours: u64,
        limit: usize,
        process_name: Option<&str>,
    ) -> Result<Vec<LogEntry>> {
        let filter = SearchFilter {
            process_name: process_name.map(str::to_string),
            level: Some(LogLevel::Error),
            since: Some(window_start(hours)?),
        };
        Ok(EntryQuery::scan().with_filter(&filter).run(self, limit)?)
    }

    pub fn get_log_summary(&self, hours: u64) -> Result<LogSummary> {
        let since = format_timestamp(&window_start(hours)?);
        let conn = self.conn();
        let count = |sql: &str, p: &[&dyn rusqlite::ToSql]| -> rusqlite::Result<u64> {
            conn.query_row(sql, p, |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        };

        Ok(LogSummary {
            hours,
            total_processes: count("SELECT COUNT(*) FROM processes", &[])?,
            active_processes: count(
                "SELECT COUNT(*) FROM processes WHERE status = 'running'",
                &[],
            )?,
            total_entries: count("SELECT COUNT(*) FROM log_entries", &[])?,
            entries_in_window: count(
                "SELECT COUNT(*) FROM log_entries WHERE timestamp >= ?",
                &[&since],
            )?,
            errors_in_window: count(
                "SELECT COUNT(*) FROM log_entries WHERE timestamp >= ? AND level = 'error'",
                &[&since],
            )?,
        })
    }

    pub fn get_log_statistics(&self) -> Result<LogStatistics> {
        let (total_logs, oldest_entry, newest_entry) = self.conn().query_row(
            "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM log_entries",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    optional_timestamp_column(row, 1)?,
                    optional_timestamp_column(row, 2)?,
                ))
            },
        )?;
        let total_processes: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM processes", [], |row| row.get(0))?;

        Ok(LogStatistics {
            total_logs: total_logs as u64,
            total_processes: total_processes as u64,
            oldest_entry,
            newest_entry,
            disk_usage_bytes: self.disk_usage()?,
        })
    }

    /// Size of the database file plus its WAL and shared-memory files.
    fn disk_usage(&self) -> Result<u64> {
        let Some(path) = self.path() else {
            return Ok(0);
        };

        let mut total = 0;
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.as_os_str().to_owned();
            file.push(suffix);
            match std::fs::metadata(&file) {
                Ok(meta) => total += meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }
}
