//! Full-text index over log entries and session summaries.
//!
//! The FTS5 tables are a projection of the primary tables keyed by the
//! primary row id. They are written only through this module, which the
//! store calls inside the same transaction as the primary write, and they
//! can always be regenerated from the primary tables.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::RebuildReport;
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{info, warn};

pub(crate) const LOG_INDEX: &str = "log_entries_fts";
pub(crate) const SESSION_INDEX: &str = "session_summaries_fts";

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?",
        params![name],
        |row| row.get(0),
    )
}

fn create_log_index(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS log_entries_fts USING fts5(
            message,
            raw_output,
            process_name,
            tokenize = 'unicode61'
        );",
    )
}

fn create_session_index(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS session_summaries_fts USING fts5(
            title,
            description,
            tags,
            project,
            tokenize = 'unicode61'
        );",
    )
}

/// Create any missing index table. Returns true if one was created.
pub(crate) fn ensure_tables(conn: &Connection) -> rusqlite::Result<bool> {
    let mut created = false;

    if !table_exists(conn, LOG_INDEX)? {
        create_log_index(conn)?;
        created = true;
    }
    if !table_exists(conn, SESSION_INDEX)? {
        create_session_index(conn)?;
        created = true;
    }

    Ok(created)
}

pub(crate) fn index_log_entry(
    conn: &Connection,
    id: i64,
    process_id: &str,
    message: &str,
    raw_output: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO log_entries_fts (rowid, message, raw_output, process_name)
         SELECT ?1, ?2, ?3, name FROM processes WHERE id = ?4",
        params![id, message, raw_output, process_id],
    )?;
    Ok(())
}

pub(crate) fn remove_log_entry(conn: &Connection, id: i64) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM log_entries_fts WHERE rowid = ?", params![id])
}

/// Tags are indexed as space separated words.
pub(crate) fn index_session_summary(
    conn: &Connection,
    id: i64,
    title: &str,
    description: &str,
    tags: &[String],
    project: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO session_summaries_fts (rowid, title, description, tags, project)
         VALUES (?, ?, ?, ?, ?)",
        params![id, title, description, tags.join(" "), project],
    )?;
    Ok(())
}

/// Drop the log index and repopulate it from `log_entries`. Dropping the
/// table frees its segments in one step instead of deleting row by row.
pub(crate) fn rebuild_log_index(conn: &Connection) -> rusqlite::Result<u64> {
    conn.execute_batch("DROP TABLE IF EXISTS log_entries_fts")?;
    create_log_index(conn)?;
    let rows = conn.execute(
        "INSERT INTO log_entries_fts (rowid, message, raw_output, process_name)
         SELECT l.id, l.message, l.raw_output, p.name
         FROM log_entries l JOIN processes p ON p.id = l.process_id",
        [],
    )?;
    Ok(rows as u64)
}

pub(crate) fn rebuild_session_index(conn: &Connection) -> rusqlite::Result<u64> {
    conn.execute_batch("DROP TABLE IF EXISTS session_summaries_fts")?;
    create_session_index(conn)?;

    let mut stmt = conn.prepare(
        "SELECT id, title, description, tags, project FROM session_summaries",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (id, title, description, tags_json, project) in &rows {
        let tags: Vec<String> = match serde_json::from_str(tags_json) {
            Ok(tags) => tags,
            Err(e) => {
                warn!(session_id = *id, error = %e, "unreadable tags on session summary, indexing without them");
                Vec::new()
            }
        };
        index_session_summary(conn, *id, title, description, &tags, project)?;
    }

    Ok(rows.len() as u64)
}

/// Trimmed match expression, or a validation error when nothing is left.
pub fn prepare_match_query(query: &str) -> Result<String> {
    let query = query.trim();
    if query.is_empty() {
        return Err(Error::validation("search query must not be empty"));
    }
    Ok(query.to_string())
}

/// Quote every whitespace separated token so FTS5 treats it literally.
/// Tokens are joined with an implicit AND.
pub(crate) fn quote_terms(query: &str) -> String {
    query
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when FTS5 rejected the match expression itself.
pub(crate) fn is_query_syntax_error(err: &rusqlite::Error) -> bool {
    let msg = err.to_string();
    msg.contains("fts5: syntax error")
        || msg.contains("unterminated string")
        || msg.contains("no such column")
        || msg.contains("unknown special query")
}

/// True when the failure came from the index tables rather than the store.
pub(crate) fn is_index_error(err: &rusqlite::Error) -> bool {
    let msg = err.to_string();
    msg.contains(LOG_INDEX) || msg.contains(SESSION_INDEX) || msg.contains("fts5")
}

impl Database {
    /// Regenerate both index tables from the primary rows.
    pub fn rebuild_search_index(&self) -> Result<RebuildReport> {
        let tx = rusqlite::Transaction::new_unchecked(self.conn(), TransactionBehavior::Immediate)?;
        ensure_tables(&tx)?;
        let log_entries = rebuild_log_index(&tx)?;
        let session_summaries = rebuild_session_index(&tx)?;
        tx.commit()?;

        self.clear_index_degraded();
        info!(log_entries, session_summaries, "search index rebuilt");
        Ok(RebuildReport {
            log_entries,
            session_summaries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_neutralizes_operators() {
        assert_eq!(quote_terms("foo:bar \"x"), "\"foo:bar\" \"\"\"x\"");
        assert_eq!(quote_terms("  spaced   out "), "\"spaced\" \"out\"");
    }

    #[test]
    fn empty_query_is_rejected() {
        assert!(matches!(prepare_match_query("   "), Err(Error::Validation(_))));
        assert_eq!(prepare_match_query(" timeout ").unwrap(), "timeout");
    }

    #[test]
    fn ensure_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(ensure_tables(&conn).unwrap());
        assert!(!ensure_tables(&conn).unwrap());
    }

    #[test]
    fn malformed_queries_are_detected() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_tables(&conn).unwrap();
        let err = conn
            .query_row(
                "SELECT COUNT(*) FROM log_entries_fts WHERE log_entries_fts MATCH ?",
                params!["\"unclosed"],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_err();
        assert!(is_query_syntax_error(&err));
    }

    #[test]
    fn rebuild_repopulates_from_primary_rows() {
        let db = Database::open_in_memory().unwrap();
        let p = db
            .create_process(&crate::models::NewProcess {
                name: "indexer".to_string(),
                command: "indexer".to_string(),
                pid: None,
            })
            .unwrap();
        db.add_log_entry(&crate::models::LogEntry {
            id: None,
            process_id: p.id.clone(),
            process_name: None,
            timestamp: crate::models::now(),
            level: crate::models::LogLevel::Info,
            message: "warming cache".to_string(),
            raw_output: "warming cache\n".to_string(),
            source: crate::models::LogSource::Stdout,
        })
        .unwrap();
        db.conn().execute("DELETE FROM log_entries_fts", []).unwrap();
        db.mark_index_degraded();

        let report = db.rebuild_search_index().unwrap();
        assert_eq!(report.log_entries, 1);
        assert_eq!(report.session_summaries, 0);
        assert!(!db.index_degraded());
    }

    #[test]
    fn unreadable_tags_still_index_the_summary() {
        let db = Database::open_in_memory().unwrap();
        db.conn()
            .execute(
                "INSERT INTO session_summaries (title, description, tags, timestamp, project)
                 VALUES ('Tune allocator', 'arena sizes', 'not json', '2026-01-01T00:00:00.000000Z', 'core')",
                [],
            )
            .unwrap();

        let report = db.rebuild_search_index().unwrap();
        assert_eq!(report.session_summaries, 1);
        let indexed: String = db
            .conn()
            .query_row(
                "SELECT tags FROM session_summaries_fts WHERE session_summaries_fts MATCH 'allocator'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexed, "");
    }

    #[test]
    fn rebuild_discards_stray_index_rows() {
        let db = Database::open_in_memory().unwrap();
        db.conn()
            .execute(
                "INSERT INTO log_entries_fts (rowid, message, raw_output, process_name)
                 VALUES (4242, 'stray', 'stray', 'nobody')",
                [],
            )
            .unwrap();

        assert_eq!(db.rebuild_search_index().unwrap().log_entries, 0);
        let left: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM log_entries_fts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }
}
