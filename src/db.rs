use crate::config::Config;
use crate::error::{Error, Result};
use crate::index;
use crate::models::{
    format_timestamp, now, parse_timestamp, LogEntry, NewProcess, Process, ProcessStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use ulid::Ulid;

const CURRENT_VERSION: i32 = 1;

/// How long a writer waits on another connection's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const PROCESS_COLUMNS: &str =
    "id, name, command, start_time, end_time, status, exit_code, pid";

pub(crate) const ENTRY_COLUMNS: &str =
    "l.id, l.process_id, p.name, l.timestamp, l.level, l.message, l.raw_output, l.source";

pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
    index_degraded: AtomicBool,
}

impl Database {
    pub fn open(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.log_dir)?;
        Self::open_at(&config.db_path())
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let journal: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        debug!(journal = %journal, path = ?path, "opened log store");

        let db = Database {
            conn,
            path,
            index_degraded: AtomicBool::new(false),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init_schema(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version < CURRENT_VERSION {
            self.create_initial_schema()?;
        }

        let created = index::ensure_tables(&self.conn)?;
        if created && version >= CURRENT_VERSION {
            // Existing store whose index tables went missing.
            info!("search index tables recreated, repopulating");
            self.rebuild_search_index()?;
        }

        Ok(())
    }

    fn create_initial_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS processes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                command TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                status TEXT NOT NULL DEFAULT 'running'
                    CHECK (status IN ('running', 'completed', 'failed')),
                exit_code INTEGER,
                pid INTEGER,
                CHECK ((status = 'running' AND end_time IS NULL AND exit_code IS NULL)
                    OR (status <> 'running' AND end_time IS NOT NULL AND exit_code IS NOT NULL))
            );

            CREATE TABLE IF NOT EXISTS log_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                process_id TEXT NOT NULL REFERENCES processes(id),
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL CHECK (level IN ('info', 'warn', 'error', 'debug')),
                message TEXT NOT NULL,
                raw_output TEXT NOT NULL,
                source TEXT NOT NULL CHECK (source IN ('stdout', 'stderr'))
            );

            CREATE TABLE IF NOT EXISTS session_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT '[]',
                timestamp TEXT NOT NULL,
                project TEXT NOT NULL DEFAULT '',
                llm_model TEXT,
                files_changed TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX IF NOT EXISTS idx_entries_process ON log_entries(process_id);
            CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON log_entries(timestamp);
            CREATE INDEX IF NOT EXISTS idx_entries_level ON log_entries(level);
            CREATE INDEX IF NOT EXISTS idx_processes_name ON processes(name);
            CREATE INDEX IF NOT EXISTS idx_processes_status ON processes(status);
            CREATE INDEX IF NOT EXISTS idx_sessions_timestamp ON session_summaries(timestamp);
            CREATE INDEX IF NOT EXISTS idx_sessions_project ON session_summaries(project);

            PRAGMA user_version = 1;",
        )?;

        Ok(())
    }

    pub fn create_process(&self, new: &NewProcess) -> Result<Process> {
        let process = Process {
            id: Ulid::new().to_string(),
            name: new.name.clone(),
            command: new.command.clone(),
            start_time: now(),
            end_time: None,
            status: ProcessStatus::Running,
            exit_code: None,
            pid: new.pid,
        };

        self.conn.execute(
            "INSERT INTO processes (id, name, command, start_time, status, pid)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                process.id,
                process.name,
                process.command,
                format_timestamp(&process.start_time),
                process.status,
                process.pid
            ],
        )?;

        Ok(process)
    }

    pub fn get_process(&self, id: &str) -> Result<Option<Process>> {
        let sql = format!("SELECT {} FROM processes WHERE id = ?", PROCESS_COLUMNS);
        let process = self
            .conn
            .query_row(&sql, params![id], process_from_row)
            .optional()?;
        Ok(process)
    }

    /// Most recent run carrying `name`.
    pub fn get_process_by_name(&self, name: &str) -> Result<Option<Process>> {
        let sql = format!(
            "SELECT {} FROM processes WHERE name = ?
             ORDER BY start_time DESC, rowid DESC LIMIT 1",
            PROCESS_COLUMNS
        );
        let process = self
            .conn
            .query_row(&sql, params![name], process_from_row)
            .optional()?;
        Ok(process)
    }

    pub fn list_processes(&self, active_only: bool) -> Result<Vec<Process>> {
        let mut sql = format!("SELECT {} FROM processes", PROCESS_COLUMNS);
        if active_only {
            sql.push_str(" WHERE status = 'running'");
        }
        sql.push_str(" ORDER BY start_time DESC, rowid DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let processes = stmt
            .query_map([], process_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(processes)
    }

    /// Move a running process to a terminal status.
    ///
    /// A missing `exit_code` defaults to 0 for `Completed` and -1 for
    /// `Failed`; a missing `end_time` defaults to now. The update only
    /// applies to rows still running, so a second terminal update fails.
    pub fn update_process_status(
        &self,
        id: &str,
        status: ProcessStatus,
        exit_code: Option<i32>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let exit_code = match status {
            ProcessStatus::Running => {
                return Err(Error::validation(
                    "a process can only be moved to completed or failed",
                ))
            }
            ProcessStatus::Completed => exit_code.unwrap_or(0),
            ProcessStatus::Failed => exit_code.unwrap_or(-1),
        };
        let end_time = end_time.unwrap_or_else(now);

        let changed = self.conn.execute(
            "UPDATE processes SET status = ?, exit_code = ?, end_time = ?
             WHERE id = ? AND status = 'running'",
            params![status, exit_code, format_timestamp(&end_time), id],
        )?;

        if changed == 0 {
            return match self.get_process(id)? {
                Some(existing) => Err(Error::InvalidTransition {
                    id: id.to_string(),
                    status: existing.status,
                }),
                None => Err(Error::NotFound(format!("process {}", id))),
            };
        }

        debug!(process_id = id, status = %status, exit_code, "process finished");
        Ok(())
    }

    /// Insert an entry and its index row in one transaction.
    pub fn add_log_entry(&self, entry: &LogEntry) -> Result<i64> {
        let mut tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO log_entries (process_id, timestamp, level, message, raw_output, source)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                entry.process_id,
                format_timestamp(&entry.timestamp),
                entry.level,
                entry.message,
                entry.raw_output,
                entry.source
            ],
        )?;
        let id = tx.last_insert_rowid();

        self.sync_index(&mut tx, "log entry", id, |conn| {
            index::index_log_entry(conn, id, &entry.process_id, &entry.message, &entry.raw_output)
        })?;

        tx.commit()?;
        Ok(id)
    }

    /// Delete a single entry, removing its index row directly.
    pub fn delete_log_entry(&self, id: i64) -> Result<bool> {
        let mut tx = self.conn.unchecked_transaction()?;
        let deleted = tx.execute("DELETE FROM log_entries WHERE id = ?", params![id])?;
        if deleted > 0 {
            self.sync_index(&mut tx, "log entry removal", id, |conn| {
                index::remove_log_entry(conn, id).map(|_| ())
            })?;
        }
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Run an index write under a savepoint. A failure rolls back only the
    /// index write and flags the index as degraded.
    pub(crate) fn sync_index<F>(
        &self,
        tx: &mut Transaction<'_>,
        what: &str,
        row_id: i64,
        write: F,
    ) -> Result<()>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<()>,
    {
        let sp = tx.savepoint()?;
        match write(&*sp) {
            Ok(()) => sp.commit()?,
            Err(e) => {
                drop(sp);
                self.mark_index_degraded();
                warn!(row_id, error = %e, "search index update failed for {}; search is degraded until rebuild", what);
            }
        }
        Ok(())
    }

    /// True once an index write or index query on this connection has
    /// failed, until a rebuild or a rebuilding prune succeeds here.
    ///
    /// The flag lives in memory and is not shared between connections, so
    /// another process serving queries will not see it. Any connection can
    /// repair the shared index with [`Database::rebuild_search_index`].
    pub fn index_degraded(&self) -> bool {
        self.index_degraded.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_index_degraded(&self) {
        self.index_degraded.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_index_degraded(&self) {
        self.index_degraded.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp '{}'", text).into(),
        )
    })
}

pub(crate) fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => timestamp_column(row, idx).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn process_from_row(row: &Row<'_>) -> rusqlite::Result<Process> {
    Ok(Process {
        id: row.get(0)?,
        name: row.get(1)?,
        command: row.get(2)?,
        start_time: timestamp_column(row, 3)?,
        end_time: optional_timestamp_column(row, 4)?,
        status: row.get(5)?,
        exit_code: row.get(6)?,
        pid: row.get(7)?,
    })
}

/// Maps a row selected with [`ENTRY_COLUMNS`].
pub(crate) fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    Ok(LogEntry {
        id: Some(row.get(0)?),
        process_id: row.get(1)?,
        process_name: row.get(2)?,
        timestamp: timestamp_column(row, 3)?,
        level: row.get(4)?,
        message: row.get(5)?,
        raw_output: row.get(6)?,
        source: row.get(7)?,
    })
}
