use crate::db::Database;
use crate::error::Result;
use crate::index;
use crate::models::{format_timestamp, PruneReport};
use crate::query::window_start;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::info;

const ORPHAN_PREDICATE: &str =
    "NOT EXISTS (SELECT 1 FROM log_entries l WHERE l.process_id = processes.id)";

impl Database {
    /// Delete entries older than `max_age_hours` and the processes left
    /// without entries, as one transaction.
    pub fn prune_old_logs(&self, max_age_hours: u64, dry_run: bool) -> Result<PruneReport> {
        let cutoff = window_start(max_age_hours)?;
        self.prune_before(cutoff, dry_run)
    }

    pub fn prune_before(&self, cutoff: DateTime<Utc>, dry_run: bool) -> Result<PruneReport> {
        let report = if dry_run {
            self.count_prunable(cutoff)?
        } else {
            self.prune(cutoff)?
        };

        info!(
            cutoff = %format_timestamp(&cutoff),
            deleted_logs = report.deleted_logs,
            deleted_processes = report.deleted_processes,
            dry_run,
            "prune finished"
        );
        Ok(report)
    }

    fn count_prunable(&self, cutoff: DateTime<Utc>) -> Result<PruneReport> {
        let cutoff_text = format_timestamp(&cutoff);
        // Read transaction so both counts see the same snapshot.
        let tx = self.conn().unchecked_transaction()?;

        let deleted_logs: i64 = tx.query_row(
            "SELECT COUNT(*) FROM log_entries WHERE timestamp < ?",
            params![cutoff_text],
            |row| row.get(0),
        )?;
        let deleted_processes: i64 = tx.query_row(
            "SELECT COUNT(*) FROM processes WHERE NOT EXISTS (
                SELECT 1 FROM log_entries l
                WHERE l.process_id = processes.id AND l.timestamp >= ?
            )",
            params![cutoff_text],
            |row| row.get(0),
        )?;
        drop(tx);

        Ok(PruneReport {
            deleted_logs: deleted_logs as u64,
            deleted_processes: deleted_processes as u64,
            cutoff,
            dry_run: true,
        })
    }

    fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneReport> {
        let tx = Transaction::new_unchecked(self.conn(), TransactionBehavior::Immediate)?;
        let outcome = prune_in(&tx, &format_timestamp(&cutoff), self.index_degraded())?;
        tx.commit()?;

        if outcome.index_rebuilt {
            self.clear_index_degraded();
        }

        Ok(PruneReport {
            deleted_logs: outcome.deleted_logs,
            deleted_processes: outcome.deleted_processes,
            cutoff,
            dry_run: false,
        })
    }
}

struct PruneOutcome {
    deleted_logs: u64,
    deleted_processes: u64,
    index_rebuilt: bool,
}

/// The log index is rebuilt only when entries were deleted, an index table
/// had to be recreated, or the caller knows the index is degraded. A prune
/// that deletes nothing leaves the index alone.
fn prune_in(
    conn: &Connection,
    cutoff: &str,
    force_rebuild: bool,
) -> rusqlite::Result<PruneOutcome> {
    let deleted_logs = conn.execute(
        "DELETE FROM log_entries WHERE timestamp < ?",
        params![cutoff],
    )?;

    let recreated = index::ensure_tables(conn)?;
    let index_rebuilt = deleted_logs > 0 || recreated || force_rebuild;
    if index_rebuilt {
        index::rebuild_log_index(conn)?;
    }
    if recreated {
        index::rebuild_session_index(conn)?;
    }

    let deleted_processes = conn.execute(
        &format!("DELETE FROM processes WHERE {}", ORPHAN_PREDICATE),
        [],
    )?;

    Ok(PruneOutcome {
        deleted_logs: deleted_logs as u64,
        deleted_processes: deleted_processes as u64,
        index_rebuilt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{now, LogEntry, LogLevel, LogSource, NewProcess};
    use crate::query::SearchFilter;
    use chrono::Duration;

    fn process(db: &Database, name: &str) -> String {
        db.create_process(&NewProcess {
            name: name.to_string(),
            command: name.to_string(),
            pid: None,
        })
        .unwrap()
        .id
    }

    fn add(db: &Database, process_id: &str, message: &str, hours_ago: i64) {
        db.add_log_entry(&LogEntry {
            id: None,
            process_id: process_id.to_string(),
            process_name: None,
            timestamp: now() - Duration::hours(hours_ago),
            level: LogLevel::Info,
            message: message.to_string(),
            raw_output: message.to_string(),
            source: LogSource::Stdout,
        })
        .unwrap();
    }

    fn count(db: &Database, sql: &str) -> i64 {
        db.conn().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn prune_removes_old_entries_and_orphans() {
        let db = Database::open_in_memory().unwrap();
        let stale = process(&db, "stale");
        let mixed = process(&db, "mixed");
        add(&db, &stale, "stale entry", 100);
        add(&db, &mixed, "mixed old", 100);
        add(&db, &mixed, "mixed new", 1);

        let report = db.prune_old_logs(50, false).unwrap();
        assert_eq!(report.deleted_logs, 2);
        assert_eq!(report.deleted_processes, 1);
        assert!(!report.dry_run);

        assert!(db.get_process(&stale).unwrap().is_none());
        assert!(db.get_process(&mixed).unwrap().is_some());
        let cutoff = format_timestamp(&report.cutoff);
        let survivors_before_cutoff: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM log_entries WHERE timestamp < ?",
                params![cutoff],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(survivors_before_cutoff, 0);
    }

    #[test]
    fn prune_keeps_index_in_step_with_rows() {
        let db = Database::open_in_memory().unwrap();
        let p = process(&db, "api");
        add(&db, &p, "ancient timeout", 200);
        add(&db, &p, "recent timeout", 2);

        db.prune_old_logs(24, false).unwrap();

        assert_eq!(
            count(&db, "SELECT COUNT(*) FROM log_entries_fts"),
            count(&db, "SELECT COUNT(*) FROM log_entries")
        );
        let hits = db.search_logs("timeout", 10, &SearchFilter::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message, "recent timeout");
    }

    #[test]
    fn dry_run_predicts_and_does_not_mutate() {
        let db = Database::open_in_memory().unwrap();
        let a = process(&db, "a");
        let b = process(&db, "b");
        let _empty = process(&db, "never-logged");
        add(&db, &a, "a old", 72);
        add(&db, &b, "b old", 72);
        add(&db, &b, "b new", 1);

        let before = (
            count(&db, "SELECT COUNT(*) FROM log_entries"),
            count(&db, "SELECT COUNT(*) FROM processes"),
            count(&db, "SELECT COUNT(*) FROM log_entries_fts"),
        );

        let predicted = db.prune_old_logs(48, true).unwrap();
        assert!(predicted.dry_run);

        let after = (
            count(&db, "SELECT COUNT(*) FROM log_entries"),
            count(&db, "SELECT COUNT(*) FROM processes"),
            count(&db, "SELECT COUNT(*) FROM log_entries_fts"),
        );
        assert_eq!(before, after);

        let actual = db.prune_before(predicted.cutoff, false).unwrap();
        assert_eq!(predicted.deleted_logs, actual.deleted_logs);
        assert_eq!(predicted.deleted_processes, actual.deleted_processes);
        assert_eq!(actual.deleted_logs, 2);
        assert_eq!(actual.deleted_processes, 2);
    }

    #[test]
    fn failed_prune_rolls_back_everything() {
        let db = Database::open_in_memory().unwrap();
        let p = process(&db, "api");
        add(&db, &p, "old news", 100);
        db.conn()
            .execute_batch(
                "CREATE TRIGGER block_process_delete BEFORE DELETE ON processes
                 BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
            )
            .unwrap();

        let err = db.prune_old_logs(50, false).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        assert_eq!(count(&db, "SELECT COUNT(*) FROM log_entries"), 1);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM processes"), 1);
        let hits = db.search_logs("news", 10, &SearchFilter::default()).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn prune_repairs_missing_log_index() {
        let db = Database::open_in_memory().unwrap();
        let p = process(&db, "api");
        add(&db, &p, "keep me", 1);
        db.conn().execute_batch("DROP TABLE log_entries_fts").unwrap();
        db.mark_index_degraded();

        let report = db.prune_old_logs(24, false).unwrap();
        assert_eq!(report.deleted_logs, 0);
        assert!(!db.index_degraded());
        assert_eq!(db.search_logs("keep", 10, &SearchFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn prune_of_empty_store_is_zero() {
        let db = Database::open_in_memory().unwrap();
        let report = db.prune_old_logs(1, false).unwrap();
        assert_eq!((report.deleted_logs, report.deleted_processes), (0, 0));
    }

    fn plant_stray_index_row(db: &Database) {
        db.conn()
            .execute(
                "INSERT INTO log_entries_fts (rowid, message, raw_output, process_name)
                 VALUES (9999, 'stray', 'stray', 'nobody')",
                [],
            )
            .unwrap();
    }

    fn stray_rows(db: &Database) -> i64 {
        count(db, "SELECT COUNT(*) FROM log_entries_fts WHERE rowid = 9999")
    }

    #[test]
    fn prune_without_deletions_leaves_index_untouched() {
        let db = Database::open_in_memory().unwrap();
        let p = process(&db, "api");
        let _idle = process(&db, "idle");
        add(&db, &p, "fresh", 1);
        plant_stray_index_row(&db);

        let report = db.prune_old_logs(336, false).unwrap();
        assert_eq!(report.deleted_logs, 0);
        // Orphans are still collected.
        assert_eq!(report.deleted_processes, 1);
        assert_eq!(stray_rows(&db), 1);
        assert_eq!(db.search_logs("fresh", 10, &SearchFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn prune_with_deletions_rebuilds_index() {
        let db = Database::open_in_memory().unwrap();
        let p = process(&db, "api");
        add(&db, &p, "old", 100);
        add(&db, &p, "fresh", 1);
        plant_stray_index_row(&db);

        assert_eq!(db.prune_old_logs(50, false).unwrap().deleted_logs, 1);
        assert_eq!(stray_rows(&db), 0);
    }

    #[test]
    fn degraded_index_is_rebuilt_even_without_deletions() {
        let db = Database::open_in_memory().unwrap();
        let p = process(&db, "api");
        add(&db, &p, "fresh", 1);
        plant_stray_index_row(&db);
        db.mark_index_degraded();

        assert_eq!(db.prune_old_logs(336, false).unwrap().deleted_logs, 0);
        assert_eq!(stray_rows(&db), 0);
        assert!(!db.index_degraded());
    }
}
