use crate::db::{timestamp_column, Database};
use crate::error::{Error, Result};
use crate::index::{self, is_index_error, is_query_syntax_error, prepare_match_query, quote_terms};
use crate::models::{format_timestamp, now, RepoInfo, SessionSummary};
use rusqlite::types::Type;
use rusqlite::{params, Row};
use std::collections::BTreeSet;

const SUMMARY_COLUMNS: &str =
    "s.id, s.title, s.description, s.tags, s.timestamp, s.project, s.llm_model, s.files_changed";

#[derive(Debug, Clone, Default)]
pub struct NewSessionSummary {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub project: String,
    pub llm_model: Option<String>,
    pub files_changed: Vec<String>,
}

impl NewSessionSummary {
    /// Fill project and changed files from the repository when the caller
    /// left them empty.
    pub fn fill_from_repo(&mut self, repo: Option<&RepoInfo>) {
        let Some(repo) = repo else { return };
        if self.project.trim().is_empty() {
            self.project = repo.project.clone();
        }
        if self.files_changed.is_empty() {
            self.files_changed = repo.files_changed.clone();
        }
    }
}

/// Trimmed, de-duplicated and sorted.
fn normalize_set(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn json_list_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SessionSummary> {
    Ok(SessionSummary {
        id: Some(row.get(0)?),
        title: row.get(1)?,
        description: row.get(2)?,
        tags: json_list_column(row, 3)?,
        timestamp: timestamp_column(row, 4)?,
        project: row.get(5)?,
        llm_model: row.get(6)?,
        files_changed: json_list_column(row, 7)?,
    })
}

impl Database {
    pub fn save_session_summary(&self, new: NewSessionSummary) -> Result<SessionSummary> {
        let title = new.title.trim().to_string();
        if title.is_empty() {
            return Err(Error::validation("session summary title must not be empty"));
        }

        let mut summary = SessionSummary {
            id: None,
            title,
            description: new.description.trim().to_string(),
            tags: normalize_set(new.tags),
            timestamp: now(),
            project: new.project.trim().to_string(),
            llm_model: new.llm_model.filter(|m| !m.trim().is_empty()),
            files_changed: normalize_set(new.files_changed),
        };

        let mut tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO session_summaries
                (title, description, tags, timestamp, project, llm_model, files_changed)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                summary.title,
                summary.description,
                serde_json::to_string(&summary.tags)?,
                format_timestamp(&summary.timestamp),
                summary.project,
                summary.llm_model,
                serde_json::to_string(&summary.files_changed)?
            ],
        )?;
        let id = tx.last_insert_rowid();

        self.sync_index(&mut tx, "session summary", id, |conn| {
            index::index_session_summary(
                conn,
                id,
                &summary.title,
                &summary.description,
                &summary.tags,
                &summary.project,
            )
        })?;
        tx.commit()?;

        summary.id = Some(id);
        Ok(summary)
    }

    pub fn search_session_summaries(
        &self,
        query: &str,
        project: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>> {
        let expr = prepare_match_query(query)?;

        let run = |match_expr: &str| -> rusqlite::Result<Vec<SessionSummary>> {
            let mut sql = format!(
                "SELECT {} FROM session_summaries_fts
                 JOIN session_summaries s ON s.id = session_summaries_fts.rowid
                 WHERE session_summaries_fts MATCH ?1",
                SUMMARY_COLUMNS
            );
            if project.is_some() {
                sql.push_str(" AND s.project = ?3");
            }
            sql.push_str(" ORDER BY s.timestamp DESC, s.id DESC LIMIT ?2");

            let mut stmt = self.conn().prepare(&sql)?;
            let rows = match project {
                Some(p) => stmt.query_map(params![match_expr, limit, p], summary_from_row)?,
                None => stmt.query_map(params![match_expr, limit], summary_from_row)?,
            };
            rows.collect()
        };

        let result = match run(&expr) {
            Err(e) if is_query_syntax_error(&e) => run(&quote_terms(&expr)),
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

    pub fn list_session_summaries(
        &self,
        project: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>> {
        let mut sql = format!("SELECT {} FROM session_summaries s", SUMMARY_COLUMNS);
        if project.is_some() {
            sql.push_str(" WHERE s.project = ?2");
        }
        sql.push_str(" ORDER BY s.timestamp DESC, s.id DESC LIMIT ?1");

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = match project {
            Some(p) => stmt.query_map(params![limit, p], summary_from_row)?,
            None => stmt.query_map(params![limit], summary_from_row)?,
        };
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
