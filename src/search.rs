use crate::db::Database;
use crate::error::Result;
use crate::models::Message;
use tracing::{debug, info};

/// Trigram tokens are three characters wide; shorter terms cannot match.
const TRIGRAM_MIN: usize = 3;

/// Builds an FTS5 expression from free text: every term of at least three
/// characters becomes a quoted phrase, and the phrases are OR-ed. Returns
/// `None` when no term is long enough.
pub fn fts_query(input: &str) -> Option<String> {
    let terms: Vec<String> = input
        .split_whitespace()
        .filter(|t| t.chars().count() >= TRIGRAM_MIN)
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// `%input%` with the `LIKE` wildcards escaped; pair with `ESCAPE '\'`.
pub(crate) fn like_pattern(input: &str) -> String {
    let escaped = input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

impl Database {
    /// Message ids matching `query`, best match first. Archived and deleted
    /// rows are never returned. When the trigram index has nothing, or the
    /// query is too short for it, a `LIKE` scan over the envelope and
    /// snippet decides.
    pub async fn search(&self, account_id: i64, query: &str, limit: i64) -> Result<Vec<i64>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(expr) = fts_query(query) {
            debug!(account_id, expr = %expr, "fts search");
            let ids: Vec<i64> = sqlx::query_scalar(
                "SELECT e.id
                 FROM emails_fts
                 JOIN emails e ON e.id = emails_fts.rowid
                 WHERE emails_fts MATCH ?
                   AND e.account_id = ? AND e.is_deleted = 0 AND e.is_archived = 0
                 ORDER BY bm25(emails_fts), e.date DESC
                 LIMIT ?",
            )
            .bind(expr)
            .bind(account_id)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
            if !ids.is_empty() {
                return Ok(ids);
            }
        }

        debug!(account_id, query, "scanning with LIKE");
        let ids = sqlx::query_scalar(
            "SELECT id FROM emails
             WHERE account_id = ?1 AND is_deleted = 0 AND is_archived = 0
               AND (subject LIKE ?2 ESCAPE '\\'
                 OR from_name LIKE ?2 ESCAPE '\\'
                 OR from_email LIKE ?2 ESCAPE '\\'
                 OR snippet LIKE ?2 ESCAPE '\\')
             ORDER BY date DESC
             LIMIT ?3",
        )
        .bind(account_id)
        .bind(like_pattern(query))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Full rows for a search, in rank order.
    pub async fn search_messages(&self, account_id: i64, query: &str, limit: i64) -> Result<Vec<Message>> {
        let ids = self.search(account_id, query, limit).await?;
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            messages.push(self.get_message(id).await?);
        }
        Ok(messages)
    }

    /// Drops and repopulates the search mirror from live, non-deleted rows.
    pub async fn rebuild_search_index(&self) -> Result<i64> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("INSERT INTO emails_fts(emails_fts) VALUES ('delete-all')")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO emails_fts(rowid, subject, from_name, from_email, body_text)
             SELECT id, subject, from_name, from_email, body_text FROM emails WHERE is_deleted = 0",
        )
        .execute(&mut *tx)
        .await?;
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails WHERE is_deleted = 0")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(rows, "search index rebuilt");
        Ok(rows)
    }
}
