//! Boundary with the sync adapter: parsed message records come in here,
//! one transaction per record.

use crate::db::{self, Database, now};
use crate::error::{Result, StoreError};
use crate::events::StoreEvent;
use crate::messages::fetch_message;
use crate::rule_engine::{self, RuleMatch};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info};

/// An already-parsed message as delivered by the sync adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRecord {
    pub account_id: i64,
    pub folder: String,
    pub uid: i64,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub from_email: Option<String>,
    pub to_addresses: Option<String>,
    pub cc_addresses: Option<String>,
    pub date: i64,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_deleted: bool,
    pub has_attachments: bool,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub raw_headers: Option<String>,
    pub size: i64,
    pub in_reply_to: Option<String>,
    pub thread_id: Option<String>,
}

impl SyncRecord {
    pub fn new(account_id: i64, folder: &str, uid: i64, subject: &str) -> Self {
        Self {
            account_id,
            folder: folder.to_string(),
            uid,
            subject: Some(subject.to_string()),
            ..Default::default()
        }
    }

    fn has_body(&self) -> bool {
        self.body_text.is_some() || self.body_html.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Ingested {
    pub id: i64,
    /// False when the record updated an existing row. Rules only run for
    /// new rows.
    pub is_new: bool,
    pub rule_matches: Vec<RuleMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub inserted: usize,
    pub updated: usize,
    pub rules_matched: usize,
}

impl Database {
    /// Inserts or updates one record. For a genuinely new row the rule
    /// engine runs inside the same transaction, before this returns.
    pub async fn ingest(&self, record: SyncRecord) -> Result<Ingested> {
        if record.folder.is_empty() {
            return Err(StoreError::validation("sync record without folder"));
        }

        let _guard = self.lock_account(record.account_id).await;
        let mut tx = self.pool().begin().await?;
        let folder_id = db::folder_id(&mut tx, record.account_id, &record.folder).await?;

        let outcome = match insert_new(&mut tx, folder_id, &record).await? {
            Some(id) => {
                let message = fetch_message(&mut tx, id)
                    .await?
                    .ok_or_else(|| StoreError::not_found("message", id))?;
                let rule_matches = rule_engine::apply_rules(&mut tx, &message).await?;
                Ingested {
                    id,
                    is_new: true,
                    rule_matches,
                }
            }
            None => {
                let id = update_existing(&mut tx, folder_id, &record).await?;
                Ingested {
                    id,
                    is_new: false,
                    rule_matches: Vec::new(),
                }
            }
        };

        tx.commit().await?;

        if outcome.is_new {
            debug!(
                account_id = record.account_id,
                folder = %record.folder,
                uid = record.uid,
                id = outcome.id,
                rules = outcome.rule_matches.len(),
                "ingested new message"
            );
            self.publish(StoreEvent::MessageIngested {
                account_id: record.account_id,
                message_id: outcome.id,
                rules_matched: outcome.rule_matches.len(),
            });
        }

        Ok(outcome)
    }

    /// [`Database::ingest`] for callers that only need the row id.
    pub async fn upsert(&self, record: SyncRecord) -> Result<i64> {
        Ok(self.ingest(record).await?.id)
    }

    /// Ingests records in delivery order. Stops at the first store error;
    /// everything before it is committed.
    pub async fn ingest_stream<S>(&self, records: S) -> Result<IngestSummary>
    where
        S: Stream<Item = SyncRecord>,
    {
        let mut records = std::pin::pin!(records);
        let mut summary = IngestSummary::default();

        while let Some(record) = records.next().await {
            let outcome = self.ingest(record).await?;
            if outcome.is_new {
                summary.inserted += 1;
            } else {
                summary.updated += 1;
            }
            summary.rules_matched += outcome.rule_matches.len();
        }

        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            rules_matched = summary.rules_matched,
            "ingest batch finished"
        );
        Ok(summary)
    }
}

/// Returns the new row id, or `None` when a uniqueness constraint already
/// holds a row for this message.
async fn insert_new(conn: &mut SqliteConnection, folder_id: i64, r: &SyncRecord) -> Result<Option<i64>> {
    let ts = now();
    let result = sqlx::query(
        "INSERT INTO emails (
            account_id, folder_id, remote_folder_id, uid, message_id, subject, from_name,
            from_email, to_addresses, cc_addresses, date, is_read, is_starred, is_deleted,
            has_attachments, body_indexed, snippet, body_text, body_html, raw_headers,
            size, in_reply_to, thread_id, created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT DO NOTHING",
    )
    .bind(r.account_id)
    .bind(folder_id)
    .bind(folder_id)
    .bind(r.uid)
    .bind(&r.message_id)
    .bind(&r.subject)
    .bind(&r.from_name)
    .bind(&r.from_email)
    .bind(&r.to_addresses)
    .bind(&r.cc_addresses)
    .bind(r.date)
    .bind(r.is_read)
    .bind(r.is_starred)
    .bind(r.is_deleted)
    .bind(r.has_attachments)
    .bind(r.has_body())
    .bind(&r.snippet)
    .bind(&r.body_text)
    .bind(&r.body_html)
    .bind(&r.raw_headers)
    .bind(r.size)
    .bind(&r.in_reply_to)
    .bind(&r.thread_id)
    .bind(ts)
    .bind(ts)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        Ok(Some(result.last_insert_rowid()))
    } else {
        Ok(None)
    }
}

/// A duplicate is an update, never an error. Rows are keyed by their server
/// location, so a local move survives the next sync. A row found only by
/// message id has moved on the server: its server location follows the
/// record, and its local folder follows too unless it was filed elsewhere
/// locally.
async fn update_existing(conn: &mut SqliteConnection, folder_id: i64, r: &SyncRecord) -> Result<i64> {
    let by_uid: Option<i64> =
        sqlx::query_scalar("SELECT id FROM emails WHERE account_id = ? AND remote_folder_id = ? AND uid = ?")
            .bind(r.account_id)
            .bind(folder_id)
            .bind(r.uid)
            .fetch_optional(&mut *conn)
            .await?;

    let id = match (by_uid, &r.message_id) {
        (Some(id), _) => id,
        (None, Some(message_id)) => {
            sqlx::query_scalar("SELECT id FROM emails WHERE account_id = ? AND message_id = ?")
                .bind(r.account_id)
                .bind(message_id)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| StoreError::not_found("message", message_id))?
        }
        (None, None) => return Err(StoreError::not_found("message", r.uid)),
    };

    sqlx::query(
        "UPDATE emails SET
            folder_id = CASE WHEN folder_id = remote_folder_id THEN ? ELSE folder_id END,
            remote_folder_id = ?,
            uid = ?,
            subject = ?,
            from_name = ?,
            from_email = ?,
            to_addresses = ?,
            cc_addresses = ?,
            date = ?,
            is_read = ?,
            is_starred = ?,
            is_deleted = MAX(is_deleted, ?),
            has_attachments = ?,
            snippet = COALESCE(?, snippet),
            body_text = COALESCE(?, body_text),
            body_html = COALESCE(?, body_html),
            body_indexed = MAX(body_indexed, ?),
            raw_headers = COALESCE(?, raw_headers),
            size = ?,
            in_reply_to = COALESCE(?, in_reply_to),
            thread_id = COALESCE(?, thread_id),
            updated_at = ?
         WHERE id = ?",
    )
    .bind(folder_id)
    .bind(folder_id)
    .bind(r.uid)
    .bind(&r.subject)
    .bind(&r.from_name)
    .bind(&r.from_email)
    .bind(&r.to_addresses)
    .bind(&r.cc_addresses)
    .bind(r.date)
    .bind(r.is_read)
    .bind(r.is_starred)
    .bind(r.is_deleted)
    .bind(r.has_attachments)
    .bind(&r.snippet)
    .bind(&r.body_text)
    .bind(&r.body_html)
    .bind(r.has_body())
    .bind(&r.raw_headers)
    .bind(r.size)
    .bind(&r.in_reply_to)
    .bind(&r.thread_id)
    .bind(now())
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageFilter;

    #[tokio::test]
    async fn duplicate_uid_updates_instead_of_failing() -> anyhow::Result<()> {
        let db = Database::open_in_memory().await?;
        let account = db.get_or_create_account("me@example.com", None).await?.id;

        let first = db.ingest(SyncRecord::new(account, "INBOX", 10, "Draft v1")).await?;
        assert!(first.is_new);

        let mut again = SyncRecord::new(account, "INBOX", 10, "Draft v2");
        again.is_read = true;
        let second = db.ingest(again).await?;
        assert!(!second.is_new);
        assert_eq!(first.id, second.id);

        let message = db.get_message(first.id).await?;
        assert_eq!(message.subject.as_deref(), Some("Draft v2"));
        assert!(message.is_read);
        Ok(())
    }

    #[tokio::test]
    async fn same_message_id_in_new_folder_keeps_row_identity() -> anyhow::Result<()> {
        let db = Database::open_in_memory().await?;
        let account = db.get_or_create_account("me@example.com", None).await?.id;

        let mut record = SyncRecord::new(account, "INBOX", 3, "Moved on server");
        record.message_id = Some("<abc@example.com>".to_string());
        let first = db.ingest(record.clone()).await?;

        record.folder = "Archive".to_string();
        record.uid = 900;
        let second = db.ingest(record).await?;

        assert!(!second.is_new);
        assert_eq!(first.id, second.id);
        let message = db.get_message(first.id).await?;
        assert_eq!(message.uid, 900);
        let archive = db.get_or_create_folder(account, "Archive").await?;
        assert_eq!(message.folder_id, archive.id);
        assert_eq!(message.remote_folder_id, archive.id);
        Ok(())
    }

    #[tokio::test]
    async fn local_filing_survives_resync_and_server_moves() -> anyhow::Result<()> {
        let db = Database::open_in_memory().await?;
        let account = db.get_or_create_account("me@example.com", None).await?.id;

        let mut record = SyncRecord::new(account, "INBOX", 8, "Receipt");
        record.message_id = Some("<r8@shop.example>".to_string());
        let id = db.ingest(record.clone()).await?.id;
        let receipts = db.move_to_folder(id, "Receipts").await?;
        let inbox = db.get_or_create_folder(account, "INBOX").await?.id;

        assert_eq!(db.ingest(record.clone()).await?.id, id);
        let message = db.get_message(id).await?;
        assert_eq!(message.folder_id, receipts);
        assert_eq!(message.remote_folder_id, inbox);
        assert_eq!(db.get_message_by_uid(account, inbox, 8).await?.map(|m| m.id), Some(id));

        record.folder = "All Mail".to_string();
        record.uid = 77;
        assert_eq!(db.ingest(record).await?.id, id);
        let message = db.get_message(id).await?;
        let all_mail = db.get_or_create_folder(account, "All Mail").await?.id;
        assert_eq!(message.folder_id, receipts);
        assert_eq!(message.remote_folder_id, all_mail);
        assert_eq!(message.uid, 77);
        assert!(db.get_message_by_uid(account, inbox, 8).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn update_without_body_keeps_indexed_body() -> anyhow::Result<()> {
        let db = Database::open_in_memory().await?;
        let account = db.get_or_create_account("me@example.com", None).await?.id;

        let mut record = SyncRecord::new(account, "INBOX", 1, "With body");
        record.body_text = Some("the full text".to_string());
        let id = db.upsert(record).await?;
        assert!(db.get_message(id).await?.body_indexed);

        assert_eq!(db.upsert(SyncRecord::new(account, "INBOX", 1, "With body")).await?, id);
        let message = db.get_message(id).await?;
        assert!(message.body_indexed);
        assert_eq!(message.body_text.as_deref(), Some("the full text"));
        Ok(())
    }

    #[tokio::test]
    async fn stream_is_processed_in_delivery_order() -> anyhow::Result<()> {
        let db = Database::open_in_memory().await?;
        let account = db.get_or_create_account("me@example.com", None).await?.id;
        let mut events = db.subscribe();

        let records = (1..=5).map(|uid| SyncRecord::new(account, "INBOX", uid, "bulk"));
        let summary = db.ingest_stream(futures::stream::iter(records)).await?;
        assert_eq!(summary.inserted, 5);

        let again = (1..=2).map(|uid| SyncRecord::new(account, "INBOX", uid, "bulk"));
        let summary = db.ingest_stream(futures::stream::iter(again)).await?;
        assert_eq!(summary.updated, 2);

        let filter = MessageFilter {
            account_id: Some(account),
            ..Default::default()
        };
        let mut ids: Vec<i64> = db
            .list_messages(&filter, 10, 0)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();
        ids.sort();

        let mut published = Vec::new();
        while let Ok(StoreEvent::MessageIngested { message_id, .. }) = events.try_recv() {
            published.push(message_id);
        }
        assert_eq!(published, ids);
        Ok(())
    }

    #[tokio::test]
    async fn record_without_folder_is_rejected() -> anyhow::Result<()> {
        let db = Database::open_in_memory().await?;
        let record = SyncRecord {
            account_id: 1,
            uid: 1,
            ..Default::default()
        };
        assert!(matches!(db.ingest(record).await, Err(StoreError::Validation(_))));
        Ok(())
    }
}
