use crate::db::{Database, now};
use crate::error::{Result, StoreError};
use crate::models::{BatchOperation, BatchPreview, BatchStatus, PendingBatchOp};
use crate::search::like_pattern;
use tracing::{debug, info};

/// Most messages a single batch may snapshot.
pub const BATCH_LIMIT: i64 = 100;

#[derive(sqlx::FromRow)]
struct Candidate {
    id: i64,
    subject: Option<String>,
    from_name: Option<String>,
    from_email: Option<String>,
    date: i64,
}

fn describe(operation: BatchOperation, count: usize, sender: &str) -> String {
    let verb = match operation {
        BatchOperation::Archive => "Archive",
        BatchOperation::Delete => "Delete",
        BatchOperation::MarkRead => "Mark as read",
        BatchOperation::MarkUnread => "Mark as unread",
    };
    format!("{} {} emails from '{}'", verb, count, sender)
}

impl Database {
    /// Snapshots the live messages whose sender address contains
    /// `sender_filter` into a pending batch, awaiting confirmation.
    pub async fn prepare_batch(
        &self,
        account_id: i64,
        operation: BatchOperation,
        sender_filter: &str,
    ) -> Result<PendingBatchOp> {
        let sender = sender_filter.trim();
        if sender.is_empty() {
            return Err(StoreError::validation("batch needs a sender filter"));
        }

        let pattern = like_pattern(sender);
        let candidates = sqlx::query_as::<_, Candidate>(
            "SELECT id, subject, from_name, from_email, date FROM emails
             WHERE account_id = ? AND from_email LIKE ? ESCAPE '\\' AND is_archived = 0 AND is_deleted = 0
             ORDER BY date DESC, id DESC
             LIMIT ?",
        )
        .bind(account_id)
        .bind(&pattern)
        .bind(BATCH_LIMIT)
        .fetch_all(self.pool())
        .await?;

        if candidates.is_empty() {
            return Err(StoreError::validation(format!("no messages from '{}'", sender)));
        }

        let ids: Vec<i64> = candidates.iter().map(|c| c.id).collect();
        let preview: Vec<BatchPreview> = candidates
            .into_iter()
            .map(|c| BatchPreview {
                id: c.id,
                subject: c.subject,
                from_name: c.from_name,
                from_email: c.from_email,
                date: c.date,
            })
            .collect();

        let id = sqlx::query(
            "INSERT INTO pending_batch_ops (
                account_id, operation, description, filter_query, email_ids, email_count,
                preview_data, status, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(account_id)
        .bind(operation)
        .bind(describe(operation, ids.len(), sender))
        .bind(format!("from_email LIKE '{}'", pattern))
        .bind(serde_json::to_string(&ids)?)
        .bind(ids.len() as i64)
        .bind(serde_json::to_string(&preview)?)
        .bind(now())
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        debug!(batch_id = id, account_id, operation = operation.as_str(), count = ids.len(), "batch prepared");
        self.get_batch(id).await
    }

    pub async fn get_batch(&self, id: i64) -> Result<PendingBatchOp> {
        sqlx::query_as::<_, PendingBatchOp>("SELECT * FROM pending_batch_ops WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("batch", id))
    }

    pub async fn list_pending_batches(&self, account_id: i64) -> Result<Vec<PendingBatchOp>> {
        let ops = sqlx::query_as::<_, PendingBatchOp>(
            "SELECT * FROM pending_batch_ops WHERE account_id = ? AND status = 'pending'
             ORDER BY created_at DESC, id DESC",
        )
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;
        Ok(ops)
    }

    async fn set_batch_status(&self, id: i64, to: BatchStatus) -> Result<()> {
        let result = sqlx::query("UPDATE pending_batch_ops SET status = ? WHERE id = ? AND status = 'pending'")
            .bind(to)
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            let op = self.get_batch(id).await?;
            return Err(StoreError::validation(format!(
                "batch {} is {:?}, not pending",
                id, op.status
            )));
        }
        Ok(())
    }

    pub async fn confirm_batch(&self, id: i64) -> Result<()> {
        self.set_batch_status(id, BatchStatus::Confirmed).await
    }

    pub async fn cancel_batch(&self, id: i64) -> Result<()> {
        self.set_batch_status(id, BatchStatus::Cancelled).await
    }

    /// Applies the operation to every snapshotted id still present and
    /// returns how many were changed. The batch is claimed first, so of two
    /// concurrent calls only one runs it.
    pub async fn execute_batch(&self, id: i64) -> Result<usize> {
        let claimed = sqlx::query(
            "UPDATE pending_batch_ops SET status = 'executing'
             WHERE id = ? AND status IN ('pending', 'confirmed')",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        let op = self.get_batch(id).await?;
        if claimed.rows_affected() == 0 {
            return Err(StoreError::validation(format!(
                "batch {} is {:?} and cannot run",
                id, op.status
            )));
        }

        let applied = match self.apply_batch(&op).await {
            Ok(applied) => applied,
            Err(e) => {
                // the flag updates are idempotent
                sqlx::query("UPDATE pending_batch_ops SET status = 'confirmed' WHERE id = ? AND status = 'executing'")
                    .bind(id)
                    .execute(self.pool())
                    .await?;
                return Err(e);
            }
        };

        sqlx::query("UPDATE pending_batch_ops SET status = 'executed', executed_at = ? WHERE id = ? AND status = 'executing'")
            .bind(now())
            .bind(id)
            .execute(self.pool())
            .await?;

        info!(batch_id = id, operation = op.operation.as_str(), applied, "batch executed");
        Ok(applied)
    }

    async fn apply_batch(&self, op: &PendingBatchOp) -> Result<usize> {
        let mut applied = 0;
        for email_id in op.ids()? {
            let result = match op.operation {
                BatchOperation::Archive => self.set_archived(email_id, true).await,
                BatchOperation::Delete => self.soft_delete(email_id).await,
                BatchOperation::MarkRead => self.mark_read(email_id).await,
                BatchOperation::MarkUnread => self.mark_unread(email_id).await,
            };
            match result {
                Ok(()) => applied += 1,
                Err(StoreError::NotFound { .. }) => debug!(batch_id = op.id, email_id, "batch target gone"),
                Err(e) => return Err(e),
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArchiveReason, MessageFilter};
    use crate::sync::SyncRecord;

    async fn mailbox() -> anyhow::Result<(Database, i64)> {
        let db = Database::open_in_memory().await?;
        let account = db.get_or_create_account("me@example.com", None).await?.id;
        for (uid, from) in [(1, "promo@store.example"), (2, "promo@store.example"), (3, "boss@work.example")] {
            let mut r = SyncRecord::new(account, "INBOX", uid, &format!("mail {}", uid));
            r.from_email = Some(from.to_string());
            r.date = uid;
            db.ingest(r).await?;
        }
        Ok((db, account))
    }

    #[tokio::test]
    async fn prepare_snapshots_ids_and_preview() -> anyhow::Result<()> {
        let (db, account) = mailbox().await?;
        let op = db.prepare_batch(account, BatchOperation::Archive, "store.example").await?;

        assert_eq!(op.status, BatchStatus::Pending);
        assert_eq!(op.email_count, 2);
        assert_eq!(op.description, "Archive 2 emails from 'store.example'");
        assert_eq!(op.ids()?.len(), 2);
        assert_eq!(op.preview()?[0].subject.as_deref(), Some("mail 2"));
        assert_eq!(db.list_pending_batches(account).await?.len(), 1);

        assert!(matches!(
            db.prepare_batch(account, BatchOperation::Delete, "nobody").await,
            Err(StoreError::Validation(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn confirmed_batch_executes_once() -> anyhow::Result<()> {
        let (db, account) = mailbox().await?;
        let op = db.prepare_batch(account, BatchOperation::MarkRead, "promo@").await?;
        db.confirm_batch(op.id).await?;
        assert!(db.cancel_batch(op.id).await.is_err());

        assert_eq!(db.execute_batch(op.id).await?, 2);
        let executed = db.get_batch(op.id).await?;
        assert_eq!(executed.status, BatchStatus::Executed);
        assert!(executed.executed_at.is_some());
        assert!(db.execute_batch(op.id).await.is_err());

        let unread = MessageFilter {
            account_id: Some(account),
            unread_only: true,
            ..Default::default()
        };
        assert_eq!(db.list_messages(&unread, 10, 0).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_targets_are_skipped() -> anyhow::Result<()> {
        let (db, account) = mailbox().await?;
        let op = db.prepare_batch(account, BatchOperation::Delete, "promo").await?;
        let ids = op.ids()?;
        db.archive(ids[0], ArchiveReason::ManualArchive).await?;

        assert_eq!(db.execute_batch(op.id).await?, 1);
        assert!(db.get_message(ids[1]).await?.is_deleted);
        Ok(())
    }

    #[tokio::test]
    async fn sender_filter_is_matched_literally() -> anyhow::Result<()> {
        let (db, account) = mailbox().await?;
        for wildcard in ["%", "promo_store"] {
            assert!(matches!(
                db.prepare_batch(account, BatchOperation::Delete, wildcard).await,
                Err(StoreError::Validation(_))
            ));
        }
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_executes_run_the_batch_once() -> anyhow::Result<()> {
        let (db, account) = mailbox().await?;
        let op = db.prepare_batch(account, BatchOperation::MarkRead, "promo").await?;

        let (first, second) = tokio::join!(db.execute_batch(op.id), db.execute_batch(op.id));
        let runs: Vec<usize> = [first, second].into_iter().filter_map(|r| r.ok()).collect();
        assert_eq!(runs, vec![2]);
        assert_eq!(db.get_batch(op.id).await?.status, BatchStatus::Executed);

        sqlx::query("UPDATE pending_batch_ops SET status = 'executing' WHERE id = ?")
            .bind(op.id)
            .execute(db.pool())
            .await?;
        assert!(matches!(db.execute_batch(op.id).await, Err(StoreError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_batch_never_runs() -> anyhow::Result<()> {
        let (db, account) = mailbox().await?;
        let op = db.prepare_batch(account, BatchOperation::Archive, "boss").await?;
        db.cancel_batch(op.id).await?;

        assert!(matches!(db.execute_batch(op.id).await, Err(StoreError::Validation(_))));
        assert!(db.list_pending_batches(account).await?.is_empty());
        Ok(())
    }
}
