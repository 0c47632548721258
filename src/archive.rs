use crate::db::{Database, now};
use crate::error::{Result, StoreError};
use crate::events::StoreEvent;
use crate::models::{ArchiveReason, ArchivedMessage, Lifecycle};
use sqlx::sqlite::SqliteConnection;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashSet;
use tracing::{debug, info, warn};

const SECS_PER_DAY: i64 = 86_400;

/// Copies a live row into `emails_archive`, then removes it. With `at`, the
/// row must still sit at that server location `(remote_folder_id, uid)`.
/// Returns false, changing nothing, when no such row exists. Must run
/// inside the caller's transaction; this is the only place a row leaves
/// the `emails` table.
async fn copy_and_remove(
    conn: &mut SqliteConnection,
    id: i64,
    reason: ArchiveReason,
    at: Option<(i64, i64)>,
) -> Result<bool> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "INSERT INTO emails_archive (
            original_id, account_id, folder_id, uid, message_id, subject, from_name, from_email,
            to_addresses, cc_addresses, date, is_read, is_starred, has_attachments, snippet,
            body_text, body_html, raw_headers, size, original_created_at, original_updated_at,
            archived_at, archive_reason
         )
         SELECT id, account_id, folder_id, uid, message_id, subject, from_name, from_email,
                to_addresses, cc_addresses, date, is_read, is_starred, has_attachments, snippet,
                body_text, body_html, raw_headers, size, created_at, updated_at, ",
    );
    qb.push_bind(now())
        .push(", ")
        .push_bind(reason)
        .push(" FROM emails WHERE id = ")
        .push_bind(id);
    if let Some((remote_folder_id, uid)) = at {
        qb.push(" AND remote_folder_id = ")
            .push_bind(remote_folder_id)
            .push(" AND uid = ")
            .push_bind(uid);
    }
    if qb.build().execute(&mut *conn).await?.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query("DELETE FROM emails WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(true)
}

async fn archive_row(conn: &mut SqliteConnection, id: i64, reason: ArchiveReason) -> Result<()> {
    if !copy_and_remove(conn, id, reason, None).await? {
        return Err(StoreError::not_found("message", id));
    }
    Ok(())
}

impl Database {
    /// Permanently archives one message.
    pub async fn archive(&self, id: i64, reason: ArchiveReason) -> Result<()> {
        let account_id = self.account_of(id).await?;
        let _guard = self.lock_account(account_id).await;
        let mut tx = self.pool().begin().await?;
        archive_row(&mut tx, id, reason).await?;
        tx.commit().await?;
        drop(_guard);

        self.announce_archived(account_id, &[id], reason);
        Ok(())
    }

    fn announce_archived(&self, account_id: i64, ids: &[i64], reason: ArchiveReason) {
        if ids.is_empty() {
            return;
        }
        info!(account_id, count = ids.len(), reason = reason.as_str(), "messages archived");
        for &original_id in ids {
            self.publish(StoreEvent::MessageArchived {
                account_id,
                original_id,
                reason,
            });
        }
    }

    /// Archives the rows whose server location is `folder` and whose uid
    /// `is_gone` reports as removed. Candidates are read and archived in one
    /// transaction under the account lock.
    async fn archive_server_purged<F>(&self, account_id: i64, folder: &str, is_gone: F) -> Result<usize>
    where
        F: Fn(i64) -> bool,
    {
        let _guard = self.lock_account(account_id).await;
        let mut tx = self.pool().begin().await?;

        let folder_id: Option<i64> = sqlx::query_scalar("SELECT id FROM folders WHERE account_id = ? AND name = ?")
            .bind(account_id)
            .bind(folder)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(folder_id) = folder_id else {
            return Ok(0);
        };

        let local: Vec<(i64, i64)> =
            sqlx::query_as("SELECT id, uid FROM emails WHERE account_id = ? AND remote_folder_id = ? ORDER BY id")
                .bind(account_id)
                .bind(folder_id)
                .fetch_all(&mut *tx)
                .await?;

        let mut archived = Vec::new();
        for (id, uid) in local.into_iter().filter(|(_, uid)| is_gone(*uid)) {
            if copy_and_remove(&mut tx, id, ArchiveReason::ServerPurged, Some((folder_id, uid))).await? {
                archived.push(id);
            } else {
                debug!(account_id, message_id = id, uid, "row left its server location, not archived");
            }
        }
        tx.commit().await?;
        drop(_guard);

        self.announce_archived(account_id, &archived, ArchiveReason::ServerPurged);
        Ok(archived.len())
    }

    /// Expunge notification from the sync adapter: the listed uids are gone
    /// from the server. Unknown uids are ignored.
    pub async fn handle_expunge(&self, account_id: i64, folder: &str, uids: &[i64]) -> Result<usize> {
        let gone: HashSet<i64> = uids.iter().copied().collect();
        self.archive_server_purged(account_id, folder, |uid| gone.contains(&uid)).await
    }

    /// Archives local rows of `folder` whose uid the server no longer lists.
    /// An empty listing is treated as a failed fetch and archives nothing.
    pub async fn reconcile_folder(&self, account_id: i64, folder: &str, server_uids: &[i64]) -> Result<usize> {
        if server_uids.is_empty() {
            warn!(account_id, folder, "server listed no uids, skipping reconcile");
            return Ok(0);
        }
        let present: HashSet<i64> = server_uids.iter().copied().collect();
        self.archive_server_purged(account_id, folder, |uid| !present.contains(&uid)).await
    }

    /// Archives soft-deleted rows that have not changed for
    /// `older_than_days` days.
    pub async fn purge_retention(&self, account_id: i64, older_than_days: i64) -> Result<usize> {
        if older_than_days < 0 {
            return Err(StoreError::validation("retention window must not be negative"));
        }
        let cutoff = now().saturating_sub(older_than_days.saturating_mul(SECS_PER_DAY));

        let _guard = self.lock_account(account_id).await;
        let mut tx = self.pool().begin().await?;
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM emails WHERE account_id = ? AND is_deleted = 1 AND updated_at < ? ORDER BY id",
        )
        .bind(account_id)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut archived = Vec::with_capacity(ids.len());
        for id in ids {
            if copy_and_remove(&mut tx, id, ArchiveReason::RetentionExpired, None).await? {
                archived.push(id);
            }
        }
        tx.commit().await?;
        drop(_guard);

        self.announce_archived(account_id, &archived, ArchiveReason::RetentionExpired);
        Ok(archived.len())
    }

    pub async fn list_archived(&self, account_id: i64, limit: i64, offset: i64) -> Result<Vec<ArchivedMessage>> {
        let rows = sqlx::query_as::<_, ArchivedMessage>(
            "SELECT * FROM emails_archive WHERE account_id = ?
             ORDER BY archived_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_archived(&self, original_id: i64) -> Result<Option<ArchivedMessage>> {
        let row = sqlx::query_as::<_, ArchivedMessage>("SELECT * FROM emails_archive WHERE original_id = ?")
            .bind(original_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Where a message id lives now.
    pub async fn message_state(&self, id: i64) -> Result<Lifecycle> {
        let deleted: Option<bool> = sqlx::query_scalar("SELECT is_deleted FROM emails WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        if let Some(deleted) = deleted {
            return Ok(Lifecycle::Live { deleted });
        }

        match self.get_archived(id).await? {
            Some(archived) => Ok(Lifecycle::Archived {
                reason: archived.archive_reason,
                archived_at: archived.archived_at,
            }),
            None => Err(StoreError::not_found("message", id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncRecord;

    async fn seeded(uids: &[i64]) -> anyhow::Result<(Database, i64, Vec<i64>)> {
        let db = Database::open_in_memory().await?;
        let account = db.get_or_create_account("me@example.com", None).await?.id;
        let mut ids = Vec::new();
        for &uid in uids {
            let mut r = SyncRecord::new(account, "INBOX", uid, &format!("message {}", uid));
            r.body_text = Some(format!("body of {}", uid));
            ids.push(db.ingest(r).await?.id);
        }
        Ok((db, account, ids))
    }

    #[tokio::test]
    async fn archive_copies_then_removes() -> anyhow::Result<()> {
        let (db, account, ids) = seeded(&[1]).await?;
        let original = db.get_message(ids[0]).await?;

        db.archive(ids[0], ArchiveReason::ManualArchive).await?;

        assert!(matches!(db.get_message(ids[0]).await, Err(StoreError::NotFound { .. })));
        let archived = db.get_archived(ids[0]).await?.expect("archived copy");
        assert_eq!(archived.subject, original.subject);
        assert_eq!(archived.body_text, original.body_text);
        assert_eq!(archived.original_created_at, original.created_at);
        assert_eq!(archived.archive_reason, ArchiveReason::ManualArchive);
        assert!(db.search(account, "message", 10).await?.is_empty());

        assert!(matches!(
            db.message_state(ids[0]).await?,
            Lifecycle::Archived {
                reason: ArchiveReason::ManualArchive,
                ..
            }
        ));
        assert!(matches!(
            db.archive(ids[0], ArchiveReason::ManualArchive).await,
            Err(StoreError::NotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn soft_delete_alone_never_archives() -> anyhow::Result<()> {
        let (db, account, ids) = seeded(&[1]).await?;
        db.soft_delete(ids[0]).await?;

        assert_eq!(db.message_state(ids[0]).await?, Lifecycle::Live { deleted: true });
        assert_eq!(db.purge_retention(account, 30).await?, 0);
        assert!(db.list_archived(account, 10, 0).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn retention_archives_old_deleted_rows() -> anyhow::Result<()> {
        let (db, account, ids) = seeded(&[1, 2, 3]).await?;
        db.soft_delete(ids[0]).await?;
        db.soft_delete(ids[1]).await?;
        let long_ago = now() - 40 * SECS_PER_DAY;
        sqlx::query("UPDATE emails SET updated_at = ? WHERE id = ?")
            .bind(long_ago)
            .bind(ids[0])
            .execute(db.pool())
            .await?;

        assert_eq!(db.purge_retention(account, 30).await?, 1);
        assert!(matches!(
            db.message_state(ids[0]).await?,
            Lifecycle::Archived {
                reason: ArchiveReason::RetentionExpired,
                ..
            }
        ));
        assert_eq!(db.message_state(ids[1]).await?, Lifecycle::Live { deleted: true });
        assert_eq!(db.message_state(ids[2]).await?, Lifecycle::Live { deleted: false });
        Ok(())
    }

    #[tokio::test]
    async fn expunge_and_reconcile_archive_as_server_purged() -> anyhow::Result<()> {
        let (db, account, ids) = seeded(&[1, 2, 3, 4]).await?;
        let mut events = db.subscribe();

        assert_eq!(db.handle_expunge(account, "INBOX", &[2, 99]).await?, 1);
        assert_eq!(db.handle_expunge(account, "Nowhere", &[1]).await?, 0);
        assert!(matches!(
            events.try_recv()?,
            StoreEvent::MessageArchived {
                reason: ArchiveReason::ServerPurged,
                ..
            }
        ));

        assert_eq!(db.reconcile_folder(account, "INBOX", &[]).await?, 0);
        assert_eq!(db.reconcile_folder(account, "INBOX", &[1, 3]).await?, 1);

        let archived: Vec<i64> = db
            .list_archived(account, 10, 0)
            .await?
            .iter()
            .map(|a| a.original_id)
            .collect();
        assert_eq!(archived.len(), 2);
        assert!(archived.contains(&ids[1]));
        assert!(archived.contains(&ids[3]));

        let live: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails")
            .fetch_one(db.pool())
            .await?;
        assert_eq!(live, 2);
        Ok(())
    }

    #[tokio::test]
    async fn server_purge_follows_server_location() -> anyhow::Result<()> {
        let (db, account, ids) = seeded(&[1, 2]).await?;
        db.move_to_folder(ids[0], "Receipts").await?;

        let mut moved = SyncRecord::new(account, "INBOX", 2, "message 2");
        moved.message_id = Some("<two@example.com>".to_string());
        sqlx::query("UPDATE emails SET message_id = ? WHERE id = ?")
            .bind(&moved.message_id)
            .bind(ids[1])
            .execute(db.pool())
            .await?;
        moved.folder = "All Mail".to_string();
        moved.uid = 50;
        db.ingest(moved).await?;

        assert_eq!(db.reconcile_folder(account, "Receipts", &[99]).await?, 0);
        assert_eq!(db.handle_expunge(account, "INBOX", &[2]).await?, 0);
        assert_eq!(db.message_state(ids[1]).await?, Lifecycle::Live { deleted: false });

        assert_eq!(db.handle_expunge(account, "INBOX", &[1]).await?, 1);
        assert!(matches!(db.message_state(ids[0]).await?, Lifecycle::Archived { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn stale_candidate_is_skipped() -> anyhow::Result<()> {
        let (db, account, ids) = seeded(&[1, 2]).await?;
        let inbox = db.get_or_create_folder(account, "INBOX").await?.id;

        let mut tx = db.pool().begin().await?;
        assert!(!copy_and_remove(&mut tx, ids[0], ArchiveReason::ServerPurged, Some((inbox, 2))).await?);
        assert!(!copy_and_remove(&mut tx, 404, ArchiveReason::ServerPurged, None).await?);
        assert!(copy_and_remove(&mut tx, ids[1], ArchiveReason::ServerPurged, Some((inbox, 2))).await?);
        tx.commit().await?;

        assert_eq!(db.message_state(ids[0]).await?, Lifecycle::Live { deleted: false });
        assert_eq!(db.list_archived(account, 10, 0).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn huge_retention_window_archives_nothing() -> anyhow::Result<()> {
        let (db, account, ids) = seeded(&[1]).await?;
        db.soft_delete(ids[0]).await?;
        assert_eq!(db.purge_retention(account, i64::MAX).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() -> anyhow::Result<()> {
        let (db, _, _) = seeded(&[]).await?;
        assert!(matches!(db.message_state(404).await, Err(StoreError::NotFound { .. })));
        Ok(())
    }
}
