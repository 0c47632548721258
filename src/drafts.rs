use crate::db::{Database, now};
use crate::error::{Result, StoreError};
use crate::events::StoreEvent;
use crate::models::{Draft, DraftHistory, DraftStatus, NewDraft, SentEmail};
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const INTERRUPTED: &str = "interrupted";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// What the transport reports back after accepting a message.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: Option<String>,
    pub send_method: String,
}

/// Outbound delivery (SMTP, provider API, ...).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, draft: &Draft) -> std::result::Result<SendReceipt, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { draft_id: i64, sent_email_id: i64 },
    Failed { draft_id: i64, error: String },
}

pub(crate) async fn insert_draft(conn: &mut SqliteConnection, draft: &NewDraft, status: DraftStatus) -> Result<i64> {
    if draft.to_addresses.trim().is_empty() {
        return Err(StoreError::validation("draft has no recipients"));
    }
    let ts = now();
    let id = sqlx::query(
        "INSERT INTO drafts (
            account_id, to_addresses, cc_addresses, bcc_addresses, subject, body_html, body_text,
            classification, in_reply_to, reference_ids, reply_to_email_id, status, scheduled_send_at,
            generation_source, ai_prompt, created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(draft.account_id)
    .bind(draft.to_addresses.trim())
    .bind(&draft.cc_addresses)
    .bind(&draft.bcc_addresses)
    .bind(&draft.subject)
    .bind(&draft.body_html)
    .bind(&draft.body_text)
    .bind(&draft.classification)
    .bind(&draft.in_reply_to)
    .bind(&draft.reference_ids)
    .bind(draft.reply_to_email_id)
    .bind(status)
    .bind(draft.scheduled_send_at)
    .bind(draft.generation_source)
    .bind(&draft.ai_prompt)
    .bind(ts)
    .bind(ts)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

async fn fetch_draft(conn: &mut SqliteConnection, id: i64) -> Result<Draft> {
    sqlx::query_as::<_, Draft>("SELECT * FROM drafts WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("draft", id))
}

fn ensure(from: DraftStatus, to: DraftStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// A guarded update that touched nothing means the status changed under us.
fn guarded(rows_affected: u64, from: DraftStatus, to: DraftStatus) -> Result<()> {
    if rows_affected == 0 {
        return Err(StoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

/// Copies a terminal draft into `drafts_history` and removes the live row.
async fn move_to_history(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO drafts_history (
            original_id, account_id, to_addresses, cc_addresses, bcc_addresses, subject, body_html,
            body_text, classification, in_reply_to, reference_ids, reply_to_email_id, final_status,
            scheduled_send_at, sent_at, generation_source, ai_prompt, error_message,
            original_created_at, original_updated_at, archived_at
         )
         SELECT id, account_id, to_addresses, cc_addresses, bcc_addresses, subject, body_html,
                body_text, classification, in_reply_to, reference_ids, reply_to_email_id, status,
                scheduled_send_at, sent_at, generation_source, ai_prompt, error_message,
                created_at, updated_at, ?
         FROM drafts WHERE id = ? AND status IN ('sent', 'cancelled')",
    )
    .bind(now())
    .bind(id)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM drafts WHERE id = ? AND status IN ('sent', 'cancelled')")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

impl Database {
    fn draft_changed(&self, draft: &Draft, status: DraftStatus) {
        debug!(draft_id = draft.id, from = %draft.status, to = %status, "draft transition");
        self.publish(StoreEvent::DraftStatusChanged {
            account_id: draft.account_id,
            draft_id: draft.id,
            status,
        });
    }

    /// New drafts start as `draft`, or `scheduled` when a send time is given.
    pub async fn create_draft(&self, draft: &NewDraft) -> Result<Draft> {
        let status = if draft.scheduled_send_at.is_some() {
            DraftStatus::Scheduled
        } else {
            DraftStatus::Draft
        };
        let mut conn = self.pool().acquire().await?;
        let id = insert_draft(&mut conn, draft, status).await?;
        let created = fetch_draft(&mut conn, id).await?;
        info!(draft_id = id, account_id = draft.account_id, status = %status, "draft created");
        Ok(created)
    }

    pub async fn get_draft(&self, id: i64) -> Result<Draft> {
        let mut conn = self.pool().acquire().await?;
        fetch_draft(&mut conn, id).await
    }

    /// Replaces a draft's content. Only `draft` and `failed` drafts are
    /// editable; the status and schedule are left alone.
    pub async fn update_draft(&self, id: i64, content: &NewDraft) -> Result<Draft> {
        if content.to_addresses.trim().is_empty() {
            return Err(StoreError::validation("draft has no recipients"));
        }
        let result = sqlx::query(
            "UPDATE drafts SET
                to_addresses = ?, cc_addresses = ?, bcc_addresses = ?, subject = ?, body_html = ?,
                body_text = ?, classification = ?, in_reply_to = ?, reference_ids = ?,
                reply_to_email_id = ?, ai_prompt = ?, updated_at = ?
             WHERE id = ? AND status IN ('draft', 'failed')",
        )
        .bind(content.to_addresses.trim())
        .bind(&content.cc_addresses)
        .bind(&content.bcc_addresses)
        .bind(&content.subject)
        .bind(&content.body_html)
        .bind(&content.body_text)
        .bind(&content.classification)
        .bind(&content.in_reply_to)
        .bind(&content.reference_ids)
        .bind(content.reply_to_email_id)
        .bind(&content.ai_prompt)
        .bind(now())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            let current = self.get_draft(id).await?;
            return Err(StoreError::validation(format!(
                "draft {} is {} and cannot be edited",
                id, current.status
            )));
        }
        self.get_draft(id).await
    }

    pub async fn list_drafts(&self, account_id: i64, status: Option<DraftStatus>) -> Result<Vec<Draft>> {
        let drafts = match status {
            Some(status) => {
                sqlx::query_as::<_, Draft>(
                    "SELECT * FROM drafts WHERE account_id = ? AND status = ? ORDER BY updated_at DESC, id DESC",
                )
                .bind(account_id)
                .bind(status)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, Draft>("SELECT * FROM drafts WHERE account_id = ? ORDER BY updated_at DESC, id DESC")
                    .bind(account_id)
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(drafts)
    }

    pub async fn schedule_draft(&self, id: i64, send_at: i64) -> Result<Draft> {
        let draft = self.get_draft(id).await?;
        ensure(draft.status, DraftStatus::Scheduled)?;
        let result = sqlx::query(
            "UPDATE drafts SET status = 'scheduled', scheduled_send_at = ?, updated_at = ?
             WHERE id = ? AND status = 'draft'",
        )
        .bind(send_at)
        .bind(now())
        .bind(id)
        .execute(self.pool())
        .await?;
        guarded(result.rows_affected(), draft.status, DraftStatus::Scheduled)?;
        self.draft_changed(&draft, DraftStatus::Scheduled);
        self.get_draft(id).await
    }

    pub async fn unschedule_draft(&self, id: i64) -> Result<Draft> {
        let draft = self.get_draft(id).await?;
        ensure(draft.status, DraftStatus::Draft)?;
        let result = sqlx::query(
            "UPDATE drafts SET status = 'draft', scheduled_send_at = NULL, updated_at = ?
             WHERE id = ? AND status = 'scheduled'",
        )
        .bind(now())
        .bind(id)
        .execute(self.pool())
        .await?;
        guarded(result.rows_affected(), draft.status, DraftStatus::Draft)?;
        self.draft_changed(&draft, DraftStatus::Draft);
        self.get_draft(id).await
    }

    /// Puts a failed draft back to `draft`, clearing the error.
    pub async fn retry_draft(&self, id: i64) -> Result<Draft> {
        let draft = self.get_draft(id).await?;
        if draft.status != DraftStatus::Failed {
            return Err(StoreError::InvalidTransition {
                from: draft.status.to_string(),
                to: DraftStatus::Draft.to_string(),
            });
        }
        let result = sqlx::query(
            "UPDATE drafts SET status = 'draft', error_message = NULL, scheduled_send_at = NULL, updated_at = ?
             WHERE id = ? AND status = 'failed'",
        )
        .bind(now())
        .bind(id)
        .execute(self.pool())
        .await?;
        guarded(result.rows_affected(), draft.status, DraftStatus::Draft)?;
        self.draft_changed(&draft, DraftStatus::Draft);
        self.get_draft(id).await
    }

    /// Cancels a draft and moves it to history.
    pub async fn cancel_draft(&self, id: i64) -> Result<()> {
        let draft = self.get_draft(id).await?;
        ensure(draft.status, DraftStatus::Cancelled)?;

        let mut tx = self.pool().begin().await?;
        let result = sqlx::query("UPDATE drafts SET status = 'cancelled', updated_at = ? WHERE id = ? AND status = 'draft'")
            .bind(now())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        guarded(result.rows_affected(), draft.status, DraftStatus::Cancelled)?;
        move_to_history(&mut tx, id).await?;
        tx.commit().await?;

        self.draft_changed(&draft, DraftStatus::Cancelled);
        info!(draft_id = id, "draft cancelled");
        Ok(())
    }

    /// Sends immediately. A plain draft is scheduled for now first, so the
    /// send goes through the same claim as the scheduler's.
    pub async fn send_now(&self, id: i64, transport: &dyn Transport) -> Result<SendOutcome> {
        let draft = self.get_draft(id).await?;
        if draft.status == DraftStatus::Draft {
            self.schedule_draft(id, now()).await?;
        } else {
            ensure(draft.status, DraftStatus::Sending)?;
        }

        match self.claim(id).await? {
            Some(claimed) => self.settle(claimed, transport).await,
            None => Err(StoreError::InvalidTransition {
                from: draft.status.to_string(),
                to: DraftStatus::Sending.to_string(),
            }),
        }
    }

    /// Sends every scheduled draft whose time has come. A store error on
    /// one draft fails that draft and the tick moves on to the next.
    pub async fn process_due(&self, at: i64, transport: &dyn Transport) -> Result<Vec<SendOutcome>> {
        let due: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM drafts WHERE status = 'scheduled' AND scheduled_send_at <= ?
             ORDER BY scheduled_send_at ASC, id ASC",
        )
        .bind(at)
        .fetch_all(self.pool())
        .await?;

        let mut outcomes = Vec::with_capacity(due.len());
        for id in due {
            let claimed = match self.claim(id).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => continue,
                Err(e) => {
                    warn!(draft_id = id, error = %e, "could not claim due draft");
                    continue;
                }
            };
            match self.settle(claimed, transport).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(draft_id = id, error = %e, "draft left in sending"),
            }
        }
        Ok(outcomes)
    }

    /// Delivers a claimed draft. When the store fails along the way the
    /// draft is marked failed with that error instead of staying in
    /// `sending`.
    async fn settle(&self, draft: Draft, transport: &dyn Transport) -> Result<SendOutcome> {
        let id = draft.id;
        let account_id = draft.account_id;
        match self.deliver(draft, transport).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let message = e.to_string();
                let result = sqlx::query(
                    "UPDATE drafts SET status = 'failed', error_message = ?, updated_at = ?
                     WHERE id = ? AND status = 'sending'",
                )
                .bind(&message)
                .bind(now())
                .bind(id)
                .execute(self.pool())
                .await;
                match result {
                    Ok(r) if r.rows_affected() > 0 => {
                        self.publish(StoreEvent::DraftStatusChanged {
                            account_id,
                            draft_id: id,
                            status: DraftStatus::Failed,
                        });
                        Ok(SendOutcome::Failed {
                            draft_id: id,
                            error: message,
                        })
                    }
                    Ok(_) => Err(e),
                    Err(e2) => {
                        warn!(draft_id = id, error = %e2, "could not mark draft failed");
                        Err(e)
                    }
                }
            }
        }
    }

    /// `scheduled -> sending`. Returns `None` when another caller won.
    async fn claim(&self, id: i64) -> Result<Option<Draft>> {
        let result = sqlx::query("UPDATE drafts SET status = 'sending', updated_at = ? WHERE id = ? AND status = 'scheduled'")
            .bind(now())
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let draft = self.get_draft(id).await?;
        self.publish(StoreEvent::DraftStatusChanged {
            account_id: draft.account_id,
            draft_id: id,
            status: DraftStatus::Sending,
        });
        Ok(Some(draft))
    }

    async fn deliver(&self, draft: Draft, transport: &dyn Transport) -> Result<SendOutcome> {
        match transport.send(&draft).await {
            Ok(receipt) => {
                let sent_email_id = match self.finish_sent(&draft, &receipt).await {
                    Ok(id) => id,
                    Err(e) => {
                        error!(draft_id = draft.id, error = %e, "transport accepted draft but recording it failed");
                        return Err(e);
                    }
                };
                info!(draft_id = draft.id, sent_email_id, method = %receipt.send_method, "draft sent");
                Ok(SendOutcome::Sent {
                    draft_id: draft.id,
                    sent_email_id,
                })
            }
            Err(e) => {
                let message = e.to_string();
                warn!(draft_id = draft.id, error = %message, "draft send failed");
                let result = sqlx::query(
                    "UPDATE drafts SET status = 'failed', error_message = ?, updated_at = ?
                     WHERE id = ? AND status = 'sending'",
                )
                .bind(&message)
                .bind(now())
                .bind(draft.id)
                .execute(self.pool())
                .await?;
                guarded(result.rows_affected(), DraftStatus::Sending, DraftStatus::Failed)?;
                self.draft_changed(&draft, DraftStatus::Failed);
                Ok(SendOutcome::Failed {
                    draft_id: draft.id,
                    error: message,
                })
            }
        }
    }

    async fn finish_sent(&self, draft: &Draft, receipt: &SendReceipt) -> Result<i64> {
        let sent_at = now();
        let mut tx = self.pool().begin().await?;

        let sent_email_id = sqlx::query(
            "INSERT INTO sent_emails (
                account_id, message_id, to_addresses, cc_addresses, bcc_addresses, subject, body_html,
                body_text, in_reply_to, reference_ids, reply_to_email_id, sent_at, send_method, draft_id
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(draft.account_id)
        .bind(&receipt.message_id)
        .bind(&draft.to_addresses)
        .bind(&draft.cc_addresses)
        .bind(&draft.bcc_addresses)
        .bind(&draft.subject)
        .bind(&draft.body_html)
        .bind(&draft.body_text)
        .bind(&draft.in_reply_to)
        .bind(&draft.reference_ids)
        .bind(draft.reply_to_email_id)
        .bind(sent_at)
        .bind(&receipt.send_method)
        .bind(draft.id)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let result = sqlx::query(
            "UPDATE drafts SET status = 'sent', sent_at = ?, error_message = NULL, updated_at = ?
             WHERE id = ? AND status = 'sending'",
        )
        .bind(sent_at)
        .bind(sent_at)
        .bind(draft.id)
        .execute(&mut *tx)
        .await?;
        guarded(result.rows_affected(), DraftStatus::Sending, DraftStatus::Sent)?;
        move_to_history(&mut tx, draft.id).await?;

        if let Some(reply_to) = draft.reply_to_email_id {
            sqlx::query("UPDATE emails SET is_replied = 1, updated_at = ? WHERE id = ?")
                .bind(sent_at)
                .bind(reply_to)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.draft_changed(draft, DraftStatus::Sent);
        Ok(sent_email_id)
    }

    /// Drafts left in `sending` by a crash are failed rather than resent,
    /// since the transport may already have accepted them.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE drafts SET status = 'failed', error_message = ?, updated_at = ? WHERE status = 'sending'",
        )
        .bind(INTERRUPTED)
        .bind(now())
        .execute(self.pool())
        .await?;
        let count = result.rows_affected();
        if count > 0 {
            warn!(count, "drafts interrupted while sending marked failed");
        }
        Ok(count)
    }

    pub async fn draft_history(&self, account_id: i64, limit: i64) -> Result<Vec<DraftHistory>> {
        let rows = sqlx::query_as::<_, DraftHistory>(
            "SELECT * FROM drafts_history WHERE account_id = ? ORDER BY archived_at DESC, id DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn sent_emails(&self, account_id: i64, limit: i64) -> Result<Vec<SentEmail>> {
        let rows = sqlx::query_as::<_, SentEmail>(
            "SELECT * FROM sent_emails WHERE account_id = ? ORDER BY sent_at DESC, id DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

/// Background task that sends due drafts on a fixed tick.
pub struct DraftScheduler {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    tick: Duration,
}

pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "draft scheduler task panicked");
        }
    }
}

impl DraftScheduler {
    pub fn new(db: Arc<Database>, transport: Arc<dyn Transport>, tick: Duration) -> Self {
        Self { db, transport, tick }
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            if let Err(e) = self.db.recover_interrupted().await {
                warn!(error = %e, "could not recover interrupted drafts");
            }

            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(tick_ms = self.tick.as_millis() as u64, "draft scheduler started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.db.process_due(now(), self.transport.as_ref()).await {
                            Ok(outcomes) if !outcomes.is_empty() => {
                                debug!(processed = outcomes.len(), "scheduler tick");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "scheduler tick failed"),
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            info!("draft scheduler stopped");
        });
        SchedulerHandle { stop, task }
    }
}
