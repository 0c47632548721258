//! Background body backfill. One worker per account walks unindexed rows in
//! ascending uid order, fetches their bodies from a [`BodySource`] and
//! commits each batch together with the persisted cursor, so a restart
//! resumes exactly at the last committed batch.

use crate::config::IndexerConfig;
use crate::db::{Database, now};
use crate::error::{Result, StoreError};
use crate::events::StoreEvent;
use crate::models::{ContentIndexState, IndexStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A row waiting for its body.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingBody {
    pub id: i64,
    /// Server folder to fetch from.
    pub remote_folder_id: i64,
    pub uid: i64,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchedBody {
    pub email_id: i64,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("body fetch failed: {0}")]
    Transient(String),
    #[error("message could not be parsed: {0}")]
    Parse(String),
}

/// Where bodies come from (usually the IMAP side of the sync adapter).
/// Messages missing from the returned list are marked indexed without a
/// body.
#[async_trait]
pub trait BodySource: Send + Sync {
    async fn fetch_bodies(
        &self,
        account_id: i64,
        batch: &[PendingBody],
    ) -> std::result::Result<Vec<FetchedBody>, FetchError>;
}

fn pacing(batch_len: usize, speed: i64) -> Duration {
    if speed <= 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(batch_len as u64 * 60_000 / speed as u64)
}

/// Sleeps for `delay` unless cancelled first. Returns true when the worker
/// should stop.
async fn sleep_or_cancel(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if !delay.is_zero() {
        let closed = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            changed = cancel.changed() => changed.is_err(),
        };
        if closed {
            return true;
        }
    }
    let cancelled = *cancel.borrow();
    cancelled
}

impl Database {
    pub async fn content_index_state(&self, account_id: i64) -> Result<Option<ContentIndexState>> {
        let state = sqlx::query_as::<_, ContentIndexState>("SELECT * FROM content_index_state WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(state)
    }

    async fn ensure_index_state(&self, account_id: i64, speed: i64) -> Result<ContentIndexState> {
        let ts = now();
        sqlx::query(
            "INSERT INTO content_index_state (account_id, status, speed, created_at, updated_at)
             VALUES (?, 'pending', ?, ?, ?)
             ON CONFLICT(account_id) DO NOTHING",
        )
        .bind(account_id)
        .bind(speed)
        .bind(ts)
        .bind(ts)
        .execute(self.pool())
        .await?;
        self.require_index_state(account_id).await
    }

    async fn require_index_state(&self, account_id: i64) -> Result<ContentIndexState> {
        self.content_index_state(account_id)
            .await?
            .ok_or_else(|| StoreError::not_found("content index state", account_id))
    }

    fn publish_index(&self, state: &ContentIndexState) {
        self.publish(StoreEvent::IndexerProgress {
            account_id: state.account_id,
            status: state.status,
            indexed: state.indexed_emails,
            total: state.total_emails,
        });
    }

    /// Enters `running` and refreshes the counters. A rescan after
    /// completion starts the cursor over.
    async fn begin_indexing(&self, account_id: i64) -> Result<ContentIndexState> {
        let (total, indexed): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(body_indexed), 0) FROM emails WHERE account_id = ? AND is_deleted = 0",
        )
        .bind(account_id)
        .fetch_one(self.pool())
        .await?;

        let ts = now();
        sqlx::query(
            "UPDATE content_index_state SET
                last_indexed_uid = CASE WHEN status = 'completed' THEN 0 ELSE last_indexed_uid END,
                started_at = CASE WHEN status IN ('pending', 'completed') OR started_at IS NULL THEN ? ELSE started_at END,
                status = 'running',
                paused_at = NULL,
                completed_at = NULL,
                total_emails = ?,
                indexed_emails = ?,
                error_count = 0,
                updated_at = ?
             WHERE account_id = ?",
        )
        .bind(ts)
        .bind(total)
        .bind(indexed)
        .bind(ts)
        .bind(account_id)
        .execute(self.pool())
        .await?;

        let state = self.require_index_state(account_id).await?;
        self.publish_index(&state);
        Ok(state)
    }

    /// Leaves `running` for `to`. A no-op when the state already left
    /// `running` (for example a pause that raced the worker).
    async fn end_indexing(&self, account_id: i64, to: IndexStatus, error: Option<&str>) -> Result<IndexStatus> {
        let ts = now();
        sqlx::query(
            "UPDATE content_index_state SET
                status = ?,
                paused_at = CASE WHEN ? = 'paused' THEN ? ELSE paused_at END,
                completed_at = CASE WHEN ? = 'completed' THEN ? ELSE completed_at END,
                last_error = COALESCE(?, last_error),
                updated_at = ?
             WHERE account_id = ? AND status = 'running'",
        )
        .bind(to)
        .bind(to)
        .bind(ts)
        .bind(to)
        .bind(ts)
        .bind(error)
        .bind(ts)
        .bind(account_id)
        .execute(self.pool())
        .await?;

        let state = self.require_index_state(account_id).await?;
        self.publish_index(&state);
        Ok(state.status)
    }

    /// Counts consecutive failures on the current batch. A committed batch
    /// or a fresh start clears the count.
    async fn record_fetch_error(&self, account_id: i64, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE content_index_state SET last_error = ?, error_count = error_count + 1, updated_at = ?
             WHERE account_id = ? AND status = 'running'",
        )
        .bind(message)
        .bind(now())
        .bind(account_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Next rows past the cursor. The batch is extended to every unindexed
    /// row sharing its last uid, so advancing the cursor to that uid never
    /// skips a row.
    async fn next_index_batch(&self, account_id: i64, after_uid: i64, batch_size: i64) -> Result<Vec<PendingBody>> {
        let mut batch = sqlx::query_as::<_, PendingBody>(
            "SELECT id, remote_folder_id, uid, message_id FROM emails
             WHERE account_id = ? AND uid > ? AND body_indexed = 0 AND is_deleted = 0
             ORDER BY uid ASC, id ASC
             LIMIT ?",
        )
        .bind(account_id)
        .bind(after_uid)
        .bind(batch_size)
        .fetch_all(self.pool())
        .await?;

        if batch.len() as i64 == batch_size {
            if let Some(last) = batch.last().cloned() {
                let ties = sqlx::query_as::<_, PendingBody>(
                    "SELECT id, remote_folder_id, uid, message_id FROM emails
                     WHERE account_id = ? AND uid = ? AND id > ? AND body_indexed = 0 AND is_deleted = 0
                     ORDER BY id ASC",
                )
                .bind(account_id)
                .bind(last.uid)
                .bind(last.id)
                .fetch_all(self.pool())
                .await?;
                batch.extend(ties);
            }
        }
        Ok(batch)
    }

    /// Writes the bodies, the cursor and the counters in one transaction.
    /// Fails with [`StoreError::IndexerNotRunning`], writing nothing, when
    /// the state left `running` meanwhile.
    async fn commit_index_batch(
        &self,
        account_id: i64,
        batch: &[PendingBody],
        bodies: Vec<FetchedBody>,
    ) -> Result<ContentIndexState> {
        let Some(last) = batch.last() else {
            return self.require_index_state(account_id).await;
        };
        let mut bodies: HashMap<i64, FetchedBody> = bodies.into_iter().map(|b| (b.email_id, b)).collect();

        let _guard = self.lock_account(account_id).await;
        let mut tx = self.pool().begin().await?;
        let ts = now();

        let mut indexed = 0u64;
        for row in batch {
            let body = bodies.remove(&row.id).unwrap_or_default();
            let result = sqlx::query(
                "UPDATE emails SET
                    body_text = COALESCE(?, body_text),
                    body_html = COALESCE(?, body_html),
                    body_indexed = 1,
                    updated_at = ?
                 WHERE id = ? AND body_indexed = 0 AND is_deleted = 0",
            )
            .bind(body.body_text)
            .bind(body.body_html)
            .bind(ts)
            .bind(row.id)
            .execute(&mut *tx)
            .await?;
            indexed += result.rows_affected();
        }

        let result = sqlx::query(
            "UPDATE content_index_state SET
                last_indexed_uid = MAX(last_indexed_uid, ?),
                indexed_emails = indexed_emails + ?,
                error_count = 0,
                updated_at = ?
             WHERE account_id = ? AND status = 'running'",
        )
        .bind(last.uid)
        .bind(indexed as i64)
        .bind(ts)
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::IndexerNotRunning(account_id));
        }

        tx.commit().await?;
        drop(_guard);

        let state = self.require_index_state(account_id).await?;
        self.publish_index(&state);
        Ok(state)
    }
}

enum Fetched {
    Bodies(Vec<FetchedBody>),
    Cancelled,
    GaveUp,
}

struct Worker {
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<IndexStatus>>,
}

impl Worker {
    /// Waits for the task while keeping the cancel channel open, so the
    /// worker does not mistake the wait for a stop request.
    async fn join(self) -> Result<IndexStatus> {
        let Worker { cancel, task } = self;
        let result = task.await;
        drop(cancel);
        result.map_err(|e| StoreError::Task(e.to_string()))?
    }
}

struct Run {
    db: Arc<Database>,
    source: Arc<dyn BodySource>,
    config: IndexerConfig,
    account_id: i64,
    cancel: watch::Receiver<bool>,
}

impl Run {
    async fn run(mut self) -> Result<IndexStatus> {
        let account_id = self.account_id;
        let result = self.index().await;
        match &result {
            Ok(status) => info!(account_id, status = status.as_str(), "content indexer stopped"),
            Err(e) => {
                error!(account_id, error = %e, "content indexer failed on store error");
                if let Err(e2) = self.db.end_indexing(account_id, IndexStatus::Failed, Some(&e.to_string())).await {
                    warn!(account_id, error = %e2, "could not record indexer failure");
                }
            }
        }
        result
    }

    async fn index(&mut self) -> Result<IndexStatus> {
        let account_id = self.account_id;
        loop {
            let cancelled = *self.cancel.borrow();
            if cancelled {
                return self.db.end_indexing(account_id, IndexStatus::Paused, None).await;
            }

            let state = self.db.require_index_state(account_id).await?;
            if state.status != IndexStatus::Running {
                return Ok(state.status);
            }

            let batch = self
                .db
                .next_index_batch(account_id, state.last_indexed_uid, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                return self.db.end_indexing(account_id, IndexStatus::Completed, None).await;
            }

            let bodies = match self.fetch(&batch).await? {
                Fetched::Bodies(bodies) => bodies,
                Fetched::Cancelled => return self.db.end_indexing(account_id, IndexStatus::Paused, None).await,
                Fetched::GaveUp => return Ok(IndexStatus::Failed),
            };

            match self.db.commit_index_batch(account_id, &batch, bodies).await {
                Ok(progress) => debug!(
                    account_id,
                    cursor = progress.last_indexed_uid,
                    indexed = progress.indexed_emails,
                    total = progress.total_emails,
                    "indexed batch"
                ),
                Err(StoreError::IndexerNotRunning(_)) => {
                    debug!(account_id, "state left running, dropping in-flight batch");
                    return Ok(self.db.require_index_state(account_id).await?.status);
                }
                Err(e) => return Err(e),
            }

            if sleep_or_cancel(pacing(batch.len(), state.speed), &mut self.cancel).await {
                return self.db.end_indexing(account_id, IndexStatus::Paused, None).await;
            }
        }
    }

    /// Fetches one batch, retrying up to `max_retries` times. The cursor is
    /// untouched until a fetch succeeds and commits.
    async fn fetch(&mut self, batch: &[PendingBody]) -> Result<Fetched> {
        let account_id = self.account_id;
        let mut attempt = 0u32;
        loop {
            match self.source.fetch_bodies(account_id, batch).await {
                Ok(bodies) => return Ok(Fetched::Bodies(bodies)),
                Err(e) => {
                    attempt += 1;
                    let message = e.to_string();
                    warn!(account_id, attempt, error = %message, "body fetch failed");
                    self.db.record_fetch_error(account_id, &message).await?;

                    if attempt > self.config.max_retries {
                        self.db
                            .end_indexing(account_id, IndexStatus::Failed, Some(&message))
                            .await?;
                        return Ok(Fetched::GaveUp);
                    }
                    let backoff = self.config.retry_backoff() * attempt;
                    if sleep_or_cancel(backoff, &mut self.cancel).await {
                        return Ok(Fetched::Cancelled);
                    }
                }
            }
        }
    }
}

/// Owns the per-account indexer workers.
pub struct ContentIndexer {
    db: Arc<Database>,
    source: Arc<dyn BodySource>,
    config: IndexerConfig,
    workers: Mutex<HashMap<i64, Worker>>,
}

impl ContentIndexer {
    pub fn new(db: Arc<Database>, source: Arc<dyn BodySource>, config: IndexerConfig) -> Self {
        Self {
            db,
            source,
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn status(&self, account_id: i64) -> Result<ContentIndexState> {
        self.db.ensure_index_state(account_id, self.config.default_speed).await
    }

    /// Starts (or restarts) indexing from the persisted cursor. Starting an
    /// account whose worker is already running is a no-op.
    pub async fn start(&self, account_id: i64) -> Result<ContentIndexState> {
        let mut workers = self.workers.lock().await;
        let state = self.status(account_id).await?;

        if let Some(previous) = workers.remove(&account_id) {
            if !previous.task.is_finished() && state.status == IndexStatus::Running {
                workers.insert(account_id, previous);
                return Ok(state);
            }
            let _ = previous.cancel.send(true);
            if let Err(e) = previous.join().await {
                warn!(account_id, error = %e, "previous indexer worker ended with error");
            }
        }

        if state.status == IndexStatus::Running {
            info!(account_id, cursor = state.last_indexed_uid, "resuming interrupted indexer");
        }
        let state = self.db.begin_indexing(account_id).await?;

        let (cancel, cancel_rx) = watch::channel(false);
        let run = Run {
            db: self.db.clone(),
            source: self.source.clone(),
            config: self.config.clone(),
            account_id,
            cancel: cancel_rx,
        };
        let task = tokio::spawn(run.run());
        workers.insert(account_id, Worker { cancel, task });

        info!(account_id, cursor = state.last_indexed_uid, total = state.total_emails, "content indexer started");
        Ok(state)
    }

    /// `paused -> running` or `failed -> running`, keeping the cursor.
    pub async fn resume(&self, account_id: i64) -> Result<ContentIndexState> {
        let state = self.status(account_id).await?;
        match state.status {
            IndexStatus::Paused | IndexStatus::Failed => self.start(account_id).await,
            other => Err(StoreError::validation(format!(
                "indexer for account {} is {}, not paused or failed",
                account_id,
                other.as_str()
            ))),
        }
    }

    /// Marks the state paused at once; the worker notices at its next batch
    /// boundary and drops whatever batch it had in flight.
    pub async fn pause(&self, account_id: i64) -> Result<ContentIndexState> {
        let workers = self.workers.lock().await;
        let state = self.status(account_id).await?;
        if state.status != IndexStatus::Running {
            return Err(StoreError::IndexerNotRunning(account_id));
        }
        self.db.end_indexing(account_id, IndexStatus::Paused, None).await?;
        if let Some(worker) = workers.get(&account_id) {
            let _ = worker.cancel.send(true);
        }
        self.status(account_id).await
    }

    /// Cooperative stop: signals the worker and waits for it to leave
    /// `running`. The state ends up `paused`.
    pub async fn cancel(&self, account_id: i64) -> Result<ContentIndexState> {
        let worker = self.workers.lock().await.remove(&account_id);
        match worker {
            Some(worker) => {
                let _ = worker.cancel.send(true);
                worker.join().await?;
            }
            None => {
                self.db.end_indexing(account_id, IndexStatus::Paused, None).await?;
            }
        }
        self.status(account_id).await
    }

    /// Messages per minute. Takes effect from the next batch.
    pub async fn set_speed(&self, account_id: i64, speed: i64) -> Result<ContentIndexState> {
        if speed <= 0 {
            return Err(StoreError::validation("indexer speed must be positive"));
        }
        self.status(account_id).await?;
        sqlx::query("UPDATE content_index_state SET speed = ?, updated_at = ? WHERE account_id = ?")
            .bind(speed)
            .bind(now())
            .bind(account_id)
            .execute(self.db.pool())
            .await?;
        self.status(account_id).await
    }

    /// Waits for the account's worker to stop on its own. `None` when no
    /// worker was started.
    pub async fn wait(&self, account_id: i64) -> Result<Option<IndexStatus>> {
        let worker = self.workers.lock().await.remove(&account_id);
        match worker {
            Some(worker) => worker.join().await.map(Some),
            None => Ok(None),
        }
    }

    /// Restarts every account whose state was left `running` by a previous
    /// process.
    pub async fn resume_interrupted(&self) -> Result<Vec<i64>> {
        let accounts: Vec<i64> =
            sqlx::query_scalar("SELECT account_id FROM content_index_state WHERE status = 'running' ORDER BY account_id")
                .fetch_all(self.db.pool())
                .await?;
        for &account_id in &accounts {
            self.start(account_id).await?;
        }
        Ok(accounts)
    }
}
