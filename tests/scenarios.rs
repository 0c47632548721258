use async_trait::async_trait;
use mailstore::config::IndexerConfig;
use mailstore::models::{ArchiveReason, DraftStatus, IndexStatus, NewDraft};
use mailstore::{
    BodySource, ContentIndexer, Database, DraftScheduler, FetchError, FetchedBody, PendingBody, RuleDefinition,
    SendReceipt, StoreError, StoreEvent, SyncRecord, Transport, TransportError,
};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

async fn store() -> anyhow::Result<(Arc<Database>, i64)> {
    let db = Database::open_in_memory().await?;
    let account = db.get_or_create_account("me@example.com", Some("Me")).await?.id;
    Ok((Arc::new(db), account))
}

#[tokio::test]
async fn feed_rule_moves_message_and_logs_once() -> anyhow::Result<()> {
    let (db, account) = store().await?;
    let rule = RuleDefinition::new("Newsletters")
        .when("header", "exists", "List-Unsubscribe")
        .then("move", "Feed")
        .stop();
    db.create_rule(account, &rule).await?;
    db.create_rule(account, &RuleDefinition::new("Star invoices").when("subject", "contains", "invoice").then("star", "").order(10))
        .await?;

    let mut record = SyncRecord::new(account, "INBOX", 1932, "Invoice #1932");
    record.raw_headers = Some("From: billing@shop.example\r\nList-Unsubscribe: <mailto:leave@shop.example>\r\n".to_string());
    let ingested = db.ingest(record).await?;

    let message = db.get_message(ingested.id).await?;
    assert_eq!(db.get_folder(message.folder_id).await?.name, "Feed");
    assert!(!message.is_starred);
    assert_eq!(db.execution_log(account, None, Some(ingested.id), 10).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn feed_rule_move_survives_resync() -> anyhow::Result<()> {
    let (db, account) = store().await?;
    db.create_rule(
        account,
        &RuleDefinition::new("Newsletters").when("header", "exists", "List-Unsubscribe").then("move", "Feed"),
    )
    .await?;
    let feed = db.get_or_create_folder(account, "Feed").await?.id;

    for (uid, message_id) in [(7, Some("<weekly-7@news.example>")), (8, None)] {
        let mut record = SyncRecord::new(account, "INBOX", uid, "This week");
        record.message_id = message_id.map(str::to_string);
        record.raw_headers = Some("List-Unsubscribe: <mailto:leave@news.example>\r\n".to_string());

        let first = db.ingest(record.clone()).await?;
        assert!(first.is_new);
        let again = db.ingest(record).await?;
        assert!(!again.is_new);
        assert_eq!(again.id, first.id);
        assert!(again.rule_matches.is_empty());

        assert_eq!(db.get_message(first.id).await?.folder_id, feed);
        assert_eq!(db.execution_log(account, None, Some(first.id), 10).await?.len(), 1);
    }

    let live: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails").fetch_one(db.pool()).await?;
    assert_eq!(live, 2);
    Ok(())
}

#[tokio::test]
async fn trigram_search_drops_archived_messages() -> anyhow::Result<()> {
    let (db, account) = store().await?;
    let invoice = db.ingest(SyncRecord::new(account, "INBOX", 1, "Invoice due")).await?.id;
    let invitation = db.ingest(SyncRecord::new(account, "INBOX", 2, "Invitation")).await?.id;
    db.ingest(SyncRecord::new(account, "INBOX", 3, "Weekly report")).await?;

    let mut hits = db.search(account, "inv", 10).await?;
    hits.sort();
    assert_eq!(hits, vec![invoice, invitation]);

    db.archive(invitation, ArchiveReason::ManualArchive).await?;
    assert_eq!(db.search(account, "inv", 10).await?, vec![invoice]);
    Ok(())
}

#[derive(Default)]
struct HangsOnSecondBatch {
    calls: AtomicUsize,
    hanging: Notify,
}

#[async_trait]
impl BodySource for HangsOnSecondBatch {
    async fn fetch_bodies(&self, _account_id: i64, batch: &[PendingBody]) -> Result<Vec<FetchedBody>, FetchError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            self.hanging.notify_one();
            std::future::pending::<()>().await;
        }
        Ok(batch
            .iter()
            .map(|p| FetchedBody {
                email_id: p.id,
                body_text: Some(format!("body {}", p.uid)),
                body_html: None,
            })
            .collect())
    }
}

#[derive(Default)]
struct Recording {
    requested: StdMutex<Vec<i64>>,
}

#[async_trait]
impl BodySource for Recording {
    async fn fetch_bodies(&self, _account_id: i64, batch: &[PendingBody]) -> Result<Vec<FetchedBody>, FetchError> {
        let mut requested = self.requested.lock().unwrap();
        requested.extend(batch.iter().map(|p| p.uid));
        Ok(batch
            .iter()
            .map(|p| FetchedBody {
                email_id: p.id,
                body_text: Some(format!("body {}", p.uid)),
                body_html: None,
            })
            .collect())
    }
}

fn twenty_per_batch() -> IndexerConfig {
    IndexerConfig {
        batch_size: 20,
        default_speed: 1_000_000,
        max_retries: 1,
        retry_backoff_ms: 1,
    }
}

#[tokio::test]
async fn indexer_restart_resumes_after_last_committed_batch() -> anyhow::Result<()> {
    let (db, account) = store().await?;
    for uid in 501..=540 {
        db.ingest(SyncRecord::new(account, "INBOX", uid, &format!("envelope {}", uid)))
            .await?;
    }

    let crashing_source = Arc::new(HangsOnSecondBatch::default());
    let crashing = ContentIndexer::new(db.clone(), crashing_source.clone(), twenty_per_batch());
    crashing.status(account).await?;
    sqlx::query("UPDATE content_index_state SET last_indexed_uid = 500 WHERE account_id = ?")
        .bind(account)
        .execute(db.pool())
        .await?;
    crashing.start(account).await?;
    crashing_source.hanging.notified().await;
    // the process dies with [521-540] in flight
    drop(crashing);

    let state = db.content_index_state(account).await?.expect("state row");
    assert_eq!(state.status, IndexStatus::Running);
    assert_eq!(state.last_indexed_uid, 520);

    let source = Arc::new(Recording::default());
    let restarted = ContentIndexer::new(db.clone(), source.clone(), twenty_per_batch());
    restarted.resume_interrupted().await?;
    assert_eq!(restarted.wait(account).await?, Some(IndexStatus::Completed));

    let requested = source.requested.lock().unwrap().clone();
    assert_eq!(requested.first(), Some(&521));
    assert_eq!(requested, (521..=540).collect::<Vec<_>>());

    let state = restarted.status(account).await?;
    assert_eq!(state.indexed_emails, 40);
    assert_eq!(state.last_indexed_uid, 540);
    Ok(())
}

struct AcceptAll;

#[async_trait]
impl Transport for AcceptAll {
    async fn send(&self, draft: &mailstore::models::Draft) -> Result<SendReceipt, TransportError> {
        Ok(SendReceipt {
            message_id: Some(format!("<{}@test>", draft.id)),
            send_method: "test".to_string(),
        })
    }
}

#[tokio::test]
async fn overdue_draft_is_sent_on_next_tick() -> anyhow::Result<()> {
    let (db, account) = store().await?;
    let mut events = db.subscribe();

    let mut draft = NewDraft::new(account, "bob@example.com", "Lunch?", "Noon works");
    draft.scheduled_send_at = Some(1);
    let created = db.create_draft(&draft).await?;
    assert_eq!(created.status, DraftStatus::Scheduled);

    let scheduler = DraftScheduler::new(db.clone(), Arc::new(AcceptAll), Duration::from_millis(10)).spawn();
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(event) = events.recv().await {
            if let StoreEvent::DraftStatusChanged { draft_id, status, .. } = event {
                if draft_id == created.id {
                    seen.push(status);
                    if status == DraftStatus::Sent {
                        break;
                    }
                }
            }
        }
    })
    .await?;
    scheduler.shutdown().await;

    assert_eq!(seen, vec![DraftStatus::Sending, DraftStatus::Sent]);
    assert_eq!(db.sent_emails(account, 10).await?.len(), 1);
    assert!(matches!(db.get_draft(created.id).await, Err(StoreError::NotFound { .. })));
    let history = db.draft_history(account, 10).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].original_id, created.id);
    assert_eq!(history[0].final_status, DraftStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn rows_leave_the_live_table_only_into_the_archive() -> anyhow::Result<()> {
    let (db, account) = store().await?;
    for uid in 1..=6 {
        db.ingest(SyncRecord::new(account, "INBOX", uid, &format!("note {}", uid))).await?;
    }
    let first = db.get_message_by_uid(account, db.get_or_create_folder(account, "INBOX").await?.id, 1).await?;
    let first = first.expect("uid 1").id;

    db.soft_delete(first).await?;
    sqlx::query("UPDATE emails SET updated_at = 0 WHERE id = ?")
        .bind(first)
        .execute(db.pool())
        .await?;
    assert_eq!(db.handle_expunge(account, "INBOX", &[2, 3]).await?, 2);
    assert_eq!(db.reconcile_folder(account, "INBOX", &[1, 2, 3, 4, 5]).await?, 1);
    assert_eq!(db.purge_retention(account, 30).await?, 1);

    let live: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails").fetch_one(db.pool()).await?;
    let archived = db.list_archived(account, 100, 0).await?;
    assert_eq!(live as usize + archived.len(), 6);
    assert_eq!(live, 2);
    let reasons: Vec<ArchiveReason> = archived.iter().map(|a| a.archive_reason).collect();
    assert_eq!(reasons.iter().filter(|r| **r == ArchiveReason::ServerPurged).count(), 3);
    Ok(())
}

#[tokio::test]
async fn search_follows_the_current_subject() -> anyhow::Result<()> {
    let (db, account) = store().await?;
    let id = db.ingest(SyncRecord::new(account, "INBOX", 1, "Quarterly budget")).await?.id;
    assert_eq!(db.search(account, "budget", 5).await?, vec![id]);

    db.ingest(SyncRecord::new(account, "INBOX", 1, "Holiday schedule")).await?;
    assert!(db.search(account, "budget", 5).await?.is_empty());
    assert_eq!(db.search(account, "holi", 5).await?, vec![id]);

    db.soft_delete(id).await?;
    assert!(db.search(account, "holi", 5).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn rule_outcome_is_the_same_for_identical_messages() -> anyhow::Result<()> {
    let (db, account) = store().await?;
    db.create_rule(
        account,
        &RuleDefinition::new("vip").when("from_email", "ends_with", "@boss.example").then("star", "").then("mark_read", "").stop(),
    )
    .await?;
    db.create_rule(account, &RuleDefinition::new("later").when("subject", "contains", "plan").then("archive", "").order(5))
        .await?;

    let mut outcomes = Vec::new();
    for uid in [10, 11] {
        let mut r = SyncRecord::new(account, "INBOX", uid, "Plan for Q3");
        r.from_email = Some("ceo@boss.example".to_string());
        outcomes.push(db.ingest(r).await?.rule_matches);
    }
    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].len(), 1);
    assert!(outcomes[0][0].stopped_processing);
    assert_eq!(outcomes[0][0].actions_taken.len(), 2);
    Ok(())
}

#[tokio::test]
async fn cancelled_and_sent_drafts_close_into_history() -> anyhow::Result<()> {
    let (db, account) = store().await?;
    let keep = db.create_draft(&NewDraft::new(account, "a@example.com", "one", "x")).await?;
    let drop_me = db.create_draft(&NewDraft::new(account, "b@example.com", "two", "y")).await?;

    db.cancel_draft(drop_me.id).await?;
    db.send_now(keep.id, &AcceptAll).await?;

    assert!(db.list_drafts(account, None).await?.is_empty());
    let mut finals: Vec<(i64, DraftStatus)> = db
        .draft_history(account, 10)
        .await?
        .into_iter()
        .map(|h| (h.original_id, h.final_status))
        .collect();
    finals.sort_by_key(|(id, _)| *id);
    assert_eq!(finals, vec![(keep.id, DraftStatus::Sent), (drop_me.id, DraftStatus::Cancelled)]);
    Ok(())
}
