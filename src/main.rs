use anyhow::{Context, bail};
use async_trait::async_trait;
use mailstore::models::{Draft, DraftStatus};
use mailstore::rule_engine::RuleTestResult;
use mailstore::{Config, Database, DraftScheduler, RuleDefinition, SendReceipt, Transport, TransportError};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: mailstore [--config <path>] <command>

commands:
  status                      accounts, folders, indexer and outbox state
  search <account> <query>    full-text search within one account
  batches <account>           pending batch operations
  test-rule <account> <field> <operator> [value...]
                              dry-run one condition against recent mail
  purge                       archive deleted mail past the retention window
  rebuild-index               rebuild the full-text index from live rows
  recover-drafts              fail drafts left in sending by a crash
  run                         send scheduled drafts until interrupted";

/// Writes each outgoing draft as an RFC 822 file for an external sender to
/// pick up.
struct OutboxTransport {
    db: Arc<Database>,
    dir: PathBuf,
}

fn render(draft: &Draft, from: &str) -> String {
    let date = chrono::Utc::now().to_rfc2822();
    let mut out = format!("From: {}\r\nTo: {}\r\n", from, draft.to_addresses);
    if let Some(cc) = draft.cc_addresses.as_deref().filter(|s| !s.is_empty()) {
        out.push_str(&format!("Cc: {}\r\n", cc));
    }
    if let Some(bcc) = draft.bcc_addresses.as_deref().filter(|s| !s.is_empty()) {
        out.push_str(&format!("Bcc: {}\r\n", bcc));
    }
    out.push_str(&format!("Subject: {}\r\nDate: {}\r\n", draft.subject, date));
    if let Some(parent) = &draft.in_reply_to {
        out.push_str(&format!("In-Reply-To: {}\r\n", parent));
        out.push_str(&format!(
            "References: {}\r\n",
            draft.reference_ids.as_deref().unwrap_or(parent)
        ));
    }
    out.push_str("\r\n");
    out.push_str(draft.body_text.as_deref().or(draft.body_html.as_deref()).unwrap_or(""));
    out
}

#[async_trait]
impl Transport for OutboxTransport {
    async fn send(&self, draft: &Draft) -> Result<SendReceipt, TransportError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let account = self
            .db
            .get_account(draft.account_id)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let from = match &account.name {
            Some(name) => format!("{} <{}>", name, account.email),
            None => account.email.clone(),
        };

        let message_id = format!("<draft-{}.{}@mailstore.local>", draft.id, draft.updated_at);
        let mut content = format!("Message-ID: {}\r\n", message_id);
        content.push_str(&render(draft, &from));

        let path = self.dir.join(format!("{}.eml", draft.id));
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        info!(draft_id = draft.id, path = %path.display(), "draft written to outbox");

        Ok(SendReceipt {
            message_id: Some(message_id),
            send_method: "outbox".to_string(),
        })
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn account_id(db: &Database, email: &str) -> anyhow::Result<i64> {
    match db.get_account_by_email(email).await? {
        Some(account) => Ok(account.id),
        None => bail!("no account '{}'", email),
    }
}

async fn status(db: &Database) -> anyhow::Result<()> {
    for account in db.list_accounts().await? {
        println!(
            "{} (id {}){}",
            account.email,
            account.id,
            if account.is_active { "" } else { " [inactive]" }
        );
        for folder in db.list_folders(account.id).await? {
            println!(
                "  {:<24} {:>6} total {:>6} unread",
                folder.display_name, folder.total_messages, folder.unread_messages
            );
        }
        match db.content_index_state(account.id).await? {
            Some(state) => println!(
                "  indexer: {} {}/{} (cursor uid {}, {} errors)",
                state.status.as_str(),
                state.indexed_emails,
                state.total_emails,
                state.last_indexed_uid,
                state.error_count
            ),
            None => println!("  indexer: never started"),
        }
        let scheduled = db.list_drafts(account.id, Some(DraftStatus::Scheduled)).await?;
        let failed = db.list_drafts(account.id, Some(DraftStatus::Failed)).await?;
        println!("  drafts: {} scheduled, {} failed", scheduled.len(), failed.len());
    }
    Ok(())
}

async fn search(db: &Database, email: &str, query: &str) -> anyhow::Result<()> {
    let account = account_id(db, email).await?;
    let hits = db.search_messages(account, query, 25).await?;
    if hits.is_empty() {
        println!("No messages found matching '{}'", query);
    }
    for m in hits {
        println!(
            "{:>8}  {:<32}  {}",
            m.id,
            m.from_email.as_deref().unwrap_or("-"),
            m.subject.as_deref().unwrap_or("(no subject)")
        );
    }
    Ok(())
}

async fn batches(db: &Database, email: &str) -> anyhow::Result<()> {
    let account = account_id(db, email).await?;
    for op in db.list_pending_batches(account).await? {
        println!("{:>6}  {}", op.id, op.description);
    }
    Ok(())
}

/// Dry run over the `[rules] dry_run_limit` most recent messages.
async fn dry_run(
    db: &Database,
    config: &Config,
    email: &str,
    field: &str,
    operator: &str,
    value: &str,
) -> anyhow::Result<RuleTestResult> {
    let account = account_id(db, email).await?;
    let definition = RuleDefinition::new("dry run").when(field, operator, value);
    let result = db.test_rule(account, &definition, config.rules.dry_run_limit).await?;
    Ok(result)
}

async fn test_rule(db: &Database, config: &Config, email: &str, condition: &[String]) -> anyhow::Result<()> {
    let [field, operator, value @ ..] = condition else {
        bail!("test-rule needs a field and an operator\n\n{}", USAGE);
    };
    let result = dry_run(db, config, email, field, operator, &value.join(" ")).await?;
    println!("{} of the last {} messages match", result.matched.len(), result.examined);
    for m in result.matched {
        println!(
            "{:>8}  {:<32}  {}",
            m.id,
            m.from_email.as_deref().unwrap_or("-"),
            m.subject.as_deref().unwrap_or("(no subject)")
        );
    }
    Ok(())
}

async fn purge(db: &Database, config: &Config) -> anyhow::Result<()> {
    let days = config.retention.purge_deleted_after_days;
    for account in db.list_accounts().await? {
        let archived = db
            .purge_retention(account.id, days)
            .await
            .with_context(|| format!("retention purge failed for {}", account.email))?;
        println!("{}: archived {} messages deleted more than {} days ago", account.email, archived, days);
    }
    Ok(())
}

async fn run(db: Arc<Database>, config: &Config) -> anyhow::Result<()> {
    let transport = Arc::new(OutboxTransport {
        db: db.clone(),
        dir: PathBuf::from(&config.scheduler.outbox_dir),
    });
    let scheduler = DraftScheduler::new(db, transport, config.scheduler.tick()).spawn();
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    scheduler.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let config = match args.iter().position(|a| a == "--config") {
        Some(pos) => {
            if pos + 1 >= args.len() {
                bail!("--config needs a path\n\n{}", USAGE);
            }
            let path = args.remove(pos + 1);
            args.remove(pos);
            Config::from_path(&path).with_context(|| format!("loading {}", path))?
        }
        None => Config::load(),
    };
    init_logging(&config);

    let Some(command) = args.first().cloned() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let db = Database::new(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    db.run_migrations().await.context("running migrations")?;
    let db = Arc::new(db);

    match (command.as_str(), &args[1..]) {
        ("status", []) => status(&db).await,
        ("search", [email, query @ ..]) if !query.is_empty() => search(&db, email, &query.join(" ")).await,
        ("batches", [email]) => batches(&db, email).await,
        ("test-rule", [email, condition @ ..]) => test_rule(&db, &config, email, condition).await,
        ("purge", []) => purge(&db, &config).await,
        ("rebuild-index", []) => {
            let rows = db.rebuild_search_index().await?;
            println!("indexed {} messages", rows);
            Ok(())
        }
        ("recover-drafts", []) => {
            let failed = db.recover_interrupted().await?;
            println!("{} interrupted drafts marked failed", failed);
            Ok(())
        }
        ("run", []) => run(db.clone(), &config).await,
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailstore::models::GenerationSource;

    fn draft() -> Draft {
        Draft {
            id: 7,
            account_id: 1,
            to_addresses: "bob@example.com".to_string(),
            cc_addresses: Some(String::new()),
            bcc_addresses: None,
            subject: "Re: lunch".to_string(),
            body_html: None,
            body_text: Some("Sounds good".to_string()),
            classification: None,
            in_reply_to: Some("<abc@example.com>".to_string()),
            reference_ids: None,
            reply_to_email_id: None,
            status: DraftStatus::Sending,
            scheduled_send_at: Some(0),
            sent_at: None,
            generation_source: GenerationSource::Manual,
            ai_prompt: None,
            error_message: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn dry_run_examines_configured_number_of_messages() -> anyhow::Result<()> {
        let db = Database::open_in_memory().await?;
        let account = db.get_or_create_account("me@example.com", None).await?.id;
        for uid in 1..=5 {
            let mut record = mailstore::SyncRecord::new(account, "INBOX", uid, "status report");
            record.date = uid;
            db.ingest(record).await?;
        }

        let mut config = Config::default();
        config.rules.dry_run_limit = 3;
        let result = dry_run(&db, &config, "me@example.com", "subject", "contains", "report").await?;
        assert_eq!(result.examined, 3);
        assert_eq!(result.matched.iter().map(|m| m.uid).collect::<Vec<_>>(), vec![5, 4, 3]);

        assert!(dry_run(&db, &config, "nobody@example.com", "subject", "contains", "x").await.is_err());
        Ok(())
    }

    #[test]
    fn rendered_reply_threads_and_skips_empty_cc() {
        let text = render(&draft(), "me@example.com");
        assert!(text.starts_with("From: me@example.com\r\nTo: bob@example.com\r\n"));
        assert!(!text.contains("Cc:"));
        assert!(text.contains("In-Reply-To: <abc@example.com>\r\n"));
        assert!(text.contains("References: <abc@example.com>\r\n"));
        assert!(text.ends_with("\r\n\r\nSounds good"));
    }
}
