use mailstore::models::Lifecycle;
use mailstore::{Config, Database};
use std::env;

fn rule() {
    println!("--------------------------------------------------------------------------------");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <message_id>", args[0]);
        eprintln!("Prints a stored message, where it lives now and the rules that fired on it.");
        std::process::exit(1);
    }
    let id: i64 = args[1]
        .parse()
        .map_err(|e| anyhow::anyhow!("'{}' is not a message id: {}", args[1], e))?;

    let config = Config::load();
    let db = Database::new(&config.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let account_id = match db.message_state(id).await? {
        Lifecycle::Live { deleted } => {
            let m = db.get_message(id).await?;
            println!("Message {} (live{})", m.id, if deleted { ", deleted" } else { "" });
            println!(
                "Folder: {}  Server: {} UID {}",
                db.get_folder(m.folder_id).await?.name,
                db.get_folder(m.remote_folder_id).await?.name,
                m.uid
            );
            println!("From: {:?} <{:?}>", m.from_name, m.from_email);
            println!("Subject: {:?}", m.subject);
            println!("Date: {}", m.date);
            println!(
                "Flags: read={} starred={} archived={} replied={} body_indexed={}",
                m.is_read, m.is_starred, m.is_archived, m.is_replied, m.body_indexed
            );
            rule();
            println!("BODY TEXT:");
            println!("{}", m.body_text.as_deref().unwrap_or("(None)"));
            rule();
            println!("BODY HTML (Raw Debug):");
            println!("{:?}", m.body_html);
            m.account_id
        }
        Lifecycle::Archived { reason, archived_at } => {
            let Some(a) = db.get_archived(id).await? else {
                anyhow::bail!("message {} vanished while reading", id);
            };
            println!("Message {} (archived: {} at {})", id, reason.as_str(), archived_at);
            println!("From: {:?} <{:?}>", a.from_name, a.from_email);
            println!("Subject: {:?}", a.subject);
            rule();
            println!("{}", a.body_text.as_deref().unwrap_or("(None)"));
            a.account_id
        }
    };

    rule();
    let log = db.execution_log(account_id, None, Some(id), 50).await?;
    if log.is_empty() {
        println!("No rules fired on this message.");
    }
    for entry in log {
        let rule_name = db.get_rule(entry.rule_id).await.map(|r| r.name).unwrap_or_else(|_| "(deleted rule)".into());
        let actions: Vec<String> = entry
            .actions()?
            .into_iter()
            .map(|a| format!("{}:{}", a.action_type, a.action_value))
            .collect();
        println!(
            "{} rule {:?} -> [{}]{}",
            entry.executed_at,
            rule_name,
            actions.join(", "),
            if entry.stopped_processing { " (stop)" } else { "" }
        );
    }

    Ok(())
}
