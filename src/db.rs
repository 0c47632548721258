use crate::error::{Result, StoreError};
use crate::events::StoreEvent;
use crate::models;
use inflections::case::to_title_case;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, sqlite::SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, broadcast};
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 256;

pub struct Database {
    pool: SqlitePool,
    /// Serializes writes to one account's rows (ingestion, indexer commits,
    /// user mutations).
    account_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<StoreEvent>,
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePool::connect_with(options).await?;
        info!(url = database_url, "opened mail store");
        Ok(Self::from_pool(pool))
    }

    /// A private in-memory database. A single connection is kept alive for
    /// the lifetime of the pool, since every new connection would otherwise
    /// see an empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self::from_pool(pool);
        db.run_migrations().await?;
        Ok(db)
    }

    fn from_pool(pool: SqlitePool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pool,
            account_locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        debug!("schema applied");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: StoreEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    pub(crate) async fn lock_account(&self, account_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .account_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(account_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn get_or_create_account(&self, email: &str, name: Option<&str>) -> Result<models::Account> {
        sqlx::query(
            "INSERT INTO accounts (email, name, is_active, created_at) VALUES (?, ?, 1, ?)
             ON CONFLICT(email) DO NOTHING",
        )
        .bind(email)
        .bind(name)
        .bind(now())
        .execute(&self.pool)
        .await?;

        self.get_account_by_email(email)
            .await?
            .ok_or_else(|| StoreError::not_found("account", email))
    }

    pub async fn get_account(&self, id: i64) -> Result<models::Account> {
        sqlx::query_as::<_, models::Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("account", id))
    }

    pub async fn get_account_by_email(&self, email: &str) -> Result<Option<models::Account>> {
        let account = sqlx::query_as::<_, models::Account>("SELECT * FROM accounts WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    pub async fn list_accounts(&self) -> Result<Vec<models::Account>> {
        let accounts = sqlx::query_as::<_, models::Account>(
            "SELECT * FROM accounts WHERE is_active = 1 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }

    /// Accounts are never deleted; they own every other row by foreign key.
    pub async fn deactivate_account(&self, id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET is_active = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("account", id));
        }
        Ok(())
    }

    pub async fn get_or_create_folder(&self, account_id: i64, name: &str) -> Result<models::Folder> {
        let mut conn = self.pool.acquire().await?;
        let id = folder_id(&mut conn, account_id, name).await?;
        drop(conn);
        self.get_folder(id).await
    }

    pub async fn get_folder(&self, id: i64) -> Result<models::Folder> {
        let mut folder = sqlx::query_as::<_, models::Folder>("SELECT * FROM folders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("folder", id))?;
        folder.display_name = to_title_case(&folder.name);
        Ok(folder)
    }

    pub async fn list_folders(&self, account_id: i64) -> Result<Vec<models::Folder>> {
        let rows = sqlx::query_as::<_, models::Folder>(
            "SELECT * FROM folders WHERE account_id = ? ORDER BY name ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        let mut folders: Vec<models::Folder> = rows
            .into_iter()
            .map(|mut f| {
                f.display_name = to_title_case(&f.name);
                f
            })
            .collect();

        // INBOX first, the rest by name
        folders.sort_by(|a, b| {
            if a.name.eq_ignore_ascii_case("INBOX") {
                std::cmp::Ordering::Less
            } else if b.name.eq_ignore_ascii_case("INBOX") {
                std::cmp::Ordering::Greater
            } else {
                a.name.cmp(&b.name)
            }
        });

        Ok(folders)
    }

    /// Recomputes the total/unread counters of a folder from live rows and
    /// stamps `last_sync`.
    pub async fn refresh_folder_counts(&self, folder_id: i64) -> Result<(i64, i64)> {
        let row = sqlx::query(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END), 0)
             FROM emails
             WHERE folder_id = ? AND is_deleted = 0 AND is_archived = 0",
        )
        .bind(folder_id)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.get(0);
        let unread: i64 = row.get(1);

        sqlx::query(
            "UPDATE folders SET total_messages = ?, unread_messages = ?, last_sync = ? WHERE id = ?",
        )
        .bind(total)
        .bind(unread)
        .bind(now())
        .bind(folder_id)
        .execute(&self.pool)
        .await?;

        Ok((total, unread))
    }
}

/// Resolves a folder by name inside the caller's connection or
/// transaction, creating it if needed.
pub(crate) async fn folder_id(conn: &mut SqliteConnection, account_id: i64, name: &str) -> Result<i64> {
    sqlx::query("INSERT OR IGNORE INTO folders (account_id, name) VALUES (?, ?)")
        .bind(account_id)
        .bind(name)
        .execute(&mut *conn)
        .await?;

    let id: i64 = sqlx::query_scalar("SELECT id FROM folders WHERE account_id = ? AND name = ?")
        .bind(account_id)
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}
