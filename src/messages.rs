use crate::db::{self, Database, now};
use crate::error::{Result, StoreError};
use crate::models::{Message, MessageFilter};
use crate::search::like_pattern;
use sqlx::sqlite::SqliteConnection;
use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;

/// Boolean columns that user actions and rule actions may flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flag {
    Read,
    Starred,
    Archived,
    Deleted,
    Replied,
}

impl Flag {
    fn column(&self) -> &'static str {
        match self {
            Flag::Read => "is_read",
            Flag::Starred => "is_starred",
            Flag::Archived => "is_archived",
            Flag::Deleted => "is_deleted",
            Flag::Replied => "is_replied",
        }
    }
}

pub(crate) async fn fetch_message(conn: &mut SqliteConnection, id: i64) -> Result<Option<Message>> {
    let message = sqlx::query_as::<_, Message>("SELECT * FROM emails WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(message)
}

pub(crate) async fn set_flag(conn: &mut SqliteConnection, id: i64, flag: Flag, value: bool) -> Result<()> {
    let sql = format!(
        "UPDATE emails SET {} = ?, updated_at = ? WHERE id = ?",
        flag.column()
    );
    let result = sqlx::query(&sql)
        .bind(value)
        .bind(now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::not_found("message", id));
    }
    Ok(())
}

/// Files a message into another local folder of the same account. The row
/// id and its server location never change.
pub(crate) async fn move_message(conn: &mut SqliteConnection, id: i64, folder_name: &str) -> Result<i64> {
    let account_id: i64 = sqlx::query_scalar("SELECT account_id FROM emails WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("message", id))?;

    let folder_id = db::folder_id(conn, account_id, folder_name).await?;
    sqlx::query("UPDATE emails SET folder_id = ?, updated_at = ? WHERE id = ?")
        .bind(folder_id)
        .bind(now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(folder_id)
}

impl Database {
    pub async fn get_message(&self, id: i64) -> Result<Message> {
        let mut conn = self.pool().acquire().await?;
        fetch_message(&mut conn, id)
            .await?
            .ok_or_else(|| StoreError::not_found("message", id))
    }

    /// Looks a message up by its server location, wherever it is filed
    /// locally.
    pub async fn get_message_by_uid(&self, account_id: i64, remote_folder_id: i64, uid: i64) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(
            "SELECT * FROM emails WHERE account_id = ? AND remote_folder_id = ? AND uid = ?",
        )
        .bind(account_id)
        .bind(remote_folder_id)
        .bind(uid)
        .fetch_optional(self.pool())
        .await?;
        Ok(message)
    }

    pub async fn list_messages(&self, filter: &MessageFilter, limit: i64, offset: i64) -> Result<Vec<Message>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM emails WHERE 1 = 1");

        if let Some(account_id) = filter.account_id {
            qb.push(" AND account_id = ").push_bind(account_id);
        }
        if let Some(folder_id) = filter.folder_id {
            qb.push(" AND folder_id = ").push_bind(folder_id);
        }
        if !filter.include_archived {
            qb.push(" AND is_archived = 0");
        }
        if !filter.include_deleted {
            qb.push(" AND is_deleted = 0");
        }
        if filter.unread_only {
            qb.push(" AND is_read = 0");
        }
        if filter.starred_only {
            qb.push(" AND is_starred = 1");
        }
        if filter.with_attachments {
            qb.push(" AND has_attachments = 1");
        }
        if let Some(from) = filter.from_contains.as_deref().filter(|s| !s.is_empty()) {
            let pattern = like_pattern(from);
            qb.push(" AND (from_email LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR from_name LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        if let Some(after) = filter.date_after {
            qb.push(" AND date >= ").push_bind(after);
        }
        if let Some(before) = filter.date_before {
            qb.push(" AND date <= ").push_bind(before);
        }

        qb.push(" ORDER BY date DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let messages = qb.build_query_as::<Message>().fetch_all(self.pool()).await?;
        Ok(messages)
    }

    async fn update_flag(&self, id: i64, flag: Flag, value: bool) -> Result<()> {
        let account_id = self.account_of(id).await?;
        let _guard = self.lock_account(account_id).await;
        let mut conn = self.pool().acquire().await?;
        set_flag(&mut conn, id, flag, value).await?;
        debug!(message_id = id, flag = flag.column(), value, "flag updated");
        Ok(())
    }

    pub(crate) async fn account_of(&self, id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT account_id FROM emails WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("message", id))
    }

    pub async fn mark_read(&self, id: i64) -> Result<()> {
        self.update_flag(id, Flag::Read, true).await
    }

    pub async fn mark_unread(&self, id: i64) -> Result<()> {
        self.update_flag(id, Flag::Read, false).await
    }

    pub async fn star(&self, id: i64) -> Result<()> {
        self.update_flag(id, Flag::Starred, true).await
    }

    pub async fn unstar(&self, id: i64) -> Result<()> {
        self.update_flag(id, Flag::Starred, false).await
    }

    pub async fn mark_replied(&self, id: i64) -> Result<()> {
        self.update_flag(id, Flag::Replied, true).await
    }

    /// Local "archive out of the inbox". The row stays live; see
    /// [`Database::archive`] for permanent archival.
    pub async fn set_archived(&self, id: i64, archived: bool) -> Result<()> {
        self.update_flag(id, Flag::Archived, archived).await
    }

    /// Marks the row deleted. The row is kept until the server confirms the
    /// removal or the retention window passes.
    pub async fn soft_delete(&self, id: i64) -> Result<()> {
        self.update_flag(id, Flag::Deleted, true).await
    }

    pub async fn move_to_folder(&self, id: i64, folder_name: &str) -> Result<i64> {
        let account_id = self.account_of(id).await?;
        let _guard = self.lock_account(account_id).await;
        let mut tx = self.pool().begin().await?;
        let folder_id = move_message(&mut tx, id, folder_name).await?;
        tx.commit().await?;
        Ok(folder_id)
    }
}
