use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Folder {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub total_messages: i64,
    pub unread_messages: i64,
    pub last_sync: Option<i64>,
    #[sqlx(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub account_id: i64,
    /// Where the message is filed locally.
    pub folder_id: i64,
    /// Where the server keeps it; `uid` is relative to this folder.
    pub remote_folder_id: i64,
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
    pub is_archived: bool,
    pub is_deleted: bool,
    pub is_replied: bool,
    pub has_attachments: bool,
    pub body_indexed: bool,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub raw_headers: Option<String>,
    pub size: i64,
    pub in_reply_to: Option<String>,
    pub thread_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Filter for message listings. Archived (flag) and soft-deleted rows are
/// excluded unless explicitly requested.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub account_id: Option<i64>,
    pub folder_id: Option<i64>,
    pub unread_only: bool,
    pub starred_only: bool,
    pub with_attachments: bool,
    pub from_contains: Option<String>,
    pub date_after: Option<i64>,
    pub date_before: Option<i64>,
    pub include_archived: bool,
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArchiveReason {
    /// Expunged on the server, or no longer listed by it.
    ServerPurged,
    /// Soft-deleted and untouched past the retention window.
    RetentionExpired,
    /// Explicit archival command.
    ManualArchive,
}

impl ArchiveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveReason::ServerPurged => "server_purged",
            ArchiveReason::RetentionExpired => "retention_expired",
            ArchiveReason::ManualArchive => "manual_archive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArchivedMessage {
    pub id: i64,
    pub original_id: i64,
    pub account_id: i64,
    pub folder_id: i64,
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
    pub has_attachments: bool,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub raw_headers: Option<String>,
    pub size: i64,
    pub original_created_at: i64,
    pub original_updated_at: i64,
    pub archived_at: i64,
    pub archive_reason: ArchiveReason,
}

/// Where a message row currently lives. A message only ever moves from
/// `Live` to `Archived`, and only by being copied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Live { deleted: bool },
    Archived { reason: ArchiveReason, archived_at: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Draft => "draft",
            DraftStatus::Scheduled => "scheduled",
            DraftStatus::Sending => "sending",
            DraftStatus::Sent => "sent",
            DraftStatus::Failed => "failed",
            DraftStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, next: DraftStatus) -> bool {
        use DraftStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Cancelled)
                | (Scheduled, Draft)
                | (Scheduled, Sending)
                | (Sending, Sent)
                | (Sending, Failed)
                | (Failed, Draft)
        )
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GenerationSource {
    Manual,
    Ai,
    Rule,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Draft {
    pub id: i64,
    pub account_id: i64,
    pub to_addresses: String,
    pub cc_addresses: Option<String>,
    pub bcc_addresses: Option<String>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub classification: Option<String>,
    pub in_reply_to: Option<String>,
    pub reference_ids: Option<String>,
    pub reply_to_email_id: Option<i64>,
    pub status: DraftStatus,
    pub scheduled_send_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub generation_source: GenerationSource,
    pub ai_prompt: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Content of a new or edited draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDraft {
    pub account_id: i64,
    pub to_addresses: String,
    pub cc_addresses: Option<String>,
    pub bcc_addresses: Option<String>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub classification: Option<String>,
    pub in_reply_to: Option<String>,
    pub reference_ids: Option<String>,
    pub reply_to_email_id: Option<i64>,
    pub scheduled_send_at: Option<i64>,
    pub generation_source: GenerationSource,
    pub ai_prompt: Option<String>,
}

impl NewDraft {
    pub fn new(account_id: i64, to: &str, subject: &str, body_text: &str) -> Self {
        Self {
            account_id,
            to_addresses: to.to_string(),
            cc_addresses: None,
            bcc_addresses: None,
            subject: subject.to_string(),
            body_html: None,
            body_text: Some(body_text.to_string()),
            classification: None,
            in_reply_to: None,
            reference_ids: None,
            reply_to_email_id: None,
            scheduled_send_at: None,
            generation_source: GenerationSource::Manual,
            ai_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DraftHistory {
    pub id: i64,
    pub original_id: i64,
    pub account_id: i64,
    pub to_addresses: String,
    pub cc_addresses: Option<String>,
    pub bcc_addresses: Option<String>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub classification: Option<String>,
    pub in_reply_to: Option<String>,
    pub reference_ids: Option<String>,
    pub reply_to_email_id: Option<i64>,
    pub final_status: DraftStatus,
    pub scheduled_send_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub generation_source: GenerationSource,
    pub ai_prompt: Option<String>,
    pub error_message: Option<String>,
    pub original_created_at: i64,
    pub original_updated_at: i64,
    pub archived_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SentEmail {
    pub id: i64,
    pub account_id: i64,
    pub message_id: Option<String>,
    pub to_addresses: String,
    pub cc_addresses: Option<String>,
    pub bcc_addresses: Option<String>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub in_reply_to: Option<String>,
    pub reference_ids: Option<String>,
    pub reply_to_email_id: Option<i64>,
    pub sent_at: i64,
    pub send_method: String,
    pub draft_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Pending => "pending",
            IndexStatus::Running => "running",
            IndexStatus::Paused => "paused",
            IndexStatus::Completed => "completed",
            IndexStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContentIndexState {
    pub id: i64,
    pub account_id: i64,
    pub status: IndexStatus,
    pub total_emails: i64,
    pub indexed_emails: i64,
    pub last_indexed_uid: i64,
    /// Messages per minute.
    pub speed: i64,
    pub last_error: Option<String>,
    pub error_count: i64,
    pub started_at: Option<i64>,
    pub paused_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchOperation {
    Archive,
    Delete,
    MarkRead,
    MarkUnread,
}

impl BatchOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOperation::Archive => "archive",
            BatchOperation::Delete => "delete",
            BatchOperation::MarkRead => "mark_read",
            BatchOperation::MarkUnread => "mark_unread",
        }
    }
}

impl FromStr for BatchOperation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "archive" => Ok(BatchOperation::Archive),
            "delete" => Ok(BatchOperation::Delete),
            "mark_read" => Ok(BatchOperation::MarkRead),
            "mark_unread" => Ok(BatchOperation::MarkUnread),
            other => Err(StoreError::validation(format!(
                "unknown batch operation '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Confirmed,
    Cancelled,
    /// Claimed by one `execute_batch` call.
    Executing,
    Executed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingBatchOp {
    pub id: i64,
    pub account_id: i64,
    pub operation: BatchOperation,
    pub description: String,
    pub filter_query: String,
    /// JSON array of message row ids, snapshotted at preparation time.
    pub email_ids: String,
    pub email_count: i64,
    pub preview_data: Option<String>,
    pub status: BatchStatus,
    pub created_at: i64,
    pub executed_at: Option<i64>,
}

impl PendingBatchOp {
    pub fn ids(&self) -> Result<Vec<i64>, StoreError> {
        Ok(serde_json::from_str(&self.email_ids)?)
    }

    pub fn preview(&self) -> Result<Vec<BatchPreview>, StoreError> {
        match &self.preview_data {
            Some(data) => Ok(serde_json::from_str(data)?),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPreview {
    pub id: i64,
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub from_email: Option<String>,
    pub date: i64,
}
