use serde::Serialize;

use crate::models::{ArchiveReason, DraftStatus, IndexStatus};

/// Published on the store's broadcast channel after the corresponding
/// transaction has committed. Receivers that lag simply miss events; the
/// database stays the source of truth.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    MessageIngested {
        account_id: i64,
        message_id: i64,
        rules_matched: usize,
    },
    MessageArchived {
        account_id: i64,
        original_id: i64,
        reason: ArchiveReason,
    },
    IndexerProgress {
        account_id: i64,
        status: IndexStatus,
        indexed: i64,
        total: i64,
    },
    DraftStatusChanged {
        account_id: i64,
        draft_id: i64,
        status: DraftStatus,
    },
}
