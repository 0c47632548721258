//! Local mail store: envelope sync, full-text search, a resumable body
//! indexer, per-account filter rules, scheduled drafts, archival and
//! confirm-before-run batch operations, all on one SQLite database.

pub mod archive;
pub mod batch;
pub mod config;
pub mod db;
pub mod drafts;
pub mod error;
pub mod events;
pub mod indexer;
pub mod messages;
pub mod models;
pub mod rule_engine;
pub mod rules;
pub mod search;
pub mod sync;

pub use config::Config;
pub use db::Database;
pub use drafts::{DraftScheduler, SchedulerHandle, SendOutcome, SendReceipt, Transport, TransportError};
pub use error::{Result, StoreError};
pub use events::StoreEvent;
pub use indexer::{BodySource, ContentIndexer, FetchError, FetchedBody, PendingBody};
pub use rules::{ActionSpec, ConditionSpec, RuleDefinition};
pub use sync::{IngestSummary, Ingested, SyncRecord};
