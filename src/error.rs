use thiserror::Error;

/// Errors surfaced by the store and its services.
///
/// Store I/O failures are always returned to the caller of the mutating
/// operation. Rule action failures and indexer batch failures are handled
/// inside their components and never show up here.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Invalid draft transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Content indexer for account {0} is not running")]
    IndexerNotRunning(i64),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        StoreError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
