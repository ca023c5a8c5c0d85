use chrono::NaiveDate;
use thiserror::Error;

/// Failure reported by the tabular ledger store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown sheet '{0}'")]
    UnknownSheet(String),

    #[error("row {row} does not exist in sheet '{sheet}'")]
    MissingRow { sheet: String, row: usize },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors that abort a run of the incident lifecycle engine.
///
/// Anything surfacing here leaves the cursor untouched, so the run can be
/// repeated safely once the cause is fixed.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed tracker or ledger header data.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("export has already run today (last exported {last_exported})")]
    AlreadyRun { last_exported: NaiveDate },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// A notification could not be handed to the mail transport.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
#[error("calendar service error: {0}")]
pub struct CalendarError(pub String);
