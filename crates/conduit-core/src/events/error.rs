//! Error types for the event log.

use thiserror::Error;

/// Failures of the event log.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Event store query failed: {0}")]
    Database(#[from] rusqlite::Error),

    /// An event payload could not be encoded as JSON.
    #[error("Event payload is not serializable: {0}")]
    Payload(#[from] serde_json::Error),

    /// A stored row no longer decodes into an event.
    #[error("Stored event {event_id} is corrupt ({column}): {reason}")]
    CorruptRecord { event_id: String, column: &'static str, reason: String },

    /// Events are keyed by job id; an empty one cannot be looked up again.
    #[error("Event {event_type} has no correlation id")]
    MissingCorrelation { event_type: String },

    #[error("Notification '{title}' has no recipients")]
    NoRecipients { title: String },

    /// The store cannot be reached (poisoned lock, backend down, busy).
    #[error("Event log unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for event log operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
