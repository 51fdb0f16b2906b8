use serde::Serialize;

/// Errors surfaced by the index engine.
///
/// The taxonomy matters more than the payloads: `Remote` failures are
/// retryable at the calling stage, `QuotaExceeded` is a signal (eviction
/// already ran), `Corrupt` means the index must be rebuilt, and everything
/// else is fatal for the current operation only.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Index corrupt: {0}")]
    Corrupt(String),

    #[error("Storage quota exceeded")]
    QuotaExceeded,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Another stage is already running: {0}")]
    StageBusy(&'static str),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

// Hosts embed the engine behind IPC boundaries that require serializable
// errors. Serialize as a plain string, matching Display.
impl Serialize for IndexError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<r2d2::Error> for IndexError {
    fn from(e: r2d2::Error) -> Self {
        IndexError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(e: rusqlite::Error) -> Self {
        IndexError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::Database(e.to_string())
    }
}
