use thiserror::Error;

/// Errors raised by the codec, the chunk store, the writer and the reaper.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A persisted chunk cannot be decoded. Indicates storage integrity loss.
    #[error("Corrupt chunk: {0}")]
    CorruptChunk(String),

    #[error("Storage capacity exceeded: {used} of {limit} bytes in use")]
    CapacityExceeded { used: u64, limit: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The database stayed locked for longer than the configured busy timeout.
    #[error("Database busy: {0}")]
    Busy(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Shutdown timed out with {0} chunk(s) still pending")]
    ShutdownTimeout(usize),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StorageError::Busy(err.to_string())
            }
            _ => StorageError::Database(err),
        }
    }
}

impl StorageError {
    /// Corruption means the persisted data itself is bad; everything else is
    /// operational and may succeed on a later attempt.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::CorruptChunk(_))
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
