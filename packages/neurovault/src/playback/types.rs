// Common types for the playback module

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for playback operations
pub type PlaybackResult<T> = Result<T, PlaybackError>;

/// Errors that can occur during playback
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Invalid playback rate: {0}")]
    InvalidRate(f64),

    #[error("Invalid video index: {0}")]
    InvalidIndex(String),

    #[error("Video index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Source already attached: {0}")]
    DuplicateSource(String),

    #[error("Frame provider error: {0}")]
    Provider(String),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::error::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coordinator state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Paused,
    Playing,
    /// Waiting for every source to acknowledge a new position
    Seeking,
}

/// What a playback source replays
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Eeg,
    Nirs,
    Video,
}

/// Lifecycle of an individual source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SourceState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Snapshot of coordinator counters for diagnostics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncStats {
    pub sync_check_count: u64,
    pub sync_violation_count: u64,
    pub max_observed_drift_us: i64,
}
