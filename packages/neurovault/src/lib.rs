pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod lod;
pub mod playback;
pub mod storage;
pub mod types;

pub use config::{PlaybackConfig, StorageConfig, StreamParams};
pub use db::{AuditEvent, AuditEventType, ChunkStore};
pub use error::{StorageError, StorageResult};
pub use lod::{LodPyramid, MinMaxPair};
pub use storage::{ChunkWriter, CleanupReport, StorageReaper};
pub use types::*;
