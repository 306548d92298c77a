pub mod reaper;
pub mod writer;

pub use reaper::{CleanupReport, StorageReaper};
pub use writer::{ChunkWriter, PersistSummary, WriteFailure, WriterStats};
