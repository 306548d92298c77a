pub mod audit;
pub mod chunk_store;
pub mod migrations;

pub use audit::{AuditEvent, AuditEventBuilder, AuditEventType};
pub use chunk_store::{ChunkStore, DeleteSummary, ReconcileReport, SessionSummary};
pub use migrations::{Migration, MigrationReport, MigrationRunner};
