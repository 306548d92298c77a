//! Versioned schema migrations for the chunk database.
//!
//! Migrations run in order and are tracked in a `schema_migrations` table.
//!
//! # Adding a new migration
//!
//! 1. Create a new struct implementing the `Migration` trait
//! 2. Add it to the `ALL_MIGRATIONS` array in order
//! 3. Migrations are run automatically when a `ChunkStore` is opened

use crate::error::StorageResult;
use rusqlite::Connection;

/// A database migration that can be applied
pub trait Migration: Send + Sync {
    /// Unique version identifier (format: YYYYMMDDHHMMSS)
    fn version(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn up(&self, conn: &Connection) -> StorageResult<()>;
}

/// Registry of all migrations in order
pub static ALL_MIGRATIONS: &[&dyn Migration] = &[&CreateCoreSchema, &AddNirsChunks];

pub struct MigrationRunner<'a> {
    conn: &'a Connection,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn ensure_migrations_table(&self) -> StorageResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )?;
        Ok(())
    }

    fn is_applied(&self, version: &str) -> StorageResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
            [version],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Run all pending migrations, each inside its own transaction.
    pub fn run_pending(&self) -> StorageResult<MigrationReport> {
        self.ensure_migrations_table()?;

        let mut report = MigrationReport::default();

        for migration in ALL_MIGRATIONS {
            if self.is_applied(migration.version())? {
                report.skipped += 1;
                continue;
            }

            log::info!(
                "[CHUNK STORE] Running migration {}: {}",
                migration.version(),
                migration.description()
            );

            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = migration.up(self.conn).and_then(|_| {
                self.conn.execute(
                    "INSERT INTO schema_migrations (version, description) VALUES (?1, ?2)",
                    [migration.version(), migration.description()],
                )?;
                Ok(())
            });
            match result {
                Ok(()) => self.conn.execute_batch("COMMIT")?,
                Err(e) => {
                    self.conn.execute_batch("ROLLBACK").ok();
                    return Err(e);
                }
            }
            report.applied += 1;
        }

        Ok(report)
    }

    pub fn get_applied(&self) -> StorageResult<Vec<String>> {
        self.ensure_migrations_table()?;
        let mut stmt = self
            .conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version")?;
        let versions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(versions)
    }
}

#[derive(Debug, Default)]
pub struct MigrationReport {
    pub applied: usize,
    pub skipped: usize,
}

// ============================================================================
// MIGRATIONS
// ============================================================================

/// Patients, sessions, EEG chunks, audit log and the storage aggregate.
pub struct CreateCoreSchema;

impl Migration for CreateCoreSchema {
    fn version(&self) -> &'static str {
        "20250301000001"
    }

    fn description(&self) -> &'static str {
        "Create patients, sessions, eeg_chunks, audit_log and storage_state"
    }

    fn up(&self, conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS patients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                patient_id TEXT NOT NULL UNIQUE,
                created_at_us INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                patient_id INTEGER NOT NULL REFERENCES patients(id),
                start_time_us INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_single_active
                ON sessions(is_active) WHERE is_active = 1;

            CREATE TABLE IF NOT EXISTS eeg_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES sessions(id),
                start_time_us INTEGER NOT NULL,
                end_time_us INTEGER NOT NULL,
                sample_count INTEGER NOT NULL,
                channel_count INTEGER NOT NULL,
                encoding_version INTEGER NOT NULL,
                quality_summary INTEGER NOT NULL,
                data_blob BLOB NOT NULL,
                byte_length INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_eeg_chunks_session_time
                ON eeg_chunks(session_id, start_time_us);
            CREATE INDEX IF NOT EXISTS idx_eeg_chunks_start_time
                ON eeg_chunks(start_time_us);

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                session_id INTEGER,
                old_value TEXT,
                new_value TEXT,
                details TEXT,
                timestamp_us INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_log_event_type
                ON audit_log(event_type, timestamp_us);

            CREATE TABLE IF NOT EXISTS storage_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_bytes INTEGER NOT NULL DEFAULT 0,
                eeg_chunk_count INTEGER NOT NULL DEFAULT 0,
                storage_limit_bytes INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }
}

/// NIRS gets its own chunk table with the EEG shape.
pub struct AddNirsChunks;

impl Migration for AddNirsChunks {
    fn version(&self) -> &'static str {
        "20250415000001"
    }

    fn description(&self) -> &'static str {
        "Add nirs_chunks table and nirs_chunk_count aggregate"
    }

    fn up(&self, conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nirs_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES sessions(id),
                start_time_us INTEGER NOT NULL,
                end_time_us INTEGER NOT NULL,
                sample_count INTEGER NOT NULL,
                channel_count INTEGER NOT NULL,
                encoding_version INTEGER NOT NULL,
                quality_summary INTEGER NOT NULL,
                data_blob BLOB NOT NULL,
                byte_length INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_nirs_chunks_session_time
                ON nirs_chunks(session_id, start_time_us);
            CREATE INDEX IF NOT EXISTS idx_nirs_chunks_start_time
                ON nirs_chunks(start_time_us);

            ALTER TABLE storage_state ADD COLUMN nirs_chunk_count INTEGER NOT NULL DEFAULT 0;",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let conn = Connection::open_in_memory().unwrap();
        let runner = MigrationRunner::new(&conn);

        let first = runner.run_pending().unwrap();
        assert_eq!(first.applied, ALL_MIGRATIONS.len());

        let second = runner.run_pending().unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.skipped, ALL_MIGRATIONS.len());

        let applied = runner.get_applied().unwrap();
        assert_eq!(applied, vec!["20250301000001", "20250415000001"]);
    }

    #[test]
    fn test_single_active_session_enforced_by_schema() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationRunner::new(&conn).run_pending().unwrap();
        conn.execute(
            "INSERT INTO patients (patient_id, created_at_us) VALUES ('p', 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO sessions (patient_id, start_time_us, is_active) VALUES (1, 0, 1)",
            [],
        )
        .unwrap();
        let second = conn.execute(
            "INSERT INTO sessions (patient_id, start_time_us, is_active) VALUES (1, 10, 1)",
            [],
        );
        assert!(second.is_err());
    }
}
