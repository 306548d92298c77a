use crate::codec;
use crate::config::{StorageConfig, StreamParams};
use crate::db::audit::{self, AuditEvent, AuditEventType};
use crate::db::migrations::MigrationRunner;
use crate::error::{StorageError, StorageResult};
use crate::types::{
    now_us, ChunkMetadata, ChunkRef, EvictionCandidate, Modality, NewChunk, Patient,
    QualityFlags, Sample, Session, StorageState,
};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CHUNK_COLUMNS: &str = "id, session_id, start_time_us, end_time_us, sample_count, \
     channel_count, encoding_version, quality_summary, byte_length";

/// Idle reader connections kept for reuse.
const MAX_IDLE_READERS: usize = 4;

/// Outcome of a `delete_chunks` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSummary {
    pub deleted_chunks: u64,
    pub freed_bytes: u64,
    /// Chunks that were already gone or belong to the active session
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub before: StorageState,
    pub after: StorageState,
    pub repaired: bool,
}

/// Per-session totals across both chunk tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: Session,
    pub eeg_chunks: u64,
    pub nirs_chunks: u64,
    pub total_bytes: u64,
    pub first_sample_us: Option<i64>,
    pub last_sample_us: Option<i64>,
}

/// SQLite-backed chunk persistence.
///
/// One writer connection guarded by a mutex, plus a small pool of read-only
/// connections. WAL mode lets readers run while a write transaction is open.
pub struct ChunkStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    eeg: StreamParams,
    nirs: StreamParams,
    busy_timeout: Duration,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("path", &self.path)
            .field("busy_timeout", &self.busy_timeout)
            .finish()
    }
}

impl ChunkStore {
    pub fn open<P: AsRef<Path>>(db_path: P, config: &StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        let path = db_path.as_ref().to_path_buf();
        let busy_timeout = config.busy_timeout();

        let conn = Connection::open(&path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;",
        )?;

        let report = MigrationRunner::new(&conn).run_pending()?;
        if report.applied > 0 {
            log::info!(
                "[CHUNK STORE] Applied {} migration(s) to {}",
                report.applied,
                path.display()
            );
        }

        let store = Self {
            path,
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
            eeg: config.eeg,
            nirs: config.nirs,
            busy_timeout,
        };
        store.init_storage_state(config.storage_limit_bytes)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_storage_state(&self, limit_bytes: u64) -> StorageResult<()> {
        let existing: Option<i64> = {
            let conn = self.writer()?;
            conn.query_row(
                "SELECT storage_limit_bytes FROM storage_state WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?
        };

        match existing {
            None => {
                let conn = self.writer()?;
                conn.execute(
                    "INSERT INTO storage_state (id, total_bytes, eeg_chunk_count, nirs_chunk_count, storage_limit_bytes)
                     VALUES (1, 0, 0, 0, ?1)",
                    [limit_bytes as i64],
                )?;
                log::info!("[CHUNK STORE] Initialized storage state (limit {} bytes)", limit_bytes);
            }
            // The persisted limit wins; only set_storage_limit changes it.
            Some(stored) if stored as u64 != limit_bytes => {
                log::info!(
                    "[CHUNK STORE] Keeping stored limit of {} bytes (configured {})",
                    stored,
                    limit_bytes
                );
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn writer(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.writer.try_lock_for(self.busy_timeout).ok_or_else(|| {
            StorageError::Busy("timed out waiting for the writer connection".to_string())
        })
    }

    fn open_reader(&self) -> StorageResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    /// Run `f` on a pooled reader connection. The pool lock is only held
    /// while checking a connection out or back in.
    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let pooled = self.readers.lock().pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => self.open_reader()?,
        };
        let result = f(&conn);
        let mut idle = self.readers.lock();
        if idle.len() < MAX_IDLE_READERS {
            idle.push(conn);
        }
        result
    }

    fn stream_params(&self, modality: Modality) -> &StreamParams {
        match modality {
            Modality::Eeg => &self.eeg,
            Modality::Nirs => &self.nirs,
        }
    }

    // ------------------------------------------------------------------
    // Patients and sessions
    // ------------------------------------------------------------------

    /// Create a patient, or return the existing row with the same identifier.
    pub fn create_patient(&self, patient_id: &str) -> StorageResult<Patient> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT OR IGNORE INTO patients (patient_id, created_at_us) VALUES (?1, ?2)",
            params![patient_id, now_us()],
        )?;
        let patient = conn.query_row(
            "SELECT id, patient_id, created_at_us FROM patients WHERE patient_id = ?1",
            [patient_id],
            |row| {
                Ok(Patient {
                    id: row.get(0)?,
                    patient_id: row.get(1)?,
                    created_at_us: row.get(2)?,
                })
            },
        )?;
        Ok(patient)
    }

    /// Create an inactive session for an existing patient row.
    pub fn create_session(&self, patient_row_id: i64, start_time_us: i64) -> StorageResult<Session> {
        let conn = self.writer()?;
        let exists: Option<i64> = conn
            .query_row("SELECT id FROM patients WHERE id = ?1", [patient_row_id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StorageError::NotFound(format!("patient {}", patient_row_id)));
        }
        conn.execute(
            "INSERT INTO sessions (patient_id, start_time_us, is_active) VALUES (?1, ?2, 0)",
            params![patient_row_id, start_time_us],
        )?;
        Ok(Session {
            id: conn.last_insert_rowid(),
            patient_id: patient_row_id,
            start_time_us,
            is_active: false,
        })
    }

    /// Make `session_id` the single active session.
    ///
    /// Any previously active session is deactivated in the same transaction.
    pub fn activate_session(&self, session_id: i64) -> StorageResult<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<i64> = tx
            .query_row("SELECT id FROM sessions WHERE id = ?1", [session_id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StorageError::NotFound(format!("session {}", session_id)));
        }

        let previous: Option<i64> = tx
            .query_row("SELECT id FROM sessions WHERE is_active = 1", [], |row| row.get(0))
            .optional()?;
        if previous == Some(session_id) {
            return Ok(());
        }

        tx.execute("UPDATE sessions SET is_active = 0 WHERE is_active = 1", [])?;
        tx.execute("UPDATE sessions SET is_active = 1 WHERE id = ?1", [session_id])?;

        if let Some(previous) = previous {
            audit::insert_event(
                &tx,
                &AuditEvent::builder(AuditEventType::SessionEnded)
                    .session(previous)
                    .details(format!("superseded by session {}", session_id))
                    .build(),
            )?;
        }
        let mut started = AuditEvent::builder(AuditEventType::SessionStarted).session(session_id);
        if let Some(previous) = previous {
            started = started.old_value(previous);
        }
        audit::insert_event(&tx, &started.new_value(session_id).build())?;
        tx.commit()?;

        log::info!("[CHUNK STORE] Session {} is now active", session_id);
        Ok(())
    }

    pub fn end_session(&self, session_id: i64) -> StorageResult<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let was_active: Option<bool> = tx
            .query_row(
                "SELECT is_active FROM sessions WHERE id = ?1",
                [session_id],
                |row| Ok(row.get::<_, i64>(0)? != 0),
            )
            .optional()?;
        match was_active {
            None => return Err(StorageError::NotFound(format!("session {}", session_id))),
            Some(false) => return Ok(()),
            Some(true) => {}
        }

        tx.execute("UPDATE sessions SET is_active = 0 WHERE id = ?1", [session_id])?;
        audit::insert_event(
            &tx,
            &AuditEvent::builder(AuditEventType::SessionEnded)
                .session(session_id)
                .build(),
        )?;
        tx.commit()?;

        log::info!("[CHUNK STORE] Session {} ended", session_id);
        Ok(())
    }

    pub fn active_session(&self) -> StorageResult<Option<Session>> {
        self.with_reader(|conn| {
            let session = conn
                .query_row(
                    "SELECT id, patient_id, start_time_us, is_active FROM sessions WHERE is_active = 1",
                    [],
                    row_to_session,
                )
                .optional()?;
            Ok(session)
        })
    }

    pub fn get_session(&self, session_id: i64) -> StorageResult<Session> {
        self.with_reader(|conn| {
            conn.query_row(
                "SELECT id, patient_id, start_time_us, is_active FROM sessions WHERE id = ?1",
                [session_id],
                row_to_session,
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("session {}", session_id)))
        })
    }

    pub fn list_sessions(&self) -> StorageResult<Vec<Session>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, patient_id, start_time_us, is_active FROM sessions ORDER BY start_time_us, id",
            )?;
            let sessions = stmt
                .query_map([], row_to_session)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
    }

    /// Sessions with their chunk counts, byte usage and covered time span.
    pub fn session_summaries(&self) -> StorageResult<Vec<SessionSummary>> {
        let sessions = self.list_sessions()?;
        self.with_reader(|conn| {
            let mut summaries = Vec::with_capacity(sessions.len());
            for session in sessions {
                let mut summary = SessionSummary {
                    session,
                    eeg_chunks: 0,
                    nirs_chunks: 0,
                    total_bytes: 0,
                    first_sample_us: None,
                    last_sample_us: None,
                };
                for modality in Modality::ALL {
                    let sql = format!(
                        "SELECT COUNT(*), COALESCE(SUM(byte_length), 0), MIN(start_time_us), MAX(end_time_us)
                         FROM {} WHERE session_id = ?1",
                        modality.table()
                    );
                    let (count, bytes, first, last): (i64, i64, Option<i64>, Option<i64>) = conn
                        .query_row(&sql, [summary.session.id], |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                        })?;
                    match modality {
                        Modality::Eeg => summary.eeg_chunks = count as u64,
                        Modality::Nirs => summary.nirs_chunks = count as u64,
                    }
                    summary.total_bytes += bytes as u64;
                    summary.first_sample_us = min_opt(summary.first_sample_us, first);
                    summary.last_sample_us = max_opt(summary.last_sample_us, last);
                }
                summaries.push(summary);
            }
            Ok(summaries)
        })
    }

    // ------------------------------------------------------------------
    // Chunks
    // ------------------------------------------------------------------

    /// Insert a sealed chunk and account for it in `storage_state`, atomically.
    pub fn insert_chunk(&self, chunk: &NewChunk) -> StorageResult<ChunkMetadata> {
        let decoded_count = codec::sample_count(&chunk.blob)
            .map_err(|e| StorageError::InvalidInput(format!("chunk blob rejected: {}", e)))?;
        if decoded_count != chunk.sample_count as usize {
            return Err(StorageError::InvalidInput(format!(
                "chunk declares {} samples but its blob holds {}",
                chunk.sample_count, decoded_count
            )));
        }

        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let session_exists: Option<i64> = tx
            .query_row("SELECT id FROM sessions WHERE id = ?1", [chunk.session_id], |row| row.get(0))
            .optional()?;
        if session_exists.is_none() {
            return Err(StorageError::NotFound(format!("session {}", chunk.session_id)));
        }

        let byte_length = chunk.byte_length();
        tx.execute(
            &format!(
                "INSERT INTO {} (session_id, start_time_us, end_time_us, sample_count, channel_count,
                                 encoding_version, quality_summary, data_blob, byte_length)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                chunk.modality.table()
            ),
            params![
                chunk.session_id,
                chunk.start_time_us,
                chunk.end_time_us,
                chunk.sample_count as i64,
                chunk.channel_count as i64,
                chunk.encoding_version as i64,
                chunk.quality_summary.bits() as i64,
                &chunk.blob,
                byte_length as i64,
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            &format!(
                "UPDATE storage_state
                 SET total_bytes = total_bytes + ?1, {count} = {count} + 1
                 WHERE id = 1",
                count = count_column(chunk.modality)
            ),
            [byte_length as i64],
        )?;
        tx.commit()?;

        Ok(ChunkMetadata {
            id,
            modality: chunk.modality,
            session_id: chunk.session_id,
            start_time_us: chunk.start_time_us,
            end_time_us: chunk.end_time_us,
            sample_count: chunk.sample_count,
            channel_count: chunk.channel_count,
            encoding_version: chunk.encoding_version,
            quality_summary: chunk.quality_summary,
            byte_length,
        })
    }

    /// Chunks of `session_id` overlapping `[start_us, end_us)`, ordered by start.
    pub fn query_time_range(
        &self,
        modality: Modality,
        session_id: i64,
        start_us: i64,
        end_us: i64,
    ) -> StorageResult<Vec<ChunkMetadata>> {
        self.with_reader(|conn| {
            let sql = format!(
                "SELECT {} FROM {}
                 WHERE session_id = ?1 AND start_time_us < ?3 AND end_time_us >= ?2
                 ORDER BY start_time_us, id",
                CHUNK_COLUMNS,
                modality.table()
            );
            let mut stmt = conn.prepare(&sql)?;
            let chunks = stmt
                .query_map(params![session_id, start_us, end_us], |row| {
                    row_to_metadata(modality, row)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(chunks)
        })
    }

    /// Every chunk of a session, ordered by start time.
    pub fn get_session_index(
        &self,
        modality: Modality,
        session_id: i64,
    ) -> StorageResult<Vec<ChunkMetadata>> {
        self.with_reader(|conn| {
            let sql = format!(
                "SELECT {} FROM {} WHERE session_id = ?1 ORDER BY start_time_us, id",
                CHUNK_COLUMNS,
                modality.table()
            );
            let mut stmt = conn.prepare(&sql)?;
            let chunks = stmt
                .query_map([session_id], |row| row_to_metadata(modality, row))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(chunks)
        })
    }

    /// Metadata of every chunk of a modality, across sessions.
    pub fn list_chunks(&self, modality: Modality) -> StorageResult<Vec<ChunkMetadata>> {
        self.with_reader(|conn| {
            let sql = format!(
                "SELECT {} FROM {} ORDER BY start_time_us, id",
                CHUNK_COLUMNS,
                modality.table()
            );
            let mut stmt = conn.prepare(&sql)?;
            let chunks = stmt
                .query_map([], |row| row_to_metadata(modality, row))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(chunks)
        })
    }

    /// Decoded samples of one chunk.
    ///
    /// A blob that fails to decode, or decodes to a different shape than its
    /// row declares, is reported as `CorruptChunk` and audited once per chunk.
    pub fn read_chunk(&self, modality: Modality, chunk_id: i64) -> StorageResult<Vec<Sample>> {
        let (session_id, decoded) = self.load_and_decode(modality, chunk_id)?;
        if let Err(StorageError::CorruptChunk(reason)) = &decoded {
            log::error!(
                "[CHUNK STORE] Corrupt {} chunk {} in session {}: {}",
                modality,
                chunk_id,
                session_id,
                reason
            );
            if let Err(e) = self.audit_corrupt_chunk(modality, chunk_id, session_id, reason) {
                log::warn!("[CHUNK STORE] Failed to audit corrupt chunk {}: {}", chunk_id, e);
            }
        }
        decoded
    }

    /// Same checks as `read_chunk` without touching the audit log.
    pub fn decode_chunk(&self, modality: Modality, chunk_id: i64) -> StorageResult<Vec<Sample>> {
        self.load_and_decode(modality, chunk_id)?.1
    }

    /// Record `CORRUPT_CHUNK` for a chunk unless it is already on record.
    ///
    /// Returns whether a new entry was written.
    pub fn audit_corrupt_chunk(
        &self,
        modality: Modality,
        chunk_id: i64,
        session_id: i64,
        reason: &str,
    ) -> StorageResult<bool> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let known: bool = tx.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM audit_log
                WHERE event_type = ?1
                  AND json_extract(details, '$.modality') = ?2
                  AND json_extract(details, '$.chunk_id') = ?3
             )",
            params![AuditEventType::CorruptChunk.as_str(), modality.as_str(), chunk_id],
            |row| row.get(0),
        )?;
        if known {
            return Ok(false);
        }

        audit::insert_event(
            &tx,
            &AuditEvent::builder(AuditEventType::CorruptChunk)
                .session(session_id)
                .json_details(serde_json::json!({
                    "modality": modality.as_str(),
                    "chunk_id": chunk_id,
                    "reason": reason,
                }))
                .build(),
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Owning session and decode outcome of one chunk row.
    fn load_and_decode(
        &self,
        modality: Modality,
        chunk_id: i64,
    ) -> StorageResult<(i64, StorageResult<Vec<Sample>>)> {
        let row = self.with_reader(|conn| {
            let sql = format!(
                "SELECT session_id, start_time_us, sample_count, channel_count, data_blob
                 FROM {} WHERE id = ?1",
                modality.table()
            );
            let row: Option<(i64, i64, i64, i64, Vec<u8>)> = conn
                .query_row(&sql, [chunk_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })
                .optional()?;
            Ok(row)
        })?;

        let (session_id, start_time_us, sample_count, channel_count, blob) = row
            .ok_or_else(|| StorageError::NotFound(format!("{} chunk {}", modality, chunk_id)))?;

        let params = self.stream_params(modality);
        let decoded = codec::decode(&blob, params.scale_factor, start_time_us, params.sample_rate)
            .and_then(|samples| {
                let channels = samples.first().map(|s| s.channel_count()).unwrap_or(0);
                if samples.len() as i64 != sample_count || channels as i64 != channel_count {
                    return Err(StorageError::CorruptChunk(format!(
                        "row declares {}x{} but blob decodes to {}x{}",
                        sample_count,
                        channel_count,
                        samples.len(),
                        channels
                    )));
                }
                Ok(samples)
            });
        Ok((session_id, decoded))
    }

    /// Decoded samples of a session with timestamps in `[start_us, end_us)`.
    pub fn read_time_range(
        &self,
        modality: Modality,
        session_id: i64,
        start_us: i64,
        end_us: i64,
    ) -> StorageResult<Vec<Sample>> {
        let mut samples = Vec::new();
        for chunk in self.query_time_range(modality, session_id, start_us, end_us)? {
            samples.extend(
                self.read_chunk(modality, chunk.id)?
                    .into_iter()
                    .filter(|s| s.timestamp_us >= start_us && s.timestamp_us < end_us),
            );
        }
        Ok(samples)
    }

    // ------------------------------------------------------------------
    // Eviction support
    // ------------------------------------------------------------------

    /// Oldest chunks across both modalities that do not belong to the active
    /// session, ordered by `start_time_us`.
    pub fn oldest_evictable_chunks(&self, limit: usize) -> StorageResult<Vec<EvictionCandidate>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT 'eeg' AS modality, c.id AS id, c.session_id AS session_id,
                        c.start_time_us AS start_time_us, c.byte_length AS byte_length
                 FROM eeg_chunks c JOIN sessions s ON s.id = c.session_id
                 WHERE s.is_active = 0
                 UNION ALL
                 SELECT 'nirs' AS modality, c.id AS id, c.session_id AS session_id,
                        c.start_time_us AS start_time_us, c.byte_length AS byte_length
                 FROM nirs_chunks c JOIN sessions s ON s.id = c.session_id
                 WHERE s.is_active = 0
                 ORDER BY start_time_us, id
                 LIMIT ?1",
            )?;
            let candidates = stmt
                .query_map([limit as i64], |row| {
                    let raw: String = row.get(0)?;
                    let modality = Modality::from_str(&raw).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            0,
                            rusqlite::types::Type::Text,
                            format!("unknown modality '{}'", raw).into(),
                        )
                    })?;
                    Ok(EvictionCandidate {
                        chunk: ChunkRef {
                            modality,
                            id: row.get(1)?,
                        },
                        session_id: row.get(2)?,
                        start_time_us: row.get(3)?,
                        byte_length: row.get::<_, i64>(4)? as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(candidates)
        })
    }

    /// Delete chunks and subtract them from `storage_state` in one transaction.
    ///
    /// Chunks of the active session are never deleted, even when listed.
    pub fn delete_chunks(&self, chunks: &[ChunkRef]) -> StorageResult<DeleteSummary> {
        let mut summary = DeleteSummary::default();
        if chunks.is_empty() {
            return Ok(summary);
        }

        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut freed_per_modality = [(0i64, 0i64); 2];

        for chunk in chunks {
            let sql = format!(
                "DELETE FROM {} WHERE id = ?1
                   AND session_id NOT IN (SELECT id FROM sessions WHERE is_active = 1)
                 RETURNING byte_length",
                chunk.modality.table()
            );
            let freed: Option<i64> = tx.query_row(&sql, [chunk.id], |row| row.get(0)).optional()?;
            match freed {
                Some(bytes) => {
                    let slot = &mut freed_per_modality[modality_slot(chunk.modality)];
                    slot.0 += 1;
                    slot.1 += bytes;
                    summary.deleted_chunks += 1;
                    summary.freed_bytes += bytes as u64;
                }
                None => summary.skipped += 1,
            }
        }

        for modality in Modality::ALL {
            let (count, bytes) = freed_per_modality[modality_slot(modality)];
            if count == 0 {
                continue;
            }
            tx.execute(
                &format!(
                    "UPDATE storage_state
                     SET total_bytes = total_bytes - ?1, {count} = {count} - ?2
                     WHERE id = 1",
                    count = count_column(modality)
                ),
                params![bytes, count],
            )?;
        }
        tx.commit()?;
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Storage state
    // ------------------------------------------------------------------

    pub fn storage_state(&self) -> StorageResult<StorageState> {
        self.with_reader(|conn| read_storage_state(conn))
    }

    /// Change the capacity limit, auditing the old and new values.
    pub fn set_storage_limit(&self, limit_bytes: u64) -> StorageResult<()> {
        if limit_bytes == 0 {
            return Err(StorageError::InvalidConfig(
                "storage limit must be greater than zero".to_string(),
            ));
        }
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let old = read_storage_state(&tx)?.limit_bytes;
        if old == limit_bytes {
            return Ok(());
        }
        tx.execute(
            "UPDATE storage_state SET storage_limit_bytes = ?1 WHERE id = 1",
            [limit_bytes as i64],
        )?;
        audit::insert_event(
            &tx,
            &AuditEvent::builder(AuditEventType::StorageLimitChanged)
                .old_value(old)
                .new_value(limit_bytes)
                .build(),
        )?;
        tx.commit()?;

        log::info!(
            "[CHUNK STORE] Storage limit changed from {} to {} bytes",
            old,
            limit_bytes
        );
        Ok(())
    }

    /// Recompute the aggregate from the chunk rows. A mismatch is repaired and
    /// audited with the before/after values; a consistent state is left alone.
    pub fn reconcile_storage_state(&self) -> StorageResult<ReconcileReport> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let before = read_storage_state(&tx)?;

        let mut after = StorageState {
            total_bytes: 0,
            eeg_chunk_count: 0,
            nirs_chunk_count: 0,
            limit_bytes: before.limit_bytes,
        };
        for modality in Modality::ALL {
            let (count, bytes): (i64, i64) = tx.query_row(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(byte_length), 0) FROM {}",
                    modality.table()
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            after.total_bytes += bytes as u64;
            match modality {
                Modality::Eeg => after.eeg_chunk_count = count as u64,
                Modality::Nirs => after.nirs_chunk_count = count as u64,
            }
        }

        if after == before {
            return Ok(ReconcileReport {
                before,
                after,
                repaired: false,
            });
        }

        tx.execute(
            "UPDATE storage_state
             SET total_bytes = ?1, eeg_chunk_count = ?2, nirs_chunk_count = ?3
             WHERE id = 1",
            params![
                after.total_bytes as i64,
                after.eeg_chunk_count as i64,
                after.nirs_chunk_count as i64
            ],
        )?;
        audit::insert_event(
            &tx,
            &AuditEvent::builder(AuditEventType::StorageStateReconciled)
                .old_value(serde_json::to_string(&before)?)
                .new_value(serde_json::to_string(&after)?)
                .build(),
        )?;
        tx.commit()?;

        log::warn!(
            "[CHUNK STORE] Storage state repaired: {} -> {} bytes",
            before.total_bytes,
            after.total_bytes
        );
        Ok(ReconcileReport {
            before,
            after,
            repaired: true,
        })
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    pub fn append_audit(&self, event: &AuditEvent) -> StorageResult<i64> {
        let conn = self.writer()?;
        audit::insert_event(&conn, event)
    }

    pub fn recent_audit(
        &self,
        event_type: Option<AuditEventType>,
        limit: usize,
    ) -> StorageResult<Vec<AuditEvent>> {
        self.with_reader(|conn| audit::query_recent(conn, event_type, limit))
    }
}

fn read_storage_state(conn: &Connection) -> StorageResult<StorageState> {
    let state = conn.query_row(
        "SELECT total_bytes, eeg_chunk_count, nirs_chunk_count, storage_limit_bytes
         FROM storage_state WHERE id = 1",
        [],
        |row| {
            Ok(StorageState {
                total_bytes: row.get::<_, i64>(0)?.max(0) as u64,
                eeg_chunk_count: row.get::<_, i64>(1)?.max(0) as u64,
                nirs_chunk_count: row.get::<_, i64>(2)?.max(0) as u64,
                limit_bytes: row.get::<_, i64>(3)?.max(0) as u64,
            })
        },
    )?;
    Ok(state)
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        start_time_us: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
    })
}

fn row_to_metadata(modality: Modality, row: &Row<'_>) -> rusqlite::Result<ChunkMetadata> {
    Ok(ChunkMetadata {
        id: row.get(0)?,
        modality,
        session_id: row.get(1)?,
        start_time_us: row.get(2)?,
        end_time_us: row.get(3)?,
        sample_count: row.get::<_, i64>(4)? as u32,
        channel_count: row.get::<_, i64>(5)? as u8,
        encoding_version: row.get::<_, i64>(6)? as u8,
        quality_summary: QualityFlags::from_bits_truncate(row.get::<_, i64>(7)? as u8),
        byte_length: row.get::<_, i64>(8)? as u64,
    })
}

fn count_column(modality: Modality) -> &'static str {
    match modality {
        Modality::Eeg => "eeg_chunk_count",
        Modality::Nirs => "nirs_chunk_count",
    }
}

fn modality_slot(modality: Modality) -> usize {
    match modality {
        Modality::Eeg => 0,
        Modality::Nirs => 1,
    }
}

fn min_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::{encode, sample_timestamp_us};
    use tempfile::{tempdir, TempDir};

    pub(crate) fn open_store(config: &StorageConfig) -> (TempDir, ChunkStore) {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("neurovault.db"), config).unwrap();
        (dir, store)
    }

    /// Build a sealed chunk of `count` samples starting at `start_us`.
    pub(crate) fn make_chunk(
        config: &StorageConfig,
        modality: Modality,
        session_id: i64,
        start_us: i64,
        count: usize,
    ) -> NewChunk {
        let params = config.stream(modality);
        let samples: Vec<Sample> = (0..count)
            .map(|i| {
                Sample::new(
                    sample_timestamp_us(start_us, i, params.sample_rate),
                    vec![i as f32; params.channel_count],
                )
            })
            .collect();
        let encoded = encode(
            &samples,
            params.channel_count,
            params.sample_rate,
            params.scale_factor,
        )
        .unwrap();
        NewChunk {
            modality,
            session_id,
            start_time_us: start_us,
            end_time_us: samples[count - 1].timestamp_us,
            sample_count: encoded.sample_count,
            channel_count: params.channel_count as u8,
            encoding_version: encoded.version,
            quality_summary: encoded.quality_summary,
            blob: encoded.blob,
        }
    }

    fn new_session(store: &ChunkStore, start_us: i64) -> Session {
        let patient = store.create_patient("patient-001").unwrap();
        store.create_session(patient.id, start_us).unwrap()
    }

    #[test]
    fn test_reopen_keeps_persisted_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("neurovault.db");
        let config = StorageConfig {
            storage_limit_bytes: 5_000,
            ..StorageConfig::default()
        };

        {
            let store = ChunkStore::open(&path, &config).unwrap();
            let state = store.storage_state().unwrap();
            assert_eq!(state.total_bytes, 0);
            assert_eq!(state.limit_bytes, 5_000);
        }

        let store = ChunkStore::open(&path, &StorageConfig::default()).unwrap();
        assert_eq!(store.storage_state().unwrap().limit_bytes, 5_000);
        assert!(store
            .recent_audit(Some(AuditEventType::StorageLimitChanged), 10)
            .unwrap()
            .is_empty());

        store.set_storage_limit(10_000).unwrap();
        store.set_storage_limit(10_000).unwrap();
        drop(store);

        let store = ChunkStore::open(&path, &config).unwrap();
        assert_eq!(store.storage_state().unwrap().limit_bytes, 10_000);
        let events = store
            .recent_audit(Some(AuditEventType::StorageLimitChanged), 10)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_value.as_deref(), Some("5000"));
        assert_eq!(events[0].new_value.as_deref(), Some("10000"));
    }

    #[test]
    fn test_insert_updates_storage_state() {
        let config = StorageConfig::default();
        let (_dir, store) = open_store(&config);
        let session = new_session(&store, 0);

        let eeg = make_chunk(&config, Modality::Eeg, session.id, 0, 160);
        let nirs = make_chunk(&config, Modality::Nirs, session.id, 0, 10);
        let a = store.insert_chunk(&eeg).unwrap();
        let b = store.insert_chunk(&nirs).unwrap();

        let state = store.storage_state().unwrap();
        assert_eq!(state.total_bytes, a.byte_length + b.byte_length);
        assert_eq!(state.eeg_chunk_count, 1);
        assert_eq!(state.nirs_chunk_count, 1);
    }

    #[test]
    fn test_insert_rejects_unknown_session_and_bad_blob() {
        let config = StorageConfig::default();
        let (_dir, store) = open_store(&config);

        let orphan = make_chunk(&config, Modality::Eeg, 42, 0, 16);
        assert!(matches!(store.insert_chunk(&orphan), Err(StorageError::NotFound(_))));

        let session = new_session(&store, 0);
        let mut mismatched = make_chunk(&config, Modality::Eeg, session.id, 0, 16);
        mismatched.sample_count = 17;
        assert!(matches!(
            store.insert_chunk(&mismatched),
            Err(StorageError::InvalidInput(_))
        ));
        assert_eq!(store.storage_state().unwrap().total_bytes, 0);
    }

    #[test]
    fn test_query_time_range_returns_overlapping_chunks_in_order() {
        let config = StorageConfig::default();
        let (_dir, store) = open_store(&config);
        let session = new_session(&store, 0);

        for second in [2i64, 0, 1, 3] {
            let chunk = make_chunk(&config, Modality::Eeg, session.id, second * 1_000_000, 160);
            store.insert_chunk(&chunk).unwrap();
        }

        let hits = store
            .query_time_range(Modality::Eeg, session.id, 1_500_000, 2_500_000)
            .unwrap();
        let starts: Vec<i64> = hits.iter().map(|c| c.start_time_us).collect();
        assert_eq!(starts, vec![1_000_000, 2_000_000]);

        let index = store.get_session_index(Modality::Eeg, session.id).unwrap();
        assert_eq!(index.len(), 4);
        assert!(index.windows(2).all(|w| w[0].start_time_us < w[1].start_time_us));

        assert!(store
            .query_time_range(Modality::Nirs, session.id, 0, 10_000_000)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_read_chunk_round_trip() {
        let config = StorageConfig::default();
        let (_dir, store) = open_store(&config);
        let session = new_session(&store, 0);
        let meta = store
            .insert_chunk(&make_chunk(&config, Modality::Eeg, session.id, 5_000_000, 160))
            .unwrap();

        let samples = store.read_chunk(Modality::Eeg, meta.id).unwrap();
        assert_eq!(samples.len(), 160);
        assert_eq!(samples[0].timestamp_us, 5_000_000);
        assert_eq!(samples[159].timestamp_us, meta.end_time_us);
        assert!((samples[10].values[0] - 10.0).abs() <= 0.038 + 1e-4);

        let ranged = store
            .read_time_range(Modality::Eeg, session.id, 5_000_000, 5_062_500)
            .unwrap();
        assert_eq!(ranged.len(), 10);

        assert!(matches!(
            store.read_chunk(Modality::Eeg, 9999),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_blob_is_reported_and_audited() {
        let config = StorageConfig::default();
        let (dir, store) = open_store(&config);
        let session = new_session(&store, 0);
        let meta = store
            .insert_chunk(&make_chunk(&config, Modality::Eeg, session.id, 0, 160))
            .unwrap();

        let raw = Connection::open(dir.path().join("neurovault.db")).unwrap();
        raw.execute(
            "UPDATE eeg_chunks SET data_blob = X'0902' WHERE id = ?1",
            [meta.id],
        )
        .unwrap();
        drop(raw);

        let err = store.read_chunk(Modality::Eeg, meta.id).unwrap_err();
        assert!(err.is_corruption());
        let events = store.recent_audit(Some(AuditEventType::CorruptChunk), 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, Some(session.id));

        // Re-reading or verifying the same chunk adds nothing to the log.
        assert!(store.read_chunk(Modality::Eeg, meta.id).is_err());
        assert!(store.decode_chunk(Modality::Eeg, meta.id).unwrap_err().is_corruption());
        assert!(!store
            .audit_corrupt_chunk(Modality::Eeg, meta.id, session.id, "again")
            .unwrap());
        assert_eq!(
            store.recent_audit(Some(AuditEventType::CorruptChunk), 10).unwrap().len(),
            1
        );
        assert!(store
            .audit_corrupt_chunk(Modality::Nirs, meta.id, session.id, "other table")
            .unwrap());
    }

    #[test]
    fn test_activate_session_keeps_single_active() {
        let config = StorageConfig::default();
        let (_dir, store) = open_store(&config);
        let patient = store.create_patient("patient-001").unwrap();
        let first = store.create_session(patient.id, 0).unwrap();
        let second = store.create_session(patient.id, 100).unwrap();

        store.activate_session(first.id).unwrap();
        store.activate_session(second.id).unwrap();

        let active = store.active_session().unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert!(!store.get_session(first.id).unwrap().is_active);
        assert_eq!(store.list_sessions().unwrap().iter().filter(|s| s.is_active).count(), 1);

        let started = store.recent_audit(Some(AuditEventType::SessionStarted), 10).unwrap();
        assert_eq!(started.len(), 2);
        let ended = store.recent_audit(Some(AuditEventType::SessionEnded), 10).unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].session_id, Some(first.id));

        store.end_session(second.id).unwrap();
        assert!(store.active_session().unwrap().is_none());
        assert!(matches!(store.activate_session(999), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_evictable_chunks_skip_active_session() {
        let config = StorageConfig::default();
        let (_dir, store) = open_store(&config);
        let patient = store.create_patient("patient-001").unwrap();
        let old = store.create_session(patient.id, 0).unwrap();
        let live = store.create_session(patient.id, 10_000_000).unwrap();
        store.activate_session(live.id).unwrap();

        store.insert_chunk(&make_chunk(&config, Modality::Nirs, old.id, 0, 10)).unwrap();
        store.insert_chunk(&make_chunk(&config, Modality::Eeg, old.id, 1_000_000, 160)).unwrap();
        store.insert_chunk(&make_chunk(&config, Modality::Eeg, live.id, 500_000, 160)).unwrap();

        let candidates = store.oldest_evictable_chunks(10).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].chunk.modality, Modality::Nirs);
        assert_eq!(candidates[1].chunk.modality, Modality::Eeg);
        assert!(candidates.iter().all(|c| c.session_id == old.id));
    }

    #[test]
    fn test_delete_chunks_never_touches_active_session() {
        let config = StorageConfig::default();
        let (_dir, store) = open_store(&config);
        let patient = store.create_patient("patient-001").unwrap();
        let old = store.create_session(patient.id, 0).unwrap();
        let live = store.create_session(patient.id, 10).unwrap();
        store.activate_session(live.id).unwrap();

        let old_chunk = store.insert_chunk(&make_chunk(&config, Modality::Eeg, old.id, 0, 160)).unwrap();
        let live_chunk = store
            .insert_chunk(&make_chunk(&config, Modality::Eeg, live.id, 2_000_000, 160))
            .unwrap();

        let summary = store
            .delete_chunks(&[
                ChunkRef { modality: Modality::Eeg, id: old_chunk.id },
                ChunkRef { modality: Modality::Eeg, id: live_chunk.id },
            ])
            .unwrap();
        assert_eq!(summary.deleted_chunks, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.freed_bytes, old_chunk.byte_length);

        let state = store.storage_state().unwrap();
        assert_eq!(state.total_bytes, live_chunk.byte_length);
        assert_eq!(state.eeg_chunk_count, 1);
        assert!(!store.reconcile_storage_state().unwrap().repaired);
    }

    #[test]
    fn test_reconcile_repairs_drift_with_audit() {
        let config = StorageConfig::default();
        let (dir, store) = open_store(&config);
        let session = new_session(&store, 0);
        let meta = store
            .insert_chunk(&make_chunk(&config, Modality::Eeg, session.id, 0, 160))
            .unwrap();

        let raw = Connection::open(dir.path().join("neurovault.db")).unwrap();
        raw.execute("UPDATE storage_state SET total_bytes = 1, eeg_chunk_count = 7", [])
            .unwrap();
        drop(raw);

        let report = store.reconcile_storage_state().unwrap();
        assert!(report.repaired);
        assert_eq!(report.before.total_bytes, 1);
        assert_eq!(report.after.total_bytes, meta.byte_length);
        assert_eq!(report.after.eeg_chunk_count, 1);
        assert_eq!(
            store
                .recent_audit(Some(AuditEventType::StorageStateReconciled), 10)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_reads_proceed_while_write_transaction_open() {
        let config = StorageConfig::default();
        let (dir, store) = open_store(&config);
        let session = new_session(&store, 0);

        let raw = Connection::open(dir.path().join("neurovault.db")).unwrap();
        raw.execute_batch("BEGIN IMMEDIATE; UPDATE storage_state SET total_bytes = 999;")
            .unwrap();

        // Readers see the last committed state without waiting.
        assert_eq!(store.storage_state().unwrap().total_bytes, 0);
        assert!(store.get_session_index(Modality::Eeg, session.id).unwrap().is_empty());

        raw.execute_batch("ROLLBACK").unwrap();
    }

    #[test]
    fn test_write_fails_with_busy_after_timeout() {
        let mut config = StorageConfig::default();
        config.busy_timeout_ms = 50;
        let (dir, store) = open_store(&config);
        let session = new_session(&store, 0);

        let raw = Connection::open(dir.path().join("neurovault.db")).unwrap();
        raw.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let chunk = make_chunk(&config, Modality::Eeg, session.id, 0, 160);
        assert!(matches!(store.insert_chunk(&chunk), Err(StorageError::Busy(_))));

        raw.execute_batch("ROLLBACK").unwrap();
        assert!(store.insert_chunk(&chunk).is_ok());
    }

    #[test]
    fn test_session_summaries() {
        let config = StorageConfig::default();
        let (_dir, store) = open_store(&config);
        let session = new_session(&store, 0);
        let a = store.insert_chunk(&make_chunk(&config, Modality::Eeg, session.id, 0, 160)).unwrap();
        let b = store
            .insert_chunk(&make_chunk(&config, Modality::Nirs, session.id, 0, 10))
            .unwrap();

        let summaries = store.session_summaries().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].eeg_chunks, 1);
        assert_eq!(summaries[0].nirs_chunks, 1);
        assert_eq!(summaries[0].total_bytes, a.byte_length + b.byte_length);
        assert_eq!(summaries[0].first_sample_us, Some(0));
        assert_eq!(summaries[0].last_sample_us, Some(a.end_time_us.max(b.end_time_us)));
    }
}
