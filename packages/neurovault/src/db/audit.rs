use crate::error::StorageResult;
use crate::types::now_us;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Conditions recorded in the append-only audit log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    StorageCleanup,
    CleanupIncomplete,
    SessionStarted,
    SessionEnded,
    ChunkWriteFailed,
    CorruptChunk,
    StorageLimitChanged,
    StorageStateReconciled,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StorageCleanup => "STORAGE_CLEANUP",
            Self::CleanupIncomplete => "CLEANUP_INCOMPLETE",
            Self::SessionStarted => "SESSION_STARTED",
            Self::SessionEnded => "SESSION_ENDED",
            Self::ChunkWriteFailed => "CHUNK_WRITE_FAILED",
            Self::CorruptChunk => "CORRUPT_CHUNK",
            Self::StorageLimitChanged => "STORAGE_LIMIT_CHANGED",
            Self::StorageStateReconciled => "STORAGE_STATE_RECONCILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "STORAGE_CLEANUP" => Some(Self::StorageCleanup),
            "CLEANUP_INCOMPLETE" => Some(Self::CleanupIncomplete),
            "SESSION_STARTED" => Some(Self::SessionStarted),
            "SESSION_ENDED" => Some(Self::SessionEnded),
            "CHUNK_WRITE_FAILED" => Some(Self::ChunkWriteFailed),
            "CORRUPT_CHUNK" => Some(Self::CorruptChunk),
            "STORAGE_LIMIT_CHANGED" => Some(Self::StorageLimitChanged),
            "STORAGE_STATE_RECONCILED" => Some(Self::StorageStateReconciled),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Row id, `None` until persisted
    pub id: Option<i64>,
    pub event_type: AuditEventType,
    pub session_id: Option<i64>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub details: Option<String>,
    pub timestamp_us: i64,
}

impl AuditEvent {
    pub fn builder(event_type: AuditEventType) -> AuditEventBuilder {
        AuditEventBuilder {
            event_type,
            session_id: None,
            old_value: None,
            new_value: None,
            details: None,
        }
    }
}

/// Builder for creating audit events
#[derive(Debug)]
pub struct AuditEventBuilder {
    event_type: AuditEventType,
    session_id: Option<i64>,
    old_value: Option<String>,
    new_value: Option<String>,
    details: Option<String>,
}

impl AuditEventBuilder {
    pub fn session(mut self, session_id: i64) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn old_value(mut self, value: impl ToString) -> Self {
        self.old_value = Some(value.to_string());
        self
    }

    pub fn new_value(mut self, value: impl ToString) -> Self {
        self.new_value = Some(value.to_string());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Structured details, stored as a JSON string.
    pub fn json_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details.to_string());
        self
    }

    pub fn build(self) -> AuditEvent {
        AuditEvent {
            id: None,
            event_type: self.event_type,
            session_id: self.session_id,
            old_value: self.old_value,
            new_value: self.new_value,
            details: self.details,
            timestamp_us: now_us(),
        }
    }
}

/// Append an event using an existing connection or transaction.
pub(crate) fn insert_event(conn: &Connection, event: &AuditEvent) -> StorageResult<i64> {
    conn.execute(
        "INSERT INTO audit_log (event_type, session_id, old_value, new_value, details, timestamp_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_type.as_str(),
            event.session_id,
            event.old_value,
            event.new_value,
            event.details,
            event.timestamp_us,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent events first, optionally filtered by type.
pub(crate) fn query_recent(
    conn: &Connection,
    event_type: Option<AuditEventType>,
    limit: usize,
) -> StorageResult<Vec<AuditEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, event_type, session_id, old_value, new_value, details, timestamp_us
         FROM audit_log
         WHERE ?1 IS NULL OR event_type = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;

    let events = stmt
        .query_map(params![event_type.map(|t| t.as_str()), limit as i64], |row| {
            let raw_type: String = row.get(1)?;
            let event_type = AuditEventType::from_str(&raw_type).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    format!("unknown audit event type '{}'", raw_type).into(),
                )
            })?;
            Ok(AuditEvent {
                id: Some(row.get(0)?),
                event_type,
                session_id: row.get(2)?,
                old_value: row.get(3)?,
                new_value: row.get(4)?,
                details: row.get(5)?,
                timestamp_us: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::MigrationRunner;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        MigrationRunner::new(&conn).run_pending().unwrap();
        conn
    }

    #[test]
    fn test_event_type_names() {
        for event_type in [
            AuditEventType::StorageCleanup,
            AuditEventType::CleanupIncomplete,
            AuditEventType::SessionStarted,
            AuditEventType::SessionEnded,
            AuditEventType::ChunkWriteFailed,
            AuditEventType::CorruptChunk,
            AuditEventType::StorageLimitChanged,
            AuditEventType::StorageStateReconciled,
        ] {
            assert_eq!(AuditEventType::from_str(event_type.as_str()), Some(event_type));
        }
        assert_eq!(
            serde_json::to_string(&AuditEventType::StorageCleanup).unwrap(),
            "\"STORAGE_CLEANUP\""
        );
    }

    #[test]
    fn test_insert_and_query_recent() {
        let conn = test_conn();
        let cleanup = AuditEvent::builder(AuditEventType::StorageCleanup)
            .old_value(5000)
            .new_value(2000)
            .details("freed 3 chunk(s)")
            .build();
        let ended = AuditEvent::builder(AuditEventType::SessionEnded)
            .session(7)
            .build();
        insert_event(&conn, &cleanup).unwrap();
        insert_event(&conn, &ended).unwrap();

        let all = query_recent(&conn, None, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_type, AuditEventType::SessionEnded);
        assert_eq!(all[0].session_id, Some(7));

        let cleanups = query_recent(&conn, Some(AuditEventType::StorageCleanup), 10).unwrap();
        assert_eq!(cleanups.len(), 1);
        assert_eq!(cleanups[0].old_value.as_deref(), Some("5000"));
        assert_eq!(cleanups[0].new_value.as_deref(), Some("2000"));
    }
}
