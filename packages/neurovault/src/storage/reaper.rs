use crate::db::audit::{AuditEvent, AuditEventType};
use crate::db::ChunkStore;
use crate::error::StorageResult;
use crate::types::ChunkRef;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Candidates fetched per eviction round.
const EVICTION_BATCH_SIZE: usize = 64;

/// Result of one `check_and_cleanup` invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Usage had reached the threshold, so eviction ran
    pub triggered: bool,
    /// Correlates the audit entries of one triggered run; nil otherwise
    pub run_id: Uuid,
    pub deleted_chunks: u64,
    pub freed_bytes: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub threshold_bytes: u64,
    pub limit_bytes: u64,
    /// Eviction ran out of non-active chunks before reaching the threshold
    pub incomplete: bool,
}

impl CleanupReport {
    pub fn over_limit(&self) -> bool {
        self.bytes_after >= self.limit_bytes
    }
}

/// Enforces the storage capacity bound by deleting the oldest chunks.
///
/// Chunks of the active session are never selected. When only active-session
/// data is left the run stops early and the session keeps growing.
pub struct StorageReaper {
    store: Arc<ChunkStore>,
    cleanup_threshold: f64,
    total_deleted_chunks: AtomicU64,
    total_freed_bytes: AtomicU64,
    run_lock: Mutex<()>,
}

impl StorageReaper {
    pub fn new(store: Arc<ChunkStore>, cleanup_threshold: f64) -> Self {
        Self {
            store,
            cleanup_threshold,
            total_deleted_chunks: AtomicU64::new(0),
            total_freed_bytes: AtomicU64::new(0),
            run_lock: Mutex::new(()),
        }
    }

    pub fn current_storage_size(&self) -> StorageResult<u64> {
        Ok(self.store.storage_state()?.total_bytes)
    }

    pub fn total_deleted_chunks(&self) -> u64 {
        self.total_deleted_chunks.load(Ordering::Relaxed)
    }

    pub fn total_freed_bytes(&self) -> u64 {
        self.total_freed_bytes.load(Ordering::Relaxed)
    }

    pub fn cleanup_threshold(&self) -> f64 {
        self.cleanup_threshold
    }

    /// Delete oldest non-active chunks until usage is below
    /// `limit * cleanup_threshold`.
    ///
    /// Every triggered run appends one `STORAGE_CLEANUP` audit entry, even
    /// when it fails part way through.
    pub fn check_and_cleanup(&self) -> StorageResult<CleanupReport> {
        let _guard = self.run_lock.lock();

        let state = self.store.storage_state()?;
        let threshold_bytes = (state.limit_bytes as f64 * self.cleanup_threshold) as u64;
        let mut report = CleanupReport {
            bytes_before: state.total_bytes,
            bytes_after: state.total_bytes,
            threshold_bytes,
            limit_bytes: state.limit_bytes,
            ..CleanupReport::default()
        };
        if state.total_bytes < threshold_bytes {
            return Ok(report);
        }

        report.triggered = true;
        report.run_id = Uuid::new_v4();
        log::info!(
            "[REAPER] Usage {} bytes reached threshold {} bytes, evicting oldest chunks",
            state.total_bytes,
            threshold_bytes
        );

        let outcome = self.evict(&mut report);
        report.bytes_after = match self.store.storage_state() {
            Ok(state) => state.total_bytes,
            Err(_) => report.bytes_before.saturating_sub(report.freed_bytes),
        };

        self.total_deleted_chunks
            .fetch_add(report.deleted_chunks, Ordering::Relaxed);
        self.total_freed_bytes
            .fetch_add(report.freed_bytes, Ordering::Relaxed);

        self.audit_run(&report);
        outcome?;

        if report.incomplete {
            log::warn!(
                "[REAPER] Cleanup stopped at {} bytes (threshold {}): only active-session chunks remain",
                report.bytes_after,
                threshold_bytes
            );
        } else {
            log::info!(
                "[REAPER] Freed {} bytes in {} chunk(s), usage now {} bytes",
                report.freed_bytes,
                report.deleted_chunks,
                report.bytes_after
            );
        }
        Ok(report)
    }

    fn evict(&self, report: &mut CleanupReport) -> StorageResult<()> {
        let mut current = report.bytes_before;
        while current >= report.threshold_bytes {
            let candidates = self.store.oldest_evictable_chunks(EVICTION_BATCH_SIZE)?;
            if candidates.is_empty() {
                report.incomplete = true;
                return Ok(());
            }

            // Oldest first, and no more than needed to get below the threshold.
            let mut projected = current;
            let mut batch: Vec<ChunkRef> = Vec::with_capacity(candidates.len());
            for candidate in &candidates {
                if projected < report.threshold_bytes {
                    break;
                }
                projected = projected.saturating_sub(candidate.byte_length);
                batch.push(candidate.chunk);
            }

            let summary = self.store.delete_chunks(&batch)?;
            if summary.deleted_chunks == 0 {
                // Everything listed became part of the active session meanwhile.
                report.incomplete = true;
                return Ok(());
            }
            report.deleted_chunks += summary.deleted_chunks;
            report.freed_bytes += summary.freed_bytes;
            current = current.saturating_sub(summary.freed_bytes);
        }
        Ok(())
    }

    fn audit_run(&self, report: &CleanupReport) {
        let details = serde_json::json!({
            "run_id": report.run_id.to_string(),
            "deleted_chunks": report.deleted_chunks,
            "freed_bytes": report.freed_bytes,
            "threshold_bytes": report.threshold_bytes,
            "limit_bytes": report.limit_bytes,
        });
        let cleanup = AuditEvent::builder(AuditEventType::StorageCleanup)
            .old_value(report.bytes_before)
            .new_value(report.bytes_after)
            .json_details(details)
            .build();
        if let Err(e) = self.store.append_audit(&cleanup) {
            log::error!("[REAPER] Failed to write cleanup audit entry: {}", e);
        }

        if report.incomplete {
            let mut incomplete = AuditEvent::builder(AuditEventType::CleanupIncomplete)
                .old_value(report.bytes_before)
                .new_value(report.bytes_after)
                .json_details(serde_json::json!({
                    "run_id": report.run_id.to_string(),
                    "reason": "no evictable chunks outside the active session",
                    "threshold_bytes": report.threshold_bytes,
                }));
            if let Ok(Some(active)) = self.store.active_session() {
                incomplete = incomplete.session(active.id);
            }
            if let Err(e) = self.store.append_audit(&incomplete.build()) {
                log::error!("[REAPER] Failed to write incomplete-cleanup audit entry: {}", e);
            }
        }
    }
}
