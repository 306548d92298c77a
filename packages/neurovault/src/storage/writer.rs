// Chunk writer - turns accepted samples into persisted chunks
//
// The writer manages:
// - Per-modality accumulation of samples for the active session
// - Sealing and encoding chunks (full window, grid break, session change)
// - A lock-free hand-off queue between producers and the drain loop
// - The drain loop that persists chunks and triggers the capacity check
// - Write failure reporting (callback + audit log), without retries

use crate::codec;
use crate::config::StorageConfig;
use crate::db::audit::{AuditEvent, AuditEventType};
use crate::db::ChunkStore;
use crate::error::{StorageError, StorageResult};
use crate::lod::LodPyramid;
use crate::storage::reaper::StorageReaper;
use crate::types::{Modality, NewChunk, Sample};
use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Context handed to the write error callback.
#[derive(Debug)]
pub struct WriteFailure<'a> {
    pub modality: Modality,
    pub session_id: i64,
    pub start_time_us: i64,
    pub sample_count: u32,
    pub error: &'a StorageError,
}

type WriteErrorCallback = Box<dyn Fn(&WriteFailure<'_>) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStats {
    pub total_eeg_chunks_written: u64,
    pub total_nirs_chunks_written: u64,
    pub total_bytes_written: u64,
    pub failed_chunks: u64,
    pub pending_chunks: usize,
}

/// Outcome of draining the queue once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub persisted: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Accumulator {
    session_id: Option<i64>,
    samples: Vec<Sample>,
}

/// Values bound for one attached pyramid, placed on its time grid.
struct LodFeed {
    channel: usize,
    pyramid: Arc<LodPyramid>,
    next_index: usize,
    values: Vec<f32>,
}

impl LodFeed {
    fn new(channel: usize, pyramid: Arc<LodPyramid>) -> Self {
        let next_index = pyramid.total_samples();
        Self {
            channel,
            pyramid,
            next_index,
            values: Vec::new(),
        }
    }

    /// Slots skipped by a forward gap are padded with NaN. Samples before the
    /// origin or over already folded slots are left out.
    fn push(&mut self, sample: &Sample) {
        let Some(index) = self.pyramid.index_of(sample.timestamp_us) else {
            return;
        };
        if index < self.next_index {
            return;
        }
        self.values
            .extend(std::iter::repeat(f32::NAN).take(index - self.next_index));
        self.values
            .push(sample.channel(self.channel).unwrap_or(f32::NAN));
        self.next_index = index + 1;
    }
}

struct WriterShared {
    store: Arc<ChunkStore>,
    reaper: Arc<StorageReaper>,
    config: StorageConfig,
    queue: SegQueue<NewChunk>,
    eeg: Mutex<Accumulator>,
    nirs: Mutex<Accumulator>,
    active_session: RwLock<Option<i64>>,
    lod: RwLock<Vec<(usize, Arc<LodPyramid>)>>,
    error_callback: RwLock<Option<WriteErrorCallback>>,
    // Keeps inserts in arrival order when stop() and the drain loop overlap
    persist_lock: Mutex<()>,
    eeg_chunks_written: AtomicU64,
    nirs_chunks_written: AtomicU64,
    bytes_written: AtomicU64,
    failed_chunks: AtomicU64,
}

/// Buffers samples per modality and persists sealed chunks on a drain loop.
///
/// `accept_*` never touches the database: sealed chunks are pushed onto a
/// lock-free queue that the drain loop empties every `flush_interval_ms`.
pub struct ChunkWriter {
    shared: Arc<WriterShared>,
    cancel_token: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChunkWriter {
    pub fn new(store: Arc<ChunkStore>, reaper: Arc<StorageReaper>, config: StorageConfig) -> Self {
        Self {
            shared: Arc::new(WriterShared {
                store,
                reaper,
                config,
                queue: SegQueue::new(),
                eeg: Mutex::new(Accumulator::default()),
                nirs: Mutex::new(Accumulator::default()),
                active_session: RwLock::new(None),
                lod: RwLock::new(Vec::new()),
                error_callback: RwLock::new(None),
                persist_lock: Mutex::new(()),
                eeg_chunks_written: AtomicU64::new(0),
                nirs_chunks_written: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                failed_chunks: AtomicU64::new(0),
            }),
            cancel_token: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    /// Register the callback invoked for every chunk that fails to persist.
    pub fn on_write_error<F>(&self, callback: F)
    where
        F: Fn(&WriteFailure<'_>) + Send + Sync + 'static,
    {
        *self.shared.error_callback.write() = Some(Box::new(callback));
    }

    /// Feed EEG channel `channel` into `pyramid` as samples are accepted.
    pub fn attach_lod(&self, channel: usize, pyramid: Arc<LodPyramid>) {
        self.shared.lod.write().push((channel, pyramid));
    }

    /// Activate `session_id` in the store and route new samples to it.
    ///
    /// Samples buffered for the previous session are sealed first.
    pub fn set_active_session(&self, session_id: i64) -> StorageResult<()> {
        self.shared.store.activate_session(session_id)?;
        *self.shared.active_session.write() = Some(session_id);
        self.flush_remaining()?;
        log::info!("[WRITER] Writing to session {}", session_id);
        Ok(())
    }

    pub fn active_session(&self) -> Option<i64> {
        *self.shared.active_session.read()
    }

    pub fn accept_eeg_sample(&self, sample: Sample) -> StorageResult<()> {
        self.shared.accept(Modality::Eeg, std::iter::once(sample))
    }

    pub fn accept_eeg_batch<I>(&self, samples: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = Sample>,
    {
        self.shared.accept(Modality::Eeg, samples)
    }

    pub fn accept_nirs_sample(&self, sample: Sample) -> StorageResult<()> {
        self.shared.accept(Modality::Nirs, std::iter::once(sample))
    }

    pub fn accept_nirs_batch<I>(&self, samples: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = Sample>,
    {
        self.shared.accept(Modality::Nirs, samples)
    }

    /// Seal whatever is buffered for both modalities, even partial windows.
    pub fn flush_remaining(&self) -> StorageResult<()> {
        for modality in Modality::ALL {
            let mut acc = self.shared.accumulator(modality).lock();
            self.shared.seal(modality, &mut acc)?;
        }
        Ok(())
    }

    /// Persist every queued chunk on the calling thread.
    pub fn persist_pending(&self) -> PersistSummary {
        self.shared.persist_pending()
    }

    /// Spawn the drain loop on the current tokio runtime.
    pub fn start(&self) -> StorageResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StorageError::InvalidInput("ChunkWriter::start requires a tokio runtime".to_string())
        })?;

        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            log::warn!("[WRITER] Drain loop already running");
            return Ok(());
        }

        // Fresh token for this run
        let cancel_token = CancellationToken::new();
        *self.cancel_token.lock() = cancel_token.clone();

        let shared = Arc::clone(&self.shared);
        let flush_interval = self.shared.config.flush_interval();
        *task = Some(runtime.spawn(async move {
            let mut tick = interval(flush_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel_token.cancelled() => {
                        log::info!("[WRITER] Drain loop cancelled");
                        break;
                    }

                    _ = tick.tick() => {
                        if shared.queue.is_empty() {
                            continue;
                        }
                        let shared_clone = Arc::clone(&shared);
                        match tokio::task::spawn_blocking(move || shared_clone.persist_pending()).await {
                            Ok(summary) => {
                                log::debug!(
                                    "[WRITER] Flushed {} chunk(s), {} failed",
                                    summary.persisted,
                                    summary.failed
                                );
                            }
                            Err(e) => log::error!("[WRITER] Persist task panicked: {}", e),
                        }
                    }
                }
            }
        }));

        log::info!(
            "[WRITER] Drain loop started (flush every {}ms)",
            self.shared.config.flush_interval_ms
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the drain loop, seal partial buffers and persist everything that
    /// was accepted, bounded by `stop_timeout_ms`.
    ///
    /// Returns the number of chunks persisted during shutdown.
    pub async fn stop(&self) -> StorageResult<usize> {
        self.cancel_token.lock().cancel();
        let handle = self.task.lock().take();
        let timeout = self.shared.config.stop_timeout();

        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                log::warn!("[WRITER] Drain loop did not finish within {:?}", timeout);
            }
        }

        self.flush_remaining()?;

        let shared = Arc::clone(&self.shared);
        let drained = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || shared.persist_pending()),
        )
        .await;

        match drained {
            Ok(Ok(summary)) => {
                log::info!(
                    "[WRITER] Stopped; persisted {} pending chunk(s), {} failed",
                    summary.persisted,
                    summary.failed
                );
                Ok(summary.persisted)
            }
            Ok(Err(e)) => {
                log::error!("[WRITER] Final flush panicked: {}", e);
                Err(StorageError::ShutdownTimeout(self.shared.queue.len()))
            }
            Err(_) => {
                let pending = self.shared.queue.len();
                log::error!(
                    "[WRITER] Final flush exceeded {:?} with {} chunk(s) pending",
                    timeout,
                    pending
                );
                Err(StorageError::ShutdownTimeout(pending))
            }
        }
    }

    pub fn total_eeg_chunks_written(&self) -> u64 {
        self.shared.eeg_chunks_written.load(Ordering::Relaxed)
    }

    pub fn total_nirs_chunks_written(&self) -> u64 {
        self.shared.nirs_chunks_written.load(Ordering::Relaxed)
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Relaxed)
    }

    pub fn pending_chunks(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            total_eeg_chunks_written: self.total_eeg_chunks_written(),
            total_nirs_chunks_written: self.total_nirs_chunks_written(),
            total_bytes_written: self.total_bytes_written(),
            failed_chunks: self.shared.failed_chunks.load(Ordering::Relaxed),
            pending_chunks: self.pending_chunks(),
        }
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        self.cancel_token.lock().cancel();
    }
}

impl WriterShared {
    fn accumulator(&self, modality: Modality) -> &Mutex<Accumulator> {
        match modality {
            Modality::Eeg => &self.eeg,
            Modality::Nirs => &self.nirs,
        }
    }

    fn accept<I>(&self, modality: Modality, samples: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = Sample>,
    {
        let session_id = (*self.active_session.read()).ok_or(StorageError::NoActiveSession)?;

        let mut acc = self.accumulator(modality).lock();
        if acc.session_id != Some(session_id) {
            self.seal(modality, &mut acc)?;
            acc.session_id = Some(session_id);
        }

        // Pyramid positions are read under the accumulator lock.
        let mut feeds: Vec<LodFeed> = if modality == Modality::Eeg {
            self.lod
                .read()
                .iter()
                .map(|(channel, pyramid)| LodFeed::new(*channel, Arc::clone(pyramid)))
                .collect()
        } else {
            Vec::new()
        };

        let result = self.buffer_samples(modality, &mut acc, samples, &mut feeds);

        // Samples buffered before a rejected one still reach the pyramids.
        for feed in &feeds {
            feed.pyramid.add_samples(&feed.values);
        }
        drop(acc);
        result
    }

    fn buffer_samples<I>(
        &self,
        modality: Modality,
        acc: &mut Accumulator,
        samples: I,
        feeds: &mut [LodFeed],
    ) -> StorageResult<()>
    where
        I: IntoIterator<Item = Sample>,
    {
        let params = *self.config.stream(modality);
        let chunk_len = self.config.samples_per_chunk(modality);
        let half_period = params.sample_period_us() / 2.0;

        for sample in samples {
            if sample.values.len() != params.channel_count {
                return Err(StorageError::InvalidInput(format!(
                    "{} sample has {} values, expected {}",
                    modality,
                    sample.values.len(),
                    params.channel_count
                )));
            }

            if let Some(first) = acc.samples.first() {
                let expected =
                    codec::sample_timestamp_us(first.timestamp_us, acc.samples.len(), params.sample_rate);
                if ((sample.timestamp_us - expected) as f64).abs() > half_period {
                    log::debug!(
                        "[WRITER] {} grid break at {}us (expected {}us), sealing early",
                        modality,
                        sample.timestamp_us,
                        expected
                    );
                    self.seal(modality, acc)?;
                }
            }

            for feed in feeds.iter_mut() {
                feed.push(&sample);
            }

            acc.samples.push(sample);
            if acc.samples.len() >= chunk_len {
                self.seal(modality, acc)?;
            }
        }
        Ok(())
    }

    /// Encode the buffered samples and queue them as one chunk.
    fn seal(&self, modality: Modality, acc: &mut Accumulator) -> StorageResult<()> {
        let Some(session_id) = acc.session_id else {
            acc.samples.clear();
            return Ok(());
        };
        if acc.samples.is_empty() {
            return Ok(());
        }

        let samples = std::mem::take(&mut acc.samples);
        let params = self.config.stream(modality);
        let encoded = match codec::encode(
            &samples,
            params.channel_count,
            params.sample_rate,
            params.scale_factor,
        ) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.report_failure(
                    modality,
                    session_id,
                    samples[0].timestamp_us,
                    samples.len() as u32,
                    &e,
                );
                return Err(e);
            }
        };

        let (start_time_us, end_time_us) = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => (first.timestamp_us, last.timestamp_us),
            _ => return Ok(()),
        };

        self.queue.push(NewChunk {
            modality,
            session_id,
            start_time_us,
            end_time_us,
            sample_count: encoded.sample_count,
            channel_count: params.channel_count as u8,
            encoding_version: encoded.version,
            quality_summary: encoded.quality_summary,
            blob: encoded.blob,
        });
        Ok(())
    }

    fn persist_pending(&self) -> PersistSummary {
        let _order = self.persist_lock.lock();
        let mut summary = PersistSummary::default();

        while let Some(chunk) = self.queue.pop() {
            match self.store.insert_chunk(&chunk) {
                Ok(meta) => {
                    summary.persisted += 1;
                    let counter = match meta.modality {
                        Modality::Eeg => &self.eeg_chunks_written,
                        Modality::Nirs => &self.nirs_chunks_written,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    self.bytes_written
                        .fetch_add(meta.byte_length, Ordering::Relaxed);
                    self.check_capacity();
                }
                Err(e) => {
                    summary.failed += 1;
                    self.report_failure(
                        chunk.modality,
                        chunk.session_id,
                        chunk.start_time_us,
                        chunk.sample_count,
                        &e,
                    );
                }
            }
        }
        summary
    }

    fn check_capacity(&self) {
        match self.reaper.check_and_cleanup() {
            Ok(report) if report.triggered && report.over_limit() => {
                let err = StorageError::CapacityExceeded {
                    used: report.bytes_after,
                    limit: report.limit_bytes,
                };
                log::error!("[WRITER] {}; continuing to write the active session", err);
            }
            Ok(_) => {}
            Err(e) => log::warn!("[WRITER] Capacity check failed, retrying next cycle: {}", e),
        }
    }

    fn report_failure(
        &self,
        modality: Modality,
        session_id: i64,
        start_time_us: i64,
        sample_count: u32,
        error: &StorageError,
    ) {
        self.failed_chunks.fetch_add(1, Ordering::Relaxed);
        log::error!(
            "[WRITER] Failed to write {} chunk at {}us for session {}: {}",
            modality,
            start_time_us,
            session_id,
            error
        );

        if let Some(callback) = self.error_callback.read().as_ref() {
            callback(&WriteFailure {
                modality,
                session_id,
                start_time_us,
                sample_count,
                error,
            });
        }

        let event = AuditEvent::builder(AuditEventType::ChunkWriteFailed)
            .session(session_id)
            .json_details(serde_json::json!({
                "modality": modality.as_str(),
                "start_time_us": start_time_us,
                "sample_count": sample_count,
                "error": error.to_string(),
            }))
            .build();
        if let Err(e) = self.store.append_audit(&event) {
            log::warn!("[WRITER] Could not audit write failure: {}", e);
        }
    }
}
