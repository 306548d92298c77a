// Timestamp-keyed sample buffer for playback
//
// Bounded, ordered by timestamp, drops the oldest samples when full. Readers
// take the read lock for a single query; nothing is held across calls.

use crate::db::ChunkStore;
use crate::error::StorageResult;
use crate::types::{Modality, Sample};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Metrics for buffer monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BufferMetrics {
    pub total_pushed: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub peak_size: usize,
    pub capacity: usize,
}

pub struct SampleRingBuffer {
    samples: RwLock<VecDeque<Sample>>,
    capacity: usize,

    total_pushed: AtomicU64,
    total_dropped: AtomicU64,
    peak_size: AtomicUsize,
}

impl SampleRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            total_pushed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            peak_size: AtomicUsize::new(0),
        }
    }

    /// Insert a sample at its timestamp position. A sample with the same
    /// timestamp as an existing one replaces it.
    pub fn push(&self, sample: Sample) {
        let mut samples = self.samples.write();
        self.insert_locked(&mut samples, sample);
    }

    pub fn extend<I: IntoIterator<Item = Sample>>(&self, iter: I) {
        let mut samples = self.samples.write();
        for sample in iter {
            self.insert_locked(&mut samples, sample);
        }
    }

    fn insert_locked(&self, samples: &mut VecDeque<Sample>, sample: Sample) {
        let ts = sample.timestamp_us;
        match samples.back() {
            Some(last) if last.timestamp_us < ts => samples.push_back(sample),
            None => samples.push_back(sample),
            Some(_) => {
                let pos = samples.partition_point(|s| s.timestamp_us < ts);
                if samples.get(pos).is_some_and(|s| s.timestamp_us == ts) {
                    samples[pos] = sample;
                } else {
                    samples.insert(pos, sample);
                }
            }
        }
        self.total_pushed.fetch_add(1, Ordering::Relaxed);

        while samples.len() > self.capacity {
            samples.pop_front();
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.peak_size.fetch_max(samples.len(), Ordering::Relaxed);
    }

    /// Samples with `start_us <= timestamp < end_us`, in order.
    pub fn range(&self, start_us: i64, end_us: i64) -> Vec<Sample> {
        if end_us <= start_us {
            return Vec::new();
        }
        let samples = self.samples.read();
        let from = samples.partition_point(|s| s.timestamp_us < start_us);
        let to = samples.partition_point(|s| s.timestamp_us < end_us);
        samples.range(from..to).cloned().collect()
    }

    pub fn first_at_or_after(&self, timestamp_us: i64) -> Option<Sample> {
        let samples = self.samples.read();
        let pos = samples.partition_point(|s| s.timestamp_us < timestamp_us);
        samples.get(pos).cloned()
    }

    pub fn last_before(&self, timestamp_us: i64) -> Option<Sample> {
        let samples = self.samples.read();
        let pos = samples.partition_point(|s| s.timestamp_us < timestamp_us);
        pos.checked_sub(1).and_then(|i| samples.get(i).cloned())
    }

    pub fn first_timestamp_us(&self) -> Option<i64> {
        self.samples.read().front().map(|s| s.timestamp_us)
    }

    pub fn last_timestamp_us(&self) -> Option<i64> {
        self.samples.read().back().map(|s| s.timestamp_us)
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.samples.write().clear();
    }

    pub fn metrics(&self) -> BufferMetrics {
        BufferMetrics {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_size: self.len(),
            peak_size: self.peak_size.load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }

    /// Fill the buffer with persisted samples of `[start_us, end_us)`.
    ///
    /// Returns the number of samples loaded.
    pub fn load_session_range(
        &self,
        store: &ChunkStore,
        modality: Modality,
        session_id: i64,
        start_us: i64,
        end_us: i64,
    ) -> StorageResult<usize> {
        let samples = store.read_time_range(modality, session_id, start_us, end_us)?;
        let count = samples.len();
        self.extend(samples);
        log::debug!(
            "[PLAYBACK] Loaded {} {} sample(s) of session {} into ring buffer",
            count,
            modality,
            session_id
        );
        Ok(count)
    }
}
