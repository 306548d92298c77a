use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign, Sub};

/// Per-sample quality annotation. An empty set means the sample is normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityFlags(u8);

impl QualityFlags {
    pub const NORMAL: QualityFlags = QualityFlags(0);
    pub const MISSING: QualityFlags = QualityFlags(1 << 0);
    pub const SATURATED: QualityFlags = QualityFlags(1 << 1);
    pub const LEAD_OFF: QualityFlags = QualityFlags(1 << 2);
    pub const INTERPOLATED: QualityFlags = QualityFlags(1 << 3);
    pub const UNDOCUMENTED: QualityFlags = QualityFlags(1 << 4);
    pub const TRANSIENT: QualityFlags = QualityFlags(1 << 5);
    /// Suppressed by the acquisition device
    pub const BLOCKED: QualityFlags = QualityFlags(1 << 6);

    const KNOWN: u8 = 0x7F;

    pub const fn empty() -> Self {
        QualityFlags(0)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Unknown bits are discarded.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        QualityFlags(bits & Self::KNOWN)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, other: QualityFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_normal(&self) -> bool {
        self.is_empty()
    }

    /// Values flagged with anything other than `INTERPOLATED` must not be
    /// treated as measurements.
    pub fn is_trustworthy(&self) -> bool {
        (*self - QualityFlags::INTERPOLATED).is_empty()
    }
}

impl BitOr for QualityFlags {
    type Output = QualityFlags;

    fn bitor(self, rhs: QualityFlags) -> QualityFlags {
        QualityFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for QualityFlags {
    fn bitor_assign(&mut self, rhs: QualityFlags) {
        self.0 |= rhs.0;
    }
}

impl Sub for QualityFlags {
    type Output = QualityFlags;

    fn sub(self, rhs: QualityFlags) -> QualityFlags {
        QualityFlags(self.0 & !rhs.0)
    }
}

/// Which persisted stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Eeg,
    Nirs,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Eeg, Modality::Nirs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Eeg => "eeg",
            Modality::Nirs => "nirs",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Modality::Eeg => "eeg_chunks",
            Modality::Nirs => "nirs_chunks",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "eeg" => Some(Modality::Eeg),
            "nirs" => Some(Modality::Nirs),
            _ => None,
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single multi-channel reading in physical units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Host monotonic clock, microseconds
    pub timestamp_us: i64,
    pub values: Vec<f32>,
    #[serde(default)]
    pub quality: QualityFlags,
}

impl Sample {
    pub fn new(timestamp_us: i64, values: Vec<f32>) -> Self {
        Self {
            timestamp_us,
            values,
            quality: QualityFlags::NORMAL,
        }
    }

    pub fn with_quality(mut self, quality: QualityFlags) -> Self {
        self.quality = quality;
        self
    }

    /// Explicit marker for a slot where no data exists.
    pub fn missing(timestamp_us: i64, channel_count: usize) -> Self {
        Self {
            timestamp_us,
            values: vec![f32::NAN; channel_count],
            quality: QualityFlags::MISSING,
        }
    }

    pub fn channel(&self, index: usize) -> Option<f32> {
        self.values.get(index).copied()
    }

    pub fn channel_count(&self) -> usize {
        self.values.len()
    }
}

/// Row metadata for a persisted chunk (everything but the blob).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub id: i64,
    pub modality: Modality,
    pub session_id: i64,
    pub start_time_us: i64,
    pub end_time_us: i64,
    pub sample_count: u32,
    pub channel_count: u8,
    pub encoding_version: u8,
    pub quality_summary: QualityFlags,
    pub byte_length: u64,
}

/// A sealed chunk waiting to be inserted.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub modality: Modality,
    pub session_id: i64,
    pub start_time_us: i64,
    pub end_time_us: i64,
    pub sample_count: u32,
    pub channel_count: u8,
    pub encoding_version: u8,
    pub quality_summary: QualityFlags,
    pub blob: Vec<u8>,
}

impl NewChunk {
    pub fn byte_length(&self) -> u64 {
        self.blob.len() as u64
    }
}

/// Identifies a chunk row across both chunk tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRef {
    pub modality: Modality,
    pub id: i64,
}

/// Reaper candidate: enough to order, delete and account for a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionCandidate {
    pub chunk: ChunkRef,
    pub session_id: i64,
    pub start_time_us: i64,
    pub byte_length: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: i64,
    pub patient_id: String,
    pub created_at_us: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub patient_id: i64,
    pub start_time_us: i64,
    pub is_active: bool,
}

/// Aggregate byte accounting, kept in the same transaction as chunk changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageState {
    pub total_bytes: u64,
    pub eeg_chunk_count: u64,
    pub nirs_chunk_count: u64,
    pub limit_bytes: u64,
}

impl StorageState {
    pub fn chunk_count(&self) -> u64 {
        self.eeg_chunk_count + self.nirs_chunk_count
    }

    pub fn usage_fraction(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.total_bytes as f64 / self.limit_bytes as f64
    }
}

/// Current host time in microseconds, used for audit and creation stamps.
pub fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
