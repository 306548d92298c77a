//! Multi-resolution min/max pyramid for one channel.
//!
//! Level 0 holds one entry per base sample. Each entry at level `L` folds two
//! adjacent entries of level `L - 1`, so it covers `2^L` base samples and keeps
//! their exact minimum and maximum. Range queries copy a contiguous slice of
//! one level, which makes them proportional to the result size only.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Default number of levels above the base level.
///
/// 2^24 base samples per entry covers more than 24 hours at 160 Hz.
pub const DEFAULT_MAX_LEVEL: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMaxPair {
    pub min: f32,
    pub max: f32,
}

impl MinMaxPair {
    pub fn from_value(value: f32) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    /// NaN never wins against a real value, so missing samples cannot hide
    /// a spike. Only an all-NaN range folds to NaN.
    pub fn merge(self, other: MinMaxPair) -> MinMaxPair {
        MinMaxPair {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

pub struct LodPyramid {
    base_interval_us: f64,
    origin_us: i64,
    max_level: usize,
    levels: RwLock<Vec<Vec<MinMaxPair>>>,
}

impl std::fmt::Debug for LodPyramid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LodPyramid")
            .field("base_interval_us", &self.base_interval_us)
            .field("origin_us", &self.origin_us)
            .field("max_level", &self.max_level)
            .field("total_samples", &self.total_samples())
            .finish()
    }
}

impl LodPyramid {
    /// `base_interval_us` is the sample period; `origin_us` the timestamp of
    /// the first base sample.
    pub fn new(base_interval_us: f64, origin_us: i64) -> Self {
        Self::with_max_level(base_interval_us, origin_us, DEFAULT_MAX_LEVEL)
    }

    pub fn with_max_level(base_interval_us: f64, origin_us: i64, max_level: usize) -> Self {
        let base_interval_us = if base_interval_us.is_finite() && base_interval_us > 0.0 {
            base_interval_us
        } else {
            log::warn!(
                "[LOD] Invalid base interval {}us, falling back to 1us",
                base_interval_us
            );
            1.0
        };
        Self {
            base_interval_us,
            origin_us,
            max_level,
            levels: RwLock::new(vec![Vec::new(); max_level + 1]),
        }
    }

    /// Pyramid for a stream sampled at `sample_rate` Hz.
    pub fn for_sample_rate(sample_rate: f64, origin_us: i64) -> Self {
        Self::new(1_000_000.0 / sample_rate, origin_us)
    }

    pub fn base_interval_us(&self) -> f64 {
        self.base_interval_us
    }

    pub fn origin_us(&self) -> i64 {
        self.origin_us
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    pub fn total_samples(&self) -> usize {
        self.levels.read()[0].len()
    }

    /// Number of entries at `level`, `ceil(total_samples / 2^level)`.
    pub fn level_count(&self, level: usize) -> usize {
        self.levels.read().get(level).map(Vec::len).unwrap_or(0)
    }

    /// Append base samples and fold them into every level.
    ///
    /// Only entries at or after the first touched index are recomputed, and
    /// each entry is always the fold of its two children, so the result does
    /// not depend on how samples are split across calls.
    pub fn add_samples(&self, values: &[f32]) {
        if values.is_empty() {
            return;
        }
        let mut levels = self.levels.write();
        let mut dirty = levels[0].len();
        levels[0].extend(values.iter().map(|&v| MinMaxPair::from_value(v)));

        for level in 1..=self.max_level {
            let (lower, upper) = levels.split_at_mut(level);
            let below = &lower[level - 1];
            let current = &mut upper[0];

            let first = dirty / 2;
            let needed = below.len().div_ceil(2);
            current.truncate(first);
            for i in first..needed {
                let left = below[2 * i];
                let entry = match below.get(2 * i + 1) {
                    Some(&right) => left.merge(right),
                    None => left,
                };
                current.push(entry);
            }
            dirty = first;
        }
    }

    /// Width of one entry at `level`, in microseconds.
    pub fn entry_duration_us(&self, level: usize) -> f64 {
        self.base_interval_us * (1u64 << level.min(63)) as f64
    }

    /// Start timestamp of entry `index` at `level`.
    pub fn entry_start_us(&self, level: usize, index: usize) -> i64 {
        self.origin_us + (index as f64 * self.entry_duration_us(level)).round() as i64
    }

    /// Base sample slot of `timestamp_us`, `None` before the origin.
    pub fn index_of(&self, timestamp_us: i64) -> Option<usize> {
        let offset = timestamp_us as i128 - self.origin_us as i128;
        if offset < 0 {
            return None;
        }
        Some((offset as f64 / self.base_interval_us).round() as usize)
    }

    /// Copy the entries of `level` whose covered interval intersects
    /// `[start_us, end_us)` into `dest`, replacing its contents.
    ///
    /// Returns the number of entries copied.
    pub fn get_level(
        &self,
        level: usize,
        start_us: i64,
        end_us: i64,
        dest: &mut Vec<MinMaxPair>,
    ) -> usize {
        dest.clear();
        if end_us <= start_us {
            return 0;
        }
        let levels = self.levels.read();
        let Some(entries) = levels.get(level) else {
            return 0;
        };

        let width = self.entry_duration_us(level);
        // i128 keeps full-range bounds from overflowing; the float casts saturate.
        let first = ((start_us as i128 - self.origin_us as i128) as f64 / width)
            .floor()
            .max(0.0) as usize;
        let end = ((end_us as i128 - self.origin_us as i128) as f64 / width)
            .ceil()
            .max(0.0) as usize;
        let end = end.min(entries.len());
        if first >= end {
            return 0;
        }

        dest.extend_from_slice(&entries[first..end]);
        end - first
    }

    /// Finest level whose entry count over `view_duration_us` fits in
    /// `viewport_pixels`, so no more points are produced than can be drawn.
    pub fn select_level(&self, view_duration_us: i64, viewport_pixels: usize) -> usize {
        if viewport_pixels == 0 {
            return self.max_level;
        }
        let samples_in_view = (view_duration_us.max(0) as f64 / self.base_interval_us).ceil();
        let mut level = 0;
        while level < self.max_level {
            let entries = (samples_in_view / (1u64 << level) as f64).ceil();
            if entries <= viewport_pixels as f64 {
                break;
            }
            level += 1;
        }
        level
    }
}
