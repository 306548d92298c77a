//! Video sidecar index: maps captured frames to host timestamps.
//!
//! Layout (little-endian):
//!
//! ```text
//! header  16 bytes  magic "NVVX" | version: i32 = 1 | entry_size: i32 = 20 | reserved: i32
//! entry   20 bytes  timestamp_us: i64 | presentation_time_100ns: i64 | frame_index: i32
//! ```
//!
//! Entries are ordered by `timestamp_us`.

use crate::playback::types::{PlaybackError, PlaybackResult};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const INDEX_MAGIC: &[u8; 4] = b"NVVX";
pub const INDEX_VERSION: i32 = 1;
pub const INDEX_HEADER_LEN: usize = 16;
pub const INDEX_ENTRY_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoIndexEntry {
    pub timestamp_us: i64,
    pub presentation_time_100ns: i64,
    pub frame_index: i32,
}

impl VideoIndexEntry {
    fn to_bytes(self) -> [u8; INDEX_ENTRY_LEN] {
        let mut out = [0u8; INDEX_ENTRY_LEN];
        out[0..8].copy_from_slice(&self.timestamp_us.to_le_bytes());
        out[8..16].copy_from_slice(&self.presentation_time_100ns.to_le_bytes());
        out[16..20].copy_from_slice(&self.frame_index.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut ts = [0u8; 8];
        let mut pts = [0u8; 8];
        let mut frame = [0u8; 4];
        ts.copy_from_slice(&bytes[0..8]);
        pts.copy_from_slice(&bytes[8..16]);
        frame.copy_from_slice(&bytes[16..20]);
        Self {
            timestamp_us: i64::from_le_bytes(ts),
            presentation_time_100ns: i64::from_le_bytes(pts),
            frame_index: i32::from_le_bytes(frame),
        }
    }
}

/// Memory-mapped, read-only view of a sidecar index.
pub struct VideoIndex {
    path: PathBuf,
    mmap: Mmap,
    len: usize,
    /// Frame indices strictly increase, so lookups by frame can bisect
    frames_sorted: bool,
}

impl std::fmt::Debug for VideoIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoIndex")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("frames_sorted", &self.frames_sorted)
            .finish()
    }
}

impl VideoIndex {
    pub fn open<P: AsRef<Path>>(path: P) -> PlaybackResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            PlaybackError::IndexUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < INDEX_HEADER_LEN {
            return Err(PlaybackError::InvalidIndex(format!(
                "{} bytes is shorter than the {}-byte header",
                mmap.len(),
                INDEX_HEADER_LEN
            )));
        }
        if &mmap[0..4] != INDEX_MAGIC {
            return Err(PlaybackError::InvalidIndex("bad magic".to_string()));
        }
        let version = read_i32(&mmap[4..8]);
        if version != INDEX_VERSION {
            return Err(PlaybackError::InvalidIndex(format!(
                "unsupported version {}",
                version
            )));
        }
        let entry_size = read_i32(&mmap[8..12]);
        if entry_size != INDEX_ENTRY_LEN as i32 {
            return Err(PlaybackError::InvalidIndex(format!(
                "entry size {} (expected {})",
                entry_size, INDEX_ENTRY_LEN
            )));
        }
        let payload = mmap.len() - INDEX_HEADER_LEN;
        if payload % INDEX_ENTRY_LEN != 0 {
            return Err(PlaybackError::InvalidIndex(format!(
                "payload of {} bytes is not a whole number of entries",
                payload
            )));
        }

        let mut index = Self {
            path,
            mmap,
            len: payload / INDEX_ENTRY_LEN,
            frames_sorted: false,
        };
        index.frames_sorted = (1..index.len)
            .all(|i| index.entry_unchecked(i - 1).frame_index < index.entry_unchecked(i).frame_index);

        log::debug!(
            "[PLAYBACK] Opened video index {} ({} frames)",
            index.path.display(),
            index.len
        );
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn entry_unchecked(&self, i: usize) -> VideoIndexEntry {
        let start = INDEX_HEADER_LEN + i * INDEX_ENTRY_LEN;
        VideoIndexEntry::from_bytes(&self.mmap[start..start + INDEX_ENTRY_LEN])
    }

    pub fn entry(&self, i: usize) -> Option<VideoIndexEntry> {
        (i < self.len).then(|| self.entry_unchecked(i))
    }

    /// Position of the first entry with `timestamp_us >= ts`.
    pub fn lower_bound(&self, timestamp_us: i64) -> usize {
        let (mut lo, mut hi) = (0, self.len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry_unchecked(mid).timestamp_us < timestamp_us {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Position of the entry for `frame_index`, if indexed.
    pub fn find_frame(&self, frame_index: i32) -> Option<usize> {
        if self.frames_sorted {
            let (mut lo, mut hi) = (0, self.len);
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                let frame = self.entry_unchecked(mid).frame_index;
                if frame == frame_index {
                    return Some(mid);
                }
                if frame < frame_index {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            None
        } else {
            (0..self.len).find(|&i| self.entry_unchecked(i).frame_index == frame_index)
        }
    }

    /// Closest entry to `presentation_time_100ns` within `tolerance_100ns`,
    /// scanning at most `max_scan` entries either side of `hint`.
    pub fn find_by_presentation_time(
        &self,
        presentation_time_100ns: i64,
        tolerance_100ns: i64,
        hint: usize,
        max_scan: usize,
    ) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let hint = hint.min(self.len - 1);
        let from = hint.saturating_sub(max_scan);
        let to = (hint + max_scan + 1).min(self.len);

        (from..to)
            .map(|i| {
                let delta = (self.entry_unchecked(i).presentation_time_100ns
                    - presentation_time_100ns)
                    .abs();
                (delta, i)
            })
            .filter(|(delta, _)| *delta <= tolerance_100ns)
            .min()
            .map(|(_, i)| i)
    }

    pub fn entries(&self) -> impl Iterator<Item = VideoIndexEntry> + '_ {
        (0..self.len).map(|i| self.entry_unchecked(i))
    }
}

/// Appends entries to a new sidecar file.
pub struct VideoIndexWriter {
    out: BufWriter<File>,
    last_timestamp_us: Option<i64>,
    written: usize,
}

impl VideoIndexWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> PlaybackResult<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(INDEX_MAGIC)?;
        out.write_all(&INDEX_VERSION.to_le_bytes())?;
        out.write_all(&(INDEX_ENTRY_LEN as i32).to_le_bytes())?;
        out.write_all(&0i32.to_le_bytes())?;
        Ok(Self {
            out,
            last_timestamp_us: None,
            written: 0,
        })
    }

    pub fn append(&mut self, entry: VideoIndexEntry) -> PlaybackResult<()> {
        if let Some(last) = self.last_timestamp_us {
            if entry.timestamp_us < last {
                return Err(PlaybackError::InvalidIndex(format!(
                    "entry at {}us precedes previous entry at {}us",
                    entry.timestamp_us, last
                )));
            }
        }
        self.out.write_all(&entry.to_bytes())?;
        self.last_timestamp_us = Some(entry.timestamp_us);
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush and close the file, returning the number of entries written.
    pub fn finish(mut self) -> PlaybackResult<usize> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.written)
    }
}

fn read_i32(bytes: &[u8]) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    i32::from_le_bytes(raw)
}
