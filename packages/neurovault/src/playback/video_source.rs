// Video replay against the sidecar index
//
// Decoded frames come from an external `FrameProvider`. Every frame is given
// its host timestamp from the index: exact frame-index hit first, then a
// bounded scan by presentation time around the last resolved position.
// Frames that resolve to nothing are dropped and counted.

use crate::playback::source::PlaybackSource;
use crate::playback::types::{PlaybackResult, SourceKind, SourceState};
use crate::playback::video_index::VideoIndex;
use serde::{Deserialize, Serialize};

/// Presentation times within 1 ms are treated as the same frame
pub const DEFAULT_PTS_TOLERANCE_100NS: i64 = 10_000;
/// Entries scanned either side of the last resolved position
pub const DEFAULT_MAX_SCAN: usize = 64;

/// A decoded frame as produced by the capture/decoder layer
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub frame_index: i32,
    pub presentation_time_100ns: i64,
    pub data: Vec<u8>,
}

/// A frame with its recovered host timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct TimedFrame {
    pub timestamp_us: i64,
    pub frame: VideoFrame,
}

pub trait FrameProvider: Send {
    /// Position the decoder so the next frame returned is `frame_index`
    fn seek_to_frame(&mut self, frame_index: i32) -> PlaybackResult<()>;

    /// Next decoded frame, `None` at end of file
    fn next_frame(&mut self) -> PlaybackResult<Option<VideoFrame>>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoSourceStats {
    pub emitted: u64,
    pub dropped_unresolved: u64,
    pub provider_errors: u64,
}

type FrameCallback = Box<dyn FnMut(&TimedFrame) + Send>;

pub struct VideoPlaybackSource {
    id: String,
    index: VideoIndex,
    provider: Box<dyn FrameProvider>,
    state: SourceState,
    cursor_us: Option<i64>,
    /// Index position of the most recently resolved frame
    hint: usize,
    pending: Option<TimedFrame>,
    end_of_stream: bool,
    last_emitted_us: Option<i64>,
    pts_tolerance_100ns: i64,
    max_scan: usize,
    on_frame: Option<FrameCallback>,
    stats: VideoSourceStats,
}

impl VideoPlaybackSource {
    pub fn new(id: impl Into<String>, index: VideoIndex, provider: Box<dyn FrameProvider>) -> Self {
        Self {
            id: id.into(),
            index,
            provider,
            state: SourceState::Idle,
            cursor_us: None,
            hint: 0,
            pending: None,
            end_of_stream: false,
            last_emitted_us: None,
            pts_tolerance_100ns: DEFAULT_PTS_TOLERANCE_100NS,
            max_scan: DEFAULT_MAX_SCAN,
            on_frame: None,
            stats: VideoSourceStats::default(),
        }
    }

    pub fn with_pts_lookup(mut self, tolerance_100ns: i64, max_scan: usize) -> Self {
        self.pts_tolerance_100ns = tolerance_100ns.max(0);
        self.max_scan = max_scan;
        self
    }

    pub fn on_frame<F>(&mut self, callback: F)
    where
        F: FnMut(&TimedFrame) + Send + 'static,
    {
        self.on_frame = Some(Box::new(callback));
    }

    pub fn stats(&self) -> VideoSourceStats {
        self.stats
    }

    pub fn index(&self) -> &VideoIndex {
        &self.index
    }

    /// Host timestamp and index position for a decoded frame.
    fn resolve(&self, frame: &VideoFrame) -> Option<(i64, usize)> {
        let position = self.index.find_frame(frame.frame_index).or_else(|| {
            self.index.find_by_presentation_time(
                frame.presentation_time_100ns,
                self.pts_tolerance_100ns,
                self.hint,
                self.max_scan,
            )
        })?;
        let entry = self.index.entry(position)?;
        Some((entry.timestamp_us, position))
    }

    /// Pull frames until one resolves, the stream ends or the provider fails.
    fn next_resolved(&mut self) -> Option<TimedFrame> {
        loop {
            let frame = match self.provider.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.end_of_stream = true;
                    return None;
                }
                Err(e) => {
                    self.stats.provider_errors += 1;
                    log::warn!("[PLAYBACK] Video source '{}' provider error: {}", self.id, e);
                    return None;
                }
            };

            match self.resolve(&frame) {
                Some((timestamp_us, position)) => {
                    self.hint = position;
                    return Some(TimedFrame { timestamp_us, frame });
                }
                None => {
                    self.stats.dropped_unresolved += 1;
                    log::debug!(
                        "[PLAYBACK] Video source '{}' dropped frame {} (pts {}): no index entry",
                        self.id,
                        frame.frame_index,
                        frame.presentation_time_100ns
                    );
                }
            }
        }
    }

    fn reposition(&mut self, position_us: i64) -> bool {
        self.pending = None;
        self.end_of_stream = false;
        self.last_emitted_us = None;

        let target = self.index.lower_bound(position_us);
        match self.index.entry(target) {
            Some(entry) => {
                if let Err(e) = self.provider.seek_to_frame(entry.frame_index) {
                    self.stats.provider_errors += 1;
                    log::warn!(
                        "[PLAYBACK] Video source '{}' failed to seek to frame {}: {}",
                        self.id,
                        entry.frame_index,
                        e
                    );
                    return false;
                }
                self.hint = target;
            }
            None => {
                // Past the last indexed frame.
                self.end_of_stream = true;
                self.hint = self.index.len().saturating_sub(1);
            }
        }
        self.cursor_us = Some(position_us);
        true
    }
}

impl PlaybackSource for VideoPlaybackSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Video
    }

    fn start(&mut self) {
        if self.state != SourceState::Stopped {
            self.state = SourceState::Running;
        }
    }

    fn pause(&mut self) {
        if self.state == SourceState::Running {
            self.state = SourceState::Paused;
        }
    }

    fn stop(&mut self) {
        self.state = SourceState::Stopped;
        self.pending = None;
        self.cursor_us = None;
    }

    fn notify_seek(&mut self, position_us: i64) -> bool {
        self.reposition(position_us)
    }

    fn advance(&mut self, clock_us: i64) -> usize {
        if self.state != SourceState::Running {
            return 0;
        }
        let cursor = match self.cursor_us {
            Some(cursor) => cursor,
            None => {
                self.reposition(clock_us);
                return 0;
            }
        };
        if clock_us <= cursor {
            return 0;
        }

        let mut emitted = 0;
        loop {
            let frame = match self.pending.take() {
                Some(frame) => frame,
                None if self.end_of_stream => break,
                None => match self.next_resolved() {
                    Some(frame) => frame,
                    None => break,
                },
            };

            if frame.timestamp_us >= clock_us {
                self.pending = Some(frame);
                break;
            }
            if frame.timestamp_us < cursor {
                // Decoder landed before the seek target.
                continue;
            }

            if let Some(callback) = self.on_frame.as_mut() {
                callback(&frame);
            }
            self.last_emitted_us = Some(frame.timestamp_us);
            self.stats.emitted += 1;
            emitted += 1;
        }

        self.cursor_us = Some(clock_us);
        emitted
    }

    fn last_emitted_us(&self) -> Option<i64> {
        self.last_emitted_us
    }

    fn state(&self) -> SourceState {
        self.state
    }
}
