pub mod clock;
pub mod coordinator;
pub mod eeg_source;
pub mod ring_buffer;
pub mod source;
pub mod types;
pub mod video_index;
pub mod video_source;

pub use clock::PlaybackClock;
pub use coordinator::{MultiStreamCoordinator, SharedSource, TickReport};
pub use eeg_source::{EegPlaybackSource, SampleSourceStats};
pub use ring_buffer::{BufferMetrics, SampleRingBuffer};
pub use source::PlaybackSource;
pub use types::*;
pub use video_index::{VideoIndex, VideoIndexEntry, VideoIndexWriter};
pub use video_source::{FrameProvider, TimedFrame, VideoFrame, VideoPlaybackSource, VideoSourceStats};
