use crate::config::PlaybackConfig;
use crate::playback::ring_buffer::SampleRingBuffer;
use crate::playback::source::PlaybackSource;
use crate::playback::types::{SourceKind, SourceState};
use crate::types::{QualityFlags, Sample};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

type SampleCallback = Box<dyn FnMut(&Sample) + Send>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleSourceStats {
    pub emitted: u64,
    pub missing: u64,
    pub interpolated: u64,
}

/// Replays a timestamp-keyed sample buffer against the virtual clock.
///
/// Each `advance` emits the slots of the sample grid that fall in the newly
/// elapsed interval. Slots without data become `MISSING` samples with NaN
/// values. Only short gaps, bounded by normal samples on both sides, are
/// bridged by linear interpolation and flagged `INTERPOLATED`.
///
/// When nothing is buffered past the clock, slots more than one sample period
/// overdue are emitted as `MISSING` on the grid of the last known sample (or
/// of the seek position). A sample that arrives later is only emitted if its
/// slot has not been declared missing already.
pub struct EegPlaybackSource {
    id: String,
    kind: SourceKind,
    buffer: Arc<SampleRingBuffer>,
    sample_period_us: f64,
    channel_count: usize,
    max_interpolated_samples: usize,
    max_interpolated_gap_us: i64,
    state: SourceState,
    /// Clock position already processed
    cursor_us: Option<i64>,
    /// Last seek position
    origin_us: i64,
    /// Smallest timestamp still eligible for emission
    floor_us: i64,
    /// Real sample after which slots were declared missing before the next
    /// sample was known
    trailing_anchor_us: Option<i64>,
    last_emitted_us: Option<i64>,
    callback: Option<SampleCallback>,
    stats: SampleSourceStats,
}

impl EegPlaybackSource {
    pub fn new(
        id: impl Into<String>,
        buffer: Arc<SampleRingBuffer>,
        sample_rate: f64,
        channel_count: usize,
        config: &PlaybackConfig,
    ) -> Self {
        Self {
            id: id.into(),
            kind: SourceKind::Eeg,
            buffer,
            sample_period_us: 1_000_000.0 / sample_rate,
            channel_count,
            max_interpolated_samples: config.max_interpolated_samples,
            max_interpolated_gap_us: config.max_interpolated_gap_us,
            state: SourceState::Idle,
            cursor_us: None,
            origin_us: 0,
            floor_us: 0,
            trailing_anchor_us: None,
            last_emitted_us: None,
            callback: None,
            stats: SampleSourceStats::default(),
        }
    }

    /// Replay a different sampled stream (NIRS) with the same gap rules.
    pub fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Register the receiver of emitted samples.
    pub fn on_sample<F>(&mut self, callback: F)
    where
        F: FnMut(&Sample) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    pub fn stats(&self) -> SampleSourceStats {
        self.stats
    }

    pub fn buffer(&self) -> &Arc<SampleRingBuffer> {
        &self.buffer
    }

    /// Fill the grid slots strictly between `prev` and `next` that fall in
    /// `[from_us, until_us)`.
    fn fill_gap(
        &self,
        prev: &Sample,
        next: &Sample,
        from_us: i64,
        until_us: i64,
        out: &mut Vec<Sample>,
    ) {
        let span = (next.timestamp_us - prev.timestamp_us) as f64;
        let slots = (span / self.sample_period_us).round() as i64 - 1;
        if slots <= 0 {
            return;
        }

        let interpolate = slots as usize <= self.max_interpolated_samples
            && slots as f64 * self.sample_period_us <= self.max_interpolated_gap_us as f64
            && self.trailing_anchor_us != Some(prev.timestamp_us)
            && prev.quality.is_normal()
            && next.quality.is_normal()
            && prev.values.len() == next.values.len();

        let first_k = (((from_us - prev.timestamp_us) as f64 / self.sample_period_us).floor() as i64).max(1);
        for k in first_k..=slots {
            let ts = prev.timestamp_us + (k as f64 * self.sample_period_us).round() as i64;
            if ts < from_us {
                continue;
            }
            if ts >= until_us || ts >= next.timestamp_us {
                break;
            }

            if interpolate {
                let frac = ((ts - prev.timestamp_us) as f64 / span) as f32;
                let values = prev
                    .values
                    .iter()
                    .zip(&next.values)
                    .map(|(a, b)| a + (b - a) * frac)
                    .collect();
                out.push(Sample::new(ts, values).with_quality(QualityFlags::INTERPOLATED));
            } else {
                out.push(Sample::missing(ts, self.channel_count));
            }
        }
    }

    /// Missing slots on the grid of `next`, before it and in `[from_us, until_us)`.
    fn fill_leading(&self, next: &Sample, from_us: i64, until_us: i64, out: &mut Vec<Sample>) {
        let slots = ((next.timestamp_us - from_us) as f64 / self.sample_period_us).floor() as i64;
        for k in (1..=slots).rev() {
            let ts = next.timestamp_us - (k as f64 * self.sample_period_us).round() as i64;
            if ts < from_us {
                continue;
            }
            if ts >= until_us {
                break;
            }
            out.push(Sample::missing(ts, self.channel_count));
        }
    }

    /// Missing slots on the grid of `anchor_us`, after it and in
    /// `[from_us, until_us)`. Returns whether any slot was emitted.
    fn fill_trailing(
        &self,
        anchor_us: i64,
        from_us: i64,
        until_us: i64,
        out: &mut Vec<Sample>,
    ) -> bool {
        let mut k = (((from_us - anchor_us) as f64 / self.sample_period_us).floor() as i64).max(1);
        let mut filled = false;
        loop {
            let ts = anchor_us + (k as f64 * self.sample_period_us).round() as i64;
            if ts >= until_us {
                break;
            }
            if ts >= from_us {
                out.push(Sample::missing(ts, self.channel_count));
                filled = true;
            }
            k += 1;
        }
        filled
    }

    fn reposition(&mut self, position_us: i64) {
        self.cursor_us = Some(position_us);
        self.origin_us = position_us;
        self.floor_us = position_us;
        self.trailing_anchor_us = None;
        self.last_emitted_us = None;
    }

    fn emit(&mut self, samples: Vec<Sample>) -> usize {
        let count = samples.len();
        for sample in &samples {
            if sample.quality.contains(QualityFlags::MISSING) {
                self.stats.missing += 1;
            }
            if sample.quality.contains(QualityFlags::INTERPOLATED) {
                self.stats.interpolated += 1;
            }
            if let Some(callback) = self.callback.as_mut() {
                callback(sample);
            }
        }
        if let Some(last) = samples.last() {
            self.last_emitted_us = Some(last.timestamp_us);
        }
        self.stats.emitted += count as u64;
        count
    }
}

impl PlaybackSource for EegPlaybackSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        self.kind
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
        self.cursor_us = None;
    }

    fn notify_seek(&mut self, position_us: i64) -> bool {
        self.reposition(position_us);
        true
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

        let from = self.floor_us;
        let real = self.buffer.range(from, clock_us);
        let lookahead = self.buffer.first_at_or_after(clock_us);
        let mut prev = self.buffer.last_before(from);
        let mut out = Vec::with_capacity(real.len());

        for sample in real {
            match &prev {
                Some(p) => self.fill_gap(p, &sample, from, clock_us, &mut out),
                None => self.fill_leading(&sample, from, clock_us, &mut out),
            }
            out.push(sample.clone());
            prev = Some(sample);
        }

        match (&prev, &lookahead) {
            (Some(p), Some(next)) => self.fill_gap(p, next, from, clock_us, &mut out),
            (None, Some(next)) => self.fill_leading(next, from, clock_us, &mut out),
            (_, None) => {
                let period_us = self.sample_period_us.round() as i64;
                let anchor_us = prev
                    .as_ref()
                    .map(|p| p.timestamp_us)
                    .unwrap_or(self.origin_us - period_us);
                if self.fill_trailing(anchor_us, from, clock_us - period_us, &mut out) {
                    self.trailing_anchor_us = prev.as_ref().map(|p| p.timestamp_us);
                }
            }
        }

        self.cursor_us = Some(clock_us);
        if let Some(last) = out.last() {
            self.floor_us = last.timestamp_us + 1;
        }
        self.emit(out)
    }

    fn last_emitted_us(&self) -> Option<i64> {
        self.last_emitted_us
    }

    fn state(&self) -> SourceState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::sample_timestamp_us;
    use parking_lot::Mutex;

    const RATE: f64 = 160.0;

    fn fill(buffer: &SampleRingBuffer, start_us: i64, end_us: i64) {
        let mut i = 0;
        loop {
            let ts = sample_timestamp_us(0, i, RATE);
            i += 1;
            if ts < start_us {
                continue;
            }
            if ts >= end_us {
                break;
            }
            buffer.push(Sample::new(ts, vec![1.0 + (i % 7) as f32, 2.0]));
        }
    }

    fn replay(source: &mut EegPlaybackSource, from_us: i64, to_us: i64, step_us: i64) -> Vec<Sample> {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        source.on_sample(move |s| sink.lock().push(s.clone()));
        source.notify_seek(from_us);
        source.start();
        let mut clock = from_us;
        while clock < to_us {
            clock = (clock + step_us).min(to_us);
            source.advance(clock);
        }
        let out = emitted.lock().clone();
        out
    }

    fn source_over(buffer: Arc<SampleRingBuffer>) -> EegPlaybackSource {
        EegPlaybackSource::new("eeg", buffer, RATE, 2, &PlaybackConfig::default())
    }

    #[test]
    fn test_gap_is_replayed_as_missing() {
        let buffer = Arc::new(SampleRingBuffer::new(10_000));
        fill(&buffer, 0, 2_000_000);
        fill(&buffer, 3_000_000, 5_000_000);
        let mut source = source_over(buffer);

        let samples = replay(&mut source, 0, 5_000_000, 16_000);
        assert_eq!(samples.len(), 800);
        assert!(samples.windows(2).all(|w| w[0].timestamp_us < w[1].timestamp_us));

        for sample in &samples {
            let in_gap = sample.timestamp_us >= 2_000_000 && sample.timestamp_us < 3_000_000;
            if in_gap {
                assert!(sample.quality.contains(QualityFlags::MISSING));
                assert!(sample.values[0].is_nan());
            } else {
                assert!(sample.values.iter().all(|v| !v.is_nan()));
                assert!(sample.quality.is_normal());
            }
        }
        assert_eq!(source.stats().missing, 160);
    }

    #[test]
    fn test_short_gap_is_interpolated() {
        let buffer = Arc::new(SampleRingBuffer::new(1_000));
        for i in 0..20usize {
            if (8..11).contains(&i) {
                continue;
            }
            buffer.push(Sample::new(sample_timestamp_us(0, i, RATE), vec![i as f32, 0.0]));
        }
        let mut source = source_over(buffer);

        let samples = replay(&mut source, 0, 20 * 6_250, 4_000);
        assert_eq!(samples.len(), 20);
        for i in 8..11 {
            assert!(samples[i].quality.contains(QualityFlags::INTERPOLATED));
            assert!((samples[i].values[0] - i as f32).abs() < 1e-4);
        }
        assert_eq!(source.stats().interpolated, 3);
        assert_eq!(source.stats().missing, 0);
    }

    #[test]
    fn test_gap_over_ceiling_is_not_interpolated() {
        let buffer = Arc::new(SampleRingBuffer::new(1_000));
        for i in 0..20usize {
            if (5..10).contains(&i) {
                continue;
            }
            buffer.push(Sample::new(sample_timestamp_us(0, i, RATE), vec![i as f32, 0.0]));
        }
        let mut source = source_over(buffer);

        let samples = replay(&mut source, 0, 20 * 6_250, 6_250);
        assert_eq!(samples.len(), 20);
        assert!(samples[5..10].iter().all(|s| s.quality == QualityFlags::MISSING));
    }

    #[test]
    fn test_no_interpolation_next_to_untrustworthy_samples() {
        let buffer = Arc::new(SampleRingBuffer::new(1_000));
        for i in 0..10usize {
            if i == 4 {
                continue;
            }
            let mut sample = Sample::new(sample_timestamp_us(0, i, RATE), vec![1.0, 1.0]);
            if i == 5 {
                sample.quality = QualityFlags::LEAD_OFF;
            }
            buffer.push(sample);
        }
        let mut source = source_over(buffer);

        let samples = replay(&mut source, 0, 10 * 6_250, 6_250);
        assert!(samples[4].quality.contains(QualityFlags::MISSING));
    }

    #[test]
    fn test_seek_resets_cursor() {
        let buffer = Arc::new(SampleRingBuffer::new(10_000));
        fill(&buffer, 0, 2_000_000);
        let mut source = source_over(buffer);
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        source.on_sample(move |s| sink.lock().push(s.timestamp_us));
        source.start();
        source.notify_seek(0);
        source.advance(500_000);
        assert_eq!(source.last_emitted_us(), Some(493_750));

        assert!(source.notify_seek(1_500_000));
        assert_eq!(source.last_emitted_us(), None);
        emitted.lock().clear();
        source.advance(1_512_500);
        assert_eq!(*emitted.lock(), vec![1_500_000, 1_506_250]);
    }

    #[test]
    fn test_trailing_gap_is_declared_and_late_data_resumes() {
        let buffer = Arc::new(SampleRingBuffer::new(10_000));
        fill(&buffer, 0, 2_000_000);
        let mut source = source_over(Arc::clone(&buffer));

        let first = replay(&mut source, 0, 3_000_000, 16_000);
        // Slots more than one period overdue are visible before data returns.
        assert_eq!(source.last_emitted_us(), Some(2_987_500));
        let declared: Vec<&Sample> = first.iter().filter(|s| s.timestamp_us >= 2_000_000).collect();
        assert_eq!(declared.len(), 159);
        assert!(declared.iter().all(|s| s.quality == QualityFlags::MISSING));

        fill(&buffer, 3_000_000, 4_000_000);
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        source.on_sample(move |s| sink.lock().push(s.clone()));
        assert_eq!(source.advance(4_000_000), 161);

        let late = emitted.lock().clone();
        assert_eq!(late[0].timestamp_us, 2_993_750);
        assert!(late[0].quality.contains(QualityFlags::MISSING));
        assert!(late[1..].iter().all(|s| s.quality.is_normal()));
        assert_eq!(late[1].timestamp_us, 3_000_000);

        let all: Vec<i64> = first.iter().chain(&late).map(|s| s.timestamp_us).collect();
        assert!(all.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(all.len(), 640);
        assert_eq!(source.stats().missing, 160);
    }

    #[test]
    fn test_seek_before_first_sample_leads_with_missing() {
        let buffer = Arc::new(SampleRingBuffer::new(10_000));
        fill(&buffer, 1_000_000, 2_000_000);
        let mut source = source_over(buffer);

        let samples = replay(&mut source, 0, 2_000_000, 16_000);
        assert_eq!(samples.len(), 320);
        for (i, sample) in samples.iter().enumerate() {
            assert_eq!(sample.timestamp_us, i as i64 * 6_250);
            assert_eq!(sample.quality.contains(QualityFlags::MISSING), i < 160);
        }
    }

    #[test]
    fn test_end_of_buffer_emits_missing() {
        let buffer = Arc::new(SampleRingBuffer::new(10_000));
        fill(&buffer, 0, 1_000_000);
        let mut source = source_over(Arc::clone(&buffer));

        let samples = replay(&mut source, 0, 1_500_000, 16_000);
        assert_eq!(samples.len(), 160 + 79);
        assert!(samples[160..].iter().all(|s| s.values.iter().all(|v| v.is_nan())));
        assert_eq!(source.last_emitted_us(), Some(1_487_500));

        // Seeking past the data keeps the grid of the last sample.
        let mut source = source_over(buffer);
        let samples = replay(&mut source, 5_000_000, 5_100_000, 16_000);
        assert_eq!(samples.len(), 15);
        assert_eq!(samples[0].timestamp_us, 5_000_000);
        assert!(samples.iter().all(|s| s.quality == QualityFlags::MISSING));
    }

    #[test]
    fn test_empty_buffer_uses_seek_grid() {
        let mut source = source_over(Arc::new(SampleRingBuffer::new(16)));
        source.notify_seek(0);
        source.start();
        assert_eq!(source.advance(100_000), 15);
        assert_eq!(source.last_emitted_us(), Some(87_500));
        assert_eq!(source.stats().missing, 15);
    }

    #[test]
    fn test_nirs_replay_marks_missing_slot() {
        let buffer = Arc::new(SampleRingBuffer::new(100));
        for second in 0..10i64 {
            if second != 5 {
                buffer.push(Sample::new(second * 1_000_000, vec![0.5; 4]));
            }
        }
        let mut source = EegPlaybackSource::new("nirs", buffer, 1.0, 4, &PlaybackConfig::default())
            .with_kind(SourceKind::Nirs);
        assert_eq!(source.kind(), SourceKind::Nirs);

        let samples = replay(&mut source, 0, 10_000_000, 100_000);
        assert_eq!(samples.len(), 10);
        assert_eq!(samples[5].timestamp_us, 5_000_000);
        assert_eq!(samples[5].values.len(), 4);
        assert!(samples[5].quality.contains(QualityFlags::MISSING));
        assert_eq!(source.stats().interpolated, 0);
    }

    #[test]
    fn test_paused_source_emits_nothing() {
        let buffer = Arc::new(SampleRingBuffer::new(100));
        fill(&buffer, 0, 100_000);
        let mut source = source_over(buffer);
        source.notify_seek(0);
        assert_eq!(source.advance(50_000), 0);
        source.start();
        source.pause();
        assert_eq!(source.advance(50_000), 0);
        assert!(!source.is_active());
        source.stop();
        source.start();
        assert_eq!(source.state(), SourceState::Stopped);
    }
}
