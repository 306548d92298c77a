use crate::playback::types::{PlaybackError, PlaybackResult};
use parking_lot::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct ClockState {
    running: bool,
    rate: f64,
    base_position_us: i64,
    anchor: Instant,
}

impl ClockState {
    fn position_at(&self, now: Instant) -> i64 {
        if !self.running {
            return self.base_position_us;
        }
        let elapsed_us = now.saturating_duration_since(self.anchor).as_secs_f64() * 1_000_000.0;
        self.base_position_us + (elapsed_us * self.rate).round() as i64
    }

    /// Fold the elapsed time into the base position and restart from `now`.
    fn reanchor(&mut self, now: Instant) {
        self.base_position_us = self.position_at(now);
        self.anchor = now;
    }
}

/// Pausable, seekable, rate-scaled virtual time in microseconds.
///
/// While running the position is `base + elapsed_wall * rate`; while paused it
/// stays at `base`. Every call takes the single internal lock once.
#[derive(Debug)]
pub struct PlaybackClock {
    state: Mutex<ClockState>,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                running: false,
                rate: 1.0,
                base_position_us: 0,
                anchor: Instant::now(),
            }),
        }
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        if !state.running {
            state.anchor = Instant::now();
            state.running = true;
        }
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if state.running {
            state.reanchor(Instant::now());
            state.running = false;
        }
    }

    pub fn seek_to(&self, position_us: i64) {
        let mut state = self.state.lock();
        state.base_position_us = position_us;
        state.anchor = Instant::now();
    }

    /// Stop and return to position zero at normal speed.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.rate = 1.0;
        state.base_position_us = 0;
        state.anchor = Instant::now();
    }

    pub fn set_rate(&self, rate: f64) -> PlaybackResult<()> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(PlaybackError::InvalidRate(rate));
        }
        let mut state = self.state.lock();
        if state.running {
            state.reanchor(Instant::now());
        }
        state.rate = rate;
        Ok(())
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn current_us(&self) -> i64 {
        self.state.lock().position_at(Instant::now())
    }
}
