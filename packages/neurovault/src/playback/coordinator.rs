// Multi-stream playback coordination
//
// One virtual clock drives every attached source. The coordinator owns the
// Paused/Playing/Seeking state machine and, on every tick, compares each
// active source's last emitted timestamp with the clock.
//
// Locks are taken one at a time and never held across calls into a source
// other than the source's own mutex.

use crate::config::PlaybackConfig;
use crate::playback::clock::PlaybackClock;
use crate::playback::source::PlaybackSource;
use crate::playback::types::{PlaybackError, PlaybackResult, PlaybackState, SyncStats};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub type SharedSource = Arc<Mutex<Box<dyn PlaybackSource>>>;

/// Outcome of a single coordinator tick
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickReport {
    pub position_us: i64,
    pub emitted: usize,
    pub sources_checked: usize,
    pub violations: usize,
    /// Sources still owing a seek acknowledgement
    pub awaiting_seek: usize,
}

struct PendingSeek {
    target_us: i64,
    sources: Vec<SharedSource>,
}

struct CoordinatorInner {
    clock: PlaybackClock,
    sources: RwLock<Vec<SharedSource>>,
    state: Mutex<PlaybackState>,
    pending_seek: Mutex<Option<PendingSeek>>,
    config: PlaybackConfig,

    sync_check_count: AtomicU64,
    sync_violation_count: AtomicU64,
    max_observed_drift_us: AtomicI64,
}

pub struct MultiStreamCoordinator {
    inner: Arc<CoordinatorInner>,
    cancel_token: Mutex<CancellationToken>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for MultiStreamCoordinator {
    fn default() -> Self {
        Self::new(PlaybackConfig::default())
    }
}

impl MultiStreamCoordinator {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                clock: PlaybackClock::new(),
                sources: RwLock::new(Vec::new()),
                state: Mutex::new(PlaybackState::Paused),
                pending_seek: Mutex::new(None),
                config,
                sync_check_count: AtomicU64::new(0),
                sync_violation_count: AtomicU64::new(0),
                max_observed_drift_us: AtomicI64::new(0),
            }),
            cancel_token: Mutex::new(CancellationToken::new()),
            tick_task: Mutex::new(None),
        }
    }

    /// Attach a source. Joining a running coordinator positions the source
    /// at the current clock and starts it.
    pub fn add_source(&self, source: Box<dyn PlaybackSource>) -> PlaybackResult<SharedSource> {
        let id = source.id().to_string();
        if self.inner.find(&id).is_some() {
            return Err(PlaybackError::DuplicateSource(id));
        }

        let shared: SharedSource = Arc::new(Mutex::new(source));
        if self.state() == PlaybackState::Playing {
            let mut source = shared.lock();
            source.notify_seek(self.inner.clock.current_us());
            source.start();
        }
        self.inner.sources.write().push(Arc::clone(&shared));
        log::info!("[PLAYBACK] Attached source '{}'", id);
        Ok(shared)
    }

    pub fn remove_source(&self, id: &str) -> PlaybackResult<()> {
        let removed = {
            let mut sources = self.inner.sources.write();
            let position = sources
                .iter()
                .position(|s| s.lock().id() == id)
                .ok_or_else(|| PlaybackError::SourceNotFound(id.to_string()))?;
            sources.remove(position)
        };
        removed.lock().stop();
        if let Some(pending) = self.inner.pending_seek.lock().as_mut() {
            pending.sources.retain(|s| !Arc::ptr_eq(s, &removed));
        }
        log::info!("[PLAYBACK] Detached source '{}'", id);
        Ok(())
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.inner
            .snapshot()
            .iter()
            .map(|s| s.lock().id().to_string())
            .collect()
    }

    pub fn play(&self) {
        {
            let mut state = self.inner.state.lock();
            match *state {
                PlaybackState::Playing => return,
                // Resumes on its own once every source has acknowledged.
                PlaybackState::Seeking => return,
                PlaybackState::Paused => *state = PlaybackState::Playing,
            }
        }
        self.inner.resume();
        self.spawn_tick_loop();
        log::info!(
            "[PLAYBACK] Playing from {}us at {}x",
            self.inner.clock.current_us(),
            self.inner.clock.rate()
        );
    }

    pub fn pause(&self) {
        *self.inner.state.lock() = PlaybackState::Paused;
        self.inner.clock.pause();
        for source in self.inner.snapshot() {
            source.lock().pause();
        }
        log::info!("[PLAYBACK] Paused at {}us", self.inner.clock.current_us());
    }

    /// Halt the clock, every source and the tick loop.
    pub fn stop(&self) {
        self.cancel_token.lock().cancel();
        *self.inner.state.lock() = PlaybackState::Paused;
        *self.inner.pending_seek.lock() = None;
        self.inner.clock.pause();
        for source in self.inner.snapshot() {
            source.lock().stop();
        }
        log::info!("[PLAYBACK] Stopped at {}us", self.inner.clock.current_us());
    }

    /// Stop and wait for the tick loop to exit.
    pub async fn dispose(&self) {
        self.stop();
        let handle = self.tick_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("[PLAYBACK] Tick loop panicked: {}", e);
            }
        }
    }

    /// Move every stream to `position_us`.
    ///
    /// While paused only the position changes. While playing the coordinator
    /// enters `Seeking` and returns to `Playing` once every source has
    /// acknowledged; stragglers are retried on each tick.
    pub fn seek_to(&self, position_us: i64) {
        let resume = {
            let mut state = self.inner.state.lock();
            let resume = *state != PlaybackState::Paused;
            if resume {
                *state = PlaybackState::Seeking;
            }
            resume
        };

        self.inner.clock.pause();
        self.inner.clock.seek_to(position_us);

        let unacked: Vec<SharedSource> = self
            .inner
            .snapshot()
            .into_iter()
            .filter(|s| !s.lock().notify_seek(position_us))
            .collect();

        log::debug!(
            "[PLAYBACK] Seek to {}us ({} source(s) pending)",
            position_us,
            unacked.len()
        );

        if unacked.is_empty() {
            *self.inner.pending_seek.lock() = None;
            if resume {
                self.inner.finish_seek();
            }
        } else {
            *self.inner.pending_seek.lock() = Some(PendingSeek {
                target_us: position_us,
                sources: unacked,
            });
        }
    }

    pub fn set_playback_rate(&self, rate: f64) -> PlaybackResult<()> {
        self.inner.clock.set_rate(rate)?;
        log::debug!("[PLAYBACK] Rate set to {}x", rate);
        Ok(())
    }

    pub fn playback_rate(&self) -> f64 {
        self.inner.clock.rate()
    }

    pub fn current_position_us(&self) -> i64 {
        self.inner.clock.current_us()
    }

    pub fn state(&self) -> PlaybackState {
        *self.inner.state.lock()
    }

    /// Advance every source to the clock and run the drift check.
    pub fn tick(&self) -> TickReport {
        self.inner.tick()
    }

    pub fn sync_check_count(&self) -> u64 {
        self.inner.sync_check_count.load(Ordering::Relaxed)
    }

    pub fn sync_violation_count(&self) -> u64 {
        self.inner.sync_violation_count.load(Ordering::Relaxed)
    }

    pub fn sync_stats(&self) -> SyncStats {
        SyncStats {
            sync_check_count: self.sync_check_count(),
            sync_violation_count: self.sync_violation_count(),
            max_observed_drift_us: self.inner.max_observed_drift_us.load(Ordering::Relaxed),
        }
    }

    pub fn is_ticking(&self) -> bool {
        self.tick_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    fn spawn_tick_loop(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!("[PLAYBACK] No tokio runtime; tick() must be driven by the caller");
            return;
        };

        let mut task = self.tick_task.lock();
        let running = task.as_ref().is_some_and(|t| !t.is_finished());
        if running && !self.cancel_token.lock().is_cancelled() {
            return;
        }

        let cancel_token = CancellationToken::new();
        *self.cancel_token.lock() = cancel_token.clone();

        let inner = Arc::clone(&self.inner);
        let period = Duration::from_millis(self.inner.config.tick_interval_ms.max(1));
        *task = Some(runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel_token.cancelled() => {
                        log::debug!("[PLAYBACK] Tick loop cancelled");
                        break;
                    }

                    _ = ticker.tick() => {
                        inner.tick();
                    }
                }
            }
        }));
    }
}

impl Drop for MultiStreamCoordinator {
    fn drop(&mut self) {
        self.cancel_token.lock().cancel();
    }
}

impl CoordinatorInner {
    fn snapshot(&self) -> Vec<SharedSource> {
        self.sources.read().clone()
    }

    fn find(&self, id: &str) -> Option<SharedSource> {
        self.snapshot().into_iter().find(|s| s.lock().id() == id)
    }

    fn resume(&self) {
        self.clock.start();
        for source in self.snapshot() {
            source.lock().start();
        }
    }

    fn finish_seek(&self) {
        let resumed = {
            let mut state = self.state.lock();
            if *state == PlaybackState::Seeking {
                *state = PlaybackState::Playing;
                true
            } else {
                false
            }
        };
        if resumed {
            self.resume();
        }
    }

    /// Re-notify sources that have not acknowledged the last seek.
    /// Returns how many are still outstanding.
    fn retry_pending_seek(&self) -> usize {
        let mut pending = self.pending_seek.lock();
        let Some(seek) = pending.as_mut() else {
            return 0;
        };
        let target_us = seek.target_us;
        seek.sources.retain(|s| !s.lock().notify_seek(target_us));
        let outstanding = seek.sources.len();
        if outstanding == 0 {
            *pending = None;
            drop(pending);
            log::debug!("[PLAYBACK] Seek to {}us acknowledged by all sources", target_us);
            self.finish_seek();
        }
        outstanding
    }

    fn tick(&self) -> TickReport {
        let awaiting_seek = self.retry_pending_seek();
        let position_us = self.clock.current_us();
        let mut report = TickReport {
            position_us,
            awaiting_seek,
            ..TickReport::default()
        };
        if *self.state.lock() != PlaybackState::Playing {
            return report;
        }

        let tolerance = self.config.sync_tolerance_us;
        for shared in self.snapshot() {
            let mut source = shared.lock();
            report.emitted += source.advance(position_us);

            if !source.is_active() {
                continue;
            }
            let Some(last_us) = source.last_emitted_us() else {
                continue;
            };
            report.sources_checked += 1;
            self.sync_check_count.fetch_add(1, Ordering::Relaxed);

            let drift = (position_us - last_us).abs();
            self.max_observed_drift_us.fetch_max(drift, Ordering::Relaxed);
            if drift > tolerance {
                report.violations += 1;
                self.sync_violation_count.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[PLAYBACK] Source '{}' drifted {}us from clock at {}us",
                    source.id(),
                    drift,
                    position_us
                );
            }
        }
        report
    }
}
