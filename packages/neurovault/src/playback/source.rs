// Playback source abstraction
//
// A source replays one stream against the coordinator's virtual clock. The
// coordinator drives it through `advance` on every tick and uses
// `last_emitted_us` for the drift check. New sources are added by
// implementing `PlaybackSource` and attaching them to a coordinator.

use crate::playback::types::{SourceKind, SourceState};

pub trait PlaybackSource: Send {
    /// Stable identifier, unique within a coordinator
    fn id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    fn start(&mut self);

    fn pause(&mut self);

    /// Halt permanently; a stopped source emits nothing further
    fn stop(&mut self);

    /// Reposition to `position_us`. Returns `true` once the source is ready to
    /// emit from the new position.
    fn notify_seek(&mut self, position_us: i64) -> bool;

    /// Emit every item whose timestamp falls in the interval elapsed since
    /// the previous call, `[cursor, clock_us)`.
    ///
    /// Returns the number of items emitted.
    fn advance(&mut self, clock_us: i64) -> usize;

    /// Timestamp of the most recently emitted item, if any
    fn last_emitted_us(&self) -> Option<i64>;

    fn state(&self) -> SourceState;

    fn is_active(&self) -> bool {
        self.state() == SourceState::Running
    }
}
