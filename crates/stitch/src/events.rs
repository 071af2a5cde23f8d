use std::time::Duration;

use crate::error::PlayerError;

/// Why a segment was dropped from playback.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// The reference could not be resolved or the file no longer exists.
    Unresolvable(String),
    /// The decoder failed on a live segment.
    DecodeFailed(String),
    /// A live segment failed to load in a way retrying will not fix.
    LoadFailed(String),
}

/// Notable player transitions, broadcast to any number of subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// A new playlist replaced the previous one.
    PlaylistReset {
        segments: usize,
        nominal_duration: f64,
        is_live: bool,
    },
    /// Live segments were appended.
    SegmentsAppended { from: usize, added: usize },
    /// The active decoder changed at a segment boundary.
    SegmentSwitched { index: usize },
    /// Playback reached the live edge and is waiting for more segments.
    LiveWaitEntered,
    /// Live-Wait ended, by an append or a seek.
    LiveWaitCleared { waited: Duration },
    /// Playback stalled waiting for a segment.
    Buffering { index: usize },
    /// Unmuted autoplay was refused; playback continues muted if possible.
    AutoplayBlocked { muted_fallback: bool },
    SegmentSkipped { index: usize, reason: SkipReason },
    /// The end of a VOD playlist was reached.
    Ended,
    /// Playback stopped on an unrecoverable error.
    Error { error: PlayerError },
}
