use std::time::Duration;

use tokio::time::Instant;

/// Live-Wait bookkeeping: the stream ran out of segments and playback is parked
/// at the end of the last one until an append arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveTail {
    since: Option<Instant>,
}

impl LiveTail {
    pub fn is_waiting(&self) -> bool {
        self.since.is_some()
    }

    pub fn since(&self) -> Option<Instant> {
        self.since
    }

    /// Enter Live-Wait. Returns `false` if already waiting.
    pub fn enter(&mut self, now: Instant) -> bool {
        if self.since.is_some() {
            return false;
        }
        self.since = Some(now);
        true
    }

    /// Leave Live-Wait. Returns `false` if not waiting.
    pub fn clear(&mut self) -> bool {
        self.since.take().is_some()
    }

    pub fn waited(&self, now: Instant) -> Option<Duration> {
        self.since.map(|since| now.saturating_duration_since(since))
    }
}

/// Global time just behind the live edge: `edge_offset` before the end of the last segment.
pub fn sync_to_live_target(segment_count: usize, nominal: f64, edge_offset: f64) -> Option<f64> {
    let last = segment_count.checked_sub(1)?;
    if !nominal.is_finite() {
        return None;
    }
    Some(last as f64 * nominal + (nominal - edge_offset).max(0.0))
}
