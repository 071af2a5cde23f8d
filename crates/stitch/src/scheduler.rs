//! Two decoder slots that take turns playing consecutive segments.
//!
//! One slot is always the active one; the other preloads the next segment,
//! prerolls it muted shortly before the boundary and, after the switch, plays
//! out its own overlap tail while the volumes crossfade.

use std::fmt;

use tracing::{debug, trace};
use url::Url;

use crate::decoder::{Decoder, PlaybackRejection, ReadyState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Preloading,
    Active,
    OverlapTail,
}

/// Where the active decoder is relative to the segment boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Playing,
    /// Within the preroll window before the boundary.
    Preroll,
    /// At or past the nominal end.
    Switch,
}

/// Classify `local` seconds into a segment of `nominal` seconds.
pub fn boundary(local: f64, nominal: f64, preroll_window: f64) -> Boundary {
    if local >= nominal {
        Boundary::Switch
    } else if local >= nominal - preroll_window {
        Boundary::Preroll
    } else {
        Boundary::Playing
    }
}

/// Volumes during the overlap crossfade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossfade {
    pub progress: f64,
    pub incoming: f64,
    pub outgoing: f64,
}

/// Mix for an outgoing decoder at `outgoing_time` seconds into a segment of `nominal` seconds.
pub fn crossfade(desired: f64, outgoing_time: f64, nominal: f64, overlap: f64) -> Crossfade {
    let progress = if overlap <= 0.0 {
        1.0
    } else {
        ((outgoing_time - nominal) / overlap).clamp(0.0, 1.0)
    };
    Crossfade {
        progress,
        incoming: desired * progress,
        outgoing: desired * (1.0 - progress),
    }
}

struct Slot<D> {
    decoder: D,
    state: SlotState,
    segment: Option<usize>,
    prerolled: bool,
    length_checked: bool,
}

impl<D: Decoder> Slot<D> {
    fn new(decoder: D) -> Self {
        Self {
            decoder,
            state: SlotState::Idle,
            segment: None,
            prerolled: false,
            length_checked: false,
        }
    }

    fn clear(&mut self) {
        self.decoder.pause();
        self.decoder.unload();
        self.state = SlotState::Idle;
        self.segment = None;
        self.prerolled = false;
        self.length_checked = false;
    }
}

/// The pair of decoders and which of them is active.
pub struct DualDecoderScheduler<D> {
    a: Slot<D>,
    b: Slot<D>,
    active: SlotId,
}

impl<D: Decoder> DualDecoderScheduler<D> {
    pub fn new(a: D, b: D) -> Self {
        Self {
            a: Slot::new(a),
            b: Slot::new(b),
            active: SlotId::A,
        }
    }

    fn slot(&self, id: SlotId) -> &Slot<D> {
        match id {
            SlotId::A => &self.a,
            SlotId::B => &self.b,
        }
    }

    fn slot_mut(&mut self, id: SlotId) -> &mut Slot<D> {
        match id {
            SlotId::A => &mut self.a,
            SlotId::B => &mut self.b,
        }
    }

    pub fn active_id(&self) -> SlotId {
        self.active
    }

    pub fn idle_id(&self) -> SlotId {
        self.active.other()
    }

    pub fn state(&self, id: SlotId) -> SlotState {
        self.slot(id).state
    }

    /// Segment index loaded into `id`.
    pub fn segment(&self, id: SlotId) -> Option<usize> {
        self.slot(id).segment
    }

    pub fn decoder(&self, id: SlotId) -> &D {
        &self.slot(id).decoder
    }

    pub fn decoder_mut(&mut self, id: SlotId) -> &mut D {
        &mut self.slot_mut(id).decoder
    }

    pub fn active_decoder(&self) -> &D {
        self.decoder(self.active)
    }

    pub fn active_decoder_mut(&mut self) -> &mut D {
        let id = self.active;
        self.decoder_mut(id)
    }

    /// Slot currently playing out its overlap tail.
    pub fn tail(&self) -> Option<SlotId> {
        let idle = self.idle_id();
        (self.state(idle) == SlotState::OverlapTail).then_some(idle)
    }

    /// Load `url` for segment `index` into `id`, paused at 0.
    pub fn assign(&mut self, id: SlotId, index: usize, url: &Url) {
        let is_active = id == self.active;
        let slot = self.slot_mut(id);
        slot.decoder.pause();
        slot.decoder.load(url);
        slot.state = if is_active {
            SlotState::Active
        } else {
            SlotState::Preloading
        };
        slot.segment = Some(index);
        slot.prerolled = false;
        slot.length_checked = false;
        debug!(slot = %id, index, "Segment assigned to decoder");
    }

    /// Whether the idle slot holds segment `index` (loaded or still loading).
    pub fn idle_holds(&self, index: usize) -> bool {
        let idle = self.slot(self.idle_id());
        idle.state == SlotState::Preloading && idle.segment == Some(index)
    }

    /// Whether the idle slot holds segment `index` with its current frame decoded.
    pub fn idle_ready(&self, index: usize) -> bool {
        self.idle_holds(index)
            && self.slot(self.idle_id()).decoder.ready_state() >= ReadyState::CurrentData
    }

    /// Start the preloaded idle decoder at volume 0 so its pipeline is warm.
    ///
    /// Returns `Ok(true)` when playback was started by this call.
    pub fn preroll(&mut self) -> Result<bool, PlaybackRejection> {
        let id = self.idle_id();
        let slot = self.slot_mut(id);
        let ready = slot.state == SlotState::Preloading
            && !slot.prerolled
            && slot.decoder.is_paused()
            && slot.decoder.ready_state() >= ReadyState::CurrentData;
        if !ready {
            return Ok(false);
        }
        slot.decoder.set_volume(0.0);
        slot.decoder.play()?;
        slot.prerolled = true;
        trace!(slot = %id, index = ?slot.segment, "Prerolling next segment");
        Ok(true)
    }

    /// Make the idle slot active. The old active slot keeps playing as an
    /// overlap tail when `keep_tail` is set and it still has content.
    ///
    /// The incoming decoder is positioned at however far the outgoing one has
    /// run past `nominal`, so a prerolled decoder does not carry its lead-in
    /// into the new segment and both play the same content while they overlap.
    ///
    /// Returns the id of the new active slot.
    pub fn switch(&mut self, keep_tail: bool, nominal: f64) -> SlotId {
        let old = self.active;
        let new = old.other();
        let overrun = (self.slot(old).decoder.current_time() - nominal).max(0.0);
        self.active = new;

        let new_slot = self.slot_mut(new);
        new_slot.state = SlotState::Active;
        if (new_slot.decoder.current_time() - overrun).abs() > f64::EPSILON {
            new_slot.decoder.set_current_time(overrun);
        }

        let old_slot = self.slot_mut(old);
        if keep_tail && !old_slot.decoder.is_ended() && !old_slot.decoder.is_paused() {
            old_slot.state = SlotState::OverlapTail;
        } else {
            Self::park(old_slot);
        }
        debug!(from = %old, to = %new, "Switched active decoder");
        new
    }

    /// Stop the overlap tail, if any, and return its slot to `Idle`.
    pub fn finish_tail(&mut self) -> Option<SlotId> {
        let id = self.tail()?;
        Self::park(self.slot_mut(id));
        Some(id)
    }

    fn park(slot: &mut Slot<D>) {
        slot.decoder.pause();
        slot.decoder.set_current_time(0.0);
        slot.state = SlotState::Idle;
        slot.segment = None;
        slot.prerolled = false;
    }

    /// Undo a preroll: pause the idle decoder and rewind it to 0.
    pub fn rewind_idle(&mut self) {
        let id = self.idle_id();
        let slot = self.slot_mut(id);
        if slot.state == SlotState::Preloading && slot.prerolled {
            slot.decoder.pause();
            slot.decoder.set_current_time(0.0);
            slot.prerolled = false;
        }
    }

    /// Unload the idle slot unless it holds `keep`.
    pub fn release_idle_unless(&mut self, keep: Option<usize>) {
        let id = self.idle_id();
        let slot = self.slot_mut(id);
        if keep.is_some() && slot.segment == keep && slot.state == SlotState::Preloading {
            slot.decoder.pause();
            slot.decoder.set_current_time(0.0);
            slot.prerolled = false;
            return;
        }
        slot.clear();
    }

    /// Duration of `id`'s source the first time it becomes known.
    pub fn take_length_check(&mut self, id: SlotId) -> Option<(usize, f64)> {
        let slot = self.slot_mut(id);
        if slot.length_checked {
            return None;
        }
        let index = slot.segment?;
        let duration = slot.decoder.duration()?;
        slot.length_checked = true;
        Some((index, duration))
    }

    /// Pause both decoders without changing slot states.
    pub fn pause_all(&mut self) {
        self.a.decoder.pause();
        self.b.decoder.pause();
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.a.decoder.set_muted(muted);
        self.b.decoder.set_muted(muted);
    }

    pub fn notify_user_gesture(&mut self) {
        self.a.decoder.notify_user_gesture();
        self.b.decoder.notify_user_gesture();
    }

    /// Stop and unload both slots; `A` becomes active.
    pub fn reset(&mut self) {
        self.a.clear();
        self.b.clear();
        self.active = SlotId::A;
    }
}
