//! Playlist model and the reset-vs-append decision for updated references.

use tracing::{debug, info};

use crate::error::PlaylistError;
use crate::reference::{ParsedReference, ReferenceShape, SegmentRef, parse_reference};

/// Ordered segments sharing one nominal duration.
#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    segments: Vec<SegmentRef>,
    nominal_duration: f64,
    overlap_duration: f64,
    is_live: bool,
}

impl Playlist {
    /// Build a playlist, enforcing `nominal > overlap >= 0`.
    pub fn new(
        segments: Vec<SegmentRef>,
        nominal_duration: f64,
        overlap_duration: f64,
        is_live: bool,
    ) -> Result<Self, PlaylistError> {
        let valid = overlap_duration >= 0.0
            && overlap_duration.is_finite()
            && nominal_duration > overlap_duration;
        if !valid {
            return Err(PlaylistError::InvalidDurations {
                nominal: nominal_duration,
                overlap: overlap_duration,
            });
        }
        Ok(Self {
            segments,
            nominal_duration,
            overlap_duration,
            is_live,
        })
    }

    pub fn segments(&self) -> &[SegmentRef] {
        &self.segments
    }

    pub fn get(&self, index: usize) -> Option<&SegmentRef> {
        self.segments.get(index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last_index(&self) -> Option<usize> {
        self.segments.len().checked_sub(1)
    }

    pub fn nominal_duration(&self) -> f64 {
        self.nominal_duration
    }

    pub fn overlap_duration(&self) -> f64 {
        self.overlap_duration
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    /// Whether every segment of `self` is a prefix of `ids`, with `ids` strictly longer.
    fn is_extended_by(&self, ids: &[SegmentRef]) -> bool {
        ids.len() > self.segments.len() && ids[..self.segments.len()] == self.segments[..]
    }
}

/// Lifecycle of the playlist controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistState {
    Empty,
    Loaded,
    AppendingLive,
}

/// What an update did to the playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistChange {
    /// A new playlist replaced the old one; playback restarts at index 0.
    Reset,
    /// `added` segments were appended starting at index `from`.
    Appended { from: usize, added: usize },
    /// Same segments and parameters as before.
    Unchanged,
    /// The reference carries no segments yet.
    WaitingForStream,
}

/// Owns the current playlist and classifies every new reference.
#[derive(Debug, Clone)]
pub struct PlaylistController {
    overlap_duration: f64,
    state: PlaylistState,
    playlist: Option<Playlist>,
    reference: Option<String>,
}

impl PlaylistController {
    pub fn new(overlap_duration: f64) -> Self {
        Self {
            overlap_duration,
            state: PlaylistState::Empty,
            playlist: None,
            reference: None,
        }
    }

    pub fn state(&self) -> PlaylistState {
        self.state
    }

    pub fn playlist(&self) -> Option<&Playlist> {
        self.playlist.as_ref()
    }

    /// Last reference that was accepted.
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn is_live(&self) -> bool {
        self.playlist.as_ref().is_some_and(Playlist::is_live)
    }

    pub fn len(&self) -> usize {
        self.playlist.as_ref().map_or(0, Playlist::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace whatever is loaded with `raw`.
    pub fn load(&mut self, raw: &str) -> Result<PlaylistChange, PlaylistError> {
        let parsed = parse_reference(raw);
        self.install(raw, parsed)
    }

    /// Apply a new reference: append for a growing live stream, reset otherwise.
    pub fn update(&mut self, raw: &str) -> Result<PlaylistChange, PlaylistError> {
        let parsed = parse_reference(raw);

        let Some(current) = self.playlist.as_mut() else {
            return self.install(raw, parsed);
        };

        let same_parameters = current.is_live == parsed.is_live
            && current.nominal_duration == parsed.nominal_duration;

        if same_parameters && current.segments == parsed.ids {
            debug!(segments = current.len(), "Playlist unchanged");
            self.reference = Some(raw.to_string());
            return Ok(PlaylistChange::Unchanged);
        }

        if same_parameters && current.is_live && !current.is_empty() && current.is_extended_by(&parsed.ids) {
            let from = current.len();
            let added = parsed.ids.len() - from;
            current.segments.extend(parsed.ids.into_iter().skip(from));
            self.state = PlaylistState::AppendingLive;
            self.reference = Some(raw.to_string());
            info!(from, added, total = from + added, "Live segments appended");
            return Ok(PlaylistChange::Appended { from, added });
        }

        self.install(raw, parsed)
    }

    fn install(&mut self, raw: &str, parsed: ParsedReference) -> Result<PlaylistChange, PlaylistError> {
        let playlist = Playlist::new(
            parsed.ids,
            parsed.nominal_duration,
            self.overlap_duration,
            parsed.is_live,
        )?;

        self.reference = Some(raw.to_string());

        if playlist.is_empty() {
            self.state = if playlist.is_live || parsed.shape == ReferenceShape::Empty {
                PlaylistState::AppendingLive
            } else {
                PlaylistState::Loaded
            };
            self.playlist = Some(playlist);
            debug!("Reference has no segments, waiting for stream");
            return Ok(PlaylistChange::WaitingForStream);
        }

        self.state = if playlist.is_live {
            PlaylistState::AppendingLive
        } else {
            PlaylistState::Loaded
        };
        info!(
            segments = playlist.len(),
            nominal = playlist.nominal_duration,
            live = playlist.is_live,
            "Playlist loaded"
        );
        self.playlist = Some(playlist);
        Ok(PlaylistChange::Reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(controller: &PlaylistController) -> Vec<&str> {
        controller
            .playlist()
            .map(|p| p.segments().iter().map(SegmentRef::as_str).collect())
            .unwrap_or_default()
    }

    #[test]
    fn load_parses_counts_and_durations() {
        let mut controller = PlaylistController::new(2.0);
        assert_eq!(controller.load("playlist:10|a,b,c"), Ok(PlaylistChange::Reset));
        let playlist = controller.playlist().unwrap();
        assert_eq!(playlist.len(), 3);
        assert_eq!(playlist.nominal_duration(), 10.0);
        assert!(!playlist.is_live());
        assert_eq!(controller.state(), PlaylistState::Loaded);
    }

    #[test]
    fn live_append_keeps_existing_segments() {
        let mut controller = PlaylistController::new(2.0);
        controller.load("live:5.5|x,y").unwrap();
        assert_eq!(controller.state(), PlaylistState::AppendingLive);

        let change = controller.update("live:5.5|x,y,z,w").unwrap();
        assert_eq!(change, PlaylistChange::Appended { from: 2, added: 2 });
        assert_eq!(ids(&controller), vec!["x", "y", "z", "w"]);
    }

    #[test]
    fn identical_update_is_unchanged() {
        let mut controller = PlaylistController::new(2.0);
        controller.load("live:5.5|x,y").unwrap();
        assert_eq!(controller.update("live:5.5|x,y"), Ok(PlaylistChange::Unchanged));
    }

    #[test]
    fn non_extending_updates_reset() {
        let mut controller = PlaylistController::new(2.0);
        controller.load("live:5.5|x,y,z").unwrap();

        // Shrink.
        assert_eq!(controller.update("live:5.5|x,y"), Ok(PlaylistChange::Reset));
        // Different first element.
        assert_eq!(controller.update("live:5.5|q,x,y"), Ok(PlaylistChange::Reset));
        // Rewritten middle.
        assert_eq!(controller.update("live:5.5|q,r,y,z"), Ok(PlaylistChange::Reset));
        // Nominal duration changed.
        assert_eq!(controller.update("live:6|q,r,y,z,w"), Ok(PlaylistChange::Reset));
        // VOD playlists never append.
        controller.load("playlist:6|a").unwrap();
        assert_eq!(controller.update("playlist:6|a,b"), Ok(PlaylistChange::Reset));
    }

    #[test]
    fn empty_live_waits_then_first_segments_reset() {
        let mut controller = PlaylistController::new(2.0);
        assert_eq!(controller.load("live:5.5|"), Ok(PlaylistChange::WaitingForStream));
        assert!(controller.is_live());
        assert!(controller.is_empty());

        assert_eq!(controller.update("live:5.5|x"), Ok(PlaylistChange::Reset));
        assert_eq!(ids(&controller), vec!["x"]);
    }

    #[test]
    fn empty_reference_waits() {
        let mut controller = PlaylistController::new(2.0);
        assert_eq!(controller.load(""), Ok(PlaylistChange::WaitingForStream));
    }

    #[test]
    fn nominal_must_exceed_overlap() {
        let mut controller = PlaylistController::new(2.0);
        controller.load("playlist:10|a").unwrap();

        let err = controller.update("playlist:1.5|a,b").unwrap_err();
        assert!(matches!(err, PlaylistError::InvalidDurations { .. }));
        // Previous playlist survives a rejected update.
        assert_eq!(ids(&controller), vec!["a"]);
        assert_eq!(controller.reference(), Some("playlist:10|a"));

        assert!(Playlist::new(vec![], 5.0, -1.0, false).is_err());
        assert!(Playlist::new(vec![], f64::INFINITY, 2.0, false).is_ok());
    }
}
