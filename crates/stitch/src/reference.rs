//! Segment references and the playlist reference wire format.
//!
//! Three shapes are understood:
//!
//! - `live:<duration>|<id1>,<id2>,...`: a live stream that grows by appends
//! - `playlist:<duration>|<id1>,<id2>,...`: a pre-assembled VOD playlist
//! - anything else: one opaque source played as a single segment
//!
//! `<duration>` is the nominal segment duration in seconds and falls back to
//! [`DEFAULT_SEGMENT_DURATION`] when absent or unparsable.

use std::fmt;
use std::sync::Arc;

use crate::config::DEFAULT_SEGMENT_DURATION;

const LIVE_PREFIXES: [&str; 2] = ["live:", "telegram-live:"];
const PLAYLIST_PREFIXES: [&str; 2] = ["playlist:", "telegram-playlist:"];
const CHUNKED_PREFIXES: [&str; 2] = ["chunked:", "telegram-chunked:"];
const STORE_PREFIX: &str = "telegram:";

/// How a segment reference becomes playable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// An `http(s)://` URL.
    Direct,
    /// A handle created locally (`blob:`), playable as is.
    Local,
    /// An identifier of the external file store.
    Stored,
    /// Several stored parts that must be concatenated into one file.
    Chunked,
}

/// Immutable, cheaply clonable reference to one segment.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SegmentRef(Arc<str>);

impl SegmentRef {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(Arc::from(raw.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> SegmentKind {
        let raw = self.as_str();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            SegmentKind::Direct
        } else if raw.starts_with("blob:") {
            SegmentKind::Local
        } else if CHUNKED_PREFIXES.iter().any(|p| raw.starts_with(p)) {
            SegmentKind::Chunked
        } else {
            SegmentKind::Stored
        }
    }

    /// The file-store identifier, without the legacy `telegram:` prefix.
    pub fn store_id(&self) -> Option<&str> {
        match self.kind() {
            SegmentKind::Stored => {
                let raw = self.as_str();
                Some(raw.strip_prefix(STORE_PREFIX).unwrap_or(raw))
            }
            _ => None,
        }
    }

    /// MIME type and ordered parts of a chunked reference (`chunked:<mime>|<id>,<id>`).
    pub fn chunked_parts(&self) -> Option<(Option<&str>, Vec<SegmentRef>)> {
        let raw = self.as_str();
        let payload = CHUNKED_PREFIXES.iter().find_map(|p| raw.strip_prefix(p))?;
        let (mime, ids) = match payload.split_once('|') {
            Some((mime, ids)) => (Some(mime.trim()).filter(|m| !m.is_empty()), ids),
            None => (None, payload),
        };
        Some((mime, split_ids(ids)))
    }
}

impl fmt::Debug for SegmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SegmentRef").field(&self.as_str()).finish()
    }
}

impl fmt::Display for SegmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SegmentRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Which of the wire shapes a reference used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceShape {
    Empty,
    Live,
    Playlist,
    Single,
}

/// Result of parsing a raw playlist reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReference {
    pub shape: ReferenceShape,
    pub ids: Vec<SegmentRef>,
    pub nominal_duration: f64,
    pub is_live: bool,
}

/// Parse a raw reference string. Never fails: malformed durations fall back to
/// the default and empty ids are dropped.
pub fn parse_reference(raw: &str) -> ParsedReference {
    let raw = raw.trim();
    if raw.is_empty() {
        return ParsedReference {
            shape: ReferenceShape::Empty,
            ids: Vec::new(),
            nominal_duration: DEFAULT_SEGMENT_DURATION,
            is_live: false,
        };
    }

    if let Some(payload) = LIVE_PREFIXES.iter().find_map(|p| raw.strip_prefix(p)) {
        let (nominal_duration, ids) = parse_payload(payload);
        return ParsedReference {
            shape: ReferenceShape::Live,
            ids,
            nominal_duration,
            is_live: true,
        };
    }

    if let Some(payload) = PLAYLIST_PREFIXES.iter().find_map(|p| raw.strip_prefix(p)) {
        let (nominal_duration, ids) = parse_payload(payload);
        return ParsedReference {
            shape: ReferenceShape::Playlist,
            ids,
            nominal_duration,
            is_live: false,
        };
    }

    // Legacy single-file sources play as one segment that never ends.
    ParsedReference {
        shape: ReferenceShape::Single,
        ids: vec![SegmentRef::new(raw)],
        nominal_duration: f64::INFINITY,
        is_live: false,
    }
}

fn parse_payload(payload: &str) -> (f64, Vec<SegmentRef>) {
    match payload.split_once('|') {
        Some((duration, ids)) => (parse_duration(duration), split_ids(ids)),
        None => (DEFAULT_SEGMENT_DURATION, split_ids(payload)),
    }
}

fn parse_duration(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => value,
        _ => DEFAULT_SEGMENT_DURATION,
    }
}

fn split_ids(raw: &str) -> Vec<SegmentRef> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(SegmentRef::new)
        .collect()
}
