use std::fmt;
use std::sync::Arc;

use url::Url;

use super::{Decoder, PlaybackRejection, ReadyState};

/// What a simulated source contains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimMedia {
    /// Seconds of content in the file.
    pub duration: f64,
    /// Seconds of [`SimulatedDecoder::advance`] before the source is ready.
    pub load_time: f64,
    /// Report a decode error once loading finishes.
    pub fails: bool,
}

impl SimMedia {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            load_time: 0.0,
            fails: false,
        }
    }
}

/// Maps a loaded URL to the media it contains.
pub type MediaProbe = Arc<dyn Fn(&Url) -> SimMedia + Send + Sync>;

/// Clock-driven decoder without any real media pipeline.
///
/// Time only moves through [`advance`](Self::advance), which makes playback
/// fully deterministic for tests and headless hosts.
pub struct SimulatedDecoder {
    probe: MediaProbe,
    block_unmuted_autoplay: bool,
    user_activated: bool,
    source: Option<Url>,
    media: Option<SimMedia>,
    loading_left: f64,
    time: f64,
    paused: bool,
    ended: bool,
    volume: f64,
    muted: bool,
    ready: ReadyState,
    error: Option<String>,
    loads: usize,
}

impl SimulatedDecoder {
    /// Every source holds `duration` seconds and loads instantly.
    pub fn new(duration: f64) -> Self {
        Self::with_probe(Arc::new(move |_: &Url| SimMedia::new(duration)))
    }

    pub fn with_probe(probe: MediaProbe) -> Self {
        Self {
            probe,
            block_unmuted_autoplay: false,
            user_activated: false,
            source: None,
            media: None,
            loading_left: 0.0,
            time: 0.0,
            paused: true,
            ended: false,
            volume: 1.0,
            muted: false,
            ready: ReadyState::Nothing,
            error: None,
            loads: 0,
        }
    }

    /// Reject unmuted `play()` until a user gesture is reported.
    pub fn block_unmuted_autoplay(mut self) -> Self {
        self.block_unmuted_autoplay = true;
        self
    }

    /// Number of `load` calls so far.
    pub fn loads(&self) -> usize {
        self.loads
    }

    /// Move the decoder clock forward by `dt` seconds.
    pub fn advance(&mut self, dt: f64) {
        let Some(media) = self.media else {
            return;
        };

        if self.ready == ReadyState::Nothing {
            self.loading_left -= dt;
            if self.loading_left <= 0.0 {
                self.finish_loading(media);
            }
            return;
        }

        if self.paused || self.ended || self.ready < ReadyState::CurrentData {
            return;
        }

        self.time += dt;
        if self.time >= media.duration {
            self.time = media.duration;
            self.ended = true;
            self.paused = true;
        }
    }

    fn finish_loading(&mut self, media: SimMedia) {
        if media.fails {
            self.error = Some("media decode failed".to_string());
        } else {
            self.ready = ReadyState::EnoughData;
        }
    }
}

impl fmt::Debug for SimulatedDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedDecoder")
            .field("source", &self.source.as_ref().map(Url::as_str))
            .field("time", &self.time)
            .field("paused", &self.paused)
            .field("ended", &self.ended)
            .field("volume", &self.volume)
            .field("ready", &self.ready)
            .finish()
    }
}

impl Decoder for SimulatedDecoder {
    fn load(&mut self, url: &Url) {
        let media = (self.probe)(url);
        self.source = Some(url.clone());
        self.media = Some(media);
        self.loading_left = media.load_time;
        self.time = 0.0;
        self.paused = true;
        self.ended = false;
        self.ready = ReadyState::Nothing;
        self.error = None;
        self.loads += 1;
        if media.load_time <= 0.0 {
            self.finish_loading(media);
        }
    }

    fn unload(&mut self) {
        self.source = None;
        self.media = None;
        self.time = 0.0;
        self.paused = true;
        self.ended = false;
        self.ready = ReadyState::Nothing;
    }

    fn source(&self) -> Option<&Url> {
        self.source.as_ref()
    }

    fn play(&mut self) -> Result<(), PlaybackRejection> {
        if self.source.is_none() {
            return Err(PlaybackRejection::Failed("no source loaded".to_string()));
        }
        if self.block_unmuted_autoplay && !self.muted && !self.user_activated {
            return Err(PlaybackRejection::AutoplayBlocked);
        }
        if self.ended {
            self.time = 0.0;
            self.ended = false;
        }
        self.paused = false;
        Ok(())
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn is_ended(&self) -> bool {
        self.ended
    }

    fn current_time(&self) -> f64 {
        self.time
    }

    fn set_current_time(&mut self, seconds: f64) {
        let duration = self.media.map_or(0.0, |m| m.duration);
        self.time = seconds.clamp(0.0, duration.max(0.0));
        if self.time < duration {
            self.ended = false;
        }
    }

    fn duration(&self) -> Option<f64> {
        match self.media {
            Some(media) if self.ready >= ReadyState::Metadata => Some(media.duration),
            _ => None,
        }
    }

    fn buffered_end(&self) -> Option<f64> {
        self.duration()
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn set_volume(&mut self, volume: f64) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    fn is_muted(&self) -> bool {
        self.muted
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    fn ready_state(&self) -> ReadyState {
        self.ready
    }

    fn take_error(&mut self) -> Option<String> {
        self.error.take()
    }

    fn notify_user_gesture(&mut self) {
        self.user_activated = true;
    }
}
