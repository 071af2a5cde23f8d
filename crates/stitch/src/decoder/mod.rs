//! Host capabilities driven by the player.
//!
//! A [`Decoder`] is one media element: it loads a URL, decodes, reports its
//! position and mixes at a given volume. The player owns two of them and never
//! assumes anything about how the host renders frames.

use url::Url;

use crate::error::PlayerError;

mod sim;

pub use sim::{MediaProbe, SimMedia, SimulatedDecoder};

/// How much of the loaded source is available, mirroring media element ready states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Nothing,
    /// Duration and dimensions are known; seeking is possible.
    Metadata,
    /// The frame at the current position is decoded.
    CurrentData,
    FutureData,
    EnoughData,
}

/// Why a decoder refused to start playing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackRejection {
    /// The host's autoplay policy forbids unmuted playback without a user gesture.
    AutoplayBlocked,
    Failed(String),
}

/// One media element.
pub trait Decoder: Send {
    /// Replace the source and start loading it from position 0.
    fn load(&mut self, url: &Url);

    /// Drop the source entirely.
    fn unload(&mut self);

    fn source(&self) -> Option<&Url>;

    fn play(&mut self) -> Result<(), PlaybackRejection>;

    fn pause(&mut self);

    fn is_paused(&self) -> bool;

    /// Playback reached the end of the source.
    fn is_ended(&self) -> bool;

    /// Position within the loaded source, in seconds.
    fn current_time(&self) -> f64;

    fn set_current_time(&mut self, seconds: f64);

    /// Duration of the loaded source once metadata is available.
    fn duration(&self) -> Option<f64>;

    /// End of the furthest buffered range.
    fn buffered_end(&self) -> Option<f64>;

    fn volume(&self) -> f64;

    fn set_volume(&mut self, volume: f64);

    fn is_muted(&self) -> bool;

    fn set_muted(&mut self, muted: bool);

    fn ready_state(&self) -> ReadyState;

    /// Take the last decode error, if any.
    fn take_error(&mut self) -> Option<String>;

    /// A user gesture happened; hosts with an autoplay policy may unlock unmuted playback.
    fn notify_user_gesture(&mut self) {}
}

/// Fullscreen toggling of the player surface.
pub trait FullscreenController: Send {
    fn is_fullscreen(&self) -> bool;

    fn request_fullscreen(&mut self) -> Result<(), PlayerError>;

    fn exit_fullscreen(&mut self) -> Result<(), PlayerError>;
}
