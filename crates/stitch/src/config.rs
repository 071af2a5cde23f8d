use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Nominal segment duration used when a reference omits it or it fails to parse.
pub const DEFAULT_SEGMENT_DURATION: f64 = 5.5;

/// Seconds of extra content each segment file carries past its nominal end.
pub const DEFAULT_OVERLAP_DURATION: f64 = 2.0;

/// Timing, volume and recovery settings of the playback engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Overlap carried by every segment file (seconds). Fixed per engine.
    pub overlap_duration: f64,

    /// How long before the nominal boundary the idle decoder is started muted.
    pub preroll_window: f64,

    /// Delay before loading the next segment after a switch, so the previous
    /// decoder's overlap tail decodes without contention.
    pub preload_delay_ms: u64,

    /// Keep seeks this far away from the end of the known timeline.
    pub seek_epsilon: f64,

    /// Distance from the live edge used by "sync to live".
    pub live_edge_offset: f64,

    /// Step used by keyboard shortcuts.
    pub keyboard_step: f64,

    /// Step used by the skip buttons.
    pub skip_step: f64,

    /// Below this difference the active volume is left alone outside a crossfade.
    pub volume_tolerance: f64,

    /// Tolerance when checking that a decoded segment holds `nominal + overlap` seconds.
    pub segment_length_tolerance: f64,

    /// Wait this long before re-requesting a segment whose fetch failed.
    pub retry_delay_ms: u64,

    /// Failed loads of the same segment in a row before giving up on it.
    pub max_load_retries: u32,

    /// Consecutive decoder failures that trigger a hard reset.
    pub max_consecutive_decode_errors: u32,

    /// Hide the controls after this long without pointer activity.
    pub controls_hide_ms: u64,

    /// Initial output volume in `[0, 1]`.
    pub initial_volume: f64,

    /// Start playing as soon as the first segment is ready.
    pub autoplay: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            overlap_duration: DEFAULT_OVERLAP_DURATION,
            preroll_window: 2.0,
            preload_delay_ms: 2500,
            seek_epsilon: 0.1,
            live_edge_offset: 0.5,
            keyboard_step: 5.0,
            skip_step: 10.0,
            volume_tolerance: 0.05,
            segment_length_tolerance: 0.25,
            retry_delay_ms: 1000,
            max_load_retries: 5,
            max_consecutive_decode_errors: 3,
            controls_hide_ms: 2500,
            initial_volume: 1.0,
            autoplay: true,
        }
    }
}

impl PlayerConfig {
    pub fn preload_delay(&self) -> Duration {
        Duration::from_millis(self.preload_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn controls_hide_after(&self) -> Duration {
        Duration::from_millis(self.controls_hide_ms)
    }

    pub fn with_overlap(mut self, overlap: f64) -> Self {
        self.overlap_duration = overlap;
        self
    }

    pub fn with_preload_delay(mut self, delay: Duration) -> Self {
        self.preload_delay_ms = delay.as_millis() as u64;
        self
    }
}

/// Segment cache policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of upcoming segments warmed into the cache after each index change.
    pub lookahead: usize,

    /// Download direct URLs into blobs instead of letting the decoder stream them.
    pub materialize_direct_urls: bool,

    /// MIME type given to materialized blobs when the upstream does not send one.
    pub default_mime: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lookahead: 3,
            materialize_direct_urls: false,
            default_mime: "video/mp4".to_string(),
        }
    }
}

/// Where segment references are resolved and how requests are routed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Same-origin relay endpoint; targets are appended as `?url=<encoded>`.
    pub relay_endpoint: String,

    /// Base URL of the external file service.
    pub file_api_base: String,

    /// Bot token of the external file service. Resolution fails without it.
    pub bot_token: Option<String>,

    /// Timeout for metadata lookups.
    pub resolve_timeout_ms: u64,

    /// Timeout for segment downloads.
    pub fetch_timeout_ms: u64,

    /// Connection timeout shared by both.
    pub connect_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            relay_endpoint: "http://127.0.0.1:12556/api/proxy".to_string(),
            file_api_base: "https://api.telegram.org".to_string(),
            bot_token: None,
            resolve_timeout_ms: 10_000,
            fetch_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ResolverConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_segment_contract() {
        let config = PlayerConfig::default();
        assert!(DEFAULT_SEGMENT_DURATION > config.overlap_duration);
        assert_eq!(config.preload_delay(), Duration::from_millis(2500));
        assert_eq!(CacheConfig::default().lookahead, 3);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: PlayerConfig =
            serde_json::from_str(r#"{ "overlap_duration": 1.0, "retry_delay_ms": 250 }"#).unwrap();
        assert_eq!(config.overlap_duration, 1.0);
        assert_eq!(config.retry_delay(), Duration::from_millis(250));
        assert_eq!(config.keyboard_step, 5.0);

        let cache: CacheConfig = serde_json::from_str(r#"{ "lookahead": 5 }"#).unwrap();
        assert_eq!(cache.lookahead, 5);
        assert_eq!(cache.default_mime, "video/mp4");
    }
}
