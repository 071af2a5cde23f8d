use reqwest::StatusCode;

/// Errors produced while turning segment references into playable media.
///
/// None of these ever escape the render loop: the player converts each of
/// them into state (buffering, skip, error banner) at the point of use.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlayerError {
    #[error("segment reference `{reference}` is not resolvable: {reason}")]
    NotResolvable { reference: String, reason: String },

    #[error("failed to fetch `{url}`: {reason}")]
    Fetch {
        url: String,
        reason: String,
        status: Option<StatusCode>,
    },

    #[error("decoder rejected segment {index}: {reason}")]
    Decode { index: usize, reason: String },

    #[error("result discarded: generation {started} superseded by {current}")]
    Stale { started: u64, current: u64 },

    #[error("cache released while fetch of `{reference}` was in flight")]
    Released { reference: String },

    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl PlayerError {
    pub fn not_resolvable(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotResolvable {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.into(),
            status: None,
        }
    }

    pub fn http_status(url: impl Into<String>, status: StatusCode) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: format!("HTTP {status}"),
            status: Some(status),
        }
    }

    pub fn decode(index: usize, reason: impl Into<String>) -> Self {
        Self::Decode {
            index,
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether a later attempt at the same segment may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch { status, .. } => match status {
                Some(status) => {
                    status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
                }
                None => true,
            },
            Self::Released { .. } | Self::Stale { .. } | Self::Internal { .. } => true,
            Self::NotResolvable { .. }
            | Self::Decode { .. }
            | Self::Configuration { .. } => false,
        }
    }

    /// Whether the segment should be dropped from playback instead of retried.
    pub fn is_skippable(&self) -> bool {
        match self {
            Self::NotResolvable { .. } => true,
            Self::Fetch {
                status: Some(status),
                ..
            } => *status == StatusCode::NOT_FOUND || *status == StatusCode::GONE,
            _ => false,
        }
    }

    /// Stale and released results carry no information about the segment.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Stale { .. } | Self::Released { .. })
    }
}

/// Errors raised while parsing or validating a playlist reference.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlaylistError {
    #[error(
        "nominal segment duration {nominal}s must exceed overlap {overlap}s (and overlap must be >= 0)"
    )]
    InvalidDurations { nominal: f64, overlap: f64 },

    #[error("append rejected: {reason}")]
    InvalidAppend { reason: String },
}
