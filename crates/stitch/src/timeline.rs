//! Global time ⇄ (segment index, local offset) mapping and seek-bar state.

/// Position inside the playlist.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub index: usize,
    pub offset: f64,
}

/// Timeline math for `count` segments of `nominal` seconds each.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeline {
    nominal: f64,
    count: usize,
    epsilon: f64,
    /// Duration reported by the decoder, used when `nominal` is unbounded.
    source_duration: Option<f64>,
}

impl Timeline {
    pub fn new(nominal: f64, count: usize, epsilon: f64) -> Self {
        Self {
            nominal,
            count,
            epsilon,
            source_duration: None,
        }
    }

    /// Use the decoder-reported duration for single-source playlists.
    pub fn with_source_duration(mut self, duration: Option<f64>) -> Self {
        self.source_duration = duration.filter(|d| d.is_finite() && *d > 0.0);
        self
    }

    pub fn nominal(&self) -> f64 {
        self.nominal
    }

    /// Known duration of the whole timeline, never less than one second.
    pub fn total_duration(&self) -> f64 {
        let total = if self.nominal.is_finite() {
            self.count as f64 * self.nominal
        } else {
            self.source_duration.unwrap_or(0.0)
        };
        total.max(1.0)
    }

    /// Clamp into `[0, total - ε]`.
    pub fn clamp(&self, t: f64) -> f64 {
        if t.is_nan() {
            return 0.0;
        }
        let upper = (self.total_duration() - self.epsilon).max(0.0);
        t.clamp(0.0, upper)
    }

    /// Clamp `t` and split it into segment index and local offset.
    pub fn locate(&self, t: f64) -> Position {
        let t = self.clamp(t);
        if !self.nominal.is_finite() {
            return Position { index: 0, offset: t };
        }
        let index = (t / self.nominal).floor() as usize;
        let index = index.min(self.count.saturating_sub(1));
        Position {
            index,
            offset: t - index as f64 * self.nominal,
        }
    }

    /// Global time of `local` seconds into segment `index`.
    pub fn global_time(&self, index: usize, local: f64) -> f64 {
        if index == 0 {
            return local;
        }
        index as f64 * self.nominal + local
    }

    /// Time under a pointer at `fraction` (0..=1) of the seek bar.
    pub fn time_at_fraction(&self, fraction: f64) -> f64 {
        fraction.clamp(0.0, 1.0) * self.total_duration()
    }
}

/// Drag and hover state of the seek bar.
///
/// Dragging only previews a time; nothing is committed until the drag ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeekBar {
    drag_preview: Option<f64>,
    hover: Option<f64>,
}

impl SeekBar {
    pub fn is_dragging(&self) -> bool {
        self.drag_preview.is_some()
    }

    pub fn begin_drag(&mut self, t: f64) {
        self.drag_preview = Some(t);
    }

    /// Update the preview. Ignored unless a drag is in progress.
    pub fn drag_to(&mut self, t: f64) {
        if let Some(preview) = self.drag_preview.as_mut() {
            *preview = t;
        }
    }

    /// Finish the drag, returning the time to commit.
    pub fn end_drag(&mut self) -> Option<f64> {
        self.drag_preview.take()
    }

    pub fn cancel_drag(&mut self) {
        self.drag_preview = None;
    }

    pub fn drag_preview(&self) -> Option<f64> {
        self.drag_preview
    }

    pub fn hover(&mut self, t: Option<f64>) {
        self.hover = t;
    }

    pub fn hover_time(&self) -> Option<f64> {
        self.hover
    }
}

/// `MM:SS`, or `HH:MM:SS` when there are hours or `show_hours` is set.
/// Negative and non-finite inputs render as `00:00`.
pub fn format_time(seconds: f64, show_hours: bool) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "00:00".to_string();
    }
    let total = seconds.floor() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 || show_hours {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
