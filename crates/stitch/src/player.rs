//! The player state object.
//!
//! Everything mutable lives in [`Player`] and changes only inside
//! [`Player::tick`] or one of the control methods. Fetches run on tokio tasks
//! and report back through a channel drained at the start of every tick; each
//! result carries the generation it was started under and is dropped if a hard
//! reset happened in the meantime.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::SegmentCache;
use crate::config::PlayerConfig;
use crate::decoder::{Decoder, FullscreenController, PlaybackRejection, ReadyState};
use crate::error::{PlayerError, PlaylistError};
use crate::events::{PlayerEvent, SkipReason};
use crate::live::{LiveTail, sync_to_live_target};
use crate::playlist::{PlaylistChange, PlaylistController, PlaylistState};
use crate::reference::SegmentRef;
use crate::scheduler::{Boundary, DualDecoderScheduler, SlotId, boundary, crossfade};
use crate::timeline::{SeekBar, Timeline};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
enum LoadPurpose {
    /// First segment after a reset.
    Start,
    /// Preload into the idle slot.
    Next,
    /// Cross-segment seek into the active slot.
    Seek { offset: f64 },
}

#[derive(Debug)]
struct LoadCompletion {
    generation: u64,
    request: u64,
    index: usize,
    purpose: LoadPurpose,
    result: Result<Url, PlayerError>,
}

#[derive(Debug, Clone, Copy)]
struct PendingLoad {
    request: u64,
    index: usize,
}

/// A source assigned to the active slot, waiting until it is seekable.
#[derive(Debug, Clone, Copy)]
struct Activation {
    index: usize,
    offset: f64,
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    at: Instant,
    index: usize,
    purpose: LoadPurpose,
}

/// Everything a UI needs to render one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub current_time: f64,
    pub total_duration: f64,
    /// Global time up to which the active segment is buffered.
    pub buffered: f64,
    pub index: usize,
    pub segment_count: usize,
    pub active_slot: SlotId,
    pub is_playing: bool,
    pub is_loading: bool,
    pub is_live: bool,
    pub live_waiting: bool,
    pub needs_unmute: bool,
    pub muted: bool,
    pub volume: f64,
    pub is_fullscreen: bool,
    pub controls_visible: bool,
    pub dragging: bool,
    pub hover_time: Option<f64>,
    pub ended: bool,
    pub error: Option<PlayerError>,
    /// Poster to show; only set while the first segment is active.
    pub poster: Option<Url>,
    pub generation: u64,
}

/// Gapless segmented player over two decoders.
pub struct Player<D> {
    config: PlayerConfig,
    cache: Arc<SegmentCache>,
    playlist: PlaylistController,
    scheduler: DualDecoderScheduler<D>,
    fullscreen: Option<Box<dyn FullscreenController>>,

    index: usize,
    generation: u64,
    next_request: u64,
    completions_tx: mpsc::UnboundedSender<LoadCompletion>,
    completions_rx: mpsc::UnboundedReceiver<LoadCompletion>,
    pending_active: Option<PendingLoad>,
    pending_next: Option<PendingLoad>,
    activation: Option<Activation>,
    staged_next: Option<(usize, Url)>,
    preload_at: Option<Instant>,
    retry: Option<Retry>,
    seek_target: Option<f64>,
    skipped: HashSet<usize>,

    live: LiveTail,
    seek_bar: SeekBar,

    volume: f64,
    muted: bool,
    needs_unmute: bool,
    wants_play: bool,
    loading: bool,
    ended: bool,
    error: Option<PlayerError>,
    consecutive_decode_errors: u32,
    /// Failed loads in a row, reset by any successful load.
    load_failures: u32,
    /// A reload was already spent on failing loads; cleared by a successful load.
    reloaded_after_failures: bool,
    poster: Option<Url>,
    controls_visible: bool,
    last_activity: Option<Instant>,
    now: Option<Instant>,

    events: broadcast::Sender<PlayerEvent>,
    shutdown: CancellationToken,
    tasks: CancellationToken,
}

impl<D: Decoder> Player<D> {
    pub fn new(config: PlayerConfig, cache: Arc<SegmentCache>, a: D, b: D) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let tasks = shutdown.child_token();
        let volume = config.initial_volume.clamp(0.0, 1.0);

        Self {
            playlist: PlaylistController::new(config.overlap_duration),
            scheduler: DualDecoderScheduler::new(a, b),
            fullscreen: None,
            index: 0,
            generation: 0,
            next_request: 0,
            completions_tx,
            completions_rx,
            pending_active: None,
            pending_next: None,
            activation: None,
            staged_next: None,
            preload_at: None,
            retry: None,
            seek_target: None,
            skipped: HashSet::new(),
            live: LiveTail::default(),
            seek_bar: SeekBar::default(),
            volume,
            muted: false,
            needs_unmute: false,
            wants_play: config.autoplay,
            loading: false,
            ended: false,
            error: None,
            consecutive_decode_errors: 0,
            load_failures: 0,
            reloaded_after_failures: false,
            poster: None,
            controls_visible: true,
            last_activity: None,
            now: None,
            events,
            shutdown,
            tasks,
            cache,
            config,
        }
    }

    pub fn with_fullscreen(mut self, controller: Box<dyn FullscreenController>) -> Self {
        self.fullscreen = Some(controller);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); pass it to the render loop.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    pub fn playlist(&self) -> &PlaylistController {
        &self.playlist
    }

    pub fn scheduler(&self) -> &DualDecoderScheduler<D> {
        &self.scheduler
    }

    /// Host access to a decoder, e.g. to feed it frames or a clock.
    pub fn decoder_mut(&mut self, id: SlotId) -> &mut D {
        self.scheduler.decoder_mut(id)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    // ========== Playlist ==========

    /// Replace the playlist with `raw`, restarting playback from the beginning.
    pub fn load(&mut self, raw: &str) -> Result<PlaylistChange, PlaylistError> {
        let change = self.playlist.load(raw)?;
        self.hard_reset();
        self.apply_loaded(change);
        Ok(change)
    }

    /// Apply a new version of the reference: live appends keep playing, anything
    /// else that differs resets.
    pub fn update(&mut self, raw: &str) -> Result<PlaylistChange, PlaylistError> {
        if self.playlist.state() == PlaylistState::Empty {
            return self.load(raw);
        }

        let change = self.playlist.update(raw)?;
        match change {
            PlaylistChange::Reset | PlaylistChange::WaitingForStream => {
                self.hard_reset();
                self.apply_loaded(change);
            }
            PlaylistChange::Appended { from, added } => self.on_appended(from, added),
            PlaylistChange::Unchanged => {}
        }
        Ok(change)
    }

    fn apply_loaded(&mut self, change: PlaylistChange) {
        match change {
            PlaylistChange::Reset => {
                if let Some(playlist) = self.playlist.playlist() {
                    self.emit(PlayerEvent::PlaylistReset {
                        segments: playlist.len(),
                        nominal_duration: playlist.nominal_duration(),
                        is_live: playlist.is_live(),
                    });
                }
                self.start_at(0);
            }
            PlaylistChange::WaitingForStream => {
                let now = self.clock();
                self.enter_live_wait(now);
            }
            PlaylistChange::Appended { .. } | PlaylistChange::Unchanged => {}
        }
    }

    fn on_appended(&mut self, from: usize, added: usize) {
        self.emit(PlayerEvent::SegmentsAppended { from, added });

        if self.live.is_waiting() {
            self.clear_live_wait();
            self.set_loading(from);
            self.request_next_now();
        } else if self.index + 1 >= from && self.preload_at.is_none() {
            self.request_next_now();
        }
        self.prefetch_upcoming();
    }

    /// Drop all playback state and cached media. The playlist itself is kept.
    fn hard_reset(&mut self) {
        self.generation += 1;
        self.tasks.cancel();
        self.tasks = self.shutdown.child_token();
        while self.completions_rx.try_recv().is_ok() {}

        self.cache.release_all();
        self.scheduler.reset();

        self.index = 0;
        self.pending_active = None;
        self.pending_next = None;
        self.activation = None;
        self.staged_next = None;
        self.preload_at = None;
        self.retry = None;
        self.seek_target = None;
        self.skipped.clear();
        self.live.clear();
        self.seek_bar.cancel_drag();
        self.loading = false;
        self.ended = false;
        self.error = None;
        self.consecutive_decode_errors = 0;
        self.load_failures = 0;

        info!(generation = self.generation, "Player reset");
    }

    fn start_at(&mut self, index: usize) {
        match self.next_playable(index) {
            Some(index) => {
                self.loading = true;
                self.request(index, LoadPurpose::Start);
            }
            None => self.on_playlist_exhausted(),
        }
    }

    // ========== Loading ==========

    fn request(&mut self, index: usize, purpose: LoadPurpose) {
        let Some(segment) = self.segment_at(index) else {
            return;
        };

        let Ok(runtime) = Handle::try_current() else {
            warn!(index, "No async runtime available, cannot load segment");
            self.error = Some(PlayerError::internal("no async runtime available"));
            return;
        };

        self.next_request += 1;
        let pending = PendingLoad {
            request: self.next_request,
            index,
        };
        match purpose {
            LoadPurpose::Next => self.pending_next = Some(pending),
            LoadPurpose::Start | LoadPurpose::Seek { .. } => self.pending_active = Some(pending),
        }

        let cache = Arc::clone(&self.cache);
        let tx = self.completions_tx.clone();
        let token = self.tasks.clone();
        let generation = self.generation;
        let request = pending.request;

        debug!(index, ?purpose, generation, "Requesting segment");
        runtime.spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = cache.get_or_fetch(&segment) => result,
            };
            let _ = tx.send(LoadCompletion {
                generation,
                request,
                index,
                purpose,
                result,
            });
        });
    }

    /// Load the next playable segment into the idle slot now, unless it is
    /// already there or on its way.
    fn request_next_now(&mut self) {
        self.preload_at = None;
        let Some(next) = self.next_playable(self.index + 1) else {
            return;
        };
        let already = self.scheduler.idle_holds(next)
            || self.pending_next.is_some_and(|p| p.index == next)
            || self.staged_next.as_ref().is_some_and(|(i, _)| *i == next)
            || self.retry.is_some_and(|r| r.index == next && r.purpose == LoadPurpose::Next);
        if !already {
            self.request(next, LoadPurpose::Next);
        }
    }

    fn prefetch_upcoming(&self) {
        if Handle::try_current().is_err() {
            return;
        }
        let upcoming: Vec<SegmentRef> = ((self.index + 1)..self.playlist.len())
            .filter(|i| !self.skipped.contains(i))
            .filter_map(|i| self.segment_at(i))
            .collect();
        self.cache.prefetch(upcoming);
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.on_completion(completion);
        }
    }

    fn on_completion(&mut self, completion: LoadCompletion) {
        let LoadCompletion {
            generation,
            request,
            index,
            purpose,
            result,
        } = completion;

        if generation != self.generation {
            debug!(index, generation, current = self.generation, "Dropping stale load result");
            return;
        }

        let pending = match purpose {
            LoadPurpose::Next => &mut self.pending_next,
            LoadPurpose::Start | LoadPurpose::Seek { .. } => &mut self.pending_active,
        };
        if pending.is_none_or(|p| p.request != request) {
            debug!(index, request, "Dropping superseded load result");
            return;
        }
        *pending = None;

        let url = match result {
            Ok(url) => url,
            Err(e) => return self.on_load_failed(index, purpose, e),
        };
        self.load_failures = 0;
        self.reloaded_after_failures = false;

        match purpose {
            LoadPurpose::Next => self.stage_next(index, url),
            LoadPurpose::Start => self.activate(index, 0.0, &url),
            LoadPurpose::Seek { offset } => self.activate(index, offset, &url),
        }
    }

    fn activate(&mut self, index: usize, offset: f64, url: &Url) {
        self.scheduler.finish_tail();
        let active = self.scheduler.active_id();
        self.scheduler.assign(active, index, url);
        self.activation = Some(Activation { index, offset });
    }

    fn stage_next(&mut self, index: usize, url: Url) {
        if self.next_playable(self.index + 1) != Some(index) {
            debug!(index, current = self.index, "Preloaded segment no longer next");
            return;
        }
        if self.scheduler.tail().is_some() {
            self.staged_next = Some((index, url));
        } else {
            let idle = self.scheduler.idle_id();
            self.scheduler.assign(idle, index, &url);
        }
    }

    fn on_load_failed(&mut self, index: usize, purpose: LoadPurpose, err: PlayerError) {
        if err.is_superseded() {
            debug!(index, error = %err, "Load superseded");
            return;
        }

        if err.is_skippable() {
            self.skip(index, SkipReason::Unresolvable(err.to_string()));
            self.skip_failed_load(index, purpose);
            return;
        }

        if !err.is_retryable() {
            if self.playlist.is_live() {
                self.skip(index, SkipReason::LoadFailed(err.to_string()));
                self.skip_failed_load(index, purpose);
            } else {
                self.fail(err);
            }
            return;
        }

        self.load_failures += 1;
        if self.load_failures > self.config.max_load_retries {
            warn!(index, failures = self.load_failures, error = %err, "Segment keeps failing to load");
            if self.reloaded_after_failures {
                self.fail(err);
            } else {
                self.reloaded_after_failures = true;
                self.reload_reference();
            }
            return;
        }

        warn!(index, attempt = self.load_failures, error = %err, "Segment load failed, retrying");
        if purpose != LoadPurpose::Next {
            self.set_loading(index);
        }
        self.retry = Some(Retry {
            at: self.clock() + self.config.retry_delay(),
            index,
            purpose,
        });
    }

    /// Move past a segment that was dropped while loading.
    fn skip_failed_load(&mut self, index: usize, purpose: LoadPurpose) {
        match purpose {
            LoadPurpose::Next => self.request_next_now(),
            LoadPurpose::Start | LoadPurpose::Seek { .. } => match self.next_playable(index + 1) {
                Some(next) => self.request(next, LoadPurpose::Seek { offset: 0.0 }),
                None => self.on_playlist_exhausted(),
            },
        }
    }

    /// Hard reset from the last reference that was loaded.
    fn reload_reference(&mut self) {
        if let Some(raw) = self.playlist.reference().map(str::to_string)
            && let Err(e) = self.load(&raw)
        {
            error!(error = %e, "Failed to reload playlist");
        }
    }

    /// Stop playback on an unrecoverable error.
    fn fail(&mut self, err: PlayerError) {
        error!(index = self.index, error = %err, "Playback failed");
        self.wants_play = false;
        self.loading = false;
        self.retry = None;
        self.scheduler.pause_all();
        self.error = Some(err.clone());
        self.emit(PlayerEvent::Error { error: err });
    }

    fn skip(&mut self, index: usize, reason: SkipReason) {
        warn!(index, ?reason, "Skipping segment");
        self.skipped.insert(index);
        self.emit(PlayerEvent::SegmentSkipped { index, reason });
    }

    fn on_playlist_exhausted(&mut self) {
        self.loading = false;
        if self.playlist.is_live() {
            let now = self.clock();
            self.enter_live_wait(now);
        } else {
            self.finish_playback();
        }
    }

    // ========== Render loop ==========

    /// Advance the player by one frame.
    pub fn tick(&mut self, now: Instant) {
        if self.is_shut_down() {
            return;
        }
        self.now = Some(now);

        self.drain_completions();
        self.poll_decoder_errors();
        self.poll_retry(now);
        self.poll_activation();
        self.poll_preload(now);
        self.assign_staged();
        self.poll_boundary(now);
        self.mix_volumes();
        self.update_controls(now);
    }

    fn poll_decoder_errors(&mut self) {
        for id in [SlotId::A, SlotId::B] {
            if let Some(message) = self.scheduler.decoder_mut(id).take_error() {
                let index = self.scheduler.segment(id);
                self.handle_decode_error(id, index, message);
            }
        }
    }

    fn handle_decode_error(&mut self, slot: SlotId, index: Option<usize>, message: String) {
        let Some(index) = index else {
            return;
        };
        self.consecutive_decode_errors += 1;

        if self.consecutive_decode_errors >= self.config.max_consecutive_decode_errors {
            warn!(
                index,
                errors = self.consecutive_decode_errors,
                "Repeated decode errors, reloading playlist"
            );
            self.reload_reference();
            return;
        }

        let err = PlayerError::decode(index, message);
        if !self.playlist.is_live() {
            debug!(slot = %slot, "Decoder failure is terminal for VOD");
            self.fail(err);
            return;
        }

        self.skip(index, SkipReason::DecodeFailed(err.to_string()));
        if slot == self.scheduler.active_id() {
            self.activation = None;
            match self.next_playable(index + 1) {
                Some(next) => {
                    self.set_loading(next);
                    self.request(next, LoadPurpose::Seek { offset: 0.0 });
                }
                None => {
                    let now = self.clock();
                    self.enter_live_wait(now);
                }
            }
        } else {
            self.scheduler.release_idle_unless(None);
            self.request_next_now();
        }
    }

    fn poll_retry(&mut self, now: Instant) {
        let Some(retry) = self.retry.filter(|r| r.at <= now) else {
            return;
        };
        self.retry = None;
        if retry.purpose == LoadPurpose::Next {
            self.request_next_now();
        } else {
            self.request(retry.index, retry.purpose);
        }
    }

    fn poll_activation(&mut self) {
        let Some(activation) = self.activation else {
            return;
        };
        if self.scheduler.active_decoder().ready_state() < ReadyState::Metadata {
            return;
        }
        self.activation = None;

        if activation.offset > 0.0 {
            self.scheduler
                .active_decoder_mut()
                .set_current_time(activation.offset);
        }
        self.index = activation.index;
        self.loading = false;
        self.ended = false;
        self.seek_target = None;

        let next = self.next_playable(self.index + 1);
        self.scheduler.release_idle_unless(next);
        self.staged_next = None;
        self.clear_live_wait();

        debug!(index = self.index, offset = activation.offset, "Segment active");
        if self.wants_play {
            self.try_play_active();
        }
        self.request_next_now();
        self.prefetch_upcoming();
    }

    fn poll_preload(&mut self, now: Instant) {
        if self.preload_at.is_some_and(|at| at <= now) {
            self.request_next_now();
        }
    }

    fn assign_staged(&mut self) {
        if self.scheduler.tail().is_some() {
            return;
        }
        let Some((index, url)) = self.staged_next.take() else {
            return;
        };
        if self.next_playable(self.index + 1) == Some(index) {
            let idle = self.scheduler.idle_id();
            self.scheduler.assign(idle, index, &url);
        }
    }

    fn poll_boundary(&mut self, now: Instant) {
        if self.activation.is_some() || self.pending_active.is_some() {
            return;
        }
        let active = self.scheduler.active_id();
        if self.scheduler.segment(active) != Some(self.index) {
            return;
        }

        for id in [active, active.other()] {
            if let Some((index, duration)) = self.scheduler.take_length_check(id) {
                self.check_segment_length(index, duration);
            }
        }

        let nominal = self.nominal();
        let decoder = self.scheduler.active_decoder();
        let local = decoder.current_time();
        let active_ended = decoder.is_ended();

        let Some(next) = self.next_playable(self.index + 1) else {
            if active_ended {
                self.on_playlist_exhausted();
            }
            return;
        };

        let position = boundary(local, nominal, self.config.preroll_window);
        if position == Boundary::Playing && !active_ended {
            return;
        }

        if !self.scheduler.idle_holds(next) {
            if self.staged_next.as_ref().is_some_and(|(i, _)| *i == next) {
                self.scheduler.finish_tail();
                self.assign_staged();
            } else {
                self.request_next_now();
            }
        }

        if self.wants_play
            && let Err(rejection) = self.scheduler.preroll()
        {
            debug!(index = next, ?rejection, "Preroll rejected");
        }

        if position == Boundary::Switch || active_ended {
            if self.scheduler.idle_ready(next) {
                self.switch_to(next, now);
            } else {
                self.set_loading(next);
            }
        }
    }

    fn switch_to(&mut self, next: usize, now: Instant) {
        let keep_tail = self.config.overlap_duration > 0.0;
        let new = self.scheduler.switch(keep_tail, self.nominal());
        self.index = next;
        self.loading = false;
        self.consecutive_decode_errors = 0;

        if self.scheduler.tail().is_none() {
            let desired = self.desired_volume();
            self.scheduler.active_decoder_mut().set_volume(desired);
        }
        if self.wants_play && self.scheduler.active_decoder().is_paused() {
            self.try_play_active();
        }

        self.preload_at = Some(now + self.preload_delay(next));
        self.prefetch_upcoming();

        debug!(index = next, slot = %new, "Switched to next segment");
        self.emit(PlayerEvent::SegmentSwitched { index: next });
    }

    fn mix_volumes(&mut self) {
        let desired = self.desired_volume();

        let Some(tail) = self.scheduler.tail() else {
            let active = self.scheduler.active_decoder_mut();
            if (active.volume() - desired).abs() > self.config.volume_tolerance {
                active.set_volume(desired);
            }
            return;
        };

        let outgoing = self.scheduler.decoder(tail);
        let fade = crossfade(
            desired,
            outgoing.current_time(),
            self.nominal(),
            self.config.overlap_duration,
        );

        if outgoing.is_ended() && fade.progress < 1.0 {
            warn!(
                index = self.index.saturating_sub(1),
                progress = fade.progress,
                "Overlap tail ended before crossfade completed"
            );
            self.scheduler.finish_tail();
            self.scheduler.active_decoder_mut().set_volume(desired);
            return;
        }

        self.scheduler.active_decoder_mut().set_volume(fade.incoming);
        self.scheduler.decoder_mut(tail).set_volume(fade.outgoing);
        if fade.progress >= 1.0 {
            self.scheduler.finish_tail();
        }
    }

    fn update_controls(&mut self, now: Instant) {
        let last = *self.last_activity.get_or_insert(now);
        self.controls_visible = !self.wants_play
            || self.seek_bar.is_dragging()
            || now.saturating_duration_since(last) < self.config.controls_hide_after();
    }

    fn check_segment_length(&self, index: usize, duration: f64) {
        let nominal = self.nominal();
        if !nominal.is_finite() {
            return;
        }
        let expected = nominal + self.config.overlap_duration;
        let is_final_vod = !self.playlist.is_live() && index + 1 == self.playlist.len();
        if is_final_vod && duration <= expected {
            return;
        }
        if (duration - expected).abs() > self.config.segment_length_tolerance {
            warn!(index, duration, expected, "Segment length does not match nominal + overlap");
        }
    }

    fn try_play_active(&mut self) {
        let rejection = match self.scheduler.active_decoder_mut().play() {
            Ok(()) => return,
            Err(rejection) => rejection,
        };

        match rejection {
            PlaybackRejection::AutoplayBlocked => {
                let can_fall_back = self.playlist.is_live() && !self.muted && !self.needs_unmute;
                if can_fall_back {
                    self.needs_unmute = true;
                    self.scheduler.set_muted(true);
                    if self.scheduler.active_decoder_mut().play().is_ok() {
                        warn!("Unmuted autoplay blocked, playing muted");
                        self.emit(PlayerEvent::AutoplayBlocked {
                            muted_fallback: true,
                        });
                        return;
                    }
                }
                warn!("Autoplay blocked");
                self.wants_play = false;
                self.emit(PlayerEvent::AutoplayBlocked {
                    muted_fallback: false,
                });
            }
            PlaybackRejection::Failed(reason) => {
                let active = self.scheduler.active_id();
                let index = self.scheduler.segment(active);
                self.handle_decode_error(active, index, reason);
            }
        }
    }

    // ========== Controls ==========

    pub fn play(&mut self) {
        self.scheduler.notify_user_gesture();
        self.wants_play = true;
        if self.ended {
            self.seek(0.0);
            return;
        }
        if self.activation.is_some() || self.live.is_waiting() {
            return;
        }
        if self.scheduler.segment(self.scheduler.active_id()).is_some() {
            self.try_play_active();
        }
        if let Some(tail) = self.scheduler.tail()
            && let Err(rejection) = self.scheduler.decoder_mut(tail).play()
        {
            debug!(slot = %tail, ?rejection, "Overlap tail did not resume");
        }
    }

    pub fn pause(&mut self) {
        self.wants_play = false;
        self.scheduler.pause_all();
    }

    pub fn toggle_play(&mut self) {
        if self.wants_play && !self.ended {
            self.pause();
        } else {
            self.play();
        }
    }

    pub fn toggle_mute(&mut self) {
        self.scheduler.notify_user_gesture();
        if self.needs_unmute {
            self.unmute();
            return;
        }
        self.muted = !self.muted;
        self.scheduler.set_muted(self.muted);
    }

    /// Answer the "tap to unmute" prompt.
    pub fn unmute(&mut self) {
        self.scheduler.notify_user_gesture();
        self.needs_unmute = false;
        self.muted = false;
        self.scheduler.set_muted(false);
        if self.wants_play
            && self.activation.is_none()
            && self.scheduler.active_decoder().source().is_some()
            && self.scheduler.active_decoder().is_paused()
            && !self.live.is_waiting()
        {
            self.try_play_active();
        }
    }

    /// Set the output volume; zero also mutes.
    pub fn set_volume(&mut self, volume: f64) {
        self.volume = volume.clamp(0.0, 1.0);
        self.muted = self.volume == 0.0;
        self.scheduler.set_muted(self.muted || self.needs_unmute);
    }

    pub fn toggle_fullscreen(&mut self) -> Result<(), PlayerError> {
        let controller = self
            .fullscreen
            .as_mut()
            .ok_or_else(|| PlayerError::configuration("no fullscreen controller attached"))?;
        if controller.is_fullscreen() {
            controller.exit_fullscreen()
        } else {
            controller.request_fullscreen()
        }
    }

    /// Seek to global time `t`, clamped to the known timeline.
    pub fn seek(&mut self, t: f64) {
        if self.playlist.is_empty() {
            return;
        }
        let timeline = self.timeline();
        let t = timeline.clamp(t);
        let position = timeline.locate(t);
        self.ended = false;

        let active = self.scheduler.active_id();
        let same_segment = position.index == self.index
            && self.activation.is_none()
            && self.pending_active.is_none()
            && self.scheduler.segment(active) == Some(self.index);

        if same_segment {
            self.scheduler.finish_tail();
            self.scheduler
                .active_decoder_mut()
                .set_current_time(position.offset);
            if position.offset < self.nominal() - self.config.preroll_window {
                self.scheduler.rewind_idle();
            }
            if self.live.is_waiting() {
                self.clear_live_wait();
                self.wants_play = true;
            }
            if self.wants_play && self.scheduler.active_decoder().is_paused() {
                self.try_play_active();
            }
            debug!(t, index = position.index, offset = position.offset, "Seek within segment");
            return;
        }

        let Some(target) = self.next_playable(position.index) else {
            return;
        };
        let offset = if target == position.index {
            position.offset
        } else {
            0.0
        };

        self.scheduler.pause_all();
        self.wants_play = true;
        self.activation = None;
        self.pending_next = None;
        self.staged_next = None;
        self.preload_at = None;
        self.retry = None;
        self.seek_target = Some(t);
        self.set_loading(target);
        debug!(t, index = target, offset, "Seek across segments");
        self.request(target, LoadPurpose::Seek { offset });
    }

    /// Seek relative to the current position.
    pub fn step(&mut self, delta: f64) {
        let current = self.current_time();
        self.seek(current + delta);
    }

    /// Keyboard arrow step.
    pub fn keyboard_step(&mut self, forward: bool) {
        let step = self.config.keyboard_step;
        self.step(if forward { step } else { -step });
    }

    /// Skip button.
    pub fn skip_step(&mut self, forward: bool) {
        let step = self.config.skip_step;
        self.step(if forward { step } else { -step });
    }

    /// Jump to just behind the live edge and resume.
    pub fn sync_to_live(&mut self) {
        let Some(playlist) = self.playlist.playlist() else {
            return;
        };
        let Some(target) = sync_to_live_target(
            playlist.len(),
            playlist.nominal_duration(),
            self.config.live_edge_offset,
        ) else {
            return;
        };
        self.scheduler.notify_user_gesture();
        self.wants_play = true;
        self.seek(target);
    }

    pub fn begin_drag(&mut self, t: f64) {
        let t = self.timeline().clamp(t);
        self.seek_bar.begin_drag(t);
    }

    pub fn drag_to(&mut self, t: f64) {
        let t = self.timeline().clamp(t);
        self.seek_bar.drag_to(t);
    }

    /// Commit the drag preview as a seek.
    pub fn end_drag(&mut self) {
        if let Some(t) = self.seek_bar.end_drag() {
            self.seek(t);
        }
    }

    pub fn hover(&mut self, t: Option<f64>) {
        let t = t.map(|t| self.timeline().clamp(t));
        self.seek_bar.hover(t);
    }

    pub fn pointer_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
        self.controls_visible = true;
    }

    pub fn set_poster(&mut self, poster: Option<Url>) {
        self.poster = poster;
    }

    /// Stop everything: cancel the render loop and pending loads, release media.
    pub fn shutdown(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.generation += 1;
        self.cache.release_all();
        self.scheduler.reset();
        self.pending_active = None;
        self.pending_next = None;
        self.activation = None;
        self.staged_next = None;
        self.preload_at = None;
        self.retry = None;
        info!(generation = self.generation, "Player shut down");
    }

    // ========== Queries ==========

    pub fn timeline(&self) -> Timeline {
        let timeline = Timeline::new(self.nominal(), self.playlist.len(), self.config.seek_epsilon);
        if self.nominal().is_finite() {
            timeline
        } else {
            timeline.with_source_duration(self.scheduler.active_decoder().duration())
        }
    }

    /// Global playback position, derived from the active decoder.
    pub fn current_time(&self) -> f64 {
        if let Some(t) = self.seek_target {
            return t;
        }
        if self.scheduler.segment(self.scheduler.active_id()).is_none() {
            return 0.0;
        }
        self.timeline()
            .global_time(self.index, self.scheduler.active_decoder().current_time())
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        let timeline = self.timeline();
        let active = self.scheduler.active_decoder();
        let buffered = active
            .buffered_end()
            .map(|end| timeline.global_time(self.index, end))
            .unwrap_or(0.0);
        let current_time = self
            .seek_bar
            .drag_preview()
            .unwrap_or_else(|| self.current_time());

        PlayerSnapshot {
            current_time,
            total_duration: timeline.total_duration(),
            buffered,
            index: self.index,
            segment_count: self.playlist.len(),
            active_slot: self.scheduler.active_id(),
            is_playing: self.wants_play
                && !self.loading
                && !self.live.is_waiting()
                && !self.ended
                && self.error.is_none(),
            is_loading: self.loading,
            is_live: self.playlist.is_live(),
            live_waiting: self.live.is_waiting(),
            needs_unmute: self.needs_unmute,
            muted: self.muted,
            volume: self.volume,
            is_fullscreen: self.fullscreen.as_ref().is_some_and(|f| f.is_fullscreen()),
            controls_visible: self.controls_visible,
            dragging: self.seek_bar.is_dragging(),
            hover_time: self.seek_bar.hover_time(),
            ended: self.ended,
            error: self.error.clone(),
            poster: self.poster.clone().filter(|_| self.index == 0),
            generation: self.generation,
        }
    }

    // ========== Helpers ==========

    fn nominal(&self) -> f64 {
        self.playlist
            .playlist()
            .map_or(crate::config::DEFAULT_SEGMENT_DURATION, |p| p.nominal_duration())
    }

    fn segment_at(&self, index: usize) -> Option<SegmentRef> {
        self.playlist.playlist()?.get(index).cloned()
    }

    /// First index at or after `from` that has not been skipped.
    fn next_playable(&self, from: usize) -> Option<usize> {
        (from..self.playlist.len()).find(|i| !self.skipped.contains(i))
    }

    fn preload_delay(&self, index: usize) -> Duration {
        if index == 0 {
            Duration::ZERO
        } else {
            self.config.preload_delay()
        }
    }

    fn desired_volume(&self) -> f64 {
        if self.muted || self.needs_unmute {
            0.0
        } else {
            self.volume
        }
    }

    fn set_loading(&mut self, index: usize) {
        if !self.loading {
            self.loading = true;
            debug!(index, "Buffering");
            self.emit(PlayerEvent::Buffering { index });
        }
    }

    fn enter_live_wait(&mut self, now: Instant) {
        self.loading = false;
        if self.live.enter(now) {
            info!(index = self.index, "Reached live edge, waiting for new segments");
            self.emit(PlayerEvent::LiveWaitEntered);
        }
    }

    fn clear_live_wait(&mut self) {
        let now = self.clock();
        if let Some(waited) = self.live.waited(now) {
            self.live.clear();
            info!(waited_ms = waited.as_millis() as u64, "Live wait cleared");
            self.emit(PlayerEvent::LiveWaitCleared { waited });
        }
    }

    fn finish_playback(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.wants_play = false;
        self.loading = false;
        self.scheduler.pause_all();
        info!(index = self.index, "Playback ended");
        self.emit(PlayerEvent::Ended);
    }

    fn clock(&self) -> Instant {
        self.now.unwrap_or_else(Instant::now)
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }
}

impl<D> Drop for Player<D> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
