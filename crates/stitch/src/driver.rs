use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::decoder::Decoder;
use crate::player::Player;

/// Roughly one display frame at 60 Hz.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_micros(16_667);

/// Tick `player` every `frame_interval` until `token` is cancelled or the
/// player shuts down.
pub async fn run_render_loop<D: Decoder>(
    player: Arc<Mutex<Player<D>>>,
    frame_interval: Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(frame_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            now = interval.tick() => {
                let mut player = player.lock();
                if player.is_shut_down() {
                    break;
                }
                player.tick(now);
            }
        }
    }

    debug!("Render loop stopped");
}
