use crate::api::TimelineState;
use crate::ipc::PlayerHandle;
use crate::media::MediaItem;
use log::{debug, warn};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Position must move by more than this before an update is pushed, which
/// dampens write amplification on the server.
const REPORT_DELTA_SECS: f64 = 5.0;

fn to_ms(pos_secs: f64) -> u64 {
    (pos_secs.max(0.0) * 1000.0).round() as u64
}

/// Where timeline updates land; the API client in production, a capture
/// buffer in tests.
pub trait TimelineSink: Send + Sync {
    fn post(
        &self,
        rating_key: &str,
        state: TimelineState,
        time_ms: u64,
        duration_ms: u64,
    ) -> impl Future<Output = ()> + Send;
}

impl TimelineSink for crate::api::PlexClient {
    async fn post(&self, rating_key: &str, state: TimelineState, time_ms: u64, duration_ms: u64) {
        self.update_timeline(rating_key, state, time_ms, duration_ms).await;
    }
}

/// Polls the player once a second and reports playback state back to the
/// server. Exits when cancelled (flushing a final `stopped` update) or when
/// the player stops answering (assumed exited, returns silently).
pub struct ProgressTracker<P, S> {
    player: P,
    sink: S,
    items: Vec<MediaItem>,
    interval: Duration,
    cancel: CancellationToken,
}

impl<P: PlayerHandle, S: TimelineSink> ProgressTracker<P, S> {
    pub fn new(player: P, sink: S, items: Vec<MediaItem>, cancel: CancellationToken) -> Self {
        Self {
            player,
            sink,
            items,
            interval: POLL_INTERVAL,
            cancel,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Returns the last observed (item path, position) so the caller can
    /// record it in the resume store.
    pub async fn run(self) -> Option<(String, u64)> {
        let mut index: i64 = 0;
        let mut last_reported: Option<f64> = None;
        let mut last_pos: f64 = 0.0;
        let mut seen_any = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let current = match self.player.playlist_pos().await {
                Ok(i) => i,
                Err(_) => {
                    debug!("player went away, tracker exiting");
                    return self.last_observed(index, last_pos, seen_any);
                }
            };

            if seen_any && current != index {
                // Item advanced: close out the previous one where we left it.
                self.post_stopped(index, last_pos).await;
                last_reported = None;
            }
            index = current;

            let pos = match self.player.time_pos().await {
                Ok(p) => p,
                Err(_) => {
                    debug!("player went away, tracker exiting");
                    return self.last_observed(index, last_pos, seen_any);
                }
            };
            last_pos = pos;
            seen_any = true;

            let movement = match last_reported {
                None => true,
                Some(reported) => (pos - reported).abs() > REPORT_DELTA_SECS,
            };
            if !movement {
                continue;
            }

            let state = match self.player.paused().await {
                Ok(true) => TimelineState::Paused,
                _ => TimelineState::Playing,
            };
            self.post(index, state, pos).await;
            last_reported = Some(pos);
        }

        if seen_any {
            self.post_stopped(index, last_pos).await;
        }
        self.last_observed(index, last_pos, seen_any)
    }

    async fn post(&self, index: i64, state: TimelineState, pos_secs: f64) {
        let Some(item) = self.item_at(index) else {
            return;
        };
        let Some(rating_key) = item.rating_key() else {
            warn!("{}: non-numeric rating key, skipping timeline update", item.path);
            return;
        };
        let duration_ms = match self.player.duration().await {
            Ok(d) if d > 0.0 => (d * 1000.0) as u64,
            _ => item.duration_ms,
        };
        self.sink
            .post(rating_key, state, to_ms(pos_secs), duration_ms)
            .await;
    }

    async fn post_stopped(&self, index: i64, pos_secs: f64) {
        let Some(item) = self.item_at(index) else {
            return;
        };
        let Some(rating_key) = item.rating_key() else {
            warn!("{}: non-numeric rating key, skipping timeline update", item.path);
            return;
        };
        self.sink
            .post(
                rating_key,
                TimelineState::Stopped,
                to_ms(pos_secs),
                item.duration_ms,
            )
            .await;
    }

    fn item_at(&self, index: i64) -> Option<&MediaItem> {
        usize::try_from(index).ok().and_then(|i| self.items.get(i))
    }

    fn last_observed(&self, index: i64, pos_secs: f64, seen_any: bool) -> Option<(String, u64)> {
        if !seen_any {
            return None;
        }
        self.item_at(index)
            .map(|item| (item.path.clone(), to_ms(pos_secs)))
    }
}
