//! Health monitor (§4.C.2) and wake loop (§4.C.3): long-running background tasks tied to
//! the lifetime of a page, spawned once activation completes.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use rand::Rng;
use tokio::sync::Notify;
use tracing::debug;

use crate::{error::BrowserError, stages::PageController};

const HEALTH_TICK: Duration = Duration::from_secs(4);
const ANTI_IDLE_INTERVAL: Duration = Duration::from_secs(60);
const STATE_SAVE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SCROLL_CHANCE_PERCENT: u8 = 30;

const WAKE_LOOP_MIN_SLEEP: Duration = Duration::from_millis(500);
const WAKE_LOOP_MAX_SLEEP: Duration = Duration::from_secs(30);

/// Runs until `shutdown` fires. Ticks every [`HEALTH_TICK`], probabilistically performing a
/// human-like scroll/mouse trace, periodically an anti-idle click and a state save, and on
/// every tick dismissing known popups.
pub async fn health_monitor(
    page: Arc<dyn PageController>,
    save_state: impl Fn() -> Result<(), BrowserError> + Send + 'static,
    shutdown: Arc<Notify>,
) {
    let mut last_anti_idle = Instant::now();
    let mut last_state_save = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(HEALTH_TICK) => {}
            _ = shutdown.notified() => {
                debug!("health monitor shutting down");
                return;
            }
        }

        if rand::rng().random_range(0..100) < SCROLL_CHANCE_PERCENT {
            let _ = page.wake().await;
        }

        if last_anti_idle.elapsed() >= ANTI_IDLE_INTERVAL {
            let _ = page.wake().await;
            last_anti_idle = Instant::now();
        }

        if last_state_save.elapsed() >= STATE_SAVE_INTERVAL {
            if let Err(err) = save_state() {
                debug!(error = %err, "failed to save identity state on health tick");
            }
            last_state_save = Instant::now();
        }

        if let Err(err) = page.dismiss_popups().await {
            debug!(error = %err, "popup dismissal failed during health tick");
        }
    }
}

/// Notified when a user request arrives, so the wake loop can react immediately instead of
/// waiting out its current backoff (`notifyUserActivity()` in the distilled spec).
#[derive(Default)]
pub struct WakeNotifier {
    notify: Notify,
}

impl WakeNotifier {
    pub fn notify_user_activity(&self) {
        self.notify.notify_one();
    }
}

/// Scans for the "Launch" control and clicks it when present, sleeping progressively longer
/// (up to [`WAKE_LOOP_MAX_SLEEP`]) between scans when it is absent, but waking immediately on
/// [`WakeNotifier::notify_user_activity`].
pub async fn wake_loop(
    page: Arc<dyn PageController>,
    notifier: Arc<WakeNotifier>,
    shutdown: Arc<Notify>,
) {
    let mut backoff = WAKE_LOOP_MIN_SLEEP;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = notifier.notify.notified() => {
                backoff = WAKE_LOOP_MIN_SLEEP;
            }
            _ = shutdown.notified() => {
                debug!("wake loop shutting down");
                return;
            }
        }

        match page.click_launch_if_present().await {
            Ok(true) => {
                backoff = WAKE_LOOP_MIN_SLEEP;
            }
            Ok(false) | Err(_) => {
                backoff = (backoff * 2).min(WAKE_LOOP_MAX_SLEEP);
            }
        }
    }
}
