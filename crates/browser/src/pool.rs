//! Single-active-context store: the browser process is launched once and reused across
//! switches; exactly one identity's context is alive at a time (§4.C, §5 resource lifetime).

use std::sync::Arc;

use chromiumoxide::Browser;
use tokio::sync::{Notify, RwLock};
use tracing::info;

use crate::{error::BrowserError, stages::PageController, types::BrowserConfig};

/// The currently active identity's context: its page controller plus the background-task
/// shutdown signal used to stop its health monitor and wake loop on switch-away.
pub struct ActiveContext {
    pub auth_index: u32,
    pub page: Arc<dyn PageController>,
    pub shutdown: Arc<Notify>,
}

/// Owns the single headless browser process and the currently active context, if any.
pub struct BrowserPool {
    config: BrowserConfig,
    browser: RwLock<Option<Browser>>,
    active: RwLock<Option<ActiveContext>>,
}

impl BrowserPool {
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            browser: RwLock::new(None),
            active: RwLock::new(None),
        }
    }

    pub async fn is_launched(&self) -> bool {
        self.browser.read().await.is_some()
    }

    /// Launches the browser process if it is not already running (§4.C step 1).
    pub async fn ensure_launched(&self) -> Result<(), BrowserError> {
        let mut guard = self.browser.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let cdp_config = chromiumoxide::BrowserConfig::builder()
            .args(self.config.launch_args())
            .build()
            .map_err(BrowserError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(cdp_config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        // The handler future must be polled continuously or the browser connection stalls;
        // drive it on its own task for the lifetime of the process.
        tokio::spawn(async move {
            use futures::StreamExt;
            while handler.next().await.is_some() {}
        });

        info!("browser process launched");
        *guard = Some(browser);
        Ok(())
    }

    /// Opens a fresh `about:blank` page against the running browser process (§4.C step 2).
    /// The caller preloads cookies and the stealth script before any navigation happens, so
    /// this deliberately does not navigate anywhere itself.
    pub async fn new_page(&self) -> Result<chromiumoxide::Page, BrowserError> {
        let guard = self.browser.read().await;
        let browser = guard.as_ref().ok_or(BrowserError::BrowserNotAvailable)?;
        browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))
    }

    /// Destroys the previously active context (if any) and installs `context` as current
    /// (§4.C step 3-4). Returns the replaced context so the caller can stop its background
    /// tasks and flush its identity state before dropping it.
    pub async fn swap_active(&self, context: ActiveContext) -> Option<ActiveContext> {
        let mut guard = self.active.write().await;
        let previous = guard.take();
        if let Some(prev) = &previous {
            prev.shutdown.notify_waiters();
        }
        *guard = Some(context);
        previous
    }

    pub async fn active_auth_index(&self) -> Option<u32> {
        self.active.read().await.as_ref().map(|c| c.auth_index)
    }

    pub async fn active_page(&self) -> Option<Arc<dyn PageController>> {
        self.active.read().await.as_ref().map(|c| c.page.clone())
    }

    pub async fn clear_active(&self) -> Option<ActiveContext> {
        let mut guard = self.active.write().await;
        let previous = guard.take();
        if let Some(prev) = &previous {
            prev.shutdown.notify_waiters();
        }
        previous
    }
}
