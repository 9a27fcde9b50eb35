//! Identity activation (§4.C) and agent injection (§4.C.1) control flow.
//!
//! The actual DOM/CDP work is behind the [`PageController`] trait so the orchestration in
//! [`activate`] can be unit-tested against a fake implementation (§13) without a real browser.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    error::{ActivationStage, BrowserError},
    types::{ActivationOutcome, EditorFlavor, Identity},
};

const EDITOR_LOAD_TIMEOUT: Duration = Duration::from_secs(60);
const CODE_CONTROL_TIMEOUT: Duration = Duration::from_secs(60);
const AGENT_INIT_TIMEOUT: Duration = Duration::from_secs(90);
const REMIX_SUBMIT_MAX_ATTEMPTS: u32 = 5;
const POPUP_POLL_MAX: Duration = Duration::from_secs(6);
const POPUP_POLL_MIN: Duration = Duration::from_secs(3);
const POPUP_IDLE_POLLS: u32 = 4;

/// Diagnostic derived from the post-navigation page state (§4.C step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDiagnostic {
    Ok,
    LoginRedirect,
    RegionBlocked,
    Forbidden,
    AboutBlank,
    PageNotFound,
}

impl PageDiagnostic {
    pub fn into_error(self) -> Option<BrowserError> {
        match self {
            PageDiagnostic::Ok => None,
            PageDiagnostic::LoginRedirect => Some(BrowserError::CredentialExpired),
            PageDiagnostic::RegionBlocked => Some(BrowserError::RegionBlocked),
            PageDiagnostic::Forbidden => Some(BrowserError::Forbidden),
            PageDiagnostic::AboutBlank => Some(BrowserError::LoadFailed),
            PageDiagnostic::PageNotFound => Some(BrowserError::PageNotFound),
        }
    }
}

/// Abstraction over the subset of browser-page interactions identity activation needs.
/// The real implementation drives `chromiumoxide::Page`; tests use a fake.
#[async_trait]
pub trait PageController: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
    async fn wake(&self) -> Result<(), BrowserError>;
    async fn diagnose(&self) -> Result<PageDiagnostic, BrowserError>;
    async fn dismiss_popups(&self) -> Result<(), BrowserError>;
    async fn detect_flavor(&self) -> Result<EditorFlavor, BrowserError>;
    async fn submit_remix(&self) -> Result<String, BrowserError>;
    async fn locate_code_control(&self) -> Result<(), BrowserError>;
    async fn paste_html_payload(&self) -> Result<(), BrowserError>;
    async fn paste_agent_source(&self) -> Result<(), BrowserError>;
    async fn click_save_if_present(&self) -> Result<bool, BrowserError>;
    async fn click_preview(&self) -> Result<(), BrowserError>;
    async fn wait_for_agent_init(&self) -> Result<(), BrowserError>;
    async fn send_active_trigger(&self) -> Result<(), BrowserError>;
    /// Scans for the "Launch" / "rocket_launch" control and clicks it if visible (§4.C.3).
    /// Returns `true` if a control was found and clicked.
    async fn click_launch_if_present(&self) -> Result<bool, BrowserError>;
}

const BLANK_APP_URL: &str = "https://ai-studio.example/app/new";

/// Runs §4.C steps 5 through 9 against an already-opened page for `identity`, returning once
/// the in-page agent has connected back to the server (step 10 is the caller's job — it needs
/// the Registry to observe the socket, which this crate does not own).
pub async fn activate(
    identity: &Identity,
    page: &dyn PageController,
) -> Result<ActivationOutcome, BrowserError> {
    let target_url = identity
        .state
        .app_url
        .clone()
        .unwrap_or_else(|| BLANK_APP_URL.to_string());

    let outcome = activate_at(identity, page, &target_url).await;

    match outcome {
        Err(BrowserError::PageNotFound) if identity.state.app_url.is_some() => {
            warn!(
                auth_index = identity.auth_index,
                "saved deep link 404'd, clearing and restarting from blank app"
            );
            activate_at(identity, page, BLANK_APP_URL).await
        }
        other => other,
    }
}

async fn activate_at(
    identity: &Identity,
    page: &dyn PageController,
    target_url: &str,
) -> Result<ActivationOutcome, BrowserError> {
    tokio::time::timeout(EDITOR_LOAD_TIMEOUT, page.navigate(target_url))
        .await
        .map_err(|_| BrowserError::ActivationFailed {
            stage: ActivationStage::EditorLoad,
        })??;

    page.wake().await?;
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    if let Some(err) = page.diagnose().await?.into_error() {
        return Err(err);
    }

    dismiss_popups(page).await?;

    let flavor = page.detect_flavor().await?;
    let app_url = if flavor == EditorFlavor::Remix {
        Some(submit_remix_with_retries(page).await?)
    } else {
        None
    };

    inject_agent(page).await?;

    info!(
        auth_index = identity.auth_index,
        flavor = ?flavor,
        "identity activated"
    );

    Ok(ActivationOutcome {
        auth_index: identity.auth_index,
        flavor,
        app_url,
    })
}

async fn dismiss_popups(page: &dyn PageController) -> Result<(), BrowserError> {
    let deadline = tokio::time::Instant::now() + POPUP_POLL_MAX;
    let min_deadline = tokio::time::Instant::now() + POPUP_POLL_MIN;
    let mut idle_polls = 0u32;

    loop {
        page.dismiss_popups().await?;
        idle_polls += 1;

        let now = tokio::time::Instant::now();
        if now >= min_deadline && idle_polls >= POPUP_IDLE_POLLS {
            break;
        }
        if now >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Ok(())
}

async fn submit_remix_with_retries(page: &dyn PageController) -> Result<String, BrowserError> {
    let mut last_err = None;
    for attempt in 1..=REMIX_SUBMIT_MAX_ATTEMPTS {
        match tokio::time::timeout(CODE_CONTROL_TIMEOUT, page.submit_remix()).await {
            Ok(Ok(app_url)) => return Ok(app_url),
            Ok(Err(err)) => {
                warn!(attempt, error = %err, "remix submission failed, retrying");
                last_err = Some(err);
            }
            Err(_) => {
                last_err = Some(BrowserError::ActivationFailed {
                    stage: ActivationStage::CodeControl,
                });
            }
        }
    }
    Err(last_err.unwrap_or(BrowserError::ActivationFailed {
        stage: ActivationStage::CodeControl,
    }))
}

async fn inject_agent(page: &dyn PageController) -> Result<(), BrowserError> {
    tokio::time::timeout(CODE_CONTROL_TIMEOUT, page.locate_code_control())
        .await
        .map_err(|_| BrowserError::ActivationFailed {
            stage: ActivationStage::CodeControl,
        })??;

    // Remix flavor pastes the HTML payload first; legacy flavor only pastes the agent.
    // `paste_html_payload` is expected to be a no-op for legacy pages (decided by the
    // controller, which already knows the detected flavor).
    page.paste_html_payload().await?;
    page.paste_agent_source().await?;

    if page.click_save_if_present().await? {
        info!("save control present, next preview will restart the app");
    }

    page.click_preview().await?;

    tokio::time::timeout(AGENT_INIT_TIMEOUT, page.wait_for_agent_init())
        .await
        .map_err(|_| BrowserError::ActivationFailed {
            stage: ActivationStage::AgentInit,
        })??;

    page.send_active_trigger().await?;
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use relaygate_config::IdentityState;

    struct FakePage {
        flavor: EditorFlavor,
        diagnostic: PageDiagnostic,
        remix_failures_before_success: AtomicU32,
        /// Number of `diagnose` calls that should still report `diagnostic` before falling
        /// back to `Ok` — lets a single `FakePage` model a saved deep link that 404s once
        /// and then succeeds against the blank-app retry URL.
        not_found_retries_before_ok: AtomicU32,
    }

    #[async_trait]
    impl PageController for FakePage {
        async fn navigate(&self, _url: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn wake(&self) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn diagnose(&self) -> Result<PageDiagnostic, BrowserError> {
            if self.diagnostic != PageDiagnostic::PageNotFound {
                return Ok(self.diagnostic);
            }
            let remaining = self
                .not_found_retries_before_ok
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n == 0 { None } else { Some(n - 1) });
            if remaining.is_ok() {
                Ok(PageDiagnostic::PageNotFound)
            } else {
                Ok(PageDiagnostic::Ok)
            }
        }
        async fn dismiss_popups(&self) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn detect_flavor(&self) -> Result<EditorFlavor, BrowserError> {
            Ok(self.flavor)
        }
        async fn submit_remix(&self) -> Result<String, BrowserError> {
            let remaining = self
                .remix_failures_before_success
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    if n == 0 { None } else { Some(n - 1) }
                });
            if remaining.is_ok() {
                Err(BrowserError::NavigationFailed("concurrent update".into()))
            } else {
                Ok("https://ai-studio.example/apps/abc123".into())
            }
        }
        async fn locate_code_control(&self) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn paste_html_payload(&self) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn paste_agent_source(&self) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn click_save_if_present(&self) -> Result<bool, BrowserError> {
            Ok(true)
        }
        async fn click_preview(&self) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn wait_for_agent_init(&self) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn send_active_trigger(&self) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn click_launch_if_present(&self) -> Result<bool, BrowserError> {
            Ok(false)
        }
    }

    fn identity() -> Identity {
        Identity {
            auth_index: 0,
            email: Some("person@example.com".into()),
            state: IdentityState {
                cookies: vec![],
                origins: vec![],
                account_name: None,
                app_url: None,
            },
        }
    }

    fn identity_with_saved_app_url() -> Identity {
        Identity {
            state: IdentityState {
                app_url: Some("https://ai-studio.example/apps/stale123".into()),
                ..identity().state
            },
            ..identity()
        }
    }

    #[tokio::test]
    async fn legacy_flavor_skips_remix_and_activates() {
        let page = FakePage {
            flavor: EditorFlavor::Legacy,
            diagnostic: PageDiagnostic::Ok,
            remix_failures_before_success: AtomicU32::new(0),
            not_found_retries_before_ok: AtomicU32::new(0),
        };
        let outcome = activate(&identity(), &page).await.unwrap();
        assert_eq!(outcome.flavor, EditorFlavor::Legacy);
        assert!(outcome.app_url.is_none());
    }

    #[tokio::test]
    async fn remix_flavor_retries_then_succeeds() {
        let page = FakePage {
            flavor: EditorFlavor::Remix,
            diagnostic: PageDiagnostic::Ok,
            remix_failures_before_success: AtomicU32::new(2),
            not_found_retries_before_ok: AtomicU32::new(0),
        };
        let outcome = activate(&identity(), &page).await.unwrap();
        assert_eq!(outcome.flavor, EditorFlavor::Remix);
        assert_eq!(outcome.app_url.as_deref(), Some("https://ai-studio.example/apps/abc123"));
    }

    #[tokio::test]
    async fn error_page_diagnostic_surfaces_as_typed_error() {
        let page = FakePage {
            flavor: EditorFlavor::Legacy,
            diagnostic: PageDiagnostic::RegionBlocked,
            remix_failures_before_success: AtomicU32::new(0),
            not_found_retries_before_ok: AtomicU32::new(0),
        };
        let err = activate(&identity(), &page).await.unwrap_err();
        assert!(matches!(err, BrowserError::RegionBlocked));
    }

    #[tokio::test]
    async fn stale_saved_app_url_retries_from_blank_app() {
        let page = FakePage {
            flavor: EditorFlavor::Legacy,
            diagnostic: PageDiagnostic::PageNotFound,
            remix_failures_before_success: AtomicU32::new(0),
            not_found_retries_before_ok: AtomicU32::new(1),
        };
        let outcome = activate(&identity_with_saved_app_url(), &page).await.unwrap();
        assert_eq!(outcome.flavor, EditorFlavor::Legacy);
    }

    #[tokio::test]
    async fn page_not_found_without_a_saved_app_url_does_not_retry() {
        let page = FakePage {
            flavor: EditorFlavor::Legacy,
            diagnostic: PageDiagnostic::PageNotFound,
            remix_failures_before_success: AtomicU32::new(0),
            // Nothing to fall back to once the blank app itself 404s — only one `diagnose`
            // call should ever happen, so this must never be consumed.
            not_found_retries_before_ok: AtomicU32::new(1),
        };
        let err = activate(&identity(), &page).await.unwrap_err();
        assert!(matches!(err, BrowserError::PageNotFound));
    }
}
