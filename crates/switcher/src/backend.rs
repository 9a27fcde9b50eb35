//! Narrow seams the Switcher needs against the Browser Fleet Manager and the Connection
//! Registry, kept as traits so rotation logic (§4.D) can be unit-tested without a real
//! browser — the same idiom `relaygate-browser::stages` uses for `PageController`.

use async_trait::async_trait;
use relaygate_browser::{BrowserError, BrowserManager, Identity};
use relaygate_registry::Registry;

/// Brings an identity to "agent-live" (§4.C). Implemented for [`BrowserManager`] for real
/// use; tests substitute a fake that never touches a browser.
#[async_trait]
pub trait ActivationBackend: Send + Sync {
    async fn activate(&self, identity: &Identity) -> Result<(), BrowserError>;
    async fn launch_or_switch_context(&self, identity: &Identity) -> Result<(), BrowserError>;
}

#[async_trait]
impl ActivationBackend for BrowserManager {
    async fn activate(&self, identity: &Identity) -> Result<(), BrowserError> {
        BrowserManager::activate(self, identity).await.map(|_| ())
    }

    async fn launch_or_switch_context(&self, identity: &Identity) -> Result<(), BrowserError> {
        BrowserManager::launch_or_switch_context(self, identity)
            .await
            .map(|_| ())
    }
}

/// Whether an identity currently has a live agent socket. Implemented for [`Registry`].
pub trait SocketProbe: Send + Sync {
    fn has_socket(&self, auth_index: u32) -> bool;
}

impl SocketProbe for Registry {
    fn has_socket(&self, auth_index: u32) -> bool {
        Registry::has_socket(self, auth_index)
    }
}
