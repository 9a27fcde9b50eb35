//! Shared application state handed to every axum handler and the agent WS listener.

use std::sync::Arc;

use dashmap::DashSet;
use relaygate_browser::BrowserManager;
use relaygate_config::ModelCatalog;
use relaygate_pipeline::Pipeline;
use relaygate_registry::Registry;
use relaygate_switcher::Switcher;
use secrecy::SecretString;
use tokio::sync::RwLock;

/// Default upstream host for native passthrough calls when an identity has not yet learned a
/// different `__proxy_host__` override. Not part of the typed config schema (§12) since it is
/// a fixed property of the upstream this port targets, not an operator knob.
pub const DEFAULT_UPSTREAM_HOST: &str = "generativelanguage.googleapis.com";

pub struct AppState {
    pub registry: Arc<Registry>,
    pub switcher: Arc<Switcher>,
    pub manager: Arc<BrowserManager>,
    pub pipeline: Arc<Pipeline>,
    pub api_keys: Vec<SecretString>,
    pub models: RwLock<ModelCatalog>,
    pub own_authority: String,
    pub own_scheme: &'static str,
    /// Identities that have had a socket open at least once this process lifetime — lets
    /// `ws::upgrade` tell the Registry a brand-new agent connection (nothing stale, `fresh_epoch
    /// = false`) apart from a reconnect of a previously-seen identity (stale queues may exist,
    /// `fresh_epoch = true`) (§4.B `onSocketOpen(identity, socket, freshEpoch)`).
    pub seen_epochs: DashSet<u32>,
}

impl AppState {
    pub fn new(
        registry: Arc<Registry>,
        switcher: Arc<Switcher>,
        manager: Arc<BrowserManager>,
        pipeline: Arc<Pipeline>,
        api_keys: Vec<SecretString>,
        models: ModelCatalog,
        own_authority: String,
    ) -> Self {
        Self {
            registry,
            switcher,
            manager,
            pipeline,
            api_keys,
            models: RwLock::new(models),
            own_authority,
            own_scheme: "http",
            seen_epochs: DashSet::new(),
        }
    }
}
