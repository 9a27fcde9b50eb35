use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `relaygate.toml` and/or environment variables.
///
/// Field-by-field env override names follow `RELAYGATE_<FIELD_UPPERCASE>`, e.g.
/// `RELAYGATE_LISTEN_ADDR`, `RELAYGATE_FAILURE_THRESHOLD`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_agent_ws_port")]
    pub agent_ws_port: u16,

    #[serde(default)]
    pub api_keys: Vec<SecretString>,

    #[serde(default = "default_streaming_mode")]
    pub default_streaming_mode: String,

    #[serde(default)]
    pub switch_on_uses: u32,

    #[serde(default)]
    pub failure_threshold: u32,

    #[serde(default = "default_immediate_switch_status_codes")]
    pub immediate_switch_status_codes: Vec<u16>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub force_thinking: bool,

    #[serde(default)]
    pub force_web_search: bool,

    #[serde(default)]
    pub force_url_context: bool,

    #[serde(default)]
    pub browser_proxy_url: Option<String>,

    #[serde(default)]
    pub enable_auth_update: bool,

    /// Directory holding `auth-<i>.json` identity state files.
    #[serde(default = "default_auth_dir")]
    pub auth_dir: String,

    /// Path to the model catalog consumed by `/v1/models` and `/v1beta/models`.
    #[serde(default = "default_models_path")]
    pub models_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            agent_ws_port: default_agent_ws_port(),
            api_keys: Vec::new(),
            default_streaming_mode: default_streaming_mode(),
            switch_on_uses: 0,
            failure_threshold: 0,
            immediate_switch_status_codes: default_immediate_switch_status_codes(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            force_thinking: false,
            force_web_search: false,
            force_url_context: false,
            browser_proxy_url: None,
            enable_auth_update: false,
            auth_dir: default_auth_dir(),
            models_path: default_models_path(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".into()
}

/// Matches `relaygate_protocol::AGENT_WS_PORT`; duplicated as a literal default so this
/// crate does not need a dependency edge back onto the protocol crate.
fn default_agent_ws_port() -> u16 {
    9998
}

fn default_streaming_mode() -> String {
    "real".into()
}

fn default_immediate_switch_status_codes() -> Vec<u16> {
    vec![401, 403, 429]
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_auth_dir() -> String {
    "configs/auth".into()
}

fn default_models_path() -> String {
    "configs/models.json".into()
}

/// One identity's persisted browser state, shaped like a browser context export.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityState {
    #[serde(default)]
    pub cookies: Vec<serde_json::Value>,
    #[serde(default)]
    pub origins: Vec<serde_json::Value>,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub app_url: Option<String>,
}

/// `configs/models.json` — the model list served by the listing endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelCatalog {
    pub models: Vec<serde_json::Value>,
}
