//! Browser error types.

use std::error::Error as StdError;

use thiserror::Error;

/// Stage at which identity activation (§4.C) failed, surfaced to callers as
/// `ActivationFailed{stage}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationStage {
    EditorLoad,
    CodeControl,
    AgentInit,
}

impl std::fmt::Display for ActivationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivationStage::EditorLoad => "editor_load",
            ActivationStage::CodeControl => "code_control",
            ActivationStage::AgentInit => "agent_init",
        };
        f.write_str(s)
    }
}

/// Errors that can occur during browser operations.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser not available: Chrome/Chromium not found")]
    BrowserNotAvailable,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("JavaScript evaluation failed: {0}")]
    JsEvalFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("browser closed unexpectedly")]
    BrowserClosed,

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("CDP error: {0}")]
    Cdp(String),

    #[error("activation failed at stage {stage}")]
    ActivationFailed { stage: ActivationStage },

    #[error("identity credentials expired")]
    CredentialExpired,

    #[error("upstream region-blocked this identity")]
    RegionBlocked,

    #[error("upstream returned 403 forbidden")]
    Forbidden,

    #[error("page failed to load (about:blank)")]
    LoadFailed,

    #[error("saved deep link returned 404")]
    PageNotFound,

    #[error("browser error: {source}")]
    Other {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

/// Substrings that indicate the CDP WebSocket connection is dead.
const STALE_CONNECTION_PATTERNS: &[&str] = &[
    "receiver is gone",
    "oneshot canceled",
    "Request timed out",
    "Connection closed",
    "AlreadyClosed",
    "closed connection",
];

impl BrowserError {
    /// Returns `true` when this error indicates the CDP connection to the browser is dead
    /// and the identity's context should be torn down rather than retried in place.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::BrowserClosed | Self::ConnectionClosed(_) => true,
            Self::Cdp(msg) | Self::JsEvalFailed(msg) | Self::NavigationFailed(msg)
            | Self::Timeout(msg) => STALE_CONNECTION_PATTERNS.iter().any(|p| msg.contains(p)),
            _ => false,
        }
    }

    pub fn other(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Other {
            source: Box::new(source),
        }
    }
}

impl From<chromiumoxide::error::CdpError> for BrowserError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        BrowserError::Cdp(err.to_string())
    }
}
