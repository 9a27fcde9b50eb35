//! Pipeline-owned error taxonomy (§7, §11).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed request body: {0}")]
    ClientError(String),

    #[error("upstream returned {status}")]
    Upstream { status: u16, message: String },

    /// An immediate-switch status code (§4.D) was hit before any attempt consumed a retry; the
    /// client sees 503, not the upstream status, since a rotation — not the original request —
    /// is what actually failed here.
    #[error("immediate switch triggered by upstream status {status}")]
    ImmediateSwitch { status: u16, message: String },

    #[error("agent error: {0}")]
    Agent(String),

    #[error("queue closed: {0}")]
    QueueClosed(relaygate_registry::CloseReason),

    #[error("queue idle timeout")]
    QueueTimeout,

    #[error("no accounts available")]
    NoAccounts,

    #[error("a switch or recovery is already in progress")]
    AlreadyInProgress,

    #[error(transparent)]
    Browser(#[from] relaygate_browser::BrowserError),

    #[error(transparent)]
    Switcher(#[from] relaygate_switcher::SwitcherError),

    #[error("identity became unreachable while waiting for readiness")]
    ReadinessTimeout,
}

impl PipelineError {
    /// HTTP status this error renders as at the gateway seam (§11).
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::ClientError(_) => 400,
            PipelineError::Upstream { status, .. } => *status,
            PipelineError::ImmediateSwitch { .. } => 503,
            PipelineError::Agent(_) => 502,
            PipelineError::QueueClosed(_) => 503,
            PipelineError::QueueTimeout => 504,
            PipelineError::NoAccounts => 503,
            PipelineError::AlreadyInProgress => 503,
            PipelineError::Browser(_) => 503,
            PipelineError::Switcher(_) => 503,
            PipelineError::ReadinessTimeout => 503,
        }
    }
}

impl From<relaygate_registry::QueueError> for PipelineError {
    fn from(err: relaygate_registry::QueueError) -> Self {
        match err {
            relaygate_registry::QueueError::Closed(reason) => PipelineError::QueueClosed(reason),
            relaygate_registry::QueueError::Timeout => PipelineError::QueueTimeout,
        }
    }
}
