//! Account Switcher (§4.D): rotates through the identity pool on usage or failure
//! thresholds and owns the `isSystemBusy` interlock shared with the pipeline's
//! direct-recovery path (§4.E.1).

mod backend;
mod config;
mod error;
mod switcher;

pub use backend::{ActivationBackend, SocketProbe};
pub use config::SwitcherConfig;
pub use error::SwitcherError;
pub use switcher::{FailureOutcome, Switcher, UsageOutcome};
