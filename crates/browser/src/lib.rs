//! Browser Fleet Manager: owns the headless browser process, the per-identity contexts,
//! the agent-injection/activation protocol, and the background health/wake loops.
//!
//! ```ignore
//! let manager = BrowserManager::new(config).await?;
//! manager.activate(identity).await?;
//! ```

mod error;
mod fingerprint;
mod health;
mod manager;
mod pool;
mod roster;
mod stages;
mod types;

pub use error::BrowserError;
pub use manager::BrowserManager;
pub use roster::{auth_file_path, load_identity, load_roster};
pub use types::{ActivationOutcome, BrowserConfig, Identity};
