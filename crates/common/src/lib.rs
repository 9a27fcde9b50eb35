//! Shared error type and context-extension macro used by every `relaygate-*` crate.

mod error;

pub use error::{Error, FromMessage, Result};
