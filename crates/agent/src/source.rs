//! The in-page agent (§4.F) is conceptually part of the Core but physically a JavaScript
//! program injected into the upstream page by the Browser Fleet Manager. It is carried here
//! as a single embedded asset rather than reimplemented in Rust, so the server-side contract
//! types in [`crate::rewrite`] and [`relaygate_protocol`] stay the single source of truth for
//! the wire shapes this script produces and consumes.

/// The agent's source, injected verbatim by `relaygate-browser::stages::inject_agent` (§4.C.1).
pub const AGENT_SOURCE: &str = include_str!("agent.js");
