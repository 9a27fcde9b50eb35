//! Connection Registry (§4.B) + Message Queue (§4.A): the bridge between inbound HTTP
//! requests and the browser-side agents.

mod queue;
mod registry;

pub use queue::{CloseReason, DEFAULT_QUEUE_TIMEOUT_MS, Queue, QueueError};
pub use registry::{AgentSocket, ConnectionLostCallback, Registry};
