//! Wire types for the server↔in-page-agent control protocol.
//!
//! All communication uses JSON frames over WebSocket (one connection per identity,
//! `ws://127.0.0.1:<AGENT_WS_PORT>?authIndex=<i>`). Frame shapes are bit-exact with the
//! upstream agent contract; do not rename fields without updating the agent source too.

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

/// Fixed port the in-page agent connects back to.
pub const AGENT_WS_PORT: u16 = 9998;

/// Default idle timeout for [`crate::ServerFrame`] dequeue, in milliseconds.
pub const QUEUE_DEFAULT_TIMEOUT_MS: u64 = 300_000;
/// Per-chunk idle timeout while a real stream is in flight.
pub const STREAM_CHUNK_IDLE_TIMEOUT_MS: u64 = 60_000;
/// Reconnection grace window after an agent socket closes.
pub const RECONNECT_GRACE_MS: u64 = 60_000;
/// How long the pipeline waits for `isSystemBusy` to clear before giving up.
pub const BUSY_WAIT_TIMEOUT_MS: u64 = 120_000;
/// How long the pipeline waits for a socket to appear after a switch.
pub const SOCKET_AFTER_SWITCH_TIMEOUT_MS: u64 = 10_000;
/// How long the agent waits for its `authIndex` handshake before giving up.
pub const AGENT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Streaming mode requested for a given proxied call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    Real,
    Fake,
}

/// Server → agent frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "proxy_request")]
    ProxyRequest(ProxyRequest),
    #[serde(rename = "cancel_request")]
    CancelRequest { request_id: String },
    #[serde(rename = "set_log_level")]
    SetLogLevel { level: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query_params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub headers: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_b64: Option<String>,
    pub streaming_mode: StreamingMode,
    pub is_generative: bool,
}

/// Agent → server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AgentFrame {
    #[serde(rename = "response_headers")]
    ResponseHeaders {
        request_id: String,
        status: u16,
        headers: serde_json::Map<String, serde_json::Value>,
    },
    #[serde(rename = "chunk")]
    Chunk { request_id: String, data: String },
    #[serde(rename = "stream_close")]
    StreamClose { request_id: String },
    #[serde(rename = "error")]
    Error {
        request_id: String,
        status: u16,
        message: String,
    },
}

impl AgentFrame {
    pub fn request_id(&self) -> &str {
        match self {
            AgentFrame::ResponseHeaders { request_id, .. }
            | AgentFrame::Chunk { request_id, .. }
            | AgentFrame::StreamClose { request_id }
            | AgentFrame::Error { request_id, .. } => request_id,
        }
    }
}

/// Request headers the agent must strip before forwarding a `fetch` to the upstream origin.
pub const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "origin",
    "referer",
    "user-agent",
    "sec-fetch-mode",
    "sec-fetch-site",
    "sec-fetch-dest",
];

/// Query parameter used to carry an upstream-host override through a rewritten URL.
pub const PROXY_HOST_PARAM: &str = "__proxy_host__";

/// Response headers the server's gateway drops when relaying (besides the `location` /
/// `x-goog-upload-url` rewrite handled separately).
pub const STRIPPED_RESPONSE_HEADER_PREFIXES: &[&str] = &["access-control-allow-"];
pub const STRIPPED_RESPONSE_HEADERS: &[&str] = &["content-length"];

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_request_round_trips() {
        let frame = ServerFrame::ProxyRequest(ProxyRequest {
            request_id: "req-1".into(),
            method: "POST".into(),
            path: "/v1beta/models/gemini-2.5-flash:generateContent".into(),
            query_params: Default::default(),
            headers: Default::default(),
            body: Some("{}".into()),
            body_b64: None,
            streaming_mode: StreamingMode::Real,
            is_generative: true,
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "proxy_request");
        let back: ServerFrame = serde_json::from_value(json).unwrap();
        match back {
            ServerFrame::ProxyRequest(p) => assert_eq!(p.request_id, "req-1"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn agent_frame_tags_on_event_type() {
        let json = serde_json::json!({
            "event_type": "chunk",
            "request_id": "req-2",
            "data": "hello",
        });
        let frame: AgentFrame = serde_json::from_value(json).unwrap();
        assert_eq!(frame.request_id(), "req-2");
        assert!(matches!(frame, AgentFrame::Chunk { .. }));
    }

    #[test]
    fn unknown_event_type_fails_to_parse() {
        let json = serde_json::json!({"event_type": "bogus", "request_id": "x"});
        assert!(serde_json::from_value::<AgentFrame>(json).is_err());
    }
}
