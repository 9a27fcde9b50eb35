//! End-to-end coverage for the inbound HTTP surface (§8 E2E-1, E2E-2, E2E-3, E2E-5): a real
//! `axum::serve` pair (API + agent WebSocket) wired together exactly as `relaygate serve`
//! wires them, driven by a `tokio-tungstenite` client standing in for the in-page agent.
//! E2E-4's grace-window half and E2E-6 are covered at the Registry/activation level instead
//! (`relaygate-registry`'s paused-clock tests, `relaygate-browser::stages`'s
//! `stale_saved_app_url_retries_from_blank_app`) — both need real 60s+ waits or a live
//! browser to exercise honestly at this layer.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use relaygate_browser::{BrowserConfig, BrowserError, BrowserManager, Identity};
use relaygate_config::{IdentityState, ModelCatalog};
use relaygate_gateway::{AppState, agent_router, router};
use relaygate_pipeline::{ForceFlags, Pipeline, PipelineConfig};
use relaygate_protocol::{AgentFrame, ServerFrame, StreamingMode};
use relaygate_registry::Registry;
use relaygate_switcher::{ActivationBackend, Switcher, SwitcherConfig};
use secrecy::SecretString;
use serde_json::json;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

const API_KEY: &str = "test-key";
const AUTH_INDEX: u32 = 7;

/// Never touches a browser: the rotation pool in every test below has exactly one identity
/// whose socket is already connected before `switch_to_specific` runs, so activation only
/// needs to report success, not actually do anything.
struct FakeBackend;

#[async_trait::async_trait]
impl ActivationBackend for FakeBackend {
    async fn activate(&self, _identity: &Identity) -> Result<(), BrowserError> {
        Ok(())
    }
    async fn launch_or_switch_context(&self, _identity: &Identity) -> Result<(), BrowserError> {
        Ok(())
    }
}

struct Harness {
    api_addr: SocketAddr,
    agent_addr: SocketAddr,
    switcher: Arc<Switcher>,
}

async fn spawn_harness() -> Harness {
    let on_connection_lost: relaygate_registry::ConnectionLostCallback = Arc::new(|| {});
    let registry = Arc::new(Registry::new(on_connection_lost));

    let identity = Identity {
        auth_index: AUTH_INDEX,
        email: Some("person@example.com".into()),
        state: IdentityState {
            cookies: vec![],
            origins: vec![],
            account_name: None,
            app_url: None,
        },
    };
    let switcher_config = SwitcherConfig {
        switch_on_uses: 0,
        failure_threshold: 0,
        immediate_switch_status_codes: vec![429],
        max_retries: 2,
        retry_delay_ms: 10,
    };
    let switcher = Arc::new(Switcher::new(
        switcher_config,
        Arc::new(FakeBackend),
        registry.clone(),
        vec![identity],
    ));

    let pipeline_config = PipelineConfig {
        default_streaming_mode: StreamingMode::Real,
        immediate_switch_status_codes: vec![429],
        max_retries: 2,
        retry_delay_ms: 10,
        force: ForceFlags {
            thinking: false,
            web_search: false,
            url_context: false,
        },
    };
    let pipeline = Arc::new(Pipeline::new(
        registry.clone(),
        switcher.clone(),
        Arc::new(FakeBackend),
        registry.clone(),
        pipeline_config,
    ));

    let manager = Arc::new(BrowserManager::new(BrowserConfig::default(), std::env::temp_dir()));

    let state = Arc::new(AppState::new(
        registry,
        switcher.clone(),
        manager,
        pipeline,
        vec![SecretString::from(API_KEY.to_string())],
        ModelCatalog { models: vec![] },
        "localhost".into(),
    ));

    let api_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_addr = api_listener.local_addr().unwrap();
    let agent_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let agent_addr = agent_listener.local_addr().unwrap();

    let api_app = router(state.clone());
    let agent_app = agent_router(state);
    tokio::spawn(async move { axum::serve(api_listener, api_app).await.unwrap() });
    tokio::spawn(async move { axum::serve(agent_listener, agent_app).await.unwrap() });

    Harness {
        api_addr,
        agent_addr,
        switcher,
    }
}

type AgentSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_fake_agent(harness: &Harness) -> AgentSocket {
    let url = format!("ws://{}/?authIndex={AUTH_INDEX}", harness.agent_addr);
    let (socket, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
    harness.switcher.switch_to_specific(AUTH_INDEX).await.unwrap();
    socket
}

async fn recv_proxy_request(agent: &mut AgentSocket) -> relaygate_protocol::ProxyRequest {
    let text = next_text(agent).await;
    match serde_json::from_str::<ServerFrame>(&text).unwrap() {
        ServerFrame::ProxyRequest(request) => request,
        other => panic!("expected proxy_request, got {other:?}"),
    }
}

async fn next_text(agent: &mut AgentSocket) -> String {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), agent.next())
            .await
            .expect("agent socket idle timeout")
            .expect("agent socket closed")
            .unwrap()
        {
            Message::Text(text) => return text.to_string(),
            _ => continue,
        }
    }
}

async fn send_frame(agent: &mut AgentSocket, frame: AgentFrame) {
    let text = serde_json::to_string(&frame).unwrap();
    agent.send(Message::Text(text.into())).await.unwrap();
}

fn native_chunk() -> serde_json::Value {
    json!({
        "candidates": [{
            "content": { "parts": [{ "text": "hello from upstream" }] },
            "finishReason": "STOP",
        }],
        "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 3, "totalTokenCount": 8 },
    })
}

fn chat_request_body() -> serde_json::Value {
    json!({
        "model": "gemini-2.5-flash",
        "messages": [{ "role": "user", "content": "hi" }],
    })
}

#[tokio::test]
async fn e2e_1_non_streaming_chat_completion_translates_and_counts_usage() {
    let harness = spawn_harness().await;
    let mut agent = connect_fake_agent(&harness).await;
    assert_eq!(harness.switcher.usage_count(), 0);

    let client = reqwest::Client::new();
    let request = client
        .post(format!("http://{}/v1/chat/completions", harness.api_addr))
        .bearer_auth(API_KEY)
        .json(&chat_request_body())
        .send();

    let (response, _) = tokio::join!(request, async {
        let proxy_request = recv_proxy_request(&mut agent).await;
        send_frame(
            &mut agent,
            AgentFrame::ResponseHeaders {
                request_id: proxy_request.request_id.clone(),
                status: 200,
                headers: Default::default(),
            },
        )
        .await;
        send_frame(
            &mut agent,
            AgentFrame::Chunk {
                request_id: proxy_request.request_id.clone(),
                data: native_chunk().to_string(),
            },
        )
        .await;
        send_frame(
            &mut agent,
            AgentFrame::StreamClose {
                request_id: proxy_request.request_id,
            },
        )
        .await;
    });

    let response = response.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "hello from upstream");
    assert_eq!(body["usage"]["total_tokens"], 8);
    assert_eq!(harness.switcher.usage_count(), 1);
}

#[tokio::test]
async fn e2e_2_streaming_chat_completion_emits_sse_with_done_sentinel() {
    let harness = spawn_harness().await;
    let mut agent = connect_fake_agent(&harness).await;

    let mut body = chat_request_body();
    body["stream"] = json!(true);

    let client = reqwest::Client::new();
    let request = client
        .post(format!("http://{}/v1/chat/completions", harness.api_addr))
        .bearer_auth(API_KEY)
        .json(&body)
        .send();

    let (response, _) = tokio::join!(request, async {
        let proxy_request = recv_proxy_request(&mut agent).await;
        assert_eq!(proxy_request.streaming_mode, StreamingMode::Real);
        send_frame(
            &mut agent,
            AgentFrame::ResponseHeaders {
                request_id: proxy_request.request_id.clone(),
                status: 200,
                headers: Default::default(),
            },
        )
        .await;
        send_frame(
            &mut agent,
            AgentFrame::Chunk {
                request_id: proxy_request.request_id.clone(),
                data: native_chunk().to_string(),
            },
        )
        .await;
        send_frame(
            &mut agent,
            AgentFrame::StreamClose {
                request_id: proxy_request.request_id,
            },
        )
        .await;
    });

    let response = response.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let text = response.text().await.unwrap();
    assert!(text.contains("hello from upstream"));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn e2e_3_immediate_switch_status_returns_503_without_consuming_retries() {
    let harness = spawn_harness().await;
    let mut agent = connect_fake_agent(&harness).await;

    let client = reqwest::Client::new();
    let request = client
        .post(format!("http://{}/v1/chat/completions", harness.api_addr))
        .bearer_auth(API_KEY)
        .json(&chat_request_body())
        .send();

    let (response, _) = tokio::join!(request, async {
        let proxy_request = recv_proxy_request(&mut agent).await;
        send_frame(
            &mut agent,
            AgentFrame::Error {
                request_id: proxy_request.request_id,
                status: 429,
                message: "rate limited".into(),
            },
        )
        .await;
        // A retry would show up as a second proxy_request; there must not be one.
        let idle = tokio::time::timeout(Duration::from_millis(200), agent.next()).await;
        assert!(idle.is_err(), "immediate-switch must not retry on the same identity");
    });

    let response = response.unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn e2e_5_client_disconnect_mid_stream_cancels_request_on_bound_identity() {
    let harness = spawn_harness().await;
    let mut agent = connect_fake_agent(&harness).await;

    let client = reqwest::Client::new();
    let mut response = client
        .post(format!("http://{}/v1/chat/completions", harness.api_addr))
        .bearer_auth(API_KEY)
        .json(&{
            let mut body = chat_request_body();
            body["stream"] = json!(true);
            body
        })
        .send()
        .await
        .unwrap();

    let proxy_request = recv_proxy_request(&mut agent).await;
    send_frame(
        &mut agent,
        AgentFrame::ResponseHeaders {
            request_id: proxy_request.request_id.clone(),
            status: 200,
            headers: Default::default(),
        },
    )
    .await;
    send_frame(
        &mut agent,
        AgentFrame::Chunk {
            request_id: proxy_request.request_id.clone(),
            data: native_chunk().to_string(),
        },
    )
    .await;

    // Read exactly one chunk of body, then drop the response — the client hangs up 500ms
    // into what the agent still thinks is a live stream (§8 E2E-5).
    let _ = response.chunk().await.unwrap();
    drop(response);

    let cancel = next_text(&mut agent).await;
    match serde_json::from_str::<ServerFrame>(&cancel).unwrap() {
        ServerFrame::CancelRequest { request_id } => assert_eq!(request_id, proxy_request.request_id),
        other => panic!("expected cancel_request after client disconnect, got {other:?}"),
    }
    assert_eq!(harness.switcher.failure_count(), 0);
}
