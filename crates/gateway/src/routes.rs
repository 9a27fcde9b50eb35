//! Inbound HTTP surface (§6): the OpenAI, Anthropic, and native dialect entry points, and the
//! model-list endpoints. Every generative entry point funnels through [`execute`], which owns
//! the readiness/attempt-loop/response-shaping skeleton; only the route determines `Dialect`
//! and the upstream action suffix, never content-sniffing of the body.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use rand::Rng;
use relaygate_pipeline::{
    AttemptOutcome, Dialect, DialectAdapter, DialectStreamState, PipelineError, Translated,
    adapter_for, apply_body_rewrites, build_pseudo_stream_records, rewrite_inline_images,
    sse_comment_line, sse_data_line, sse_sentinel_line,
};
use relaygate_protocol::{AgentFrame, ProxyRequest, StreamingMode};
use serde_json::{Value, json};
use tracing::warn;

use crate::state::AppState;

const STREAM_CHUNK_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const NON_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const PSEUDO_KEEPALIVE_MIN_MS: u64 = 12_000;
const PSEUDO_KEEPALIVE_MAX_MS: u64 = 18_000;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1beta/models/{model_action}", post(native_passthrough))
        .route("/v1/models", get(list_models_openai))
        .route("/v1beta/models", get(list_models_native))
}

async fn chat_completions(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let requested_streaming = body["stream"].as_bool().unwrap_or(false);
    let translated = match adapter_for(Dialect::OpenAi).translate_in(&body) {
        Ok(translated) => translated,
        Err(err) => return error_response(Dialect::OpenAi, err),
    };
    let action = if requested_streaming { "streamGenerateContent" } else { "generateContent" };
    execute(state, Dialect::OpenAi, translated, action, true, requested_streaming, &headers).await
}

async fn messages(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let requested_streaming = body["stream"].as_bool().unwrap_or(false);
    let translated = match adapter_for(Dialect::Anthropic).translate_in(&body) {
        Ok(translated) => translated,
        Err(err) => return error_response(Dialect::Anthropic, err),
    };
    let action = if requested_streaming { "streamGenerateContent" } else { "generateContent" };
    execute(state, Dialect::Anthropic, translated, action, true, requested_streaming, &headers).await
}

async fn count_tokens(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let translated = match adapter_for(Dialect::Anthropic).translate_in(&body) {
        Ok(translated) => translated,
        Err(err) => return error_response(Dialect::Anthropic, err),
    };
    execute(state, Dialect::Anthropic, translated, "countTokens", false, false, &headers).await
}

async fn native_passthrough(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return error_response(Dialect::Native, PipelineError::ClientError("path is missing a `:action` suffix".into()));
    };
    if let Some(object) = body.as_object_mut() {
        object.entry("model").or_insert_with(|| json!(model));
    }

    let translated = match adapter_for(Dialect::Native).translate_in(&body) {
        Ok(translated) => translated,
        Err(err) => return error_response(Dialect::Native, err),
    };
    let is_generative = matches!(action, "generateContent" | "streamGenerateContent" | "predict");
    let requested_streaming = action == "streamGenerateContent";
    execute(state, Dialect::Native, translated, action, is_generative, requested_streaming, &headers).await
}

enum ExecMode {
    NonStream,
    RealStream,
    PseudoStream,
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    state: Arc<AppState>,
    dialect: Dialect,
    translated: Translated,
    action: &str,
    is_generative: bool,
    requested_streaming: bool,
    headers: &HeaderMap,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let model = translated.clean_model;
    let mut native_body = translated.native_body;
    apply_body_rewrites(&mut native_body, translated.thinking_level.as_deref(), state.pipeline.config().force);

    let mut needs_switch_after_request = false;
    if is_generative {
        needs_switch_after_request = state.switcher.increment_usage().needs_switch;
    }

    let config_mode = state.pipeline.config().default_streaming_mode;
    let exec_mode = if !requested_streaming {
        ExecMode::NonStream
    } else if config_mode == StreamingMode::Real {
        ExecMode::RealStream
    } else {
        ExecMode::PseudoStream
    };

    let wire_action = if matches!(exec_mode, ExecMode::PseudoStream) && action == "streamGenerateContent" {
        "generateContent"
    } else {
        action
    };
    let streaming_mode = if matches!(exec_mode, ExecMode::RealStream) { StreamingMode::Real } else { StreamingMode::Fake };

    let forwarded_headers = forward_headers(headers);
    let body_string = native_body.to_string();
    let proxy_model = model.clone();
    let proxy_request_id = request_id.clone();

    let outcome = state
        .pipeline
        .run_attempt_loop(&request_id, move |_auth_index| ProxyRequest {
            request_id: proxy_request_id.clone(),
            method: "POST".into(),
            path: format!("/v1beta/models/{proxy_model}:{wire_action}"),
            query_params: Default::default(),
            headers: forwarded_headers.clone(),
            body: Some(body_string.clone()),
            body_b64: None,
            streaming_mode,
            is_generative,
        })
        .await;

    match exec_mode {
        ExecMode::NonStream => {
            let response = match outcome {
                Ok(attempt) => handle_non_stream(&state, dialect, &model, attempt).await,
                Err(err) => error_response(dialect, err),
            };
            state.pipeline.finalize(&request_id, needs_switch_after_request).await;
            response
        }
        ExecMode::RealStream => match outcome {
            Ok(attempt) => build_real_stream_response(state, dialect, model, attempt, request_id, needs_switch_after_request),
            Err(err) => {
                state.pipeline.finalize(&request_id, needs_switch_after_request).await;
                error_response(dialect, err)
            }
        },
        ExecMode::PseudoStream => match outcome {
            Ok(attempt) => build_pseudo_stream_response(state, dialect, model, attempt, request_id, needs_switch_after_request),
            Err(err) => {
                state.pipeline.finalize(&request_id, needs_switch_after_request).await;
                error_response(dialect, err)
            }
        },
    }
}

async fn handle_non_stream(state: &AppState, dialect: Dialect, model: &str, attempt: AttemptOutcome) -> Response {
    let AttemptOutcome { first_frame, queue, .. } = attempt;

    let (status, native_headers) = match first_frame {
        AgentFrame::ResponseHeaders { status, headers, .. } => (status, headers),
        AgentFrame::Error { status, message, .. } => {
            return error_response(dialect, PipelineError::Upstream { status, message });
        }
        _ => (200, Default::default()),
    };

    let mut body_text = String::new();
    loop {
        match queue.dequeue(NON_STREAM_IDLE_TIMEOUT).await {
            Ok(AgentFrame::Chunk { data, .. }) => body_text.push_str(&data),
            Ok(AgentFrame::StreamClose { .. }) => break,
            Ok(AgentFrame::Error { status, message, .. }) => {
                return error_response(dialect, PipelineError::Upstream { status, message });
            }
            Ok(AgentFrame::ResponseHeaders { .. }) => continue,
            Err(err) => return error_response(dialect, err.into()),
        }
    }

    let mut native_json: Value = serde_json::from_str(&body_text).unwrap_or_else(|_| json!({ "raw": body_text }));
    rewrite_inline_images(&mut native_json);

    let client_body = match dialect {
        Dialect::Native => native_json,
        Dialect::OpenAi => openai_completion_from_native(&native_json, model),
        Dialect::Anthropic => anthropic_message_from_native(&native_json, model),
    };

    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let mut response = (status_code, Json(client_body)).into_response();
    apply_sanitized_headers(&mut response, &native_headers, &state.own_authority, state.own_scheme);
    response
}

struct DisconnectGuard {
    state: Arc<AppState>,
    request_id: String,
    needs_switch_after_request: bool,
    completed: Arc<AtomicBool>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.completed.load(Ordering::SeqCst) {
            return;
        }
        let state = self.state.clone();
        let request_id = self.request_id.clone();
        let needs_switch = self.needs_switch_after_request;
        tokio::spawn(async move {
            state.pipeline.finalize_disconnected(&request_id, needs_switch).await;
        });
    }
}

fn build_real_stream_response(
    state: Arc<AppState>,
    dialect: Dialect,
    model: String,
    attempt: AttemptOutcome,
    request_id: String,
    needs_switch_after_request: bool,
) -> Response {
    let AttemptOutcome { first_frame, queue, .. } = attempt;

    let (status, native_headers) = match first_frame {
        AgentFrame::ResponseHeaders { status, headers, .. } => (status, headers),
        AgentFrame::Error { status, message, .. } => {
            let state = state.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move { state.pipeline.finalize(&request_id, needs_switch_after_request).await });
            return error_response(dialect, PipelineError::Upstream { status, message });
        }
        _ => (200, Default::default()),
    };

    let completed = Arc::new(AtomicBool::new(false));
    let body_stream = {
        let state = state.clone();
        let completed = completed.clone();
        let request_id = request_id.clone();
        async_stream::stream! {
            let _guard = DisconnectGuard {
                state: state.clone(),
                request_id: request_id.clone(),
                needs_switch_after_request,
                completed: completed.clone(),
            };

            let adapter = adapter_for(dialect);
            let mut stream_state = DialectStreamState::default();

            loop {
                match queue.dequeue(STREAM_CHUNK_IDLE_TIMEOUT).await {
                    Ok(AgentFrame::Chunk { data, .. }) => {
                        if let Some(line) = render_stream_chunk(dialect, adapter, &data, &model, &mut stream_state) {
                            yield Ok::<Bytes, std::convert::Infallible>(Bytes::from(line));
                        }
                    }
                    Ok(AgentFrame::StreamClose { .. }) => break,
                    Ok(AgentFrame::Error { message, .. }) => {
                        yield Ok(Bytes::from(sse_data_line(&json!({ "error": { "message": message } }))));
                        break;
                    }
                    Ok(AgentFrame::ResponseHeaders { .. }) => continue,
                    Err(relaygate_registry::QueueError::Timeout) => {
                        yield Ok(Bytes::from(sse_data_line(&json!({ "error": { "message": "idle timeout waiting on upstream" } }))));
                        break;
                    }
                    Err(relaygate_registry::QueueError::Closed(_)) => break,
                }
            }

            if let Some(sentinel) = adapter.end_of_stream_sentinel() {
                yield Ok(Bytes::from(sse_sentinel_line(sentinel)));
            }

            completed.store(true, Ordering::SeqCst);
            state.pipeline.finalize(&request_id, needs_switch_after_request).await;
        }
    };

    let mut response = match Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
    {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "failed to build streaming response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    apply_sanitized_headers(&mut response, &native_headers, &state.own_authority, state.own_scheme);
    response
}

fn build_pseudo_stream_response(
    state: Arc<AppState>,
    dialect: Dialect,
    model: String,
    attempt: AttemptOutcome,
    request_id: String,
    needs_switch_after_request: bool,
) -> Response {
    let AttemptOutcome { first_frame, queue, .. } = attempt;

    if let AgentFrame::Error { status, message, .. } = first_frame {
        let state = state.clone();
        let request_id = request_id.clone();
        tokio::spawn(async move { state.pipeline.finalize(&request_id, needs_switch_after_request).await });
        return error_response(dialect, PipelineError::Upstream { status, message });
    }

    let completed = Arc::new(AtomicBool::new(false));
    let body_stream = {
        let state = state.clone();
        let completed = completed.clone();
        let request_id = request_id.clone();
        async_stream::stream! {
            let _guard = DisconnectGuard {
                state: state.clone(),
                request_id: request_id.clone(),
                needs_switch_after_request,
                completed: completed.clone(),
            };

            let mut body_text = String::new();
            let mut error_body: Option<Value> = None;
            let mut keepalive = keepalive_sleep();

            loop {
                tokio::select! {
                    biased;
                    frame = queue.dequeue(STREAM_CHUNK_IDLE_TIMEOUT) => {
                        match frame {
                            Ok(AgentFrame::Chunk { data, .. }) => { body_text.push_str(&data); continue; }
                            Ok(AgentFrame::StreamClose { .. }) => {}
                            Ok(AgentFrame::Error { message, .. }) => { error_body = Some(json!({ "error": { "message": message } })); }
                            Ok(AgentFrame::ResponseHeaders { .. }) => continue,
                            Err(_) => {}
                        }
                        break;
                    }
                    _ = &mut keepalive => {
                        yield Ok::<Bytes, std::convert::Infallible>(Bytes::from(sse_comment_line("keep-alive")));
                        keepalive = keepalive_sleep();
                    }
                }
            }

            let mut native_json = error_body.unwrap_or_else(|| {
                serde_json::from_str(&body_text).unwrap_or_else(|_| json!({ "raw": body_text }))
            });
            rewrite_inline_images(&mut native_json);

            let records = build_pseudo_stream_records(&native_json);
            let adapter = adapter_for(dialect);
            let mut stream_state = DialectStreamState::default();
            for record in &records {
                let client_record = match dialect {
                    Dialect::Native => record.clone(),
                    _ => adapter.translate_out(record, &model, &mut stream_state),
                };
                yield Ok(Bytes::from(sse_data_line(&client_record)));
            }
            if let Some(sentinel) = adapter.end_of_stream_sentinel() {
                yield Ok(Bytes::from(sse_sentinel_line(sentinel)));
            }

            completed.store(true, Ordering::SeqCst);
            state.pipeline.finalize(&request_id, needs_switch_after_request).await;
        }
    };

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
    {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "failed to build pseudo-stream response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn keepalive_sleep() -> std::pin::Pin<Box<tokio::time::Sleep>> {
    let millis = rand::rng().random_range(PSEUDO_KEEPALIVE_MIN_MS..=PSEUDO_KEEPALIVE_MAX_MS);
    Box::pin(tokio::time::sleep(Duration::from_millis(millis)))
}

/// Each `chunk` frame is assumed to carry exactly one upstream JSON record (the agent parses
/// upstream SSE into discrete payloads before forwarding, rather than relaying raw bytes).
fn render_stream_chunk(
    dialect: Dialect,
    adapter: &dyn DialectAdapter,
    data: &str,
    model: &str,
    stream_state: &mut DialectStreamState,
) -> Option<String> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return None;
    }
    match dialect {
        Dialect::Native => {
            let value: Value = serde_json::from_str(trimmed).unwrap_or_else(|_| json!(trimmed));
            Some(sse_data_line(&value))
        }
        _ => {
            let native_chunk: Value = serde_json::from_str(trimmed).ok()?;
            Some(sse_data_line(&adapter.translate_out(&native_chunk, model, stream_state)))
        }
    }
}

fn extract_text(native: &Value) -> String {
    native["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter(|part| !part["thought"].as_bool().unwrap_or(false))
                .filter_map(|part| part["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn map_finish_reason(native: &str) -> &'static str {
    match native {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" => "content_filter",
        _ => "stop",
    }
}

fn openai_completion_from_native(native: &Value, model: &str) -> Value {
    let text = extract_text(native);
    let finish_reason = native["candidates"][0]["finishReason"].as_str().map(map_finish_reason);
    json!({
        "id": format!("chatcmpl-{}", short_id(native)),
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": native["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
            "completion_tokens": native["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
            "total_tokens": native["usageMetadata"]["totalTokenCount"].as_u64().unwrap_or(0),
        },
    })
}

fn anthropic_message_from_native(native: &Value, model: &str) -> Value {
    let text = extract_text(native);
    let stop_reason = native["candidates"][0]["finishReason"].as_str().map(map_finish_reason);
    json!({
        "id": format!("msg-{}", short_id(native)),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{ "type": "text", "text": text }],
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": native["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
            "output_tokens": native["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
        },
    })
}

fn short_id(seed_value: &Value) -> String {
    let seed = seed_value.to_string();
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in seed.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

fn apply_sanitized_headers(response: &mut Response, native_headers: &serde_json::Map<String, Value>, own_authority: &str, own_scheme: &str) {
    let sanitized = relaygate_agent::sanitize_response_headers(native_headers);
    for (key, value) in sanitized {
        let Some(value_str) = value.as_str() else { continue };
        let lower = key.to_ascii_lowercase();
        let rewritten = if lower == "location" || lower == "x-goog-upload-url" {
            relaygate_agent::rewrite_upstream_location(value_str, own_authority, own_scheme).unwrap_or_else(|| value_str.to_string())
        } else {
            value_str.to_string()
        };
        if let (Ok(name), Ok(val)) = (HeaderName::try_from(key.as_str()), HeaderValue::try_from(rewritten)) {
            response.headers_mut().insert(name, val);
        }
    }
}

fn forward_headers(headers: &HeaderMap) -> serde_json::Map<String, Value> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.as_str().to_ascii_lowercase();
            lower != "authorization" && lower != "x-api-key" && lower != "host"
        })
        .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str().to_string(), json!(value))))
        .collect()
}

fn error_response(dialect: Dialect, err: PipelineError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match dialect {
        Dialect::OpenAi => json!({ "error": { "message": err.to_string(), "type": "upstream_error" } }),
        Dialect::Anthropic => json!({ "type": "error", "error": { "type": "api_error", "message": err.to_string() } }),
        Dialect::Native => json!({ "error": { "code": status.as_u16(), "message": err.to_string() } }),
    };
    (status, Json(body)).into_response()
}

async fn list_models_openai(State(state): State<Arc<AppState>>) -> Json<Value> {
    let catalog = state.models.read().await;
    let data: Vec<Value> = catalog
        .models
        .iter()
        .map(|model| {
            let id = model["name"].as_str().or_else(|| model["id"].as_str()).unwrap_or_default();
            json!({ "id": id, "object": "model", "owned_by": "relaygate" })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

async fn list_models_native(State(state): State<Arc<AppState>>) -> Json<Value> {
    let catalog = state.models.read().await;
    Json(json!({ "models": catalog.models.clone() }))
}
