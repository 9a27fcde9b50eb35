//! Dialect polymorphism (§9 design note): the three inbound HTTP surfaces share one pipeline
//! skeleton and differ only in body translation in, chunk translation out, and error envelope
//! shape. `DialectAdapter` is the `trait Dialect…` described there — object-safe, one
//! zero-sized implementor per dialect, selected by the route that was hit rather than by
//! sniffing the body.

use serde_json::{Value, json};

use crate::{error::PipelineError, model::parse_model_and_thinking_level};

/// Which inbound HTTP surface produced this request (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
    Native,
}

/// A native request body plus the model name cleaned of any `@level` thinking suffix.
pub struct Translated {
    pub native_body: Value,
    pub clean_model: String,
    pub thinking_level: Option<String>,
}

/// Per-dialect translation capability (§9). `translate_in` is infallible-by-convention except
/// for malformed client bodies, surfaced as [`PipelineError::ClientError`]; `translate_out`
/// takes a native streaming chunk and re-encodes it in the client's dialect, threading
/// `state` across calls for adapters that need it (OpenAI's `[DONE]` sentinel, Anthropic's
/// event-type bookkeeping).
pub trait DialectAdapter: Send + Sync {
    fn translate_in(&self, client_body: &Value) -> Result<Translated, PipelineError>;
    fn translate_out(&self, native_chunk: &Value, model: &str, state: &mut DialectStreamState) -> Value;
    /// Sentinel emitted after the final chunk, if any (`data: [DONE]` for OpenAI, none for
    /// Anthropic/native).
    fn end_of_stream_sentinel(&self) -> Option<&'static str>;
}

/// Threaded across a single response's `translate_out` calls. Only OpenAI's stream currently
/// needs anything (a stable `id`/`created` pair so every chunk in the stream agrees), but the
/// struct is shared across all three dialects rather than giving each its own state type, to
/// keep `DialectAdapter` object-safe without an associated type.
#[derive(Debug, Default)]
pub struct DialectStreamState {
    pub stream_id: Option<String>,
    pub created_unix: Option<i64>,
    pub message_started: bool,
}

pub struct OpenAiAdapter;
pub struct AnthropicAdapter;
pub struct NativeAdapter;

impl DialectAdapter for OpenAiAdapter {
    fn translate_in(&self, client_body: &Value) -> Result<Translated, PipelineError> {
        let raw_model = client_body["model"]
            .as_str()
            .ok_or_else(|| PipelineError::ClientError("missing `model`".into()))?;
        let (clean_model, thinking_level) = parse_model_and_thinking_level(raw_model);

        let messages = client_body["messages"]
            .as_array()
            .ok_or_else(|| PipelineError::ClientError("missing `messages`".into()))?;

        let mut contents = Vec::with_capacity(messages.len());
        let mut system_instruction = None;
        for message in messages {
            let role = message["role"].as_str().unwrap_or("user");
            let text = message["content"].as_str().unwrap_or_default();
            if role == "system" {
                system_instruction = Some(json!({ "parts": [{ "text": text }] }));
                continue;
            }
            let native_role = if role == "assistant" { "model" } else { "user" };
            contents.push(json!({ "role": native_role, "parts": [{ "text": text }] }));
        }

        let mut native_body = json!({ "contents": contents });
        if let Some(system_instruction) = system_instruction {
            native_body["systemInstruction"] = system_instruction;
        }

        Ok(Translated {
            native_body,
            clean_model,
            thinking_level,
        })
    }

    fn translate_out(&self, native_chunk: &Value, model: &str, state: &mut DialectStreamState) -> Value {
        if state.stream_id.is_none() {
            state.stream_id = Some(format!("chatcmpl-{}", short_id(native_chunk)));
        }
        let text = native_chunk["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default();
        let finish_reason = native_chunk["candidates"][0]["finishReason"]
            .as_str()
            .map(|reason| json!(map_finish_reason(reason)))
            .unwrap_or(Value::Null);

        json!({
            "id": state.stream_id,
            "object": "chat.completion.chunk",
            "model": model,
            "choices": [{
                "index": 0,
                "delta": { "content": text },
                "finish_reason": finish_reason,
            }],
        })
    }

    fn end_of_stream_sentinel(&self) -> Option<&'static str> {
        Some("[DONE]")
    }
}

impl DialectAdapter for AnthropicAdapter {
    fn translate_in(&self, client_body: &Value) -> Result<Translated, PipelineError> {
        let raw_model = client_body["model"]
            .as_str()
            .ok_or_else(|| PipelineError::ClientError("missing `model`".into()))?;
        let (clean_model, thinking_level) = parse_model_and_thinking_level(raw_model);

        let messages = client_body["messages"]
            .as_array()
            .ok_or_else(|| PipelineError::ClientError("missing `messages`".into()))?;

        let mut contents = Vec::with_capacity(messages.len());
        for message in messages {
            let role = message["role"].as_str().unwrap_or("user");
            let text = message["content"].as_str().unwrap_or_default();
            let native_role = if role == "assistant" { "model" } else { "user" };
            contents.push(json!({ "role": native_role, "parts": [{ "text": text }] }));
        }

        let mut native_body = json!({ "contents": contents });
        if let Some(system) = client_body.get("system") {
            native_body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        Ok(Translated {
            native_body,
            clean_model,
            thinking_level,
        })
    }

    fn translate_out(&self, native_chunk: &Value, _model: &str, state: &mut DialectStreamState) -> Value {
        let text = native_chunk["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default();
        state.message_started = true;

        json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": text },
        })
    }

    fn end_of_stream_sentinel(&self) -> Option<&'static str> {
        None
    }
}

impl DialectAdapter for NativeAdapter {
    fn translate_in(&self, client_body: &Value) -> Result<Translated, PipelineError> {
        let raw_model = client_body["model"].as_str().unwrap_or_default();
        let (clean_model, thinking_level) = parse_model_and_thinking_level(raw_model);
        Ok(Translated {
            native_body: client_body.clone(),
            clean_model,
            thinking_level,
        })
    }

    fn translate_out(&self, native_chunk: &Value, _model: &str, _state: &mut DialectStreamState) -> Value {
        native_chunk.clone()
    }

    fn end_of_stream_sentinel(&self) -> Option<&'static str> {
        None
    }
}

/// Small stable-ish id derived from whatever's in the first chunk, since the agent doesn't
/// mint one for us. Not cryptographically anything — just needs to stay constant across the
/// chunks of one response.
fn short_id(first_chunk: &Value) -> String {
    let seed = first_chunk.to_string();
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in seed.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

fn map_finish_reason(native: &str) -> &'static str {
    match native {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" => "content_filter",
        _ => "stop",
    }
}

pub fn adapter_for(dialect: Dialect) -> &'static dyn DialectAdapter {
    match dialect {
        Dialect::OpenAi => &OpenAiAdapter,
        Dialect::Anthropic => &AnthropicAdapter,
        Dialect::Native => &NativeAdapter,
    }
}
