//! Streaming-mode shaping (§4.E.3): pseudo-stream thought/content splitting, the non-stream
//! inline-image rewrite, and the small SSE-framing helpers shared by both.

use serde_json::Value;

/// `data: <json>\n\n`, the standard SSE data-record framing.
pub fn sse_data_line(value: &Value) -> String {
    format!("data: {value}\n\n")
}

/// `data: [DONE]\n\n` or any other dialect end-of-stream sentinel.
pub fn sse_sentinel_line(sentinel: &str) -> String {
    format!("data: {sentinel}\n\n")
}

/// `: <comment>\n\n`, used for pseudo-stream keep-alives — ignored by SSE clients, just
/// enough to keep an idle connection from being reaped by an intermediary.
pub fn sse_comment_line(comment: &str) -> String {
    format!(": {comment}\n\n")
}

/// Pseudo-stream response shaping (§4.E.3): given the fully-accumulated native JSON body for
/// a `:generateContent` call made in place of a requested `:streamGenerateContent`, produce
/// the SSE records the client should see. Thought parts (`part.thought == true`) are emitted
/// first without `finishReason`; content parts are emitted second, carrying `finishReason`
/// and `usageMetadata`. On any structural mismatch (no `candidates[0].content.parts`), the
/// whole body is emitted as a single raw record instead.
pub fn build_pseudo_stream_records(body: &Value) -> Vec<Value> {
    let Some(parts) = body["candidates"][0]["content"]["parts"].as_array() else {
        return vec![body.clone()];
    };

    let (thought_parts, content_parts): (Vec<Value>, Vec<Value>) = parts
        .iter()
        .cloned()
        .partition(|part| part["thought"].as_bool().unwrap_or(false));

    let mut records = Vec::with_capacity(2);

    if !thought_parts.is_empty() {
        let mut thought_body = body.clone();
        thought_body["candidates"][0]["content"]["parts"] = Value::Array(thought_parts);
        if let Some(candidate) = thought_body["candidates"][0].as_object_mut() {
            candidate.remove("finishReason");
        }
        if let Some(root) = thought_body.as_object_mut() {
            root.remove("usageMetadata");
        }
        records.push(thought_body);
    }

    let mut content_body = body.clone();
    content_body["candidates"][0]["content"]["parts"] = Value::Array(content_parts);
    records.push(content_body);

    records
}

/// Non-stream inline-image rewrite (§4.E.3, Testable Property 8): a part shaped
/// `{inlineData:{mimeType, data}}` becomes a text part holding a Markdown image reference
/// embedding the data URL. Returns `true` if any rewrite was applied.
pub fn rewrite_inline_images(body: &mut Value) -> bool {
    let mut rewrote = false;
    let Some(candidates) = body.get_mut("candidates").and_then(Value::as_array_mut) else {
        return false;
    };
    for candidate in candidates {
        let Some(parts) = candidate
            .get_mut("content")
            .and_then(|content| content.get_mut("parts"))
            .and_then(Value::as_array_mut)
        else {
            continue;
        };
        for part in parts.iter_mut() {
            let Some(inline_data) = part.get("inlineData").cloned() else {
                continue;
            };
            let (Some(mime_type), Some(data)) = (
                inline_data["mimeType"].as_str(),
                inline_data["data"].as_str(),
            ) else {
                continue;
            };
            let markdown = format!("![Generated Image](data:{mime_type};base64,{data})");
            *part = serde_json::json!({ "text": markdown });
            rewrote = true;
        }
    }
    rewrote
}
