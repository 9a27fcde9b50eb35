//! Native-body rewrites applied after dialect translation (§4.E step 4): force-injecting
//! optional generative capabilities, and normalizing shapes the upstream expects.

use serde_json::{Value, json};

/// Force-enable flags, sourced from configuration (§12 `force_thinking`/`force_web_search`/
/// `force_url_context`). Each only takes effect when the client hasn't already set a
/// compatible field — the pipeline augments, it never overrides an explicit client choice.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForceFlags {
    pub thinking: bool,
    pub web_search: bool,
    pub url_context: bool,
}

/// Merges `thinking_level` (from the `@level` model suffix, §4.E step 3) and the force flags
/// into `native_body` in place.
pub fn apply_body_rewrites(native_body: &mut Value, thinking_level: Option<&str>, force: ForceFlags) {
    inject_thinking_config(native_body, thinking_level, force.thinking);
    if force.web_search {
        push_tool_if_absent(native_body, "googleSearch");
    }
    if force.url_context {
        push_tool_if_absent(native_body, "urlContext");
    }
    ensure_thought_signatures(native_body);
    normalize_tools(native_body);
}

fn inject_thinking_config(native_body: &mut Value, thinking_level: Option<&str>, force_thinking: bool) {
    let generation_config = native_body
        .as_object_mut()
        .map(|body| body.entry("generationConfig").or_insert_with(|| json!({})));
    let Some(generation_config) = generation_config else {
        return;
    };

    if let Some(level) = thinking_level {
        generation_config["thinkingConfig"]["thinkingLevel"] = json!(level.to_uppercase());
    }

    if force_thinking && generation_config["thinkingConfig"]["includeThoughts"].is_null() {
        generation_config["thinkingConfig"]["includeThoughts"] = json!(true);
    }
}

fn push_tool_if_absent(native_body: &mut Value, tool_key: &str) {
    let Some(body) = native_body.as_object_mut() else {
        return;
    };
    let tools = body.entry("tools").or_insert_with(|| json!([]));
    let Some(tools) = tools.as_array_mut() else {
        return;
    };
    let already_present = tools.iter().any(|tool| tool.get(tool_key).is_some());
    if !already_present {
        tools.push(json!({ tool_key: {} }));
    }
}

/// The upstream requires every function-call part to carry a `thoughtSignature`; synthesize
/// an empty one where the client (or an earlier translation step) omitted it.
fn ensure_thought_signatures(native_body: &mut Value) {
    let Some(contents) = native_body.get_mut("contents").and_then(Value::as_array_mut) else {
        return;
    };
    for content in contents {
        let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
            continue;
        };
        for part in parts {
            if part.get("functionCall").is_some() && part.get("thoughtSignature").is_none() {
                part["thoughtSignature"] = json!("");
            }
        }
    }
}

/// Normalizes a `tools` array down to the shape the upstream expects: bare `{googleSearch:{}}`
/// / `{urlContext:{}}` entries pass through; a legacy `functionDeclarations` list nested under
/// a non-standard key is hoisted to the top level of its own tool entry.
fn normalize_tools(native_body: &mut Value) {
    let Some(tools) = native_body.get_mut("tools").and_then(Value::as_array_mut) else {
        return;
    };
    for tool in tools.iter_mut() {
        if let Some(declarations) = tool.get("functions").cloned() {
            if let Some(obj) = tool.as_object_mut() {
                obj.remove("functions");
                obj.insert("functionDeclarations".into(), declarations);
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_level_is_upper_cased_into_generation_config() {
        let mut body = json!({ "contents": [] });
        apply_body_rewrites(&mut body, Some("high"), ForceFlags::default());
        assert_eq!(body["generationConfig"]["thinkingConfig"]["thinkingLevel"], "HIGH");
    }

    #[test]
    fn force_thinking_does_not_override_explicit_client_setting() {
        let mut body = json!({
            "generationConfig": { "thinkingConfig": { "includeThoughts": false } },
        });
        apply_body_rewrites(&mut body, None, ForceFlags { thinking: true, ..Default::default() });
        assert_eq!(body["generationConfig"]["thinkingConfig"]["includeThoughts"], false);
    }

    #[test]
    fn web_search_tool_injected_once() {
        let mut body = json!({ "tools": [{ "googleSearch": {} }] });
        apply_body_rewrites(&mut body, None, ForceFlags { web_search: true, ..Default::default() });
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn url_context_tool_appended_when_absent() {
        let mut body = json!({});
        apply_body_rewrites(&mut body, None, ForceFlags { url_context: true, ..Default::default() });
        assert_eq!(body["tools"], json!([{ "urlContext": {} }]));
    }

    #[test]
    fn function_call_parts_get_empty_thought_signature() {
        let mut body = json!({
            "contents": [{ "role": "model", "parts": [{ "functionCall": { "name": "f" } }] }],
        });
        apply_body_rewrites(&mut body, None, ForceFlags::default());
        assert_eq!(body["contents"][0]["parts"][0]["thoughtSignature"], "");
    }

    #[test]
    fn existing_thought_signature_is_preserved() {
        let mut body = json!({
            "contents": [{
                "parts": [{ "functionCall": { "name": "f" }, "thoughtSignature": "abc" }],
            }],
        });
        apply_body_rewrites(&mut body, None, ForceFlags::default());
        assert_eq!(body["contents"][0]["parts"][0]["thoughtSignature"], "abc");
    }
}
