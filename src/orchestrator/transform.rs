//! Request preparation: model/family extraction and the effort-clamping
//! coercions applied before the catalog is consulted.

use serde_json::Value;

use crate::catalog::CatalogEntry;
use crate::error::{CoreError, Result};

pub struct PreparedRequest {
    pub family: String,
    pub model: String,
    pub stream: bool,
    pub requested_effort: Option<String>,
}

/// Pull `model` and the streaming flag out of the inbound body. The family is,
/// for this vendor, the normalized model slug itself.
pub fn extract(body: &Value) -> Result<PreparedRequest> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::UpstreamError { status: 400, body: "missing model".into() })?
        .to_string();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let requested_effort = body
        .get("reasoning")
        .and_then(|r| r.get("effort"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let family = CatalogEntry::normalize_slug(&model);

    Ok(PreparedRequest { family, model, stream, requested_effort })
}

/// Apply the documented effort coercions ahead of validating against the
/// model's supported set: `none`/`minimal` (codex variants) fold down to
/// `low`; `xhigh` folds to `high` except on the `max` model.
pub fn coerce_effort(requested: &str, model: &str) -> String {
    let model_lower = model.to_ascii_lowercase();
    match requested {
        "none" => "low".to_string(),
        "minimal" if model_lower.contains("codex") => "low".to_string(),
        "xhigh" if model_lower == "max" => "xhigh".to_string(),
        "xhigh" => "high".to_string(),
        other => other.to_string(),
    }
}

/// Strip host-assigned message ids, force `store:false`, and set the
/// resolved reasoning effort and base instructions from the catalog.
pub fn transform_body(
    mut body: Value,
    reasoning_level: &str,
    base_instructions: Option<&str>,
) -> Value {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("store".to_string(), Value::Bool(false));

        if let Some(messages) = obj.get_mut("input").and_then(Value::as_array_mut) {
            for message in messages.iter_mut() {
                if let Some(message_obj) = message.as_object_mut() {
                    message_obj.remove("id");
                }
            }
        }

        let reasoning = obj
            .entry("reasoning")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Some(reasoning_obj) = reasoning.as_object_mut() {
            reasoning_obj.insert("effort".to_string(), Value::String(reasoning_level.to_string()));
        }

        if let Some(instructions) = base_instructions {
            obj.insert("instructions".to_string(), Value::String(instructions.to_string()));
        }
    }
    body
}
