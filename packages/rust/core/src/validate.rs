//! Payload validation and canonicalisation.
//!
//! Raw model output goes through five hard gates: fence stripping, JSON
//! parsing, array shape, non-emptiness, and per-item schema conformance.
//! Only a fully conforming payload is re-serialised, in the fixed key order
//! of the mode's record struct.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use cardpipe_shared::{CardpipeError, ExtraUpdate, Result, SchemaKind, TagAudit, TagUpdate};

/// A payload that passed every gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPayload {
    /// Pretty-printed canonical JSON array.
    pub canonical_json: String,
    pub item_count: usize,
}

/// Remove a leading ```` ```lang ```` fence, a trailing ```` ``` ````, and
/// surrounding whitespace.
pub fn strip_fences(raw: &str) -> &str {
    static OPEN_FENCE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)^```[a-z0-9_+-]*").expect("valid regex"));

    let mut cleaned = raw.trim();
    if let Some(m) = OPEN_FENCE.find(cleaned) {
        cleaned = cleaned[m.end()..].trim();
    }
    if let Some(stripped) = cleaned.strip_suffix("```") {
        cleaned = stripped.trim();
    }
    cleaned
}

/// Validate `raw` against `schema` and produce canonical output.
pub fn validate(raw: &str, schema: SchemaKind) -> Result<ValidatedPayload> {
    let cleaned = strip_fences(raw);

    let value: Value = serde_json::from_str(cleaned).map_err(|e| CardpipeError::Parse {
        message: e.to_string(),
        payload_len: cleaned.chars().count(),
    })?;

    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(CardpipeError::Shape {
                found: json_type_name(&other).to_string(),
            });
        }
    };

    if items.is_empty() {
        return Err(CardpipeError::EmptyPayload);
    }

    match schema {
        SchemaKind::TagAudit => canonicalize::<TagAudit>(items),
        SchemaKind::TagAdd => canonicalize::<TagUpdate>(items),
        SchemaKind::FieldUpdate => canonicalize::<ExtraUpdate>(items),
    }
}

/// Decode every item as `T`, reporting all failures at once.
fn canonicalize<T>(items: Vec<Value>) -> Result<ValidatedPayload>
where
    T: DeserializeOwned + Serialize,
{
    let item_count = items.len();
    let mut records = Vec::with_capacity(item_count);
    let mut problems = Vec::new();

    for (index, item) in items.into_iter().enumerate() {
        if !item.is_object() {
            problems.push(format!(
                "item {index}: expected an object, got {}",
                json_type_name(&item)
            ));
            continue;
        }
        match serde_json::from_value::<T>(item) {
            Ok(record) => records.push(record),
            Err(e) => problems.push(format!("item {index}: {e}")),
        }
    }

    if !problems.is_empty() {
        return Err(CardpipeError::Schema {
            message: problems.join("; "),
            item_count,
        });
    }

    let canonical_json = serde_json::to_string_pretty(&records)
        .map_err(|e| CardpipeError::Unexpected(format!("JSON serialization failed: {e}")))?;

    Ok(ValidatedPayload {
        canonical_json,
        item_count,
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
