//! Normalization helpers applied to every model response before it is
//! treated as typed data. Raw parse results are never trusted directly.

use serde_json::Value;

/// Reads a numeric field, accepting JSON numbers, numeric strings, and
/// booleans, clamping the result into `[min, max]`.
pub fn value_as_f64(value: Option<&Value>, default: f64, min: f64, max: f64) -> f64 {
    let parsed = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(raw)) => raw.trim().trim_end_matches('%').parse::<f64>().ok(),
        Some(Value::Bool(flag)) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    };
    parsed.unwrap_or(default).clamp(min, max)
}

pub fn value_as_bool(value: Option<&Value>) -> Option<bool> {
    match value {
        Some(Value::Bool(flag)) => Some(*flag),
        Some(Value::String(raw)) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        Some(Value::Number(number)) => number.as_f64().map(|value| value != 0.0),
        _ => None,
    }
}

/// Extracts a non-empty string from the first matching key, descending one
/// level into `{ "text": ... }` / `{ "value": ... }` wrapper objects that
/// models occasionally emit in place of a plain string.
pub fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    let object = value.as_object()?;
    for key in keys {
        if let Some(found) = object.get(*key) {
            if let Some(text) = loose_string(found) {
                return Some(text);
            }
        }
    }
    None
}

pub fn loose_string(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Object(object) => ["text", "value", "content", "message"]
            .iter()
            .find_map(|key| object.get(*key).and_then(loose_string)),
        _ => None,
    }
}

/// Coerces a value into a list of non-empty strings. A bare string becomes a
/// one-element list; non-string array entries are stringified where possible.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(rows)) => rows.iter().filter_map(loose_string).collect(),
        Some(other) => loose_string(other).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Lowercases and strips everything but ASCII alphanumerics, so that
/// "HIGH_SCRUTINY", "High Scrutiny", and "high-scrutiny" all compare equal.
pub fn normalize_token(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

/// Pulls the first JSON object out of model text: tries a direct parse,
/// then strips markdown code fences, then falls back to the outermost
/// brace-delimited span.
pub fn json_object_from_text(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let unfenced = strip_code_fence(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&unfenced[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(after_open) = text.strip_prefix("```") else {
        return text;
    };
    let body = match after_open.find('\n') {
        Some(newline) => &after_open[newline + 1..],
        None => after_open,
    };
    body.rsplit_once("```")
        .map(|(inner, _)| inner.trim())
        .unwrap_or(body)
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}
