//! Secret redaction applied at the serialization boundary only — never at
//! storage time, so the store and persistence layer always hold plaintext.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static SECRET_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(secret|token|key|password|credential)").unwrap());

fn redact_string(value: &str) -> String {
    if value.len() < 8 {
        "***".to_string()
    } else {
        format!("{}…{}", &value[..4], &value[value.len() - 4..])
    }
}

/// Walk a JSON value, rewriting any string found under a key matching the
/// secret pattern. Recurses into nested objects and arrays so a secret
/// buried in `metadata` or `env` is caught the same as a top-level one.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                if SECRET_KEY_PATTERN.is_match(key) {
                    let redacted = match val {
                        Value::String(s) => Value::String(redact_string(s)),
                        other => other.clone(),
                    };
                    out.insert(key.clone(), redacted);
                } else {
                    out.insert(key.clone(), redact(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}
