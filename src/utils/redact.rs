use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;

const REDACTION: &str = "***REDACTED***";

static SENSITIVE_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "password",
        "secret",
        "token",
        "api_key",
        "apikey",
        "appid",
        "access_token",
        "authorization",
        "client_secret",
    ]
    .into_iter()
    .collect()
});

static INLINE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?i)\b(Bearer|Basic)\s+[A-Za-z0-9+/._~=-]{8,}").expect("redact regex"),
            "$1 ***REDACTED***",
        ),
        (
            Regex::new(r"(?i)\b(api[_-]?key|appid|token|secret|access_token)=([^&\s\x22]+)")
                .expect("redact regex"),
            "$1=***REDACTED***",
        ),
    ]
});

pub fn redact_text(text: &str) -> String {
    let mut out = text.to_string();
    for (pattern, replacement) in INLINE_PATTERNS.iter() {
        out = pattern.replace_all(&out, *replacement).to_string();
    }
    out
}

/// Replaces values under sensitive keys with a marker, recursively. Used on
/// anything definition-shaped before it is logged or echoed back to a caller.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map {
                if SENSITIVE_KEYS.contains(key.to_lowercase().as_str()) {
                    out.insert(key.clone(), Value::String(REDACTION.to_string()));
                } else {
                    out.insert(key.clone(), redact_value(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(redact_value).collect()),
        Value::String(text) => Value::String(redact_text(text)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_sensitive_keys_recursively() {
        let value = serde_json::json!({
            "auth": {"type": "bearer", "token": "abc123"},
            "name": "github",
        });
        let redacted = redact_value(&value);
        assert_eq!(redacted["auth"]["token"], "***REDACTED***");
        assert_eq!(redacted["name"], "github");
    }

    #[test]
    fn redacts_bearer_headers_and_query_keys_in_text() {
        let text = "Authorization: Bearer sk12345678 url?api_key=abcdef123";
        let redacted = redact_text(text);
        assert!(!redacted.contains("sk12345678"));
        assert!(!redacted.contains("abcdef123"));
    }
}
