use crate::errors::ToolError;
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, ToolError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(ToolError::invalid_params("Path must be a non-empty string"));
    }
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;
    for ch in trimmed.chars() {
        match ch {
            '.' if !in_brackets => {
                if !current.trim().is_empty() {
                    segments.push(segment_from(&current));
                }
                current.clear();
            }
            '[' => {
                if !current.trim().is_empty() {
                    segments.push(segment_from(&current));
                    current.clear();
                }
                in_brackets = true;
            }
            ']' => {
                if !current.trim().is_empty() {
                    segments.push(segment_from(&current));
                }
                current.clear();
                in_brackets = false;
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        segments.push(segment_from(&current));
    }
    Ok(segments)
}

fn segment_from(raw: &str) -> PathSegment {
    let trimmed = raw.trim().trim_matches('"').trim_matches('\'').trim();
    if let Ok(index) = trimmed.parse::<usize>() {
        return PathSegment::Index(index);
    }
    PathSegment::Key(trimmed.to_string())
}

/// Looks up a nested value by dotted/bracket path. Returns `None` when any
/// segment is absent, which callers treat as a missing field rather than an
/// error.
pub fn lookup_path<'a>(target: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse_path(path).ok()?;
    let mut current = target;
    for segment in segments.iter() {
        match segment {
            PathSegment::Key(key) => {
                current = current.get(key)?;
            }
            PathSegment::Index(index) => {
                current = current.as_array().and_then(|arr| arr.get(*index))?;
            }
        }
    }
    Some(current)
}

/// Writes a value into a nested object at a dotted key path, creating
/// intermediate objects. Index segments are not supported for writes; such
/// paths are ignored, matching the projection rule that unaddressable fields
/// are dropped rather than raised.
pub fn set_path_value(target: &mut Value, path: &str, value: Value) {
    let Ok(segments) = parse_path(path) else {
        return;
    };
    if segments
        .iter()
        .any(|segment| matches!(segment, PathSegment::Index(_)))
    {
        return;
    }
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let mut current = target;
    for (pos, segment) in segments.iter().enumerate() {
        let PathSegment::Key(key) = segment else {
            return;
        };
        let last = pos == segments.len() - 1;
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if last {
            map.insert(key.clone(), value);
            return;
        }
        let entry = map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Default::default()));
        if !entry.is_object() {
            *entry = Value::Object(Default::default());
        }
        current = entry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_path_resolves_nested_keys_and_indexes() {
        let value = serde_json::json!({"main": {"temp": 21.5}, "weather": [{"id": 800}]});
        assert_eq!(
            lookup_path(&value, "main.temp"),
            Some(&serde_json::json!(21.5))
        );
        assert_eq!(
            lookup_path(&value, "weather[0].id"),
            Some(&serde_json::json!(800))
        );
        assert!(lookup_path(&value, "main.missing").is_none());
    }

    #[test]
    fn set_path_value_builds_intermediate_objects() {
        let mut out = Value::Object(Default::default());
        set_path_value(&mut out, "main.temp", serde_json::json!(21.5));
        assert_eq!(out, serde_json::json!({"main": {"temp": 21.5}}));
    }

    #[test]
    fn set_path_value_ignores_index_segments() {
        let mut out = Value::Object(Default::default());
        set_path_value(&mut out, "items[0].name", serde_json::json!("x"));
        assert_eq!(out, serde_json::json!({}));
    }
}
