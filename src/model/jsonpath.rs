//! Dotted/indexed path expressions (`a.b[0].c`) over JSON values.

use serde_json::Value;

/// `a.b[0].c` -> `a.b.0.c`
pub fn normalize_path(path: &str) -> String {
    path_segments(path).join(".")
}

pub fn path_segments(path: &str) -> Vec<String> {
    let replaced = path.trim().replace('[', ".").replace(']', "");
    replaced
        .split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `None` means the path does not exist; a present JSON `null` is `Some(Value::Null)`.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = path_segments(path);
    if segments.is_empty() {
        return None;
    }
    let mut cur = root;
    for seg in &segments {
        cur = match cur {
            Value::Object(map) => map.get(seg.as_str())?,
            Value::Array(items) => {
                let idx: usize = seg.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(cur)
}

/// Text form used for interpolation and substring checks.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
