//! `{{ path.expr }}` placeholder resolution against the live run scope.

use regex::Regex;
use serde_json::{Map, Value};

use std::sync::LazyLock;

use crate::{SurfError, SurfResult, lookup_path, value_to_text};

static TEMPLATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").expect("valid template pattern"));

static PATH_EXPR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_$-]+(?:\.[A-Za-z0-9_$-]+|\[\d+\])*$").expect("valid path expression pattern")
});

/// Expression of a string that is exactly one `{{...}}` placeholder.
fn exact_expr(s: &str) -> Option<&str> {
    let caps = TEMPLATE.captures(s)?;
    let whole = caps.get(0)?;
    if whole.start() != 0 || whole.end() != s.len() {
        return None;
    }
    caps.get(1).map(|m| m.as_str())
}

/// The whole string is a single well-formed placeholder.
pub fn is_exact_template(s: &str) -> bool {
    exact_expr(s).is_some_and(|expr| PATH_EXPR.is_match(expr))
}

pub fn contains_template(s: &str) -> bool {
    TEMPLATE.is_match(s)
}

pub fn resolve_template_in_value(value: &Value, scope: &Value, path_label: &str) -> SurfResult<Value> {
    match value {
        Value::String(s) => resolve_string(s, scope, path_label),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| resolve_template_in_value(item, scope, &format!("{path_label}[{i}]")))
            .collect::<SurfResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(
                    k.clone(),
                    resolve_template_in_value(v, scope, &format!("{path_label}.{k}"))?,
                );
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, scope: &Value, path_label: &str) -> SurfResult<Value> {
    if let Some(expr) = exact_expr(s) {
        return lookup(scope, expr, s, path_label).cloned();
    }
    if !contains_template(s) {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0usize;
    for caps in TEMPLATE.captures_iter(s) {
        let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&s[last..whole.start()]);
        let resolved = lookup(scope, expr.as_str(), whole.as_str(), path_label)?;
        out.push_str(&value_to_text(resolved));
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn lookup<'a>(scope: &'a Value, expr: &str, template: &str, path_label: &str) -> SurfResult<&'a Value> {
    if !PATH_EXPR.is_match(expr) {
        return Err(SurfError::query(format!(
            "malformed template {template} at {path_label}: '{expr}' is not a dotted or indexed path"
        )));
    }
    lookup_path(scope, expr).ok_or_else(|| {
        SurfError::query(format!(
            "unresolved template {template} at {path_label}: path '{expr}' not found in scope"
        ))
    })
}
