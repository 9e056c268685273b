//! Declarative checks (`equals`, `contains`, `truthy`, `exists`, `gte`) against a step report.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{SurfError, SurfResult, lookup_path, normalize_path, value_to_text};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssertionSpec {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub equals: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub contains: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truthy: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exists: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub gte: Map<String, Value>,
}

impl AssertionSpec {
    pub fn from_value(value: &Value, label: &str) -> SurfResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| SurfError::query(format!("{label}: invalid assertion spec: {e}")))
    }

    pub fn check_count(&self) -> usize {
        self.equals.len() + self.contains.len() + self.truthy.len() + self.exists.len() + self.gte.len()
    }

    pub fn is_empty(&self) -> bool {
        self.check_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    Equals,
    Contains,
    Truthy,
    Exists,
    Gte,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionCheck {
    pub kind: AssertionKind,
    pub path: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssertionOutcome {
    pub total: usize,
    pub failed: usize,
    pub checks: Vec<AssertionCheck>,
}

impl AssertionOutcome {
    pub fn passed(&self) -> bool {
        self.failed == 0
    }

    pub fn first_failure(&self) -> Option<&AssertionCheck> {
        self.checks.iter().find(|c| !c.passed)
    }
}

/// Checks run in declaration order: equals, contains, truthy, exists, gte.
pub fn evaluate_assertions(spec: &AssertionSpec, report: &Value) -> AssertionOutcome {
    let mut checks = Vec::with_capacity(spec.check_count());

    for (path, expected) in &spec.equals {
        let actual = lookup_path(report, path);
        let passed = actual.is_some_and(|a| same_value(a, expected));
        let message = if passed {
            format!("equals {path}")
        } else {
            format!(
                "equals {path}: expected {}, got {}",
                expected,
                describe(actual)
            )
        };
        checks.push(check(AssertionKind::Equals, path, passed, Some(expected), actual, message));
    }

    for (path, expected) in &spec.contains {
        let actual = lookup_path(report, path);
        let needle = value_to_text(expected);
        let passed = actual.is_some_and(|a| value_to_text(a).contains(&needle));
        let message = if passed {
            format!("contains {path}")
        } else {
            format!(
                "contains {path}: expected substring {needle:?} in {}",
                describe(actual)
            )
        };
        checks.push(check(AssertionKind::Contains, path, passed, Some(expected), actual, message));
    }

    for path in &spec.truthy {
        let actual = lookup_path(report, path);
        let passed = actual.is_some_and(is_truthy);
        let message = if passed {
            format!("truthy {path}")
        } else {
            format!("truthy {path}: value is falsy ({})", describe(actual))
        };
        checks.push(check(AssertionKind::Truthy, path, passed, None, actual, message));
    }

    for path in &spec.exists {
        let actual = lookup_path(report, path);
        let passed = actual.is_some();
        let message = if passed {
            format!("exists {path}")
        } else {
            format!("exists {path}: path is undefined")
        };
        checks.push(check(AssertionKind::Exists, path, passed, None, actual, message));
    }

    for (path, expected) in &spec.gte {
        let actual = lookup_path(report, path);
        let (passed, message) = match (expected.as_f64(), actual.and_then(Value::as_f64)) {
            (None, _) => (
                false,
                format!("gte {path}: threshold {expected} is not a number"),
            ),
            (Some(min), Some(got)) if got >= min => (true, format!("gte {path}")),
            (Some(min), _) => (
                false,
                format!("gte {path}: expected >= {min}, got {}", describe(actual)),
            ),
        };
        checks.push(check(AssertionKind::Gte, path, passed, Some(expected), actual, message));
    }

    let failed = checks.iter().filter(|c| !c.passed).count();
    AssertionOutcome {
        total: checks.len(),
        failed,
        checks,
    }
}

fn check(
    kind: AssertionKind,
    path: &str,
    passed: bool,
    expected: Option<&Value>,
    actual: Option<&Value>,
    message: String,
) -> AssertionCheck {
    AssertionCheck {
        kind,
        path: normalize_path(path),
        passed,
        expected: expected.cloned(),
        actual: actual.cloned(),
        message,
    }
}

fn describe(actual: Option<&Value>) -> String {
    match actual {
        Some(v) => v.to_string(),
        None => "undefined".to_string(),
    }
}

/// Same-value comparison: `NaN` equals `NaN`, `0` and `-0` differ, containers never compare equal.
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
                return i == j;
            }
            if let (Some(i), Some(j)) = (x.as_u64(), y.as_u64()) {
                return i == j;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(i), Some(j)) => same_value_f64(i, j),
                _ => false,
            }
        }
        _ => false,
    }
}

pub fn same_value_f64(a: f64, b: f64) -> bool {
    if a.is_nan() && b.is_nan() {
        return true;
    }
    a == b && a.is_sign_negative() == b.is_sign_negative()
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
