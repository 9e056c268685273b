//! Static plan validation. Produces issues instead of failing fast so `--doctor` can report all of them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::{AssertionSpec, StepKind, is_exact_template};

pub const MAX_REPEAT_ATTEMPTS: u64 = 25;
pub const DEFAULT_REPEAT_ATTEMPTS: u64 = 5;

/// Keys every step may carry regardless of kind.
pub const COMMON_STEP_FIELDS: [&str; 6] = ["id", "as", "assert", "timeoutMs", "targetId", "frameScope"];

const PLAN_FIELDS: [&str; 5] = ["steps", "result", "require", "name", "description"];

static ALIAS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]{0,63}$").expect("valid alias pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintIssue {
    pub level: IssueLevel,
    pub path: String,
    pub message: String,
}

impl LintIssue {
    fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Error,
            path: path.into(),
            message: message.into(),
        }
    }

    fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Warning,
            path: path.into(),
            message: message.into(),
        }
    }
}

pub fn has_errors(issues: &[LintIssue]) -> bool {
    issues.iter().any(|i| i.level == IssueLevel::Error)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Str,
    NonEmptyStr,
    Bool,
    PositiveInt,
    NonNegInt,
    Number,
    IntList,
    NonEmptyStrList,
    Object,
    Any,
}

impl FieldType {
    fn describe(self) -> &'static str {
        match self {
            FieldType::Str => "a string",
            FieldType::NonEmptyStr => "a non-empty string",
            FieldType::Bool => "a boolean",
            FieldType::PositiveInt => "a positive integer",
            FieldType::NonNegInt => "a non-negative integer",
            FieldType::Number => "a number",
            FieldType::IntList => "an array of non-negative integers",
            FieldType::NonEmptyStrList => "a non-empty array of strings",
            FieldType::Object => "an object",
            FieldType::Any => "any JSON value",
        }
    }

    fn accepts(self, v: &Value) -> bool {
        match self {
            FieldType::Str => v.is_string(),
            FieldType::NonEmptyStr => v.as_str().is_some_and(|s| !s.trim().is_empty()),
            FieldType::Bool => v.is_boolean(),
            FieldType::PositiveInt => v.as_u64().is_some_and(|n| n > 0),
            FieldType::NonNegInt => v.as_u64().is_some(),
            FieldType::Number => v.is_number(),
            FieldType::IntList => v
                .as_array()
                .is_some_and(|items| items.iter().all(|i| i.as_u64().is_some())),
            FieldType::NonEmptyStrList => v
                .as_array()
                .is_some_and(|items| !items.is_empty() && items.iter().all(Value::is_string)),
            FieldType::Object => v.is_object(),
            FieldType::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
}

const fn req(name: &'static str, ty: FieldType) -> FieldRule {
    FieldRule {
        name,
        ty,
        required: true,
    }
}

const fn opt(name: &'static str, ty: FieldType) -> FieldRule {
    FieldRule {
        name,
        ty,
        required: false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KindRules {
    pub fields: &'static [FieldRule],
    /// At least one of these must be present.
    pub one_of: &'static [&'static str],
}

const OPEN_FIELDS: &[FieldRule] = &[
    req("url", FieldType::NonEmptyStr),
    opt("reuse", FieldType::Bool),
    opt("waitUntil", FieldType::NonEmptyStr),
];
const SNAPSHOT_FIELDS: &[FieldRule] = &[
    opt("selector", FieldType::NonEmptyStr),
    opt("visibleOnly", FieldType::Bool),
    opt("maxChars", FieldType::PositiveInt),
];
const FIND_FIELDS: &[FieldRule] = &[
    opt("text", FieldType::NonEmptyStr),
    opt("selector", FieldType::NonEmptyStr),
    opt("contains", FieldType::NonEmptyStr),
    opt("visibleOnly", FieldType::Bool),
    opt("limit", FieldType::PositiveInt),
];
const COUNT_FIELDS: &[FieldRule] = &[
    opt("text", FieldType::NonEmptyStr),
    opt("selector", FieldType::NonEmptyStr),
    opt("visibleOnly", FieldType::Bool),
];
const SCROLL_PLAN_FIELDS: &[FieldRule] = &[
    opt("steps", FieldType::IntList),
    opt("settleMs", FieldType::NonNegInt),
];
const CLICK_FIELDS: &[FieldRule] = &[
    opt("text", FieldType::NonEmptyStr),
    opt("selector", FieldType::NonEmptyStr),
    opt("index", FieldType::NonNegInt),
    opt("visibleOnly", FieldType::Bool),
    opt("waitForText", FieldType::NonEmptyStr),
    opt("waitForSelector", FieldType::NonEmptyStr),
];
const CLICK_READ_FIELDS: &[FieldRule] = &[
    opt("text", FieldType::NonEmptyStr),
    opt("selector", FieldType::NonEmptyStr),
    opt("readSelector", FieldType::NonEmptyStr),
    opt("chunkSize", FieldType::PositiveInt),
];
const FILL_FIELDS: &[FieldRule] = &[
    opt("text", FieldType::NonEmptyStr),
    opt("selector", FieldType::NonEmptyStr),
    req("value", FieldType::Str),
];
const UPLOAD_FIELDS: &[FieldRule] = &[
    req("selector", FieldType::NonEmptyStr),
    req("files", FieldType::NonEmptyStrList),
];
const READ_FIELDS: &[FieldRule] = &[
    opt("selector", FieldType::NonEmptyStr),
    opt("chunkSize", FieldType::PositiveInt),
    opt("chunk", FieldType::PositiveInt),
];
const EVAL_FIELDS: &[FieldRule] = &[req("expression", FieldType::NonEmptyStr)];
const WAIT_FIELDS: &[FieldRule] = &[
    opt("forText", FieldType::NonEmptyStr),
    opt("forSelector", FieldType::NonEmptyStr),
    opt("networkIdle", FieldType::Bool),
    opt("ms", FieldType::NonNegInt),
];
const EXTRACT_FIELDS: &[FieldRule] = &[
    opt("kind", FieldType::NonEmptyStr),
    opt("selector", FieldType::NonEmptyStr),
    opt("limit", FieldType::PositiveInt),
];
const REPEAT_UNTIL_FIELDS: &[FieldRule] = &[
    req("step", FieldType::Object),
    req("untilPath", FieldType::NonEmptyStr),
    opt("untilEquals", FieldType::Any),
    opt("untilGte", FieldType::Number),
    opt("untilChanged", FieldType::Bool),
    opt("maxAttempts", FieldType::PositiveInt),
];

const TEXT_OR_SELECTOR: &[&str] = &["text", "selector"];

pub fn kind_rules(kind: StepKind) -> KindRules {
    let (fields, one_of): (&'static [FieldRule], &'static [&'static str]) = match kind {
        StepKind::Open => (OPEN_FIELDS, &[]),
        StepKind::List => (&[], &[]),
        StepKind::Snapshot => (SNAPSHOT_FIELDS, &[]),
        StepKind::Find => (FIND_FIELDS, TEXT_OR_SELECTOR),
        StepKind::Count => (COUNT_FIELDS, &[]),
        StepKind::ScrollPlan => (SCROLL_PLAN_FIELDS, &[]),
        StepKind::Click => (CLICK_FIELDS, TEXT_OR_SELECTOR),
        StepKind::ClickRead => (CLICK_READ_FIELDS, TEXT_OR_SELECTOR),
        StepKind::Fill => (FILL_FIELDS, TEXT_OR_SELECTOR),
        StepKind::Upload => (UPLOAD_FIELDS, &[]),
        StepKind::Read => (READ_FIELDS, &[]),
        StepKind::Eval => (EVAL_FIELDS, &[]),
        StepKind::Wait => (WAIT_FIELDS, &["forText", "forSelector", "networkIdle", "ms"]),
        StepKind::Extract => (EXTRACT_FIELDS, &[]),
        StepKind::RepeatUntil => (REPEAT_UNTIL_FIELDS, &[]),
    };
    KindRules { fields, one_of }
}

/// Field checks for one kind. With `tolerate_templates`, values that are a single `{{...}}`
/// placeholder pass the type check since their type is only known at run time.
pub fn check_step_fields(
    kind: StepKind,
    fields: &Map<String, Value>,
    label: &str,
    tolerate_templates: bool,
) -> Vec<LintIssue> {
    let rules = kind_rules(kind);
    let mut issues = Vec::new();
    let deferred = |v: &Value| tolerate_templates && v.as_str().is_some_and(is_exact_template);

    for rule in rules.fields {
        match fields.get(rule.name) {
            None | Some(Value::Null) if rule.required => issues.push(LintIssue::error(
                format!("{label}.{}", rule.name),
                format!("'{}' requires {}", kind.as_str(), rule.name),
            )),
            None | Some(Value::Null) => {}
            Some(v) if deferred(v) => {}
            Some(v) if !rule.ty.accepts(v) => issues.push(LintIssue::error(
                format!("{label}.{}", rule.name),
                format!("{} must be {}", rule.name, rule.ty.describe()),
            )),
            Some(_) => {}
        }
    }

    if !rules.one_of.is_empty()
        && !rules
            .one_of
            .iter()
            .any(|k| fields.get(*k).is_some_and(|v| !v.is_null()))
    {
        issues.push(LintIssue::error(
            label,
            format!("'{}' requires one of {}", kind.as_str(), rules.one_of.join(", ")),
        ));
    }

    for (key, v) in fields {
        if COMMON_STEP_FIELDS.contains(&key.as_str()) {
            if key == "timeoutMs" && !deferred(v) && !FieldType::PositiveInt.accepts(v) {
                issues.push(LintIssue::error(
                    format!("{label}.timeoutMs"),
                    "timeoutMs must be a positive integer",
                ));
            }
            if (key == "targetId" || key == "frameScope") && !deferred(v) && !FieldType::NonEmptyStr.accepts(v) {
                issues.push(LintIssue::error(
                    format!("{label}.{key}"),
                    format!("{key} must be a non-empty string"),
                ));
            }
            continue;
        }
        if !rules.fields.iter().any(|r| r.name == key) {
            issues.push(LintIssue::warning(
                format!("{label}.{key}"),
                format!("unknown field for '{}' step", kind.as_str()),
            ));
        }
    }

    issues
}

pub fn lint_plan(value: &Value) -> Vec<LintIssue> {
    let mut issues = Vec::new();
    let Some(root) = value.as_object() else {
        issues.push(LintIssue::error("$", "plan must be a JSON object"));
        return issues;
    };

    for key in root.keys() {
        if !PLAN_FIELDS.contains(&key.as_str()) {
            issues.push(LintIssue::warning(key.clone(), "unknown top-level plan field"));
        }
    }

    match root.get("steps") {
        Some(Value::Array(steps)) if !steps.is_empty() => {
            let mut aliases = BTreeSet::new();
            for (i, step) in steps.iter().enumerate() {
                lint_step(step, &format!("steps[{i}]"), false, &mut aliases, &mut issues);
            }
        }
        Some(Value::Array(_)) => issues.push(LintIssue::error("steps", "steps must not be empty")),
        Some(_) => issues.push(LintIssue::error("steps", "steps must be an array")),
        None => issues.push(LintIssue::error("steps", "plan requires a steps array")),
    }

    if let Some(result) = root.get("result") {
        lint_result(result, &mut issues);
    }
    if let Some(require) = root.get("require") {
        lint_assertion(require, "require", true, &mut issues);
    }

    issues
}

fn lint_step(
    step: &Value,
    label: &str,
    nested: bool,
    aliases: &mut BTreeSet<String>,
    issues: &mut Vec<LintIssue>,
) {
    let Some(fields) = step.as_object() else {
        issues.push(LintIssue::error(label, "step must be an object"));
        return;
    };

    let kind = match fields.get("id") {
        Some(Value::String(id)) => match StepKind::parse(id) {
            Some(kind) => kind,
            None => {
                issues.push(LintIssue::error(
                    format!("{label}.id"),
                    format!(
                        "unsupported step id '{id}' (expected one of {})",
                        StepKind::supported_ids().join(", ")
                    ),
                ));
                return;
            }
        },
        Some(_) => {
            issues.push(LintIssue::error(format!("{label}.id"), "step id must be a string"));
            return;
        }
        None => {
            issues.push(LintIssue::error(format!("{label}.id"), "step id is required"));
            return;
        }
    };

    if let Some(alias) = fields.get("as") {
        let path = format!("{label}.as");
        match alias.as_str() {
            _ if nested => issues.push(LintIssue::error(
                path,
                "a repeat-until nested step must not declare an alias",
            )),
            Some(a) if !ALIAS_PATTERN.is_match(a) => issues.push(LintIssue::error(
                path,
                format!("invalid alias '{a}': use up to 64 letters, digits, '_' or '-', starting with a letter or '_'"),
            )),
            Some(a) if !aliases.insert(a.to_string()) => {
                issues.push(LintIssue::error(path, format!("duplicate alias: {a}")))
            }
            Some(_) => {}
            None => issues.push(LintIssue::error(path, "alias must be a string")),
        }
    }

    if let Some(assert) = fields.get("assert") {
        lint_assertion(assert, &format!("{label}.assert"), false, issues);
    }

    issues.extend(check_step_fields(kind, fields, label, true));

    if kind == StepKind::RepeatUntil {
        lint_repeat_until(fields, label, nested, aliases, issues);
    }
}

fn lint_repeat_until(
    fields: &Map<String, Value>,
    label: &str,
    nested: bool,
    aliases: &mut BTreeSet<String>,
    issues: &mut Vec<LintIssue>,
) {
    if nested {
        issues.push(LintIssue::error(
            format!("{label}.id"),
            "repeat-until cannot be nested inside repeat-until",
        ));
        return;
    }

    if let Some(inner) = fields.get("step").filter(|v| v.is_object()) {
        let inner_label = format!("{label}.step");
        if inner.get("id").and_then(Value::as_str) == Some(StepKind::RepeatUntil.as_str()) {
            issues.push(LintIssue::error(
                format!("{inner_label}.id"),
                "repeat-until cannot be nested inside repeat-until",
            ));
        } else {
            lint_step(inner, &inner_label, true, aliases, issues);
        }
    }

    let predicates = [
        fields.contains_key("untilEquals"),
        fields.contains_key("untilGte"),
        fields.get("untilChanged").is_some_and(|v| v.as_bool() == Some(true)),
    ]
    .into_iter()
    .filter(|p| *p)
    .count();
    if predicates != 1 {
        issues.push(LintIssue::error(
            label,
            "repeat-until requires exactly one of untilEquals, untilGte, untilChanged=true",
        ));
    }
    if fields.get("untilChanged").is_some_and(|v| v.as_bool() == Some(false)) {
        issues.push(LintIssue::error(
            format!("{label}.untilChanged"),
            "untilChanged must be true when present",
        ));
    }

    if let Some(max) = fields.get("maxAttempts")
        && !max.as_str().is_some_and(is_exact_template)
        && max.as_u64().is_some_and(|n| n > MAX_REPEAT_ATTEMPTS)
    {
        issues.push(LintIssue::error(
            format!("{label}.maxAttempts"),
            format!("maxAttempts must be between 1 and {MAX_REPEAT_ATTEMPTS}"),
        ));
    }
}

fn lint_result(result: &Value, issues: &mut Vec<LintIssue>) {
    let Some(map) = result.as_object() else {
        issues.push(LintIssue::error("result", "result must be an object of field -> path"));
        return;
    };
    if map.is_empty() {
        issues.push(LintIssue::error("result", "result projection is empty"));
    }
    for (field, path) in map {
        if !path.as_str().is_some_and(|p| !p.trim().is_empty()) {
            issues.push(LintIssue::error(
                format!("result.{field}"),
                "result entries must be non-empty path strings",
            ));
        }
    }
}

fn lint_assertion(value: &Value, label: &str, required_nonempty: bool, issues: &mut Vec<LintIssue>) {
    if !value.is_object() {
        issues.push(LintIssue::error(label, "assertion block must be an object"));
        return;
    }
    match AssertionSpec::from_value(value, label) {
        Ok(spec) if spec.is_empty() && required_nonempty => {
            issues.push(LintIssue::error(label, "require must declare at least one check"))
        }
        Ok(spec) if spec.is_empty() => {
            issues.push(LintIssue::warning(label, "assertion block declares no checks"))
        }
        Ok(_) => {}
        Err(err) => issues.push(LintIssue::error(label, err.to_string())),
    }
}
