//! Plan sources, step kinds, and the validated plan model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use std::io::Read as _;
use std::path::{Path, PathBuf};

use crate::{IssueLevel, LintIssue, RunArtifact, SurfError, SurfResult, lint_plan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepKind {
    Open,
    List,
    Snapshot,
    Find,
    Count,
    ScrollPlan,
    Click,
    ClickRead,
    Fill,
    Upload,
    Read,
    Eval,
    Wait,
    Extract,
    RepeatUntil,
}

impl StepKind {
    pub const ALL: [StepKind; 15] = [
        StepKind::Open,
        StepKind::List,
        StepKind::Snapshot,
        StepKind::Find,
        StepKind::Count,
        StepKind::ScrollPlan,
        StepKind::Click,
        StepKind::ClickRead,
        StepKind::Fill,
        StepKind::Upload,
        StepKind::Read,
        StepKind::Eval,
        StepKind::Wait,
        StepKind::Extract,
        StepKind::RepeatUntil,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Open => "open",
            StepKind::List => "list",
            StepKind::Snapshot => "snapshot",
            StepKind::Find => "find",
            StepKind::Count => "count",
            StepKind::ScrollPlan => "scroll-plan",
            StepKind::Click => "click",
            StepKind::ClickRead => "click-read",
            StepKind::Fill => "fill",
            StepKind::Upload => "upload",
            StepKind::Read => "read",
            StepKind::Eval => "eval",
            StepKind::Wait => "wait",
            StepKind::Extract => "extract",
            StepKind::RepeatUntil => "repeat-until",
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == id)
    }

    pub fn supported_ids() -> Vec<&'static str> {
        Self::ALL.iter().map(|k| k.as_str()).collect()
    }
}

/// One step as written in the plan. Fields stay as raw JSON until templates are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub index: usize,
    pub kind: StepKind,
    pub alias: Option<String>,
    pub fields: Map<String, Value>,
}

impl PlanStep {
    pub fn label(&self) -> String {
        format!("steps[{}]", self.index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    pub result: Option<Map<String, Value>>,
    pub require: Option<Value>,
    raw: Value,
}

impl Plan {
    /// Lints first; any error-level issue rejects the plan.
    pub fn from_value(value: &Value) -> SurfResult<Self> {
        let issues = lint_plan(value);
        Self::from_linted(value, &issues)
    }

    pub fn from_linted(value: &Value, issues: &[LintIssue]) -> SurfResult<Self> {
        if let Some(first) = issues.iter().find(|i| i.level == IssueLevel::Error) {
            let errors = issues.iter().filter(|i| i.level == IssueLevel::Error).count();
            let more = if errors > 1 {
                format!(" (+{} more issue(s))", errors - 1)
            } else {
                String::new()
            };
            return Err(SurfError::query(format!(
                "plan is invalid: {}: {}{more}",
                first.path, first.message
            )));
        }

        let root = value
            .as_object()
            .ok_or_else(|| SurfError::query("plan must be a JSON object"))?;
        let raw_steps = root
            .get("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| SurfError::query("plan.steps must be an array"))?;

        let mut steps = Vec::with_capacity(raw_steps.len());
        for (index, raw) in raw_steps.iter().enumerate() {
            let fields = raw
                .as_object()
                .cloned()
                .ok_or_else(|| SurfError::query(format!("steps[{index}] must be an object")))?;
            let kind = fields
                .get("id")
                .and_then(Value::as_str)
                .and_then(StepKind::parse)
                .ok_or_else(|| SurfError::query(format!("steps[{index}].id is not a supported step id")))?;
            let alias = fields.get("as").and_then(Value::as_str).map(str::to_string);
            steps.push(PlanStep {
                index,
                kind,
                alias,
                fields,
            });
        }

        Ok(Self {
            steps,
            result: root.get("result").and_then(Value::as_object).cloned(),
            require: root.get("require").cloned(),
            raw: value.clone(),
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanSource {
    /// `-` reads from stdin.
    File(PathBuf),
    Inline(String),
    Replay(PathBuf),
}

impl PlanSource {
    pub fn from_flags(
        plan: Option<&Path>,
        plan_json: Option<&str>,
        replay: Option<&Path>,
    ) -> SurfResult<Self> {
        match (plan, plan_json, replay) {
            (Some(path), None, None) => Ok(Self::File(path.to_path_buf())),
            (None, Some(json), None) => Ok(Self::Inline(json.to_string())),
            (None, None, Some(path)) => Ok(Self::Replay(path.to_path_buf())),
            _ => Err(SurfError::query(
                "provide exactly one plan source: --plan <path|->, --plan-json <json>, or --replay <path>",
            )),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::File(p) if p.as_os_str() == "-" => "stdin",
            Self::File(_) => "plan-file",
            Self::Inline(_) => "plan-json",
            Self::Replay(_) => "replay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOrigin {
    pub path: String,
    pub created_at: String,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedPlan {
    pub source: String,
    pub value: Value,
    pub replay: Option<ReplayOrigin>,
}

pub fn load_plan(source: &PlanSource) -> SurfResult<LoadedPlan> {
    match source {
        PlanSource::File(path) => {
            let text = if path.as_os_str() == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(path).map_err(|e| {
                    SurfError::query(format!("failed to read plan {}: {e}", path.display()))
                })?
            };
            Ok(LoadedPlan {
                source: source.kind_name().to_string(),
                value: parse_plan_text(&text, &path.display().to_string())?,
                replay: None,
            })
        }
        PlanSource::Inline(json) => Ok(LoadedPlan {
            source: source.kind_name().to_string(),
            value: parse_plan_text(json, "--plan-json")?,
            replay: None,
        }),
        PlanSource::Replay(path) => {
            let artifact = RunArtifact::read_json(path)?;
            Ok(LoadedPlan {
                source: source.kind_name().to_string(),
                value: artifact.plan.clone(),
                replay: Some(ReplayOrigin {
                    path: path.display().to_string(),
                    created_at: artifact.created_at,
                    label: artifact.label,
                }),
            })
        }
    }
}

fn parse_plan_text(text: &str, origin: &str) -> SurfResult<Value> {
    serde_json::from_str(text)
        .map_err(|e| SurfError::query(format!("failed to parse plan JSON from {origin}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_ids_round_trip() {
        for kind in StepKind::ALL {
            assert_eq!(StepKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(StepKind::parse("bogus"), None);
    }

    #[test]
    fn source_requires_exactly_one_flag() {
        let none = PlanSource::from_flags(None, None, None).unwrap_err();
        assert_eq!(none.code(), "E_QUERY_INVALID");
        let two = PlanSource::from_flags(Some(Path::new("p.json")), Some("{}"), None).unwrap_err();
        assert_eq!(two.code(), "E_QUERY_INVALID");
        let one = PlanSource::from_flags(None, Some("{}"), None).expect("one source");
        assert_eq!(one.kind_name(), "plan-json");
    }

    #[test]
    fn inline_plan_builds_typed_steps() {
        let loaded = load_plan(&PlanSource::Inline(
            r#"{"steps":[{"id":"open","url":"https://example.com","as":"home"},{"id":"snapshot"}]}"#
                .to_string(),
        ))
        .expect("load");
        let plan = Plan::from_value(&loaded.value).expect("valid plan");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].kind, StepKind::Open);
        assert_eq!(plan.steps[0].alias.as_deref(), Some("home"));
        assert_eq!(plan.steps[1].label(), "steps[1]");
    }

    #[test]
    fn invalid_plan_is_rejected_before_execution() {
        let err = Plan::from_value(&json!({"steps": [{"id": "bogus"}]})).unwrap_err();
        assert_eq!(err.code(), "E_QUERY_INVALID");
        assert!(err.to_string().contains("steps[0].id"));
    }

    #[test]
    fn malformed_json_is_query_invalid() {
        let err = load_plan(&PlanSource::Inline("{steps:".to_string())).unwrap_err();
        assert_eq!(err.code(), "E_QUERY_INVALID");
    }
}
