//! Typed parameters for each step kind, built from template-resolved step fields.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    DEFAULT_REPEAT_ATTEMPTS, IssueLevel, MAX_REPEAT_ATTEMPTS, StepKind, SurfError, SurfResult,
    check_step_fields,
};

/// Per-call context handed to the browser binding alongside the typed parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    pub timeout_ms: u64,
    pub session_id: Option<String>,
    pub target_id: Option<String>,
    pub frame_scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenParams {
    pub url: String,
    #[serde(default)]
    pub reuse: Option<bool>,
    #[serde(default)]
    pub wait_until: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotParams {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub visible_only: Option<bool>,
    #[serde(default)]
    pub max_chars: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindParams {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub visible_only: Option<bool>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountParams {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub visible_only: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollPlanParams {
    #[serde(default)]
    pub steps: Option<Vec<u64>>,
    #[serde(default)]
    pub settle_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickParams {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub visible_only: Option<bool>,
    #[serde(default)]
    pub wait_for_text: Option<String>,
    #[serde(default)]
    pub wait_for_selector: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickReadParams {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub read_selector: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillParams {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
    pub selector: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadParams {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub chunk: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalParams {
    pub expression: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitParams {
    #[serde(default)]
    pub for_text: Option<String>,
    #[serde(default)]
    pub for_selector: Option<String>,
    #[serde(default)]
    pub network_idle: Option<bool>,
    #[serde(default)]
    pub ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractParams {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
}

/// A browser-facing step ready for dispatch. `repeat-until` is handled by the engine itself.
#[derive(Debug, Clone, PartialEq)]
pub enum StepRequest {
    Open(OpenParams),
    List,
    Snapshot(SnapshotParams),
    Find(FindParams),
    Count(CountParams),
    ScrollPlan(ScrollPlanParams),
    Click(ClickParams),
    ClickRead(ClickReadParams),
    Fill(FillParams),
    Upload(UploadParams),
    Read(ReadParams),
    Eval(EvalParams),
    Wait(WaitParams),
    Extract(ExtractParams),
}

impl StepRequest {
    /// Validates resolved fields with the same rules the linter uses, without template leniency.
    pub fn build(kind: StepKind, fields: &Map<String, Value>, label: &str) -> SurfResult<Self> {
        validate_resolved(kind, fields, label)?;
        Ok(match kind {
            StepKind::Open => Self::Open(parse(fields, label)?),
            StepKind::List => Self::List,
            StepKind::Snapshot => Self::Snapshot(parse(fields, label)?),
            StepKind::Find => Self::Find(parse(fields, label)?),
            StepKind::Count => Self::Count(parse(fields, label)?),
            StepKind::ScrollPlan => Self::ScrollPlan(parse(fields, label)?),
            StepKind::Click => Self::Click(parse(fields, label)?),
            StepKind::ClickRead => Self::ClickRead(parse(fields, label)?),
            StepKind::Fill => Self::Fill(parse(fields, label)?),
            StepKind::Upload => Self::Upload(parse(fields, label)?),
            StepKind::Read => Self::Read(parse(fields, label)?),
            StepKind::Eval => Self::Eval(parse(fields, label)?),
            StepKind::Wait => Self::Wait(parse(fields, label)?),
            StepKind::Extract => Self::Extract(parse(fields, label)?),
            StepKind::RepeatUntil => {
                return Err(SurfError::query(format!(
                    "{label}: repeat-until is not a browser operation"
                )));
            }
        })
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Self::Open(_) => StepKind::Open,
            Self::List => StepKind::List,
            Self::Snapshot(_) => StepKind::Snapshot,
            Self::Find(_) => StepKind::Find,
            Self::Count(_) => StepKind::Count,
            Self::ScrollPlan(_) => StepKind::ScrollPlan,
            Self::Click(_) => StepKind::Click,
            Self::ClickRead(_) => StepKind::ClickRead,
            Self::Fill(_) => StepKind::Fill,
            Self::Upload(_) => StepKind::Upload,
            Self::Read(_) => StepKind::Read,
            Self::Eval(_) => StepKind::Eval,
            Self::Wait(_) => StepKind::Wait,
            Self::Extract(_) => StepKind::Extract,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UntilPredicate {
    Equals(Value),
    Gte(f64),
    Changed,
}

impl UntilPredicate {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Equals(_) => "equals",
            Self::Gte(_) => "gte",
            Self::Changed => "changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepeatUntilParams {
    pub until_path: String,
    pub predicate: UntilPredicate,
    pub max_attempts: u64,
}

impl RepeatUntilParams {
    /// `fields` are the resolved outer fields; the nested `step` is resolved per attempt.
    pub fn build(fields: &Map<String, Value>, label: &str) -> SurfResult<Self> {
        validate_resolved(StepKind::RepeatUntil, fields, label)?;

        let until_path = fields
            .get("untilPath")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SurfError::query(format!("{label}.untilPath: required")))?;

        let mut predicates = Vec::new();
        if let Some(v) = fields.get("untilEquals") {
            predicates.push(UntilPredicate::Equals(v.clone()));
        }
        if let Some(v) = fields.get("untilGte") {
            let threshold = v.as_f64().ok_or_else(|| {
                SurfError::query(format!("{label}.untilGte: must be a number"))
            })?;
            predicates.push(UntilPredicate::Gte(threshold));
        }
        if fields.get("untilChanged").and_then(Value::as_bool) == Some(true) {
            predicates.push(UntilPredicate::Changed);
        }
        if predicates.len() != 1 {
            return Err(SurfError::query(format!(
                "{label}: repeat-until requires exactly one of untilEquals, untilGte, untilChanged=true"
            )));
        }

        let max_attempts = match fields.get("maxAttempts") {
            None | Some(Value::Null) => DEFAULT_REPEAT_ATTEMPTS,
            Some(v) => match v.as_u64() {
                Some(n) if (1..=MAX_REPEAT_ATTEMPTS).contains(&n) => n,
                _ => {
                    return Err(SurfError::query(format!(
                        "{label}.maxAttempts: must be between 1 and {MAX_REPEAT_ATTEMPTS}"
                    )));
                }
            },
        };

        Ok(Self {
            until_path,
            predicate: predicates.remove(0),
            max_attempts,
        })
    }
}

fn validate_resolved(kind: StepKind, fields: &Map<String, Value>, label: &str) -> SurfResult<()> {
    let issues = check_step_fields(kind, fields, label, false);
    match issues.into_iter().find(|i| i.level == IssueLevel::Error) {
        Some(issue) => Err(SurfError::query(format!("{}: {}", issue.path, issue.message))),
        None => Ok(()),
    }
}

fn parse<T: DeserializeOwned>(fields: &Map<String, Value>, label: &str) -> SurfResult<T> {
    serde_json::from_value(Value::Object(fields.clone()))
        .map_err(|e| SurfError::query(format!("{label}: {e}")))
}
