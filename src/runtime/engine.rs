//! Run orchestration: sequential step execution, repeat-until loops, result projection,
//! top-level `require`, timeline/NDJSON events and run recording.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use std::path::PathBuf;
use std::time::Instant;

use crate::{
    AssertionOutcome, AssertionSpec, BrowserOps, CallContext, LintIssue, LoadedPlan, LogMode, Plan,
    PlanStep, RepeatUntilParams, ReplayDescriptor, ReplayOrigin, RunArtifact, StepKind, StepReport,
    StepRequest, SurfError, SurfResult, TargetTouch, Timeline, TimelineEntry, UntilPredicate,
    dispatch, evaluate_assertions, fields, has_errors, lint_plan, lookup_path, now_unix_ms,
    resolve_record_path, resolve_template_in_value, same_value, wall_time_iso_utc,
};

/// Scope keys owned by the run context; aliases never shadow them.
const RESERVED_SCOPE_KEYS: [&str; 5] = ["sessionId", "targetId", "last", "steps", "result"];

#[derive(Debug, Clone)]
pub struct RecordOptions {
    /// Exact file, or a directory to place a generated file name in.
    pub path: Option<PathBuf>,
    pub runs_dir: PathBuf,
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout_ms: u64,
    pub session_id: Option<String>,
    pub target_id: Option<String>,
    pub log_ndjson: Option<PathBuf>,
    pub log_mode: LogMode,
    pub record: Option<RecordOptions>,
    pub source: String,
    pub replay_of: Option<ReplayOrigin>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 20_000,
            session_id: None,
            target_id: None,
            log_ndjson: None,
            log_mode: LogMode::Minimal,
            record: None,
            source: "plan-json".to_string(),
            replay_of: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub index: usize,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub duration_ms: u64,
    pub report: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assert: Option<AssertionOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunErrorInfo {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub ok: bool,
    pub mode: String,
    pub source: String,
    pub session_id: Option<String>,
    pub target_id: Option<String>,
    pub step_count: usize,
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require: Option<AssertionOutcome>,
    pub timeline: Vec<TimelineEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<ReplayOrigin>,
}

/// A finished run, successful or not. Targets touched before a failure are still listed.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub touched: Vec<TargetTouch>,
    pub error: Option<SurfError>,
}

impl RunOutcome {
    pub fn into_result(self) -> SurfResult<RunReport> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.report),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorReport {
    pub ok: bool,
    pub mode: String,
    pub source: String,
    pub step_count: usize,
    pub valid: bool,
    pub issues: Vec<LintIssue>,
}

pub fn doctor_plan(loaded: &LoadedPlan) -> DoctorReport {
    let issues = lint_plan(&loaded.value);
    let valid = !has_errors(&issues);
    DoctorReport {
        ok: valid,
        mode: "doctor".to_string(),
        source: loaded.source.clone(),
        step_count: loaded
            .value
            .get("steps")
            .and_then(Value::as_array)
            .map_or(0, Vec::len),
        valid,
        issues,
    }
}

pub fn run_plan(plan: &Plan, ops: &mut dyn BrowserOps, opts: &RunOptions) -> SurfResult<RunReport> {
    execute_plan(plan, ops, opts)?.into_result()
}

/// `Err` only for failures outside the run itself (log or artifact I/O); step and
/// assertion failures land in `RunOutcome::error`.
pub fn execute_plan(plan: &Plan, ops: &mut dyn BrowserOps, opts: &RunOptions) -> SurfResult<RunOutcome> {
    let timeline = Timeline::new(opts.log_ndjson.as_deref(), opts.log_mode)?;
    let mut exec = Execution::new(opts, timeline);
    let error = exec.run(plan, ops).err();

    let ended = exec.timeline.emit(
        "run.end",
        fields(json!({
            "ok": error.is_none(),
            "completedSteps": exec.steps.len(),
            "code": error.as_ref().map(SurfError::code),
        })),
    );
    if let Err(err) = ended {
        if error.is_none() {
            return Err(err);
        }
        tracing::warn!("failed to log run.end: {err}");
    }

    let touched = std::mem::take(&mut exec.touched);
    let mut report = exec.into_report(plan, error.as_ref());

    if let Some(record) = &opts.record {
        let now = now_unix_ms();
        let path = resolve_record_path(record.path.as_deref(), &record.runs_dir, record.label.as_deref(), now);
        report.record_path = Some(path.display().to_string());
        let artifact = RunArtifact::new(
            now,
            record.label.clone(),
            opts.source.clone(),
            Some(ReplayDescriptor {
                timeout_ms: opts.timeout_ms,
                log_mode: opts.log_mode,
                replayed_from: opts.replay_of.clone(),
            }),
            plan.raw().clone(),
            serde_json::to_value(&report)?,
        );
        artifact.write_json(&path)?;
        tracing::info!(path = %path.display(), "recorded run artifact");
    }

    Ok(RunOutcome {
        report,
        touched,
        error,
    })
}

struct Execution<'o> {
    opts: &'o RunOptions,
    session_id: Option<String>,
    target_id: Option<String>,
    aliases: Map<String, Value>,
    last: Option<Value>,
    steps: Vec<StepRecord>,
    touched: Vec<TargetTouch>,
    result: Option<Map<String, Value>>,
    require: Option<AssertionOutcome>,
    timeline: Timeline,
}

impl<'o> Execution<'o> {
    fn new(opts: &'o RunOptions, timeline: Timeline) -> Self {
        Self {
            opts,
            session_id: opts.session_id.clone(),
            target_id: opts.target_id.clone(),
            aliases: Map::new(),
            last: None,
            steps: Vec::new(),
            touched: Vec::new(),
            result: None,
            require: None,
            timeline,
        }
    }

    fn run(&mut self, plan: &Plan, ops: &mut dyn BrowserOps) -> SurfResult<()> {
        self.timeline.emit(
            "run.start",
            fields(json!({
                "stepCount": plan.steps.len(),
                "source": self.opts.source,
                "sessionId": self.session_id,
            })),
        )?;
        for step in &plan.steps {
            self.run_step(step, ops)?;
        }
        self.project_result(plan);
        self.check_require(plan)
    }

    /// `{sessionId?, targetId?, last?, steps: {alias: report}}`, with aliases also at top level.
    fn scope(&self) -> Value {
        let mut scope = Map::new();
        for (alias, report) in &self.aliases {
            if !RESERVED_SCOPE_KEYS.contains(&alias.as_str()) {
                scope.insert(alias.clone(), report.clone());
            }
        }
        if let Some(id) = &self.session_id {
            scope.insert("sessionId".to_string(), json!(id));
        }
        if let Some(id) = &self.target_id {
            scope.insert("targetId".to_string(), json!(id));
        }
        if let Some(last) = &self.last {
            scope.insert("last".to_string(), last.clone());
        }
        scope.insert("steps".to_string(), Value::Object(self.aliases.clone()));
        Value::Object(scope)
    }

    fn call_context(&self, fields: &Map<String, Value>, fallback_timeout_ms: u64) -> CallContext {
        let text = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);
        CallContext {
            timeout_ms: fields
                .get("timeoutMs")
                .and_then(Value::as_u64)
                .unwrap_or(fallback_timeout_ms),
            session_id: self.session_id.clone(),
            target_id: text("targetId").or_else(|| self.target_id.clone()),
            frame_scope: text("frameScope"),
        }
    }

    fn run_step(&mut self, step: &PlanStep, ops: &mut dyn BrowserOps) -> SurfResult<()> {
        let label = step.label();
        let id = step.kind.as_str();
        self.timeline.emit(
            "step.start",
            fields(json!({"index": step.index, "id": id, "as": step.alias})),
        )?;
        let started = Instant::now();

        let mut raw = step.fields.clone();
        let nested = if step.kind == StepKind::RepeatUntil {
            raw.remove("step")
        } else {
            None
        };
        let resolved = resolve_fields(&raw, &self.scope(), &label)?;

        let (payload, handoff) = if step.kind == StepKind::RepeatUntil {
            (self.run_repeat_until(step, &resolved, nested, ops)?, None)
        } else {
            let request = StepRequest::build(step.kind, &resolved, &label)?;
            let call = self.call_context(&resolved, self.opts.timeout_ms);
            let report = StepReport::from_payload(dispatch(ops, &call, &request)?);
            self.touch(step.kind, &report);
            let handoff = (report.session_id.clone(), report.target_id.clone());
            (report.payload, Some(handoff))
        };
        self.timeline.emit_report(step.index, id, &payload)?;

        let assert = match resolved.get("assert") {
            Some(spec) => {
                let outcome = evaluate_assertions(
                    &AssertionSpec::from_value(spec, &format!("{label}.assert"))?,
                    &payload,
                );
                if !outcome.passed() {
                    let message = assertion_message(&outcome);
                    self.timeline.emit(
                        "step.assert-failed",
                        fields(json!({
                            "index": step.index,
                            "id": id,
                            "failed": outcome.failed,
                            "total": outcome.total,
                            "message": message,
                        })),
                    )?;
                    let err = SurfError::AssertFailed(format!(
                        "{label} ({id}) assertion failed: {message} ({} of {} checks failed)",
                        outcome.failed, outcome.total
                    ));
                    self.steps.push(StepRecord {
                        index: step.index,
                        id: id.to_string(),
                        alias: step.alias.clone(),
                        duration_ms: elapsed_ms(started),
                        report: payload,
                        assert: Some(outcome),
                    });
                    return Err(err);
                }
                Some(outcome)
            }
            None => None,
        };

        if let Some((session_id, target_id)) = handoff {
            self.adopt(session_id, target_id);
        }
        if let Some(alias) = &step.alias {
            self.aliases.insert(alias.clone(), payload.clone());
        }
        self.last = Some(payload.clone());
        let duration_ms = elapsed_ms(started);
        self.timeline.emit(
            "step.end",
            fields(json!({
                "index": step.index,
                "id": id,
                "durationMs": duration_ms,
                "sessionId": self.session_id,
                "targetId": self.target_id,
            })),
        )?;
        self.steps.push(StepRecord {
            index: step.index,
            id: id.to_string(),
            alias: step.alias.clone(),
            duration_ms,
            report: payload,
            assert,
        });
        Ok(())
    }

    fn run_repeat_until(
        &mut self,
        step: &PlanStep,
        resolved: &Map<String, Value>,
        nested: Option<Value>,
        ops: &mut dyn BrowserOps,
    ) -> SurfResult<Value> {
        let label = step.label();
        let nested_label = format!("{label}.step");
        let mut outer = resolved.clone();
        if let Some(n) = &nested {
            outer.insert("step".to_string(), n.clone());
        }
        let params = RepeatUntilParams::build(&outer, &label)?;

        let nested = match nested {
            Some(Value::Object(map)) => map,
            _ => return Err(SurfError::query(format!("{nested_label}: nested step must be an object"))),
        };
        let kind = nested
            .get("id")
            .and_then(Value::as_str)
            .and_then(StepKind::parse)
            .filter(|k| *k != StepKind::RepeatUntil)
            .ok_or_else(|| {
                SurfError::query(format!("{nested_label}.id: nested step must be a non-repeat-until step"))
            })?;
        let fallback_timeout = resolved
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .unwrap_or(self.opts.timeout_ms);

        let mut history = Vec::new();
        let mut previous: Option<Value> = None;
        let mut satisfied = false;
        let mut last_report = Value::Null;

        for attempt in 1..=params.max_attempts {
            let fields_now = resolve_fields(&nested, &self.scope(), &nested_label)?;
            let request = StepRequest::build(kind, &fields_now, &nested_label)?;
            let call = self.call_context(&fields_now, fallback_timeout);
            let payload = dispatch(ops, &call, &request)?;
            self.timeline
                .emit_attempt_report(step.index, kind.as_str(), attempt, &payload)?;

            if let Some(spec) = fields_now.get("assert") {
                let outcome = evaluate_assertions(
                    &AssertionSpec::from_value(spec, &format!("{nested_label}.assert"))?,
                    &payload,
                );
                if !outcome.passed() {
                    let message = assertion_message(&outcome);
                    self.timeline.emit(
                        "step.assert-failed",
                        fields(json!({
                            "index": step.index,
                            "id": kind.as_str(),
                            "attempt": attempt,
                            "failed": outcome.failed,
                            "total": outcome.total,
                            "message": message,
                        })),
                    )?;
                    return Err(SurfError::AssertFailed(format!(
                        "{nested_label} ({}) assertion failed on attempt {attempt}: {message} ({} of {} checks failed)",
                        kind.as_str(),
                        outcome.failed,
                        outcome.total
                    )));
                }
            }

            let report = StepReport::from_payload(payload);
            self.adopt(report.session_id.clone(), report.target_id.clone());
            self.touch(kind, &report);

            let value = lookup_path(&report.payload, &params.until_path).cloned();
            let matched = match &params.predicate {
                UntilPredicate::Equals(expected) => value.as_ref().is_some_and(|v| same_value(v, expected)),
                UntilPredicate::Gte(threshold) => value
                    .as_ref()
                    .and_then(Value::as_f64)
                    .is_some_and(|v| v >= *threshold),
                UntilPredicate::Changed => {
                    attempt > 1 && observation_changed(previous.as_ref(), value.as_ref())
                }
            };
            history.push(json!({
                "attempt": attempt,
                "matched": matched,
                "value": value.clone().unwrap_or(Value::Null),
            }));
            self.timeline.emit(
                "step.attempt",
                fields(json!({"index": step.index, "attempt": attempt, "matched": matched})),
            )?;

            self.last = Some(report.payload.clone());
            previous = value;
            last_report = report.payload;
            if matched {
                satisfied = true;
                break;
            }
        }

        if !satisfied {
            tracing::debug!(step = %label, attempts = history.len(), "repeat-until exhausted its attempts");
        }
        Ok(json!({
            "satisfied": satisfied,
            "attempts": history.len(),
            "maxAttempts": params.max_attempts,
            "predicate": params.predicate.name(),
            "untilPath": params.until_path,
            "history": history,
            "last": last_report,
        }))
    }

    fn adopt(&mut self, session_id: Option<String>, target_id: Option<String>) {
        if session_id.is_some() {
            self.session_id = session_id;
        }
        if target_id.is_some() {
            self.target_id = target_id;
        }
    }

    fn touch(&mut self, kind: StepKind, report: &StepReport) {
        let Some(target_id) = report.target_id.clone() else {
            return;
        };
        let Some(session_id) = report.session_id.clone().or_else(|| self.session_id.clone()) else {
            return;
        };
        self.touched.push(TargetTouch {
            target_id,
            session_id,
            url: report.text_field("url"),
            title: report.text_field("title"),
            status: report.text_field("status"),
            action_kind: kind.as_str().to_string(),
            at: wall_time_iso_utc(),
        });
    }

    /// Unresolvable source paths project as `null`.
    fn project_result(&mut self, plan: &Plan) {
        let Some(spec) = &plan.result else {
            return;
        };
        let scope = self.scope();
        let projected = spec
            .iter()
            .map(|(field, path)| {
                let value = path
                    .as_str()
                    .and_then(|p| lookup_path(&scope, p))
                    .cloned()
                    .unwrap_or(Value::Null);
                (field.clone(), value)
            })
            .collect();
        self.result = Some(projected);
    }

    fn check_require(&mut self, plan: &Plan) -> SurfResult<()> {
        let Some(require) = &plan.require else {
            return Ok(());
        };
        let mut scope = self.scope();
        if let Value::Object(map) = &mut scope {
            map.insert(
                "result".to_string(),
                Value::Object(self.result.clone().unwrap_or_default()),
            );
        }
        let resolved = resolve_template_in_value(require, &scope, "require")?;
        let outcome = evaluate_assertions(&AssertionSpec::from_value(&resolved, "require")?, &scope);
        let passed = outcome.passed();
        let message = assertion_message(&outcome);
        let (failed, total) = (outcome.failed, outcome.total);
        self.require = Some(outcome);
        if passed {
            return Ok(());
        }
        self.timeline.emit(
            "run.require-failed",
            fields(json!({"failed": failed, "total": total, "message": message})),
        )?;
        Err(SurfError::AssertFailed(format!(
            "require failed: {message} ({failed} of {total} checks failed)"
        )))
    }

    fn into_report(self, plan: &Plan, error: Option<&SurfError>) -> RunReport {
        RunReport {
            ok: error.is_none(),
            mode: "run".to_string(),
            source: self.opts.source.clone(),
            session_id: self.session_id,
            target_id: self.target_id,
            step_count: plan.steps.len(),
            steps: self.steps,
            result: self.result,
            require: self.require,
            timeline: self.timeline.into_entries(),
            error: error.map(|e| RunErrorInfo {
                code: e.code().to_string(),
                message: e.to_string(),
            }),
            record_path: None,
            replay_of: self.opts.replay_of.clone(),
        }
    }
}

fn resolve_fields(fields: &Map<String, Value>, scope: &Value, label: &str) -> SurfResult<Map<String, Value>> {
    match resolve_template_in_value(&Value::Object(fields.clone()), scope, label)? {
        Value::Object(map) => Ok(map),
        other => Err(SurfError::Internal(format!(
            "{label}: template resolution produced {other} instead of an object"
        ))),
    }
}

/// Scalars compare by same-value, so `1` and `1.0` are one observation. Absent is its own value.
fn observation_changed(previous: Option<&Value>, current: Option<&Value>) -> bool {
    match (previous, current) {
        (None, None) => false,
        (Some(a @ (Value::Array(_) | Value::Object(_))), Some(b)) => a != b,
        (Some(a), Some(b)) => !same_value(a, b),
        _ => true,
    }
}

fn assertion_message(outcome: &AssertionOutcome) -> String {
    outcome
        .first_failure()
        .map(|c| c.message.clone())
        .unwrap_or_else(|| "assertion failed".to_string())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}
