//! The seam between the engine and whatever drives the browser.

use serde::Serialize;
use serde_json::Value;

use crate::{
    CallContext, ClickParams, ClickReadParams, CountParams, EvalParams, ExtractParams, FillParams,
    FindParams, OpenParams, ReadParams, ScrollPlanParams, SnapshotParams, StepRequest, SurfResult,
    UploadParams, WaitParams,
};

/// One method per browser-facing step kind. Each returns the step report as JSON.
///
/// Errors are propagated unchanged to the caller of the run.
pub trait BrowserOps {
    fn open(&mut self, call: &CallContext, params: &OpenParams) -> SurfResult<Value>;
    fn list(&mut self, call: &CallContext) -> SurfResult<Value>;
    fn snapshot(&mut self, call: &CallContext, params: &SnapshotParams) -> SurfResult<Value>;
    fn find(&mut self, call: &CallContext, params: &FindParams) -> SurfResult<Value>;
    fn count(&mut self, call: &CallContext, params: &CountParams) -> SurfResult<Value>;
    fn scroll_plan(&mut self, call: &CallContext, params: &ScrollPlanParams) -> SurfResult<Value>;
    fn click(&mut self, call: &CallContext, params: &ClickParams) -> SurfResult<Value>;
    fn click_read(&mut self, call: &CallContext, params: &ClickReadParams) -> SurfResult<Value>;
    fn fill(&mut self, call: &CallContext, params: &FillParams) -> SurfResult<Value>;
    fn upload(&mut self, call: &CallContext, params: &UploadParams) -> SurfResult<Value>;
    fn read(&mut self, call: &CallContext, params: &ReadParams) -> SurfResult<Value>;
    fn eval(&mut self, call: &CallContext, params: &EvalParams) -> SurfResult<Value>;
    fn wait(&mut self, call: &CallContext, params: &WaitParams) -> SurfResult<Value>;
    fn extract(&mut self, call: &CallContext, params: &ExtractParams) -> SurfResult<Value>;
}

pub fn dispatch(ops: &mut dyn BrowserOps, call: &CallContext, request: &StepRequest) -> SurfResult<Value> {
    match request {
        StepRequest::Open(p) => ops.open(call, p),
        StepRequest::List => ops.list(call),
        StepRequest::Snapshot(p) => ops.snapshot(call, p),
        StepRequest::Find(p) => ops.find(call, p),
        StepRequest::Count(p) => ops.count(call, p),
        StepRequest::ScrollPlan(p) => ops.scroll_plan(call, p),
        StepRequest::Click(p) => ops.click(call, p),
        StepRequest::ClickRead(p) => ops.click_read(call, p),
        StepRequest::Fill(p) => ops.fill(call, p),
        StepRequest::Upload(p) => ops.upload(call, p),
        StepRequest::Read(p) => ops.read(call, p),
        StepRequest::Eval(p) => ops.eval(call, p),
        StepRequest::Wait(p) => ops.wait(call, p),
        StepRequest::Extract(p) => ops.extract(call, p),
    }
}

/// The parts of a step report the engine reads; everything else stays opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub session_id: Option<String>,
    pub target_id: Option<String>,
    pub payload: Value,
}

impl StepReport {
    pub fn from_payload(payload: Value) -> Self {
        let text = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            session_id: text("sessionId"),
            target_id: text("targetId"),
            payload,
        }
    }

    pub fn text_field(&self, key: &str) -> Option<String> {
        self.payload.get(key).and_then(Value::as_str).map(str::to_string)
    }
}

/// A target observed during a run, persisted afterwards as target activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetTouch {
    pub target_id: String,
    pub session_id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub status: Option<String>,
    pub action_kind: String,
    pub at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn report_envelope_ignores_non_string_ids() {
        let r = StepReport::from_payload(json!({"sessionId": "s-1", "targetId": 7, "url": "u"}));
        assert_eq!(r.session_id.as_deref(), Some("s-1"));
        assert_eq!(r.target_id, None);
        assert_eq!(r.text_field("url").as_deref(), Some("u"));
    }
}
