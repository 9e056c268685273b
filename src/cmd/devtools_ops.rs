//! `BrowserOps` over the DevTools HTTP endpoints. Serves `open` and `list`; the DOM-level
//! kinds need a protocol driver and report `E_OPS_UNAVAILABLE`.

use serde::Deserialize;
use serde_json::{Value, json};

use std::io::Read as _;
use std::time::Duration;

use crate::{
    BrowserOps, CallContext, ClickParams, ClickReadParams, CountParams, EvalParams, ExtractParams,
    FillParams, FindParams, OpenParams, ReadParams, ScrollPlanParams, SnapshotParams, SurfError,
    SurfResult, UploadParams, WaitParams,
};

#[derive(Debug, Clone, Deserialize)]
struct DevtoolsTarget {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
}

impl DevtoolsTarget {
    fn to_json(&self) -> Value {
        json!({"targetId": self.id, "url": self.url, "title": self.title, "type": self.kind})
    }
}

#[derive(Debug, Clone)]
pub struct DevtoolsHttpOps {
    session_id: String,
    cdp_origin: String,
}

impl DevtoolsHttpOps {
    pub fn new(session_id: impl Into<String>, cdp_origin: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cdp_origin: cdp_origin.into().trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: &str, path: &str, timeout_ms: u64) -> SurfResult<String> {
        let url = format!("{}{path}", self.cdp_origin);
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build();
        let resp = match agent.request(method, &url).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                return Err(SurfError::Internal(format!(
                    "devtools {method} {path} returned {code}: {}",
                    body.trim()
                )));
            }
            Err(err) => {
                tracing::debug!(%url, "devtools request failed: {err}");
                return Err(SurfError::SessionUnreachable {
                    session_id: self.session_id.clone(),
                    cdp_origin: self.cdp_origin.clone(),
                });
            }
        };
        let mut body = String::new();
        resp.into_reader()
            .read_to_string(&mut body)
            .map_err(|e| SurfError::Internal(format!("failed to read devtools response for {path}: {e}")))?;
        Ok(body)
    }

    fn pages(&self, timeout_ms: u64) -> SurfResult<Vec<DevtoolsTarget>> {
        let body = self.request("GET", "/json/list", timeout_ms)?;
        let targets: Vec<DevtoolsTarget> = serde_json::from_str(&body)?;
        Ok(targets.into_iter().filter(|t| t.kind == "page").collect())
    }

    fn unavailable(kind: &str) -> SurfResult<Value> {
        Err(SurfError::OpsUnavailable {
            kind: kind.to_string(),
        })
    }
}

impl BrowserOps for DevtoolsHttpOps {
    fn open(&mut self, call: &CallContext, params: &OpenParams) -> SurfResult<Value> {
        if params.reuse.unwrap_or(false)
            && let Some(existing) = self
                .pages(call.timeout_ms)?
                .into_iter()
                .find(|t| t.url == params.url)
        {
            let mut report = existing.to_json();
            report["sessionId"] = json!(self.session_id);
            report["reused"] = json!(true);
            return Ok(report);
        }
        let body = self.request("PUT", &format!("/json/new?{}", params.url), call.timeout_ms)?;
        let created: DevtoolsTarget = serde_json::from_str(&body)?;
        let mut report = created.to_json();
        report["sessionId"] = json!(self.session_id);
        report["reused"] = json!(false);
        if report["url"].as_str().is_none_or(str::is_empty) {
            report["url"] = json!(params.url);
        }
        Ok(report)
    }

    fn list(&mut self, call: &CallContext) -> SurfResult<Value> {
        let pages = self.pages(call.timeout_ms)?;
        let targets: Vec<Value> = pages.iter().map(DevtoolsTarget::to_json).collect();
        Ok(json!({
            "sessionId": self.session_id,
            "count": targets.len(),
            "targets": targets,
        }))
    }

    fn snapshot(&mut self, _call: &CallContext, _params: &SnapshotParams) -> SurfResult<Value> {
        Self::unavailable("snapshot")
    }

    fn find(&mut self, _call: &CallContext, _params: &FindParams) -> SurfResult<Value> {
        Self::unavailable("find")
    }

    fn count(&mut self, _call: &CallContext, _params: &CountParams) -> SurfResult<Value> {
        Self::unavailable("count")
    }

    fn scroll_plan(&mut self, _call: &CallContext, _params: &ScrollPlanParams) -> SurfResult<Value> {
        Self::unavailable("scroll-plan")
    }

    fn click(&mut self, _call: &CallContext, _params: &ClickParams) -> SurfResult<Value> {
        Self::unavailable("click")
    }

    fn click_read(&mut self, _call: &CallContext, _params: &ClickReadParams) -> SurfResult<Value> {
        Self::unavailable("click-read")
    }

    fn fill(&mut self, _call: &CallContext, _params: &FillParams) -> SurfResult<Value> {
        Self::unavailable("fill")
    }

    fn upload(&mut self, _call: &CallContext, _params: &UploadParams) -> SurfResult<Value> {
        Self::unavailable("upload")
    }

    fn read(&mut self, _call: &CallContext, _params: &ReadParams) -> SurfResult<Value> {
        Self::unavailable("read")
    }

    fn eval(&mut self, _call: &CallContext, _params: &EvalParams) -> SurfResult<Value> {
        Self::unavailable("eval")
    }

    fn wait(&mut self, _call: &CallContext, _params: &WaitParams) -> SurfResult<Value> {
        Self::unavailable("wait")
    }

    fn extract(&mut self, _call: &CallContext, _params: &ExtractParams) -> SurfResult<Value> {
        Self::unavailable("extract")
    }
}
