use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use surfwright::{
    AssertionSpec, AttachRequest, BrowserLauncher, BrowserOps, CallContext, CdpProbe, ClickParams,
    ClickReadParams, CountParams, EvalParams, ExtractParams, FillParams, FindParams,
    LaunchRequest, LaunchedBrowser, LoadedPlan, LockOptions, LogMode, OpenParams, Plan,
    PlanSource, ReadParams, RecordOptions, ResolverSettings, RunOptions, ScrollPlanParams,
    Session, SessionKind, SessionPruneOptions, SessionResolver, SnapshotParams, StateHandle,
    SurfResult, Target, TargetPruneOptions, UploadParams, WaitParams, doctor_plan,
    evaluate_assertions, execute_plan, iso_from_unix_ms, lint_plan, load_plan, now_unix_ms,
    run_plan, same_value, same_value_f64, session_prune, state_reconcile, target_prune,
    wall_time_iso_utc,
};

fn temp_workspace(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("surfwright-golden-{name}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp workspace");
    root
}

fn fixture(name: &str) -> String {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    std::fs::read_to_string(root.join("fixtures").join(name)).expect("read fixture")
}

/// In-memory browser: `open` hands out `t-N` targets, `count` grows by one per call
/// unless `count_script` supplies the values, `read` always returns the same text.
#[derive(Default)]
struct ScriptedOps {
    opened: u32,
    count: u64,
    count_script: Vec<Value>,
    calls: Vec<(String, CallContext)>,
}

impl ScriptedOps {
    fn note(&mut self, kind: &str, call: &CallContext) {
        self.calls.push((kind.to_string(), call.clone()));
    }

    fn calls_of(&self, kind: &str) -> Vec<&CallContext> {
        self.calls.iter().filter(|(k, _)| k == kind).map(|(_, c)| c).collect()
    }
}

impl BrowserOps for ScriptedOps {
    fn open(&mut self, call: &CallContext, params: &OpenParams) -> SurfResult<Value> {
        self.note("open", call);
        self.opened += 1;
        Ok(json!({
            "sessionId": call.session_id.clone().unwrap_or_else(|| "s-1".into()),
            "targetId": format!("t-{}", self.opened),
            "url": params.url,
            "title": "Example Domain",
        }))
    }

    fn list(&mut self, call: &CallContext) -> SurfResult<Value> {
        self.note("list", call);
        Ok(json!({"targets": [], "count": 0}))
    }

    fn snapshot(&mut self, call: &CallContext, _params: &SnapshotParams) -> SurfResult<Value> {
        self.note("snapshot", call);
        Ok(json!({"targetId": call.target_id, "text": "Example Domain", "headings": ["Example Domain"]}))
    }

    fn find(&mut self, call: &CallContext, _params: &FindParams) -> SurfResult<Value> {
        self.note("find", call);
        Ok(json!({"matches": 1}))
    }

    fn count(&mut self, call: &CallContext, _params: &CountParams) -> SurfResult<Value> {
        self.note("count", call);
        if !self.count_script.is_empty() {
            return Ok(json!({"count": self.count_script.remove(0)}));
        }
        self.count += 1;
        Ok(json!({"count": self.count}))
    }

    fn scroll_plan(&mut self, call: &CallContext, _params: &ScrollPlanParams) -> SurfResult<Value> {
        self.note("scroll-plan", call);
        Ok(json!({"scrolled": true}))
    }

    fn click(&mut self, call: &CallContext, params: &ClickParams) -> SurfResult<Value> {
        self.note("click", call);
        Ok(json!({"clicked": params.text, "targetId": call.target_id}))
    }

    fn click_read(&mut self, call: &CallContext, _params: &ClickReadParams) -> SurfResult<Value> {
        self.note("click-read", call);
        Ok(json!({"text": "details"}))
    }

    fn fill(&mut self, call: &CallContext, params: &FillParams) -> SurfResult<Value> {
        self.note("fill", call);
        Ok(json!({"value": params.value}))
    }

    fn upload(&mut self, call: &CallContext, params: &UploadParams) -> SurfResult<Value> {
        self.note("upload", call);
        Ok(json!({"files": params.files.len()}))
    }

    fn read(&mut self, call: &CallContext, _params: &ReadParams) -> SurfResult<Value> {
        self.note("read", call);
        Ok(json!({"text": "unchanging"}))
    }

    fn eval(&mut self, call: &CallContext, params: &EvalParams) -> SurfResult<Value> {
        self.note("eval", call);
        Ok(json!({"expression": params.expression, "value": 0}))
    }

    fn wait(&mut self, call: &CallContext, _params: &WaitParams) -> SurfResult<Value> {
        self.note("wait", call);
        Ok(json!({"waited": true}))
    }

    fn extract(&mut self, call: &CallContext, _params: &ExtractParams) -> SurfResult<Value> {
        self.note("extract", call);
        Ok(json!({"items": [{"title": "a"}, {"title": "b"}]}))
    }
}

fn plan(value: Value) -> Plan {
    Plan::from_value(&value).expect("valid plan")
}

fn opts() -> RunOptions {
    RunOptions {
        session_id: Some("s-1".into()),
        ..RunOptions::default()
    }
}

#[test]
fn duplicate_alias_is_reported_by_lint() {
    let issues = lint_plan(&json!({"steps": [
        {"id": "open", "url": "https://example.com", "as": "X"},
        {"id": "snapshot", "as": "X"}
    ]}));
    assert!(
        issues
            .iter()
            .any(|i| i.message.contains("duplicate alias: X")),
        "{issues:?}"
    );
    let err = Plan::from_value(&json!({"steps": [
        {"id": "list", "as": "X"}, {"id": "list", "as": "X"}
    ]}))
    .unwrap_err();
    assert_eq!(err.code(), "E_QUERY_INVALID");
}

#[test]
fn target_id_template_tracks_the_live_context() {
    let mut ops = ScriptedOps::default();
    let report = run_plan(
        &plan(json!({"steps": [
            {"id": "open", "url": "https://example.com", "as": "home"},
            {"id": "open", "url": "https://example.com/next"},
            {"id": "click", "text": "More", "targetId": "{{targetId}}"},
            {"id": "fill", "selector": "#q", "value": "{{home.title}} / {{steps.home.targetId}}"}
        ]})),
        &mut ops,
        &opts(),
    )
    .expect("run");

    assert_eq!(ops.calls_of("click")[0].target_id.as_deref(), Some("t-2"));
    assert_eq!(report.steps[3].report["value"], "Example Domain / t-1");
    assert_eq!(report.target_id.as_deref(), Some("t-2"));
    assert!(report.ok);
}

#[test]
fn missing_template_path_is_query_invalid_and_names_the_path() {
    let mut ops = ScriptedOps::default();
    let err = run_plan(
        &plan(json!({"steps": [
            {"id": "open", "url": "https://example.com", "as": "home"},
            {"id": "read", "selector": "{{home.nothing.here}}"}
        ]})),
        &mut ops,
        &opts(),
    )
    .unwrap_err();
    assert_eq!(err.code(), "E_QUERY_INVALID");
    let msg = err.to_string();
    assert!(msg.contains("home.nothing.here"), "{msg}");
    assert!(msg.contains("steps[1]"), "{msg}");
    assert!(ops.calls_of("read").is_empty());
}

#[test]
fn repeat_until_gte_is_satisfied_in_exactly_three_attempts() {
    let mut ops = ScriptedOps::default();
    let report = run_plan(
        &plan(json!({"steps": [
            {"id": "repeat-until", "as": "poll", "step": {"id": "count", "selector": ".item"},
             "untilPath": "count", "untilGte": 3, "maxAttempts": 10}
        ]})),
        &mut ops,
        &opts(),
    )
    .expect("run");

    let poll = &report.steps[0].report;
    assert_eq!(poll["satisfied"], true);
    assert_eq!(poll["attempts"], 3);
    assert_eq!(poll["history"].as_array().map(Vec::len), Some(3));
    assert_eq!(poll["history"][2], json!({"attempt": 3, "matched": true, "value": 3}));
    assert_eq!(ops.calls_of("count").len(), 3);
}

#[test]
fn repeat_until_exhaustion_records_every_attempt_without_failing() {
    let mut ops = ScriptedOps::default();
    let report = run_plan(
        &plan(json!({"steps": [
            {"id": "repeat-until", "step": {"id": "read"}, "untilPath": "text",
             "untilChanged": true, "maxAttempts": 2},
            {"id": "list"}
        ]})),
        &mut ops,
        &opts(),
    )
    .expect("non-satisfaction is not a failure");

    let poll = &report.steps[0].report;
    assert_eq!(poll["satisfied"], false);
    assert_eq!(poll["attempts"], 2);
    let history = poll["history"].as_array().expect("history");
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|h| h["matched"] == false));
    assert_eq!(report.steps.len(), 2);
}

#[test]
fn repeat_until_changed_treats_numerically_equal_values_as_unchanged() {
    let mut ops = ScriptedOps {
        count_script: vec![json!(1), json!(1.0), json!(1)],
        ..ScriptedOps::default()
    };
    let report = run_plan(
        &plan(json!({"steps": [
            {"id": "repeat-until", "step": {"id": "count", "selector": ".row"},
             "untilPath": "count", "untilChanged": true, "maxAttempts": 3}
        ]})),
        &mut ops,
        &opts(),
    )
    .expect("run");

    let poll = &report.steps[0].report;
    assert_eq!(poll["satisfied"], false);
    assert_eq!(poll["attempts"], 3);
    let history = poll["history"].as_array().expect("history");
    assert!(history.iter().all(|h| h["matched"] == false), "{history:?}");
}

#[test]
fn repeat_until_changed_fires_when_the_value_moves_off_null() {
    let mut ops = ScriptedOps {
        count_script: vec![json!(null), json!(null), json!(2)],
        ..ScriptedOps::default()
    };
    let report = run_plan(
        &plan(json!({"steps": [
            {"id": "repeat-until", "step": {"id": "count", "selector": ".row"},
             "untilPath": "count", "untilChanged": true, "maxAttempts": 5}
        ]})),
        &mut ops,
        &opts(),
    )
    .expect("run");

    let poll = &report.steps[0].report;
    assert_eq!(poll["satisfied"], true);
    assert_eq!(poll["attempts"], 3);
}

#[test]
fn repeat_until_reresolves_the_nested_step_each_attempt() {
    let mut ops = ScriptedOps::default();
    run_plan(
        &plan(json!({"steps": [
            {"id": "open", "url": "https://example.com"},
            {"id": "repeat-until", "timeoutMs": 1234,
             "step": {"id": "count", "selector": "{{last.count}}"},
             "untilPath": "count", "untilEquals": 2}
        ]})),
        &mut ops,
        &opts(),
    )
    .expect_err("open report has no count for the nested selector");

    let mut ops = ScriptedOps::default();
    let report = run_plan(
        &plan(json!({"steps": [
            {"id": "count"},
            {"id": "repeat-until", "timeoutMs": 1234,
             "step": {"id": "count", "selector": ".n{{last.count}}"},
             "untilPath": "count", "untilEquals": 3}
        ]})),
        &mut ops,
        &opts(),
    )
    .expect("run");
    assert_eq!(report.steps[1].report["attempts"], 2);
    let counts = ops.calls_of("count");
    assert_eq!(counts.len(), 3);
    assert!(counts[1..].iter().all(|c| c.timeout_ms == 1234));
}

#[test]
fn nested_assertion_failure_aborts_immediately() {
    let mut ops = ScriptedOps::default();
    let outcome = execute_plan(
        &plan(json!({"steps": [
            {"id": "repeat-until", "step": {"id": "count", "assert": {"equals": {"count": 99}}},
             "untilPath": "count", "untilGte": 5},
            {"id": "list"}
        ]})),
        &mut ops,
        &opts(),
    )
    .expect("outcome");
    let err = outcome.error.expect("assert failure");
    assert_eq!(err.code(), "E_ASSERT_FAILED");
    assert_eq!(ops.calls_of("count").len(), 1);
    assert!(ops.calls_of("list").is_empty());
}

#[test]
fn equals_uses_same_value_semantics() {
    assert!(!same_value(&json!(0), &json!(-0.0)));
    assert!(same_value(&json!(-0.0), &json!(-0.0)));
    assert!(same_value_f64(f64::NAN, f64::NAN));
    assert!(!same_value_f64(0.0, -0.0));

    let spec = AssertionSpec::from_value(&json!({"equals": {"v": 0}}), "assert").expect("spec");
    let outcome = evaluate_assertions(&spec, &json!({"v": -0.0}));
    assert_eq!(outcome.failed, 1);
}

#[test]
fn assertion_failure_aborts_with_partial_timeline() {
    let mut ops = ScriptedOps::default();
    let outcome = execute_plan(
        &plan(json!({"steps": [
            {"id": "open", "url": "https://example.com", "as": "home"},
            {"id": "snapshot", "assert": {"contains": {"text": "Nope"}, "truthy": ["headings"]}},
            {"id": "list"}
        ]})),
        &mut ops,
        &opts(),
    )
    .expect("outcome");

    let report = &outcome.report;
    assert!(!report.ok);
    assert_eq!(report.error.as_ref().map(|e| e.code.as_str()), Some("E_ASSERT_FAILED"));
    assert_eq!(report.steps.len(), 2);
    let assert = report.steps[1].assert.as_ref().expect("assert outcome");
    assert_eq!((assert.failed, assert.total), (1, 2));
    let names: Vec<&str> = report.timeline.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["run.start", "step.start", "step.end", "step.start", "step.assert-failed", "run.end"]
    );
    assert!(ops.calls_of("list").is_empty());
    assert_eq!(outcome.touched.len(), 2);
    let msg = outcome.error.expect("error").to_string();
    assert!(msg.contains("steps[1] (snapshot)"), "{msg}");
    assert!(msg.contains("1 of 2"), "{msg}");
}

#[test]
fn full_log_keeps_the_report_of_a_step_whose_assertion_failed() {
    let ws = temp_workspace("assert-log");
    let log = ws.join("run.ndjson");
    let mut ops = ScriptedOps::default();
    let outcome = execute_plan(
        &plan(json!({"steps": [
            {"id": "open", "url": "https://example.com"},
            {"id": "snapshot", "assert": {"contains": {"text": "Nope"}}}
        ]})),
        &mut ops,
        &RunOptions {
            log_ndjson: Some(log.clone()),
            log_mode: LogMode::Full,
            ..opts()
        },
    )
    .expect("outcome");
    assert!(!outcome.report.ok);

    let lines = std::fs::read_to_string(&log).expect("ndjson");
    let events: Vec<Value> = lines.lines().map(|l| serde_json::from_str(l).expect("line")).collect();
    let failed_report = events
        .iter()
        .find(|e| e["event"] == "step.report" && e["index"] == 1)
        .expect("report of the failed step");
    assert_eq!(failed_report["report"]["text"], "Example Domain");
    let report_pos = events.iter().position(|e| e["event"] == "step.report" && e["index"] == 1);
    let failed_pos = events.iter().position(|e| e["event"] == "step.assert-failed");
    assert!(report_pos < failed_pos);
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn full_log_records_every_repeat_until_attempt() {
    let ws = temp_workspace("attempt-log");
    let log = ws.join("run.ndjson");
    let mut ops = ScriptedOps::default();
    run_plan(
        &plan(json!({"steps": [
            {"id": "repeat-until", "step": {"id": "count", "selector": ".row"},
             "untilPath": "count", "untilGte": 3}
        ]})),
        &mut ops,
        &RunOptions {
            log_ndjson: Some(log.clone()),
            log_mode: LogMode::Full,
            ..opts()
        },
    )
    .expect("run");

    let lines = std::fs::read_to_string(&log).expect("ndjson");
    let reports: Vec<Value> = lines
        .lines()
        .map(|l| serde_json::from_str::<Value>(l).expect("line"))
        .filter(|e| e["event"] == "step.report")
        .collect();
    let attempts: Vec<Value> = reports.iter().filter_map(|e| e.get("attempt").cloned()).collect();
    assert_eq!(attempts, vec![json!(1), json!(2), json!(3)]);
    assert!(reports.iter().any(|e| e["id"] == "repeat-until" && e["report"]["satisfied"] == true));
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn result_projection_and_require_from_fixture() {
    let loaded = LoadedPlan {
        source: "plan-file".into(),
        value: serde_json::from_str(&fixture("poll-count.json")).expect("fixture json"),
        replay: None,
    };
    assert!(doctor_plan(&loaded).valid);
    let mut ops = ScriptedOps::default();
    let report = run_plan(&Plan::from_value(&loaded.value).expect("plan"), &mut ops, &opts()).expect("run");
    let result = report.result.as_ref().expect("result");
    assert_eq!(result["url"], "https://example.com/feed");
    assert_eq!(result["items"], 3);
    assert_eq!(result["attempts"], 3);
    assert!(report.require.as_ref().is_some_and(|r| r.passed()));
    assert!(ops.calls_of("count").iter().all(|c| c.target_id.as_deref() == Some("t-1")));
}

#[test]
fn unresolved_result_paths_project_as_null() {
    let mut ops = ScriptedOps::default();
    let report = run_plan(
        &plan(json!({
            "steps": [{"id": "list", "as": "tabs"}],
            "result": {"count": "tabs.count", "ghost": "tabs.missing.deep"}
        })),
        &mut ops,
        &opts(),
    )
    .expect("run");
    let result = report.result.expect("result");
    assert_eq!(result["count"], 0);
    assert_eq!(result["ghost"], Value::Null);
}

#[test]
fn require_failure_aborts_after_all_steps() {
    let mut ops = ScriptedOps::default();
    let outcome = execute_plan(
        &plan(json!({
            "steps": [{"id": "count", "as": "n"}, {"id": "list"}],
            "result": {"n": "n.count"},
            "require": {"gte": {"result.n": 5}}
        })),
        &mut ops,
        &opts(),
    )
    .expect("outcome");
    assert_eq!(outcome.report.steps.len(), 2);
    let err = outcome.error.expect("require failure");
    assert_eq!(err.code(), "E_ASSERT_FAILED");
    assert!(err.to_string().starts_with("require failed"));
    assert!(outcome.report.timeline.iter().any(|e| e.name == "run.require-failed"));
}

#[test]
fn record_then_replay_reproduces_the_plan() {
    let ws = temp_workspace("record");
    let log = ws.join("run.ndjson");
    let the_plan = plan(json!({"steps": [
        {"id": "open", "url": "https://example.com", "as": "home"},
        {"id": "snapshot"}
    ]}));
    let mut ops = ScriptedOps::default();
    let report = run_plan(
        &the_plan,
        &mut ops,
        &RunOptions {
            log_ndjson: Some(log.clone()),
            log_mode: LogMode::Full,
            record: Some(RecordOptions {
                path: None,
                runs_dir: ws.join("runs"),
                label: Some("smoke".into()),
            }),
            ..opts()
        },
    )
    .expect("run");

    let artifact = PathBuf::from(report.record_path.expect("record path"));
    assert!(artifact.starts_with(ws.join("runs")));
    assert!(artifact.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.contains("-smoke-")));

    let lines = std::fs::read_to_string(&log).expect("ndjson");
    let events: Vec<Value> = lines.lines().map(|l| serde_json::from_str(l).expect("line")).collect();
    assert_eq!(events.iter().filter(|e| e["event"] == "step.report").count(), 2);
    assert_eq!(events.last().map(|e| e["event"].clone()), Some(json!("run.end")));

    let loaded = load_plan(&PlanSource::Replay(artifact.clone())).expect("replay load");
    assert_eq!(&loaded.value, the_plan.raw());
    assert_eq!(loaded.source, "replay");
    let origin = loaded.replay.clone().expect("replay origin");
    assert_eq!(origin.label.as_deref(), Some("smoke"));

    let mut ops = ScriptedOps::default();
    let again = run_plan(
        &Plan::from_value(&loaded.value).expect("plan"),
        &mut ops,
        &RunOptions {
            source: loaded.source.clone(),
            replay_of: loaded.replay.clone(),
            ..opts()
        },
    )
    .expect("replayed run");
    assert_eq!(again.replay_of, Some(origin));
    assert_eq!(again.steps.len(), 2);
    let _ = std::fs::remove_dir_all(ws);
}

fn target(id: &str, session_id: &str, updated_ms: u64) -> Target {
    Target {
        target_id: id.to_string(),
        session_id: session_id.to_string(),
        url: None,
        title: None,
        status: None,
        last_action_kind: None,
        last_action_at: None,
        updated_at: iso_from_unix_ms(updated_ms),
    }
}

fn managed(id: &str, origin: &str) -> Session {
    let now = wall_time_iso_utc();
    Session {
        session_id: id.to_string(),
        kind: SessionKind::Managed,
        cdp_origin: origin.to_string(),
        debug_port: None,
        user_data_dir: None,
        browser_pid: None,
        policy: SessionKind::Managed.default_policy(),
        lease_ttl_ms: None,
        profile: None,
        created_at: now.clone(),
        last_seen_at: now,
        managed_unreachable_since: None,
        managed_unreachable_count: 0,
    }
}

#[test]
fn concurrent_writers_from_one_revision_both_land() {
    let ws = temp_workspace("concurrent");
    let barrier = Arc::new(Barrier::new(2));
    let workers: Vec<_> = ["t-a", "t-b"]
        .into_iter()
        .map(|id| {
            let root = ws.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let handle = StateHandle::new(root);
                let mut first = true;
                handle
                    .transaction()
                    .run(|state| {
                        if first {
                            first = false;
                            barrier.wait();
                        }
                        state.targets.insert(id.to_string(), target(id, "s-1", now_unix_ms()));
                        Ok(())
                    })
                    .expect("commit")
            })
        })
        .collect();
    let mut attempts: Vec<u32> = workers
        .into_iter()
        .map(|w| w.join().expect("worker").attempts)
        .collect();
    attempts.sort_unstable();
    assert_eq!(attempts, vec![1, 2]);

    let handle = StateHandle::new(&ws);
    let state = handle.read().expect("read");
    assert!(state.targets.contains_key("t-a") && state.targets.contains_key("t-b"));
    assert_eq!(handle.revision().expect("revision"), 2);
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn stale_lock_is_reclaimed_without_waiting_for_the_timeout() {
    let ws = temp_workspace("stale");
    let handle = StateHandle::new(&ws).with_lock_options(LockOptions {
        timeout: Duration::from_secs(10),
        poll: Duration::from_millis(10),
        stale_after: Duration::from_millis(500),
    });
    let lock_path = handle.lock_path();
    std::fs::create_dir_all(lock_path.parent().expect("lock dir")).expect("create lock dir");
    std::fs::write(
        &lock_path,
        serde_json::to_vec(&json!({"pid": 1, "token": "crashed", "acquiredAtMs": 1_000})).expect("meta"),
    )
    .expect("plant lock");

    let started = Instant::now();
    handle
        .update(|state| {
            state.active_session_id = Some("s-1".into());
            Ok(())
        })
        .expect("update after reclaim");
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    assert!(!handle.lock_path().exists());
    let _ = std::fs::remove_dir_all(ws);
}

/// Reachability keyed by origin; anything not marked down answers.
#[derive(Default)]
struct ScriptedProbe {
    down: RefCell<BTreeSet<String>>,
}

impl ScriptedProbe {
    fn set_down(&self, origin: &str, down: bool) {
        let mut set = self.down.borrow_mut();
        if down {
            set.insert(origin.to_string());
        } else {
            set.remove(origin);
        }
    }
}

impl CdpProbe for ScriptedProbe {
    fn reachable(&self, cdp_origin: &str) -> bool {
        !self.down.borrow().contains(cdp_origin)
    }
}

#[derive(Default)]
struct ScriptedLauncher {
    launched: RefCell<Vec<LaunchRequest>>,
}

impl BrowserLauncher for ScriptedLauncher {
    fn launch(&self, request: &LaunchRequest) -> SurfResult<LaunchedBrowser> {
        self.launched.borrow_mut().push(request.clone());
        Ok(LaunchedBrowser { pid: 0 })
    }
}

#[test]
fn managed_session_survives_one_failed_probe_then_is_evicted() {
    let ws = temp_workspace("grace");
    let handle = StateHandle::new(&ws);
    handle
        .update(|state| {
            state.sessions.insert("s-1".into(), managed("s-1", "http://127.0.0.1:9301"));
            state.targets.insert("t-1".into(), target("t-1", "s-1", now_unix_ms()));
            Ok(())
        })
        .expect("seed");
    let probe = ScriptedProbe::default();
    probe.set_down("http://127.0.0.1:9301", true);

    let first = session_prune(&handle, &probe, SessionPruneOptions::default()).expect("prune 1");
    assert!(first.removed_unreachable.is_empty());
    assert_eq!(handle.read().expect("read").sessions["s-1"].managed_unreachable_count, 1);

    let second = session_prune(&handle, &probe, SessionPruneOptions::default()).expect("prune 2");
    assert_eq!(second.removed_unreachable, vec!["s-1".to_string()]);
    let state = handle.read().expect("read");
    assert!(state.sessions.is_empty());
    assert!(state.targets.is_empty());
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn target_prune_keeps_the_two_most_recent() {
    let ws = temp_workspace("targets");
    let handle = StateHandle::new(&ws);
    let now = now_unix_ms();
    handle
        .update(|state| {
            state.sessions.insert("s-1".into(), managed("s-1", "http://127.0.0.1:9302"));
            for (id, age) in [("t-old", 3_000), ("t-mid", 2_000), ("t-new", 1_000)] {
                state.targets.insert(id.into(), target(id, "s-1", now - age));
            }
            Ok(())
        })
        .expect("seed");
    let report = target_prune(
        &handle,
        &TargetPruneOptions {
            max_per_session: 2,
            ..TargetPruneOptions::default()
        },
    )
    .expect("prune");
    assert_eq!((report.removed_capped, report.remaining), (1, 2));
    let state = handle.read().expect("read");
    assert!(!state.targets.contains_key("t-old"));
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn reconcile_runs_both_jobs_in_one_revision() {
    let ws = temp_workspace("reconcile");
    let handle = StateHandle::new(&ws);
    handle
        .update(|state| {
            state.sessions.insert("s-1".into(), managed("s-1", "http://127.0.0.1:9303"));
            state.targets.insert("orphan".into(), target("orphan", "s-gone", now_unix_ms()));
            state.begin_capture("s-1", None, "2026-01-01T00:00:00Z")?;
            Ok(())
        })
        .expect("seed");
    let before = handle.revision().expect("rev");
    let probe = ScriptedProbe::default();
    let report = state_reconcile(
        &handle,
        &probe,
        SessionPruneOptions::default(),
        &TargetPruneOptions::default(),
    )
    .expect("reconcile");
    assert_eq!(report.sessions.heartbeated, vec!["s-1".to_string()]);
    assert_eq!(report.targets.removed_orphaned, 1);
    assert!(report.failed_captures.is_empty());
    assert_eq!(handle.revision().expect("rev"), before + 1);
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn attach_probes_first_and_guards_origin_ownership() {
    let ws = temp_workspace("attach");
    let handle = StateHandle::new(&ws);
    let probe = ScriptedProbe::default();
    let launcher = ScriptedLauncher::default();
    let resolver = SessionResolver::new(&handle, &probe, &launcher, ResolverSettings::default());

    probe.set_down("http://127.0.0.1:9222", true);
    let err = resolver
        .attach(&AttachRequest {
            cdp_origin: "ws://127.0.0.1:9222/devtools/browser/x".into(),
            ..AttachRequest::default()
        })
        .unwrap_err();
    assert_eq!(err.code(), "E_CDP_UNREACHABLE");
    assert!(handle.read().expect("read").sessions.is_empty());

    probe.set_down("http://127.0.0.1:9222", false);
    let first = resolver
        .attach(&AttachRequest {
            cdp_origin: "127.0.0.1:9222".into(),
            ..AttachRequest::default()
        })
        .expect("attach");
    assert!(first.created);
    assert_eq!(first.session.session_id, "s-1");
    assert_eq!(first.session.kind, SessionKind::Attached);
    assert_eq!(first.session.lease_ttl_ms, None);

    let again = resolver
        .attach(&AttachRequest {
            cdp_origin: "http://127.0.0.1:9222".into(),
            ..AttachRequest::default()
        })
        .expect("reattach");
    assert!(!again.created);
    assert_eq!(again.session.session_id, "s-1");

    let conflict = resolver
        .attach(&AttachRequest {
            cdp_origin: "http://127.0.0.1:9222".into(),
            session_id: Some("other".into()),
            ..AttachRequest::default()
        })
        .unwrap_err();
    assert_eq!(conflict.code(), "E_SESSION_CONFLICT");

    let exists = resolver
        .attach(&AttachRequest {
            cdp_origin: "http://127.0.0.1:9555".into(),
            session_id: Some("s-1".into()),
            ..AttachRequest::default()
        })
        .unwrap_err();
    assert_eq!(exists.code(), "E_SESSION_EXISTS");
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn ensure_falls_back_to_managed_sessions_only() {
    let ws = temp_workspace("ensure");
    let handle = StateHandle::new(&ws);
    let probe = ScriptedProbe::default();
    let launcher = ScriptedLauncher::default();
    let resolver = SessionResolver::new(&handle, &probe, &launcher, ResolverSettings::default());

    resolver
        .attach(&AttachRequest {
            cdp_origin: "http://127.0.0.1:9401".into(),
            ..AttachRequest::default()
        })
        .expect("attach s-1");
    resolver
        .attach(&AttachRequest {
            cdp_origin: "http://127.0.0.1:9402".into(),
            session_id: Some("attached-2".into()),
            ..AttachRequest::default()
        })
        .expect("attach attached-2");
    handle
        .update(|state| {
            state.sessions.insert("m-1".into(), managed("m-1", "http://127.0.0.1:9403"));
            state.active_session_id = Some("s-1".into());
            Ok(())
        })
        .expect("seed managed");

    let reused = resolver.ensure().expect("ensure reuse");
    assert_eq!(reused.session.session_id, "s-1");
    assert_eq!(reused.fallback_from, None);

    probe.set_down("http://127.0.0.1:9401", true);
    let fallback = resolver.ensure().expect("ensure fallback");
    assert_eq!(fallback.session.session_id, "m-1");
    assert_eq!(fallback.fallback_from.as_deref(), Some("s-1"));
    assert_eq!(handle.read().expect("read").active_session_id.as_deref(), Some("m-1"));

    probe.set_down("http://127.0.0.1:9403", true);
    let launched = resolver.ensure().expect("ensure launch");
    assert!(launched.created);
    assert_eq!(launched.session.kind, SessionKind::Managed);
    assert_eq!(launched.fallback_from.as_deref(), Some("m-1"));
    assert_eq!(launcher.launched.borrow().len(), 1);
    assert!(launched.session.lease_ttl_ms.is_some());
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn use_session_requires_existence_and_reachability() {
    let ws = temp_workspace("use");
    let handle = StateHandle::new(&ws);
    let probe = ScriptedProbe::default();
    let launcher = ScriptedLauncher::default();
    let resolver = SessionResolver::new(&handle, &probe, &launcher, ResolverSettings::default());

    assert_eq!(resolver.use_session("nope").unwrap_err().code(), "E_SESSION_NOT_FOUND");
    handle
        .update(|state| {
            state.sessions.insert("m-1".into(), managed("m-1", "http://127.0.0.1:9501"));
            Ok(())
        })
        .expect("seed");
    probe.set_down("http://127.0.0.1:9501", true);
    let err = resolver.use_session("m-1").unwrap_err();
    assert_eq!(err.code(), "E_SESSION_UNREACHABLE");
    assert!(err.retryable());

    probe.set_down("http://127.0.0.1:9501", false);
    resolver.use_session("m-1").expect("use");
    assert_eq!(handle.read().expect("read").active_session_id.as_deref(), Some("m-1"));
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn run_activity_upserts_targets_for_known_sessions() {
    let ws = temp_workspace("activity");
    let handle = StateHandle::new(&ws);
    let probe = ScriptedProbe::default();
    let launcher = ScriptedLauncher::default();
    let resolver = SessionResolver::new(&handle, &probe, &launcher, ResolverSettings::default());
    handle
        .update(|state| {
            state.sessions.insert("s-1".into(), managed("s-1", "http://127.0.0.1:9601"));
            Ok(())
        })
        .expect("seed");

    let mut ops = ScriptedOps::default();
    let outcome = execute_plan(
        &plan(json!({"steps": [
            {"id": "open", "url": "https://example.com"},
            {"id": "click", "text": "More"}
        ]})),
        &mut ops,
        &opts(),
    )
    .expect("run");
    assert_eq!(outcome.touched.len(), 2);
    assert_eq!(resolver.record_activity(&outcome.touched).expect("activity"), 2);

    let state = handle.read().expect("read");
    let t = &state.targets["t-1"];
    assert_eq!(t.url.as_deref(), Some("https://example.com"));
    assert_eq!(t.title.as_deref(), Some("Example Domain"));
    assert_eq!(t.last_action_kind.as_deref(), Some("click"));
    let _ = std::fs::remove_dir_all(ws);
}
