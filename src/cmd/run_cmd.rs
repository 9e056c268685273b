//! `run`: lint-only doctor mode, or plan execution against a resolved session.

use serde_json::Value;

use std::path::PathBuf;

use crate::{
    ChromeLauncher, Config, DevtoolsHttpOps, HttpCdpProbe, LogMode, Plan, PlanSource,
    RecordOptions, ResolverSettings, RunOptions, SessionResolver, StateHandle, SurfResult,
    doctor_plan, execute_plan, load_plan,
};

#[derive(Debug, Clone, Default, clap::Args)]
pub struct RunArgs {
    /// Plan file, or `-` for stdin.
    #[arg(long)]
    pub plan: Option<PathBuf>,

    /// Inline plan JSON.
    #[arg(long)]
    pub plan_json: Option<String>,

    /// Re-run the plan stored in a recorded run artifact.
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// Lint only; exit 1 when the plan has errors.
    #[arg(long)]
    pub doctor: bool,

    /// Write a replayable run artifact under the state root.
    #[arg(long)]
    pub record: bool,

    /// Artifact file, or a directory to create one in. Implies `--record`.
    #[arg(long)]
    pub record_path: Option<PathBuf>,

    #[arg(long)]
    pub record_label: Option<String>,

    #[arg(long)]
    pub log_ndjson: Option<PathBuf>,

    #[arg(long, default_value = "minimal")]
    pub log_mode: LogMode,

    /// Default per-step timeout.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Run against this session instead of the active one.
    #[arg(long)]
    pub session: Option<String>,

    /// Initial target for steps that do not open one.
    #[arg(long)]
    pub target_id: Option<String>,
}

pub fn run_command(config: &Config, args: &RunArgs) -> SurfResult<Value> {
    let source = PlanSource::from_flags(
        args.plan.as_deref(),
        args.plan_json.as_deref(),
        args.replay.as_deref(),
    )?;
    let loaded = load_plan(&source)?;
    if args.doctor {
        return Ok(serde_json::to_value(doctor_plan(&loaded))?);
    }
    let plan = Plan::from_value(&loaded.value)?;

    let handle = StateHandle::from_config(config);
    let probe = HttpCdpProbe::new(config.probe_timeout());
    let launcher = ChromeLauncher {
        chrome_path: config.chrome_path.clone(),
    };
    let resolver = SessionResolver::new(&handle, &probe, &launcher, ResolverSettings::from_config(config));
    let resolved = resolver.resolve_for_run(args.session.as_deref())?;
    let session = resolved.session;
    let mut ops = DevtoolsHttpOps::new(session.session_id.clone(), session.cdp_origin.clone());

    let record = (args.record || args.record_path.is_some()).then(|| RecordOptions {
        path: args.record_path.clone(),
        runs_dir: handle.runs_dir(),
        label: args.record_label.clone(),
    });
    let opts = RunOptions {
        timeout_ms: args.timeout_ms.unwrap_or(config.default_timeout_ms).max(1),
        session_id: Some(session.session_id.clone()),
        target_id: args.target_id.clone(),
        log_ndjson: args.log_ndjson.clone(),
        log_mode: args.log_mode,
        record,
        source: loaded.source.clone(),
        replay_of: loaded.replay.clone(),
    };
    let outcome = execute_plan(&plan, &mut ops, &opts)?;

    match resolver.record_activity(&outcome.touched) {
        Ok(n) => tracing::debug!(targets = n, "recorded target activity"),
        Err(err) if outcome.error.is_none() => return Err(err),
        Err(err) => tracing::warn!("failed to record target activity after a failed run: {err}"),
    }
    let report = outcome.into_result()?;
    Ok(serde_json::to_value(report)?)
}
