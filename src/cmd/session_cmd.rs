//! `session`, `target` and `state` subcommands.

use clap::Subcommand;
use serde_json::{Value, json};

use crate::{
    AttachRequest, ChromeLauncher, Config, HttpCdpProbe, NewSessionRequest, ResolverSettings,
    SessionPolicy, SessionPruneOptions, SessionResolver, StateHandle, SurfDuration, SurfResult,
    TargetPruneOptions, session_prune, state_reconcile, target_prune,
};

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Launch a managed browser and make it the active session.
    New {
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        policy: Option<SessionPolicy>,
        /// Lease, e.g. `30m`. `0s` disables the lease.
        #[arg(long)]
        lease_ttl: Option<SurfDuration>,
        /// Named profile directory under the state root.
        #[arg(long)]
        profile: Option<String>,
    },
    /// Attach to a running browser's DevTools endpoint.
    Attach {
        #[arg(long)]
        cdp: String,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        policy: Option<SessionPolicy>,
        #[arg(long)]
        lease_ttl: Option<SurfDuration>,
    },
    /// Make an existing, reachable session active.
    Use { session_id: String },
    /// Reuse the active session, or fall back to a managed one.
    Ensure,
    List,
    /// Evict expired and unreachable sessions.
    Prune {
        #[command(flatten)]
        flags: SessionPruneFlags,
    },
    /// Remove every session and its targets.
    Clear {
        /// Leave managed browser processes running.
        #[arg(long)]
        keep_processes: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, clap::Args)]
pub struct SessionPruneFlags {
    /// Remove attached sessions that fail their probe.
    #[arg(long)]
    pub drop_attached_unreachable: bool,
    /// Remove managed sessions on the first failed probe.
    #[arg(long)]
    pub drop_managed_unreachable: bool,
}

impl From<SessionPruneFlags> for SessionPruneOptions {
    fn from(flags: SessionPruneFlags) -> Self {
        Self {
            drop_unreachable_attached: flags.drop_attached_unreachable,
            drop_unreachable_managed_now: flags.drop_managed_unreachable,
        }
    }
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct TargetPruneFlags {
    /// Age cutoff, e.g. `168h`.
    #[arg(long)]
    pub max_age: Option<SurfDuration>,
    #[arg(long)]
    pub max_per_session: Option<usize>,
}

impl TargetPruneFlags {
    pub fn options(&self, config: &Config) -> TargetPruneOptions {
        let mut opts = TargetPruneOptions::from_config(config);
        if let Some(age) = self.max_age {
            opts.max_age = age.into();
        }
        if let Some(cap) = self.max_per_session {
            opts.max_per_session = cap;
        }
        opts
    }
}

#[derive(Debug, Subcommand)]
pub enum TargetCommand {
    /// List known targets, optionally for one session.
    List {
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Drop orphaned, aged-out and over-cap targets.
    Prune {
        #[command(flatten)]
        flags: TargetPruneFlags,
    },
}

#[derive(Debug, Subcommand)]
pub enum StateCommand {
    /// Session prune and target prune in a single update.
    Reconcile {
        #[command(flatten)]
        sessions: SessionPruneFlags,
        #[command(flatten)]
        targets: TargetPruneFlags,
    },
    /// Print the state root, layout and current revision.
    Info,
}

pub fn session_command(config: &Config, command: &SessionCommand) -> SurfResult<Value> {
    let handle = StateHandle::from_config(config);
    let probe = HttpCdpProbe::new(config.probe_timeout());
    let launcher = ChromeLauncher {
        chrome_path: config.chrome_path.clone(),
    };
    let resolver = SessionResolver::new(&handle, &probe, &launcher, ResolverSettings::from_config(config));

    match command {
        SessionCommand::New {
            session_id,
            policy,
            lease_ttl,
            profile,
        } => {
            let resolved = resolver.new_managed(&NewSessionRequest {
                session_id: session_id.clone(),
                policy: *policy,
                lease_ttl_ms: lease_ttl.map(SurfDuration::as_millis_u64),
                profile: profile.clone(),
            })?;
            ok_with(serde_json::to_value(resolved)?)
        }

        SessionCommand::Attach {
            cdp,
            session_id,
            policy,
            lease_ttl,
        } => {
            let resolved = resolver.attach(&AttachRequest {
                cdp_origin: cdp.clone(),
                session_id: session_id.clone(),
                policy: *policy,
                lease_ttl_ms: lease_ttl.map(SurfDuration::as_millis_u64),
            })?;
            ok_with(serde_json::to_value(resolved)?)
        }

        SessionCommand::Use { session_id } => {
            let session = resolver.use_session(session_id)?;
            Ok(json!({"ok": true, "activeSessionId": session.session_id, "session": session}))
        }

        SessionCommand::Ensure => ok_with(serde_json::to_value(resolver.ensure()?)?),

        SessionCommand::List => ok_with(serde_json::to_value(resolver.list()?)?),

        SessionCommand::Prune { flags } => {
            let report = session_prune(&handle, &probe, (*flags).into())?;
            ok_with(serde_json::to_value(report)?)
        }

        SessionCommand::Clear { keep_processes } => {
            ok_with(serde_json::to_value(resolver.clear(*keep_processes)?)?)
        }
    }
}

pub fn target_command(config: &Config, command: &TargetCommand) -> SurfResult<Value> {
    let handle = StateHandle::from_config(config);
    match command {
        TargetCommand::List { session_id } => {
            let state = handle.read()?;
            let targets: Vec<_> = state
                .targets
                .into_values()
                .filter(|t| session_id.as_ref().is_none_or(|id| *id == t.session_id))
                .collect();
            Ok(json!({"ok": true, "count": targets.len(), "targets": targets}))
        }
        TargetCommand::Prune { flags } => {
            let report = target_prune(&handle, &flags.options(config))?;
            ok_with(serde_json::to_value(report)?)
        }
    }
}

pub fn state_command(config: &Config, command: &StateCommand) -> SurfResult<Value> {
    let handle = StateHandle::from_config(config);
    match command {
        StateCommand::Reconcile { sessions, targets } => {
            let probe = HttpCdpProbe::new(config.probe_timeout());
            let report = state_reconcile(&handle, &probe, (*sessions).into(), &targets.options(config))?;
            ok_with(serde_json::to_value(report)?)
        }
        StateCommand::Info => {
            let state = handle.read()?;
            Ok(json!({
                "ok": true,
                "root": handle.root().display().to_string(),
                "layout": format!("{:?}", handle.layout()).to_lowercase(),
                "revision": handle.revision()?,
                "version": state.version,
                "sessions": state.sessions.len(),
                "targets": state.targets.len(),
                "captures": state.network_captures.len(),
                "artifacts": state.network_artifacts.len(),
            }))
        }
    }
}

/// Prefixes `ok: true` onto an object payload.
fn ok_with(payload: Value) -> SurfResult<Value> {
    let mut out = serde_json::Map::new();
    out.insert("ok".to_string(), Value::Bool(true));
    if let Value::Object(map) = payload {
        out.extend(map);
    }
    Ok(Value::Object(out))
}
