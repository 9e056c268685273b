//! Surfwright CLI entrypoint. Every command prints one JSON document on stdout.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;

use surfwright::{
    Config, RunArgs, SessionCommand, StateCommand, SurfError, TargetCommand, run_command,
    session_command, state_command, target_command,
};

#[derive(Debug, Parser)]
#[command(name = "surfwright")]
#[command(version)]
#[command(about = "deterministic browser-automation control plane: plan runner + shared session state")]
struct Cli {
    /// Path to config file. Missing configs are treated as "defaults".
    #[arg(long, global = true, default_value = "surfwright.toml")]
    config: PathBuf,

    /// Log level for stderr diagnostics (`RUST_LOG` wins when set).
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Lint or execute a plan
    Run(RunArgs),

    /// Create, attach, switch and maintain browser sessions
    #[command(subcommand)]
    Session(SessionCommand),

    /// Inspect and prune tracked targets
    #[command(subcommand)]
    Target(TargetCommand),

    /// Whole-store maintenance
    #[command(subcommand)]
    State(StateCommand),
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(
            err.kind(),
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
        ) =>
        {
            // Best-effort: stdout may already be closed.
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let msg = err.render().to_string();
            let first = msg.lines().next().unwrap_or("invalid arguments").trim_start_matches("error: ");
            return print_error_and_exit(anyhow::Error::new(SurfError::query(first.to_string())));
        }
    };

    if let Err(err) = init_tracing(&cli.log) {
        // Tracing is best-effort; if it fails, we still continue.
        eprintln!("warning: failed to init tracing: {err:#}");
    }

    let config = Config::load_optional(&cli.config);

    match dispatch(&cli, &config) {
        Ok(code) => code,
        Err(err) => print_error_and_exit(err),
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

fn dispatch(cli: &Cli, config: &Config) -> anyhow::Result<ExitCode> {
    let out = match &cli.command {
        Command::Run(args) => run_command(config, args)?,
        Command::Session(cmd) => session_command(config, cmd)?,
        Command::Target(cmd) => target_command(config, cmd)?,
        Command::State(cmd) => state_command(config, cmd)?,
    };
    println!("{}", serde_json::to_string(&out)?);
    // `run --doctor` reports an invalid plan as a normal document with `ok: false`.
    if out.get("ok").and_then(serde_json::Value::as_bool) == Some(false) {
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_error_and_exit(err: anyhow::Error) -> ExitCode {
    let (code, message) = match err.downcast_ref::<SurfError>() {
        Some(surf) => (surf.code(), surf.to_string()),
        None => ("E_INTERNAL", format!("{err:#}")),
    };
    let out = serde_json::json!({
        "ok": false,
        "code": code,
        "message": message,
    });
    println!("{out}");
    ExitCode::from(1)
}
