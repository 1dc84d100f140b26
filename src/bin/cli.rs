use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use harness_bridge::client::BridgeClient;
use harness_bridge::envelope::{RpcRequest, PROTOCOL_VERSION};
use harness_bridge::error::{AppError, ErrorCode};
use harness_bridge::lifecycle::{self, Lifecycle, VerifyOptions};
use harness_bridge::orchestrator::Orchestrator;
use harness_bridge::paths;
use harness_bridge::plan::load_plan;
use harness_bridge::settings::{self, BridgeSettings};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "harness-bridge", about = "Localhost RPC bridge for a content-editing host", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State directory override
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Bridge URL (default: $HARNESS_BRIDGE_URL, the running bridge's record, then settings)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Loopback host to bind or dial
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to bind or dial
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bridge process management
    Bridge {
        #[command(subcommand)]
        action: BridgeAction,
    },
    /// Call one RPC method
    Call {
        method: String,
        /// JSON object of params
        #[arg(long)]
        params: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List registered methods, optionally for one category or method
    Methods { topic: Option<String> },
    /// Run a plan file
    RunPlan {
        file: PathBuf,
        #[arg(long)]
        dry_run: bool,
        /// Leave changes in place when a step fails
        #[arg(long)]
        no_rollback: bool,
    },
    /// Background job queries
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum BridgeAction {
    /// Run the bridge in the foreground
    Serve,
    /// Start the bridge in the background and wait until it is healthy
    Start,
    /// Shut the bridge down
    Stop,
    /// Report whether the bridge answers
    Status,
    /// Repeat a diagnostic call and count failures
    Verify {
        #[arg(long, default_value_t = 25)]
        iterations: u32,
        #[arg(long, default_value_t = 0)]
        max_failures: u32,
        #[arg(long, default_value_t = 20)]
        pause_ms: u64,
    },
}

#[derive(Subcommand)]
enum JobAction {
    Status {
        job_id: String,
        /// Block up to this long for the job to finish
        #[arg(long)]
        wait_ms: Option<u64>,
    },
    Cancel {
        job_id: String,
    },
    List {
        /// queued, running, succeeded, failed, cancelled, active or terminal
        #[arg(long)]
        status: Option<String>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Bridge { action } => match action {
                BridgeAction::Serve => "bridge.serve",
                BridgeAction::Start => "bridge.start",
                BridgeAction::Stop => "bridge.stop",
                BridgeAction::Status => "bridge.status",
                BridgeAction::Verify { .. } => "bridge.verify",
            },
            Commands::Call { .. } => "call",
            Commands::Methods { .. } => "methods",
            Commands::RunPlan { .. } => "run-plan",
            Commands::Job { action } => match action {
                JobAction::Status { .. } => "job.status",
                JobAction::Cancel { .. } => "job.cancel",
                JobAction::List { .. } => "job.list",
            },
        }
    }
}

// ── Output ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct CliError {
    code: ErrorCode,
    message: String,
    retryable: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CliOutput<'a> {
    ok: bool,
    protocol_version: &'static str,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<CliError>,
}

/// A failed command, optionally with the partial result that explains it.
struct Failure {
    error: AppError,
    data: Option<Value>,
}

impl From<AppError> for Failure {
    fn from(error: AppError) -> Self {
        Self { error, data: None }
    }
}

impl From<serde_json::Error> for Failure {
    fn from(e: serde_json::Error) -> Self {
        AppError::from(e).into()
    }
}

/// Print the result object on stdout and return the process exit code.
fn emit(command: &str, outcome: Result<Value, Failure>) -> i32 {
    let (output, code) = match outcome {
        Ok(data) => (
            CliOutput {
                ok: true,
                protocol_version: PROTOCOL_VERSION,
                command,
                data: Some(data),
                error: None,
            },
            0,
        ),
        Err(Failure { error, data }) => {
            let code = error.code();
            (
                CliOutput {
                    ok: false,
                    protocol_version: PROTOCOL_VERSION,
                    command,
                    data,
                    error: Some(CliError {
                        code,
                        message: error.to_string(),
                        retryable: code.is_retryable(),
                    }),
                },
                code.exit_code(),
            )
        }
    };
    match serde_json::to_string_pretty(&output) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to encode output: {e}"),
    }
    code
}

// ── Setup ────────────────────────────────────────────────────────

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

fn load_settings(cli: &Cli, state_dir: &Path) -> Result<BridgeSettings, AppError> {
    let mut settings = settings::load_settings(state_dir)?;
    if let Some(host) = &cli.host {
        settings.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    settings.socket_addr()?;
    Ok(settings)
}

/// `--url`, then `$HARNESS_BRIDGE_URL`, then the lifecycle record, then settings.
fn bridge_url(cli: &Cli, state_dir: &Path, settings: &BridgeSettings) -> String {
    if let Some(url) = &cli.url {
        return url.clone();
    }
    if let Some(url) = std::env::var("HARNESS_BRIDGE_URL").ok().filter(|v| !v.is_empty()) {
        return url;
    }
    if cli.host.is_none() && cli.port.is_none() {
        if let Ok(Some(record)) = lifecycle::read_record(state_dir) {
            return record.url;
        }
    }
    settings.base_url()
}

fn parse_params(raw: Option<&str>) -> Result<Value, AppError> {
    let Some(raw) = raw else {
        return Ok(json!({}));
    };
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| AppError::invalid_input(format!("--params is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(AppError::invalid_input("--params must be a JSON object"));
    }
    Ok(value)
}

fn correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Commands ─────────────────────────────────────────────────────

async fn run_bridge(action: &BridgeAction, state_dir: PathBuf, settings: BridgeSettings) -> Result<Value, Failure> {
    if let BridgeAction::Serve = action {
        lifecycle::serve(state_dir, settings).await?;
        return Ok(json!({ "stopped": true }));
    }

    let manager = Lifecycle::new(state_dir, settings)?;
    match action {
        BridgeAction::Serve => Ok(Value::Null),
        BridgeAction::Start => {
            let exe = std::env::current_exe()
                .map_err(|e| AppError::generic(format!("cannot locate own executable: {e}")))?;
            Ok(serde_json::to_value(manager.start(&exe).await?)?)
        }
        BridgeAction::Stop => Ok(serde_json::to_value(manager.stop().await?)?),
        BridgeAction::Status => Ok(serde_json::to_value(manager.status().await)?),
        BridgeAction::Verify {
            iterations,
            max_failures,
            pause_ms,
        } => {
            let report = manager
                .verify(VerifyOptions {
                    iterations: *iterations,
                    max_failures: *max_failures,
                    pause: Duration::from_millis(*pause_ms),
                })
                .await?;
            let data = serde_json::to_value(&report)?;
            if report.stable {
                Ok(data)
            } else {
                Err(Failure {
                    error: AppError::generic(format!(
                        "{} of {} diagnostic calls failed",
                        report.failures, report.iterations
                    )),
                    data: Some(data),
                })
            }
        }
    }
}

async fn run_plan(client: BridgeClient, file: &Path, dry_run: bool, no_rollback: bool) -> Result<Value, Failure> {
    let mut plan = load_plan(file)?;
    if dry_run {
        plan.options.dry_run = true;
    }
    if no_rollback {
        plan.options.rollback_on_fail = false;
    }
    let report = Orchestrator::new(Arc::new(client)).run(plan).await?;
    let data = serde_json::to_value(&report)?;
    match (report.failed_step, report.first_error()) {
        (Some(index), Some(error)) => Err(Failure {
            error: AppError::from_code(error.code, format!("step {index} failed: {}", error.message)),
            data: Some(data),
        }),
        _ => Ok(data),
    }
}

async fn run(cli: &Cli, state_dir: PathBuf, settings: BridgeSettings) -> Result<Value, Failure> {
    if let Commands::Bridge { action } = &cli.command {
        return run_bridge(action, state_dir, settings).await;
    }

    let client = BridgeClient::new(bridge_url(cli, &state_dir, &settings))?;
    match &cli.command {
        Commands::Bridge { .. } => Ok(Value::Null),
        Commands::Call {
            method,
            params,
            timeout_ms,
        } => {
            let request = RpcRequest::new(correlation_id(), method.as_str(), parse_params(params.as_deref())?)
                .with_timeout_ms(*timeout_ms);
            Ok(client.send(request).await?.into_result()?)
        }
        Commands::Methods { topic } => Ok(client
            .invoke(correlation_id(), "system.methods", json!({ "topic": topic }))
            .await?),
        Commands::RunPlan {
            file,
            dry_run,
            no_rollback,
        } => run_plan(client, file, *dry_run, *no_rollback).await,
        Commands::Job { action } => {
            let (method, params) = match action {
                JobAction::Status { job_id, wait_ms } => {
                    ("job.status", json!({ "jobId": job_id, "waitMs": wait_ms }))
                }
                JobAction::Cancel { job_id } => ("job.cancel", json!({ "jobId": job_id })),
                JobAction::List { status } => ("job.list", json!({ "status": status })),
            };
            Ok(client.invoke(correlation_id(), method, params).await?)
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let command = cli.command.name();
    let state_dir = cli.state_dir.clone().unwrap_or_else(paths::default_state_dir);

    let settings = load_settings(&cli, &state_dir);
    init_tracing(settings.as_ref().map_or("info", |s| s.log_filter.as_str()));

    let outcome = match settings {
        Ok(settings) => run(&cli, state_dir, settings).await,
        Err(e) => Err(e.into()),
    };
    process::exit(emit(command, outcome));
}
