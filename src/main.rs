//! Flotilla - distributed agent orchestration platform
//!
//! Supervisor entry point: `start` hosts the core services and the fleet in
//! the foreground; `stop`, `status`, `test`, and `reload-config` talk to a
//! running `start` over its admin surface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use flotilla::orchestrator::{Orchestrator, OrchestratorError, SmokeResult, StatusRow};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 2;
const EXIT_PLAN: u8 = 3;
const EXIT_STARTUP: u8 = 4;
const EXIT_FATAL: u8 = 5;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "flotilla", version, about = "Distributed agent orchestration platform")]
struct Cli {
    /// Path to the unified configuration document
    #[arg(long, global = true, default_value = "flotilla.yaml")]
    config: PathBuf,

    /// Deployment profile (core | vision | learning | tutoring | full)
    #[arg(long, global = true, env = "PROFILE", default_value = "core")]
    profile: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load config, compute the plan, and bring the fleet to Ready
    Start,
    /// Cooperative fleet shutdown in reverse order
    Stop,
    /// Render agent name, state, endpoint, uptime, and restart count
    Status,
    /// Validate configuration and smoke-dispatch each required capability
    Test,
    /// Re-read config; apply only non-breaking changes
    ReloadConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    flotilla::observability::init_tracing("flotilla=info");
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Start => start(&cli).await,
        Command::Stop => stop(&cli).await,
        Command::Status => status(&cli).await,
        Command::Test => test(&cli).await,
        Command::ReloadConfig => reload_config(&cli).await,
    };
    ExitCode::from(code)
}

async fn start(cli: &Cli) -> u8 {
    info!(config = %cli.config.display(), profile = %cli.profile, "starting flotilla");

    let orchestrator = match Orchestrator::bootstrap(&cli.config, &cli.profile).await {
        Ok(orchestrator) => Arc::new(orchestrator),
        Err(e) => return startup_exit_code(&e),
    };
    if let Err(e) = Arc::clone(&orchestrator).serve_admin().await {
        error!(error = %e, "admin surface failed to bind");
        return EXIT_FATAL;
    }

    // An interrupt during startup tears the partial fleet down and reports
    // the conventional 130.
    tokio::select! {
        result = orchestrator.start_fleet() => {
            if let Err(e) = result {
                error!(error = %e, "fleet startup failed");
                orchestrator.stop().await;
                return startup_exit_code(&e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted during startup");
            orchestrator.stop().await;
            return EXIT_INTERRUPTED;
        }
    }

    info!("fleet ready; running until shutdown");
    orchestrator.run_until_shutdown().await;
    EXIT_OK
}

fn startup_exit_code(error: &OrchestratorError) -> u8 {
    error!(error = %error, "start aborted");
    match error {
        OrchestratorError::Config(_) => EXIT_CONFIG,
        OrchestratorError::Plan(_) => EXIT_PLAN,
        OrchestratorError::Supervisor(_) => EXIT_STARTUP,
        OrchestratorError::Bind { .. } => EXIT_FATAL,
    }
}

/// Admin base URL from the config the running `start` was launched with
fn admin_base(cli: &Cli) -> Result<String, u8> {
    match flotilla::config::load(&cli.config, &cli.profile) {
        Ok(manifest) => Ok(format!(
            "http://127.0.0.1:{}",
            manifest.settings.admin_port
        )),
        Err(e) => {
            eprintln!("config error: {e}");
            Err(EXIT_CONFIG)
        }
    }
}

async fn stop(cli: &Cli) -> u8 {
    let base = match admin_base(cli) {
        Ok(base) => base,
        Err(code) => return code,
    };
    match reqwest::Client::new()
        .post(format!("{base}/shutdown"))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            println!("shutdown requested");
            EXIT_OK
        }
        Ok(response) => {
            eprintln!("shutdown rejected: {}", response.status());
            EXIT_FATAL
        }
        Err(e) => {
            eprintln!("no running flotilla at {base}: {e}");
            EXIT_FATAL
        }
    }
}

async fn status(cli: &Cli) -> u8 {
    let base = match admin_base(cli) {
        Ok(base) => base,
        Err(code) => return code,
    };
    let rows: Vec<StatusRow> = match fetch_json(&format!("{base}/status")).await {
        Ok(rows) => rows,
        Err(message) => {
            eprintln!("{message}");
            return EXIT_FATAL;
        }
    };

    println!(
        "{:<32} {:<12} {:<22} {:>8} {:>9}  {}",
        "NAME", "STATE", "ENDPOINT", "UPTIME", "RESTARTS", "LAST EVENT"
    );
    for row in rows {
        println!(
            "{:<32} {:<12} {:<22} {:>7}s {:>9}  {}",
            row.name,
            row.state.to_string(),
            row.endpoint,
            row.uptime_seconds,
            row.restart_count,
            row.last_event.unwrap_or_default()
        );
    }
    EXIT_OK
}

async fn test(cli: &Cli) -> u8 {
    // Validation runs locally even when no fleet is up.
    let manifest = match flotilla::config::load(&cli.config, &cli.profile) {
        Ok(manifest) => manifest,
        Err(e) => {
            eprintln!("config error: {e}");
            return EXIT_CONFIG;
        }
    };
    let issues = flotilla::config::validate(&manifest);
    for issue in &issues {
        eprintln!("[{:?}] {}", issue.severity, issue.message);
    }
    if issues
        .iter()
        .any(|i| i.severity == flotilla::config::IssueSeverity::Error)
    {
        return EXIT_CONFIG;
    }

    let base = format!("http://127.0.0.1:{}", manifest.settings.admin_port);
    let results: Vec<SmokeResult> = match reqwest::Client::new()
        .post(format!("{base}/smoke"))
        .send()
        .await
    {
        Ok(response) => match response.json().await {
            Ok(results) => results,
            Err(e) => {
                eprintln!("malformed smoke response: {e}");
                return EXIT_FATAL;
            }
        },
        Err(e) => {
            eprintln!("no running flotilla at {base}: {e}");
            return EXIT_FATAL;
        }
    };

    let mut failed = false;
    for result in &results {
        let verdict = if result.passed { "pass" } else { "FAIL" };
        println!("{verdict}  {:<20} {}", result.capability, result.detail);
        failed |= !result.passed;
    }
    if failed {
        EXIT_FATAL
    } else {
        EXIT_OK
    }
}

async fn reload_config(cli: &Cli) -> u8 {
    let base = match admin_base(cli) {
        Ok(base) => base,
        Err(code) => return code,
    };
    match reqwest::Client::new()
        .post(format!("{base}/reload"))
        .send()
        .await
    {
        Ok(response) => {
            let status = response.status();
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            if status.is_success() {
                println!("reload applied: {body}");
                EXIT_OK
            } else {
                eprintln!("reload rejected: {body}");
                EXIT_CONFIG
            }
        }
        Err(e) => {
            eprintln!("no running flotilla at {base}: {e}");
            EXIT_FATAL
        }
    }
}

async fn fetch_json<T: serde::de::DeserializeOwned>(url: &str) -> Result<T, String> {
    reqwest::Client::new()
        .get(url)
        .send()
        .await
        .map_err(|e| format!("request to {url} failed: {e}"))?
        .json()
        .await
        .map_err(|e| format!("malformed response from {url}: {e}"))
}
