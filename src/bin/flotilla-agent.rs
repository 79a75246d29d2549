//! Generic fleet agent binary
//!
//! Runs the shared runtime harness with an echo handler: answers any task
//! with its payload and kind. Supervised fleets, smoke tests, and examples
//! use this as a stand-in for real capability agents; domain agents link the
//! same harness with their own [`AgentHandler`].

use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use flotilla::coordinator::TaskRequest;
use flotilla::domain_types::CapabilityName;
use flotilla::runtime::{self, AgentArgs, AgentError, AgentHandler, RuntimeConfig};

#[derive(Parser)]
#[command(name = "flotilla-agent", version, about = "Generic flotilla fleet agent")]
struct Cli {
    /// Agent name (falls back to AGENT_NAME)
    #[arg(long)]
    name: Option<String>,

    /// Request port (falls back to AGENT_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Health port (falls back to HEALTH_CHECK_PORT)
    #[arg(long)]
    health_port: Option<u16>,

    /// Registry base URL (falls back to REGISTRY_ENDPOINT)
    #[arg(long)]
    registry_endpoint: Option<String>,

    /// Error bus base URL (falls back to ERROR_BUS_ENDPOINT)
    #[arg(long)]
    error_bus_endpoint: Option<String>,

    /// Capability tags to serve
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// Optional agent config file
    #[arg(long)]
    config_file: Option<PathBuf>,
}

struct EchoHandler;

#[async_trait]
impl AgentHandler for EchoHandler {
    async fn handle(&self, request: TaskRequest) -> Result<Value, AgentError> {
        Ok(json!({
            "kind": request.kind.to_string(),
            "echo": request.payload,
            "trace_id": request.trace_id,
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    flotilla::observability::init_tracing("flotilla=info");
    let cli = Cli::parse();

    let args = AgentArgs {
        name: cli.name,
        port: cli.port,
        health_port: cli.health_port,
        registry_endpoint: cli.registry_endpoint,
        error_bus_endpoint: cli.error_bus_endpoint,
        config_file: cli.config_file,
    };
    let mut config = RuntimeConfig::resolve(&args)?;
    if !cli.capabilities.is_empty() {
        config.capabilities = cli
            .capabilities
            .into_iter()
            .filter_map(|c| CapabilityName::try_new(c).ok())
            .collect();
    }

    runtime::run(config, Arc::new(EchoHandler)).await?;
    Ok(())
}
