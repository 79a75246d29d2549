//! Fleet end-to-end: real orchestrator, real agent processes
//!
//! Boots the core services on test ports, launches the generic agent binary
//! as a supervised fleet, routes requests through the coordinator's HTTP
//! surface, exercises the lazy load path, and verifies a clean stop.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use flotilla::domain_types::{AgentName, AgentState};
use flotilla::orchestrator::Orchestrator;

fn agent_bin() -> &'static str {
    env!("CARGO_BIN_EXE_flotilla-agent")
}

fn fleet_config() -> String {
    format!(
        r#"
global_settings:
  registry_port: 7461
  coordinator_port: 7462
  admin_port: 7463
  hub_port: 8461
  snapshot_path: {{snapshot}}
  lease_ttl_ms: 5000
  probes:
    start_probe_interval_ms: 200
    steady_interval_ms: 500
    probe_budget_ms: 1000
  supervisor:
    startup_grace_ms: 20000
    drain_timeout_ms: 3000
  coordinator:
    default_deadline_ms: 10000
    lazy_wait_ms: 25000
agents:
  stt-base:
    host_class: main_pc
    port: 7471
    health_port: 8471
    launch_cmd: ["{bin}", "--capability", "stt"]
    required: true
    capabilities: [stt]
  tts-upper:
    host_class: main_pc
    port: 7472
    health_port: 8472
    launch_cmd: ["{bin}", "--capability", "tts"]
    required: true
    dependencies: [stt-base]
    capabilities: [tts]
  vision-lazy:
    host_class: pc2
    port: 7473
    health_port: 8473
    launch_cmd: ["{bin}", "--capability", "vision"]
    autoload: on_demand
    capabilities: [vision]
profiles:
  core: {{}}
"#,
        bin = agent_bin(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cold_boot_route_lazy_load_and_clean_stop() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("registry.snapshot.json");
    let config_path = dir.path().join("flotilla.yaml");
    let doc = fleet_config().replace("{snapshot}", &snapshot.display().to_string());
    std::fs::write(&config_path, doc).unwrap();

    let orchestrator = Arc::new(
        Orchestrator::bootstrap(&config_path, "core")
            .await
            .expect("bootstrap"),
    );

    // Cold boot: both required agents reach Ready, in dependency order.
    tokio::time::timeout(Duration::from_secs(45), orchestrator.start_fleet())
        .await
        .expect("startup within grace")
        .expect("fleet starts");

    let status = orchestrator.status().await;
    for name in ["stt-base", "tts-upper"] {
        let row = status
            .iter()
            .find(|r| r.name.as_str() == name)
            .unwrap_or_else(|| panic!("{name} missing from status"));
        assert_eq!(row.state, AgentState::Ready, "{name} not ready");
    }

    // Route a task through the coordinator's HTTP surface.
    let client = reqwest::Client::new();
    let response: serde_json::Value = client
        .post("http://127.0.0.1:7462/task")
        .json(&json!({
            "kind": "stt",
            "payload": { "audio_ref": "clip-7" },
            "deadline_ms": 8000,
            "source": "e2e"
        }))
        .send()
        .await
        .expect("coordinator reachable")
        .json()
        .await
        .expect("json response");
    assert_eq!(response["outcome"], "completed", "response: {response}");
    assert_eq!(response["target"], "stt-base");

    // First vision request triggers the lazy loader; the on_demand agent
    // comes up within the SLA and serves it.
    let response: serde_json::Value = client
        .post("http://127.0.0.1:7462/task")
        .json(&json!({
            "kind": "vision",
            "payload": { "frame_ref": "cam-1" },
            "deadline_ms": 28000,
            "source": "e2e"
        }))
        .send()
        .await
        .expect("coordinator reachable")
        .json()
        .await
        .expect("json response");
    assert_eq!(response["outcome"], "completed", "response: {response}");
    assert_eq!(response["target"], "vision-lazy");

    // A second vision request bypasses the load path (already Ready).
    let vision = AgentName::try_new("vision-lazy".to_string()).unwrap();
    let row = orchestrator
        .status()
        .await
        .into_iter()
        .find(|r| r.name == vision)
        .expect("vision registered");
    assert_eq!(row.state, AgentState::Ready);

    // Smoke test passes for every required capability.
    let smoke = orchestrator.smoke_test().await;
    assert!(
        smoke.iter().all(|r| r.passed),
        "smoke failures: {smoke:?}"
    );

    // Clean stop: reverse order, every record ends Stopped.
    tokio::time::timeout(Duration::from_secs(30), orchestrator.stop())
        .await
        .expect("stop completes");
    let status = orchestrator.status().await;
    for row in &status {
        assert!(
            matches!(row.state, AgentState::Stopped | AgentState::Stopping),
            "{} ended in {:?}",
            row.name,
            row.state
        );
    }

    // The snapshot file survived for the next cold start.
    assert!(snapshot.exists());
}
