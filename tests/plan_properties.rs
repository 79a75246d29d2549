//! Property tests for the dependency engine
//!
//! For every valid manifest the planner must produce batches where no agent
//! depends on a later batch, cover exactly the eager agents, and replan to an
//! identical order. Cyclic graphs must be rejected naming the participants.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use flotilla::config::{
    AgentSpec, GlobalSettings, HealthProtocol, Manifest, ResourceHints, RestartPolicy,
};
use flotilla::domain_types::{
    AgentName, AutoloadMode, CapabilityName, HostClass, PortNumber, StartupPriority,
};
use flotilla::plan::{plan, PlanError};

fn agent_name(index: usize) -> AgentName {
    AgentName::try_new(format!("agent-{index:02}")).unwrap()
}

fn spec(index: usize, dependencies: Vec<AgentName>, priority: u16) -> Arc<AgentSpec> {
    Arc::new(AgentSpec {
        name: agent_name(index),
        host_class: if index % 2 == 0 {
            HostClass::MainPc
        } else {
            HostClass::Pc2
        },
        port: PortNumber::try_new(7300 + index as u16).unwrap(),
        health_port: PortNumber::try_new(8300 + index as u16).unwrap(),
        launch_cmd: vec!["flotilla-agent".to_string()],
        required: true,
        autoload: AutoloadMode::Eager,
        dependencies,
        capabilities: vec![CapabilityName::try_new("stt".to_string()).unwrap()],
        resource_hints: ResourceHints::default(),
        restart_policy: RestartPolicy::default(),
        health_protocol: HealthProtocol::UnifiedV1,
        startup_priority: StartupPriority::new(priority),
    })
}

fn manifest_from(agents: BTreeMap<AgentName, Arc<AgentSpec>>) -> Manifest {
    Manifest {
        profile: "core".to_string(),
        settings: Arc::new(GlobalSettings::default()),
        agents,
    }
}

/// Forward-only dependency masks always form a DAG.
fn dag_manifest(masks: &[u64], priorities: &[u16]) -> Manifest {
    let mut agents = BTreeMap::new();
    for (index, mask) in masks.iter().enumerate() {
        let dependencies: Vec<AgentName> = (0..index)
            .filter(|earlier| mask & (1 << (earlier % 64)) != 0)
            .map(agent_name)
            .collect();
        let priority = priorities.get(index).copied().unwrap_or(100);
        agents.insert(agent_name(index), spec(index, dependencies, priority));
    }
    manifest_from(agents)
}

proptest! {
    #[test]
    fn dag_always_plans_and_respects_dependencies(
        masks in proptest::collection::vec(any::<u64>(), 1..12),
        priorities in proptest::collection::vec(any::<u16>(), 1..12),
    ) {
        let manifest = dag_manifest(&masks, &priorities);
        let startup = plan(&manifest).expect("a forward-only graph is a DAG");

        // Exactly the eager agents, each exactly once.
        let flattened = startup.flattened();
        prop_assert_eq!(flattened.len(), manifest.agents.len());

        // No agent in batch i depends on an agent in batch j >= i.
        for name in &flattened {
            let own_batch = startup.batch_of(name).unwrap();
            for dep in &manifest.get(name).unwrap().dependencies {
                let dep_batch = startup.batch_of(dep).unwrap();
                prop_assert!(
                    dep_batch < own_batch,
                    "{} (batch {}) depends on {} (batch {})",
                    name, own_batch, dep, dep_batch
                );
            }
        }
    }

    #[test]
    fn replanning_is_deterministic(
        masks in proptest::collection::vec(any::<u64>(), 1..12),
        priorities in proptest::collection::vec(any::<u16>(), 1..12),
    ) {
        let manifest = dag_manifest(&masks, &priorities);
        let first = plan(&manifest).unwrap();
        let second = plan(&manifest).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn serialized_plan_round_trips(
        masks in proptest::collection::vec(any::<u64>(), 1..10),
    ) {
        let priorities = vec![100u16; masks.len()];
        let manifest = dag_manifest(&masks, &priorities);
        let startup = plan(&manifest).unwrap();
        let json = serde_json::to_string(&startup).unwrap();
        let back: flotilla::StartupPlan = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(startup, back);
    }
}

#[test]
fn two_cycle_is_rejected() {
    let mut agents = BTreeMap::new();
    agents.insert(agent_name(0), spec(0, vec![agent_name(1)], 100));
    agents.insert(agent_name(1), spec(1, vec![agent_name(0)], 100));
    let manifest = manifest_from(agents);

    match plan(&manifest) {
        Err(PlanError::Cycle { participants }) => {
            assert!(participants.contains(&agent_name(0)));
            assert!(participants.contains(&agent_name(1)));
        }
        other => panic!("expected cycle error, got {other:?}"),
    }
}

#[test]
fn priority_orders_within_a_batch() {
    let mut agents = BTreeMap::new();
    agents.insert(agent_name(0), spec(0, Vec::new(), 200));
    agents.insert(agent_name(1), spec(1, Vec::new(), 50));
    agents.insert(agent_name(2), spec(2, Vec::new(), 50));
    let manifest = manifest_from(agents);

    let startup = plan(&manifest).unwrap();
    assert_eq!(startup.batches.len(), 1);
    let batch = &startup.batches[0];
    // Priority 50 first (name tie-break within), then 200.
    assert_eq!(batch[0], agent_name(1));
    assert_eq!(batch[1], agent_name(2));
    assert_eq!(batch[2], agent_name(0));
}
