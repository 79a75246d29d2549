//! Dependency engine: topological startup planning
//!
//! Turns a validated [`Manifest`] into a [`StartupPlan`]: an ordered list of
//! batches where no agent depends on anything in a later batch and no two
//! agents in one batch depend on each other. Kahn's algorithm, with a stable
//! tie-break by declared startup priority then name.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

use crate::config::Manifest;
use crate::domain_types::{AgentName, AutoloadMode};
use crate::error::{Classified, ErrorKind};

/// Errors raised at plan time
#[derive(Debug, Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle
    #[error("dependency cycle among: {}", participants.iter().map(AgentName::as_str).collect::<Vec<_>>().join(", "))]
    Cycle {
        /// Agents participating in (or downstream of) the cycle
        participants: Vec<AgentName>,
    },

    /// A dependency is missing from the manifest
    ///
    /// The loader already rejects this; the engine re-checks so a plan can
    /// never be built from an unvalidated manifest.
    #[error("agent '{agent}' depends on '{dependency}', which is not in the manifest")]
    MissingDependency {
        /// Dependent agent
        agent: AgentName,
        /// Missing name
        dependency: AgentName,
    },

    /// The named agent is not in the manifest at all
    #[error("agent '{name}' is not in the manifest")]
    UnknownAgent {
        /// Requested name
        name: AgentName,
    },
}

impl Classified for PlanError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Plan
    }
}

/// One startup batch: agents with no dependency on any later batch
pub type Batch = Vec<AgentName>;

/// Ordered batches produced by [`plan`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupPlan {
    /// Batches in start order
    pub batches: Vec<Batch>,
}

impl StartupPlan {
    /// All planned agents in start order, flattened
    #[must_use]
    pub fn flattened(&self) -> Vec<AgentName> {
        self.batches.iter().flatten().cloned().collect()
    }

    /// Batches in reverse order for shutdown
    #[must_use]
    pub fn shutdown_batches(&self) -> Vec<Batch> {
        self.batches.iter().rev().cloned().collect()
    }

    /// Zero-based batch index of an agent, if planned
    #[must_use]
    pub fn batch_of(&self, name: &AgentName) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.contains(name))
    }

    /// Total number of planned agents
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

/// Computes the eager startup plan for a manifest
///
/// On_demand agents are excluded from batches entirely; they are started by
/// the lazy loader via [`load_order`]. The batch order is deterministic:
/// re-planning an equivalent manifest yields an identical plan.
///
/// # Errors
/// Returns [`PlanError::Cycle`] naming the participants when the graph is
/// not a DAG, or [`PlanError::MissingDependency`] on a dangling edge.
pub fn plan(manifest: &Manifest) -> Result<StartupPlan, PlanError> {
    let eager: BTreeSet<&AgentName> = manifest
        .eager_specs()
        .map(|spec| &spec.name)
        .collect();

    // Edges restricted to the eager universe; the loader guarantees eager
    // agents never depend on on_demand ones.
    let mut in_degree: BTreeMap<&AgentName, usize> = eager.iter().map(|n| (*n, 0)).collect();
    let mut dependents: BTreeMap<&AgentName, Vec<&AgentName>> = BTreeMap::new();

    for name in &eager {
        let spec = manifest
            .get(name)
            .ok_or_else(|| PlanError::UnknownAgent { name: (*name).clone() })?;
        for dep in &spec.dependencies {
            let Some((dep_key, _)) = manifest.agents.get_key_value(dep) else {
                return Err(PlanError::MissingDependency {
                    agent: (*name).clone(),
                    dependency: dep.clone(),
                });
            };
            if eager.contains(dep_key) {
                *in_degree.entry(name).or_insert(0) += 1;
                dependents.entry(dep_key).or_default().push(name);
            }
        }
    }

    let mut batches: Vec<Batch> = Vec::new();
    let mut frontier: Vec<&AgentName> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut placed = 0usize;

    while !frontier.is_empty() {
        // Stable order within the batch: priority first, then name.
        frontier.sort_by(|a, b| {
            let pa = manifest.get(a).map(|s| s.startup_priority);
            let pb = manifest.get(b).map(|s| s.startup_priority);
            pa.cmp(&pb).then_with(|| a.cmp(b))
        });

        let batch: Batch = frontier.iter().map(|n| (*n).clone()).collect();
        placed += batch.len();

        let mut next: Vec<&AgentName> = Vec::new();
        for name in frontier.drain(..) {
            if let Some(children) = dependents.get(name) {
                for child in children {
                    let degree = in_degree
                        .get_mut(*child)
                        .expect("every dependent is in the eager universe");
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(child);
                    }
                }
            }
        }

        batches.push(batch);
        frontier = next;
    }

    if placed != eager.len() {
        let stuck: Vec<AgentName> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(n, _)| (*n).clone())
            .collect();
        return Err(PlanError::Cycle {
            participants: stuck,
        });
    }

    Ok(StartupPlan { batches })
}

/// Computes the ordered set of agents that must start so `name` can run
///
/// Used by the lazy loader: the result lists every not-yet-planned
/// dependency of `name` (transitively, on_demand ones included) in a valid
/// start order, ending with `name` itself. Honors the same partial order as
/// [`plan`].
///
/// # Errors
/// Returns [`PlanError::UnknownAgent`] for names outside the manifest and
/// [`PlanError::Cycle`] when the dependency closure is cyclic.
pub fn load_order(manifest: &Manifest, name: &AgentName) -> Result<Vec<AgentName>, PlanError> {
    if manifest.get(name).is_none() {
        return Err(PlanError::UnknownAgent { name: name.clone() });
    }

    // Depth-first postorder over the dependency closure with a grey set for
    // cycle detection.
    let mut order: Vec<AgentName> = Vec::new();
    let mut done: BTreeSet<AgentName> = BTreeSet::new();
    let mut grey: BTreeSet<AgentName> = BTreeSet::new();
    let mut stack: VecDeque<(AgentName, bool)> = VecDeque::new();
    stack.push_back((name.clone(), false));

    while let Some((current, expanded)) = stack.pop_back() {
        if done.contains(&current) {
            continue;
        }
        if expanded {
            grey.remove(&current);
            done.insert(current.clone());
            order.push(current);
            continue;
        }
        if grey.contains(&current) {
            return Err(PlanError::Cycle {
                participants: grey.into_iter().collect(),
            });
        }
        grey.insert(current.clone());
        stack.push_back((current.clone(), true));

        let spec = manifest
            .get(&current)
            .ok_or_else(|| PlanError::MissingDependency {
                agent: name.clone(),
                dependency: current.clone(),
            })?;
        // Deterministic expansion order mirrors the declared order.
        for dep in spec.dependencies.iter().rev() {
            if !done.contains(dep) {
                stack.push_back((dep.clone(), false));
            }
        }
    }

    Ok(order)
}

/// Whether the agent is eligible for lazy loading under this manifest
#[must_use]
pub fn is_on_demand(manifest: &Manifest, name: &AgentName) -> bool {
    manifest
        .get(name)
        .is_some_and(|spec| spec.autoload == AutoloadMode::OnDemand)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_str;

    fn chain_config(n: usize) -> String {
        // a1 <- a2 <- ... <- aN
        let mut doc = String::from(
            "agents:\n",
        );
        for i in 1..=n {
            doc.push_str(&format!(
                "  a{i}:\n    host_class: main_pc\n    port: {}\n    health_port: {}\n    launch_cmd: [agent]\n    required: true\n    capabilities: [stt]\n",
                7200 + i,
                8200 + i
            ));
            if i > 1 {
                doc.push_str(&format!("    dependencies: [a{}]\n", i - 1));
            }
        }
        doc.push_str("profiles:\n  core:\n    include_capabilities: [stt]\n");
        doc
    }

    #[test]
    fn chain_yields_singleton_batches() {
        let manifest = load_str(&chain_config(24), "core").unwrap();
        let plan = plan(&manifest).unwrap();
        assert_eq!(plan.batches.len(), 24);
        assert!(plan.batches.iter().all(|b| b.len() == 1));
        assert_eq!(plan.batches[0][0].as_str(), "a1");
        assert_eq!(plan.batches[23][0].as_str(), "a24");
    }

    #[test]
    fn independent_agents_share_one_batch() {
        let doc = r#"
agents:
  alpha:
    host_class: main_pc
    port: 7201
    health_port: 8201
    launch_cmd: [agent]
    required: true
    capabilities: [stt]
  beta:
    host_class: main_pc
    port: 7202
    health_port: 8202
    launch_cmd: [agent]
    required: true
    capabilities: [tts]
profiles:
  core: {}
"#;
        let manifest = load_str(doc, "core").unwrap();
        let plan = plan(&manifest).unwrap();
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].len(), 2);
    }

    #[test]
    fn priority_breaks_ties_before_name() {
        let doc = r#"
agents:
  zeta:
    host_class: main_pc
    port: 7201
    health_port: 8201
    launch_cmd: [agent]
    required: true
    startup_priority: 1
    capabilities: [stt]
  alpha:
    host_class: main_pc
    port: 7202
    health_port: 8202
    launch_cmd: [agent]
    required: true
    capabilities: [tts]
profiles:
  core: {}
"#;
        let manifest = load_str(doc, "core").unwrap();
        let plan = plan(&manifest).unwrap();
        assert_eq!(plan.batches[0][0].as_str(), "zeta");
        assert_eq!(plan.batches[0][1].as_str(), "alpha");
    }

    #[test]
    fn cycle_is_rejected_naming_participants() {
        let doc = r#"
agents:
  a:
    host_class: main_pc
    port: 7201
    health_port: 8201
    launch_cmd: [agent]
    required: true
    dependencies: [c]
    capabilities: [stt]
  b:
    host_class: main_pc
    port: 7202
    health_port: 8202
    launch_cmd: [agent]
    required: true
    dependencies: [a]
    capabilities: [stt]
  c:
    host_class: main_pc
    port: 7203
    health_port: 8203
    launch_cmd: [agent]
    required: true
    dependencies: [b]
    capabilities: [stt]
profiles:
  core: {}
"#;
        let manifest = load_str(doc, "core").unwrap();
        let err = plan(&manifest).unwrap_err();
        match err {
            PlanError::Cycle { participants } => {
                let names: Vec<&str> = participants.iter().map(AgentName::as_str).collect();
                assert!(names.contains(&"a"));
                assert!(names.contains(&"b"));
                assert!(names.contains(&"c"));
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn on_demand_excluded_from_batches() {
        let doc = r#"
agents:
  eager-one:
    host_class: main_pc
    port: 7201
    health_port: 8201
    launch_cmd: [agent]
    required: true
    capabilities: [stt]
  lazy-one:
    host_class: main_pc
    port: 7202
    health_port: 8202
    launch_cmd: [agent]
    autoload: on_demand
    capabilities: [vision]
profiles:
  core: {}
"#;
        let manifest = load_str(doc, "core").unwrap();
        let plan = plan(&manifest).unwrap();
        assert_eq!(plan.agent_count(), 1);
        let lazy = AgentName::try_new("lazy-one".to_string()).unwrap();
        assert_eq!(plan.batch_of(&lazy), None);
    }

    #[test]
    fn load_order_ends_with_target() {
        let doc = r#"
agents:
  base:
    host_class: main_pc
    port: 7201
    health_port: 8201
    launch_cmd: [agent]
    autoload: on_demand
    capabilities: [stt]
  mid:
    host_class: main_pc
    port: 7202
    health_port: 8202
    launch_cmd: [agent]
    autoload: on_demand
    dependencies: [base]
    capabilities: [tts]
  top:
    host_class: main_pc
    port: 7203
    health_port: 8203
    launch_cmd: [agent]
    autoload: on_demand
    dependencies: [mid]
    capabilities: [vision]
profiles:
  core: {}
"#;
        let manifest = load_str(doc, "core").unwrap();
        let top = AgentName::try_new("top".to_string()).unwrap();
        let order = load_order(&manifest, &top).unwrap();
        let names: Vec<&str> = order.iter().map(AgentName::as_str).collect();
        assert_eq!(names, vec!["base", "mid", "top"]);
    }

    #[test]
    fn replan_is_stable() {
        let manifest = load_str(&chain_config(8), "core").unwrap();
        let first = plan(&manifest).unwrap();
        let serialized = serde_json::to_string(&first).unwrap();
        let second = plan(&manifest).unwrap();
        assert_eq!(serialized, serde_json::to_string(&second).unwrap());
    }

    #[test]
    fn shutdown_batches_reverse() {
        let manifest = load_str(&chain_config(3), "core").unwrap();
        let plan = plan(&manifest).unwrap();
        let down = plan.shutdown_batches();
        assert_eq!(down[0][0].as_str(), "a3");
        assert_eq!(down[2][0].as_str(), "a1");
    }
}
