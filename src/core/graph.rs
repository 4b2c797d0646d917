//! Step definitions and the dependency graph between them.
//!
//! The graph is static for a release: steps are registered once, validated by
//! `finalize()`, and then only queried. Readiness is a pure function of the
//! step records so the orchestrator can recompute it after every transition.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::domain::{StepExecutionRecord, StepStatus};

use super::error::GraphError;
use super::run_store::hash_input;

/// What a step does when executed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum StepAction {
    /// Check the requested version against the version ledger
    ValidateVersion,

    /// Create the preparation branch off the release branch
    CreateBranch,

    /// Cherry-pick the requested commits onto the preparation branch
    CherryPick,

    /// Collect change records since the previous release tag
    CollectChanges,

    /// Render changelog and manifest files and commit them
    RenderArtifacts,

    /// Create the annotated release tag
    Tag,

    /// Push the release branch and tag
    Push,

    /// Record the version in the version ledger
    CommitVersion,

    /// Trigger an external workflow and wait for it
    Publish { workflow: String },

    /// Cherry-pick the release commit onto another branch
    Backport { target_branch: String },
}

impl StepAction {
    /// Executing this action freezes the release manifest
    pub fn freezes_manifest(&self) -> bool {
        matches!(self, Self::Tag)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::ValidateVersion => "validate_version",
            Self::CreateBranch => "create_branch",
            Self::CherryPick => "cherry_pick",
            Self::CollectChanges => "collect_changes",
            Self::RenderArtifacts => "render_artifacts",
            Self::Tag => "tag",
            Self::Push => "push",
            Self::CommitVersion => "commit_version",
            Self::Publish { .. } => "publish",
            Self::Backport { .. } => "backport",
        }
    }
}

/// A single checklist item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within the graph)
    pub name: String,

    /// Names of steps that must succeed (or be skipped) first
    pub dependencies: Vec<String>,

    pub action: StepAction,

    /// Identifies this step's side effect; format "{name}:{hash16}"
    pub idempotency_key: String,
}

impl Step {
    /// Create a step; the idempotency key is derived from name, action and scope
    ///
    /// `scope` should identify what the side effect applies to (typically
    /// the release version) so the same step for another release gets a
    /// different key.
    pub fn new(name: impl Into<String>, action: StepAction, scope: &str) -> Self {
        let name = name.into();
        let material = format!("{}|{:?}|{}", name, action, scope);
        let idempotency_key = format!("{}:{}", name, hash_input(&material));
        Self {
            name,
            dependencies: Vec::new(),
            action,
            idempotency_key,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}

/// Dependency-aware, ordered set of release steps
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    /// Steps in registration order
    steps: Vec<Step>,

    /// Step name -> registration index
    index: HashMap<String, usize>,

    finalized: bool,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step whose dependencies are already registered
    pub fn add_step(&mut self, step: Step) -> Result<(), GraphError> {
        for dep in &step.dependencies {
            if !self.index.contains_key(dep) {
                return Err(GraphError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        self.declare(step)
    }

    /// Register a step without checking dependencies yet (two-pass
    /// registration); `finalize()` validates them
    pub fn declare(&mut self, step: Step) -> Result<(), GraphError> {
        if self.finalized {
            return Err(GraphError::AlreadyFinalized);
        }
        if self.index.contains_key(&step.name) {
            return Err(GraphError::DuplicateStep(step.name));
        }
        self.index.insert(step.name.clone(), self.steps.len());
        self.steps.push(step);
        Ok(())
    }

    /// Validate dependencies and acyclicity
    pub fn finalize(&mut self) -> Result<(), GraphError> {
        for step in &self.steps {
            for dep in &step.dependencies {
                if !self.index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(GraphError::CycleDetected { cycle });
        }

        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Steps in registration order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps whose dependencies are all terminal-success and whose own record
    /// is pending, in registration order
    ///
    /// A step with no record is treated as pending.
    pub fn ready_steps(&self, records: &BTreeMap<String, StepExecutionRecord>) -> Vec<String> {
        let status_of = |name: &str| {
            records
                .get(name)
                .map(|r| r.status)
                .unwrap_or(StepStatus::Pending)
        };

        self.steps
            .iter()
            .filter(|step| status_of(&step.name) == StepStatus::Pending)
            .filter(|step| {
                step.dependencies
                    .iter()
                    .all(|dep| status_of(dep).is_terminal_success())
            })
            .map(|step| step.name.clone())
            .collect()
    }

    /// All steps that (transitively) depend on `name`, in registration order
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut found: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);

        while let Some(current) = queue.pop_front() {
            for step in &self.steps {
                if step.dependencies.iter().any(|d| d == current) && found.insert(step.name.as_str()) {
                    queue.push_back(step.name.as_str());
                }
            }
        }

        self.steps
            .iter()
            .filter(|s| found.contains(s.name.as_str()))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Find one dependency cycle, returned as a closed path of step names
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..self.steps.len()).map(|i| graph.add_node(i)).collect();

        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.dependencies {
                if let Some(&d) = self.index.get(dep) {
                    graph.add_edge(nodes[d], nodes[i], ());
                }
            }
        }

        for scc in tarjan_scc(&graph) {
            let self_loop = scc.len() == 1 && graph.contains_edge(scc[0], scc[0]);
            if scc.len() > 1 || self_loop {
                let mut members: Vec<usize> = scc.iter().map(|n| graph[*n]).collect();
                members.sort_unstable();
                return Some(self.trace_cycle(&members));
            }
        }

        None
    }

    /// Walk dependency edges inside a strongly connected component until a
    /// step repeats, yielding e.g. ["a", "c", "b", "a"]
    fn trace_cycle(&self, members: &[usize]) -> Vec<String> {
        let in_component: HashSet<usize> = members.iter().copied().collect();
        let mut path: Vec<usize> = vec![members[0]];
        let mut seen: HashSet<usize> = HashSet::from([members[0]]);

        loop {
            let current = path[path.len() - 1];
            let next = self.steps[current]
                .dependencies
                .iter()
                .filter_map(|d| self.index.get(d).copied())
                .find(|d| in_component.contains(d));

            let Some(next) = next else { break };
            if !seen.insert(next) {
                let start = path.iter().position(|&p| p == next).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|&i| self.steps[i].name.clone()).collect();
                cycle.push(self.steps[next].name.clone());
                return cycle;
            }
            path.push(next);
        }

        members.iter().map(|&i| self.steps[i].name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, deps: &[&str]) -> Step {
        deps.iter().fold(Step::new(name, StepAction::Push, "test"), |s, d| s.depends_on(*d))
    }

    fn records(entries: &[(&str, StepStatus)]) -> BTreeMap<String, StepExecutionRecord> {
        entries
            .iter()
            .map(|(name, status)| {
                let mut record = StepExecutionRecord::new(*name);
                record.status = *status;
                (name.to_string(), record)
            })
            .collect()
    }

    fn abc() -> StepGraph {
        let mut graph = StepGraph::new();
        graph.add_step(step("a", &[])).unwrap();
        graph.add_step(step("b", &[])).unwrap();
        graph.add_step(step("c", &["a", "b"])).unwrap();
        graph.finalize().unwrap();
        graph
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let mut graph = StepGraph::new();
        graph.add_step(step("a", &[])).unwrap();
        assert_eq!(
            graph.add_step(step("a", &[])),
            Err(GraphError::DuplicateStep("a".to_string()))
        );
    }

    #[test]
    fn test_unknown_dependency_rejected_on_add() {
        let mut graph = StepGraph::new();
        let err = graph.add_step(step("b", &["a"])).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { ref dependency, .. } if dependency == "a"));
    }

    #[test]
    fn test_two_pass_registration() {
        let mut graph = StepGraph::new();
        graph.declare(step("c", &["a"])).unwrap();
        graph.declare(step("a", &[])).unwrap();
        assert!(graph.finalize().is_ok());
        assert_eq!(graph.step_names().collect::<Vec<_>>(), vec!["c", "a"]);
    }

    #[test]
    fn test_deferred_unknown_dependency_fails_finalize() {
        let mut graph = StepGraph::new();
        graph.declare(step("a", &["ghost"])).unwrap();
        assert!(matches!(
            graph.finalize(),
            Err(GraphError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_detected_and_named() {
        let mut graph = StepGraph::new();
        graph.declare(step("a", &["c"])).unwrap();
        graph.declare(step("b", &["a"])).unwrap();
        graph.declare(step("c", &["b"])).unwrap();
        graph.declare(step("d", &[])).unwrap();

        match graph.finalize() {
            Err(GraphError::CycleDetected { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for name in ["a", "b", "c"] {
                    assert!(cycle.iter().any(|s| s == name));
                }
                assert!(!cycle.iter().any(|s| s == "d"));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut graph = StepGraph::new();
        graph.declare(step("a", &["a"])).unwrap();
        assert_eq!(
            graph.finalize(),
            Err(GraphError::CycleDetected {
                cycle: vec!["a".to_string(), "a".to_string()]
            })
        );
    }

    #[test]
    fn test_ready_steps_in_registration_order() {
        let graph = abc();
        let ready = graph.ready_steps(&records(&[
            ("a", StepStatus::Pending),
            ("b", StepStatus::Pending),
            ("c", StepStatus::Pending),
        ]));
        assert_eq!(ready, vec!["a", "b"]);
    }

    #[test]
    fn test_ready_steps_requires_terminal_success_dependencies() {
        let graph = abc();

        let partial = records(&[
            ("a", StepStatus::Succeeded),
            ("b", StepStatus::Running),
            ("c", StepStatus::Pending),
        ]);
        assert!(graph.ready_steps(&partial).is_empty());

        let failed = records(&[
            ("a", StepStatus::Succeeded),
            ("b", StepStatus::Failed),
            ("c", StepStatus::Pending),
        ]);
        assert!(graph.ready_steps(&failed).is_empty());

        let done = records(&[
            ("a", StepStatus::Succeeded),
            ("b", StepStatus::Skipped),
            ("c", StepStatus::Pending),
        ]);
        assert_eq!(graph.ready_steps(&done), vec!["c"]);
    }

    #[test]
    fn test_ready_steps_never_returns_unsatisfied_step() {
        let graph = abc();
        let statuses = [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Skipped,
        ];

        for a in statuses {
            for b in statuses {
                let recs = records(&[("a", a), ("b", b), ("c", StepStatus::Pending)]);
                for name in graph.ready_steps(&recs) {
                    let step = graph.step(&name).unwrap();
                    assert!(step
                        .dependencies
                        .iter()
                        .all(|d| recs[d].status.is_terminal_success()));
                }
            }
        }
    }

    #[test]
    fn test_transitive_dependents() {
        let mut graph = StepGraph::new();
        graph.add_step(step("a", &[])).unwrap();
        graph.add_step(step("b", &["a"])).unwrap();
        graph.add_step(step("c", &["b"])).unwrap();
        graph.add_step(step("d", &[])).unwrap();
        graph.finalize().unwrap();

        assert_eq!(graph.dependents_of("a"), vec!["b", "c"]);
        assert!(graph.dependents_of("d").is_empty());
    }

    #[test]
    fn test_idempotency_key_depends_on_scope() {
        let a = Step::new("tag-release", StepAction::Tag, "0.19.4");
        let b = Step::new("tag-release", StepAction::Tag, "0.19.5");
        assert!(a.idempotency_key.starts_with("tag-release:"));
        assert_ne!(a.idempotency_key, b.idempotency_key);
    }
}
