//! Build-time structural validation of workflow graphs.
//!
//! Runs after the builder has grouped edges into transitions. Reachability
//! and cycle analysis use petgraph over the static edge set (every branch a
//! conditional or fan-out transition could ever take).

use std::collections::HashMap;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use thiserror::Error;

use super::graph::{GraphDefinition, Target, Transition};

/// A graph that cannot be built. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid graph '{graph}': {kind}")]
pub struct ValidationError {
    pub graph: String,
    pub kind: ValidationErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationErrorKind {
    #[error("graph has no steps")]
    Empty,

    #[error("entry step is missing or unknown: {0:?}")]
    MissingEntry(Option<String>),

    #[error("step '{0}' registered more than once")]
    DuplicateStep(String),

    #[error("edge '{from}' -> '{to}' references an unknown step")]
    DanglingEdge { from: String, to: String },

    #[error("step '{0}' is unreachable from the entry step")]
    UnreachableStep(String),

    #[error("steps {0:?} form a cycle of unconditional edges that can never terminate")]
    CycleWithoutProgress(Vec<String>),

    #[error("conditional edge from '{step}' leaves branch {branch} unmapped")]
    UnmappedBranch { step: String, branch: String },

    #[error("step '{0}' mixes conditional or fan-out routing with other outgoing edges")]
    ConflictingTransition(String),

    #[error("interrupt point names unknown step '{0}'")]
    UnknownInterruptStep(String),
}

/// Check every structural invariant of an assembled definition.
pub(crate) fn check(def: &GraphDefinition) -> Result<(), ValidationErrorKind> {
    check_targets(def)?;
    check_interrupts(def)?;
    check_topology(def)?;
    warn_self_routes(def);
    Ok(())
}

fn check_targets(def: &GraphDefinition) -> Result<(), ValidationErrorKind> {
    for from in def.step_names() {
        let Some(transition) = def.transition(from) else {
            continue;
        };

        for target in transition.targets() {
            if let Target::Step(to) = &target {
                if !def.contains(to) {
                    return Err(ValidationErrorKind::DanglingEdge {
                        from: from.to_string(),
                        to: to.clone(),
                    });
                }
            }
        }

        if let Transition::Conditional { unmapped, .. } = transition {
            if let Some(branch) = unmapped.first() {
                return Err(ValidationErrorKind::UnmappedBranch {
                    step: from.to_string(),
                    branch: branch.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_interrupts(def: &GraphDefinition) -> Result<(), ValidationErrorKind> {
    match def.interrupts().steps().find(|s| !def.contains(s)) {
        Some(unknown) => Err(ValidationErrorKind::UnknownInterruptStep(unknown.to_string())),
        None => Ok(()),
    }
}

fn check_topology(def: &GraphDefinition) -> Result<(), ValidationErrorKind> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let nodes: HashMap<&str, NodeIndex> = def
        .step_names()
        .map(|name| (name, graph.add_node(name)))
        .collect();

    for from in def.step_names() {
        for target in def.successors(from) {
            if let Some(to) = target.step_name() {
                if let (Some(&a), Some(&b)) = (nodes.get(from), nodes.get(to)) {
                    graph.add_edge(a, b, ());
                }
            }
        }
    }

    // Reachability from the entry step.
    if let Some(&entry) = nodes.get(def.entry()) {
        let mut visited = vec![false; graph.node_count()];
        let mut dfs = Dfs::new(&graph, entry);
        while let Some(node) = dfs.next(&graph) {
            visited[node.index()] = true;
        }
        if let Some(name) = def
            .step_names()
            .find(|name| nodes.get(name).is_some_and(|idx| !visited[idx.index()]))
        {
            return Err(ValidationErrorKind::UnreachableStep(name.to_string()));
        }
    }

    // A strongly connected component whose members only have unconditional
    // edges re-enters itself on every pass: some branch of the union route
    // always stays inside the cycle.
    for component in tarjan_scc(&graph) {
        let cyclic = component.len() > 1
            || component
                .first()
                .is_some_and(|&n| graph.contains_edge(n, n));
        if !cyclic {
            continue;
        }

        let all_direct = component.iter().all(|&n| {
            def.transition(graph[n])
                .is_some_and(Transition::is_direct)
        });
        if all_direct {
            let mut names: Vec<String> = component.iter().map(|&n| graph[n].to_string()).collect();
            names.sort();
            return Err(ValidationErrorKind::CycleWithoutProgress(names));
        }
    }

    Ok(())
}

fn warn_self_routes(def: &GraphDefinition) {
    for from in def.step_names() {
        if let Some(Transition::Conditional { branches, .. }) = def.transition(from) {
            for (label, target) in branches {
                if target.step_name() == Some(from) {
                    tracing::warn!(
                        graph = def.name(),
                        step = from,
                        branch = label.as_str(),
                        "conditional edge routes a step back to itself; the step must change state to make progress"
                    );
                }
            }
        }
    }
}
