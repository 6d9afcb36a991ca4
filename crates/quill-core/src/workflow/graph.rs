//! Graph definition: named steps, transitions, entry point, interrupt points,
//! and field merge policies.
//!
//! Graphs are assembled with [`GraphBuilder`] and frozen into an immutable
//! [`GraphDefinition`] by [`GraphBuilder::build`], which runs every structural
//! check in [`super::validation`]. Conditional edges are generic over a
//! [`BranchKey`]; closed key types enumerate their values so a branch left
//! unmapped fails the build instead of surfacing at runtime.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use quill_types::checkpoint::Dispatch;
use quill_types::state::{FieldPolicies, MergePolicy, StateDocument};
use thiserror::Error;

use super::interrupt::InterruptPoints;
use super::step::{BoxStep, Step, StepOptions};
use super::validation::{self, ValidationError, ValidationErrorKind};

/// Terminal marker usable wherever a step name is expected.
pub const END: &str = "__end__";

// ---------------------------------------------------------------------------
// Targets and branch keys
// ---------------------------------------------------------------------------

/// Destination of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Step(String),
    End,
}

impl Target {
    pub fn step_name(&self) -> Option<&str> {
        match self {
            Target::Step(name) => Some(name),
            Target::End => None,
        }
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        if name == END {
            Target::End
        } else {
            Target::Step(name.to_string())
        }
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::from(name.as_str())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Step(name) => write!(f, "{name}"),
            Target::End => write!(f, "{END}"),
        }
    }
}

/// Value returned by a decision function to pick a conditional branch.
///
/// Closed key types (enums, `bool`) return every value from [`BranchKey::all`]
/// so the builder can reject graphs that leave one unmapped. Open key types
/// keep the default `None` and are checked when the decision runs.
pub trait BranchKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    fn all() -> Option<Vec<Self>> {
        None
    }
}

impl BranchKey for String {}

impl BranchKey for &'static str {}

impl BranchKey for bool {
    fn all() -> Option<Vec<Self>> {
        Some(vec![true, false])
    }
}

// ---------------------------------------------------------------------------
// Transitions and routes
// ---------------------------------------------------------------------------

type DecideFn = Arc<dyn Fn(&StateDocument) -> Result<Target, String> + Send + Sync>;
type DispatchFn = Arc<dyn Fn(&StateDocument) -> Vec<Dispatch> + Send + Sync>;

/// How a step hands control onward.
#[derive(Clone)]
pub(crate) enum Transition {
    /// Unconditional edges; several targets form a static fan-out.
    Direct(Vec<Target>),
    Conditional {
        branches: Vec<(String, Target)>,
        unmapped: Vec<String>,
        decide: DecideFn,
    },
    /// Dynamic fan-out over a declared set of targets.
    FanOut {
        targets: Vec<String>,
        dispatch: DispatchFn,
    },
}

impl Transition {
    /// Every target this transition can ever produce.
    pub(crate) fn targets(&self) -> Vec<Target> {
        match self {
            Transition::Direct(targets) => targets.clone(),
            Transition::Conditional { branches, .. } => {
                branches.iter().map(|(_, t)| t.clone()).collect()
            }
            Transition::FanOut { targets, .. } => {
                targets.iter().map(|t| Target::from(t.as_str())).collect()
            }
        }
    }

    pub(crate) fn is_direct(&self) -> bool {
        matches!(self, Transition::Direct(_))
    }
}

/// The resolved next hop of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Terminal,
    Single(Dispatch),
    Many(Vec<Dispatch>),
}

impl Route {
    fn from_dispatches(mut dispatches: Vec<Dispatch>) -> Self {
        match dispatches.len() {
            0 => Route::Terminal,
            1 => Route::Single(dispatches.remove(0)),
            _ => Route::Many(dispatches),
        }
    }

    pub fn into_dispatches(self) -> Vec<Dispatch> {
        match self {
            Route::Terminal => Vec::new(),
            Route::Single(d) => vec![d],
            Route::Many(ds) => ds,
        }
    }
}

/// Failure to resolve a transition at runtime. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("decision for step '{step}' returned unregistered branch {branch}")]
    UnregisteredBranch { step: String, branch: String },

    #[error("fan-out from step '{step}' dispatched undeclared target '{target}'")]
    UndeclaredTarget { step: String, target: String },

    #[error("unknown step '{0}'")]
    UnknownStep(String),
}

impl RoutingError {
    /// Step whose transition failed.
    pub fn step(&self) -> &str {
        match self {
            RoutingError::UnregisteredBranch { step, .. }
            | RoutingError::UndeclaredTarget { step, .. }
            | RoutingError::UnknownStep(step) => step,
        }
    }
}

// ---------------------------------------------------------------------------
// StepEntry
// ---------------------------------------------------------------------------

/// A registered step: its name, implementation, and per-step options.
#[derive(Debug, Clone)]
pub struct StepEntry {
    name: String,
    step: BoxStep,
    options: StepOptions,
}

impl StepEntry {
    pub fn new(name: impl Into<String>, step: BoxStep, options: StepOptions) -> Self {
        Self {
            name: name.into(),
            step,
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step(&self) -> &BoxStep {
        &self.step
    }

    pub fn options(&self) -> &StepOptions {
        &self.options
    }

    /// Declared input fields, if the step restricts its view.
    pub fn reads(&self) -> Option<Vec<String>> {
        self.step.reads()
    }
}

// ---------------------------------------------------------------------------
// GraphDefinition
// ---------------------------------------------------------------------------

/// Immutable, validated workflow graph.
pub struct GraphDefinition {
    name: String,
    order: Vec<String>,
    steps: HashMap<String, StepEntry>,
    transitions: HashMap<String, Transition>,
    entry: String,
    interrupts: InterruptPoints,
    policies: FieldPolicies,
}

impl GraphDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn step(&self, name: &str) -> Option<&StepEntry> {
        self.steps.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Step names in registration order.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn policies(&self) -> &FieldPolicies {
        &self.policies
    }

    pub fn interrupts(&self) -> &InterruptPoints {
        &self.interrupts
    }

    /// Every target `step` can statically reach in one hop.
    pub fn successors(&self, step: &str) -> Vec<Target> {
        self.transitions
            .get(step)
            .map(Transition::targets)
            .unwrap_or_default()
    }

    pub(crate) fn transition(&self, step: &str) -> Option<&Transition> {
        self.transitions.get(step)
    }

    /// Resolve where control goes after `step`, given the current state.
    ///
    /// A step without outgoing transitions is terminal.
    pub fn next_steps(&self, step: &str, state: &StateDocument) -> Result<Route, RoutingError> {
        if !self.contains(step) {
            return Err(RoutingError::UnknownStep(step.to_string()));
        }

        let Some(transition) = self.transitions.get(step) else {
            return Ok(Route::Terminal);
        };

        match transition {
            Transition::Direct(targets) => Ok(Route::from_dispatches(
                targets
                    .iter()
                    .filter_map(|t| t.step_name().map(Dispatch::to))
                    .collect(),
            )),
            Transition::Conditional { decide, .. } => match decide(state) {
                Ok(Target::End) => Ok(Route::Terminal),
                Ok(Target::Step(next)) => Ok(Route::Single(Dispatch::to(next))),
                Err(branch) => Err(RoutingError::UnregisteredBranch {
                    step: step.to_string(),
                    branch,
                }),
            },
            Transition::FanOut { targets, dispatch } => {
                let mut out = Vec::new();
                for d in dispatch(state) {
                    if d.step == END {
                        continue;
                    }
                    if !targets.contains(&d.step) {
                        return Err(RoutingError::UndeclaredTarget {
                            step: step.to_string(),
                            target: d.step,
                        });
                    }
                    out.push(d);
                }
                Ok(Route::from_dispatches(out))
            }
        }
    }

    /// Fan-in: union the routes of every step in a finished batch, in batch
    /// order, without duplicates. An empty result means the instance is done.
    pub fn resolve_batch(
        &self,
        done: &[String],
        state: &StateDocument,
    ) -> Result<Vec<Dispatch>, RoutingError> {
        let mut next: Vec<Dispatch> = Vec::new();
        for step in done {
            for dispatch in self.next_steps(step, state)?.into_dispatches() {
                if !next.contains(&dispatch) {
                    next.push(dispatch);
                }
            }
        }
        Ok(next)
    }
}

impl fmt::Debug for GraphDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphDefinition")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("steps", &self.order)
            .field("interrupts", &self.interrupts)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// GraphBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`GraphDefinition`].
pub struct GraphBuilder {
    name: String,
    steps: Vec<StepEntry>,
    duplicates: Vec<String>,
    edges: Vec<(String, Target)>,
    routers: Vec<(String, Transition)>,
    entry: Option<String>,
    interrupts: InterruptPoints,
    policies: FieldPolicies,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            duplicates: Vec::new(),
            edges: Vec::new(),
            routers: Vec::new(),
            entry: None,
            interrupts: InterruptPoints::default(),
            policies: FieldPolicies::new(),
        }
    }

    pub fn add_step<T: Step + 'static>(self, name: impl Into<String>, step: T) -> Self {
        self.add_step_with(name, step, StepOptions::default())
    }

    pub fn add_step_with<T: Step + 'static>(
        mut self,
        name: impl Into<String>,
        step: T,
        options: StepOptions,
    ) -> Self {
        let name = name.into();
        if self.steps.iter().any(|e| e.name == name) {
            self.duplicates.push(name);
        } else {
            self.steps.push(StepEntry::new(name, BoxStep::new(step), options));
        }
        self
    }

    /// Unconditional edge. Several edges from one step form a static fan-out.
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<Target>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Route from `from` by evaluating `decide` and looking the key up in
    /// `branches`.
    pub fn add_conditional_edges<K, F, I, T>(
        mut self,
        from: impl Into<String>,
        decide: F,
        branches: I,
    ) -> Self
    where
        K: BranchKey,
        F: Fn(&StateDocument) -> K + Send + Sync + 'static,
        I: IntoIterator<Item = (K, T)>,
        T: Into<Target>,
    {
        let table: HashMap<K, Target> = branches
            .into_iter()
            .map(|(key, target)| (key, target.into()))
            .collect();

        let labelled: BTreeMap<String, Target> = table
            .iter()
            .map(|(key, target)| (format!("{key:?}"), target.clone()))
            .collect();

        let unmapped = K::all()
            .map(|all| {
                all.into_iter()
                    .filter(|key| !table.contains_key(key))
                    .map(|key| format!("{key:?}"))
                    .collect()
            })
            .unwrap_or_default();

        let decide: DecideFn = Arc::new(move |state: &StateDocument| {
            let key = decide(state);
            table.get(&key).cloned().ok_or_else(|| format!("{key:?}"))
        });

        self.routers.push((
            from.into(),
            Transition::Conditional {
                branches: labelled.into_iter().collect(),
                unmapped,
                decide,
            },
        ));
        self
    }

    /// Dynamic fan-out: `dispatch` picks any number of `targets`, each with
    /// its own payload, to run concurrently as one batch.
    pub fn add_fan_out<F, I, S>(mut self, from: impl Into<String>, targets: I, dispatch: F) -> Self
    where
        F: Fn(&StateDocument) -> Vec<Dispatch> + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routers.push((
            from.into(),
            Transition::FanOut {
                targets: targets.into_iter().map(Into::into).collect(),
                dispatch: Arc::new(dispatch),
            },
        ));
        self
    }

    pub fn set_entry(mut self, step: impl Into<String>) -> Self {
        self.entry = Some(step.into());
        self
    }

    pub fn interrupt_before(mut self, step: impl Into<String>) -> Self {
        self.interrupts.add_before(step);
        self
    }

    pub fn interrupt_after(mut self, step: impl Into<String>) -> Self {
        self.interrupts.add_after(step);
        self
    }

    /// State field that carries external feedback for interrupt points.
    pub fn feedback_field(mut self, field: impl Into<String>) -> Self {
        self.interrupts.set_feedback_field(field);
        self
    }

    pub fn field_policy(mut self, field: impl Into<String>, policy: MergePolicy) -> Self {
        self.policies.set(field, policy);
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<GraphDefinition, ValidationError> {
        let name = self.name.clone();
        self.assemble()
            .map_err(|kind| ValidationError { graph: name, kind })
    }

    fn assemble(mut self) -> Result<GraphDefinition, ValidationErrorKind> {
        if self.steps.is_empty() {
            return Err(ValidationErrorKind::Empty);
        }
        if let Some(dup) = self.duplicates.first() {
            return Err(ValidationErrorKind::DuplicateStep(dup.clone()));
        }

        let order: Vec<String> = self.steps.iter().map(|e| e.name.clone()).collect();
        let steps: HashMap<String, StepEntry> = self
            .steps
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();

        let entry = match self.entry {
            Some(entry) if steps.contains_key(&entry) => entry,
            other => return Err(ValidationErrorKind::MissingEntry(other)),
        };

        let mut direct: HashMap<String, Vec<Target>> = HashMap::new();
        for (from, to) in self.edges {
            if !steps.contains_key(&from) {
                return Err(ValidationErrorKind::DanglingEdge {
                    from,
                    to: to.to_string(),
                });
            }
            let targets = direct.entry(from).or_default();
            if !targets.contains(&to) {
                targets.push(to);
            }
        }

        let mut transitions: HashMap<String, Transition> = direct
            .into_iter()
            .map(|(from, targets)| (from, Transition::Direct(targets)))
            .collect();

        for (from, transition) in self.routers {
            if !steps.contains_key(&from) {
                let to = transition
                    .targets()
                    .first()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                return Err(ValidationErrorKind::DanglingEdge { from, to });
            }
            if transitions.contains_key(&from) {
                return Err(ValidationErrorKind::ConflictingTransition(from));
            }
            transitions.insert(from, transition);
        }

        let feedback_field = self.interrupts.feedback_field().to_string();
        if self.policies.policy_for(&feedback_field) != MergePolicy::Replace {
            tracing::warn!(
                graph = self.name.as_str(),
                field = feedback_field.as_str(),
                "feedback field always merges with replace; overriding registered policy"
            );
        }
        self.policies.set(feedback_field, MergePolicy::Replace);

        let definition = GraphDefinition {
            name: self.name,
            order,
            steps,
            transitions,
            entry,
            interrupts: self.interrupts,
            policies: self.policies,
        };

        validation::check(&definition)?;
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::step::{FnStep, StepFailure, StepOutput};
    use quill_types::state::{InputView, StateDelta};
    use serde_json::json;
    use uuid::Uuid;

    fn noop() -> impl Step + 'static {
        FnStep::new(|_v: InputView| async { Ok::<_, StepFailure>(StepOutput::new(StateDelta::new())) })
    }

    fn state(fields: serde_json::Value) -> StateDocument {
        let mut doc = StateDocument::new(Uuid::now_v7());
        if let serde_json::Value::Object(map) = fields {
            *doc.fields_mut() = map;
        }
        doc
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Verdict {
        Pass,
        Fail,
    }

    impl BranchKey for Verdict {
        fn all() -> Option<Vec<Self>> {
            Some(vec![Verdict::Pass, Verdict::Fail])
        }
    }

    #[test]
    fn target_from_end_marker() {
        assert_eq!(Target::from(END), Target::End);
        assert_eq!(Target::from("a"), Target::Step("a".into()));
        assert_eq!(Target::End.to_string(), END);
    }

    #[test]
    fn linear_graph_routes_in_order() {
        let graph = GraphBuilder::new("linear")
            .add_step("a", noop())
            .add_step("b", noop())
            .add_edge("a", "b")
            .add_edge("b", END)
            .set_entry("a")
            .build()
            .unwrap();

        let doc = state(json!({}));
        assert_eq!(
            graph.next_steps("a", &doc).unwrap(),
            Route::Single(Dispatch::to("b"))
        );
        assert_eq!(graph.next_steps("b", &doc).unwrap(), Route::Terminal);
        assert_eq!(graph.step_names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn step_without_transitions_is_terminal() {
        let graph = GraphBuilder::new("single")
            .add_step("only", noop())
            .set_entry("only")
            .build()
            .unwrap();
        assert_eq!(
            graph.next_steps("only", &state(json!({}))).unwrap(),
            Route::Terminal
        );
    }

    #[test]
    fn conditional_edges_follow_decision() {
        let graph = GraphBuilder::new("gate")
            .add_step("check", noop())
            .add_step("fix", noop())
            .add_conditional_edges(
                "check",
                |s: &StateDocument| {
                    if s.get_as::<bool>("ok").unwrap_or(false) {
                        Verdict::Pass
                    } else {
                        Verdict::Fail
                    }
                },
                [(Verdict::Pass, END), (Verdict::Fail, "fix")],
            )
            .add_edge("fix", "check")
            .set_entry("check")
            .build()
            .unwrap();

        assert_eq!(
            graph.next_steps("check", &state(json!({"ok": false}))).unwrap(),
            Route::Single(Dispatch::to("fix"))
        );
        assert_eq!(
            graph.next_steps("check", &state(json!({"ok": true}))).unwrap(),
            Route::Terminal
        );
    }

    #[test]
    fn unregistered_open_branch_is_routing_error() {
        let graph = GraphBuilder::new("open")
            .add_step("a", noop())
            .add_conditional_edges("a", |_s: &StateDocument| "maybe", [("yes", END)])
            .set_entry("a")
            .build()
            .unwrap();

        let err = graph.next_steps("a", &state(json!({}))).unwrap_err();
        assert_eq!(
            err,
            RoutingError::UnregisteredBranch {
                step: "a".into(),
                branch: "\"maybe\"".into()
            }
        );
        assert_eq!(err.step(), "a");
    }

    #[test]
    fn static_fan_out_yields_many() {
        let graph = GraphBuilder::new("fan")
            .add_step("split", noop())
            .add_step("x", noop())
            .add_step("y", noop())
            .add_step("join", noop())
            .add_edge("split", "x")
            .add_edge("split", "y")
            .add_edge("x", "join")
            .add_edge("y", "join")
            .set_entry("split")
            .build()
            .unwrap();

        let doc = state(json!({}));
        assert_eq!(
            graph.next_steps("split", &doc).unwrap(),
            Route::Many(vec![Dispatch::to("x"), Dispatch::to("y")])
        );
        // Fan-in collapses both members onto one dispatch of `join`.
        assert_eq!(
            graph
                .resolve_batch(&["x".to_string(), "y".to_string()], &doc)
                .unwrap(),
            vec![Dispatch::to("join")]
        );
        assert!(graph.resolve_batch(&["join".to_string()], &doc).unwrap().is_empty());
    }

    #[test]
    fn dynamic_fan_out_carries_payloads() {
        let graph = GraphBuilder::new("dynamic")
            .add_step("plan", noop())
            .add_step("draft", noop())
            .add_fan_out("plan", ["draft"], |s: &StateDocument| {
                s.get_as::<Vec<String>>("formats")
                    .unwrap_or_default()
                    .into_iter()
                    .map(|f| Dispatch::with_payload("draft", json!({"format": f})))
                    .collect()
            })
            .set_entry("plan")
            .build()
            .unwrap();

        let route = graph
            .next_steps("plan", &state(json!({"formats": ["text", "image"]})))
            .unwrap();
        match route {
            Route::Many(ds) => {
                assert_eq!(ds.len(), 2);
                assert_eq!(ds[1].payload, Some(json!({"format": "image"})));
            }
            other => panic!("expected Many, got {other:?}"),
        }

        assert_eq!(
            graph.next_steps("plan", &state(json!({"formats": []}))).unwrap(),
            Route::Terminal
        );
    }

    #[test]
    fn dynamic_fan_out_rejects_undeclared_target() {
        let graph = GraphBuilder::new("dynamic")
            .add_step("plan", noop())
            .add_step("draft", noop())
            .add_fan_out("plan", ["draft"], |_s: &StateDocument| vec![Dispatch::to("rogue")])
            .set_entry("plan")
            .build()
            .unwrap();

        assert!(matches!(
            graph.next_steps("plan", &state(json!({}))),
            Err(RoutingError::UndeclaredTarget { .. })
        ));
    }

    #[test]
    fn feedback_field_forced_to_replace() {
        let graph = GraphBuilder::new("fb")
            .add_step("a", noop())
            .field_policy("human_feedback", MergePolicy::Append)
            .set_entry("a")
            .build()
            .unwrap();
        assert_eq!(
            graph.policies().policy_for("human_feedback"),
            MergePolicy::Replace
        );
    }

    #[test]
    fn successors_lists_static_targets() {
        let graph = GraphBuilder::new("succ")
            .add_step("a", noop())
            .add_step("b", noop())
            .add_conditional_edges("a", |_s: &StateDocument| true, [(true, "b"), (false, END)])
            .set_entry("a")
            .build()
            .unwrap();
        let succ = graph.successors("a");
        assert!(succ.contains(&Target::Step("b".into())));
        assert!(succ.contains(&Target::End));
        assert!(graph.successors("b").is_empty());
    }
}
