//! The demo content pipeline driven by the `quill` binary.
//!
//! ```text
//! analyze -> plan -> draft x N -> quality_review -> human_review -> publish
//!             ^                        |                 |
//!             +------- rework ---------+---- revise -----+
//! ```
//!
//! `plan` fans out one `draft` branch per format. `human_review` is an
//! interrupt-before point: the instance waits there until a reviewer resumes
//! it with a [`ReviewFeedback`]. Every step produces placeholder content.

use std::collections::BTreeSet;

use chrono::Utc;
use quill_core::workflow::{
    BranchKey, END, GraphBuilder, GraphDefinition, Step, StepFailure, StepOutput, ValidationError,
};
use quill_types::checkpoint::Dispatch;
use quill_types::state::{DEFAULT_FEEDBACK_FIELD, InputView, MergePolicy, StateDelta, StateDocument};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const GRAPH_NAME: &str = "content_pipeline";

/// Formats drafted for every plan revision.
pub const FORMATS: [&str; 3] = ["text", "image", "audio"];

/// Minimum share of formats that must have a current draft.
const QUALITY_THRESHOLD: f64 = 1.0;

/// Revision after which a poor quality score goes to the reviewer anyway.
const MAX_AUTO_REVISIONS: u64 = 3;

// ---------------------------------------------------------------------------
// Domain documents
// ---------------------------------------------------------------------------

/// Reviewer verdict at `human_review`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Revise,
}

impl BranchKey for ReviewDecision {
    fn all() -> Option<Vec<Self>> {
        Some(vec![ReviewDecision::Approve, ReviewDecision::Revise])
    }
}

/// Feedback a reviewer resumes an interrupted instance with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub decision: ReviewDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ReviewFeedback {
    pub fn new(decision: ReviewDecision, notes: Option<String>) -> Self {
        Self { decision, notes }
    }

    /// Resume delta carrying this feedback in the feedback field.
    pub fn into_delta(self) -> StateDelta {
        StateDelta::new().set(
            DEFAULT_FEEDBACK_FIELD,
            json!({ "decision": self.decision, "notes": self.notes }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Analysis {
    topic: String,
    keywords: Vec<String>,
    audience: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ContentPlan {
    revision: u64,
    formats: Vec<String>,
    outline: Vec<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DraftRequest {
    format: String,
    revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Draft {
    body: String,
    revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Quality {
    score: f64,
    revision: u64,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

struct AnalyzeStep;

impl Step for AnalyzeStep {
    async fn run(&self, input: InputView) -> Result<StepOutput, StepFailure> {
        let topic = input
            .get_as::<String>("topic")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| StepFailure::fatal("a non-empty 'topic' is required"))?;

        let keywords: BTreeSet<String> = topic
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| w.len() > 3)
            .collect();

        let analysis = Analysis {
            audience: if keywords.len() > 3 { "specialist" } else { "general" }.to_string(),
            keywords: keywords.into_iter().collect(),
            topic: topic.clone(),
        };

        Ok(StepOutput::new(
            StateDelta::new()
                .set("analysis", to_value(&analysis)?)
                .set("messages", format!("analyzed topic '{topic}'")),
        ))
    }

    fn reads(&self) -> Option<Vec<String>> {
        Some(vec!["topic".to_string()])
    }
}

struct PlanStep;

impl Step for PlanStep {
    async fn run(&self, input: InputView) -> Result<StepOutput, StepFailure> {
        let analysis: Analysis = input
            .get_as("analysis")
            .ok_or_else(|| StepFailure::fatal("plan requires an analysis"))?;
        let revision = input.get_as::<u64>("revision").unwrap_or(0) + 1;
        let notes = input
            .get_as::<ReviewFeedback>("review")
            .and_then(|review| review.notes);

        let mut outline = vec![format!("introduction to {}", analysis.topic)];
        outline.extend(analysis.keywords.iter().map(|k| format!("on {k}")));
        outline.push("summary".to_string());

        let plan = ContentPlan {
            revision,
            formats: FORMATS.iter().map(|f| f.to_string()).collect(),
            outline,
            notes,
        };

        Ok(StepOutput::new(
            StateDelta::new()
                .set("plan", to_value(&plan)?)
                .set("revision", revision)
                .set("messages", format!("planned revision {revision}")),
        ))
    }

    fn reads(&self) -> Option<Vec<String>> {
        Some(vec![
            "analysis".to_string(),
            "revision".to_string(),
            "review".to_string(),
        ])
    }
}

struct DraftStep;

impl Step for DraftStep {
    async fn run(&self, input: InputView) -> Result<StepOutput, StepFailure> {
        let request: DraftRequest = input
            .payload_as()
            .ok_or_else(|| StepFailure::fatal("draft requires a format payload"))?;
        let analysis: Analysis = input
            .get_as("analysis")
            .ok_or_else(|| StepFailure::fatal("draft requires an analysis"))?;
        let plan: ContentPlan = input
            .get_as("plan")
            .ok_or_else(|| StepFailure::fatal("draft requires a plan"))?;

        let topic = &analysis.topic;
        let mut body = match request.format.as_str() {
            "text" => format!(
                "{topic}: {} sections ({})",
                plan.outline.len(),
                plan.outline.join(", ")
            ),
            "image" => format!("cover illustration for '{topic}' aimed at a {} audience", analysis.audience),
            "audio" => format!("narration script for '{topic}' in {} segments", plan.outline.len()),
            other => return Err(StepFailure::fatal(format!("unsupported format '{other}'"))),
        };
        if let Some(notes) = &plan.notes {
            body.push_str(&format!(" [revised: {notes}]"));
        }

        let draft = Draft {
            body,
            revision: request.revision,
        };
        let mut content = Map::new();
        content.insert(request.format.clone(), to_value(&draft)?);

        Ok(StepOutput::new(
            StateDelta::new()
                .set("content", Value::Object(content))
                .set(
                    "messages",
                    format!("drafted {} for revision {}", request.format, request.revision),
                ),
        ))
    }

    fn reads(&self) -> Option<Vec<String>> {
        Some(vec!["analysis".to_string(), "plan".to_string()])
    }
}

struct QualityReviewStep;

impl Step for QualityReviewStep {
    async fn run(&self, input: InputView) -> Result<StepOutput, StepFailure> {
        let plan: ContentPlan = input
            .get_as("plan")
            .ok_or_else(|| StepFailure::fatal("quality review requires a plan"))?;
        let content: Map<String, Value> = input.get_as("content").unwrap_or_default();

        let mut issues = Vec::new();
        for format in &plan.formats {
            let draft = content
                .get(format)
                .and_then(|v| serde_json::from_value::<Draft>(v.clone()).ok());
            match draft {
                Some(d) if d.revision == plan.revision && !d.body.is_empty() => {}
                Some(_) => issues.push(format!("{format} draft is stale for revision {}", plan.revision)),
                None => issues.push(format!("{format} draft is missing")),
            }
        }

        let total = plan.formats.len();
        let score = if total == 0 {
            0.0
        } else {
            (total - issues.len()) as f64 / total as f64
        };
        let quality = Quality {
            score,
            revision: plan.revision,
        };

        Ok(StepOutput::new(
            StateDelta::new()
                .set("quality", to_value(&quality)?)
                .set("quality_issues", issues)
                .set("messages", format!("quality score {score:.2} for revision {}", plan.revision)),
        ))
    }

    fn reads(&self) -> Option<Vec<String>> {
        Some(vec!["plan".to_string(), "content".to_string()])
    }
}

struct HumanReviewStep;

impl Step for HumanReviewStep {
    async fn run(&self, input: InputView) -> Result<StepOutput, StepFailure> {
        let feedback: ReviewFeedback = input
            .get_as(DEFAULT_FEEDBACK_FIELD)
            .ok_or_else(|| StepFailure::fatal("review feedback is missing or malformed"))?;
        let revision = input.get_as::<u64>("revision").unwrap_or(0);
        let verdict = match feedback.decision {
            ReviewDecision::Approve => "approved",
            ReviewDecision::Revise => "sent back",
        };

        Ok(StepOutput::new(
            StateDelta::new()
                .set("review", to_value(&feedback)?)
                .set("messages", format!("revision {revision} {verdict} by reviewer")),
        ))
    }

    fn reads(&self) -> Option<Vec<String>> {
        Some(vec![DEFAULT_FEEDBACK_FIELD.to_string(), "revision".to_string()])
    }
}

struct PublishStep;

impl Step for PublishStep {
    async fn run(&self, input: InputView) -> Result<StepOutput, StepFailure> {
        let analysis: Analysis = input
            .get_as("analysis")
            .ok_or_else(|| StepFailure::fatal("publish requires an analysis"))?;
        let content: Map<String, Value> = input.get_as("content").unwrap_or_default();
        let revision = input.get_as::<u64>("revision").unwrap_or(0);

        let published = json!({
            "topic": analysis.topic,
            "revision": revision,
            "formats": content.keys().collect::<Vec<_>>(),
            "published_at": Utc::now().to_rfc3339(),
        });

        Ok(StepOutput::new(
            StateDelta::new()
                .set("published", published)
                .set("messages", format!("published revision {revision}")),
        ))
    }

    fn reads(&self) -> Option<Vec<String>> {
        Some(vec![
            "analysis".to_string(),
            "content".to_string(),
            "revision".to_string(),
        ])
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, StepFailure> {
    serde_json::to_value(value).map_err(|e| StepFailure::fatal(format!("serialize output: {e}")))
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

fn draft_dispatches(state: &StateDocument) -> Vec<Dispatch> {
    let Some(plan) = state.get_as::<ContentPlan>("plan") else {
        return Vec::new();
    };
    plan.formats
        .iter()
        .map(|format| {
            Dispatch::with_payload("draft", json!({ "format": format, "revision": plan.revision }))
        })
        .collect()
}

/// Good enough for a human, or out of automatic rework attempts.
fn ready_for_review(state: &StateDocument) -> bool {
    let score = state
        .get_as::<Quality>("quality")
        .map(|q| q.score)
        .unwrap_or(0.0);
    let revision = state.get_as::<u64>("revision").unwrap_or(0);
    score >= QUALITY_THRESHOLD || revision >= MAX_AUTO_REVISIONS
}

fn review_decision(state: &StateDocument) -> ReviewDecision {
    state
        .get_as::<ReviewFeedback>("review")
        .map(|r| r.decision)
        .unwrap_or(ReviewDecision::Revise)
}

/// Build and validate the content pipeline graph.
pub fn build_pipeline() -> Result<GraphDefinition, ValidationError> {
    GraphBuilder::new(GRAPH_NAME)
        .add_step("analyze", AnalyzeStep)
        .add_step("plan", PlanStep)
        .add_step("draft", DraftStep)
        .add_step("quality_review", QualityReviewStep)
        .add_step("human_review", HumanReviewStep)
        .add_step("publish", PublishStep)
        .set_entry("analyze")
        .add_edge("analyze", "plan")
        .add_fan_out("plan", ["draft"], draft_dispatches)
        .add_edge("draft", "quality_review")
        .add_conditional_edges(
            "quality_review",
            ready_for_review,
            [(true, "human_review"), (false, "plan")],
        )
        .add_conditional_edges(
            "human_review",
            review_decision,
            [
                (ReviewDecision::Approve, "publish"),
                (ReviewDecision::Revise, "plan"),
            ],
        )
        .add_edge("publish", END)
        .interrupt_before("human_review")
        .field_policy("messages", MergePolicy::Append)
        .field_policy("content", MergePolicy::ShallowMerge)
        .field_policy("quality_issues", MergePolicy::Append)
        .build()
}
