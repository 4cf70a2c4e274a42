use crate::checkpoint::Checkpoint;
use crate::config::ExecutionDefaults;
use crate::error::{RalphError, Result};
use crate::scoring;
use crate::story::{ExternalDep, Story, StoryId};
use crate::types::CheckpointStage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Run configuration
// ---------------------------------------------------------------------------

/// Effective settings for one `start`/`continue` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    pub base_branch: String,
    pub max_iterations: u32,
    /// Per agent call, in seconds.
    #[serde(rename = "claudeTimeout")]
    pub claude_timeout_secs: u64,
    pub auto_mode: bool,
    /// Stop after the first completed story.
    pub one_shot_mode: bool,
    pub single_story_id: Option<String>,
    /// Throw away the current story's checkpoints and failure streak first.
    pub retry_clean: bool,
    pub failure_threshold: u32,
    pub stale_handoff_minutes: i64,
}

/// Per-request overrides as sent in `POST /run` bodies.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOverrides {
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default, alias = "claudeTimeoutSecs")]
    pub claude_timeout: Option<u64>,
    #[serde(default)]
    pub auto_mode: Option<bool>,
    #[serde(default)]
    pub one_shot_mode: Option<bool>,
    #[serde(default)]
    pub single_story_id: Option<String>,
    #[serde(default)]
    pub retry_clean: Option<bool>,
}

impl ExecutionConfig {
    pub fn from_defaults(d: &ExecutionDefaults) -> Self {
        ExecutionConfig {
            base_branch: d.base_branch.clone(),
            max_iterations: d.max_iterations,
            claude_timeout_secs: d.claude_timeout_secs,
            auto_mode: d.auto_mode,
            one_shot_mode: false,
            single_story_id: None,
            retry_clean: false,
            failure_threshold: d.failure_threshold,
            stale_handoff_minutes: d.stale_handoff_minutes,
        }
    }

    pub fn with_overrides(mut self, o: ExecutionOverrides) -> Result<Self> {
        if let Some(v) = o.base_branch.filter(|b| !b.trim().is_empty()) {
            self.base_branch = v;
        }
        if let Some(v) = o.max_iterations {
            if v == 0 {
                return Err(RalphError::invalid_field("maxIterations", "must be at least 1"));
            }
            self.max_iterations = v;
        }
        if let Some(v) = o.claude_timeout {
            if v == 0 {
                return Err(RalphError::invalid_field("claudeTimeout", "must be at least 1 second"));
            }
            self.claude_timeout_secs = v;
        }
        if let Some(v) = o.auto_mode {
            self.auto_mode = v;
        }
        if let Some(v) = o.one_shot_mode {
            self.one_shot_mode = v;
        }
        if let Some(v) = o.retry_clean {
            self.retry_clean = v;
        }
        if let Some(id) = o.single_story_id.filter(|s| !s.trim().is_empty()) {
            self.single_story_id = Some(StoryId::parse(&id)?.canonical());
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Validation,
    ExternalDeps,
    PrReview,
    Blocked,
}

impl GateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GateKind::Validation => "validation",
            GateKind::ExternalDeps => "external_deps",
            GateKind::PrReview => "pr_review",
            GateKind::Blocked => "blocked",
        }
    }

    /// Answers a human may give at this gate.
    pub fn options(self) -> &'static [GateAction] {
        match self {
            GateKind::Validation => &[GateAction::Proceed, GateAction::Clarify, GateAction::Skip],
            GateKind::ExternalDeps => &[GateAction::Proceed, GateAction::Skip],
            GateKind::PrReview => &[GateAction::Merge, GateAction::Feedback, GateAction::Skip],
            GateKind::Blocked => &[GateAction::Retry, GateAction::Clarify, GateAction::Skip],
        }
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Proceed,
    Clarify,
    Skip,
    Merge,
    Feedback,
    Retry,
}

impl GateAction {
    pub fn as_str(self) -> &'static str {
        match self {
            GateAction::Proceed => "proceed",
            GateAction::Clarify => "clarify",
            GateAction::Skip => "skip",
            GateAction::Merge => "merge",
            GateAction::Feedback => "feedback",
            GateAction::Retry => "retry",
        }
    }
}

/// A point where the run stops and waits for a human answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateRequest {
    #[serde(rename = "type")]
    pub kind: GateKind,
    pub story_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub external_deps: Vec<ExternalDep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    pub options: Vec<GateAction>,
}

impl GateRequest {
    fn new(kind: GateKind, story_id: &str, message: String) -> Self {
        GateRequest {
            kind,
            story_id: story_id.to_string(),
            message,
            questions: Vec::new(),
            external_deps: Vec::new(),
            pr_url: None,
            options: kind.options().to_vec(),
        }
    }

    pub fn validation(story: &Story, questions: Vec<String>) -> Self {
        GateRequest {
            questions,
            ..Self::new(
                GateKind::Validation,
                &story.id,
                format!("Story {} needs clarification before work starts", story.id),
            )
        }
    }

    pub fn external_deps(story: &Story) -> Self {
        GateRequest {
            external_deps: story.external_deps.clone(),
            ..Self::new(
                GateKind::ExternalDeps,
                &story.id,
                format!("Story {} depends on external work; confirm it is ready", story.id),
            )
        }
    }

    pub fn pr_review(story: &Story, pr_url: Option<String>) -> Self {
        GateRequest {
            pr_url,
            ..Self::new(
                GateKind::PrReview,
                &story.id,
                format!("Pull request for {} is ready for review", story.id),
            )
        }
    }

    pub fn blocked(story_id: &str, last_error: Option<&str>) -> Self {
        let message = match last_error {
            Some(e) => format!("Story {story_id} is blocked: {e}"),
            None => format!("Story {story_id} is blocked"),
        };
        Self::new(GateKind::Blocked, story_id, message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateAnswer {
    pub action: GateAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// The human's answer to a [`GateRequest`], threaded back through `POST /run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResponse {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<GateKind>,
    pub response: GateAnswer,
}

impl GateResponse {
    pub fn new(kind: GateKind, action: GateAction) -> Self {
        GateResponse {
            kind: Some(kind),
            response: GateAnswer {
                action,
                clarification: None,
                report: None,
                feedback: None,
            },
        }
    }

    /// Reject answers that do not belong to the gate being answered.
    pub fn check_against(&self, gate: GateKind) -> Result<()> {
        if let Some(kind) = self.kind {
            if kind != gate {
                return Err(RalphError::invalid_field(
                    "gateResponse.type",
                    format!("expected {gate}, got {kind}"),
                ));
            }
        }
        if !gate.options().contains(&self.response.action) {
            return Err(RalphError::invalid_field(
                "gateResponse.response.action",
                format!("{} is not valid at a {gate} gate", self.response.action.as_str()),
            ));
        }
        Ok(())
    }
}

/// The gate a held story is waiting at, derived from its checkpoints.
pub fn pending_gate(story: &Story, checkpoints: &[Checkpoint], blocked: bool) -> Option<GateKind> {
    let has = |stage| checkpoints.iter().any(|c| c.stage == stage);
    if blocked {
        Some(GateKind::Blocked)
    } else if !story.external_deps.is_empty() && !has(CheckpointStage::ExternalDepsComplete) {
        Some(GateKind::ExternalDeps)
    } else if !has(CheckpointStage::ValidationComplete) {
        Some(GateKind::Validation)
    } else if has(CheckpointStage::PrCreated) {
        Some(GateKind::PrReview)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Story selection and validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Story(Box<Story>),
    /// Every story in the version is merged or skipped.
    AllComplete,
    /// Work remains but no story has its dependencies met.
    NoneRunnable,
}

pub fn select_story(
    all: &[Story],
    version: &str,
    single_story_id: Option<&str>,
    last_completed: Option<&str>,
) -> Result<Selection> {
    if let Some(id) = single_story_id {
        let story = all
            .iter()
            .find(|s| s.id == id || (s.version == version && s.bare_id() == id))
            .ok_or_else(|| RalphError::StoryNotFound(id.to_string()))?;
        if story.is_done() {
            return Ok(Selection::AllComplete);
        }
        return Ok(Selection::Story(Box::new(story.clone())));
    }
    let next = scoring::score_stories(all, version, last_completed)
        .into_iter()
        .next()
        .and_then(|scored| all.iter().find(|s| s.id == scored.story_id));
    match next {
        Some(story) => Ok(Selection::Story(Box::new(story.clone()))),
        None => {
            let finished = all
                .iter()
                .filter(|s| s.version == version)
                .all(|s| s.merged || s.skipped);
            Ok(if finished {
                Selection::AllComplete
            } else {
                Selection::NoneRunnable
            })
        }
    }
}

pub const VAGUE_TERMS: &[&str] = &[
    "properly",
    "correctly",
    "appropriate",
    "handle",
    "improve",
    "better",
    "settings",
];

static VAGUE_RE: OnceLock<Regex> = OnceLock::new();

fn vague_re() -> &'static Regex {
    VAGUE_RE.get_or_init(|| {
        Regex::new(&format!(r"(?i)\b({})\b", VAGUE_TERMS.join("|"))).unwrap()
    })
}

/// Questions to put to a human before the story is worked. Empty means the
/// story is ready.
pub fn validate_story(story: &Story) -> Vec<String> {
    let mut questions = Vec::new();

    let texts = std::iter::once(story.title.as_str())
        .chain(story.description.as_deref())
        .chain(story.acceptance.iter().map(String::as_str));
    let mut found: Vec<String> = Vec::new();
    for text in texts {
        for m in vague_re().find_iter(text) {
            let term = m.as_str().to_lowercase();
            if !found.contains(&term) {
                found.push(term);
            }
        }
    }
    if !found.is_empty() {
        questions.push(format!(
            "The story contains vague terms: {}. Can you clarify what exactly is expected?",
            found.join(", ")
        ));
    }
    if story.acceptance.is_empty() {
        questions.push(
            "No acceptance criteria defined. What should be verified when the story is complete?"
                .into(),
        );
    }
    let blank = |s: &Option<String>| s.as_deref().map_or(true, |v| v.trim().is_empty());
    if blank(&story.description) && blank(&story.intent) {
        questions.push(
            "No description or intent provided. Can you clarify the context and goals?".into(),
        );
    }
    questions
}

/// Working branch for a story: `feat/story-1.2.3`, version prefix folded in.
pub fn branch_name(story_id: &str) -> String {
    let id = match StoryId::parse(story_id) {
        Ok(parsed) => parsed.canonical(),
        Err(_) => story_id.trim().to_string(),
    };
    format!("feat/story-{}", id.replace(':', "-"))
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

pub const DEFAULT_PROMPT: &str = r#"# Ralph iteration

You are working on story {{STORY_ID}} on branch `{{BRANCH}}` (attempt {{ATTEMPT}}).

{{STORY}}
{{CONTEXT}}
## Rules

- Work only on this story. Keep the change focused on its acceptance criteria.
- Run the project's tests before finishing.
- Commit nothing yourself; the orchestrator commits and opens the pull request.

## Signalling

When every acceptance criterion is met, print exactly:

<story-complete>{{STORY_ID}}</story-complete>

If you cannot continue without human input, print:

<story-blocked>short reason</story-blocked>

You may also report status over HTTP:

curl -s -X POST {{SIGNAL_URL}} -H 'Content-Type: application/json' \
  -d '{"storyId":"{{STORY_ID}}","action":"complete","message":"..."}'
"#;

/// Extra sections appended to the prompt, recovered from checkpoints and the
/// run state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptContext {
    pub clarification: Option<String>,
    pub feedback: Option<String>,
    pub external_deps_report: Option<String>,
    pub previous_failure: Option<String>,
}

impl PromptContext {
    pub fn from_checkpoints(checkpoints: &[Checkpoint], previous_failure: Option<&str>) -> Self {
        let field = |stage: CheckpointStage, key: &str| {
            checkpoints
                .iter()
                .find(|c| c.stage == stage)
                .and_then(|c| c.data.get(key))
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
        };
        PromptContext {
            clarification: field(CheckpointStage::ValidationComplete, "clarification"),
            feedback: field(CheckpointStage::ValidationComplete, "feedback"),
            external_deps_report: field(CheckpointStage::ExternalDepsComplete, "report"),
            previous_failure: previous_failure.map(str::to_string),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(c) = &self.clarification {
            out.push_str(&format!("\n## Clarification from User\n{c}\n"));
        }
        if let Some(f) = &self.feedback {
            out.push_str(&format!("\n## Feedback from Code Review\n{f}\n"));
        }
        if let Some(r) = &self.external_deps_report {
            out.push_str(&format!("\n## External Dependencies Report\n{r}\n"));
        }
        if let Some(e) = &self.previous_failure {
            out.push_str(&format!(
                "\n## Previous Failure Context\nThe previous attempt failed with: {e}\n\
                 Please address this issue in your implementation.\n"
            ));
        }
        out
    }
}

pub fn story_section(story: &Story) -> String {
    let mut s = format!("## Story: {}\n**Title:** {}\n\n", story.id, story.title);
    if let Some(intent) = story.intent.as_deref().filter(|v| !v.is_empty()) {
        s.push_str(&format!("**Intent:** {intent}\n\n"));
    }
    if let Some(desc) = story.description.as_deref().filter(|v| !v.is_empty()) {
        s.push_str(&format!("**Description:**\n{desc}\n\n"));
    }
    s.push_str("**Acceptance Criteria:**\n");
    for ac in &story.acceptance {
        s.push_str(&format!("- {ac}\n"));
    }
    if !story.external_deps.is_empty() {
        s.push_str("\n**External Dependencies:**\n");
        for dep in &story.external_deps {
            match &dep.description {
                Some(d) => s.push_str(&format!("- {}: {d}\n", dep.name)),
                None => s.push_str(&format!("- {}\n", dep.name)),
            }
        }
    }
    s
}

/// Fill the agent prompt template. Unknown placeholders are left alone.
pub fn build_prompt(
    template: &str,
    story: &Story,
    branch: &str,
    attempt: u32,
    signal_url: &str,
    ctx: &PromptContext,
) -> String {
    template
        .replace("{{STORY_ID}}", &story.id)
        .replace("{{BRANCH}}", branch)
        .replace("{{ATTEMPT}}", &attempt.to_string())
        .replace("{{STORY}}", &story_section(story))
        .replace("{{CONTEXT}}", &ctx.render())
        .replace("{{SIGNAL_URL}}", signal_url)
}

// ---------------------------------------------------------------------------
// Agent output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSignal {
    Complete,
    Blocked(String),
    /// The agent believes every story is done.
    AllComplete,
}

static COMPLETE_RE: OnceLock<Regex> = OnceLock::new();
static BLOCKED_RE: OnceLock<Regex> = OnceLock::new();

/// Scan agent output for completion markers. A `story-complete` tag naming a
/// different story is ignored.
pub fn parse_agent_signal(output: &str, story_id: &str) -> Option<AgentSignal> {
    let complete = COMPLETE_RE
        .get_or_init(|| Regex::new(r"(?i)<story-complete>([^<]+)</story-complete>").unwrap());
    let blocked = BLOCKED_RE
        .get_or_init(|| Regex::new(r"(?i)<story-blocked>([^<]*)</story-blocked>").unwrap());

    let wanted = StoryId::parse(story_id).ok().map(|id| id.bare());
    let names_story = |named: &str| match (&wanted, StoryId::parse(named)) {
        (Some(w), Ok(id)) => *w == id.bare(),
        _ => named.trim() == story_id,
    };

    if complete
        .captures_iter(output)
        .any(|c| names_story(c[1].trim()))
    {
        return Some(AgentSignal::Complete);
    }
    if let Some(c) = blocked.captures(output) {
        let msg = c[1].trim();
        return Some(AgentSignal::Blocked(if msg.is_empty() {
            "Story blocked".to_string()
        } else {
            msg.to_string()
        }));
    }
    if output.contains("<promise>COMPLETE</promise>") {
        return Some(AgentSignal::AllComplete);
    }
    None
}
