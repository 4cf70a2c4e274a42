//! Prompts for the LLM-backed PRD tasks (refine, generate, story-edit, align).
//! The agent answers with a JSON object that is stored as the task result.

use crate::db::Store;
use crate::error::{RalphError, Result};
use crate::prd::Prd;
use crate::story::Story;
use crate::task::Task;
use crate::types::TaskKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateParams {
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryEditParams {
    #[serde(alias = "story_id")]
    pub story_id: String,
    #[serde(alias = "requested_changes")]
    pub requested_changes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignParams {
    #[serde(default)]
    pub vision: Option<String>,
}

fn params<T: serde::de::DeserializeOwned>(task: &Task) -> Result<T> {
    serde_json::from_value(task.params.clone())
        .map_err(|e| RalphError::invalid_field("params", e.to_string()))
}

/// Check a task's params before it is queued.
pub fn validate_task_params(kind: TaskKind, value: &serde_json::Value) -> Result<()> {
    let fail = |e: serde_json::Error| RalphError::invalid_field("params", e.to_string());
    match kind {
        TaskKind::Refine => Ok(()),
        TaskKind::Generate => {
            let p: GenerateParams = serde_json::from_value(value.clone()).map_err(fail)?;
            if p.description.trim().is_empty() {
                return Err(RalphError::invalid_field("description", "is required"));
            }
            Ok(())
        }
        TaskKind::StoryEdit => {
            let p: StoryEditParams = serde_json::from_value(value.clone()).map_err(fail)?;
            if p.requested_changes.trim().is_empty() {
                return Err(RalphError::invalid_field("requestedChanges", "is required"));
            }
            Ok(())
        }
        TaskKind::Align => serde_json::from_value::<AlignParams>(value.clone())
            .map(|_| ())
            .map_err(fail),
    }
}

fn open_stories(prd: &Prd) -> Vec<&Story> {
    prd.stories.iter().filter(|s| !s.is_done()).collect()
}

fn compact(story: &Story) -> serde_json::Value {
    serde_json::json!({
        "id": story.bare_id(),
        "title": story.title,
        "intent": story.intent,
        "description": story.description,
        "acceptance": story.acceptance,
        "tags": story.tags,
        "depends_on": story.depends_on,
    })
}

fn as_json_list(stories: &[&Story]) -> String {
    let list: Vec<_> = stories.iter().map(|s| compact(s)).collect();
    serde_json::to_string_pretty(&list).unwrap_or_else(|_| "[]".into())
}

pub fn refine_prompt(prd: &Prd) -> String {
    format!(
        r#"You are reviewing the PRD for version {version} ({title}).

These stories are not yet passed, merged or skipped:
{stories}

For each story, check:
1. Are acceptance criteria specific and testable?
2. Are there vague terms? ("settings", "improve", "properly", "handle")
3. Should it be split into smaller stories?

Output ONLY valid JSON:
{{
  "refinements": [
    {{
      "id": "X.Y.Z",
      "title": "story title",
      "status": "ok" | "needs_work",
      "issues": ["issue 1"],
      "suggested_description": "clearer description",
      "suggested_acceptance": ["criterion 1", "criterion 2"],
      "tags": ["from", "original"],
      "depends_on": ["from", "original"]
    }}
  ],
  "summary": "X of Y stories need refinement"
}}

Copy tags and depends_on from the original. Be pragmatic; only flag real issues."#,
        version = prd.version.id,
        title = prd.version.title,
        stories = as_json_list(&open_stories(prd)),
    )
}

pub fn generate_prompt(prd: &Prd, description: &str) -> String {
    let phases = if prd.phases.is_empty() {
        "No phases defined".to_string()
    } else {
        prd.phases
            .iter()
            .map(|p| format!("{}. {}", p.number, p.name))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let epics = if prd.epics.is_empty() {
        "No epics defined".to_string()
    } else {
        prd.epics
            .iter()
            .map(|e| format!("Phase {}, Epic {}: {}", e.phase, e.number, e.name))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let sample = prd
        .stories
        .iter()
        .take(10)
        .map(|s| format!("{}: {}", s.bare_id(), s.title))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are helping build a PRD. Here's the context:

PROJECT: {title}
PHASES: {phases}
EPICS:
{epics}

EXISTING STORIES (sample):
{sample}

USER REQUEST:
{description}

Generate new stories that fit this PRD. Output ONLY valid JSON:
{{
  "stories": [
    {{
      "title": "Story title",
      "intent": "Why this matters",
      "acceptance": ["Criterion 1", "Criterion 2"],
      "phase": 1,
      "epic": 1,
      "depends_on": [],
      "tags": ["tag1"]
    }}
  ],
  "new_epic": {{ "phase": 1, "name": "Epic name" }} | null,
  "reasoning": "Brief explanation of choices"
}}

Be specific with acceptance criteria. Match the existing style."#,
        title = prd.version.title,
    )
}

/// Stories that share at least two tags with `story`, or depend on it, or
/// that it depends on.
pub fn related_stories<'a>(story: &Story, all: &'a [Story]) -> Vec<&'a Story> {
    let tags: HashSet<&str> = story.tags.iter().map(String::as_str).collect();
    all.iter()
        .filter(|s| s.id != story.id)
        .filter(|s| {
            let overlap = s.tags.iter().filter(|t| tags.contains(t.as_str())).count();
            overlap >= 2
                || s.dependencies().iter().any(|d| d.covers(story, &s.version))
                || story.dependencies().iter().any(|d| d.covers(s, &story.version))
        })
        .collect()
}

pub fn story_edit_prompt(story: &Story, related: &[&Story], requested_changes: &str) -> String {
    let none = |v: &Option<String>| v.clone().unwrap_or_else(|| "(none)".into());
    let list = |v: &[String]| {
        if v.is_empty() {
            "(none)".to_string()
        } else {
            v.join(", ")
        }
    };
    let acceptance = story
        .acceptance
        .iter()
        .enumerate()
        .map(|(i, a)| format!("{}. {a}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are updating a PRD story based on user feedback.

TARGET STORY:
- ID: {id}
- Title: {title}
- Current Description: {description}
- Current Intent: {intent}
- Tags: {tags}
- Depends On: {deps}

Current Acceptance Criteria:
{acceptance}

USER REQUESTED CHANGES:
{requested_changes}

RELATED STORIES (share tags or dependencies; may need updates for consistency):
{related}

Tasks:
1. Generate updated description and acceptance criteria for the target story
2. Check if any related stories need updates to stay consistent
3. Be specific; avoid vague terms like "properly", "handle", "settings"

Output ONLY valid JSON:
{{
  "target": {{
    "suggested_description": "Updated description based on changes",
    "suggested_acceptance": ["specific criterion 1", "specific criterion 2"],
    "suggested_intent": "Updated intent if needed"
  }},
  "related_updates": [
    {{
      "id": "X.Y.Z",
      "reason": "Why this story needs updating due to changes in {id}",
      "suggested_description": "Updated description if changed",
      "suggested_acceptance": ["updated criteria if changed"]
    }}
  ],
  "summary": "Brief description of what changed and why"
}}

Only include related_updates for stories that actually need changes."#,
        id = story.bare_id(),
        title = story.title,
        description = none(&story.description),
        intent = none(&story.intent),
        tags = list(&story.tags),
        deps = list(&story.depends_on),
        related = as_json_list(related),
    )
}

pub fn align_prompt(prd: &Prd, vision: Option<&str>) -> String {
    let vision = vision
        .or(prd.version.description.as_deref())
        .unwrap_or("(no vision statement; infer it from the stories)");
    format!(
        r#"You are aligning the PRD for version {version} ({title}) with its vision.

VISION:
{vision}

OPEN STORIES:
{stories}

Check whether every story serves the vision, whether gaps need new stories,
and whether some stories should be dropped.

Output ONLY valid JSON:
{{
  "modifications": [
    {{
      "story_id": "X.Y.Z",
      "reason": "why",
      "suggested_title": "optional",
      "suggested_intent": "optional",
      "suggested_acceptance": ["optional"]
    }}
  ],
  "new_stories": [
    {{ "title": "Story title", "intent": "why", "acceptance": ["..."], "phase": 1, "epic": 1, "depends_on": [], "tags": [] }}
  ],
  "removals": ["X.Y.Z"],
  "summary": "Brief explanation"
}}"#,
        version = prd.version.id,
        title = prd.version.title,
        stories = as_json_list(&open_stories(prd)),
    )
}

impl Store {
    /// Build the agent prompt for a queued task from the current PRD.
    pub fn task_prompt(&self, task: &Task) -> Result<String> {
        let version = task
            .version
            .as_deref()
            .ok_or_else(|| RalphError::invalid_field("version", "is required"))?;
        let prd = self.get_prd(version)?;
        match task.kind {
            TaskKind::Refine => Ok(refine_prompt(&prd)),
            TaskKind::Generate => {
                let p: GenerateParams = params(task)?;
                Ok(generate_prompt(&prd, &p.description))
            }
            TaskKind::StoryEdit => {
                let p: StoryEditParams = params(task)?;
                let story = self
                    .find_story_in(version, &p.story_id)?
                    .ok_or_else(|| RalphError::StoryNotFound(p.story_id.clone()))?;
                let related = related_stories(&story, &prd.stories);
                Ok(story_edit_prompt(&story, &related, &p.requested_changes))
            }
            TaskKind::Align => {
                let p: AlignParams = params(task)?;
                Ok(align_prompt(&prd, p.vision.as_deref()))
            }
        }
    }

    /// Decorate the agent's JSON answer before it is stored as the task
    /// result. Story edits get the target id and related story titles.
    pub fn task_result(&self, task: &Task, mut value: serde_json::Value) -> Result<serde_json::Value> {
        if task.kind != TaskKind::StoryEdit {
            return Ok(value);
        }
        let p: StoryEditParams = params(task)?;
        let story = match task.version.as_deref() {
            Some(version) => self
                .find_story_in(version, &p.story_id)?
                .ok_or_else(|| RalphError::StoryNotFound(p.story_id.clone()))?,
            None => self.get_story(&p.story_id)?,
        };
        let all = self.list_stories(Some(&story.version))?;
        if let Some(updates) = value
            .get_mut("related_updates")
            .and_then(|u| u.as_array_mut())
        {
            for update in updates.iter_mut() {
                let title = update
                    .get("id")
                    .and_then(|id| id.as_str())
                    .and_then(|id| all.iter().find(|s| s.id == id || s.bare_id() == id.trim()))
                    .map(|s| s.title.clone());
                if let (Some(title), Some(obj)) = (title, update.as_object_mut()) {
                    obj.entry("title").or_insert(serde_json::Value::String(title));
                }
            }
        }
        if let Some(obj) = value.as_object_mut() {
            obj.insert("storyId".into(), story.id.clone().into());
            obj.insert(
                "relatedStories".into(),
                related_stories(&story, &all)
                    .iter()
                    .map(|s| serde_json::json!({ "id": s.id, "title": s.title }))
                    .collect::<Vec<_>>()
                    .into(),
            );
        }
        Ok(value)
    }
}
