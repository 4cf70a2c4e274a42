use crate::db::{json_col, to_json, Store};
use crate::deps::validate_dependencies;
use crate::error::{RalphError, Result};
use crate::story::{ExternalDep, Story, StoryId};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: String,
    pub title: String,
    pub short_title: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    pub phase: u32,
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One version's phases, epics and stories.
#[derive(Debug, Clone, Serialize)]
pub struct Prd {
    pub version: Version,
    pub phases: Vec<Phase>,
    pub epics: Vec<Epic>,
    pub stories: Vec<Story>,
    pub progress: Progress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total: u32,
    pub passed: u32,
    pub merged: u32,
    pub skipped: u32,
    pub percentage: u32,
}

impl Progress {
    pub fn of(stories: &[Story]) -> Self {
        let total = stories.len() as u32;
        let passed = stories.iter().filter(|s| s.passes).count() as u32;
        let merged = stories.iter().filter(|s| s.merged).count() as u32;
        let skipped = stories.iter().filter(|s| s.skipped && !s.merged).count() as u32;
        let percentage = if total == 0 {
            0
        } else {
            (merged * 100 + total / 2) / total
        };
        Progress {
            total,
            passed,
            merged,
            skipped,
            percentage,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionSummary {
    #[serde(flatten)]
    pub version: Version,
    pub progress: Progress,
}

// ---------------------------------------------------------------------------
// Import / patch input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub phase: Option<u32>,
    #[serde(default)]
    pub epic: Option<u32>,
    #[serde(default)]
    pub story_number: Option<u32>,
    pub title: String,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance: Vec<String>,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    #[serde(default, alias = "externalDeps")]
    pub external_deps: Vec<ExternalDep>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub merged: bool,
}

/// A PRD as imported from JSON: one version and its contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrdDocument {
    pub version: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "shortTitle")]
    pub short_title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub epics: Vec<Epic>,
    #[serde(default)]
    pub stories: Vec<StoryInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub version: String,
    pub created: Vec<String>,
    pub updated: Vec<String>,
}

/// Changes proposed by an align task and accepted by the user.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentChanges {
    #[serde(default)]
    pub modifications: Vec<AlignmentModification>,
    #[serde(default, alias = "new_stories")]
    pub new_stories: Vec<StoryInput>,
    #[serde(default)]
    pub removals: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlignmentModification {
    #[serde(alias = "storyId")]
    pub story_id: String,
    #[serde(default)]
    pub suggested_title: Option<String>,
    #[serde(default)]
    pub suggested_intent: Option<String>,
    #[serde(default)]
    pub suggested_acceptance: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlignmentSummary {
    pub applied: u32,
    pub added: u32,
    pub removed: u32,
}

pub const ALIGNMENT_SKIP_REASON: &str = "Removed during alignment: does not serve vision";

/// Partial update of a story. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StoryPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance: Option<Vec<String>>,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Option<Vec<String>>,
    #[serde(default, alias = "externalDeps")]
    pub external_deps: Option<Vec<ExternalDep>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub passes: Option<bool>,
    #[serde(default)]
    pub merged: Option<bool>,
    #[serde(default)]
    pub skipped: Option<bool>,
    #[serde(default, alias = "skipReason")]
    pub skip_reason: Option<String>,
    #[serde(default, alias = "prUrl")]
    pub pr_url: Option<String>,
    #[serde(default, alias = "mergeCommit")]
    pub merge_commit: Option<String>,
    #[serde(default, alias = "workingBranch")]
    pub working_branch: Option<String>,
}

impl StoryPatch {
    /// Apply onto `story`, enforcing that merged stories stay merged.
    pub fn apply(self, story: &mut Story) -> Result<()> {
        if let Some(deps) = &self.depends_on {
            validate_dependencies(deps)?;
        }
        if self.merged == Some(false) && story.merged {
            return Err(RalphError::MergedIsTerminal(story.id.clone()));
        }
        if let Some(title) = self.title {
            if title.trim().is_empty() {
                return Err(RalphError::invalid_field("title", "must not be empty"));
            }
            story.title = title;
        }
        if let Some(v) = self.intent {
            story.intent = Some(v);
        }
        if let Some(v) = self.description {
            story.description = Some(v);
        }
        if let Some(v) = self.acceptance {
            story.acceptance = v;
        }
        if let Some(v) = self.depends_on {
            story.depends_on = v;
        }
        if let Some(v) = self.external_deps {
            story.external_deps = v;
        }
        if let Some(v) = self.tags {
            story.tags = v;
        }
        if let Some(v) = self.priority {
            story.priority = v;
        }
        if let Some(v) = self.passes {
            story.passes = v;
        }
        if let Some(v) = self.merged {
            story.merged = v;
        }
        match self.skipped {
            Some(true) => {
                story.skipped = true;
                story.skip_reason = Some(self.skip_reason.unwrap_or_else(|| "skipped".into()));
            }
            Some(false) => {
                story.skipped = false;
                story.skip_reason = None;
            }
            None => {
                if let Some(reason) = self.skip_reason {
                    story.skip_reason = Some(reason);
                }
            }
        }
        if let Some(v) = self.pr_url {
            story.pr_url = Some(v);
        }
        if let Some(v) = self.merge_commit {
            story.merge_commit = Some(v);
        }
        if let Some(v) = self.working_branch {
            story.working_branch = Some(v);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

impl Story {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Story {
            id: row.get("id")?,
            version: row.get("version_id")?,
            phase: row.get("phase")?,
            epic: row.get("epic")?,
            story_number: row.get("story_number")?,
            title: row.get("title")?,
            intent: row.get("intent")?,
            description: row.get("description")?,
            acceptance: json_col(row, "acceptance")?,
            depends_on: json_col(row, "depends_on")?,
            external_deps: json_col(row, "external_deps")?,
            tags: json_col(row, "tags")?,
            priority: row.get("priority")?,
            passes: row.get("passes")?,
            merged: row.get("merged")?,
            skipped: row.get("skipped")?,
            skip_reason: row.get("skip_reason")?,
            pr_url: row.get("pr_url")?,
            merge_commit: row.get("merge_commit")?,
            working_branch: row.get("working_branch")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl Version {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Version {
            id: row.get("id")?,
            title: row.get("title")?,
            short_title: row.get("short_title")?,
            description: row.get("description")?,
            created_at: row.get("created_at")?,
        })
    }
}

const STORY_ORDER: &str = "ORDER BY version_id, phase, epic, story_number";

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

impl Store {
    pub fn upsert_version(
        &self,
        id: &str,
        title: Option<&str>,
        short_title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Version> {
        if id.trim().is_empty() {
            return Err(RalphError::invalid_field("version", "must not be empty"));
        }
        self.conn.execute(
            "INSERT INTO versions (id, title, short_title, description, created_at)
             VALUES (?1, COALESCE(?2, ?1), ?3, ?4, ?5)
             ON CONFLICT (id) DO UPDATE SET
                 title = COALESCE(?2, versions.title),
                 short_title = COALESCE(?3, versions.short_title),
                 description = COALESCE(?4, versions.description)",
            params![id, title, short_title, description, Utc::now()],
        )?;
        self.get_version(id)
    }

    pub fn get_version(&self, id: &str) -> Result<Version> {
        self.conn
            .query_row(
                "SELECT * FROM versions WHERE id = ?1",
                params![id],
                Version::from_row,
            )
            .optional()?
            .ok_or_else(|| RalphError::VersionNotFound(id.to_string()))
    }

    pub fn list_versions(&self) -> Result<Vec<VersionSummary>> {
        let mut stmt = self.conn.prepare("SELECT * FROM versions ORDER BY id")?;
        let versions = stmt
            .query_map([], Version::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        versions
            .into_iter()
            .map(|version| {
                let stories = self.list_stories(Some(&version.id))?;
                Ok(VersionSummary {
                    progress: Progress::of(&stories),
                    version,
                })
            })
            .collect()
    }

    /// Stories in `(phase, epic, story_number)` order, optionally limited to
    /// one version.
    pub fn list_stories(&self, version: Option<&str>) -> Result<Vec<Story>> {
        let stories = match version {
            Some(v) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT * FROM stories WHERE version_id = ?1 {STORY_ORDER}"
                ))?;
                let rows = stmt.query_map(params![v], Story::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("SELECT * FROM stories {STORY_ORDER}"))?;
                let rows = stmt.query_map([], Story::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(stories)
    }

    /// Look a story up by any accepted id form (`1.2.3`, `STORY-1.2.3`,
    /// `v0.2:1.2.3`). A bare id that exists in several versions resolves to
    /// the version of the running story, else to the newest version.
    pub fn find_story(&self, id: &str) -> Result<Option<Story>> {
        let parsed = match StoryId::parse(id) {
            Ok(parsed) => parsed,
            Err(_) => return self.story_by_key(id.trim()),
        };
        if parsed.version.is_some() {
            return self.story_by_key(&parsed.canonical());
        }
        Ok(self
            .conn
            .query_row(
                "SELECT s.* FROM stories s
                 JOIN versions v ON v.id = s.version_id
                 LEFT JOIN run_state r ON r.id = 1
                 WHERE s.phase = ?1 AND s.epic = ?2 AND s.story_number = ?3
                 ORDER BY COALESCE(substr(r.current_story, 1, length(s.version_id) + 1)
                              = s.version_id || ':', 0) DESC,
                          v.created_at DESC, v.id DESC
                 LIMIT 1",
                params![parsed.phase, parsed.epic, parsed.number],
                Story::from_row,
            )
            .optional()?)
    }

    /// Look a story up inside one version. An id scoped to another version
    /// finds nothing.
    pub fn find_story_in(&self, version: &str, id: &str) -> Result<Option<Story>> {
        match StoryId::parse(id) {
            Ok(parsed) if parsed.version.as_deref().is_some_and(|v| v != version) => Ok(None),
            Ok(parsed) => self.story_by_key(&parsed.scoped(version)),
            Err(_) => Ok(None),
        }
    }

    /// Like [`Store::get_story`], but looks only inside `version` when one
    /// is given.
    pub fn get_story_in(&self, version: Option<&str>, id: &str) -> Result<Story> {
        let found = match version.filter(|v| !v.trim().is_empty()) {
            Some(v) => self.find_story_in(v, id)?,
            None => self.find_story(id)?,
        };
        found.ok_or_else(|| RalphError::StoryNotFound(id.to_string()))
    }

    /// Stored key for `id`, or `id` itself when no story matches.
    pub(crate) fn story_key(&self, id: &str) -> Result<String> {
        Ok(self
            .find_story(id)?
            .map(|s| s.id)
            .unwrap_or_else(|| id.trim().to_string()))
    }

    fn story_by_key(&self, key: &str) -> Result<Option<Story>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM stories WHERE id = ?1",
                params![key],
                Story::from_row,
            )
            .optional()?)
    }

    pub fn get_story(&self, id: &str) -> Result<Story> {
        self.find_story(id)?
            .ok_or_else(|| RalphError::StoryNotFound(id.to_string()))
    }

    pub fn get_prd(&self, version: &str) -> Result<Prd> {
        let version = self.get_version(version)?;

        let mut stmt = self
            .conn
            .prepare("SELECT * FROM phases WHERE version_id = ?1 ORDER BY number")?;
        let phases = stmt
            .query_map(params![version.id], |row| {
                Ok(Phase {
                    number: row.get("number")?,
                    name: row.get("name")?,
                    description: row.get("description")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT * FROM epics WHERE version_id = ?1 ORDER BY phase, number")?;
        let epics = stmt
            .query_map(params![version.id], |row| {
                Ok(Epic {
                    phase: row.get("phase")?,
                    number: row.get("number")?,
                    name: row.get("name")?,
                    description: row.get("description")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let stories = self.list_stories(Some(&version.id))?;
        Ok(Prd {
            progress: Progress::of(&stories),
            version,
            phases,
            epics,
            stories,
        })
    }

    /// Insert or update a version and everything in it. Existing stories keep
    /// their execution flags; `passes`/`merged` can only be raised by import.
    pub fn import_prd(&self, doc: PrdDocument) -> Result<ImportSummary> {
        let tx = self.conn.unchecked_transaction()?;
        self.upsert_version(
            &doc.version,
            doc.title.as_deref(),
            doc.short_title.as_deref(),
            doc.description.as_deref(),
        )?;

        for phase in &doc.phases {
            tx.execute(
                "INSERT INTO phases (version_id, number, name, description) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (version_id, number) DO UPDATE SET
                     name = excluded.name, description = excluded.description",
                params![doc.version, phase.number, phase.name, phase.description],
            )?;
        }
        for epic in &doc.epics {
            tx.execute(
                "INSERT INTO epics (version_id, phase, number, name, description)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (version_id, phase, number) DO UPDATE SET
                     name = excluded.name, description = excluded.description",
                params![doc.version, epic.phase, epic.number, epic.name, epic.description],
            )?;
        }

        let mut summary = ImportSummary {
            version: doc.version.clone(),
            created: Vec::new(),
            updated: Vec::new(),
        };
        for input in doc.stories {
            let parsed = self.resolve_story_id(&doc.version, &input)?;
            let id = parsed.scoped(&doc.version);
            validate_dependencies(&input.depends_on)?;
            if input.title.trim().is_empty() {
                return Err(RalphError::invalid_field(
                    "title",
                    format!("story {id} has an empty title"),
                ));
            }
            let now = Utc::now();

            match self.story_by_key(&id)? {
                Some(_) => {
                    tx.execute(
                        "UPDATE stories SET title = ?1, intent = ?2, description = ?3,
                             acceptance = ?4, depends_on = ?5, external_deps = ?6, tags = ?7,
                             priority = ?8, passes = MAX(passes, ?9), merged = MAX(merged, ?10),
                             updated_at = ?11
                         WHERE id = ?12",
                        params![
                            input.title,
                            input.intent,
                            input.description,
                            to_json(&input.acceptance)?,
                            to_json(&input.depends_on)?,
                            to_json(&input.external_deps)?,
                            to_json(&input.tags)?,
                            input.priority,
                            input.passes,
                            input.merged,
                            now,
                            id,
                        ],
                    )?;
                    summary.updated.push(id);
                }
                None => {
                    tx.execute(
                        "INSERT INTO stories (id, version_id, phase, epic, story_number, title,
                             intent, description, acceptance, depends_on, external_deps, tags,
                             priority, passes, merged, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                             ?16, ?16)",
                        params![
                            id,
                            doc.version,
                            parsed.phase,
                            parsed.epic,
                            parsed.number,
                            input.title,
                            input.intent,
                            input.description,
                            to_json(&input.acceptance)?,
                            to_json(&input.depends_on)?,
                            to_json(&input.external_deps)?,
                            to_json(&input.tags)?,
                            input.priority,
                            input.passes,
                            input.merged,
                            now,
                        ],
                    )?;
                    summary.created.push(id);
                }
            }
        }
        tx.commit()?;
        tracing::info!(
            version = %summary.version,
            created = summary.created.len(),
            updated = summary.updated.len(),
            "prd imported"
        );
        Ok(summary)
    }

    /// Work out the id of an imported story: the given id, or one built
    /// from phase/epic/number, numbering after the epic's last story when no
    /// number is given.
    fn resolve_story_id(&self, version: &str, input: &StoryInput) -> Result<StoryId> {
        if let Some(id) = &input.id {
            let parsed = StoryId::parse(id)?;
            if let Some(scope) = parsed.version.as_deref().filter(|v| *v != version) {
                return Err(RalphError::invalid_field(
                    "id",
                    format!("'{id}' is scoped to {scope} but is imported into {version}"),
                ));
            }
            let mismatch = [
                (input.phase, parsed.phase),
                (input.epic, parsed.epic),
                (input.story_number, parsed.number),
            ]
            .iter()
            .any(|(given, from_id)| given.is_some_and(|g| g != *from_id));
            if mismatch {
                return Err(RalphError::invalid_field(
                    "id",
                    format!("'{id}' disagrees with its phase/epic/story_number"),
                ));
            }
            return Ok(parsed);
        }

        let (Some(phase), Some(epic)) = (input.phase, input.epic) else {
            return Err(RalphError::invalid_field(
                "id",
                format!("story '{}' needs an id or phase and epic", input.title),
            ));
        };
        let number = match input.story_number {
            Some(n) => n,
            None => {
                let max: Option<u32> = self.conn.query_row(
                    "SELECT MAX(story_number) FROM stories
                     WHERE version_id = ?1 AND phase = ?2 AND epic = ?3",
                    params![version, phase, epic],
                    |row| row.get(0),
                )?;
                max.unwrap_or(0) + 1
            }
        };
        Ok(StoryId {
            version: None,
            phase,
            epic,
            number,
        })
    }

    fn write_story(&self, story: &Story) -> Result<()> {
        self.conn.execute(
            "UPDATE stories SET title = ?1, intent = ?2, description = ?3, acceptance = ?4,
                 depends_on = ?5, external_deps = ?6, tags = ?7, priority = ?8, passes = ?9,
                 merged = ?10, skipped = ?11, skip_reason = ?12, pr_url = ?13,
                 merge_commit = ?14, working_branch = ?15, updated_at = ?16
             WHERE id = ?17",
            params![
                story.title,
                story.intent,
                story.description,
                to_json(&story.acceptance)?,
                to_json(&story.depends_on)?,
                to_json(&story.external_deps)?,
                to_json(&story.tags)?,
                story.priority,
                story.passes,
                story.merged,
                story.skipped,
                story.skip_reason,
                story.pr_url,
                story.merge_commit,
                story.working_branch,
                Utc::now(),
                story.id,
            ],
        )?;
        Ok(())
    }

    pub fn update_story(&self, id: &str, patch: StoryPatch) -> Result<Story> {
        let mut story = self.get_story(id)?;
        patch.apply(&mut story)?;
        self.write_story(&story)?;
        tracing::debug!(story = %story.id, "story updated");
        self.get_story(&story.id)
    }

    /// Mark a story passed. Calling it again is a no-op.
    pub fn mark_passed(&self, id: &str) -> Result<Story> {
        self.update_story(
            id,
            StoryPatch {
                passes: Some(true),
                ..Default::default()
            },
        )
    }

    pub fn mark_merged(&self, id: &str, merge_commit: Option<&str>) -> Result<Story> {
        self.update_story(
            id,
            StoryPatch {
                passes: Some(true),
                merged: Some(true),
                merge_commit: merge_commit.map(str::to_string),
                ..Default::default()
            },
        )
    }

    /// Soft-skip a story; stories are never deleted.
    pub fn skip_story(&self, id: &str, reason: &str) -> Result<Story> {
        self.update_story(
            id,
            StoryPatch {
                skipped: Some(true),
                skip_reason: Some(reason.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn set_pr_url(&self, id: &str, url: &str) -> Result<Story> {
        self.update_story(
            id,
            StoryPatch {
                pr_url: Some(url.to_string()),
                ..Default::default()
            },
        )
    }

    /// Apply accepted alignment changes. Unknown story ids are ignored;
    /// removals soft-skip and never touch merged stories.
    pub fn apply_alignment(&self, version: &str, changes: AlignmentChanges) -> Result<AlignmentSummary> {
        self.get_version(version)?;
        let mut summary = AlignmentSummary::default();

        for m in changes.modifications {
            let Some(story) = self.find_story_in(version, &m.story_id)? else {
                continue;
            };
            let patch = StoryPatch {
                title: m.suggested_title.filter(|t| !t.trim().is_empty()),
                intent: m.suggested_intent,
                acceptance: m.suggested_acceptance,
                ..Default::default()
            };
            if patch.title.is_none() && patch.intent.is_none() && patch.acceptance.is_none() {
                continue;
            }
            self.update_story(&story.id, patch)?;
            summary.applied += 1;
        }

        if !changes.new_stories.is_empty() {
            let stories = changes
                .new_stories
                .into_iter()
                .map(|s| StoryInput {
                    id: None,
                    story_number: None,
                    passes: false,
                    merged: false,
                    ..s
                })
                .collect();
            let imported = self.import_prd(PrdDocument {
                version: version.to_string(),
                stories,
                ..Default::default()
            })?;
            summary.added = imported.created.len() as u32;
        }

        for id in changes.removals {
            match self.find_story_in(version, &id)? {
                Some(story) if !story.merged && !story.skipped => {
                    self.skip_story(&story.id, ALIGNMENT_SKIP_REASON)?;
                    summary.removed += 1;
                }
                _ => {}
            }
        }
        tracing::info!(
            version,
            applied = summary.applied,
            added = summary.added,
            removed = summary.removed,
            "alignment applied"
        );
        Ok(summary)
    }

    pub fn set_working_branch(&self, id: &str, branch: &str) -> Result<Story> {
        self.update_story(
            id,
            StoryPatch {
                working_branch: Some(branch.to_string()),
                ..Default::default()
            },
        )
    }
}
