use crate::deps::DepRef;
use crate::error::{RalphError, Result};
use crate::types::StoryStatus;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Story id
// ---------------------------------------------------------------------------

static STORY_ID_RE: OnceLock<Regex> = OnceLock::new();

fn story_id_re() -> &'static Regex {
    STORY_ID_RE.get_or_init(|| {
        Regex::new(r"^(?:([A-Za-z0-9][A-Za-z0-9._-]*):)?(?:STORY-)?(\d+)\.(\d+)\.(\d+)$").unwrap()
    })
}

/// A parsed story id: `P.E.N`, optionally `STORY-` and/or `vX.Y:` prefixed.
///
/// Stories are stored under their version-scoped form (`v0.2:1.1.1`) so
/// each version can number its stories from `1.1.1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryId {
    pub version: Option<String>,
    pub phase: u32,
    pub epic: u32,
    pub number: u32,
}

impl StoryId {
    pub fn parse(s: &str) -> Result<Self> {
        let caps = story_id_re().captures(s.trim()).ok_or_else(|| {
            RalphError::invalid_field("story id", format!("'{s}' is not of the form P.E.N"))
        })?;
        let num = |i: usize| -> Result<u32> {
            caps[i]
                .parse()
                .map_err(|_| RalphError::invalid_field("story id", format!("'{s}' is out of range")))
        };
        Ok(StoryId {
            version: caps.get(1).map(|m| m.as_str().to_string()),
            phase: num(2)?,
            epic: num(3)?,
            number: num(4)?,
        })
    }

    /// `P.E.N` without any prefix.
    pub fn bare(&self) -> String {
        format!("{}.{}.{}", self.phase, self.epic, self.number)
    }

    /// `STORY-` dropped, version prefix kept when one was written.
    pub fn canonical(&self) -> String {
        match &self.version {
            Some(v) => format!("{v}:{}", self.bare()),
            None => self.bare(),
        }
    }

    /// Stored key of this story inside `version`.
    pub fn scoped(&self, version: &str) -> String {
        format!("{version}:{}", self.bare())
    }
}

// ---------------------------------------------------------------------------
// Story
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalDep {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub version: String,
    pub phase: u32,
    pub epic: u32,
    pub story_number: u32,
    pub title: String,
    pub intent: Option<String>,
    pub description: Option<String>,
    pub acceptance: Vec<String>,
    pub depends_on: Vec<String>,
    pub external_deps: Vec<ExternalDep>,
    pub tags: Vec<String>,
    pub priority: u32,
    pub passes: bool,
    pub merged: bool,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub pr_url: Option<String>,
    pub merge_commit: Option<String>,
    pub working_branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    /// Derive the lifecycle status from the flags. `current_story` is the
    /// run's active story, which is the only source of `in_progress`.
    pub fn status(&self, current_story: Option<&str>) -> StoryStatus {
        if self.merged {
            StoryStatus::Merged
        } else if self.skipped {
            StoryStatus::Skipped
        } else if self.passes {
            StoryStatus::Passed
        } else if current_story == Some(self.id.as_str()) {
            StoryStatus::InProgress
        } else {
            StoryStatus::Pending
        }
    }

    /// `P.E.N` with any version prefix removed.
    pub fn bare_id(&self) -> &str {
        match self.id.split_once(':') {
            Some((_, rest)) => rest,
            None => &self.id,
        }
    }

    pub fn sort_key(&self) -> (u32, u32, u32) {
        (self.phase, self.epic, self.story_number)
    }

    pub fn is_done(&self) -> bool {
        self.passes || self.merged || self.skipped
    }

    /// Parsed dependency references. Malformed entries are dropped here;
    /// they are rejected on write.
    pub fn dependencies(&self) -> Vec<DepRef> {
        self.depends_on
            .iter()
            .filter_map(|d| d.parse().ok())
            .collect()
    }

    /// Not done and every dependency met against `all`.
    pub fn is_runnable(&self, all: &[Story]) -> bool {
        !self.is_done()
            && self
                .depends_on
                .iter()
                .all(|d| crate::deps::is_dependency_met(d, all, &self.version))
    }

    /// Dependencies that are not yet met, as written.
    pub fn unmet_dependencies<'a>(&'a self, all: &[Story]) -> Vec<&'a str> {
        self.depends_on
            .iter()
            .filter(|d| !crate::deps::is_dependency_met(d, all, &self.version))
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn test_story(id: &str, version: &str) -> Story {
    let parsed = StoryId::parse(id).unwrap();
    let now = Utc::now();
    Story {
        id: parsed.scoped(version),
        version: version.to_string(),
        phase: parsed.phase,
        epic: parsed.epic,
        story_number: parsed.number,
        title: format!("Story {id}"),
        intent: Some("As a user I want things".into()),
        description: None,
        acceptance: vec!["It works end to end".into()],
        depends_on: Vec::new(),
        external_deps: Vec::new(),
        tags: Vec::new(),
        priority: 0,
        passes: false,
        merged: false,
        skipped: false,
        skip_reason: None,
        pr_url: None,
        merge_commit: None,
        working_branch: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_prefixed_ids() {
        let id = StoryId::parse("1.2.3").unwrap();
        assert_eq!((id.phase, id.epic, id.number), (1, 2, 3));
        assert_eq!(id.version, None);

        let id = StoryId::parse("STORY-4.5.6").unwrap();
        assert_eq!(id.canonical(), "4.5.6");

        let id = StoryId::parse("v0.2:1.1.1").unwrap();
        assert_eq!(id.version.as_deref(), Some("v0.2"));
        assert_eq!(id.canonical(), "v0.2:1.1.1");
        assert_eq!(id.bare(), "1.1.1");

        let id = StoryId::parse("STORY-1.1.1").unwrap();
        assert_eq!(id.scoped("v0.3"), "v0.3:1.1.1");
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(StoryId::parse("1.2").is_err());
        assert!(StoryId::parse("abc").is_err());
        assert!(StoryId::parse("1.2.3.4").is_err());
    }

    #[test]
    fn derived_status_has_one_value() {
        let mut s = test_story("1.1.1", "v0.1");
        assert_eq!(s.status(None), StoryStatus::Pending);
        assert_eq!(s.status(Some("v0.1:1.1.1")), StoryStatus::InProgress);
        assert_eq!(s.status(Some("v0.2:1.1.1")), StoryStatus::Pending);

        s.passes = true;
        assert_eq!(s.status(Some("v0.1:1.1.1")), StoryStatus::Passed);

        s.skipped = true;
        assert_eq!(s.status(None), StoryStatus::Skipped);

        s.merged = true;
        assert_eq!(s.status(None), StoryStatus::Merged);
    }

    #[test]
    fn merged_without_passes_is_still_merged() {
        let mut s = test_story("1.1.1", "v0.1");
        s.merged = true;
        assert_eq!(s.status(None), StoryStatus::Merged);
    }

    #[test]
    fn bare_id_strips_version() {
        let s = test_story("v0.3:2.1.4", "v0.3");
        assert_eq!(s.bare_id(), "2.1.4");
    }
}
