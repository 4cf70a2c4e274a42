//! Dependency references between stories.
//!
//! A `depends_on` entry names either one story or a cohort of stories:
//!
//! | written as            | resolves to                         | met when            |
//! |-----------------------|-------------------------------------|---------------------|
//! | `1.2.3`, `STORY-1.2.3`| the single story                    | it is merged        |
//! | `1:2`                 | every story in phase 1, epic 2      | all merged, >= 1    |
//! | `1`                   | every story in phase 1              | all merged, >= 1    |
//!
//! Any form may carry a `vX.Y:` prefix to point into another version;
//! otherwise the dependent story's own version is used.

use crate::error::RalphError;
use crate::story::Story;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

static DEP_RE: OnceLock<Regex> = OnceLock::new();

fn dep_re() -> &'static Regex {
    DEP_RE.get_or_init(|| {
        Regex::new(
            r"^(?:(?P<v>v\d+(?:\.\d+)*):)?(?:(?:STORY-)?(?P<sp>\d+)\.(?P<se>\d+)\.(?P<sn>\d+)|(?P<ep>\d+):(?P<ee>\d+)|(?P<pp>\d+))$",
        )
        .unwrap()
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DepRef {
    Story {
        version: Option<String>,
        phase: u32,
        epic: u32,
        number: u32,
    },
    PhaseEpic {
        version: Option<String>,
        phase: u32,
        epic: u32,
    },
    Phase {
        version: Option<String>,
        phase: u32,
    },
}

impl std::str::FromStr for DepRef {
    type Err = RalphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RalphError::InvalidDependency(s.to_string());
        let caps = dep_re().captures(s.trim()).ok_or_else(invalid)?;
        let num = |name: &str| -> Result<u32, RalphError> {
            caps.name(name)
                .ok_or_else(invalid)?
                .as_str()
                .parse()
                .map_err(|_| invalid())
        };
        let version = caps.name("v").map(|m| m.as_str().to_string());

        if caps.name("sp").is_some() {
            Ok(DepRef::Story {
                version,
                phase: num("sp")?,
                epic: num("se")?,
                number: num("sn")?,
            })
        } else if caps.name("ep").is_some() {
            Ok(DepRef::PhaseEpic {
                version,
                phase: num("ep")?,
                epic: num("ee")?,
            })
        } else {
            Ok(DepRef::Phase {
                version,
                phase: num("pp")?,
            })
        }
    }
}

impl fmt::Display for DepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = |v: &Option<String>| v.as_ref().map(|v| format!("{v}:")).unwrap_or_default();
        match self {
            DepRef::Story {
                version,
                phase,
                epic,
                number,
            } => write!(f, "{}{phase}.{epic}.{number}", prefix(version)),
            DepRef::PhaseEpic {
                version,
                phase,
                epic,
            } => write!(f, "{}{phase}:{epic}", prefix(version)),
            DepRef::Phase { version, phase } => write!(f, "{}{phase}", prefix(version)),
        }
    }
}

impl DepRef {
    fn version(&self) -> Option<&str> {
        match self {
            DepRef::Story { version, .. }
            | DepRef::PhaseEpic { version, .. }
            | DepRef::Phase { version, .. } => version.as_deref(),
        }
    }

    pub fn is_cohort(&self) -> bool {
        !matches!(self, DepRef::Story { .. })
    }

    /// Whether `story` is (one of) the stories this reference resolves to,
    /// when written by a story in `context_version`.
    pub fn covers(&self, story: &Story, context_version: &str) -> bool {
        let version = self.version().unwrap_or(context_version);
        if story.version != version {
            return false;
        }
        match *self {
            DepRef::Story {
                phase,
                epic,
                number,
                ..
            } => story.sort_key() == (phase, epic, number),
            DepRef::PhaseEpic { phase, epic, .. } => story.phase == phase && story.epic == epic,
            DepRef::Phase { phase, .. } => story.phase == phase,
        }
    }

    /// Single-story references need that story merged. Cohorts need every
    /// member merged and at least one member.
    pub fn is_met(&self, all: &[Story], context_version: &str) -> bool {
        let mut members = all.iter().filter(|s| self.covers(s, context_version)).peekable();
        if members.peek().is_none() {
            return false;
        }
        members.all(|s| s.merged)
    }
}

/// Parse and evaluate a raw `depends_on` entry. Unparseable entries are never met.
pub fn is_dependency_met(dep: &str, all: &[Story], context_version: &str) -> bool {
    match dep.parse::<DepRef>() {
        Ok(r) => r.is_met(all, context_version),
        Err(_) => false,
    }
}

/// Check every entry of a `depends_on` list, returning the first malformed one.
pub fn validate_dependencies(deps: &[String]) -> Result<(), RalphError> {
    for d in deps {
        d.parse::<DepRef>()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::test_story;

    fn merged(id: &str) -> Story {
        let mut s = test_story(id, "v0.1");
        s.passes = true;
        s.merged = true;
        s
    }

    #[test]
    fn parses_all_forms() {
        assert_eq!(
            "1.2.3".parse::<DepRef>().unwrap(),
            DepRef::Story {
                version: None,
                phase: 1,
                epic: 2,
                number: 3
            }
        );
        assert_eq!(
            "STORY-1.2.3".parse::<DepRef>().unwrap(),
            "1.2.3".parse::<DepRef>().unwrap()
        );
        assert_eq!(
            "2:1".parse::<DepRef>().unwrap(),
            DepRef::PhaseEpic {
                version: None,
                phase: 2,
                epic: 1
            }
        );
        assert_eq!(
            "3".parse::<DepRef>().unwrap(),
            DepRef::Phase {
                version: None,
                phase: 3
            }
        );
        assert_eq!(
            "v0.1:1.1.1".parse::<DepRef>().unwrap(),
            DepRef::Story {
                version: Some("v0.1".into()),
                phase: 1,
                epic: 1,
                number: 1
            }
        );
    }

    #[test]
    fn rejects_unknown_forms() {
        for bad in ["", "story 1", "1.2", "1:2:3", "STORY-1:2", "x"] {
            assert!(bad.parse::<DepRef>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn display_round_trips_canonical_form() {
        for s in ["1.2.3", "2:1", "3", "v0.2:1.1.1", "v0.2:4"] {
            assert_eq!(s.parse::<DepRef>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn single_story_requires_merged() {
        let mut only_passed = test_story("1.1.1", "v0.1");
        only_passed.passes = true;
        assert!(!is_dependency_met("1.1.1", &[only_passed], "v0.1"));
        assert!(is_dependency_met("STORY-1.1.1", &[merged("1.1.1")], "v0.1"));
        assert!(!is_dependency_met("9.9.9", &[merged("1.1.1")], "v0.1"));
    }

    #[test]
    fn phase_epic_cohort_requires_every_member_merged() {
        let all = vec![merged("1.2.1"), merged("1.2.2"), test_story("1.3.1", "v0.1")];
        assert!(is_dependency_met("1:2", &all, "v0.1"));

        let mut all = all;
        all.push(test_story("1.2.3", "v0.1"));
        assert!(!is_dependency_met("1:2", &all, "v0.1"));
    }

    #[test]
    fn empty_cohort_is_not_met() {
        let all = vec![merged("1.1.1")];
        assert!(!is_dependency_met("1:5", &all, "v0.1"));
        assert!(!is_dependency_met("4", &all, "v0.1"));
    }

    #[test]
    fn phase_cohort_spans_epics() {
        let all = vec![merged("2.1.1"), merged("2.2.1")];
        assert!(is_dependency_met("2", &all, "v0.1"));
        let mut all = all;
        all.push(test_story("2.3.1", "v0.1"));
        assert!(!is_dependency_met("2", &all, "v0.1"));
    }

    #[test]
    fn unscoped_refs_stay_in_context_version() {
        let mut other = merged("1.1.1");
        other.version = "v0.2".into();
        assert!(!is_dependency_met("1.1.1", &[other.clone()], "v0.1"));
        assert!(is_dependency_met("v0.2:1.1.1", &[other], "v0.1"));
    }

    #[test]
    fn malformed_dependency_is_never_met() {
        assert!(!is_dependency_met("whenever", &[merged("1.1.1")], "v0.1"));
        assert!(validate_dependencies(&["1.1.1".into(), "whenever".into()]).is_err());
    }
}
