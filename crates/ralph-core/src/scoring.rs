use crate::story::Story;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

pub const PROXIMITY_WEIGHT: f64 = 5.0;
pub const TAG_OVERLAP_WEIGHT: f64 = 3.0;
pub const BLOCKER_WEIGHT: f64 = 2.0;
pub const PRIORITY_WEIGHT: f64 = 1.0;
pub const SIMPLICITY_WEIGHT: f64 = 0.5;

// ---------------------------------------------------------------------------
// ScoredStory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ScoreBreakdown {
    /// 1.0 same epic as the last completed story, 0.5 same phase.
    pub proximity: f64,
    /// Jaccard overlap of tags with the last completed story.
    pub tag_overlap: f64,
    /// Share of up to ten pending stories this one unblocks.
    pub blocker_value: f64,
    pub priority: f64,
    /// Inverse of the acceptance-criteria count.
    pub simplicity: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.proximity * PROXIMITY_WEIGHT
            + self.tag_overlap * TAG_OVERLAP_WEIGHT
            + self.blocker_value * BLOCKER_WEIGHT
            + self.priority * PRIORITY_WEIGHT
            + self.simplicity * SIMPLICITY_WEIGHT
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredStory {
    pub story_id: String,
    pub title: String,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    #[serde(skip)]
    sort_key: (u32, u32, u32),
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

fn proximity(story: &Story, last: Option<&Story>) -> f64 {
    match last {
        Some(l) if l.version == story.version && l.phase == story.phase => {
            if l.epic == story.epic {
                1.0
            } else {
                0.5
            }
        }
        _ => 0.0,
    }
}

fn tag_overlap(story: &Story, last: Option<&Story>) -> f64 {
    let Some(last) = last else { return 0.0 };
    let a: HashSet<&str> = story.tags.iter().map(String::as_str).collect();
    let b: HashSet<&str> = last.tags.iter().map(String::as_str).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Number of unfinished stories whose dependencies name `story`, directly or
/// through a cohort.
pub fn unblocks(story: &Story, all: &[Story]) -> usize {
    all.iter()
        .filter(|other| other.id != story.id && !other.is_done())
        .filter(|other| {
            other
                .dependencies()
                .iter()
                .any(|d| d.covers(story, &other.version))
        })
        .count()
}

fn simplicity(story: &Story) -> f64 {
    match story.acceptance.len() {
        0 => 1.0,
        n => 1.0 / n as f64,
    }
}

pub fn breakdown(story: &Story, all: &[Story], last: Option<&Story>) -> ScoreBreakdown {
    ScoreBreakdown {
        proximity: proximity(story, last),
        tag_overlap: tag_overlap(story, last),
        blocker_value: (unblocks(story, all) as f64 / 10.0).min(1.0),
        priority: (story.priority as f64 / 10.0).min(1.0),
        simplicity: simplicity(story),
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Score every runnable story of `version`, best first. Ties go to the
/// lowest `phase.epic.story_number`. `all` is used for dependency checks and
/// may span versions.
pub fn score_stories(all: &[Story], version: &str, last_completed: Option<&str>) -> Vec<ScoredStory> {
    let last = last_completed.and_then(|id| all.iter().find(|s| s.id == id));
    let mut scored: Vec<ScoredStory> = all
        .iter()
        .filter(|s| s.version == version && s.is_runnable(all))
        .map(|s| {
            let breakdown = breakdown(s, all, last);
            ScoredStory {
                story_id: s.id.clone(),
                title: s.title.clone(),
                score: breakdown.total(),
                breakdown,
                sort_key: s.sort_key(),
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.sort_key.cmp(&b.sort_key))
    });
    scored
}

/// The story the orchestrator should work on next, if any.
pub fn next_story<'a>(
    all: &'a [Story],
    version: &str,
    last_completed: Option<&str>,
) -> Option<&'a Story> {
    let best = score_stories(all, version, last_completed).into_iter().next()?;
    all.iter().find(|s| s.id == best.story_id)
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
    fn ties_go_to_lowest_id() {
        let all = vec![
            test_story("2.1.1", "v0.1"),
            test_story("1.2.1", "v0.1"),
            test_story("1.1.2", "v0.1"),
        ];
        let ids: Vec<_> = score_stories(&all, "v0.1", None)
            .into_iter()
            .map(|s| s.story_id)
            .collect();
        assert_eq!(ids, vec!["v0.1:1.1.2", "v0.1:1.2.1", "v0.1:2.1.1"]);
    }

    #[test]
    fn blocked_and_done_stories_are_not_candidates() {
        let mut waiting = test_story("1.1.2", "v0.1");
        waiting.depends_on = vec!["1.1.1".into()];
        let mut passed = test_story("1.1.3", "v0.1");
        passed.passes = true;
        let all = vec![test_story("1.1.1", "v0.1"), waiting, passed];
        let ids: Vec<_> = score_stories(&all, "v0.1", None)
            .into_iter()
            .map(|s| s.story_id)
            .collect();
        assert_eq!(ids, vec!["v0.1:1.1.1"]);
    }

    #[test]
    fn proximity_prefers_same_epic() {
        let last = merged("2.1.1");
        let all = vec![
            last,
            test_story("1.1.1", "v0.1"),
            test_story("2.2.1", "v0.1"),
            test_story("2.1.2", "v0.1"),
        ];
        let scored = score_stories(&all, "v0.1", Some("v0.1:2.1.1"));
        assert_eq!(scored[0].story_id, "v0.1:2.1.2");
        assert_eq!(scored[0].breakdown.proximity, 1.0);
        assert_eq!(scored[1].story_id, "v0.1:2.2.1");
        assert_eq!(scored[1].breakdown.proximity, 0.5);
    }

    #[test]
    fn tag_overlap_uses_jaccard() {
        let mut last = merged("1.1.1");
        last.tags = vec!["api".into(), "auth".into()];
        let mut s = test_story("3.1.1", "v0.1");
        s.tags = vec!["auth".into(), "ui".into()];
        let b = breakdown(&s, &[last.clone(), s.clone()], Some(&last));
        assert!((b.tag_overlap - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn blocker_value_counts_direct_and_cohort_dependents() {
        let root = test_story("1.1.1", "v0.1");
        let mut direct = test_story("1.2.1", "v0.1");
        direct.depends_on = vec!["1.1.1".into()];
        let mut cohort = test_story("2.1.1", "v0.1");
        cohort.depends_on = vec!["1:1".into()];
        let mut done = test_story("2.1.2", "v0.1");
        done.depends_on = vec!["1.1.1".into()];
        done.passes = true;
        let all = vec![root.clone(), direct, cohort, done];
        assert_eq!(unblocks(&root, &all), 2);

        let scored = score_stories(&all, "v0.1", None);
        assert_eq!(scored[0].story_id, "v0.1:1.1.1");
        assert!((scored[0].breakdown.blocker_value - 0.2).abs() < 1e-9);
    }

    #[test]
    fn simpler_story_wins_otherwise_equal() {
        let mut big = test_story("1.1.1", "v0.1");
        big.acceptance = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        let small = test_story("1.1.2", "v0.1");
        let all = vec![big, small];
        assert_eq!(next_story(&all, "v0.1", None).unwrap().id, "v0.1:1.1.2");
    }

    #[test]
    fn other_versions_are_ignored() {
        let all = vec![test_story("1.1.1", "v0.2")];
        assert!(next_story(&all, "v0.1", None).is_none());
    }
}
