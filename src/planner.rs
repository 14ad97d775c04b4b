//! Request planning for the orchestrator.
//!
//! A request is split into parts (lines, list items, `;` and sentences).
//! Inside a part, `then` markers chain steps one after another, `A after B`
//! runs `B` first, and `and` fans out into parallel sub-tasks when every side
//! reads as a task of its own. A part opening with `after that`, `then` or
//! similar waits for the part before it.

use std::cmp::Reverse;

use crate::error::{ConclaveError, Result};
use crate::parser::RuleTable;
use crate::task::OperationKind;

const SEQUENCE_MARKERS: &[&str] = &[", and then ", " and then ", ", then ", " then "];
const PARALLEL_MARKERS: &[&str] = &[" and "];
const PART_MARKERS: &[&str] = &[";", ". "];
const AFTER_MARKER: &str = " after ";
const FOLLOW_MARKERS: &[&str] = &[
    "after that",
    "after this",
    "afterwards",
    "and then",
    "then",
    "next",
    "finally",
];

/// One unit of a planned request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subtask {
    pub description: String,
    pub kind: OperationKind,
    /// Role that should handle it; `None` for generic work
    pub role: Option<String>,
    /// Indices of sub-tasks that must complete first
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct Planner {
    rules: RuleTable,
}

impl Planner {
    pub fn new(rules: RuleTable) -> Self {
        Self { rules }
    }

    /// Operation kind and target role for a description
    pub fn classify(&self, text: &str) -> (OperationKind, Option<String>) {
        match self.rules.classify(text) {
            Some(found) => (found.rule.kind, Some(found.rule.role.clone())),
            None => (OperationKind::Generic, None),
        }
    }

    /// Break `request` into sub-tasks, in an order where prerequisites come first
    pub fn plan(&self, request: &str) -> Result<Vec<Subtask>> {
        let mut subtasks: Vec<Subtask> = Vec::new();
        let mut last_stage: Vec<usize> = Vec::new();

        for part in split_parts(request) {
            let (body, follows) = strip_follow_marker(part);
            let mut previous = if follows { last_stage.clone() } else { Vec::new() };

            for stage in self.stages(body) {
                let mut current = Vec::with_capacity(stage.len());
                for piece in stage {
                    let (kind, role) = self.classify(piece);
                    current.push(subtasks.len());
                    subtasks.push(Subtask {
                        description: piece.to_string(),
                        kind,
                        role,
                        depends_on: previous.clone(),
                    });
                }
                previous = current;
            }
            last_stage = previous;
        }

        if subtasks.is_empty() {
            return Err(ConclaveError::Validation("request is empty".into()));
        }
        Ok(subtasks)
    }

    fn stages<'a>(&self, body: &'a str) -> Vec<Vec<&'a str>> {
        let mut stages = Vec::new();
        for step in split_on(body, SEQUENCE_MARKERS) {
            match self.split_after(step) {
                Some((first, then)) => {
                    stages.push(self.parallel(first));
                    stages.push(self.parallel(then));
                }
                None => stages.push(self.parallel(step)),
            }
        }
        stages.retain(|stage| !stage.is_empty());
        stages
    }

    /// `A after B` as `(B, A)` when both sides are tasks
    fn split_after<'a>(&self, step: &'a str) -> Option<(&'a str, &'a str)> {
        let at = step.to_ascii_lowercase().find(AFTER_MARKER)?;
        let then = clean(&step[..at]);
        let first = clean(&step[at + AFTER_MARKER.len()..]);
        let both = self.rules.classify(then).is_some() && self.rules.classify(first).is_some();
        both.then_some((first, then))
    }

    fn parallel<'a>(&self, step: &'a str) -> Vec<&'a str> {
        let pieces = split_on(step, PARALLEL_MARKERS);
        if pieces.len() > 1 && pieces.iter().all(|p| self.rules.classify(p).is_some()) {
            return pieces;
        }
        let whole = clean(step);
        if whole.is_empty() {
            Vec::new()
        } else {
            vec![whole]
        }
    }
}

fn clean(text: &str) -> &str {
    text.trim_matches(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | ';' | ':'))
}

/// Split on any of `markers` (ASCII, case-insensitive), dropping empty pieces
fn split_on<'a>(text: &'a str, markers: &[&str]) -> Vec<&'a str> {
    // ASCII lowercasing keeps byte offsets aligned with `text`.
    let lower = text.to_ascii_lowercase();
    let mut pieces = Vec::new();
    let mut start = 0;

    while let Some((at, len)) = markers
        .iter()
        .filter_map(|m| lower[start..].find(m).map(|i| (start + i, m.len())))
        .min_by_key(|&(at, len)| (at, Reverse(len)))
    {
        pieces.push(&text[start..at]);
        start = at + len;
    }
    pieces.push(&text[start..]);

    pieces
        .into_iter()
        .map(clean)
        .filter(|p| !p.is_empty())
        .collect()
}

fn split_parts(request: &str) -> Vec<&str> {
    request
        .lines()
        .map(strip_bullet)
        .flat_map(|line| split_on(line, PART_MARKERS))
        .map(strip_bullet)
        // Leftover list numbers such as the "2" in "...; 2. next item"
        .filter(|part| !part.chars().all(|c| c.is_ascii_digit()))
        .collect()
}

fn strip_bullet(line: &str) -> &str {
    let line = line.trim_start();
    for bullet in ["- ", "* ", "• "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            return rest;
        }
    }
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest;
        }
    }
    line
}

/// Leading "after that" and friends, or an `after <clause>,` prefix
fn strip_follow_marker(part: &str) -> (&str, bool) {
    let lower = part.to_ascii_lowercase();
    for marker in FOLLOW_MARKERS {
        if !lower.starts_with(marker) {
            continue;
        }
        let rest = &part[marker.len()..];
        if rest.chars().next().map_or(true, |c| !c.is_alphanumeric()) {
            return (clean(rest), true);
        }
    }
    if lower.starts_with("after ") {
        if let Some(comma) = part.find(',') {
            return (clean(&part[comma + 1..]), true);
        }
    }
    (part, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(request: &str) -> Vec<Subtask> {
        Planner::default().plan(request).unwrap()
    }

    #[test]
    fn test_single_request() {
        let subtasks = plan("implement login form");
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].description, "implement login form");
        assert_eq!(subtasks[0].kind, OperationKind::Implementation);
        assert_eq!(subtasks[0].role.as_deref(), Some("coding"));
        assert!(subtasks[0].depends_on.is_empty());
    }

    #[test]
    fn test_generic_request_has_no_role() {
        let subtasks = plan("tidy the backlog");
        assert_eq!(subtasks[0].kind, OperationKind::Generic);
        assert!(subtasks[0].role.is_none());
    }

    #[test]
    fn test_conjunction_fans_out() {
        let subtasks = plan("research OAuth providers and implement the login flow");
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].role.as_deref(), Some("research"));
        assert_eq!(subtasks[1].role.as_deref(), Some("coding"));
        assert!(subtasks.iter().all(|s| s.depends_on.is_empty()));
    }

    #[test]
    fn test_conjunction_inside_one_task_is_kept() {
        let subtasks = plan("add salt and pepper to the config");
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].description, "add salt and pepper to the config");
    }

    #[test]
    fn test_then_sequences() {
        let subtasks = plan("implement login form, then write tests for it");
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[1].kind, OperationKind::Testing);
        assert_eq!(subtasks[1].depends_on, vec![0]);
    }

    #[test]
    fn test_after_runs_prerequisite_first() {
        let subtasks = plan("write tests for login after you implement the form");
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].description, "you implement the form");
        assert_eq!(subtasks[0].role.as_deref(), Some("coding"));
        assert_eq!(subtasks[1].role.as_deref(), Some("testing"));
        assert_eq!(subtasks[1].depends_on, vec![0]);
    }

    #[test]
    fn test_parallel_stage_then_join() {
        let subtasks = plan("research caching and implement the cache layer, then test the cache");
        assert_eq!(subtasks.len(), 3);
        assert!(subtasks[0].depends_on.is_empty());
        assert!(subtasks[1].depends_on.is_empty());
        assert_eq!(subtasks[2].depends_on, vec![0, 1]);
    }

    #[test]
    fn test_list_items_with_follow_marker() {
        let subtasks = plan(
            "- research caching strategies\n\
             - implement the cache layer\n\
             - after that, document the cache",
        );
        assert_eq!(subtasks.len(), 3);
        assert!(subtasks[1].depends_on.is_empty());
        assert_eq!(subtasks[2].description, "document the cache");
        assert_eq!(subtasks[2].depends_on, vec![1]);
    }

    #[test]
    fn test_numbered_and_sentence_parts() {
        let subtasks = plan("1. implement signup; 2) test signup. Finally document signup.");
        let descriptions: Vec<_> = subtasks.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(descriptions, vec!["implement signup", "test signup", "document signup"]);
        assert!(subtasks[1].depends_on.is_empty());
        assert_eq!(subtasks[2].depends_on, vec![1]);
    }

    #[test]
    fn test_empty_request_rejected() {
        let result = Planner::default().plan("  \n ; ");
        assert!(matches!(result, Err(ConclaveError::Validation(_))));
    }
}
