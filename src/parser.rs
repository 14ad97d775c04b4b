//! Task parser - turns a task-assignment message into a structured task.
//!
//! Structured payloads with an explicit operation list are taken verbatim.
//! Free-form descriptions go through a [`RuleTable`]: the longest keyword
//! found in the text picks the operation template, and text that matches no
//! rule becomes a single generic operation. Only an empty payload is rejected.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ConclaveError, Result};
use crate::protocol::{Message, MessageType, TaskSpec};
use crate::task::{Operation, OperationKind, Task, TaskState};

/// Maps a keyword to an operation template and the role that handles it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub keyword: String,
    pub kind: OperationKind,
    pub role: String,
}

impl KeywordRule {
    pub fn new(keyword: impl Into<String>, kind: OperationKind, role: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into().to_lowercase(),
            kind,
            role: role.into(),
        }
    }
}

/// A rule that fired, with the text following its keyword
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch<'a> {
    pub rule: &'a KeywordRule,
    pub subject: String,
}

/// Prioritized keyword rules (longest match wins, then table order)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTable {
    rules: Vec<KeywordRule>,
}

impl RuleTable {
    pub fn new(rules: Vec<KeywordRule>) -> Self {
        Self { rules }
    }

    /// Default keyword set: research / implementation / testing / documentation
    pub fn builtin() -> Self {
        use OperationKind::*;

        let groups: [(&[&str], OperationKind, &str); 4] = [
            (
                &["research", "investigate", "analyze", "analyse", "explore", "look into", "find out"],
                Research,
                "research",
            ),
            (
                &["implement", "build", "create", "write", "fix", "refactor", "add", "develop", "code"],
                Implementation,
                "coding",
            ),
            (
                &["test", "tests", "testing", "verify", "validate", "qa", "write tests", "add tests"],
                Testing,
                "testing",
            ),
            (
                &["document", "write docs", "write documentation"],
                Documentation,
                "coding",
            ),
        ];

        let rules = groups
            .iter()
            .flat_map(|(keywords, kind, role)| {
                keywords.iter().map(move |kw| KeywordRule::new(*kw, *kind, *role))
            })
            .collect();
        Self { rules }
    }

    pub fn with_rule(mut self, rule: KeywordRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[KeywordRule] {
        &self.rules
    }

    /// Best rule for `text`, if any keyword occurs as a whole word
    pub fn classify(&self, text: &str) -> Option<RuleMatch<'_>> {
        let lower = text.to_lowercase();
        let mut best: Option<(&KeywordRule, usize)> = None;

        for rule in &self.rules {
            let Some(end) = find_word(&lower, &rule.keyword) else {
                continue;
            };
            let longer = best.map_or(true, |(current, _)| rule.keyword.len() > current.keyword.len());
            if longer {
                best = Some((rule, end));
            }
        }

        best.map(|(rule, end)| {
            // Lowercasing can change byte lengths outside ASCII; offsets are only valid then.
            let tail = if text.len() == lower.len() {
                text.get(end..).unwrap_or(&lower[end..])
            } else {
                &lower[end..]
            };
            let subject = tail
                .trim()
                .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace());
            RuleMatch {
                rule,
                subject: if subject.is_empty() {
                    text.trim().to_string()
                } else {
                    subject.to_string()
                },
            }
        })
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// End offset of the first whole-word occurrence of `needle` in `haystack`
fn find_word(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack.match_indices(needle).find_map(|(start, _)| {
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        (before_ok && after_ok).then_some(end)
    })
}

/// Converts task-assignment messages into [`Task`]s
#[derive(Debug, Clone, Default)]
pub struct TaskParser {
    rules: RuleTable,
}

impl TaskParser {
    pub fn new(rules: RuleTable) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Parse `message` into a pending task owned by `owner`
    pub fn parse(&self, message: &Message, owner: &str) -> Result<Task> {
        if message.kind != MessageType::TaskAssignment {
            return Err(ConclaveError::Validation(format!(
                "{} is a {} message, not a task-assignment",
                message.id, message.kind
            )));
        }

        let spec = Self::read_spec(&message.payload).ok_or_else(|| {
            ConclaveError::UnparsableTask(format!("{} has an empty payload", message.id))
        })?;

        let operations = if spec.operations.is_empty() {
            vec![self.template_for(&spec.description)]
        } else {
            spec.operations
                .into_iter()
                .map(|op| Operation { result: None, ..op })
                .collect()
        };

        let task = Task {
            id: spec.task_id.or_else(|| message.task_id()).unwrap_or_default(),
            description: spec.description,
            owner: owner.to_string(),
            operations,
            state: TaskState::Pending,
            created_from: message.id,
            priority: spec.priority,
            dependencies: spec.dependencies,
        };

        debug!(
            task_id = %task.id,
            from = %message.id,
            operations = task.operations.len(),
            "Parsed task"
        );
        Ok(task)
    }

    /// Normalize any payload into a spec; `None` when there is nothing to do
    fn read_spec(payload: &Value) -> Option<TaskSpec> {
        let spec = match payload {
            Value::Null => return None,
            Value::String(text) => TaskSpec {
                description: text.trim().to_string(),
                ..Default::default()
            },
            Value::Object(map) => {
                let mut spec = match serde_json::from_value::<TaskSpec>(payload.clone()) {
                    Ok(spec) => TaskSpec {
                        description: spec.description.trim().to_string(),
                        ..spec
                    },
                    // Malformed hints: keep whatever description there is.
                    Err(_) => TaskSpec {
                        description: map
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .trim()
                            .to_string(),
                        ..Default::default()
                    },
                };
                // No description field at all: the object itself is the description.
                if spec.description.is_empty()
                    && spec.operations.is_empty()
                    && !map.is_empty()
                    && !map.contains_key("description")
                {
                    spec.description = payload.to_string();
                }
                spec
            }
            other => TaskSpec {
                description: other.to_string(),
                ..Default::default()
            },
        };

        (!spec.description.is_empty() || !spec.operations.is_empty()).then_some(spec)
    }

    fn template_for(&self, description: &str) -> Operation {
        match self.rules.classify(description) {
            Some(found) => Operation::new(
                found.rule.kind,
                json!({ "subject": found.subject, "description": description }),
            ),
            None => Operation::new(OperationKind::Generic, json!({ "description": description })),
        }
    }
}
