//! Wire protocol shared by every component.
//!
//! A [`Message`] is the only thing agents exchange. Publishers submit a
//! [`MessageDraft`]; the message log seals it with an id and a timestamp.
//! Payloads are plain JSON so free text and structured reports travel the
//! same way; the typed report structs below are the structured shapes the
//! runtime and orchestrator agree on.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ConclaveError, Result};
use crate::task::{Operation, OperationKind, Priority};

/// Position of a message in the log (1-based, monotonic)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Sentinel preceding the first entry; replaying after it replays everything
    pub const ORIGIN: MessageId = MessageId(0);

    /// Id following this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Task identifier minted by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| ConclaveError::Validation(format!("invalid task id {s:?}: {e}")))
    }
}

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    TaskAssignment,
    TaskProgress,
    TaskComplete,
    TaskError,
    StatusReport,
    InterAgentRequest,
    Broadcast,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TaskAssignment => "task-assignment",
            Self::TaskProgress => "task-progress",
            Self::TaskComplete => "task-complete",
            Self::TaskError => "task-error",
            Self::StatusReport => "status-report",
            Self::InterAgentRequest => "inter-agent-request",
            Self::Broadcast => "broadcast",
        };
        f.write_str(name)
    }
}

const ROLE_PREFIX: &str = "role:";
const BROADCAST_TARGET: &str = "all";

/// Intended recipient of a message.
///
/// On the wire this is a single string: an agent name, `role:<role>`, or `all`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Target {
    /// A named agent
    Agent(String),
    /// Every agent declaring this role
    Role(String),
    /// Every agent
    All,
}

impl Target {
    pub fn agent(name: impl Into<String>) -> Self {
        Self::Agent(name.into())
    }

    pub fn role(role: impl Into<String>) -> Self {
        Self::Role(role.into())
    }

    /// Parse the wire form
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConclaveError::Validation("empty target".into()));
        }
        if raw == BROADCAST_TARGET {
            return Ok(Self::All);
        }
        match raw.strip_prefix(ROLE_PREFIX) {
            Some(role) if role.trim().is_empty() => {
                Err(ConclaveError::Validation("empty role selector".into()))
            }
            Some(role) => Ok(Self::Role(role.trim().to_string())),
            None => Ok(Self::Agent(raw.to_string())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(name) => f.write_str(name),
            Self::Role(role) => write!(f, "{ROLE_PREFIX}{role}"),
            Self::All => f.write_str(BROADCAST_TARGET),
        }
    }
}

impl From<Target> for String {
    fn from(target: Target) -> Self {
        target.to_string()
    }
}

impl TryFrom<String> for Target {
    type Error = ConclaveError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

/// An appended, immutable log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub target: Target,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<MessageId>,
}

impl Message {
    /// Payload as free text, if it is a JSON string
    pub fn text(&self) -> Option<&str> {
        self.payload.as_str()
    }

    /// Decode the payload into one of the structured report shapes
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// `taskId` carried by structured payloads
    pub fn task_id(&self) -> Option<TaskId> {
        self.payload
            .get("taskId")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
    }
}

/// A message waiting to be appended.
///
/// Target and type are optional here so malformed submissions can be
/// represented and rejected by the log rather than by the type system alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    pub sender: String,
    #[serde(default)]
    pub target: Option<Target>,
    #[serde(default, rename = "type")]
    pub kind: Option<MessageType>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub correlation_id: Option<MessageId>,
}

impl MessageDraft {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            ..Default::default()
        }
    }

    pub fn to(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn kind(mut self, kind: MessageType) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Serialize a structured payload
    pub fn report<T: Serialize>(mut self, report: &T) -> Result<Self> {
        self.payload = serde_json::to_value(report)?;
        Ok(self)
    }

    pub fn correlated(mut self, id: MessageId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Check the draft and turn it into a log entry
    pub fn seal(self, id: MessageId, timestamp: DateTime<Utc>) -> Result<Message> {
        if self.sender.trim().is_empty() {
            return Err(ConclaveError::Validation("message has no sender".into()));
        }
        let target = self
            .target
            .ok_or_else(|| ConclaveError::Validation("message has no target".into()))?;
        if let Target::Agent(name) | Target::Role(name) = &target {
            if name.trim().is_empty() {
                return Err(ConclaveError::Validation("message target is blank".into()));
            }
        }
        let kind = self
            .kind
            .ok_or_else(|| ConclaveError::Validation("message has no type".into()))?;

        Ok(Message {
            id,
            timestamp,
            sender: self.sender,
            target,
            kind,
            payload: self.payload,
            correlation_id: self.correlation_id,
        })
    }
}

/// Agent status as reported on the wire and tracked by the roster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Working,
    Waiting,
    Error,
    Disconnected,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Working => "working",
            Self::Waiting => "waiting",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Structured task-assignment payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<TaskId>,
}

/// Emitted after every operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub task_id: TaskId,
    pub operation: usize,
    pub total: usize,
    pub kind: OperationKind,
    pub success: bool,
    pub output: String,
}

/// Emitted once all operations of a task succeeded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub task_id: TaskId,
    pub operations: usize,
    pub outputs: Vec<String>,
}

/// Emitted when a task stops on a failing operation (or is cancelled)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub task_id: TaskId,
    /// Index of the failing operation
    pub operation: usize,
    pub kind: OperationKind,
    pub error: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Periodic or on-demand agent status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: AgentStatus,
    pub queued: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub const AGENT_ONLINE: &str = "agent-online";

/// Startup broadcast an agent sends so the orchestrator can enroll it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub event: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Announcement {
    pub fn online(role: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            event: AGENT_ONLINE.to_string(),
            role: role.into(),
            capabilities,
        }
    }
}

pub const TASK_PLANNED: &str = "task-planned";

/// The orchestrator's own record of a planned request.
///
/// Logged before any part is assigned, so withheld sub-tasks and the parent
/// of a split request survive an orchestrator restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRecord {
    pub event: String,
    /// Id the requester tracks; a parent when the request was split
    pub task_id: TaskId,
    pub description: String,
    pub subtasks: Vec<PlannedTask>,
}

impl PlanRecord {
    pub fn new(task_id: TaskId, description: impl Into<String>, subtasks: Vec<PlannedTask>) -> Self {
        Self {
            event: TASK_PLANNED.to_string(),
            task_id,
            description: description.into(),
            subtasks,
        }
    }

    pub fn is_split(&self) -> bool {
        self.subtasks.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedTask {
    pub task_id: TaskId,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<TaskId>,
}

/// Inter-agent request payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum AgentRequest {
    /// Drop a queued task, or stop a running one at the next operation boundary
    Cancel {
        #[serde(rename = "taskId")]
        task_id: TaskId,
    },
    /// Answer with a status-report
    Status,
}

/// Broadcast payload asking every agent for a status-report
pub fn status_request() -> Value {
    serde_json::json!({ "request": "status" })
}

pub fn is_status_request(payload: &Value) -> bool {
    payload.get("request").and_then(Value::as_str) == Some("status")
}
