//! Tasks and the operations they are made of

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{MessageId, TaskId};

/// Task lifecycle: `Pending -> Running -> Completed | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Scheduling hint carried with an assignment. Queues stay FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Canonical operation templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Research,
    Implementation,
    Testing,
    Documentation,
    /// Raw command line supplied by the requester
    Shell,
    /// Unmatched description, preserved verbatim
    Generic,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Research => "research",
            Self::Implementation => "implementation",
            Self::Testing => "testing",
            Self::Documentation => "documentation",
            Self::Shell => "shell",
            Self::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// What to hand to the external runner.
///
/// Accepts either a full object or a bare command line string, which is run
/// through the configured shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CommandRepr")]
pub struct CommandSpec {
    pub program: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Run `program` as a command line through the shell
    #[serde(default)]
    pub shell: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandRepr {
    Line(String),
    Full {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        shell: bool,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

impl From<CommandRepr> for CommandSpec {
    fn from(repr: CommandRepr) -> Self {
        match repr {
            CommandRepr::Line(line) => Self::shell_line(line),
            CommandRepr::Full {
                program,
                args,
                shell,
                cwd,
                env,
            } => Self {
                program,
                args,
                shell,
                cwd,
                env,
            },
        }
    }
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            shell: false,
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    /// A command line interpreted by the shell
    pub fn shell_line(line: impl Into<String>) -> Self {
        Self {
            shell: true,
            ..Self::new(line)
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Raw outcome of an external call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalOutput {
    /// `None` when the process was killed by a signal
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExternalOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Outcome of one operation, always returned as data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl OperationResult {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            exit_code: Some(0),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Atomic unit of work inside a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSpec>,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
}

impl Operation {
    pub fn new(kind: OperationKind, params: Value) -> Self {
        Self {
            kind,
            command: None,
            params,
            result: None,
        }
    }

    /// Operation carrying an explicit command
    pub fn with_command(kind: OperationKind, command: CommandSpec) -> Self {
        Self {
            kind,
            command: Some(command),
            params: Value::Null,
            result: None,
        }
    }

    /// Text the operation is about (`subject`, falling back to `description`)
    pub fn subject(&self) -> Option<&str> {
        self.params
            .get("subject")
            .or_else(|| self.params.get("description"))
            .and_then(Value::as_str)
    }
}

/// A structured task, owned by the agent runtime that parsed it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub owner: String,
    pub operations: Vec<Operation>,
    pub state: TaskState,
    /// Id of the task-assignment message this task came from
    pub created_from: MessageId,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
}

impl Task {
    /// Move to `next` if the lifecycle allows it
    pub fn transition(&mut self, next: TaskState) -> bool {
        let allowed = matches!(
            (self.state, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Failed)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
        );
        if allowed {
            self.state = next;
        }
        allowed
    }
}
