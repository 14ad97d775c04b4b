//! Communication channels for the orchestrator

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{ConclaveError, Result};
use crate::orchestrator::{Board, TaskRecord};
use crate::protocol::{MessageId, TaskId};
use crate::roster::AgentRecord;

const EVENT_CAPACITY: usize = 256;

/// Receipt for an accepted request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Id to track the request by
    pub task_id: TaskId,
    /// Sub-task ids when the request was split; empty otherwise
    pub subtasks: Vec<TaskId>,
}

/// Requests handled by the orchestrator loop
#[derive(Debug)]
pub enum Command {
    Assign {
        description: String,
        reply: oneshot::Sender<Result<Assignment>>,
    },
    Status {
        reply: oneshot::Sender<Vec<AgentRecord>>,
    },
    Broadcast {
        text: String,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    Task {
        task_id: TaskId,
        reply: oneshot::Sender<Option<TaskRecord>>,
    },
    Board {
        reply: oneshot::Sender<Board>,
    },
}

/// Lifecycle notifications for requesters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum OrchestratorEvent {
    TaskAssigned {
        task_id: TaskId,
        agent: String,
        message: MessageId,
    },
    TaskCompleted {
        task_id: TaskId,
        agent: Option<String>,
    },
    TaskFailed {
        task_id: TaskId,
        agent: Option<String>,
        error: String,
    },
    AgentOnline {
        agent: String,
    },
    AgentReactivated {
        agent: String,
    },
    AgentDisconnected {
        agent: String,
    },
}

/// Orchestrator side of the channel
pub struct ChannelPair {
    pub command_rx: mpsc::UnboundedReceiver<Command>,
    pub event_tx: broadcast::Sender<OrchestratorEvent>,
}

/// Client-side handle to the orchestrator's command surface
#[derive(Clone)]
pub struct OrchestratorClient {
    command_tx: mpsc::UnboundedSender<Command>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl OrchestratorClient {
    /// Create a client and the matching orchestrator channel pair
    pub fn new() -> (Self, ChannelPair) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let client = Self {
            command_tx,
            event_tx: event_tx.clone(),
        };
        (client, ChannelPair { command_rx, event_tx })
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .map_err(|_| ConclaveError::ChannelClosed)?;
        rx.await.map_err(|_| ConclaveError::ChannelClosed)
    }

    /// Plan and assign a free-form request
    pub async fn assign_task(&self, description: impl Into<String>) -> Result<Assignment> {
        let description = description.into();
        self.request(|reply| Command::Assign { description, reply })
            .await?
    }

    /// Every known agent, disconnected ones included
    pub async fn get_status(&self) -> Result<Vec<AgentRecord>> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn broadcast(&self, text: impl Into<String>) -> Result<MessageId> {
        let text = text.into();
        self.request(|reply| Command::Broadcast { text, reply })
            .await?
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| Command::Cancel { task_id, reply })
            .await?
    }

    pub async fn task(&self, task_id: TaskId) -> Result<TaskRecord> {
        self.request(|reply| Command::Task { task_id, reply })
            .await?
            .ok_or(ConclaveError::TaskNotFound(task_id))
    }

    pub async fn board(&self) -> Result<Board> {
        self.request(|reply| Command::Board { reply }).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Check if the orchestrator has stopped
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}
