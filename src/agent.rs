//! Agent runtime - one task-processing loop per agent.
//!
//! ```text
//!          assignment                 operation failed
//!   Idle ─────────────► Working ─────────────────────► Error
//!    ▲ ▲                   │                             │
//!    │ └───────────────────┘ queue drained               │ reported
//!    └───────────────────────────────────────────────────┘
//!    │
//!    └──► Disconnected (shutdown)
//! ```
//!
//! The runtime owns its queue and every task in it. Tasks run one at a time,
//! FIFO; new assignments and cancellations are picked up between operations.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::bus::{ChannelBus, Filter, Subscription};
use crate::error::{ConclaveError, Result};
use crate::executor::CommandExecutor;
use crate::parser::TaskParser;
use crate::protocol::{
    is_status_request, AgentRequest, AgentStatus, Announcement, CompletionReport, FailureReport,
    Message, MessageDraft, MessageId, MessageType, ProgressReport, StatusReport, Target, TaskId,
};
use crate::task::{Operation, OperationKind, OperationResult, Task, TaskState};

const CANCELLED: &str = "cancelled";
const SHUT_DOWN: &str = "agent shut down";

/// Runtime state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Idle,
    Working,
    /// Entered when an operation fails; left once the failure is reported
    Error,
    Disconnected,
}

impl From<AgentState> for AgentStatus {
    fn from(state: AgentState) -> Self {
        match state {
            AgentState::Idle => AgentStatus::Active,
            AgentState::Working => AgentStatus::Working,
            AgentState::Error => AgentStatus::Error,
            AgentState::Disconnected => AgentStatus::Disconnected,
        }
    }
}

/// Identity an agent announces on startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProfile {
    pub name: String,
    pub role: String,
    pub capabilities: Vec<String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        let role = role.into();
        Self {
            name: name.into(),
            capabilities: vec![role.clone()],
            role,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

struct Queued {
    task: Task,
    /// Sender of the assignment; progress and results go back to it
    reply_to: String,
}

/// A single agent's message loop
pub struct AgentRuntime {
    profile: AgentProfile,
    bus: ChannelBus,
    parser: TaskParser,
    executor: CommandExecutor,
    /// Recipient of status reports
    orchestrator: String,
    heartbeat: Duration,
    queue: VecDeque<Queued>,
    current: Option<TaskId>,
    cancel_current: bool,
    state: Arc<RwLock<AgentState>>,
    shutdown: CancellationToken,
}

impl AgentRuntime {
    pub fn new(profile: AgentProfile, bus: ChannelBus, executor: CommandExecutor) -> Self {
        Self {
            profile,
            bus,
            parser: TaskParser::default(),
            executor,
            orchestrator: "orchestrator".to_string(),
            heartbeat: Duration::from_secs(5),
            queue: VecDeque::new(),
            current: None,
            cancel_current: false,
            state: Arc::new(RwLock::new(AgentState::Idle)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_parser(mut self, parser: TaskParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_orchestrator(mut self, name: impl Into<String>) -> Self {
        self.orchestrator = name.into();
        self
    }

    pub fn with_heartbeat(mut self, every: Duration) -> Self {
        self.heartbeat = every;
        self
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    /// Run the loop on its own tokio task
    pub fn spawn(self) -> AgentHandle {
        let name = self.profile.name.clone();
        let role = self.profile.role.clone();
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.clone();
        let join = tokio::spawn(self.run());

        AgentHandle {
            name,
            role,
            state,
            shutdown,
            join,
        }
    }

    /// Run until shut down
    #[instrument(skip(self), fields(agent = %self.profile.name))]
    pub async fn run(mut self) -> Result<()> {
        let filter = Filter::agent(&self.profile.name).with_role(&self.profile.role);
        let mut inbox = self.bus.subscribe(self.profile.name.clone(), filter, None);

        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        self.announce();
        info!(role = %self.profile.role, "Agent online");

        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = inbox.next() => match message {
                    Some(message) => self.dispatch(message),
                    None => break,
                },
                _ = ticker.tick() => self.publish_status(None),
            }
            self.drain(&mut inbox, &mut ticker).await;
        }

        // Assignments that never started are failed back to their senders.
        while let Some(message) = inbox.try_next() {
            self.dispatch(message);
        }
        while let Some(queued) = self.queue.pop_front() {
            self.reject(queued, SHUT_DOWN);
        }

        self.set_state(AgentState::Disconnected);
        self.publish_status(None);
        info!(queued = self.queue.len(), "Agent stopped");
        Ok(())
    }

    /// Loop boundary: nothing a message does may stop the agent
    fn dispatch(&mut self, message: Message) {
        if let Err(e) = self.handle(&message) {
            warn!(id = %message.id, error = %e, "Failed to handle message");
            self.publish_status(Some(e.to_string()));
        }
    }

    fn handle(&mut self, message: &Message) -> Result<()> {
        match message.kind {
            MessageType::TaskAssignment => self.accept(message),
            MessageType::InterAgentRequest => {
                let request = message.decode::<AgentRequest>().ok_or_else(|| {
                    ConclaveError::Validation(format!("{} is not a known request", message.id))
                })?;
                match request {
                    AgentRequest::Cancel { task_id } => self.cancel(task_id),
                    AgentRequest::Status => self.publish_status(None),
                }
                Ok(())
            }
            MessageType::Broadcast if is_status_request(&message.payload) => {
                self.publish_status(None);
                Ok(())
            }
            _ => {
                trace!(id = %message.id, kind = %message.kind, "Ignoring message");
                Ok(())
            }
        }
    }

    fn accept(&mut self, message: &Message) -> Result<()> {
        match self.parser.parse(message, &self.profile.name) {
            Ok(task) => {
                debug!(task_id = %task.id, queued = self.queue.len() + 1, "Task queued");
                self.queue.push_back(Queued {
                    task,
                    reply_to: message.sender.clone(),
                });
                Ok(())
            }
            Err(e @ ConclaveError::UnparsableTask(_)) => {
                warn!(id = %message.id, error = %e, "Rejecting assignment");
                let report = FailureReport {
                    task_id: message.task_id().unwrap_or_default(),
                    operation: 0,
                    kind: OperationKind::Generic,
                    error: e.to_string(),
                    stderr: String::new(),
                    exit_code: None,
                };
                self.reply(&message.sender, MessageType::TaskError, &report, message.id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn cancel(&mut self, task_id: TaskId) {
        if let Some(pos) = self.queue.iter().position(|q| q.task.id == task_id) {
            if let Some(queued) = self.queue.remove(pos) {
                info!(task_id = %task_id, "Cancelled queued task");
                self.reject(queued, CANCELLED);
            }
        } else if self.current == Some(task_id) {
            info!(task_id = %task_id, "Cancelling at next operation boundary");
            self.cancel_current = true;
        } else {
            debug!(task_id = %task_id, "Cancel for a task this agent does not hold");
        }
    }

    /// Fail a task that never started
    fn reject(&self, queued: Queued, reason: &str) {
        let Queued { mut task, reply_to } = queued;
        task.transition(TaskState::Failed);
        debug!(task_id = %task.id, reason, "Queued task dropped");
        let report = failure(&task, 0, &OperationResult::failed(reason));
        self.reply(&reply_to, MessageType::TaskError, &report, task.created_from);
    }

    async fn drain(&mut self, inbox: &mut Subscription, ticker: &mut Interval) {
        while !self.shutdown.is_cancelled() {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            self.run_task(next, inbox, ticker).await;
        }
    }

    #[instrument(skip_all, fields(task_id = %queued.task.id))]
    async fn run_task(&mut self, queued: Queued, inbox: &mut Subscription, ticker: &mut Interval) {
        let Queued {
            mut task,
            reply_to,
        } = queued;
        task.transition(TaskState::Running);
        self.current = Some(task.id);
        self.cancel_current = false;
        self.set_state(AgentState::Working);
        info!(operations = task.operations.len(), "Task started");

        let total = task.operations.len();
        let mut outputs = Vec::with_capacity(total);

        for index in 0..total {
            while let Some(message) = inbox.try_next() {
                self.dispatch(message);
            }
            if self.cancel_current {
                self.fail(&mut task, &reply_to, index, &OperationResult::failed(CANCELLED));
                return;
            }

            let result = self.execute(&task.operations[index], ticker).await;
            let progress = ProgressReport {
                task_id: task.id,
                operation: index,
                total,
                kind: task.operations[index].kind,
                success: result.success,
                output: result.output.clone(),
            };
            self.reply(&reply_to, MessageType::TaskProgress, &progress, task.created_from);
            task.operations[index].result = Some(result.clone());

            if !result.success {
                self.fail(&mut task, &reply_to, index, &result);
                return;
            }
            outputs.push(result.output);
        }

        task.transition(TaskState::Completed);
        let report = CompletionReport {
            task_id: task.id,
            operations: total,
            outputs,
        };
        self.reply(&reply_to, MessageType::TaskComplete, &report, task.created_from);
        info!("Task complete");
        self.finish();
    }

    /// Run one operation, keeping the heartbeat going while it is in flight
    async fn execute(&self, operation: &Operation, ticker: &mut Interval) -> OperationResult {
        let execution = self.executor.execute(operation);
        tokio::pin!(execution);
        loop {
            tokio::select! {
                result = &mut execution => return result,
                _ = ticker.tick() => self.publish_status(None),
            }
        }
    }

    fn fail(&mut self, task: &mut Task, reply_to: &str, index: usize, result: &OperationResult) {
        task.transition(TaskState::Failed);
        let report = failure(task, index, result);
        warn!(operation = index, error = %report.error, "Task failed");

        self.reply(reply_to, MessageType::TaskError, &report, task.created_from);
        self.set_state(AgentState::Error);
        self.publish_status(Some(report.error));
        self.finish();
        // The error is reported; the agent is available again.
        self.publish_status(None);
    }

    fn finish(&mut self) {
        self.current = None;
        self.cancel_current = false;
        self.set_state(AgentState::Idle);
    }

    fn announce(&self) {
        let announce = Announcement::online(&self.profile.role, self.profile.capabilities.clone());
        let draft = MessageDraft::new(&self.profile.name)
            .to(Target::All)
            .kind(MessageType::Broadcast)
            .report(&announce);
        self.emit(draft);
    }

    fn publish_status(&self, error: Option<String>) {
        let report = StatusReport {
            status: self.state().into(),
            queued: self.queue.len(),
            current_task: self.current,
            error,
        };
        let draft = MessageDraft::new(&self.profile.name)
            .to(Target::agent(&self.orchestrator))
            .kind(MessageType::StatusReport)
            .report(&report);
        self.emit(draft);
    }

    fn reply<T: Serialize>(&self, to: &str, kind: MessageType, payload: &T, correlation: MessageId) {
        let draft = MessageDraft::new(&self.profile.name)
            .to(Target::agent(to))
            .kind(kind)
            .correlated(correlation)
            .report(payload);
        self.emit(draft);
    }

    fn emit(&self, draft: Result<MessageDraft>) {
        if let Err(e) = draft.and_then(|draft| self.bus.publish(draft)) {
            warn!(error = %e, "Failed to publish");
        }
    }

    fn state(&self) -> AgentState {
        *self.state.read()
    }

    fn set_state(&self, state: AgentState) {
        *self.state.write() = state;
    }
}

fn failure(task: &Task, index: usize, result: &OperationResult) -> FailureReport {
    FailureReport {
        task_id: task.id,
        operation: index,
        kind: task
            .operations
            .get(index)
            .map_or(OperationKind::Generic, |op| op.kind),
        error: result
            .error
            .clone()
            .unwrap_or_else(|| "operation failed".to_string()),
        stderr: result.stderr.clone(),
        exit_code: result.exit_code,
    }
}

/// Handle to a running agent
pub struct AgentHandle {
    name: String,
    role: String,
    state: Arc<RwLock<AgentState>>,
    shutdown: CancellationToken,
    join: JoinHandle<Result<()>>,
}

impl AgentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn state(&self) -> AgentState {
        *self.state.read()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop taking work and wait for the loop to exit.
    ///
    /// A task already running finishes first.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        match self.join.await {
            Ok(result) => result,
            Err(e) => {
                warn!(agent = %self.name, error = %e, "Agent task aborted");
                Ok(())
            }
        }
    }
}
