//! Main orchestrator - plans requests, assigns work and tracks it to completion
//!
//! The orchestrator never shares state with agents. It learns everything by
//! observing the log (replayed from the start, so a restart rebuilds the
//! roster and the task table) and acts only by publishing messages.
//!
//! Its own decisions go to the log as well: every planned request is recorded
//! as a `task-planned` status report addressed to itself, and tasks it fails
//! without an agent (cancelled while withheld, undeliverable) as a task-error.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::{ChannelBus, Filter, Subscription};
use crate::channel::{Assignment, ChannelPair, Command, OrchestratorClient, OrchestratorEvent};
use crate::error::{ConclaveError, Result};
use crate::planner::Planner;
use crate::protocol::{
    AgentRequest, CompletionReport, FailureReport, Message, MessageDraft, MessageId, MessageType,
    PlanRecord, PlannedTask, Target, TaskId, TaskSpec, TASK_PLANNED,
};
use crate::roster::{Roster, RosterChange};
use crate::task::OperationKind;

/// Orchestrator tunables
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Sender name on the bus; agents send status reports here
    pub name: String,
    pub liveness_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            name: "orchestrator".to_string(),
            liveness_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Where a tracked task stands, from the orchestrator's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskPhase {
    /// Waiting for a prerequisite; not published yet
    Withheld,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Orchestrator-side view of one task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub description: String,
    pub role: Option<String>,
    pub agent: Option<String>,
    pub phase: TaskPhase,
    /// The task-assignment message, once published
    pub assignment: Option<MessageId>,
    pub parent: Option<TaskId>,
    pub subtasks: Vec<TaskId>,
    pub depends_on: Vec<TaskId>,
    pub outputs: Vec<String>,
    pub error: Option<String>,
    /// Agent-reported detail, enough to decide on a manual reassignment
    pub failure: Option<FailureReport>,
}

impl TaskRecord {
    fn new(id: TaskId, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            role: None,
            agent: None,
            phase: TaskPhase::Withheld,
            assignment: None,
            parent: None,
            subtasks: Vec::new(),
            depends_on: Vec::new(),
            outputs: Vec::new(),
            error: None,
            failure: None,
        }
    }
}

/// Task counts by column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub todo: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

/// The privileged agent that hands out work
pub struct Orchestrator {
    settings: OrchestratorSettings,
    bus: ChannelBus,
    planner: Planner,
    roster: Roster,
    tasks: HashMap<TaskId, TaskRecord>,
    /// Released dependents waiting to be published
    ready: VecDeque<TaskId>,
    observer: Subscription,
    command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator with the given channel pair
    pub fn new(settings: OrchestratorSettings, bus: ChannelBus, channels: ChannelPair) -> Self {
        let observer = bus.subscribe(
            settings.name.clone(),
            Filter::observer(),
            Some(MessageId::ORIGIN),
        );
        Self {
            roster: Roster::new(settings.name.clone()),
            settings,
            bus,
            planner: Planner::default(),
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            observer,
            command_rx: channels.command_rx,
            event_tx: channels.event_tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create an orchestrator and the client to drive it
    pub fn with_channel(settings: OrchestratorSettings, bus: ChannelBus) -> (Self, OrchestratorClient) {
        let (client, pair) = OrchestratorClient::new();
        (Self::new(settings, bus, pair), client)
    }

    pub fn with_planner(mut self, planner: Planner) -> Self {
        self.planner = planner;
        self
    }

    /// Stop the loop when `token` is cancelled, even while clients remain
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Run the event loop until shut down or every client is gone
    #[instrument(skip(self), fields(orchestrator = %self.settings.name))]
    pub async fn run(mut self) -> Result<()> {
        info!("Starting orchestrator");

        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                message = self.observer.next() => match message {
                    Some(message) => self.observe(message),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
            }
            self.flush();
        }

        info!("Orchestrator stopped");
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        self.catch_up();
        self.sweep();

        match command {
            Command::Assign { description, reply } => {
                let result = self.assign(&description);
                if let Err(e) = &result {
                    warn!(error = %e, "Assignment rejected");
                }
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.roster.records());
            }
            Command::Broadcast { text, reply } => {
                let _ = reply.send(self.broadcast(text));
            }
            Command::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel(task_id));
            }
            Command::Task { task_id, reply } => {
                let _ = reply.send(self.tasks.get(&task_id).cloned());
            }
            Command::Board { reply } => {
                let _ = reply.send(self.board());
            }
        }
    }

    /// Plan `description`, publish what can start now, withhold the rest
    fn assign(&mut self, description: &str) -> Result<Assignment> {
        let plan = self.planner.plan(description)?;
        if self.roster.select(None).is_none() {
            return Err(ConclaveError::NoAvailableAgent(
                plan.first()
                    .and_then(|s| s.role.clone())
                    .unwrap_or_else(|| "any".to_string()),
            ));
        }

        let ids: Vec<TaskId> = plan.iter().map(|_| TaskId::new()).collect();
        let split = ids.len() > 1;
        let parent = if split { TaskId::new() } else { ids[0] };

        let subtasks = plan
            .into_iter()
            .zip(&ids)
            .map(|(subtask, &id)| PlannedTask {
                task_id: id,
                description: subtask.description,
                role: subtask.role,
                depends_on: subtask.depends_on.iter().map(|&i| ids[i]).collect(),
            })
            .collect();
        let record = PlanRecord::new(parent, description.trim(), subtasks);

        self.bus.publish(
            MessageDraft::new(&self.settings.name)
                .to(Target::agent(&self.settings.name))
                .kind(MessageType::StatusReport)
                .report(&record)?,
        )?;
        self.apply_plan(&record);
        self.ready.extend(
            record
                .subtasks
                .iter()
                .filter(|s| s.depends_on.is_empty())
                .map(|s| s.task_id),
        );

        info!(task_id = %parent, parts = ids.len(), "Request planned");
        self.flush();

        Ok(Assignment {
            task_id: parent,
            subtasks: if split { ids } else { Vec::new() },
        })
    }

    /// Publish released tasks. Only called outside message handling.
    fn flush(&mut self) {
        self.catch_up();
        while let Some(task_id) = self.ready.pop_front() {
            if let Err(e) = self.dispatch(task_id) {
                warn!(task_id = %task_id, error = %e, "Could not dispatch task");
                self.fail_locally(task_id, e.to_string());
            }
        }
    }

    fn dispatch(&mut self, task_id: TaskId) -> Result<()> {
        let record = self
            .tasks
            .get(&task_id)
            .ok_or(ConclaveError::TaskNotFound(task_id))?;
        if record.phase != TaskPhase::Withheld {
            return Ok(());
        }

        let agent = self
            .roster
            .select(record.role.as_deref())
            .map(|r| r.name.clone())
            .ok_or_else(|| {
                ConclaveError::NoAvailableAgent(record.role.clone().unwrap_or_else(|| "any".into()))
            })?;

        let spec = TaskSpec {
            task_id: Some(task_id),
            description: record.description.clone(),
            dependencies: record.depends_on.clone(),
            ..Default::default()
        };
        let message = self.bus.publish(
            MessageDraft::new(&self.settings.name)
                .to(Target::agent(&agent))
                .kind(MessageType::TaskAssignment)
                .report(&spec)?,
        )?;

        info!(task_id = %task_id, agent = %agent, message = %message.id, "Task assigned");
        self.emit(OrchestratorEvent::TaskAssigned {
            task_id,
            agent,
            message: message.id,
        });
        // Fold our own assignment in so the next selection sees the new load.
        self.catch_up();
        Ok(())
    }

    fn broadcast(&mut self, text: String) -> Result<MessageId> {
        let message = self.bus.publish(
            MessageDraft::new(&self.settings.name)
                .to(Target::All)
                .kind(MessageType::Broadcast)
                .payload(text),
        )?;
        Ok(message.id)
    }

    fn cancel(&mut self, task_id: TaskId) -> Result<()> {
        let record = self
            .tasks
            .get(&task_id)
            .ok_or(ConclaveError::TaskNotFound(task_id))?;
        if record.phase.is_terminal() {
            return Err(ConclaveError::Validation(format!(
                "task {task_id} already finished"
            )));
        }

        if !record.subtasks.is_empty() {
            for child in record.subtasks.clone() {
                if self.tasks.get(&child).is_some_and(|r| !r.phase.is_terminal()) {
                    self.cancel(child)?;
                }
            }
            return Ok(());
        }

        match (record.phase, record.agent.clone()) {
            (TaskPhase::Withheld, _) | (_, None) => {
                self.fail_locally(task_id, "cancelled".to_string());
                Ok(())
            }
            (_, Some(agent)) => {
                let mut draft = MessageDraft::new(&self.settings.name)
                    .to(Target::agent(&agent))
                    .kind(MessageType::InterAgentRequest)
                    .report(&AgentRequest::Cancel { task_id })?;
                if let Some(assignment) = record.assignment {
                    draft = draft.correlated(assignment);
                }
                self.bus.publish(draft)?;
                info!(task_id = %task_id, agent = %agent, "Cancellation requested");
                Ok(())
            }
        }
    }

    fn board(&self) -> Board {
        self.tasks
            .values()
            .filter(|r| r.subtasks.is_empty())
            .fold(Board::default(), |mut board, record| {
                match record.phase {
                    TaskPhase::Withheld | TaskPhase::Assigned => board.todo += 1,
                    TaskPhase::Running => board.in_progress += 1,
                    TaskPhase::Completed => board.done += 1,
                    TaskPhase::Failed => board.failed += 1,
                }
                board
            })
    }

    fn catch_up(&mut self) {
        while let Some(message) = self.observer.try_next() {
            self.observe(message);
        }
    }

    /// Fold one log message into the roster and task table. Never publishes.
    fn observe(&mut self, message: Message) {
        match self.roster.apply(&message) {
            Some(RosterChange::Enrolled(agent)) => self.emit(OrchestratorEvent::AgentOnline { agent }),
            Some(RosterChange::Reactivated(agent)) => {
                self.emit(OrchestratorEvent::AgentReactivated { agent })
            }
            None => {}
        }

        let own = message.sender == self.settings.name;
        match message.kind {
            MessageType::TaskAssignment if own => self.track_assignment(&message),
            MessageType::StatusReport if own => {
                if let Some(record) = message.decode::<PlanRecord>() {
                    if record.event == TASK_PLANNED {
                        self.apply_plan(&record);
                    }
                }
            }
            MessageType::TaskProgress => {
                if let Some(record) = message.task_id().and_then(|id| self.tasks.get_mut(&id)) {
                    if record.phase == TaskPhase::Assigned {
                        record.phase = TaskPhase::Running;
                        let parent = record.parent;
                        self.refresh_parent(parent);
                    }
                }
            }
            MessageType::TaskComplete => {
                if let Some(report) = message.decode::<CompletionReport>() {
                    self.complete_task(report);
                }
            }
            MessageType::TaskError => {
                if let Some(report) = message.decode::<FailureReport>() {
                    let error = report.error.clone();
                    let detail = (!own).then_some(report.clone());
                    self.fail_task(report.task_id, error, detail);
                }
            }
            _ => {}
        }
    }

    /// Add the records of a planned request. Existing records are kept as
    /// they are, so replaying the plan after its tasks moved on is harmless.
    fn apply_plan(&mut self, plan: &PlanRecord) {
        let split = plan.is_split();
        if split {
            self.tasks.entry(plan.task_id).or_insert_with(|| {
                let mut record = TaskRecord::new(plan.task_id, plan.description.clone());
                record.phase = TaskPhase::Assigned;
                record.subtasks = plan.subtasks.iter().map(|s| s.task_id).collect();
                record
            });
        }

        for subtask in &plan.subtasks {
            let record = self
                .tasks
                .entry(subtask.task_id)
                .or_insert_with(|| TaskRecord::new(subtask.task_id, subtask.description.clone()));
            if record.role.is_none() {
                record.role = subtask.role.clone();
            }
            if split {
                record.parent = Some(plan.task_id);
            }
            if record.depends_on.is_empty() {
                record.depends_on = subtask.depends_on.clone();
            }
        }
    }

    /// Fail a task no agent holds, and record the decision in the log
    fn fail_locally(&mut self, task_id: TaskId, error: String) {
        let report = FailureReport {
            task_id,
            operation: 0,
            kind: OperationKind::Generic,
            error: error.clone(),
            stderr: String::new(),
            exit_code: None,
        };
        let published = MessageDraft::new(&self.settings.name)
            .to(Target::agent(&self.settings.name))
            .kind(MessageType::TaskError)
            .report(&report)
            .and_then(|draft| self.bus.publish(draft));
        if let Err(e) = published {
            warn!(task_id = %task_id, error = %e, "Could not record failure");
        }
        self.fail_task(task_id, error, None);
    }

    fn track_assignment(&mut self, message: &Message) {
        let (Target::Agent(agent), Some(spec)) = (&message.target, message.decode::<TaskSpec>())
        else {
            return;
        };
        let Some(task_id) = spec.task_id else {
            return;
        };

        // Replayed assignments from an earlier run get a fresh record.
        let record = self
            .tasks
            .entry(task_id)
            .or_insert_with(|| TaskRecord::new(task_id, spec.description.clone()));
        record.agent = Some(agent.clone());
        record.assignment = Some(message.id);
        if record.depends_on.is_empty() {
            record.depends_on = spec.dependencies;
        }
        if record.phase == TaskPhase::Withheld {
            record.phase = TaskPhase::Assigned;
        }
    }

    fn complete_task(&mut self, report: CompletionReport) {
        let Some(record) = self.tasks.get_mut(&report.task_id) else {
            return;
        };
        if record.phase.is_terminal() {
            return;
        }
        record.phase = TaskPhase::Completed;
        record.outputs = report.outputs;
        let agent = record.agent.clone();
        let parent = record.parent;

        info!(task_id = %report.task_id, "Task completed");
        self.emit(OrchestratorEvent::TaskCompleted {
            task_id: report.task_id,
            agent,
        });

        let released: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|r| r.phase == TaskPhase::Withheld && r.depends_on.contains(&report.task_id))
            .filter(|r| {
                r.depends_on.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .is_some_and(|d| d.phase == TaskPhase::Completed)
                })
            })
            .map(|r| r.id)
            .collect();
        for task_id in released {
            debug!(task_id = %task_id, "Dependent released");
            self.ready.push_back(task_id);
        }

        self.refresh_parent(parent);
    }

    fn fail_task(&mut self, task_id: TaskId, error: String, failure: Option<FailureReport>) {
        let Some(record) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if record.phase.is_terminal() {
            return;
        }
        record.phase = TaskPhase::Failed;
        record.error = Some(error.clone());
        record.failure = failure;
        let agent = record.agent.clone();
        let parent = record.parent;

        warn!(task_id = %task_id, error = %error, "Task failed");
        self.emit(OrchestratorEvent::TaskFailed {
            task_id,
            agent,
            error,
        });

        let blocked: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|r| r.phase == TaskPhase::Withheld && r.depends_on.contains(&task_id))
            .map(|r| r.id)
            .collect();
        for dependent in blocked {
            self.fail_task(dependent, format!("blocked by {task_id}"), None);
        }

        self.refresh_parent(parent);
    }

    /// Derive a split request's phase from its sub-tasks
    fn refresh_parent(&mut self, parent: Option<TaskId>) {
        let Some(parent) = parent else {
            return;
        };
        let Some(record) = self.tasks.get(&parent) else {
            return;
        };
        if record.phase.is_terminal() {
            return;
        }

        let children: Vec<&TaskRecord> = record
            .subtasks
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect();
        let failed = children
            .iter()
            .find(|c| c.phase == TaskPhase::Failed)
            .map(|c| format!("subtask {} failed", c.id));
        let done = children.iter().all(|c| c.phase == TaskPhase::Completed);
        let started = children
            .iter()
            .any(|c| matches!(c.phase, TaskPhase::Running | TaskPhase::Completed));
        let outputs: Vec<String> = children.iter().flat_map(|c| c.outputs.clone()).collect();

        let Some(record) = self.tasks.get_mut(&parent) else {
            return;
        };
        if let Some(error) = failed {
            record.phase = TaskPhase::Failed;
            record.error = Some(error.clone());
            self.emit(OrchestratorEvent::TaskFailed {
                task_id: parent,
                agent: None,
                error,
            });
        } else if done {
            record.phase = TaskPhase::Completed;
            record.outputs = outputs;
            self.emit(OrchestratorEvent::TaskCompleted {
                task_id: parent,
                agent: None,
            });
        } else if started {
            record.phase = TaskPhase::Running;
        }
    }

    /// Mark silent agents as disconnected
    fn sweep(&mut self) {
        self.catch_up();
        for expired in self.roster.sweep(Utc::now(), self.settings.liveness_timeout) {
            warn!(error = %expired, "Agent presumed disconnected");
            if let ConclaveError::LivenessTimeout { agent, .. } = expired {
                self.emit(OrchestratorEvent::AgentDisconnected { agent });
            }
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}
