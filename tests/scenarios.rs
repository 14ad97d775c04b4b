//! End-to-end scenarios: real agents, orchestrator and bus, fake external tools.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use conclave::protocol::{status_request, CompletionReport, FailureReport, ProgressReport};
use conclave::{
    AgentConfig, AgentStatus, ChannelBus, CommandSpec, ConclaveConfig, ExternalOutput,
    ExternalRunner, Filter, Message, MessageDraft, MessageType, OrchestratorEvent, Session,
    Subscription, Target, TaskId, TaskPhase,
};

/// Stands in for shells and tools; commands mentioning "broken" fail
#[derive(Default)]
struct FakeRunner {
    /// When set, every command waits for a permit
    gate: Option<Arc<Semaphore>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeRunner {
    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ExternalRunner for FakeRunner {
    async fn run_external(&self, command: CommandSpec) -> conclave::Result<ExternalOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        match &self.gate {
            Some(gate) => drop(gate.acquire().await),
            None => tokio::time::sleep(Duration::from_millis(5)).await,
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let line = command.to_string();
        if line.contains("broken") {
            return Ok(ExternalOutput {
                exit_status: Some(2),
                stdout: String::new(),
                stderr: "cannot compile broken module".into(),
            });
        }
        Ok(ExternalOutput {
            exit_status: Some(0),
            stdout: line,
            stderr: String::new(),
        })
    }
}

fn config() -> ConclaveConfig {
    ConclaveConfig::from_toml("").unwrap()
}

/// Agents go silent (no heartbeats) and are swept quickly
fn short_liveness() -> ConclaveConfig {
    ConclaveConfig::from_toml(
        r#"
        [orchestrator]
        liveness_timeout_ms = 300
        sweep_interval_ms = 20

        [agent]
        heartbeat_interval_ms = 60000
        "#,
    )
    .unwrap()
}

fn agent(name: &str, role: &str) -> AgentConfig {
    AgentConfig {
        name: name.into(),
        role: role.into(),
        capabilities: Vec::new(),
        program: Some("agent-cli".into()),
        args: Vec::new(),
    }
}

/// Spawn agents and wait until each has announced itself
async fn spawn_online(session: &Session, agents: &[AgentConfig]) {
    let mut observer = session.bus().subscribe("scenario", Filter::observer(), None);
    for agent in agents {
        session.spawn_agent(agent).unwrap();
    }
    let mut pending: Vec<&str> = agents.iter().map(|a| a.name.as_str()).collect();
    next_matching(&mut observer, |m| {
        if m.kind == MessageType::Broadcast {
            pending.retain(|name| *name != m.sender);
        }
        pending.is_empty()
    })
    .await;
}

async fn next_matching(sub: &mut Subscription, mut done: impl FnMut(&Message) -> bool) -> Vec<Message> {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mut seen = Vec::new();
        loop {
            let message = sub.next().await.expect("bus closed");
            let finished = done(&message);
            seen.push(message);
            if finished {
                return seen;
            }
        }
    })
    .await
    .expect("timed out waiting for messages")
}

async fn wait_event(
    events: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>,
    mut wanted: impl FnMut(&OrchestratorEvent) -> bool,
) -> OrchestratorEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(event) = events.recv().await {
                if wanted(&event) {
                    return event;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn assign(bus: &ChannelBus, agent: &str, payload: serde_json::Value) -> Message {
    bus.publish(
        MessageDraft::new("requester")
            .to(Target::agent(agent))
            .kind(MessageType::TaskAssignment)
            .payload(payload),
    )
    .unwrap()
}

#[tokio::test]
async fn test_login_form_reports_progress_then_completion() {
    let session = Session::new(&config(), Arc::new(FakeRunner::default())).unwrap();
    spawn_online(&session, &[agent("coding-agent", "coding")]).await;

    let mut replies = session
        .bus()
        .subscribe("requester", Filter::agent("requester"), None);
    let assignment = assign(session.bus(), "coding-agent", json!("implement login form"));

    let seen = next_matching(&mut replies, |m| m.kind == MessageType::TaskComplete).await;
    let kinds: Vec<MessageType> = seen.iter().map(|m| m.kind).collect();
    assert_eq!(kinds, [MessageType::TaskProgress, MessageType::TaskComplete]);

    for reply in &seen {
        assert_eq!(reply.sender, "coding-agent");
        assert_eq!(reply.correlation_id, Some(assignment.id));
    }
    let progress: ProgressReport = seen[0].decode().unwrap();
    assert!(progress.success);
    assert!(progress.output.contains("login form"));
    let complete: CompletionReport = seen[1].decode().unwrap();
    assert_eq!(complete.operations, 1);

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_operation_reported_once_and_queue_continues() {
    let session = Session::new(&config(), Arc::new(FakeRunner::default())).unwrap();
    spawn_online(&session, &[agent("coding-agent", "coding")]).await;

    let mut replies = session
        .bus()
        .subscribe("requester", Filter::agent("requester"), None);
    let failing = assign(session.bus(), "coding-agent", json!("implement broken module"));
    let next = assign(session.bus(), "coding-agent", json!("implement login form"));

    let seen = next_matching(&mut replies, |m| {
        m.kind == MessageType::TaskComplete && m.correlation_id == Some(next.id)
    })
    .await;

    let errors: Vec<&Message> = seen.iter().filter(|m| m.kind == MessageType::TaskError).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].correlation_id, Some(failing.id));
    let failure: FailureReport = errors[0].decode().unwrap();
    assert_eq!(failure.stderr, "cannot compile broken module");
    assert_eq!(failure.exit_code, Some(2));

    let error_at = seen.iter().position(|m| m.kind == MessageType::TaskError);
    let next_started = seen
        .iter()
        .position(|m| m.kind == MessageType::TaskProgress && m.correlation_id == Some(next.id));
    assert!(error_at < next_started);

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_assignments_balanced_across_same_role() {
    let gate = Arc::new(Semaphore::new(0));
    let session = Session::new(&config(), Arc::new(FakeRunner::gated(Arc::clone(&gate)))).unwrap();
    let agents = [
        agent("coder-a", "coding"),
        agent("coder-b", "coding"),
        agent("coder-c", "coding"),
    ];
    spawn_online(&session, &agents).await;
    let client = session.client();

    for n in 0..10 {
        client.assign_task(format!("implement feature {n}")).await.unwrap();
    }

    let status = client.get_status().await.unwrap();
    let loads: Vec<usize> = status.iter().map(|r| r.total_assigned).collect();
    assert_eq!(loads.iter().sum::<usize>(), 10);
    let (min, max) = (loads.iter().min().unwrap(), loads.iter().max().unwrap());
    assert!(max - min <= 1, "unbalanced: {loads:?}");

    gate.add_permits(100);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ten_assignments_split_between_two_agents() {
    let gate = Arc::new(Semaphore::new(0));
    let session = Session::new(&config(), Arc::new(FakeRunner::gated(Arc::clone(&gate)))).unwrap();
    spawn_online(&session, &[agent("coder-a", "coding"), agent("coder-b", "coding")]).await;
    let client = session.client();

    for n in 0..10 {
        client.assign_task(format!("implement feature {n}")).await.unwrap();
    }

    let log = session.bus().log().read_from(None);
    let sent_to = |name: &str| {
        log.iter()
            .filter(|m| m.kind == MessageType::TaskAssignment && m.target == Target::agent(name))
            .count()
    };
    let (a, b) = (sent_to("coder-a"), sent_to("coder-b"));
    assert_eq!(a + b, 10);
    assert!(a.abs_diff(b) <= 1, "unbalanced: {a} vs {b}");

    let status = client.get_status().await.unwrap();
    let loads: Vec<usize> = status.iter().map(|r| r.total_assigned).collect();
    assert_eq!(loads, [a, b]);

    gate.add_permits(100);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_agent_never_runs_two_tasks_at_once() {
    let runner = Arc::new(FakeRunner::default());
    let session = Session::new(&config(), runner.clone()).unwrap();
    spawn_online(&session, &[agent("coding-agent", "coding")]).await;
    let client = session.client();
    let mut events = client.subscribe_events();

    let mut ids: Vec<TaskId> = Vec::new();
    for request in ["implement parser", "implement lexer", "implement printer"] {
        ids.push(client.assign_task(request).await.unwrap().task_id);
    }
    for _ in 0..ids.len() {
        wait_event(&mut events, |e| matches!(e, OrchestratorEvent::TaskCompleted { .. })).await;
    }

    for id in ids {
        assert_eq!(client.task(id).await.unwrap().phase, TaskPhase::Completed);
    }
    assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 1);

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dependent_subtask_waits_for_prerequisite() {
    let session = Session::new(&config(), Arc::new(FakeRunner::default())).unwrap();
    spawn_online(
        &session,
        &[agent("coding-agent", "coding"), agent("testing-agent", "testing")],
    )
    .await;
    let client = session.client();
    let mut events = client.subscribe_events();

    let receipt = client
        .assign_task("implement login form, then test the login form")
        .await
        .unwrap();
    assert_eq!(receipt.subtasks.len(), 2);

    wait_event(&mut events, |e| {
        matches!(e, OrchestratorEvent::TaskCompleted { task_id, .. } if *task_id == receipt.task_id)
    })
    .await;

    let log = session.bus().log().read_from(None);
    let implemented = log
        .iter()
        .find(|m| m.kind == MessageType::TaskComplete && m.sender == "coding-agent")
        .unwrap();
    let testing_assigned = log
        .iter()
        .find(|m| m.kind == MessageType::TaskAssignment && m.target == Target::agent("testing-agent"))
        .unwrap();
    assert!(implemented.id < testing_assigned.id);

    let board = client.board().await.unwrap();
    assert_eq!((board.done, board.todo, board.failed), (2, 0, 0));

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_silent_agent_disconnected_then_reactivated() {
    let session = Session::new(&short_liveness(), Arc::new(FakeRunner::default())).unwrap();
    spawn_online(&session, &[agent("coding-agent", "coding")]).await;
    let client = session.client();
    let mut events = client.subscribe_events();

    let status = client.get_status().await.unwrap();
    assert_eq!(status[0].status, AgentStatus::Active);

    wait_event(&mut events, |e| matches!(e, OrchestratorEvent::AgentDisconnected { .. })).await;
    let status = client.get_status().await.unwrap();
    assert_eq!(status[0].status, AgentStatus::Disconnected);
    assert!(client.assign_task("implement login form").await.is_err());

    session
        .bus()
        .publish(
            MessageDraft::new("requester")
                .to(Target::All)
                .kind(MessageType::Broadcast)
                .payload(status_request()),
        )
        .unwrap();
    wait_event(&mut events, |e| matches!(e, OrchestratorEvent::AgentReactivated { .. })).await;

    let status = client.get_status().await.unwrap();
    assert_ne!(status[0].status, AgentStatus::Disconnected);
    client.assign_task("implement login form").await.unwrap();

    session.shutdown().await.unwrap();
}
