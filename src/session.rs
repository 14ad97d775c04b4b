//! Session management - one orchestrator and its agents over a shared log

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentHandle, AgentProfile, AgentRuntime, AgentState};
use crate::bus::ChannelBus;
use crate::channel::OrchestratorClient;
use crate::config::{AgentConfig, AgentDefaults, ConclaveConfig};
use crate::error::{ConclaveError, Result};
use crate::executor::{
    CommandExecutor, ExternalRunner, HandlerRegistry, OperationHandler, ShellRunner,
    TemplateHandler,
};
use crate::log::MessageLog;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};

/// Tool used for operations when neither the agent nor its role names one
const FALLBACK_PROGRAM: &str = "echo";

/// A running orchestration session
pub struct Session {
    settings: OrchestratorSettings,
    defaults: AgentDefaults,
    bus: ChannelBus,
    client: OrchestratorClient,
    handlers: HandlerRegistry,
    runner: Arc<dyn ExternalRunner>,
    /// Running agents by name
    agents: RwLock<HashMap<String, AgentHandle>>,
    shutdown: CancellationToken,
    orchestrator: JoinHandle<Result<()>>,
}

impl Session {
    /// Start the orchestrator and every configured agent, running commands as child processes
    pub fn start(config: &ConclaveConfig) -> Result<Self> {
        let runner = Arc::new(ShellRunner::new(
            config.agent.shell.clone(),
            config.agent.command_timeout(),
        ));
        let session = Self::new(config, runner)?;
        for agent in config.agent_roster() {
            session.spawn_agent(&agent)?;
        }
        Ok(session)
    }

    /// Open the log and start the orchestrator; no agents yet
    pub fn new(config: &ConclaveConfig, runner: Arc<dyn ExternalRunner>) -> Result<Self> {
        let log = match &config.log.path {
            Some(path) => MessageLog::open(path)?,
            None => MessageLog::in_memory(),
        };
        let bus = ChannelBus::new(log);
        let settings = config.orchestrator.settings();
        let shutdown = CancellationToken::new();

        let (orchestrator, client) = Orchestrator::with_channel(settings.clone(), bus.clone());
        let orchestrator = tokio::spawn(orchestrator.with_shutdown(shutdown.clone()).run());

        info!(
            orchestrator = %settings.name,
            durable = config.log.path.is_some(),
            "Session started"
        );

        Ok(Self {
            settings,
            defaults: config.agent.clone(),
            bus,
            client,
            handlers: HandlerRegistry::new(Arc::new(TemplateHandler::new(
                FALLBACK_PROGRAM,
                Vec::new(),
            ))),
            runner,
            agents: RwLock::new(HashMap::new()),
            shutdown,
            orchestrator,
        })
    }

    /// Use `handler` for agents of `role` that don't name their own program
    pub fn with_handler(mut self, role: impl Into<String>, handler: Arc<dyn OperationHandler>) -> Self {
        self.handlers.register(role, handler);
        self
    }

    pub fn client(&self) -> OrchestratorClient {
        self.client.clone()
    }

    pub fn bus(&self) -> &ChannelBus {
        &self.bus
    }

    /// Start an agent runtime on its own task
    pub fn spawn_agent(&self, config: &AgentConfig) -> Result<()> {
        let name = config.name.trim();
        if name.is_empty() || name == self.settings.name {
            return Err(ConclaveError::Validation(format!(
                "invalid agent name {:?}",
                config.name
            )));
        }
        if self.agents.read().contains_key(name) {
            return Err(ConclaveError::Validation(format!(
                "agent {name} is already running"
            )));
        }

        let handler: Arc<dyn OperationHandler> = match &config.program {
            Some(program) => Arc::new(TemplateHandler::new(program, config.args.clone())),
            None => self.handlers.for_role(&config.role),
        };
        let mut profile = AgentProfile::new(name, &config.role);
        if !config.capabilities.is_empty() {
            profile = profile.with_capabilities(config.capabilities.clone());
        }

        let handle = AgentRuntime::new(
            profile,
            self.bus.clone(),
            CommandExecutor::new(handler, Arc::clone(&self.runner)),
        )
        .with_orchestrator(&self.settings.name)
        .with_heartbeat(self.defaults.heartbeat())
        .spawn();

        info!(agent = %name, role = %config.role, "Spawned agent");
        self.agents.write().insert(name.to_string(), handle);
        Ok(())
    }

    /// Stop an agent; it reports itself disconnected on the way out
    pub async fn terminate_agent(&self, name: &str) -> Result<()> {
        let handle = self
            .agents
            .write()
            .remove(name)
            .ok_or_else(|| ConclaveError::Validation(format!("no running agent {name}")))?;

        handle.shutdown().await?;
        info!(agent = %name, "Terminated agent");
        Ok(())
    }

    /// Names of running agents, sorted
    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn agent_state(&self, name: &str) -> Option<AgentState> {
        self.agents.read().get(name).map(AgentHandle::state)
    }

    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }

    /// Stop every agent, then the orchestrator
    pub async fn shutdown(self) -> Result<()> {
        let agents: Vec<AgentHandle> = self.agents.write().drain().map(|(_, h)| h).collect();
        for handle in agents {
            let name = handle.name().to_string();
            if let Err(e) = handle.shutdown().await {
                warn!(agent = %name, error = %e, "Agent stopped with an error");
            }
        }

        self.shutdown.cancel();
        match self.orchestrator.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "Orchestrator task aborted"),
        }
        info!("Session stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::OrchestratorEvent;
    use crate::executor::MockExternalRunner;
    use crate::protocol::AgentStatus;
    use crate::task::ExternalOutput;
    use std::time::Duration;

    fn echo_runner() -> Arc<dyn ExternalRunner> {
        let mut runner = MockExternalRunner::new();
        runner.expect_run_external().returning(|cmd| {
            Ok(ExternalOutput {
                exit_status: Some(0),
                stdout: cmd.to_string(),
                stderr: String::new(),
            })
        });
        Arc::new(runner)
    }

    fn agent(name: &str, role: &str) -> AgentConfig {
        AgentConfig {
            name: name.into(),
            role: role.into(),
            capabilities: Vec::new(),
            program: None,
            args: Vec::new(),
        }
    }

    fn test_config() -> ConclaveConfig {
        ConclaveConfig::from_toml("").unwrap()
    }

    #[tokio::test]
    async fn test_spawn_and_reject_duplicates() {
        let session = Session::new(&test_config(), echo_runner()).unwrap();
        session.spawn_agent(&agent("coding-agent", "coding")).unwrap();

        assert_eq!(session.agent_count(), 1);
        assert!(matches!(
            session.spawn_agent(&agent("coding-agent", "coding")),
            Err(ConclaveError::Validation(_))
        ));
        assert!(session.spawn_agent(&agent("orchestrator", "coding")).is_err());
        assert!(session.spawn_agent(&agent(" ", "coding")).is_err());

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_runs_to_completion() {
        let session = Session::new(&test_config(), echo_runner()).unwrap();
        let client = session.client();
        let mut events = client.subscribe_events();
        session.spawn_agent(&agent("coding-agent", "coding")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.get_status().await.unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let receipt = client.assign_task("implement login form").await.unwrap();
        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(OrchestratorEvent::TaskCompleted { task_id, agent }) = events.recv().await {
                    return (task_id, agent);
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(completed, (receipt.task_id, Some("coding-agent".to_string())));
        let record = client.task(receipt.task_id).await.unwrap();
        assert_eq!(record.outputs.len(), 1);
        assert!(record.outputs[0].contains("login form"));

        session.shutdown().await.unwrap();
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_terminate_reports_disconnected() {
        let session = Session::new(&test_config(), echo_runner()).unwrap();
        session.spawn_agent(&agent("scout", "research")).unwrap();

        session.terminate_agent("scout").await.unwrap();
        assert_eq!(session.agent_count(), 0);
        assert!(session.terminate_agent("scout").await.is_err());

        let status = session.client().get_status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].status, AgentStatus::Disconnected);

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_durable_session_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.log.path = Some(dir.path().join("conclave.jsonl"));

        let session = Session::new(&config, echo_runner()).unwrap();
        session.spawn_agent(&agent("coding-agent", "coding")).unwrap();
        session.terminate_agent("coding-agent").await.unwrap();
        let before = session.bus().log().len();
        session.shutdown().await.unwrap();

        let restarted = Session::new(&config, echo_runner()).unwrap();
        assert_eq!(restarted.bus().log().len(), before);
        let status = restarted.client().get_status().await.unwrap();
        assert_eq!(status[0].name, "coding-agent");
        restarted.shutdown().await.unwrap();
    }
}
