//! Agent roster - who is online, what they do, and how busy they are.
//!
//! The roster is a read model: it is only ever changed by applying log
//! messages in append order, so replaying the log rebuilds it exactly.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConclaveError;
use crate::protocol::{
    AgentStatus, Announcement, Message, MessageType, StatusReport, Target, TaskId, AGENT_ONLINE,
};

/// Orchestrator-side bookkeeping for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub name: String,
    pub role: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub last_activity: DateTime<Utc>,
    pub current_task_ids: BTreeSet<TaskId>,
    /// Assignments ever routed to this agent
    pub total_assigned: usize,
}

impl AgentRecord {
    pub fn is_available(&self) -> bool {
        self.status != AgentStatus::Disconnected
    }

    fn load(&self) -> (usize, usize) {
        (self.current_task_ids.len(), self.total_assigned)
    }
}

/// Presence changes worth surfacing to requesters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    Enrolled(String),
    Reactivated(String),
}

/// Agent records derived from the message log
#[derive(Debug, Clone)]
pub struct Roster {
    /// Messages from this sender are bookkeeping, not agent activity
    owner: String,
    agents: HashMap<String, AgentRecord>,
}

impl Roster {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            agents: HashMap::new(),
        }
    }

    /// Fold one log message into the roster
    pub fn apply(&mut self, message: &Message) -> Option<RosterChange> {
        if message.sender == self.owner {
            self.apply_own(message);
            return None;
        }

        if let Some(announce) = Self::announcement(message) {
            return self.enroll(message, announce);
        }

        let Some(record) = self.agents.get_mut(&message.sender) else {
            debug!(sender = %message.sender, id = %message.id, "Message from unknown agent");
            return None;
        };

        record.last_activity = record.last_activity.max(message.timestamp);
        let was_disconnected = record.status == AgentStatus::Disconnected;

        match message.kind {
            MessageType::StatusReport => {
                record.status = message
                    .decode::<StatusReport>()
                    .map_or(AgentStatus::Active, |report| report.status);
            }
            MessageType::TaskProgress => record.status = AgentStatus::Working,
            MessageType::TaskComplete | MessageType::TaskError => {
                if let Some(task_id) = message.task_id() {
                    record.current_task_ids.remove(&task_id);
                }
                record.status = if record.current_task_ids.is_empty() {
                    AgentStatus::Active
                } else {
                    AgentStatus::Working
                };
            }
            _ if was_disconnected => record.status = AgentStatus::Active,
            _ => {}
        }

        if was_disconnected && record.is_available() {
            info!(agent = %record.name, "Agent reactivated");
            return Some(RosterChange::Reactivated(record.name.clone()));
        }
        None
    }

    fn apply_own(&mut self, message: &Message) {
        if message.kind != MessageType::TaskAssignment {
            return;
        }
        let (Target::Agent(name), Some(task_id)) = (&message.target, message.task_id()) else {
            return;
        };
        if let Some(record) = self.agents.get_mut(name) {
            record.current_task_ids.insert(task_id);
            record.total_assigned += 1;
        }
    }

    fn announcement(message: &Message) -> Option<Announcement> {
        if message.kind != MessageType::Broadcast {
            return None;
        }
        message
            .decode::<Announcement>()
            .filter(|a| a.event == AGENT_ONLINE)
    }

    fn enroll(&mut self, message: &Message, announce: Announcement) -> Option<RosterChange> {
        let capabilities = announce.capabilities.into_iter().collect();
        match self.agents.get_mut(&message.sender) {
            Some(record) => {
                let was_disconnected = record.status == AgentStatus::Disconnected;
                record.role = announce.role;
                record.capabilities = capabilities;
                record.status = AgentStatus::Active;
                record.last_activity = record.last_activity.max(message.timestamp);
                was_disconnected.then(|| RosterChange::Reactivated(record.name.clone()))
            }
            None => {
                info!(agent = %message.sender, role = %announce.role, "Agent enrolled");
                self.agents.insert(
                    message.sender.clone(),
                    AgentRecord {
                        name: message.sender.clone(),
                        role: announce.role,
                        capabilities,
                        status: AgentStatus::Active,
                        last_activity: message.timestamp,
                        current_task_ids: BTreeSet::new(),
                        total_assigned: 0,
                    },
                );
                Some(RosterChange::Enrolled(message.sender.clone()))
            }
        }
    }

    /// Least-loaded available agent of `role`, falling back to any available agent
    pub fn select(&self, role: Option<&str>) -> Option<&AgentRecord> {
        role.and_then(|role| self.least_loaded(|r| r.role == role))
            .or_else(|| self.least_loaded(|_| true))
    }

    fn least_loaded(&self, pred: impl Fn(&AgentRecord) -> bool) -> Option<&AgentRecord> {
        self.agents
            .values()
            .filter(|r| r.is_available() && pred(r))
            .min_by(|a, b| a.load().cmp(&b.load()).then_with(|| a.name.cmp(&b.name)))
    }

    /// Mark agents silent for longer than `timeout` as disconnected
    pub fn sweep(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<ConclaveError> {
        let mut expired = Vec::new();
        for record in self.agents.values_mut() {
            if !record.is_available() {
                continue;
            }
            let silent = now - record.last_activity;
            if silent.to_std().is_ok_and(|silent| silent > timeout) {
                record.status = AgentStatus::Disconnected;
                expired.push(ConclaveError::LivenessTimeout {
                    agent: record.name.clone(),
                    silent_ms: silent.num_milliseconds(),
                });
            }
        }
        expired
    }

    pub fn get(&self, name: &str) -> Option<&AgentRecord> {
        self.agents.get(name)
    }

    /// All records, disconnected ones included, sorted by name
    pub fn records(&self) -> Vec<AgentRecord> {
        let mut records: Vec<_> = self.agents.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MessageLog;
    use crate::protocol::{MessageDraft, MessageId, TaskSpec};
    use serde_json::json;

    struct Feed {
        log: MessageLog,
    }

    impl Feed {
        fn new() -> Self {
            Self {
                log: MessageLog::in_memory(),
            }
        }

        fn push(&self, draft: MessageDraft) -> Message {
            self.log.append(draft).unwrap()
        }

        fn announce(&self, name: &str, role: &str) -> Message {
            self.push(
                MessageDraft::new(name)
                    .to(Target::All)
                    .kind(MessageType::Broadcast)
                    .report(&Announcement::online(role, vec![role.to_string()]))
                    .unwrap(),
            )
        }

        fn assign(&self, name: &str, task_id: TaskId) -> Message {
            self.push(
                MessageDraft::new("orchestrator")
                    .to(Target::agent(name))
                    .kind(MessageType::TaskAssignment)
                    .report(&TaskSpec {
                        task_id: Some(task_id),
                        description: "implement it".into(),
                        ..Default::default()
                    })
                    .unwrap(),
            )
        }

        fn complete(&self, name: &str, task_id: TaskId) -> Message {
            self.push(
                MessageDraft::new(name)
                    .to(Target::agent("orchestrator"))
                    .kind(MessageType::TaskComplete)
                    .payload(json!({ "taskId": task_id.to_string(), "operations": 1, "outputs": [] })),
            )
        }
    }

    #[test]
    fn test_announce_enrolls() {
        let feed = Feed::new();
        let mut roster = Roster::new("orchestrator");

        let change = roster.apply(&feed.announce("coder", "coding"));
        assert_eq!(change, Some(RosterChange::Enrolled("coder".into())));

        let record = roster.get("coder").unwrap();
        assert_eq!(record.role, "coding");
        assert_eq!(record.status, AgentStatus::Active);
        assert!(record.capabilities.contains("coding"));
    }

    #[test]
    fn test_assignment_and_completion_track_load() {
        let feed = Feed::new();
        let mut roster = Roster::new("orchestrator");
        roster.apply(&feed.announce("coder", "coding"));

        let task_id = TaskId::new();
        roster.apply(&feed.assign("coder", task_id));
        let record = roster.get("coder").unwrap();
        assert!(record.current_task_ids.contains(&task_id));
        assert_eq!(record.total_assigned, 1);

        roster.apply(&feed.complete("coder", task_id));
        let record = roster.get("coder").unwrap();
        assert!(record.current_task_ids.is_empty());
        assert_eq!(record.total_assigned, 1);
    }

    #[test]
    fn test_select_least_loaded_with_tie_breaks() {
        let feed = Feed::new();
        let mut roster = Roster::new("orchestrator");
        roster.apply(&feed.announce("coder-b", "coding"));
        roster.apply(&feed.announce("coder-a", "coding"));
        roster.apply(&feed.announce("scout", "research"));

        // Equal load: name decides.
        assert_eq!(roster.select(Some("coding")).unwrap().name, "coder-a");

        let task_id = TaskId::new();
        roster.apply(&feed.assign("coder-a", task_id));
        assert_eq!(roster.select(Some("coding")).unwrap().name, "coder-b");

        // Both idle again, but coder-a has more history.
        roster.apply(&feed.complete("coder-a", task_id));
        assert_eq!(roster.select(Some("coding")).unwrap().name, "coder-b");

        // Unknown role falls back to anyone available.
        assert!(roster.select(Some("design")).is_some());
    }

    #[test]
    fn test_sweep_and_reactivation() {
        let feed = Feed::new();
        let mut roster = Roster::new("orchestrator");
        let announce = feed.announce("coder", "coding");
        roster.apply(&announce);

        let later = announce.timestamp + chrono::Duration::seconds(31);
        let expired = roster.sweep(later, Duration::from_secs(30));
        assert_eq!(expired.len(), 1);
        assert!(matches!(&expired[0], ConclaveError::LivenessTimeout { agent, .. } if agent == "coder"));
        assert_eq!(roster.get("coder").unwrap().status, AgentStatus::Disconnected);
        assert!(roster.select(Some("coding")).is_none());

        // Already disconnected: not reported twice.
        assert!(roster.sweep(later, Duration::from_secs(30)).is_empty());

        let progress = feed.push(
            MessageDraft::new("coder")
                .to(Target::agent("orchestrator"))
                .kind(MessageType::TaskProgress)
                .payload(json!({ "taskId": TaskId::new().to_string() })),
        );
        assert_eq!(
            roster.apply(&progress),
            Some(RosterChange::Reactivated("coder".into()))
        );
        assert!(roster.get("coder").unwrap().is_available());
    }

    #[test]
    fn test_orchestrator_messages_are_not_activity() {
        let feed = Feed::new();
        let mut roster = Roster::new("orchestrator");
        roster.apply(&feed.push(
            MessageDraft::new("orchestrator")
                .to(Target::All)
                .kind(MessageType::Broadcast)
                .report(&Announcement::online("orchestrator", vec![]))
                .unwrap(),
        ));
        assert!(roster.is_empty());
    }

    #[test]
    fn test_rebuilt_by_replay() {
        let feed = Feed::new();
        let mut live = Roster::new("orchestrator");
        let task_id = TaskId::new();

        for message in [
            feed.announce("coder", "coding"),
            feed.announce("qa", "testing"),
            feed.assign("coder", task_id),
            feed.assign("qa", TaskId::new()),
            feed.complete("coder", task_id),
        ] {
            live.apply(&message);
        }

        let mut rebuilt = Roster::new("orchestrator");
        for message in feed.log.read_from(Some(MessageId::ORIGIN)) {
            rebuilt.apply(&message);
        }
        assert_eq!(rebuilt.records(), live.records());
    }
}
