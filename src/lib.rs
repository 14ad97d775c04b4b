//! # Conclave
//!
//! Multi-agent orchestration core: independent agents that exchange messages
//! over one append-only log, receive task assignments, run them and report
//! back, with an orchestrator that plans requests and tracks the work.
//!
//! ## Architecture
//!
//! ```text
//!   requests ──► OrchestratorClient ──► ORCHESTRATOR ─── plan ─► Planner
//!                                        │      ▲
//!                         task-assignment│      │ progress / complete / error
//!                                        ▼      │ status-report, announce
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     MESSAGE LOG  (append-only, JSONL)               │
//! └───────────────────────────────┬─────────────────────────────────────┘
//!                                 │ CHANNEL BUS (filters, replay)
//!          ┌──────────────────────┼──────────────────────┐
//!          ▼                      ▼                      ▼
//!   ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//!   │ research    │        │ coding      │        │ testing     │
//!   │ agent       │        │ agent       │        │ agent       │
//!   └──────┬──────┘        └──────┬──────┘        └──────┬──────┘
//!          │ TaskParser → CommandExecutor → ExternalRunner
//!          ▼
//!     shells, tools, files
//! ```
//!
//! ## Key Concepts
//!
//! - **Message**: an immutable log entry; the only thing agents share
//! - **Agent**: a tokio task owning its queue and the tasks in it
//! - **Task**: ordered operations parsed from one task-assignment
//! - **Roster**: the orchestrator's view of agents, rebuilt from the log
//! - **Session**: the log, the orchestrator and the agents wired from config

pub mod agent;
pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod log;
pub mod orchestrator;
pub mod parser;
pub mod planner;
pub mod protocol;
pub mod roster;
pub mod session;
pub mod task;

pub use agent::{AgentHandle, AgentProfile, AgentRuntime, AgentState};
pub use bus::{ChannelBus, Filter, Subscription};
pub use channel::{Assignment, ChannelPair, OrchestratorClient, OrchestratorEvent};
pub use config::{AgentConfig, ConclaveConfig};
pub use error::{ConclaveError, Result};
pub use executor::{
    CommandExecutor, ExternalRunner, HandlerRegistry, OperationHandler, ShellRunner,
    TemplateHandler,
};
pub use log::MessageLog;
pub use orchestrator::{Board, Orchestrator, OrchestratorSettings, TaskPhase, TaskRecord};
pub use parser::{KeywordRule, RuleTable, TaskParser};
pub use planner::{Planner, Subtask};
pub use protocol::{
    AgentStatus, Message, MessageDraft, MessageId, MessageType, Target, TaskId, TaskSpec,
};
pub use roster::{AgentRecord, Roster};
pub use session::Session;
pub use task::{CommandSpec, ExternalOutput, Operation, OperationKind, OperationResult, Task};
