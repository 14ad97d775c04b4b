//! Conclave error types

use thiserror::Error;

use crate::protocol::TaskId;

/// Errors that can occur in the conclave core
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// Malformed message rejected at publish time
    #[error("Validation error: {0}")]
    Validation(String),

    /// Task-assignment payload carried nothing to work on
    #[error("Unparsable task: {0}")]
    UnparsableTask(String),

    /// External command or tool failure
    #[error("Operation failed: {0}")]
    OperationExecution(String),

    /// A subscriber could not be reached
    #[error("Delivery to subscriber {subscriber} failed")]
    Delivery {
        /// Subscriber label (usually the agent name)
        subscriber: String,
    },

    /// Agent presumed disconnected
    #[error("Agent {agent} silent for {silent_ms}ms")]
    LivenessTimeout {
        /// Agent name
        agent: String,
        /// Milliseconds since the last observed message
        silent_ms: i64,
    },

    /// No agent can take the assignment
    #[error("No available agent for role {0}")]
    NoAvailableAgent(String),

    /// Unknown task id
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Channel closed (orchestrator or agent loop stopped)
    #[error("Channel is closed")]
    ChannelClosed,

    /// Log file I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire format error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ConclaveError>;
