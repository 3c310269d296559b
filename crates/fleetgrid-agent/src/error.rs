use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("agent {agent_id} did not answer '{method}' within {timeout:?} ({attempts} attempts)")]
    Timeout {
        agent_id: String,
        method: String,
        timeout: Duration,
        attempts: u32,
    },

    #[error("agent {agent_id} failed '{method}': {reason}")]
    Error {
        agent_id: String,
        method: String,
        reason: String,
    },

    #[error("agent {agent_id} sent a malformed '{method}' reply: {reason}")]
    BadReply {
        agent_id: String,
        method: String,
        reason: String,
    },
}

pub type AgentResult<T> = Result<T, AgentError>;
