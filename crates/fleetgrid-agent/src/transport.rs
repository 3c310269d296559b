//! Transport seam for agent RPC.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One request to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent_id: String,
    pub method: String,
    pub args: Value,
    /// Retries reuse the id so the agent can deduplicate.
    pub request_id: String,
}

/// Delivers a request and waits for the reply.
///
/// `Err` carries the agent's error reason. Timeouts are the caller's
/// concern: a transport may wait forever.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send(&self, request: &AgentRequest) -> Result<Value, String>;
}
