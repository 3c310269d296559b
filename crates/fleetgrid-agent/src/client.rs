//! Agent client — timeouts, retries and typed calls.

use std::sync::Arc;
use std::time::Duration;

use fleet_core::DrainHook;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};
use crate::transport::{AgentRequest, AgentTransport};

/// Job state an agent reports once its processes are up.
pub const JOB_RUNNING: &str = "running";

/// Calls agents through a transport.
///
/// A call that times out is re-sent with the same request id up to
/// `retries` more times. Error replies are returned as-is.
#[derive(Clone)]
pub struct AgentClient {
    transport: Arc<dyn AgentTransport>,
    timeout: Duration,
    retries: u32,
}

impl AgentClient {
    pub fn new(transport: Arc<dyn AgentTransport>, timeout: Duration, retries: u32) -> Self {
        Self {
            transport,
            timeout,
            retries,
        }
    }

    pub async fn call(&self, agent_id: &str, method: &str, args: Value) -> AgentResult<Value> {
        self.call_with_timeout(agent_id, method, args, self.timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        agent_id: &str,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> AgentResult<Value> {
        let request = AgentRequest {
            agent_id: agent_id.to_string(),
            method: method.to_string(),
            args,
            request_id: uuid::Uuid::new_v4().to_string(),
        };
        let attempts = self.retries + 1;

        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, self.transport.send(&request)).await {
                Ok(Ok(reply)) => {
                    debug!(agent = %agent_id, %method, attempt, "agent replied");
                    return Ok(reply);
                }
                Ok(Err(reason)) => {
                    return Err(AgentError::Error {
                        agent_id: agent_id.to_string(),
                        method: method.to_string(),
                        reason,
                    });
                }
                Err(_) => {
                    warn!(
                        agent = %agent_id,
                        %method,
                        attempt,
                        request_id = %request.request_id,
                        "agent call timed out"
                    );
                }
            }
        }

        Err(AgentError::Timeout {
            agent_id: agent_id.to_string(),
            method: method.to_string(),
            timeout,
            attempts,
        })
    }

    /// Run the drain hook. Returns how long the agent asked to wait,
    /// capped by the hook's timeout.
    pub async fn drain(&self, agent_id: &str, hook: &DrainHook) -> AgentResult<Duration> {
        let limit = Duration::from_millis(hook.timeout_ms);
        let reply = self
            .call_with_timeout(
                agent_id,
                "drain",
                json!({ "script": hook.script, "timeout_ms": hook.timeout_ms }),
                limit,
            )
            .await?;
        let wait = reply.get("wait_ms").and_then(Value::as_u64).unwrap_or(0);
        Ok(Duration::from_millis(wait).min(limit))
    }

    pub async fn stop(&self, agent_id: &str) -> AgentResult<()> {
        self.call(agent_id, "stop", json!({})).await.map(drop)
    }

    /// Push the rendered instance spec.
    pub async fn apply(&self, agent_id: &str, spec: Value) -> AgentResult<()> {
        self.call(agent_id, "apply", spec).await.map(drop)
    }

    pub async fn start(&self, agent_id: &str) -> AgentResult<()> {
        self.call(agent_id, "start", json!({})).await.map(drop)
    }

    /// The job state reported by the agent (`running`, `stopped`, `failing`).
    pub async fn get_state(&self, agent_id: &str) -> AgentResult<String> {
        let reply = self.call(agent_id, "get_state", json!({})).await?;
        reply
            .get("job_state")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AgentError::BadReply {
                agent_id: agent_id.to_string(),
                method: "get_state".to_string(),
                reason: "missing job_state".to_string(),
            })
    }

    pub async fn mount_disk(&self, agent_id: &str, disk_cid: &str) -> AgentResult<()> {
        self.call(agent_id, "mount_disk", json!({ "disk": disk_cid }))
            .await
            .map(drop)
    }

    pub async fn unmount_disk(&self, agent_id: &str, disk_cid: &str) -> AgentResult<()> {
        self.call(agent_id, "unmount_disk", json!({ "disk": disk_cid }))
            .await
            .map(drop)
    }

    /// Copy persistent data from one mounted disk to another.
    pub async fn migrate_disk(&self, agent_id: &str, from: &str, to: &str) -> AgentResult<()> {
        self.call(agent_id, "migrate_disk", json!({ "from": from, "to": to }))
            .await
            .map(drop)
    }
}
