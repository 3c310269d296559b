//! In-process simulated agents.
//!
//! Every agent id answers; an unseen id is a freshly booted agent with its
//! job stopped. Faults target an instance key and match agent ids of the
//! form `<instance>#<n>` as well as the bare key, or `*` for every agent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::transport::{AgentRequest, AgentTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
enum FaultKind {
    Fail(String),
    Hang,
    Flap,
}

/// A scripted misbehavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentFault {
    target: String,
    method: String,
    kind: FaultKind,
    remaining: Option<u32>,
}

impl AgentFault {
    /// Reply to `method` with an error.
    pub fn fail(target: &str, method: &str, reason: &str) -> Self {
        Self::new(target, method, FaultKind::Fail(reason.to_string()))
    }

    /// Never reply to `method`.
    pub fn hang(target: &str, method: &str) -> Self {
        Self::new(target, method, FaultKind::Hang)
    }

    /// Report the job as `failing` from `get_state`.
    pub fn flap(target: &str) -> Self {
        Self::new(target, "get_state", FaultKind::Flap)
    }

    /// Only fire for the next `n` matching calls.
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn new(target: &str, method: &str, kind: FaultKind) -> Self {
        Self {
            target: target.to_string(),
            method: method.to_string(),
            kind,
            remaining: None,
        }
    }

    fn matches(&self, request: &AgentRequest) -> bool {
        self.method == request.method && targets(&self.target, &request.agent_id)
    }
}

fn targets(target: &str, agent_id: &str) -> bool {
    target == "*"
        || agent_id == target
        || agent_id
            .strip_prefix(target)
            .is_some_and(|rest| rest.starts_with('#'))
}

/// A call as the agent saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCall {
    pub agent_id: String,
    pub method: String,
    pub request_id: String,
    pub args: Value,
}

#[derive(Debug, Clone)]
struct SimAgent {
    job_state: String,
    applied: Option<Value>,
    mounted: Vec<String>,
}

impl Default for SimAgent {
    fn default() -> Self {
        Self {
            job_state: "stopped".to_string(),
            applied: None,
            mounted: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct AgentsState {
    agents: HashMap<String, SimAgent>,
    faults: Vec<AgentFault>,
    calls: Vec<AgentCall>,
}

/// Agent transport answering from memory.
#[derive(Debug, Default)]
pub struct SimulatedAgents {
    state: Mutex<AgentsState>,
    latency: Duration,
    drain_wait: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts a call as outstanding until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedAgents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Wait the drain hook asks for.
    pub fn with_drain_wait(mut self, wait: Duration) -> Self {
        self.drain_wait = wait;
        self
    }

    pub fn inject(&self, fault: AgentFault) {
        self.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Every call received, in arrival order.
    pub fn calls(&self) -> Vec<AgentCall> {
        self.lock().calls.clone()
    }

    /// Calls received by agents of `instance`.
    pub fn calls_for(&self, instance: &str) -> Vec<AgentCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| targets(instance, &c.agent_id))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Highest number of calls outstanding at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn job_state(&self, agent_id: &str) -> Option<String> {
        self.lock().agents.get(agent_id).map(|a| a.job_state.clone())
    }

    /// Spec last applied to `agent_id`.
    pub fn applied(&self, agent_id: &str) -> Option<Value> {
        self.lock().agents.get(agent_id).and_then(|a| a.applied.clone())
    }

    pub fn mounted(&self, agent_id: &str) -> Vec<String> {
        self.lock()
            .agents
            .get(agent_id)
            .map(|a| a.mounted.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AgentsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Log the call and pick the fault that applies to it, if any.
    fn admit(&self, request: &AgentRequest) -> Option<FaultKind> {
        let mut state = self.lock();
        state.calls.push(AgentCall {
            agent_id: request.agent_id.clone(),
            method: request.method.clone(),
            request_id: request.request_id.clone(),
            args: request.args.clone(),
        });

        let pos = state.faults.iter().position(|f| f.matches(request))?;
        let fault = &mut state.faults[pos];
        let kind = fault.kind.clone();
        if let Some(n) = fault.remaining.as_mut() {
            *n = n.saturating_sub(1);
            if *n == 0 {
                state.faults.remove(pos);
            }
        }
        Some(kind)
    }

    fn execute(&self, request: &AgentRequest, flapping: bool) -> Result<Value, String> {
        let mut state = self.lock();
        let agent = state.agents.entry(request.agent_id.clone()).or_default();
        let disk_arg = |key: &str| {
            request
                .args
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| format!("missing argument '{key}'"))
        };

        match request.method.as_str() {
            "drain" => Ok(json!({ "wait_ms": self.drain_wait.as_millis() as u64 })),
            "stop" => {
                agent.job_state = "stopped".to_string();
                Ok(json!({}))
            }
            "apply" => {
                agent.applied = Some(request.args.clone());
                Ok(json!({}))
            }
            "start" => {
                agent.job_state = "running".to_string();
                Ok(json!({}))
            }
            "get_state" => {
                let job_state = if flapping {
                    "failing"
                } else {
                    agent.job_state.as_str()
                };
                Ok(json!({ "job_state": job_state, "applied": agent.applied }))
            }
            "mount_disk" => {
                let disk = disk_arg("disk")?;
                if !agent.mounted.contains(&disk) {
                    agent.mounted.push(disk);
                }
                Ok(json!({}))
            }
            "unmount_disk" => {
                let disk = disk_arg("disk")?;
                agent.mounted.retain(|d| *d != disk);
                Ok(json!({}))
            }
            "migrate_disk" => {
                let from = disk_arg("from")?;
                let to = disk_arg("to")?;
                if !agent.mounted.contains(&from) || !agent.mounted.contains(&to) {
                    return Err(format!("{from} and {to} must both be mounted"));
                }
                Ok(json!({}))
            }
            other => Err(format!("unknown method '{other}'")),
        }
    }
}

#[async_trait]
impl AgentTransport for SimulatedAgents {
    async fn send(&self, request: &AgentRequest) -> Result<Value, String> {
        let fault = self.admit(request);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match fault {
            Some(FaultKind::Hang) => {
                debug!(agent = %request.agent_id, method = %request.method, "sim agent hanging");
                std::future::pending().await
            }
            Some(FaultKind::Fail(reason)) => Err(reason),
            Some(FaultKind::Flap) => self.execute(request, true),
            None => self.execute(request, false),
        }
    }
}
