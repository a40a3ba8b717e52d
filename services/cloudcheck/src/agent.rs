//! Agent client gateway.
//!
//! [`AgentClient`] is the raw RPC transport to the management agent inside a
//! VM; its implementation lives outside this crate. Recovery code never talks
//! to it directly but through a [`GuardedAgentClient`], which:
//!
//! - bounds every call by the configured timeout
//! - retries timed-out calls for the methods listed in
//!   [`AgentOptions::retry_methods`]
//! - gives up as soon as the task is cancelled
//!
//! Guarded clients are handed out by an [`AgentClientPool`], one per agent
//! id, created on first use and kept for the lifetime of the pool.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_id::AgentId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::DEFAULT_AGENT_TIMEOUT;
use crate::task::CancelSignal;

/// Per-ping bound while waiting for an agent to come up.
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between unanswered pings.
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Errors from agent calls.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {agent_id} did not answer '{method}' within {elapsed:?}")]
    Timeout {
        agent_id: AgentId,
        method: &'static str,
        elapsed: Duration,
    },

    #[error("task cancelled while waiting for agent {agent_id}")]
    Cancelled { agent_id: AgentId },

    #[error("agent {agent_id} failed '{method}': {message}")]
    Rpc {
        agent_id: AgentId,
        method: &'static str,
        message: String,
    },
}

/// State reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Aggregate job state: `running`, `starting`, `failing`, ...
    pub job_state: String,

    /// Network settings as the agent sees them, if it reports any.
    #[serde(default)]
    pub networks: Option<serde_json::Value>,
}

/// Raw RPC transport to one agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn ping(&self) -> Result<(), AgentError>;

    /// Persistent disk CIDs the agent has mounted.
    async fn list_disk(&self) -> Result<Vec<String>, AgentError>;

    async fn get_state(&self) -> Result<AgentState, AgentError>;

    async fn apply(&self, spec: &serde_json::Value) -> Result<(), AgentError>;

    async fn update_settings(&self, settings: &serde_json::Value) -> Result<(), AgentError>;

    async fn mount_disk(&self, disk_cid: &str) -> Result<(), AgentError>;

    /// Run a lifecycle script (`pre-start`, `post-start`) on every job.
    async fn run_script(&self, script: &str) -> Result<(), AgentError>;

    async fn start(&self) -> Result<(), AgentError>;
}

/// Opens raw clients.
pub trait AgentConnector: Send + Sync {
    fn connect(&self, agent_id: AgentId, instance_name: &str) -> Arc<dyn AgentClient>;
}

/// Timeout and retry policy for agent calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions {
    pub timeout: Duration,

    /// Extra attempts per method after a timeout. Methods not listed get one
    /// attempt.
    pub retry_methods: HashMap<&'static str, u32>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_AGENT_TIMEOUT,
            retry_methods: HashMap::new(),
        }
    }
}

impl AgentOptions {
    pub fn new(timeout: Duration, get_state_retries: u32) -> Self {
        Self {
            timeout,
            retry_methods: HashMap::from([("get_state", get_state_retries)]),
        }
    }

    fn retries_for(&self, method: &str) -> u32 {
        self.retry_methods.get(method).copied().unwrap_or(0)
    }
}

/// Agent client with timeout, retry and cancellation applied.
pub struct GuardedAgentClient {
    agent_id: AgentId,
    instance_name: String,
    inner: Arc<dyn AgentClient>,
    options: AgentOptions,
    cancel: CancelSignal,
}

impl GuardedAgentClient {
    pub fn new(
        agent_id: AgentId,
        instance_name: impl Into<String>,
        inner: Arc<dyn AgentClient>,
        options: AgentOptions,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            agent_id,
            instance_name: instance_name.into(),
            inner,
            options,
            cancel,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Ping until the agent answers, for at most the configured timeout.
    pub async fn wait_until_ready(&self) -> Result<(), AgentError> {
        let started = Instant::now();
        let pings = async {
            loop {
                match tokio::time::timeout(PING_TIMEOUT, self.inner.ping()).await {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(AgentError::Rpc { message, .. })) => {
                        debug!(agent_id = %self.agent_id, error = %message, "Agent not ready yet");
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        debug!(agent_id = %self.agent_id, "Ping unanswered");
                    }
                }
                tokio::time::sleep(PING_INTERVAL).await;
            }
        };

        let mut cancel = self.cancel.clone();
        tokio::select! {
            result = tokio::time::timeout(self.options.timeout, pings) => {
                result.unwrap_or_else(|_| Err(AgentError::Timeout {
                    agent_id: self.agent_id,
                    method: "ping",
                    elapsed: started.elapsed(),
                }))
            }
            _ = cancel.cancelled() => Err(AgentError::Cancelled { agent_id: self.agent_id }),
        }
    }

    pub async fn list_disk(&self) -> Result<Vec<String>, AgentError> {
        self.call("list_disk", || self.inner.list_disk()).await
    }

    pub async fn get_state(&self) -> Result<AgentState, AgentError> {
        self.call("get_state", || self.inner.get_state()).await
    }

    pub async fn apply(&self, spec: &serde_json::Value) -> Result<(), AgentError> {
        self.call("apply", || self.inner.apply(spec)).await
    }

    pub async fn update_settings(&self, settings: &serde_json::Value) -> Result<(), AgentError> {
        self.call("update_settings", || self.inner.update_settings(settings))
            .await
    }

    pub async fn mount_disk(&self, disk_cid: &str) -> Result<(), AgentError> {
        self.call("mount_disk", || self.inner.mount_disk(disk_cid))
            .await
    }

    pub async fn run_script(&self, script: &str) -> Result<(), AgentError> {
        self.call("run_script", || self.inner.run_script(script))
            .await
    }

    pub async fn start(&self) -> Result<(), AgentError> {
        self.call("start", || self.inner.start()).await
    }

    async fn call<T, F, Fut>(&self, method: &'static str, send: F) -> Result<T, AgentError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let retries = self.options.retries_for(method);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.attempt(method, send()).await {
                Err(AgentError::Timeout { elapsed, .. }) if attempt <= retries => {
                    warn!(
                        agent_id = %self.agent_id,
                        instance = %self.instance_name,
                        method,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Agent call timed out, retrying"
                    );
                }
                result => return result,
            }
        }
    }

    async fn attempt<T>(
        &self,
        method: &'static str,
        request: impl Future<Output = Result<T, AgentError>>,
    ) -> Result<T, AgentError> {
        let started = Instant::now();
        let mut cancel = self.cancel.clone();

        tokio::select! {
            result = tokio::time::timeout(self.options.timeout, request) => {
                result.unwrap_or_else(|_| Err(AgentError::Timeout {
                    agent_id: self.agent_id,
                    method,
                    elapsed: started.elapsed(),
                }))
            }
            _ = cancel.cancelled() => Err(AgentError::Cancelled { agent_id: self.agent_id }),
        }
    }
}

/// Lazily built, never evicted cache of guarded clients keyed by agent id.
pub struct AgentClientPool {
    connector: Arc<dyn AgentConnector>,
    options: AgentOptions,
    cancel: CancelSignal,
    clients: Mutex<HashMap<AgentId, Arc<GuardedAgentClient>>>,
}

impl AgentClientPool {
    pub fn new(connector: Arc<dyn AgentConnector>, options: AgentOptions, cancel: CancelSignal) -> Self {
        Self {
            connector,
            options,
            cancel,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Client for `agent_id`, connecting on first use.
    pub async fn client(&self, agent_id: AgentId, instance_name: &str) -> Arc<GuardedAgentClient> {
        let mut clients = self.clients.lock().await;
        clients
            .entry(agent_id)
            .or_insert_with(|| {
                debug!(agent_id = %agent_id, instance = %instance_name, "Connecting to agent");
                Arc::new(GuardedAgentClient::new(
                    agent_id,
                    instance_name,
                    self.connector.connect(agent_id, instance_name),
                    self.options.clone(),
                    self.cancel.clone(),
                ))
            })
            .clone()
    }

    /// Number of agents connected so far.
    pub async fn cached_clients(&self) -> usize {
        self.clients.lock().await.len()
    }
}
