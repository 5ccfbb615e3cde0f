//! External collaborator contracts — agent executors and model runners.
//!
//! The engine never interprets agent graphs or loads model weights. It hands
//! each leased job to one of these traits and records whatever comes back.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ExecutorError, RunnerError, StoreError};
use crate::events::{execution_channel, EventHub, JobEvent};
use crate::queue::{now_ts, Execution, NodeTransition};
use crate::store::{Database, NodeEventStore};

/// Token callback handed to a model runner; called once per streamed token.
pub type TokenSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Result of a completed chat run.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub result: Value,
    pub tokens_per_second: f64,
}

/// Everything an agent executor gets for one run.
///
/// The cancellation token is the cooperative cancel signal: the executor is
/// expected to check it at its own checkpoints and return
/// `ExecutorError::Canceled`. There is no forcible interrupt.
pub struct ExecutorEnv {
    pub agent_config: Value,
    pub execution: Execution,
    pub db: Arc<Database>,
    pub registry: Arc<NodeRegistry>,
    pub emitter: NodeEventEmitter,
    pub cancel: CancellationToken,
}

/// An external agent executor. May emit node events at any point during
/// `run_graph`; a crashed-and-replayed execution will be re-run from scratch,
/// so implementations must be idempotent or tolerate duplicate effects.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run_graph(&self, env: ExecutorEnv) -> Result<Value, ExecutorError>;
}

/// An external model runner with token streaming.
#[async_trait]
pub trait ModelRunner: Send + Sync {
    /// Make sure the model is resident before `run_chat` is called.
    async fn ensure_loaded(&self, model_id: &str) -> Result<(), RunnerError>;

    /// Run a chat completion, calling `on_token` for each streamed token.
    /// Expected to watch `cancel` between tokens and return
    /// `RunnerError::Canceled` when it fires.
    async fn run_chat(
        &self,
        messages: &[Value],
        parameters: &Value,
        on_token: TokenSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome, RunnerError>;
}

/// Loads agent configs by id. Storage of configs is the host's business.
pub trait AgentConfigLoader: Send + Sync {
    fn load(&self, agent_id: &str) -> Result<Value, ExecutorError>;
}

/// Registry of node descriptors available to executors.
///
/// The engine only passes it through; it never looks inside a descriptor.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Value>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a node descriptor.
    pub fn register(&self, node_id: impl Into<String>, descriptor: Value) {
        self.nodes
            .write()
            .expect("NodeRegistry lock poisoned")
            .insert(node_id.into(), descriptor);
    }

    /// Look up a node descriptor.
    pub fn get(&self, node_id: &str) -> Option<Value> {
        self.nodes
            .read()
            .expect("NodeRegistry lock poisoned")
            .get(node_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().expect("NodeRegistry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Records node transitions for one execution: appends to the durable event
/// log and publishes the matching event on `execution:{id}`.
#[derive(Clone)]
pub struct NodeEventEmitter {
    execution_id: Uuid,
    hub: Arc<EventHub>,
    events: NodeEventStore,
}

impl NodeEventEmitter {
    pub fn new(execution_id: Uuid, hub: Arc<EventHub>, events: NodeEventStore) -> Self {
        Self {
            execution_id,
            hub,
            events,
        }
    }

    /// Record one node transition. The durable append happens first; the
    /// in-process publish is best-effort fan-out on top of it.
    pub fn emit(&self, transition: NodeTransition) -> Result<i64, StoreError> {
        let event_id = self.events.append(self.execution_id, &transition)?;
        self.hub.publish(
            &execution_channel(self.execution_id),
            JobEvent::Node {
                execution_id: self.execution_id,
                node_id: transition.node_id,
                status: transition.status,
                intermediate_output: transition.intermediate_output,
                ts: now_ts(),
            },
        );
        Ok(event_id)
    }
}
