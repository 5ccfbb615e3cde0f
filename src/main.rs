use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use agent_core::api::{self, AppState};
use agent_core::config::EngineConfig;
use agent_core::enqueue::EnqueueService;
use agent_core::error::{ExecutorError, RunnerError};
use agent_core::events::EventHub;
use agent_core::executor::{
    AgentConfigLoader, AgentExecutor, ChatOutcome, ExecutorEnv, ModelRunner, NodeRegistry,
    TokenSink,
};
use agent_core::priority;
use agent_core::queue::NodeTransition;
use agent_core::recovery;
use agent_core::store::{Database, ExecutionStore, InferenceStore, NodeEventStore};
use agent_core::workers::{
    AgentWorker, AgentWorkerDeps, CancelRegistry, InferenceWorker, InferenceWorkerDeps,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env();

    eprintln!("⚙️  Agent Core v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Listening: {}\n", config.http_addr);

    let db = Arc::new(Database::open(&config.db_path)?);
    let executions = ExecutionStore::new(Arc::clone(&db));
    let inference = InferenceStore::new(Arc::clone(&db));
    let events = NodeEventStore::new(Arc::clone(&db));

    // Repair in-flight rows from a previous crash before any worker leases.
    recovery::recover(&executions, &inference)?;

    let hub = Arc::new(EventHub::new());
    let registry = Arc::new(NodeRegistry::new());
    let execution_cancels = Arc::new(CancelRegistry::new());
    let inference_cancels = Arc::new(CancelRegistry::new());
    let enqueue = EnqueueService::new(executions.clone(), inference.clone());

    let _aging = priority::spawn_aging_loop(executions.clone(), inference.clone(), &config);

    // Built-in demo collaborators; a real deployment wires its own
    // executor and runner here.
    let executor: Arc<dyn AgentExecutor> = Arc::new(PassthroughExecutor);
    let config_loader: Arc<dyn AgentConfigLoader> = Arc::new(EmptyConfigLoader);
    let runner: Arc<dyn ModelRunner> = Arc::new(EchoRunner);

    for _ in 0..config.agent_workers {
        let worker = AgentWorker::new(AgentWorkerDeps {
            executions: executions.clone(),
            events: events.clone(),
            hub: Arc::clone(&hub),
            db: Arc::clone(&db),
            registry: Arc::clone(&registry),
            executor: Arc::clone(&executor),
            config_loader: Arc::clone(&config_loader),
            cancels: Arc::clone(&execution_cancels),
            lease_ttl: config.agent_lease_ttl,
            poll_interval: config.poll_interval,
        });
        tokio::spawn(worker.run());
    }

    for _ in 0..config.inference_workers {
        let worker = InferenceWorker::new(InferenceWorkerDeps {
            tasks: inference.clone(),
            hub: Arc::clone(&hub),
            runner: Arc::clone(&runner),
            cancels: Arc::clone(&inference_cancels),
            lease_ttl: config.inference_lease_ttl,
            poll_interval: config.poll_interval,
        });
        tokio::spawn(worker.run());
    }

    let state = AppState {
        enqueue,
        executions,
        tasks: inference,
        hub,
        execution_cancels,
        inference_cancels,
        db,
        started: Instant::now(),
    };

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    tracing::info!(addr = %config.http_addr, "HTTP server listening");
    axum::serve(listener, api::routes(state)).await?;

    Ok(())
}

/// Demo executor: emits one node event and echoes the agent id back.
struct PassthroughExecutor;

#[async_trait]
impl AgentExecutor for PassthroughExecutor {
    async fn run_graph(&self, env: ExecutorEnv) -> Result<Value, ExecutorError> {
        if env.cancel.is_cancelled() {
            return Err(ExecutorError::Canceled);
        }
        env.emitter
            .emit(NodeTransition::completed("passthrough", None))?;
        Ok(json!({"agent_id": env.execution.agent_id, "echo": true}))
    }
}

/// Demo config loader: every agent gets an empty config.
struct EmptyConfigLoader;

impl AgentConfigLoader for EmptyConfigLoader {
    fn load(&self, _agent_id: &str) -> Result<Value, ExecutorError> {
        Ok(json!({}))
    }
}

/// Demo runner: streams a fixed greeting word by word.
struct EchoRunner;

#[async_trait]
impl ModelRunner for EchoRunner {
    async fn ensure_loaded(&self, model_id: &str) -> Result<(), RunnerError> {
        tracing::info!(model_id = model_id, "Model ready");
        Ok(())
    }

    async fn run_chat(
        &self,
        _messages: &[Value],
        _parameters: &Value,
        on_token: TokenSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome, RunnerError> {
        let words = ["Hello", " ", "from", " ", "Agent", " ", "Core"];
        let start = Instant::now();
        for word in words {
            if cancel.is_cancelled() {
                return Err(RunnerError::Canceled);
            }
            on_token(word);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let tokens_per_second = words.len() as f64 / start.elapsed().as_secs_f64();
        Ok(ChatOutcome {
            result: json!({
                "text": words.concat(),
                "finish_reason": "stop",
            }),
            tokens_per_second,
        })
    }
}
