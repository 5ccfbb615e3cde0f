//! Agent worker — leases executions and drives the external executor.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ExecutorError, StoreError};
use crate::events::EventHub;
use crate::executor::{AgentConfigLoader, AgentExecutor, ExecutorEnv, NodeEventEmitter, NodeRegistry};
use crate::queue::{Execution, JobStatus};
use crate::store::{Database, ExecutionStore, NodeEventStore};
use crate::workers::cancel::CancelRegistry;

/// Shared dependencies for an agent worker.
#[derive(Clone)]
pub struct AgentWorkerDeps {
    pub executions: ExecutionStore,
    pub events: NodeEventStore,
    pub hub: Arc<EventHub>,
    pub db: Arc<Database>,
    pub registry: Arc<NodeRegistry>,
    pub executor: Arc<dyn AgentExecutor>,
    pub config_loader: Arc<dyn AgentConfigLoader>,
    pub cancels: Arc<CancelRegistry>,
    pub lease_ttl: Duration,
    pub poll_interval: Duration,
}

/// Repeatedly leases one PENDING execution, runs it, finalizes it.
pub struct AgentWorker {
    lease_id: Uuid,
    deps: AgentWorkerDeps,
}

impl AgentWorker {
    /// Create a new worker with its own lease identity.
    pub fn new(deps: AgentWorkerDeps) -> Self {
        Self {
            lease_id: Uuid::new_v4(),
            deps,
        }
    }

    /// Main worker loop. Store errors never kill the loop; the worker logs
    /// and moves on to the next iteration.
    pub async fn run(self) {
        info!(lease_id = %self.lease_id, "AgentWorker started");
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.deps.poll_interval).await,
                Err(e) => {
                    error!(error = %e, "AgentWorker iteration failed");
                    tokio::time::sleep(self.deps.poll_interval).await;
                }
            }
        }
    }

    /// One iteration: sweep dangling cancels, then lease and process at most
    /// one execution. Returns whether a job was processed.
    pub async fn run_once(&self) -> Result<bool, StoreError> {
        for execution_id in self.deps.executions.sweep_cancel_requested()? {
            info!(execution_id = %execution_id, "Execution cancelled before dispatch");
        }

        let Some(exec) = self.deps.executions.lease(self.lease_id, self.deps.lease_ttl)? else {
            return Ok(false);
        };
        self.process(exec).await?;
        Ok(true)
    }

    /// Run one leased execution to a terminal state.
    async fn process(&self, exec: Execution) -> Result<(), StoreError> {
        let execution_id = exec.execution_id;
        info!(execution_id = %execution_id, agent_id = %exec.agent_id, "Execution started");

        let cancel = self.deps.cancels.register(execution_id);

        // A cancel request that raced the lease lands before the handle is
        // registered; re-read the row so it is not lost.
        if let Ok(Some(row)) = self.deps.executions.get(execution_id)
            && row.status == JobStatus::CancelRequested
        {
            cancel.cancel();
        }

        let outcome = self.execute(exec, cancel).await;

        let finalized = match outcome {
            Ok(result) => {
                info!(execution_id = %execution_id, "Execution completed");
                self.deps
                    .executions
                    .finalize(execution_id, JobStatus::Completed, Some(&result), None)
            }
            Err(ExecutorError::Canceled) => {
                info!(execution_id = %execution_id, "Execution cancelled");
                self.deps
                    .executions
                    .finalize(execution_id, JobStatus::Canceled, None, None)
            }
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Execution failed");
                self.deps.executions.finalize(
                    execution_id,
                    JobStatus::Failed,
                    None,
                    Some(&e.to_string()),
                )
            }
        };

        self.deps.cancels.remove(execution_id);
        finalized
    }

    /// Assemble the executor environment and invoke `run_graph`.
    async fn execute(
        &self,
        exec: Execution,
        cancel: CancellationToken,
    ) -> Result<Value, ExecutorError> {
        let agent_config = self.deps.config_loader.load(&exec.agent_id)?;
        let emitter = NodeEventEmitter::new(
            exec.execution_id,
            Arc::clone(&self.deps.hub),
            self.deps.events.clone(),
        );
        let env = ExecutorEnv {
            agent_config,
            execution: exec,
            db: Arc::clone(&self.deps.db),
            registry: Arc::clone(&self.deps.registry),
            emitter,
            cancel,
        };
        self.deps.executor.run_graph(env).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enqueue::EnqueueService;
    use crate::queue::{JobSource, NodeTransition};
    use crate::store::InferenceStore;
    use async_trait::async_trait;
    use serde_json::json;

    /// Echoes the execution's input back as its result, emitting one node event.
    struct EchoExecutor;

    #[async_trait]
    impl AgentExecutor for EchoExecutor {
        async fn run_graph(&self, env: ExecutorEnv) -> Result<Value, ExecutorError> {
            env.emitter
                .emit(NodeTransition::completed("echo", Some(json!({"ok": true}))))?;
            Ok(json!({"agent": env.execution.agent_id}))
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl AgentExecutor for FailingExecutor {
        async fn run_graph(&self, _env: ExecutorEnv) -> Result<Value, ExecutorError> {
            Err(ExecutorError::Failed {
                message: "graph blew up".into(),
            })
        }
    }

    /// Blocks until the cancellation token fires, then reports cancelled.
    struct WaitForCancelExecutor;

    #[async_trait]
    impl AgentExecutor for WaitForCancelExecutor {
        async fn run_graph(&self, env: ExecutorEnv) -> Result<Value, ExecutorError> {
            env.cancel.cancelled().await;
            Err(ExecutorError::Canceled)
        }
    }

    struct EmptyConfigLoader;

    impl AgentConfigLoader for EmptyConfigLoader {
        fn load(&self, _agent_id: &str) -> Result<Value, ExecutorError> {
            Ok(json!({}))
        }
    }

    fn setup(executor: Arc<dyn AgentExecutor>) -> (AgentWorker, EnqueueService, ExecutionStore) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let executions = ExecutionStore::new(Arc::clone(&db));
        let inference = InferenceStore::new(Arc::clone(&db));
        let events = NodeEventStore::new(Arc::clone(&db));
        let enqueue = EnqueueService::new(executions.clone(), inference);

        let worker = AgentWorker::new(AgentWorkerDeps {
            executions: executions.clone(),
            events,
            hub: Arc::new(EventHub::new()),
            db,
            registry: Arc::new(NodeRegistry::new()),
            executor,
            config_loader: Arc::new(EmptyConfigLoader),
            cancels: Arc::new(CancelRegistry::new()),
            lease_ttl: Duration::from_secs(600),
            poll_interval: Duration::from_millis(10),
        });
        (worker, enqueue, executions)
    }

    #[tokio::test]
    async fn run_once_on_empty_queue_is_idle() {
        let (worker, _, _) = setup(Arc::new(EchoExecutor));
        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn completes_execution_with_result_and_node_events() {
        let (worker, enqueue, executions) = setup(Arc::new(EchoExecutor));
        let id = enqueue
            .enqueue_execution("agent-7", json!({"q": 1}), JobSource::ManualRun, None, None)
            .unwrap();

        assert!(worker.run_once().await.unwrap());

        let row = executions.get(id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.final_result, Some(json!({"agent": "agent-7"})));
        assert!(row.lease_id.is_none());

        let logged = worker.deps.events.list(id).unwrap();
        let nodes: Vec<&str> = logged.iter().map(|e| e.node_id.as_str()).collect();
        assert_eq!(nodes, vec!["input_start", "echo"]);
    }

    #[tokio::test]
    async fn failed_executor_finalizes_failed() {
        let (worker, enqueue, executions) = setup(Arc::new(FailingExecutor));
        let id = enqueue
            .enqueue_execution("agent-7", json!({}), JobSource::ManualRun, None, None)
            .unwrap();

        worker.run_once().await.unwrap();

        let row = executions.get(id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.error_log.unwrap().contains("graph blew up"));
        assert!(!worker.deps.cancels.is_registered(id));
    }

    #[tokio::test]
    async fn cooperative_cancel_finalizes_canceled() {
        let (worker, enqueue, executions) = setup(Arc::new(WaitForCancelExecutor));
        let id = enqueue
            .enqueue_execution("agent-7", json!({}), JobSource::ManualRun, None, None)
            .unwrap();

        let cancels = Arc::clone(&worker.deps.cancels);
        let handle = tokio::spawn(async move { worker.run_once().await });

        // Wait for the worker to register the in-flight handle, then signal it.
        while !cancels.is_registered(id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cancels.signal(id));
        handle.await.unwrap().unwrap();

        let row = executions.get(id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Canceled);
        assert!(!cancels.is_registered(id));
    }

    #[tokio::test]
    async fn sweeps_cancel_requested_pending_jobs() {
        let (worker, enqueue, executions) = setup(Arc::new(EchoExecutor));
        let id = enqueue
            .enqueue_execution("agent-7", json!({}), JobSource::Trigger, None, None)
            .unwrap();
        executions.request_cancel(id).unwrap();

        // The sweep finalizes it; nothing is left to lease.
        assert!(!worker.run_once().await.unwrap());
        assert_eq!(
            executions.get(id).unwrap().unwrap().status,
            JobStatus::Canceled
        );
    }
}
