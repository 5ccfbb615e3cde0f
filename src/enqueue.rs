//! Enqueue service — validation, id and priority assignment, row insert.

use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::EnqueueError;
use crate::priority;
use crate::queue::{Execution, InferenceTask, JobSource};
use crate::store::{ExecutionStore, InferenceStore};

/// Accepts new jobs into both queues.
#[derive(Clone)]
pub struct EnqueueService {
    executions: ExecutionStore,
    inference: InferenceStore,
}

impl EnqueueService {
    /// Create a new EnqueueService over the two queue stores.
    pub fn new(executions: ExecutionStore, inference: InferenceStore) -> Self {
        Self {
            executions,
            inference,
        }
    }

    /// Enqueue an agent execution. Returns its id.
    ///
    /// The row insert and the `input_start` node event are one transaction;
    /// on failure the caller sees the error and no row exists.
    pub fn enqueue_execution(
        &self,
        agent_id: &str,
        payload: Value,
        source: JobSource,
        parent_execution_id: Option<Uuid>,
        parent_priority: Option<i64>,
    ) -> Result<Uuid, EnqueueError> {
        if agent_id.trim().is_empty() {
            return Err(EnqueueError::InvalidInput("agent_id is required".into()));
        }

        let exec = Execution::new(
            agent_id,
            priority::base_priority(source),
            priority::assign_priority(source, parent_priority),
            parent_execution_id,
        );
        self.executions.enqueue(&exec, &payload)?;

        info!(
            execution_id = %exec.execution_id,
            agent_id = agent_id,
            priority = exec.priority,
            "Enqueued execution"
        );
        Ok(exec.execution_id)
    }

    /// Enqueue an inference task. Returns its id.
    pub fn enqueue_inference(
        &self,
        model_id: &str,
        messages: Vec<Value>,
        parameters: Value,
        source: JobSource,
        parent_priority: Option<i64>,
    ) -> Result<Uuid, EnqueueError> {
        if model_id.trim().is_empty() {
            return Err(EnqueueError::InvalidInput("model_id is required".into()));
        }

        let task = InferenceTask::new(
            model_id,
            json!({ "messages": messages }),
            parameters,
            priority::base_priority(source),
            priority::assign_priority(source, parent_priority),
        );
        self.inference.enqueue(&task)?;

        info!(
            task_id = %task.task_id,
            model_id = model_id,
            priority = task.priority,
            "Enqueued inference task"
        );
        Ok(task.task_id)
    }
}
