//! Startup recovery — return in-flight jobs to PENDING before workers start.

use tracing::info;

use crate::error::StoreError;
use crate::store::{ExecutionStore, InferenceStore};

/// Repair both queues after a crash.
///
/// Must run exactly once at process start, before any worker is allowed to
/// lease. Idempotent: a crash during recovery simply reruns it on the next
/// boot. Node events written by prior partial runs are kept as history.
pub fn recover(
    executions: &ExecutionStore,
    inference: &InferenceStore,
) -> Result<(), StoreError> {
    let recovered_executions = executions.recover()?;
    let recovered_tasks = inference.recover()?;

    if recovered_executions > 0 || recovered_tasks > 0 {
        info!(
            executions = recovered_executions,
            inference = recovered_tasks,
            "Startup recovery returned in-flight jobs to PENDING"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Execution, InferenceTask, JobStatus};
    use crate::store::Database;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn recovery_repairs_both_queues() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let executions = ExecutionStore::new(Arc::clone(&db));
        let inference = InferenceStore::new(db);

        let exec = Execution::new("a", 70, 70, None);
        executions.enqueue(&exec, &json!({})).unwrap();
        executions
            .lease(Uuid::new_v4(), Duration::from_secs(600))
            .unwrap()
            .unwrap();

        let task = InferenceTask::new("m", json!({"messages": []}), json!({}), 90, 90);
        inference.enqueue(&task).unwrap();
        inference
            .lease(Uuid::new_v4(), Duration::from_secs(300))
            .unwrap()
            .unwrap();

        recover(&executions, &inference).unwrap();

        assert_eq!(
            executions.get(exec.execution_id).unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(
            inference.get(task.task_id).unwrap().unwrap().status,
            JobStatus::Pending
        );

        // Double recovery is a no-op.
        recover(&executions, &inference).unwrap();
        assert_eq!(
            executions.get(exec.execution_id).unwrap().unwrap().status,
            JobStatus::Pending
        );
    }
}
