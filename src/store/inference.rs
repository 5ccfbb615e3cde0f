//! InferenceStore — queue operations for model inference tasks.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::OptionalExtension;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::{now_ts, InferenceTask, JobStatus};

use super::db::Database;
use super::executions::{parse_json, parse_uuid};

const TASK_COLUMNS: &str = "task_id, model_id, status, prompt, parameters, result, \
     base_priority, priority, enqueue_ts, lease_id, lease_expires_at, \
     created_at, started_at, completed_at, tokens_per_second, error_log";

/// Persistent inference queue backed by SQLite.
#[derive(Clone)]
pub struct InferenceStore {
    db: Arc<Database>,
}

impl InferenceStore {
    /// Create a new InferenceStore wrapping the given database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new inference task row.
    pub fn enqueue(&self, task: &InferenceTask) -> Result<(), StoreError> {
        let prompt_json = serde_json::to_string(&task.prompt)?;
        let parameters_json = serde_json::to_string(&task.parameters)?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO inference_queue (task_id, model_id, status, prompt, parameters,
                 base_priority, priority, enqueue_ts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                task.task_id.to_string(),
                task.model_id,
                task.status.as_str(),
                prompt_json,
                parameters_json,
                task.base_priority,
                task.priority,
                task.enqueue_ts,
                task.created_at,
            ],
        )?;
        debug!(task_id = %task.task_id, priority = task.priority, "Inference task enqueued");
        Ok(())
    }

    /// Get a task by ID.
    pub fn get(&self, task_id: Uuid) -> Result<Option<InferenceTask>, StoreError> {
        let conn = self.db.conn();
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM inference_queue WHERE task_id = ?1"),
                rusqlite::params![task_id.to_string()],
                row_to_task,
            )
            .optional()?;
        Ok(row)
    }

    /// Atomically lease the best PENDING task, if any. Same single-statement
    /// contract as `ExecutionStore::lease`.
    pub fn lease(&self, lease_id: Uuid, ttl: Duration) -> Result<Option<InferenceTask>, StoreError> {
        let now = now_ts();
        let conn = self.db.conn();
        let row = conn
            .query_row(
                &format!(
                    "UPDATE inference_queue
                     SET status = 'RUNNING',
                         lease_id = ?1,
                         lease_expires_at = ?2,
                         started_at = COALESCE(started_at, ?3)
                     WHERE task_id = (
                         SELECT task_id FROM inference_queue
                         WHERE status = 'PENDING'
                         ORDER BY priority DESC, enqueue_ts ASC, task_id ASC
                         LIMIT 1
                     )
                     RETURNING {TASK_COLUMNS}"
                ),
                rusqlite::params![
                    lease_id.to_string(),
                    now + ttl.as_secs() as i64,
                    now
                ],
                row_to_task,
            )
            .optional()?;
        Ok(row)
    }

    /// Write the terminal status for a task and release its lease.
    pub fn finalize(
        &self,
        task_id: Uuid,
        status: JobStatus,
        result: Option<&Value>,
        tokens_per_second: Option<f64>,
        error_log: Option<&str>,
    ) -> Result<(), StoreError> {
        let result_json = result.map(serde_json::to_string).transpose()?;
        let conn = self.db.conn();
        conn.execute(
            "UPDATE inference_queue
             SET status = ?1, completed_at = ?2, result = ?3, tokens_per_second = ?4,
                 error_log = ?5, lease_id = NULL, lease_expires_at = NULL
             WHERE task_id = ?6",
            rusqlite::params![
                status.as_str(),
                now_ts(),
                result_json,
                tokens_per_second,
                error_log,
                task_id.to_string()
            ],
        )?;
        info!(task_id = %task_id, status = %status, "Inference task finalized");
        Ok(())
    }

    /// Flip a non-terminal task to CANCEL_REQUESTED. Returns false when the
    /// row is terminal or missing.
    pub fn request_cancel(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.db.conn();
        let count = conn.execute(
            "UPDATE inference_queue SET status = 'CANCEL_REQUESTED'
             WHERE task_id = ?1 AND status IN ('PENDING', 'RUNNING')",
            rusqlite::params![task_id.to_string()],
        )?;
        Ok(count > 0)
    }

    /// Finalize CANCEL_REQUESTED rows no worker holds a lease on. Returns the
    /// affected ids so callers can publish CANCELED events for them.
    pub fn sweep_cancel_requested(&self) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "UPDATE inference_queue
             SET status = 'CANCELED', completed_at = ?1
             WHERE status = 'CANCEL_REQUESTED' AND lease_id IS NULL
             RETURNING task_id",
        )?;
        let ids = stmt
            .query_map(rusqlite::params![now_ts()], |row| {
                let id: String = row.get(0)?;
                Ok(parse_uuid(&id))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// One aging tick over the inference queue. See `ExecutionStore::age_pending`.
    pub fn age_pending(&self, threshold_ts: i64, boost: i64, cap: i64) -> Result<usize, StoreError> {
        let conn = self.db.conn();
        let count = conn.execute(
            "UPDATE inference_queue
             SET priority = MIN(priority + ?1, ?2)
             WHERE status = 'PENDING' AND enqueue_ts <= ?3 AND priority < ?2",
            rusqlite::params![boost, cap, threshold_ts],
        )?;
        Ok(count)
    }

    /// Return all in-flight tasks to PENDING and clear their leases.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let conn = self.db.conn();
        let count = conn.execute(
            "UPDATE inference_queue
             SET status = 'PENDING', lease_id = NULL, lease_expires_at = NULL
             WHERE status IN ('RUNNING', 'CANCEL_REQUESTED')",
            [],
        )?;
        Ok(count)
    }
}

/// Map a SQLite row (in `TASK_COLUMNS` order) to an InferenceTask.
fn row_to_task(row: &rusqlite::Row<'_>) -> Result<InferenceTask, rusqlite::Error> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    let prompt: Option<String> = row.get(3)?;
    let parameters: Option<String> = row.get(4)?;
    let result: Option<String> = row.get(5)?;
    let lease_id: Option<String> = row.get(9)?;

    Ok(InferenceTask {
        task_id: parse_uuid(&id),
        model_id: row.get(1)?,
        status: JobStatus::parse(&status),
        prompt: parse_json(prompt).unwrap_or(Value::Null),
        parameters: parse_json(parameters).unwrap_or(Value::Null),
        result: parse_json(result),
        base_priority: row.get(6)?,
        priority: row.get(7)?,
        enqueue_ts: row.get(8)?,
        lease_id: lease_id.map(|l| parse_uuid(&l)),
        lease_expires_at: row.get(10)?,
        created_at: row.get(11)?,
        started_at: row.get(12)?,
        completed_at: row.get(13)?,
        tokens_per_second: row.get(14)?,
        error_log: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> InferenceStore {
        let db = Arc::new(Database::open_in_memory().unwrap());
        InferenceStore::new(db)
    }

    fn make_task(priority: i64) -> InferenceTask {
        InferenceTask::new(
            "llama-3",
            json!({"messages": [{"role": "user", "content": "hi"}]}),
            json!({"temperature": 0.7}),
            priority,
            priority,
        )
    }

    fn ttl() -> Duration {
        Duration::from_secs(300)
    }

    #[test]
    fn enqueue_and_get_roundtrips_blobs() {
        let store = test_store();
        let task = make_task(90);
        store.enqueue(&task).unwrap();

        let fetched = store.get(task.task_id).unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.prompt["messages"][0]["content"], "hi");
        assert_eq!(fetched.parameters["temperature"], 0.7);
        assert!(fetched.result.is_none());
        assert!(fetched.tokens_per_second.is_none());
    }

    #[test]
    fn lease_marks_running_once() {
        let store = test_store();
        let task = make_task(90);
        store.enqueue(&task).unwrap();

        let worker_a = Uuid::new_v4();
        let leased = store.lease(worker_a, ttl()).unwrap().unwrap();
        assert_eq!(leased.task_id, task.task_id);
        assert_eq!(leased.lease_id, Some(worker_a));

        assert!(store.lease(Uuid::new_v4(), ttl()).unwrap().is_none());
    }

    #[test]
    fn finalize_completed_stores_result_and_throughput() {
        let store = test_store();
        let task = make_task(90);
        store.enqueue(&task).unwrap();
        store.lease(Uuid::new_v4(), ttl()).unwrap().unwrap();

        store
            .finalize(
                task.task_id,
                JobStatus::Completed,
                Some(&json!({"text": "hello world"})),
                Some(12.5),
                None,
            )
            .unwrap();

        let row = store.get(task.task_id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.result, Some(json!({"text": "hello world"})));
        assert_eq!(row.tokens_per_second, Some(12.5));
        assert!(row.lease_id.is_none());
    }

    #[test]
    fn cancel_then_sweep_for_pending_task() {
        let store = test_store();
        let task = make_task(50);
        store.enqueue(&task).unwrap();

        assert!(store.request_cancel(task.task_id).unwrap());
        let swept = store.sweep_cancel_requested().unwrap();
        assert_eq!(swept, vec![task.task_id]);
        assert_eq!(
            store.get(task.task_id).unwrap().unwrap().status,
            JobStatus::Canceled
        );
    }

    #[test]
    fn aging_and_recovery_mirror_executions() {
        let store = test_store();
        let mut task = make_task(30);
        task.enqueue_ts -= 400;
        store.enqueue(&task).unwrap();

        store.age_pending(now_ts() - 300, 10, 65).unwrap();
        assert_eq!(store.get(task.task_id).unwrap().unwrap().priority, 40);

        store.lease(Uuid::new_v4(), ttl()).unwrap().unwrap();
        assert_eq!(store.recover().unwrap(), 1);
        let row = store.get(task.task_id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.lease_id.is_none());
    }
}
