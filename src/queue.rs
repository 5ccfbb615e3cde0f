//! Queue data model — jobs, statuses, sources, node events.

use std::sync::{LazyLock, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::timestamp::context::ContextV7;
use uuid::{Timestamp, Uuid};

/// Current unix timestamp in seconds. All persisted timestamps use this.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Shared counter context so ids created in the same millisecond still sort
/// in creation order. `ContextV7` itself isn't `Sync`, so it's wrapped in a
/// `Mutex` to be held in a process-wide static.
static JOB_ID_CONTEXT: LazyLock<Mutex<ContextV7>> = LazyLock::new(|| Mutex::new(ContextV7::new()));

/// New time-ordered job id (UUIDv7). Equal-priority dispatch falls back to
/// id order, so these must be strictly monotonic within the process.
pub fn new_job_id() -> Uuid {
    let ctx = JOB_ID_CONTEXT.lock().unwrap();
    Uuid::new_v7(Timestamp::now(&*ctx))
}

/// Lifecycle status of a job (execution or inference task).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting in the queue.
    Pending,
    /// Leased by a worker.
    Running,
    /// Cancel was requested; the owning worker has not yet acted.
    CancelRequested,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during the run.
    Canceled,
}

impl JobStatus {
    /// Check if this is a terminal state. Terminal rows are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// String form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::CancelRequested => "CANCEL_REQUESTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    /// Parse a status string from the database.
    pub fn parse(s: &str) -> JobStatus {
        match s {
            "RUNNING" => Self::Running,
            "CANCEL_REQUESTED" => Self::CancelRequested,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "CANCELED" => Self::Canceled,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a job came from. Determines its base priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobSource {
    /// Interactive chat request.
    Chat,
    /// User pressed "run" on an agent.
    ManualRun,
    /// Spawned by another agent mid-graph.
    InternalNode,
    /// Scheduled trigger or webhook.
    Trigger,
}

/// An agent run in the `executions` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub agent_id: String,
    pub status: JobStatus,
    pub parent_execution_id: Option<Uuid>,
    pub final_result: Option<Value>,
    pub base_priority: i64,
    pub priority: i64,
    pub enqueue_ts: i64,
    pub lease_id: Option<Uuid>,
    pub lease_expires_at: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_log: Option<String>,
}

impl Execution {
    /// Build a fresh PENDING execution ready to be enqueued.
    ///
    /// Job ids are UUIDv7 so that equal-priority dispatch is FIFO even when
    /// two jobs share an `enqueue_ts` second.
    pub fn new(
        agent_id: impl Into<String>,
        base_priority: i64,
        priority: i64,
        parent_execution_id: Option<Uuid>,
    ) -> Self {
        let now = now_ts();
        Self {
            execution_id: new_job_id(),
            agent_id: agent_id.into(),
            status: JobStatus::Pending,
            parent_execution_id,
            final_result: None,
            base_priority,
            priority,
            enqueue_ts: now,
            lease_id: None,
            lease_expires_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_log: None,
        }
    }
}

/// A model request in the `inference_queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceTask {
    pub task_id: Uuid,
    pub model_id: String,
    pub status: JobStatus,
    /// Opaque request blob; the engine only round-trips it.
    pub prompt: Value,
    pub parameters: Value,
    pub result: Option<Value>,
    pub base_priority: i64,
    pub priority: i64,
    pub enqueue_ts: i64,
    pub lease_id: Option<Uuid>,
    pub lease_expires_at: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub tokens_per_second: Option<f64>,
    pub error_log: Option<String>,
}

impl InferenceTask {
    /// Build a fresh PENDING inference task ready to be enqueued.
    pub fn new(
        model_id: impl Into<String>,
        prompt: Value,
        parameters: Value,
        base_priority: i64,
        priority: i64,
    ) -> Self {
        let now = now_ts();
        Self {
            task_id: new_job_id(),
            model_id: model_id.into(),
            status: JobStatus::Pending,
            prompt,
            parameters,
            result: None,
            base_priority,
            priority,
            enqueue_ts: now,
            lease_id: None,
            lease_expires_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            tokens_per_second: None,
            error_log: None,
        }
    }
}

/// One row of the append-only node event log for an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub event_id: i64,
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: String,
    pub intermediate_output: Option<Value>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_log: Option<String>,
}

/// A node transition reported by an executor, before it has an `event_id`.
#[derive(Debug, Clone)]
pub struct NodeTransition {
    pub node_id: String,
    pub status: String,
    pub intermediate_output: Option<Value>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_log: Option<String>,
}

impl NodeTransition {
    /// A completed node transition carrying an output payload.
    pub fn completed(node_id: impl Into<String>, output: Option<Value>) -> Self {
        let now = now_ts();
        Self {
            node_id: node_id.into(),
            status: "COMPLETED".to_string(),
            intermediate_output: output,
            started_at: Some(now),
            completed_at: Some(now),
            error_log: None,
        }
    }

    /// A node that just started.
    pub fn started(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: "RUNNING".to_string(),
            intermediate_output: None,
            started_at: Some(now_ts()),
            completed_at: None,
            error_log: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::CancelRequested.is_terminal());
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::CancelRequested,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn status_serde_matches_db_form() {
        let json = serde_json::to_string(&JobStatus::CancelRequested).unwrap();
        assert_eq!(json, "\"CANCEL_REQUESTED\"");
        let parsed: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, JobStatus::CancelRequested);
    }

    #[test]
    fn execution_ids_are_time_ordered() {
        let a = Execution::new("agent", 30, 30, None);
        let b = Execution::new("agent", 30, 30, None);
        assert!(a.execution_id < b.execution_id);
    }

    #[test]
    fn new_execution_is_pending_without_lease() {
        let exec = Execution::new("agent-1", 70, 70, None);
        assert_eq!(exec.status, JobStatus::Pending);
        assert!(exec.lease_id.is_none());
        assert!(exec.started_at.is_none());
        assert_eq!(exec.created_at, exec.enqueue_ts);
    }
}
