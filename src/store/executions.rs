//! ExecutionStore — queue operations for agent executions.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::OptionalExtension;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::{now_ts, Execution, JobStatus};

use super::db::Database;

const EXECUTION_COLUMNS: &str = "execution_id, agent_id, status, parent_execution_id, \
     final_result, base_priority, priority, enqueue_ts, lease_id, lease_expires_at, \
     created_at, started_at, completed_at, error_log";

/// Persistent execution queue backed by SQLite.
#[derive(Clone)]
pub struct ExecutionStore {
    db: Arc<Database>,
}

impl ExecutionStore {
    /// Create a new ExecutionStore wrapping the given database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new execution row together with its `input_start` node event.
    ///
    /// Both writes happen in one transaction: either the job exists with its
    /// input payload on the event log, or neither does.
    pub fn enqueue(&self, exec: &Execution, input_payload: &Value) -> Result<(), StoreError> {
        let payload_json = serde_json::to_string(input_payload)?;
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO executions (execution_id, agent_id, status, parent_execution_id,
                 base_priority, priority, enqueue_ts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                exec.execution_id.to_string(),
                exec.agent_id,
                exec.status.as_str(),
                exec.parent_execution_id.map(|id| id.to_string()),
                exec.base_priority,
                exec.priority,
                exec.enqueue_ts,
                exec.created_at,
            ],
        )?;

        // The executor reads its input from the event log.
        tx.execute(
            "INSERT INTO node_events (execution_id, node_id, status,
                 intermediate_output, started_at, completed_at)
             VALUES (?1, 'input_start', 'COMPLETED', ?2, ?3, ?3)",
            rusqlite::params![
                exec.execution_id.to_string(),
                payload_json,
                exec.enqueue_ts
            ],
        )?;

        tx.commit()?;
        debug!(execution_id = %exec.execution_id, priority = exec.priority, "Execution enqueued");
        Ok(())
    }

    /// Get an execution by ID.
    pub fn get(&self, execution_id: Uuid) -> Result<Option<Execution>, StoreError> {
        let conn = self.db.conn();
        let row = conn
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = ?1"),
                rusqlite::params![execution_id.to_string()],
                row_to_execution,
            )
            .optional()?;
        Ok(row)
    }

    /// Atomically lease the best PENDING execution, if any.
    ///
    /// A single conditional UPDATE picks the highest-priority row (FIFO
    /// tie-break on `enqueue_ts`, then on the time-ordered id), marks it
    /// RUNNING, stamps the lease, and returns it. Two workers racing this
    /// statement can never receive the same row.
    pub fn lease(&self, lease_id: Uuid, ttl: Duration) -> Result<Option<Execution>, StoreError> {
        let now = now_ts();
        let conn = self.db.conn();
        let row = conn
            .query_row(
                &format!(
                    "UPDATE executions
                     SET status = 'RUNNING',
                         lease_id = ?1,
                         lease_expires_at = ?2,
                         started_at = COALESCE(started_at, ?3)
                     WHERE execution_id = (
                         SELECT execution_id FROM executions
                         WHERE status = 'PENDING'
                         ORDER BY priority DESC, enqueue_ts ASC, execution_id ASC
                         LIMIT 1
                     )
                     RETURNING {EXECUTION_COLUMNS}"
                ),
                rusqlite::params![
                    lease_id.to_string(),
                    now + ttl.as_secs() as i64,
                    now
                ],
                row_to_execution,
            )
            .optional()?;
        Ok(row)
    }

    /// Write the terminal status for an execution and release its lease.
    ///
    /// Called exactly once per run by the owning worker.
    pub fn finalize(
        &self,
        execution_id: Uuid,
        status: JobStatus,
        final_result: Option<&Value>,
        error_log: Option<&str>,
    ) -> Result<(), StoreError> {
        let result_json = final_result.map(serde_json::to_string).transpose()?;
        let conn = self.db.conn();
        conn.execute(
            "UPDATE executions
             SET status = ?1, completed_at = ?2, final_result = ?3, error_log = ?4,
                 lease_id = NULL, lease_expires_at = NULL
             WHERE execution_id = ?5",
            rusqlite::params![
                status.as_str(),
                now_ts(),
                result_json,
                error_log,
                execution_id.to_string()
            ],
        )?;
        info!(execution_id = %execution_id, status = %status, "Execution finalized");
        Ok(())
    }

    /// Flip a non-terminal execution to CANCEL_REQUESTED.
    ///
    /// Returns false when the row is already terminal (cancel is then a
    /// no-op) or does not exist.
    pub fn request_cancel(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.db.conn();
        let count = conn.execute(
            "UPDATE executions SET status = 'CANCEL_REQUESTED'
             WHERE execution_id = ?1 AND status IN ('PENDING', 'RUNNING')",
            rusqlite::params![execution_id.to_string()],
        )?;
        Ok(count > 0)
    }

    /// Finalize CANCEL_REQUESTED rows that no worker holds a lease on.
    ///
    /// A job cancelled while still PENDING is never leased, so workers sweep
    /// it to CANCELED here. Returns the affected ids.
    pub fn sweep_cancel_requested(&self) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "UPDATE executions
             SET status = 'CANCELED', completed_at = ?1
             WHERE status = 'CANCEL_REQUESTED' AND lease_id IS NULL
             RETURNING execution_id",
        )?;
        let ids = stmt
            .query_map(rusqlite::params![now_ts()], |row| {
                let id: String = row.get(0)?;
                Ok(parse_uuid(&id))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// One aging tick: boost long-waiting PENDING rows, bounded by `cap`.
    ///
    /// The `priority < cap` guard means rows already at or above the cap are
    /// left alone, so aging can never lower a priority.
    pub fn age_pending(&self, threshold_ts: i64, boost: i64, cap: i64) -> Result<usize, StoreError> {
        let conn = self.db.conn();
        let count = conn.execute(
            "UPDATE executions
             SET priority = MIN(priority + ?1, ?2)
             WHERE status = 'PENDING' AND enqueue_ts <= ?3 AND priority < ?2",
            rusqlite::params![boost, cap, threshold_ts],
        )?;
        Ok(count)
    }

    /// Return all in-flight executions to PENDING and clear their leases.
    ///
    /// Runs once at boot, before any worker leases. Returns the number of
    /// repaired rows.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let conn = self.db.conn();
        let count = conn.execute(
            "UPDATE executions
             SET status = 'PENDING', lease_id = NULL, lease_expires_at = NULL
             WHERE status IN ('RUNNING', 'CANCEL_REQUESTED')",
            [],
        )?;
        Ok(count)
    }
}

/// Parse a stored UUID, falling back to nil on corruption.
pub(crate) fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

/// Parse an optional stored JSON text column.
pub(crate) fn parse_json(s: Option<String>) -> Option<Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

/// Map a SQLite row (in `EXECUTION_COLUMNS` order) to an Execution.
fn row_to_execution(row: &rusqlite::Row<'_>) -> Result<Execution, rusqlite::Error> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    let parent: Option<String> = row.get(3)?;
    let final_result: Option<String> = row.get(4)?;
    let lease_id: Option<String> = row.get(8)?;

    Ok(Execution {
        execution_id: parse_uuid(&id),
        agent_id: row.get(1)?,
        status: JobStatus::parse(&status),
        parent_execution_id: parent.map(|p| parse_uuid(&p)),
        final_result: parse_json(final_result),
        base_priority: row.get(5)?,
        priority: row.get(6)?,
        enqueue_ts: row.get(7)?,
        lease_id: lease_id.map(|l| parse_uuid(&l)),
        lease_expires_at: row.get(9)?,
        created_at: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
        error_log: row.get(13)?,
    })
}
