//! NodeEventStore — append-only event log for execution sub-steps.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::{NodeEvent, NodeTransition};

use super::db::Database;
use super::executions::{parse_json, parse_uuid};

/// Append-only node event log backed by SQLite.
///
/// Rows are never updated or deleted; `event_id` (autoincrement) gives the
/// total order of events within an execution.
#[derive(Clone)]
pub struct NodeEventStore {
    db: Arc<Database>,
}

impl NodeEventStore {
    /// Create a new NodeEventStore wrapping the given database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append one node transition. Returns the assigned `event_id`.
    pub fn append(
        &self,
        execution_id: Uuid,
        transition: &NodeTransition,
    ) -> Result<i64, StoreError> {
        let output_json = transition
            .intermediate_output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO node_events (execution_id, node_id, status,
                 intermediate_output, started_at, completed_at, error_log)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                execution_id.to_string(),
                transition.node_id,
                transition.status,
                output_json,
                transition.started_at,
                transition.completed_at,
                transition.error_log,
            ],
        )?;
        let event_id = conn.last_insert_rowid();
        debug!(execution_id = %execution_id, node_id = %transition.node_id, event_id, "Node event appended");
        Ok(event_id)
    }

    /// All events for an execution, ordered by `event_id`.
    pub fn list(&self, execution_id: Uuid) -> Result<Vec<NodeEvent>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT event_id, execution_id, node_id, status, intermediate_output,
                    started_at, completed_at, error_log
             FROM node_events
             WHERE execution_id = ?1
             ORDER BY event_id ASC",
        )?;
        let events = stmt
            .query_map(rusqlite::params![execution_id.to_string()], |row| {
                let exec_id: String = row.get(1)?;
                let output: Option<String> = row.get(4)?;
                Ok(NodeEvent {
                    event_id: row.get(0)?,
                    execution_id: parse_uuid(&exec_id),
                    node_id: row.get(2)?,
                    status: row.get(3)?,
                    intermediate_output: parse_json(output),
                    started_at: row.get(5)?,
                    completed_at: row.get(6)?,
                    error_log: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> NodeEventStore {
        let db = Arc::new(Database::open_in_memory().unwrap());
        NodeEventStore::new(db)
    }

    #[test]
    fn append_assigns_increasing_event_ids() {
        let store = test_store();
        let execution_id = Uuid::now_v7();

        let first = store
            .append(execution_id, &NodeTransition::started("summarize"))
            .unwrap();
        let second = store
            .append(
                execution_id,
                &NodeTransition::completed("summarize", Some(json!({"summary": "ok"}))),
            )
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn list_orders_by_event_id() {
        let store = test_store();
        let execution_id = Uuid::now_v7();
        store
            .append(execution_id, &NodeTransition::started("a"))
            .unwrap();
        store
            .append(execution_id, &NodeTransition::completed("a", None))
            .unwrap();
        store
            .append(execution_id, &NodeTransition::started("b"))
            .unwrap();

        let events = store.list(execution_id).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].event_id < w[1].event_id));
        assert_eq!(events[0].node_id, "a");
        assert_eq!(events[2].node_id, "b");
    }

    #[test]
    fn list_is_scoped_to_execution() {
        let store = test_store();
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        store.append(first, &NodeTransition::started("a")).unwrap();
        store.append(second, &NodeTransition::started("b")).unwrap();

        let events = store.list(first).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].node_id, "a");
    }
}
