//! Event hub — in-process topic fan-out for per-job events.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::queue::now_ts;

/// Broadcast capacity per channel.
const CHANNEL_CAPACITY: usize = 256;

/// Channel name for an execution's events.
pub fn execution_channel(execution_id: Uuid) -> String {
    format!("execution:{execution_id}")
}

/// Channel name for an inference task's events.
pub fn inference_channel(task_id: Uuid) -> String {
    format!("inference:{task_id}")
}

/// Payload of a TOKEN event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub text: String,
}

/// Payload of a DONE event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneData {
    pub result: Value,
    pub tokens_per_second: f64,
}

/// Payload of an ERROR event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// A single event on a job channel. Serializes to the wire schema pushed to
/// WebSocket clients: `{"type": "TOKEN", "task_id": ..., "data": ..., "ts": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    #[serde(rename = "TOKEN")]
    Token { task_id: Uuid, data: TokenData, ts: i64 },
    #[serde(rename = "DONE")]
    Done { task_id: Uuid, data: DoneData, ts: i64 },
    #[serde(rename = "CANCELED")]
    Canceled { task_id: Uuid, ts: i64 },
    #[serde(rename = "ERROR")]
    Error { task_id: Uuid, data: ErrorData, ts: i64 },
    /// A node transition within an execution.
    #[serde(rename = "NODE")]
    Node {
        execution_id: Uuid,
        node_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        intermediate_output: Option<Value>,
        ts: i64,
    },
    /// Keep-alive sent by the WebSocket layer when no events flow.
    #[serde(rename = "PING")]
    Ping,
}

impl JobEvent {
    pub fn token(task_id: Uuid, text: impl Into<String>) -> Self {
        Self::Token {
            task_id,
            data: TokenData { text: text.into() },
            ts: now_ts(),
        }
    }

    pub fn done(task_id: Uuid, result: Value, tokens_per_second: f64) -> Self {
        Self::Done {
            task_id,
            data: DoneData {
                result,
                tokens_per_second,
            },
            ts: now_ts(),
        }
    }

    pub fn canceled(task_id: Uuid) -> Self {
        Self::Canceled {
            task_id,
            ts: now_ts(),
        }
    }

    pub fn error(task_id: Uuid, message: impl Into<String>, trace: Option<String>) -> Self {
        Self::Error {
            task_id,
            data: ErrorData {
                message: message.into(),
                trace,
            },
            ts: now_ts(),
        }
    }

    /// True for the events that end an inference stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Canceled { .. } | Self::Error { .. })
    }
}

/// In-process topic fan-out: channel name → broadcast sender.
///
/// Subscribers hold a `broadcast::Receiver`; dropping it unsubscribes. Events
/// published while a channel has no subscribers are lost — the node event log
/// is the durable history. Per-channel delivery order matches publish order.
#[derive(Default)]
pub struct EventHub {
    channels: Mutex<HashMap<String, broadcast::Sender<JobEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a channel, creating it if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<JobEvent> {
        let mut channels = self.channels.lock().expect("EventHub mutex poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to every current subscriber of a channel.
    ///
    /// Returns the number of subscribers that received it. Channels whose
    /// last subscriber is gone are pruned here so the map stays bounded.
    pub fn publish(&self, channel: &str, event: JobEvent) -> usize {
        let mut channels = self.channels.lock().expect("EventHub mutex poisoned");
        match channels.get(channel) {
            Some(tx) => match tx.send(event) {
                Ok(count) => count,
                Err(_) => {
                    channels.remove(channel);
                    0
                }
            },
            None => 0,
        }
    }

    /// Number of live channels (for tests and introspection).
    pub fn channel_count(&self) -> usize {
        self.channels.lock().expect("EventHub mutex poisoned").len()
    }
}
