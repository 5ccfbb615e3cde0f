//! Agent Core — durable two-queue execution engine for a local AI agent platform.

pub mod api;
pub mod config;
pub mod enqueue;
pub mod error;
pub mod events;
pub mod executor;
pub mod priority;
pub mod queue;
pub mod recovery;
pub mod store;
pub mod workers;
