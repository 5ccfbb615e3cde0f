//! Worker layer — the two queue consumers and the cancellation registry.

pub mod agent;
pub mod cancel;
pub mod inference;

pub use agent::{AgentWorker, AgentWorkerDeps};
pub use cancel::CancelRegistry;
pub use inference::{InferenceWorker, InferenceWorkerDeps};
