//! Error types for the execution engine.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Enqueue error: {0}")]
    Enqueue(#[from] EnqueueError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),
}

/// Durable store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },
}

/// Enqueue validation and insert errors.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised by an external agent executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The executor observed the cancellation token at a cooperative point.
    #[error("Execution cancelled")]
    Canceled,

    #[error("Agent config not found: {agent_id}")]
    ConfigNotFound { agent_id: String },

    #[error("Executor failed: {message}")]
    Failed { message: String },
}

impl From<StoreError> for ExecutorError {
    fn from(e: StoreError) -> Self {
        Self::Failed {
            message: e.to_string(),
        }
    }
}

/// Errors raised by an external model runner.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The runner observed the cancellation token between tokens.
    #[error("Inference cancelled")]
    Canceled,

    #[error("Model {model_id} could not be loaded")]
    ModelUnavailable { model_id: String },

    #[error("Runner failed: {message}")]
    Failed { message: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
