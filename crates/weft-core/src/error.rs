use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // State machine errors
    #[error("Invalid transition for {entity_id}: {from} -> {to} ({reason})")]
    InvalidTransition {
        entity_id: String,
        from: String,
        to: String,
        reason: String,
    },

    // DAG errors
    #[error("Cycle detected in DAG: {0}")]
    CycleDetected(String),

    // Tracking errors (checkpoints, events, file tracking). Never fatal to a run.
    #[error("Tracking degraded: {0}")]
    TrackingDegraded(String),

    // Task errors
    #[error("Task execution failed: {node_id}: {message}")]
    TaskExecution { node_id: String, message: String },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // Resume / branch errors
    #[error("No checkpoint available for run {run_id} before node {node_id}")]
    NoCheckpointAvailable { run_id: String, node_id: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WeftError>;
