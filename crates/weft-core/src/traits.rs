use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::event::WorkflowEvent;
use crate::types::*;

/// Observer of workflow events (WebSocket relay, logging, metrics).
pub trait EventSink: Send + Sync + 'static {
    /// Sink name used in diagnostics.
    fn name(&self) -> &str {
        "sink"
    }

    fn on_event(&self, event: &WorkflowEvent) -> Result<()>;
}

/// Everything a task body needs to execute one node attempt.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub run_id: RunId,
    pub node: Node,
    /// 1-based attempt within the current execution.
    pub attempt: u32,
    /// Isolated directory this attempt writes into.
    pub work_dir: PathBuf,
    /// Canonical run directory with everything merged so far (read-only).
    pub run_dir: PathBuf,
    /// Snapshot of the run context when the level started.
    pub context: Arc<ExecutionContext>,
    /// Rendered retry guidance when this is a retry.
    pub retry_guidance: Option<String>,
}

/// Successful task result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub value: Value,
}

impl TaskOutput {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

/// Opaque task-body failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The caller-supplied task execution callback (agent / LLM invocation).
pub trait TaskRunner: Send + Sync + 'static {
    fn run(&self, invocation: TaskInvocation)
        -> BoxFuture<'_, std::result::Result<TaskOutput, TaskError>>;
}

/// Structured storage backend for runs, DAGs, audit history and checkpoints.
pub trait RunStore: Send + Sync + 'static {
    // Runs
    fn insert_run(&self, run: &Run) -> Result<()>;
    fn get_run(&self, run_id: &RunId) -> Result<Run>;
    fn list_runs(&self, limit: usize) -> Result<Vec<Run>>;
    fn set_run_flags(&self, run_id: &RunId, has_plan: bool, approval_granted: bool) -> Result<()>;
    /// Delete a run and everything it owns.
    fn delete_run(&self, run_id: &RunId) -> Result<()>;

    // State transitions (state update + audit record in one transaction)
    fn apply_run_transition(&self, expected: RunState, transition: &StateTransition)
        -> Result<()>;
    fn apply_node_transition(
        &self,
        expected: NodeStatus,
        transition: &StateTransition,
    ) -> Result<()>;
    fn transitions(&self, entity: &EntityRef) -> Result<Vec<StateTransition>>;

    // DAG
    fn save_dag(&self, run_id: &RunId, nodes: &[Node], edges: &[Edge]) -> Result<()>;
    fn load_nodes(&self, run_id: &RunId) -> Result<Vec<Node>>;
    fn load_edges(&self, run_id: &RunId) -> Result<Vec<Edge>>;

    // Checkpoints (write-once)
    /// Returns `false` when a checkpoint already exists for the key.
    fn insert_checkpoint(&self, record: &CheckpointRecord) -> Result<bool>;
    fn get_checkpoint(&self, run_id: &RunId, step_number: Option<u32>)
        -> Result<Option<CheckpointRecord>>;
    fn list_checkpoints(&self, run_id: &RunId) -> Result<Vec<CheckpointRecord>>;
    /// Retire live checkpoints at or after `from_step`; returns their ids.
    /// Retired rows are kept but no longer read, and free their step for a
    /// new write.
    fn supersede_checkpoints(&self, run_id: &RunId, from_step: u32) -> Result<Vec<String>>;
    /// Retention: delete the live checkpoints at `steps`; returns removed ids.
    fn prune_checkpoints(&self, run_id: &RunId, steps: &[u32]) -> Result<Vec<String>>;

    // Retry attempts (append-only, monotonic per node)
    fn record_retry_attempt(&self, attempt: &RetryAttempt) -> Result<()>;
    fn retry_attempts(&self, run_id: &RunId, node_id: &str) -> Result<Vec<RetryAttempt>>;

    // Branches
    fn insert_branch(&self, branch: &Branch) -> Result<()>;
    fn get_branch(&self, run_id: &RunId) -> Result<Option<Branch>>;
    fn list_branches(&self, parent_run_id: &RunId) -> Result<Vec<Branch>>;

    // Execution event arena
    fn append_event(&self, record: &ExecutionEventRecord) -> Result<()>;
    fn events(&self, run_id: &RunId) -> Result<Vec<ExecutionEventRecord>>;
}
