//! Shared fixtures for weft tests: a scripted [`TaskRunner`], temporary
//! workspaces and small DAG builders.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use weft_core::config::WeftConfig;
use weft_core::event::EventBus;
use weft_core::traits::{RunStore, TaskError, TaskInvocation, TaskOutput, TaskRunner};
use weft_core::types::{Edge, Node, NodeStatus, NodeType, Run};
use weft_store::SqliteStore;

/// One recorded call to a [`ScriptedRunner`].
#[derive(Debug, Clone)]
pub struct Call {
    pub node_id: String,
    pub attempt: u32,
    pub work_dir: PathBuf,
    pub retry_guidance: Option<String>,
}

/// Task runner driven by a per-node script.
///
/// Unscripted nodes succeed with `{"node": id, "attempt": n}`.
#[derive(Default)]
pub struct ScriptedRunner {
    outputs: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, VecDeque<String>>>,
    always_fail: Mutex<HashMap<String, String>>,
    files: Mutex<HashMap<String, Vec<(String, String)>>>,
    delays: Mutex<HashMap<String, Duration>>,
    default_delay: Option<Duration>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    pub fn output(self, node_id: &str, value: Value) -> Self {
        self.outputs.lock().unwrap().insert(node_id.into(), value);
        self
    }

    /// Fail the next `times` attempts of `node_id` with `error`.
    pub fn fail_times(self, node_id: &str, times: usize, error: &str) -> Self {
        self.failures
            .lock()
            .unwrap()
            .entry(node_id.into())
            .or_default()
            .extend(std::iter::repeat(error.to_string()).take(times));
        self
    }

    pub fn fail_always(self, node_id: &str, error: &str) -> Self {
        self.always_fail
            .lock()
            .unwrap()
            .insert(node_id.into(), error.into());
        self
    }

    /// Write `body` to `rel_path` inside the attempt's work dir.
    pub fn file(self, node_id: &str, rel_path: &str, body: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .entry(node_id.into())
            .or_default()
            .push((rel_path.into(), body.into()));
        self
    }

    pub fn delay(self, node_id: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(node_id.into(), delay);
        self
    }

    /// Change a node's scripted output between executions.
    pub fn set_output(&self, node_id: &str, value: Value) {
        self.outputs.lock().unwrap().insert(node_id.into(), value);
    }

    /// Clear a permanent failure, e.g. before resuming a run.
    pub fn heal(&self, node_id: &str) {
        self.always_fail.lock().unwrap().remove(node_id);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, node_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.node_id == node_id)
            .count()
    }

    pub fn called_nodes(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.node_id.clone())
            .collect()
    }
}

impl TaskRunner for ScriptedRunner {
    fn run(&self, invocation: TaskInvocation) -> BoxFuture<'_, Result<TaskOutput, TaskError>> {
        Box::pin(async move {
            let id = invocation.node.id.clone();
            self.calls.lock().unwrap().push(Call {
                node_id: id.clone(),
                attempt: invocation.attempt,
                work_dir: invocation.work_dir.clone(),
                retry_guidance: invocation.retry_guidance.clone(),
            });

            let delay = self
                .delays
                .lock()
                .unwrap()
                .get(&id)
                .copied()
                .or(self.default_delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if let Some(error) = self.always_fail.lock().unwrap().get(&id).cloned() {
                return Err(TaskError::new(error));
            }
            let scripted = self
                .failures
                .lock()
                .unwrap()
                .get_mut(&id)
                .and_then(|q| q.pop_front());
            if let Some(error) = scripted {
                return Err(TaskError::new(error));
            }

            let files = self.files.lock().unwrap().get(&id).cloned().unwrap_or_default();
            for (rel, body) in files {
                let path = invocation.work_dir.join(rel);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| TaskError::new(e.to_string()))?;
                }
                std::fs::write(&path, body).map_err(|e| TaskError::new(e.to_string()))?;
            }

            let value = self
                .outputs
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .unwrap_or_else(|| json!({ "node": id, "attempt": invocation.attempt }));
            Ok(TaskOutput::new(value))
        })
    }
}

/// Temporary workspace with a store, bus and config rooted in it.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub store: Arc<SqliteStore>,
    pub event_bus: Arc<EventBus>,
    pub config: WeftConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config("")
    }

    /// Extra TOML is appended after the `[engine]` section.
    pub fn with_config(extra_toml: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), extra_toml);
        let store = Arc::new(SqliteStore::open(&config.database_path()).unwrap());
        Self {
            dir,
            store,
            event_bus: Arc::new(EventBus::default()),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

pub fn test_config(workspace: &Path, extra_toml: &str) -> WeftConfig {
    let toml = format!(
        "[engine]\nworkspace = {:?}\n\n{}",
        workspace.display().to_string(),
        extra_toml
    );
    toml.parse().unwrap()
}

/// `step_1 -> ... -> step_n`, the first `completed` nodes completed.
pub fn chain(n: u32, completed: u32) -> (Vec<Node>, Vec<Edge>) {
    let nodes = (1..=n)
        .map(|i| {
            let mut node = Node::new(format!("step_{}", i), NodeType::Step);
            node.step_number = i;
            if i <= completed {
                node.status = NodeStatus::Completed;
            }
            node
        })
        .collect();
    let edges = (1..n)
        .map(|i| Edge::new(format!("step_{}", i), format!("step_{}", i + 1)))
        .collect();
    (nodes, edges)
}

/// Insert a run owning a `chain(n, completed)` DAG. The work dir is
/// created under `root`.
pub fn insert_chain_run(store: &dyn RunStore, root: &Path, n: u32, completed: u32) -> Run {
    let mut run = Run::new("one_shot", "chain task", PathBuf::new());
    run.work_dir = root.join("runs").join(run.id.as_str());
    std::fs::create_dir_all(&run.work_dir).unwrap();
    store.insert_run(&run).unwrap();
    let (nodes, edges) = chain(n, completed);
    store.save_dag(&run.id, &nodes, &edges).unwrap();
    run
}
