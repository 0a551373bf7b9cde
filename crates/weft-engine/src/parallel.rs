use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_core::config::ExecutorConfig;
use weft_core::types::ErrorCategory;

use crate::capture::EventCaptor;
use crate::resources::ResourceManager;
use crate::retry::TaskFailure;

/// Final outcome of one task: its output or the failure that ended it.
pub type TaskResult = std::result::Result<Value, TaskFailure>;

/// Level-synchronous executor.
///
/// Tasks of a level run concurrently, bounded by
/// `min(max_workers, optimal_worker_count)` and by resource admission.
/// A level finishes before the next starts. One task failing never aborts
/// its siblings.
pub struct ParallelExecutor {
    max_workers: usize,
    resources: Arc<ResourceManager>,
    stop_on_failure: bool,
}

impl ParallelExecutor {
    pub fn new(max_workers: usize, resources: Arc<ResourceManager>, stop_on_failure: bool) -> Self {
        Self {
            max_workers: max_workers.max(1),
            resources,
            stop_on_failure,
        }
    }

    pub fn from_config(
        config: &ExecutorConfig,
        resources: Arc<ResourceManager>,
        stop_on_failure: bool,
    ) -> Self {
        Self::new(config.max_workers, resources, stop_on_failure)
    }

    pub fn worker_bound(&self) -> usize {
        self.max_workers
            .min(self.resources.optimal_worker_count())
            .max(1)
    }

    /// Run `levels` in order. Cancellation is checked between levels;
    /// tasks of levels that never started are reported as cancelled. With
    /// `stop_on_failure`, levels after a failing one are not started and
    /// do not appear in the result.
    pub async fn execute<F, Fut>(
        &self,
        levels: &[Vec<String>],
        run_fn: F,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, TaskResult>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let run_fn = Arc::new(run_fn);
        let mut results = BTreeMap::new();

        for (index, level) in levels.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(level = index, "Execution cancelled between levels");
                for id in levels[index..].iter().flatten() {
                    results.insert(id.clone(), Err(TaskFailure::cancelled(id, 0)));
                }
                break;
            }

            let level_results = self
                .execute_level(level, &BTreeMap::new(), run_fn.clone(), cancel)
                .await;
            let failed = level_results.values().any(|r| r.is_err());
            results.extend(level_results);

            if failed && self.stop_on_failure && index + 1 < levels.len() {
                warn!(level = index, "Level had failures, stopping");
                break;
            }
        }
        results
    }

    /// Run one level to completion. `estimates_mb` overrides the default
    /// admission size per task.
    pub async fn execute_level<F, Fut>(
        &self,
        level: &[String],
        estimates_mb: &BTreeMap<String, u32>,
        run_fn: Arc<F>,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, TaskResult>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let bound = self.worker_bound().min(level.len().max(1));
        let slots = Arc::new(Semaphore::new(bound));
        let level_seq = EventCaptor::emit(
            "level_started",
            None,
            json!({ "tasks": level, "workers": bound }),
            None,
        );
        debug!(tasks = level.len(), workers = bound, "Level started");

        let mut set = JoinSet::new();
        for id in level {
            let id = id.clone();
            let estimate = estimates_mb.get(&id).copied();
            let slots = slots.clone();
            let resources = self.resources.clone();
            let run_fn = run_fn.clone();
            let cancel = cancel.clone();

            set.spawn(EventCaptor::propagate(async move {
                let result = run_task(&id, estimate, slots, resources, run_fn, cancel, level_seq).await;
                (id, result)
            }));
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, result)) => {
                    results.insert(id, result);
                }
                // Tasks catch their own panics; only an abort lands here.
                Err(e) => warn!(error = %e, "Task join failed"),
            }
        }
        results
    }
}

async fn run_task<F, Fut>(
    id: &str,
    estimate: Option<u32>,
    slots: Arc<Semaphore>,
    resources: Arc<ResourceManager>,
    run_fn: Arc<F>,
    cancel: CancellationToken,
    level_seq: Option<u64>,
) -> TaskResult
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    let Ok(_slot) = slots.acquire_owned().await else {
        return Err(TaskFailure::cancelled(id, 0));
    };
    if cancel.is_cancelled() {
        return Err(TaskFailure::cancelled(id, 0));
    }

    let admission = tokio::select! {
        _ = cancel.cancelled() => return Err(TaskFailure::cancelled(id, 0)),
        admission = resources.admit(estimate) => admission,
    };
    let _admission = match admission {
        Ok(a) => a,
        Err(e) => {
            return Err(TaskFailure::new(id, e.to_string(), ErrorCategory::Memory, 0))
        }
    };

    let task_seq = EventCaptor::emit("task_started", Some(id), Value::Null, level_seq);
    let result = match AssertUnwindSafe(run_fn(id.to_string())).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            warn!(node_id = %id, "Task panicked");
            Err(TaskFailure::new(id, "task panicked", ErrorCategory::Unknown, 1))
        }
    };
    EventCaptor::emit(
        "task_finished",
        Some(id),
        json!({ "ok": result.is_ok() }),
        task_seq,
    );
    result
}
