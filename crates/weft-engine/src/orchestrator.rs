//! Drives runs from creation to a final state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use weft_core::config::WeftConfig;
use weft_core::context::{ExecutionContext, StepSpec};
use weft_core::error::{Result, WeftError};
use weft_core::event::{EventBus, WorkflowEvent};
use weft_core::traits::{RunStore, TaskInvocation, TaskRunner};
use weft_core::types::{
    CheckpointKind, EntityRef, ErrorCategory, Lifecycle, Node, NodeStatus, NodeType, Run, RunId,
    RunState,
};

use crate::branch::BranchManager;
use crate::capture::EventCaptor;
use crate::checkpoint::{CheckpointPolicy, CheckpointStore};
use crate::dag::{DagOverrides, DagTracker, WorkflowRegistry};
use crate::dependency::DependencyAnalyzer;
use crate::gate::{ApprovalBroker, ApprovalDecision, ApprovalGate, RunControl};
use crate::parallel::{ParallelExecutor, TaskResult};
use crate::resources::ResourceManager;
use crate::resume::PlayFromNode;
use crate::retry::{RetryContextManager, TaskFailure};
use crate::run_log::RunLogger;
use crate::state_machine::StateMachine;
use crate::workspace;

const ACTOR: &str = "orchestrator";

/// Outcome of one `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub state: RunState,
    /// Outputs of nodes completed during this call.
    pub outputs: BTreeMap<String, Value>,
    pub failures: Vec<TaskFailure>,
    /// Nodes still pending when the call returned.
    pub pending: Vec<String>,
    pub levels: usize,
    pub checkpoints: usize,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Completed
    }
}

/// Accumulates what one `execute` call did.
struct Progress {
    outputs: BTreeMap<String, Value>,
    failures: Vec<TaskFailure>,
    levels: usize,
    checkpoints: usize,
}

/// Entry point tying the engine together: creates runs from workflow
/// modes, executes their DAGs level by level and finalizes them.
pub struct Orchestrator {
    config: WeftConfig,
    store: Arc<dyn RunStore>,
    event_bus: Arc<EventBus>,
    machine: Arc<StateMachine>,
    checkpoints: Arc<CheckpointStore>,
    resources: Arc<ResourceManager>,
    retry: Arc<RetryContextManager>,
    gate: ApprovalGate,
    analyzer: DependencyAnalyzer,
}

impl Orchestrator {
    pub fn new(config: WeftConfig, store: Arc<dyn RunStore>, event_bus: Arc<EventBus>) -> Self {
        let machine = Arc::new(StateMachine::new(store.clone(), event_bus.clone()));
        let checkpoints = Arc::new(CheckpointStore::new(
            store.clone(),
            config.checkpoint_dir(),
            event_bus.clone(),
        ));
        let resources = Arc::new(ResourceManager::new(&config.resources));
        let retry = Arc::new(RetryContextManager::new(
            store.clone(),
            event_bus.clone(),
            config.retry.clone(),
        ));
        let broker = Arc::new(ApprovalBroker::new(event_bus.clone()));
        let gate = ApprovalGate::new(config.approval.clone(), broker);
        Self {
            config,
            store,
            event_bus,
            machine,
            checkpoints,
            resources,
            retry,
            gate,
            analyzer: DependencyAnalyzer::default(),
        }
    }

    /// Use a different dependency analysis policy for planned steps.
    pub fn with_analyzer(mut self, analyzer: DependencyAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Share admission control with other orchestrators in the process.
    pub fn with_resources(mut self, resources: Arc<ResourceManager>) -> Self {
        self.resources = resources;
        self
    }

    pub fn config(&self) -> &WeftConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn broker(&self) -> &Arc<ApprovalBroker> {
        self.gate.broker()
    }

    pub fn registry(&self) -> WorkflowRegistry {
        WorkflowRegistry
    }

    pub fn branches(&self) -> BranchManager {
        BranchManager::new(
            self.store.clone(),
            self.checkpoints.clone(),
            self.config.runs_dir(),
        )
    }

    pub fn player(&self) -> PlayFromNode {
        PlayFromNode::new(self.machine.clone(), self.checkpoints.clone())
    }

    /// Create a run for `mode` with its DAG built and an initial checkpoint
    /// at step 0.
    pub fn create_run(&self, mode: &str, task: &str, overrides: DagOverrides) -> Result<Run> {
        let spec = WorkflowRegistry.mode(mode)?;
        let overrides = spec.overrides().merged(&overrides);

        let mut run = Run::new(mode, task, PathBuf::new());
        run.work_dir = self.config.runs_dir().join(run.id.as_str());
        let context = ExecutionContext::new(run.id.clone(), task)?;

        std::fs::create_dir_all(&run.work_dir)?;
        self.store.insert_run(&run)?;
        DagTracker::build(run.id.clone(), spec.template, overrides, self.machine.clone())?;
        if let Err(e) = self
            .checkpoints
            .save(&run.id, 0, None, CheckpointKind::Manual, &context)
        {
            warn!(run_id = %run.id, error = %e, "Initial checkpoint failed");
        }

        info!(run_id = %run.id, mode, template = spec.template, "Run created");
        Ok(run)
    }

    /// Execute `run_id` until it completes, fails, pauses or is cancelled.
    pub async fn execute(
        &self,
        run_id: &RunId,
        runner: Arc<dyn TaskRunner>,
        control: &RunControl,
    ) -> Result<RunReport> {
        let context = self.restore_context(run_id)?;
        self.drive(run_id, runner, control, context).await
    }

    /// Reset `node_id` and its downstream nodes, then execute from there.
    pub async fn play_from(
        &self,
        run_id: &RunId,
        node_id: &str,
        context_override: Option<&Map<String, Value>>,
        runner: Arc<dyn TaskRunner>,
        control: &RunControl,
    ) -> Result<RunReport> {
        let context = self.player().resume(run_id, node_id, context_override)?;
        self.drive(run_id, runner, control, context).await
    }

    /// Release a run left `executing` or `planning` by a process that died.
    ///
    /// The run moves to `paused` through an audited transition and its
    /// in-flight nodes return to pending, so `execute` or `play_from` can
    /// take it over. Returns `false` when the run was not mid-flight. Must
    /// not be called while another process still drives the run.
    pub fn recover(&self, run_id: &RunId) -> Result<bool> {
        let run = self.store.get_run(run_id)?;
        if !matches!(run.state, RunState::Executing | RunState::Planning) {
            return Ok(false);
        }
        self.machine
            .transition_run(run_id, RunState::Paused, "recovered after interruption", ACTOR)?;
        let tracker = DagTracker::load(run_id.clone(), self.machine.clone())?;
        self.recover_nodes(&tracker)?;
        warn!(run_id = %run_id, from = %run.state, "Interrupted run recovered");
        Ok(true)
    }

    /// Latest checkpointed context, minus outputs of nodes that have not
    /// settled successfully since.
    fn restore_context(&self, run_id: &RunId) -> Result<ExecutionContext> {
        let run = self.store.get_run(run_id)?;
        let mut context = match self.checkpoints.load(run_id, None) {
            Ok(ctx) => ctx,
            Err(WeftError::NotFound(_)) => ExecutionContext::new(run.id.clone(), &run.task)?,
            Err(e) => return Err(e),
        };
        let unfinished: Vec<String> = self
            .store
            .load_nodes(run_id)?
            .into_iter()
            .filter(|n| !n.status.satisfies_dependency())
            .map(|n| n.id)
            .collect();
        context.forget_nodes(&unfinished);
        context.run_id = run.id;
        Ok(context)
    }

    async fn drive(
        &self,
        run_id: &RunId,
        runner: Arc<dyn TaskRunner>,
        control: &RunControl,
        context: ExecutionContext,
    ) -> Result<RunReport> {
        let run = self.store.get_run(run_id)?;
        if run.state.is_terminal() || run.state == RunState::Executing {
            let reason = if run.state == RunState::Executing {
                "run is already executing; recover it if its process died"
            } else {
                "run is not resumable"
            };
            return Err(WeftError::InvalidTransition {
                entity_id: EntityRef::run(run_id).to_string(),
                from: run.state.to_string(),
                to: RunState::Executing.to_string(),
                reason: reason.into(),
            });
        }

        let log_token = control.token().child_token();
        let logger = self.config.log_dir().map(|dir| {
            let level = self.config.log.as_ref().map(|l| l.level).unwrap_or(2);
            RunLogger::new(dir, level).spawn(&self.event_bus, run_id.clone(), log_token.clone())
        });

        let captor = EventCaptor::new(run_id.clone(), self.store.clone());
        let report = captor
            .scope(self.drive_levels(run, runner, control, context))
            .await;

        if let Some(handle) = logger {
            // Only finished runs publish the event that stops the logger.
            let finished = matches!(&report, Ok(r) if r.state.is_terminal() || r.state == RunState::Failed);
            if !finished {
                log_token.cancel();
            }
            if let Err(e) = handle.await {
                warn!(run_id = %run_id, error = %e, "Run logger task failed");
            }
        }
        report
    }

    async fn drive_levels(
        &self,
        run: Run,
        runner: Arc<dyn TaskRunner>,
        control: &RunControl,
        mut context: ExecutionContext,
    ) -> Result<RunReport> {
        let run_id = run.id.clone();
        let tracker = Arc::new(DagTracker::load(run_id.clone(), self.machine.clone())?);
        let policy = CheckpointPolicy::new(self.config.checkpoint.clone());
        let mut progress = Progress {
            outputs: BTreeMap::new(),
            failures: Vec::new(),
            levels: 0,
            checkpoints: 0,
        };

        let root = EventCaptor::emit("run_started", None, json!({ "state": run.state }), None);
        self.recover_nodes(&tracker)?;
        if run.state == RunState::WaitingApproval {
            self.enter(&run_id, RunState::Paused, "gate abandoned")?;
        }

        let mut previous_failed = false;
        loop {
            if control.is_cancelled() {
                return self.finalize(&tracker, RunState::Cancelled, progress, root);
            }
            if control.clear_pause() {
                return self.pause(&tracker, &policy, &context, progress, root);
            }

            let level = tracker.ready_nodes();
            if level.is_empty() {
                break;
            }
            let planning = level.iter().any(|n| n.node_type == NodeType::Planning);
            let phase = if planning {
                RunState::Planning
            } else {
                RunState::Executing
            };
            self.enter(&run_id, phase, "level ready")?;

            let reasons = self.gate.evaluate(&level, previous_failed);
            if !reasons.is_empty() {
                match self.hold_for_approval(&tracker, &level, reasons, phase, control).await? {
                    ApprovalDecision::Approved => {}
                    ApprovalDecision::Denied { reason } => {
                        warn!(run_id = %run_id, reason = %reason, "Approval denied");
                        for node in &level {
                            tracker.update_node_status(&node.id, NodeStatus::Cancelled, &reason, "human")?;
                        }
                        let outcome = if control.is_cancelled() {
                            RunState::Cancelled
                        } else {
                            RunState::Failed
                        };
                        return self.finalize(&tracker, outcome, progress, root);
                    }
                }
            }

            for node in level.iter().filter(|n| policy.before_node(n)) {
                let step = node.step_number.saturating_sub(1);
                if self.checkpoint(&run_id, step, Some(&node.id), CheckpointKind::PreRisky, &context) {
                    progress.checkpoints += 1;
                }
            }

            let results = self
                .run_level(&tracker, &level, &run.work_dir, runner.clone(), &context, control)
                .await;
            progress.levels += 1;

            let failed = self.settle_level(&tracker, &level, results, &mut context, &mut progress)?;

            let outcomes: Vec<(String, bool)> = level
                .iter()
                .map(|n| {
                    let ok = tracker
                        .node(&n.id)
                        .map(|n| n.status == NodeStatus::Completed)
                        .unwrap_or(false);
                    (n.id.clone(), ok)
                })
                .collect();
            if let Err(e) = workspace::merge_level(&run.work_dir, &outcomes, self.config.executor.merge_policy) {
                error!(run_id = %run_id, error = %e, "Merging task workspaces failed");
            }

            for node in &level {
                let completed = tracker
                    .node(&node.id)
                    .map(|n| n.status == NodeStatus::Completed)
                    .unwrap_or(false);
                if !completed {
                    continue;
                }
                if let Some(kind) = policy.after_node(node) {
                    if self.checkpoint(&run_id, node.step_number, Some(&node.id), kind, &context) {
                        progress.checkpoints += 1;
                        policy.mark_saved();
                    }
                }
            }
            if let Some(keep) = policy.keep_last() {
                if let Err(e) = self.checkpoints.prune(&run_id, keep) {
                    warn!(run_id = %run_id, error = %e, "Checkpoint pruning failed");
                }
            }

            previous_failed = failed;
            if failed && self.config.engine.stop_on_failure {
                break;
            }
        }

        if control.is_cancelled() {
            return self.finalize(&tracker, RunState::Cancelled, progress, root);
        }
        let unfinished = tracker
            .snapshot()
            .nodes
            .iter()
            .any(|n| !n.status.satisfies_dependency());
        let outcome = if progress.failures.is_empty() && !unfinished {
            RunState::Completed
        } else {
            RunState::Failed
        };
        self.finalize(&tracker, outcome, progress, root)
    }

    /// Return nodes left mid-flight by an interrupted call to pending.
    fn recover_nodes(&self, tracker: &DagTracker) -> Result<()> {
        for node in tracker.snapshot().nodes {
            match node.status {
                NodeStatus::Running => {
                    tracker.update_node_status(&node.id, NodeStatus::Cancelled, "interrupted", ACTOR)?;
                    tracker.update_node_status(&node.id, NodeStatus::Pending, "interrupted", ACTOR)?;
                }
                NodeStatus::Paused | NodeStatus::WaitingApproval => {
                    tracker.update_node_status(&node.id, NodeStatus::Pending, "interrupted", ACTOR)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Move the run to `target`, routing through `executing` when the
    /// lifecycle has no direct edge.
    fn enter(&self, run_id: &RunId, target: RunState, reason: &str) -> Result<()> {
        let current = self.store.get_run(run_id)?.state;
        if current == target {
            return Ok(());
        }
        if !current.can_move_to(target) && current.can_move_to(RunState::Executing) {
            self.machine
                .transition_run(run_id, RunState::Executing, reason, ACTOR)?;
            if target == RunState::Executing {
                return Ok(());
            }
        }
        self.machine.transition_run(run_id, target, reason, ACTOR)?;
        Ok(())
    }

    async fn hold_for_approval(
        &self,
        tracker: &DagTracker,
        level: &[Node],
        reasons: Vec<String>,
        phase: RunState,
        control: &RunControl,
    ) -> Result<ApprovalDecision> {
        let run_id = tracker.run_id();
        let seq = EventCaptor::emit("gate_opened", None, json!({ "reasons": &reasons }), None);
        self.machine
            .transition_run(run_id, RunState::WaitingApproval, &reasons.join("; "), ACTOR)?;
        for node in level {
            tracker.update_node_status(&node.id, NodeStatus::WaitingApproval, "awaiting approval", ACTOR)?;
        }

        let decision = self
            .gate
            .request_approval(run_id, level, reasons, control.token())
            .await;
        EventCaptor::emit("gate_resolved", None, json!({ "decision": &decision }), seq);

        if decision == ApprovalDecision::Approved {
            let run = self.store.get_run(run_id)?;
            self.store.set_run_flags(run_id, run.has_plan, true)?;
            self.machine
                .transition_run(run_id, phase, "approved", "human")?;
            self.store.set_run_flags(run_id, run.has_plan, false)?;
        }
        Ok(decision)
    }

    async fn run_level(
        &self,
        tracker: &Arc<DagTracker>,
        level: &[Node],
        run_dir: &Path,
        runner: Arc<dyn TaskRunner>,
        context: &ExecutionContext,
        control: &RunControl,
    ) -> BTreeMap<String, TaskResult> {
        let executor = ParallelExecutor::from_config(
            &self.config.executor,
            self.resources.clone(),
            self.config.engine.stop_on_failure,
        );
        let ids: Vec<String> = level.iter().map(|n| n.id.clone()).collect();
        let estimates: BTreeMap<String, u32> = level
            .iter()
            .filter_map(|n| {
                n.metadata
                    .get("memory_mb")
                    .and_then(Value::as_u64)
                    .map(|mb| (n.id.clone(), mb.min(u32::MAX as u64) as u32))
            })
            .collect();

        let task = NodeTask {
            tracker: tracker.clone(),
            runner,
            retry: self.retry.clone(),
            context: Arc::new(context.clone()),
            run_dir: run_dir.to_path_buf(),
            feedback: control.feedback(),
            cancel: control.token().clone(),
        };
        let task = Arc::new(task);
        executor
            .execute_level(
                &ids,
                &estimates,
                Arc::new(move |id: String| {
                    let task = task.clone();
                    async move { task.run(id).await }
                }),
                control.token(),
            )
            .await
    }

    /// Apply a level's results to node statuses and the context. Returns
    /// whether any node failed.
    fn settle_level(
        &self,
        tracker: &DagTracker,
        level: &[Node],
        mut results: BTreeMap<String, TaskResult>,
        context: &mut ExecutionContext,
        progress: &mut Progress,
    ) -> Result<bool> {
        let mut failed = false;
        for node in level {
            let result = results
                .remove(&node.id)
                .unwrap_or_else(|| Err(TaskFailure::cancelled(&node.id, 0)));
            let result = match result {
                Ok(value) if node.node_type == NodeType::Planning => {
                    self.expand_plan(tracker, node, &value, context).map(|_| value)
                }
                other => other,
            };

            match result {
                Ok(value) => {
                    context.record_output(&node.id, node.step_number, value.clone());
                    progress.outputs.insert(node.id.clone(), value);
                    self.mark(tracker, &node.id, NodeStatus::Completed, "completed")?;
                }
                Err(failure) if failure.cancelled => {
                    self.mark(tracker, &node.id, NodeStatus::Cancelled, "cancelled")?;
                }
                Err(failure) => {
                    failed = true;
                    self.mark(tracker, &node.id, NodeStatus::Failed, &failure.error)?;
                    progress.failures.push(failure);
                }
            }
        }
        Ok(failed)
    }

    /// Running nodes settle directly; nodes that never started settle via
    /// `running` for completion, or straight to `cancelled`.
    fn mark(&self, tracker: &DagTracker, node_id: &str, status: NodeStatus, reason: &str) -> Result<()> {
        let current = tracker
            .node(node_id)
            .map(|n| n.status)
            .ok_or_else(|| WeftError::NotFound(format!("node '{}'", node_id)))?;
        if !current.can_move_to(status) && current.can_move_to(NodeStatus::Running) {
            tracker.update_node_status(node_id, NodeStatus::Running, reason, ACTOR)?;
        }
        tracker.update_node_status(node_id, status, reason, ACTOR)?;
        Ok(())
    }

    /// Turn planning output `{"steps": [...]}` into DAG nodes after `node`.
    fn expand_plan(
        &self,
        tracker: &DagTracker,
        node: &Node,
        output: &Value,
        context: &mut ExecutionContext,
    ) -> std::result::Result<(), TaskFailure> {
        let fail = |error: String| TaskFailure::new(node.id.clone(), error, ErrorCategory::Value, 1);
        let steps = parse_steps(output).map_err(|e| fail(e.to_string()))?;
        let graph = self.analyzer.analyze(&steps);
        let added = tracker
            .add_step_graph(&node.id, &steps, &graph)
            .map_err(|e| fail(e.to_string()))?;
        let run_id = tracker.run_id();
        if let Err(e) = self.store.set_run_flags(run_id, true, false) {
            return Err(fail(e.to_string()));
        }
        EventCaptor::emit(
            "plan_expanded",
            Some(&node.id),
            json!({ "added": added, "fallback": graph.is_fallback() }),
            None,
        );
        info!(run_id = %run_id, steps = steps.len(), fallback = graph.is_fallback(), "Plan expanded");
        context.plan = Some(steps);
        Ok(())
    }

    /// Whether a new checkpoint was written.
    fn checkpoint(
        &self,
        run_id: &RunId,
        step: u32,
        node_id: Option<&str>,
        kind: CheckpointKind,
        context: &ExecutionContext,
    ) -> bool {
        match self.checkpoints.save(run_id, step, node_id, kind, context) {
            Ok(saved) => saved.is_some(),
            Err(e) => {
                warn!(run_id = %run_id, step, error = %e, "Checkpoint skipped");
                false
            }
        }
    }

    fn pause(
        &self,
        tracker: &DagTracker,
        policy: &CheckpointPolicy,
        context: &ExecutionContext,
        mut progress: Progress,
        root: Option<u64>,
    ) -> Result<RunReport> {
        let run_id = tracker.run_id();
        if policy.on_pause()
            && self.checkpoint(run_id, context.step_number, None, CheckpointKind::OnPause, context)
        {
            progress.checkpoints += 1;
        }
        self.enter(run_id, RunState::Paused, "pause requested")?;
        EventCaptor::emit("run_paused", None, Value::Null, root);
        info!(run_id = %run_id, "Run paused");
        Ok(self.report(tracker, RunState::Paused, progress))
    }

    fn finalize(
        &self,
        tracker: &DagTracker,
        outcome: RunState,
        progress: Progress,
        root: Option<u64>,
    ) -> Result<RunReport> {
        let run_id = tracker.run_id();
        let current = self.store.get_run(run_id)?.state;
        if current != outcome {
            if !current.can_move_to(outcome) {
                self.enter(run_id, RunState::Executing, "finalizing")?;
            }
            self.machine
                .transition_run(run_id, outcome, &format!("run {}", outcome), ACTOR)?;
        }

        EventCaptor::emit("run_finished", None, json!({ "state": outcome }), root);
        self.event_bus.publish(WorkflowEvent::RunFinished {
            run_id: run_id.clone(),
            state: outcome,
            timestamp: Utc::now(),
        });
        info!(
            run_id = %run_id,
            state = %outcome,
            failures = progress.failures.len(),
            levels = progress.levels,
            "Run finished"
        );
        Ok(self.report(tracker, outcome, progress))
    }

    fn report(&self, tracker: &DagTracker, state: RunState, progress: Progress) -> RunReport {
        let pending = tracker
            .snapshot()
            .nodes
            .into_iter()
            .filter(|n| n.status == NodeStatus::Pending)
            .map(|n| n.id)
            .collect();
        RunReport {
            run_id: tracker.run_id().clone(),
            state,
            outputs: progress.outputs,
            failures: progress.failures,
            pending,
            levels: progress.levels,
            checkpoints: progress.checkpoints,
        }
    }
}

/// Everything a spawned node task needs, shared by the tasks of a level.
struct NodeTask {
    tracker: Arc<DagTracker>,
    runner: Arc<dyn TaskRunner>,
    retry: Arc<RetryContextManager>,
    context: Arc<ExecutionContext>,
    run_dir: PathBuf,
    feedback: Option<String>,
    cancel: tokio_util::sync::CancellationToken,
}

impl NodeTask {
    async fn run(&self, id: String) -> TaskResult {
        let fail = |error: String| TaskFailure::new(id.clone(), error, ErrorCategory::Unknown, 0);
        let Some(node) = self.tracker.node(&id) else {
            return Err(fail(format!("node '{}' not in DAG", id)));
        };
        if let Err(e) =
            self.tracker
                .update_node_status(&id, NodeStatus::Running, "level started", ACTOR)
        {
            return Err(fail(e.to_string()));
        }

        let run_id = self.tracker.run_id();
        self.retry
            .run_with_retry(run_id, &node, self.feedback.clone(), &self.cancel, |attempt, retry_ctx| {
                let runner = self.runner.clone();
                let invocation = prepare_invocation(
                    run_id,
                    &node,
                    attempt,
                    &self.run_dir,
                    &self.context,
                    retry_ctx.map(|c| c.guidance()),
                );
                async move {
                    let invocation = invocation.map_err(|e| e.to_string())?;
                    runner
                        .run(invocation)
                        .await
                        .map(|out| out.value)
                        .map_err(|e| e.message)
                }
            })
            .await
    }
}

fn prepare_invocation(
    run_id: &RunId,
    node: &Node,
    attempt: u32,
    run_dir: &Path,
    context: &Arc<ExecutionContext>,
    retry_guidance: Option<String>,
) -> Result<TaskInvocation> {
    let work_dir = workspace::prepare_task_dir(run_dir, &node.id)?;
    Ok(TaskInvocation {
        run_id: run_id.clone(),
        node: node.clone(),
        attempt,
        work_dir,
        run_dir: run_dir.to_path_buf(),
        context: context.clone(),
        retry_guidance,
    })
}

/// Accepts `{"steps": [...]}` where each step is a description string or a
/// step object. Missing ids become `step_<n>`.
pub fn parse_steps(output: &Value) -> Result<Vec<StepSpec>> {
    let steps = output
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| WeftError::Validation("planning output has no 'steps' list".into()))?;
    if steps.is_empty() {
        return Err(WeftError::Validation("planning output has an empty plan".into()));
    }

    steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let default_id = format!("step_{}", i + 1);
            match step {
                Value::String(description) => Ok(StepSpec::new(default_id, description.clone())),
                Value::Object(obj) => {
                    let mut obj = obj.clone();
                    obj.entry("id").or_insert_with(|| Value::String(default_id.clone()));
                    let mut spec: StepSpec = serde_json::from_value(Value::Object(obj))?;
                    if spec.id.trim().is_empty() {
                        spec.id = default_id;
                    }
                    Ok(spec)
                }
                other => Err(WeftError::Validation(format!(
                    "step {} must be a string or object, got {}",
                    i + 1,
                    other
                ))),
            }
        })
        .collect()
}
