use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use weft_core::context::ExecutionContext;
use weft_core::error::{Result, WeftError};
use weft_core::types::{EntityRef, Lifecycle, NodeStatus, RunId, RunState};

use crate::checkpoint::CheckpointStore;
use crate::dag::DagTracker;
use crate::state_machine::StateMachine;

const ACTOR: &str = "play_from_node";

/// Re-execution of a run starting at a chosen node.
pub struct PlayFromNode {
    machine: Arc<StateMachine>,
    checkpoints: Arc<CheckpointStore>,
}

impl PlayFromNode {
    pub fn new(machine: Arc<StateMachine>, checkpoints: Arc<CheckpointStore>) -> Self {
        Self {
            machine,
            checkpoints,
        }
    }

    /// Prepare `run_id` to continue from `node_id`.
    ///
    /// Loads the nearest checkpoint before the node, merges
    /// `context_override`, and resets the node and everything downstream of
    /// it to pending through audited transitions. Other nodes are left as
    /// they are. Checkpoints from the node's step on are superseded so the
    /// replay records its own. Returns the context execution should
    /// continue with.
    pub fn resume(
        &self,
        run_id: &RunId,
        node_id: &str,
        context_override: Option<&Map<String, Value>>,
    ) -> Result<ExecutionContext> {
        let run = self.machine.store().get_run(run_id)?;
        if run.state.is_terminal() || run.state == RunState::Executing {
            return Err(WeftError::InvalidTransition {
                entity_id: EntityRef::run(run_id).to_string(),
                from: run.state.to_string(),
                to: RunState::Executing.to_string(),
                reason: format!("cannot play from a {} run", run.state),
            });
        }

        let tracker = DagTracker::load(run_id.clone(), self.machine.clone())?;
        let Some(start) = tracker.node(node_id) else {
            return Err(WeftError::NotFound(format!("node {} in run {}", node_id, run_id)));
        };
        let (step, mut context) = self.checkpoints.load_latest_before(run_id, node_id)?;

        let mut targets: Vec<String> = vec![node_id.to_string()];
        targets.extend(tracker.downstream_of(node_id));
        context.run_id = run_id.clone();
        context.forget_nodes(&targets);

        // Settled nodes outside the reset set keep outputs that only later
        // checkpoints recorded.
        if let Ok(latest) = self.checkpoints.load(run_id, None) {
            let base_step = context.step_number;
            for node in tracker.snapshot().nodes {
                if !node.status.satisfies_dependency()
                    || targets.contains(&node.id)
                    || context.outputs.contains_key(&node.id)
                {
                    continue;
                }
                if let Some(output) = latest.outputs.get(&node.id) {
                    context.record_output(&node.id, node.step_number, output.clone());
                }
            }
            context.step_number = base_step;
        }
        if let Some(overrides) = context_override {
            context.apply_modifications(overrides)?;
        }

        let retired = self.checkpoints.supersede_from(run_id, start.step_number)?;

        let reason = format!("play from {}", node_id);
        let mut reset = 0;
        for id in &targets {
            let Some(node) = tracker.node(id) else {
                continue;
            };
            // Running nodes can only settle before they reset.
            if node.status == NodeStatus::Running {
                tracker.update_node_status(id, NodeStatus::Cancelled, &reason, ACTOR)?;
            }
            if tracker.update_node_status(id, NodeStatus::Pending, &reason, ACTOR)? {
                reset += 1;
            }
        }

        info!(
            run_id = %run_id,
            node_id,
            checkpoint_step = step,
            reset,
            retired,
            "Run prepared to play from node"
        );
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::event::EventBus;
    use weft_core::traits::RunStore;
    use weft_core::types::{CheckpointKind, Run};
    use weft_test_utils::{insert_chain_run, TestEnv};

    struct Fixture {
        env: TestEnv,
        machine: Arc<StateMachine>,
        checkpoints: Arc<CheckpointStore>,
        player: PlayFromNode,
        run: Run,
    }

    /// Five-step chain with steps 1-4 completed and the run failed.
    fn fixture() -> Fixture {
        let env = TestEnv::new();
        let bus = Arc::new(EventBus::default());
        let machine = Arc::new(StateMachine::new(env.store.clone(), bus.clone()));
        let checkpoints = Arc::new(CheckpointStore::new(
            env.store.clone(),
            env.config.checkpoint_dir(),
            bus,
        ));
        let run = insert_chain_run(env.store.as_ref(), env.path(), 5, 4);
        machine
            .transition_run(&run.id, RunState::Executing, "start", "test")
            .unwrap();
        machine
            .transition_run(&run.id, RunState::Failed, "step_5 failed", "test")
            .unwrap();
        let player = PlayFromNode::new(machine.clone(), checkpoints.clone());
        Fixture {
            env,
            machine,
            checkpoints,
            player,
            run,
        }
    }

    fn save(f: &Fixture, step: u32) {
        let mut ctx = ExecutionContext::new(f.run.id.clone(), "chain task").unwrap();
        for s in 1..=step {
            ctx.record_output(&format!("step_{}", s), s, json!(s));
        }
        f.checkpoints
            .save(&f.run.id, step, Some(&format!("step_{}", step)), CheckpointKind::Step, &ctx)
            .unwrap();
    }

    fn statuses(f: &Fixture) -> Vec<NodeStatus> {
        f.env
            .store
            .load_nodes(&f.run.id)
            .unwrap()
            .into_iter()
            .map(|n| n.status)
            .collect()
    }

    #[test]
    fn without_checkpoint_nothing_changes() {
        let f = fixture();
        assert!(matches!(
            f.player.resume(&f.run.id, "step_3", None),
            Err(WeftError::NoCheckpointAvailable { .. })
        ));
        assert_eq!(statuses(&f)[..4], [NodeStatus::Completed; 4]);
    }

    #[test]
    fn resets_node_and_downstream_only() {
        let f = fixture();
        save(&f, 2);
        let ctx = f.player.resume(&f.run.id, "step_3", None).unwrap();

        assert_eq!(
            statuses(&f),
            vec![
                NodeStatus::Completed,
                NodeStatus::Completed,
                NodeStatus::Pending,
                NodeStatus::Pending,
                NodeStatus::Pending,
            ]
        );
        assert_eq!(ctx.completed_nodes, vec!["step_1", "step_2"]);

        let history = f
            .machine
            .history(&EntityRef::node(&f.run.id, "step_3"))
            .unwrap();
        let last = history.last().unwrap();
        assert_eq!((last.from_state.as_str(), last.to_state.as_str()), ("completed", "pending"));
        assert_eq!(last.actor, ACTOR);
        assert!(f
            .machine
            .history(&EntityRef::node(&f.run.id, "step_2"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn later_checkpoints_are_retired() {
        let f = fixture();
        for step in 1..=4 {
            save(&f, step);
        }
        f.player.resume(&f.run.id, "step_3", None).unwrap();
        assert_eq!(
            f.checkpoints.known_steps(&f.run.id).into_iter().collect::<Vec<_>>(),
            vec![1, 2]
        );
        let latest = f.checkpoints.load(&f.run.id, None).unwrap();
        assert!(!latest.outputs.contains_key("step_3"));
    }

    #[test]
    fn override_is_merged() {
        let f = fixture();
        save(&f, 2);
        let mut overrides = Map::new();
        overrides.insert("batch_size".into(), json!(16));
        let ctx = f
            .player
            .resume(&f.run.id, "step_4", Some(&overrides))
            .unwrap();
        assert_eq!(ctx.variables["batch_size"], json!(16));
        // step_3 is upstream of step_4 and keeps its status.
        assert_eq!(statuses(&f)[2], NodeStatus::Completed);
    }

    #[test]
    fn refuses_terminal_or_executing_runs() {
        let f = fixture();
        save(&f, 2);
        f.machine
            .transition_run(&f.run.id, RunState::Executing, "resume", "test")
            .unwrap();
        assert!(matches!(
            f.player.resume(&f.run.id, "step_3", None),
            Err(WeftError::InvalidTransition { .. })
        ));
        f.machine
            .transition_run(&f.run.id, RunState::Completed, "done", "test")
            .unwrap();
        assert!(f.player.resume(&f.run.id, "step_3", None).is_err());
    }
}
