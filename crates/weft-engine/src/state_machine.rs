use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use weft_core::error::{Result, WeftError};
use weft_core::event::{EventBus, WorkflowEvent};
use weft_core::traits::RunStore;
use weft_core::types::{EntityRef, Lifecycle, NodeStatus, RunId, RunState, StateTransition};

/// Entity attributes that guards are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct GuardSubject {
    pub has_plan: bool,
    pub approval_granted: bool,
    pub node_count: usize,
}

/// A named predicate attached to one run transition.
pub struct Guard {
    pub name: &'static str,
    pub from: RunState,
    pub to: RunState,
    check: fn(&GuardSubject) -> bool,
}

impl Guard {
    pub fn passes(&self, subject: &GuardSubject) -> bool {
        (self.check)(subject)
    }
}

fn has_plan(s: &GuardSubject) -> bool {
    s.has_plan
}

fn has_approval(s: &GuardSubject) -> bool {
    s.approval_granted
}

fn has_nodes(s: &GuardSubject) -> bool {
    s.node_count > 0
}

pub const RUN_GUARDS: &[Guard] = &[
    Guard {
        name: "has_plan",
        from: RunState::Planning,
        to: RunState::Executing,
        check: has_plan,
    },
    Guard {
        name: "has_approval",
        from: RunState::WaitingApproval,
        to: RunState::Executing,
        check: has_approval,
    },
    Guard {
        name: "has_nodes",
        from: RunState::Draft,
        to: RunState::Executing,
        check: has_nodes,
    },
];

fn failing_guard(from: RunState, to: RunState, subject: &GuardSubject) -> Option<&'static str> {
    RUN_GUARDS
        .iter()
        .filter(|g| g.from == from && g.to == to)
        .find(|g| !g.passes(subject))
        .map(|g| g.name)
}

/// Validate a move against the lifecycle table.
fn check_table<S: Lifecycle>(entity: &EntityRef, from: S, to: S) -> Result<()> {
    if from.can_move_to(to) {
        return Ok(());
    }
    let reason = if from.is_terminal() {
        format!("{} is terminal", from)
    } else {
        format!("allowed: {}", join(from.allowed_next()))
    };
    Err(WeftError::InvalidTransition {
        entity_id: entity.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        reason,
    })
}

fn join<S: Lifecycle>(states: &[S]) -> String {
    states
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validated state transitions for runs and nodes.
///
/// Every successful transition updates the entity and appends its audit
/// record in one store transaction. Observers are notified through the
/// event bus only after that commit.
pub struct StateMachine {
    store: Arc<dyn RunStore>,
    event_bus: Arc<EventBus>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn RunStore>, event_bus: Arc<EventBus>) -> Self {
        Self { store, event_bus }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    fn guard_subject(&self, run_id: &RunId) -> Result<(RunState, GuardSubject)> {
        let run = self.store.get_run(run_id)?;
        let node_count = self.store.load_nodes(run_id)?.len();
        Ok((
            run.state,
            GuardSubject {
                has_plan: run.has_plan,
                approval_granted: run.approval_granted,
                node_count,
            },
        ))
    }

    fn node_status(&self, run_id: &RunId, node_id: &str) -> Result<NodeStatus> {
        self.store
            .load_nodes(run_id)?
            .into_iter()
            .find(|n| n.id == node_id)
            .map(|n| n.status)
            .ok_or_else(|| WeftError::NotFound(format!("node {} in run {}", node_id, run_id)))
    }

    /// Move a run to `target`.
    pub fn transition_run(
        &self,
        run_id: &RunId,
        target: RunState,
        reason: &str,
        actor: &str,
    ) -> Result<StateTransition> {
        let entity = EntityRef::run(run_id);
        let (current, subject) = self.guard_subject(run_id)?;
        check_table(&entity, current, target)?;
        if let Some(guard) = failing_guard(current, target, &subject) {
            return Err(WeftError::InvalidTransition {
                entity_id: entity.to_string(),
                from: current.to_string(),
                to: target.to_string(),
                reason: format!("guard '{}' failed", guard),
            });
        }

        let transition = self.record(entity, current, target, reason, actor);
        self.store.apply_run_transition(current, &transition)?;
        info!(run_id = %run_id, from = %current, to = %target, reason, "Run transition");
        self.notify(&transition);
        Ok(transition)
    }

    /// Move a node to `target`.
    pub fn transition_node(
        &self,
        run_id: &RunId,
        node_id: &str,
        target: NodeStatus,
        reason: &str,
        actor: &str,
    ) -> Result<StateTransition> {
        let entity = EntityRef::node(run_id, node_id);
        let current = self.node_status(run_id, node_id)?;
        check_table(&entity, current, target)?;

        let transition = self.record(entity, current, target, reason, actor);
        self.store.apply_node_transition(current, &transition)?;
        debug!(run_id = %run_id, node_id, from = %current, to = %target, "Node transition");
        self.notify(&transition);
        Ok(transition)
    }

    /// States a run may move to right now (table and guards).
    pub fn allowed_run_transitions(&self, run_id: &RunId) -> Result<Vec<RunState>> {
        let (current, subject) = self.guard_subject(run_id)?;
        Ok(current
            .allowed_next()
            .iter()
            .copied()
            .filter(|to| failing_guard(current, *to, &subject).is_none())
            .collect())
    }

    pub fn allowed_node_transitions(&self, run_id: &RunId, node_id: &str) -> Result<Vec<NodeStatus>> {
        Ok(self.node_status(run_id, node_id)?.allowed_next().to_vec())
    }

    pub fn can_transition_run(&self, run_id: &RunId, target: RunState) -> bool {
        self.allowed_run_transitions(run_id)
            .map(|allowed| allowed.contains(&target))
            .unwrap_or(false)
    }

    pub fn can_transition_node(&self, run_id: &RunId, node_id: &str, target: NodeStatus) -> bool {
        self.allowed_node_transitions(run_id, node_id)
            .map(|allowed| allowed.contains(&target))
            .unwrap_or(false)
    }

    /// Ordered audit trail for an entity.
    pub fn history(&self, entity: &EntityRef) -> Result<Vec<StateTransition>> {
        self.store.transitions(entity)
    }

    fn record<S: Lifecycle>(
        &self,
        entity: EntityRef,
        from: S,
        to: S,
        reason: &str,
        actor: &str,
    ) -> StateTransition {
        StateTransition {
            id: Uuid::new_v4().to_string(),
            entity,
            from_state: from.as_str().to_string(),
            to_state: to.as_str().to_string(),
            reason: reason.to_string(),
            actor: actor.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn notify(&self, t: &StateTransition) {
        self.event_bus.publish(WorkflowEvent::StateChanged {
            entity: t.entity.clone(),
            from: t.from_state.clone(),
            to: t.to_state.clone(),
            reason: t.reason.clone(),
            actor: t.actor.clone(),
            timestamp: t.timestamp,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use weft_core::types::{Node, NodeType, Run};
    use weft_store::SqliteStore;

    fn setup(with_nodes: bool) -> (StateMachine, RunId) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let run = Run::new("one_shot", "task", PathBuf::from("/tmp/sm"));
        store.insert_run(&run).unwrap();
        if with_nodes {
            store
                .save_dag(&run.id, &[Node::new("init", NodeType::Init)], &[])
                .unwrap();
        }
        let sm = StateMachine::new(store, Arc::new(EventBus::default()));
        (sm, run.id)
    }

    #[test]
    fn valid_chain_leaves_gapless_history() {
        let (sm, run_id) = setup(true);
        sm.transition_run(&run_id, RunState::Executing, "start", "test")
            .unwrap();
        sm.transition_run(&run_id, RunState::Paused, "pause", "test")
            .unwrap();
        sm.transition_run(&run_id, RunState::Executing, "resume", "test")
            .unwrap();
        sm.transition_run(&run_id, RunState::Completed, "done", "test")
            .unwrap();

        let history = sm.history(&EntityRef::run(&run_id)).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].from_state, "draft");
        for pair in history.windows(2) {
            assert_eq!(pair[0].to_state, pair[1].from_state);
        }
    }

    #[test]
    fn terminal_state_rejects_everything() {
        let (sm, run_id) = setup(true);
        sm.transition_run(&run_id, RunState::Cancelled, "stop", "test")
            .unwrap();
        assert!(sm.allowed_run_transitions(&run_id).unwrap().is_empty());
        let err = sm
            .transition_run(&run_id, RunState::Executing, "again", "test")
            .unwrap_err();
        assert!(matches!(err, WeftError::InvalidTransition { .. }));
        assert_eq!(sm.history(&EntityRef::run(&run_id)).unwrap().len(), 1);
    }

    #[test]
    fn has_nodes_guard_blocks_empty_run() {
        let (sm, run_id) = setup(false);
        assert!(!sm.can_transition_run(&run_id, RunState::Executing));
        assert!(sm.can_transition_run(&run_id, RunState::Planning));
        let err = sm
            .transition_run(&run_id, RunState::Executing, "start", "test")
            .unwrap_err();
        assert!(err.to_string().contains("has_nodes"));
    }

    #[test]
    fn has_plan_guard() {
        let (sm, run_id) = setup(true);
        sm.transition_run(&run_id, RunState::Planning, "plan", "test")
            .unwrap();
        assert!(!sm.can_transition_run(&run_id, RunState::Executing));

        sm.store().set_run_flags(&run_id, true, false).unwrap();
        sm.transition_run(&run_id, RunState::Executing, "planned", "test")
            .unwrap();
    }

    #[test]
    fn node_transitions_are_validated() {
        let (sm, run_id) = setup(true);
        assert!(sm
            .transition_node(&run_id, "init", NodeStatus::Completed, "skip", "test")
            .is_err());
        sm.transition_node(&run_id, "init", NodeStatus::Running, "start", "test")
            .unwrap();
        sm.transition_node(&run_id, "init", NodeStatus::Completed, "ok", "test")
            .unwrap();
        assert_eq!(
            sm.allowed_node_transitions(&run_id, "init").unwrap(),
            vec![NodeStatus::Pending]
        );
        assert!(matches!(
            sm.transition_node(&run_id, "ghost", NodeStatus::Running, "x", "test"),
            Err(WeftError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn observers_see_committed_transition() {
        let (sm, run_id) = setup(true);
        let mut rx = sm.event_bus().subscribe();
        sm.transition_run(&run_id, RunState::Executing, "start", "alice")
            .unwrap();

        match rx.recv().await.unwrap() {
            WorkflowEvent::StateChanged { from, to, actor, .. } => {
                assert_eq!((from.as_str(), to.as_str()), ("draft", "executing"));
                assert_eq!(actor, "alice");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            sm.store().get_run(&run_id).unwrap().state,
            RunState::Executing
        );
    }
}
