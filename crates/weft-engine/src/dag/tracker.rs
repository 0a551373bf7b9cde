use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use weft_core::context::StepSpec;
use weft_core::error::{Result, WeftError};
use weft_core::event::WorkflowEvent;
use weft_core::types::{EntityRef, Node, NodeStatus, NodeType, RunId};

use super::model::Dag;
use super::template::{DagOverrides, WorkflowRegistry};
use crate::dependency::DependencyGraph;
use crate::state_machine::StateMachine;

const OVERRIDES_KEY: &str = "dag_overrides";
const TERMINATOR_ID: &str = "terminator";

/// Owns the DAG of one run: builds it from a template, grows it from
/// planning output and keeps node statuses in step with the store.
pub struct DagTracker {
    run_id: RunId,
    overrides: DagOverrides,
    dag: RwLock<Dag>,
    machine: Arc<StateMachine>,
}

impl DagTracker {
    /// Instantiate `template_id` for a run and persist it.
    pub fn build(
        run_id: RunId,
        template_id: &str,
        overrides: DagOverrides,
        machine: Arc<StateMachine>,
    ) -> Result<Self> {
        let registry = WorkflowRegistry;
        let mut dag = registry.instantiate(template_id, &overrides)?;

        // Plan-driven DAGs apply overrides to nodes created later, so they
        // travel with the root node.
        if registry.template(template_id)?.is_plan_driven() && overrides != DagOverrides::default()
        {
            if let Some(root) = dag.nodes.first_mut() {
                root.metadata
                    .insert(OVERRIDES_KEY.into(), serde_json::to_value(&overrides)?);
            }
        }

        machine.store().save_dag(&run_id, &dag.nodes, &dag.edges)?;
        info!(
            run_id = %run_id,
            template = template_id,
            nodes = dag.nodes.len(),
            edges = dag.edges.len(),
            "DAG built"
        );

        let tracker = Self {
            run_id,
            overrides,
            dag: RwLock::new(dag),
            machine,
        };
        let added: Vec<String> = tracker.read().nodes.iter().map(|n| n.id.clone()).collect();
        tracker.publish_update(added);
        Ok(tracker)
    }

    /// Rebuild the tracker from the persisted DAG.
    pub fn load(run_id: RunId, machine: Arc<StateMachine>) -> Result<Self> {
        let nodes = machine.store().load_nodes(&run_id)?;
        if nodes.is_empty() {
            return Err(WeftError::NotFound(format!("DAG for run {}", run_id)));
        }
        let edges = machine.store().load_edges(&run_id)?;
        let overrides = nodes
            .iter()
            .find_map(|n| n.metadata.get(OVERRIDES_KEY))
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?
            .unwrap_or_default();
        let dag = Dag::from_parts(nodes, edges)?;
        Ok(Self {
            run_id,
            overrides,
            dag: RwLock::new(dag),
            machine,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Dag> {
        match self.dag.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Dag> {
        match self.dag.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn snapshot(&self) -> Dag {
        self.read().clone()
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.read().node(id).cloned()
    }

    pub fn topological_order(&self) -> Result<Vec<String>> {
        self.read().topological_order()
    }

    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>> {
        self.read().execution_levels()
    }

    pub fn detect_cycles(&self) -> Option<Vec<String>> {
        self.read().detect_cycles()
    }

    pub fn ready_nodes(&self) -> Vec<Node> {
        self.read().ready_nodes().into_iter().cloned().collect()
    }

    pub fn downstream_of(&self, id: &str) -> BTreeSet<String> {
        self.read().downstream_of(id)
    }

    /// Insert `steps` after `parent_id`, chained in order.
    pub fn add_step_nodes(&self, parent_id: &str, steps: &[StepSpec]) -> Result<Vec<String>> {
        let ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
        self.add_step_graph(parent_id, steps, &DependencyGraph::sequential(&ids))
    }

    /// Insert `steps` after `parent_id`, wired by `graph`.
    ///
    /// Graph roots hang off the parent; graph sinks take over the parent's
    /// former successors. A terminator is appended when the DAG lacks one.
    /// The mutation is applied to a copy and committed only if acyclic.
    pub fn add_step_graph(
        &self,
        parent_id: &str,
        steps: &[StepSpec],
        graph: &DependencyGraph,
    ) -> Result<Vec<String>> {
        if steps.is_empty() {
            return Ok(Vec::new());
        }
        let mut dag = self.write();
        if !dag.contains(parent_id) {
            return Err(WeftError::NotFound(format!("parent node '{}'", parent_id)));
        }

        let mut trial = dag.clone();
        let former: Vec<String> = trial
            .successors(parent_id)
            .into_iter()
            .map(String::from)
            .collect();
        for succ in &former {
            trial.remove_edge(parent_id, succ);
        }

        let mut added = Vec::with_capacity(steps.len() + 1);
        for step in steps {
            let mut node = Node::new(step.id.clone(), NodeType::Step);
            if !step.description.is_empty() {
                node.label = step.description.clone();
            }
            node.metadata = step.metadata.clone();
            self.overrides.apply_to(&mut node);
            trial.add_node(node)?;
            added.push(step.id.clone());
        }

        for edge in graph.edges() {
            trial.add_edge(&edge.from, &edge.to)?;
        }
        let roots: Vec<&String> = added
            .iter()
            .filter(|id| !graph.edges().iter().any(|e| &e.to == *id))
            .collect();
        let sinks: Vec<&String> = added
            .iter()
            .filter(|id| !graph.edges().iter().any(|e| &e.from == *id))
            .collect();
        for root in &roots {
            trial.add_edge(parent_id, root)?;
        }
        for sink in &sinks {
            for succ in &former {
                trial.add_edge(sink, succ)?;
            }
        }

        if !trial.nodes.iter().any(|n| n.node_type == NodeType::Terminator) {
            let mut terminator =
                Node::new(TERMINATOR_ID, NodeType::Terminator).with_label("Finalize");
            self.overrides.apply_to(&mut terminator);
            trial.add_node(terminator)?;
            for sink in &sinks {
                trial.add_edge(sink, TERMINATOR_ID)?;
            }
            added.push(TERMINATOR_ID.to_string());
        }

        if let Some(cycle) = trial.detect_cycles() {
            return Err(WeftError::CycleDetected(cycle.join(" -> ")));
        }
        trial.renumber_steps()?;

        self.machine
            .store()
            .save_dag(&self.run_id, &trial.nodes, &trial.edges)?;
        *dag = trial;
        drop(dag);

        info!(run_id = %self.run_id, parent = parent_id, added = added.len(), "Steps added to DAG");
        self.publish_update(added.clone());
        Ok(added)
    }

    /// Add a single dependency edge between existing nodes.
    pub fn add_dependency(&self, from: &str, to: &str) -> Result<()> {
        let mut dag = self.write();
        let mut trial = dag.clone();
        trial.add_edge(from, to)?;
        if let Some(cycle) = trial.detect_cycles() {
            return Err(WeftError::CycleDetected(cycle.join(" -> ")));
        }
        trial.renumber_steps()?;
        self.machine
            .store()
            .save_dag(&self.run_id, &trial.nodes, &trial.edges)?;
        *dag = trial;
        drop(dag);
        self.publish_update(Vec::new());
        Ok(())
    }

    /// Validated status change. Returns `false` when the node already has
    /// `status` (no history is written).
    pub fn update_node_status(
        &self,
        node_id: &str,
        status: NodeStatus,
        reason: &str,
        actor: &str,
    ) -> Result<bool> {
        let mut dag = self.write();
        let current = dag
            .node(node_id)
            .map(|n| n.status)
            .ok_or_else(|| WeftError::NotFound(format!("node '{}'", node_id)))?;
        if current == status {
            debug!(run_id = %self.run_id, node_id, status = %status, "Status unchanged");
            return Ok(false);
        }
        if status == NodeStatus::Running {
            let unmet: Vec<&str> = dag
                .predecessors(node_id)
                .into_iter()
                .filter(|p| !dag.node(p).is_some_and(|n| n.status.satisfies_dependency()))
                .collect();
            if !unmet.is_empty() {
                return Err(WeftError::InvalidTransition {
                    entity_id: EntityRef::node(&self.run_id, node_id).to_string(),
                    from: current.to_string(),
                    to: status.to_string(),
                    reason: format!("dependencies unmet: {}", unmet.join(", ")),
                });
            }
        }

        let transition =
            self.machine
                .transition_node(&self.run_id, node_id, status, reason, actor)?;
        if let Some(node) = dag.node_mut(node_id) {
            node.status = status;
        }
        drop(dag);

        self.machine
            .event_bus()
            .publish(WorkflowEvent::NodeStatusChanged {
                run_id: self.run_id.clone(),
                node_id: node_id.to_string(),
                from: current.to_string(),
                to: status.to_string(),
                timestamp: transition.timestamp,
            });
        Ok(true)
    }

    /// Merge a metadata value into a node and persist it.
    pub fn set_node_metadata(&self, node_id: &str, key: &str, value: Value) -> Result<()> {
        let mut dag = self.write();
        let node = dag
            .node_mut(node_id)
            .ok_or_else(|| WeftError::NotFound(format!("node '{}'", node_id)))?;
        node.metadata.insert(key.to_string(), value);
        let node = node.clone();
        self.machine.store().save_dag(&self.run_id, &[node], &dag.edges)
    }

    fn publish_update(&self, added_nodes: Vec<String>) {
        let (node_count, edge_count) = {
            let dag = self.read();
            (dag.nodes.len(), dag.edges.len())
        };
        self.machine
            .event_bus()
            .publish(WorkflowEvent::DagUpdated {
                run_id: self.run_id.clone(),
                added_nodes,
                node_count,
                edge_count,
                timestamp: Utc::now(),
            });
    }
}
