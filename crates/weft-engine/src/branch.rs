use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use weft_core::context::ExecutionContext;
use weft_core::error::{Result, WeftError};
use weft_core::traits::RunStore;
use weft_core::types::{Branch, CheckpointKind, NodeStatus, Run, RunId, RunState};

use crate::checkpoint::CheckpointStore;
use crate::dag::Dag;
use crate::workspace::copy_tree;

/// Parameters for forking a run at a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchRequest {
    pub parent_run_id: RunId,
    pub branch_point: String,
    pub name: String,
    #[serde(default)]
    pub hypothesis: String,
    #[serde(default)]
    pub modifications: Map<String, Value>,
}

/// Per-node difference between two runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDiff {
    pub node_id: String,
    pub status_a: Option<NodeStatus>,
    pub status_b: Option<NodeStatus>,
    /// Both runs have an output for the node and the outputs differ.
    pub output_differs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchComparison {
    pub run_a: RunId,
    pub run_b: RunId,
    pub state_a: RunState,
    pub state_b: RunState,
    pub diffs: Vec<NodeDiff>,
    pub identical: usize,
}

/// Forks runs at a node into isolated branch runs.
pub struct BranchManager {
    store: Arc<dyn RunStore>,
    checkpoints: Arc<CheckpointStore>,
    runs_dir: PathBuf,
}

impl BranchManager {
    pub fn new(store: Arc<dyn RunStore>, checkpoints: Arc<CheckpointStore>, runs_dir: PathBuf) -> Self {
        Self {
            store,
            checkpoints,
            runs_dir,
        }
    }

    /// Create a branch run of `req.parent_run_id` at `req.branch_point`.
    ///
    /// Nodes outside the branch point's downstream set keep settled
    /// statuses (anything in flight is reset); downstream nodes start
    /// pending. The branch gets a copy of the parent's working directory and
    /// checkpoints before the branch point, plus a `branch_seed` checkpoint
    /// carrying the modified context.
    pub fn create_branch(&self, req: &BranchRequest) -> Result<RunId> {
        if req.name.trim().is_empty() {
            return Err(WeftError::Validation("branch name is empty".into()));
        }
        let parent = self.store.get_run(&req.parent_run_id)?;
        let dag = Dag::from_parts(
            self.store.load_nodes(&parent.id)?,
            self.store.load_edges(&parent.id)?,
        )?;
        let branch_step = dag
            .node(&req.branch_point)
            .map(|n| n.step_number)
            .ok_or_else(|| {
                WeftError::NotFound(format!("node {} in run {}", req.branch_point, parent.id))
            })?;
        let downstream = dag.downstream_of(&req.branch_point);

        let mut run = Run::new(parent.mode.clone(), parent.task.clone(), PathBuf::new());
        run.work_dir = self.runs_dir.join(run.id.as_str());
        run.parent_run_id = Some(parent.id.clone());
        run.branch_point = Some(req.branch_point.clone());
        run.has_plan = parent.has_plan;

        let mut nodes = dag.nodes.clone();
        for node in &mut nodes {
            if downstream.contains(&node.id) || !node.status.is_settled() {
                node.status = NodeStatus::Pending;
            }
        }

        self.store.insert_run(&run)?;
        let seeded = self.seed(&parent, &run, &nodes, &dag, &downstream, branch_step, req);
        if let Err(e) = seeded {
            warn!(parent = %parent.id, branch = %run.id, error = %e, "Branch creation failed, removing partial run");
            if let Err(cleanup) = self.store.delete_run(&run.id) {
                warn!(branch = %run.id, error = %cleanup, "Failed to remove partial branch");
            }
            if let Err(cleanup) = self.checkpoints.discard_snapshots(&run.id) {
                warn!(branch = %run.id, error = %cleanup, "Failed to remove branch snapshots");
            }
            if run.work_dir.exists() {
                if let Err(cleanup) = std::fs::remove_dir_all(&run.work_dir) {
                    warn!(branch = %run.id, error = %cleanup, "Failed to remove branch work dir");
                }
            }
            return Err(e);
        }

        info!(
            parent = %parent.id,
            branch = %run.id,
            branch_point = %req.branch_point,
            reset = downstream.len(),
            "Branch created"
        );
        Ok(run.id)
    }

    #[allow(clippy::too_many_arguments)]
    fn seed(
        &self,
        parent: &Run,
        run: &Run,
        nodes: &[weft_core::types::Node],
        dag: &Dag,
        downstream: &BTreeSet<String>,
        branch_step: u32,
        req: &BranchRequest,
    ) -> Result<()> {
        self.store.save_dag(&run.id, nodes, &dag.edges)?;

        if parent.work_dir.is_dir() {
            copy_tree(&parent.work_dir, &run.work_dir)?;
        } else {
            std::fs::create_dir_all(&run.work_dir)?;
        }

        if branch_step > 1 {
            self.checkpoints
                .copy_until(&parent.id, &run.id, branch_step - 1)?;
        }

        let mut context = match self.checkpoints.load(&parent.id, None) {
            Ok(ctx) => ctx,
            Err(WeftError::NotFound(_)) => ExecutionContext::new(run.id.clone(), &run.task)?,
            Err(e) => return Err(e),
        };
        context.run_id = run.id.clone();
        let reset: Vec<String> = downstream.iter().cloned().collect();
        context.forget_nodes(&reset);
        context.apply_modifications(&req.modifications)?;
        context.step_number = branch_step;
        self.checkpoints.save(
            &run.id,
            branch_step,
            Some(&req.branch_point),
            CheckpointKind::BranchSeed,
            &context,
        )?;

        self.store.insert_branch(&Branch {
            run_id: run.id.clone(),
            parent_run_id: parent.id.clone(),
            branch_point: req.branch_point.clone(),
            name: req.name.clone(),
            hypothesis: req.hypothesis.clone(),
            modifications: req.modifications.clone(),
            created_at: Utc::now(),
        })
    }

    pub fn list_branches(&self, parent_run_id: &RunId) -> Result<Vec<Branch>> {
        self.store.list_branches(parent_run_id)
    }

    /// Node-by-node status and output comparison of two runs.
    pub fn compare_branches(&self, a: &RunId, b: &RunId) -> Result<BranchComparison> {
        let run_a = self.store.get_run(a)?;
        let run_b = self.store.get_run(b)?;
        let nodes_a = self.store.load_nodes(a)?;
        let nodes_b = self.store.load_nodes(b)?;
        let outputs_a = self.checkpoints.load(a, None).map(|c| c.outputs).unwrap_or_default();
        let outputs_b = self.checkpoints.load(b, None).map(|c| c.outputs).unwrap_or_default();

        let ids: BTreeSet<&str> = nodes_a
            .iter()
            .chain(nodes_b.iter())
            .map(|n| n.id.as_str())
            .collect();

        let mut diffs = Vec::new();
        let mut identical = 0;
        for id in ids {
            let status_a = nodes_a.iter().find(|n| n.id == id).map(|n| n.status);
            let status_b = nodes_b.iter().find(|n| n.id == id).map(|n| n.status);
            let output_differs = match (outputs_a.get(id), outputs_b.get(id)) {
                (Some(x), Some(y)) => x != y,
                _ => false,
            };
            if status_a == status_b && !output_differs {
                identical += 1;
            } else {
                diffs.push(NodeDiff {
                    node_id: id.to_string(),
                    status_a,
                    status_b,
                    output_differs,
                });
            }
        }

        Ok(BranchComparison {
            run_a: run_a.id,
            run_b: run_b.id,
            state_a: run_a.state,
            state_b: run_b.state,
            diffs,
            identical,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::event::EventBus;
    use weft_test_utils::{insert_chain_run, TestEnv};

    struct Fixture {
        env: TestEnv,
        checkpoints: Arc<CheckpointStore>,
        branches: BranchManager,
        parent: Run,
    }

    fn fixture() -> Fixture {
        let env = TestEnv::new();
        let checkpoints = Arc::new(CheckpointStore::new(
            env.store.clone(),
            env.config.checkpoint_dir(),
            Arc::new(EventBus::default()),
        ));
        let branches = BranchManager::new(env.store.clone(), checkpoints.clone(), env.config.runs_dir());
        let parent = insert_chain_run(env.store.as_ref(), env.path(), 4, 2);
        std::fs::write(parent.work_dir.join("notes.md"), "parent notes").unwrap();

        let mut ctx = ExecutionContext::new(parent.id.clone(), "chain task").unwrap();
        for step in 1..=2u32 {
            ctx.record_output(&format!("step_{}", step), step, json!(step));
            checkpoints
                .save(&parent.id, step, Some(&format!("step_{}", step)), CheckpointKind::Step, &ctx)
                .unwrap();
        }
        Fixture {
            env,
            checkpoints,
            branches,
            parent,
        }
    }

    fn request(parent: &RunId, modifications: Map<String, Value>) -> BranchRequest {
        BranchRequest {
            parent_run_id: parent.clone(),
            branch_point: "step_2".into(),
            name: "lower-lr".into(),
            hypothesis: "a smaller learning rate converges".into(),
            modifications,
        }
    }

    #[test]
    fn branch_preserves_prefix_and_resets_downstream() {
        let f = fixture();
        let mut mods = Map::new();
        mods.insert("learning_rate".into(), json!(0.001));
        let branch_id = f.branches.create_branch(&request(&f.parent.id, mods)).unwrap();

        let run = f.env.store.get_run(&branch_id).unwrap();
        assert_eq!(run.parent_run_id.as_ref(), Some(&f.parent.id));
        assert_eq!(run.state, RunState::Draft);
        assert_ne!(run.work_dir, f.parent.work_dir);
        assert_eq!(
            std::fs::read_to_string(run.work_dir.join("notes.md")).unwrap(),
            "parent notes"
        );

        let statuses: Vec<(String, NodeStatus)> = f
            .env
            .store
            .load_nodes(&branch_id)
            .unwrap()
            .into_iter()
            .map(|n| (n.id, n.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("step_1".to_string(), NodeStatus::Completed),
                ("step_2".to_string(), NodeStatus::Completed),
                ("step_3".to_string(), NodeStatus::Pending),
                ("step_4".to_string(), NodeStatus::Pending),
            ]
        );

        let seed = f.checkpoints.load(&branch_id, Some(2)).unwrap();
        assert_eq!(seed.run_id, branch_id);
        assert_eq!(seed.variables["learning_rate"], json!(0.001));
        assert_eq!(seed.outputs.len(), 2);
        let records = f.checkpoints.list(&branch_id).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].kind, CheckpointKind::BranchSeed);

        let listed = f.branches.list_branches(&f.parent.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "lower-lr");
    }

    #[test]
    fn branch_leaves_parent_untouched() {
        let f = fixture();
        let branch_id = f
            .branches
            .create_branch(&request(&f.parent.id, Map::new()))
            .unwrap();
        std::fs::write(
            f.env.store.get_run(&branch_id).unwrap().work_dir.join("notes.md"),
            "branch notes",
        )
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(f.parent.work_dir.join("notes.md")).unwrap(),
            "parent notes"
        );
        assert_eq!(f.checkpoints.list(&f.parent.id).unwrap().len(), 2);
        assert_eq!(
            f.checkpoints.load(&f.parent.id, Some(2)).unwrap().run_id,
            f.parent.id
        );
    }

    #[test]
    fn unknown_branch_point_is_rejected() {
        let f = fixture();
        let mut req = request(&f.parent.id, Map::new());
        req.branch_point = "ghost".into();
        assert!(matches!(
            f.branches.create_branch(&req),
            Err(WeftError::NotFound(_))
        ));
        assert!(f.branches.list_branches(&f.parent.id).unwrap().is_empty());
    }

    #[test]
    fn invalid_modification_rolls_back() {
        let f = fixture();
        let mut mods = Map::new();
        mods.insert("task".into(), json!(42));
        assert!(f.branches.create_branch(&request(&f.parent.id, mods)).is_err());
        assert!(f.branches.list_branches(&f.parent.id).unwrap().is_empty());
        assert_eq!(f.env.store.list_runs(10).unwrap().len(), 1);
        let runs_dir = f.env.config.runs_dir();
        assert_eq!(std::fs::read_dir(runs_dir).unwrap().count(), 1);
    }

    #[test]
    fn compare_reports_status_differences() {
        let f = fixture();
        let branch_id = f
            .branches
            .create_branch(&request(&f.parent.id, Map::new()))
            .unwrap();
        let same = f.branches.compare_branches(&f.parent.id, &branch_id).unwrap();
        assert!(same.diffs.is_empty());
        assert_eq!(same.identical, 4);

        let mut nodes = f.env.store.load_nodes(&branch_id).unwrap();
        nodes[2].status = NodeStatus::Completed;
        f.env.store.save_dag(&branch_id, &nodes, &f.env.store.load_edges(&branch_id).unwrap()).unwrap();

        let cmp = f.branches.compare_branches(&f.parent.id, &branch_id).unwrap();
        assert_eq!(cmp.diffs.len(), 1);
        assert_eq!(cmp.diffs[0].node_id, "step_3");
        assert_eq!(cmp.diffs[0].status_b, Some(NodeStatus::Completed));
    }
}
