use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_core::config::CheckpointConfig;
use weft_core::context::ExecutionContext;
use weft_core::error::{Result, WeftError};
use weft_core::event::{EventBus, WorkflowEvent};
use weft_core::traits::RunStore;
use weft_core::types::{CheckpointKind, CheckpointRecord, Node, RunId};

const SUPERSEDED_DIR: &str = "superseded";

/// Full-fidelity snapshot file, one per (run, step).
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    id: String,
    step_number: u32,
    #[serde(default)]
    node_id: Option<String>,
    kind: CheckpointKind,
    created_at: DateTime<Utc>,
    context: ExecutionContext,
}

/// Dual-write checkpoint store.
///
/// The structured subset of each context goes to the run store, the full
/// context (artifacts included) to a snapshot file under
/// `<dir>/<run_id>/`. The two writes are independent; a checkpoint only
/// fails when both do. Checkpoints are write-once per (run, step) until
/// superseded by a replay, which retires them without deleting them.
pub struct CheckpointStore {
    store: Arc<dyn RunStore>,
    dir: PathBuf,
    event_bus: Arc<EventBus>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn RunStore>, dir: PathBuf, event_bus: Arc<EventBus>) -> Self {
        Self {
            store,
            dir,
            event_bus,
        }
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(run_id.as_str())
    }

    fn snapshot_path(&self, run_id: &RunId, step_number: u32) -> PathBuf {
        self.run_dir(run_id)
            .join(format!("step_{:06}.json", step_number))
    }

    /// Persist `context` as the checkpoint for `step_number`.
    ///
    /// Returns the new checkpoint id, or `None` when the step already has a
    /// live checkpoint, in which case nothing is written.
    pub fn save(
        &self,
        run_id: &RunId,
        step_number: u32,
        node_id: Option<&str>,
        kind: CheckpointKind,
        context: &ExecutionContext,
    ) -> Result<Option<String>> {
        if let Ok(Some(_)) = self.store.get_checkpoint(run_id, Some(step_number)) {
            debug!(run_id = %run_id, step = step_number, "Checkpoint exists, keeping original");
            return Ok(None);
        }

        let record = CheckpointRecord {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.clone(),
            step_number,
            node_id: node_id.map(String::from),
            kind,
            context: context.structured()?,
            created_at: Utc::now(),
        };

        let structured = match self.store.insert_checkpoint(&record) {
            Ok(true) => Ok(()),
            Ok(false) => {
                // Lost a race with another writer for the same key.
                debug!(run_id = %run_id, step = step_number, "Checkpoint written concurrently");
                return Ok(None);
            }
            Err(e) => {
                warn!(run_id = %run_id, step = step_number, error = %e, "Structured checkpoint write failed");
                Err(e)
            }
        };

        let snapshot = Snapshot {
            id: record.id.clone(),
            step_number,
            node_id: record.node_id.clone(),
            kind,
            created_at: record.created_at,
            context: context.clone(),
        };
        let file = self.write_snapshot(run_id, &snapshot);
        if let Err(e) = &file {
            warn!(run_id = %run_id, step = step_number, error = %e, "Snapshot checkpoint write failed");
        }

        if let (Err(a), Err(b)) = (&structured, &file) {
            return Err(WeftError::TrackingDegraded(format!(
                "checkpoint {} of run {} not persisted: {}; {}",
                step_number, run_id, a, b
            )));
        }

        info!(run_id = %run_id, step = step_number, kind = kind.as_str(), "Checkpoint saved");
        self.event_bus.publish(WorkflowEvent::CheckpointSaved {
            run_id: run_id.clone(),
            checkpoint_id: record.id.clone(),
            step_number,
            kind,
            timestamp: record.created_at,
        });
        Ok(Some(record.id))
    }

    fn write_snapshot(&self, run_id: &RunId, snapshot: &Snapshot) -> Result<()> {
        std::fs::create_dir_all(self.run_dir(run_id))?;
        let path = self.snapshot_path(run_id, snapshot.step_number);
        let bytes = serde_json::to_vec(snapshot)?;
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    fn read_snapshot(&self, run_id: &RunId, step_number: u32) -> Result<Snapshot> {
        let raw = std::fs::read(self.snapshot_path(run_id, step_number))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Steps with a snapshot file on disk.
    fn snapshot_steps(&self, run_id: &RunId) -> BTreeSet<u32> {
        let Ok(entries) = std::fs::read_dir(self.run_dir(run_id)) else {
            return BTreeSet::new();
        };
        entries
            .flatten()
            .filter_map(|e| parse_step(&e.path()))
            .collect()
    }

    /// Every step that has a checkpoint in either location.
    pub fn known_steps(&self, run_id: &RunId) -> BTreeSet<u32> {
        let mut steps = self.snapshot_steps(run_id);
        match self.store.list_checkpoints(run_id) {
            Ok(records) => steps.extend(records.iter().map(|r| r.step_number)),
            Err(e) => warn!(run_id = %run_id, error = %e, "Listing structured checkpoints failed"),
        }
        steps
    }

    /// Load the context saved at `step_number`, or the latest when `None`.
    /// Prefers the snapshot file and falls back to the structured form.
    pub fn load(&self, run_id: &RunId, step_number: Option<u32>) -> Result<ExecutionContext> {
        let step = match step_number {
            Some(step) => step,
            None => *self
                .known_steps(run_id)
                .iter()
                .next_back()
                .ok_or_else(|| WeftError::NotFound(format!("checkpoints for run {}", run_id)))?,
        };

        match self.read_snapshot(run_id, step) {
            Ok(snapshot) => return Ok(snapshot.context),
            Err(WeftError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(run_id = %run_id, step, error = %e, "Snapshot unreadable, using structured checkpoint");
            }
        }

        let record = self
            .store
            .get_checkpoint(run_id, Some(step))?
            .ok_or_else(|| {
                WeftError::NotFound(format!("checkpoint {} of run {}", step, run_id))
            })?;
        ExecutionContext::from_structured(record.context)
    }

    /// Nearest checkpoint strictly before `node_id`'s step.
    pub fn load_latest_before(&self, run_id: &RunId, node_id: &str) -> Result<(u32, ExecutionContext)> {
        let node_step = self
            .store
            .load_nodes(run_id)?
            .into_iter()
            .find(|n| n.id == node_id)
            .map(|n| n.step_number)
            .ok_or_else(|| WeftError::NotFound(format!("node {} in run {}", node_id, run_id)))?;

        let step = self
            .known_steps(run_id)
            .range(..node_step)
            .next_back()
            .copied()
            .ok_or_else(|| WeftError::NoCheckpointAvailable {
                run_id: run_id.to_string(),
                node_id: node_id.to_string(),
            })?;
        Ok((step, self.load(run_id, Some(step))?))
    }

    pub fn list(&self, run_id: &RunId) -> Result<Vec<CheckpointRecord>> {
        self.store.list_checkpoints(run_id)
    }

    /// Keep only the newest `keep_last` checkpoint steps of a run. Steps
    /// are counted across both locations, so a step present on one side
    /// only still takes a slot. Returns the number of steps removed.
    pub fn prune(&self, run_id: &RunId, keep_last: usize) -> Result<usize> {
        let steps: Vec<u32> = self.known_steps(run_id).into_iter().collect();
        let excess = steps.len().saturating_sub(keep_last);
        if excess == 0 {
            return Ok(0);
        }
        let doomed = &steps[..excess];

        self.store.prune_checkpoints(run_id, doomed)?;
        for step in doomed {
            match std::fs::remove_file(self.snapshot_path(run_id, *step)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(run_id = %run_id, step, error = %e, "Failed to remove snapshot"),
            }
        }

        info!(run_id = %run_id, removed = excess, keep_last, "Checkpoints pruned");
        Ok(excess)
    }

    /// Retire every checkpoint at or after `from_step` so the steps can be
    /// written again by a replay. Snapshot files move to a `superseded/`
    /// folder and rows are marked in the run store. Returns the number of
    /// steps retired.
    pub fn supersede_from(&self, run_id: &RunId, from_step: u32) -> Result<usize> {
        let steps: Vec<u32> = self.known_steps(run_id).range(from_step..).copied().collect();
        if steps.is_empty() {
            return Ok(0);
        }

        // Files first: a live snapshot would shadow the replay's rows.
        let archive = self.run_dir(run_id).join(SUPERSEDED_DIR);
        for step in &steps {
            let path = self.snapshot_path(run_id, *step);
            if !path.exists() {
                continue;
            }
            std::fs::create_dir_all(&archive)?;
            let target = archive.join(format!("step_{:06}.{}.json", step, Uuid::new_v4().simple()));
            std::fs::rename(&path, &target)?;
        }
        let rows = self.store.supersede_checkpoints(run_id, from_step)?;

        info!(
            run_id = %run_id,
            from_step,
            steps = steps.len(),
            rows = rows.len(),
            "Checkpoints superseded"
        );
        Ok(steps.len())
    }

    /// Remove every snapshot file of a run. Structured rows go with the run.
    pub fn discard_snapshots(&self, run_id: &RunId) -> Result<()> {
        match std::fs::remove_dir_all(self.run_dir(run_id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Copy checkpoints of `from` up to and including `max_step` into `to`.
    pub fn copy_until(&self, from: &RunId, to: &RunId, max_step: u32) -> Result<usize> {
        let records = self.store.list_checkpoints(from).unwrap_or_default();
        let mut copied = 0;
        for step in self.known_steps(from).range(..=max_step) {
            let mut context = self.load(from, Some(*step))?;
            context.run_id = to.clone();
            let (node_id, kind) = records
                .iter()
                .find(|r| r.step_number == *step)
                .map(|r| (r.node_id.clone(), r.kind))
                .unwrap_or((None, CheckpointKind::Manual));
            if self.save(to, *step, node_id.as_deref(), kind, &context)?.is_some() {
                copied += 1;
            }
        }
        Ok(copied)
    }
}

fn parse_step(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("step_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Decides when the orchestrator takes checkpoints.
pub struct CheckpointPolicy {
    config: CheckpointConfig,
    last_saved: Mutex<Instant>,
}

impl CheckpointPolicy {
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            last_saved: Mutex::new(Instant::now()),
        }
    }

    fn elapsed(&self) -> Duration {
        match self.last_saved.lock() {
            Ok(t) => t.elapsed(),
            Err(poisoned) => poisoned.into_inner().elapsed(),
        }
    }

    /// Checkpoint kind to take after `node` completed, if any.
    pub fn after_node(&self, _node: &Node) -> Option<CheckpointKind> {
        if !self.config.enabled {
            return None;
        }
        if self.config.per_step {
            return Some(CheckpointKind::Step);
        }
        match self.config.interval_secs {
            Some(secs) if self.elapsed() >= Duration::from_secs(secs) => {
                Some(CheckpointKind::Interval)
            }
            _ => None,
        }
    }

    /// Whether to checkpoint before `node` starts.
    pub fn before_node(&self, node: &Node) -> bool {
        self.config.enabled && self.config.before_risky && node.flag("risky")
    }

    pub fn on_pause(&self) -> bool {
        self.config.enabled && self.config.on_pause
    }

    pub fn mark_saved(&self) {
        match self.last_saved.lock() {
            Ok(mut t) => *t = Instant::now(),
            Err(poisoned) => *poisoned.into_inner() = Instant::now(),
        }
    }

    pub fn keep_last(&self) -> Option<usize> {
        self.config.keep_last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use weft_core::types::{NodeType, Run};
    use weft_store::SqliteStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        checkpoints: CheckpointStore,
        run_id: RunId,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let run = Run::new("one_shot", "task", PathBuf::from("/tmp/cp"));
        store.insert_run(&run).unwrap();
        let checkpoints = CheckpointStore::new(
            store.clone(),
            dir.path().join("checkpoints"),
            Arc::new(EventBus::default()),
        );
        Fixture {
            _dir: dir,
            store,
            checkpoints,
            run_id: run.id,
        }
    }

    fn context(run_id: &RunId, step: u32) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(run_id.clone(), "task").unwrap();
        ctx.record_output(&format!("step_{}", step), step, json!({"n": step}));
        ctx.artifacts.insert("blob".into(), vec![step as u8]);
        ctx
    }

    #[test]
    fn save_then_load_preserves_artifacts() {
        let f = fixture();
        let ctx = context(&f.run_id, 1);
        f.checkpoints
            .save(&f.run_id, 1, Some("step_1"), CheckpointKind::Step, &ctx)
            .unwrap();
        assert_eq!(f.checkpoints.load(&f.run_id, Some(1)).unwrap(), ctx);
        assert_eq!(f.checkpoints.load(&f.run_id, None).unwrap(), ctx);
    }

    #[test]
    fn checkpoints_are_write_once() {
        let f = fixture();
        let first = f
            .checkpoints
            .save(&f.run_id, 2, None, CheckpointKind::Step, &context(&f.run_id, 2))
            .unwrap();
        let second = f
            .checkpoints
            .save(&f.run_id, 2, None, CheckpointKind::Manual, &context(&f.run_id, 9))
            .unwrap();
        assert!(first.is_some());
        assert_eq!(second, None);
        let loaded = f.checkpoints.load(&f.run_id, Some(2)).unwrap();
        assert!(loaded.outputs.contains_key("step_2"));
    }

    #[test]
    fn corrupt_snapshot_falls_back_to_structured_form() {
        let f = fixture();
        let ctx = context(&f.run_id, 3);
        f.checkpoints
            .save(&f.run_id, 3, None, CheckpointKind::Step, &ctx)
            .unwrap();
        std::fs::write(f.checkpoints.snapshot_path(&f.run_id, 3), b"{not json").unwrap();

        let loaded = f.checkpoints.load(&f.run_id, Some(3)).unwrap();
        assert_eq!(loaded.outputs, ctx.outputs);
        assert!(loaded.artifacts.is_empty());
    }

    #[test]
    fn latest_before_uses_node_step() {
        let f = fixture();
        let nodes: Vec<Node> = (1..=4)
            .map(|i| {
                let mut n = Node::new(format!("step_{}", i), NodeType::Step);
                n.step_number = i;
                n
            })
            .collect();
        f.store.save_dag(&f.run_id, &nodes, &[]).unwrap();

        assert!(matches!(
            f.checkpoints.load_latest_before(&f.run_id, "step_3"),
            Err(WeftError::NoCheckpointAvailable { .. })
        ));

        f.checkpoints
            .save(&f.run_id, 2, Some("step_2"), CheckpointKind::Step, &context(&f.run_id, 2))
            .unwrap();
        let (step, ctx) = f
            .checkpoints
            .load_latest_before(&f.run_id, "step_3")
            .unwrap();
        assert_eq!(step, 2);
        assert!(ctx.outputs.contains_key("step_2"));
    }

    #[test]
    fn prune_keeps_newest() {
        let f = fixture();
        for step in 1..=4 {
            f.checkpoints
                .save(&f.run_id, step, None, CheckpointKind::Step, &context(&f.run_id, step))
                .unwrap();
        }
        assert_eq!(f.checkpoints.prune(&f.run_id, 2).unwrap(), 2);
        assert_eq!(
            f.checkpoints.known_steps(&f.run_id).into_iter().collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[test]
    fn prune_counts_steps_on_either_side() {
        let f = fixture();
        for step in 1..=3 {
            f.checkpoints
                .save(&f.run_id, step, None, CheckpointKind::Step, &context(&f.run_id, step))
                .unwrap();
        }
        // Step 4 only reached the snapshot side, step 5 only the store.
        f.checkpoints
            .write_snapshot(
                &f.run_id,
                &Snapshot {
                    id: "file-only".into(),
                    step_number: 4,
                    node_id: None,
                    kind: CheckpointKind::Step,
                    created_at: Utc::now(),
                    context: context(&f.run_id, 4),
                },
            )
            .unwrap();
        f.store
            .insert_checkpoint(&CheckpointRecord {
                id: "row-only".into(),
                run_id: f.run_id.clone(),
                step_number: 5,
                node_id: None,
                kind: CheckpointKind::Step,
                context: context(&f.run_id, 5).structured().unwrap(),
                created_at: Utc::now(),
            })
            .unwrap();

        assert_eq!(f.checkpoints.prune(&f.run_id, 2).unwrap(), 3);
        assert_eq!(
            f.checkpoints.known_steps(&f.run_id).into_iter().collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert_eq!(f.checkpoints.snapshot_steps(&f.run_id).into_iter().collect::<Vec<_>>(), vec![4]);
        let rows: Vec<u32> = f
            .store
            .list_checkpoints(&f.run_id)
            .unwrap()
            .iter()
            .map(|r| r.step_number)
            .collect();
        assert_eq!(rows, vec![5]);
    }

    #[test]
    fn superseded_steps_accept_new_checkpoints() {
        let f = fixture();
        for step in 1..=3 {
            f.checkpoints
                .save(&f.run_id, step, None, CheckpointKind::Step, &context(&f.run_id, step))
                .unwrap();
        }
        assert_eq!(f.checkpoints.supersede_from(&f.run_id, 2).unwrap(), 2);
        assert_eq!(
            f.checkpoints.known_steps(&f.run_id).into_iter().collect::<Vec<_>>(),
            vec![1]
        );

        let mut replayed = context(&f.run_id, 2);
        replayed.variables.insert("replay".into(), json!(true));
        assert!(f
            .checkpoints
            .save(&f.run_id, 2, None, CheckpointKind::Step, &replayed)
            .unwrap()
            .is_some());
        assert_eq!(f.checkpoints.load(&f.run_id, None).unwrap(), replayed);

        // The retired snapshots are archived, not deleted.
        let archived = std::fs::read_dir(f.checkpoints.run_dir(&f.run_id).join(SUPERSEDED_DIR))
            .unwrap()
            .count();
        assert_eq!(archived, 2);
    }

    #[test]
    fn copy_until_rekeys_into_target_run() {
        let f = fixture();
        let other = Run::new("one_shot", "task", PathBuf::from("/tmp/cp2"));
        f.store.insert_run(&other).unwrap();
        for step in 1..=3 {
            f.checkpoints
                .save(&f.run_id, step, None, CheckpointKind::Step, &context(&f.run_id, step))
                .unwrap();
        }
        assert_eq!(f.checkpoints.copy_until(&f.run_id, &other.id, 2).unwrap(), 2);
        let copied = f.checkpoints.load(&other.id, None).unwrap();
        assert_eq!(copied.run_id, other.id);
        assert!(copied.outputs.contains_key("step_2"));
        // Source untouched.
        assert_eq!(f.checkpoints.known_steps(&f.run_id).len(), 3);
    }

    #[test]
    fn policy_cadence() {
        let policy = CheckpointPolicy::new(CheckpointConfig::default());
        let risky = Node::new("n", NodeType::Step).with_metadata("risky", json!(true));
        assert_eq!(policy.after_node(&risky), Some(CheckpointKind::Step));
        assert!(policy.before_node(&risky));
        assert!(!policy.before_node(&Node::new("m", NodeType::Step)));

        let interval = CheckpointPolicy::new(CheckpointConfig {
            per_step: false,
            interval_secs: Some(0),
            ..Default::default()
        });
        assert_eq!(interval.after_node(&risky), Some(CheckpointKind::Interval));

        let off = CheckpointPolicy::new(CheckpointConfig {
            enabled: false,
            ..Default::default()
        });
        assert_eq!(off.after_node(&risky), None);
        assert!(!off.on_pause());
    }
}
