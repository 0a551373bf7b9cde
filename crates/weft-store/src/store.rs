use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::RunStore;
use weft_core::types::*;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        mode TEXT NOT NULL,
        task TEXT NOT NULL,
        state TEXT NOT NULL,
        work_dir TEXT NOT NULL,
        parent_run_id TEXT,
        branch_point TEXT,
        has_plan INTEGER NOT NULL DEFAULT 0,
        approval_granted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_parent ON runs(parent_run_id);

    CREATE TABLE IF NOT EXISTS nodes (
        run_id TEXT NOT NULL,
        id TEXT NOT NULL,
        node_type TEXT NOT NULL,
        label TEXT NOT NULL,
        status TEXT NOT NULL,
        step_number INTEGER NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (run_id, id)
    );

    CREATE TABLE IF NOT EXISTS edges (
        run_id TEXT NOT NULL,
        from_node TEXT NOT NULL,
        to_node TEXT NOT NULL,
        PRIMARY KEY (run_id, from_node, to_node)
    );

    CREATE TABLE IF NOT EXISTS state_transitions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        entity_kind TEXT NOT NULL,
        run_id TEXT NOT NULL,
        node_id TEXT NOT NULL DEFAULT '',
        from_state TEXT NOT NULL,
        to_state TEXT NOT NULL,
        reason TEXT NOT NULL,
        actor TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_transitions_entity
        ON state_transitions(entity_kind, run_id, node_id, seq);

    CREATE TABLE IF NOT EXISTS checkpoints (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL,
        step_number INTEGER NOT NULL,
        node_id TEXT,
        kind TEXT NOT NULL,
        context_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        superseded_at TEXT
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_checkpoints_live
        ON checkpoints(run_id, step_number) WHERE superseded_at IS NULL;

    CREATE TABLE IF NOT EXISTS retry_attempts (
        run_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        attempt_number INTEGER NOT NULL,
        error TEXT NOT NULL,
        category TEXT NOT NULL,
        outcome TEXT NOT NULL,
        backoff_secs INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        PRIMARY KEY (run_id, node_id, attempt_number)
    );

    CREATE TABLE IF NOT EXISTS branches (
        run_id TEXT PRIMARY KEY,
        parent_run_id TEXT NOT NULL,
        branch_point TEXT NOT NULL,
        name TEXT NOT NULL,
        hypothesis TEXT NOT NULL,
        modifications_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_branches_parent ON branches(parent_run_id);

    CREATE TABLE IF NOT EXISTS execution_events (
        run_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        parent_seq INTEGER,
        node_id TEXT,
        event_type TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        PRIMARY KEY (run_id, seq)
    );";

const RUN_COLUMNS: &str = "id, mode, task, state, work_dir, parent_run_id, branch_point, \
                           has_plan, approval_granted, created_at, updated_at";

const CHECKPOINT_COLUMNS: &str = "id, run_id, step_number, node_id, kind, context_json, created_at";

/// SQLite-backed run store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WeftError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db)?;

        // WAL for concurrent readers while a run writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;

        debug!(path = %path.display(), "SQLite run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))
    }
}

fn db(e: rusqlite::Error) -> WeftError {
    WeftError::Database(e.to_string())
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(WeftError::Database(msg)),
    )
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let state: String = row.get(3)?;
    let work_dir: String = row.get(4)?;
    let parent: Option<String> = row.get(5)?;
    Ok(Run {
        id: RunId(row.get(0)?),
        mode: row.get(1)?,
        task: row.get(2)?,
        state: RunState::parse(&state)
            .ok_or_else(|| bad_column(3, format!("unknown run state '{}'", state)))?,
        work_dir: PathBuf::from(work_dir),
        parent_run_id: parent.map(RunId),
        branch_point: row.get(6)?,
        has_plan: row.get(7)?,
        approval_granted: row.get(8)?,
        created_at: parse_ts(&row.get::<_, String>(9)?),
        updated_at: parse_ts(&row.get::<_, String>(10)?),
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let node_type: String = row.get(1)?;
    let status: String = row.get(3)?;
    let metadata: String = row.get(5)?;
    Ok(Node {
        id: row.get(0)?,
        node_type: NodeType::parse(&node_type),
        label: row.get(2)?,
        status: NodeStatus::parse(&status)
            .ok_or_else(|| bad_column(3, format!("unknown node status '{}'", status)))?,
        step_number: row.get::<_, i64>(4)? as u32,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<CheckpointRecord> {
    let kind: String = row.get(4)?;
    let context: String = row.get(5)?;
    Ok(CheckpointRecord {
        id: row.get(0)?,
        run_id: RunId(row.get(1)?),
        step_number: row.get::<_, i64>(2)? as u32,
        node_id: row.get(3)?,
        kind: CheckpointKind::parse(&kind),
        context: serde_json::from_str(&context)
            .map_err(|e| bad_column(5, format!("corrupt checkpoint context: {}", e)))?,
        created_at: parse_ts(&row.get::<_, String>(6)?),
    })
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<RetryAttempt> {
    let category: String = row.get(4)?;
    let outcome: String = row.get(5)?;
    Ok(RetryAttempt {
        run_id: RunId(row.get(0)?),
        node_id: row.get(1)?,
        attempt_number: row.get::<_, i64>(2)? as u32,
        error: row.get(3)?,
        category: ErrorCategory::parse(&category),
        outcome: if outcome == "succeeded" {
            AttemptOutcome::Succeeded
        } else {
            AttemptOutcome::Failed
        },
        backoff_secs: row.get::<_, i64>(6)? as u64,
        timestamp: parse_ts(&row.get::<_, String>(7)?),
    })
}

fn branch_from_row(row: &Row<'_>) -> rusqlite::Result<Branch> {
    let modifications: String = row.get(5)?;
    Ok(Branch {
        run_id: RunId(row.get(0)?),
        parent_run_id: RunId(row.get(1)?),
        branch_point: row.get(2)?,
        name: row.get(3)?,
        hypothesis: row.get(4)?,
        modifications: serde_json::from_str(&modifications).unwrap_or_default(),
        created_at: parse_ts(&row.get::<_, String>(6)?),
    })
}

fn insert_transition(conn: &Connection, t: &StateTransition) -> Result<()> {
    conn.execute(
        "INSERT INTO state_transitions
             (id, entity_kind, run_id, node_id, from_state, to_state, reason, actor, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            t.id,
            t.entity.kind().as_str(),
            t.entity.run_id().as_str(),
            t.entity.node_id().unwrap_or(""),
            t.from_state,
            t.to_state,
            t.reason,
            t.actor,
            t.timestamp.to_rfc3339(),
        ],
    )
    .map_err(db)?;
    Ok(())
}

fn stale_transition(t: &StateTransition, current: Option<String>) -> WeftError {
    match current {
        None => WeftError::NotFound(t.entity.to_string()),
        Some(actual) => WeftError::InvalidTransition {
            entity_id: t.entity.to_string(),
            from: actual,
            to: t.to_state.clone(),
            reason: format!("expected current state '{}'", t.from_state),
        },
    }
}

impl RunStore for SqliteStore {
    fn insert_run(&self, run: &Run) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                RUN_COLUMNS
            ),
            params![
                run.id.as_str(),
                run.mode,
                run.task,
                run.state.as_str(),
                run.work_dir.display().to_string(),
                run.parent_run_id.as_ref().map(|p| p.0.clone()),
                run.branch_point,
                run.has_plan,
                run.approval_granted,
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    fn get_run(&self, run_id: &RunId) -> Result<Run> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
            params![run_id.as_str()],
            run_from_row,
        )
        .optional()
        .map_err(db)?
        .ok_or_else(|| WeftError::NotFound(format!("run {}", run_id)))
    }

    fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM runs ORDER BY created_at DESC LIMIT ?1",
                RUN_COLUMNS
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![limit as i64], run_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn set_run_flags(&self, run_id: &RunId, has_plan: bool, approval_granted: bool) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE runs SET has_plan = ?1, approval_granted = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![
                    has_plan,
                    approval_granted,
                    Utc::now().to_rfc3339(),
                    run_id.as_str()
                ],
            )
            .map_err(db)?;
        if updated == 0 {
            return Err(WeftError::NotFound(format!("run {}", run_id)));
        }
        Ok(())
    }

    fn delete_run(&self, run_id: &RunId) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        for table in [
            "nodes",
            "edges",
            "state_transitions",
            "checkpoints",
            "retry_attempts",
            "branches",
            "execution_events",
        ] {
            tx.execute(
                &format!("DELETE FROM {} WHERE run_id = ?1", table),
                params![run_id.as_str()],
            )
            .map_err(db)?;
        }
        tx.execute("DELETE FROM runs WHERE id = ?1", params![run_id.as_str()])
            .map_err(db)?;
        tx.commit().map_err(db)?;
        Ok(())
    }

    fn apply_run_transition(&self, expected: RunState, t: &StateTransition) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let updated = tx
            .execute(
                "UPDATE runs SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
                params![
                    t.to_state,
                    t.timestamp.to_rfc3339(),
                    t.entity.run_id().as_str(),
                    expected.as_str()
                ],
            )
            .map_err(db)?;
        if updated == 0 {
            let current: Option<String> = tx
                .query_row(
                    "SELECT state FROM runs WHERE id = ?1",
                    params![t.entity.run_id().as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            return Err(stale_transition(t, current));
        }
        insert_transition(&tx, t)?;
        tx.commit().map_err(db)?;
        Ok(())
    }

    fn apply_node_transition(&self, expected: NodeStatus, t: &StateTransition) -> Result<()> {
        let node_id = t
            .entity
            .node_id()
            .ok_or_else(|| WeftError::Validation("node transition without node id".into()))?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let updated = tx
            .execute(
                "UPDATE nodes SET status = ?1 WHERE run_id = ?2 AND id = ?3 AND status = ?4",
                params![
                    t.to_state,
                    t.entity.run_id().as_str(),
                    node_id,
                    expected.as_str()
                ],
            )
            .map_err(db)?;
        if updated == 0 {
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM nodes WHERE run_id = ?1 AND id = ?2",
                    params![t.entity.run_id().as_str(), node_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            return Err(stale_transition(t, current));
        }
        insert_transition(&tx, t)?;
        tx.commit().map_err(db)?;
        Ok(())
    }

    fn transitions(&self, entity: &EntityRef) -> Result<Vec<StateTransition>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, from_state, to_state, reason, actor, timestamp
                 FROM state_transitions
                 WHERE entity_kind = ?1 AND run_id = ?2 AND node_id = ?3
                 ORDER BY seq ASC",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(
                params![
                    entity.kind().as_str(),
                    entity.run_id().as_str(),
                    entity.node_id().unwrap_or("")
                ],
                |row| {
                    Ok(StateTransition {
                        id: row.get(0)?,
                        entity: entity.clone(),
                        from_state: row.get(1)?,
                        to_state: row.get(2)?,
                        reason: row.get(3)?,
                        actor: row.get(4)?,
                        timestamp: parse_ts(&row.get::<_, String>(5)?),
                    })
                },
            )
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn save_dag(&self, run_id: &RunId, nodes: &[Node], edges: &[Edge]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        for node in nodes {
            tx.execute(
                "INSERT INTO nodes (run_id, id, node_type, label, status, step_number, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(run_id, id) DO UPDATE SET
                     node_type = excluded.node_type,
                     label = excluded.label,
                     status = excluded.status,
                     step_number = excluded.step_number,
                     metadata_json = excluded.metadata_json",
                params![
                    run_id.as_str(),
                    node.id,
                    node.node_type.as_str(),
                    node.label,
                    node.status.as_str(),
                    node.step_number as i64,
                    serde_json::to_string(&node.metadata)?,
                ],
            )
            .map_err(db)?;
        }
        tx.execute("DELETE FROM edges WHERE run_id = ?1", params![run_id.as_str()])
            .map_err(db)?;
        for edge in edges {
            tx.execute(
                "INSERT OR IGNORE INTO edges (run_id, from_node, to_node) VALUES (?1, ?2, ?3)",
                params![run_id.as_str(), edge.from, edge.to],
            )
            .map_err(db)?;
        }
        tx.commit().map_err(db)?;
        Ok(())
    }

    fn load_nodes(&self, run_id: &RunId) -> Result<Vec<Node>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, node_type, label, status, step_number, metadata_json
                 FROM nodes WHERE run_id = ?1 ORDER BY step_number ASC, id ASC",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![run_id.as_str()], node_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn load_edges(&self, run_id: &RunId) -> Result<Vec<Edge>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT from_node, to_node FROM edges WHERE run_id = ?1 ORDER BY rowid")
            .map_err(db)?;
        let rows = stmt
            .query_map(params![run_id.as_str()], |row| {
                Ok(Edge::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn insert_checkpoint(&self, record: &CheckpointRecord) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO checkpoints ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    CHECKPOINT_COLUMNS
                ),
                params![
                    record.id,
                    record.run_id.as_str(),
                    record.step_number as i64,
                    record.node_id,
                    record.kind.as_str(),
                    serde_json::to_string(&record.context)?,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(db)?;
        Ok(inserted == 1)
    }

    fn get_checkpoint(
        &self,
        run_id: &RunId,
        step_number: Option<u32>,
    ) -> Result<Option<CheckpointRecord>> {
        let conn = self.lock()?;
        let result = match step_number {
            Some(step) => conn.query_row(
                &format!(
                    "SELECT {} FROM checkpoints
                     WHERE run_id = ?1 AND step_number = ?2 AND superseded_at IS NULL",
                    CHECKPOINT_COLUMNS
                ),
                params![run_id.as_str(), step as i64],
                checkpoint_from_row,
            ),
            None => conn.query_row(
                &format!(
                    "SELECT {} FROM checkpoints WHERE run_id = ?1 AND superseded_at IS NULL
                     ORDER BY step_number DESC LIMIT 1",
                    CHECKPOINT_COLUMNS
                ),
                params![run_id.as_str()],
                checkpoint_from_row,
            ),
        };
        result.optional().map_err(db)
    }

    fn list_checkpoints(&self, run_id: &RunId) -> Result<Vec<CheckpointRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM checkpoints WHERE run_id = ?1 AND superseded_at IS NULL
                 ORDER BY step_number ASC",
                CHECKPOINT_COLUMNS
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![run_id.as_str()], checkpoint_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn prune_checkpoints(&self, run_id: &RunId, steps: &[u32]) -> Result<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let mut removed = Vec::new();
        for step in steps {
            let id: Option<String> = tx
                .query_row(
                    "SELECT id FROM checkpoints
                     WHERE run_id = ?1 AND step_number = ?2 AND superseded_at IS NULL",
                    params![run_id.as_str(), *step as i64],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            if let Some(id) = id {
                tx.execute("DELETE FROM checkpoints WHERE id = ?1", params![id])
                    .map_err(db)?;
                removed.push(id);
            }
        }
        tx.commit().map_err(db)?;
        Ok(removed)
    }

    fn supersede_checkpoints(&self, run_id: &RunId, from_step: u32) -> Result<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let retired: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM checkpoints
                     WHERE run_id = ?1 AND step_number >= ?2 AND superseded_at IS NULL",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map(params![run_id.as_str(), from_step as i64], |row| row.get(0))
                .map_err(db)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)?
        };
        let now = Utc::now().to_rfc3339();
        for id in &retired {
            tx.execute(
                "UPDATE checkpoints SET superseded_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .map_err(db)?;
        }
        tx.commit().map_err(db)?;
        Ok(retired)
    }

    fn record_retry_attempt(&self, attempt: &RetryAttempt) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let last: Option<i64> = tx
            .query_row(
                "SELECT MAX(attempt_number) FROM retry_attempts
                 WHERE run_id = ?1 AND node_id = ?2",
                params![attempt.run_id.as_str(), attempt.node_id],
                |row| row.get(0),
            )
            .map_err(db)?;

        let expected = last.map(|n| n as u32 + 1).unwrap_or(1);
        if attempt.attempt_number != expected {
            return Err(WeftError::Validation(format!(
                "attempt {} for node {} out of order (expected {})",
                attempt.attempt_number, attempt.node_id, expected
            )));
        }

        tx.execute(
            "INSERT INTO retry_attempts
                 (run_id, node_id, attempt_number, error, category, outcome, backoff_secs, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                attempt.run_id.as_str(),
                attempt.node_id,
                attempt.attempt_number as i64,
                attempt.error,
                attempt.category.as_str(),
                match attempt.outcome {
                    AttemptOutcome::Failed => "failed",
                    AttemptOutcome::Succeeded => "succeeded",
                },
                attempt.backoff_secs as i64,
                attempt.timestamp.to_rfc3339(),
            ],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;
        Ok(())
    }

    fn retry_attempts(&self, run_id: &RunId, node_id: &str) -> Result<Vec<RetryAttempt>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, node_id, attempt_number, error, category, outcome, backoff_secs, timestamp
                 FROM retry_attempts WHERE run_id = ?1 AND node_id = ?2
                 ORDER BY attempt_number ASC",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![run_id.as_str(), node_id], attempt_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn insert_branch(&self, branch: &Branch) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO branches
                 (run_id, parent_run_id, branch_point, name, hypothesis, modifications_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                branch.run_id.as_str(),
                branch.parent_run_id.as_str(),
                branch.branch_point,
                branch.name,
                branch.hypothesis,
                serde_json::to_string(&branch.modifications)?,
                branch.created_at.to_rfc3339(),
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    fn get_branch(&self, run_id: &RunId) -> Result<Option<Branch>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT run_id, parent_run_id, branch_point, name, hypothesis, modifications_json, created_at
             FROM branches WHERE run_id = ?1",
            params![run_id.as_str()],
            branch_from_row,
        )
        .optional()
        .map_err(db)
    }

    fn list_branches(&self, parent_run_id: &RunId) -> Result<Vec<Branch>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, parent_run_id, branch_point, name, hypothesis, modifications_json, created_at
                 FROM branches WHERE parent_run_id = ?1 ORDER BY created_at ASC",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![parent_run_id.as_str()], branch_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn append_event(&self, record: &ExecutionEventRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO execution_events
                 (run_id, seq, parent_seq, node_id, event_type, payload_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.run_id.as_str(),
                record.seq as i64,
                record.parent_seq.map(|s| s as i64),
                record.node_id,
                record.event_type,
                serde_json::to_string(&record.payload)?,
                record.timestamp.to_rfc3339(),
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    fn events(&self, run_id: &RunId) -> Result<Vec<ExecutionEventRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, seq, parent_seq, node_id, event_type, payload_json, timestamp
                 FROM execution_events WHERE run_id = ?1 ORDER BY seq ASC",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![run_id.as_str()], |row| {
                let payload: String = row.get(5)?;
                Ok(ExecutionEventRecord {
                    run_id: RunId(row.get(0)?),
                    seq: row.get::<_, i64>(1)? as u64,
                    parent_seq: row.get::<_, Option<i64>>(2)?.map(|s| s as u64),
                    node_id: row.get(3)?,
                    event_type: row.get(4)?,
                    payload: serde_json::from_str(&payload).unwrap_or_default(),
                    timestamp: parse_ts(&row.get::<_, String>(6)?),
                })
            })
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_run() -> (SqliteStore, Run) {
        let store = SqliteStore::in_memory().unwrap();
        let run = Run::new("one_shot", "test task", PathBuf::from("/tmp/weft-run"));
        store.insert_run(&run).unwrap();
        (store, run)
    }

    fn transition(entity: EntityRef, from: &str, to: &str) -> StateTransition {
        StateTransition {
            id: uuid::Uuid::new_v4().to_string(),
            entity,
            from_state: from.into(),
            to_state: to.into(),
            reason: "test".into(),
            actor: "tester".into(),
            timestamp: Utc::now(),
        }
    }

    fn checkpoint(run: &Run, step: u32) -> CheckpointRecord {
        CheckpointRecord {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            step_number: step,
            node_id: Some(format!("step_{}", step)),
            kind: CheckpointKind::Step,
            context: json!({"step": step}),
            created_at: Utc::now(),
        }
    }

    fn attempt(run: &Run, n: u32, outcome: AttemptOutcome) -> RetryAttempt {
        RetryAttempt {
            run_id: run.id.clone(),
            node_id: "step_1".into(),
            attempt_number: n,
            error: "connection reset".into(),
            category: ErrorCategory::Network,
            outcome,
            backoff_secs: 2,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_run_roundtrip() {
        let (store, run) = store_with_run();
        let loaded = store.get_run(&run.id).unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.state, RunState::Draft);
        assert_eq!(loaded.work_dir, run.work_dir);
        assert!(matches!(
            store.get_run(&RunId::from_str("missing")),
            Err(WeftError::NotFound(_))
        ));
    }

    #[test]
    fn test_run_transition_is_compare_and_swap() {
        let (store, run) = store_with_run();
        let entity = EntityRef::run(&run.id);

        store
            .apply_run_transition(RunState::Draft, &transition(entity.clone(), "draft", "executing"))
            .unwrap();
        assert_eq!(store.get_run(&run.id).unwrap().state, RunState::Executing);

        // Stale expectation: nothing is written.
        let err = store
            .apply_run_transition(RunState::Draft, &transition(entity.clone(), "draft", "paused"))
            .unwrap_err();
        assert!(matches!(err, WeftError::InvalidTransition { .. }));
        assert_eq!(store.transitions(&entity).unwrap().len(), 1);
    }

    #[test]
    fn test_node_transition_and_dag() {
        let (store, run) = store_with_run();
        let mut a = Node::new("a", NodeType::Init);
        a.step_number = 1;
        let mut b = Node::new("b", NodeType::Terminator).with_metadata("risky", json!(true));
        b.step_number = 2;
        store
            .save_dag(&run.id, &[a, b], &[Edge::new("a", "b")])
            .unwrap();

        let entity = EntityRef::node(&run.id, "a");
        store
            .apply_node_transition(NodeStatus::Pending, &transition(entity.clone(), "pending", "running"))
            .unwrap();

        let nodes = store.load_nodes(&run.id).unwrap();
        assert_eq!(nodes[0].status, NodeStatus::Running);
        assert!(nodes[1].flag("risky"));
        assert_eq!(store.load_edges(&run.id).unwrap(), vec![Edge::new("a", "b")]);
        assert_eq!(store.transitions(&entity).unwrap().len(), 1);
        assert!(store
            .transitions(&EntityRef::node(&run.id, "b"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_checkpoints_are_write_once() {
        let (store, run) = store_with_run();
        let first = checkpoint(&run, 2);
        assert!(store.insert_checkpoint(&first).unwrap());

        let mut second = checkpoint(&run, 2);
        second.context = json!({"overwritten": true});
        assert!(!store.insert_checkpoint(&second).unwrap());

        let loaded = store.get_checkpoint(&run.id, Some(2)).unwrap().unwrap();
        assert_eq!(loaded.id, first.id);
        assert_eq!(loaded.context, json!({"step": 2}));
    }

    #[test]
    fn test_superseded_checkpoints_are_kept_but_hidden() {
        let (store, run) = store_with_run();
        for step in 1..=3 {
            store.insert_checkpoint(&checkpoint(&run, step)).unwrap();
        }
        let retired = store.supersede_checkpoints(&run.id, 2).unwrap();
        assert_eq!(retired.len(), 2);
        assert!(store.get_checkpoint(&run.id, Some(2)).unwrap().is_none());
        assert_eq!(store.get_checkpoint(&run.id, None).unwrap().unwrap().step_number, 1);

        let mut replayed = checkpoint(&run, 2);
        replayed.context = json!({"replayed": true});
        assert!(store.insert_checkpoint(&replayed).unwrap());
        let loaded = store.get_checkpoint(&run.id, Some(2)).unwrap().unwrap();
        assert_eq!(loaded.id, replayed.id);
        assert_eq!(store.list_checkpoints(&run.id).unwrap().len(), 2);

        let total: i64 = store
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM checkpoints WHERE run_id = ?1",
                params![run.id.as_str()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(total, 4);
        // Retiring again leaves already-retired rows alone.
        assert_eq!(store.supersede_checkpoints(&run.id, 2).unwrap(), vec![replayed.id]);
    }

    #[test]
    fn test_latest_and_prune() {
        let (store, run) = store_with_run();
        for step in [1, 2, 4] {
            store.insert_checkpoint(&checkpoint(&run, step)).unwrap();
        }
        assert_eq!(store.get_checkpoint(&run.id, None).unwrap().unwrap().step_number, 4);

        let removed = store.prune_checkpoints(&run.id, &[1, 2, 3]).unwrap();
        assert_eq!(removed.len(), 2);
        let left = store.list_checkpoints(&run.id).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].step_number, 4);
    }

    #[test]
    fn test_retry_attempts_are_monotonic() {
        let (store, run) = store_with_run();
        store
            .record_retry_attempt(&attempt(&run, 1, AttemptOutcome::Failed))
            .unwrap();
        assert!(store
            .record_retry_attempt(&attempt(&run, 3, AttemptOutcome::Failed))
            .is_err());
        store
            .record_retry_attempt(&attempt(&run, 2, AttemptOutcome::Succeeded))
            .unwrap();
        assert!(store
            .record_retry_attempt(&attempt(&run, 2, AttemptOutcome::Failed))
            .is_err());

        let attempts = store.retry_attempts(&run.id, "step_1").unwrap();
        assert_eq!(
            attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(attempts[0].category, ErrorCategory::Network);
    }

    #[test]
    fn test_branches_and_cascade_delete() {
        let (store, parent) = store_with_run();
        let mut child = Run::new("one_shot", "test task", PathBuf::from("/tmp/weft-branch"));
        child.parent_run_id = Some(parent.id.clone());
        child.branch_point = Some("step_2".into());
        store.insert_run(&child).unwrap();
        store
            .insert_branch(&Branch {
                run_id: child.id.clone(),
                parent_run_id: parent.id.clone(),
                branch_point: "step_2".into(),
                name: "alt".into(),
                hypothesis: "smaller batch".into(),
                modifications: json!({"batch": 8}).as_object().unwrap().clone(),
                created_at: Utc::now(),
            })
            .unwrap();
        store.insert_checkpoint(&checkpoint(&child, 1)).unwrap();

        let branches = store.list_branches(&parent.id).unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].modifications["batch"], json!(8));

        store.delete_run(&child.id).unwrap();
        assert!(store.get_branch(&child.id).unwrap().is_none());
        assert!(store.list_checkpoints(&child.id).unwrap().is_empty());
        assert!(store.get_run(&parent.id).is_ok());
    }

    #[test]
    fn test_event_arena_roundtrip() {
        let (store, run) = store_with_run();
        for (seq, parent) in [(1, None), (2, Some(1))] {
            store
                .append_event(&ExecutionEventRecord {
                    run_id: run.id.clone(),
                    seq,
                    parent_seq: parent,
                    node_id: Some("step_1".into()),
                    event_type: "agent_call".into(),
                    payload: json!({"seq": seq}),
                    timestamp: Utc::now(),
                })
                .unwrap();
        }
        let events = store.events(&run.id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].parent_seq, Some(1));
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("weft.db");
        let store = SqliteStore::open(&path).unwrap();
        let run = Run::new("one_shot", "t", dir.path().to_path_buf());
        store.insert_run(&run).unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.list_runs(10).unwrap().len(), 1);
    }
}
