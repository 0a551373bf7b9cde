use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which kind of entity a state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Run,
    Node,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Node => "node",
        }
    }
}

/// A state enum governed by an allowed-next table.
///
/// Implemented by [`RunState`] and [`NodeStatus`]; the state machine is
/// generic over this trait.
pub trait Lifecycle:
    Copy + Eq + std::hash::Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    const KIND: EntityKind;

    fn allowed_next(&self) -> &'static [Self];

    fn as_str(&self) -> &'static str;

    fn parse(s: &str) -> Option<Self>;

    fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    fn can_move_to(&self, target: Self) -> bool {
        self.allowed_next().contains(&target)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Draft,
    Planning,
    Executing,
    Paused,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub const ALL: [RunState; 8] = [
        Self::Draft,
        Self::Planning,
        Self::Executing,
        Self::Paused,
        Self::WaitingApproval,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];
}

impl Lifecycle for RunState {
    const KIND: EntityKind = EntityKind::Run;

    fn allowed_next(&self) -> &'static [Self] {
        use RunState::*;
        match self {
            Draft => &[Planning, Executing, Cancelled],
            Planning => &[Executing, WaitingApproval, Paused, Failed, Cancelled],
            Executing => &[Planning, Paused, WaitingApproval, Completed, Failed, Cancelled],
            Paused => &[Executing, Planning, Cancelled],
            WaitingApproval => &[Executing, Planning, Paused, Failed, Cancelled],
            // Only play-from-node leaves `Failed`.
            Failed => &[Executing, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Paused,
    WaitingApproval,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub const ALL: [NodeStatus; 8] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::WaitingApproval,
        Self::Completed,
        Self::Failed,
        Self::Skipped,
        Self::Cancelled,
    ];

    /// Whether a dependent node may start once this node is in this status.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Finished for the current execution (resettable by resume/branch).
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl Lifecycle for NodeStatus {
    const KIND: EntityKind = EntityKind::Node;

    fn allowed_next(&self) -> &'static [Self] {
        use NodeStatus::*;
        match self {
            Pending => &[Running, WaitingApproval, Skipped, Cancelled],
            Running => &[Completed, Failed, Paused, WaitingApproval, Cancelled],
            Paused => &[Running, Pending, Cancelled],
            WaitingApproval => &[Running, Pending, Skipped, Cancelled],
            // Settled nodes may only be reset for re-execution.
            Completed | Failed | Skipped | Cancelled => &[Pending],
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stateful entity addressed by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityRef {
    Run { run_id: RunId },
    Node { run_id: RunId, node_id: String },
}

impl EntityRef {
    pub fn run(run_id: &RunId) -> Self {
        Self::Run {
            run_id: run_id.clone(),
        }
    }

    pub fn node(run_id: &RunId, node_id: impl Into<String>) -> Self {
        Self::Node {
            run_id: run_id.clone(),
            node_id: node_id.into(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Run { .. } => EntityKind::Run,
            Self::Node { .. } => EntityKind::Node,
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Run { run_id } | Self::Node { run_id, .. } => run_id,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::Run { .. } => None,
            Self::Node { node_id, .. } => Some(node_id),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run { run_id } => write!(f, "run:{}", run_id),
            Self::Node { run_id, node_id } => write!(f, "node:{}/{}", run_id, node_id),
        }
    }
}

/// One workflow execution instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// Workflow mode the run was created from.
    pub mode: String,
    pub task: String,
    pub state: RunState,
    /// Canonical working directory for this run.
    pub work_dir: PathBuf,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
    #[serde(default)]
    pub branch_point: Option<String>,
    /// Guard attribute: planning output exists.
    #[serde(default)]
    pub has_plan: bool,
    /// Guard attribute: a human approved the pending gate.
    #[serde(default)]
    pub approval_granted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(mode: impl Into<String>, task: impl Into<String>, work_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            mode: mode.into(),
            task: task.into(),
            state: RunState::Draft,
            work_dir,
            parent_run_id: None,
            branch_point: None,
            has_plan: false,
            approval_granted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_branch(&self) -> bool {
        self.parent_run_id.is_some()
    }
}

/// Kind of work a node represents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Init,
    Planning,
    Execute,
    Step,
    Terminator,
    Custom(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Init => "init",
            Self::Planning => "planning",
            Self::Execute => "execute",
            Self::Step => "step",
            Self::Terminator => "terminator",
            Self::Custom(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "init" => Self::Init,
            "planning" => Self::Planning,
            "execute" => Self::Execute,
            "step" => Self::Step,
            "terminator" => Self::Terminator,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of DAG work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub node_type: NodeType,
    pub label: String,
    pub status: NodeStatus,
    pub step_number: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            node_type,
            status: NodeStatus::Pending,
            step_number: 0,
            metadata: Map::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Per-node retry budget override.
    pub fn max_attempts(&self) -> Option<u32> {
        self.metadata
            .get("max_attempts")
            .and_then(Value::as_u64)
            .map(|n| n.max(1) as u32)
    }
}

/// Directed dependency: `to` runs after `from`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Immutable audit record of one state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub id: String,
    pub entity: EntityRef,
    pub from_state: String,
    pub to_state: String,
    pub reason: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Step,
    Interval,
    PreRisky,
    OnPause,
    BranchSeed,
    Manual,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Step => "step",
            Self::Interval => "interval",
            Self::PreRisky => "pre_risky",
            Self::OnPause => "on_pause",
            Self::BranchSeed => "branch_seed",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "step" => Self::Step,
            "interval" => Self::Interval,
            "pre_risky" => Self::PreRisky,
            "on_pause" => Self::OnPause,
            "branch_seed" => Self::BranchSeed,
            _ => Self::Manual,
        }
    }
}

/// Structured (JSON) form of a checkpoint as held by the run store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub run_id: RunId,
    pub step_number: u32,
    #[serde(default)]
    pub node_id: Option<String>,
    pub kind: CheckpointKind,
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

/// Branch metadata for a run forked from another run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub run_id: RunId,
    pub parent_run_id: RunId,
    pub branch_point: String,
    pub name: String,
    pub hypothesis: String,
    #[serde(default)]
    pub modifications: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Failure taxonomy used by the retry context manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimit,
    Permission,
    FileNotFound,
    Import,
    Syntax,
    Type,
    Value,
    Key,
    Index,
    Attribute,
    Memory,
    Api,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 15] = [
        Self::Network,
        Self::Timeout,
        Self::RateLimit,
        Self::Permission,
        Self::FileNotFound,
        Self::Import,
        Self::Syntax,
        Self::Type,
        Self::Value,
        Self::Key,
        Self::Index,
        Self::Attribute,
        Self::Memory,
        Self::Api,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Permission => "permission",
            Self::FileNotFound => "file_not_found",
            Self::Import => "import",
            Self::Syntax => "syntax",
            Self::Type => "type",
            Self::Value => "value",
            Self::Key => "key",
            Self::Index => "index",
            Self::Attribute => "attribute",
            Self::Memory => "memory",
            Self::Api => "api",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .unwrap_or(Self::Unknown)
    }

    /// Failures likely to clear on their own given time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::Api
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Failed,
    Succeeded,
}

/// One failed (or finally successful) execution attempt of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub run_id: RunId,
    pub node_id: String,
    pub attempt_number: u32,
    pub error: String,
    pub category: ErrorCategory,
    pub outcome: AttemptOutcome,
    pub backoff_secs: u64,
    pub timestamp: DateTime<Utc>,
}

/// Persisted execution event (arena entry; parents referenced by id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEventRecord {
    pub run_id: RunId,
    /// Per-run ordering number, unique within the run.
    pub seq: u64,
    #[serde(default)]
    pub parent_seq: Option<u64>,
    #[serde(default)]
    pub node_id: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_run_states_have_no_successors() {
        for state in RunState::ALL {
            let terminal = matches!(state, RunState::Completed | RunState::Cancelled);
            assert_eq!(state.is_terminal(), terminal, "{state}");
        }
    }

    #[test]
    fn failed_run_can_only_resume_or_cancel() {
        assert!(RunState::Failed.can_move_to(RunState::Executing));
        assert!(!RunState::Failed.can_move_to(RunState::Completed));
        assert!(!RunState::Failed.can_move_to(RunState::Planning));
    }

    #[test]
    fn settled_nodes_only_reset_to_pending() {
        for status in [
            NodeStatus::Completed,
            NodeStatus::Failed,
            NodeStatus::Skipped,
            NodeStatus::Cancelled,
        ] {
            assert_eq!(status.allowed_next(), &[NodeStatus::Pending]);
        }
        assert!(NodeStatus::Pending.can_move_to(NodeStatus::Running));
        assert!(!NodeStatus::Pending.can_move_to(NodeStatus::Completed));
    }

    #[test]
    fn state_names_parse_back() {
        for state in RunState::ALL {
            assert_eq!(RunState::parse(state.as_str()), Some(state));
        }
        for status in NodeStatus::ALL {
            assert_eq!(NodeStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunState::parse("bogus"), None);
    }

    #[test]
    fn node_type_custom_names_survive() {
        assert_eq!(NodeType::parse("planning"), NodeType::Planning);
        assert_eq!(
            NodeType::parse("idea_maker"),
            NodeType::Custom("idea_maker".into())
        );
        assert_eq!(NodeType::Custom("idea_maker".into()).as_str(), "idea_maker");
    }

    #[test]
    fn node_metadata_helpers() {
        let node = Node::new("n1", NodeType::Step)
            .with_metadata("risky", Value::Bool(true))
            .with_metadata("max_attempts", serde_json::json!(5));
        assert!(node.flag("risky"));
        assert!(!node.flag("requires_approval"));
        assert_eq!(node.max_attempts(), Some(5));
        assert_eq!(node.label, "n1");
    }

    #[test]
    fn entity_ref_display() {
        let run = RunId::from_str("r1");
        assert_eq!(EntityRef::run(&run).to_string(), "run:r1");
        assert_eq!(EntityRef::node(&run, "step_1").to_string(), "node:r1/step_1");
        assert_eq!(EntityRef::node(&run, "a").kind(), EntityKind::Node);
    }

    #[test]
    fn transient_categories() {
        assert!(ErrorCategory::Timeout.is_transient());
        assert!(ErrorCategory::Network.is_transient());
        assert!(!ErrorCategory::Syntax.is_transient());
        assert_eq!(ErrorCategory::parse("nope"), ErrorCategory::Unknown);
    }
}
