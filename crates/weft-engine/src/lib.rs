pub mod branch;
pub mod capture;
pub mod checkpoint;
pub mod dag;
pub mod dependency;
pub mod gate;
pub mod orchestrator;
pub mod parallel;
pub mod resources;
pub mod resume;
pub mod retry;
pub mod run_log;
pub mod state_machine;
pub mod workspace;

pub use branch::{BranchComparison, BranchManager, BranchRequest, NodeDiff};
pub use capture::EventCaptor;
pub use checkpoint::{CheckpointPolicy, CheckpointStore};
pub use dag::{Dag, DagOverrides, DagTracker, ModeSpec, Template, WorkflowRegistry};
pub use dependency::{
    AnalysisPolicy, DependencyAnalyzer, DependencyClassifier, DependencyEdge, DependencyGraph,
    DependencyKind, KeywordClassifier,
};
pub use gate::{ApprovalBroker, ApprovalDecision, ApprovalGate, ApprovalRequest, RunControl};
pub use orchestrator::{Orchestrator, RunReport};
pub use parallel::{ParallelExecutor, TaskResult};
pub use resources::{Admission, ResourceManager};
pub use resume::PlayFromNode;
pub use retry::{BackoffStrategy, RetryContext, RetryContextManager, TaskFailure};
pub use run_log::RunLogger;
pub use state_machine::StateMachine;
pub use workspace::MergeSummary;
