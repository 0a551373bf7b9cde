pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::WeftConfig;
pub use context::{ExecutionContext, StepSpec};
pub use error::{Result, WeftError};
pub use event::{EventBus, WorkflowEvent};
pub use traits::{EventSink, RunStore, TaskError, TaskInvocation, TaskOutput, TaskRunner};
pub use types::*;
