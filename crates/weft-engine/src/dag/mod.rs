pub mod model;
pub mod template;
pub mod tracker;

pub use model::Dag;
pub use template::{DagOverrides, ModeSpec, Template, TemplateNode, WorkflowRegistry};
pub use tracker::DagTracker;
