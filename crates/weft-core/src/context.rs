//! Typed execution context carried between nodes and persisted in checkpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, WeftError};
use crate::types::RunId;

/// A step proposed by planning output, or a task handed to the dependency
/// analyzer. `reads`/`writes`/`files`/`after` are optional hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Context keys this step consumes.
    #[serde(default)]
    pub reads: Vec<String>,
    /// Context keys this step produces.
    #[serde(default)]
    pub writes: Vec<String>,
    /// Files this step touches in the run directory.
    #[serde(default)]
    pub files: Vec<String>,
    /// Explicit ordering: ids that must finish first.
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn reads(mut self, keys: &[&str]) -> Self {
        self.reads = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn writes(mut self, keys: &[&str]) -> Self {
        self.writes = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn files(mut self, files: &[&str]) -> Self {
        self.files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn after(mut self, ids: &[&str]) -> Self {
        self.after = ids.iter().map(|i| i.to_string()).collect();
        self
    }
}

/// Execution context of a run at a given step.
///
/// `artifacts` are kept only in the full-fidelity snapshot; the structured
/// form written to the run store omits them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub task: String,
    #[serde(default)]
    pub step_number: u32,
    #[serde(default)]
    pub plan: Option<Vec<StepSpec>>,
    /// Output of each completed node, keyed by node id.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub completed_nodes: Vec<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Vec<u8>>,
}

impl ExecutionContext {
    pub fn new(run_id: RunId, task: impl Into<String>) -> Result<Self> {
        let task = task.into();
        if run_id.as_str().trim().is_empty() {
            return Err(WeftError::Validation("context run_id is empty".into()));
        }
        if task.trim().is_empty() {
            return Err(WeftError::Validation("context task is empty".into()));
        }
        Ok(Self {
            run_id,
            task,
            step_number: 0,
            plan: None,
            outputs: BTreeMap::new(),
            variables: BTreeMap::new(),
            completed_nodes: Vec::new(),
            artifacts: BTreeMap::new(),
        })
    }

    /// Record a node's output and mark it completed.
    pub fn record_output(&mut self, node_id: &str, step_number: u32, output: Value) {
        self.outputs.insert(node_id.to_string(), output);
        if !self.completed_nodes.iter().any(|n| n == node_id) {
            self.completed_nodes.push(node_id.to_string());
        }
        self.step_number = self.step_number.max(step_number);
    }

    /// Drop outputs of nodes that are about to be re-executed.
    pub fn forget_nodes(&mut self, node_ids: &[String]) {
        for id in node_ids {
            self.outputs.remove(id);
        }
        self.completed_nodes.retain(|n| !node_ids.contains(n));
    }

    /// Apply user modifications. `task` replaces the task text, `plan`
    /// replaces the plan, everything else lands in `variables`.
    pub fn apply_modifications(&mut self, modifications: &Map<String, Value>) -> Result<()> {
        for (key, value) in modifications {
            match key.as_str() {
                "task" => {
                    let task = value.as_str().ok_or_else(|| {
                        WeftError::Validation("modification 'task' must be a string".into())
                    })?;
                    if task.trim().is_empty() {
                        return Err(WeftError::Validation("modification 'task' is empty".into()));
                    }
                    self.task = task.to_string();
                }
                "plan" => {
                    self.plan = Some(serde_json::from_value(value.clone())?);
                }
                _ => {
                    self.variables.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    /// JSON-serializable structured subset (no artifacts).
    pub fn structured(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("artifacts");
        }
        Ok(value)
    }

    pub fn from_structured(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(RunId::from_str("run-1"), "survey transformer papers").unwrap()
    }

    #[test]
    fn rejects_empty_fields() {
        assert!(ExecutionContext::new(RunId::from_str(""), "t").is_err());
        assert!(ExecutionContext::new(RunId::from_str("r"), "  ").is_err());
    }

    #[test]
    fn structured_form_drops_artifacts_only() {
        let mut c = ctx();
        c.record_output("step_1", 1, json!({"summary": "ok"}));
        c.artifacts.insert("plot.png".into(), vec![1, 2, 3]);

        let value = c.structured().unwrap();
        assert!(value.get("artifacts").is_none());

        let back = ExecutionContext::from_structured(value).unwrap();
        assert!(back.artifacts.is_empty());
        assert_eq!(back.outputs, c.outputs);
        assert_eq!(back.completed_nodes, vec!["step_1"]);
        assert_eq!(back.step_number, 1);
    }

    #[test]
    fn modifications_route_to_typed_fields() {
        let mut c = ctx();
        let mods = json!({
            "task": "survey diffusion papers",
            "temperature": 0.2,
            "plan": [{"id": "a", "description": "collect"}]
        });
        c.apply_modifications(mods.as_object().unwrap()).unwrap();
        assert_eq!(c.task, "survey diffusion papers");
        assert_eq!(c.variables.get("temperature"), Some(&json!(0.2)));
        assert_eq!(c.plan.as_ref().unwrap()[0].id, "a");
    }

    #[test]
    fn bad_task_modification_is_rejected() {
        let mut c = ctx();
        let mods = json!({"task": 7});
        assert!(c.apply_modifications(mods.as_object().unwrap()).is_err());
    }

    #[test]
    fn forget_nodes_clears_outputs() {
        let mut c = ctx();
        c.record_output("a", 1, json!(1));
        c.record_output("b", 2, json!(2));
        c.forget_nodes(&["b".to_string()]);
        assert!(c.outputs.contains_key("a"));
        assert!(!c.outputs.contains_key("b"));
        assert_eq!(c.completed_nodes, vec!["a"]);
    }
}
