use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use weft_core::error::{Result, WeftError};
use weft_core::types::{Node, NodeType};

use super::model::Dag;

/// One node of a static template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateNode {
    pub id: &'static str,
    pub node_type: &'static str,
    pub label: &'static str,
}

/// A named DAG shape. Template nodes are chained in declaration order.
#[derive(Debug, Clone, Copy)]
pub struct Template {
    pub id: &'static str,
    pub description: &'static str,
    pub nodes: &'static [TemplateNode],
}

impl Template {
    /// Whether the template expects planning output to append steps.
    pub fn is_plan_driven(&self) -> bool {
        self.nodes.iter().any(|n| n.node_type == "planning")
    }
}

pub const TEMPLATES: &[Template] = &[
    Template {
        id: "fixed-pipeline",
        description: "init -> execute -> terminator",
        nodes: &[
            TemplateNode {
                id: "init",
                node_type: "init",
                label: "Prepare run",
            },
            TemplateNode {
                id: "execute",
                node_type: "execute",
                label: "Execute task",
            },
            TemplateNode {
                id: "terminator",
                node_type: "terminator",
                label: "Finalize",
            },
        ],
    },
    Template {
        id: "plan-execute",
        description: "planning node; steps are appended from its output",
        nodes: &[TemplateNode {
            id: "planning",
            node_type: "planning",
            label: "Plan steps",
        }],
    },
];

/// Per-run adjustments applied on top of a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagOverrides {
    /// Metadata patches merged into the named nodes.
    #[serde(default)]
    pub node_metadata: BTreeMap<String, Map<String, Value>>,
    /// Default retry budget stamped on every node lacking one.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Nodes that must pass a human gate before they run.
    #[serde(default)]
    pub approval_nodes: Vec<String>,
}

impl DagOverrides {
    /// Layer `other` on top of `self`; `other` wins on conflicts.
    pub fn merged(mut self, other: &DagOverrides) -> Self {
        for (node, patch) in &other.node_metadata {
            let entry = self.node_metadata.entry(node.clone()).or_default();
            for (k, v) in patch {
                entry.insert(k.clone(), v.clone());
            }
        }
        if other.max_attempts.is_some() {
            self.max_attempts = other.max_attempts;
        }
        for id in &other.approval_nodes {
            if !self.approval_nodes.contains(id) {
                self.approval_nodes.push(id.clone());
            }
        }
        self
    }

    /// Stamp overrides onto a node that is being created.
    pub fn apply_to(&self, node: &mut Node) {
        if let Some(patch) = self.node_metadata.get(&node.id) {
            for (k, v) in patch {
                node.metadata.insert(k.clone(), v.clone());
            }
        }
        if let Some(max) = self.max_attempts {
            node.metadata
                .entry("max_attempts")
                .or_insert_with(|| Value::from(max));
        }
        if self.approval_nodes.contains(&node.id) {
            node.metadata
                .insert("requires_approval".into(), Value::Bool(true));
        }
    }
}

/// Registry entry binding a workflow mode to a template and its defaults.
#[derive(Debug, Clone, Copy)]
pub struct ModeSpec {
    pub mode: &'static str,
    pub template: &'static str,
    pub description: &'static str,
    pub max_attempts: Option<u32>,
    pub approval_nodes: &'static [&'static str],
    pub risky_nodes: &'static [&'static str],
}

impl ModeSpec {
    pub fn overrides(&self) -> DagOverrides {
        let mut node_metadata = BTreeMap::new();
        for id in self.risky_nodes {
            let mut patch = Map::new();
            patch.insert("risky".into(), Value::Bool(true));
            node_metadata.insert(id.to_string(), patch);
        }
        DagOverrides {
            node_metadata,
            max_attempts: self.max_attempts,
            approval_nodes: self.approval_nodes.iter().map(|s| s.to_string()).collect(),
        }
    }
}

pub const MODES: &[ModeSpec] = &[
    ModeSpec {
        mode: "one_shot",
        template: "fixed-pipeline",
        description: "Single execution pass with no planning",
        max_attempts: None,
        approval_nodes: &[],
        risky_nodes: &[],
    },
    ModeSpec {
        mode: "planning_and_control",
        template: "plan-execute",
        description: "Plan first, then execute the planned steps",
        max_attempts: None,
        approval_nodes: &[],
        risky_nodes: &[],
    },
    ModeSpec {
        mode: "idea_generation",
        template: "fixed-pipeline",
        description: "Generate and critique research ideas",
        max_attempts: Some(2),
        approval_nodes: &[],
        risky_nodes: &[],
    },
    ModeSpec {
        mode: "hitl_interactive",
        template: "plan-execute",
        description: "Planning with a human review before steps run",
        max_attempts: None,
        approval_nodes: &["terminator"],
        risky_nodes: &[],
    },
    ModeSpec {
        mode: "deep_research",
        template: "plan-execute",
        description: "Long multi-step research with a larger retry budget",
        max_attempts: Some(5),
        approval_nodes: &[],
        risky_nodes: &["terminator"],
    },
];

/// Lookup table of templates and workflow modes.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowRegistry;

impl WorkflowRegistry {
    pub fn templates(&self) -> &'static [Template] {
        TEMPLATES
    }

    pub fn modes(&self) -> &'static [ModeSpec] {
        MODES
    }

    pub fn template(&self, id: &str) -> Result<&'static Template> {
        TEMPLATES
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| WeftError::NotFound(format!("template '{}'", id)))
    }

    pub fn mode(&self, mode: &str) -> Result<&'static ModeSpec> {
        MODES
            .iter()
            .find(|m| m.mode == mode)
            .ok_or_else(|| WeftError::NotFound(format!("workflow mode '{}'", mode)))
    }

    /// Instantiate a template as a fresh DAG with all nodes pending.
    pub fn instantiate(&self, template_id: &str, overrides: &DagOverrides) -> Result<Dag> {
        let template = self.template(template_id)?;
        let mut dag = Dag::new();
        let mut previous: Option<&str> = None;
        for spec in template.nodes {
            let mut node = Node::new(spec.id, NodeType::parse(spec.node_type)).with_label(spec.label);
            overrides.apply_to(&mut node);
            dag.add_node(node)?;
            if let Some(prev) = previous {
                dag.add_edge(prev, spec.id)?;
            }
            previous = Some(spec.id);
        }
        for id in overrides.node_metadata.keys() {
            if !dag.contains(id) && !template.is_plan_driven() {
                return Err(WeftError::Validation(format!(
                    "override targets unknown node '{}' in template '{}'",
                    id, template_id
                )));
            }
        }
        dag.renumber_steps()?;
        Ok(dag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_mode_points_at_a_template() {
        let registry = WorkflowRegistry;
        for mode in registry.modes() {
            assert!(registry.template(mode.template).is_ok(), "{}", mode.mode);
        }
        assert!(registry.mode("freestyle").is_err());
    }

    #[test]
    fn fixed_pipeline_shape() {
        let dag = WorkflowRegistry
            .instantiate("fixed-pipeline", &DagOverrides::default())
            .unwrap();
        assert_eq!(dag.nodes.len(), 3);
        assert_eq!(dag.edges.len(), 2);
        assert_eq!(
            dag.execution_levels().unwrap(),
            vec![vec!["init"], vec!["execute"], vec!["terminator"]]
        );
        assert_eq!(dag.node("terminator").unwrap().step_number, 3);
    }

    #[test]
    fn overrides_patch_nodes() {
        let mut overrides = DagOverrides {
            max_attempts: Some(4),
            approval_nodes: vec!["execute".into()],
            ..Default::default()
        };
        overrides
            .node_metadata
            .insert("init".into(), json!({"risky": true}).as_object().unwrap().clone());

        let dag = WorkflowRegistry
            .instantiate("fixed-pipeline", &overrides)
            .unwrap();
        assert!(dag.node("init").unwrap().flag("risky"));
        assert!(dag.node("execute").unwrap().flag("requires_approval"));
        assert_eq!(dag.node("terminator").unwrap().max_attempts(), Some(4));
    }

    #[test]
    fn unknown_override_target_is_rejected_for_fixed_templates() {
        let mut overrides = DagOverrides::default();
        overrides.node_metadata.insert("ghost".into(), Map::new());
        assert!(WorkflowRegistry
            .instantiate("fixed-pipeline", &overrides)
            .is_err());
    }

    #[test]
    fn mode_overrides_merge_with_caller_overrides() {
        let base = WorkflowRegistry.mode("deep_research").unwrap().overrides();
        let caller = DagOverrides {
            max_attempts: Some(2),
            ..Default::default()
        };
        let merged = base.merged(&caller);
        assert_eq!(merged.max_attempts, Some(2));
        assert!(merged.node_metadata["terminator"]["risky"].as_bool().unwrap());
    }
}
