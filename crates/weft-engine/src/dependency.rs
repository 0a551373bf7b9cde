use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use weft_core::context::StepSpec;
use weft_core::error::{Result, WeftError};

use crate::dag::model::kahn_levels;

/// Why one task must wait for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Consumes a context key the other task produces.
    Data,
    /// Touches a file the other task touches.
    File,
    /// Explicitly declared ordering.
    Ordering,
    /// Description refers to the other task's result.
    Logic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub kind: DependencyKind,
    pub reason: String,
}

/// Acyclic dependency graph over a set of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    tasks: Vec<String>,
    edges: Vec<DependencyEdge>,
    /// Set when the heuristic result was discarded for the sequential one.
    fallback: bool,
}

impl DependencyGraph {
    /// Chain `ids` in order.
    pub fn sequential(ids: &[String]) -> Self {
        let edges = ids
            .windows(2)
            .map(|pair| DependencyEdge {
                from: pair[0].clone(),
                to: pair[1].clone(),
                kind: DependencyKind::Ordering,
                reason: "sequential".into(),
            })
            .collect();
        Self {
            tasks: ids.to_vec(),
            edges,
            fallback: false,
        }
    }

    fn new(tasks: Vec<String>, edges: Vec<DependencyEdge>) -> Result<Self> {
        let graph = Self {
            tasks,
            edges,
            fallback: false,
        };
        graph.try_levels()?;
        Ok(graph)
    }

    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    fn try_levels(&self) -> Result<Vec<Vec<String>>> {
        let ids: Vec<&str> = self.tasks.iter().map(String::as_str).collect();
        let edges: Vec<(&str, &str)> = self
            .edges
            .iter()
            .map(|e| (e.from.as_str(), e.to.as_str()))
            .collect();
        kahn_levels(&ids, &edges)
    }

    /// Maximal parallel levels.
    pub fn levels(&self) -> Vec<Vec<String>> {
        // Construction guarantees acyclicity.
        self.try_levels()
            .unwrap_or_else(|_| self.tasks.iter().map(|t| vec![t.clone()]).collect())
    }
}

/// Pluggable pairwise dependency detection.
pub trait DependencyClassifier: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn classify(&self, tasks: &[StepSpec]) -> Result<Vec<DependencyEdge>>;
}

/// Built-in classifier over declared hints and task descriptions.
pub struct KeywordClassifier {
    sequencing: Regex,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self {
            sequencing: Regex::new(
                r"(?i)\b(then|afterwards|using the (results?|outputs?)|based on (the )?(previous|above|prior)|previous step)\b",
            )
            .expect("static regex"),
        }
    }

}

/// Whether `id` occurs in `text` as a whole word.
fn mentions(text: &str, id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    text.char_indices().any(|(at, _)| {
        text[at..].starts_with(id)
            && !text[..at].chars().next_back().is_some_and(is_word)
            && !text[at + id.len()..].chars().next().is_some_and(is_word)
    })
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn overlap<'a>(a: &'a [String], b: &[String]) -> Option<&'a String> {
    a.iter().find(|x| b.contains(x))
}

impl DependencyClassifier for KeywordClassifier {
    fn name(&self) -> &str {
        "keyword"
    }

    fn classify(&self, tasks: &[StepSpec]) -> Result<Vec<DependencyEdge>> {
        let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        if ids.len() != tasks.len() {
            return Err(WeftError::Validation("duplicate task ids".into()));
        }

        let mut edges: Vec<DependencyEdge> = Vec::new();
        let mut push = |from: &StepSpec, to: &StepSpec, kind: DependencyKind, reason: String| {
            if !edges.iter().any(|e| e.from == from.id && e.to == to.id) {
                edges.push(DependencyEdge {
                    from: from.id.clone(),
                    to: to.id.clone(),
                    kind,
                    reason,
                });
            }
        };

        for (j, later) in tasks.iter().enumerate() {
            for dep in &later.after {
                let Some(earlier) = tasks.iter().find(|t| &t.id == dep) else {
                    return Err(WeftError::Validation(format!(
                        "task '{}' declares ordering on unknown task '{}'",
                        later.id, dep
                    )));
                };
                push(earlier, later, DependencyKind::Ordering, format!("after {}", dep));
            }

            for (i, earlier) in tasks.iter().enumerate().take(j) {
                if let Some(key) = overlap(&earlier.writes, &later.reads) {
                    push(earlier, later, DependencyKind::Data, format!("reads '{}'", key));
                }
                if let Some(file) = overlap(&earlier.files, &later.files) {
                    push(earlier, later, DependencyKind::File, format!("shares '{}'", file));
                }
                if mentions(&later.description, &earlier.id) {
                    push(earlier, later, DependencyKind::Logic, "references task".into());
                } else if i + 1 == j && self.sequencing.is_match(&later.description) {
                    push(earlier, later, DependencyKind::Logic, "sequencing phrase".into());
                }
            }
        }
        Ok(edges)
    }
}

/// How the analyzer derives dependencies.
#[derive(Clone, Default)]
pub enum AnalysisPolicy {
    /// Every task depends on the one before it.
    #[default]
    Sequential,
    Heuristic(Arc<dyn DependencyClassifier>),
}

/// Turns a task list into an acyclic dependency graph.
///
/// Heuristic analysis never fails: classifier errors or cyclic results fall
/// back to the sequential graph.
#[derive(Clone, Default)]
pub struct DependencyAnalyzer {
    policy: AnalysisPolicy,
}

impl DependencyAnalyzer {
    pub fn new(policy: AnalysisPolicy) -> Self {
        Self { policy }
    }

    pub fn heuristic() -> Self {
        Self::new(AnalysisPolicy::Heuristic(Arc::new(KeywordClassifier::new())))
    }

    pub fn analyze(&self, tasks: &[StepSpec]) -> DependencyGraph {
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let classifier = match &self.policy {
            AnalysisPolicy::Sequential => return DependencyGraph::sequential(&ids),
            AnalysisPolicy::Heuristic(c) => c,
        };

        let result = classifier
            .classify(tasks)
            .and_then(|edges| DependencyGraph::new(ids.clone(), edges));
        match result {
            Ok(graph) => {
                debug!(
                    classifier = classifier.name(),
                    tasks = ids.len(),
                    edges = graph.edges.len(),
                    "Dependencies analyzed"
                );
                graph
            }
            Err(e) => {
                warn!(classifier = classifier.name(), error = %e, "Dependency analysis failed, using sequential order");
                let mut graph = DependencyGraph::sequential(&ids);
                graph.fallback = true;
                graph
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_default() {
        let tasks = vec![StepSpec::new("a", "x"), StepSpec::new("b", "y")];
        let graph = DependencyAnalyzer::default().analyze(&tasks);
        assert_eq!(graph.levels(), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn independent_tasks_share_a_level() {
        let tasks = vec![
            StepSpec::new("a", "fetch arxiv"),
            StepSpec::new("b", "fetch pubmed"),
            StepSpec::new("c", "fetch patents"),
        ];
        let graph = DependencyAnalyzer::heuristic().analyze(&tasks);
        assert!(!graph.is_fallback());
        assert_eq!(graph.levels(), vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn typed_edges() {
        let tasks = vec![
            StepSpec::new("collect", "collect papers").writes(&["papers"]),
            StepSpec::new("plot", "plot stats").files(&["fig.png"]),
            StepSpec::new("summarize", "summarize").reads(&["papers"]),
            StepSpec::new("caption", "caption figure").files(&["fig.png"]),
            StepSpec::new("report", "write report from summarize").after(&["caption"]),
        ];
        let graph = DependencyAnalyzer::heuristic().analyze(&tasks);
        let kind = |from: &str, to: &str| {
            graph
                .edges()
                .iter()
                .find(|e| e.from == from && e.to == to)
                .map(|e| e.kind)
        };
        assert_eq!(kind("collect", "summarize"), Some(DependencyKind::Data));
        assert_eq!(kind("plot", "caption"), Some(DependencyKind::File));
        assert_eq!(kind("caption", "report"), Some(DependencyKind::Ordering));
        assert_eq!(kind("summarize", "report"), Some(DependencyKind::Logic));
        assert_eq!(
            graph.levels(),
            vec![vec!["collect", "plot"], vec!["summarize", "caption"], vec!["report"]]
        );
    }

    #[test]
    fn mentions_match_whole_words_only() {
        assert!(mentions("merge step_1 and step_2", "step_1"));
        assert!(mentions("(see fetch.v2)", "fetch.v2"));
        assert!(mentions("a-a-a", "a-a"));
        assert!(!mentions("step_10 only", "step_1"));
        assert!(!mentions("prefetch data", "fetch"));
        assert!(!mentions("anything", ""));

        let tasks = vec![
            StepSpec::new("fetch", "fetch sources"),
            StepSpec::new("parse", "parse prefetched sources"),
        ];
        let graph = DependencyAnalyzer::heuristic().analyze(&tasks);
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn sequencing_phrase_links_neighbours() {
        let tasks = vec![
            StepSpec::new("a", "run experiment"),
            StepSpec::new("b", "then tabulate results"),
        ];
        let graph = DependencyAnalyzer::heuristic().analyze(&tasks);
        assert_eq!(graph.edges().len(), 1);
        assert_eq!(graph.edges()[0].kind, DependencyKind::Logic);
    }

    #[test]
    fn cyclic_or_invalid_output_falls_back() {
        // a must follow b, yet b reads what a writes.
        let tasks = vec![
            StepSpec::new("a", "x").after(&["b"]).writes(&["k"]),
            StepSpec::new("b", "y").reads(&["k"]),
        ];
        let graph = DependencyAnalyzer::heuristic().analyze(&tasks);
        assert!(graph.is_fallback());
        assert_eq!(graph.levels(), vec![vec!["a"], vec!["b"]]);

        let unknown = vec![StepSpec::new("a", "x").after(&["ghost"])];
        assert!(DependencyAnalyzer::heuristic().analyze(&unknown).is_fallback());
    }

    struct Broken;

    impl DependencyClassifier for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn classify(&self, _tasks: &[StepSpec]) -> Result<Vec<DependencyEdge>> {
            Err(WeftError::Validation("model offline".into()))
        }
    }

    #[test]
    fn classifier_errors_never_escape() {
        let analyzer = DependencyAnalyzer::new(AnalysisPolicy::Heuristic(Arc::new(Broken)));
        let tasks = vec![StepSpec::new("a", "x"), StepSpec::new("b", "y")];
        let graph = analyzer.analyze(&tasks);
        assert!(graph.is_fallback());
        assert_eq!(graph.edges().len(), 1);
    }
}
