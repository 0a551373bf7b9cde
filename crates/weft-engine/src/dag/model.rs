use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use weft_core::error::{Result, WeftError};
use weft_core::types::{Edge, Node, NodeStatus};

/// In-memory DAG of one run. Node order is insertion order and breaks ties
/// in every traversal, so results are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self> {
        let dag = Self { nodes, edges };
        dag.validate()?;
        Ok(dag)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.contains(&node.id) {
            return Err(WeftError::Validation(format!("duplicate node id '{}'", node.id)));
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        for id in [from, to] {
            if !self.contains(id) {
                return Err(WeftError::NotFound(format!("node '{}'", id)));
            }
        }
        let edge = Edge::new(from, to);
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
        Ok(())
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) {
        self.edges.retain(|e| !(e.from == from && e.to == to));
    }

    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.as_str())
            .collect()
    }

    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == id)
            .map(|e| e.to.as_str())
            .collect()
    }

    /// Kahn's algorithm. Fails with `CycleDetected` when not every node can
    /// be ordered.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        Ok(self.execution_levels()?.into_iter().flatten().collect())
    }

    /// Maximal sets of mutually independent nodes, in dependency order.
    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>> {
        let ids: Vec<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        let edges: Vec<(&str, &str)> = self
            .edges
            .iter()
            .map(|e| (e.from.as_str(), e.to.as_str()))
            .collect();
        kahn_levels(&ids, &edges)
    }

    /// DFS three-colour cycle detection. Returns one cycle as a node path.
    pub fn detect_cycles(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        let mut colour: HashMap<&str, Colour> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), Colour::White))
            .collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for e in &self.edges {
            adjacency.entry(e.from.as_str()).or_default().push(e.to.as_str());
        }

        for start in self.nodes.iter().map(|n| n.id.as_str()) {
            if colour.get(start) != Some(&Colour::White) {
                continue;
            }
            // Iterative DFS: (node, next child index)
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            colour.insert(start, Colour::Grey);
            while let Some((node, idx)) = stack.last().copied() {
                let children = adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]);
                if idx < children.len() {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    let child = children[idx];
                    match colour.get(child).copied().unwrap_or(Colour::Black) {
                        Colour::White => {
                            colour.insert(child, Colour::Grey);
                            stack.push((child, 0));
                        }
                        Colour::Grey => {
                            let pos = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                stack[pos..].iter().map(|(n, _)| n.to_string()).collect();
                            cycle.push(child.to_string());
                            return Some(cycle);
                        }
                        Colour::Black => {}
                    }
                } else {
                    colour.insert(node, Colour::Black);
                    stack.pop();
                }
            }
        }
        None
    }

    /// Every node reachable from `id`, excluding `id` itself.
    pub fn downstream_of(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.successors(id).into_iter().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.to_string()) {
                queue.extend(self.successors(next));
            }
        }
        seen
    }

    /// Pending nodes whose dependencies are all completed or skipped.
    pub fn ready_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Pending)
            .filter(|n| {
                self.predecessors(&n.id).iter().all(|p| {
                    self.node(p)
                        .map(|pn| pn.status.satisfies_dependency())
                        .unwrap_or(false)
                })
            })
            .collect()
    }

    /// Structural checks: unique ids, edges between known nodes, acyclic.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for n in &self.nodes {
            if !ids.insert(n.id.as_str()) {
                return Err(WeftError::Validation(format!("duplicate node id '{}'", n.id)));
            }
        }
        for e in &self.edges {
            if !ids.contains(e.from.as_str()) || !ids.contains(e.to.as_str()) {
                return Err(WeftError::Validation(format!(
                    "edge {} -> {} references an unknown node",
                    e.from, e.to
                )));
            }
        }
        if let Some(cycle) = self.detect_cycles() {
            return Err(WeftError::CycleDetected(cycle.join(" -> ")));
        }
        Ok(())
    }

    /// Assign `step_number` by position in topological order, starting at 1.
    pub fn renumber_steps(&mut self) -> Result<()> {
        let order = self.topological_order()?;
        for (i, id) in order.iter().enumerate() {
            if let Some(node) = self.node_mut(id) {
                node.step_number = i as u32 + 1;
            }
        }
        Ok(())
    }
}

/// Level-partition `ids` under `edges` (Kahn). Ties follow `ids` order.
pub(crate) fn kahn_levels(ids: &[&str], edges: &[(&str, &str)]) -> Result<Vec<Vec<String>>> {
    let mut indegree: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for &(from, to) in edges {
        if let Some(d) = indegree.get_mut(&to) {
            *d += 1;
        }
        adjacency.entry(from).or_default().push(to);
    }

    let mut levels = Vec::new();
    let mut current: Vec<&str> = ids
        .iter()
        .copied()
        .filter(|id| indegree.get(id) == Some(&0))
        .collect();
    let mut placed = 0;

    while !current.is_empty() {
        placed += current.len();
        let mut released: HashSet<&str> = HashSet::new();
        for id in &current {
            for child in adjacency.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(d) = indegree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        released.insert(*child);
                    }
                }
            }
        }
        levels.push(current.iter().map(|s| s.to_string()).collect());
        current = ids
            .iter()
            .copied()
            .filter(|id| released.contains(id))
            .collect();
    }

    if placed != ids.len() {
        let stuck: Vec<&str> = ids
            .iter()
            .copied()
            .filter(|id| indegree.get(id).copied().unwrap_or(0) > 0)
            .collect();
        return Err(WeftError::CycleDetected(format!(
            "unresolvable nodes: {}",
            stuck.join(", ")
        )));
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::types::NodeType;

    fn dag(ids: &[&str], edges: &[(&str, &str)]) -> Dag {
        Dag {
            nodes: ids.iter().map(|id| Node::new(*id, NodeType::Step)).collect(),
            edges: edges.iter().map(|(a, b)| Edge::new(*a, *b)).collect(),
        }
    }

    #[test]
    fn diamond_levels() {
        let d = dag(&["a", "b", "c", "d"], &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
        assert_eq!(
            d.execution_levels().unwrap(),
            vec![vec!["a"], vec!["b", "c"], vec!["d"]]
        );
        assert_eq!(d.topological_order().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn cycle_is_reported_by_both_algorithms() {
        let d = dag(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "b")]);
        assert!(matches!(
            d.topological_order(),
            Err(WeftError::CycleDetected(_))
        ));
        let cycle = d.detect_cycles().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&"b".to_string()));
        assert!(d.validate().is_err());
    }

    #[test]
    fn downstream_and_ready() {
        let mut d = dag(&["a", "b", "c", "x"], &[("a", "b"), ("b", "c")]);
        assert_eq!(
            d.downstream_of("a").into_iter().collect::<Vec<_>>(),
            vec!["b", "c"]
        );
        assert!(d.downstream_of("x").is_empty());

        let ready: Vec<&str> = d.ready_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ready, vec!["a", "x"]);

        d.node_mut("a").unwrap().status = NodeStatus::Skipped;
        let ready: Vec<&str> = d.ready_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ready, vec!["b", "x"]);
    }

    #[test]
    fn duplicate_ids_and_dangling_edges_fail_validation() {
        let d = dag(&["a", "a"], &[]);
        assert!(matches!(d.validate(), Err(WeftError::Validation(_))));
        let d = dag(&["a"], &[("a", "ghost")]);
        assert!(matches!(d.validate(), Err(WeftError::Validation(_))));
    }

    #[test]
    fn renumber_follows_topological_order() {
        let mut d = dag(&["t", "a", "b"], &[("a", "b"), ("b", "t")]);
        d.renumber_steps().unwrap();
        assert_eq!(d.node("a").unwrap().step_number, 1);
        assert_eq!(d.node("b").unwrap().step_number, 2);
        assert_eq!(d.node("t").unwrap().step_number, 3);
    }
}
