use std::collections::HashMap;

use proptest::prelude::*;

use weft_core::context::StepSpec;
use weft_core::error::WeftError;
use weft_core::types::{Edge, Node, NodeType};
use weft_engine::retry::exponential_backoff_secs;
use weft_engine::{Dag, DependencyAnalyzer};

/// Node count plus forward edges `(i, j)` with `i < j`, which can never
/// form a cycle.
fn forward_dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2usize..12).prop_flat_map(|n| {
        let edges = prop::collection::vec((0..n, 0..n), 0..n * 2).prop_map(|pairs| {
            pairs
                .into_iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| (a.min(b), a.max(b)))
                .collect::<Vec<_>>()
        });
        (Just(n), edges)
    })
}

fn build(n: usize, edges: &[(usize, usize)]) -> Dag {
    let nodes = (0..n)
        .map(|i| Node::new(format!("n{}", i), NodeType::Step))
        .collect();
    let edges = edges
        .iter()
        .map(|(a, b)| Edge::new(format!("n{}", a), format!("n{}", b)))
        .collect();
    Dag::from_parts(nodes, edges).unwrap()
}

proptest! {
    #[test]
    fn levels_concatenate_to_a_topological_order((n, edges) in forward_dag()) {
        let dag = build(n, &edges);
        let levels = dag.execution_levels().unwrap();

        let mut level_of = HashMap::new();
        for (depth, level) in levels.iter().enumerate() {
            prop_assert!(!level.is_empty());
            for id in level {
                prop_assert!(level_of.insert(id.clone(), depth).is_none());
            }
        }
        prop_assert_eq!(level_of.len(), n);
        for e in &dag.edges {
            prop_assert!(level_of[&e.from] < level_of[&e.to]);
        }
        let flat: Vec<String> = levels.into_iter().flatten().collect();
        prop_assert_eq!(flat, dag.topological_order().unwrap());
    }

    #[test]
    fn closing_a_path_is_rejected((n, edges) in forward_dag()) {
        prop_assume!(!edges.is_empty());
        let dag = build(n, &edges);
        let (from, to) = edges[0];
        let mut cyclic = dag.clone();
        cyclic.add_edge(&format!("n{}", to), &format!("n{}", from)).unwrap();

        prop_assert!(cyclic.detect_cycles().is_some());
        prop_assert!(matches!(cyclic.validate(), Err(WeftError::CycleDetected(_))));
        prop_assert!(dag.detect_cycles().is_none());
    }

    #[test]
    fn analyzed_plans_are_acyclic_and_complete(
        afters in prop::collection::vec(prop::collection::vec(0usize..8, 0..3), 1..8)
    ) {
        let tasks: Vec<StepSpec> = afters
            .iter()
            .enumerate()
            .map(|(i, deps)| {
                let earlier: Vec<String> = deps
                    .iter()
                    .filter(|d| **d < i)
                    .map(|d| format!("t{}", d))
                    .collect();
                let refs: Vec<&str> = earlier.iter().map(String::as_str).collect();
                StepSpec::new(format!("t{}", i), format!("task number {}", i)).after(&refs)
            })
            .collect();

        let graph = DependencyAnalyzer::heuristic().analyze(&tasks);
        prop_assert!(!graph.is_fallback());
        let mut seen: Vec<String> = graph.levels().into_iter().flatten().collect();
        seen.sort();
        let mut ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        ids.sort();
        prop_assert_eq!(seen, ids);
    }

    #[test]
    fn backoff_is_non_decreasing_and_capped(cap in 1u64..600, attempts in 1u32..40) {
        let mut last = 0;
        for attempt in 1..=attempts {
            let delay = exponential_backoff_secs(attempt, cap, false);
            prop_assert!(delay >= last);
            prop_assert!(delay <= cap);
            last = delay;
        }
    }
}
