//! Dependency graph checks for tasks and workflow steps.
//!
//! Graphs are plain `id -> ids` maps. Cycle detection runs at insert time
//! with a three-color depth-first search, and the topological order it
//! yields is deterministic (neighbors are visited in sorted order).

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{MeshError, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validate a dependency graph and return a deterministic topological order.
///
/// `edges` maps each node to the nodes it depends on. Every referenced
/// dependency must itself be a key. Fails with `Validation` on an unknown
/// dependency or when the graph contains a cycle.
pub fn topological_order(edges: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>> {
    for (node, deps) in edges {
        for dep in deps {
            if !edges.contains_key(dep) {
                return Err(MeshError::Validation(format!(
                    "'{node}' depends on unknown node '{dep}'"
                )));
            }
            if dep == node {
                return Err(MeshError::Validation(format!("'{node}' depends on itself")));
            }
        }
    }

    let mut colors: BTreeMap<String, Color> =
        edges.keys().map(|k| (k.clone(), Color::White)).collect();
    let mut order = Vec::with_capacity(edges.len());

    for node in edges.keys() {
        if colors[node] == Color::White {
            visit(node, edges, &mut colors, &mut order)?;
        }
    }
    Ok(order)
}

fn visit(
    node: &str,
    edges: &BTreeMap<String, Vec<String>>,
    colors: &mut BTreeMap<String, Color>,
    order: &mut Vec<String>,
) -> Result<()> {
    colors.insert(node.to_string(), Color::Gray);

    let mut deps: Vec<&String> = edges[node].iter().collect();
    deps.sort();
    deps.dedup();
    for dep in deps {
        match colors[dep.as_str()] {
            Color::Gray => {
                return Err(MeshError::Validation(format!(
                    "dependency cycle through '{dep}'"
                )));
            }
            Color::White => visit(dep, edges, colors, order)?,
            Color::Black => {}
        }
    }

    colors.insert(node.to_string(), Color::Black);
    order.push(node.to_string());
    Ok(())
}

/// Check that a set of edges is acyclic without needing the order.
pub fn ensure_acyclic(edges: &BTreeMap<String, Vec<String>>) -> Result<()> {
    topological_order(edges).map(|_| ())
}

/// Collect the nodes whose dependencies are all contained in `done`,
/// excluding nodes already started.
pub fn ready_nodes(
    edges: &BTreeMap<String, Vec<String>>,
    done: &BTreeSet<String>,
    started: &BTreeSet<String>,
) -> Vec<String> {
    edges
        .iter()
        .filter(|(node, deps)| {
            !done.contains(*node)
                && !started.contains(*node)
                && deps.iter().all(|d| done.contains(d))
        })
        .map(|(node, _)| node.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(n, deps)| (n.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_linear_chain_orders_dependencies_first() {
        let g = edges(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let order = topological_order(&g).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let g = edges(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        let order = topological_order(&g).unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let g = edges(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        let err = topological_order(&g).unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));
    }

    #[test]
    fn test_self_dependency_is_rejected() {
        let g = edges(&[("a", &["a"])]);
        assert!(topological_order(&g).is_err());
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let g = edges(&[("a", &["ghost"])]);
        assert!(topological_order(&g).is_err());
    }

    #[test]
    fn test_ready_nodes() {
        let g = edges(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        let mut done = BTreeSet::new();
        let started = BTreeSet::new();
        assert_eq!(ready_nodes(&g, &done, &started), vec!["a"]);

        done.insert("a".to_string());
        assert_eq!(ready_nodes(&g, &done, &started), vec!["b"]);

        done.insert("b".to_string());
        assert_eq!(ready_nodes(&g, &done, &started), vec!["c"]);
    }

    #[test]
    fn test_deterministic_order() {
        let g = edges(&[("z", &[]), ("m", &[]), ("a", &[])]);
        let o1 = topological_order(&g).unwrap();
        let o2 = topological_order(&g).unwrap();
        assert_eq!(o1, o2);
        assert_eq!(o1, vec!["a", "m", "z"]);
    }
}
