//! Shortest-path routing over the topology graph.

use std::collections::VecDeque;

use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxHashMap, FxHashSet};

/// BFS shortest path by edge count, as a vertex index sequence from `source`
/// to `destination` inclusive. Returns an empty path if the destination is
/// unreachable or equals the source.
///
/// Successors are explored in edge-insertion order, so ties between
/// equal-length paths resolve deterministically to the earliest-added route.
pub(crate) fn bfs_path<N, E>(
    graph: &DiGraph<N, E>,
    source: NodeIndex,
    destination: NodeIndex,
) -> Vec<NodeIndex> {
    if source == destination {
        return Vec::new();
    }
    let mut queue = VecDeque::from([source]);
    let mut discovered = FxHashSet::default();
    discovered.insert(source);
    let mut parents: FxHashMap<NodeIndex, NodeIndex> = FxHashMap::default();

    while let Some(vertex) = queue.pop_front() {
        if vertex == destination {
            let mut path = vec![destination];
            let mut current = destination;
            while let Some(&parent) = parents.get(&current) {
                path.push(parent);
                current = parent;
            }
            path.reverse();
            return path;
        }
        // `neighbors` iterates in reverse order of edge addition
        let mut successors: Vec<_> = graph.neighbors(vertex).collect();
        successors.reverse();
        for successor in successors {
            if successor != vertex && discovered.insert(successor) {
                parents.insert(successor, vertex);
                queue.push_back(successor);
            }
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> (DiGraph<&'static str, ()>, Vec<NodeIndex>) {
        // a -> {b, c} -> d, with a->b inserted before a->c
        let mut g = DiGraph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(a, c, ());
        g.add_edge(b, d, ());
        g.add_edge(c, d, ());
        (g, vec![a, b, c, d])
    }

    #[test]
    fn ties_break_to_the_first_inserted_edge() {
        let (g, ix) = diamond();
        let path = bfs_path(&g, ix[0], ix[3]);
        assert_eq!(path, vec![ix[0], ix[1], ix[3]]);
    }

    #[test]
    fn same_vertex_yields_empty_path() {
        let (g, ix) = diamond();
        assert!(bfs_path(&g, ix[0], ix[0]).is_empty());
    }

    #[test]
    fn unreachable_yields_empty_path() {
        let (mut g, ix) = diamond();
        let isolated = g.add_node("e");
        assert!(bfs_path(&g, ix[0], isolated).is_empty());
    }
}
