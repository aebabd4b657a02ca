//! The topology graph: vertices, connections, routing, and latency sampling.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use petgraph::graph::{DiGraph, NodeIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;

use crate::network::routing::bfs_path;
use crate::network::types::{Connection, ConnectionId, Link, LinkId, Node, NodeId, Route, Vertex};

/// A topology shared between the protocol, the flow scheduler, and the node
/// processes of one simulation.
pub type SharedTopology = Rc<RefCell<Topology>>;

/// Host-to-host bandwidth estimates in bytes per second, keyed by node name.
pub type BandwidthGraph = BTreeMap<String, BTreeMap<String, f64>>;

/// Bytes per second a host reads from its own disk, used for self-transfers
/// in the bandwidth graph (1 Gbit/s by convention).
const SELF_TRANSFER_BPS: f64 = 1.25e8;

#[derive(Debug, Clone)]
struct CachedRoute {
    route: Route,
    connections: Vec<ConnectionId>,
}

/// A directed multigraph of nodes, links, and transparent relays.
///
/// Routes between nodes are cached with their modal round-trip latency;
/// latency queries re-sample the cached path's distributions per use. Adding
/// connections does not invalidate previously computed routes.
#[derive(Debug)]
pub struct Topology {
    graph: DiGraph<Vertex, ConnectionId>,
    vertex_idx: FxHashMap<Vertex, NodeIndex>,
    nodes: Vec<Node>,
    names: FxHashMap<String, NodeId>,
    links: Vec<Link>,
    connections: Vec<Connection>,
    route_cache: FxHashMap<(NodeId, NodeId), CachedRoute>,
    rng: StdRng,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    /// Creates an empty topology with the default latency-sampling seed.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Creates an empty topology whose latency sampling draws from a
    /// reproducible seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            graph: DiGraph::new(),
            vertex_idx: FxHashMap::default(),
            nodes: Vec::new(),
            names: FxHashMap::default(),
            links: Vec::new(),
            connections: Vec::new(),
            route_cache: FxHashMap::default(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Registers a node. Panics on duplicate names, since names are node
    /// identity.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        assert!(
            !self.names.contains_key(&node.name),
            "duplicate node name {}",
            node.name
        );
        let id = NodeId::new(self.nodes.len());
        self.names.insert(node.name.clone(), id);
        self.nodes.push(node);
        self.ensure_vertex(Vertex::Node(id));
        id
    }

    /// Registers a link.
    pub fn add_link(&mut self, link: Link) -> LinkId {
        let id = LinkId::new(self.links.len());
        self.links.push(link);
        self.ensure_vertex(Vertex::Link(id));
        id
    }

    /// Inserts the edge(s) for a connection. Symmetric connections
    /// materialize as two edges sharing the one connection. Relay endpoints
    /// are created on first use.
    pub fn add_connection(
        &mut self,
        connection: Connection,
        directed: bool,
    ) -> Result<ConnectionId, TopologyError> {
        if let (Vertex::Node(a), Vertex::Node(b)) = (&connection.source, &connection.target) {
            return Err(TopologyError::NodeToNode {
                from: self.node(*a).name.clone(),
                target: self.node(*b).name.clone(),
            });
        }
        let source = self.ensure_vertex(connection.source.clone());
        let target = self.ensure_vertex(connection.target.clone());
        let id = ConnectionId::new(self.connections.len());
        self.connections.push(connection);
        self.graph.add_edge(source, target, id);
        if !directed {
            self.graph.add_edge(target, source, id);
        }
        Ok(id)
    }

    fn ensure_vertex(&mut self, vertex: Vertex) -> NodeIndex {
        if let Some(&ix) = self.vertex_idx.get(&vertex) {
            return ix;
        }
        let ix = self.graph.add_node(vertex.clone());
        self.vertex_idx.insert(vertex, ix);
        ix
    }

    /// Returns the node with the given ID.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.inner()]
    }

    /// Returns the node with the given ID, mutably.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.inner()]
    }

    /// Looks a node up by name.
    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// Returns the link with the given ID.
    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id.inner()]
    }

    /// Returns the link with the given ID, mutably.
    pub fn link_mut(&mut self, id: LinkId) -> &mut Link {
        &mut self.links[id.inner()]
    }

    /// Returns the connection with the given ID.
    pub fn connection(&self, id: ConnectionId) -> &Connection {
        &self.connections[id.inner()]
    }

    /// Returns an iterator over all node IDs.
    pub fn hosts(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId::new)
    }

    /// Returns an iterator over all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Returns an iterator over all links.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    /// Distinct mutable borrows of two nodes.
    pub(crate) fn node_pair_mut(&mut self, a: NodeId, b: NodeId) -> (&mut Node, &mut Node) {
        assert_ne!(a, b, "cannot borrow the same node twice");
        let (i, j) = (a.inner(), b.inner());
        if i < j {
            let (left, right) = self.nodes.split_at_mut(j);
            (&mut left[i], &mut right[0])
        } else {
            let (left, right) = self.nodes.split_at_mut(i);
            (&mut right[0], &mut left[j])
        }
    }

    /// Shortest path between two vertices by edge count, or empty when there
    /// is none.
    pub fn path(&self, source: impl Into<Vertex>, destination: impl Into<Vertex>) -> Vec<Vertex> {
        let (source, destination) = (source.into(), destination.into());
        let (Some(&s), Some(&d)) = (
            self.vertex_idx.get(&source),
            self.vertex_idx.get(&destination),
        ) else {
            return Vec::new();
        };
        bfs_path(&self.graph, s, d)
            .into_iter()
            .map(|ix| self.graph[ix].clone())
            .collect()
    }

    /// Routes between two nodes, re-sampling the latency distributions along
    /// the cached path.
    pub fn route(&mut self, source: NodeId, destination: NodeId) -> Route {
        self.route_with(source, destination, false)
    }

    /// Routes between two nodes. With `use_mode`, the returned RTT is the
    /// cached modal latency; otherwise the path's distributions are sampled.
    pub fn route_with(&mut self, source: NodeId, destination: NodeId, use_mode: bool) -> Route {
        let key = (source, destination);
        if !self.route_cache.contains_key(&key) {
            let cached = self.compute_route(source, destination);
            self.route_cache.insert(key, cached);
        }
        let cached = &self.route_cache[&key];
        if use_mode {
            return cached.route.clone();
        }
        let mut route = cached.route.clone();
        let connections = cached.connections.clone();
        let mut one_way = 0.0;
        for id in connections {
            let (constant, dist) = {
                let connection = &self.connections[id.inner()];
                (connection.latency, connection.latency_dist)
            };
            one_way += match dist {
                Some(dist) => dist.sample(&mut self.rng),
                None => constant,
            };
        }
        route.rtt = 2.0 * one_way;
        route
    }

    fn compute_route(&mut self, source: NodeId, destination: NodeId) -> CachedRoute {
        let path = self.path(source, destination);
        let mut connections = Vec::new();
        let mut one_way = 0.0;
        for pair in path.windows(2) {
            let a = self.vertex_idx[&pair[0]];
            let b = self.vertex_idx[&pair[1]];
            let edge = self
                .graph
                .find_edge(a, b)
                .expect("path edges exist in the graph");
            let id = self.graph[edge];
            one_way += self.connections[id.inner()].mode_latency();
            connections.push(id);
        }
        CachedRoute {
            route: Route::new(source, destination, path, 2.0 * one_way),
            connections,
        }
    }

    /// One-way latency estimate between two nodes in milliseconds.
    ///
    /// With `use_coordinates`, the estimate is the coordinate distance (both
    /// nodes must have coordinates); otherwise it is half a freshly sampled
    /// route RTT.
    pub fn latency(&mut self, source: NodeId, destination: NodeId, use_coordinates: bool) -> f64 {
        if use_coordinates {
            return self.node(source).distance_to(self.node(destination));
        }
        self.route(source, destination).rtt / 2.0
    }

    /// The reduced host-to-host bandwidth graph in bytes per second, using
    /// each route's minimum nominal hop bandwidth. Pairs without a routed hop
    /// are omitted; self-transfers use the local disk-read convention.
    pub fn bandwidth_graph(&mut self) -> BandwidthGraph {
        let hosts: Vec<NodeId> = self.hosts().collect();
        let mut graph = BandwidthGraph::new();
        for &a in &hosts {
            for &b in &hosts {
                let from = self.node(a).name.clone();
                if a == b {
                    graph.entry(from.clone()).or_default().insert(from, SELF_TRANSFER_BPS);
                    continue;
                }
                let route = self.route_with(a, b, true);
                if route.hops.is_empty() {
                    tracing::debug!(from = %self.node(a).name, to = %self.node(b).name, "no route");
                    continue;
                }
                let min_bandwidth = route
                    .hops
                    .iter()
                    .map(|&l| self.link(l).bandwidth)
                    .fold(f64::INFINITY, f64::min);
                let to = self.node(b).name.clone();
                graph
                    .entry(from)
                    .or_default()
                    .insert(to, min_bandwidth * 125_000.0);
            }
        }
        graph
    }

    /// Renames a relay vertex, e.g. to map dataset region names onto
    /// scenario region names. Unknown relays are ignored.
    pub fn relabel_relay(&mut self, old: &str, new: impl Into<String>) {
        let old = Vertex::Relay(old.to_string());
        if let Some(ix) = self.vertex_idx.remove(&old) {
            let new = Vertex::Relay(new.into());
            self.graph[ix] = new.clone();
            self.vertex_idx.insert(new, ix);
        }
    }
}

/// The ways a topology operation can be invalid.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// Nodes may only be joined through at least one link or relay.
    #[error("cannot connect node {from} directly to node {target}")]
    NodeToNode {
        /// Name of the connection's source node.
        from: String,
        /// Name of the connection's target node.
        target: String,
    },
}
