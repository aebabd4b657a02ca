//! The network model: topology vocabulary, BFS routing, and the latency-
//! sampled route cache.
//!
//! A topology is built once by registering [nodes](types::Node),
//! [links](types::Link), and [connections](types::Connection), then queried
//! for [routes](types::Route) and latencies while the simulation runs.

pub mod topology;
pub mod types;

pub(crate) mod routing;

pub use topology::{BandwidthGraph, SharedTopology, Topology, TopologyError};
pub use types::{Capacity, Connection, ConnectionId, Link, LinkId, Node, NodeId, Route, Vertex};
