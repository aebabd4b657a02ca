//! Shared fixtures for tests.

use std::cell::RefCell;
use std::rc::Rc;

use crate::network::topology::{SharedTopology, Topology};
use crate::network::types::{Connection, Link, LinkId, Node, NodeId};
use crate::protocol::Protocol;
use crate::sim::Sim;

/// Two hosts joined by one link and a relay: `a - link - switch - b`.
///
/// Both latency-carrying edges use `edge_latency`, so the one-way host-to-
/// host latency is `2 * edge_latency` milliseconds.
pub(crate) fn pair_with_link(bandwidth: f64, edge_latency: f64) -> (Topology, NodeId, NodeId, LinkId) {
    let mut topo = Topology::new();
    let a = topo.add_node(Node::new("a"));
    let b = topo.add_node(Node::new("b"));
    let link = topo.add_link(Link::new(bandwidth));
    topo.add_connection(Connection::new(a, link).with_latency(edge_latency), false)
        .unwrap();
    topo.add_connection(Connection::new(link, "switch").with_latency(edge_latency), false)
        .unwrap();
    topo.add_connection(Connection::new("switch", b), false)
        .unwrap();
    (topo, a, b, link)
}

/// A star of hosts around one switch, each behind its own 1 Gbit/s access
/// link. The one-way latency between any two hosts is `2 * leg_latency`
/// milliseconds.
pub(crate) fn star_topology(hosts: &[&str], leg_latency: f64) -> (Topology, Vec<NodeId>) {
    let mut topo = Topology::new();
    let mut ids = Vec::new();
    for name in hosts {
        let node = topo.add_node(Node::new(*name));
        let link = topo.add_link(Link::named(1000.0, format!("link_{name}")));
        topo.add_connection(Connection::new(node, link), false).unwrap();
        topo.add_connection(Connection::new(link, "switch").with_latency(leg_latency), false)
            .unwrap();
        ids.push(node);
    }
    (topo, ids)
}

/// Host `a` behind a shared 100 Mbit/s uplink, reaching `b` over a 10 Mbit/s
/// link and `c` over a 100 Mbit/s link.
pub(crate) struct SharedUplink {
    pub(crate) a: NodeId,
    pub(crate) b: NodeId,
    pub(crate) c: NodeId,
    pub(crate) uplink: LinkId,
}

pub(crate) fn shared_uplink() -> (Topology, SharedUplink) {
    let mut topo = Topology::new();
    let a = topo.add_node(Node::new("a"));
    let b = topo.add_node(Node::new("b"));
    let c = topo.add_node(Node::new("c"));
    let uplink = topo.add_link(Link::new(100.0));
    let narrow = topo.add_link(Link::new(10.0));
    let wide = topo.add_link(Link::new(100.0));
    topo.add_connection(Connection::new(a, uplink).with_latency(0.5), false)
        .unwrap();
    topo.add_connection(Connection::new(uplink, "switch"), false)
        .unwrap();
    topo.add_connection(Connection::new("switch", narrow), false)
        .unwrap();
    topo.add_connection(Connection::new(narrow, b).with_latency(0.5), false)
        .unwrap();
    topo.add_connection(Connection::new("switch", wide), false)
        .unwrap();
    topo.add_connection(Connection::new(wide, c).with_latency(0.5), false)
        .unwrap();
    (topo, SharedUplink { a, b, c, uplink })
}

/// A kernel, shared topology, and protocol over [`pair_with_link`] with a
/// 1 ms one-way latency.
pub(crate) fn messaging_pair() -> (Sim, SharedTopology, Protocol, NodeId, NodeId) {
    let (sim, topology, a, b) = messaging_pair_parts();
    let protocol = Protocol::new(&sim, &topology);
    (sim, topology, protocol, a, b)
}

/// Like [`messaging_pair`], without constructing the protocol.
pub(crate) fn messaging_pair_parts() -> (Sim, SharedTopology, NodeId, NodeId) {
    let (topo, a, b, _) = pair_with_link(100.0, 0.5);
    (Sim::new(), Rc::new(RefCell::new(topo)), a, b)
}
