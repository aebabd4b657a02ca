//! The vocabulary types of a topology: nodes, links, relays, connections, and
//! routes.

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use rustc_hash::FxHashMap;

use crate::distributions::LatencyDistribution;
use crate::flow::FlowId;
use crate::vivaldi::VivaldiCoordinate;

identifier!(NodeId, usize);
identifier!(LinkId, usize);
identifier!(ConnectionId, usize);

/// Fraction of the allocated bandwidth visible to the application, a rough
/// estimate of TCP overhead.
pub(crate) const GOODPUT_FACTOR: f64 = 0.97;

/// Compute capacity of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// CPU capacity in millicores.
    pub cpu_millis: u64,
    /// Memory in bytes.
    pub memory: u64,
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            cpu_millis: 1_000,
            memory: 1024 * 1024 * 1024,
        }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capacity(CPU: {} Memory: {})", self.cpu_millis, self.memory)
    }
}

/// A machine in the network that runs compute tasks and exchanges data with
/// other machines. Identified by its name.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct Node {
    /// Stable, unique name.
    #[builder(setter(into))]
    pub name: String,
    /// Compute capacity.
    #[builder(default)]
    pub capacity: Capacity,
    /// CPU architecture tag.
    #[builder(default = String::from("x86"), setter(into))]
    pub arch: String,
    /// Free-form labels.
    #[builder(default)]
    pub labels: FxHashMap<String, String>,
    /// Synthetic network coordinate, set once the node participates in
    /// coordinate updates.
    #[builder(default, setter(skip))]
    pub coordinate: Option<VivaldiCoordinate>,
}

impl Node {
    /// Creates a node with default capacity and architecture.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder().name(name).build()
    }

    /// Predicted RTT to `other` in milliseconds, based on both nodes'
    /// coordinates. Panics if either coordinate is unset.
    pub fn distance_to(&self, other: &Node) -> f64 {
        let own = self
            .coordinate
            .as_ref()
            .unwrap_or_else(|| panic!("node {} has no coordinate set", self.name));
        let theirs = other
            .coordinate
            .as_ref()
            .unwrap_or_else(|| panic!("node {} has no coordinate set", other.name));
        own.distance_to(theirs)
    }
}

/// A network device with a nominal bandwidth, e.g. a NIC, an uplink, or a
/// shared medium. Links are vertices in the topology graph, and the only
/// vertices that constrain flows.
#[derive(Debug, Clone)]
pub struct Link {
    /// Nominal bandwidth in Mbit/s.
    pub bandwidth: f64,
    /// Free-form tags.
    pub tags: FxHashMap<String, String>,

    // State below is owned by the flow scheduler.
    pub(crate) allocation: BTreeMap<FlowId, f64>,
    pub(crate) num_flows: usize,
    pub(crate) max_allocatable: f64,
}

impl Link {
    /// Creates a link with the given nominal bandwidth in Mbit/s.
    pub fn new(bandwidth: f64) -> Self {
        assert!(bandwidth > 0.0, "link bandwidth must be positive");
        Self {
            bandwidth,
            tags: FxHashMap::default(),
            allocation: BTreeMap::new(),
            num_flows: 0,
            max_allocatable: bandwidth,
        }
    }

    /// Creates a link carrying a `name` tag.
    pub fn named(bandwidth: f64, name: impl Into<String>) -> Self {
        let mut link = Self::new(bandwidth);
        link.tags.insert("name".to_string(), name.into());
        link
    }

    /// Current per-flow allocations in Mbit/s.
    pub fn allocation(&self) -> &BTreeMap<FlowId, f64> {
        &self.allocation
    }

    /// Number of live flows registered on this link.
    pub fn num_flows(&self) -> usize {
        self.num_flows
    }

    /// Largest allocation any single flow may currently claim.
    pub fn max_allocatable(&self) -> f64 {
        self.max_allocatable
    }

    /// Application-visible throughput for `flow` in bytes per second, or
    /// `None` if the flow holds no allocation here.
    pub fn goodput_bps(&self, flow: FlowId) -> Option<f64> {
        self.allocation
            .get(&flow)
            .map(|allocated| allocated * 125_000.0 * GOODPUT_FACTOR)
    }

    pub(crate) fn recalculate_max_allocatable(&mut self) {
        if self.num_flows == 0 {
            self.max_allocatable = self.bandwidth;
            return;
        }
        // fair_per_flow is the most a flow can get if no other flow needs less
        let fair_per_flow = self.bandwidth / self.num_flows as f64;

        // flows that need less than the fair value keep their allocation
        let reserved: Vec<f64> = self
            .allocation
            .values()
            .copied()
            .filter(|&v| v < fair_per_flow)
            .collect();
        let allocatable = self.bandwidth - reserved.iter().sum::<f64>();

        // the rest compete for the remaining bandwidth
        let competing = self.num_flows - reserved.len();
        let allocatable_per_flow = if competing > 0 {
            allocatable / competing as f64
        } else {
            allocatable
        };
        self.max_allocatable = fair_per_flow.max(allocatable_per_flow);
    }
}

/// A vertex in the topology graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Vertex {
    /// A compute node.
    Node(NodeId),
    /// A bandwidth-constrained network device.
    Link(LinkId),
    /// A transparent helper vertex such as a switch or an upstream network,
    /// identified by name. Relays are counted in paths but contribute
    /// neither latency nor bandwidth.
    Relay(String),
}

impl From<NodeId> for Vertex {
    fn from(id: NodeId) -> Self {
        Vertex::Node(id)
    }
}

impl From<LinkId> for Vertex {
    fn from(id: LinkId) -> Self {
        Vertex::Link(id)
    }
}

impl From<&str> for Vertex {
    fn from(name: &str) -> Self {
        Vertex::Relay(name.to_string())
    }
}

impl From<String> for Vertex {
    fn from(name: String) -> Self {
        Vertex::Relay(name)
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vertex::Node(id) => write!(f, "node {id}"),
            Vertex::Link(id) => write!(f, "link {id}"),
            Vertex::Relay(name) => write!(f, "relay {name}"),
        }
    }
}

/// A physical connection between two vertices, e.g. a cable or the
/// association of a WiFi card with its AP. One connection may back both
/// directions of a symmetric edge pair.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Edge source.
    pub source: Vertex,
    /// Edge target.
    pub target: Vertex,
    /// Constant one-way latency in milliseconds, used when no distribution is
    /// set.
    pub latency: f64,
    /// Latency distribution in milliseconds.
    pub latency_dist: Option<LatencyDistribution>,
}

impl Connection {
    /// Creates a zero-latency connection.
    pub fn new(source: impl Into<Vertex>, target: impl Into<Vertex>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            latency: 0.0,
            latency_dist: None,
        }
    }

    /// Sets a constant one-way latency in milliseconds.
    pub fn with_latency(mut self, latency: f64) -> Self {
        self.latency = latency;
        self
    }

    /// Sets a latency distribution.
    pub fn with_distribution(mut self, dist: LatencyDistribution) -> Self {
        self.latency_dist = Some(dist);
        self
    }

    /// Draws a one-way latency in milliseconds.
    pub fn sample_latency<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self.latency_dist {
            Some(dist) => dist.sample(rng),
            None => self.latency,
        }
    }

    /// The most likely one-way latency in milliseconds.
    pub fn mode_latency(&self) -> f64 {
        match self.latency_dist {
            Some(dist) => dist.mode(),
            None => self.latency,
        }
    }

    /// The expected one-way latency in milliseconds.
    pub fn mean_latency(&self) -> f64 {
        match self.latency_dist {
            Some(dist) => dist.mean(),
            None => self.latency,
        }
    }
}

/// A routed path between two nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Originating node.
    pub source: NodeId,
    /// Destination node.
    pub destination: NodeId,
    /// The full vertex sequence, including transparent relays.
    pub path: Vec<Vertex>,
    /// The links along `path`, in order.
    pub hops: Vec<LinkId>,
    /// Round-trip latency in milliseconds.
    pub rtt: f64,
}

impl Route {
    pub(crate) fn new(source: NodeId, destination: NodeId, path: Vec<Vertex>, rtt: f64) -> Self {
        let hops = path
            .iter()
            .filter_map(|v| match v {
                Vertex::Link(id) => Some(*id),
                _ => None,
            })
            .collect();
        Self {
            source,
            destination,
            path,
            hops,
            rtt,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Route[{} -> {} ({} hops, rtt={}ms)]",
            self.source,
            self.destination,
            self.hops.len(),
            self.rtt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_hops_are_the_link_subsequence() {
        let path = vec![
            Vertex::Node(NodeId::new(0)),
            Vertex::Link(LinkId::new(0)),
            Vertex::Relay("switch".to_string()),
            Vertex::Link(LinkId::new(1)),
            Vertex::Node(NodeId::new(1)),
        ];
        let route = Route::new(NodeId::new(0), NodeId::new(1), path, 2.0);
        assert_eq!(route.hops, vec![LinkId::new(0), LinkId::new(1)]);
    }

    #[test]
    fn max_allocatable_splits_slack_among_competing_flows() {
        let mut link = Link::new(100.0);
        link.num_flows = 2;
        link.allocation.insert(FlowId::new(0), 10.0);
        link.allocation.insert(FlowId::new(1), 90.0);
        link.recalculate_max_allocatable();
        // flow 0 reserves 10, the remaining 90 is claimable by the competitor
        approx::assert_relative_eq!(link.max_allocatable, 90.0);
    }

    #[test]
    fn max_allocatable_without_flows_is_the_nominal_bandwidth() {
        let mut link = Link::new(250.0);
        link.recalculate_max_allocatable();
        approx::assert_relative_eq!(link.max_allocatable, 250.0);
    }

    #[test]
    fn max_allocatable_is_at_least_the_fair_share() {
        let mut link = Link::new(120.0);
        link.num_flows = 3;
        for (i, v) in [30.0, 30.0, 30.0].iter().enumerate() {
            link.allocation.insert(FlowId::new(i), *v);
        }
        link.recalculate_max_allocatable();
        approx::assert_relative_eq!(link.max_allocatable, 40.0);
    }

    #[test]
    #[should_panic(expected = "bandwidth must be positive")]
    fn zero_bandwidth_link_is_rejected() {
        let _ = Link::new(0.0);
    }

    #[test]
    fn goodput_applies_the_overhead_factor() {
        let mut link = Link::new(100.0);
        link.allocation.insert(FlowId::new(0), 100.0);
        let goodput = link.goodput_bps(FlowId::new(0)).unwrap();
        approx::assert_relative_eq!(goodput, 100.0 * 125_000.0 * 0.97);
        assert!(link.goodput_bps(FlowId::new(1)).is_none());
    }
}
