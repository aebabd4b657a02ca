#![warn(unreachable_pub, missing_docs)]

//! The core `fogsim` library: a discrete-event simulator for edge/fog
//! messaging overlays.
//!
//! A [`Topology`] of compute nodes, bandwidth-constrained links, and
//! transparent relays is built once. Byte transfers compete for link
//! bandwidth under max-min fairness through the [`FlowScheduler`], while the
//! publish/subscribe overlay ([`BrokerProcess`], [`ClientProcess`],
//! [`CoordinatorProcess`]) exchanges [`Message`]s through a [`Protocol`]
//! that delivers after topology-derived latencies. Everything runs on the
//! deterministic virtual-time kernel in [`sim`]. The [`EmmaScenario`] ties
//! the pieces together into a staged multi-region evaluation run.

#[macro_use]
mod ident;

pub mod distributions;
pub mod flow;
pub mod inet;
pub mod network;
pub mod processes;
pub mod protocol;
pub mod scenario;
pub mod sim;
pub mod units;
pub mod vivaldi;

#[cfg(test)]
pub(crate) mod testing;

pub use flow::{Flow, FlowError, FlowId, FlowScheduler};
pub use inet::InetError;
pub use network::{
    BandwidthGraph, Capacity, Connection, ConnectionId, Link, LinkId, Node, NodeId, Route,
    SharedTopology, Topology, TopologyError, Vertex,
};
pub use processes::{
    BrokerList, BrokerProcess, ClientProcess, CoordinatorProcess, SharedRng,
};
pub use protocol::{Body, Kind, Message, Protocol, Publication};
pub use scenario::{EmmaScenario, ScenarioConfig, REGIONS};
pub use sim::{
    all_of, event, AllOf, BoxEvent, FilterStore, Get, Hold, Interrupted, Join, ProcessCtx,
    ProcessHandle, ProcessId, Sim, Sleep,
};
pub use units::{parse_size_string, to_size_string, Bytes, SizeError, SizeUnit};
pub use vivaldi::VivaldiCoordinate;
