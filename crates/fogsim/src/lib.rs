//! `fogsim` simulates edge/fog messaging overlays. It synthesizes
//! heterogeneous network topologies, shares link bandwidth between TCP-like
//! flows with max-min fairness, and evaluates client-to-broker assignment
//! strategies for a publish/subscribe overlay over a deterministic
//! virtual-time kernel.

#![warn(unreachable_pub, missing_docs)]

pub mod core;

pub use fogsim_core::{
    Body, BrokerProcess, ClientProcess, Connection, CoordinatorProcess, EmmaScenario, Flow,
    FlowScheduler, Link, Message, Node, Protocol, Route, ScenarioConfig, Sim, Topology,
    VivaldiCoordinate,
};
