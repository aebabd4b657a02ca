//! Broker, client, and coordinator processes of the pub/sub overlay.
//!
//! Each process runs a receive-dispatch loop over its node's mailbox and a
//! set of auxiliary loops (publishing, ping measurement, reassignment). The
//! structs here are cheap handles; cloning one yields another view of the
//! same process state.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use itertools::Itertools;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::network::types::{Node, NodeId};
use crate::protocol::{Body, Kind, Message, Protocol, Publication};
use crate::sim::{all_of, event, BoxEvent, ProcessCtx, ProcessHandle};
use crate::vivaldi::{self, VivaldiCoordinate};

/// A seeded random source shared by the processes of one simulation.
pub type SharedRng = Rc<RefCell<StdRng>>;

/// The mutable broker roster of one overlay, shared by every process.
pub type BrokerList = Rc<RefCell<Vec<BrokerProcess>>>;

/// Brokers returned per find-brokers request.
const FIND_BROKERS: usize = 5;
/// Pings per node in a measurement pass.
const PINGS_PER_NODE: usize = 5;
/// Pings and spacing (ms) of a QoS probe.
const QOS_PINGS: usize = 10;
const QOS_SPACING_MS: f64 = 250.0;
/// Pause between the phases of the client ping loop.
const PING_LOOP_GAP_MS: f64 = 30_000.0;
/// Cadence of ping-all measurement and of the coordinator's passes.
const MEASUREMENT_INTERVAL_MS: f64 = 15_000.0;
/// Pacing between successive forwards of one publication.
const FORWARD_PACING_MS: f64 = 0.1;
/// Latency group boundaries in milliseconds; the last group is open-ended.
const LATENCY_GROUPS: [f64; 10] = [0.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0];
/// Fraction of a group's total subscribers a move must win by.
const HYSTERESIS_THETA: f64 = 0.1;

/// Plumbing shared by every node process.
#[derive(Clone)]
struct ProcessCore {
    protocol: Protocol,
    node: NodeId,
    running: Rc<Cell<bool>>,
    use_vivaldi: bool,
    rng: SharedRng,
}

impl ProcessCore {
    fn new(protocol: &Protocol, node: NodeId, use_vivaldi: bool, rng: SharedRng) -> Self {
        Self {
            protocol: protocol.clone(),
            node,
            running: Rc::new(Cell::new(false)),
            use_vivaldi,
            rng,
        }
    }

    fn is_running(&self) -> bool {
        self.running.get()
    }

    fn begin(&self) {
        self.running.set(true);
        if self.use_vivaldi {
            let mut topology = self.protocol.topology().borrow_mut();
            topology
                .node_mut(self.node)
                .coordinate
                .get_or_insert_with(VivaldiCoordinate::new);
        }
    }

    fn send(&self, destination: NodeId, body: Body) -> ProcessHandle {
        self.protocol.send(self.node, destination, body)
    }

    fn receive(&self, ctx: &ProcessCtx, kinds: &[Kind]) -> crate::sim::Get<Message> {
        self.protocol.receive(ctx, self.node, kinds)
    }

    /// Feeds the message's latency into this node's coordinate, when the
    /// sender has one.
    fn observe(&self, message: &Message) {
        if !self.use_vivaldi || message.source == self.node {
            return;
        }
        let mut topology = self.protocol.topology().borrow_mut();
        if topology.node(message.source).coordinate.is_none() {
            return;
        }
        let (own, theirs) = topology.node_pair_mut(self.node, message.source);
        vivaldi::execute(own, theirs, message.latency * 2.0, &mut *self.rng.borrow_mut());
    }

    /// Pings each node `pings_per_node` times and returns the mean RTT per
    /// node in milliseconds.
    async fn ping_nodes(
        &self,
        ctx: &ProcessCtx,
        nodes: &[NodeId],
        pings_per_node: usize,
        spacing: f64,
    ) -> BTreeMap<NodeId, f64> {
        let mut averages = BTreeMap::new();
        for &target in nodes {
            if target == self.node {
                continue;
            }
            let mut total = 0.0;
            for _ in 0..pings_per_node {
                ctx.wait(self.send(target, Body::Ping)).await;
                let pong = self.receive(ctx, &[Kind::Pong]).await;
                if let Body::Pong { rtt, .. } = pong.body {
                    total += rtt;
                }
                if spacing > 0.0 {
                    ctx.sleep(spacing).await;
                }
            }
            averages.insert(target, total / pings_per_node.max(1) as f64);
        }
        averages
    }

    /// Periodically pings every node produced by `nodes` while the process
    /// runs.
    async fn ping_all<F>(self, ctx: ProcessCtx, nodes: F, interval: f64)
    where
        F: Fn() -> Vec<NodeId>,
    {
        while self.is_running() {
            let targets = nodes();
            self.ping_nodes(&ctx, &targets, PINGS_PER_NODE, 0.0).await;
            ctx.sleep(interval).await;
        }
    }

    /// Stops the main loop and posts the final `Shutdown` to this node's own
    /// mailbox. Repeated shutdowns are absorbed by the flag.
    fn shutdown_event(&self) -> ProcessHandle {
        self.running.set(false);
        self.send(self.node, Body::Shutdown)
    }
}

#[derive(Debug)]
struct ClientState {
    selected_broker: NodeId,
    subscriptions: BTreeSet<String>,
}

/// Kinds handled by the client's main loop. `Pong` stays out so the ping
/// measurement loops can observe replies themselves.
const CLIENT_KINDS: &[Kind] = &[
    Kind::Ping,
    Kind::Shutdown,
    Kind::ReconnectRequest,
    Kind::Pub,
    Kind::QosRequest,
];

/// A subscriber/publisher endpoint bound to a selected broker.
#[derive(Clone)]
pub struct ClientProcess {
    core: ProcessCore,
    state: Rc<RefCell<ClientState>>,
}

impl std::fmt::Debug for ClientProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProcess")
            .field("node", &self.node())
            .field("broker", &self.selected_broker())
            .finish()
    }
}

impl ClientProcess {
    /// Creates a client on `node`, initially connected to `initial_broker`.
    pub fn new(
        protocol: &Protocol,
        node: NodeId,
        initial_broker: NodeId,
        use_vivaldi: bool,
        rng: SharedRng,
    ) -> Self {
        Self {
            core: ProcessCore::new(protocol, node, use_vivaldi, rng),
            state: Rc::new(RefCell::new(ClientState {
                selected_broker: initial_broker,
                subscriptions: BTreeSet::new(),
            })),
        }
    }

    /// The client's node.
    pub fn node(&self) -> NodeId {
        self.core.node
    }

    /// The broker this client currently talks to.
    pub fn selected_broker(&self) -> NodeId {
        self.state.borrow().selected_broker
    }

    /// The topics this client is subscribed to.
    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.state.borrow().subscriptions.clone()
    }

    /// Whether the main loop is running.
    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Starts the main receive-dispatch loop.
    pub fn start(&self) -> ProcessHandle {
        let this = self.clone();
        self.core.protocol.sim().spawn(move |ctx| this.run(ctx))
    }

    async fn run(self, ctx: ProcessCtx) {
        self.core.begin();
        while self.core.is_running() {
            let message = self.core.receive(&ctx, CLIENT_KINDS).await;
            self.core.observe(&message);
            self.dispatch(&ctx, message).await;
        }
    }

    async fn dispatch(&self, ctx: &ProcessCtx, message: Message) {
        let source = message.source;
        let latency = message.latency;
        match message.body {
            Body::Ping => {
                ctx.wait(self.core.send(
                    source,
                    Body::Pong {
                        ping_latency: latency,
                        rtt: 0.0,
                    },
                ))
                .await;
            }
            Body::Shutdown => self.core.running.set(false),
            Body::ReconnectRequest { new_broker, .. } => {
                self.handle_reconnect(ctx, source, new_broker).await;
            }
            Body::Pub(_) => {
                if self.core.protocol.ack_enabled() {
                    ctx.wait(self.core.send(source, Body::PubAck)).await;
                }
            }
            Body::QosRequest { target } => {
                let this = self.clone();
                ctx.sim().spawn(move |probe| async move {
                    this.handle_qos(probe, source, target).await;
                });
            }
            other => unreachable!("client received unhandled {} message", other.kind()),
        }
    }

    /// Migrates every subscription to `new_broker`, swaps brokers, and (with
    /// acks) confirms to the requester; the emitted events complete as one
    /// unit.
    async fn handle_reconnect(&self, ctx: &ProcessCtx, requester: NodeId, new_broker: NodeId) {
        let ack = self.core.protocol.ack_enabled();
        let (old_broker, topics) = {
            let state = self.state.borrow();
            let topics: Vec<String> = state.subscriptions.iter().cloned().collect();
            (state.selected_broker, topics)
        };
        let mut events: Vec<BoxEvent> = Vec::new();
        for topic in topics {
            events.push(event(ctx.wait(
                self.core.send(new_broker, Body::Sub { topic: topic.clone() }),
            )));
            if ack {
                let receipt = self.core.receive(ctx, &[Kind::SubAck]);
                events.push(event(async move {
                    let _ = receipt.await;
                }));
            }
            events.push(event(ctx.wait(self.core.send(old_broker, Body::Unsub { topic }))));
            if ack {
                let receipt = self.core.receive(ctx, &[Kind::UnsubAck]);
                events.push(event(async move {
                    let _ = receipt.await;
                }));
            }
        }
        self.state.borrow_mut().selected_broker = new_broker;
        if ack {
            events.push(event(ctx.wait(self.core.send(requester, Body::ReconnectAck))));
        }
        all_of(events).await;
    }

    async fn handle_qos(&self, ctx: ProcessCtx, requester: NodeId, target: NodeId) {
        let averages = self
            .core
            .ping_nodes(&ctx, &[target], QOS_PINGS, QOS_SPACING_MS)
            .await;
        let avg_rtt = averages.get(&target).copied().unwrap_or_default();
        ctx.wait(self.core.send(requester, Body::QosResponse { avg_rtt }))
            .await;
    }

    /// Subscribes to `topic` via the selected broker.
    pub fn subscribe(&self, topic: impl Into<String>) -> ProcessHandle {
        let this = self.clone();
        let topic = topic.into();
        self.core.protocol.sim().spawn(move |ctx| async move {
            let broker = {
                let mut state = this.state.borrow_mut();
                state.subscriptions.insert(topic.clone());
                state.selected_broker
            };
            ctx.wait(this.core.send(broker, Body::Sub { topic })).await;
            if this.core.protocol.ack_enabled() {
                this.core.receive(&ctx, &[Kind::SubAck]).await;
            }
        })
    }

    /// Publishes to `topic` every `interval` milliseconds while the client
    /// runs.
    pub fn start_publisher(&self, topic: impl Into<String>, interval: f64) -> ProcessHandle {
        let this = self.clone();
        let topic = topic.into();
        self.core.protocol.sim().spawn(move |ctx| async move {
            while this.core.is_running() {
                let broker = this.state.borrow().selected_broker;
                let now = ctx.now();
                let publication = Publication::new(topic.clone(), now, now);
                ctx.wait(this.core.send(broker, Body::Pub(publication))).await;
                if this.core.protocol.ack_enabled() {
                    this.core.receive(&ctx, &[Kind::PubAck]).await;
                }
                ctx.sleep(interval).await;
            }
        })
    }

    /// Alternates between pinging random and closest brokers while the
    /// client runs, feeding the coordinate embedding.
    pub fn start_ping_loop(&self) -> ProcessHandle {
        let this = self.clone();
        self.core.protocol.sim().spawn(move |ctx| async move {
            while this.core.is_running() {
                this.ping_discovered(&ctx, Body::FindRandomBrokersRequest).await;
                ctx.sleep(PING_LOOP_GAP_MS).await;
                this.ping_discovered(&ctx, Body::FindClosestBrokersRequest).await;
                ctx.sleep(PING_LOOP_GAP_MS).await;
            }
        })
    }

    async fn ping_discovered(&self, ctx: &ProcessCtx, request: Body) {
        let response_kind = match request.kind() {
            Kind::FindRandomBrokersRequest => Kind::FindRandomBrokersResponse,
            _ => Kind::FindClosestBrokersResponse,
        };
        let broker = self.state.borrow().selected_broker;
        ctx.wait(self.core.send(broker, request)).await;
        let response = self.core.receive(ctx, &[response_kind]).await;
        let (Body::FindRandomBrokersResponse { brokers }
        | Body::FindClosestBrokersResponse { brokers }) = response.body
        else {
            unreachable!("filtered receive returned a different kind");
        };
        let targets: Vec<NodeId> = brokers.into_iter().take(FIND_BROKERS).collect();
        self.core
            .ping_nodes(ctx, &targets, PINGS_PER_NODE, 0.0)
            .await;
    }

    /// Periodically pings every node produced by `nodes` while the client
    /// runs.
    pub fn start_ping_all<F>(&self, nodes: F) -> ProcessHandle
    where
        F: Fn() -> Vec<NodeId> + 'static,
    {
        let core = self.core.clone();
        self.core
            .protocol
            .sim()
            .spawn(move |ctx| core.ping_all(ctx, nodes, MEASUREMENT_INTERVAL_MS))
    }

    /// Unsubscribes from every topic, then stops the main loop. Runs in the
    /// calling process.
    pub async fn shutdown(&self, ctx: &ProcessCtx) {
        let ack = self.core.protocol.ack_enabled();
        let (broker, topics) = {
            let state = self.state.borrow();
            let topics: Vec<String> = state.subscriptions.iter().cloned().collect();
            (state.selected_broker, topics)
        };
        let mut events: Vec<BoxEvent> = Vec::new();
        for topic in topics {
            events.push(event(ctx.wait(self.core.send(broker, Body::Unsub { topic }))));
            if ack {
                let receipt = self.core.receive(ctx, &[Kind::UnsubAck]);
                events.push(event(async move {
                    let _ = receipt.await;
                }));
            }
        }
        all_of(events).await;
        ctx.wait(self.core.shutdown_event()).await;
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    subscribers: BTreeMap<String, BTreeSet<NodeId>>,
}

/// Kinds handled by the broker's main loop; publications flow through the
/// separate publish loop.
const BROKER_KINDS: &[Kind] = &[
    Kind::Ping,
    Kind::Shutdown,
    Kind::FindRandomBrokersRequest,
    Kind::FindClosestBrokersRequest,
    Kind::Sub,
    Kind::Unsub,
];

/// A pub/sub broker peered with the other brokers of the overlay.
#[derive(Clone)]
pub struct BrokerProcess {
    core: ProcessCore,
    peers: BrokerList,
    state: Rc<RefCell<BrokerState>>,
}

impl std::fmt::Debug for BrokerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerProcess")
            .field("node", &self.node())
            .finish()
    }
}

impl BrokerProcess {
    /// Creates a broker on `node`. `peers` is the shared roster of every
    /// broker in the overlay, including this one.
    pub fn new(protocol: &Protocol, node: NodeId, peers: BrokerList, use_vivaldi: bool, rng: SharedRng) -> Self {
        Self {
            core: ProcessCore::new(protocol, node, use_vivaldi, rng),
            peers,
            state: Rc::default(),
        }
    }

    /// The broker's node.
    pub fn node(&self) -> NodeId {
        self.core.node
    }

    /// Whether the main loop is running.
    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Number of distinct subscribers over all topics.
    pub fn total_subscribers(&self) -> usize {
        let state = self.state.borrow();
        state
            .subscribers
            .values()
            .flatten()
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// The current subscribers of `topic`.
    pub fn subscribers_of(&self, topic: &str) -> BTreeSet<NodeId> {
        self.state
            .borrow()
            .subscribers
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Every node subscribed to any topic here.
    pub fn all_subscribers(&self) -> BTreeSet<NodeId> {
        self.state.borrow().subscribers.values().flatten().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn insert_subscriber(&self, topic: &str, node: NodeId) {
        self.state
            .borrow_mut()
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .insert(node);
    }

    /// Starts the main receive-dispatch loop.
    pub fn start(&self) -> ProcessHandle {
        let this = self.clone();
        self.core.protocol.sim().spawn(move |ctx| this.run(ctx))
    }

    /// Starts the publication fan-out loop.
    pub fn start_publish_loop(&self) -> ProcessHandle {
        let this = self.clone();
        self.core.protocol.sim().spawn(move |ctx| this.publish_loop(ctx))
    }

    /// Periodically pings every node produced by `nodes` while the broker
    /// runs.
    pub fn start_ping_all<F>(&self, nodes: F) -> ProcessHandle
    where
        F: Fn() -> Vec<NodeId> + 'static,
    {
        let core = self.core.clone();
        self.core
            .protocol
            .sim()
            .spawn(move |ctx| core.ping_all(ctx, nodes, MEASUREMENT_INTERVAL_MS))
    }

    async fn run(self, ctx: ProcessCtx) {
        self.core.begin();
        while self.core.is_running() {
            let message = self.core.receive(&ctx, BROKER_KINDS).await;
            self.core.observe(&message);
            self.dispatch(&ctx, message).await;
        }
    }

    async fn dispatch(&self, ctx: &ProcessCtx, message: Message) {
        let source = message.source;
        let latency = message.latency;
        let ack = self.core.protocol.ack_enabled();
        match message.body {
            Body::Ping => {
                ctx.wait(self.core.send(
                    source,
                    Body::Pong {
                        ping_latency: latency,
                        rtt: 0.0,
                    },
                ))
                .await;
            }
            Body::Shutdown => self.core.running.set(false),
            Body::FindRandomBrokersRequest => {
                let brokers = self.random_brokers(FIND_BROKERS);
                ctx.wait(self.core.send(source, Body::FindRandomBrokersResponse { brokers }))
                    .await;
            }
            Body::FindClosestBrokersRequest => {
                let brokers = self.closest_brokers(source, FIND_BROKERS);
                ctx.wait(self.core.send(source, Body::FindClosestBrokersResponse { brokers }))
                    .await;
            }
            Body::Sub { topic } => {
                self.state
                    .borrow_mut()
                    .subscribers
                    .entry(topic)
                    .or_default()
                    .insert(source);
                if ack {
                    ctx.wait(self.core.send(source, Body::SubAck)).await;
                }
            }
            Body::Unsub { topic } => {
                if let Some(subscribers) = self.state.borrow_mut().subscribers.get_mut(&topic) {
                    subscribers.remove(&source);
                }
                if ack {
                    ctx.wait(self.core.send(source, Body::UnsubAck)).await;
                }
            }
            other => unreachable!("broker received unhandled {} message", other.kind()),
        }
    }

    /// `n` peers drawn uniformly with replacement.
    fn random_brokers(&self, n: usize) -> Vec<NodeId> {
        let peers = self.peers.borrow();
        let mut rng = self.core.rng.borrow_mut();
        (0..n)
            .filter_map(|_| peers.choose(&mut *rng).map(BrokerProcess::node))
            .collect()
    }

    /// The `n` peers closest to `to` by coordinate distance.
    fn closest_brokers(&self, to: NodeId, n: usize) -> Vec<NodeId> {
        let topology = self.core.protocol.topology().borrow();
        self.peers
            .borrow()
            .iter()
            .map(|peer| {
                let distance = topology.node(to).distance_to(topology.node(peer.node()));
                (distance, peer.node())
            })
            .sorted_by(|a, b| a.0.partial_cmp(&b.0).expect("distances are finite"))
            .take(n)
            .map(|(_, node)| node)
            .collect()
    }

    async fn publish_loop(self, ctx: ProcessCtx) {
        while self.core.is_running() {
            let message = self.core.receive(&ctx, &[Kind::Pub, Kind::PubAck]).await;
            if let Body::Pub(publication) = message.body {
                self.forward(&ctx, message.source, publication).await;
            }
        }
    }

    /// Fans a publication out to local subscribers and to peer brokers that
    /// have subscribers for the topic and are not yet on the publication's
    /// hop list.
    async fn forward(&self, ctx: &ProcessCtx, from: NodeId, mut publication: Publication) {
        let ack = self.core.protocol.ack_enabled();
        if ack {
            ctx.wait(self.core.send(from, Body::PubAck)).await;
        }
        publication.hops.push(self.core.node);

        let mut destinations: Vec<NodeId> = self
            .subscribers_of(&publication.topic)
            .into_iter()
            .filter(|&subscriber| subscriber != from)
            .collect();
        destinations.extend(
            self.peers
                .borrow()
                .iter()
                .filter(|peer| {
                    !publication.hops.contains(&peer.node())
                        && !peer.subscribers_of(&publication.topic).is_empty()
                })
                .map(BrokerProcess::node),
        );

        for destination in destinations {
            ctx.wait(self.core.send(destination, Body::Pub(publication.clone())))
                .await;
            ctx.sleep(FORWARD_PACING_MS).await;
            if ack {
                self.core.receive(ctx, &[Kind::PubAck]).await;
            }
        }
    }

    /// Hands every subscriber over to a surviving peer, then stops. Runs in
    /// the calling process.
    pub async fn shutdown(&self, ctx: &ProcessCtx) {
        let ack = self.core.protocol.ack_enabled();
        let survivors: Vec<BrokerProcess> = self
            .peers
            .borrow()
            .iter()
            .filter(|peer| peer.is_running() && peer.node() != self.core.node)
            .cloned()
            .collect();
        let mut events: Vec<BoxEvent> = Vec::new();
        for subscriber in self.all_subscribers() {
            let target = {
                let mut rng = self.core.rng.borrow_mut();
                survivors.choose(&mut *rng).map(BrokerProcess::node)
            };
            let Some(target) = target else { break };
            events.push(event(ctx.wait(self.core.send(
                subscriber,
                Body::ReconnectRequest {
                    new_broker: target,
                    optimal_broker: target,
                },
            ))));
            if ack {
                let receipt = self.core.receive(ctx, &[Kind::ReconnectAck]);
                events.push(event(async move {
                    let _ = receipt.await;
                }));
            }
        }
        all_of(events).await;
        ctx.wait(self.core.shutdown_event()).await;
    }
}

enum Decision {
    NoBrokers,
    Keep,
    Move { new_broker: NodeId, optimal_broker: NodeId },
}

/// Centralized controller that periodically reassigns clients to the
/// least-loaded broker within their lowest latency group.
#[derive(Clone)]
pub struct CoordinatorProcess {
    protocol: Protocol,
    node: NodeId,
    clients: Rc<RefCell<Vec<ClientProcess>>>,
    brokers: BrokerList,
    use_coordinates: bool,
}

impl std::fmt::Debug for CoordinatorProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorProcess")
            .field("node", &self.node)
            .finish()
    }
}

impl CoordinatorProcess {
    /// Creates the coordinator and registers its (unconnected) node in the
    /// topology, so its control traffic travels with zero latency.
    pub fn new(
        protocol: &Protocol,
        clients: Rc<RefCell<Vec<ClientProcess>>>,
        brokers: BrokerList,
        use_coordinates: bool,
    ) -> Self {
        let node = protocol.topology().borrow_mut().add_node(Node::new("coordinator"));
        Self {
            protocol: protocol.clone(),
            node,
            clients,
            brokers,
            use_coordinates,
        }
    }

    /// The coordinator's node.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Starts the periodic reassignment loop.
    pub fn start(&self) -> ProcessHandle {
        let this = self.clone();
        self.protocol.sim().spawn(move |ctx| this.reconnect_loop(ctx))
    }

    async fn reconnect_loop(self, ctx: ProcessCtx) {
        loop {
            let clients: Vec<ClientProcess> = self.clients.borrow().iter().cloned().collect();
            'clients: for client in clients {
                if !client.is_running() {
                    continue;
                }
                match self.decide(&client) {
                    Decision::NoBrokers => break 'clients,
                    Decision::Keep => continue,
                    Decision::Move {
                        new_broker,
                        optimal_broker,
                    } => {
                        tracing::debug!(
                            client = client.node().inner(),
                            new_broker = new_broker.inner(),
                            "reassigning client"
                        );
                        ctx.wait(self.protocol.send(
                            self.node,
                            client.node(),
                            Body::ReconnectRequest {
                                new_broker,
                                optimal_broker,
                            },
                        ))
                        .await;
                        if self.protocol.ack_enabled() {
                            self.protocol.receive(&ctx, self.node, &[Kind::ReconnectAck]).await;
                        }
                    }
                }
            }
            ctx.sleep(MEASUREMENT_INTERVAL_MS).await;
        }
    }

    fn decide(&self, client: &ClientProcess) -> Decision {
        let current = client.selected_broker();
        let optimal_group = self.lowest_latency_group(client.node(), false);
        if optimal_group.is_empty() {
            return Decision::NoBrokers;
        }
        let possible_group = if self.use_coordinates {
            self.lowest_latency_group(client.node(), true)
        } else {
            optimal_group.clone()
        };
        let (Some(new), Some(optimal)) = (
            least_subscribed(&possible_group),
            least_subscribed(&optimal_group),
        ) else {
            return Decision::Keep;
        };
        if new.node() == current {
            return Decision::Keep;
        }
        if let Some(current_proc) = possible_group.iter().find(|b| b.node() == current) {
            let delta = HYSTERESIS_THETA
                * possible_group
                    .iter()
                    .map(|b| b.total_subscribers() as f64)
                    .sum::<f64>();
            if new.total_subscribers() as f64 + delta >= current_proc.total_subscribers() as f64 {
                return Decision::Keep;
            }
        }
        Decision::Move {
            new_broker: new.node(),
            optimal_broker: optimal.node(),
        }
    }

    /// The running brokers in the first non-empty latency group, measured
    /// from `node` either by coordinates or by sampled route latency.
    fn lowest_latency_group(&self, node: NodeId, use_coordinates: bool) -> Vec<BrokerProcess> {
        let running: Vec<BrokerProcess> = self
            .brokers
            .borrow()
            .iter()
            .filter(|b| b.is_running())
            .cloned()
            .collect();
        let scored: Vec<(f64, BrokerProcess)> = {
            let mut topology = self.protocol.topology().borrow_mut();
            running
                .into_iter()
                .map(|broker| {
                    let latency = topology.latency(node, broker.node(), use_coordinates);
                    (latency, broker)
                })
                .collect()
        };
        let bounds = LATENCY_GROUPS.iter().copied().chain([f64::INFINITY]);
        for (low, high) in bounds.clone().zip(bounds.skip(1)) {
            let group: Vec<BrokerProcess> = scored
                .iter()
                .filter(|(latency, _)| *latency >= low && *latency < high)
                .map(|(_, broker)| broker.clone())
                .collect();
            if !group.is_empty() {
                return group;
            }
        }
        Vec::new()
    }

    /// Starts the optional QoS monitoring loop: every pass asks each client
    /// to probe each running broker.
    pub fn start_monitoring(&self) -> ProcessHandle {
        let this = self.clone();
        self.protocol.sim().spawn(move |ctx| async move {
            loop {
                let clients: Vec<ClientProcess> = this.clients.borrow().iter().cloned().collect();
                for client in clients {
                    if !client.is_running() {
                        continue;
                    }
                    let probe = this.clone();
                    ctx.sim().spawn(move |sub| probe.monitor(sub, client));
                }
                ctx.sleep(MEASUREMENT_INTERVAL_MS).await;
            }
        })
    }

    async fn monitor(self, ctx: ProcessCtx, client: ClientProcess) {
        let brokers: Vec<NodeId> = self
            .brokers
            .borrow()
            .iter()
            .filter(|b| b.is_running())
            .map(BrokerProcess::node)
            .collect();
        for broker in brokers {
            ctx.wait(self.protocol.send(
                self.node,
                client.node(),
                Body::QosRequest { target: broker },
            ))
            .await;
            self.protocol.receive(&ctx, self.node, &[Kind::QosResponse]).await;
        }
    }
}

/// First broker with the fewest total subscribers, preserving list order on
/// ties.
fn least_subscribed(group: &[BrokerProcess]) -> Option<BrokerProcess> {
    group
        .iter()
        .fold(None, |best: Option<&BrokerProcess>, candidate| match best {
            Some(current) if current.total_subscribers() <= candidate.total_subscribers() => best,
            _ => Some(candidate),
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    use super::*;
    use crate::network::topology::SharedTopology;
    use crate::sim::Sim;
    use crate::testing;

    struct Overlay {
        sim: Sim,
        topology: SharedTopology,
        protocol: Protocol,
        rng: SharedRng,
        brokers: BrokerList,
    }

    fn overlay(hosts: &[&str], leg_latency: f64, enable_ack: bool) -> (Overlay, Vec<NodeId>) {
        let (topo, ids) = testing::star_topology(hosts, leg_latency);
        let sim = Sim::new();
        let topology: SharedTopology = Rc::new(RefCell::new(topo));
        let protocol = Protocol::new(&sim, &topology).with_ack(enable_ack);
        let overlay = Overlay {
            sim,
            topology,
            protocol,
            rng: Rc::new(RefCell::new(StdRng::seed_from_u64(0))),
            brokers: Rc::default(),
        };
        (overlay, ids)
    }

    impl Overlay {
        fn broker(&self, node: NodeId) -> BrokerProcess {
            let broker = BrokerProcess::new(
                &self.protocol,
                node,
                Rc::clone(&self.brokers),
                false,
                Rc::clone(&self.rng),
            );
            broker.start();
            broker.start_publish_loop();
            self.brokers.borrow_mut().push(broker.clone());
            broker
        }

        fn client(&self, node: NodeId, broker: NodeId) -> ClientProcess {
            let client =
                ClientProcess::new(&self.protocol, node, broker, false, Rc::clone(&self.rng));
            client.start();
            client
        }

        fn pubs_to(&self, node: NodeId) -> Vec<Message> {
            self.protocol
                .history()
                .into_iter()
                .filter(|m| m.kind() == Kind::Pub && m.destination == node)
                .collect()
        }
    }

    #[test]
    fn publication_fans_out_to_the_subscriber_once() {
        let (ov, ids) = overlay(&["c1", "c2", "b1"], 2.5, false);
        let b1 = ov.broker(ids[2]);
        ov.client(ids[0], b1.node());
        let c2 = ov.client(ids[1], b1.node());
        c2.subscribe("t");
        ov.sim.run_until(100.0);
        assert!(b1.subscribers_of("t").contains(&c2.node()));

        ov.protocol
            .send(ids[0], b1.node(), Body::Pub(Publication::new("t", 100.0, 100.0)));
        ov.sim.run_until(500.0);

        let delivered = ov.pubs_to(c2.node());
        assert_eq!(delivered.len(), 1);
        // 5 ms to the broker plus 5 ms onward
        assert_relative_eq!(delivered[0].timestamp + delivered[0].latency, 110.0);
        // the broker never echoes a publication back to its publisher
        assert!(ov.pubs_to(ids[0]).is_empty());
    }

    #[test]
    fn publication_acks_flow_both_ways() {
        let (ov, ids) = overlay(&["c1", "c2", "b1"], 2.5, true);
        let b1 = ov.broker(ids[2]);
        ov.client(ids[0], b1.node());
        let c2 = ov.client(ids[1], b1.node());
        c2.subscribe("t");
        ov.sim.run_until(100.0);

        ov.protocol
            .send(ids[0], b1.node(), Body::Pub(Publication::new("t", 100.0, 100.0)));
        ov.sim.run_until(500.0);

        let acks: Vec<Message> = ov
            .protocol
            .history()
            .into_iter()
            .filter(|m| m.kind() == Kind::PubAck)
            .collect();
        assert_eq!(acks.len(), 2);
        assert!(acks
            .iter()
            .any(|m| m.source == b1.node() && m.destination == ids[0]));
        assert!(acks
            .iter()
            .any(|m| m.source == c2.node() && m.destination == b1.node()));
        assert_eq!(ov.pubs_to(c2.node()).len(), 1);
    }

    #[test]
    fn publications_cross_broker_peers_without_loops() {
        let (ov, ids) = overlay(&["c1", "c2", "b1", "b2"], 2.5, false);
        let b1 = ov.broker(ids[2]);
        let b2 = ov.broker(ids[3]);
        ov.client(ids[0], b1.node());
        let c2 = ov.client(ids[1], b2.node());
        c2.subscribe("t");
        ov.sim.run_until(100.0);

        ov.protocol
            .send(ids[0], b1.node(), Body::Pub(Publication::new("t", 100.0, 100.0)));
        ov.sim.run_until(1_000.0);

        let delivered = ov.pubs_to(c2.node());
        assert_eq!(delivered.len(), 1);
        let Body::Pub(publication) = &delivered[0].body else {
            panic!("expected a publication");
        };
        assert_eq!(publication.hops, vec![b1.node(), b2.node()]);

        let inter_broker = ov.pubs_to(b2.node());
        assert_eq!(inter_broker.len(), 1);
        assert_eq!(inter_broker[0].source, b1.node());
        // never forwarded back along the hop list
        assert!(ov
            .pubs_to(b1.node())
            .iter()
            .all(|m| m.source != b2.node()));
    }

    #[test]
    fn reconnect_migrates_every_subscription() {
        let (ov, ids) = overlay(&["client", "b_old", "b_new", "ctrl"], 2.5, true);
        let b_old = ov.broker(ids[1]);
        let b_new = ov.broker(ids[2]);
        let client = ov.client(ids[0], b_old.node());
        client.subscribe("t1");
        client.subscribe("t2");
        ov.sim.run_until(100.0);
        assert!(b_old.subscribers_of("t1").contains(&client.node()));
        assert!(b_old.subscribers_of("t2").contains(&client.node()));

        ov.protocol.send(
            ids[3],
            client.node(),
            Body::ReconnectRequest {
                new_broker: b_new.node(),
                optimal_broker: b_new.node(),
            },
        );
        ov.sim.run_until(1_000.0);

        assert_eq!(client.selected_broker(), b_new.node());
        for topic in ["t1", "t2"] {
            assert!(b_new.subscribers_of(topic).contains(&client.node()));
            assert!(!b_old.subscribers_of(topic).contains(&client.node()));
        }
        // the requester got its confirmation
        assert!(ov
            .protocol
            .history()
            .iter()
            .any(|m| m.kind() == Kind::ReconnectAck && m.destination == ids[3]));
    }

    #[test]
    fn qos_probe_reports_the_average_rtt() {
        let (ov, ids) = overlay(&["client", "broker", "ctrl"], 2.5, false);
        let broker = ov.broker(ids[1]);
        let client = ov.client(ids[0], broker.node());
        ov.sim.run_until(10.0);

        ov.protocol.send(
            ids[2],
            client.node(),
            Body::QosRequest {
                target: broker.node(),
            },
        );
        ov.sim.run_until(10_000.0);

        let response = ov
            .protocol
            .history()
            .into_iter()
            .find(|m| m.kind() == Kind::QosResponse)
            .expect("the probe must answer");
        assert_eq!(response.destination, ids[2]);
        let Body::QosResponse { avg_rtt } = response.body else {
            panic!("expected a QoS response");
        };
        assert_relative_eq!(avg_rtt, 10.0);
    }

    #[test]
    fn broker_shutdown_hands_subscribers_to_a_peer() {
        let (ov, ids) = overlay(&["client", "b1", "b2", "ctrl"], 2.5, false);
        let b1 = ov.broker(ids[1]);
        let b2 = ov.broker(ids[2]);
        let client = ov.client(ids[0], b1.node());
        client.subscribe("t");
        ov.sim.run_until(100.0);

        let b1_clone = b1.clone();
        ov.sim.spawn(move |ctx| async move {
            b1_clone.shutdown(&ctx).await;
        });
        ov.sim.run_until(1_000.0);

        assert!(!b1.is_running());
        assert_eq!(client.selected_broker(), b2.node());
        assert!(b2.subscribers_of("t").contains(&client.node()));
    }

    #[test]
    fn client_shutdown_unsubscribes_everywhere() {
        let (ov, ids) = overlay(&["client", "b1"], 2.5, false);
        let b1 = ov.broker(ids[1]);
        let client = ov.client(ids[0], b1.node());
        client.subscribe("t");
        ov.sim.run_until(100.0);
        assert!(b1.subscribers_of("t").contains(&client.node()));

        let shutting_down = client.clone();
        ov.sim.spawn(move |ctx| async move {
            shutting_down.shutdown(&ctx).await;
        });
        ov.sim.run_until(1_000.0);

        assert!(!client.is_running());
        assert!(b1.subscribers_of("t").is_empty());

        // a second shutdown is absorbed by the already-stopped loop
        let again = client.clone();
        ov.sim.spawn(move |ctx| async move {
            again.shutdown(&ctx).await;
        });
        ov.sim.run_until(2_000.0);
        assert!(!client.is_running());
    }

    fn coordinator_fixture(counts: [usize; 3]) -> (Overlay, ClientProcess, Vec<BrokerProcess>) {
        let (ov, ids) = overlay(&["client", "ba", "bb", "bc"], 0.5, false);
        let brokers: Vec<BrokerProcess> = ids[1..].iter().map(|&id| ov.broker(id)).collect();
        let client = ov.client(ids[0], brokers[0].node());
        let mut filler = 0;
        for (broker, &count) in brokers.iter().zip(&counts) {
            for _ in 0..count {
                let node = ov
                    .topology
                    .borrow_mut()
                    .add_node(Node::new(format!("sub{filler}")));
                broker.insert_subscriber("t", node);
                filler += 1;
            }
        }
        let clients = Rc::new(RefCell::new(vec![client.clone()]));
        let coordinator =
            CoordinatorProcess::new(&ov.protocol, clients, Rc::clone(&ov.brokers), false);
        coordinator.start();
        (ov, client, brokers)
    }

    #[test]
    fn coordinator_hysteresis_suppresses_marginal_moves() {
        // delta = 0.1 * 27 = 2.7; 8 + 2.7 >= 10 keeps the client in place
        let (ov, client, brokers) = coordinator_fixture([10, 9, 8]);
        ov.sim.run_until(1_000.0);
        assert_eq!(client.selected_broker(), brokers[0].node());
        assert!(!ov
            .protocol
            .history()
            .iter()
            .any(|m| m.kind() == Kind::ReconnectRequest));
    }

    #[test]
    fn coordinator_moves_clients_past_the_hysteresis_margin() {
        // delta = 0.1 * 24 = 2.4; 5 + 2.4 < 10 triggers exactly one move
        let (ov, client, brokers) = coordinator_fixture([10, 9, 5]);
        ov.sim.run_until(1_000.0);
        assert_eq!(client.selected_broker(), brokers[2].node());
        let requests: Vec<Message> = ov
            .protocol
            .history()
            .into_iter()
            .filter(|m| m.kind() == Kind::ReconnectRequest)
            .collect();
        assert_eq!(requests.len(), 1);
        let Body::ReconnectRequest {
            new_broker,
            optimal_broker,
        } = requests[0].body
        else {
            panic!("expected a reconnect request");
        };
        assert_eq!(new_broker, brokers[2].node());
        assert_eq!(optimal_broker, brokers[2].node());
    }
}
