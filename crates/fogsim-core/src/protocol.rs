//! Message envelopes and the latency-aware delivery protocol.
//!
//! [`Protocol::send`] stamps a message with the topology's sampled latency
//! and spawns a delivery process; the message becomes visible in the
//! destination's mailbox only once that latency has elapsed. Mailboxes are
//! per-node [`FilterStore`]s keyed by node identity and persist for the
//! whole simulation.

use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::network::topology::SharedTopology;
use crate::network::types::NodeId;
use crate::sim::{FilterStore, Get, ProcessCtx, ProcessHandle, Sim};

/// Column order of the CSV message trace.
pub const TRACE_HEADER: [&str; 12] = [
    "timestamp",
    "msg_type",
    "source",
    "destination",
    "latency",
    "size",
    "management",
    "topic",
    "broker",
    "optimal_broker",
    "data",
    "e2e_latency",
];

/// Payload of a publication as it fans out broker to broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    /// The published topic.
    pub topic: String,
    /// Application payload; publishers send their current timestamp.
    pub data: f64,
    /// Brokers this publication has visited, in order. A broker never
    /// forwards to a broker already listed here.
    pub hops: Vec<NodeId>,
    /// Virtual time of the original publish.
    pub first_sent: f64,
    /// Accumulated one-way latency over every hop so far, in milliseconds.
    pub e2e_latency: f64,
}

impl Publication {
    /// Creates a fresh publication.
    pub fn new(topic: impl Into<String>, data: f64, now: f64) -> Self {
        Self {
            topic: topic.into(),
            data,
            hops: Vec::new(),
            first_sent: now,
            e2e_latency: 0.0,
        }
    }
}

/// The closed set of protocol messages.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Body {
    Ping,
    Pong { ping_latency: f64, rtt: f64 },
    Sub { topic: String },
    SubAck,
    Unsub { topic: String },
    UnsubAck,
    Pub(Publication),
    PubAck,
    FindRandomBrokersRequest,
    FindRandomBrokersResponse { brokers: Vec<NodeId> },
    FindClosestBrokersRequest,
    FindClosestBrokersResponse { brokers: Vec<NodeId> },
    ReconnectRequest { new_broker: NodeId, optimal_broker: NodeId },
    ReconnectAck,
    QosRequest { target: NodeId },
    QosResponse { avg_rtt: f64 },
    Shutdown,
}

/// Message kind tags, used for filtered receives and the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Kind {
    Ping,
    Pong,
    Sub,
    SubAck,
    Unsub,
    UnsubAck,
    Pub,
    PubAck,
    FindRandomBrokersRequest,
    FindRandomBrokersResponse,
    FindClosestBrokersRequest,
    FindClosestBrokersResponse,
    ReconnectRequest,
    ReconnectAck,
    QosRequest,
    QosResponse,
    Shutdown,
}

impl Kind {
    /// The kind's wire name.
    pub fn name(self) -> &'static str {
        match self {
            Kind::Ping => "Ping",
            Kind::Pong => "Pong",
            Kind::Sub => "Sub",
            Kind::SubAck => "SubAck",
            Kind::Unsub => "Unsub",
            Kind::UnsubAck => "UnsubAck",
            Kind::Pub => "Pub",
            Kind::PubAck => "PubAck",
            Kind::FindRandomBrokersRequest => "FindRandomBrokersRequest",
            Kind::FindRandomBrokersResponse => "FindRandomBrokersResponse",
            Kind::FindClosestBrokersRequest => "FindClosestBrokersRequest",
            Kind::FindClosestBrokersResponse => "FindClosestBrokersResponse",
            Kind::ReconnectRequest => "ReconnectRequest",
            Kind::ReconnectAck => "ReconnectAck",
            Kind::QosRequest => "QoSRequest",
            Kind::QosResponse => "QoSResponse",
            Kind::Shutdown => "Shutdown",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Body {
    /// The body's kind tag.
    pub fn kind(&self) -> Kind {
        match self {
            Body::Ping => Kind::Ping,
            Body::Pong { .. } => Kind::Pong,
            Body::Sub { .. } => Kind::Sub,
            Body::SubAck => Kind::SubAck,
            Body::Unsub { .. } => Kind::Unsub,
            Body::UnsubAck => Kind::UnsubAck,
            Body::Pub(_) => Kind::Pub,
            Body::PubAck => Kind::PubAck,
            Body::FindRandomBrokersRequest => Kind::FindRandomBrokersRequest,
            Body::FindRandomBrokersResponse { .. } => Kind::FindRandomBrokersResponse,
            Body::FindClosestBrokersRequest => Kind::FindClosestBrokersRequest,
            Body::FindClosestBrokersResponse { .. } => Kind::FindClosestBrokersResponse,
            Body::ReconnectRequest { .. } => Kind::ReconnectRequest,
            Body::ReconnectAck => Kind::ReconnectAck,
            Body::QosRequest { .. } => Kind::QosRequest,
            Body::QosResponse { .. } => Kind::QosResponse,
            Body::Shutdown => Kind::Shutdown,
        }
    }

    /// Wire size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Body::Ping | Body::Pong { .. } | Body::Shutdown => 5,
            Body::SubAck | Body::UnsubAck | Body::PubAck => 5,
            Body::Sub { topic } | Body::Unsub { topic } => 5 + topic.len() as u64,
            Body::Pub(publication) => 10 + publication.topic.len() as u64,
            Body::FindRandomBrokersRequest | Body::FindClosestBrokersRequest => 5,
            Body::FindRandomBrokersResponse { brokers }
            | Body::FindClosestBrokersResponse { brokers } => 1 + 5 * brokers.len() as u64,
            Body::ReconnectRequest { .. } | Body::ReconnectAck => 47,
            Body::QosRequest { .. } => 13,
            Body::QosResponse { .. } => 9,
        }
    }

    /// Whether this is control-plane traffic carrying no application
    /// payload.
    pub fn is_management(&self) -> bool {
        !matches!(
            self,
            Body::Sub { .. }
                | Body::SubAck
                | Body::Unsub { .. }
                | Body::UnsubAck
                | Body::Pub(_)
                | Body::PubAck
        )
    }
}

/// A stamped message envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Sending node.
    pub source: NodeId,
    /// Receiving node.
    pub destination: NodeId,
    /// Virtual time of the send.
    pub timestamp: f64,
    /// One-way latency stamped at send time, in milliseconds.
    pub latency: f64,
    /// The payload.
    pub body: Body,
}

impl Message {
    /// The message's kind tag.
    pub fn kind(&self) -> Kind {
        self.body.kind()
    }

    /// Wire size in bytes.
    pub fn size(&self) -> u64 {
        self.body.size()
    }
}

struct ProtocolState {
    stores: FxHashMap<NodeId, FilterStore<Message>>,
    history: Option<Vec<Message>>,
    trace: Option<csv::Writer<Box<dyn Write>>>,
    enable_ack: bool,
}

/// The messaging protocol over one topology. Cloning yields another handle
/// to the same protocol instance.
#[derive(Clone)]
pub struct Protocol {
    sim: Sim,
    topology: SharedTopology,
    state: Rc<RefCell<ProtocolState>>,
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("enable_ack", &self.ack_enabled())
            .finish()
    }
}

impl Protocol {
    /// Creates a protocol over the given kernel and topology, with in-memory
    /// history enabled and acknowledgements disabled.
    pub fn new(sim: &Sim, topology: &SharedTopology) -> Self {
        Self {
            sim: sim.clone(),
            topology: Rc::clone(topology),
            state: Rc::new(RefCell::new(ProtocolState {
                stores: FxHashMap::default(),
                history: Some(Vec::new()),
                trace: None,
                enable_ack: false,
            })),
        }
    }

    /// Enables or disables acknowledgement handshakes.
    pub fn with_ack(self, enable: bool) -> Self {
        self.state.borrow_mut().enable_ack = enable;
        self
    }

    /// Disables the in-memory message history (useful for long runs).
    pub fn without_history(self) -> Self {
        self.state.borrow_mut().history = None;
        self
    }

    /// Writes one CSV trace row per send to `writer`.
    pub fn with_trace(self, writer: Box<dyn Write>) -> Self {
        let mut trace = csv::Writer::from_writer(writer);
        if let Err(err) = trace.write_record(TRACE_HEADER) {
            tracing::warn!(%err, "failed to write trace header");
        }
        self.state.borrow_mut().trace = Some(trace);
        self
    }

    /// Whether acknowledgement handshakes are enabled.
    pub fn ack_enabled(&self) -> bool {
        self.state.borrow().enable_ack
    }

    /// The kernel this protocol schedules on.
    pub fn sim(&self) -> &Sim {
        &self.sim
    }

    /// The topology this protocol routes over.
    pub fn topology(&self) -> &SharedTopology {
        &self.topology
    }

    /// A snapshot of every message sent so far (empty when history is
    /// disabled).
    pub fn history(&self) -> Vec<Message> {
        self.state.borrow().history.clone().unwrap_or_default()
    }

    /// Number of messages buffered for `node` that no process has received
    /// yet.
    pub fn pending(&self, node: NodeId) -> usize {
        self.store(node).len()
    }

    /// Stamps `body` and dispatches it from `source` to `destination`. The
    /// returned handle completes once the message is delivered.
    pub fn send(&self, source: NodeId, destination: NodeId, body: Body) -> ProcessHandle {
        let now = self.sim.now();
        let latency = self
            .topology
            .borrow_mut()
            .latency(source, destination, false);
        let mut message = Message {
            source,
            destination,
            timestamp: now,
            latency,
            body,
        };
        match &mut message.body {
            Body::Pub(publication) => publication.e2e_latency += latency,
            Body::Pong { ping_latency, rtt } => *rtt = *ping_latency + latency,
            _ => {}
        }
        self.record(&message);
        let store = self.store(destination);
        self.sim.spawn(move |ctx| async move {
            ctx.sleep(latency).await;
            store.put(message);
        })
    }

    /// The next message for `node` whose kind is in `kinds` (any message if
    /// `kinds` is empty).
    pub fn receive(&self, ctx: &ProcessCtx, node: NodeId, kinds: &[Kind]) -> Get<Message> {
        let store = self.store(node);
        if kinds.is_empty() {
            return store.get(ctx);
        }
        let kinds = kinds.to_vec();
        store.get_filtered(ctx, move |message: &Message| kinds.contains(&message.kind()))
    }

    fn store(&self, node: NodeId) -> FilterStore<Message> {
        let mut state = self.state.borrow_mut();
        state
            .stores
            .entry(node)
            .or_insert_with(|| FilterStore::new(&self.sim))
            .clone()
    }

    fn record(&self, message: &Message) {
        let mut state = self.state.borrow_mut();
        if let Some(history) = &mut state.history {
            history.push(message.clone());
        }
        if let Some(trace) = &mut state.trace {
            let row = self.trace_row(message);
            if let Err(err) = trace.write_record(&row) {
                tracing::warn!(%err, "failed to write trace row");
            }
        }
    }

    fn trace_row(&self, message: &Message) -> [String; 12] {
        let topology = self.topology.borrow();
        let name = |id: NodeId| topology.node(id).name.clone();
        let mut topic = String::new();
        let mut broker = String::new();
        let mut optimal_broker = String::new();
        let mut data = String::new();
        let mut e2e_latency = String::new();
        match &message.body {
            Body::Sub { topic: t } | Body::Unsub { topic: t } => topic = t.clone(),
            Body::Pub(publication) => {
                topic = publication.topic.clone();
                data = publication.data.to_string();
                e2e_latency = publication.e2e_latency.to_string();
            }
            Body::ReconnectRequest {
                new_broker,
                optimal_broker: optimal,
            } => {
                broker = name(*new_broker);
                optimal_broker = name(*optimal);
            }
            _ => {}
        }
        [
            message.timestamp.to_string(),
            message.kind().to_string(),
            name(message.source),
            name(message.destination),
            message.latency.to_string(),
            message.size().to_string(),
            message.body.is_management().to_string(),
            topic,
            broker,
            optimal_broker,
            data,
            e2e_latency,
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use approx::assert_relative_eq;

    use super::*;
    use crate::testing;

    #[test]
    fn delivery_happens_after_the_stamped_latency() {
        let (sim, _topology, protocol, a, b) = testing::messaging_pair();
        protocol.send(a, b, Body::Ping);
        let received: Rc<RefCell<Option<(f64, Message)>>> = Rc::default();
        let received2 = Rc::clone(&received);
        let proto = protocol.clone();
        sim.spawn(move |ctx| async move {
            let message = proto.receive(&ctx, b, &[]).await;
            *received2.borrow_mut() = Some((ctx.now(), message));
        });
        sim.run();
        let received = received.borrow();
        let (at, message) = received.as_ref().unwrap();
        assert_relative_eq!(*at, 1.0);
        assert_eq!(message.kind(), Kind::Ping);
        assert_eq!(message.source, a);
        assert_relative_eq!(message.latency, 1.0);
    }

    #[test]
    fn same_route_messages_arrive_in_send_order() {
        let (sim, _topology, protocol, a, b) = testing::messaging_pair();
        protocol.send(a, b, Body::Sub { topic: "one".into() });
        protocol.send(a, b, Body::Sub { topic: "two".into() });
        let seen: Rc<RefCell<Vec<String>>> = Rc::default();
        let seen2 = Rc::clone(&seen);
        let proto = protocol.clone();
        sim.spawn(move |ctx| async move {
            for _ in 0..2 {
                if let Body::Sub { topic } = proto.receive(&ctx, b, &[]).await.body {
                    seen2.borrow_mut().push(topic);
                }
            }
        });
        sim.run();
        assert_eq!(*seen.borrow(), vec!["one", "two"]);
    }

    #[test]
    fn pong_rtt_completes_the_round_trip() {
        let (sim, _topology, protocol, a, b) = testing::messaging_pair();
        protocol.send(
            b,
            a,
            Body::Pong {
                ping_latency: 1.0,
                rtt: 0.0,
            },
        );
        sim.run();
        let history = protocol.history();
        let Body::Pong { rtt, .. } = history[0].body else {
            panic!("expected a pong");
        };
        assert_relative_eq!(rtt, 2.0);
    }

    #[test]
    fn publication_latency_accumulates_per_send() {
        let (sim, _topology, protocol, a, b) = testing::messaging_pair();
        let publication = Publication::new("t", 0.0, 0.0);
        protocol.send(a, b, Body::Pub(publication));
        sim.run();
        let history = protocol.history();
        let Body::Pub(sent) = &history[0].body else {
            panic!("expected a publication");
        };
        assert_relative_eq!(sent.e2e_latency, 1.0);
    }

    #[test]
    fn message_sizes_match_the_wire_model() {
        assert_eq!(Body::Ping.size(), 5);
        assert_eq!(Body::Shutdown.size(), 5);
        assert_eq!(Body::Sub { topic: "abc".into() }.size(), 8);
        assert_eq!(Body::Pub(Publication::new("abc", 0.0, 0.0)).size(), 13);
        assert_eq!(Body::FindRandomBrokersRequest.size(), 5);
        assert_eq!(
            Body::FindClosestBrokersResponse {
                brokers: vec![NodeId::ZERO; 5]
            }
            .size(),
            26
        );
        assert_eq!(
            Body::ReconnectRequest {
                new_broker: NodeId::ZERO,
                optimal_broker: NodeId::ZERO
            }
            .size(),
            47
        );
        assert_eq!(Body::QosRequest { target: NodeId::ZERO }.size(), 13);
        assert_eq!(Body::QosResponse { avg_rtt: 0.0 }.size(), 9);
    }

    #[test]
    fn management_flags_split_control_and_data_plane() {
        assert!(Body::Ping.is_management());
        assert!(Body::Shutdown.is_management());
        assert!(Body::FindClosestBrokersRequest.is_management());
        assert!(!Body::Sub { topic: "t".into() }.is_management());
        assert!(!Body::SubAck.is_management());
        assert!(!Body::Pub(Publication::new("t", 0.0, 0.0)).is_management());
        assert!(!Body::PubAck.is_management());
    }

    #[test]
    fn trace_rows_follow_the_schema() -> anyhow::Result<()> {
        let (sim, topology, a, b) = testing::messaging_pair_parts();
        let mut file = tempfile::NamedTempFile::new()?;
        let protocol = Protocol::new(&sim, &topology)
            .with_trace(Box::new(file.reopen()?));
        protocol.send(a, b, Body::Sub { topic: "t".into() });
        protocol.send(
            a,
            b,
            Body::ReconnectRequest {
                new_broker: b,
                optimal_broker: b,
            },
        );
        sim.run();
        drop(protocol); // flush on drop

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestamp,msg_type,source,destination,latency,size,management,topic,broker,optimal_broker,data,e2e_latency"
        );
        let sub: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(sub[1], "Sub");
        assert_eq!(sub[2], "a");
        assert_eq!(sub[3], "b");
        assert_eq!(sub[5], "6");
        assert_eq!(sub[6], "false");
        assert_eq!(sub[7], "t");
        let reconnect: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(reconnect[1], "ReconnectRequest");
        assert_eq!(reconnect[6], "true");
        assert_eq!(reconnect[8], "b");
        assert_eq!(reconnect[9], "b");
        Ok(())
    }

    #[test]
    fn unrouted_sends_deliver_instantly() {
        // detached nodes (e.g. the coordinator) have rtt-0 routes
        let sim = Sim::new();
        let mut topo = crate::Topology::new();
        let a = topo.add_node(crate::Node::new("a"));
        let b = topo.add_node(crate::Node::new("b"));
        let topology: SharedTopology = Rc::new(RefCell::new(topo));
        let protocol = Protocol::new(&sim, &topology);
        protocol.send(a, b, Body::Ping);
        sim.run();
        assert_eq!(sim.now(), 0.0);
        assert_eq!(protocol.pending(b), 1);
    }
}
