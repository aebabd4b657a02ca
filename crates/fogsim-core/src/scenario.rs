//! The EMMA evaluation scenario: a staged broker/client deployment across
//! three cloud regions, driven over simulated time.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;

use crate::network::topology::{SharedTopology, Topology};
use crate::network::types::{Connection, Link, Node, NodeId};
use crate::processes::{BrokerList, BrokerProcess, ClientProcess, CoordinatorProcess, SharedRng};
use crate::protocol::Protocol;
use crate::sim::{ProcessCtx, Sim};

/// The regions the scenario script deploys into. The topology handed to
/// [`EmmaScenario::new`] must contain relays with these names.
pub const REGIONS: [&str; 3] = ["eu-central", "eu-west", "us-east"];

/// Tunables of an EMMA run.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct ScenarioConfig {
    /// Scenario name, used in logs.
    #[builder(setter(into))]
    pub name: String,
    /// Run Vivaldi on all processes and use coordinates for broker
    /// selection.
    #[builder(default = false)]
    pub use_vivaldi: bool,
    /// Require acknowledgement handshakes.
    #[builder(default = false)]
    pub enable_ack: bool,
    /// Minutes of simulated time between scenario stages.
    #[builder(default = 1)]
    pub action_interval_mins: u64,
    /// Clients per client group.
    #[builder(default = 10)]
    pub clients_per_group: usize,
    /// Publisher loops per client.
    #[builder(default = 7)]
    pub publishers_per_client: usize,
    /// Publish interval in milliseconds.
    #[builder(default = 100.0)]
    pub publish_interval_ms: f64,
    /// Without Vivaldi, have clients ping every running broker on a fixed
    /// cadence.
    #[builder(default = true)]
    pub ping_all_brokers: bool,
    /// Run the coordinator's QoS monitoring loop.
    #[builder(default = false)]
    pub monitoring: bool,
    /// Seed for broker selection and coordinate updates.
    #[builder(default = 0)]
    pub seed: u64,
    /// Bandwidth of each host's access link in Mbit/s.
    #[builder(default = 1000.0)]
    pub host_link_mbps: f64,
}

/// One EMMA scenario instance. Cheap to clone; all clones share the same
/// run.
#[derive(Clone)]
pub struct EmmaScenario {
    config: Rc<ScenarioConfig>,
    sim: Sim,
    topology: SharedTopology,
    protocol: Protocol,
    rng: SharedRng,
    brokers: BrokerList,
    clients: Rc<RefCell<Vec<ClientProcess>>>,
    counters: Rc<RefCell<FxHashMap<String, u64>>>,
}

impl std::fmt::Debug for EmmaScenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmmaScenario")
            .field("name", &self.config.name)
            .finish()
    }
}

impl EmmaScenario {
    /// Builds a scenario over a prepared topology containing the
    /// [`REGIONS`] relays. With `trace`, every message becomes a CSV row.
    pub fn new(config: ScenarioConfig, topology: Topology, trace: Option<Box<dyn Write>>) -> Self {
        let sim = Sim::new();
        let topology: SharedTopology = Rc::new(RefCell::new(topology));
        let mut protocol = Protocol::new(&sim, &topology).with_ack(config.enable_ack);
        if let Some(writer) = trace {
            protocol = protocol.with_trace(writer);
        }
        let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(config.seed)));
        Self {
            config: Rc::new(config),
            sim,
            topology,
            protocol,
            rng,
            brokers: Rc::default(),
            clients: Rc::default(),
            counters: Rc::default(),
        }
    }

    /// The protocol of this run, e.g. for history inspection.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// The kernel of this run.
    pub fn sim(&self) -> &Sim {
        &self.sim
    }

    /// The brokers spawned so far.
    pub fn brokers(&self) -> Vec<BrokerProcess> {
        self.brokers.borrow().clone()
    }

    /// The clients spawned so far.
    pub fn clients(&self) -> Vec<ClientProcess> {
        self.clients.borrow().clone()
    }

    fn next_name(&self, region: &str, kind: &str) -> String {
        let mut counters = self.counters.borrow_mut();
        let counter = counters.entry(format!("{region}/{kind}")).or_insert(0);
        *counter += 1;
        format!("{region}_{kind}_{counter}")
    }

    /// Materializes a host behind its own access link on the region's
    /// backhaul.
    fn attach_host(&self, name: &str, region: &str) -> NodeId {
        let mut topology = self.topology.borrow_mut();
        let node = topology.add_node(Node::new(name));
        let link = topology.add_link(Link::named(self.config.host_link_mbps, format!("link_{name}")));
        topology
            .add_connection(Connection::new(node, link), false)
            .expect("host-link edges are valid");
        topology
            .add_connection(Connection::new(link, region), false)
            .expect("link-backhaul edges are valid");
        node
    }

    /// Spawns a broker in `region` and starts its loops.
    pub fn spawn_broker(&self, region: &str) -> BrokerProcess {
        let name = self.next_name(region, "broker");
        tracing::info!(minute = self.minute(), %name, "spawning broker");
        let node = self.attach_host(&name, region);
        let broker = BrokerProcess::new(
            &self.protocol,
            node,
            Rc::clone(&self.brokers),
            self.config.use_vivaldi,
            Rc::clone(&self.rng),
        );
        broker.start();
        broker.start_publish_loop();
        if self.config.use_vivaldi {
            let peers = Rc::clone(&self.brokers);
            broker.start_ping_all(move || peers.borrow().iter().map(BrokerProcess::node).collect());
        }
        self.brokers.borrow_mut().push(broker.clone());
        broker
    }

    /// Spawns a client in `region` subscribed to `topic`, with
    /// `publishers` publisher loops.
    pub fn spawn_client(&self, region: &str, topic: &str, publishers: usize) -> ClientProcess {
        let name = self.next_name(region, "client");
        tracing::info!(minute = self.minute(), %name, %topic, publishers, "spawning client");
        let node = self.attach_host(&name, region);
        let initial_broker = self
            .brokers
            .borrow()
            .first()
            .expect("a broker must be spawned before any client")
            .node();
        let client = ClientProcess::new(
            &self.protocol,
            node,
            initial_broker,
            self.config.use_vivaldi,
            Rc::clone(&self.rng),
        );
        client.subscribe(topic);
        client.start();
        for _ in 0..publishers {
            client.start_publisher(topic, self.config.publish_interval_ms);
        }
        if self.config.use_vivaldi {
            client.start_ping_loop();
        } else if self.config.ping_all_brokers {
            let brokers = Rc::clone(&self.brokers);
            client.start_ping_all(move || {
                brokers
                    .borrow()
                    .iter()
                    .filter(|b| b.is_running())
                    .map(BrokerProcess::node)
                    .collect()
            });
        }
        self.clients.borrow_mut().push(client.clone());
        client
    }

    /// Spawns a full client group: `clients_per_group` clients subscribed to
    /// the region topic.
    pub fn spawn_client_group(&self, region: &str) {
        for _ in 0..self.config.clients_per_group {
            self.spawn_client(region, region, self.config.publishers_per_client);
        }
    }

    /// Spawns the coordinator and starts its loops.
    pub fn spawn_coordinator(&self) -> CoordinatorProcess {
        let coordinator = CoordinatorProcess::new(
            &self.protocol,
            Rc::clone(&self.clients),
            Rc::clone(&self.brokers),
            self.config.use_vivaldi,
        );
        coordinator.start();
        if self.config.monitoring {
            coordinator.start_monitoring();
        }
        coordinator
    }

    async fn script(self, ctx: ProcessCtx) {
        let pause = 60_000.0 * self.config.action_interval_mins as f64;
        tracing::info!(name = %self.config.name, "===== starting scenario =====");

        tracing::info!(minute = self.minute(), "[0] spawn coordinator and initial broker");
        self.spawn_coordinator();
        self.spawn_broker("eu-central");
        ctx.sleep(pause).await;

        tracing::info!(
            minute = self.minute(),
            "[1] topic `global`: publisher+subscriber in us-east and eu-west, subscriber in eu-central"
        );
        self.spawn_client("eu-west", "global", 1);
        let central_client = self.spawn_client("eu-central", "global", 0);
        self.spawn_client("us-east", "global", 1);
        ctx.sleep(pause).await;

        tracing::info!(minute = self.minute(), "[2] client group appears in us-east");
        self.spawn_client_group("us-east");
        ctx.sleep(pause).await;

        tracing::info!(minute = self.minute(), "[3] broker spawns in eu-west");
        self.spawn_broker("eu-west");
        ctx.sleep(pause).await;

        tracing::info!(minute = self.minute(), "[4] client group appears in eu-west");
        self.spawn_client_group("eu-west");
        ctx.sleep(pause).await;

        tracing::info!(minute = self.minute(), "[5] broker spawns in us-east");
        let us_east_broker = self.spawn_broker("us-east");
        ctx.sleep(pause).await;

        tracing::info!(minute = self.minute(), "[6] broker spawns in eu-west");
        self.spawn_broker("eu-west");
        ctx.sleep(pause).await;

        tracing::info!(minute = self.minute(), "[7] subscriber in eu-central disappears");
        central_client.shutdown(&ctx).await;
        ctx.sleep(pause).await;

        tracing::info!(minute = self.minute(), "[8] broker shuts down in us-east");
        us_east_broker.shutdown(&ctx).await;
    }

    /// Runs the scenario to completion, stepping the clock one minute at a
    /// time.
    pub fn run(&self) {
        let this = self.clone();
        self.sim.spawn(move |ctx| this.script(ctx));
        let minutes = self.config.action_interval_mins * 10;
        for minute in 1..=minutes {
            self.sim.run_until((minute * 60_000) as f64);
            self.log_state();
        }
    }

    fn minute(&self) -> u64 {
        (self.sim.now() / 60_000.0) as u64
    }

    fn log_state(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let topology = self.topology.borrow();
        for broker in self.brokers.borrow().iter() {
            let subscribers = broker.total_subscribers();
            if subscribers > 0 {
                tracing::debug!(
                    minute = self.minute(),
                    broker = %topology.node(broker.node()).name,
                    subscribers,
                    "subscriber census"
                );
            }
        }
        for client in self.clients.borrow().iter() {
            let backlog = self.protocol.pending(client.node());
            if backlog > 0 {
                tracing::debug!(
                    minute = self.minute(),
                    client = %topology.node(client.node()).name,
                    backlog,
                    "undrained mailbox"
                );
            }
        }
    }
}
