//! TCP-like flows sharing link bandwidth with max-min fairness.
//!
//! Every flow registers with each link on its route. When a flow joins or
//! leaves, the scheduler rebalances the whole affected subnet and interrupts
//! the pending completion events of every flow whose allocation changed, so
//! in-flight transfers re-estimate their remaining time at the new rate.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::network::topology::SharedTopology;
use crate::network::types::{LinkId, NodeId, Route};
use crate::sim::{Interrupted, ProcessCtx, ProcessHandle, ProcessId, Sim};
use crate::units::Bytes;

identifier!(FlowId, usize);

/// Connection establishment costs 1.5 RTTs.
const HANDSHAKE_RTTS: f64 = 1.5;

/// A byte transfer along a fixed route. Cloning yields another handle to the
/// same transfer.
#[derive(Debug, Clone)]
pub struct Flow {
    inner: Rc<RefCell<FlowInner>>,
}

#[derive(Debug)]
struct FlowInner {
    id: FlowId,
    size: f64,
    sent: f64,
    route: Route,
}

impl Flow {
    /// The flow's ID.
    pub fn id(&self) -> FlowId {
        self.inner.borrow().id
    }

    /// Transfer size in bytes.
    pub fn size(&self) -> f64 {
        self.inner.borrow().size
    }

    /// Bytes transferred so far.
    pub fn sent(&self) -> f64 {
        self.inner.borrow().sent
    }

    /// The links the flow traverses.
    pub fn hops(&self) -> Vec<LinkId> {
        self.inner.borrow().route.hops.clone()
    }
}

struct RegisteredFlow {
    hops: Vec<LinkId>,
    process: ProcessId,
}

#[derive(Default)]
struct SchedulerState {
    next_flow: usize,
    registered: FxHashMap<FlowId, RegisteredFlow>,
}

enum SubnetItem {
    Flow(FlowId),
    Link(LinkId),
}

/// Starts flows and keeps link allocations max-min fair as they come and go.
#[derive(Clone)]
pub struct FlowScheduler {
    sim: Sim,
    topology: SharedTopology,
    state: Rc<RefCell<SchedulerState>>,
}

impl std::fmt::Debug for FlowScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowScheduler")
            .field("live_flows", &self.state.borrow().registered.len())
            .finish()
    }
}

impl FlowScheduler {
    /// Creates a scheduler over the given kernel and topology.
    pub fn new(sim: &Sim, topology: &SharedTopology) -> Self {
        Self {
            sim: sim.clone(),
            topology: Rc::clone(topology),
            state: Rc::default(),
        }
    }

    /// Starts a transfer of `size` along `route`. The returned handle
    /// completes when the transfer finishes or fails.
    pub fn transfer(&self, size: Bytes, route: Route) -> Result<(Flow, ProcessHandle), FlowError> {
        if route.hops.is_empty() {
            return Err(FlowError::NoRoute {
                from: route.source,
                destination: route.destination,
            });
        }
        let id = {
            let mut state = self.state.borrow_mut();
            let id = FlowId::new(state.next_flow);
            state.next_flow += 1;
            id
        };
        let flow = Flow {
            inner: Rc::new(RefCell::new(FlowInner {
                id,
                size: size.into_f64(),
                sent: 0.0,
                route,
            })),
        };
        let scheduler = self.clone();
        let started = flow.clone();
        let handle = self.sim.spawn(move |ctx| scheduler.run_flow(ctx, started));
        Ok((flow, handle))
    }

    async fn run_flow(self, ctx: ProcessCtx, flow: Flow) {
        if let Err(err) = self.drive(&ctx, &flow).await {
            tracing::error!(flow = flow.id().inner(), %err, "flow failed");
        }
        // guaranteed release path, also on failure
        self.remove_and_rebalance(&flow);
    }

    async fn drive(&self, ctx: &ProcessCtx, flow: &Flow) -> Result<(), FlowError> {
        let (size, rtt) = {
            let inner = flow.inner.borrow();
            (inner.size, inner.route.rtt)
        };
        let started_at = ctx.now();

        // rough estimate of TCP connection establishment
        let connection_time = HANDSHAKE_RTTS * rtt / 1000.0;
        if connection_time > 0.0 {
            ctx.sleep(connection_time).await;
        }

        self.add_and_rebalance(flow, ctx.pid());

        let mut goodput = self.goodput_bps(flow)?;
        let mut transmission_time = size / goodput;
        loop {
            let slice_start = ctx.now();
            match ctx.hold(transmission_time).await {
                Ok(()) => {
                    flow.inner.borrow_mut().sent = size;
                    break;
                }
                Err(Interrupted { cause }) => {
                    let sent = {
                        let mut inner = flow.inner.borrow_mut();
                        inner.sent += goodput * (ctx.now() - slice_start);
                        inner.sent
                    };
                    if sent >= size {
                        break;
                    }
                    tracing::debug!(
                        now = ctx.now(),
                        flow = flow.id().inner(),
                        new_bw = cause,
                        sent,
                        remaining = size - sent,
                        "transfer interrupted"
                    );
                    goodput = self.goodput_bps(flow)?;
                    transmission_time = (size - sent) / goodput;
                }
            }
        }
        tracing::debug!(
            now = ctx.now(),
            flow = flow.id().inner(),
            elapsed = ctx.now() - started_at,
            "transfer completed"
        );
        Ok(())
    }

    /// The flow's current goodput in bytes per second, bounded by its
    /// slowest hop.
    fn goodput_bps(&self, flow: &Flow) -> Result<f64, FlowError> {
        let inner = flow.inner.borrow();
        let topology = self.topology.borrow();
        let goodput = inner
            .route
            .hops
            .iter()
            .filter_map(|&link| topology.link(link).goodput_bps(inner.id))
            .fold(f64::INFINITY, f64::min);
        if !goodput.is_finite() || goodput <= 0.0 {
            return Err(FlowError::ZeroGoodput { flow: inner.id });
        }
        Ok(goodput)
    }

    fn add_and_rebalance(&self, flow: &Flow, process: ProcessId) {
        let (id, hops) = {
            let inner = flow.inner.borrow();
            (inner.id, inner.route.hops.clone())
        };
        self.state.borrow_mut().registered.insert(
            id,
            RegisteredFlow {
                hops: hops.clone(),
                process,
            },
        );
        let affected = self.collect_subnet(id);
        {
            let mut topology = self.topology.borrow_mut();
            for &link in &hops {
                let link = topology.link_mut(link);
                link.num_flows += 1;
                link.recalculate_max_allocatable();
            }
        }
        self.rebalance(id, affected);
    }

    fn remove_and_rebalance(&self, flow: &Flow) {
        let id = flow.id();
        if !self.state.borrow().registered.contains_key(&id) {
            return;
        }
        let mut affected = self.collect_subnet(id);
        affected.remove(&id);
        let hops = self
            .state
            .borrow_mut()
            .registered
            .remove(&id)
            .expect("checked above")
            .hops;
        {
            let mut topology = self.topology.borrow_mut();
            for &link in &hops {
                let link = topology.link_mut(link);
                link.num_flows -= 1;
                link.allocation.remove(&id);
                link.recalculate_max_allocatable();
            }
        }
        self.rebalance(id, affected);
    }

    /// Transitive closure of the flows and links sharing any link with
    /// `origin`, so a rebalance cannot miss a transitively affected flow.
    fn collect_subnet(&self, origin: FlowId) -> FxHashSet<FlowId> {
        let state = self.state.borrow();
        let topology = self.topology.borrow();
        let mut flows = FxHashSet::default();
        let mut links = FxHashSet::default();
        let mut stack = vec![SubnetItem::Flow(origin)];
        while let Some(item) = stack.pop() {
            match item {
                SubnetItem::Flow(flow) => {
                    if !flows.insert(flow) {
                        continue;
                    }
                    if let Some(registered) = state.registered.get(&flow) {
                        stack.extend(registered.hops.iter().map(|&l| SubnetItem::Link(l)));
                    }
                }
                SubnetItem::Link(link) => {
                    if !links.insert(link) {
                        continue;
                    }
                    stack.extend(
                        topology
                            .link(link)
                            .allocation
                            .keys()
                            .map(|&f| SubnetItem::Flow(f)),
                    );
                }
            }
        }
        flows
    }

    /// Iterated max-min fairness: repeatedly fix the most bottlenecked
    /// remaining flow at its bottleneck, then notify every flow whose
    /// allocation changed (the trigger already knows).
    fn rebalance(&self, trigger: FlowId, mut affected: FxHashSet<FlowId>) {
        let mut changed: BTreeMap<FlowId, f64> = BTreeMap::new();
        {
            let state = self.state.borrow();
            let mut topology = self.topology.borrow_mut();
            while !affected.is_empty() {
                let mut ids: Vec<FlowId> = affected.iter().copied().collect();
                ids.sort();
                // lowest bottleneck first; flow ID order breaks ties
                let (flow, request) = ids
                    .iter()
                    .map(|&flow| {
                        let bottleneck = state.registered[&flow]
                            .hops
                            .iter()
                            .map(|&l| topology.link(l).max_allocatable())
                            .fold(f64::INFINITY, f64::min);
                        (flow, bottleneck)
                    })
                    .fold(None, |best: Option<(FlowId, f64)>, candidate| match best {
                        Some((_, lowest)) if lowest <= candidate.1 => best,
                        _ => Some(candidate),
                    })
                    .expect("affected set is non-empty");

                let mut any_change = false;
                for &link in &state.registered[&flow].hops {
                    let link = topology.link_mut(link);
                    if link.allocation.get(&flow) == Some(&request) {
                        continue;
                    }
                    any_change = true;
                    link.allocation.insert(flow, request);
                    link.recalculate_max_allocatable();
                }
                if any_change {
                    changed.insert(flow, request);
                }
                affected.remove(&flow);
            }
        }
        let state = self.state.borrow();
        for (&flow, &bandwidth) in &changed {
            if flow == trigger {
                continue;
            }
            if let Some(registered) = state.registered.get(&flow) {
                self.sim.interrupt(registered.process, bandwidth);
            }
        }
    }
}

/// The ways a flow can fail.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// There is no route with at least one link between the endpoints.
    #[error("no route from node {from} to node {destination}")]
    NoRoute {
        /// The flow's source node.
        from: NodeId,
        /// The flow's destination node.
        destination: NodeId,
    },

    /// The flow's allocation collapsed and the transfer cannot progress.
    #[error("goodput for flow {flow} is zero or negative")]
    ZeroGoodput {
        /// The affected flow.
        flow: FlowId,
    },
}
