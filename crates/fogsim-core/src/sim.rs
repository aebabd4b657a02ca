//! A deterministic, single-threaded discrete-event kernel.
//!
//! Processes are `async` blocks driven over a virtual clock. The executor
//! polls a process only when one of its events fires, and events scheduled
//! for the same instant fire in schedule order, so runs are exactly
//! reproducible. The clock unit is up to the caller; flows interpret it as
//! seconds, the messaging overlay as milliseconds.

mod store;

pub use store::{FilterStore, Get};

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;

identifier!(ProcessId, usize);

/// A boxed event future, the element type of [`all_of`].
pub type BoxEvent = Pin<Box<dyn Future<Output = ()>>>;

/// Boxes a future into a [`BoxEvent`].
pub fn event<F>(future: F) -> BoxEvent
where
    F: Future<Output = ()> + 'static,
{
    Box::pin(future)
}

/// Delivered to a process resumed by [`Sim::interrupt`]. For flows the cause
/// carries the new bandwidth allocation in Mbit/s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interrupted {
    /// The interrupting party's payload.
    pub cause: f64,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    time: OrderedFloat<f64>,
    seq: u64,
    target: ProcessId,
}

#[derive(Default)]
struct Completion {
    done: bool,
    waiters: Vec<ProcessId>,
}

struct ProcMeta {
    completion: Rc<RefCell<Completion>>,
    interrupt: Rc<Cell<Option<f64>>>,
}

#[derive(Default)]
struct SimState {
    now: f64,
    next_seq: u64,
    next_pid: usize,
    queue: BinaryHeap<Reverse<Scheduled>>,
    futures: FxHashMap<ProcessId, Pin<Box<dyn Future<Output = ()>>>>,
    procs: FxHashMap<ProcessId, ProcMeta>,
}

impl SimState {
    fn push_event(&mut self, time: f64, target: ProcessId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(Scheduled {
            time: OrderedFloat(time),
            seq,
            target,
        }));
    }
}

struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

/// Handle to a simulation kernel. Cloning yields another handle to the same
/// kernel.
#[derive(Clone, Default)]
pub struct Sim {
    state: Rc<RefCell<SimState>>,
}

impl std::fmt::Debug for Sim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sim").field("now", &self.now()).finish()
    }
}

impl Sim {
    /// Creates a kernel with the clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current virtual time.
    pub fn now(&self) -> f64 {
        self.state.borrow().now
    }

    /// Spawns a process. Its first slice runs when the scheduler reaches its
    /// start event at the current instant, not synchronously.
    pub fn spawn<F, Fut>(&self, f: F) -> ProcessHandle
    where
        F: FnOnce(ProcessCtx) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let (pid, completion) = {
            let mut st = self.state.borrow_mut();
            let pid = ProcessId::new(st.next_pid);
            st.next_pid += 1;
            let completion = Rc::new(RefCell::new(Completion::default()));
            st.procs.insert(
                pid,
                ProcMeta {
                    completion: Rc::clone(&completion),
                    interrupt: Rc::new(Cell::new(None)),
                },
            );
            let now = st.now;
            st.push_event(now, pid);
            (pid, completion)
        };
        let future = Box::pin(f(ProcessCtx {
            sim: self.clone(),
            pid,
        }));
        self.state.borrow_mut().futures.insert(pid, future);
        ProcessHandle { pid, completion }
    }

    /// Resumes `pid` at its current interruptible wait with the given cause.
    /// If the process is parked on an uninterruptible wait, the cause stays
    /// pending until its next interruptible one.
    pub fn interrupt(&self, pid: ProcessId, cause: f64) {
        let mut st = self.state.borrow_mut();
        let slot = match st.procs.get(&pid) {
            Some(meta) if !meta.completion.borrow().done => Rc::clone(&meta.interrupt),
            _ => return,
        };
        slot.set(Some(cause));
        let now = st.now;
        st.push_event(now, pid);
    }

    /// Executes every event scheduled at or before `until`, then advances
    /// the clock to `until`.
    pub fn run_until(&self, until: f64) {
        loop {
            let target = {
                let mut st = self.state.borrow_mut();
                let due = st
                    .queue
                    .peek()
                    .map(|Reverse(next)| (next.time.into_inner(), next.target));
                match due {
                    Some((time, target)) if time <= until => {
                        st.queue.pop();
                        st.now = time;
                        target
                    }
                    _ => break,
                }
            };
            self.step(target);
        }
        let mut st = self.state.borrow_mut();
        if until.is_finite() && until > st.now {
            st.now = until;
        }
    }

    /// Runs until the event queue is exhausted.
    pub fn run(&self) {
        self.run_until(f64::INFINITY);
    }

    fn step(&self, pid: ProcessId) {
        // The process may have finished already; late wakeups are ignored.
        let Some(mut future) = self.state.borrow_mut().futures.remove(&pid) else {
            return;
        };
        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Pending => {
                self.state.borrow_mut().futures.insert(pid, future);
            }
            Poll::Ready(()) => {
                let mut st = self.state.borrow_mut();
                if let Some(meta) = st.procs.remove(&pid) {
                    let mut completion = meta.completion.borrow_mut();
                    completion.done = true;
                    let waiters = std::mem::take(&mut completion.waiters);
                    drop(completion);
                    let now = st.now;
                    for waiter in waiters {
                        st.push_event(now, waiter);
                    }
                }
            }
        }
    }

    pub(crate) fn schedule_wake(&self, time: f64, target: ProcessId) {
        self.state.borrow_mut().push_event(time, target);
    }

    fn interrupt_slot(&self, pid: ProcessId) -> Option<Rc<Cell<Option<f64>>>> {
        self.state
            .borrow()
            .procs
            .get(&pid)
            .map(|meta| Rc::clone(&meta.interrupt))
    }
}

/// Handle to a spawned process. Dropping it does not cancel the process.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: ProcessId,
    completion: Rc<RefCell<Completion>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ProcessHandle").field(&self.pid).finish()
    }
}

impl ProcessHandle {
    /// The process's ID, usable with [`Sim::interrupt`].
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Whether the process has run to completion.
    pub fn is_done(&self) -> bool {
        self.completion.borrow().done
    }
}

/// Capability handed to every process; creates the futures a process may
/// suspend on.
#[derive(Debug, Clone)]
pub struct ProcessCtx {
    sim: Sim,
    pid: ProcessId,
}

impl ProcessCtx {
    /// The kernel this process runs on.
    pub fn sim(&self) -> &Sim {
        &self.sim
    }

    /// This process's ID.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// The current virtual time.
    pub fn now(&self) -> f64 {
        self.sim.now()
    }

    /// Suspends the process for `delay` units of virtual time.
    pub fn sleep(&self, delay: f64) -> Sleep {
        Sleep {
            timer: Timer::new(self.sim.clone(), self.pid, delay),
        }
    }

    /// Like [`sleep`](Self::sleep), but may be cut short by
    /// [`Sim::interrupt`].
    pub fn hold(&self, delay: f64) -> Hold {
        Hold {
            timer: Timer::new(self.sim.clone(), self.pid, delay),
            slot: self.sim.interrupt_slot(self.pid),
        }
    }

    /// Completes when `handle`'s process finishes. Resolves immediately for
    /// finished processes.
    pub fn wait(&self, handle: ProcessHandle) -> Join {
        Join {
            completion: handle.completion,
            waiter: self.pid,
            registered: false,
        }
    }
}

struct Timer {
    sim: Sim,
    pid: ProcessId,
    delay: f64,
    deadline: Option<f64>,
}

impl Timer {
    fn new(sim: Sim, pid: ProcessId, delay: f64) -> Self {
        Self {
            sim,
            pid,
            delay,
            deadline: None,
        }
    }

    fn poll_elapsed(&mut self) -> bool {
        let mut st = self.sim.state.borrow_mut();
        match self.deadline {
            None => {
                let deadline = st.now + self.delay.max(0.0);
                st.push_event(deadline, self.pid);
                self.deadline = Some(deadline);
                false
            }
            Some(deadline) => st.now >= deadline,
        }
    }
}

/// Future returned by [`ProcessCtx::sleep`].
pub struct Sleep {
    timer: Timer,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.get_mut().timer.poll_elapsed() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Future returned by [`ProcessCtx::hold`].
pub struct Hold {
    timer: Timer,
    slot: Option<Rc<Cell<Option<f64>>>>,
}

impl Future for Hold {
    type Output = Result<(), Interrupted>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(slot) = &this.slot {
            if let Some(cause) = slot.take() {
                return Poll::Ready(Err(Interrupted { cause }));
            }
        }
        if this.timer.poll_elapsed() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

/// Future returned by [`ProcessCtx::wait`].
pub struct Join {
    completion: Rc<RefCell<Completion>>,
    waiter: ProcessId,
    registered: bool,
}

impl Future for Join {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.completion.borrow().done {
            return Poll::Ready(());
        }
        if !this.registered {
            this.completion.borrow_mut().waiters.push(this.waiter);
            this.registered = true;
        }
        Poll::Pending
    }
}

/// Joins a set of events; completes once every one of them has completed.
pub fn all_of(events: Vec<BoxEvent>) -> AllOf {
    AllOf { pending: events }
}

/// Future returned by [`all_of`].
pub struct AllOf {
    pending: Vec<BoxEvent>,
}

impl Future for AllOf {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        this.pending
            .retain_mut(|event| event.as_mut().poll(cx).is_pending());
        if this.pending.is_empty() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}
