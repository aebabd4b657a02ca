//! Unbounded FIFO stores with filtered retrieval.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use super::{ProcessCtx, ProcessId, Sim};

type Predicate<T> = Rc<dyn Fn(&T) -> bool>;

struct Getter<T> {
    predicate: Predicate<T>,
    slot: Weak<RefCell<Option<T>>>,
    target: ProcessId,
}

struct StoreState<T> {
    items: VecDeque<T>,
    getters: VecDeque<Getter<T>>,
}

impl<T: 'static> Default for StoreState<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            getters: VecDeque::new(),
        }
    }
}

/// An unbounded FIFO buffer whose consumers may filter on a predicate.
///
/// A [`put`](Self::put) wakes the oldest waiting getter whose predicate
/// matches, in registration order; unmatched items buffer indefinitely. A
/// getter dropped mid-wait is pruned without consuming any item.
pub struct FilterStore<T> {
    sim: Sim,
    state: Rc<RefCell<StoreState<T>>>,
}

impl<T: 'static> Clone for FilterStore<T> {
    fn clone(&self) -> Self {
        Self {
            sim: self.sim.clone(),
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: 'static> std::fmt::Debug for FilterStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterStore")
            .field("items", &self.len())
            .finish()
    }
}

impl<T: 'static> FilterStore<T> {
    /// Creates an empty store on the given kernel.
    pub fn new(sim: &Sim) -> Self {
        Self {
            sim: sim.clone(),
            state: Rc::default(),
        }
    }

    /// Non-blocking insert. Delivers to the oldest live matching getter, or
    /// buffers the item.
    pub fn put(&self, item: T) {
        let mut state = self.state.borrow_mut();
        let mut i = 0;
        while i < state.getters.len() {
            let Some(slot) = state.getters[i].slot.upgrade() else {
                state.getters.remove(i);
                continue;
            };
            if (state.getters[i].predicate)(&item) {
                let target = state.getters[i].target;
                state.getters.remove(i);
                *slot.borrow_mut() = Some(item);
                drop(state);
                let now = self.sim.now();
                self.sim.schedule_wake(now, target);
                return;
            }
            i += 1;
        }
        state.items.push_back(item);
    }

    /// Retrieves the next item; suspends until one is available.
    pub fn get(&self, ctx: &ProcessCtx) -> Get<T> {
        self.get_filtered(ctx, |_| true)
    }

    /// Retrieves the next item matching `predicate`, skipping (but keeping)
    /// buffered items that do not match.
    pub fn get_filtered<P>(&self, ctx: &ProcessCtx, predicate: P) -> Get<T>
    where
        P: Fn(&T) -> bool + 'static,
    {
        Get {
            store: self.clone(),
            predicate: Rc::new(predicate),
            slot: Rc::new(RefCell::new(None)),
            target: ctx.pid(),
            registered: false,
        }
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.state.borrow().items.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Future returned by [`FilterStore::get`] and
/// [`FilterStore::get_filtered`].
pub struct Get<T> {
    store: FilterStore<T>,
    predicate: Predicate<T>,
    slot: Rc<RefCell<Option<T>>>,
    target: ProcessId,
    registered: bool,
}

impl<T: 'static> Future for Get<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if let Some(item) = this.slot.borrow_mut().take() {
            return Poll::Ready(item);
        }
        if !this.registered {
            let mut state = this.store.state.borrow_mut();
            if let Some(pos) = state.items.iter().position(|item| (this.predicate)(item)) {
                return Poll::Ready(state.items.remove(pos).expect("position is in range"));
            }
            state.getters.push_back(Getter {
                predicate: Rc::clone(&this.predicate),
                slot: Rc::downgrade(&this.slot),
                target: this.target,
            });
            this.registered = true;
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_before_get_buffers() {
        let sim = Sim::new();
        let store: FilterStore<u32> = FilterStore::new(&sim);
        store.put(1);
        store.put(2);
        assert_eq!(store.len(), 2);
        let seen: Rc<RefCell<Vec<u32>>> = Rc::default();
        let seen2 = Rc::clone(&seen);
        let store2 = store.clone();
        sim.spawn(move |ctx| async move {
            seen2.borrow_mut().push(store2.get(&ctx).await);
            seen2.borrow_mut().push(store2.get(&ctx).await);
        });
        sim.run();
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn filtered_get_skips_without_consuming() {
        let sim = Sim::new();
        let store: FilterStore<u32> = FilterStore::new(&sim);
        store.put(1);
        store.put(8);
        store.put(3);
        let seen: Rc<RefCell<Vec<u32>>> = Rc::default();
        let seen2 = Rc::clone(&seen);
        let store2 = store.clone();
        sim.spawn(move |ctx| async move {
            let even = store2.get_filtered(&ctx, |v| v % 2 == 0).await;
            seen2.borrow_mut().push(even);
            seen2.borrow_mut().push(store2.get(&ctx).await);
            seen2.borrow_mut().push(store2.get(&ctx).await);
        });
        sim.run();
        assert_eq!(*seen.borrow(), vec![8, 1, 3]);
    }

    #[test]
    fn put_wakes_the_oldest_eligible_getter() {
        let sim = Sim::new();
        let store: FilterStore<u32> = FilterStore::new(&sim);
        let seen: Rc<RefCell<Vec<(&str, u32)>>> = Rc::default();
        for name in ["a", "b"] {
            let seen = Rc::clone(&seen);
            let store = store.clone();
            sim.spawn(move |ctx| async move {
                let item = store.get(&ctx).await;
                seen.borrow_mut().push((name, item));
            });
        }
        let store2 = store.clone();
        sim.spawn(move |ctx| async move {
            ctx.sleep(1.0).await;
            store2.put(10);
            store2.put(20);
        });
        sim.run();
        assert_eq!(*seen.borrow(), vec![("a", 10), ("b", 20)]);
    }

    #[test]
    fn dropped_getter_does_not_swallow_items() {
        let sim = Sim::new();
        let store: FilterStore<u32> = FilterStore::new(&sim);
        {
            // register a getter, then drop it without ever completing
            let ctx_store = store.clone();
            let handle = sim.spawn(move |ctx| async move {
                let got = ctx_store.get(&ctx).await;
                panic!("cancelled getter received {got}");
            });
            sim.run();
            // replace the parked process wholesale: dropping its future drops
            // the pending getter
            sim.state.borrow_mut().futures.remove(&handle.pid());
        }
        store.put(5);
        assert_eq!(store.len(), 1);
    }
}
