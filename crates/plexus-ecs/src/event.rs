//! Synchronous event channels with reentrancy-safe emission.
//!
//! Containers notify their observers through [`Event`] channels. Listeners run
//! synchronously, in registration order, on the same call stack as the
//! mutation that triggered them. A listener may re-enter the emitting
//! container (add or remove entities, including the one currently in flight),
//! subscribe new listeners, or unsubscribe listeners (including itself)
//! without disturbing the emission pass that is currently running.
//!
//! Two rules make this safe:
//!
//! - Emission snapshots the subscriber count up front. Listeners subscribed
//!   during an emission pass are first invoked on the *next* emission.
//! - Unsubscription during an emission pass tombstones the slot in place
//!   instead of shifting the list. Tombstones are swept once no emission is
//!   in flight.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// ListenerId
// ---------------------------------------------------------------------------

/// Handle returned by [`Event::subscribe`], used to unsubscribe later.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

type Callback<T> = Rc<dyn Fn(&T)>;

/// A slot is tombstoned (callback dropped) rather than removed while an
/// emission pass is walking the list.
struct Listener<T> {
    id: ListenerId,
    callback: Option<Callback<T>>,
}

/// An ordered list of synchronous subscribers.
///
/// Not `Clone`: an event channel is owned by exactly one container and shared
/// through that container's handle.
pub struct Event<T> {
    listeners: RefCell<Vec<Listener<T>>>,
    /// Number of emission passes currently on the stack.
    emitting: Cell<usize>,
    next_id: Cell<u64>,
}

impl<T> Event<T> {
    /// Create an event channel with no subscribers.
    pub fn new() -> Self {
        Self {
            listeners: RefCell::new(Vec::new()),
            emitting: Cell::new(0),
            next_id: Cell::new(0),
        }
    }

    /// Register a listener. Listeners are invoked in registration order.
    ///
    /// If called from inside a listener of this same event, the new listener
    /// is not invoked during the current emission pass.
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        self.listeners.borrow_mut().push(Listener {
            id,
            callback: Some(Rc::new(callback)),
        });
        id
    }

    /// Remove a listener. Returns `true` if the id was still registered.
    ///
    /// Safe to call from inside an emission pass, including from the listener
    /// being removed; remaining not-yet-called listeners are unaffected.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let Some(listener) = listeners
            .iter_mut()
            .find(|l| l.id == id && l.callback.is_some())
        else {
            return false;
        };
        listener.callback = None;
        if self.emitting.get() == 0 {
            listeners.retain(|l| l.callback.is_some());
        }
        true
    }

    /// Number of live (non-tombstoned) subscribers.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|l| l.callback.is_some())
            .count()
    }

    /// Invoke every listener registered before this call, in order.
    pub(crate) fn emit(&self, value: &T) {
        let snapshot_len = self.listeners.borrow().len();
        self.emitting.set(self.emitting.get() + 1);

        for index in 0..snapshot_len {
            // Clone the callback out so the list is not borrowed while the
            // listener runs and is free to mutate it.
            let callback = {
                let listeners = self.listeners.borrow();
                listeners.get(index).and_then(|l| l.callback.clone())
            };
            if let Some(callback) = callback {
                callback(value);
            }
        }

        self.emitting.set(self.emitting.get() - 1);
        if self.emitting.get() == 0 {
            self.listeners
                .borrow_mut()
                .retain(|l| l.callback.is_some());
        }
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_run_in_registration_order() {
        let event: Event<u32> = Event::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        event.subscribe(move |_| o1.borrow_mut().push(1));
        let o2 = order.clone();
        event.subscribe(move |_| o2.borrow_mut().push(2));

        event.emit(&0);
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let event: Event<u32> = Event::new();
        let count = Rc::new(Cell::new(0));

        let c = count.clone();
        let id = event.subscribe(move |_| c.set(c.get() + 1));

        event.emit(&0);
        assert!(event.unsubscribe(id));
        event.emit(&0);

        assert_eq!(count.get(), 1);
        assert!(!event.unsubscribe(id), "double unsubscribe reports false");
    }

    #[test]
    fn unsubscribe_during_emission_spares_remaining_listeners() {
        let event: Rc<Event<u32>> = Rc::new(Event::new());
        let calls = Rc::new(RefCell::new(Vec::new()));

        // First listener unsubscribes itself; the second must still run.
        let self_id = Rc::new(Cell::new(None));
        let ev = event.clone();
        let sid = self_id.clone();
        let c1 = calls.clone();
        let id = event.subscribe(move |_| {
            c1.borrow_mut().push("first");
            if let Some(id) = sid.get() {
                ev.unsubscribe(id);
            }
        });
        self_id.set(Some(id));

        let c2 = calls.clone();
        event.subscribe(move |_| c2.borrow_mut().push("second"));

        event.emit(&0);
        assert_eq!(*calls.borrow(), vec!["first", "second"]);

        calls.borrow_mut().clear();
        event.emit(&0);
        assert_eq!(*calls.borrow(), vec!["second"]);
    }

    #[test]
    fn subscription_during_emission_is_deferred_to_next_pass() {
        let event: Rc<Event<u32>> = Rc::new(Event::new());
        let count = Rc::new(Cell::new(0));

        let ev = event.clone();
        let c = count.clone();
        event.subscribe(move |_| {
            let inner = c.clone();
            ev.subscribe(move |_| inner.set(inner.get() + 1));
        });

        event.emit(&0);
        assert_eq!(count.get(), 0, "listener subscribed mid-pass must wait");

        event.emit(&0);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn reentrant_emission_is_allowed() {
        let event: Rc<Event<u32>> = Rc::new(Event::new());
        let depth_seen = Rc::new(Cell::new(0u32));

        let ev = event.clone();
        let seen = depth_seen.clone();
        event.subscribe(move |value| {
            seen.set(seen.get().max(*value));
            if *value < 3 {
                ev.emit(&(*value + 1));
            }
        });

        event.emit(&1);
        assert_eq!(depth_seen.get(), 3);
    }
}
