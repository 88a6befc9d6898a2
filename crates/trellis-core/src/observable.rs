#![forbid(unsafe_code)]

//! Single-slot reactive value with replay-then-stream delivery.
//!
//! [`Observable<T>`] stores exactly one current value. Subscribing delivers
//! that value synchronously before `subscribe` returns, then streams every
//! subsequent [`set`](Observable::set) to all live subscribers in
//! subscription order. There is no history buffer: a late subscriber sees
//! only the latest value.
//!
//! # Architecture
//!
//! `Observable<T>` uses `Rc<RefCell<..>>` for single-threaded shared
//! ownership. Each subscriber is held as a callback plus a `Weak` liveness
//! token whose strong half lives in the returned [`Subscription`]; dead
//! subscribers are cleaned up lazily during notification.
//!
//! # Invariants
//!
//! 1. `subscribe` invokes the callback with the current value before
//!    returning.
//! 2. `set` updates the stored value before notifying anyone.
//! 3. Subscribers are notified in subscription order.
//! 4. `set` always notifies — there is no equality gate, so rebinding the
//!    same value republishes it.
//! 5. Dropping a [`Subscription`] stops delivery with no further side
//!    effects.
//!
//! # Failure Modes
//!
//! - **Callback panics**: the stored value is already updated; remaining
//!   subscribers in this cycle are not notified.
//! - **Re-entrant `set` from a callback**: permitted; later subscribers of
//!   the outer cycle observe the newest value via `get`, and each `set`
//!   runs its own full notification pass.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

struct Subscriber<T> {
    alive: Weak<()>,
    callback: Rc<dyn Fn(&T)>,
}

struct Inner<T> {
    value: T,
    subscribers: Vec<Subscriber<T>>,
}

/// A shared, single-slot reactive value.
///
/// Cloning an `Observable` creates a new handle to the **same** slot.
pub struct Observable<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Observable")
            .field("value", &inner.value)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

/// RAII guard for a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    _token: Rc<()>,
}

impl<T: Clone + 'static> Observable<T> {
    /// Create an observable holding `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                value,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Clone out the current value.
    #[must_use]
    pub fn get(&self) -> T {
        self.inner.borrow().value.clone()
    }

    /// Access the current value by reference without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.borrow().value)
    }

    /// Store `value`, then notify every live subscriber in subscription
    /// order. The value is visible via [`get`](Self::get) before the first
    /// callback runs.
    pub fn set(&self, value: T) {
        let callbacks: Vec<Subscriber<T>> = {
            let mut inner = self.inner.borrow_mut();
            inner.value = value.clone();
            // Prune dead subscribers while we are here.
            inner.subscribers.retain(|s| s.alive.strong_count() > 0);
            inner
                .subscribers
                .iter()
                .map(|s| Subscriber {
                    alive: s.alive.clone(),
                    callback: Rc::clone(&s.callback),
                })
                .collect()
        };
        // Invoke outside the borrow so callbacks may read, set, or
        // subscribe without tripping the RefCell.
        for sub in callbacks {
            if sub.alive.strong_count() > 0 {
                (sub.callback)(&value);
            }
        }
    }

    /// Subscribe to value changes.
    ///
    /// The callback is invoked synchronously with the current value before
    /// this method returns, then once per subsequent [`set`](Self::set)
    /// until the returned [`Subscription`] is dropped.
    #[must_use = "dropping the Subscription immediately unsubscribes"]
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        let token = Rc::new(());
        let callback: Rc<dyn Fn(&T)> = Rc::new(callback);
        let current = {
            let mut inner = self.inner.borrow_mut();
            inner.subscribers.push(Subscriber {
                alive: Rc::downgrade(&token),
                callback: Rc::clone(&callback),
            });
            inner.value.clone()
        };
        // Replay the current value outside the borrow.
        callback(&current);
        Subscription { _token: token }
    }

    /// Number of live subscribers (prunes dead entries first).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.borrow_mut();
        inner.subscribers.retain(|s| s.alive.strong_count() > 0);
        inner.subscribers.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
