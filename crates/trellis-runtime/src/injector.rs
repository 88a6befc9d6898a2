#![forbid(unsafe_code)]

//! Depth-first tree injection with deferred re-injection.
//!
//! [`TreeInjector`] drives a pre-order walk over an external consumer tree:
//! per node it reads the injection policy, enters a scope when the node
//! carries consumers, injects each consumer at most once per traversal
//! instance, recurses into the children, delivers the "after children
//! injected" notification, and exits the scope. Injection callback failures
//! are isolated per consumer — recorded, never propagated.
//!
//! # Short-circuit
//!
//! If every consumer at a node was already injected by this traversal
//! instance, nothing below the node can be new, so the subtree is skipped
//! and the scope exited immediately.
//!
//! # Deferred re-injection
//!
//! Subtrees added after their ancestor's pass are handled out of band: a
//! consumer marks the ancestor node through a [`DeferredMarker`], and an
//! external per-tick scheduler calls [`flush_pending`]
//! (`TreeInjector::flush_pending`). The flush reconstructs the resolution
//! context from the scope pointer stored when the ancestor was first
//! injected, so late subtrees see the scope state their siblings saw.
//! Injection callbacks may legally mark further nodes during a flush; the
//! loop drains until the pending set stays empty, bounded by a configurable
//! cycle cap past which [`FlushError::RunawayFlush`] is returned.
//!
//! # Failure Modes
//!
//! - **Consumer callback fails**: recorded (sinks, `last_failure`,
//!   `tracing::error!`); siblings and the rest of the tree still run.
//! - **Pending node never injected by this traversal**: skipped with a
//!   warning — there is no scope pointer to rebuild a context from.
//! - **Pending set keeps refilling**: `RunawayFlush` after the cycle cap.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use thiserror::Error;
use trellis_core::capability::{Capability, CapabilityMap};
use trellis_core::container::{Container, ScopePointer};

use crate::diagnostics::{InjectionFailure, InjectionSink};
use crate::tree::{Consumer, InjectError, InjectNode, InjectionPolicy};

/// Default bound on flush cycles within one `flush_pending` call. The
/// specific value is a safety net, not a contract.
pub const DEFAULT_MAX_FLUSH_CYCLES: usize = 10_000;

/// Deferred re-injection failed to settle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlushError {
    /// Injection callbacks kept marking new nodes for more cycles than the
    /// configured cap allows.
    #[error("deferred injection did not settle after {cycles} flush cycles")]
    RunawayFlush { cycles: usize },
}

type PendingSet<V> = AHashMap<usize, Rc<dyn InjectNode<V>>>;

fn node_key<V>(node: &Rc<dyn InjectNode<V>>) -> usize {
    Rc::as_ptr(node) as *const () as usize
}

fn consumer_key<V>(consumer: &Rc<dyn Consumer<V>>) -> usize {
    Rc::as_ptr(consumer) as *const () as usize
}

/// Cloneable handle for enqueueing nodes for deferred re-injection.
///
/// Consumers that instantiate subtrees during injection hold one of these
/// and mark the node whose children changed. Marking after the owning
/// injector is gone is a no-op.
pub struct DeferredMarker<V> {
    pending: Weak<RefCell<PendingSet<V>>>,
}

impl<V> Clone for DeferredMarker<V> {
    fn clone(&self) -> Self {
        Self {
            pending: Weak::clone(&self.pending),
        }
    }
}

impl<V> std::fmt::Debug for DeferredMarker<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredMarker").finish()
    }
}

impl<V> DeferredMarker<V> {
    /// Enqueue `node` for re-injection of its children on the next flush.
    pub fn mark(&self, node: &Rc<dyn InjectNode<V>>) {
        if let Some(pending) = self.pending.upgrade() {
            pending.borrow_mut().insert(node_key(node), Rc::clone(node));
            tracing::debug!("node marked for deferred injection");
        }
    }
}

/// One traversal instance over one consumer tree.
///
/// The once-only guarantee, the stored scope pointers, and the pending set
/// are all scoped to the instance: a new `TreeInjector` over the same tree
/// injects everything afresh.
pub struct TreeInjector<V> {
    root: Rc<dyn InjectNode<V>>,
    /// External context label attached to failure records.
    context: Option<String>,
    max_flush_cycles: usize,
    /// Consumers injected by this instance, by handle identity.
    injected: AHashMap<usize, Rc<dyn Consumer<V>>>,
    /// Scope pointer captured when each node's scope was entered.
    pointers: AHashMap<usize, (Rc<dyn InjectNode<V>>, ScopePointer<V>)>,
    pending: Rc<RefCell<PendingSet<V>>>,
    sinks: Vec<Rc<dyn InjectionSink>>,
    last_failure: Option<InjectionFailure>,
}

impl<V> std::fmt::Debug for TreeInjector<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeInjector")
            .field("injected", &self.injected.len())
            .field("pending", &self.pending.borrow().len())
            .finish()
    }
}

impl<V: Clone + 'static> TreeInjector<V> {
    /// A traversal instance rooted at `root`.
    #[must_use]
    pub fn new(root: Rc<dyn InjectNode<V>>) -> Self {
        Self {
            root,
            context: None,
            max_flush_cycles: DEFAULT_MAX_FLUSH_CYCLES,
            injected: AHashMap::new(),
            pointers: AHashMap::new(),
            pending: Rc::new(RefCell::new(AHashMap::new())),
            sinks: Vec::new(),
            last_failure: None,
        }
    }

    /// Attach an external context label to failure records (e.g. which
    /// subsystem started this traversal).
    #[must_use]
    pub fn with_context(mut self, label: impl Into<String>) -> Self {
        self.context = Some(label.into());
        self
    }

    /// Override the runaway-flush cycle cap.
    #[must_use]
    pub fn with_max_flush_cycles(mut self, cap: usize) -> Self {
        self.max_flush_cycles = cap;
        self
    }

    /// Register a failure sink.
    pub fn add_sink(&mut self, sink: Rc<dyn InjectionSink>) {
        self.sinks.push(sink);
    }

    /// Handle for consumers to enqueue deferred re-injection.
    #[must_use]
    pub fn marker(&self) -> DeferredMarker<V> {
        DeferredMarker {
            pending: Rc::downgrade(&self.pending),
        }
    }

    /// Run the injection pass from the root.
    pub fn inject(&mut self, container: &mut Container<V>) {
        let root = Rc::clone(&self.root);
        self.visit(&root, container, true);
    }

    /// Bind `models` into a fresh container — each under its key, and when
    /// a capability map is supplied also under its expanded capability set —
    /// then run the injection pass. Returns the container.
    pub fn bind_and_inject(
        &mut self,
        models: impl IntoIterator<Item = (Capability, V)>,
        map: Option<&CapabilityMap>,
    ) -> Container<V> {
        let mut container = Container::new();
        if let Some(label) = &self.context {
            container.set_default_origin(Some(label));
        }
        for (key, value) in models {
            match map {
                Some(map) => {
                    container.bind_with(map, key, value);
                }
                None => {
                    container.bind(key, value);
                }
            }
        }
        self.inject(&mut container);
        container
    }

    /// Flush the deferred pending set: for every marked node, rebuild the
    /// resolution context from the pointer stored at its first injection
    /// and re-run the pass over its children. Idempotent and cheap when
    /// nothing is pending. Returns the number of nodes flushed.
    pub fn flush_pending(&mut self) -> Result<usize, FlushError> {
        let mut cycles = 0usize;
        let mut flushed = 0usize;
        loop {
            let batch: Vec<Rc<dyn InjectNode<V>>> = {
                let mut pending = self.pending.borrow_mut();
                if pending.is_empty() {
                    break;
                }
                pending.drain().map(|(_, node)| node).collect()
            };
            cycles += 1;
            if cycles > self.max_flush_cycles {
                tracing::error!(cycles, "deferred injection did not settle");
                return Err(FlushError::RunawayFlush { cycles });
            }
            for node in batch {
                let Some((node, pointer)) = self.pointers.get(&node_key(&node)).cloned() else {
                    tracing::warn!("pending node was never injected by this traversal, skipping");
                    continue;
                };
                let mut container = pointer.to_container();
                for child in node.children() {
                    self.visit(&child, &mut container, false);
                }
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// The most recent injection failure, if any.
    #[must_use]
    pub fn last_failure(&self) -> Option<&InjectionFailure> {
        self.last_failure.as_ref()
    }

    /// Whether this traversal instance has injected `consumer`.
    #[must_use]
    pub fn was_injected(&self, consumer: &Rc<dyn Consumer<V>>) -> bool {
        self.injected.contains_key(&consumer_key(consumer))
    }

    /// Number of nodes currently awaiting a flush.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    fn visit(&mut self, node: &Rc<dyn InjectNode<V>>, container: &mut Container<V>, is_root: bool) {
        match node.policy() {
            InjectionPolicy::Ignore => return,
            InjectionPolicy::OnlyAsRoot if !is_root => return,
            InjectionPolicy::IgnoreWhenInactive if !node.is_active() => return,
            _ => {}
        }

        let consumers = node.consumers();
        let mut post: Vec<Rc<dyn Consumer<V>>> = Vec::new();
        let mut entered = false;

        if !consumers.is_empty() {
            let pointer = container.enter_scope();
            entered = true;
            let mut already_injected = 0usize;
            for consumer in &consumers {
                if self.injected.contains_key(&consumer_key(consumer)) {
                    already_injected += 1;
                    continue;
                }
                // Marked before the callback runs: a failing consumer is
                // not retried by a later pass.
                self.injected
                    .insert(consumer_key(consumer), Rc::clone(consumer));
                post.push(Rc::clone(consumer));
                container.set_current_node(Some(consumer.name()));
                if let Err(error) = consumer.inject(container) {
                    self.record_failure(consumer.name(), error);
                }
                container.set_current_node(None);
            }
            self.pending.borrow_mut().remove(&node_key(node));
            if already_injected == consumers.len() {
                // Nothing below can be new; the pointer stored by the pass
                // that actually injected this node stays authoritative.
                container.exit_scope();
                return;
            }
            self.pointers
                .insert(node_key(node), (Rc::clone(node), pointer));
        }

        for child in node.children() {
            self.visit(&child, container, false);
        }

        if entered {
            for consumer in &post {
                if let Err(error) = consumer.after_children_injected() {
                    self.record_failure(consumer.name(), error);
                }
            }
            container.exit_scope();
        }
    }

    fn record_failure(&mut self, consumer: &str, error: InjectError) {
        tracing::error!(
            consumer,
            context = self.context.as_deref().unwrap_or("-"),
            %error,
            "injection callback failed"
        );
        let failure = InjectionFailure {
            consumer: consumer.to_owned(),
            error,
            context: self.context.clone(),
        };
        for sink in &self.sinks {
            sink.record(&failure);
        }
        self.last_failure = Some(failure);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use trellis_core::error::ResolveError;

    fn key(name: &'static str) -> Capability {
        Capability::plain(name)
    }

    type Log = Rc<RefCell<Vec<String>>>;

    struct FnConsumer {
        name: String,
        on_inject: Box<dyn Fn(&Container<i32>) -> Result<(), InjectError>>,
        on_post: Box<dyn Fn() -> Result<(), InjectError>>,
    }

    impl FnConsumer {
        fn new(
            name: &str,
            on_inject: impl Fn(&Container<i32>) -> Result<(), InjectError> + 'static,
        ) -> Rc<dyn Consumer<i32>> {
            Rc::new(Self {
                name: name.to_owned(),
                on_inject: Box::new(on_inject),
                on_post: Box::new(|| Ok(())),
            })
        }

        fn with_post(
            name: &str,
            on_inject: impl Fn(&Container<i32>) -> Result<(), InjectError> + 'static,
            on_post: impl Fn() -> Result<(), InjectError> + 'static,
        ) -> Rc<dyn Consumer<i32>> {
            Rc::new(Self {
                name: name.to_owned(),
                on_inject: Box::new(on_inject),
                on_post: Box::new(on_post),
            })
        }
    }

    impl Consumer<i32> for FnConsumer {
        fn inject(&self, cx: &Container<i32>) -> Result<(), InjectError> {
            (self.on_inject)(cx)
        }

        fn after_children_injected(&self) -> Result<(), InjectError> {
            (self.on_post)()
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    /// Logging consumer: records "inject:<name>" / "post:<name>".
    fn logger(name: &'static str, log: &Log) -> Rc<dyn Consumer<i32>> {
        let l1 = Rc::clone(log);
        let l2 = Rc::clone(log);
        FnConsumer::with_post(
            name,
            move |_| {
                l1.borrow_mut().push(format!("inject:{name}"));
                Ok(())
            },
            move || {
                l2.borrow_mut().push(format!("post:{name}"));
                Ok(())
            },
        )
    }

    #[derive(Default)]
    struct TestNode {
        policy: Cell<InjectionPolicy>,
        active: Cell<bool>,
        consumers: RefCell<Vec<Rc<dyn Consumer<i32>>>>,
        /// When set, `consumers()` allocates a fresh handle on every call —
        /// the unstable-identity misuse the runaway guard has to survive.
        fresh_consumer: RefCell<Option<Box<dyn Fn() -> Rc<dyn Consumer<i32>>>>>,
        children: RefCell<Vec<Rc<TestNode>>>,
        children_calls: Cell<usize>,
    }

    impl TestNode {
        fn new() -> Rc<Self> {
            let node = Self::default();
            node.active.set(true);
            Rc::new(node)
        }

        fn with_consumers(consumers: Vec<Rc<dyn Consumer<i32>>>) -> Rc<Self> {
            let node = Self::new();
            *node.consumers.borrow_mut() = consumers;
            node
        }

        fn add_child(self: &Rc<Self>, child: &Rc<Self>) {
            self.children.borrow_mut().push(Rc::clone(child));
        }

        fn as_node(self: &Rc<Self>) -> Rc<dyn InjectNode<i32>> {
            Rc::clone(self) as Rc<dyn InjectNode<i32>>
        }
    }

    impl InjectNode<i32> for TestNode {
        fn policy(&self) -> InjectionPolicy {
            self.policy.get()
        }

        fn is_active(&self) -> bool {
            self.active.get()
        }

        fn consumers(&self) -> Vec<Rc<dyn Consumer<i32>>> {
            if let Some(make) = self.fresh_consumer.borrow().as_ref() {
                return vec![make()];
            }
            self.consumers.borrow().clone()
        }

        fn children(&self) -> Vec<Rc<dyn InjectNode<i32>>> {
            self.children_calls.set(self.children_calls.get() + 1);
            self.children
                .borrow()
                .iter()
                .map(TestNode::as_node)
                .collect()
        }
    }

    #[test]
    fn injects_pre_order_with_post_notifications() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let root = TestNode::with_consumers(vec![logger("R", &log)]);
        let c1 = TestNode::with_consumers(vec![logger("C1", &log)]);
        let c2 = TestNode::with_consumers(vec![logger("C2", &log)]);
        root.add_child(&c1);
        root.add_child(&c2);

        let mut injector = TreeInjector::new(root.as_node());
        let mut container = Container::new();
        injector.inject(&mut container);

        assert_eq!(
            *log.borrow(),
            vec![
                "inject:R",
                "inject:C1",
                "post:C1",
                "inject:C2",
                "post:C2",
                "post:R"
            ]
        );
    }

    #[test]
    fn child_scopes_see_parent_bindings_but_not_sibling_bindings() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        let root = TestNode::with_consumers(vec![FnConsumer::new("R", |cx| {
            cx.bind(key("FromRoot"), 7);
            Ok(())
        })]);

        let l1 = Rc::clone(&log);
        let c1 = TestNode::with_consumers(vec![FnConsumer::new("C1", move |cx| {
            l1.borrow_mut()
                .push(format!("C1 sees {:?}", cx.resolve(&key("FromRoot"))));
            cx.bind(key("FromC1"), 1);
            Ok(())
        })]);

        let l2 = Rc::clone(&log);
        let c2 = TestNode::with_consumers(vec![FnConsumer::new("C2", move |cx| {
            l2.borrow_mut()
                .push(format!("C2 sees sibling {:?}", cx.try_resolve(&key("FromC1"))));
            Ok(())
        })]);

        root.add_child(&c1);
        root.add_child(&c2);

        let mut injector = TreeInjector::new(root.as_node());
        let mut container = Container::new();
        injector.inject(&mut container);

        assert_eq!(
            *log.borrow(),
            vec!["C1 sees Ok(7)", "C2 sees sibling Ok(None)"]
        );
    }

    #[test]
    fn second_pass_injects_nothing_and_short_circuits() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let root = TestNode::with_consumers(vec![logger("R", &log)]);
        let child = TestNode::with_consumers(vec![logger("C", &log)]);
        root.add_child(&child);

        let mut injector = TreeInjector::new(root.as_node());
        let mut container = Container::new();
        injector.inject(&mut container);
        let first_pass_children_calls = root.children_calls.get();

        let mut container2 = Container::new();
        injector.inject(&mut container2);

        assert_eq!(log.borrow().len(), 4, "no re-injection on the second pass");
        assert_eq!(
            root.children_calls.get(),
            first_pass_children_calls,
            "subtree skipped entirely"
        );
    }

    #[test]
    fn fresh_injector_instance_injects_again() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let root = TestNode::with_consumers(vec![logger("R", &log)]);

        let mut first = TreeInjector::new(root.as_node());
        first.inject(&mut Container::new());
        let mut second = TreeInjector::new(root.as_node());
        second.inject(&mut Container::new());

        let injects = log.borrow().iter().filter(|e| *e == "inject:R").count();
        assert_eq!(injects, 2, "once-only is per traversal instance");
    }

    #[test]
    fn policy_ignore_skips_subtree() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let root = TestNode::with_consumers(vec![logger("R", &log)]);
        let skipped = TestNode::with_consumers(vec![logger("S", &log)]);
        let below = TestNode::with_consumers(vec![logger("B", &log)]);
        skipped.add_child(&below);
        skipped.policy.set(InjectionPolicy::Ignore);
        root.add_child(&skipped);

        let mut injector = TreeInjector::new(root.as_node());
        injector.inject(&mut Container::new());

        assert_eq!(*log.borrow(), vec!["inject:R", "post:R"]);
    }

    #[test]
    fn policy_only_as_root() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let root = TestNode::with_consumers(vec![logger("R", &log)]);
        root.policy.set(InjectionPolicy::OnlyAsRoot);
        let child = TestNode::with_consumers(vec![logger("C", &log)]);
        child.policy.set(InjectionPolicy::OnlyAsRoot);
        root.add_child(&child);

        let mut injector = TreeInjector::new(root.as_node());
        injector.inject(&mut Container::new());

        // The root qualifies; the non-root child does not.
        assert_eq!(*log.borrow(), vec!["inject:R", "post:R"]);
    }

    #[test]
    fn policy_ignore_when_inactive() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let root = TestNode::with_consumers(vec![logger("R", &log)]);
        let inactive = TestNode::with_consumers(vec![logger("I", &log)]);
        inactive.policy.set(InjectionPolicy::IgnoreWhenInactive);
        inactive.active.set(false);
        let active = TestNode::with_consumers(vec![logger("A", &log)]);
        active.policy.set(InjectionPolicy::IgnoreWhenInactive);
        root.add_child(&inactive);
        root.add_child(&active);

        let mut injector = TreeInjector::new(root.as_node());
        injector.inject(&mut Container::new());

        assert_eq!(*log.borrow(), vec!["inject:R", "inject:A", "post:A", "post:R"]);
    }

    #[test]
    fn failing_consumer_does_not_stop_siblings_or_subtree() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let root = TestNode::with_consumers(vec![logger("R", &log)]);
        let failing = TestNode::with_consumers(vec![FnConsumer::new("F", |cx| {
            cx.resolve(&key("Nope"))?;
            Ok(())
        })]);
        let sibling = TestNode::with_consumers(vec![logger("S", &log)]);
        root.add_child(&failing);
        root.add_child(&sibling);

        struct VecSink(RefCell<Vec<InjectionFailure>>);
        impl InjectionSink for VecSink {
            fn record(&self, failure: &InjectionFailure) {
                self.0.borrow_mut().push(failure.clone());
            }
        }
        let sink = Rc::new(VecSink(RefCell::new(Vec::new())));

        let mut injector = TreeInjector::new(root.as_node()).with_context("unit-test");
        injector.add_sink(sink.clone());
        injector.inject(&mut Container::new());

        assert!(log.borrow().contains(&"inject:S".to_owned()));

        let failure = injector.last_failure().expect("failure recorded");
        assert_eq!(failure.consumer, "F");
        assert_eq!(failure.context.as_deref(), Some("unit-test"));
        assert_eq!(
            failure.error,
            InjectError::Resolve(ResolveError::MissingBinding(key("Nope")))
        );
        assert_eq!(sink.0.borrow().len(), 1);
    }

    #[test]
    fn failing_post_inject_is_recorded_and_nonfatal() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        let root = TestNode::with_consumers(vec![FnConsumer::with_post(
            "R",
            |_| Ok(()),
            || Err(InjectError::msg("post failed")),
        )]);
        let child = TestNode::with_consumers(vec![FnConsumer::with_post(
            "C",
            move |_| {
                l.borrow_mut().push("inject:C".to_owned());
                Ok(())
            },
            || Ok(()),
        )]);
        root.add_child(&child);

        let mut injector = TreeInjector::new(root.as_node());
        injector.inject(&mut Container::new());

        assert_eq!(*log.borrow(), vec!["inject:C"]);
        assert_eq!(
            injector.last_failure().map(|f| f.consumer.as_str()),
            Some("R")
        );
    }

    #[test]
    fn sequence_binding_distributes_across_child_nodes() {
        let seen: Log = Rc::new(RefCell::new(Vec::new()));

        let root = TestNode::with_consumers(vec![FnConsumer::new("list", |cx| {
            cx.bind_sequence(key("Item"), [10, 20]);
            Ok(())
        })]);
        for name in ["slot-a", "slot-b"] {
            let s = Rc::clone(&seen);
            let child = TestNode::with_consumers(vec![FnConsumer::new(name, move |cx| {
                s.borrow_mut()
                    .push(format!("{name}={}", cx.resolve(&key("Item"))?));
                Ok(())
            })]);
            root.add_child(&child);
        }

        let mut injector = TreeInjector::new(root.as_node());
        injector.inject(&mut Container::new());

        assert_eq!(*seen.borrow(), vec!["slot-a=10", "slot-b=20"]);
    }

    #[test]
    fn flush_with_empty_pending_is_a_noop() {
        let root = TestNode::new();
        let mut injector = TreeInjector::new(root.as_node());
        assert_eq!(injector.flush_pending(), Ok(0));
        assert_eq!(injector.flush_pending(), Ok(0));
    }

    #[test]
    fn deferred_subtree_is_injected_with_captured_scope() {
        let seen: Log = Rc::new(RefCell::new(Vec::new()));

        let root = TestNode::with_consumers(vec![FnConsumer::new("R", |cx| {
            cx.bind(key("Shared"), 99);
            Ok(())
        })]);
        let host = TestNode::with_consumers(vec![logger("H", &seen)]);
        root.add_child(&host);

        let mut injector = TreeInjector::new(root.as_node());
        injector.inject(&mut Container::new());

        // A subtree appears under `host` after the pass.
        let s = Rc::clone(&seen);
        let late = TestNode::with_consumers(vec![FnConsumer::new("late", move |cx| {
            s.borrow_mut()
                .push(format!("late sees {}", cx.resolve(&key("Shared"))?));
            Ok(())
        })]);
        host.add_child(&late);

        let marker = injector.marker();
        marker.mark(&host.as_node());
        assert_eq!(injector.pending_count(), 1);

        assert_eq!(injector.flush_pending(), Ok(1));
        assert_eq!(injector.pending_count(), 0);
        assert!(
            seen.borrow().contains(&"late sees 99".to_owned()),
            "{:?}",
            seen.borrow()
        );

        // Already-injected consumers stay injected; flushing again is free.
        let injects = seen.borrow().iter().filter(|e| *e == "inject:H").count();
        assert_eq!(injects, 1);
        assert_eq!(injector.flush_pending(), Ok(0));
    }

    #[test]
    fn marking_during_flush_converges() {
        let seen: Log = Rc::new(RefCell::new(Vec::new()));

        let root = TestNode::with_consumers(vec![logger("R", &seen)]);
        let host = TestNode::with_consumers(vec![logger("H", &seen)]);
        root.add_child(&host);

        let mut injector = TreeInjector::new(root.as_node());
        let marker = injector.marker();
        injector.inject(&mut Container::new());

        // The first late consumer adds another subtree mid-flush.
        let deeper = TestNode::with_consumers(vec![logger("deeper", &seen)]);
        let host_handle = host.as_node();
        let m = marker.clone();
        let d = Rc::clone(&deeper);
        let h = Rc::clone(&host);
        let s = Rc::clone(&seen);
        let late = TestNode::with_consumers(vec![FnConsumer::new("late", move |_| {
            s.borrow_mut().push("inject:late".to_owned());
            h.add_child(&d);
            m.mark(&h.as_node());
            Ok(())
        })]);
        host.add_child(&late);
        marker.mark(&host_handle);

        assert_eq!(injector.flush_pending(), Ok(2));
        assert!(seen.borrow().contains(&"inject:late".to_owned()));
        assert!(seen.borrow().contains(&"inject:deeper".to_owned()));
    }

    #[test]
    fn runaway_flush_is_reported() {
        // A child whose consumer handle is freshly allocated on every call
        // is never recognized as injected, and it re-marks its host each
        // time: the pending set never drains.
        let host = TestNode::with_consumers(vec![FnConsumer::new("H", |_| Ok(()))]);
        let evil = TestNode::new();
        host.add_child(&evil);
        let root = TestNode::new();
        root.add_child(&host);

        let mut injector = TreeInjector::new(root.as_node()).with_max_flush_cycles(3);
        let marker = injector.marker();
        let host_handle = host.as_node();
        *evil.fresh_consumer.borrow_mut() = Some(Box::new(move || {
            let m = marker.clone();
            let h = Rc::clone(&host_handle);
            FnConsumer::new("evil", move |_| {
                m.mark(&h);
                Ok(())
            })
        }));

        injector.inject(&mut Container::new());
        assert_eq!(injector.pending_count(), 1);
        assert!(matches!(
            injector.flush_pending(),
            Err(FlushError::RunawayFlush { .. })
        ));
    }

    #[test]
    fn marker_outliving_injector_is_inert() {
        let root = TestNode::new();
        let injector = TreeInjector::new(root.as_node());
        let marker = injector.marker();
        drop(injector);
        marker.mark(&root.as_node());
    }

    #[test]
    fn bind_and_inject_binds_models_then_traverses() {
        let seen: Log = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let root = TestNode::with_consumers(vec![FnConsumer::new("R", move |cx| {
            s.borrow_mut()
                .push(format!("value={}", cx.resolve(&key("Model"))?));
            Ok(())
        })]);

        let mut map = CapabilityMap::new();
        map.declare(key("TodoModel"), [key("Model")]);

        let mut injector = TreeInjector::new(root.as_node());
        let container = injector.bind_and_inject([(key("TodoModel"), 5)], Some(&map));

        assert_eq!(*seen.borrow(), vec!["value=5"]);
        assert_eq!(container.resolve(&key("Model")), Ok(5));
    }

    #[test]
    fn pending_node_never_injected_is_skipped() {
        let root = TestNode::with_consumers(vec![FnConsumer::new("R", |_| Ok(()))]);
        let stranger = TestNode::new();

        let mut injector = TreeInjector::new(root.as_node());
        injector.inject(&mut Container::new());
        injector.marker().mark(&stranger.as_node());

        assert_eq!(injector.flush_pending(), Ok(0));
    }
}
