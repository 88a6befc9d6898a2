#![forbid(unsafe_code)]

//! The resolution context: a scope stack over the binding graph, plus the
//! pointer/stamp protocol.
//!
//! A [`Container`] owns the head of one scope chain and answers
//! `resolve`/`observe` calls against it. Traversal drivers push and pop
//! scopes as they descend and ascend the consumer tree; consumers register
//! bindings into the current scope and resolve from it.
//!
//! # Scope numbering
//!
//! Entering a scope assigns the pending child id and resets the pending
//! counter to zero for the next nesting level; exiting restores the counter
//! to one past the id just popped, so sibling scopes receive distinct,
//! increasing ids across separate enter/exit cycles at the same level.
//!
//! # Pointers and stamps
//!
//! [`ScopePointer`] captures `(head scope, state stamp)` and can be
//! reconstructed into an independent container any number of times. Each
//! container is one *lineage* owning a monotonically increasing stamp,
//! bumped whenever a sequence cursor advances through it; sequence entries
//! record the stamp at their last advance and refuse (with
//! [`ResolveError::StaleScope`]) to move for a context carrying an older
//! stamp, which is how out-of-order reuse of a stale pointer is rejected
//! instead of silently yielding the wrong element.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::binding::{Binding, Entry, EntryError, SequenceBinding};
use crate::capability::{Capability, CapabilityMap};
use crate::error::ResolveError;
use crate::observable::Observable;
use crate::scope::ScopeNode;

/// Diagnostic record emitted on every successful resolve/observe.
///
/// Carries the resolved value, the requesting node's label (set by the
/// traversal driver), the key, and the origin label recorded on the entry
/// at bind time. For tooling only; resolution never depends on it.
pub struct ResolveEvent<'a, V> {
    pub value: &'a V,
    pub node: Option<&'a str>,
    pub key: &'a Capability,
    pub origin: Option<&'a str>,
}

type ResolveHook<V> = Rc<dyn Fn(&ResolveEvent<'_, V>)>;

/// A resolution context over the scoped binding graph.
pub struct Container<V> {
    head: Rc<ScopeNode<V>>,
    /// Number of scopes on the chain, root included.
    count: usize,
    /// Id the next entered child scope will receive.
    next_scope_id: u32,
    /// This lineage's state stamp.
    stamp: Cell<u64>,
    /// Label of the consumer currently being injected, if any.
    current_node: RefCell<Option<Rc<str>>>,
    /// Fallback origin label for bindings registered outside injection.
    default_origin: RefCell<Option<Rc<str>>>,
    hook: RefCell<Option<ResolveHook<V>>>,
}

impl<V: Clone + 'static> Default for Container<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for Container<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("scope", &self.head.id)
            .field("depth", &(self.count - 1))
            .field("stamp", &self.stamp.get())
            .finish()
    }
}

impl<V: Clone + 'static> Container<V> {
    /// A fresh container with a single root scope.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: ScopeNode::root(),
            count: 1,
            next_scope_id: 0,
            stamp: Cell::new(0),
            current_node: RefCell::new(None),
            default_origin: RefCell::new(None),
            hook: RefCell::new(None),
        }
    }

    fn from_parts(head: Rc<ScopeNode<V>>, stamp: u64) -> Self {
        let mut count = 0;
        let mut node = Some(&head);
        while let Some(current) = node {
            count += 1;
            node = current.parent.as_ref();
        }
        Self {
            head,
            count,
            next_scope_id: 0,
            stamp: Cell::new(stamp),
            current_node: RefCell::new(None),
            default_origin: RefCell::new(None),
            hook: RefCell::new(None),
        }
    }

    // ── Scope stack ──────────────────────────────────────────────────

    /// Push a child scope and return a pointer to the new position.
    pub fn enter_scope(&mut self) -> ScopePointer<V> {
        self.head = self.head.child(self.next_scope_id);
        self.count += 1;
        self.next_scope_id = 0;
        tracing::debug!(scope = self.head.id, depth = self.count - 1, "entered scope");
        self.pointer()
    }

    /// Pop the head scope.
    ///
    /// # Panics
    ///
    /// Panics if called on the root scope; enter/exit calls must pair.
    pub fn exit_scope(&mut self) {
        let exited = self.head.id;
        let parent = self
            .head
            .parent
            .clone()
            .expect("exit_scope must not be called on the root scope");
        self.head = parent;
        self.count -= 1;
        self.next_scope_id = exited + 1;
        tracing::debug!(scope = exited, "exited scope");
    }

    /// Capture the current position and stamp. Idempotent: capturing twice
    /// at the same position yields equivalent pointers.
    #[must_use]
    pub fn pointer(&self) -> ScopePointer<V> {
        ScopePointer {
            scope: Rc::clone(&self.head),
            stamp: self.stamp.get(),
        }
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Bind a value under `key` in the current scope.
    pub fn bind(&self, key: Capability, value: V) -> Binding<V> {
        let entry = Entry::single(Some(value));
        entry.set_origin(self.current_origin());
        self.head.add_binding(&key, Rc::clone(&entry));
        Binding::new(entry)
    }

    /// Bind a value under its concrete key and every capability the map
    /// expands it to; all keys share one entry, so a rebind through the
    /// returned handle is visible under each of them.
    pub fn bind_with(&self, map: &CapabilityMap, concrete: Capability, value: V) -> Binding<V> {
        let entry = Entry::single(Some(value));
        entry.set_origin(self.current_origin());
        self.add_under_capabilities(map, &concrete, &entry);
        Binding::new(entry)
    }

    /// Register a value-less binding; reads fail with
    /// [`ResolveError::MissingBinding`] until the handle rebinds a value.
    pub fn create_binding(&self, key: Capability) -> Binding<V> {
        let entry = Entry::single(None);
        entry.set_origin(self.current_origin());
        self.head.add_binding(&key, Rc::clone(&entry));
        Binding::new(entry)
    }

    /// Value-less variant of [`bind_with`](Self::bind_with).
    pub fn create_binding_with(&self, map: &CapabilityMap, concrete: Capability) -> Binding<V> {
        let entry = Entry::single(None);
        entry.set_origin(self.current_origin());
        self.add_under_capabilities(map, &concrete, &entry);
        Binding::new(entry)
    }

    /// Bind an ordered sequence distributed one element per tree branch.
    pub fn bind_sequence(
        &self,
        key: Capability,
        values: impl IntoIterator<Item = V>,
    ) -> SequenceBinding<V> {
        let entry = Entry::sequence(Some(values.into_iter().collect()));
        entry.set_origin(self.current_origin());
        self.head.add_binding(&key, Rc::clone(&entry));
        SequenceBinding::new(entry)
    }

    /// Sequence variant of [`bind_with`](Self::bind_with).
    pub fn bind_sequence_with(
        &self,
        map: &CapabilityMap,
        concrete: Capability,
        values: impl IntoIterator<Item = V>,
    ) -> SequenceBinding<V> {
        let entry = Entry::sequence(Some(values.into_iter().collect()));
        entry.set_origin(self.current_origin());
        self.add_under_capabilities(map, &concrete, &entry);
        SequenceBinding::new(entry)
    }

    /// Register an unseeded sequence; reads fail until `rebind_all` seeds it.
    pub fn create_sequence_binding(&self, key: Capability) -> SequenceBinding<V> {
        let entry = Entry::sequence(None);
        entry.set_origin(self.current_origin());
        self.head.add_binding(&key, Rc::clone(&entry));
        SequenceBinding::new(entry)
    }

    /// Unseeded sequence variant of [`bind_with`](Self::bind_with).
    pub fn create_sequence_binding_with(
        &self,
        map: &CapabilityMap,
        concrete: Capability,
    ) -> SequenceBinding<V> {
        let entry = Entry::sequence(None);
        entry.set_origin(self.current_origin());
        self.add_under_capabilities(map, &concrete, &entry);
        SequenceBinding::new(entry)
    }

    /// Bind a producer invoked fresh on every resolution. There is no
    /// rebind handle: factories produce, they are not rebound.
    pub fn bind_factory(&self, key: Capability, produce: impl Fn() -> V + 'static) {
        let entry = Entry::factory(produce);
        entry.set_origin(self.current_origin());
        self.head.add_binding(&key, Rc::clone(&entry));
    }

    /// Factory variant of [`bind_with`](Self::bind_with).
    pub fn bind_factory_with(
        &self,
        map: &CapabilityMap,
        concrete: Capability,
        produce: impl Fn() -> V + 'static,
    ) {
        let entry = Entry::factory(produce);
        entry.set_origin(self.current_origin());
        self.add_under_capabilities(map, &concrete, &entry);
    }

    fn add_under_capabilities(
        &self,
        map: &CapabilityMap,
        concrete: &Capability,
        entry: &Rc<Entry<V>>,
    ) {
        self.head.add_binding(concrete, Rc::clone(entry));
        for capability in map.capabilities_of(concrete).iter() {
            self.head.add_binding(capability, Rc::clone(entry));
        }
    }

    // ── Resolution ───────────────────────────────────────────────────

    /// Resolve the current value bound for `key`.
    pub fn resolve(&self, key: &Capability) -> Result<V, ResolveError> {
        let reference = self
            .head
            .find_reference(key)
            .ok_or_else(|| ResolveError::MissingBinding(key.clone()))?;
        let value = reference
            .entry
            .value(self)
            .map_err(|e| e.into_resolve(key))?;
        self.emit_resolved(&value, key, &reference.entry);
        Ok(value)
    }

    /// Like [`resolve`](Self::resolve), but reports "nothing bound" (or a
    /// value-less entry) as `Ok(None)` instead of an error. Conflicts,
    /// exhaustion, and staleness still fail.
    pub fn try_resolve(&self, key: &Capability) -> Result<Option<V>, ResolveError> {
        let Some(reference) = self.head.find_reference(key) else {
            return Ok(None);
        };
        match reference.entry.value(self) {
            Ok(value) => {
                self.emit_resolved(&value, key, &reference.entry);
                Ok(Some(value))
            }
            Err(EntryError::NoValue) => Ok(None),
            Err(e) => Err(e.into_resolve(key)),
        }
    }

    /// Resolve a reactive wrapper for `key`: the current value replayed at
    /// subscribe time, then every rebind.
    pub fn observe(&self, key: &Capability) -> Result<Observable<V>, ResolveError> {
        let reference = self
            .head
            .find_reference(key)
            .ok_or_else(|| ResolveError::MissingBinding(key.clone()))?;
        let observable = reference
            .entry
            .observe(self)
            .map_err(|e| e.into_resolve(key))?;
        let current = observable.get();
        self.emit_resolved(&current, key, &reference.entry);
        Ok(observable)
    }

    /// `try_` variant of [`observe`](Self::observe); see
    /// [`try_resolve`](Self::try_resolve) for the reporting rules.
    pub fn try_observe(&self, key: &Capability) -> Result<Option<Observable<V>>, ResolveError> {
        let Some(reference) = self.head.find_reference(key) else {
            return Ok(None);
        };
        match reference.entry.observe(self) {
            Ok(observable) => {
                let current = observable.get();
                self.emit_resolved(&current, key, &reference.entry);
                Ok(Some(observable))
            }
            Err(EntryError::NoValue) => Ok(None),
            Err(e) => Err(e.into_resolve(key)),
        }
    }

    /// Every key visible from the current scope with its entry kind,
    /// nearest registration first per key. Diagnostics only.
    #[must_use]
    pub fn dump_info(&self) -> String {
        let bindings = self.head.visible_bindings();
        if bindings.is_empty() {
            return String::from("container: (no bindings)");
        }
        let items: Vec<String> = bindings
            .iter()
            .map(|(key, kind)| format!("{key} [{kind}]"))
            .collect();
        format!("container: {}", items.join(", "))
    }

    // ── Diagnostics seams ────────────────────────────────────────────

    /// Label the consumer currently resolving, carried on resolve events
    /// and stamped as origin onto bindings it registers. Traversal drivers
    /// set this around each injection callback.
    pub fn set_current_node(&self, node: Option<&str>) {
        *self.current_node.borrow_mut() = node.map(Rc::from);
    }

    /// Fallback origin label for bindings registered outside injection.
    pub fn set_default_origin(&self, origin: Option<&str>) {
        *self.default_origin.borrow_mut() = origin.map(Rc::from);
    }

    /// Install a hook receiving a [`ResolveEvent`] on every successful
    /// resolve/observe.
    pub fn set_resolve_hook(&self, hook: impl Fn(&ResolveEvent<'_, V>) + 'static) {
        *self.hook.borrow_mut() = Some(Rc::new(hook));
    }

    /// Remove the resolve hook.
    pub fn clear_resolve_hook(&self) {
        *self.hook.borrow_mut() = None;
    }

    fn current_origin(&self) -> Option<Rc<str>> {
        self.current_node
            .borrow()
            .clone()
            .or_else(|| self.default_origin.borrow().clone())
    }

    fn emit_resolved(&self, value: &V, key: &Capability, entry: &Rc<Entry<V>>) {
        let node = self.current_node.borrow().clone();
        let origin = entry.origin();
        tracing::trace!(
            key = %key,
            node = node.as_deref().unwrap_or("-"),
            origin = origin.as_deref().unwrap_or("-"),
            "binding resolved"
        );
        let hook = self.hook.borrow().clone();
        if let Some(hook) = hook {
            hook(&ResolveEvent {
                value,
                node: node.as_deref(),
                key,
                origin: origin.as_deref(),
            });
        }
    }

    // ── Internal: scope-walk accessors for sequence entries ──────────

    pub(crate) fn depth(&self) -> usize {
        self.count
    }

    pub(crate) fn head_id(&self) -> u32 {
        self.head.id
    }

    /// Id of the ancestor at `depth` (0 = root), or `None` past the head.
    pub(crate) fn ancestor_id(&self, depth: usize) -> Option<u32> {
        if depth >= self.count {
            return None;
        }
        let mut node = Rc::clone(&self.head);
        for _ in depth..self.count - 1 {
            let parent = Rc::clone(node.parent.as_ref()?);
            node = parent;
        }
        Some(node.id)
    }

    pub(crate) fn stamp(&self) -> u64 {
        self.stamp.get()
    }

    pub(crate) fn bump_stamp(&self) {
        self.stamp.set(self.stamp.get() + 1);
    }
}

/// An immutable snapshot of a position in the scope graph.
///
/// Reconstruction via [`to_container`](Self::to_container) yields an
/// independent lineage whose head is the captured scope and whose stamp
/// starts at the captured value; the shared sequence state protects itself
/// against out-of-order reuse (see the module docs).
pub struct ScopePointer<V> {
    scope: Rc<ScopeNode<V>>,
    stamp: u64,
}

impl<V> Clone for ScopePointer<V> {
    fn clone(&self) -> Self {
        Self {
            scope: Rc::clone(&self.scope),
            stamp: self.stamp,
        }
    }
}

impl<V> fmt::Debug for ScopePointer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopePointer")
            .field("scope", &self.scope.id)
            .field("stamp", &self.stamp)
            .finish()
    }
}

impl<V: Clone + 'static> ScopePointer<V> {
    /// Rebuild a resolution context at the captured position. May be called
    /// any number of times; each call yields an independent lineage.
    #[must_use]
    pub fn to_container(&self) -> Container<V> {
        Container::from_parts(Rc::clone(&self.scope), self.stamp)
    }

    /// The stamp captured with this pointer.
    #[must_use]
    pub fn stamp(&self) -> u64 {
        self.stamp
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
