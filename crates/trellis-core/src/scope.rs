#![forbid(unsafe_code)]

//! Scope tree nodes with lazily-cached binding references.
//!
//! Each node owns a table mapping keys to the reference resolved for that
//! key *from this position* — including negative results, so repeated
//! lookups are O(1) after the first touch. Children hold `Rc`s to their
//! parents (nothing points down, so no cycles); a node stays alive as long
//! as a live container head or an outstanding scope pointer can still reach
//! it.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use ahash::AHashMap;

use crate::binding::Entry;
use crate::capability::Capability;

/// A resolved reference: which entry answers a key, and which scope owns it.
pub(crate) struct BindingRef<V> {
    pub(crate) entry: Rc<Entry<V>>,
    pub(crate) owner: Weak<ScopeNode<V>>,
}

impl<V> Clone for BindingRef<V> {
    fn clone(&self) -> Self {
        Self {
            entry: Rc::clone(&self.entry),
            owner: Weak::clone(&self.owner),
        }
    }
}

pub(crate) struct ScopeNode<V> {
    pub(crate) id: u32,
    pub(crate) parent: Option<Rc<ScopeNode<V>>>,
    /// Lookup cache and local registrations; `None` records a confirmed
    /// miss for the whole ancestor chain.
    table: RefCell<AHashMap<Capability, Option<BindingRef<V>>>>,
}

impl<V: Clone + 'static> ScopeNode<V> {
    pub(crate) fn root() -> Rc<Self> {
        Rc::new(Self {
            id: 0,
            parent: None,
            table: RefCell::new(AHashMap::new()),
        })
    }

    pub(crate) fn child(self: &Rc<Self>, id: u32) -> Rc<Self> {
        Rc::new(Self {
            id,
            parent: Some(Rc::clone(self)),
            table: RefCell::new(AHashMap::new()),
        })
    }

    /// Find the reference answering `key` from this scope, consulting the
    /// parent chain on a cache miss and caching the outcome either way.
    pub(crate) fn find_reference(self: &Rc<Self>, key: &Capability) -> Option<BindingRef<V>> {
        if let Some(cached) = self.table.borrow().get(key) {
            return cached.clone();
        }
        let inherited = self
            .parent
            .as_ref()
            .and_then(|parent| parent.find_reference(key));
        self.table
            .borrow_mut()
            .insert(key.clone(), inherited.clone());
        inherited
    }

    /// Register `entry` for `key` in this scope.
    ///
    /// A reference inherited from an ancestor (or a confirmed miss) is
    /// shadowed; a second registration *within this scope* replaces the
    /// entry with a Conflicted marker, so the failure surfaces lazily on
    /// the next read rather than at bind time.
    pub(crate) fn add_binding(self: &Rc<Self>, key: &Capability, entry: Rc<Entry<V>>) {
        let existing = self.find_reference(key);
        let me = Rc::downgrade(self);
        let doubled = matches!(&existing, Some(r) if Weak::ptr_eq(&r.owner, &me));
        let entry = if doubled {
            tracing::warn!(key = %key, scope = self.id, "double registration, marking conflicted");
            Entry::conflicted()
        } else {
            entry
        };
        self.table
            .borrow_mut()
            .insert(key.clone(), Some(BindingRef { entry, owner: me }));
    }

    /// Collect every `(key, entry kind)` visible from this scope, nearest
    /// registration first per key.
    pub(crate) fn visible_bindings(self: &Rc<Self>) -> Vec<(Capability, &'static str)> {
        let mut seen: AHashMap<Capability, &'static str> = AHashMap::new();
        let mut order: Vec<Capability> = Vec::new();
        let mut node = Some(Rc::clone(self));
        while let Some(current) = node {
            for (key, slot) in current.table.borrow().iter() {
                let Some(reference) = slot else { continue };
                // Only registrations owned by this node; cached copies of
                // ancestor entries are reported by their owner.
                if !Weak::ptr_eq(&reference.owner, &Rc::downgrade(&current)) {
                    continue;
                }
                if !seen.contains_key(key) {
                    seen.insert(key.clone(), reference.entry.kind_name());
                    order.push(key.clone());
                }
            }
            node = current.parent.clone();
        }
        order
            .into_iter()
            .map(|key| {
                let kind = seen[&key];
                (key, kind)
            })
            .collect()
    }
}
