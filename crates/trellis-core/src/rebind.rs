#![forbid(unsafe_code)]

//! Reactive rebinding helpers and the model-graph expansion walk.
//!
//! [`bind_reactive`] and [`bind_sequence_reactive`] wire a binding to an
//! upstream [`Observable`]: each publication re-selects a value (or list)
//! from the source and rebinds it, so downstream observers of the binding
//! follow the upstream model. The returned guard owns the subscription —
//! drop it and the binding freezes at its last value.
//!
//! [`child_models`] expands a model value into its transitive child models
//! via a host-supplied children function, with a path-based visited check
//! that surfaces [`CyclicReference`] instead of recursing forever.

use ahash::AHashSet;

use crate::binding::{Binding, SequenceBinding};
use crate::capability::Capability;
use crate::container::Container;
use crate::error::CyclicReference;
use crate::observable::{Observable, Subscription};

/// A binding kept in sync with an upstream observable.
///
/// Holds the upstream subscription; dropping the guard disconnects the
/// binding from the source.
#[derive(Debug)]
pub struct ReactiveBinding<V> {
    binding: Binding<V>,
    _upstream: Subscription,
}

impl<V: Clone + 'static> ReactiveBinding<V> {
    /// The underlying rebind handle.
    #[must_use]
    pub fn binding(&self) -> &Binding<V> {
        &self.binding
    }
}

/// Register a value-less binding for `key` and keep it rebound to
/// `select(source value)` on every upstream publication, including the
/// replay at subscription time — so the binding is seeded immediately.
pub fn bind_reactive<V: Clone + 'static>(
    container: &Container<V>,
    key: Capability,
    source: &Observable<V>,
    select: impl Fn(&V) -> V + 'static,
) -> ReactiveBinding<V> {
    let binding = container.create_binding(key);
    let handle = binding.clone();
    let upstream = source.subscribe(move |value| handle.rebind(select(value)));
    ReactiveBinding {
        binding,
        _upstream: upstream,
    }
}

/// A sequence binding kept in sync with an upstream observable.
#[derive(Debug)]
pub struct ReactiveSequenceBinding<V> {
    sequence: SequenceBinding<V>,
    _upstream: Subscription,
}

impl<V: Clone + 'static> ReactiveSequenceBinding<V> {
    /// The underlying rebind handle.
    #[must_use]
    pub fn sequence(&self) -> &SequenceBinding<V> {
        &self.sequence
    }
}

/// Register an unseeded sequence binding for `key` and keep its backing
/// list rebound to `select(source value)` on every upstream publication.
pub fn bind_sequence_reactive<V: Clone + 'static>(
    container: &Container<V>,
    key: Capability,
    source: &Observable<V>,
    select: impl Fn(&V) -> Vec<V> + 'static,
) -> ReactiveSequenceBinding<V> {
    let sequence = container.create_sequence_binding(key);
    let handle = sequence.clone();
    let upstream = source.subscribe(move |value| handle.rebind_all(select(value)));
    ReactiveSequenceBinding {
        sequence,
        _upstream: upstream,
    }
}

/// Expand `value` (known under `concrete`) into its transitive child
/// models, depth-first, in discovery order.
///
/// `children_of` reports the direct children of one model as
/// `(capability, value)` pairs; a `None` value is reported but not
/// descended into. A child whose capability is already on the current
/// expansion path fails with [`CyclicReference`] naming that capability;
/// diamond shapes (the same capability reachable along separate paths) are
/// allowed.
pub fn child_models<V, F>(
    concrete: &Capability,
    value: &V,
    children_of: &F,
) -> Result<Vec<(Capability, Option<V>)>, CyclicReference>
where
    V: Clone,
    F: Fn(&Capability, &V) -> Vec<(Capability, Option<V>)>,
{
    let mut out = Vec::new();
    let mut path = AHashSet::new();
    path.insert(concrete.clone());
    walk(concrete, value, children_of, &mut path, &mut out)?;
    Ok(out)
}

fn walk<V, F>(
    concrete: &Capability,
    value: &V,
    children_of: &F,
    path: &mut AHashSet<Capability>,
    out: &mut Vec<(Capability, Option<V>)>,
) -> Result<(), CyclicReference>
where
    V: Clone,
    F: Fn(&Capability, &V) -> Vec<(Capability, Option<V>)>,
{
    for (capability, child) in children_of(concrete, value) {
        if path.contains(&capability) {
            return Err(CyclicReference(capability));
        }
        out.push((capability.clone(), child.clone()));
        if let Some(child_value) = child {
            path.insert(capability.clone());
            walk(&capability, &child_value, children_of, path, out)?;
            path.remove(&capability);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
