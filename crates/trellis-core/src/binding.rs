#![forbid(unsafe_code)]

//! Binding entries: the storage unit for one resolvable key inside one scope.
//!
//! Four variants share a uniform read contract (current value / reactive
//! value, both resolved against a [`Container`]):
//!
//! - **Single**: an optional current value; readable once a value is set,
//!   rebindable at any time.
//! - **Sequence**: an ordered backing list plus a branch-positional cursor;
//!   hands out one element per tree branch as resolution proceeds.
//! - **Factory**: a producer invoked fresh on every resolution; observation
//!   wraps one fresh value (not re-invoked per subscriber).
//! - **Conflicted**: the marker left behind by a same-scope double
//!   registration; every read fails.
//!
//! Entries are shared (`Rc`) between the scope that owns them, the caches of
//! descendant scopes, and the rebind handles returned at bind time, so a
//! rebind through any handle is visible to every holder.

use std::cell::RefCell;
use std::rc::Rc;

use crate::capability::Capability;
use crate::container::Container;
use crate::error::ResolveError;
use crate::observable::Observable;

/// Internal failure modes of an entry read, translated into the public
/// taxonomy by the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryError {
    NoValue,
    Conflict,
    Exhausted,
    Stale,
}

impl EntryError {
    pub(crate) fn into_resolve(self, key: &Capability) -> ResolveError {
        match self {
            Self::NoValue => ResolveError::MissingBinding(key.clone()),
            Self::Conflict => ResolveError::ConflictedBinding(key.clone()),
            Self::Exhausted => ResolveError::BindingExhausted(key.clone()),
            Self::Stale => ResolveError::StaleScope,
        }
    }
}

struct SequenceState<V> {
    /// `None` until seeded; reads fail with `NoValue` until then.
    values: Option<Vec<V>>,
    /// One memoized wrapper slot per backing element, grown lazily.
    observed: Vec<Option<Observable<V>>>,
    /// Index of the element handed to the current branch; `None` before the
    /// first read.
    cursor: Option<usize>,
    /// `(scope id, scope depth)` of the position the cursor last advanced
    /// from.
    prev: Option<(u32, usize)>,
    /// Lineage stamp recorded at the last advance.
    stamp: u64,
}

impl<V: Clone + 'static> SequenceState<V> {
    fn read(&mut self, cx: &Container<V>) -> Result<V, EntryError> {
        if self.values.is_none() {
            return Err(EntryError::NoValue);
        }
        let index = self.advance(cx)?;
        self.values
            .as_ref()
            .expect("backing list checked above")
            .get(index)
            .cloned()
            .ok_or(EntryError::Exhausted)
    }

    fn observe(&mut self, cx: &Container<V>) -> Result<Observable<V>, EntryError> {
        let len = match &self.values {
            None => return Err(EntryError::NoValue),
            Some(values) => values.len(),
        };
        if self.observed.len() < len {
            self.observed.resize_with(len, || None);
        }
        let index = self.advance(cx)?;
        let value = self
            .values
            .as_ref()
            .expect("backing list checked above")
            .get(index)
            .cloned()
            .ok_or(EntryError::Exhausted)?;
        Ok(self.observed[index]
            .get_or_insert_with(|| Observable::new(value))
            .clone())
    }

    /// Advance the cursor iff the requesting position is outside the branch
    /// it was last read from: same node or a descendant of the remembered
    /// position returns the same element; a sibling or cousin (detected by
    /// comparing the ancestor at the remembered depth) moves to the next.
    fn advance(&mut self, cx: &Container<V>) -> Result<usize, EntryError> {
        if cx.stamp() < self.stamp {
            return Err(EntryError::Stale);
        }
        let head_depth = cx.depth() - 1;
        let moved = match self.prev {
            None => true,
            Some((id, depth)) => head_depth < depth || cx.ancestor_id(depth) != Some(id),
        };
        if moved {
            self.cursor = Some(self.cursor.map_or(0, |c| c + 1));
            self.prev = Some((cx.head_id(), head_depth));
            cx.bump_stamp();
            self.stamp = cx.stamp();
        }
        Ok(self.cursor.expect("cursor is set by the first advance"))
    }
}

enum EntryKind<V> {
    Single {
        value: Option<V>,
        observed: Option<Observable<V>>,
    },
    Sequence(SequenceState<V>),
    Factory(Rc<dyn Fn() -> V>),
    Conflicted,
}

/// One registered binding, shared between scopes, caches, and handles.
pub(crate) struct Entry<V> {
    kind: RefCell<EntryKind<V>>,
    /// Diagnostic label of whoever registered the entry; carried on
    /// resolve events, never consulted for resolution.
    origin: RefCell<Option<Rc<str>>>,
}

enum ReadStep<T, V> {
    Done(Result<T, EntryError>),
    Produce(Rc<dyn Fn() -> V>),
}

impl<V: Clone + 'static> Entry<V> {
    pub(crate) fn single(value: Option<V>) -> Rc<Self> {
        Self::with_kind(EntryKind::Single {
            value,
            observed: None,
        })
    }

    pub(crate) fn sequence(values: Option<Vec<V>>) -> Rc<Self> {
        Self::with_kind(EntryKind::Sequence(SequenceState {
            values,
            observed: Vec::new(),
            cursor: None,
            prev: None,
            stamp: 0,
        }))
    }

    pub(crate) fn factory(produce: impl Fn() -> V + 'static) -> Rc<Self> {
        Self::with_kind(EntryKind::Factory(Rc::new(produce)))
    }

    pub(crate) fn conflicted() -> Rc<Self> {
        Self::with_kind(EntryKind::Conflicted)
    }

    fn with_kind(kind: EntryKind<V>) -> Rc<Self> {
        Rc::new(Self {
            kind: RefCell::new(kind),
            origin: RefCell::new(None),
        })
    }

    /// Resolve the entry's current value against `cx`.
    pub(crate) fn value(&self, cx: &Container<V>) -> Result<V, EntryError> {
        let step = {
            let mut kind = self.kind.borrow_mut();
            match &mut *kind {
                EntryKind::Single { value, .. } => {
                    ReadStep::Done(value.clone().ok_or(EntryError::NoValue))
                }
                EntryKind::Sequence(seq) => ReadStep::Done(seq.read(cx)),
                EntryKind::Factory(produce) => ReadStep::Produce(Rc::clone(produce)),
                EntryKind::Conflicted => ReadStep::Done(Err(EntryError::Conflict)),
            }
        };
        match step {
            ReadStep::Done(result) => result,
            // Invoked outside the borrow: producers may resolve re-entrantly.
            ReadStep::Produce(produce) => Ok(produce()),
        }
    }

    /// Resolve a reactive wrapper for the entry's current slot.
    pub(crate) fn observe(&self, cx: &Container<V>) -> Result<Observable<V>, EntryError> {
        let step = {
            let mut kind = self.kind.borrow_mut();
            match &mut *kind {
                EntryKind::Single { value, observed } => ReadStep::Done(match value {
                    None => Err(EntryError::NoValue),
                    Some(v) => {
                        let slot = observed.get_or_insert_with(|| Observable::new(v.clone()));
                        Ok(slot.clone())
                    }
                }),
                EntryKind::Sequence(seq) => ReadStep::Done(seq.observe(cx)),
                EntryKind::Factory(produce) => ReadStep::Produce(Rc::clone(produce)),
                EntryKind::Conflicted => ReadStep::Done(Err(EntryError::Conflict)),
            }
        };
        match step {
            ReadStep::Done(result) => result,
            ReadStep::Produce(produce) => Ok(Observable::new(produce())),
        }
    }

    fn rebind_single(&self, value: V) {
        let observed = {
            let mut kind = self.kind.borrow_mut();
            match &mut *kind {
                EntryKind::Single { value: slot, observed } => {
                    *slot = Some(value.clone());
                    observed.clone()
                }
                _ => unreachable!("rebind handles only wrap Single entries"),
            }
        };
        // Publish outside the borrow: subscribers may resolve or rebind.
        if let Some(observable) = observed {
            observable.set(value);
        }
    }

    fn rebind_item(&self, index: usize, value: V) {
        let observed = {
            let mut kind = self.kind.borrow_mut();
            match &mut *kind {
                EntryKind::Sequence(seq) => {
                    let values = seq
                        .values
                        .as_mut()
                        .expect("rebind_item requires a seeded sequence");
                    values[index] = value.clone();
                    seq.observed.get(index).and_then(Clone::clone)
                }
                _ => unreachable!("sequence handles only wrap Sequence entries"),
            }
        };
        if let Some(observable) = observed {
            observable.set(value);
        }
    }

    fn rebind_all(&self, new_values: Vec<V>) {
        let notifications: Vec<(Observable<V>, V)> = {
            let mut kind = self.kind.borrow_mut();
            match &mut *kind {
                EntryKind::Sequence(seq) => {
                    seq.values = Some(new_values);
                    let values = seq.values.as_ref().expect("just assigned");
                    if seq.observed.len() < values.len() {
                        seq.observed.resize_with(values.len(), || None);
                    }
                    // Republish index-wise to every wrapper still covered by
                    // the new list; wrappers past the end keep their last
                    // value.
                    seq.observed
                        .iter()
                        .enumerate()
                        .filter_map(|(i, slot)| {
                            let observable = slot.as_ref()?.clone();
                            let value = values.get(i)?.clone();
                            Some((observable, value))
                        })
                        .collect()
                }
                _ => unreachable!("sequence handles only wrap Sequence entries"),
            }
        };
        for (observable, value) in notifications {
            observable.set(value);
        }
    }

    pub(crate) fn set_origin(&self, origin: Option<Rc<str>>) {
        *self.origin.borrow_mut() = origin;
    }

    pub(crate) fn origin(&self) -> Option<Rc<str>> {
        self.origin.borrow().clone()
    }

    /// Variant name, for diagnostics output.
    pub(crate) fn kind_name(&self) -> &'static str {
        match &*self.kind.borrow() {
            EntryKind::Single { .. } => "single",
            EntryKind::Sequence(_) => "sequence",
            EntryKind::Factory(_) => "factory",
            EntryKind::Conflicted => "conflicted",
        }
    }
}

/// Rebind handle for a Single entry, returned at bind time.
///
/// Rebinding replaces the stored value and publishes it through any
/// reactive wrapper already handed out by `observe`.
pub struct Binding<V> {
    entry: Rc<Entry<V>>,
}

impl<V> Clone for Binding<V> {
    fn clone(&self) -> Self {
        Self {
            entry: Rc::clone(&self.entry),
        }
    }
}

impl<V> std::fmt::Debug for Binding<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding").finish()
    }
}

impl<V: Clone + 'static> Binding<V> {
    pub(crate) fn new(entry: Rc<Entry<V>>) -> Self {
        Self { entry }
    }

    /// Replace the bound value and publish to existing observers.
    pub fn rebind(&self, value: V) {
        self.entry.rebind_single(value);
    }
}

/// Rebind handle for a Sequence entry, returned at bind time.
pub struct SequenceBinding<V> {
    entry: Rc<Entry<V>>,
}

impl<V> Clone for SequenceBinding<V> {
    fn clone(&self) -> Self {
        Self {
            entry: Rc::clone(&self.entry),
        }
    }
}

impl<V> std::fmt::Debug for SequenceBinding<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceBinding").finish()
    }
}

impl<V: Clone + 'static> SequenceBinding<V> {
    pub(crate) fn new(entry: Rc<Entry<V>>) -> Self {
        Self { entry }
    }

    /// Replace one backing element and publish to its observers.
    ///
    /// # Panics
    ///
    /// Panics if the sequence has never been seeded or `index` is out of
    /// bounds.
    pub fn rebind_item(&self, index: usize, value: V) {
        self.entry.rebind_item(index, value);
    }

    /// Replace the whole backing list, republishing index-wise to every
    /// existing observer still covered by the new list. The cursor is not
    /// reset: branches keep the element index they were assigned.
    pub fn rebind_all(&self, values: impl IntoIterator<Item = V>) {
        self.entry.rebind_all(values.into_iter().collect());
    }
}
