#![forbid(unsafe_code)]

//! Capability keys and the memoized concrete-type → capability expansion.
//!
//! A [`Capability`] identifies one resolvable slot in the binding graph: a
//! plain capability name, or a generic capability with a single covariant
//! parameter applied to another capability. Keys are plain data — the engine
//! never inspects host types.
//!
//! [`CapabilityMap`] is the externally-supplied mapping from a concrete
//! model's key to the full set of capability keys it should also be
//! registered under. Expansion is transitive (whatever a declared capability
//! itself declares is also satisfied) and applies the covariant rule —
//! `Of(def, arg)` also yields `Of(def, c)` for every capability `c` of
//! `arg` — and is memoized per concrete key.
//!
//! # Invariants
//!
//! 1. Expansion is computed at most once per concrete key (memoized).
//! 2. Expansion output preserves declaration order and contains no
//!    duplicates.
//! 3. Declarations are expected to be acyclic; a cyclic declaration chain
//!    terminates (the in-progress key contributes nothing) rather than
//!    recursing forever.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};

/// A binding key: the abstract capability a value can be resolved by.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    /// A plain (non-generic) capability.
    Plain(&'static str),
    /// A generic capability with one covariant parameter, applied to an
    /// argument capability. `Of("ItemList", Plain("Todo"))` reads as
    /// `ItemList<Todo>`.
    Of(&'static str, Box<Capability>),
}

impl Capability {
    /// A plain capability key.
    #[must_use]
    pub const fn plain(name: &'static str) -> Self {
        Self::Plain(name)
    }

    /// A generic capability applied to `arg`.
    #[must_use]
    pub fn of(def: &'static str, arg: Capability) -> Self {
        Self::Of(def, Box::new(arg))
    }

    /// The outermost capability name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain(name) | Self::Of(name, _) => *name,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(name) => f.write_str(name),
            Self::Of(def, arg) => write!(f, "{def}<{arg}>"),
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Registry of declared capabilities per concrete model key, with memoized
/// covariant expansion.
#[derive(Default)]
pub struct CapabilityMap {
    declared: AHashMap<Capability, Vec<Capability>>,
    expanded: RefCell<AHashMap<Capability, Rc<[Capability]>>>,
}

impl CapabilityMap {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the direct capabilities of a concrete key.
    ///
    /// Later declarations for the same key replace earlier ones. Declaring
    /// after an expansion has been memoized clears the cache so the next
    /// lookup re-expands.
    pub fn declare(
        &mut self,
        concrete: Capability,
        capabilities: impl IntoIterator<Item = Capability>,
    ) {
        self.declared
            .insert(concrete, capabilities.into_iter().collect());
        self.expanded.borrow_mut().clear();
    }

    /// The full, expanded capability set of `concrete`, memoized.
    ///
    /// An undeclared key expands to the empty set.
    #[must_use]
    pub fn capabilities_of(&self, concrete: &Capability) -> Rc<[Capability]> {
        if let Some(cached) = self.expanded.borrow().get(concrete) {
            return Rc::clone(cached);
        }
        let mut out = Vec::new();
        let mut seen = AHashSet::new();
        let mut in_progress = AHashSet::new();
        self.expand_into(concrete, &mut out, &mut seen, &mut in_progress);
        let expanded: Rc<[Capability]> = out.into();
        self.expanded
            .borrow_mut()
            .insert(concrete.clone(), Rc::clone(&expanded));
        expanded
    }

    fn expand_into(
        &self,
        concrete: &Capability,
        out: &mut Vec<Capability>,
        seen: &mut AHashSet<Capability>,
        in_progress: &mut AHashSet<Capability>,
    ) {
        if !in_progress.insert(concrete.clone()) {
            return;
        }
        for cap in self.declared.get(concrete).map_or(&[][..], Vec::as_slice) {
            if seen.insert(cap.clone()) {
                out.push(cap.clone());
            }
            // Capabilities are transitive: whatever a capability itself
            // declares is also satisfied.
            self.expand_into(cap, out, seen, in_progress);
            if let Capability::Of(def, arg) = cap {
                // Covariant rule: the generic capability also registers
                // under every capability satisfied by its argument.
                let mut arg_caps = Vec::new();
                self.expand_into(arg, &mut arg_caps, &mut AHashSet::new(), in_progress);
                for arg_cap in arg_caps {
                    let widened = Capability::of(*def, arg_cap);
                    if seen.insert(widened.clone()) {
                        out.push(widened);
                    }
                }
            }
        }
        in_progress.remove(concrete);
    }
}

impl fmt::Debug for CapabilityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityMap")
            .field("declared", &self.declared.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
