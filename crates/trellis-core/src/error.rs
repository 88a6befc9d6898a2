#![forbid(unsafe_code)]

//! Public failure taxonomy for binding resolution.

use thiserror::Error;

use crate::capability::Capability;

/// A typed resolution failure, surfaced directly to `resolve`/`observe`
/// callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// No binding is registered for the key anywhere on the scope chain,
    /// or the registered entry has never been given a value.
    #[error("no value bound for {0}")]
    MissingBinding(Capability),

    /// The key was registered twice within the same scope; reads fail until
    /// the registrations are separated into distinct scopes.
    #[error("conflicting bindings for {0} in the same scope")]
    ConflictedBinding(Capability),

    /// A sequence binding's cursor advanced past its backing list.
    #[error("sequence binding for {0} has no more values")]
    BindingExhausted(Capability),

    /// A reconstructed resolution context tried to advance a sequence
    /// cursor that has already moved on under a different lineage. This is
    /// a usage error: fail fast, do not retry.
    #[error("stale scope pointer: sequence state has advanced past this context")]
    StaleScope,
}

/// A model graph referenced one of its own ancestors while being expanded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cyclic model reference through {0}")]
pub struct CyclicReference(pub Capability);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
