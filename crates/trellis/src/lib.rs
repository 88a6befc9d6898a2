#![forbid(unsafe_code)]

//! Trellis public facade crate.
//!
//! This crate provides the stable, ergonomic surface area for users.

pub mod prelude {
    pub use trellis_core as core;
    pub use trellis_runtime as runtime;

    pub use trellis_core::{
        Binding, Capability, CapabilityMap, Container, Observable, ResolveError, ScopePointer,
        SequenceBinding, Subscription,
    };
    pub use trellis_runtime::{
        Consumer, DeferredMarker, InjectError, InjectNode, InjectionPolicy, TreeInjector,
    };
}
