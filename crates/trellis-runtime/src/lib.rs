#![forbid(unsafe_code)]

//! Runtime: depth-first tree injection over an external consumer tree,
//! with deferred re-injection of dynamically-added subtrees.

pub mod diagnostics;
pub mod injector;
pub mod tree;

pub use diagnostics::{InjectionFailure, InjectionSink};
pub use injector::{DEFAULT_MAX_FLUSH_CYCLES, DeferredMarker, FlushError, TreeInjector};
pub use tree::{Consumer, InjectError, InjectNode, InjectionPolicy};
