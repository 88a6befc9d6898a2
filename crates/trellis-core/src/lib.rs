#![forbid(unsafe_code)]

//! Core: scoped binding graph, reactive values, and pointer/stamp resolution.

pub mod binding;
pub mod capability;
pub mod container;
pub mod error;
pub mod observable;
pub mod rebind;

mod scope;

pub use binding::{Binding, SequenceBinding};
pub use capability::{Capability, CapabilityMap};
pub use container::{Container, ResolveEvent, ScopePointer};
pub use error::{CyclicReference, ResolveError};
pub use observable::{Observable, Subscription};
