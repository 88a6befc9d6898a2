#![forbid(unsafe_code)]

//! Injection failure records for observability tooling.

use crate::tree::InjectError;

/// Record of one failed injection callback: which consumer failed, what it
/// failed with, and the traversal's external context label if one was set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionFailure {
    pub consumer: String,
    pub error: InjectError,
    pub context: Option<String>,
}

/// Receiver for injection failure records, alongside the injector's
/// built-in `tracing` output and last-failure slot.
pub trait InjectionSink {
    fn record(&self, failure: &InjectionFailure);
}
