#![forbid(unsafe_code)]

//! Collaborator traits at the consumer-tree seam.
//!
//! The injector walks a hierarchical structure it does not own. Hosts
//! expose it through [`InjectNode`] (children, injectable consumers, and a
//! per-node [`InjectionPolicy`]) and implement [`Consumer`] on anything
//! that wants dependencies injected.
//!
//! Handle stability: the injector tracks consumers and nodes by `Rc`
//! allocation identity. `consumers()` and `children()` must hand out the
//! same `Rc`s on every call — returning freshly-allocated wrappers would
//! defeat once-only injection and deferred re-injection.

use std::rc::Rc;

use thiserror::Error;
use trellis_core::container::Container;
use trellis_core::error::ResolveError;

/// Failure raised by a consumer's injection callbacks.
///
/// Never propagated out of a traversal: the injector records it and moves
/// on to the next consumer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InjectError {
    /// A resolution failure, typically from `resolve`/`observe` inside the
    /// callback.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A host-specific failure.
    #[error("{0}")]
    Other(String),
}

impl InjectError {
    /// A host-specific failure from a message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// Per-node traversal policy, read from the node at `Entering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InjectionPolicy {
    /// Visit normally.
    #[default]
    Normal,
    /// Skip this node and its whole subtree.
    Ignore,
    /// Skip the subtree when the node is flagged inactive.
    IgnoreWhenInactive,
    /// Visit only when this node is the traversal's starting node.
    OnlyAsRoot,
}

/// Something that receives dependencies during a tree injection pass.
pub trait Consumer<V> {
    /// Resolve dependencies and register bindings for descendants. Called
    /// at most once per traversal instance, before the node's children are
    /// visited.
    fn inject(&self, cx: &Container<V>) -> Result<(), InjectError>;

    /// Called after every descendant of this consumer's node has been
    /// injected, before the node's scope is exited.
    fn after_children_injected(&self) -> Result<(), InjectError> {
        Ok(())
    }

    /// Diagnostic label carried on resolve events and failure records.
    fn name(&self) -> &str {
        "consumer"
    }
}

/// One node of the external consumer tree.
pub trait InjectNode<V> {
    /// Traversal policy for this node.
    fn policy(&self) -> InjectionPolicy {
        InjectionPolicy::Normal
    }

    /// Whether the node counts as active for
    /// [`InjectionPolicy::IgnoreWhenInactive`].
    fn is_active(&self) -> bool {
        true
    }

    /// The injectable consumers carried by this node, in injection order.
    /// Must return stable `Rc` handles (see module docs).
    fn consumers(&self) -> Vec<Rc<dyn Consumer<V>>> {
        Vec::new()
    }

    /// Child nodes in visitation order. Must return stable `Rc` handles.
    fn children(&self) -> Vec<Rc<dyn InjectNode<V>>> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
