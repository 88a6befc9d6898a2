//! Property-based invariant tests for scoped binding resolution.
//!
//! These verify structural invariants that must hold for **any** scope
//! chain and binding layout:
//!
//! 1. Resolution returns the nearest registration on the ancestor chain
//!    (or `MissingBinding` when there is none), regardless of where lookups
//!    warmed the per-scope caches.
//! 2. Resolution is idempotent: the cached fast path agrees with the first
//!    lookup.
//! 3. A sequence seeded with N values hands element i to the i-th sibling
//!    branch in visitation order, idempotently within each branch, and
//!    fails with `BindingExhausted` from branch N onward.
//! 4. Pointer reconstruction resolves non-sequence bindings exactly like
//!    the live context at capture time.

use proptest::prelude::*;
use trellis_core::capability::Capability;
use trellis_core::container::Container;
use trellis_core::error::ResolveError;

fn key() -> Capability {
    Capability::plain("Model")
}

proptest! {
    // ── 1 + 2: nearest registration wins, cached or not ────────────────

    #[test]
    fn nearest_registration_wins(
        levels in proptest::collection::vec(
            (proptest::option::of(0i32..1000), any::<bool>()),
            0..12,
        )
    ) {
        let mut container = Container::new();
        let mut expected: Option<i32> = None;

        for (binding, warm_cache) in &levels {
            if let Some(value) = binding {
                container.bind(key(), *value);
                expected = Some(*value);
            }
            if *warm_cache {
                // Touching the cache mid-build must not pin a stale answer
                // for deeper scopes registered later.
                let _ = container.resolve(&key());
            }
            container.enter_scope();
        }

        let outcome = container.resolve(&key());
        match expected {
            Some(value) => prop_assert_eq!(outcome, Ok(value)),
            None => prop_assert_eq!(outcome, Err(ResolveError::MissingBinding(key()))),
        }

        // Idempotence: the now-cached path agrees.
        let again = container.resolve(&key());
        match expected {
            Some(value) => prop_assert_eq!(again, Ok(value)),
            None => prop_assert_eq!(again, Err(ResolveError::MissingBinding(key()))),
        }
    }

    // ── 3: sequence distribution across sibling branches ───────────────

    #[test]
    fn sequence_distributes_in_branch_order(
        values in proptest::collection::vec(0i32..1000, 0..6),
        branch_reads in proptest::collection::vec(1usize..4, 0..10),
    ) {
        let mut container = Container::new();
        container.bind_sequence(key(), values.clone());

        for (branch, reads) in branch_reads.iter().enumerate() {
            container.enter_scope();
            for _ in 0..*reads {
                let outcome = container.resolve(&key());
                match values.get(branch) {
                    Some(value) => prop_assert_eq!(outcome, Ok(*value)),
                    None => prop_assert_eq!(
                        outcome,
                        Err(ResolveError::BindingExhausted(key()))
                    ),
                }
            }
            container.exit_scope();
        }
    }

    // ── 4: pointer reconstruction mirrors capture time ─────────────────

    #[test]
    fn pointer_reconstruction_matches_live_context(
        levels in proptest::collection::vec(proptest::option::of(0i32..1000), 1..8),
    ) {
        let mut container = Container::new();
        let mut expected: Option<i32> = None;

        for binding in &levels {
            if let Some(value) = binding {
                container.bind(key(), *value);
                expected = Some(*value);
            }
            container.enter_scope();
        }

        let pointer = container.pointer();
        // Unwind the live context entirely; the pointer must still work.
        for _ in 0..levels.len() {
            container.exit_scope();
        }

        let restored = pointer.to_container();
        match expected {
            Some(value) => prop_assert_eq!(restored.resolve(&key()), Ok(value)),
            None => prop_assert_eq!(
                restored.resolve(&key()),
                Err(ResolveError::MissingBinding(key()))
            ),
        }
    }
}
