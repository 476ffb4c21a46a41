//! Filepath: src/ordering.rs
//!
//! Named memory orderings for node field access.
//!
//! Keeping these behind constants makes the pairing explicit at every
//! access site: optimistic readers Acquire-load what lock holders
//! Release-store.

use std::sync::atomic::Ordering;

/// Ordering for reading node fields during optimistic traversal.
/// Pairs with a writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing node fields under lock.
/// Pairs with a reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for stores within a locked region that are published later
/// by a Release store (slot contents before the permutation, sibling
/// links before `next`).
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Success ordering for compare-exchange (lock word, root pointer).
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Failure ordering for compare-exchange.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;
