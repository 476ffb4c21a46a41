//! Filepath: src/nodeversion.rs
//!
//! Versioned per-node lock for optimistic concurrency control.
//!
//! [`NodeVersion`] packs the lock bit, the `INSERT`/`SPLIT` dirty bits,
//! two monotonically increasing change counters, and node metadata into
//! one `AtomicU32`. Everything lives in a single word on purpose: the
//! stable-version protocol depends on readers observing flags and
//! counters in one load.
//!
//! # Protocol
//!
//! - Readers call [`NodeVersion::stable`] to capture a version with no
//!   dirty bit set, perform their reads, then ask
//!   [`NodeVersion::has_changed`] (or [`NodeVersion::has_split`])
//!   whether the capture is still current.
//! - Writers call [`NodeVersion::lock`], receive a [`LockGuard`], set
//!   the matching dirty bit *before* touching node state, and let the
//!   guard's drop clear the bit and bump the counter in one release
//!   store.
//!
//! The guard is the only unlock path, so a panic while holding a node
//! lock still releases it.

use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};

// ============================================================================
//  Bit layout
// ============================================================================

/// Lock bit: a writer holds the node.
const LOCK_BIT: u32 = 1 << 0;

/// Dirty bit: a logical insert is in progress.
const INSERTING_BIT: u32 = 1 << 1;

/// Dirty bit: a split is in progress.
const SPLITTING_BIT: u32 = 1 << 2;

/// Either dirty bit.
const DIRTY_MASK: u32 = INSERTING_BIT | SPLITTING_BIT;

/// Low bit of the insert counter (bits 3..9).
const VINSERT_LOWBIT: u32 = 1 << 3;

/// Low bit of the split counter (bits 9..28).
const VSPLIT_LOWBIT: u32 = 1 << 9;

/// Node is logically deleted. Never set while deletion is out of scope;
/// readers assert against it.
const DELETED_BIT: u32 = 1 << 29;

/// Node is the root of its layer.
const ROOT_BIT: u32 = 1 << 30;

/// Node is a border node (cleared for interior nodes).
const BORDER_BIT: u32 = 1 << 31;

/// Unlock after a split clears the lock, both dirty bits, and resets the
/// insert counter; the split counter has just been incremented.
const SPLIT_UNLOCK_MASK: u32 = !(VSPLIT_LOWBIT - 1);

/// Unlock after an insert clears the lock and both dirty bits.
const INSERT_UNLOCK_MASK: u32 = !(VINSERT_LOWBIT - 1);

/// Spin backoff start (pause iterations).
const BACKOFF_MIN: u32 = 4;

/// Spin backoff cap (pause iterations).
const BACKOFF_MAX: u32 = 128;

// ============================================================================
//  NodeVersion
// ============================================================================

/// The version word of a tree node.
#[derive(Debug)]
pub struct NodeVersion {
    value: AtomicU32,
}

impl NodeVersion {
    /// Create an unlocked version word.
    #[must_use]
    pub const fn new(is_border: bool) -> Self {
        let initial: u32 = if is_border { BORDER_BIT } else { 0 };

        Self {
            value: AtomicU32::new(initial),
        }
    }

    /// Rebuild a version word from a raw value.
    ///
    /// Used when a split births the right sibling already locked and
    /// splitting, carrying the left node's counters.
    #[must_use]
    pub(crate) const fn from_value(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
        }
    }

    // ========================================================================
    //  Flag accessors
    // ========================================================================

    /// Raw version value, acquire-ordered.
    #[inline]
    #[must_use]
    pub fn value(&self) -> u32 {
        self.value.load(READ_ORD)
    }

    /// Check the border/interior discriminant.
    #[inline]
    #[must_use]
    pub fn is_border(&self) -> bool {
        self.value.load(RELAXED) & BORDER_BIT != 0
    }

    /// Check whether this node is the root of its layer.
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.value.load(READ_ORD) & ROOT_BIT != 0
    }

    /// Check whether this node is logically deleted.
    #[inline]
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.value.load(RELAXED) & DELETED_BIT != 0
    }

    /// Check whether a writer currently holds the node.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.value.load(RELAXED) & LOCK_BIT != 0
    }

    /// Whether `raw` carries the border discriminant.
    #[inline]
    #[must_use]
    pub const fn raw_is_border(raw: u32) -> bool {
        raw & BORDER_BIT != 0
    }

    /// Whether `raw` carries the root flag.
    #[inline]
    #[must_use]
    pub const fn raw_is_root(raw: u32) -> bool {
        raw & ROOT_BIT != 0
    }

    /// Whether `raw` carries the deleted flag.
    #[inline]
    #[must_use]
    pub const fn raw_is_deleted(raw: u32) -> bool {
        raw & DELETED_BIT != 0
    }

    // ========================================================================
    //  Stable versions and change detection
    // ========================================================================

    /// Capture a version with neither dirty bit set, spinning past any
    /// in-progress insert or split.
    #[inline]
    #[must_use]
    pub fn stable(&self) -> u32 {
        let mut v: u32 = self.value.load(READ_ORD);

        while v & DIRTY_MASK != 0 {
            std::hint::spin_loop();
            v = self.value.load(READ_ORD);
        }

        v
    }

    /// Check whether the node changed since the captured version `old`.
    ///
    /// A difference confined to the lock bit does not count: locking
    /// alone modifies nothing a reader can observe.
    #[inline]
    #[must_use]
    pub fn has_changed(&self, old: u32) -> bool {
        // Order the caller's data reads before this re-read.
        fence(Ordering::Acquire);
        (old ^ self.value.load(READ_ORD)) > LOCK_BIT
    }

    /// Check whether a split happened since the captured version `old`.
    ///
    /// True when the split counter (or any higher metadata bit, which is
    /// equally disqualifying) differs.
    #[inline]
    #[must_use]
    pub fn has_split(&self, old: u32) -> bool {
        fence(Ordering::Acquire);
        (old ^ self.value.load(READ_ORD)) >= VSPLIT_LOWBIT
    }

    /// Compare two captured versions for a split-counter difference.
    #[inline]
    #[must_use]
    pub(crate) const fn split_differs(a: u32, b: u32) -> bool {
        (a ^ b) >= VSPLIT_LOWBIT
    }

    // ========================================================================
    //  Locking
    // ========================================================================

    /// Acquire the node lock, spinning with exponential backoff.
    ///
    /// Backoff pauses start at [`BACKOFF_MIN`] relax hints and double up
    /// to [`BACKOFF_MAX`] while the lock is observed held.
    #[must_use = "dropping the guard immediately releases the lock"]
    pub fn lock(&self) -> LockGuard<'_> {
        loop {
            let mut backoff: u32 = BACKOFF_MIN;
            let mut v: u32 = self.value.load(RELAXED);

            while v & LOCK_BIT != 0 {
                for _ in 0..backoff {
                    std::hint::spin_loop();
                }
                if backoff < BACKOFF_MAX {
                    backoff += backoff;
                }
                v = self.value.load(RELAXED);
            }

            // An unlocked version never carries dirty bits; they are
            // cleared by every unlock.
            debug_assert_eq!(v & DIRTY_MASK, 0, "unlocked version carries dirty bits");

            if self
                .value
                .compare_exchange_weak(v, v | LOCK_BIT, CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
            {
                return LockGuard {
                    version: self,
                    locked_value: v | LOCK_BIT,
                    _marker: PhantomData,
                };
            }
        }
    }

    /// Build a guard for a node that is already locked.
    ///
    /// Used for the right sibling a split creates in the locked state.
    ///
    /// # Panics
    ///
    /// Debug-panics if the node is not locked.
    #[must_use]
    pub(crate) fn adopt_locked(&self) -> LockGuard<'_> {
        let v: u32 = self.value.load(RELAXED);
        debug_assert!(v & LOCK_BIT != 0, "adopt_locked on an unlocked node");

        LockGuard {
            version: self,
            locked_value: v,
            _marker: PhantomData,
        }
    }

    // ========================================================================
    //  Pre-publication setup
    // ========================================================================

    /// Set the root flag.
    ///
    /// Only valid before the node is reachable by other threads (layer
    /// roots are marked while still private).
    pub fn mark_root(&self) {
        let v: u32 = self.value.load(RELAXED);
        self.value.store(v | ROOT_BIT, WRITE_ORD);
    }
}

// ============================================================================
//  LockGuard
// ============================================================================

/// Proof that the node lock is held.
///
/// Operations that require the lock take `&mut LockGuard`. Dropping the
/// guard unlocks: if a dirty bit was set, the matching counter is
/// incremented and the bit cleared in the same release store.
///
/// `PhantomData<*mut ()>` keeps guards `!Send + !Sync`; a node lock
/// never migrates between threads.
#[derive(Debug)]
#[must_use = "dropping the guard immediately releases the lock"]
pub struct LockGuard<'a> {
    version: &'a NodeVersion,
    locked_value: u32,
    _marker: PhantomData<*mut ()>,
}

impl LockGuard<'_> {
    /// The version value as of the last mutation through this guard.
    #[inline]
    #[must_use]
    pub const fn locked_value(&self) -> u32 {
        self.locked_value
    }

    /// Announce a logical insert.
    ///
    /// Must precede any slot or permutation write; the fence keeps those
    /// writes from becoming visible before the dirty bit.
    #[inline]
    pub fn mark_insert(&mut self) {
        self.set_bits(INSERTING_BIT);
    }

    /// Announce a split.
    ///
    /// Must precede any entry move or sibling-link write.
    #[inline]
    pub fn mark_split(&mut self) {
        self.set_bits(SPLITTING_BIT);
    }

    /// Clear the root flag, as part of handing root duty to a new
    /// parent during promotion.
    #[inline]
    pub fn mark_nonroot(&mut self) {
        let v: u32 = self.locked_value & !ROOT_BIT;
        self.version.value.store(v, WRITE_ORD);
        self.locked_value = v;
    }

    #[inline]
    fn set_bits(&mut self, bits: u32) {
        let v: u32 = self.locked_value | bits;
        self.version.value.store(v, WRITE_ORD);

        // Publish the dirty bit before any following node mutation.
        fence(Ordering::SeqCst);

        self.locked_value = v;
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let v: u32 = self.locked_value;

        let new_value: u32 = if v & SPLITTING_BIT != 0 {
            (v + VSPLIT_LOWBIT) & SPLIT_UNLOCK_MASK
        } else if v & INSERTING_BIT != 0 {
            (v + VINSERT_LOWBIT) & INSERT_UNLOCK_MASK
        } else {
            v & !LOCK_BIT
        };

        self.version.value.store(new_value, WRITE_ORD);
    }
}

// ============================================================================
//  Tests
// ============================================================================
