//! Filepath: src/border.rs
//!
//! Border nodes: the leaf-like layer of the trie.
//!
//! A border node stores up to [`FANOUT`] entries, each keyed by one
//! 8-byte slice plus the slice's byte length. An entry's payload is a
//! heap-allocated [`BorderValue`]: either a user value with the key's
//! remaining suffix, or a link to the root of a deeper layer that
//! resolves keys sharing this slice.
//!
//! Entries are ordered by `(slice, slice_len)`, so a short key and a
//! longer key that agree on their first bytes occupy distinct entries
//! instead of colliding. Links always sit at `slice_len == 8`: only
//! keys extending past the full slice ever need a deeper layer.
//!
//! All per-slot fields are atomics. Writers mutate them under the node
//! lock; readers go lock-free and rely on the version protocol in
//! [`crate::nodeversion`] to detect interference. Border nodes of one
//! layer form a doubly linked list in key order for reader traversal
//! across splits.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64};
use std::sync::Arc;

use crate::key::Key;
use crate::nodeversion::{LockGuard, NodeVersion};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::permuter::Permuter;
use crate::FANOUT;

/// Entry slice length of every link entry: a deeper layer only exists
/// for keys that consume the full 8-byte slice and continue.
pub(crate) const LINK_SLICE_LEN: u8 = 8;

// ============================================================================
//  BorderValue
// ============================================================================

/// Payload of a border entry.
///
/// A real tagged enum rather than a magic `keylen` sentinel: readers
/// load the entry's pointer atomically and branch on the discriminant.
pub enum BorderValue<V> {
    /// A stored key-value pair. `suffix` holds the key bytes beyond
    /// this node's slice (empty when the key ends within the slice).
    Value {
        /// Key bytes after the entry's slice.
        suffix: Box<[u8]>,
        /// The caller's value; the tree never inspects it.
        value: Arc<V>,
    },

    /// Root of the deeper layer resolving keys that share this slice.
    Layer(*mut u8),
}

// SAFETY: `Value` is Send/Sync when V is; `Layer` points at tree-owned
// nodes whose access is mediated by the version protocol.
unsafe impl<V: Send + Sync> Send for BorderValue<V> {}
unsafe impl<V: Send + Sync> Sync for BorderValue<V> {}

impl<V> BorderValue<V> {
    /// Allocate a value entry, returning the raw pointer stored in `lv`.
    #[must_use]
    pub(crate) fn new_value(suffix: &[u8], value: Arc<V>) -> *mut Self {
        Box::into_raw(Box::new(Self::Value {
            suffix: Box::from(suffix),
            value,
        }))
    }

    /// Allocate a link entry, returning the raw pointer stored in `lv`.
    #[must_use]
    pub(crate) fn new_layer(root: *mut u8) -> *mut Self {
        Box::into_raw(Box::new(Self::Layer(root)))
    }
}

impl<V> StdFmt::Debug for BorderValue<V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::Value { suffix, .. } => f
                .debug_struct("Value")
                .field("suffix_len", &suffix.len())
                .finish_non_exhaustive(),
            Self::Layer(root) => f.debug_tuple("Layer").field(root).finish(),
        }
    }
}

// ============================================================================
//  Search and insert results
// ============================================================================

/// Outcome of a lock-free entry lookup.
pub(crate) enum BorderLookup<V> {
    /// Exact match: slice, slice length and suffix all agree.
    Found(Arc<V>),
    /// Matching entry is a link; continue in the deeper layer.
    Layer(*mut u8),
    /// No entry matches at this layer.
    NotFound,
}

/// Outcome of a locked insert attempt (the node-layer control signals
/// of the tree algorithm; never surfaced to callers of the tree API).
pub(crate) enum BorderInsert {
    /// Entry written; permutation published.
    Inserted,
    /// Identical key already stored; nothing changed.
    AlreadyPresent,
    /// Matching entry is a link; the insert belongs to the deeper layer.
    Layer(*mut u8),
    /// Matching entry holds a different key with the same full slice;
    /// both must migrate into a new deeper layer. Carries the physical
    /// slot of the conflicting entry.
    Conflict { slot: usize },
    /// Node is at capacity; the caller must split.
    Full,
}

// ============================================================================
//  BorderNode
// ============================================================================

/// A border node.
///
/// `version` must stay the first field: node pointers are type-erased
/// to `*mut u8` in parent slots and layer links, and the version word
/// is read through that erased pointer to discriminate node kinds.
#[repr(C, align(64))]
pub struct BorderNode<V> {
    /// Version word; first field by layout contract.
    version: NodeVersion,

    /// Packed entry ordering, readable in one atomic load.
    permutation: AtomicU64,

    /// Entry slices, packed big-endian.
    slices: [AtomicU64; FANOUT],

    /// Byte length of each entry's slice (0..=8).
    slice_lens: [AtomicU8; FANOUT],

    /// Entry payloads; null only for slots never yet used.
    lv: [AtomicPtr<BorderValue<V>>; FANOUT],

    /// Parent back-reference: an interior node, or the border node
    /// holding this layer's link when this node is a layer root.
    parent: AtomicPtr<u8>,

    /// Left sibling in key order within the layer.
    prev: AtomicPtr<BorderNode<V>>,

    /// Right sibling in key order within the layer.
    next: AtomicPtr<BorderNode<V>>,
}

impl<V> StdFmt::Debug for BorderNode<V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("BorderNode")
            .field("len", &self.permutation().size())
            .field("is_root", &self.version.is_root())
            .field("has_next", &!self.next().is_null())
            .finish_non_exhaustive()
    }
}

impl<V> BorderNode<V> {
    /// Allocate an empty border node.
    #[must_use]
    pub(crate) fn new() -> Box<Self> {
        Box::new(Self {
            version: NodeVersion::new(true),
            permutation: AtomicU64::new(Permuter::empty().value()),
            slices: std::array::from_fn(|_| AtomicU64::new(0)),
            slice_lens: std::array::from_fn(|_| AtomicU8::new(0)),
            lv: std::array::from_fn(|_| AtomicPtr::new(StdPtr::null_mut())),
            parent: AtomicPtr::new(StdPtr::null_mut()),
            prev: AtomicPtr::new(StdPtr::null_mut()),
            next: AtomicPtr::new(StdPtr::null_mut()),
        })
    }

    /// Allocate an empty border node that roots a layer.
    #[must_use]
    pub(crate) fn new_root() -> Box<Self> {
        let node: Box<Self> = Self::new();
        node.version.mark_root();
        node
    }

    /// The node's version word.
    #[inline]
    #[must_use]
    pub(crate) const fn version(&self) -> &NodeVersion {
        &self.version
    }

    /// Decode the current permutation.
    #[inline]
    #[must_use]
    pub(crate) fn permutation(&self) -> Permuter {
        Permuter::from_value(self.permutation.load(READ_ORD))
    }

    /// Publish a new permutation. Requires the node lock.
    #[inline]
    pub(crate) fn set_permutation(&self, perm: Permuter) {
        self.permutation.store(perm.value(), WRITE_ORD);
    }

    /// Slice stored at physical `slot`.
    #[inline]
    #[must_use]
    pub(crate) fn slice(&self, slot: usize) -> u64 {
        self.slices[slot].load(READ_ORD)
    }

    /// Slice length stored at physical `slot`.
    #[inline]
    #[must_use]
    pub(crate) fn slice_len(&self, slot: usize) -> u8 {
        self.slice_lens[slot].load(READ_ORD)
    }

    /// Entry payload pointer at physical `slot`.
    #[inline]
    #[must_use]
    pub(crate) fn lv(&self, slot: usize) -> *mut BorderValue<V> {
        self.lv[slot].load(READ_ORD)
    }

    /// Write one entry into a slot. The slot becomes visible only once
    /// a permutation naming it is published.
    pub(crate) fn assign(
        &self,
        slot: usize,
        slice: u64,
        slice_len: u8,
        lv: *mut BorderValue<V>,
    ) {
        debug_assert!(slot < FANOUT, "assign: slot out of bounds");

        self.slices[slot].store(slice, RELAXED);
        self.slice_lens[slot].store(slice_len, RELAXED);
        self.lv[slot].store(lv, WRITE_ORD);
    }

    /// Parent back-reference (type-erased node pointer).
    #[inline]
    #[must_use]
    pub(crate) fn parent(&self) -> *mut u8 {
        self.parent.load(READ_ORD)
    }

    /// Update the parent back-reference.
    #[inline]
    pub(crate) fn set_parent(&self, parent: *mut u8) {
        self.parent.store(parent, WRITE_ORD);
    }

    /// Right sibling, or null at the end of the layer's chain.
    #[inline]
    #[must_use]
    pub(crate) fn next(&self) -> *mut BorderNode<V> {
        self.next.load(READ_ORD)
    }

    /// Left sibling, or null at the start of the layer's chain.
    #[inline]
    #[must_use]
    pub(crate) fn prev(&self) -> *mut BorderNode<V> {
        self.prev.load(READ_ORD)
    }

    /// Check whether every slot is in use.
    #[inline]
    #[must_use]
    pub(crate) fn is_full(&self) -> bool {
        self.permutation().is_full()
    }

    // ========================================================================
    //  Search
    // ========================================================================

    /// Binary-search the permuted entries for `(slice, slice_len)`.
    ///
    /// Returns `Ok(physical_slot)` on an exact match, otherwise
    /// `Err(logical_position)` where such an entry would be inserted.
    fn locate(&self, perm: Permuter, slice: u64, slice_len: u8) -> Result<usize, usize> {
        let probe: (u64, u8) = (slice, slice_len);
        let mut lo: usize = 0;
        let mut hi: usize = perm.size();

        while lo < hi {
            let mid: usize = lo + (hi - lo) / 2;
            let slot: usize = perm.get(mid);
            let here: (u64, u8) = (self.slice(slot), self.slice_len(slot));

            match here.cmp(&probe) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(slot),
            }
        }

        Err(lo)
    }

    /// Lock-free entry lookup for the current slice of `key`.
    ///
    /// The caller must hold a reclamation guard and must validate the
    /// node's version afterwards; a concurrent writer can make this
    /// read arbitrary live entries, but never freed memory.
    #[must_use]
    pub(crate) fn lookup(&self, key: &Key<'_>) -> BorderLookup<V> {
        let perm: Permuter = self.permutation();

        let Ok(slot) = self.locate(perm, key.slice(), key.slice_len()) else {
            return BorderLookup::NotFound;
        };

        let lv: *mut BorderValue<V> = self.lv(slot);
        if lv.is_null() {
            // Only reachable through a racing writer; the caller's
            // version check sends it back around.
            return BorderLookup::NotFound;
        }

        // SAFETY: lv pointers are owned by the tree and retired through
        // the collector, so the allocation outlives our guard.
        match unsafe { &*lv } {
            BorderValue::Layer(root) => BorderLookup::Layer(*root),
            BorderValue::Value { suffix, value } => {
                if suffix.as_ref() == key.suffix() {
                    BorderLookup::Found(Arc::clone(value))
                } else {
                    BorderLookup::NotFound
                }
            }
        }
    }

    /// Decide whether a key with `slice` can live in this node or one
    /// of its right siblings.
    ///
    /// True when `slice` is at or above this node's smallest entry. No
    /// upper bound is checked: a slice above every entry still belongs
    /// here unless a further sibling's range claims it, which the
    /// caller's walk discovers on the next step.
    #[must_use]
    pub(crate) fn include_key(&self, slice: u64) -> bool {
        let perm: Permuter = self.permutation();
        perm.size() > 0 && slice >= self.slice(perm.first())
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    /// Insert the current slice of `key` into this node.
    ///
    /// Requires the node lock. On `Inserted`, claims physical slot
    /// `count`, publishes the slot before the permutation, and leaves
    /// the guard's `INSERT` bit set for the unlock increment.
    pub(crate) fn insert(
        &self,
        lock: &mut LockGuard<'_>,
        key: &Key<'_>,
        value: &Arc<V>,
    ) -> BorderInsert {
        let perm: Permuter = self.permutation();

        match self.locate(perm, key.slice(), key.slice_len()) {
            Ok(slot) => {
                // SAFETY: we hold the lock, so the entry is stable; the
                // allocation is live until retired by a later writer.
                match unsafe { &*self.lv(slot) } {
                    BorderValue::Layer(root) => BorderInsert::Layer(*root),
                    BorderValue::Value { suffix, .. } => {
                        if suffix.as_ref() == key.suffix() {
                            BorderInsert::AlreadyPresent
                        } else {
                            debug_assert_eq!(
                                key.slice_len(),
                                LINK_SLICE_LEN,
                                "conflicting entries must both extend past the slice"
                            );
                            BorderInsert::Conflict { slot }
                        }
                    }
                }
            }

            Err(pos) => {
                if perm.is_full() {
                    return BorderInsert::Full;
                }

                let slot: usize = perm.size();
                lock.mark_insert();

                self.assign(
                    slot,
                    key.slice(),
                    key.slice_len(),
                    BorderValue::new_value(key.suffix(), Arc::clone(value)),
                );

                let mut next_perm: Permuter = perm;
                next_perm.insert(pos, slot);
                self.set_permutation(next_perm);

                BorderInsert::Inserted
            }
        }
    }

    /// Swap the payload of a live entry, returning the old payload for
    /// retirement. Requires the node lock.
    ///
    /// Used to replace a conflicting value with a link to the deeper
    /// layer that now holds it.
    #[must_use]
    pub(crate) fn replace_lv(
        &self,
        lock: &mut LockGuard<'_>,
        slot: usize,
        new: *mut BorderValue<V>,
    ) -> *mut BorderValue<V> {
        lock.mark_insert();

        let old: *mut BorderValue<V> = self.lv[slot].load(RELAXED);
        self.lv[slot].store(new, WRITE_ORD);
        old
    }

    // ========================================================================
    //  Split
    // ========================================================================

    /// Split a full node, returning the new right sibling (locked, with
    /// `SPLIT` set) and the fence slice routing between the halves.
    ///
    /// Entries are repacked in key order: the lower portion stays here
    /// in slots `0..split`, the upper portion moves to the sibling. The
    /// boundary starts at the lower-7/upper-8 point and shifts to the
    /// nearest position where the slice value changes, so entries
    /// sharing a slice are never separated (interior nodes route on the
    /// slice alone).
    ///
    /// The sibling is linked into the chain with its fields published
    /// by the release store to our `next` pointer.
    pub(crate) fn split(&self, lock: &mut LockGuard<'_>) -> (*mut BorderNode<V>, u64) {
        let perm: Permuter = self.permutation();
        debug_assert!(perm.is_full(), "split: node not full");

        lock.mark_split();

        // Snapshot in key order.
        let mut slices: [u64; FANOUT] = [0; FANOUT];
        let mut lens: [u8; FANOUT] = [0; FANOUT];
        let mut values: [*mut BorderValue<V>; FANOUT] = [StdPtr::null_mut(); FANOUT];

        for i in 0..FANOUT {
            let slot: usize = perm.get(i);
            slices[i] = self.slice(slot);
            lens[i] = self.slice_len(slot);
            values[i] = self.lv(slot);
        }

        let split: usize = Self::split_point(&slices);
        let fence: u64 = slices[split];

        // Build the right sibling privately. It inherits our locked,
        // splitting version so both halves unlock through the same
        // counter protocol.
        let right: Box<BorderNode<V>> = Box::new(BorderNode {
            version: NodeVersion::from_value(lock.locked_value()),
            permutation: AtomicU64::new(Permuter::make_sorted(FANOUT - split).value()),
            slices: std::array::from_fn(|_| AtomicU64::new(0)),
            slice_lens: std::array::from_fn(|_| AtomicU8::new(0)),
            lv: std::array::from_fn(|_| AtomicPtr::new(StdPtr::null_mut())),
            parent: AtomicPtr::new(self.parent()),
            prev: AtomicPtr::new(StdPtr::null_mut()),
            next: AtomicPtr::new(StdPtr::null_mut()),
        });

        for (i, sorted) in (split..FANOUT).enumerate() {
            right.assign(i, slices[sorted], lens[sorted], values[sorted]);
        }

        // Repack the retained lower entries; slots `split..` go stale
        // and are reused by future inserts.
        for i in 0..split {
            self.assign(i, slices[i], lens[i], values[i]);
        }
        self.set_permutation(Permuter::make_sorted(split));

        // Link the sibling: every field above is completed before the
        // release store to `next` makes it reachable.
        let right_ptr: *mut BorderNode<V> = Box::into_raw(right);
        let old_next: *mut BorderNode<V> = self.next.load(RELAXED);

        if !old_next.is_null() {
            // SAFETY: sibling nodes are never freed while the tree is
            // live; `prev` is maintenance-only and tolerates the race.
            unsafe {
                (*old_next).prev.store(right_ptr, RELAXED);
            }
        }

        // SAFETY: right_ptr was just allocated and is not yet shared.
        unsafe {
            (*right_ptr)
                .prev
                .store(StdPtr::from_ref(self).cast_mut(), RELAXED);
            (*right_ptr).next.store(old_next, RELAXED);
        }

        self.next.store(right_ptr, WRITE_ORD);

        (right_ptr, fence)
    }

    /// Pick the split boundary: nearest index to the lower-7/upper-8
    /// point where the slice value changes.
    fn split_point(slices: &[u64; FANOUT]) -> usize {
        const BASE: usize = FANOUT / 2;

        for delta in 0..FANOUT {
            let up: usize = BASE + delta;
            if up < FANOUT && slices[up] != slices[up - 1] {
                return up;
            }

            if delta > 0 && delta < BASE {
                let down: usize = BASE - delta;
                if slices[down] != slices[down - 1] {
                    return down;
                }
            }
        }

        // At most nine entries can share a slice (one per slice length
        // plus the link), so a boundary always exists.
        unreachable!("full border node with a single slice value")
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_key(node: &BorderNode<u64>, bytes: &[u8], v: u64) -> bool {
        let mut lock: LockGuard<'_> = node.version().lock();
        let key: Key<'_> = Key::new(bytes);
        let value: Arc<u64> = Arc::new(v);
        matches!(
            node.insert(&mut lock, &key, &value),
            BorderInsert::Inserted
        )
    }

    fn lookup_key(node: &BorderNode<u64>, bytes: &[u8]) -> Option<u64> {
        match node.lookup(&Key::new(bytes)) {
            BorderLookup::Found(v) => Some(*v),
            _ => None,
        }
    }

    fn free_entries(node: &BorderNode<u64>) {
        let perm: Permuter = node.permutation();
        for i in 0..perm.size() {
            let lv: *mut BorderValue<u64> = node.lv(perm.get(i));
            if !lv.is_null() {
                // SAFETY: test-local node, no concurrent access.
                drop(unsafe { Box::from_raw(lv) });
            }
        }
    }

    #[test]
    fn insert_then_lookup() {
        let node: Box<BorderNode<u64>> = BorderNode::new();

        assert!(insert_key(&node, b"alpha", 1));
        assert!(insert_key(&node, b"beta", 2));

        assert_eq!(lookup_key(&node, b"alpha"), Some(1));
        assert_eq!(lookup_key(&node, b"beta"), Some(2));
        assert_eq!(lookup_key(&node, b"gamma"), None);

        free_entries(&node);
    }

    #[test]
    fn duplicate_insert_reports_present() {
        let node: Box<BorderNode<u64>> = BorderNode::new();
        assert!(insert_key(&node, b"alpha", 1));

        let mut lock: LockGuard<'_> = node.version().lock();
        let key: Key<'_> = Key::new(b"alpha");
        let value: Arc<u64> = Arc::new(9);
        assert!(matches!(
            node.insert(&mut lock, &key, &value),
            BorderInsert::AlreadyPresent
        ));
        drop(lock);

        assert_eq!(lookup_key(&node, b"alpha"), Some(1));
        free_entries(&node);
    }

    #[test]
    fn same_slice_different_length_coexist() {
        let node: Box<BorderNode<u64>> = BorderNode::new();

        // Both pack to the same u64 slice; lengths 2 and 3 differ.
        assert!(insert_key(&node, b"ab", 1));
        assert!(insert_key(&node, b"ab\0", 2));

        assert_eq!(lookup_key(&node, b"ab"), Some(1));
        assert_eq!(lookup_key(&node, b"ab\0"), Some(2));
        free_entries(&node);
    }

    #[test]
    fn shared_full_slice_reports_conflict() {
        let node: Box<BorderNode<u64>> = BorderNode::new();
        assert!(insert_key(&node, b"prefix00-one", 1));

        let mut lock: LockGuard<'_> = node.version().lock();
        let key: Key<'_> = Key::new(b"prefix00-two");
        let value: Arc<u64> = Arc::new(2);
        assert!(matches!(
            node.insert(&mut lock, &key, &value),
            BorderInsert::Conflict { .. }
        ));
        drop(lock);
        free_entries(&node);
    }

    #[test]
    fn link_entry_routes_to_layer() {
        let node: Box<BorderNode<u64>> = BorderNode::new();
        assert!(insert_key(&node, b"prefix00-one", 1));

        let layer: Box<BorderNode<u64>> = BorderNode::new_root();
        let layer_ptr: *mut u8 = Box::into_raw(layer).cast();

        let slot: usize = node.permutation().get(0);
        let mut lock: LockGuard<'_> = node.version().lock();
        let old: *mut BorderValue<u64> =
            node.replace_lv(&mut lock, slot, BorderValue::new_layer(layer_ptr));
        drop(lock);
        // SAFETY: single-threaded test; nothing else sees `old`.
        drop(unsafe { Box::from_raw(old) });

        match node.lookup(&Key::new(b"prefix00-xyz")) {
            BorderLookup::Layer(root) => assert_eq!(root, layer_ptr),
            _ => panic!("expected layer"),
        }

        let mut lock: LockGuard<'_> = node.version().lock();
        let key: Key<'_> = Key::new(b"prefix00-two");
        let value: Arc<u64> = Arc::new(2);
        assert!(matches!(
            node.insert(&mut lock, &key, &value),
            BorderInsert::Layer(root) if root == layer_ptr
        ));
        drop(lock);

        free_entries(&node);
        // SAFETY: reclaim the empty test layer.
        drop(unsafe { Box::from_raw(layer_ptr.cast::<BorderNode<u64>>()) });
    }

    #[test]
    fn full_node_reports_full() {
        let node: Box<BorderNode<u64>> = BorderNode::new();
        for i in 0..FANOUT {
            assert!(insert_key(&node, format!("key{i:02}").as_bytes(), i as u64));
        }
        assert!(node.is_full());

        let mut lock: LockGuard<'_> = node.version().lock();
        let key: Key<'_> = Key::new(b"overflow");
        let value: Arc<u64> = Arc::new(0);
        assert!(matches!(
            node.insert(&mut lock, &key, &value),
            BorderInsert::Full
        ));
        drop(lock);
        free_entries(&node);
    }

    #[test]
    fn split_partitions_entries_and_links_siblings() {
        let node: Box<BorderNode<u64>> = BorderNode::new();
        for i in 0..FANOUT {
            assert!(insert_key(&node, format!("key{i:02}").as_bytes(), i as u64));
        }

        let mut lock: LockGuard<'_> = node.version().lock();
        let (right_ptr, fence) = node.split(&mut lock);
        // SAFETY: split returns a valid, locked sibling.
        let right: &BorderNode<u64> = unsafe { &*right_ptr };
        let right_lock: LockGuard<'_> = right.version().adopt_locked();
        drop(right_lock);
        drop(lock);

        assert_eq!(node.permutation().size(), 7);
        assert_eq!(right.permutation().size(), 8);
        assert_eq!(fence, Key::new(b"key07").slice());
        assert_eq!(node.next(), right_ptr);
        assert_eq!(right.prev(), StdPtr::from_ref(node.as_ref()).cast_mut());

        // Lower half stays, upper half moved.
        assert_eq!(lookup_key(&node, b"key00"), Some(0));
        assert_eq!(lookup_key(&node, b"key06"), Some(6));
        assert_eq!(lookup_key(&node, b"key07"), None);
        assert_eq!(lookup_key(right, b"key07"), Some(7));
        assert_eq!(lookup_key(right, b"key14"), Some(14));

        assert!(right.include_key(Key::new(b"key09").slice()));
        assert!(!node.version().is_locked());
        assert!(!right.version().is_locked());

        free_entries(&node);
        free_entries(right);
        // SAFETY: test-local sibling.
        drop(unsafe { Box::from_raw(right_ptr) });
    }

    #[test]
    fn split_keeps_equal_slices_together() {
        let node: Box<BorderNode<u64>> = BorderNode::new();

        // "mmmmmmm" and "mmmmmmm\0" pack to the same slice at lengths
        // 7 and 8, and the pair lands exactly on the 7/8 midpoint.
        for i in 0..6 {
            assert!(insert_key(&node, format!("a{i}").as_bytes(), i));
        }
        assert!(insert_key(&node, b"mmmmmmm", 100));
        assert!(insert_key(&node, b"mmmmmmm\0", 101));
        for i in 0..7 {
            assert!(insert_key(&node, format!("z{i}").as_bytes(), 200 + i));
        }
        assert!(node.is_full());

        let mut lock: LockGuard<'_> = node.version().lock();
        let (right_ptr, fence) = node.split(&mut lock);
        // SAFETY: split returns a valid, locked sibling.
        let right: &BorderNode<u64> = unsafe { &*right_ptr };
        drop(right.version().adopt_locked());
        drop(lock);

        // The fence must sit on a slice boundary.
        let left_perm: Permuter = node.permutation();
        let last_left: u64 = node.slice(left_perm.last());
        assert!(last_left < fence, "fence inside a slice run");
        assert_eq!(right.slice(right.permutation().first()), fence);

        free_entries(&node);
        free_entries(right);
        // SAFETY: test-local sibling.
        drop(unsafe { Box::from_raw(right_ptr) });
    }

    #[test]
    fn include_key_uses_lower_bound() {
        let node: Box<BorderNode<u64>> = BorderNode::new();
        assert!(insert_key(&node, b"mm", 1));
        assert!(insert_key(&node, b"pp", 2));

        assert!(!node.include_key(Key::new(b"aa").slice()));
        assert!(node.include_key(Key::new(b"mm").slice()));
        assert!(node.include_key(Key::new(b"zz").slice()));
        free_entries(&node);
    }
}
