//! Filepath: src/tree.rs
//!
//! [`MassMap`]: the concurrent trie-of-B+trees index.
//!
//! The tree owns a single atomic root pointer and composes the node
//! layer into the two public operations:
//!
//! - [`MassMap::get`] descends with stable versions only, taking no
//!   locks, and walks border sibling links forward when a split races
//!   the read.
//! - [`MassMap::put`] descends the same way, locks exactly one border
//!   node for the write, and on overflow splits it and promotes the
//!   fence upward hand-over-hand, holding at most three locks.
//!
//! Keys sharing a full 8-byte slice resolve in deeper layers reached
//! through link entries; each layer is its own tree rooted at a node
//! with the root flag set.
//!
//! Displaced entry payloads are retired through a [`seize::Collector`]
//! so lock-free readers never touch freed memory. Nodes themselves are
//! only reclaimed when the map is dropped.

use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use seize::{Collector, Guard, LocalGuard};

use crate::border::{BorderInsert, BorderLookup, BorderNode, BorderValue, LINK_SLICE_LEN};
use crate::interior::InteriorNode;
use crate::key::Key;
use crate::nodeversion::{LockGuard, NodeVersion};
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::permuter::Permuter;
use crate::trace::{debug_log, trace_log};

// ============================================================================
//  PutResult
// ============================================================================

/// Outcome of [`MassMap::put`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutResult {
    /// The key was not present; the value is now stored.
    Inserted,

    /// The key was already present; the stored value is untouched.
    AlreadyPresent,
}

impl PutResult {
    /// Check whether the put stored its value.
    #[inline]
    #[must_use]
    pub const fn is_inserted(self) -> bool {
        matches!(self, Self::Inserted)
    }
}

// ============================================================================
//  MassMap
// ============================================================================

/// A concurrent, ordered, in-memory key-value index.
///
/// Keys are byte strings up to [`crate::key::MAX_KEY_LENGTH`] bytes;
/// values are shared out as `Arc<V>` and never inspected by the tree.
/// Any number of threads may call [`MassMap::get`] and [`MassMap::put`]
/// concurrently through a shared reference.
///
/// # Example
///
/// ```rust
/// use massmap::{MassMap, PutResult};
///
/// let map: MassMap<u32> = MassMap::new();
/// assert_eq!(map.put(b"k", 7), PutResult::Inserted);
/// assert_eq!(map.put(b"k", 8), PutResult::AlreadyPresent);
/// assert_eq!(map.get(b"k").as_deref(), Some(&7));
/// assert_eq!(map.get(b"missing"), None);
/// ```
pub struct MassMap<V> {
    /// Top-level layer root; replaced only by root growth.
    root: AtomicPtr<u8>,

    /// Deferred-reclamation collector for displaced entry payloads.
    collector: Collector,

    /// Number of stored entries.
    count: AtomicUsize,

    _marker: PhantomData<V>,
}

// SAFETY: all shared node state is accessed through atomics under the
// version/lock protocol; values cross threads as Arc<V>.
unsafe impl<V: Send + Sync> Send for MassMap<V> {}
unsafe impl<V: Send + Sync> Sync for MassMap<V> {}

impl<V> StdFmt::Debug for MassMap<V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("MassMap")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<V> Default for MassMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MassMap<V> {
    /// Create an empty map. The initial root is a single border node.
    #[must_use]
    pub fn new() -> Self {
        let root: Box<BorderNode<V>> = BorderNode::new_root();

        Self {
            root: AtomicPtr::new(Box::into_raw(root).cast()),
            collector: Collector::new(),
            count: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Create an empty map with an advisory thread-count hint.
    ///
    /// The hint is currently ignored: the collector sizes its own
    /// per-thread state on demand.
    #[must_use]
    pub fn with_thread_hint(threads: usize) -> Self {
        let _ = threads;
        Self::new()
    }

    /// Enter a protected region for lock-free reads.
    ///
    /// Pointers loaded while the guard lives cannot be reclaimed under
    /// the reader. [`MassMap::get`] takes one internally; batch readers
    /// can amortize with [`MassMap::get_with_guard`].
    #[must_use]
    #[inline]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Number of stored entries.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(AtomicOrdering::Relaxed)
    }

    /// Check whether the map holds no entries.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    //  Node kind dispatch
    // ========================================================================

    /// Read the version word behind a type-erased node pointer.
    ///
    /// # Safety
    /// `ptr` must point to a live `BorderNode<V>` or `InteriorNode<V>`;
    /// both start with a `NodeVersion` by layout contract.
    #[inline]
    unsafe fn node_version<'g>(ptr: *const u8) -> &'g NodeVersion {
        unsafe { &*ptr.cast::<NodeVersion>() }
    }

    /// Read the parent back-reference of either node kind.
    ///
    /// # Safety
    /// `ptr` must point to a live node of this map.
    unsafe fn node_parent(ptr: *const u8) -> *mut u8 {
        if unsafe { Self::node_version(ptr) }.is_border() {
            unsafe { &*ptr.cast::<BorderNode<V>>() }.parent()
        } else {
            unsafe { &*ptr.cast::<InteriorNode<V>>() }.parent()
        }
    }

    /// Update the parent back-reference of either node kind.
    ///
    /// # Safety
    /// `ptr` must point to a live node of this map, and the caller must
    /// be the thread structurally responsible for it (holding its lock
    /// or its old parent's lock).
    unsafe fn set_node_parent(ptr: *mut u8, parent: *mut u8) {
        if unsafe { Self::node_version(ptr) }.is_border() {
            unsafe { &*ptr.cast::<BorderNode<V>>() }.set_parent(parent);
        } else {
            unsafe { &*ptr.cast::<InteriorNode<V>>() }.set_parent(parent);
        }
    }

    // ========================================================================
    //  Descent
    // ========================================================================

    /// Descend one layer to the border node covering `key`, returning
    /// it with a stable version.
    ///
    /// Follows the three-way retry protocol: descend on a quiet parent,
    /// restart from the layer root when the parent split, re-descend in
    /// place when it only absorbed inserts. A stale layer root (its
    /// root flag cleared by growth) is escaped through its parent.
    fn find_border<'g>(
        &self,
        layer_root: *mut u8,
        key: &Key<'_>,
        _guard: &'g LocalGuard<'_>,
    ) -> (&'g BorderNode<V>, u32) {
        let mut root: *mut u8 = layer_root;

        'retry: loop {
            let mut n: *mut u8 = root;
            // SAFETY: layer roots and their descendants stay live for
            // the life of the map.
            let mut v: u32 = unsafe { Self::node_version(n) }.stable();

            if !NodeVersion::raw_is_root(v) {
                trace_log!("descent found stale root, walking up");
                let parent: *mut u8 = unsafe { Self::node_parent(n) };
                if !parent.is_null() {
                    root = parent;
                }
                continue 'retry;
            }

            loop {
                if NodeVersion::raw_is_border(v) {
                    // SAFETY: the border discriminant never changes.
                    return (unsafe { &*n.cast::<BorderNode<V>>() }, v);
                }

                // SAFETY: not a border, so an interior node.
                let interior: &InteriorNode<V> = unsafe { &*n.cast::<InteriorNode<V>>() };
                let child: *mut u8 = interior.locate_child(key.slice());
                if child.is_null() {
                    continue 'retry;
                }
                // SAFETY: child slots published by interior nodes point
                // at live nodes.
                let child_v: u32 = unsafe { Self::node_version(child) }.stable();

                if !interior.version().has_changed(v) {
                    // Nothing happened while we read the child: descend.
                    n = child;
                    v = child_v;
                    continue;
                }

                let v2: u32 = interior.version().stable();
                if NodeVersion::split_differs(v, v2) {
                    // The node split under us; its range may have moved.
                    trace_log!("descent raced a split, retrying layer");
                    continue 'retry;
                }

                // Only inserts: retry this node with the fresh version.
                v = v2;
            }
        }
    }

    // ========================================================================
    //  get
    // ========================================================================

    /// Look up `key`, returning a shared handle to its value.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Arc<V>> {
        let guard: LocalGuard<'_> = self.guard();
        self.get_with_guard(key, &guard)
    }

    /// Look up `key` under a caller-supplied guard.
    #[must_use]
    pub fn get_with_guard(&self, key: &[u8], guard: &LocalGuard<'_>) -> Option<Arc<V>> {
        let mut k: Key<'_> = Key::new(key);
        let mut layer_root: *mut u8 = self.root.load(READ_ORD);

        // One iteration per layer.
        loop {
            let (mut border, mut v) = self.find_border(layer_root, &k, guard);

            // One iteration per search attempt within the layer.
            let lookup: BorderLookup<V> = loop {
                debug_assert!(
                    !NodeVersion::raw_is_deleted(v),
                    "deletion is out of scope; no node is ever deleted"
                );

                let result: BorderLookup<V> = border.lookup(&k);

                if !border.version().has_changed(v) {
                    break result;
                }

                // The border changed under the search. Splits only move
                // entries right, so re-stabilize and chase the sibling
                // chain while it still covers the probe slice.
                v = border.version().stable();
                loop {
                    let next: *mut BorderNode<V> = border.next();
                    if next.is_null() {
                        break;
                    }
                    // SAFETY: sibling nodes stay live under the guard.
                    let next: &BorderNode<V> = unsafe { &*next };
                    if !next.include_key(k.slice()) {
                        break;
                    }
                    trace_log!("get following border sibling link");
                    border = next;
                    v = border.version().stable();
                }
            };

            match lookup {
                BorderLookup::Found(value) => return Some(value),
                BorderLookup::NotFound => return None,
                BorderLookup::Layer(root) => {
                    layer_root = root;
                    k.shift();
                }
            }
        }
    }

    // ========================================================================
    //  put
    // ========================================================================

    /// Insert `key` with `value`.
    ///
    /// Returns [`PutResult::AlreadyPresent`] without touching the
    /// stored value when the key exists.
    pub fn put(&self, key: &[u8], value: V) -> PutResult {
        let guard: LocalGuard<'_> = self.guard();
        let value: Arc<V> = Arc::new(value);
        let mut k: Key<'_> = Key::new(key);
        let mut layer_root: *mut u8 = self.root.load(READ_ORD);

        // One iteration per layer.
        loop {
            let (start, v) = self.find_border(layer_root, &k, &guard);
            let mut border: &BorderNode<V> = start;
            let mut lock: LockGuard<'_> = border.version().lock();

            // The border may have split between the version capture and
            // the lock; walk right, coupling locks, while a sibling
            // claims the key.
            if border.version().has_changed(v) {
                loop {
                    let next: *mut BorderNode<V> = border.next();
                    if next.is_null() {
                        break;
                    }
                    // SAFETY: sibling nodes stay live under the guard.
                    let next: &BorderNode<V> = unsafe { &*next };
                    let next_lock: LockGuard<'_> = next.version().lock();
                    if next.include_key(k.slice()) {
                        trace_log!("put moving to border sibling");
                        // Dropping the old guard here unlocks the node
                        // we are leaving; the sibling is already held.
                        lock = next_lock;
                        border = next;
                    } else {
                        drop(next_lock);
                        break;
                    }
                }
            }

            match border.insert(&mut lock, &k, &value) {
                BorderInsert::Inserted => {
                    drop(lock);
                    self.count.fetch_add(1, AtomicOrdering::Relaxed);
                    return PutResult::Inserted;
                }

                BorderInsert::AlreadyPresent => {
                    drop(lock);
                    return PutResult::AlreadyPresent;
                }

                BorderInsert::Layer(root) => {
                    drop(lock);
                    layer_root = root;
                    k.shift();
                }

                BorderInsert::Conflict { slot } => {
                    self.start_new_layer(border, &mut lock, slot, &k, &value, &guard);
                    drop(lock);
                    self.count.fetch_add(1, AtomicOrdering::Relaxed);
                    return PutResult::Inserted;
                }

                BorderInsert::Full => {
                    self.split_and_promote(border, lock, &k, &value, &guard);
                    self.count.fetch_add(1, AtomicOrdering::Relaxed);
                    return PutResult::Inserted;
                }
            }
        }
    }

    // ========================================================================
    //  Layer creation
    // ========================================================================

    /// Resolve a full-slice conflict by pushing both keys one layer
    /// down, then swapping the conflicting entry for a link.
    ///
    /// While the keys keep sharing full slices, single-entry border
    /// nodes chain the layers; the first diverging slice gets a node
    /// holding both. Every chained node roots its own layer. The whole
    /// structure is built privately and published by the final payload
    /// swap in the locked parent border.
    fn start_new_layer(
        &self,
        border: &BorderNode<V>,
        lock: &mut LockGuard<'_>,
        slot: usize,
        key: &Key<'_>,
        value: &Arc<V>,
        guard: &LocalGuard<'_>,
    ) {
        let old_lv: *mut BorderValue<V> = border.lv(slot);
        // SAFETY: we hold the border lock; the payload is live.
        let BorderValue::Value {
            suffix: existing_suffix,
            value: existing_value,
        } = (unsafe { &*old_lv })
        else {
            unreachable!("conflict reported on a link entry")
        };

        let mut existing: Key<'_> = Key::new(existing_suffix);
        let mut incoming: Key<'_> = *key;
        incoming.shift();

        debug_log!(layers_from = ?key.offset(), "creating deeper layer for slice conflict");

        let head: Box<BorderNode<V>> = BorderNode::new_root();
        head.set_parent(StdPtr::from_ref(border).cast::<u8>().cast_mut());
        let head_ptr: *mut BorderNode<V> = Box::into_raw(head);

        let mut tail: *mut BorderNode<V> = head_ptr;
        loop {
            // SAFETY: tail was just allocated and is still private.
            let node: &BorderNode<V> = unsafe { &*tail };
            let ex: (u64, u8) = (existing.slice(), existing.slice_len());
            let inc: (u64, u8) = (incoming.slice(), incoming.slice_len());

            if ex == inc {
                // Both keys consume another identical full slice: chain
                // a further layer below this one.
                debug_assert_eq!(ex.1, LINK_SLICE_LEN, "equal non-final slices must be full");

                let twig: Box<BorderNode<V>> = BorderNode::new_root();
                twig.set_parent(tail.cast());
                let twig_ptr: *mut BorderNode<V> = Box::into_raw(twig);

                node.assign(0, ex.0, LINK_SLICE_LEN, BorderValue::new_layer(twig_ptr.cast()));
                node.set_permutation(Permuter::make_sorted(1));

                tail = twig_ptr;
                existing.shift();
                incoming.shift();
                continue;
            }

            // Divergence: this layer stores both keys, smaller first.
            let existing_lv: *mut BorderValue<V> =
                BorderValue::new_value(existing.suffix(), Arc::clone(existing_value));
            let incoming_lv: *mut BorderValue<V> =
                BorderValue::new_value(incoming.suffix(), Arc::clone(value));

            if ex < inc {
                node.assign(0, ex.0, ex.1, existing_lv);
                node.assign(1, inc.0, inc.1, incoming_lv);
            } else {
                node.assign(0, inc.0, inc.1, incoming_lv);
                node.assign(1, ex.0, ex.1, existing_lv);
            }
            node.set_permutation(Permuter::make_sorted(2));
            break;
        }

        // Publish the chain and retire the displaced payload once no
        // reader can still hold it.
        let old: *mut BorderValue<V> =
            border.replace_lv(lock, slot, BorderValue::new_layer(head_ptr.cast()));
        debug_assert_eq!(old, old_lv);

        // SAFETY: `old` came from Box::into_raw and is unreachable now.
        unsafe {
            guard.defer_retire(old, |ptr: *mut BorderValue<V>, _| {
                drop(Box::from_raw(ptr));
            });
        }
    }

    // ========================================================================
    //  Split and promotion
    // ========================================================================

    /// Split a full border node, place the pending insert, and promote
    /// the fence.
    fn split_and_promote<'g>(
        &self,
        border: &'g BorderNode<V>,
        mut lock: LockGuard<'g>,
        key: &Key<'_>,
        value: &Arc<V>,
        guard: &'g LocalGuard<'_>,
    ) {
        let (right_ptr, fence) = border.split(&mut lock);
        // SAFETY: split returns a live sibling, locked with SPLIT set.
        let right: &'g BorderNode<V> = unsafe { &*right_ptr };
        let mut right_lock: LockGuard<'g> = right.version().adopt_locked();

        debug_log!(fence, "border node split");

        // Entries at or above the fence moved right; so does the key.
        let placed: BorderInsert = if key.slice() < fence {
            border.insert(&mut lock, key, value)
        } else {
            right.insert(&mut right_lock, key, value)
        };
        debug_assert!(
            matches!(placed, BorderInsert::Inserted),
            "post-split insert cannot conflict or overflow"
        );

        self.promote(
            StdPtr::from_ref(border).cast::<u8>().cast_mut(),
            lock,
            fence,
            right_ptr.cast(),
            right_lock,
            guard,
        );
    }

    /// Propagate a split upward: insert `(fence, right)` into the
    /// parent of `left`, splitting parents as needed and growing a new
    /// root when the split reaches the top of its layer.
    ///
    /// Holds at most three locks at once (`left`, `right`, parent) and
    /// releases lower levels before splitting upper ones.
    fn promote<'g>(
        &self,
        mut left: *mut u8,
        mut left_lock: LockGuard<'g>,
        mut fence: u64,
        mut right: *mut u8,
        mut right_lock: LockGuard<'g>,
        guard: &'g LocalGuard<'_>,
    ) where
        V: 'g,
    {
        loop {
            let Some((parent_ptr, mut parent_lock)) = self.locked_parent(left, guard) else {
                // Top of the top-level layer: grow and publish a new
                // tree root.
                let new_root: *mut u8 =
                    Self::grow(left, &mut left_lock, fence, right, &mut right_lock);
                self.root.store(new_root, WRITE_ORD);
                debug_log!("tree root grown");
                return;
            };

            // SAFETY: parent_ptr is locked and live.
            let parent_is_border: bool =
                unsafe { Self::node_version(parent_ptr) }.is_border();

            if parent_is_border {
                // `left` roots a deeper layer; the parent border holds
                // its link. Grow the layer and swap the link.
                // SAFETY: discriminant checked above.
                let parent: &BorderNode<V> = unsafe { &*parent_ptr.cast::<BorderNode<V>>() };
                let new_root: *mut u8 =
                    Self::grow(left, &mut left_lock, fence, right, &mut right_lock);
                // The new layer root answers to the same link holder.
                unsafe { Self::set_node_parent(new_root, parent_ptr) };
                Self::swap_layer_link(parent, &mut parent_lock, left, new_root, guard);
                debug_log!("layer root grown");
                return;
            }

            // SAFETY: discriminant checked above.
            let parent: &InteriorNode<V> = unsafe { &*parent_ptr.cast::<InteriorNode<V>>() };

            if !parent.is_full() {
                // SAFETY: we hold both the child's and the parent's lock.
                unsafe { Self::set_node_parent(right, parent_ptr) };
                parent.insert_fence(&mut parent_lock, fence, right);
                return;
            }

            // Parent full: release the lowest lock, split the parent,
            // place the pending fence, and promote one level higher.
            drop(left_lock);

            let (parent_right_ptr, parent_fence) = parent.split(&mut parent_lock);
            // SAFETY: split returns a live sibling, locked with SPLIT set.
            let parent_right: &InteriorNode<V> = unsafe { &*parent_right_ptr };
            let mut parent_right_lock: LockGuard<'g> = parent_right.version().adopt_locked();

            debug_log!(parent_fence, "interior node split");

            // Children that moved to the sibling re-aim their parent
            // back-references while both halves are locked.
            for i in 0..parent_right.child_count() {
                // SAFETY: moved children are live; we own the structural
                // change under both parent locks.
                unsafe {
                    Self::set_node_parent(parent_right.ordered_child(i), parent_right_ptr.cast());
                }
            }

            if fence < parent_fence {
                // SAFETY: parent halves are locked.
                unsafe { Self::set_node_parent(right, parent_ptr) };
                parent.insert_fence(&mut parent_lock, fence, right);
            } else {
                // SAFETY: parent halves are locked.
                unsafe { Self::set_node_parent(right, parent_right_ptr.cast()) };
                parent_right.insert_fence(&mut parent_right_lock, fence, right);
            }

            drop(right_lock);

            left = parent_ptr;
            left_lock = parent_lock;
            fence = parent_fence;
            right = parent_right_ptr.cast();
            right_lock = parent_right_lock;
        }
    }

    /// Lock and return the parent of `n`, revalidating that it is still
    /// the parent after the lock is held.
    fn locked_parent<'g>(
        &self,
        n: *mut u8,
        _guard: &'g LocalGuard<'_>,
    ) -> Option<(*mut u8, LockGuard<'g>)> {
        loop {
            // SAFETY: n is a live node of this map.
            let parent: *mut u8 = unsafe { Self::node_parent(n) };
            if parent.is_null() {
                return None;
            }

            // SAFETY: parent pointers reference live nodes.
            let version: &'g NodeVersion = unsafe { Self::node_version(parent) };
            let lock: LockGuard<'g> = version.lock();

            // SAFETY: as above.
            if unsafe { Self::node_parent(n) } == parent {
                return Some((parent, lock));
            }

            // The parent changed while we waited for its lock.
            drop(lock);
        }
    }

    /// Build a new interior root above a split layer root.
    ///
    /// The children learn their parent and shed their root flags before
    /// the caller publishes the new root, so a reader landing on a
    /// stale child always finds its way up.
    fn grow(
        left: *mut u8,
        left_lock: &mut LockGuard<'_>,
        fence: u64,
        right: *mut u8,
        right_lock: &mut LockGuard<'_>,
    ) -> *mut u8 {
        let root: Box<InteriorNode<V>> = InteriorNode::new();
        root.init_root_pair(fence, left, right);
        root.version().mark_root();
        let root_ptr: *mut u8 = Box::into_raw(root).cast();

        // SAFETY: both children are locked by this thread.
        unsafe {
            Self::set_node_parent(left, root_ptr);
            Self::set_node_parent(right, root_ptr);
        }

        left_lock.mark_nonroot();
        right_lock.mark_nonroot();

        root_ptr
    }

    /// Replace the link entry pointing at `old_root` with one pointing
    /// at `new_root`, under the holding border's lock.
    fn swap_layer_link(
        parent: &BorderNode<V>,
        lock: &mut LockGuard<'_>,
        old_root: *mut u8,
        new_root: *mut u8,
        guard: &LocalGuard<'_>,
    ) {
        let perm: Permuter = parent.permutation();

        for i in 0..perm.size() {
            let slot: usize = perm.get(i);
            let lv: *mut BorderValue<V> = parent.lv(slot);

            // SAFETY: payloads of a locked border are live.
            if let BorderValue::Layer(root) = unsafe { &*lv } {
                if *root == old_root {
                    let old: *mut BorderValue<V> =
                        parent.replace_lv(lock, slot, BorderValue::new_layer(new_root));

                    // SAFETY: the old payload is unreachable after the swap.
                    unsafe {
                        guard.defer_retire(old, |ptr: *mut BorderValue<V>, _| {
                            drop(Box::from_raw(ptr));
                        });
                    }
                    return;
                }
            }
        }

        unreachable!("no link to the grown layer in its parent border");
    }

    // ========================================================================
    //  Invariant checking (tests and diagnostics)
    // ========================================================================

    /// Walk the whole tree, asserting structural invariants, and return
    /// the number of stored entries.
    ///
    /// Requires quiescence: no concurrent operations may run during the
    /// walk.
    ///
    /// # Panics
    ///
    /// Panics on any violated invariant.
    #[must_use]
    pub fn check_invariants(&self) -> usize {
        let root: *mut u8 = self.root.load(READ_ORD);
        let mut entries: usize = 0;
        // SAFETY: quiescence is the documented contract.
        unsafe { self.check_layer(root, &mut entries) };
        entries
    }

    /// Check one layer rooted at `root`, recursing into linked layers.
    ///
    /// # Safety
    /// The tree must be quiescent and `root` a live layer root.
    unsafe fn check_layer(&self, root: *mut u8, entries: &mut usize) {
        // SAFETY: per contract.
        let version: &NodeVersion = unsafe { Self::node_version(root) };
        assert!(version.is_root(), "layer entry point lost its root flag");

        let mut borders: Vec<*mut BorderNode<V>> = Vec::new();
        // SAFETY: per contract.
        unsafe { self.check_node(root, None, None, true, &mut borders, entries) };

        // Border nodes of the layer must chain left-to-right in exactly
        // the order the tree walk discovered them.
        for pair in borders.windows(2) {
            let (left, right) = (pair[0], pair[1]);
            // SAFETY: collected from the live walk above.
            let (left, right) = unsafe { (&*left, &*right) };

            assert_eq!(
                left.next(),
                StdPtr::from_ref(right).cast_mut(),
                "sibling chain skips a border node"
            );
            assert_eq!(
                right.prev(),
                StdPtr::from_ref(left).cast_mut(),
                "sibling back-links disagree with the chain"
            );

            let left_last: u64 = left.slice(left.permutation().last());
            let right_first: u64 = right.slice(right.permutation().first());
            assert!(
                left_last < right_first,
                "sibling slice ranges overlap: {left_last:#x} vs {right_first:#x}"
            );
        }

        if let Some(&first) = borders.first() {
            // SAFETY: as above.
            assert!(unsafe { &*first }.prev().is_null(), "leftmost border has a prev");
        }
        if let Some(&last) = borders.last() {
            // SAFETY: as above.
            assert!(unsafe { &*last }.next().is_null(), "rightmost border has a next");
        }
    }

    /// Check one node and its subtree against its routing bounds.
    ///
    /// # Safety
    /// The tree must be quiescent and `node` live.
    unsafe fn check_node(
        &self,
        node: *mut u8,
        lower: Option<u64>,
        upper: Option<u64>,
        expect_root: bool,
        borders: &mut Vec<*mut BorderNode<V>>,
        entries: &mut usize,
    ) {
        // SAFETY: per contract.
        let version: &NodeVersion = unsafe { Self::node_version(node) };
        assert!(!version.is_locked(), "quiescent tree holds a locked node");
        assert!(!version.is_deleted(), "deleted node in a deletion-free tree");
        assert_eq!(
            version.is_root(),
            expect_root,
            "root flag does not match tree position"
        );

        if version.is_border() {
            // SAFETY: discriminant checked.
            let border: &BorderNode<V> = unsafe { &*node.cast::<BorderNode<V>>() };
            borders.push(node.cast());

            let perm: Permuter = border.permutation();
            assert!(perm.is_valid(), "invalid border permutation");

            let mut prev: Option<(u64, u8)> = None;
            for i in 0..perm.size() {
                let slot: usize = perm.get(i);
                let here: (u64, u8) = (border.slice(slot), border.slice_len(slot));

                if let Some(prev) = prev {
                    assert!(prev < here, "border entries out of order");
                }
                if let Some(lower) = lower {
                    assert!(here.0 >= lower, "border entry below routing bound");
                }
                if let Some(upper) = upper {
                    assert!(here.0 < upper, "border entry above routing bound");
                }
                prev = Some(here);

                let lv: *mut BorderValue<V> = border.lv(slot);
                assert!(!lv.is_null(), "live slot without a payload");

                // SAFETY: payloads of live slots are owned by the tree.
                match unsafe { &*lv } {
                    BorderValue::Value { .. } => *entries += 1,
                    BorderValue::Layer(layer_root) => {
                        assert_eq!(
                            here.1, LINK_SLICE_LEN,
                            "link entry with a partial slice"
                        );
                        // SAFETY: link targets are live layer roots.
                        unsafe { self.check_layer(*layer_root, entries) };
                    }
                }
            }
        } else {
            // SAFETY: discriminant checked.
            let interior: &InteriorNode<V> = unsafe { &*node.cast::<InteriorNode<V>>() };
            let perm: Permuter = interior.permutation();
            assert!(perm.is_valid(), "invalid interior permutation");
            assert!(perm.size() > 0, "interior node without separators");

            let mut child_lower: Option<u64> = lower;
            for i in 0..perm.size() {
                let fence: u64 = interior.slice(perm.get(i));

                if i > 0 {
                    let prev_fence: u64 = interior.slice(perm.get(i - 1));
                    assert!(prev_fence < fence, "interior separators out of order");
                }
                if let Some(lower) = lower {
                    assert!(fence >= lower, "separator below routing bound");
                }
                if let Some(upper) = upper {
                    assert!(fence < upper, "separator above routing bound");
                }

                let child: *mut u8 = interior.ordered_child(i);
                assert!(!child.is_null(), "missing child pointer");
                // SAFETY: children of live interiors are live; parent
                // back-references must point here.
                unsafe {
                    assert_eq!(
                        Self::node_parent(child),
                        node,
                        "child parent back-reference is stale"
                    );
                    self.check_node(child, child_lower, Some(fence), false, borders, entries);
                }

                child_lower = Some(fence);
            }

            let last_child: *mut u8 = interior.ordered_child(perm.size());
            assert!(!last_child.is_null(), "missing rightmost child");
            // SAFETY: as above.
            unsafe {
                assert_eq!(
                    Self::node_parent(last_child),
                    node,
                    "child parent back-reference is stale"
                );
                self.check_node(last_child, child_lower, upper, false, borders, entries);
            }
        }
    }

    // ========================================================================
    //  Teardown
    // ========================================================================

    /// Free a subtree, its payloads, and its linked layers.
    ///
    /// # Safety
    /// Only callable from `Drop`: no other reference to the tree exists.
    unsafe fn free_subtree(node: *mut u8) {
        // SAFETY: per contract.
        if unsafe { Self::node_version(node) }.is_border() {
            // SAFETY: discriminant checked; ownership transfers here.
            let border: Box<BorderNode<V>> = unsafe { Box::from_raw(node.cast()) };
            let perm: Permuter = border.permutation();

            for i in 0..perm.size() {
                // SAFETY: live slots own their payloads. Stale slots
                // beyond the permutation may alias entries owned by a
                // sibling and are left alone.
                let lv: Box<BorderValue<V>> = unsafe { Box::from_raw(border.lv(perm.get(i))) };
                if let BorderValue::Layer(layer_root) = *lv {
                    unsafe { Self::free_subtree(layer_root) };
                }
            }
        } else {
            // SAFETY: discriminant checked; ownership transfers here.
            let interior: Box<InteriorNode<V>> = unsafe { Box::from_raw(node.cast()) };

            for i in 0..interior.child_count() {
                // SAFETY: live children are exclusively owned.
                unsafe { Self::free_subtree(interior.ordered_child(i)) };
            }
        }
    }
}

impl<V> Drop for MassMap<V> {
    fn drop(&mut self) {
        let root: *mut u8 = *self.root.get_mut();
        // SAFETY: &mut self guarantees quiescence.
        unsafe { Self::free_subtree(root) };
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FANOUT;

    #[test]
    fn empty_map_lookup() {
        let map: MassMap<u64> = MassMap::new();
        assert_eq!(map.get(b"a"), None);
        assert!(map.is_empty());
        assert_eq!(map.check_invariants(), 0);
    }

    #[test]
    fn put_get_roundtrip() {
        let map: MassMap<u64> = MassMap::new();

        assert_eq!(map.put(b"key", 1), PutResult::Inserted);
        assert_eq!(map.get(b"key").as_deref(), Some(&1));

        assert_eq!(map.put(b"key", 2), PutResult::AlreadyPresent);
        assert_eq!(map.get(b"key").as_deref(), Some(&1));

        assert_eq!(map.len(), 1);
        assert_eq!(map.check_invariants(), 1);
    }

    #[test]
    fn root_growth_on_first_split() {
        let map: MassMap<u64> = MassMap::new();

        // One more key than a border node holds forces a split and a
        // new interior root above the two borders.
        for i in 0..=FANOUT {
            let key: Vec<u8> = (i as u64).to_be_bytes().to_vec();
            assert_eq!(map.put(&key, i as u64), PutResult::Inserted);
        }

        let root: *mut u8 = map.root.load(READ_ORD);
        // SAFETY: quiescent test tree.
        let root_version: &NodeVersion = unsafe { MassMap::<u64>::node_version(root) };
        assert!(!root_version.is_border(), "root should have grown interior");
        assert!(root_version.is_root());

        // SAFETY: discriminant checked.
        let interior: &InteriorNode<u64> = unsafe { &*root.cast::<InteriorNode<u64>>() };
        for i in 0..interior.child_count() {
            let child: *mut u8 = interior.ordered_child(i);
            // SAFETY: children are live borders.
            let child_version: &NodeVersion = unsafe { MassMap::<u64>::node_version(child) };
            assert!(child_version.is_border());
            assert!(!child_version.is_root(), "former root keeps its flag");
        }

        for i in 0..=FANOUT {
            let key: Vec<u8> = (i as u64).to_be_bytes().to_vec();
            assert_eq!(map.get(&key).as_deref(), Some(&(i as u64)));
        }
        assert_eq!(map.check_invariants(), FANOUT + 1);
    }

    #[test]
    fn split_links_siblings_for_forward_traversal() {
        let map: MassMap<u64> = MassMap::new();

        for i in 1..=16u64 {
            assert_eq!(map.put(&i.to_be_bytes(), i), PutResult::Inserted);
        }

        // Two borders now exist under an interior root.
        let root: *mut u8 = map.root.load(READ_ORD);
        // SAFETY: quiescent test tree; root grew interior.
        let interior: &InteriorNode<u64> = unsafe { &*root.cast::<InteriorNode<u64>>() };
        let left: *mut u8 = interior.ordered_child(0);
        // SAFETY: leftmost child is a border node.
        let left: &BorderNode<u64> = unsafe { &*left.cast::<BorderNode<u64>>() };

        let right: *mut BorderNode<u64> = left.next();
        assert!(!right.is_null(), "split must link a right sibling");
        // SAFETY: as above.
        let right: &BorderNode<u64> = unsafe { &*right };

        // A reader that reached `left` before the split finds the high
        // key by the forward walk: the left node no longer stores it,
        // but the sibling's range includes it.
        let high_bytes: [u8; 8] = 16u64.to_be_bytes();
        let high: Key<'_> = Key::new(&high_bytes);
        assert!(matches!(left.lookup(&high), BorderLookup::NotFound));
        assert!(right.include_key(high.slice()));
        assert!(matches!(right.lookup(&high), BorderLookup::Found(v) if *v == 16));

        // And the public path agrees.
        assert_eq!(map.get(&16u64.to_be_bytes()).as_deref(), Some(&16));
        assert_eq!(map.check_invariants(), 16);
    }

    #[test]
    fn shared_prefix_creates_layer() {
        let map: MassMap<u64> = MassMap::new();

        // Keys sharing the first 8 bytes must land in a deeper layer.
        assert_eq!(map.put(b"prefix00-alpha", 1), PutResult::Inserted);
        assert_eq!(map.put(b"prefix00-beta", 2), PutResult::Inserted);

        assert_eq!(map.get(b"prefix00-alpha").as_deref(), Some(&1));
        assert_eq!(map.get(b"prefix00-beta").as_deref(), Some(&2));
        assert_eq!(map.get(b"prefix00-gamma"), None);
        assert_eq!(map.check_invariants(), 2);
    }

    #[test]
    fn long_shared_prefix_chains_layers() {
        let map: MassMap<u64> = MassMap::new();

        // 24 shared bytes: three full slices before divergence.
        let a: &[u8] = b"prefix00prefix00prefix00-a";
        let b: &[u8] = b"prefix00prefix00prefix00-b";

        assert_eq!(map.put(a, 1), PutResult::Inserted);
        assert_eq!(map.put(b, 2), PutResult::Inserted);

        assert_eq!(map.get(a).as_deref(), Some(&1));
        assert_eq!(map.get(b).as_deref(), Some(&2));
        assert_eq!(map.get(b"prefix00prefix00prefix00"), None);
        assert_eq!(map.check_invariants(), 2);
    }

    #[test]
    fn key_that_is_prefix_of_another() {
        let map: MassMap<u64> = MassMap::new();

        assert_eq!(map.put(b"prefix00", 1), PutResult::Inserted);
        assert_eq!(map.put(b"prefix00-more", 2), PutResult::Inserted);
        assert_eq!(map.put(b"prefix", 3), PutResult::Inserted);

        assert_eq!(map.get(b"prefix00").as_deref(), Some(&1));
        assert_eq!(map.get(b"prefix00-more").as_deref(), Some(&2));
        assert_eq!(map.get(b"prefix").as_deref(), Some(&3));
        assert_eq!(map.check_invariants(), 3);
    }

    #[test]
    fn empty_key_is_storable() {
        let map: MassMap<u64> = MassMap::new();

        assert_eq!(map.put(b"", 42), PutResult::Inserted);
        assert_eq!(map.get(b"").as_deref(), Some(&42));
        assert_eq!(map.put(b"", 43), PutResult::AlreadyPresent);
        assert_eq!(map.check_invariants(), 1);
    }

    #[test]
    fn filling_sixteen_shared_prefix_keys() {
        let map: MassMap<u64> = MassMap::new();

        // All keys share their first slice; the sixteenth insert goes
        // through a layer link rather than a border split.
        let mut keys: Vec<Vec<u8>> = Vec::new();
        for i in 0..10u8 {
            keys.push(format!("aaaaaaaa{i}").into_bytes());
        }
        for c in [b'a', b'b', b'c', b'd', b'e', b'f'] {
            keys.push(format!("aaaaaaaa{}", c as char).into_bytes());
        }

        for (i, key) in keys.iter().enumerate() {
            assert_eq!(map.put(key, i as u64), PutResult::Inserted, "key {i}");
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(map.get(key).as_deref(), Some(&(i as u64)), "key {i}");
        }
        assert_eq!(map.check_invariants(), keys.len());
    }

    #[test]
    fn interior_split_after_many_splits() {
        let map: MassMap<u64> = MassMap::new();

        // Enough distinct slices to split borders repeatedly and
        // overflow the first interior root.
        for i in 0..512u64 {
            assert_eq!(map.put(&i.to_be_bytes(), i), PutResult::Inserted);
        }
        for i in 0..512u64 {
            assert_eq!(map.get(&i.to_be_bytes()).as_deref(), Some(&i), "key {i}");
        }
        assert_eq!(map.check_invariants(), 512);
    }

    #[test]
    fn sublayer_growth_swaps_parent_link() {
        let map: MassMap<u64> = MassMap::new();

        // Many keys behind one shared slice: the sub-layer itself must
        // split and grow an interior root, exercising the link swap.
        for i in 0..256u64 {
            let mut key: Vec<u8> = b"prefix00".to_vec();
            key.extend_from_slice(&i.to_be_bytes());
            assert_eq!(map.put(&key, i), PutResult::Inserted);
        }
        for i in 0..256u64 {
            let mut key: Vec<u8> = b"prefix00".to_vec();
            key.extend_from_slice(&i.to_be_bytes());
            assert_eq!(map.get(&key).as_deref(), Some(&i), "key {i}");
        }
        assert_eq!(map.check_invariants(), 256);
    }

    #[test]
    fn descending_inserts() {
        let map: MassMap<u64> = MassMap::new();

        for i in (0..200u64).rev() {
            assert_eq!(map.put(&i.to_be_bytes(), i), PutResult::Inserted);
        }
        for i in 0..200u64 {
            assert_eq!(map.get(&i.to_be_bytes()).as_deref(), Some(&i));
        }
        assert_eq!(map.check_invariants(), 200);
    }
}
