//! A concurrent skiplist in the spirit of LevelDB's `db/skiplist.h` and
//! RocksDB's `InlineSkipList`.
//!
//! ```text
//! Level 2:  HEAD ──────────────────────► 5 ──────────────────► nil
//! Level 1:  HEAD ──────────► 3 ────────► 5 ──────────────────► nil
//! Level 0:  HEAD ──► 1 ────► 3 ──► 4 ──► 5 ──► 8 ────────────► nil
//! ```
//!
//! Keys are only ever added. A node is linked bottom-up, and a reader that
//! follows a link is guaranteed to see the node fully built: the node's own
//! links are written before the release store (or CAS) that publishes it, and
//! every link load is an acquire. That is the only ordering the structure
//! relies on; the list height and the entry count are relaxed bookkeeping.
//!
//! Nodes live in an [`Allocator`] and are never freed one by one. Dropping the
//! list runs the key destructors and then releases the arena in one go.

use std::{
    alloc::Layout,
    cell::UnsafeCell,
    cmp::Ordering as CmpOrdering,
    marker::PhantomData,
    mem::{self, MaybeUninit},
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    arena::{Allocator, Arena},
    comparator::Comparator,
    random::HeightSampler,
    splice::Splice,
};

/// Hard upper bound for [`SkipListOptions::max_height`].
pub const MAX_HEIGHT_LIMIT: usize = 32;
pub const DEFAULT_MAX_HEIGHT: usize = 12;
pub const DEFAULT_BRANCHING_FACTOR: u32 = 4;

/// How writers publish new nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// One writer at a time, links are installed with plain release stores.
    #[default]
    SingleWriter,
    /// Any number of writers, every link is installed with a compare-and-swap.
    Concurrent,
}

/// What a writer does with its cached splice when the next key does not
/// extend the previous insertion's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpliceMode {
    /// Every insertion searches from the head.
    Disabled,
    /// Any miss discards the cache and searches from the head.
    Strict,
    /// A miss only recomputes the levels the key invalidated.
    #[default]
    Permissive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipListOptions {
    pub max_height: usize,
    pub branching_factor: u32,
    pub write_mode: WriteMode,
    pub splice_mode: SpliceMode,
}

impl Default for SkipListOptions {
    fn default() -> Self {
        SkipListOptions {
            max_height: DEFAULT_MAX_HEIGHT,
            branching_factor: DEFAULT_BRANCHING_FACTOR,
            write_mode: WriteMode::default(),
            splice_mode: SpliceMode::default(),
        }
    }
}

impl SkipListOptions {
    pub fn with_max_height(mut self, max_height: usize) -> Self {
        self.max_height = max_height;
        self
    }

    pub fn with_branching_factor(mut self, branching_factor: u32) -> Self {
        self.branching_factor = branching_factor;
        self
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn with_splice_mode(mut self, splice_mode: SpliceMode) -> Self {
        self.splice_mode = splice_mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_height == 0 || self.max_height > MAX_HEIGHT_LIMIT {
            Err(SkipListError::InvalidMaxHeight {
                height: self.max_height,
                limit: MAX_HEIGHT_LIMIT,
            })?
        }
        if self.branching_factor < 2 {
            Err(SkipListError::InvalidBranchingFactor(self.branching_factor))?
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SkipListError {
    #[error("max height {height} is outside of 1..={limit}")]
    InvalidMaxHeight { height: usize, limit: usize },
    #[error("branching factor {0} must be at least 2")]
    InvalidBranchingFactor(u32),
    #[error("the skiplist only accepts one writer and another one is active")]
    WriterBusy,
}

/// A key followed in memory by `height` forward links.
///
/// Nodes are only handled through raw pointers: the link array lies past the
/// end of the struct, so every access goes through the pointer the arena
/// handed out instead of a reference to the header.
#[repr(C)]
pub(crate) struct Node<K> {
    /// Uninitialized for the head sentinel only.
    key: MaybeUninit<K>,
    height: usize,
    tower: [AtomicPtr<Node<K>>; 0],
}

impl<K> Node<K> {
    fn layout(height: usize) -> Layout {
        let links = mem::size_of::<AtomicPtr<Node<K>>>() * height;
        Layout::from_size_align(mem::size_of::<Self>() + links, mem::align_of::<Self>())
            .unwrap_or_else(|_| panic!("a node of height {} does not fit a layout", height))
    }

    /// Allocates a node and initializes its key and every link to null.
    ///
    /// # Safety
    /// The node must not outlive `allocator`.
    pub(crate) unsafe fn new_in<A: Allocator>(
        allocator: &A,
        key: Option<K>,
        height: usize,
    ) -> *mut Node<K> {
        let node = allocator.allocate_aligned(Self::layout(height)).as_ptr() as *mut Node<K>;
        let key = match key {
            Some(key) => MaybeUninit::new(key),
            None => MaybeUninit::uninit(),
        };
        ptr::addr_of_mut!((*node).key).write(key);
        ptr::addr_of_mut!((*node).height).write(height);
        let tower = Self::tower(node) as *mut AtomicPtr<Node<K>>;
        for level in 0..height {
            tower.add(level).write(AtomicPtr::new(ptr::null_mut()));
        }
        node
    }

    #[inline]
    unsafe fn tower(node: *const Node<K>) -> *const AtomicPtr<Node<K>> {
        (node as *const u8).add(mem::size_of::<Self>()) as *const AtomicPtr<Node<K>>
    }

    #[inline]
    unsafe fn link<'a>(node: *const Node<K>, level: usize) -> &'a AtomicPtr<Node<K>> {
        debug_assert!(level < Self::height(node));
        &*Self::tower(node).add(level)
    }

    /// # Safety
    /// `node` must not be the head.
    #[inline]
    pub(crate) unsafe fn key<'a>(node: *const Node<K>) -> &'a K {
        (*ptr::addr_of!((*node).key)).assume_init_ref()
    }

    #[inline]
    pub(crate) unsafe fn height(node: *const Node<K>) -> usize {
        (*node).height
    }

    /// Follows the link at `level`, observing everything written to the
    /// successor before it was published.
    #[inline]
    pub(crate) unsafe fn next(node: *const Node<K>, level: usize) -> *mut Node<K> {
        Self::link(node, level).load(Ordering::Acquire)
    }

    /// Publishes `next` at `level`.
    #[inline]
    pub(crate) unsafe fn set_next(node: *const Node<K>, level: usize, next: *mut Node<K>) {
        Self::link(node, level).store(next, Ordering::Release)
    }

    /// For links of a node nobody else can reach yet.
    #[inline]
    pub(crate) unsafe fn set_next_relaxed(node: *const Node<K>, level: usize, next: *mut Node<K>) {
        Self::link(node, level).store(next, Ordering::Relaxed)
    }

    #[inline]
    pub(crate) unsafe fn cas_next(
        node: *const Node<K>,
        level: usize,
        expected: *mut Node<K>,
        next: *mut Node<K>,
    ) -> bool {
        Self::link(node, level)
            .compare_exchange(expected, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// An append-only concurrent ordered set.
///
/// Readers never block and may run alongside writers. Writers go through a
/// [`Writer`] (or the [`SkipList::insert`] shorthand), whose number is
/// limited by the [`WriteMode`].
///
/// Inserting a key that compares equal to a key already present breaks the
/// structure's ordering guarantees. Debug builds assert against it; callers
/// are expected to make keys unique, e.g. with a sequence number.
pub struct SkipList<K, C, A: Allocator = Arena> {
    head: NonNull<Node<K>>,
    max_height: AtomicUsize,
    len: AtomicUsize,
    sampler: HeightSampler,
    options: SkipListOptions,
    comparator: C,
    /// Held by the live writer in single-writer mode.
    writer_active: AtomicBool,
    /// The single writer's splice, kept between writers. Only touched by the
    /// thread that owns `writer_active`.
    sequential_splice: UnsafeCell<Splice<K>>,
    arena: A,
}

unsafe impl<K: Send + Sync, C: Send + Sync, A: Allocator> Send for SkipList<K, C, A> {}
unsafe impl<K: Send + Sync, C: Send + Sync, A: Allocator> Sync for SkipList<K, C, A> {}

impl<K, C: Comparator<K>> SkipList<K, C, Arena> {
    /// A skiplist with default options over a fresh [`Arena`].
    pub fn new(comparator: C) -> SkipList<K, C, Arena> {
        SkipList::build(SkipListOptions::default(), comparator, Arena::new())
    }

    pub fn with_options(options: SkipListOptions, comparator: C) -> Result<SkipList<K, C, Arena>> {
        SkipList::with_allocator(options, comparator, Arena::new())
    }
}

impl<K, C: Comparator<K>, A: Allocator> SkipList<K, C, A> {
    pub fn with_allocator(options: SkipListOptions, comparator: C, arena: A) -> Result<Self> {
        options.validate()?;
        Ok(SkipList::build(options, comparator, arena))
    }

    fn build(options: SkipListOptions, comparator: C, arena: A) -> Self {
        // Safety: the head lives in the arena it is stored next to.
        let head = unsafe { Node::new_in(&arena, None, options.max_height) };
        debug!(
            max_height = options.max_height,
            branching_factor = options.branching_factor,
            write_mode = ?options.write_mode,
            splice_mode = ?options.splice_mode,
            "skiplist created"
        );
        SkipList {
            // Safety: arena allocations are never null.
            head: unsafe { NonNull::new_unchecked(head) },
            max_height: AtomicUsize::new(1),
            len: AtomicUsize::new(0),
            sampler: HeightSampler::new(options.max_height, options.branching_factor),
            sequential_splice: UnsafeCell::new(Splice::new(options.max_height)),
            writer_active: AtomicBool::new(false),
            options,
            comparator,
            arena,
        }
    }

    pub fn options(&self) -> &SkipListOptions {
        &self.options
    }

    pub fn comparator(&self) -> &C {
        &self.comparator
    }

    /// Number of keys inserted so far.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of levels currently in use, starting at 1.
    pub fn max_height(&self) -> usize {
        self.max_height.load(Ordering::Relaxed)
    }

    /// Bytes reserved by the underlying allocator.
    pub fn memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    /// Obtains a handle for inserting keys.
    ///
    /// In [`WriteMode::SingleWriter`] this fails with
    /// [`SkipListError::WriterBusy`] while another writer is alive, and the
    /// writer resumes the splice left behind by its predecessor.
    pub fn writer(&self) -> Result<Writer<'_, K, C, A>> {
        let splice = match self.options.write_mode {
            WriteMode::SingleWriter => {
                if self
                    .writer_active
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    Err(SkipListError::WriterBusy)?
                }
                // Safety: the token makes this thread the only one touching the cell.
                unsafe { mem::replace(&mut *self.sequential_splice.get(), Splice::empty()) }
            }
            WriteMode::Concurrent => Splice::new(self.options.max_height),
        };
        Ok(Writer { list: self, splice })
    }

    /// Inserts `key` through a short-lived writer.
    pub fn insert(&self, key: K) -> Result<()> {
        self.writer()?.insert(key);
        Ok(())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// The stored key equal to `key`, if any.
    pub fn get(&self, key: &K) -> Option<&K> {
        let node = self.find_greater_or_equal(key);
        if node.is_null() {
            return None;
        }
        // Safety: search results are never the head.
        let found = unsafe { Node::key(node) };
        (self.comparator.compare(found, key) == CmpOrdering::Equal).then_some(found)
    }

    /// Approximates the number of keys less than `key`.
    ///
    /// A node skipped on level `L` stands for `branching_factor^L` nodes on
    /// level 0. What the levels below `L` add on top is capped just under the
    /// weight of one more level `L` node, so the estimate never decreases as
    /// `key` grows. It is not an exact rank.
    pub fn estimate_count(&self, key: &K) -> usize {
        let height = self.max_height();
        let mut skipped = [0usize; MAX_HEIGHT_LIMIT];
        let mut x = self.head_ptr();
        let mut level = height - 1;
        loop {
            // Safety: `x` is the head or a node reached on `level`.
            let next = unsafe { Node::next(x, level) };
            if self.key_is_after_node(key, next) {
                x = next;
                skipped[level] += 1;
            } else if level == 0 {
                break;
            } else {
                level -= 1;
            }
        }

        let branching = self.options.branching_factor as usize;
        let mut estimate = skipped[0];
        let mut weight = 1usize;
        for &count in &skipped[1..height] {
            weight = weight.saturating_mul(branching);
            estimate = count
                .saturating_mul(weight)
                .saturating_add(estimate.min(weight - 1));
        }
        estimate
    }

    /// Iterates over every key in order.
    pub fn keys(&self) -> Keys<'_, K> {
        Keys {
            // Safety: the head has every level.
            node: unsafe { Node::next(self.head_ptr(), 0) },
            _list: PhantomData,
        }
    }

    pub(crate) fn head_ptr(&self) -> *mut Node<K> {
        self.head.as_ptr()
    }

    pub(crate) fn splice_mode(&self) -> SpliceMode {
        self.options.splice_mode
    }

    /// Whether `key` sorts strictly after `node`'s key. A null node sorts last.
    pub(crate) fn key_is_after_node(&self, key: &K, node: *const Node<K>) -> bool {
        // Safety: non-null links only lead to keyed nodes.
        !node.is_null() && self.comparator.compare(unsafe { Node::key(node) }, key) == CmpOrdering::Less
    }

    /// The first node whose key is `>= key`, or null.
    pub(crate) fn find_greater_or_equal(&self, key: &K) -> *mut Node<K> {
        let mut x = self.head_ptr();
        let mut level = self.max_height() - 1;
        // the node that stopped us one level up; no need to compare it again
        let mut last_bigger: *mut Node<K> = ptr::null_mut();
        loop {
            // Safety: `x` is the head or a node reached on `level`.
            let next = unsafe { Node::next(x, level) };
            if next != last_bigger && self.key_is_after_node(key, next) {
                x = next;
            } else if level == 0 {
                return next;
            } else {
                last_bigger = next;
                level -= 1;
            }
        }
    }

    /// The last node whose key is `< key`, or the head.
    ///
    /// With a splice, the bracketing pair of every level is recorded along the
    /// way, leaving the splice ready for an insertion of `key`.
    pub(crate) fn find_less_than(&self, key: &K, mut splice: Option<&mut Splice<K>>) -> *mut Node<K> {
        let height = self.max_height();
        let mut x = self.head_ptr();
        let mut level = height - 1;
        if let Some(splice) = splice.as_deref_mut() {
            splice.reset_to(height, x);
        }
        loop {
            // Safety: `x` is the head or a node reached on `level`.
            let next = unsafe { Node::next(x, level) };
            if self.key_is_after_node(key, next) {
                x = next;
                continue;
            }
            if let Some(splice) = splice.as_deref_mut() {
                splice.prev[level] = x;
                splice.next[level] = next;
            }
            if level == 0 {
                return x;
            }
            level -= 1;
        }
    }

    /// The last node, or the head when the list is empty.
    pub(crate) fn find_last(&self) -> *mut Node<K> {
        let mut x = self.head_ptr();
        let mut level = self.max_height() - 1;
        loop {
            // Safety: `x` is the head or a node reached on `level`.
            let next = unsafe { Node::next(x, level) };
            if !next.is_null() {
                x = next;
            } else if level == 0 {
                return x;
            } else {
                level -= 1;
            }
        }
    }

    fn insert_with_splice(&self, key: K, splice: &mut Splice<K>) {
        let height = self.sampler.sample();
        let previous = self.max_height.fetch_max(height, Ordering::Relaxed);
        if height > previous {
            trace!(from = previous, to = height, "raised skiplist height");
        }
        let list_height = previous.max(height);

        if self.options.splice_mode == SpliceMode::Disabled {
            splice.invalidate();
        }
        let recompute_height = self.prepare_splice(&key, splice, list_height);

        debug_assert!(
            splice.next[0].is_null()
                || self.comparator.compare(unsafe { Node::key(splice.next[0]) }, &key)
                    != CmpOrdering::Equal,
            "duplicate key inserted into skiplist"
        );

        // Safety: the node lives in the list's own arena.
        let node = unsafe { Node::new_in(&self.arena, Some(key), height) };
        // Safety: `node` was just built with a key.
        let key = unsafe { Node::key(node) };

        let mut splice_is_valid = true;
        match self.options.write_mode {
            WriteMode::Concurrent => {
                for level in 0..height {
                    loop {
                        // Safety: `node` is unreachable until the CAS succeeds,
                        // and `prev` holds at least `level + 1` links.
                        let installed = unsafe {
                            Node::set_next_relaxed(node, level, splice.next[level]);
                            Node::cas_next(splice.prev[level], level, splice.next[level], node)
                        };
                        if installed {
                            break;
                        }
                        trace!(level, "lost a link race, searching the level again");
                        let (prev, next) =
                            self.find_splice_for_level(key, splice.prev[level], ptr::null_mut(), level);
                        splice.prev[level] = prev;
                        splice.next[level] = next;
                        if level > 0 {
                            splice_is_valid = false;
                        }
                    }
                }
            }
            WriteMode::SingleWriter => {
                for level in 0..height {
                    // levels above the recomputed ones were trusted, not checked
                    if level >= recompute_height
                        && unsafe { Node::next(splice.prev[level], level) } != splice.next[level]
                    {
                        let (prev, next) =
                            self.find_splice_for_level(key, splice.prev[level], ptr::null_mut(), level);
                        splice.prev[level] = prev;
                        splice.next[level] = next;
                    }
                    // Safety: the release store publishes the node after its links.
                    unsafe {
                        Node::set_next_relaxed(node, level, splice.next[level]);
                        Node::set_next(splice.prev[level], level, node);
                    }
                }
            }
        }

        if splice_is_valid {
            // the new node is the tightest predecessor for a following larger key
            for level in 0..height {
                splice.prev[level] = node;
            }
        } else {
            trace!("splice invalidated after a contended insert");
            splice.invalidate();
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }
}

impl<K, C, A: Allocator> Drop for SkipList<K, C, A> {
    fn drop(&mut self) {
        if !mem::needs_drop::<K>() {
            return;
        }
        // Safety: `&mut self` means no reader or writer is left, and every
        // node reachable on level 0 holds an initialized key.
        unsafe {
            let mut node = Node::next(self.head.as_ptr(), 0);
            while !node.is_null() {
                let next = Node::next(node, 0);
                ptr::drop_in_place(ptr::addr_of_mut!((*node).key) as *mut K);
                node = next;
            }
        }
    }
}

/// An insertion handle carrying its own [`Splice`].
///
/// Keys inserted in ascending order through the same writer only pay for the
/// distance from the previous key, not for a search from the head.
pub struct Writer<'a, K, C, A: Allocator = Arena> {
    list: &'a SkipList<K, C, A>,
    pub(crate) splice: Splice<K>,
}

impl<'a, K, C: Comparator<K>, A: Allocator> Writer<'a, K, C, A> {
    /// Inserts `key`, which must not compare equal to any key already present.
    pub fn insert(&mut self, key: K) {
        self.list.insert_with_splice(key, &mut self.splice);
    }

    pub fn list(&self) -> &'a SkipList<K, C, A> {
        self.list
    }
}

impl<'a, K, C, A: Allocator> Drop for Writer<'a, K, C, A> {
    fn drop(&mut self) {
        if self.list.options.write_mode == WriteMode::SingleWriter {
            let splice = mem::replace(&mut self.splice, Splice::empty());
            // Safety: this writer still holds the token.
            unsafe { *self.list.sequential_splice.get() = splice };
            self.list.writer_active.store(false, Ordering::Release);
        }
    }
}

/// Keys of a [`SkipList`] in order, see [`SkipList::keys`].
pub struct Keys<'a, K> {
    node: *mut Node<K>,
    _list: PhantomData<&'a K>,
}

impl<'a, K> Iterator for Keys<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        if self.node.is_null() {
            return None;
        }
        // Safety: level 0 links only lead to keyed nodes that outlive `'a`.
        unsafe {
            let key = Node::key(self.node);
            self.node = Node::next(self.node, 0);
            Some(key)
        }
    }
}
