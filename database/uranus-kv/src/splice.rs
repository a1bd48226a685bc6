//! The cached insertion neighborhood behind sequential writes.
//!
//! A splice remembers, for every level, the pair of nodes the previous key
//! was linked between. When keys arrive in ascending order the next key
//! usually still falls right after the previous one, so only the lowest
//! levels need to be walked again.

use std::ptr;

use tracing::trace;

use crate::{
    arena::Allocator,
    comparator::Comparator,
    skiplist::{Node, SkipList, SpliceMode},
};

/// Per-level `(prev, next)` pairs bracketing a key.
///
/// Level `height` holds `(head, null)` so a recomputation can always start
/// one level above the highest level in use. The pointers are borrowed from
/// the list the splice is used with and are only trusted after checking that
/// `prev` still links to `next`.
pub(crate) struct Splice<K> {
    pub(crate) height: usize,
    pub(crate) prev: Vec<*mut Node<K>>,
    pub(crate) next: Vec<*mut Node<K>>,
}

impl<K> Splice<K> {
    pub(crate) fn new(max_height: usize) -> Splice<K> {
        Splice {
            height: 0,
            prev: vec![ptr::null_mut(); max_height + 1],
            next: vec![ptr::null_mut(); max_height + 1],
        }
    }

    /// A placeholder that owns no storage.
    pub(crate) fn empty() -> Splice<K> {
        Splice {
            height: 0,
            prev: Vec::new(),
            next: Vec::new(),
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.height = 0;
    }

    pub(crate) fn reset_to(&mut self, height: usize, head: *mut Node<K>) {
        self.height = height;
        self.prev[height] = head;
        self.next[height] = ptr::null_mut();
    }
}

impl<K, C: Comparator<K>, A: Allocator> SkipList<K, C, A> {
    /// Makes `splice` bracket `key` on every level below `list_height`.
    ///
    /// Returns the number of low levels that were searched again; the levels
    /// above it are kept from the cache.
    pub(crate) fn prepare_splice(&self, key: &K, splice: &mut Splice<K>, list_height: usize) -> usize {
        if splice.height < list_height {
            // empty, invalidated, or the list grew since it was filled
            self.find_less_than(key, Some(splice));
            return splice.height;
        }

        let strict = self.splice_mode() == SpliceMode::Strict;
        let head = self.head_ptr();
        let mut level = 0;
        while level < list_height {
            let prev = splice.prev[level];
            let next = splice.next[level];
            // Safety: cached nodes belong to this list and are never freed.
            if unsafe { Node::next(prev, level) } != next {
                // another insert landed in between, try the level above
                level += 1;
            } else if prev != head && !self.key_is_after_node(key, prev) {
                // the key comes before the cached run
                if strict {
                    return self.discard_splice(key, splice);
                }
                while level < list_height && splice.prev[level] == prev {
                    level += 1;
                }
            } else if self.key_is_after_node(key, next) {
                // the key comes after the cached run
                if strict {
                    return self.discard_splice(key, splice);
                }
                while level < list_height && splice.next[level] == next {
                    level += 1;
                }
            } else {
                break;
            }
        }

        if level > 0 {
            self.recompute_splice_levels(key, splice, level);
        }
        level
    }

    fn discard_splice(&self, key: &K, splice: &mut Splice<K>) -> usize {
        trace!("key left the cached run, searching from the head");
        self.find_less_than(key, Some(splice));
        splice.height
    }

    /// Walks levels `level - 1` down to 0, each one starting from the
    /// bracket found on the level above.
    fn recompute_splice_levels(&self, key: &K, splice: &mut Splice<K>, level: usize) {
        for level in (0..level).rev() {
            let (prev, next) =
                self.find_splice_for_level(key, splice.prev[level + 1], splice.next[level + 1], level);
            splice.prev[level] = prev;
            splice.next[level] = next;
        }
    }

    /// Walks `level` from `before`, which must sort before `key`, and returns
    /// the pair bracketing `key`. `after` is a known upper bound and may be
    /// null.
    pub(crate) fn find_splice_for_level(
        &self,
        key: &K,
        mut before: *mut Node<K>,
        after: *mut Node<K>,
        level: usize,
    ) -> (*mut Node<K>, *mut Node<K>) {
        loop {
            // Safety: `before` is the head or a node with more than `level` links.
            let next = unsafe { Node::next(before, level) };
            if next == after || !self.key_is_after_node(key, next) {
                return (before, next);
            }
            before = next;
        }
    }
}
