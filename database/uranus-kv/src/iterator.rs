//! A cursor over a live [`SkipList`].
//!
//! The cursor takes no locks. Inserts that race with it are either missed,
//! as if they happened after the cursor moved, or seen fully built.

use std::ptr::NonNull;

use crate::{
    arena::{Allocator, Arena},
    comparator::Comparator,
    skiplist::{Node, SkipList},
};

enum Position<K> {
    Unpositioned,
    At(NonNull<Node<K>>),
    AtEnd,
}

impl<K> Clone for Position<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Position<K> {}

/// Ordered traversal with seeks, in the style of LevelDB's `SkipList::Iterator`.
///
/// Nodes have no backward links, so [`prev`](Self::prev) searches from the
/// head again and costs O(log n).
pub struct SkipListIterator<'a, K, C, A: Allocator = Arena> {
    list: &'a SkipList<K, C, A>,
    position: Position<K>,
}

impl<K, C: Comparator<K>, A: Allocator> SkipList<K, C, A> {
    /// A cursor that is not positioned yet.
    pub fn iter(&self) -> SkipListIterator<'_, K, C, A> {
        SkipListIterator::new(self)
    }
}

impl<'a, K, C: Comparator<K>, A: Allocator> SkipListIterator<'a, K, C, A> {
    pub fn new(list: &'a SkipList<K, C, A>) -> Self {
        SkipListIterator {
            list,
            position: Position::Unpositioned,
        }
    }

    /// Whether the cursor sits on a key.
    pub fn valid(&self) -> bool {
        matches!(self.position, Position::At(_))
    }

    /// The key under the cursor. Panics unless [`valid`](Self::valid).
    pub fn key(&self) -> &'a K {
        // Safety: positions only ever hold keyed nodes of `list`.
        unsafe { Node::key(self.node().as_ptr()) }
    }

    /// Moves to the following key, or past the end.
    pub fn next(&mut self) {
        // Safety: the current node has at least one level.
        let next = unsafe { Node::next(self.node().as_ptr(), 0) };
        self.position = match NonNull::new(next) {
            Some(node) => Position::At(node),
            None => Position::AtEnd,
        };
    }

    /// Moves to the preceding key. Before the first key the cursor becomes
    /// unpositioned.
    pub fn prev(&mut self) {
        let node = self.list.find_less_than(self.key(), None);
        self.position = if node == self.list.head_ptr() {
            Position::Unpositioned
        } else {
            self.at(node)
        };
    }

    /// Moves to the first key `>= target`.
    pub fn seek(&mut self, target: &K) {
        let node = self.list.find_greater_or_equal(target);
        self.position = self.at(node);
    }

    /// Moves to the last key `<= target`.
    pub fn seek_for_prev(&mut self, target: &K) {
        self.seek(target);
        if !self.valid() {
            self.seek_to_last();
        } else if self.list.comparator().compare(self.key(), target).is_gt() {
            self.prev();
        }
    }

    pub fn seek_to_first(&mut self) {
        // Safety: the head has every level.
        let node = unsafe { Node::next(self.list.head_ptr(), 0) };
        self.position = self.at(node);
    }

    pub fn seek_to_last(&mut self) {
        let node = self.list.find_last();
        self.position = if node == self.list.head_ptr() {
            Position::Unpositioned
        } else {
            self.at(node)
        };
    }

    fn at(&self, node: *mut Node<K>) -> Position<K> {
        match NonNull::new(node) {
            Some(node) => Position::At(node),
            None => Position::AtEnd,
        }
    }

    fn node(&self) -> NonNull<Node<K>> {
        match self.position {
            Position::At(node) => node,
            Position::Unpositioned | Position::AtEnd => {
                panic!("skiplist iterator used while not positioned on a key")
            }
        }
    }
}
