//! Uranus key value storage: the memtable and the concurrent skiplist under it.
//!

pub mod arena;
pub mod comparator;
pub mod iterator;
pub mod memtable;
pub mod random;
pub mod skiplist;
mod splice;

pub use arena::{Allocator, Arena};
pub use comparator::{BytewiseComparator, Comparator, FnComparator, OrdComparator};
pub use iterator::SkipListIterator;
pub use memtable::{
    InternalKey, Lookup, MemTable, MemTableOptions, MemTableWriter, ValueKind, MAX_SEQUENCE,
};
pub use random::HeightSampler;
pub use skiplist::{
    Keys, SkipList, SkipListError, SkipListOptions, SpliceMode, WriteMode, Writer,
};

use anyhow::Result;
use bytes::Bytes;
use thiserror::Error;

pub trait Storage {
    fn put(&self, key: Bytes, value: Bytes) -> Result<()>;
    /// Deleting a key that was never written is not an error.
    fn delete(&self, key: Bytes) -> Result<()>;
    fn get(&self, key: Bytes) -> Result<Option<Bytes>>;
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("memtable is frozen and no longer accepts writes")]
    Frozen,
    #[error("sequence number {0} is reserved for lookups")]
    ReservedSequence(u64),
    #[error("sequence numbers are exhausted")]
    SequenceExhausted,
}
