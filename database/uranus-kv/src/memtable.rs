//! The in-memory write buffer of the storage engine.
//!
//! Every write becomes an [`InternalKey`] carrying the user key, a sequence
//! number, the kind of write and the value. Entries are ordered by user key
//! and, for the same user key, newest first, so a lookup lands on the latest
//! version directly. Sequence numbers keep internal keys unique, which is what
//! the skiplist requires of its callers.

use std::{
    cmp::Ordering as CmpOrdering,
    hint,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    thread,
};

use anyhow::Result;
use bytes::Bytes;
use tracing::debug;

use crate::{
    arena::Arena,
    comparator::Comparator,
    iterator::SkipListIterator,
    skiplist::{SkipList, SkipListOptions, SpliceMode, WriteMode, Writer},
    Storage, StorageError,
};

/// Largest sequence number an entry may carry. `u64::MAX` is kept for lookups
/// that should see every entry.
pub const MAX_SEQUENCE: u64 = u64::MAX - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Put,
    Delete,
}

/// A memtable entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Bytes,
    pub sequence: u64,
    pub kind: ValueKind,
    pub value: Bytes,
}

impl InternalKey {
    pub fn new(user_key: Bytes, sequence: u64, kind: ValueKind, value: Bytes) -> InternalKey {
        InternalKey {
            user_key,
            sequence,
            kind,
            value,
        }
    }

    /// A search key that sorts before every entry of `user_key` visible at
    /// `sequence`.
    fn probe(user_key: Bytes, sequence: u64) -> InternalKey {
        InternalKey::new(user_key, sequence, ValueKind::Put, Bytes::new())
    }

    /// Bytes charged against the memtable budget besides the node itself.
    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + self.value.len() + 8 + 1
    }
}

/// User key ascending, then sequence descending.
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalKeyComparator;

impl Comparator<InternalKey> for InternalKeyComparator {
    fn compare(&self, a: &InternalKey, b: &InternalKey) -> CmpOrdering {
        a.user_key
            .cmp(&b.user_key)
            .then_with(|| b.sequence.cmp(&a.sequence))
    }
}

/// Result of a point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Bytes),
    /// The newest visible entry is a tombstone.
    Deleted,
}

#[derive(Debug, Clone)]
pub struct MemTableOptions {
    pub skiplist: SkipListOptions,
    /// Size at which [`MemTable::should_flush`] starts returning true.
    pub write_buffer_size: usize,
}

impl Default for MemTableOptions {
    fn default() -> Self {
        MemTableOptions {
            skiplist: SkipListOptions::default()
                .with_write_mode(WriteMode::Concurrent)
                .with_splice_mode(SpliceMode::Permissive),
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub type MemTableIterator<'a> = SkipListIterator<'a, InternalKey, InternalKeyComparator, Arena>;

pub struct MemTable {
    list: SkipList<InternalKey, InternalKeyComparator>,
    last_sequence: AtomicU64,
    /// Key and value bytes held outside the arena.
    payload: AtomicUsize,
    frozen: AtomicBool,
    /// Writes that passed the frozen check and have not linked their entry yet.
    in_flight: AtomicUsize,
    write_buffer_size: usize,
}

/// Marks one write as in flight until dropped.
struct WriteGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Release);
    }
}

impl MemTable {
    pub fn new(options: MemTableOptions) -> Result<MemTable> {
        let list = SkipList::with_options(options.skiplist, InternalKeyComparator)?;
        debug!(
            write_buffer_size = options.write_buffer_size,
            "memtable created"
        );
        Ok(MemTable {
            list,
            last_sequence: AtomicU64::new(0),
            payload: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            write_buffer_size: options.write_buffer_size,
        })
    }

    /// Adds an entry with a caller-chosen sequence number, which must not have
    /// been used for the same user key before and must not exceed
    /// [`MAX_SEQUENCE`].
    pub fn add(&self, sequence: u64, kind: ValueKind, key: Bytes, value: Bytes) -> Result<()> {
        check_sequence(sequence)?;
        let _guard = self.begin_write()?;
        self.last_sequence.fetch_max(sequence, Ordering::Relaxed);
        self.insert(InternalKey::new(key, sequence, kind, value))
    }

    /// A writer for batches of entries, cheaper than [`add`](Self::add) when
    /// the batch is sorted.
    pub fn writer(&self) -> Result<MemTableWriter<'_>> {
        if self.is_frozen() {
            Err(StorageError::Frozen)?
        }
        Ok(MemTableWriter {
            memtable: self,
            writer: self.list.writer()?,
        })
    }

    /// The newest entry for `key`.
    pub fn lookup(&self, key: &Bytes) -> Option<Lookup> {
        self.lookup_at(key, u64::MAX)
    }

    /// The newest entry for `key` with a sequence number not above `sequence`.
    pub fn lookup_at(&self, key: &Bytes, sequence: u64) -> Option<Lookup> {
        let mut iter = self.list.iter();
        iter.seek(&InternalKey::probe(key.clone(), sequence));
        if !iter.valid() || iter.key().user_key != *key {
            return None;
        }
        let entry = iter.key();
        Some(match entry.kind {
            ValueKind::Put => Lookup::Found(entry.value.clone()),
            ValueKind::Delete => Lookup::Deleted,
        })
    }

    /// A cursor over all entries in internal key order.
    pub fn iter(&self) -> MemTableIterator<'_> {
        self.list.iter()
    }

    pub fn entries(&self) -> impl Iterator<Item = &InternalKey> {
        self.list.keys()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Relaxed)
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.list.memory_usage() + self.payload.load(Ordering::Relaxed)
    }

    pub fn should_flush(&self) -> bool {
        self.approximate_memory_usage() >= self.write_buffer_size
    }

    /// Stops accepting writes; readers are unaffected.
    ///
    /// Returns once every write that got past the frozen check has linked its
    /// entry, so the contents no longer change afterwards.
    pub fn freeze(&self) {
        let already_frozen = self.frozen.swap(true, Ordering::SeqCst);
        let mut spins = 0u32;
        while self.in_flight.load(Ordering::Acquire) != 0 {
            if spins < 64 {
                hint::spin_loop();
                spins += 1;
            } else {
                thread::yield_now();
            }
        }
        if !already_frozen {
            debug!(
                entries = self.len(),
                memory = self.approximate_memory_usage(),
                "memtable frozen"
            );
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Registers a write, or fails if the memtable is frozen.
    ///
    /// The counter is raised before `frozen` is read. Paired with the order in
    /// [`freeze`](Self::freeze), either the write sees the flag or `freeze`
    /// waits for the write.
    fn begin_write(&self) -> Result<WriteGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = WriteGuard {
            in_flight: &self.in_flight,
        };
        if self.frozen.load(Ordering::SeqCst) {
            Err(StorageError::Frozen)?
        }
        Ok(guard)
    }

    fn next_sequence(&self) -> Result<u64> {
        let last = self
            .last_sequence
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
                (last < MAX_SEQUENCE).then(|| last + 1)
            })
            .map_err(|_| StorageError::SequenceExhausted)?;
        Ok(last + 1)
    }

    fn insert(&self, entry: InternalKey) -> Result<()> {
        let charge = entry.encoded_len();
        self.list.insert(entry)?;
        self.payload.fetch_add(charge, Ordering::Relaxed);
        Ok(())
    }
}

pub struct MemTableWriter<'a> {
    memtable: &'a MemTable,
    writer: Writer<'a, InternalKey, InternalKeyComparator>,
}

impl<'a> MemTableWriter<'a> {
    pub fn add(&mut self, sequence: u64, kind: ValueKind, key: Bytes, value: Bytes) -> Result<()> {
        check_sequence(sequence)?;
        let _guard = self.memtable.begin_write()?;
        self.memtable
            .last_sequence
            .fetch_max(sequence, Ordering::Relaxed);
        let entry = InternalKey::new(key, sequence, kind, value);
        self.memtable
            .payload
            .fetch_add(entry.encoded_len(), Ordering::Relaxed);
        self.writer.insert(entry);
        Ok(())
    }
}

fn check_sequence(sequence: u64) -> Result<()> {
    if sequence > MAX_SEQUENCE {
        Err(StorageError::ReservedSequence(sequence))?
    }
    Ok(())
}

impl Storage for MemTable {
    fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        let _guard = self.begin_write()?;
        let sequence = self.next_sequence()?;
        self.insert(InternalKey::new(key, sequence, ValueKind::Put, value))
    }

    fn delete(&self, key: Bytes) -> Result<()> {
        let _guard = self.begin_write()?;
        let sequence = self.next_sequence()?;
        self.insert(InternalKey::new(key, sequence, ValueKind::Delete, Bytes::new()))
    }

    fn get(&self, key: Bytes) -> Result<Option<Bytes>> {
        Ok(match self.lookup(&key) {
            Some(Lookup::Found(value)) => Some(value),
            Some(Lookup::Deleted) | None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_logging() {
        let _ = tracing_subscriber::fmt::try_init();
    }

    #[test]
    fn newest_version_wins() {
        setup_logging();
        let memtable = MemTable::new(MemTableOptions::default()).unwrap();
        memtable
            .add(1, ValueKind::Put, Bytes::from("k"), Bytes::from("v1"))
            .unwrap();
        memtable
            .add(2, ValueKind::Put, Bytes::from("k"), Bytes::from("v2"))
            .unwrap();
        let key = Bytes::from("k");
        assert_eq!(memtable.lookup(&key), Some(Lookup::Found(Bytes::from("v2"))));
        assert_eq!(memtable.lookup_at(&key, 1), Some(Lookup::Found(Bytes::from("v1"))));
        assert_eq!(memtable.lookup_at(&key, 0), None);
        assert_eq!(memtable.last_sequence(), 2);
    }

    #[test]
    fn tombstones_hide_values() {
        let memtable = MemTable::new(MemTableOptions::default()).unwrap();
        memtable.put(Bytes::from("a"), Bytes::from("1")).unwrap();
        memtable.delete(Bytes::from("a")).unwrap();
        assert_eq!(memtable.lookup(&Bytes::from("a")), Some(Lookup::Deleted));
        assert_eq!(memtable.get(Bytes::from("a")).unwrap(), None);
        assert_eq!(memtable.len(), 2);
    }

    #[test]
    fn missing_keys() {
        let memtable = MemTable::new(MemTableOptions::default()).unwrap();
        memtable.put(Bytes::from("b"), Bytes::from("1")).unwrap();
        assert_eq!(memtable.lookup(&Bytes::from("a")), None);
        assert_eq!(memtable.lookup(&Bytes::from("bb")), None);
        assert_eq!(memtable.lookup(&Bytes::from("c")), None);
    }

    #[test]
    fn entries_are_in_internal_order() {
        let memtable = MemTable::new(MemTableOptions::default()).unwrap();
        memtable.put(Bytes::from("b"), Bytes::from("1")).unwrap();
        memtable.put(Bytes::from("a"), Bytes::from("2")).unwrap();
        memtable.put(Bytes::from("b"), Bytes::from("3")).unwrap();
        let order: Vec<(Bytes, u64)> = memtable
            .entries()
            .map(|entry| (entry.user_key.clone(), entry.sequence))
            .collect();
        assert_eq!(
            order,
            vec![
                (Bytes::from("a"), 2),
                (Bytes::from("b"), 3),
                (Bytes::from("b"), 1),
            ]
        );
    }

    #[test]
    fn frozen_memtable_rejects_writes() {
        let memtable = MemTable::new(MemTableOptions::default()).unwrap();
        memtable.put(Bytes::from("a"), Bytes::from("1")).unwrap();
        memtable.freeze();
        let err = memtable.put(Bytes::from("b"), Bytes::from("2")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Frozen)
        ));
        assert!(memtable.writer().is_err());
        assert_eq!(
            memtable.lookup(&Bytes::from("a")),
            Some(Lookup::Found(Bytes::from("1")))
        );
    }

    #[test]
    fn batch_writer() {
        let memtable = MemTable::new(MemTableOptions::default()).unwrap();
        let mut writer = memtable.writer().unwrap();
        for i in 0..1000u64 {
            let key = Bytes::from(format!("key{:05}", i));
            writer
                .add(i + 1, ValueKind::Put, key, Bytes::from(i.to_string()))
                .unwrap();
        }
        drop(writer);
        assert_eq!(memtable.len(), 1000);
        assert_eq!(
            memtable.lookup(&Bytes::from("key00042")),
            Some(Lookup::Found(Bytes::from("42")))
        );
        assert_eq!(memtable.last_sequence(), 1000);
    }

    #[test]
    fn should_flush_after_budget() {
        let options = MemTableOptions {
            write_buffer_size: 64 * 1024,
            ..MemTableOptions::default()
        };
        let memtable = MemTable::new(options).unwrap();
        let mut i = 0u64;
        while !memtable.should_flush() {
            memtable
                .put(Bytes::from(i.to_be_bytes().to_vec()), Bytes::from(vec![0u8; 100]))
                .unwrap();
            i += 1;
        }
        assert!(memtable.approximate_memory_usage() >= 64 * 1024);
    }

    #[test]
    fn single_writer_memtable() {
        let options = MemTableOptions {
            skiplist: SkipListOptions::default().with_write_mode(WriteMode::SingleWriter),
            ..MemTableOptions::default()
        };
        let memtable = MemTable::new(options).unwrap();
        let writer = memtable.writer().unwrap();
        assert!(memtable.put(Bytes::from("x"), Bytes::from("y")).is_err());
        drop(writer);
        memtable.put(Bytes::from("x"), Bytes::from("y")).unwrap();
    }

    #[test]
    fn reserved_sequence_is_rejected() {
        let memtable = MemTable::new(MemTableOptions::default()).unwrap();
        let err = memtable
            .add(u64::MAX, ValueKind::Put, Bytes::from("a"), Bytes::from("1"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::ReservedSequence(u64::MAX))
        ));
        assert!(memtable.is_empty());

        memtable
            .add(MAX_SEQUENCE, ValueKind::Put, Bytes::from("a"), Bytes::from("1"))
            .unwrap();
        assert_eq!(
            memtable.lookup(&Bytes::from("a")),
            Some(Lookup::Found(Bytes::from("1")))
        );

        let err = memtable.put(Bytes::from("b"), Bytes::from("2")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::SequenceExhausted)
        ));
        assert_eq!(memtable.last_sequence(), MAX_SEQUENCE);
        assert_eq!(memtable.len(), 1);
    }

    #[test]
    fn freeze_waits_for_writes_in_flight() {
        let memtable = MemTable::new(MemTableOptions::default()).unwrap();
        let guard = memtable.begin_write().unwrap();
        std::thread::scope(|s| {
            let freezer = s.spawn(|| memtable.freeze());
            // the flag flips at once, the call returns only after the write ends
            while !memtable.is_frozen() {
                std::hint::spin_loop();
            }
            assert!(!freezer.is_finished());
            memtable
                .insert(InternalKey::new(Bytes::from("k"), 1, ValueKind::Put, Bytes::new()))
                .unwrap();
            drop(guard);
            freezer.join().unwrap();
        });
        assert_eq!(memtable.len(), 1);
        assert!(memtable.put(Bytes::from("k"), Bytes::new()).is_err());
        assert_eq!(memtable.len(), 1);
    }
}
