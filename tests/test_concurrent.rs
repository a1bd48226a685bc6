use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread,
};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use uranus_kv::{OrdComparator, SkipList, SkipListOptions, SpliceMode, WriteMode};

const WRITERS: u64 = 4;
const KEYS_PER_WRITER: u64 = 5_000;

fn setup_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn concurrent_list(splice_mode: SpliceMode) -> SkipList<u64, OrdComparator> {
    let options = SkipListOptions::default()
        .with_write_mode(WriteMode::Concurrent)
        .with_splice_mode(splice_mode);
    SkipList::with_options(options, OrdComparator).unwrap()
}

fn assert_sorted_union(list: &SkipList<u64, OrdComparator>, total: u64) {
    let keys: Vec<u64> = list.keys().copied().collect();
    assert_eq!(keys, (0..total).collect::<Vec<_>>());
    assert_eq!(list.len() as u64, total);
    assert!((0..total).all(|key| list.contains(&key)));
    assert!(!list.contains(&total));
}

#[test]
fn interleaved_writers() {
    setup_logging();
    for mode in [SpliceMode::Disabled, SpliceMode::Strict, SpliceMode::Permissive] {
        let list = concurrent_list(mode);
        thread::scope(|s| {
            for writer_id in 0..WRITERS {
                let list = &list;
                s.spawn(move || {
                    let mut writer = list.writer().unwrap();
                    // writer i owns every key congruent to i, so runs interleave
                    for n in 0..KEYS_PER_WRITER {
                        writer.insert(n * WRITERS + writer_id);
                    }
                });
            }
        });
        assert_sorted_union(&list, WRITERS * KEYS_PER_WRITER);
    }
}

#[test]
fn shuffled_disjoint_ranges() {
    let list = concurrent_list(SpliceMode::Permissive);
    thread::scope(|s| {
        for writer_id in 0..WRITERS {
            let list = &list;
            s.spawn(move || {
                let start = writer_id * KEYS_PER_WRITER;
                let mut keys: Vec<u64> = (start..start + KEYS_PER_WRITER).collect();
                keys.shuffle(&mut StdRng::seed_from_u64(writer_id));
                for key in keys {
                    list.insert(key).unwrap();
                }
            });
        }
    });
    assert_sorted_union(&list, WRITERS * KEYS_PER_WRITER);
}

#[test]
fn readers_observe_sorted_prefixes() {
    let options = SkipListOptions::default().with_write_mode(WriteMode::SingleWriter);
    let list = SkipList::with_options(options, OrdComparator).unwrap();
    let done = AtomicBool::new(false);
    let total = 20_000u64;

    thread::scope(|s| {
        s.spawn(|| {
            let mut writer = list.writer().unwrap();
            let mut keys: Vec<u64> = (0..total).collect();
            keys.shuffle(&mut StdRng::seed_from_u64(9));
            for key in keys {
                writer.insert(key);
            }
            done.store(true, Ordering::Release);
        });

        for _ in 0..3 {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    // every snapshot must be strictly increasing, whatever was missed
                    let keys: Vec<u64> = list.keys().copied().collect();
                    assert!(keys.windows(2).all(|w| w[0] < w[1]));

                    let mut iter = list.iter();
                    iter.seek(&(total / 2));
                    if iter.valid() {
                        assert!(*iter.key() >= total / 2);
                    }
                }
            });
        }
    });

    assert_sorted_union(&list, total);
}

#[test]
fn readers_observe_sorted_prefixes_with_concurrent_writers() {
    setup_logging();
    for mode in [SpliceMode::Disabled, SpliceMode::Strict, SpliceMode::Permissive] {
        let list = concurrent_list(mode);
        let finished = AtomicUsize::new(0);
        let total = WRITERS * KEYS_PER_WRITER;

        thread::scope(|s| {
            for writer_id in 0..WRITERS {
                let (list, finished) = (&list, &finished);
                s.spawn(move || {
                    let mut writer = list.writer().unwrap();
                    let mut keys: Vec<u64> =
                        (0..KEYS_PER_WRITER).map(|n| n * WRITERS + writer_id).collect();
                    keys.shuffle(&mut StdRng::seed_from_u64(writer_id));
                    for key in keys {
                        writer.insert(key);
                    }
                    finished.fetch_add(1, Ordering::Release);
                });
            }

            for _ in 0..3 {
                s.spawn(|| {
                    while finished.load(Ordering::Acquire) < WRITERS as usize {
                        let keys: Vec<u64> = list.keys().copied().collect();
                        assert!(keys.windows(2).all(|w| w[0] < w[1]));

                        let mut iter = list.iter();
                        iter.seek(&(total / 2));
                        if iter.valid() {
                            assert!(*iter.key() >= total / 2);
                        }
                        iter.seek_to_last();
                        if iter.valid() {
                            let last = *iter.key();
                            iter.prev();
                            if iter.valid() {
                                assert!(*iter.key() < last);
                            }
                        }
                    }
                });
            }
        });

        assert_sorted_union(&list, total);
    }
}

#[test]
fn second_single_writer_is_refused_across_threads() {
    let list: SkipList<u64, _> = SkipList::new(OrdComparator);
    let writer = list.writer().unwrap();
    thread::scope(|s| {
        s.spawn(|| assert!(list.writer().is_err()));
    });
    drop(writer);
    thread::scope(|s| {
        s.spawn(|| list.insert(7).unwrap());
    });
    assert!(list.contains(&7));
}
