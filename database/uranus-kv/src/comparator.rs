use std::{cmp::Ordering, marker::PhantomData};

/// A total order over skiplist keys.
///
/// The order must stay the same for as long as a skiplist built with it is alive.
pub trait Comparator<K: ?Sized>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders keys by their [`Ord`] implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdComparator;

impl<K: Ord + ?Sized> Comparator<K> for OrdComparator {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Lexicographic byte order, for keys that are byte strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl<K: AsRef<[u8]> + ?Sized> Comparator<K> for BytewiseComparator {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.as_ref().cmp(b.as_ref())
    }
}

/// Adapts a closure into a [`Comparator`].
pub struct FnComparator<K: ?Sized, F> {
    f: F,
    _key: PhantomData<fn(&K)>,
}

impl<K: ?Sized, F> FnComparator<K, F>
where
    F: Fn(&K, &K) -> Ordering + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnComparator {
            f,
            _key: PhantomData,
        }
    }
}

impl<K: ?Sized, F> Comparator<K> for FnComparator<K, F>
where
    F: Fn(&K, &K) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.f)(a, b)
    }
}
