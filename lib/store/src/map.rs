use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::key::{fingerprint, HashKey};

/// Returns the smallest prime not less than `n`.
pub fn nearest_prime(n: u32) -> u32 {
    fn is_prime(n: u32) -> bool {
        if n < 2 {
            return false;
        }
        if n % 2 == 0 {
            return n == 2;
        }
        let mut d = 3u32;
        while (d as u64) * (d as u64) <= n as u64 {
            if n % d == 0 {
                return false;
            }
            d += 2;
        }
        true
    }

    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

struct Bucket<T> {
    entries: Mutex<Vec<(HashKey, T)>>,
}

impl<T> Default for Bucket<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(2)),
        }
    }
}

/// A concurrent map with a fixed number of independently locked buckets.
///
/// A key's bucket is `fingerprint % bucket_count`. Each bucket is guarded by
/// its own mutex on a dedicated cache line, so distinct buckets are fully
/// parallel and at most one writer touches a bucket at any instant. The
/// bucket count is rounded up to the nearest prime at construction and never
/// changes; there is no rehashing.
pub struct BucketMap<T> {
    buckets: Vec<CachePadded<Bucket<T>>>,
}

impl<T> BucketMap<T> {
    pub fn new(requested_buckets: u32) -> Self {
        let count = nearest_prime(requested_buckets) as usize;
        let mut buckets = Vec::with_capacity(count);
        buckets.resize_with(count, CachePadded::default);
        Self { buckets }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, key: &[u8]) -> &Bucket<T> {
        let index = fingerprint(key) as usize % self.buckets.len();
        &self.buckets[index]
    }

    /// Handles an existing object or inserts a new one.
    ///
    /// If an entry for `key` exists, `handler` runs against it under the
    /// bucket lock and its result is returned. Otherwise, if `creator` is
    /// given and produces an object, the object is inserted and `true` is
    /// returned; a `creator` returning `None` inserts nothing. Returns
    /// `false` when neither applies.
    pub fn apply<H, C>(&self, key: &[u8], handler: H, creator: Option<C>) -> bool
    where
        H: FnOnce(&HashKey, &mut T) -> bool,
        C: FnOnce(&HashKey) -> Option<T>,
    {
        let bucket = self.bucket_of(key);
        let mut entries = bucket.entries.lock();
        for (entry_key, object) in entries.iter_mut() {
            if *entry_key == *key {
                return handler(entry_key, object);
            }
        }
        let Some(creator) = creator else {
            return false;
        };
        let entry_key = HashKey::from_slice(key);
        match creator(&entry_key) {
            Some(object) => {
                entries.push((entry_key, object));
                true
            }
            None => false,
        }
    }

    /// Removes the entry for `key`, returning whether it existed.
    pub fn remove(&self, key: &[u8]) -> bool {
        let bucket = self.bucket_of(key);
        let mut entries = bucket.entries.lock();
        match entries.iter().position(|(entry_key, _)| *entry_key == *key) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Removes the entry for `key` if `pred` returns `true` for it.
    ///
    /// Returns whether the entry was present, regardless of removal.
    pub fn remove_if<P>(&self, key: &[u8], pred: P) -> bool
    where
        P: FnOnce(&HashKey, &mut T) -> bool,
    {
        let bucket = self.bucket_of(key);
        let mut entries = bucket.entries.lock();
        match entries
            .iter_mut()
            .position(|(entry_key, _)| *entry_key == *key)
        {
            Some(index) => {
                let (entry_key, object) = &mut entries[index];
                if pred(entry_key, object) {
                    entries.remove(index);
                }
                true
            }
            None => false,
        }
    }

    /// Sweeps one bucket under its lock, erasing entries for which `pred`
    /// returns `true`. Survivors may be mutated by `pred`.
    pub fn gc_bucket<P>(&self, index: usize, mut pred: P)
    where
        P: FnMut(&HashKey, &mut T) -> bool,
    {
        let mut entries = self.buckets[index].entries.lock();
        entries.retain_mut(|(entry_key, object)| !pred(entry_key, object));
    }

    /// Visits every entry, bucket by bucket, under each bucket's lock.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&HashKey, &mut T),
    {
        for bucket in &self.buckets {
            let mut entries = bucket.entries.lock();
            for (entry_key, object) in entries.iter_mut() {
                f(entry_key, object);
            }
        }
    }

    /// Drops every entry in the map.
    pub fn clear(&self) {
        for bucket in &self.buckets {
            bucket.entries.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(map: &BucketMap<u64>, key: &[u8], value: u64) -> bool {
        map.apply(key, |_, _| false, Some(|_: &HashKey| Some(value)))
    }

    #[test]
    fn nearest_prime_rounds_up() {
        assert_eq!(nearest_prime(1), 2);
        assert_eq!(nearest_prime(2), 2);
        assert_eq!(nearest_prime(8), 11);
        assert_eq!(nearest_prime(1000), 1009);
        assert_eq!(nearest_prime(1009), 1009);
    }

    #[test]
    fn apply_creates_then_handles() {
        let map = BucketMap::new(16);
        assert!(insert(&map, b"a", 1));

        let mut seen = 0;
        let found = map.apply(
            b"a",
            |_, v| {
                seen = *v;
                *v += 1;
                true
            },
            None::<fn(&HashKey) -> Option<u64>>,
        );
        assert!(found);
        assert_eq!(seen, 1);

        let missing = map.apply(
            b"b",
            |_, _| true,
            None::<fn(&HashKey) -> Option<u64>>,
        );
        assert!(!missing);
    }

    #[test]
    fn creator_returning_none_inserts_nothing() {
        let map = BucketMap::new(16);
        let created = map.apply(b"a", |_, _| true, Some(|_: &HashKey| None::<u64>));
        assert!(!created);
        assert!(!map.remove(b"a"));
    }

    #[test]
    fn remove_and_remove_if() {
        let map = BucketMap::new(16);
        assert!(insert(&map, b"a", 1));
        assert!(insert(&map, b"b", 2));

        assert!(map.remove(b"a"));
        assert!(!map.remove(b"a"));

        // present but predicate declines: entry stays.
        assert!(map.remove_if(b"b", |_, _| false));
        assert!(map.remove_if(b"b", |_, _| true));
        assert!(!map.remove_if(b"b", |_, _| true));
    }

    #[test]
    fn gc_bucket_erases_and_mutates() {
        let map = BucketMap::new(4);
        for i in 0..32u64 {
            assert!(insert(&map, format!("key{i}").as_bytes(), i));
        }

        let mut survivors = 0;
        for index in 0..map.bucket_count() {
            map.gc_bucket(index, |_, v| {
                if *v % 2 == 0 {
                    true
                } else {
                    *v += 100;
                    false
                }
            });
        }
        map.for_each(|_, v| {
            assert!(*v >= 100);
            survivors += 1;
        });
        assert_eq!(survivors, 16);
    }

    #[test]
    fn duplicate_keys_never_coexist() {
        let map = BucketMap::new(2);
        assert!(insert(&map, b"dup", 1));
        // second create attempt lands on the handler instead.
        let handled = map.apply(b"dup", |_, v| *v == 1, Some(|_: &HashKey| Some(2u64)));
        assert!(handled);

        let mut count = 0;
        map.for_each(|key, _| {
            if *key == *b"dup".as_slice() {
                count += 1;
            }
        });
        assert_eq!(count, 1);
    }
}
