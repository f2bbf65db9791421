//! The public map.
//!
//! [`SplitMap`] ties the pieces together: a key's hash selects a bucket under
//! the current capacity exponent, the directory resolves that bucket to its
//! sentinel, and the list does the rest starting from there.
//!
//! Growth only publishes a wider exponent. Nothing is rehashed or moved;
//! buckets that become addressable get their sentinels linked lazily the
//! first time somebody touches them.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};
use crossbeam_utils::CachePadded;
use kovan::{Guard, pin};
use portable_atomic::AtomicI64;

use crate::bits::{self, MAX_BITS};
use crate::directory::Directory;
use crate::error::TableError;
use crate::key::Key;
use crate::list::{Node, Resident, SplitList};

/// Capacity exponent of a freshly created map (32 buckets).
pub const DEFAULT_INITIAL_BITS: u32 = 5;

/// Load factor beyond which the map doubles its capacity.
pub const DEFAULT_GROWTH_RATIO: f64 = 0.6;

/// Lock-free split-ordered hash map.
///
/// All operations take `&self` and may be called from any number of threads
/// at once. Reads and writes never block; memory of removed entries is
/// reclaimed through kovan.
///
/// Operations return `Err` only when the key type reports a
/// [`TableError::TypeMismatch`] while comparing keys.
///
/// # Examples
///
/// ```
/// use kovan_splitmap::SplitMap;
///
/// let map = SplitMap::new();
/// map.put("vi", 500).unwrap();
/// map.put("emacs", 600).unwrap();
///
/// assert_eq!(map.get(&"vi").unwrap(), Some(500));
/// assert!(map.delete(&"emacs").unwrap());
/// assert_eq!(map.get(&"emacs").unwrap(), None);
/// ```
pub struct SplitMap<K, V> {
    list: SplitList<K, V>,
    directory: Directory<K, V>,
    bits: CachePadded<AtomicU32>,
    /// Approximate number of live entries. May dip below zero transiently
    /// when a delete overtakes the increment of the matching insert.
    count: CachePadded<AtomicI64>,
    growth_ratio: f64,
    max_bits: u32,
}

/// Configures and builds a [`SplitMap`].
///
/// # Examples
///
/// ```
/// use kovan_splitmap::SplitMap;
///
/// let map: SplitMap<u32, u64> = SplitMap::<u32, u64>::builder()
///     .initial_bits(8)
///     .growth_ratio(0.75)
///     .max_bits(20)
///     .build();
/// assert_eq!(map.capacity(), 256);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SplitMapBuilder {
    initial_bits: u32,
    growth_ratio: f64,
    max_bits: u32,
}

impl Default for SplitMapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SplitMapBuilder {
    /// Creates a builder with the default settings.
    pub fn new() -> Self {
        Self {
            initial_bits: DEFAULT_INITIAL_BITS,
            growth_ratio: DEFAULT_GROWTH_RATIO,
            max_bits: MAX_BITS,
        }
    }

    /// Sets the initial capacity exponent. Clamped to `max_bits`.
    pub fn initial_bits(mut self, bits: u32) -> Self {
        self.initial_bits = bits;
        self
    }

    /// Sets the load factor that triggers growth.
    pub fn growth_ratio(mut self, ratio: f64) -> Self {
        self.growth_ratio = ratio;
        self
    }

    /// Sets the largest capacity exponent growth may reach.
    pub fn max_bits(mut self, bits: u32) -> Self {
        self.max_bits = bits;
        self
    }

    /// Builds the map.
    ///
    /// # Panics
    ///
    /// Panics if the growth ratio is not a positive finite number or if
    /// `max_bits` exceeds [`MAX_BITS`].
    pub fn build<K, V>(self) -> SplitMap<K, V>
    where
        K: Key,
        V: Send + Sync + 'static,
    {
        assert!(
            self.growth_ratio.is_finite() && self.growth_ratio > 0.0,
            "growth ratio must be positive and finite, got {}",
            self.growth_ratio
        );
        assert!(
            self.max_bits <= MAX_BITS,
            "max_bits must be at most {}, got {}",
            MAX_BITS,
            self.max_bits
        );

        let bits = self.initial_bits.min(self.max_bits);
        let list = SplitList::new();
        let directory = Directory::new(1 << bits, list.head());

        SplitMap {
            list,
            directory,
            bits: CachePadded::new(AtomicU32::new(bits)),
            count: CachePadded::new(AtomicI64::new(0)),
            growth_ratio: self.growth_ratio,
            max_bits: self.max_bits,
        }
    }
}

impl<K, V> SplitMap<K, V>
where
    K: Key,
    V: Send + Sync + 'static,
{
    /// Creates an empty map with 32 buckets and a growth ratio of 0.6.
    pub fn new() -> Self {
        SplitMapBuilder::new().build()
    }

    /// Creates an empty map with `2^bits` buckets.
    pub fn with_bits(bits: u32) -> Self {
        SplitMapBuilder::new().initial_bits(bits).build()
    }

    /// Returns a builder for custom settings.
    pub fn builder() -> SplitMapBuilder {
        SplitMapBuilder::new()
    }

    /// Current capacity exponent.
    pub fn bits(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    /// Number of addressable buckets.
    pub fn capacity(&self) -> usize {
        1 << self.bits()
    }

    /// Load factor that triggers growth.
    pub fn growth_ratio(&self) -> f64 {
        self.growth_ratio
    }

    /// Returns the number of entries in the map.
    ///
    /// Note: This is an approximate count in concurrent scenarios.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed).max(0) as usize
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buckets whose sentinel is currently cached in the
    /// directory. Buckets are materialised by the first write that touches
    /// them, not on growth or by lookups.
    pub fn initialized_buckets(&self) -> usize {
        let guard = pin();
        self.directory.initialized(&guard)
    }

    /// Resolves the bucket sentinel for `hash` under the current capacity.
    #[inline]
    fn bucket<'g>(&'g self, hash: u32, guard: &'g Guard) -> Result<&'g Node<K, V>, TableError> {
        let idx = hash & bits::mask(self.bits());
        self.directory.get_or_init(&self.list, idx, guard)
    }

    fn store<R>(
        &self,
        key: K,
        value: V,
        replaced: impl FnOnce(&V) -> R,
    ) -> Result<Option<R>, TableError> {
        let hash = key.key_hash();
        let guard = pin();
        let bits = self.bits();
        let idx = hash & bits::mask(bits);
        let bucket = self.directory.get_or_init(&self.list, idx, &guard)?;

        match self.list.insert(bucket, Node::data(hash, key, value), &guard)? {
            Resident::Replaced(old) => Ok(Some(replaced(old))),
            Resident::Linked(_) => {
                let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
                if count as f64 > self.growth_ratio * (1u64 << bits) as f64 {
                    self.grow(bits, &guard);
                }
                Ok(None)
            }
            Resident::Existing(_) => unreachable!("data node resolved to a sentinel"),
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// This operation is lock-free and can be called concurrently.
    pub fn put(&self, key: K, value: V) -> Result<(), TableError> {
        self.store(key, value, |_| ()).map(|_| ())
    }

    /// Inserts a key-value pair into the map.
    ///
    /// If the key already exists, the old value is replaced and returned.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>, TableError>
    where
        V: Clone,
    {
        self.store(key, value, V::clone)
    }

    /// Finds the live value for `key` without materialising buckets.
    fn lookup<'g>(&'g self, key: &K, guard: &'g Guard) -> Result<Option<&'g V>, TableError> {
        let hash = key.key_hash();
        let idx = hash & bits::mask(self.bits());
        let from = self.directory.nearest(&self.list, idx, guard);
        self.list.find(from, bits::data_order(hash), key, guard)
    }

    /// Gets a copy of the value associated with a key.
    ///
    /// Lookups never link sentinels; an uninitialised bucket is searched
    /// from its closest initialised ancestor.
    pub fn get(&self, key: &K) -> Result<Option<V>, TableError>
    where
        V: Clone,
    {
        let guard = pin();
        Ok(self.lookup(key, &guard)?.cloned())
    }

    /// Returns true if the map contains the specified key.
    pub fn contains_key(&self, key: &K) -> Result<bool, TableError> {
        let guard = pin();
        Ok(self.lookup(key, &guard)?.is_some())
    }

    fn unlink<R>(&self, key: &K, removed: impl FnOnce(&V) -> R) -> Result<Option<R>, TableError> {
        let hash = key.key_hash();
        let guard = pin();
        let bucket = self.bucket(hash, &guard)?;

        match self.list.delete(bucket, bits::data_order(hash), key, &guard)? {
            Some(value) => {
                self.count.fetch_sub(1, Ordering::Relaxed);
                Ok(Some(removed(value)))
            }
            None => Ok(None),
        }
    }

    /// Removes a key from the map. Returns whether it was present.
    ///
    /// Capacity never shrinks.
    pub fn delete(&self, key: &K) -> Result<bool, TableError> {
        Ok(self.unlink(key, |_| ())?.is_some())
    }

    /// Removes a key from the map, returning the value if it existed.
    pub fn remove(&self, key: &K) -> Result<Option<V>, TableError>
    where
        V: Clone,
    {
        self.unlink(key, V::clone)
    }

    /// Doubles the capacity, unless `observed` is stale or at the ceiling.
    ///
    /// Concurrent callers that observed the same exponent coalesce: only one
    /// CAS succeeds, the rest see the advanced value and return.
    fn grow(&self, observed: u32, guard: &Guard) {
        if observed >= self.max_bits {
            return;
        }

        if self
            .bits
            .compare_exchange(observed, observed + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let len = 1usize << (observed + 1);
            self.directory.ensure_len(len, guard);
            debug_assert!(self.directory.len(guard) >= len);
        }
    }

    /// Returns an iterator over the map entries.
    ///
    /// Entries come out in split order, which is neither key order nor
    /// insertion order. Yields `(K, V)` clones; entries inserted or removed
    /// concurrently may or may not be observed.
    pub fn iter(&self) -> Iter<'_, K, V>
    where
        K: Clone,
        V: Clone,
    {
        Iter {
            current: self.list.head(),
            guard: pin(),
            _map: PhantomData,
        }
    }
}

impl<K, V> Default for SplitMap<K, V>
where
    K: Key,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: all shared state is reached through atomics and kovan guards; keys
// are `Send + Sync` by the `Key` bound.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for SplitMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for SplitMap<K, V> {}

/// Iterator over [`SplitMap`] entries.
pub struct Iter<'a, K, V> {
    current: *const Node<K, V>,
    guard: Guard,
    _map: PhantomData<&'a SplitMap<K, V>>,
}

impl<K, V> Iterator for Iter<'_, K, V>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: `current` is the head (owned by the map we borrow) or was
        // reached under `self.guard`, which keeps it from being freed.
        while let Some(node) = unsafe { self.current.as_ref() } {
            self.current = node
                .successor(&self.guard)
                .map_or(core::ptr::null(), |next| next as *const _);

            if let Some(entry) = node.entry() {
                if let Some(value) = entry.value(&self.guard) {
                    return Some((entry.key().clone(), value.clone()));
                }
            }
        }
        None
    }
}

impl<'a, K, V> IntoIterator for &'a SplitMap<K, V>
where
    K: Key + Clone,
    V: Clone + Send + Sync + 'static,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use alloc::vec::Vec;

    #[test]
    fn test_put_and_get() {
        let map = SplitMap::new();
        map.put(1u32, 100).unwrap();
        assert_eq!(map.get(&1).unwrap(), Some(100));
        assert_eq!(map.get(&2).unwrap(), None);
    }

    #[test]
    fn test_insert_replace() {
        let map = SplitMap::new();
        assert_eq!(map.insert(1u32, 100).unwrap(), None);
        assert_eq!(map.insert(1, 200).unwrap(), Some(100));
        assert_eq!(map.get(&1).unwrap(), Some(200));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_defaults() {
        let map: SplitMap<u32, u32> = SplitMap::new();
        assert_eq!(map.bits(), DEFAULT_INITIAL_BITS);
        assert_eq!(map.capacity(), 32);
        assert_eq!(map.growth_ratio(), DEFAULT_GROWTH_RATIO);
        assert!(map.is_empty());
    }

    #[test]
    fn test_grows_past_ratio() {
        let map = SplitMap::new();
        // 0.6 * 32 = 19.2, so the 20th entry doubles the capacity.
        for i in 0..19u32 {
            map.put(i, i).unwrap();
        }
        assert_eq!(map.bits(), 5);
        map.put(19, 19).unwrap();
        assert_eq!(map.bits(), 6);

        for i in 0..20u32 {
            assert_eq!(map.get(&i).unwrap(), Some(i));
        }
    }

    #[test]
    fn test_grow_coalesces_stale_requests() {
        let map: SplitMap<u32, u32> = SplitMap::new();
        let guard = pin();
        map.grow(5, &guard);
        map.grow(5, &guard);
        assert_eq!(map.bits(), 6);
        map.grow(6, &guard);
        assert_eq!(map.bits(), 7);
        assert_eq!(map.capacity(), 128);
    }

    #[test]
    fn test_growth_stops_at_max_bits() {
        let map: SplitMap<u32, u32> = SplitMap::<u32, u32>::builder().initial_bits(2).max_bits(3).build();
        for i in 0..100u32 {
            map.put(i, i).unwrap();
        }
        assert_eq!(map.bits(), 3);
        for i in 0..100u32 {
            assert_eq!(map.get(&i).unwrap(), Some(i));
        }
    }

    #[test]
    fn test_initial_bits_clamped() {
        let map: SplitMap<u32, u32> = SplitMap::<u32, u32>::builder().initial_bits(12).max_bits(4).build();
        assert_eq!(map.bits(), 4);
    }

    #[test]
    #[should_panic(expected = "growth ratio")]
    fn test_rejects_bad_ratio() {
        let _map: SplitMap<u32, u32> = SplitMap::<u32, u32>::builder().growth_ratio(0.0).build();
    }

    #[test]
    #[should_panic(expected = "max_bits")]
    fn test_rejects_wide_max_bits() {
        let _map: SplitMap<u32, u32> = SplitMap::<u32, u32>::builder().max_bits(32).build();
    }

    #[test]
    fn test_delete_and_remove() {
        let map = SplitMap::new();
        map.put(String::from("a"), 1).unwrap();
        map.put(String::from("b"), 2).unwrap();

        assert!(map.delete(&String::from("a")).unwrap());
        assert!(!map.delete(&String::from("a")).unwrap());
        assert_eq!(map.remove(&String::from("b")).unwrap(), Some(2));
        assert_eq!(map.remove(&String::from("b")).unwrap(), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_buckets_materialise_lazily() {
        let map: SplitMap<u32, u32> = SplitMap::new();
        assert_eq!(map.initialized_buckets(), 1);

        map.put(3, 3).unwrap();
        // Bucket 3 needs its parent, bucket 1.
        assert_eq!(map.initialized_buckets(), 3);

        let guard = pin();
        map.grow(5, &guard);
        assert_eq!(map.initialized_buckets(), 3);
    }

    #[test]
    fn test_iter_skips_sentinels_and_deleted() {
        let map = SplitMap::new();
        for i in 0..10u32 {
            map.put(i, i * 2).unwrap();
        }
        map.delete(&4).unwrap();

        let mut entries: Vec<_> = map.iter().collect();
        entries.sort();
        let expected: Vec<_> = (0..10u32).filter(|i| *i != 4).map(|i| (i, i * 2)).collect();
        assert_eq!(entries, expected);
    }

    #[test]
    fn test_lookups_do_not_materialise_buckets() {
        let map: SplitMap<u32, u32> = SplitMap::with_bits(10);
        assert_eq!(map.get(&1023).unwrap(), None);
        assert!(!map.contains_key(&77).unwrap());
        assert_eq!(map.initialized_buckets(), 1);
    }

    #[test]
    fn test_lookup_through_ancestor_after_growth() {
        let map = SplitMap::with_bits(1);
        map.put(3u32, 30).unwrap();
        assert_eq!(map.initialized_buckets(), 2);

        let guard = pin();
        map.grow(1, &guard);
        drop(guard);

        // Bucket 3 exists now but has no sentinel; bucket 1 covers it.
        assert_eq!(map.get(&3).unwrap(), Some(30));
        assert_eq!(map.initialized_buckets(), 2);

        // Writes do link the finer bucket.
        assert!(map.delete(&3).unwrap());
        assert_eq!(map.initialized_buckets(), 3);
    }
}
