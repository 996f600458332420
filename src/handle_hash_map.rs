//! HandleHashMap: structural identity map with stable handles.
//!
//! Storage is a `SlotMap` of entries; a `HashTable` indexes slot keys by
//! the entry's stored hash, so `K: Hash` runs once per insertion and never
//! during growth. Handles are generational and never alias an entry that
//! reuses a freed slot.
//!
//! The map keeps its own committed capacity: the number of entries both
//! structures are sized for. Growth follows a fixed doubling rule over that
//! figure, so `heap_size_after_reserve` is exact and a caller can account
//! memory before any allocation happens. Removal never lowers it.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use core::mem;
use hashbrown::{HashTable, TryReserveError};
use slotmap::{DefaultKey, SlotMap};
use std::collections::hash_map::RandomState;

/// Smallest non-zero committed capacity.
const MIN_CAPACITY: usize = 4;

/// Why `try_reserve` could not make room.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReserveError {
    /// The requested capacity or its byte size does not fit in `usize`.
    CapacityOverflow,
    Index(TryReserveError),
    Slots(std::collections::TryReserveError),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle(DefaultKey);

impl Handle {
    pub(crate) fn new(k: DefaultKey) -> Self {
        Handle(k)
    }
    pub(crate) fn raw_handle(&self) -> DefaultKey {
        self.0
    }

    pub fn key<'a, K, V, S>(&self, map: &'a HandleHashMap<K, V, S>) -> Option<&'a K>
    where
        K: Eq + Hash,
        S: BuildHasher + Clone + Default,
    {
        map.handle_key(*self)
    }

    pub fn value<'a, K, V, S>(&self, map: &'a HandleHashMap<K, V, S>) -> Option<&'a V>
    where
        K: Eq + Hash,
        S: BuildHasher + Clone + Default,
    {
        map.handle_value(*self)
    }
}

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    hash: u64,
}

pub struct HandleHashMap<K, V, S = RandomState> {
    hasher: S,
    index: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Entry<K, V>>,
    capacity: usize,
}

impl<K, V> HandleHashMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<K, V> Default for HandleHashMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over entries in `HandleHashMap`, in slot order.
pub struct Iter<'a, K, V> {
    it: slotmap::basic::Iter<'a, DefaultKey, Entry<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (Handle, &'a K, &'a V);
    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.it
            .next()
            .map(|(k, e)| (Handle::new(k), &e.key, &e.value))
    }
}

impl<K, V, S> HandleHashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone + Default,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            index: HashTable::new(),
            hasher,
            slots: SlotMap::with_key(),
            capacity: 0,
        }
    }

    /// Bytes one entry of committed capacity stands for: its index word
    /// plus its slot.
    fn entry_footprint() -> usize {
        mem::size_of::<DefaultKey>() + mem::size_of::<Entry<K, V>>()
    }

    /// Committed capacity after making room for `additional` more entries,
    /// or `None` on overflow.
    fn grown_capacity(&self, additional: usize) -> Option<usize> {
        let needed = self.len().checked_add(additional)?;
        if needed <= self.capacity {
            return Some(self.capacity);
        }
        Some(
            needed
                .max(self.capacity.saturating_mul(2))
                .max(MIN_CAPACITY),
        )
    }

    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of entries the map is sized for.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of backing storage attributed to this map: committed capacity
    /// times the per-entry footprint of index and slots.
    pub fn heap_size(&self) -> usize {
        self.capacity * Self::entry_footprint()
    }

    /// Bytes `heap_size` will report once room for `additional` more
    /// entries has been reserved, or `None` if that overflows.
    pub fn heap_size_after_reserve(&self, additional: usize) -> Option<usize> {
        self.grown_capacity(additional)?
            .checked_mul(Self::entry_footprint())
    }

    pub fn find<Q>(&self, q: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        self.index
            .find(hash, |&k| {
                self.slots
                    .get(k)
                    .map(|e| e.key.borrow() == q)
                    .unwrap_or(false)
            })
            .map(|&k| Handle::new(k))
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.find(q).is_some()
    }

    /// Make room for `additional` more entries, reporting allocation
    /// failure instead of aborting. On error the committed capacity is
    /// unchanged.
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), ReserveError> {
        let target = self
            .grown_capacity(additional)
            .filter(|cap| cap.checked_mul(Self::entry_footprint()).is_some())
            .ok_or(ReserveError::CapacityOverflow)?;
        if target == self.capacity {
            return Ok(());
        }
        let extra = target - self.len();
        let slots = &self.slots;
        self.index
            .try_reserve(extra, |&kk| slots.get(kk).map_or(0, |e| e.hash))
            .map_err(ReserveError::Index)?;
        self.slots.try_reserve(extra).map_err(ReserveError::Slots)?;
        self.capacity = target;
        Ok(())
    }

    fn grow_for_insert(&mut self) {
        let target = self
            .len()
            .max(self.capacity.saturating_mul(2))
            .max(MIN_CAPACITY);
        let extra = target - self.len();
        let slots = &self.slots;
        self.index
            .reserve(extra, |&kk| slots.get(kk).map_or(0, |e| e.hash));
        self.slots.reserve(extra);
        self.capacity = target;
    }

    /// Insert `key -> value`, or overwrite the value of an existing entry.
    /// Returns the entry's handle and the previous value, if any. An
    /// overwrite keeps the stored key and the handle.
    pub fn put(&mut self, key: K, value: V) -> (Handle, Option<V>) {
        let hash = self.make_hash(&key);
        let put = match self.index.entry(
            hash,
            |&kk| self.slots.get(kk).map(|e| e.key == key).unwrap_or(false),
            |&kk| self.slots.get(kk).map(|e| e.hash).unwrap_or(0),
        ) {
            hashbrown::hash_table::Entry::Occupied(o) => {
                let k = *o.get();
                let slot = self
                    .slots
                    .get_mut(k)
                    .expect("indexed slot must be live");
                let old = mem::replace(&mut slot.value, value);
                (Handle::new(k), Some(old))
            }
            hashbrown::hash_table::Entry::Vacant(v) => {
                let k = self.slots.insert(Entry { key, value, hash });
                let _ = v.insert(k);
                (Handle::new(k), None)
            }
        };
        if self.len() > self.capacity {
            self.grow_for_insert();
        }
        put
    }

    pub fn remove(&mut self, handle: Handle) -> Option<(K, V)> {
        let k = handle.raw_handle();
        let entry = self.slots.remove(k)?;

        self.index
            .find_entry(entry.hash, |&kk| kk == k)
            .expect("live slot must be indexed")
            .remove();

        Some((entry.key, entry.value))
    }

    /// Keep only the entries for which `keep` returns true. Returns the
    /// number of entries removed.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        let before = self.slots.len();
        self.slots.retain(|_, e| keep(&e.key, &mut e.value));
        let removed = before - self.slots.len();
        if removed > 0 {
            let slots = &self.slots;
            self.index.retain(|k| slots.contains_key(*k));
        }
        removed
    }

    pub(crate) fn handle_key(&self, h: Handle) -> Option<&K> {
        self.slots.get(h.raw_handle()).map(|e| &e.key)
    }

    pub(crate) fn handle_value(&self, h: Handle) -> Option<&V> {
        self.slots.get(h.raw_handle()).map(|e| &e.value)
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            it: self.slots.iter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[derive(Clone, Default)]
    struct ConstBuildHasher;
    struct ConstHasher;
    impl BuildHasher for ConstBuildHasher {
        type Hasher = ConstHasher;
        fn build_hasher(&self) -> Self::Hasher {
            ConstHasher
        }
    }
    impl core::hash::Hasher for ConstHasher {
        fn write(&mut self, _bytes: &[u8]) {}
        fn finish(&self) -> u64 {
            0
        }
    }

    /// Invariant: a second `put` for the same key overwrites in place,
    /// returns the old value and keeps the handle.
    #[test]
    fn put_overwrites_existing() {
        let mut m: HandleHashMap<String, i32> = HandleHashMap::new();
        let (h1, old1) = m.put("k".to_string(), 1);
        assert!(old1.is_none());
        let (h2, old2) = m.put("k".to_string(), 2);
        assert_eq!(old2, Some(1));
        assert_eq!(h1, h2);
        assert_eq!(h1.value(&m), Some(&2));
        assert_eq!(m.len(), 1);
    }

    /// Invariant: `find(k).is_some() == contains_key(k)`.
    #[test]
    fn find_contains_parity() {
        let mut m: HandleHashMap<String, i32> = HandleHashMap::new();
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            m.put((*k).to_string(), i as i32);
        }
        for k in ["a", "b", "c"] {
            assert!(m.find(k).is_some());
            assert!(m.contains_key(k));
        }
        for k in ["x", "y"] {
            assert!(m.find(k).is_none());
            assert!(!m.contains_key(k));
        }
    }

    /// Invariant: removal invalidates the handle, and a later entry that
    /// reuses the slot gets a different handle.
    #[test]
    fn stale_handle_does_not_alias_new_entry() {
        let mut m: HandleHashMap<String, i32> = HandleHashMap::new();
        let (h1, _) = m.put("old".to_string(), 1);
        let (k, v) = m.remove(h1).unwrap();
        assert_eq!((k.as_str(), v), ("old", 1));
        assert!(m.remove(h1).is_none());
        let (h2, _) = m.put("new".to_string(), 2);
        assert_ne!(h1, h2);
        assert!(h1.value(&m).is_none());
        assert!(h1.key(&m).is_none());
        assert!(!m.contains_key("old"));
    }

    /// Invariant: `retain` drops exactly the rejected entries and keeps the
    /// index consistent with the slots.
    #[test]
    fn retain_removes_rejected_entries() {
        let mut m: HandleHashMap<u32, u32> = HandleHashMap::new();
        for i in 0..20 {
            m.put(i, i * 10);
        }
        let removed = m.retain(|k, v| {
            *v += 1;
            k % 2 == 0
        });
        assert_eq!(removed, 10);
        assert_eq!(m.len(), 10);
        for i in 0..20 {
            assert_eq!(m.contains_key(&i), i % 2 == 0);
        }
        let h = m.find(&4).unwrap();
        assert_eq!(h.value(&m), Some(&41));
        // The index must not resolve removed keys after reinsertion either.
        m.put(3, 0);
        assert!(m.contains_key(&3));
        assert_eq!(m.len(), 11);
    }

    /// Invariant: lookups resolve correctly when every key collides.
    #[test]
    fn collisions_resolve_by_equality() {
        let mut m: HandleHashMap<String, i32, ConstBuildHasher> =
            HandleHashMap::with_hasher(ConstBuildHasher);
        m.put("a".to_string(), 1);
        m.put("b".to_string(), 2);
        m.put("a".to_string(), 3);
        let ha = m.find("a").unwrap();
        let hb = m.find("b").unwrap();
        assert_ne!(ha, hb);
        assert_eq!(ha.value(&m), Some(&3));
        assert_eq!(hb.value(&m), Some(&2));
        assert_eq!(m.retain(|k, _| k == "b"), 1);
        assert!(m.find("a").is_none());
    }

    /// Invariant: the projection is exactly what a reservation reports, and
    /// unreserved inserts grow capacity by doubling.
    #[test]
    fn reserve_and_heap_size() {
        let mut m: HandleHashMap<u64, u64> = HandleHashMap::new();
        assert_eq!(m.heap_size(), 0);
        let projected = m.heap_size_after_reserve(10);
        m.try_reserve(10).unwrap();
        assert_eq!(m.capacity(), 10);
        assert_eq!(projected, Some(m.heap_size()));
        for i in 0..10 {
            m.put(i, i);
        }
        assert_eq!(m.capacity(), 10);
        assert_eq!(m.heap_size_after_reserve(0), Some(m.heap_size()));

        let projected = m.heap_size_after_reserve(1);
        m.put(10, 10);
        assert_eq!(m.capacity(), 20);
        assert_eq!(projected, Some(m.heap_size()));
    }

    /// Invariant: removal keeps the committed capacity.
    #[test]
    fn removal_keeps_capacity() {
        let mut m: HandleHashMap<u64, u64> = HandleHashMap::new();
        let handles: Vec<Handle> = (0..6).map(|i| m.put(i, i).0).collect();
        let size = m.heap_size();
        for h in handles {
            m.remove(h);
        }
        assert_eq!(m.retain(|_, _| false), 0);
        assert_eq!(m.heap_size(), size);
        m.try_reserve(8).unwrap();
        assert_eq!(m.heap_size(), size);
    }

    /// Invariant: sizes that overflow `usize` are refused, not wrapped.
    #[test]
    fn oversized_reservations_are_refused() {
        let mut m: HandleHashMap<u64, u64> = HandleHashMap::new();
        m.put(1, 1);
        assert_eq!(m.heap_size_after_reserve(usize::MAX), None);
        assert_eq!(m.heap_size_after_reserve(usize::MAX / 4), None);
        assert_eq!(m.try_reserve(usize::MAX), Err(ReserveError::CapacityOverflow));
        assert_eq!(m.try_reserve(usize::MAX / 4), Err(ReserveError::CapacityOverflow));
        assert_eq!(m.capacity(), MIN_CAPACITY);
        assert_eq!(m.len(), 1);
    }

    /// Invariant: iteration yields every live entry exactly once.
    #[test]
    fn iteration_matches_contents() {
        let mut m: HandleHashMap<&'static str, i32> = HandleHashMap::new();
        for (i, k) in ["k1", "k2", "k3"].into_iter().enumerate() {
            m.put(k, i as i32);
        }
        let (h, _) = m.put("k4", 4);
        m.remove(h);
        let seen: BTreeSet<&str> = m.iter().map(|(_, k, _)| *k).collect();
        assert_eq!(seen, ["k1", "k2", "k3"].into_iter().collect());
    }
}
