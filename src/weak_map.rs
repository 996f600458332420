//! WeakMap: the public operations, translated onto a heap-owned table.
//!
//! A `WeakMap` is a copyable handle to a weak map object on a `Heap`. The
//! object owns at most one `EphemeronTable`, allocated by the first write.
//! Read-only operations on a map that has never been written report the
//! key as absent. Keys that cannot be held weakly are never present, so
//! `has`/`get`/`delete` answer false/undefined for them instead of failing.
//!
//! The handle does not root the map. Keep the map value reachable (a root
//! or a field of a reachable object) for as long as it is used; operating
//! on a collected map panics on write and reads as empty.

use crate::barrier;
use crate::collector::ObjectModel;
use crate::error::WeakMapError;
use crate::heap::Heap;
use crate::table::{EphemeronTable, RemovalPolicy};
use crate::value::{CellId, Region, Value, WeakRef};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct WeakMap(CellId);

impl WeakMap {
    /// Allocate an empty weak map in the heap's default region.
    pub fn new(heap: &mut Heap) -> Self {
        let region = heap.default_region();
        Self::new_in(heap, region)
    }

    pub fn new_in(heap: &mut Heap, region: Region) -> Self {
        WeakMap(heap.alloc_weak_map(region))
    }

    /// Allocate a weak map whose table consults `policy` before dropping
    /// entries with dead keys. The table is allocated eagerly.
    pub fn with_removal_policy(
        heap: &mut Heap,
        policy: Box<dyn RemovalPolicy>,
    ) -> Result<Self, WeakMapError> {
        let region = heap.default_region();
        let map = Self::new_in(heap, region);
        let capacity = heap.config().initial_table_capacity;
        let table = EphemeronTable::create(map.0, region, capacity, heap.collector_mut())?
            .with_policy(policy);
        heap.install_table(map.0, table);
        Ok(map)
    }

    /// Build a map from `(key, value)` pairs, stopping at the first pair
    /// that cannot be stored.
    pub fn from_entries<I>(heap: &mut Heap, entries: I) -> Result<Self, WeakMapError>
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        let map = Self::new(heap);
        for (key, value) in entries {
            map.set(heap, &key, value)?;
        }
        Ok(map)
    }

    /// Receiver check: `value` must be a weak map object.
    pub fn from_value(heap: &Heap, value: &Value) -> Result<Self, WeakMapError> {
        match value {
            Value::Object(id) if heap.is_weak_map(value) => Ok(WeakMap(*id)),
            _ => Err(WeakMapError::IncompatibleReceiver(format!(
                "{value} ({})",
                value.type_name()
            ))),
        }
    }

    pub fn id(&self) -> CellId {
        self.0
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0)
    }

    fn lookup(&self, heap: &mut Heap, key: &WeakRef) -> Option<Value> {
        let (table, gc) = heap.table_and_collector(self.0);
        table.and_then(|t| t.lookup(key, gc))
    }

    pub fn has(&self, heap: &Heap, key: &Value) -> bool {
        let Some(key) = heap.collector().weak_ref(key) else {
            return false;
        };
        heap.table(self.0).is_some_and(|t| t.has(&key))
    }

    /// The value stored for `key`, or `Undefined`.
    pub fn get(&self, heap: &mut Heap, key: &Value) -> Value {
        let Some(key) = heap.collector().weak_ref(key) else {
            return Value::Undefined;
        };
        self.lookup(heap, &key).unwrap_or_default()
    }

    /// Remove the entry for `key`. Unbarriered: the value is discarded.
    pub fn delete(&self, heap: &mut Heap, key: &Value) -> bool {
        let Some(key) = heap.collector().weak_ref(key) else {
            return false;
        };
        let (table, _) = heap.table_and_collector(self.0);
        table.is_some_and(|t| t.remove(&key))
    }

    /// Store `key -> value`, returning the map for chaining.
    pub fn set(self, heap: &mut Heap, key: &Value, value: Value) -> Result<Self, WeakMapError> {
        let key = require_key(heap, key)?;
        let (table, gc) = heap.ensure_table(self.0)?;
        table.put(key, value, gc)?;
        Ok(self)
    }

    /// Return the stored value for `key`, storing `value` first if absent.
    pub fn get_or_insert(
        &self,
        heap: &mut Heap,
        key: &Value,
        value: Value,
    ) -> Result<Value, WeakMapError> {
        let key = require_key(heap, key)?;
        let (table, gc) = heap.ensure_table(self.0)?;
        table.get_or_insert(key, value, gc)
    }

    /// Return the stored value for `key`, or call `callback(key)` and store
    /// its result.
    ///
    /// `callback` must be callable or `Undefined`; anything else fails with
    /// `NotCallable` before the key is looked at. An `Undefined` callback
    /// only fails if it would actually be called. The callback runs with no
    /// entry in place and may do anything with the heap, including writing
    /// the same key; the value it returns is stored afterwards regardless,
    /// so the last insert wins.
    pub fn get_or_insert_computed(
        &self,
        heap: &mut Heap,
        key: &Value,
        callback: &Value,
    ) -> Result<Value, WeakMapError> {
        if !callback.is_undefined() && !heap.collector().is_callable(callback) {
            return Err(WeakMapError::NotCallable(callback.to_string()));
        }
        let callback = callback.clone();
        self.get_or_insert_with(heap, key, |heap, key| {
            if callback.is_undefined() {
                return Err(WeakMapError::NotCallable(callback.to_string()));
            }
            heap.call(&callback, key.clone())
                .map_err(WeakMapError::CallbackFailure)
        })
    }

    /// `get_or_insert_computed` with a Rust closure as the callback.
    pub fn get_or_insert_with<F>(
        &self,
        heap: &mut Heap,
        key: &Value,
        compute: F,
    ) -> Result<Value, WeakMapError>
    where
        F: FnOnce(&mut Heap, &Value) -> Result<Value, WeakMapError>,
    {
        let weak_key = require_key(heap, key)?;
        if let Some(existing) = self.lookup(heap, &weak_key) {
            return Ok(existing);
        }

        // The callback may collect; keep the key and the map alive across it.
        let map = self.as_value();
        heap.add_root(key);
        heap.add_root(&map);
        let computed = compute(heap, key);
        heap.remove_root(&map);
        heap.remove_root(key);
        let value = computed?;

        let (table, gc) = heap.ensure_table(self.0)?;
        table.put(weak_key, value.clone(), gc)?;
        Ok(value)
    }

    /// Current keys, in no particular order. For debugging only: the
    /// result changes whenever a collection runs.
    pub fn nondeterministic_keys(&self, heap: &mut Heap) -> Vec<Value> {
        let (table, gc) = heap.table_and_collector(self.0);
        let Some(table) = table else {
            return Vec::new();
        };
        table
            .snapshot_keys()
            .into_iter()
            .map(|k| {
                let v = k.to_value();
                barrier::read_barrier(gc, &v);
                v
            })
            .collect()
    }

    pub fn len(&self, heap: &Heap) -> usize {
        heap.table(self.0).map_or(0, EphemeronTable::len)
    }

    pub fn is_empty(&self, heap: &Heap) -> bool {
        self.len(heap) == 0
    }

    /// Bytes of table storage, not counting the map object itself.
    pub fn size_of_excluding_this(&self, heap: &Heap) -> usize {
        heap.table(self.0)
            .map_or(0, EphemeronTable::size_of_excluding_this)
    }
}

fn require_key(heap: &Heap, key: &Value) -> Result<WeakRef, WeakMapError> {
    let model = heap.collector();
    model
        .weak_ref(key)
        .ok_or_else(|| model.invalid_key_error(key))
}

pub fn is_weak_map_object(heap: &Heap, value: &Value) -> bool {
    heap.is_weak_map(value)
}

/// Embedder read of `map[key]`.
pub fn get_weak_map_entry(heap: &mut Heap, map: &Value, key: &Value) -> Result<Value, WeakMapError> {
    let map = WeakMap::from_value(heap, map)?;
    Ok(map.get(heap, key))
}

/// Embedder write of `map[key] = value`.
pub fn set_weak_map_entry(
    heap: &mut Heap,
    map: &Value,
    key: &Value,
    value: Value,
) -> Result<(), WeakMapError> {
    let map = WeakMap::from_value(heap, map)?;
    map.set(heap, key, value).map(drop)
}

/// Keys of `map` if it is a weak map object, `None` otherwise.
pub fn nondeterministic_get_weak_map_keys(heap: &mut Heap, map: &Value) -> Option<Vec<Value>> {
    let map = WeakMap::from_value(heap, map).ok()?;
    Some(map.nondeterministic_keys(heap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_allocated_on_first_write() {
        let mut heap = Heap::new();
        let map = WeakMap::new(&mut heap);
        let k = heap.alloc_object();
        assert_eq!(heap.table_count(), 0);
        assert!(!map.has(&heap, &k));
        assert_eq!(map.get(&mut heap, &k), Value::Undefined);
        assert!(!map.delete(&mut heap, &k));
        assert_eq!(map.size_of_excluding_this(&heap), 0);
        assert_eq!(heap.table_count(), 0);

        map.set(&mut heap, &k, Value::from(1)).unwrap();
        assert_eq!(heap.table_count(), 1);
        assert_eq!(map.len(&heap), 1);
        assert!(map.size_of_excluding_this(&heap) > 0);
    }

    #[test]
    fn invalid_key_does_not_allocate() {
        let mut heap = Heap::new();
        let map = WeakMap::new(&mut heap);
        let err = map.set(&mut heap, &Value::from(1), Value::Null).unwrap_err();
        assert!(matches!(err, WeakMapError::InvalidKey(_)));
        assert_eq!(heap.table_count(), 0);
    }

    #[test]
    fn receiver_check() {
        let mut heap = Heap::new();
        let map = WeakMap::new(&mut heap);
        let plain = heap.alloc_object();
        assert_eq!(WeakMap::from_value(&heap, &map.as_value()), Ok(map));
        assert!(matches!(
            WeakMap::from_value(&heap, &plain),
            Err(WeakMapError::IncompatibleReceiver(_))
        ));
        assert!(matches!(
            WeakMap::from_value(&heap, &Value::Null),
            Err(WeakMapError::IncompatibleReceiver(_))
        ));
        assert!(is_weak_map_object(&heap, &map.as_value()));
        assert!(!is_weak_map_object(&heap, &plain));
    }

    #[test]
    fn embedder_entry_points() {
        let mut heap = Heap::new();
        let map = WeakMap::new(&mut heap).as_value();
        let k = heap.alloc_object();
        set_weak_map_entry(&mut heap, &map, &k, Value::from("v")).unwrap();
        assert_eq!(get_weak_map_entry(&mut heap, &map, &k), Ok(Value::from("v")));
        assert_eq!(nondeterministic_get_weak_map_keys(&mut heap, &map), Some(vec![k]));
        assert_eq!(nondeterministic_get_weak_map_keys(&mut heap, &Value::from(1)), None);
        assert!(get_weak_map_entry(&mut heap, &Value::Null, &Value::Null).is_err());
    }

    #[test]
    fn closure_variant_sees_key() {
        let mut heap = Heap::new();
        let map = WeakMap::new(&mut heap);
        let k = heap.alloc_object();
        let v = map
            .get_or_insert_with(&mut heap, &k, |_, key| {
                assert!(key.is_object());
                Ok(Value::from(7))
            })
            .unwrap();
        assert_eq!(v, Value::from(7));
        let again = map
            .get_or_insert_with(&mut heap, &k, |_, _| panic!("must not run"))
            .unwrap();
        assert_eq!(again, Value::from(7));
    }
}
