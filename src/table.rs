//! EphemeronTable: weak-keyed storage plus the hooks a collector drives.
//!
//! A table maps `WeakRef -> Value` by key identity. It never keeps a key
//! alive. It keeps a value alive only through `trace`, and only when the
//! collector already knows the key is reachable; otherwise the pair is
//! handed back to the collector via `Tracer::defer_ephemeron` so the value
//! gets marked if and when the key does. That deferral is what lets chains
//! (a value holding the only reference to another table's key) settle in
//! one cycle.
//!
//! Lifecycle: created lazily by the owning weak map object on first
//! insertion, swept every cycle, finalized exactly once when the owner
//! dies. Sweeping only removes entries; an empty table stays allocated
//! until its owner is finalized.
//!
//! Single-threaded, no internal locking. Mutator operations may run
//! between any two collector increments.

use crate::barrier;
use crate::collector::{CollectorContext, MemoryUse, ObjectModel, Tracer};
use crate::error::WeakMapError;
use crate::handle_hash_map::{Handle, HandleHashMap};
use crate::reentrancy::DebugReentrancy;
use crate::value::{CellId, Region, Value, WeakRef};
use core::mem;

/// Lets a specialized table veto the removal of entries whose key died.
///
/// Vetoed keys are treated as roots by `trace`, so the entry and the key
/// both survive.
pub trait RemovalPolicy {
    fn can_remove_entry(&self, key: &WeakRef) -> bool;
}

pub struct EphemeronTable {
    owner: CellId,
    region: Region,
    entries: HandleHashMap<WeakRef, Value>,
    policy: Option<Box<dyn RemovalPolicy>>,
    /// Bytes currently attributed to `owner` through the collector.
    accounted: usize,
    sections: DebugReentrancy,
}

impl core::fmt::Debug for EphemeronTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EphemeronTable")
            .field("owner", &self.owner)
            .field("len", &self.entries.len())
            .field("accounted", &self.accounted)
            .finish()
    }
}

impl EphemeronTable {
    /// Allocate a table for `owner`, attributing its storage to the owner.
    pub fn create<C>(
        owner: CellId,
        region: Region,
        initial_capacity: usize,
        cx: &mut C,
    ) -> Result<Self, WeakMapError>
    where
        C: CollectorContext + ?Sized,
    {
        let base = mem::size_of::<Self>();
        cx.reserve_memory(owner, base, MemoryUse::WeakMapTable)?;
        let mut table = Self {
            owner,
            region,
            entries: HandleHashMap::new(),
            policy: None,
            accounted: base,
            sections: DebugReentrancy::new(),
        };
        if initial_capacity > 0 {
            if let Err(e) = table.reserve(initial_capacity, cx) {
                table.finalize(cx);
                return Err(e);
            }
        }
        tracing::trace!(?owner, initial_capacity, "allocated ephemeron table");
        Ok(table)
    }

    pub fn with_policy(mut self, policy: Box<dyn RemovalPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn owner(&self) -> CellId {
        self.owner
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of entry storage, excluding the table header.
    pub fn size_of_excluding_this(&self) -> usize {
        self.entries.heap_size()
    }

    /// Membership test. No barrier: nothing escapes to the mutator.
    pub fn has(&self, key: &WeakRef) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up `key` and pass the value through the read barrier.
    pub fn lookup<C>(&self, key: &WeakRef, cx: &mut C) -> Option<Value>
    where
        C: CollectorContext + ?Sized,
    {
        let h = self.entries.find(key)?;
        let value = h.value(&self.entries)?.clone();
        barrier::read_barrier(cx, &value);
        Some(value)
    }

    /// Look up without the read barrier. Only for callers that discard the
    /// value, such as removal.
    pub fn lookup_unbarriered(&self, key: &WeakRef) -> Option<Handle> {
        self.entries.find(key)
    }

    pub fn remove_handle(&mut self, handle: Handle) -> Option<(WeakRef, Value)> {
        let _g = self.sections.enter("remove");
        self.entries.remove(handle)
    }

    /// Remove the entry for `key`, returning whether one existed.
    pub fn remove(&mut self, key: &WeakRef) -> bool {
        match self.lookup_unbarriered(key) {
            Some(h) => self.remove_handle(h).is_some(),
            None => false,
        }
    }

    /// Reserve room for `additional` entries, accounting the growth to the
    /// owner before anything is allocated. On error the table, its capacity
    /// and its accounting are unchanged.
    pub fn reserve<C>(&mut self, additional: usize, cx: &mut C) -> Result<(), WeakMapError>
    where
        C: CollectorContext + ?Sized,
    {
        let before = self.entries.heap_size();
        let after = self
            .entries
            .heap_size_after_reserve(additional)
            .ok_or(WeakMapError::OutOfMemory)?;
        if after == before {
            return Ok(());
        }
        let growth = after - before;
        cx.reserve_memory(self.owner, growth, MemoryUse::WeakMapTable)?;
        if let Err(e) = self.entries.try_reserve(additional) {
            cx.release_memory(self.owner, growth, MemoryUse::WeakMapTable);
            return Err(e.into());
        }
        self.accounted += growth;
        debug_assert_eq!(self.accounted, mem::size_of::<Self>() + self.entries.heap_size());
        Ok(())
    }

    /// Insert or overwrite `key -> value`.
    ///
    /// The key must live in the table's compartment and the value in its
    /// zone, unless either is in the atoms zone; a mismatch is a caller bug
    /// and panics.
    pub fn put<C>(&mut self, key: WeakRef, value: Value, cx: &mut C) -> Result<(), WeakMapError>
    where
        C: CollectorContext + ObjectModel + ?Sized,
    {
        self.assert_regions(&key, &value, &*cx);
        if !self.entries.contains_key(&key) {
            self.reserve(1, cx)?;
        }
        let _g = self.sections.enter("put");
        barrier::post_write_barrier(cx, self.owner, &key, &value);
        self.entries.put(key, value);
        Ok(())
    }

    /// Return the value for `key`, inserting `value` first if absent. The
    /// lookup and the insertion happen with no host code in between.
    pub fn get_or_insert<C>(
        &mut self,
        key: WeakRef,
        value: Value,
        cx: &mut C,
    ) -> Result<Value, WeakMapError>
    where
        C: CollectorContext + ObjectModel + ?Sized,
    {
        if let Some(existing) = self.lookup(&key, cx) {
            return Ok(existing);
        }
        self.put(key, value.clone(), cx)?;
        Ok(value)
    }

    /// Current keys in unspecified order. Introspection only: the result
    /// changes across collections.
    pub fn snapshot_keys(&self) -> Vec<WeakRef> {
        let _g = self.sections.enter("snapshot");
        self.entries.iter().map(|(_, k, _)| *k).collect()
    }

    pub fn can_remove_entry(&self, key: &WeakRef) -> bool {
        self.policy
            .as_ref()
            .map_or(true, |p| p.can_remove_entry(key))
    }

    /// Marking hook. Marks the value of every entry whose key is already
    /// marked and defers the rest to the collector. Returns how many cells
    /// this call newly marked.
    pub fn trace<T>(&self, trc: &mut T) -> usize
    where
        T: Tracer + ?Sized,
    {
        let _g = self.sections.enter("trace");
        let mut newly_marked = 0;
        for (_, key, value) in self.entries.iter() {
            if !self.can_remove_entry(key) && trc.mark(&key.to_value()) {
                newly_marked += 1;
            }
            if trc.is_marked(key.cell()) {
                if trc.mark(value) {
                    newly_marked += 1;
                }
            } else if value.cell().is_some() {
                trc.defer_ephemeron(*key, value.clone());
            }
        }
        newly_marked
    }

    /// Sweeping hook. Removes every entry whose key was not marked, unless
    /// the removal policy vetoes it. Returns the number removed.
    pub fn sweep<T>(&mut self, trc: &T) -> usize
    where
        T: Tracer + ?Sized,
    {
        let _g = self.sections.enter("sweep");
        let policy = &self.policy;
        let removed = self.entries.retain(|key, _| {
            trc.is_marked(key.cell()) || policy.as_ref().is_some_and(|p| !p.can_remove_entry(key))
        });
        if removed > 0 {
            tracing::trace!(owner = ?self.owner, removed, "swept ephemeron entries");
        }
        removed
    }

    /// Release the table's storage accounting. Called once, when the owner
    /// is finalized; the entries are dropped with `self`.
    pub fn finalize<C>(self, cx: &mut C)
    where
        C: CollectorContext + ?Sized,
    {
        debug_assert!(self.sections.active().is_none());
        cx.release_memory(self.owner, self.accounted, MemoryUse::WeakMapTable);
        tracing::trace!(owner = ?self.owner, entries = self.entries.len(), "finalized ephemeron table");
    }

    fn assert_regions<M>(&self, key: &WeakRef, value: &Value, model: &M)
    where
        M: ObjectModel + ?Sized,
    {
        if let Some(r) = model.region_of(key.cell()) {
            assert!(
                model.key_region_compatible(self.region, r),
                "weak map key in {r:?} linked from table in {:?}",
                self.region
            );
        }
        if let Some(r) = value.cell().and_then(|c| model.region_of(c)) {
            assert!(
                model.value_region_compatible(self.region, r),
                "weak map value in {r:?} linked from table in {:?}",
                self.region
            );
        }
    }
}
