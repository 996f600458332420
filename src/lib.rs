//! ephemeron-table: weak-keyed tables for a tracing garbage collector,
//! plus a small reference heap that drives them.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: a weak map whose entries live exactly as long as their keys,
//!   built in layers so the collector contract can be reasoned about apart
//!   from the hashing and the public API.
//! - Layers:
//!   - HandleHashMap<K, V, S>: structural map that returns stable handles
//!     and stores each entry's hash; supports fallible reservation and
//!     `retain` for sweeping.
//!   - EphemeronTable: `WeakRef -> Value` over HandleHashMap, with the
//!     collector hooks (`trace`, `sweep`, `can_remove_entry`) and barriered
//!     mutator operations.
//!   - WeakMap: public API over a heap-owned table; validates keys and
//!     callbacks, allocates the table lazily.
//! - Seams: the table talks to its environment only through the traits in
//!   `collector` (`Tracer`, `CollectorContext`, `ObjectModel`). `Heap` is one
//!   implementation; embedders can supply their own.
//!
//! Ephemeron marking
//! - A value is marked only once its key is. `trace` marks values behind
//!   already-marked keys and parks the rest with the collector under their
//!   key (`Tracer::defer_ephemeron`). Blackening a key releases its parked
//!   values. Marking finishes when the gray stack drains, which is the
//!   fixpoint across every table, chains included.
//!
//! Incremental marking
//! - Cells allocated while marking are black.
//! - Storing into a black object marks the stored value.
//! - Storing into a black table marks the value if the key is marked and
//!   parks it behind the key otherwise (`barrier::post_write_barrier`).
//! - Values read out of a table go through `expose_to_active`, which marks
//!   them mid-cycle and clears stale gray left by an aborted cycle.
//! - Deletion skips the read barrier; the value is dropped, not returned.
//!
//! Constraints
//! - Single-threaded: no locking; `Heap` is `!Send`/`!Sync` through `Rc`.
//! - Keys compare by cell identity. Only objects and unregistered symbols
//!   may be keys.
//! - Keys must live in the table's compartment and values in its zone,
//!   unless they are in the atoms zone; anything else is a bug in the
//!   caller and panics.
//! - Table storage is accounted to the owning map before it is allocated;
//!   refusal surfaces as `WeakMapError::OutOfMemory` with the table
//!   unchanged.
//!
//! Reentrancy policy
//! - A table's critical sections (`put`, `remove`, `trace`, `sweep`,
//!   snapshot) never call host code except a `RemovalPolicy`. A debug-only
//!   guard panics on nested entry.
//! - `get_or_insert_computed` runs its callback outside any section, with
//!   the key and map rooted, and stores the result afterwards without a
//!   second lookup: if the callback stored the same key, the computed
//!   value overwrites it.
//!
//! Notes and non-goals
//! - No generational collection, no concurrent marking threads.
//! - Key enumeration is for debugging; its result depends on collection
//!   timing.

pub mod barrier;
pub mod collector;
pub mod error;
pub mod handle_hash_map;
mod handle_hash_map_proptest;
pub mod heap;
mod reentrancy;
pub mod table;
pub mod value;
pub mod weak_map;

// Public surface
pub use collector::{Color, CollectorContext, MemoryUse, ObjectModel, Phase, Tracer};
pub use error::{AllocError, HostError, WeakMapError};
pub use heap::{Collector, Heap, HeapConfig, NativeFunction, SweepStats};
pub use table::{EphemeronTable, RemovalPolicy};
pub use value::{CellId, CompartmentId, Region, Value, WeakKind, WeakRef, ZoneId};
pub use weak_map::{
    get_weak_map_entry, is_weak_map_object, nondeterministic_get_weak_map_keys,
    set_weak_map_entry, WeakMap,
};
