//! Interfaces a table consumes from the collector and the host object model.
//!
//! Tables never reach for ambient collector state. Everything they need
//! (cycle phase, mark colors, the marking visitor, memory accounting) is
//! passed in explicitly through these traits, and the host's notion of
//! which values may be held weakly is a predicate rather than a type
//! hierarchy.

use crate::error::{AllocError, WeakMapError};
use crate::value::{CellId, Region, Value, WeakRef};

/// Tricolor mark state of a cell.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Color {
    /// Not (yet) known reachable this cycle.
    White,
    /// Known reachable, children not yet scanned.
    Gray,
    /// Reachable and fully scanned.
    Black,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Phase {
    Idle,
    Marking,
    Sweeping,
}

/// Bookkeeping category for memory attributed to a cell.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemoryUse {
    WeakMapTable,
}

/// Marking visitor handed to `EphemeronTable::trace`.
pub trait Tracer {
    /// Whether `cell` has been marked (gray or black) in the current cycle.
    fn is_marked(&self, cell: CellId) -> bool;

    /// Mark `value` reachable. Returns true if a previously white cell was
    /// marked by this call; primitives and already-marked cells return false.
    fn mark(&mut self, value: &Value) -> bool;

    /// Record that `value` must be marked once `key` is. Used for entries
    /// whose key is not yet known reachable.
    fn defer_ephemeron(&mut self, key: WeakRef, value: Value);
}

/// Collector state a table consults from the mutator side.
pub trait CollectorContext: Tracer {
    fn phase(&self) -> Phase;

    /// Mark color of `cell`. Unknown cells read as white.
    fn color(&self, cell: CellId) -> Color;

    fn is_marking(&self) -> bool {
        self.phase() == Phase::Marking
    }

    /// Make `value` safe to hand to the mutator: during marking it is
    /// marked, otherwise a stale gray mark is cleared to black.
    fn expose_to_active(&mut self, value: &Value);

    /// Attribute `bytes` of storage to `owner`, or refuse.
    fn reserve_memory(
        &mut self,
        owner: CellId,
        bytes: usize,
        kind: MemoryUse,
    ) -> Result<(), AllocError>;

    fn release_memory(&mut self, owner: CellId, bytes: usize, kind: MemoryUse);
}

/// Predicates supplied by the host object model.
pub trait ObjectModel {
    /// Whether `value` may be used as a weak map key.
    fn is_weakly_holdable(&self, value: &Value) -> bool;

    fn region_of(&self, cell: CellId) -> Option<Region>;

    /// Whether a table living in `owner` may use a key in `target`. Keys
    /// must share the table's compartment.
    fn key_region_compatible(&self, owner: Region, target: Region) -> bool {
        target.is_atoms() || target == owner
    }

    /// Whether a table living in `owner` may hold a value in `target`.
    /// Values only need to share the table's zone.
    fn value_region_compatible(&self, owner: Region, target: Region) -> bool {
        target.is_atoms() || target.zone == owner.zone
    }

    fn is_callable(&self, value: &Value) -> bool;

    /// `value` as a key, if the host permits holding it weakly.
    fn weak_ref(&self, value: &Value) -> Option<WeakRef> {
        if self.is_weakly_holdable(value) {
            WeakRef::from_value(value)
        } else {
            None
        }
    }

    /// The error reported for a key that cannot be held weakly.
    fn invalid_key_error(&self, value: &Value) -> WeakMapError {
        WeakMapError::InvalidKey(format!("{} ({})", value, value.type_name()))
    }
}
