//! Barriers run around table reads and writes.
//!
//! Writes: an incremental collector that has already scanned a table will
//! not look at it again this cycle, so a link added afterwards has to be
//! reported to the collector before it is stored.
//!
//! Reads: a value handed back to the mutator must not carry a mark that
//! lets the collector treat it as dead. `expose_to_active` fixes that up.
//!
//! Removal is exempt from both. `EphemeronTable::remove` finds the entry
//! with an unbarriered lookup because the value is dropped, never returned.

use crate::collector::{Color, CollectorContext};
use crate::value::{CellId, Value, WeakRef};

/// Post-write barrier for linking `key -> value` into the table owned by
/// `owner`. Must run before the entry is stored.
///
/// Only fires while marking and only once the owner has been scanned
/// (black). If the key is already marked the value is queued for marking
/// now; otherwise the pair is recorded so the value is marked if the key
/// turns out to be reachable later in the cycle.
pub fn post_write_barrier<C>(cx: &mut C, owner: CellId, key: &WeakRef, value: &Value)
where
    C: CollectorContext + ?Sized,
{
    if !cx.is_marking() || cx.color(owner) != Color::Black || value.cell().is_none() {
        return;
    }
    if cx.is_marked(key.cell()) {
        if cx.mark(value) {
            tracing::trace!(?owner, ?key, "write barrier marked value");
        }
    } else {
        tracing::trace!(?owner, ?key, "write barrier deferred value behind key");
        cx.defer_ephemeron(*key, value.clone());
    }
}

/// Read barrier for a value about to be returned to the mutator.
#[inline]
pub fn read_barrier<C>(cx: &mut C, value: &Value)
where
    C: CollectorContext + ?Sized,
{
    if value.cell().is_some() {
        cx.expose_to_active(value);
    }
}
