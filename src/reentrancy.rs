//! Debug-only critical-section tracker for ephemeron tables.
//!
//! A table's structural operations (trace, sweep, put, remove, snapshot)
//! run as critical sections. The only foreign code that can execute inside
//! one is a table's `RemovalPolicy`; if that code re-enters the same table,
//! debug builds panic naming both sections. Release builds compile this to
//! nothing.

#[cfg(debug_assertions)]
use core::cell::Cell;
use core::marker::PhantomData;

/// Per-table section tracker. Guard a critical section with
/// `let _g = self.sections.enter("sweep");`.
#[derive(Debug)]
pub struct DebugReentrancy {
    #[cfg(debug_assertions)]
    active: Cell<Option<&'static str>>,
    // Tables are single-threaded: keep !Send + !Sync.
    _nosend: PhantomData<*mut ()>,
}

impl DebugReentrancy {
    pub const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            active: Cell::new(None),
            _nosend: PhantomData,
        }
    }

    /// Enter the named section. In debug builds, panics if another section
    /// of the same owner is still active.
    #[inline]
    pub fn enter(&self, section: &'static str) -> ReentrancyGuard<'_> {
        #[cfg(debug_assertions)]
        {
            if let Some(outer) = self.active.get() {
                panic!("reentrant `{section}` on ephemeron table while `{outer}` is active");
            }
            self.active.set(Some(section));
            ReentrancyGuard { owner: self }
        }

        #[cfg(not(debug_assertions))]
        {
            let _ = section;
            ReentrancyGuard { _z: PhantomData }
        }
    }

    /// Name of the section currently executing, if any (always `None` in
    /// release builds).
    pub fn active(&self) -> Option<&'static str> {
        #[cfg(debug_assertions)]
        {
            self.active.get()
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    }
}

impl Default for DebugReentrancy {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `DebugReentrancy::enter`.
pub struct ReentrancyGuard<'a> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    #[cfg(not(debug_assertions))]
    _z: PhantomData<&'a ()>,
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            debug_assert!(self.owner.active.get().is_some());
            self.owner.active.set(None);
        }
    }
}
