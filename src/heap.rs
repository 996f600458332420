//! Reference host: a single-threaded mark/sweep heap that drives tables.
//!
//! The heap owns every cell and every weak map table. Marking is tricolor
//! and may run incrementally (`start_gc` / `gc_slice` / `finish_gc`) with
//! mutator work in between; cells allocated while marking are born black,
//! and stores into black objects go through a Dijkstra-style barrier.
//!
//! Ephemerons are resolved with an edge worklist rather than repeated
//! passes: when a table is scanned, entries whose key is not yet marked are
//! parked under the key, and blackening that key later marks the parked
//! values. Marking ends when the gray stack is empty, which is the
//! fixpoint over all tables.
//!
//! Tables live beside the cells (not inside them) so a table and the
//! collector can be borrowed at the same time.

use crate::collector::{Color, CollectorContext, MemoryUse, ObjectModel, Phase, Tracer};
use crate::error::{AllocError, HostError, WeakMapError};
use crate::table::EphemeronTable;
use crate::value::{CellId, CompartmentId, Region, Value, WeakRef, ZoneId};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Host function callable from weak map operations. It receives the heap,
/// so it may allocate, run other table operations, or collect.
pub type NativeFunction = Rc<dyn Fn(&mut Heap, Value) -> Result<Value, HostError>>;

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeapConfig {
    /// Upper bound on table storage the heap will account, in bytes.
    pub memory_limit: Option<usize>,
    /// Cells blackened per `gc_slice_default` call.
    pub slice_budget: usize,
    /// Entries reserved when a weak map allocates its table.
    pub initial_table_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            slice_budget: 64,
            initial_table_capacity: 0,
        }
    }
}

impl HeapConfig {
    pub fn with_memory_limit(mut self, limit: Option<usize>) -> Self {
        self.memory_limit = limit;
        self
    }

    pub fn with_slice_budget(mut self, budget: usize) -> Self {
        self.slice_budget = budget.max(1);
        self
    }

    pub fn with_initial_table_capacity(mut self, capacity: usize) -> Self {
        self.initial_table_capacity = capacity;
        self
    }
}

/// Outcome of one sweep.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepStats {
    pub cells_freed: usize,
    pub entries_swept: usize,
    pub tables_finalized: usize,
}

enum CellKind {
    Object,
    Function(NativeFunction),
    WeakMap,
    Symbol {
        registered: bool,
        description: Option<Rc<str>>,
    },
}

struct Cell {
    kind: CellKind,
    region: Region,
    color: Color,
    fields: Vec<Value>,
    malloc_bytes: usize,
}

/// Cell storage and marking state. Implements the collector and object
/// model interfaces tables are written against.
pub struct Collector {
    cells: SlotMap<CellId, Cell>,
    roots: SecondaryMap<CellId, usize>,
    phase: Phase,
    gray: Vec<CellId>,
    ephemeron_edges: HashMap<CellId, Vec<Value>>,
    malloc_bytes: usize,
    memory_limit: Option<usize>,
    cycles: u64,
}

impl Collector {
    fn new(memory_limit: Option<usize>) -> Self {
        Self {
            cells: SlotMap::with_key(),
            roots: SecondaryMap::new(),
            phase: Phase::Idle,
            gray: Vec::new(),
            ephemeron_edges: HashMap::new(),
            malloc_bytes: 0,
            memory_limit,
            cycles: 0,
        }
    }

    fn mark_cell(&mut self, id: CellId) -> bool {
        match self.cells.get_mut(id) {
            Some(cell) if cell.color == Color::White => {
                cell.color = Color::Gray;
                self.gray.push(id);
                true
            }
            _ => false,
        }
    }

    /// Pop one gray cell, mark its children and any values parked behind
    /// it, and return it. The caller traces the cell's table, if any.
    fn blacken_next(&mut self) -> Option<CellId> {
        let id = self.gray.pop()?;
        let children: Vec<CellId> = match self.cells.get_mut(id) {
            Some(cell) => {
                cell.color = Color::Black;
                cell.fields.iter().filter_map(Value::cell).collect()
            }
            None => Vec::new(),
        };
        for child in children {
            self.mark_cell(child);
        }
        if let Some(parked) = self.ephemeron_edges.remove(&id) {
            for value in &parked {
                self.mark(value);
            }
        }
        Some(id)
    }

    /// Blacken gray cells until none remain, ignoring tables. Tables are
    /// traced by `Heap`; this is for driving a standalone table.
    pub fn drain(&mut self) {
        while self.blacken_next().is_some() {}
    }

    /// Turn a stale gray cell and everything gray below it black.
    fn unmark_gray(&mut self, root: CellId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(cell) = self.cells.get_mut(id) else {
                continue;
            };
            if cell.color != Color::Gray {
                continue;
            }
            cell.color = Color::Black;
            stack.extend(cell.fields.iter().filter_map(Value::cell));
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Total bytes attributed to cells.
    pub fn malloc_bytes(&self) -> usize {
        self.malloc_bytes
    }

    pub fn malloc_bytes_of(&self, cell: CellId) -> usize {
        self.cells.get(cell).map_or(0, |c| c.malloc_bytes)
    }

    pub fn color_of(&self, value: &Value) -> Option<Color> {
        value.cell().and_then(|c| self.cells.get(c)).map(|c| c.color)
    }
}

impl Tracer for Collector {
    fn is_marked(&self, cell: CellId) -> bool {
        self.cells
            .get(cell)
            .is_some_and(|c| c.color != Color::White)
    }

    fn mark(&mut self, value: &Value) -> bool {
        value.cell().is_some_and(|id| self.mark_cell(id))
    }

    fn defer_ephemeron(&mut self, key: WeakRef, value: Value) {
        if value.cell().is_some() {
            self.ephemeron_edges
                .entry(key.cell())
                .or_default()
                .push(value);
        }
    }
}

impl CollectorContext for Collector {
    fn phase(&self) -> Phase {
        self.phase
    }

    fn color(&self, cell: CellId) -> Color {
        self.cells.get(cell).map_or(Color::White, |c| c.color)
    }

    fn expose_to_active(&mut self, value: &Value) {
        let Some(id) = value.cell() else {
            return;
        };
        match self.phase {
            Phase::Marking => {
                self.mark_cell(id);
            }
            _ => {
                if self.color(id) == Color::Gray {
                    self.unmark_gray(id);
                }
            }
        }
    }

    fn reserve_memory(
        &mut self,
        owner: CellId,
        bytes: usize,
        kind: MemoryUse,
    ) -> Result<(), AllocError> {
        let total = self.malloc_bytes.saturating_add(bytes);
        if self.memory_limit.is_some_and(|limit| total > limit) {
            tracing::debug!(?owner, ?kind, bytes, total, "memory limit reached");
            return Err(AllocError { requested: bytes });
        }
        self.malloc_bytes = total;
        if let Some(cell) = self.cells.get_mut(owner) {
            cell.malloc_bytes += bytes;
        }
        Ok(())
    }

    fn release_memory(&mut self, owner: CellId, bytes: usize, _kind: MemoryUse) {
        self.malloc_bytes = self.malloc_bytes.saturating_sub(bytes);
        if let Some(cell) = self.cells.get_mut(owner) {
            cell.malloc_bytes = cell.malloc_bytes.saturating_sub(bytes);
        }
    }
}

impl ObjectModel for Collector {
    fn is_weakly_holdable(&self, value: &Value) -> bool {
        match value {
            Value::Object(id) => self.cells.contains_key(*id),
            Value::Symbol(id) => matches!(
                self.cells.get(*id).map(|c| &c.kind),
                Some(CellKind::Symbol {
                    registered: false,
                    ..
                })
            ),
            _ => false,
        }
    }

    fn region_of(&self, cell: CellId) -> Option<Region> {
        self.cells.get(cell).map(|c| c.region)
    }

    fn is_callable(&self, value: &Value) -> bool {
        match value {
            Value::Object(id) => matches!(
                self.cells.get(*id).map(|c| &c.kind),
                Some(CellKind::Function(_))
            ),
            _ => false,
        }
    }
}

pub struct Heap {
    gc: Collector,
    tables: SecondaryMap<CellId, EphemeronTable>,
    symbol_registry: HashMap<Rc<str>, CellId>,
    config: HeapConfig,
    default_region: Region,
    next_zone: u32,
    next_compartment: u32,
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("cells", &self.gc.cells.len())
            .field("tables", &self.tables.len())
            .field("phase", &self.gc.phase)
            .field("malloc_bytes", &self.gc.malloc_bytes)
            .finish()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        Self {
            gc: Collector::new(config.memory_limit),
            tables: SecondaryMap::new(),
            symbol_registry: HashMap::new(),
            config,
            default_region: Region {
                zone: ZoneId(1),
                compartment: CompartmentId(1),
            },
            next_zone: 2,
            next_compartment: 2,
        }
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn collector(&self) -> &Collector {
        &self.gc
    }

    pub fn collector_mut(&mut self) -> &mut Collector {
        &mut self.gc
    }

    pub fn phase(&self) -> Phase {
        self.gc.phase
    }

    pub fn default_region(&self) -> Region {
        self.default_region
    }

    /// A fresh compartment in the default zone.
    pub fn new_compartment(&mut self) -> Region {
        let compartment = CompartmentId(self.next_compartment);
        self.next_compartment += 1;
        Region {
            zone: self.default_region.zone,
            compartment,
        }
    }

    /// A fresh zone with a single compartment.
    pub fn new_zone(&mut self) -> Region {
        let zone = ZoneId(self.next_zone);
        self.next_zone += 1;
        let compartment = CompartmentId(self.next_compartment);
        self.next_compartment += 1;
        Region { zone, compartment }
    }

    fn alloc(&mut self, kind: CellKind, region: Region) -> CellId {
        // Cells allocated during marking are born black.
        let color = if self.gc.phase == Phase::Marking {
            Color::Black
        } else {
            Color::White
        };
        self.gc.cells.insert(Cell {
            kind,
            region,
            color,
            fields: Vec::new(),
            malloc_bytes: 0,
        })
    }

    pub fn alloc_object(&mut self) -> Value {
        self.alloc_object_in(self.default_region)
    }

    pub fn alloc_object_in(&mut self, region: Region) -> Value {
        assert!(!region.is_atoms(), "objects cannot live in the atoms zone");
        Value::Object(self.alloc(CellKind::Object, region))
    }

    /// A unique symbol. Lives in the atoms zone, usable from any region.
    pub fn alloc_symbol(&mut self, description: Option<&str>) -> Value {
        let kind = CellKind::Symbol {
            registered: false,
            description: description.map(Rc::from),
        };
        Value::Symbol(self.alloc(kind, Region::ATOMS))
    }

    /// The registry symbol for `key`. Registry symbols live forever and
    /// cannot be held weakly.
    pub fn registered_symbol(&mut self, key: &str) -> Value {
        if let Some(&id) = self.symbol_registry.get(key) {
            return Value::Symbol(id);
        }
        let key: Rc<str> = Rc::from(key);
        let id = self.alloc(
            CellKind::Symbol {
                registered: true,
                description: Some(key.clone()),
            },
            Region::ATOMS,
        );
        self.symbol_registry.insert(key, id);
        self.add_root(&Value::Symbol(id));
        Value::Symbol(id)
    }

    pub fn symbol_description(&self, symbol: &Value) -> Option<Rc<str>> {
        match symbol {
            Value::Symbol(id) => match self.gc.cells.get(*id).map(|c| &c.kind) {
                Some(CellKind::Symbol { description, .. }) => description.clone(),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn alloc_function<F>(&mut self, f: F) -> Value
    where
        F: Fn(&mut Heap, Value) -> Result<Value, HostError> + 'static,
    {
        Value::Object(self.alloc(CellKind::Function(Rc::new(f)), self.default_region))
    }

    pub(crate) fn alloc_weak_map(&mut self, region: Region) -> CellId {
        self.alloc(CellKind::WeakMap, region)
    }

    pub fn is_weak_map(&self, value: &Value) -> bool {
        match value {
            Value::Object(id) => matches!(
                self.gc.cells.get(*id).map(|c| &c.kind),
                Some(CellKind::WeakMap)
            ),
            _ => false,
        }
    }

    /// Invoke `callee` with `arg`.
    pub fn call(&mut self, callee: &Value, arg: Value) -> Result<Value, HostError> {
        let f = match callee.cell().and_then(|c| self.gc.cells.get(c)) {
            Some(Cell {
                kind: CellKind::Function(f),
                ..
            }) => Rc::clone(f),
            _ => {
                return Err(HostError::new(
                    format!("{callee} is not a function"),
                    Value::Undefined,
                ))
            }
        };
        f(self, arg)
    }

    pub fn is_alive(&self, value: &Value) -> bool {
        value.cell().is_some_and(|c| self.gc.cells.contains_key(c))
    }

    pub fn color_of(&self, value: &Value) -> Option<Color> {
        self.gc.color_of(value)
    }

    fn expect_cell(&self, value: &Value) -> CellId {
        value
            .cell()
            .filter(|c| self.gc.cells.contains_key(*c))
            .expect("value must refer to a live cell")
    }

    pub fn add_root(&mut self, value: &Value) {
        let Some(id) = value.cell().filter(|c| self.gc.cells.contains_key(*c)) else {
            return;
        };
        let n = self.gc.roots.get(id).copied().unwrap_or(0);
        self.gc.roots.insert(id, n + 1);
        if self.gc.phase == Phase::Marking {
            self.gc.mark_cell(id);
        }
    }

    pub fn remove_root(&mut self, value: &Value) {
        let Some(id) = value.cell() else {
            return;
        };
        match self.gc.roots.get(id).copied() {
            Some(n) if n > 1 => {
                self.gc.roots.insert(id, n - 1);
            }
            Some(_) => {
                self.gc.roots.remove(id);
            }
            None => {}
        }
    }

    /// Append a strong reference from `obj` to `value`.
    pub fn push_field(&mut self, obj: &Value, value: Value) {
        let id = self.expect_cell(obj);
        self.write_barrier(id, &value);
        self.gc.cells[id].fields.push(value);
    }

    pub fn set_field(&mut self, obj: &Value, index: usize, value: Value) {
        let id = self.expect_cell(obj);
        self.write_barrier(id, &value);
        let fields = &mut self.gc.cells[id].fields;
        if index >= fields.len() {
            fields.resize(index + 1, Value::Undefined);
        }
        fields[index] = value;
    }

    pub fn clear_fields(&mut self, obj: &Value) {
        let id = self.expect_cell(obj);
        self.gc.cells[id].fields.clear();
    }

    pub fn fields(&self, obj: &Value) -> &[Value] {
        let id = self.expect_cell(obj);
        &self.gc.cells[id].fields
    }

    fn write_barrier(&mut self, owner: CellId, value: &Value) {
        if self.gc.phase == Phase::Marking && self.gc.color(owner) == Color::Black {
            self.gc.mark(value);
        }
    }

    pub(crate) fn table(&self, map: CellId) -> Option<&EphemeronTable> {
        self.tables.get(map)
    }

    pub(crate) fn table_and_collector(
        &mut self,
        map: CellId,
    ) -> (Option<&mut EphemeronTable>, &mut Collector) {
        (self.tables.get_mut(map), &mut self.gc)
    }

    /// The table of weak map `map`, allocating it on first use.
    pub(crate) fn ensure_table(
        &mut self,
        map: CellId,
    ) -> Result<(&mut EphemeronTable, &mut Collector), WeakMapError> {
        if !self.tables.contains_key(map) {
            let region = self
                .gc
                .region_of(map)
                .expect("weak map used after its object was finalized");
            let table = EphemeronTable::create(
                map,
                region,
                self.config.initial_table_capacity,
                &mut self.gc,
            )?;
            self.tables.insert(map, table);
        }
        let table = self
            .tables
            .get_mut(map)
            .expect("table was just allocated");
        Ok((table, &mut self.gc))
    }

    pub(crate) fn install_table(&mut self, map: CellId, table: EphemeronTable) {
        assert!(
            self.gc.cells.contains_key(map),
            "table installed on a dead object"
        );
        if let Some(old) = self.tables.insert(map, table) {
            old.finalize(&mut self.gc);
        }
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Begin a collection cycle: clear marks and gray the roots. No-op if
    /// a cycle is already in progress.
    pub fn start_gc(&mut self) {
        if self.gc.phase != Phase::Idle {
            return;
        }
        for cell in self.gc.cells.values_mut() {
            cell.color = Color::White;
        }
        self.gc.gray.clear();
        self.gc.ephemeron_edges.clear();
        self.gc.phase = Phase::Marking;
        let roots: Vec<CellId> = self.gc.roots.keys().collect();
        for id in &roots {
            self.gc.mark_cell(*id);
        }
        tracing::debug!(cycle = self.gc.cycles + 1, roots = roots.len(), "gc cycle started");
    }

    /// Run up to `budget` marking steps. Returns true once marking has
    /// nothing left to do.
    pub fn gc_slice(&mut self, budget: usize) -> bool {
        if self.gc.phase != Phase::Marking {
            return true;
        }
        self.mark_until(Some(budget))
    }

    pub fn gc_slice_default(&mut self) -> bool {
        self.gc_slice(self.config.slice_budget)
    }

    fn mark_until(&mut self, budget: Option<usize>) -> bool {
        let mut steps = 0;
        loop {
            if budget.is_some_and(|b| steps >= b) {
                return self.gc.gray.is_empty();
            }
            let Some(id) = self.gc.blacken_next() else {
                return true;
            };
            if let Some(table) = self.tables.get(id) {
                table.trace(&mut self.gc);
            }
            steps += 1;
        }
    }

    /// Complete the current cycle (starting one if idle) and sweep.
    pub fn finish_gc(&mut self) -> SweepStats {
        if self.gc.phase == Phase::Idle {
            self.start_gc();
        }
        self.mark_until(None);
        self.sweep()
    }

    /// Full stop-the-world collection.
    pub fn gc(&mut self) -> SweepStats {
        self.finish_gc()
    }

    /// Abandon an in-progress marking phase. Marks already set are left in
    /// place until the next cycle clears them.
    pub fn abort_gc(&mut self) {
        if self.gc.phase != Phase::Marking {
            return;
        }
        self.gc.gray.clear();
        self.gc.ephemeron_edges.clear();
        self.gc.phase = Phase::Idle;
        tracing::debug!("gc cycle aborted");
    }

    fn sweep(&mut self) -> SweepStats {
        self.gc.phase = Phase::Sweeping;
        self.gc.ephemeron_edges.clear();
        let mut stats = SweepStats::default();

        let dead_owners: Vec<CellId> = self
            .tables
            .keys()
            .filter(|&id| !self.gc.is_marked(id))
            .collect();
        for id in dead_owners {
            if let Some(table) = self.tables.remove(id) {
                table.finalize(&mut self.gc);
                stats.tables_finalized += 1;
            }
        }
        for (_, table) in self.tables.iter_mut() {
            stats.entries_swept += table.sweep(&self.gc);
        }

        let before = self.gc.cells.len();
        self.gc.cells.retain(|_, cell| cell.color != Color::White);
        stats.cells_freed = before - self.gc.cells.len();
        for cell in self.gc.cells.values_mut() {
            cell.color = Color::White;
        }

        self.gc.phase = Phase::Idle;
        self.gc.cycles += 1;
        tracing::debug!(
            cycle = self.gc.cycles,
            cells_freed = stats.cells_freed,
            entries_swept = stats.entries_swept,
            tables_finalized = stats.tables_finalized,
            "gc cycle finished"
        );
        stats
    }
}
