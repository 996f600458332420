//! Host values, cell identities and heap regions.

use slotmap::new_key_type;
use std::fmt;
use std::rc::Rc;

new_key_type! {
    /// Identity of a heap cell. Generational: a freed cell's id never
    /// resolves to a later allocation that reuses the slot.
    pub struct CellId;
}

/// A host value. Primitives are held inline; objects and symbols are
/// references to heap cells and compare by identity.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    Object(CellId),
    Symbol(CellId),
}

impl Value {
    /// The heap cell referenced by this value, if any.
    pub fn cell(&self) -> Option<CellId> {
        match self {
            Value::Object(c) | Value::Symbol(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Object(_) => "object",
            Value::Symbol(_) => "symbol",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Object(_) => f.write_str("[object]"),
            Value::Symbol(_) => f.write_str("Symbol()"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum WeakKind {
    Object,
    Symbol,
}

/// Non-owning identity handle to an object or symbol cell.
///
/// Holding a `WeakRef` does not keep the cell alive; equality and hashing
/// use the cell identity, never the contents.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct WeakRef {
    cell: CellId,
    kind: WeakKind,
}

impl WeakRef {
    /// Structural conversion. Whether the host permits holding this value
    /// weakly is decided by `ObjectModel::is_weakly_holdable`.
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Object(cell) => Some(Self {
                cell: *cell,
                kind: WeakKind::Object,
            }),
            Value::Symbol(cell) => Some(Self {
                cell: *cell,
                kind: WeakKind::Symbol,
            }),
            _ => None,
        }
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    pub fn kind(&self) -> WeakKind {
        self.kind
    }

    pub fn to_value(&self) -> Value {
        match self.kind {
            WeakKind::Object => Value::Object(self.cell),
            WeakKind::Symbol => Value::Symbol(self.cell),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ZoneId(pub u32);

impl ZoneId {
    /// Zone holding interned, region-neutral cells (symbols).
    pub const ATOMS: ZoneId = ZoneId(0);

    pub fn is_atoms(&self) -> bool {
        *self == Self::ATOMS
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CompartmentId(pub u32);

/// Isolation region of a cell: a compartment inside a zone.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Region {
    pub zone: ZoneId,
    pub compartment: CompartmentId,
}

impl Region {
    pub const ATOMS: Region = Region {
        zone: ZoneId::ATOMS,
        compartment: CompartmentId(0),
    };

    pub fn is_atoms(&self) -> bool {
        self.zone.is_atoms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn weak_ref_only_from_cells() {
        let mut cells: SlotMap<CellId, ()> = SlotMap::with_key();
        let a = cells.insert(());
        assert!(WeakRef::from_value(&Value::Number(1.0)).is_none());
        assert!(WeakRef::from_value(&Value::from("s")).is_none());
        assert!(WeakRef::from_value(&Value::Null).is_none());

        let w = WeakRef::from_value(&Value::Object(a)).unwrap();
        assert_eq!(w.cell(), a);
        assert_eq!(w.to_value(), Value::Object(a));
        let s = WeakRef::from_value(&Value::Symbol(a)).unwrap();
        assert_eq!(s.kind(), WeakKind::Symbol);
        assert_eq!(s.to_value(), Value::Symbol(a));
    }

    #[test]
    fn values_compare_by_identity() {
        let mut cells: SlotMap<CellId, ()> = SlotMap::with_key();
        let a = cells.insert(());
        let b = cells.insert(());
        assert_ne!(Value::Object(a), Value::Object(b));
        assert_eq!(Value::Object(a), Value::Object(a));
        assert_eq!(Value::Object(a).cell(), Some(a));
        assert_eq!(Value::from(3).cell(), None);
    }
}
