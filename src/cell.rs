use std::fmt;
use std::ptr::NonNull;

use crate::arena::{Arena, ArenaKind};

/// The number of external string types that can carry their own finalizer.
pub const EXTERNAL_STRING_LIMIT: usize = 8;

/// The address of a collected thing.
///
/// A `Cell` is a plain address: it does not keep its thing alive. Cells stay
/// valid for as long as they are reachable from a root, a lock, a newborn
/// slot, or a local root scope when a collection runs.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Cell(NonNull<u8>);

// SAFETY: A cell is an address into arena memory owned by a `Heap`. All
// mutation of that memory happens under the heap lock or inside the owning
// request, so sharing the address itself between threads is sound.
unsafe impl Send for Cell {}
// SAFETY: See the `Send` implementation.
unsafe impl Sync for Cell {}

impl Cell {
    pub(crate) const fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub(crate) const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Returns the address of this cell.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub(crate) fn arena(self) -> Arena {
        Arena::containing(self)
    }

    /// Returns the trace kind recorded in this cell's arena, or `None` when
    /// the arena is not in use.
    pub(crate) fn trace_kind(self) -> Option<TraceKind> {
        self.arena().kind().trace_kind()
    }

    pub(crate) fn finalize_kind(self) -> Option<FinalizeKind> {
        match self.arena().kind() {
            ArenaKind::Things(kind) => Some(kind),
            ArenaKind::Doubles | ArenaKind::Free => None,
        }
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cell({:#x})", self.addr())
    }
}

/// How a cell's children are traced.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TraceKind {
    /// Objects and functions: traced through their slots.
    Object,
    /// Boxed numbers, which have no children.
    Double,
    /// Flat, dependent and rope strings.
    String,
}

/// Which finalizer runs for a cell, and therefore which arena list holds it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum FinalizeKind {
    /// A plain object.
    Object,
    /// A function object.
    Function,
    /// A string owned by the heap.
    String,
    /// A string whose characters are released by an embedder-registered
    /// finalizer. The index selects the finalizer.
    ExternalString(u8),
}

impl FinalizeKind {
    /// The number of distinct finalize kinds.
    pub const COUNT: usize = 3 + EXTERNAL_STRING_LIMIT;

    /// Returns the dense index of this kind, matching the sweep order.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            FinalizeKind::Object => 0,
            FinalizeKind::Function => 1,
            FinalizeKind::String => 2,
            FinalizeKind::ExternalString(external) => 3 + external as usize,
        }
    }

    /// Returns the kind with the given dense index.
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(FinalizeKind::Object),
            1 => Some(FinalizeKind::Function),
            2 => Some(FinalizeKind::String),
            #[allow(clippy::cast_possible_truncation)]
            index if index < Self::COUNT => Some(FinalizeKind::ExternalString((index - 3) as u8)),
            _ => None,
        }
    }

    /// Returns every kind in sweep order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..Self::COUNT).filter_map(Self::from_index)
    }

    /// Returns how cells of this kind are traced.
    #[must_use]
    pub const fn trace_kind(self) -> TraceKind {
        match self {
            FinalizeKind::Object | FinalizeKind::Function => TraceKind::Object,
            FinalizeKind::String | FinalizeKind::ExternalString(_) => TraceKind::String,
        }
    }

    pub(crate) const fn is_valid(self) -> bool {
        match self {
            FinalizeKind::ExternalString(external) => (external as usize) < EXTERNAL_STRING_LIMIT,
            _ => true,
        }
    }
}

/// A dynamically typed value that may refer to a collected thing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Value {
    /// No value.
    #[default]
    Undefined,
    /// The null value.
    Null,
    /// A boolean.
    Boolean(bool),
    /// A small integer stored inline.
    Int(i32),
    /// A boxed number living in a double arena.
    Double(Cell),
    /// A string cell.
    String(Cell),
    /// An object or function cell.
    Object(Cell),
}

impl Value {
    /// Returns the referenced cell and how to trace it, if this value
    /// refers to a collected thing.
    #[must_use]
    pub const fn gc_thing(self) -> Option<(Cell, TraceKind)> {
        match self {
            Value::Double(cell) => Some((cell, TraceKind::Double)),
            Value::String(cell) => Some((cell, TraceKind::String)),
            Value::Object(cell) => Some((cell, TraceKind::Object)),
            Value::Undefined | Value::Null | Value::Boolean(_) | Value::Int(_) => None,
        }
    }

    /// Returns the value referring to `cell`, which is traced as `kind`.
    #[must_use]
    pub const fn from_gc_thing(cell: Cell, kind: TraceKind) -> Self {
        match kind {
            TraceKind::Object => Value::Object(cell),
            TraceKind::Double => Value::Double(cell),
            TraceKind::String => Value::String(cell),
        }
    }

    /// Returns the referenced cell, if any.
    #[must_use]
    pub const fn cell(self) -> Option<Cell> {
        match self.gc_thing() {
            Some((cell, _)) => Some(cell),
            None => None,
        }
    }

    /// Returns the object cell, if this value is an object.
    #[must_use]
    pub const fn as_object(self) -> Option<Cell> {
        if let Value::Object(cell) = self {
            Some(cell)
        } else {
            None
        }
    }

    /// Returns the string cell, if this value is a string.
    #[must_use]
    pub const fn as_string(self) -> Option<Cell> {
        if let Value::String(cell) = self {
            Some(cell)
        } else {
            None
        }
    }
}
