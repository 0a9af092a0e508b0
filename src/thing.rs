//! The payloads stored in finalizable cells.

use std::fmt;

use parking_lot::{Mutex, MutexGuard};

use crate::cell::{Cell, TraceKind, Value};
use crate::tracer::{Trace, Tracer};

/// The layout of a cell on a free list.
#[repr(C)]
pub(crate) struct FreeThing {
    pub(crate) next: Option<Cell>,
    /// The cell's own flag byte, kept for debugging free lists.
    pub(crate) flag: *mut u8,
}

impl FreeThing {
    /// # Safety
    ///
    /// `cell` must be a free cell of a finalizable arena that the caller owns.
    pub(crate) unsafe fn write(cell: Cell, next: Option<Cell>, flag: *mut u8) {
        cell.as_ptr().cast::<FreeThing>().write(FreeThing { next, flag });
    }

    /// # Safety
    ///
    /// `cell` must be a cell previously written by [`FreeThing::write`].
    pub(crate) unsafe fn next(cell: Cell) -> Option<Cell> {
        (*cell.as_ptr().cast::<FreeThing>()).next
    }

    /// # Safety
    ///
    /// `cell` must be a cell previously written by [`FreeThing::write`].
    pub(crate) unsafe fn set_next(cell: Cell, next: Option<Cell>) {
        (*cell.as_ptr().cast::<FreeThing>()).next = next;
    }
}

/// Describes a family of objects.
///
/// Classes are `'static` and are referenced by every object created with
/// them.
///
/// ```rust
/// use sweepgc::{Class, ObjectData};
///
/// fn release(object: &mut ObjectData) {
///     object.slots_mut().clear();
/// }
///
/// static BUFFER: Class = Class::new("Buffer").with_finalizer(release);
/// assert_eq!(BUFFER.name, "Buffer");
/// ```
pub struct Class {
    /// The class name, used in diagnostics.
    pub name: &'static str,
    /// Invoked exactly once when an unreachable object is swept.
    pub finalize: Option<fn(&mut ObjectData)>,
    /// Traces references held outside of the object's slots.
    pub trace: Option<fn(&ObjectData, &mut Tracer<'_>)>,
}

impl Class {
    /// Returns a class with no hooks.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            finalize: None,
            trace: None,
        }
    }

    /// Sets the finalizer.
    #[must_use]
    pub const fn with_finalizer(mut self, finalize: fn(&mut ObjectData)) -> Self {
        self.finalize = Some(finalize);
        self
    }

    /// Sets the extra trace hook.
    #[must_use]
    pub const fn with_trace(mut self, trace: fn(&ObjectData, &mut Tracer<'_>)) -> Self {
        self.trace = Some(trace);
        self
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class").field("name", &self.name).finish()
    }
}

/// The class used when an object does not need hooks.
pub static OBJECT_CLASS: Class = Class::new("Object");

/// The payload of an object cell.
pub struct ObjectData {
    class: &'static Class,
    slots: Mutex<Vec<Value>>,
}

impl ObjectData {
    /// Returns a new object payload.
    #[must_use]
    pub fn new(class: &'static Class, slots: Vec<Value>) -> Self {
        Self {
            class,
            slots: Mutex::new(slots),
        }
    }

    /// Returns this object's class.
    #[must_use]
    pub fn class(&self) -> &'static Class {
        self.class
    }

    /// Locks and returns the slots.
    ///
    /// Values stored in slots are traced when the object is reachable.
    pub fn slots(&self) -> MutexGuard<'_, Vec<Value>> {
        self.slots.lock()
    }

    /// Returns the slots without locking. Available to finalizers.
    pub fn slots_mut(&mut self) -> &mut Vec<Value> {
        self.slots.get_mut()
    }

    /// Returns the value in slot `index`.
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<Value> {
        self.slots.lock().get(index).copied()
    }

    /// Stores `value` in slot `index`, growing the slots with
    /// [`Value::Undefined`] as needed.
    pub fn set_slot(&self, index: usize, value: Value) {
        let mut slots = self.slots.lock();
        if slots.len() <= index {
            slots.resize(index + 1, Value::Undefined);
        }
        slots[index] = value;
    }

    /// Appends `value` to the slots.
    pub fn push_slot(&self, value: Value) {
        self.slots.lock().push(value);
    }

    pub(crate) fn take_slots(&mut self) -> Vec<Value> {
        std::mem::take(self.slots.get_mut())
    }
}

impl Trace for ObjectData {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        self.slots.trace(tracer);
        if let Some(trace) = self.class.trace {
            trace(self, tracer);
        }
    }
}

impl fmt::Debug for ObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectData")
            .field("class", &self.class.name)
            .field("slots", &*self.slots.lock())
            .finish()
    }
}

/// The payload of a function cell: an object plus a name and an arity.
#[derive(Debug)]
pub struct FunctionData {
    object: ObjectData,
    name: Option<Cell>,
    arity: u16,
}

impl FunctionData {
    /// Returns a new function payload. `name`, if present, must be a string
    /// cell.
    #[must_use]
    pub fn new(object: ObjectData, name: Option<Cell>, arity: u16) -> Self {
        Self {
            object,
            name,
            arity,
        }
    }

    /// Returns the object part of this function.
    #[must_use]
    pub fn object(&self) -> &ObjectData {
        &self.object
    }

    /// Returns the name string cell.
    #[must_use]
    pub fn name(&self) -> Option<Cell> {
        self.name
    }

    /// Returns the declared arity.
    #[must_use]
    pub fn arity(&self) -> u16 {
        self.arity
    }

    pub(crate) fn object_mut(&mut self) -> &mut ObjectData {
        &mut self.object
    }
}

impl Trace for FunctionData {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        self.object.trace(tracer);
        if let Some(name) = self.name {
            tracer.trace(name, TraceKind::String);
        }
    }
}

/// The payload of a string cell.
#[derive(Debug)]
pub enum StringData {
    /// A string owning its characters.
    Flat(Box<str>),
    /// A substring sharing the characters of a flat base string.
    Dependent {
        /// The flat string holding the characters.
        base: Cell,
        /// The byte offset of the first character within `base`.
        start: usize,
        /// The length in bytes.
        len: usize,
    },
    /// The lazy concatenation of two strings.
    Rope {
        /// The first half.
        left: Cell,
        /// The second half.
        right: Cell,
        /// The total length in bytes.
        len: usize,
    },
}

impl StringData {
    /// Returns the length in bytes.
    ///
    /// Dependent and rope lengths are recorded at creation, so this never
    /// visits other cells.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            StringData::Flat(chars) => chars.len(),
            StringData::Dependent { len, .. } | StringData::Rope { len, .. } => *len,
        }
    }

    /// Returns true if this string has no characters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the characters of a flat string.
    #[must_use]
    pub fn as_flat(&self) -> Option<&str> {
        match self {
            StringData::Flat(chars) => Some(chars),
            StringData::Dependent { .. } | StringData::Rope { .. } => None,
        }
    }
}

impl Trace for StringData {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        match self {
            StringData::Flat(_) => {}
            StringData::Dependent { base, .. } => tracer.trace(*base, TraceKind::String),
            StringData::Rope { left, right, .. } => {
                tracer.trace(*left, TraceKind::String);
                tracer.trace(*right, TraceKind::String);
            }
        }
    }
}

/// Reads the object payload of an object cell.
///
/// # Safety
///
/// `cell` must be a live cell of an object arena.
pub(crate) unsafe fn object_data<'a>(cell: Cell) -> &'a ObjectData {
    &*cell.as_ptr().cast::<ObjectData>()
}

/// # Safety
///
/// `cell` must be a live cell of a function arena.
pub(crate) unsafe fn function_data<'a>(cell: Cell) -> &'a FunctionData {
    &*cell.as_ptr().cast::<FunctionData>()
}

/// # Safety
///
/// `cell` must be a live cell of a string or external string arena.
pub(crate) unsafe fn string_data<'a>(cell: Cell) -> &'a StringData {
    &*cell.as_ptr().cast::<StringData>()
}

const _: () = assert!(std::mem::align_of::<ObjectData>() <= std::mem::align_of::<usize>());
const _: () = assert!(std::mem::align_of::<FunctionData>() <= std::mem::align_of::<usize>());
const _: () = assert!(std::mem::align_of::<StringData>() <= std::mem::align_of::<usize>());
