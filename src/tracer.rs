use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::arena::{
    read_flag, thing_index, thing_size, things_per_arena, things_per_untraced_bit, write_flag,
    ArenaKind, FINAL, MARK,
};
use crate::cell::{Cell, FinalizeKind, TraceKind, Value};
use crate::deferred::{take_untraced_bit, DeferredStack};
use crate::double;
use crate::thing::{function_data, object_data, string_data};

/// Strings pending on the rope marking stack before it spills to the heap.
const ROPE_STACK_INLINE: usize = 32;

/// A type that can hold references to collected things.
///
/// Implementations report each reference they hold by calling
/// [`Tracer::trace`] or [`Tracer::trace_value`], usually by tracing each of
/// their fields. `#[derive(Trace)]` generates this.
pub trait Trace {
    /// Reports every reference held by `self` to `tracer`.
    fn trace(&self, tracer: &mut Tracer<'_>);
}

macro_rules! impl_trace_nothing {
    ($($type:ty),+ $(,)?) => {
        $(
            impl Trace for $type {
                fn trace(&self, _tracer: &mut Tracer<'_>) {}
            }
        )+
    };
}

impl_trace_nothing!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    str,
);

impl Trace for Value {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.trace_value(*self);
    }
}

impl Trace for Cell {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        if let Some(kind) = self.trace_kind() {
            tracer.trace(*self, kind);
        } else {
            debug_assert!(false, "{self:?} is not in a live arena");
        }
    }
}

impl<T> Trace for Option<T>
where
    T: Trace,
{
    fn trace(&self, tracer: &mut Tracer<'_>) {
        if let Some(value) = self {
            value.trace(tracer);
        }
    }
}

impl<T> Trace for [T]
where
    T: Trace,
{
    fn trace(&self, tracer: &mut Tracer<'_>) {
        for item in self {
            item.trace(tracer);
        }
    }
}

impl<T, const N: usize> Trace for [T; N]
where
    T: Trace,
{
    fn trace(&self, tracer: &mut Tracer<'_>) {
        self.as_slice().trace(tracer);
    }
}

impl<T> Trace for Vec<T>
where
    T: Trace,
{
    fn trace(&self, tracer: &mut Tracer<'_>) {
        self.as_slice().trace(tracer);
    }
}

impl<T> Trace for Box<T>
where
    T: Trace + ?Sized,
{
    fn trace(&self, tracer: &mut Tracer<'_>) {
        T::trace(self, tracer);
    }
}

impl<T> Trace for Arc<T>
where
    T: Trace + ?Sized,
{
    fn trace(&self, tracer: &mut Tracer<'_>) {
        T::trace(self, tracer);
    }
}

impl<T> Trace for Mutex<T>
where
    T: Trace + ?Sized,
{
    fn trace(&self, tracer: &mut Tracer<'_>) {
        self.lock().trace(tracer);
    }
}

impl<T> Trace for RwLock<T>
where
    T: Trace + ?Sized,
{
    fn trace(&self, tracer: &mut Tracer<'_>) {
        self.read().trace(tracer);
    }
}

impl<A, B> Trace for (A, B)
where
    A: Trace,
    B: Trace,
{
    fn trace(&self, tracer: &mut Tracer<'_>) {
        self.0.trace(tracer);
        self.1.trace(tracer);
    }
}

/// Receives the references reported by [`Trace`] implementations.
///
/// During a collection the tracer marks what it is given. A tracer can also
/// wrap a callback to enumerate references without marking anything, see
/// [`Tracer::visitor`].
pub struct Tracer<'a> {
    mode: Mode<'a>,
}

enum Mode<'a> {
    Mark(Marker),
    Visit(&'a mut dyn FnMut(Cell, TraceKind)),
}

impl<'a> Tracer<'a> {
    /// Returns a tracer that passes every reported reference to `visit`.
    pub fn visitor(visit: &'a mut dyn FnMut(Cell, TraceKind)) -> Self {
        Self {
            mode: Mode::Visit(visit),
        }
    }

    pub(crate) fn marking(marker: Marker) -> Self {
        Self {
            mode: Mode::Mark(marker),
        }
    }

    pub(crate) fn into_marker(self) -> Option<Marker> {
        match self.mode {
            Mode::Mark(marker) => Some(marker),
            Mode::Visit(_) => None,
        }
    }

    /// Returns true if this tracer is marking for a collection.
    #[must_use]
    pub fn is_marking(&self) -> bool {
        matches!(self.mode, Mode::Mark(_))
    }

    fn marker_mut(&mut self) -> Option<&mut Marker> {
        match &mut self.mode {
            Mode::Mark(marker) => Some(marker),
            Mode::Visit(_) => None,
        }
    }

    /// Reports a reference to `cell`, which must be traced as `kind`.
    pub fn trace(&mut self, cell: Cell, kind: TraceKind) {
        match &mut self.mode {
            Mode::Visit(visit) => visit(cell, kind),
            Mode::Mark(marker) => {
                if marker.mark(cell, kind) {
                    marker.depth += 1;
                    trace_children(self, cell);
                    if let Some(marker) = self.marker_mut() {
                        marker.depth -= 1;
                    }
                }
            }
        }
    }

    /// Reports the thing referenced by `value`, if any.
    pub fn trace_value(&mut self, value: Value) {
        if let Some((cell, kind)) = value.gc_thing() {
            self.trace(cell, kind);
        }
    }

    /// Traces the children of every deferred cell until none remain.
    ///
    /// Tracing children may defer more cells, including ones in arenas
    /// already on the stack, so an arena is only popped once it is on top
    /// with an empty untraced bitmap.
    pub(crate) fn drain_deferred(&mut self) {
        while let Some(arena) = self.marker_mut().and_then(|marker| marker.deferred.top()) {
            let ArenaKind::Things(kind) = arena.kind() else {
                unreachable!("only finalizable arenas are deferred")
            };
            let size = thing_size(kind);
            let per_bit = things_per_untraced_bit(size);
            let limit = things_per_arena(size);
            while let Some(bit) = take_untraced_bit(arena) {
                for index in bit * per_bit..limit.min((bit + 1) * per_bit) {
                    let flag = arena.flag(index);
                    // SAFETY: The marker has exclusive access to flags during
                    // marking.
                    let value = unsafe { read_flag(flag) };
                    if value & (MARK | FINAL) != (MARK | FINAL) {
                        continue;
                    }
                    // SAFETY: See above.
                    unsafe { write_flag(flag, value & !FINAL) };
                    if let Some(marker) = self.marker_mut() {
                        marker.deferred.pending -= 1;
                    }
                    trace_children(self, arena.thing(index, size));
                }
            }
            if let Some(marker) = self.marker_mut() {
                marker.deferred.pop_if_top(arena);
            }
        }
        debug_assert!(self
            .marker_mut()
            .map_or(true, |marker| marker.deferred.pending == 0 && marker.deferred.is_empty()));
    }
}

/// Reports the children of `cell` to `tracer`.
pub(crate) fn trace_children(tracer: &mut Tracer<'_>, cell: Cell) {
    // SAFETY: Tracing only reaches cells that are live: roots are checked
    // when registered and every other cell is reached through a live one.
    unsafe {
        match cell.arena().kind() {
            ArenaKind::Things(FinalizeKind::Object) => object_data(cell).trace(tracer),
            ArenaKind::Things(FinalizeKind::Function) => function_data(cell).trace(tracer),
            ArenaKind::Things(FinalizeKind::String | FinalizeKind::ExternalString(_)) => {
                string_data(cell).trace(tracer);
            }
            ArenaKind::Doubles => {}
            ArenaKind::Free => debug_assert!(false, "{cell:?} is in a free arena"),
        }
    }
}

/// The marking state of one collection.
pub(crate) struct Marker {
    depth: usize,
    max_depth: usize,
    always_defer: bool,
    pub(crate) deferred: DeferredStack,
    strings: SmallVec<[Cell; ROPE_STACK_INLINE]>,
    pub(crate) marked: usize,
}

impl Marker {
    pub(crate) fn new(max_depth: usize, always_defer: bool) -> Self {
        Self {
            depth: 0,
            max_depth,
            always_defer,
            deferred: DeferredStack::default(),
            strings: SmallVec::new(),
            marked: 0,
        }
    }

    /// Marks `cell`, returning true if its children should be traced now.
    fn mark(&mut self, cell: Cell, kind: TraceKind) -> bool {
        match kind {
            TraceKind::Double => {
                if !double::is_marked(cell) {
                    double::mark(cell);
                    self.marked += 1;
                }
                false
            }
            TraceKind::String => {
                self.mark_strings(cell);
                false
            }
            TraceKind::Object => self.mark_object(cell),
        }
    }

    fn mark_object(&mut self, cell: Cell) -> bool {
        let arena = cell.arena();
        let ArenaKind::Things(kind) = arena.kind() else {
            debug_assert!(false, "{cell:?} is not an object");
            return false;
        };
        debug_assert_eq!(kind.trace_kind(), TraceKind::Object);
        let size = thing_size(kind);
        let index = thing_index(cell, size);
        let flag = arena.flag(index);
        // SAFETY: The marker has exclusive access to flags during marking.
        let value = unsafe { read_flag(flag) };
        if value & MARK != 0 {
            return false;
        }
        debug_assert!(value & FINAL == 0, "{cell:?} was traced after being freed");
        // SAFETY: See above.
        unsafe { write_flag(flag, value | MARK) };
        self.marked += 1;

        if self.always_defer || self.depth >= self.max_depth {
            self.deferred.defer(arena, index, size);
            false
        } else {
            true
        }
    }

    /// Marks a string and everything it shares characters with, without
    /// recursion. Dependent chains are followed in place and rope halves are
    /// kept on an explicit stack.
    fn mark_strings(&mut self, root: Cell) {
        self.strings.push(root);
        while let Some(cell) = self.strings.pop() {
            let arena = cell.arena();
            let ArenaKind::Things(kind) = arena.kind() else {
                debug_assert!(false, "{cell:?} is not a string");
                continue;
            };
            debug_assert_eq!(kind.trace_kind(), TraceKind::String);
            let flag = arena.flag(thing_index(cell, thing_size(kind)));
            // SAFETY: The marker has exclusive access to flags during marking.
            let value = unsafe { read_flag(flag) };
            if value & MARK != 0 {
                continue;
            }
            debug_assert!(value & FINAL == 0, "{cell:?} was traced after being freed");
            // SAFETY: See above.
            unsafe { write_flag(flag, value | MARK) };
            self.marked += 1;

            // SAFETY: Strings reached while marking are live.
            match unsafe { string_data(cell) } {
                crate::StringData::Flat(_) => {}
                crate::StringData::Dependent { base, .. } => self.strings.push(*base),
                crate::StringData::Rope { left, right, .. } => {
                    self.strings.push(*right);
                    self.strings.push(*left);
                }
            }
        }
    }
}
