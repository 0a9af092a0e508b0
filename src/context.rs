use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{thing_flag, write_flag, ArenaKind};
use crate::cell::{Cell, FinalizeKind, TraceKind, Value, EXTERNAL_STRING_LIMIT};
use crate::double;
use crate::error::{Error, Result};
use crate::heap::{CollectMode, Heap};
use crate::thing::{
    function_data, object_data, string_data, Class, FreeThing, FunctionData, ObjectData,
    StringData, OBJECT_CLASS,
};
use crate::tracer::{self, Trace, Tracer};

/// Identifies a [`Context`] within its heap.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn unique() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A thing to store in a newly allocated cell.
#[derive(Debug)]
pub enum Thing {
    /// An object.
    Object(ObjectData),
    /// A function.
    Function(FunctionData),
    /// A string.
    String(StringData),
    /// A flat string whose characters are released by the finalizer
    /// registered for the external string type.
    ExternalString(u8, Box<str>),
}

impl Thing {
    /// Returns the kind of cell this thing is stored in.
    #[must_use]
    pub fn kind(&self) -> FinalizeKind {
        match self {
            Thing::Object(_) => FinalizeKind::Object,
            Thing::Function(_) => FinalizeKind::Function,
            Thing::String(_) => FinalizeKind::String,
            Thing::ExternalString(external, _) => FinalizeKind::ExternalString(*external),
        }
    }

    /// Returns the bytes this thing owns outside of its cell.
    fn malloc_bytes(&self) -> usize {
        match self {
            Thing::Object(object) => object.slots().capacity() * mem::size_of::<Value>(),
            Thing::Function(function) => {
                function.object().slots().capacity() * mem::size_of::<Value>()
            }
            Thing::String(StringData::Flat(chars)) | Thing::ExternalString(_, chars) => {
                chars.len()
            }
            Thing::String(StringData::Dependent { .. } | StringData::Rope { .. }) => 0,
        }
    }

    /// Moves this thing into `cell`.
    ///
    /// # Safety
    ///
    /// `cell` must be an unused cell of the arena kind returned by
    /// [`Thing::kind`].
    unsafe fn write_into(self, cell: Cell) {
        match self {
            Thing::Object(object) => cell.as_ptr().cast::<ObjectData>().write(object),
            Thing::Function(function) => cell.as_ptr().cast::<FunctionData>().write(function),
            Thing::String(string) => cell.as_ptr().cast::<StringData>().write(string),
            Thing::ExternalString(_, chars) => cell
                .as_ptr()
                .cast::<StringData>()
                .write(StringData::Flat(chars)),
        }
    }
}

impl Trace for Thing {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        match self {
            Thing::Object(object) => object.trace(tracer),
            Thing::Function(function) => function.trace(tracer),
            Thing::String(string) => string.trace(tracer),
            Thing::ExternalString(..) => {}
        }
    }
}

/// Cells handed to one context for allocation without taking the heap
/// lock.
pub(crate) struct LocalFreeLists {
    /// The collection number the lists were filled under. Lists from an
    /// earlier collection were rebuilt by sweep and are discarded.
    epoch: u64,
    pub(crate) things: [Option<Cell>; FinalizeKind::COUNT],
    pub(crate) doubles: Option<Cell>,
    pub(crate) malloc_bytes: usize,
    pub(crate) local_allocs: [u64; FinalizeKind::COUNT],
    pub(crate) local_doubles: u64,
}

impl LocalFreeLists {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            things: [None; FinalizeKind::COUNT],
            doubles: None,
            malloc_bytes: 0,
            local_allocs: [0; FinalizeKind::COUNT],
            local_doubles: 0,
        }
    }

    /// Drops every list if a collection ran since they were filled.
    pub(crate) fn sync(&mut self, epoch: u64) {
        if self.epoch != epoch {
            self.epoch = epoch;
            self.things = [None; FinalizeKind::COUNT];
            self.doubles = None;
        }
    }

    fn pop_thing(&mut self, kind: FinalizeKind) -> Option<Cell> {
        let index = kind.index();
        let cell = self.things[index]?;
        // SAFETY: Local lists are only built from free cells by the arena
        // lists, and `sync` discards them once a sweep reuses those cells.
        self.things[index] = unsafe { FreeThing::next(cell) };
        self.local_allocs[index] += 1;
        Some(cell)
    }

    fn pop_double(&mut self) -> Option<Cell> {
        let cell = self.doubles?;
        // SAFETY: See `pop_thing`.
        self.doubles = unsafe { double::next(cell) };
        self.local_doubles += 1;
        Some(cell)
    }
}

/// Roots owned by one context: the newborn slots and the local root stack.
pub(crate) struct ContextRoots {
    id: ContextId,
    newborn: [Option<Cell>; FinalizeKind::COUNT],
    newborn_double: Option<Cell>,
    /// The length of `values` when each open scope was entered.
    scopes: Vec<usize>,
    values: Vec<Value>,
}

impl ContextRoots {
    fn new(id: ContextId) -> Self {
        Self {
            id,
            newborn: [None; FinalizeKind::COUNT],
            newborn_double: None,
            scopes: Vec::new(),
            values: Vec::new(),
        }
    }

    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    fn record_newborn(&mut self, cell: Cell, kind: Option<FinalizeKind>) {
        if !self.scopes.is_empty() {
            let trace_kind = kind.map_or(TraceKind::Double, FinalizeKind::trace_kind);
            self.values.push(Value::from_gc_thing(cell, trace_kind));
        } else if let Some(kind) = kind {
            self.newborn[kind.index()] = Some(cell);
        } else {
            self.newborn_double = Some(cell);
        }
    }

    pub(crate) fn clear_newborns(&mut self) {
        self.newborn = [None; FinalizeKind::COUNT];
        self.newborn_double = None;
    }

    pub(crate) fn clear(&mut self) {
        self.clear_newborns();
        self.scopes.clear();
        self.values.clear();
    }
}

impl Trace for ContextRoots {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        for (index, cell) in self.newborn.iter().enumerate() {
            if let (Some(cell), Some(kind)) = (cell, FinalizeKind::from_index(index)) {
                tracer.trace(*cell, kind.trace_kind());
            }
        }
        if let Some(cell) = self.newborn_double {
            tracer.trace(cell, TraceKind::Double);
        }
        self.values.trace(tracer);
    }
}

/// A thread's connection to a [`Heap`].
///
/// A context caches free cells so most allocations do not touch the heap
/// lock, and remembers the newest thing of each kind so it survives until
/// the caller stores it somewhere reachable. All work happens inside a
/// [`Request`] started with [`Context::begin_request`].
pub struct Context {
    heap: Arc<Heap>,
    id: ContextId,
    roots: Arc<Mutex<ContextRoots>>,
    local: LocalFreeLists,
}

impl Context {
    /// Returns a new context for `heap`.
    #[must_use]
    pub fn new(heap: &Arc<Heap>) -> Self {
        let id = ContextId::unique();
        let roots = Arc::new(Mutex::new(ContextRoots::new(id)));
        heap.register_context(id, roots.clone());
        Self {
            heap: heap.clone(),
            id,
            roots,
            local: LocalFreeLists::new(heap.gc_number()),
        }
    }

    /// Returns the heap this context allocates from.
    #[must_use]
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Returns this context's id.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Begins a request, waiting for any running collection to finish.
    ///
    /// Collections only run while every request on other threads has ended
    /// or is yielding.
    pub fn begin_request(&mut self) -> Request<'_> {
        self.heap.begin_request();
        Request {
            cx: self,
            no_collect: false,
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.heap.unregister_context(self.id);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("id", &self.id).finish_non_exhaustive()
    }
}

/// An active request of a [`Context`].
///
/// References returned by a request's accessors borrow the request, so any
/// call that can collect, which takes `&mut self`, ends those borrows first.
/// Dropping the request ends it.
pub struct Request<'cx> {
    cx: &'cx mut Context,
    no_collect: bool,
}

impl Request<'_> {
    /// Returns the heap this request allocates from.
    #[must_use]
    pub fn heap(&self) -> &Arc<Heap> {
        &self.cx.heap
    }

    /// Stores `thing` in a new cell.
    ///
    /// The new cell is rooted as its context's newborn of that kind, or on
    /// the innermost local root scope, so it survives until the next
    /// allocation of the same kind. References held by `thing` are rooted
    /// while allocating.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownExternalStringType`] if an external string type is
    ///   out of range.
    /// - [`Error::OutOfMemory`] if no arena could be acquired, even after a
    ///   last-ditch collection.
    /// - [`Error::ShutDown`] if the heap was finished.
    pub fn allocate(&mut self, thing: Thing) -> Result<Cell> {
        let kind = thing.kind();
        if let FinalizeKind::ExternalString(external) = kind {
            if !kind.is_valid() {
                return Err(Error::UnknownExternalStringType(external));
            }
        }
        self.cx.local.malloc_bytes += thing.malloc_bytes();

        let epoch = self.cx.heap.gc_number();
        self.cx.local.sync(epoch);
        let cell = match self.cx.local.pop_thing(kind) {
            Some(cell) => cell,
            None => self.allocate_slow(kind, &thing)?,
        };

        // SAFETY: The cell was taken from a free list of `kind` and nothing
        // else refers to it until its flag is cleared.
        unsafe {
            thing.write_into(cell);
            write_flag(thing_flag(cell, kind), 0);
        }
        self.cx.roots.lock().record_newborn(cell, Some(kind));
        Ok(cell)
    }

    fn allocate_slow(&mut self, kind: FinalizeKind, thing: &Thing) -> Result<Cell> {
        let mut pinned = Vec::new();
        thing.trace(&mut Tracer::visitor(&mut |cell, kind| {
            pinned.push(Value::from_gc_thing(cell, kind));
        }));
        let pinned_count = pinned.len();
        if pinned_count > 0 {
            self.cx.roots.lock().values.extend(pinned);
        }

        let result = self
            .cx
            .heap
            .allocate_slow(kind, &mut self.cx.local, !self.no_collect);

        if pinned_count > 0 {
            let mut roots = self.cx.roots.lock();
            let len = roots.values.len() - pinned_count;
            roots.values.truncate(len);
        }
        result
    }

    /// Allocates an object of `class` holding `slots`.
    ///
    /// # Errors
    ///
    /// See [`Request::allocate`].
    pub fn new_object(&mut self, class: &'static Class, slots: Vec<Value>) -> Result<Cell> {
        self.allocate(Thing::Object(ObjectData::new(class, slots)))
    }

    /// Allocates a function. `name`, if present, must be a string cell.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAString`] if `name` is not a string, otherwise
    /// see [`Request::allocate`].
    pub fn new_function(&mut self, name: Option<Cell>, arity: u16) -> Result<Cell> {
        if let Some(name) = name {
            self.string(name).ok_or(Error::NotAString)?;
        }
        self.allocate(Thing::Function(FunctionData::new(
            ObjectData::new(&OBJECT_CLASS, Vec::new()),
            name,
            arity,
        )))
    }

    /// Allocates a flat string holding a copy of `chars`.
    ///
    /// # Errors
    ///
    /// See [`Request::allocate`].
    pub fn new_string(&mut self, chars: &str) -> Result<Cell> {
        self.allocate(Thing::String(StringData::Flat(Box::from(chars))))
    }

    /// Allocates a string sharing the bytes `start..start + len` of `base`.
    ///
    /// The new string always depends on a flat string: a dependent `base`
    /// is resolved to its own base, and a rope is flattened first.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAString`] if `base` is not a string.
    /// - [`Error::InvalidRange`] if the range is out of bounds or splits a
    ///   character.
    /// - Otherwise see [`Request::allocate`].
    pub fn new_dependent_string(&mut self, base: Cell, start: usize, len: usize) -> Result<Cell> {
        let end = start
            .checked_add(len)
            .ok_or(Error::InvalidRange { start, end: usize::MAX })?;
        let resolved = match self.string(base).ok_or(Error::NotAString)? {
            StringData::Flat(_) => Some((base, 0)),
            StringData::Dependent {
                base: flat, start, ..
            } => Some((*flat, *start)),
            StringData::Rope { .. } => None,
        };
        let (flat, offset) = if let Some(resolved) = resolved {
            resolved
        } else {
            let contents = self.string_contents(base).ok_or(Error::NotAString)?;
            (self.new_string(&contents)?, 0)
        };

        let chars = self
            .string(flat)
            .and_then(StringData::as_flat)
            .ok_or(Error::NotAString)?;
        let base_len = self.string(base).map_or(0, StringData::len);
        let (flat_start, flat_end) = (offset + start, offset + end);
        if end > base_len
            || !chars.is_char_boundary(flat_start)
            || !chars.is_char_boundary(flat_end)
        {
            return Err(Error::InvalidRange { start, end });
        }

        self.allocate(Thing::String(StringData::Dependent {
            base: flat,
            start: flat_start,
            len,
        }))
    }

    /// Allocates the concatenation of two strings without copying them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAString`] if either half is not a string,
    /// otherwise see [`Request::allocate`].
    pub fn new_rope(&mut self, left: Cell, right: Cell) -> Result<Cell> {
        let left_len = self.string(left).ok_or(Error::NotAString)?.len();
        let right_len = self.string(right).ok_or(Error::NotAString)?.len();
        self.allocate(Thing::String(StringData::Rope {
            left,
            right,
            len: left_len + right_len,
        }))
    }

    /// Allocates a flat string of external string type `external`.
    ///
    /// # Errors
    ///
    /// See [`Request::allocate`].
    pub fn new_external_string(&mut self, external: u8, chars: impl Into<Box<str>>) -> Result<Cell> {
        if usize::from(external) >= EXTERNAL_STRING_LIMIT {
            return Err(Error::UnknownExternalStringType(external));
        }
        self.allocate(Thing::ExternalString(external, chars.into()))
    }

    /// Allocates a boxed number.
    ///
    /// # Errors
    ///
    /// See [`Request::allocate`].
    pub fn new_double(&mut self, number: f64) -> Result<Cell> {
        let epoch = self.cx.heap.gc_number();
        let local = &mut self.cx.local;
        local.sync(epoch);
        let cell = if let Some(cell) = local.pop_double() {
            cell
        } else {
            let head = self.cx.heap.refill_doubles(local, !self.no_collect)?;
            // SAFETY: The refilled list was built by the double arena list.
            local.doubles = unsafe { double::next(head) };
            head
        };
        // SAFETY: The cell was taken from a free list and is owned by this
        // request.
        unsafe { double::write(cell, number) };
        self.cx.roots.lock().record_newborn(cell, None);
        Ok(cell)
    }

    /// Runs a collection, waiting for other requests to end or yield.
    ///
    /// Returns false if an observer cancelled the collection or another
    /// thread's collection ran instead. A [`CollectMode::Final`] collection
    /// finishes the heap.
    pub fn collect(&mut self, mode: CollectMode) -> bool {
        self.cx.heap.collect(mode, self.cx.id)
    }

    /// Collects if enough has changed since the last collection to make it
    /// worthwhile. Returns true if a collection ran.
    pub fn maybe_collect(&mut self) -> bool {
        if self.no_collect {
            return false;
        }
        self.cx.heap.maybe_collect(self.cx.id, &mut self.cx.local)
    }

    /// Lets a collection requested by another thread run.
    ///
    /// Long-running requests must yield periodically or other threads'
    /// collections will wait on them.
    pub fn yield_to_collector(&mut self) {
        self.cx.heap.yield_request();
    }

    /// Records `bytes` allocated outside of the heap on behalf of collected
    /// things. Once the total passes the configured limit, the next slow
    /// allocation collects.
    pub fn report_malloc_bytes(&mut self, bytes: usize) {
        self.cx.local.malloc_bytes = self.cx.local.malloc_bytes.saturating_add(bytes);
    }

    /// Invokes `f` with collection disabled. Allocations made by `f` fail
    /// with [`Error::OutOfMemory`] instead of collecting.
    pub fn without_collection<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = mem::replace(&mut self.no_collect, true);
        let result = f(self);
        self.no_collect = previous;
        result
    }

    /// Returns the finalize kind of `cell` if it is a live thing of this
    /// heap. Cells that were swept, or that belong to another heap, have
    /// none.
    fn live_finalize_kind(&self, cell: Cell) -> Option<FinalizeKind> {
        match self.cx.heap.live_kind(cell)? {
            ArenaKind::Things(kind) => Some(kind),
            ArenaKind::Doubles | ArenaKind::Free => None,
        }
    }

    /// Returns the object payload of an object or function cell, or `None`
    /// if `cell` is not a live object or function.
    #[must_use]
    pub fn object(&self, cell: Cell) -> Option<&ObjectData> {
        // SAFETY: Live cells of these kinds hold initialized payloads that
        // cannot be swept while this request is borrowed.
        unsafe {
            match self.live_finalize_kind(cell)? {
                FinalizeKind::Object => Some(object_data(cell)),
                FinalizeKind::Function => Some(function_data(cell).object()),
                FinalizeKind::String | FinalizeKind::ExternalString(_) => None,
            }
        }
    }

    /// Returns the payload of a function cell.
    #[must_use]
    pub fn function(&self, cell: Cell) -> Option<&FunctionData> {
        match self.live_finalize_kind(cell)? {
            // SAFETY: See `Request::object`.
            FinalizeKind::Function => Some(unsafe { function_data(cell) }),
            _ => None,
        }
    }

    /// Returns the payload of a string cell.
    #[must_use]
    pub fn string(&self, cell: Cell) -> Option<&StringData> {
        match self.live_finalize_kind(cell)?.trace_kind() {
            // SAFETY: See `Request::object`.
            TraceKind::String => Some(unsafe { string_data(cell) }),
            TraceKind::Object | TraceKind::Double => None,
        }
    }

    /// Returns the number stored in a double cell, or `None` once the
    /// cell's arena was released.
    #[must_use]
    pub fn double(&self, cell: Cell) -> Option<f64> {
        // SAFETY: The arena is live, so the cell is mapped and holds a
        // number.
        (self.cx.heap.live_kind(cell)? == ArenaKind::Doubles)
            .then(|| unsafe { double::read(cell) })
    }

    /// Returns the characters of any string, flattening dependent strings
    /// and ropes without recursion.
    #[must_use]
    pub fn string_contents(&self, cell: Cell) -> Option<String> {
        let mut contents = String::with_capacity(self.string(cell)?.len());
        let mut pending = vec![cell];
        while let Some(cell) = pending.pop() {
            match self.string(cell)? {
                StringData::Flat(chars) => contents.push_str(chars),
                StringData::Dependent { base, start, len } => {
                    let base = self.string(*base)?.as_flat()?;
                    contents.push_str(base.get(*start..*start + *len)?);
                }
                StringData::Rope { left, right, .. } => {
                    pending.push(*right);
                    pending.push(*left);
                }
            }
        }
        Some(contents)
    }

    /// Returns how `cell` is traced, or `None` if it is not live.
    #[must_use]
    pub fn trace_kind(&self, cell: Cell) -> Option<TraceKind> {
        match self.cx.heap.live_kind(cell)? {
            ArenaKind::Things(kind) => Some(kind.trace_kind()),
            ArenaKind::Doubles => Some(TraceKind::Double),
            ArenaKind::Free => None,
        }
    }

    /// Invokes `visit` for every reference held directly by `cell`. Cells
    /// that are not live have no children.
    pub fn trace_children(&self, cell: Cell, mut visit: impl FnMut(Cell, TraceKind)) {
        if self.trace_kind(cell).is_some() {
            tracer::trace_children(&mut Tracer::visitor(&mut visit), cell);
        }
    }

    /// Opens a local root scope. Until it is left, new things are pushed on
    /// the scope instead of replacing the newborn slots.
    pub fn enter_local_root_scope(&mut self) {
        let mut roots = self.cx.roots.lock();
        let len = roots.values.len();
        roots.scopes.push(len);
    }

    /// Leaves the innermost local root scope, unrooting everything pushed
    /// since it was entered.
    pub fn leave_local_root_scope(&mut self) {
        let mut roots = self.cx.roots.lock();
        if let Some(len) = roots.scopes.pop() {
            roots.values.truncate(len);
        } else {
            debug_assert!(false, "no local root scope is open");
        }
    }

    /// Roots `value` until the innermost local root scope is left.
    pub fn push_local_root(&mut self, value: Value) {
        self.cx.roots.lock().values.push(value);
    }
}

impl Drop for Request<'_> {
    fn drop(&mut self) {
        self.cx.heap.end_request();
    }
}

impl std::fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("context", &self.cx.id)
            .field("no_collect", &self.no_collect)
            .finish()
    }
}
