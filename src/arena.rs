//! Arena layout.
//!
//! An arena is an `ARENA_SIZE`-aligned block of `ARENA_SIZE` bytes. Cells
//! are packed from the start, one flag byte per cell is packed downward from
//! the header, and the header itself sits in the last bytes of the arena:
//!
//! ```text
//! | cell 0 | cell 1 | ... | cell n-1 | ... | flag n-1 | ... | flag 0 | header |
//! ```
//!
//! Because arenas are aligned, the arena holding any cell is found by masking
//! the cell's address, and the cell's index by dividing its offset by the
//! thing size recorded in the header.

use std::mem;
use std::ptr::{self, NonNull};

use crate::cell::{Cell, FinalizeKind, TraceKind};
use crate::thing::{FreeThing, FunctionData, ObjectData, StringData};

/// log2 of [`ARENA_SIZE`].
pub const ARENA_SHIFT: usize = 12;
/// The size and alignment of every arena.
pub const ARENA_SIZE: usize = 1 << ARENA_SHIFT;
pub(crate) const ARENA_MASK: usize = ARENA_SIZE - 1;
pub(crate) const BITS_PER_WORD: usize = usize::BITS as usize;

/// The offset of the header within the arena. Cells and flags share the
/// bytes before it.
pub(crate) const INFO_OFFSET: usize = ARENA_SIZE - mem::size_of::<ArenaHeader>();

/// Set on cells reached during marking.
pub(crate) const MARK: u8 = 1;
/// Set on free or finalized cells, and on marked cells whose children are
/// still pending on the deferred stack.
pub(crate) const FINAL: u8 = 1 << 1;
/// Set on flat strings locked without an entry in the lock table.
pub(crate) const LOCK: u8 = 1 << 2;

const _: () = assert!(INFO_OFFSET % mem::align_of::<usize>() == 0);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ArenaKind {
    Free,
    Things(FinalizeKind),
    Doubles,
}

impl ArenaKind {
    pub(crate) const fn trace_kind(self) -> Option<TraceKind> {
        match self {
            ArenaKind::Free => None,
            ArenaKind::Things(kind) => Some(kind.trace_kind()),
            ArenaKind::Doubles => Some(TraceKind::Double),
        }
    }
}

#[repr(C)]
struct ArenaHeader {
    /// The next arena toward the head of whichever list holds this arena:
    /// a per-kind list, the double list, or a chunk's free list.
    prev: Option<Arena>,
    /// Finalizable arenas: the bitmap of cell groups with deferred children.
    /// Double arenas: non-zero once a double was marked this collection.
    untraced: usize,
    /// This arena's position within its chunk.
    index: u16,
    /// Only meaningful for the first arena of a chunk: the index of the
    /// arena holding the chunk's free-list info, or `NO_FREE_ARENAS`.
    chunk_info_index: u16,
    kind: ArenaKind,
    on_deferred_stack: bool,
}

/// Returns the size of one cell of `T`, large enough to hold a free-list
/// link and rounded to pointer alignment.
pub(crate) const fn thing_size_of<T>() -> usize {
    let size = if mem::size_of::<T>() < mem::size_of::<FreeThing>() {
        mem::size_of::<FreeThing>()
    } else {
        mem::size_of::<T>()
    };
    let align = mem::align_of::<usize>();
    (size + align - 1) & !(align - 1)
}

/// Returns the size of a cell of the given kind.
pub(crate) const fn thing_size(kind: FinalizeKind) -> usize {
    match kind {
        FinalizeKind::Object => thing_size_of::<ObjectData>(),
        FinalizeKind::Function => thing_size_of::<FunctionData>(),
        FinalizeKind::String | FinalizeKind::ExternalString(_) => thing_size_of::<StringData>(),
    }
}

/// Each cell costs its size plus one flag byte.
pub(crate) const fn things_per_arena(thing_size: usize) -> usize {
    INFO_OFFSET / (thing_size + 1)
}

/// The number of consecutive cells covered by one bit of the untraced
/// bitmap, so that every arena fits in a single word.
pub(crate) const fn things_per_untraced_bit(thing_size: usize) -> usize {
    let things = things_per_arena(thing_size);
    (things + BITS_PER_WORD - 1) / BITS_PER_WORD
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub(crate) struct Arena(NonNull<u8>);

// SAFETY: Arena headers and flags are only touched while holding the heap
// lock, by the thread running a collection, or for cells handed to a single
// request through its thread-local free list.
unsafe impl Send for Arena {}
// SAFETY: See the `Send` implementation.
unsafe impl Sync for Arena {}

impl Arena {
    /// # Safety
    ///
    /// `start` must point to `ARENA_SIZE` bytes aligned to `ARENA_SIZE` that
    /// stay allocated for as long as this handle is used.
    pub(crate) unsafe fn from_start(start: NonNull<u8>) -> Self {
        debug_assert_eq!(start.as_ptr() as usize & ARENA_MASK, 0);
        Self(start)
    }

    pub(crate) fn containing(cell: Cell) -> Self {
        let ptr = cell.as_ptr();
        let offset = ptr as usize & ARENA_MASK;
        // SAFETY: Stepping back to the arena boundary stays within the same
        // allocation and can never produce a null pointer.
        Self(unsafe { NonNull::new_unchecked(ptr.wrapping_sub(offset)) })
    }

    pub(crate) fn start(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub(crate) fn start_ptr(self) -> NonNull<u8> {
        self.0
    }

    pub(crate) fn at(self, offset: usize) -> *mut u8 {
        debug_assert!(offset < ARENA_SIZE);
        self.start().wrapping_add(offset)
    }

    fn header(self) -> *mut ArenaHeader {
        self.at(INFO_OFFSET).cast()
    }

    pub(crate) fn kind(self) -> ArenaKind {
        // SAFETY: The header of a live arena is always initialized.
        unsafe { (*self.header()).kind }
    }

    pub(crate) fn prev(self) -> Option<Arena> {
        // SAFETY: The header of a live arena is always initialized.
        unsafe { (*self.header()).prev }
    }

    pub(crate) fn set_prev(self, prev: Option<Arena>) {
        // SAFETY: The header of a live arena is always initialized.
        unsafe { (*self.header()).prev = prev };
    }

    pub(crate) fn untraced(self) -> usize {
        // SAFETY: The header of a live arena is always initialized.
        unsafe { (*self.header()).untraced }
    }

    pub(crate) fn set_untraced(self, untraced: usize) {
        // SAFETY: The header of a live arena is always initialized.
        unsafe { (*self.header()).untraced = untraced };
    }

    pub(crate) fn is_on_deferred_stack(self) -> bool {
        // SAFETY: The header of a live arena is always initialized.
        unsafe { (*self.header()).on_deferred_stack }
    }

    pub(crate) fn set_on_deferred_stack(self, on_stack: bool) {
        // SAFETY: The header of a live arena is always initialized.
        unsafe { (*self.header()).on_deferred_stack = on_stack };
    }

    pub(crate) fn index(self) -> usize {
        // SAFETY: The header of a live arena is always initialized.
        usize::from(unsafe { (*self.header()).index })
    }

    pub(crate) fn chunk_info_index(self) -> u16 {
        // SAFETY: The header of a live arena is always initialized.
        unsafe { (*self.header()).chunk_info_index }
    }

    pub(crate) fn set_chunk_info_index(self, index: u16) {
        // SAFETY: The header of a live arena is always initialized.
        unsafe { (*self.header()).chunk_info_index = index };
    }

    /// Writes a complete header into a freshly carved arena.
    pub(crate) fn init_in_chunk(self, index: u16, prev: Option<Arena>) {
        // SAFETY: The arena memory is owned by the chunk allocator, which is
        // the only caller.
        unsafe {
            self.header().write(ArenaHeader {
                prev,
                untraced: 0,
                index,
                chunk_info_index: 0,
                kind: ArenaKind::Free,
                on_deferred_stack: false,
            });
        }
    }

    /// Hands the arena to a new owner, clearing per-use header state.
    pub(crate) fn reset(self, kind: ArenaKind) {
        // SAFETY: The header of a live arena is always initialized.
        unsafe {
            let header = &mut *self.header();
            header.kind = kind;
            header.prev = None;
            header.untraced = 0;
            header.on_deferred_stack = false;
        }
    }

    pub(crate) fn mark_free(self) {
        // SAFETY: The header of a live arena is always initialized.
        unsafe { (*self.header()).kind = ArenaKind::Free };
    }

    /// Returns the first byte of the chunk this arena was carved from.
    pub(crate) fn chunk_start(self) -> NonNull<u8> {
        let start = self.start().wrapping_sub(self.index() * ARENA_SIZE);
        // SAFETY: The chunk start is the start of this arena's allocation.
        unsafe { NonNull::new_unchecked(start) }
    }

    pub(crate) fn thing(self, index: usize, thing_size: usize) -> Cell {
        debug_assert!(index < things_per_arena(thing_size));
        // SAFETY: Offsets within the arena are never null.
        Cell::from_ptr(unsafe { NonNull::new_unchecked(self.at(index * thing_size)) })
    }

    pub(crate) fn flag(self, index: usize) -> *mut u8 {
        self.at(INFO_OFFSET - 1 - index)
    }

    /// Zeroes the flags of the first `count` cells.
    pub(crate) fn clear_flags(self, count: usize) {
        debug_assert!(count <= INFO_OFFSET);
        // SAFETY: The flags occupy the `count` bytes directly below the
        // header, all within the arena.
        unsafe { ptr::write_bytes(self.at(INFO_OFFSET - count), 0, count) };
    }
}

/// Returns the index of `cell` within its arena.
pub(crate) fn thing_index(cell: Cell, thing_size: usize) -> usize {
    (cell.addr() & ARENA_MASK) / thing_size
}

/// Returns the flag byte of a finalizable cell.
pub(crate) fn thing_flag(cell: Cell, kind: FinalizeKind) -> *mut u8 {
    let arena = cell.arena();
    debug_assert_eq!(arena.kind(), ArenaKind::Things(kind), "{cell:?} is not a {kind:?}");
    arena.flag(thing_index(cell, thing_size(kind)))
}

/// Reads a flag byte.
///
/// # Safety
///
/// `flag` must come from [`Arena::flag`] or [`thing_flag`] on a live arena.
pub(crate) unsafe fn read_flag(flag: *mut u8) -> u8 {
    *flag
}

/// Writes a flag byte.
///
/// # Safety
///
/// `flag` must come from [`Arena::flag`] or [`thing_flag`] on a live arena,
/// and the caller must have exclusive access to the cell.
pub(crate) unsafe fn write_flag(flag: *mut u8, value: u8) {
    *flag = value;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_and_flags_fit() {
        for kind in FinalizeKind::all() {
            let size = thing_size(kind);
            let things = things_per_arena(size);
            assert!(size >= mem::size_of::<FreeThing>());
            assert_eq!(size % mem::align_of::<usize>(), 0);
            assert!(things * size + things <= INFO_OFFSET);
            assert!((things + 1) * size + things + 1 > INFO_OFFSET);
            assert!(things_per_untraced_bit(size) * BITS_PER_WORD >= things);
        }
    }

    #[test]
    fn header_is_at_the_end() {
        assert!(INFO_OFFSET < ARENA_SIZE);
        assert!(ARENA_SIZE - INFO_OFFSET <= 32);
    }
}
