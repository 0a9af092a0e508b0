//! Arenas of boxed numbers.
//!
//! Doubles have no finalizer and no children, so their arenas carry a mark
//! bitmap instead of per-cell flags:
//!
//! ```text
//! | double 0 | ... | double n-1 | ... | bitmap words | header |
//! ```
//!
//! The bitmap is cleared lazily. An arena's header records whether any of
//! its doubles were marked during the current collection; the first mark
//! clears the bitmap, and arenas that were never marked are released whole
//! at sweep.

use std::mem;
use std::ptr::NonNull;

use crate::arena::{Arena, ArenaKind, ARENA_MASK, BITS_PER_WORD, INFO_OFFSET};
use crate::cell::Cell;

const DOUBLE_BITS: usize = mem::size_of::<f64>() * 8;

/// The largest `n` such that `n` doubles and a bitmap of `n` bits fit below
/// the header.
pub(crate) const DOUBLES_PER_ARENA: usize = INFO_OFFSET * 8 / (DOUBLE_BITS + 1);
pub(crate) const BITMAP_WORDS: usize = (DOUBLES_PER_ARENA + BITS_PER_WORD - 1) / BITS_PER_WORD;
const UNUSED_BITMAP_BITS: usize = BITMAP_WORDS * BITS_PER_WORD - DOUBLES_PER_ARENA;
const BITMAP_OFFSET: usize = INFO_OFFSET - BITMAP_WORDS * mem::size_of::<usize>();

/// Bits of the bitmap examined together when building free lists.
const UNROLL: usize = 4;
const UNROLL_MASK: usize = (1 << UNROLL) - 1;

const _: () = assert!(DOUBLES_PER_ARENA * mem::size_of::<f64>() <= BITMAP_OFFSET);
const _: () = assert!(BITS_PER_WORD % UNROLL == 0);
const _: () = assert!(UNUSED_BITMAP_BITS < BITS_PER_WORD);

/// A double cell holds either the number or, while free, the next free
/// cell.
#[repr(C)]
union DoubleCell {
    number: f64,
    next: Option<Cell>,
}

const _: () = assert!(mem::size_of::<DoubleCell>() == mem::size_of::<f64>());

fn bitmap(arena: Arena) -> *mut usize {
    arena.at(BITMAP_OFFSET).cast()
}

pub(crate) fn index_of(cell: Cell) -> usize {
    (cell.addr() & ARENA_MASK) / mem::size_of::<f64>()
}

fn double_cell(arena: Arena, index: usize) -> Cell {
    debug_assert!(index < DOUBLES_PER_ARENA);
    // SAFETY: Offsets within an arena are never null.
    Cell::from_ptr(unsafe {
        NonNull::new_unchecked(arena.at(index * mem::size_of::<f64>()))
    })
}

/// Clears the bitmap and sets the bits past the last double, so that those
/// bits always read as in use.
fn clear_marks(arena: Arena) {
    let bitmap = bitmap(arena);
    // SAFETY: The bitmap occupies `BITMAP_WORDS` words within the arena.
    unsafe {
        std::ptr::write_bytes(bitmap, 0, BITMAP_WORDS);
        if UNUSED_BITMAP_BITS > 0 {
            *bitmap.add(BITMAP_WORDS - 1) = !0 << (BITS_PER_WORD - UNUSED_BITMAP_BITS);
        }
    }
}

/// Marks the double at `cell`.
pub(crate) fn mark(cell: Cell) {
    let arena = cell.arena();
    debug_assert_eq!(arena.kind(), ArenaKind::Doubles, "{cell:?} is not a double");
    if arena.untraced() == 0 {
        clear_marks(arena);
        arena.set_untraced(1);
    }
    let index = index_of(cell);
    // SAFETY: The bitmap occupies `BITMAP_WORDS` words within the arena.
    unsafe {
        *bitmap(arena).add(index / BITS_PER_WORD) |= 1 << (index % BITS_PER_WORD);
    }
}

/// Returns true if the double at `cell` was marked this collection.
pub(crate) fn is_marked(cell: Cell) -> bool {
    let arena = cell.arena();
    if arena.untraced() == 0 {
        return false;
    }
    let index = index_of(cell);
    // SAFETY: The bitmap occupies `BITMAP_WORDS` words within the arena.
    let word = unsafe { *bitmap(arena).add(index / BITS_PER_WORD) };
    word & (1 << (index % BITS_PER_WORD)) != 0
}

/// # Safety
///
/// `cell` must be a double cell owned by the caller.
pub(crate) unsafe fn write(cell: Cell, number: f64) {
    cell.as_ptr().cast::<DoubleCell>().write(DoubleCell { number });
}

/// # Safety
///
/// `cell` must be a live double cell.
pub(crate) unsafe fn read(cell: Cell) -> f64 {
    (*cell.as_ptr().cast::<DoubleCell>()).number
}

/// # Safety
///
/// `cell` must be a cell of a free list built by this module.
pub(crate) unsafe fn next(cell: Cell) -> Option<Cell> {
    (*cell.as_ptr().cast::<DoubleCell>()).next
}

unsafe fn set_next(cell: Cell, next: Option<Cell>) {
    cell.as_ptr().cast::<DoubleCell>().write(DoubleCell { next });
}

/// Threads every unmarked double of `arena` into a free list in address
/// order. Returns the head and the number of cells.
fn free_list_from_bitmap(arena: Arena) -> (Option<Cell>, usize) {
    let bitmap = bitmap(arena);
    let mut head = None;
    let mut tail: Option<Cell> = None;
    let mut count = 0;
    let mut push = |index: usize| {
        let cell = double_cell(arena, index);
        // SAFETY: Unmarked doubles are free and owned by the caller.
        unsafe {
            match tail {
                Some(tail) => set_next(tail, Some(cell)),
                None => head = Some(cell),
            }
            set_next(cell, None);
        }
        tail = Some(cell);
        count += 1;
    };

    let mut index = 0;
    for word_index in 0..BITMAP_WORDS {
        // SAFETY: The bitmap occupies `BITMAP_WORDS` words within the arena.
        let mut word = unsafe { *bitmap.add(word_index) };
        if word == usize::MAX {
            index += BITS_PER_WORD;
            continue;
        }
        for _ in 0..BITS_PER_WORD / UNROLL {
            let group = word & UNROLL_MASK;
            word >>= UNROLL;
            if group == UNROLL_MASK {
                index += UNROLL;
                continue;
            }
            for bit in 0..UNROLL {
                if group & (1 << bit) == 0 {
                    push(index);
                }
                index += 1;
            }
        }
    }
    (head, count)
}

/// The list of double arenas and the refill cursor into it.
#[derive(Default)]
pub(crate) struct DoubleArenaList {
    first: Option<Arena>,
    cursor: Option<Arena>,
}

impl DoubleArenaList {
    pub(crate) fn arenas(&self) -> impl Iterator<Item = Arena> {
        std::iter::successors(self.first, |arena| arena.prev())
    }

    /// Builds a free list from the next arena past the cursor that has free
    /// doubles left after the last collection.
    pub(crate) fn refill_from_cursor(&mut self) -> Option<(Cell, usize)> {
        while let Some(arena) = self.cursor {
            self.cursor = arena.prev();
            // Arenas behind the cursor all survived the last sweep, so their
            // bitmaps are current.
            debug_assert_ne!(arena.untraced(), 0);
            if let (Some(head), count) = free_list_from_bitmap(arena) {
                return Some((head, count));
            }
        }
        None
    }

    /// Adds a new arena and returns all of its doubles as a free list.
    pub(crate) fn push_arena(&mut self, arena: Arena) -> (Cell, usize) {
        arena.reset(ArenaKind::Doubles);
        arena.set_prev(self.first);
        self.first = Some(arena);
        clear_marks(arena);
        let (head, count) = free_list_from_bitmap(arena);
        (head.expect("a fresh arena has free doubles"), count)
    }

    /// Releases arenas where nothing was marked and resets the cursor.
    /// Returns the number of live doubles and live arenas.
    pub(crate) fn sweep(&mut self, final_sweep: bool, empty: &mut Vec<Arena>) -> (usize, usize) {
        let mut live = 0;
        let mut live_arenas = 0;
        let mut kept: Option<Arena> = None;
        let mut current = self.first;
        while let Some(arena) = current {
            let next = arena.prev();
            if final_sweep || arena.untraced() == 0 {
                match kept {
                    Some(kept) => kept.set_prev(next),
                    None => self.first = next,
                }
                empty.push(arena);
            } else {
                live += (0..BITMAP_WORDS)
                    // SAFETY: The bitmap occupies `BITMAP_WORDS` words within
                    // the arena.
                    .map(|word| unsafe { *bitmap(arena).add(word) }.count_ones() as usize)
                    .sum::<usize>()
                    - UNUSED_BITMAP_BITS;
                live_arenas += 1;
                kept = Some(arena);
            }
            current = next;
        }
        self.cursor = self.first;
        (live, live_arenas)
    }

    /// Clears per-collection mark state. Called before marking.
    pub(crate) fn begin_marking(&self) {
        for arena in self.arenas() {
            arena.set_untraced(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_maximal() {
        let bitmap_bytes = |doubles: usize| {
            (doubles + BITS_PER_WORD - 1) / BITS_PER_WORD * mem::size_of::<usize>()
        };
        assert!(DOUBLES_PER_ARENA * 8 + bitmap_bytes(DOUBLES_PER_ARENA) <= INFO_OFFSET);
        assert!(
            (DOUBLES_PER_ARENA + 1) * 8 + bitmap_bytes(DOUBLES_PER_ARENA + 1) > INFO_OFFSET
        );
    }
}
