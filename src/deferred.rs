//! Arenas holding marked objects whose children have not been traced yet.
//!
//! When marking would recurse too deeply, the object is flagged
//! `MARK | FINAL` and a bit covering its group of cells is set in its
//! arena's untraced bitmap. The arena itself is pushed here once, however
//! many of its cells are deferred, so the stack never holds more entries
//! than there are arenas.

use crate::arena::{
    read_flag, things_per_untraced_bit, write_flag, Arena, BITS_PER_WORD, FINAL, MARK,
};

#[derive(Default)]
pub(crate) struct DeferredStack {
    arenas: Vec<Arena>,
    /// Cells flagged as deferred and not yet traced.
    pub(crate) pending: usize,
    /// Cells deferred during this collection.
    pub(crate) total: usize,
    pub(crate) max_pending: usize,
}

impl DeferredStack {
    /// Defers tracing the children of the marked cell at `index`.
    pub(crate) fn defer(&mut self, arena: Arena, index: usize, thing_size: usize) {
        let flag = arena.flag(index);
        // SAFETY: The marker has exclusive access to flags during marking.
        unsafe {
            let value = read_flag(flag);
            debug_assert_eq!(value & (MARK | FINAL), MARK);
            write_flag(flag, value | FINAL);
        }

        let bit_index = index / things_per_untraced_bit(thing_size);
        debug_assert!(bit_index < BITS_PER_WORD);
        arena.set_untraced(arena.untraced() | 1 << bit_index);
        if !arena.is_on_deferred_stack() {
            arena.set_on_deferred_stack(true);
            self.arenas.push(arena);
        }

        self.pending += 1;
        self.total += 1;
        self.max_pending = self.max_pending.max(self.pending);
    }

    pub(crate) fn top(&self) -> Option<Arena> {
        self.arenas.last().copied()
    }

    /// Pops `arena` if it is still on top. Arenas pushed while tracing its
    /// cells must be drained first.
    pub(crate) fn pop_if_top(&mut self, arena: Arena) {
        if self.top() == Some(arena) {
            self.arenas.pop();
            arena.set_on_deferred_stack(false);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }
}

/// Removes and returns the highest set bit of the untraced bitmap of
/// `arena`.
pub(crate) fn take_untraced_bit(arena: Arena) -> Option<usize> {
    let untraced = arena.untraced();
    if untraced == 0 {
        return None;
    }
    let bit_index = BITS_PER_WORD - 1 - untraced.leading_zeros() as usize;
    arena.set_untraced(untraced & !(1 << bit_index));
    Some(bit_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{thing_size, things_per_arena, ArenaKind};
    use crate::cell::FinalizeKind;
    use crate::chunk::ChunkAllocator;
    use crate::config::ChunkStrategy;

    #[test]
    fn arenas_are_pushed_once() {
        let mut chunks = ChunkAllocator::new(ChunkStrategy::Aligned, 1);
        let arena = chunks.acquire().expect("allocation failed");
        let size = thing_size(FinalizeKind::Object);
        let count = things_per_arena(size);
        arena.reset(ArenaKind::Things(FinalizeKind::Object));
        arena.clear_flags(count);

        let mut stack = DeferredStack::default();
        let last = count - 1;
        for index in [0, 1, last] {
            // SAFETY: The arena is owned by this test.
            unsafe { write_flag(arena.flag(index), MARK) };
            stack.defer(arena, index, size);
        }
        assert_eq!(stack.pending, 3);
        assert_eq!(stack.total, 3);
        assert_eq!(stack.top(), Some(arena));
        // SAFETY: See above.
        assert_eq!(unsafe { read_flag(arena.flag(last)) }, MARK | FINAL);

        let per_bit = things_per_untraced_bit(size);
        assert_eq!(take_untraced_bit(arena), Some(last / per_bit));
        if per_bit == 1 {
            assert_eq!(take_untraced_bit(arena), Some(1));
        }
        assert_eq!(take_untraced_bit(arena), Some(0));
        assert_eq!(take_untraced_bit(arena), None);

        stack.pop_if_top(arena);
        assert!(stack.is_empty());
        assert!(!arena.is_on_deferred_stack());
        chunks.release(arena);
    }
}
