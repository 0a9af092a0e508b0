//! Per-kind lists of finalizable arenas.

use crate::arena::{
    read_flag, thing_flag, thing_size, things_per_arena, write_flag, Arena, ArenaKind, FINAL,
    LOCK, MARK,
};
use crate::cell::{Cell, FinalizeKind};
use crate::sweep::Finalizer;
use crate::thing::FreeThing;

/// The most cells moved to a thread-local free list at once.
pub(crate) const MAX_THREAD_LOCAL_THINGS: usize = 64;

/// Counts gathered while sweeping one list.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct SweepCounts {
    pub(crate) live: usize,
    pub(crate) finalized: usize,
    pub(crate) live_arenas: usize,
}

pub(crate) struct ArenaList {
    kind: FinalizeKind,
    thing_size: usize,
    things_per_arena: usize,
    /// The most recently added arena. Older arenas are reached through
    /// `Arena::prev`.
    last: Option<Arena>,
    /// Cells of `last` handed out by bumping. Cells past this index have
    /// never been used.
    last_count: usize,
    free_list: Option<Cell>,
}

impl ArenaList {
    pub(crate) const fn new(kind: FinalizeKind) -> Self {
        let thing_size = thing_size(kind);
        let things_per_arena = things_per_arena(thing_size);
        Self {
            kind,
            thing_size,
            things_per_arena,
            last: None,
            last_count: things_per_arena,
            free_list: None,
        }
    }

    pub(crate) fn kind(&self) -> FinalizeKind {
        self.kind
    }

    /// Makes `arena` the new bump target.
    pub(crate) fn push_arena(&mut self, arena: Arena) {
        arena.reset(ArenaKind::Things(self.kind));
        arena.set_prev(self.last);
        arena.clear_flags(self.things_per_arena);
        self.last = Some(arena);
        self.last_count = 0;
    }

    /// Removes the first cell of the global free list.
    pub(crate) fn pop_free(&mut self) -> Option<Cell> {
        let cell = self.free_list?;
        // SAFETY: Cells on the global free list were written by
        // `FreeThing::write` during sweep.
        self.free_list = unsafe { FreeThing::next(cell) };
        debug_assert_eq!(
            // SAFETY: The cell belongs to an arena of this list.
            unsafe { read_flag(thing_flag(cell, self.kind)) },
            FINAL
        );
        Some(cell)
    }

    /// Detaches up to `max` cells from the global free list.
    pub(crate) fn take_free_batch(&mut self, max: usize) -> Option<Cell> {
        let head = self.free_list?;
        let mut tail = head;
        for _ in 1..max {
            // SAFETY: Cells on the global free list were written by
            // `FreeThing::write` during sweep.
            match unsafe { FreeThing::next(tail) } {
                Some(next) => tail = next,
                None => break,
            }
        }
        // SAFETY: See above.
        unsafe {
            self.free_list = FreeThing::next(tail);
            FreeThing::set_next(tail, None);
        }
        Some(head)
    }

    /// Claims the next never-used cell of the last arena.
    ///
    /// The claimed cell is flagged `FINAL` until its payload is written.
    pub(crate) fn bump(&mut self) -> Option<Cell> {
        let arena = self.last?;
        if self.last_count >= self.things_per_arena {
            return None;
        }
        let index = self.last_count;
        self.last_count += 1;
        // SAFETY: The cell is unused and owned by this list.
        unsafe { write_flag(arena.flag(index), FINAL) };
        Some(arena.thing(index, self.thing_size))
    }

    /// Claims up to `max` never-used cells of the last arena as a linked free
    /// list.
    pub(crate) fn claim_tail(&mut self, max: usize) -> Option<Cell> {
        let arena = self.last?;
        let end = self.things_per_arena.min(self.last_count + max);
        let mut head = None;
        for index in (self.last_count..end).rev() {
            let cell = arena.thing(index, self.thing_size);
            let flag = arena.flag(index);
            // SAFETY: The cells are unused and owned by this list.
            unsafe {
                write_flag(flag, FINAL);
                FreeThing::write(cell, head, flag);
            }
            head = Some(cell);
        }
        self.last_count = end;
        head
    }

    /// Finalizes every unmarked cell, rebuilds the free list, and moves
    /// arenas without live cells to `empty`.
    ///
    /// Marks are cleared on surviving cells. When `final_sweep` is set, locks
    /// no longer keep cells alive.
    pub(crate) fn sweep(
        &mut self,
        finalizer: &Finalizer<'_>,
        final_sweep: bool,
        empty: &mut Vec<Arena>,
    ) -> SweepCounts {
        let mut counts = SweepCounts::default();
        let keep_alive = if final_sweep { MARK } else { MARK | LOCK };

        self.free_list = None;
        let mut kept: Option<Arena> = None;
        let mut current = self.last;
        let mut limit = self.last_count;
        while let Some(arena) = current {
            let mut free_list = self.free_list;
            let mut all_clear = true;
            for index in (0..limit).rev() {
                let flag = arena.flag(index);
                // SAFETY: `flag` is within a live arena of this list and the
                // collector has exclusive access during sweep.
                let value = unsafe { read_flag(flag) };
                if value & keep_alive == 0 {
                    let cell = arena.thing(index, self.thing_size);
                    // SAFETY: See above. Cells without `FINAL` hold an
                    // initialized payload that nothing reached.
                    unsafe {
                        if value & FINAL == 0 {
                            finalizer.finalize(self.kind, cell);
                            counts.finalized += 1;
                        }
                        write_flag(flag, FINAL);
                        FreeThing::write(cell, free_list, flag);
                    }
                    free_list = Some(cell);
                } else {
                    debug_assert!(
                        value & (MARK | FINAL) != (MARK | FINAL),
                        "deferred children were never traced"
                    );
                    // SAFETY: See above.
                    unsafe { write_flag(flag, value & !MARK) };
                    all_clear = false;
                    counts.live += 1;
                }
            }

            let next = arena.prev();
            if all_clear {
                match kept {
                    Some(kept) => kept.set_prev(next),
                    None => {
                        self.last = next;
                        self.last_count = self.things_per_arena;
                    }
                }
                empty.push(arena);
            } else {
                self.free_list = free_list;
                kept = Some(arena);
                counts.live_arenas += 1;
            }

            current = next;
            limit = self.things_per_arena;
        }
        counts
    }
}
