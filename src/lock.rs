use ahash::AHashMap;

use crate::cell::Cell;

/// Counts of nested locks on cells that cannot use the flag bit alone.
///
/// Flat strings take their first lock through the `LOCK` flag. Everything
/// else, and any further lock on an already-locked flat string, is counted
/// here.
#[derive(Default)]
pub(crate) struct LockTable {
    counts: AHashMap<Cell, u32>,
}

impl LockTable {
    pub(crate) fn lock(&mut self, cell: Cell) -> u32 {
        let count = self.counts.entry(cell).or_insert(0);
        *count += 1;
        *count
    }

    /// Removes one lock. Returns `None` if `cell` has no entry, otherwise the
    /// remaining count.
    pub(crate) fn unlock(&mut self, cell: Cell) -> Option<u32> {
        let count = self.counts.get_mut(&cell)?;
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.counts.remove(&cell);
        }
        Some(remaining)
    }

    pub(crate) fn cells(&self) -> impl Iterator<Item = Cell> + '_ {
        self.counts.keys().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.counts.len()
    }

    pub(crate) fn clear(&mut self) {
        self.counts.clear();
    }
}
