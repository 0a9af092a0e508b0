use std::fmt;
use std::time::Duration;

use crate::cell::FinalizeKind;

/// Allocation and sweep counters for one kind of cell.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KindStats {
    /// Allocations that took the locked slow path.
    pub alloc: u64,
    /// Allocations served from a thread-local free list.
    pub local_alloc: u64,
    /// Last-ditch collections run while allocating this kind.
    pub retry: u64,
    /// Allocations that failed with an out-of-memory error.
    pub fail: u64,
    /// Cells that survived the last collection.
    pub live: usize,
    /// Cells finalized over the life of the heap.
    pub finalized: u64,
    /// Arenas that survived the last collection.
    pub live_arenas: usize,
}

/// A snapshot of heap statistics, returned by
/// [`Heap::stats`](crate::Heap::stats).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GcStats {
    /// Completed collections of every mode.
    pub collections: u64,
    /// Completed last-ditch collections.
    pub last_ditch_collections: u64,
    /// Collections cancelled by an observer.
    pub cancelled_collections: u64,
    /// Extra mark and sweep passes, run when a collection was requested
    /// again or roots were dropped while one was in progress.
    pub restarts: u64,
    /// Counters for each finalize kind, indexed by
    /// [`FinalizeKind::index`].
    pub kinds: [KindStats; FinalizeKind::COUNT],
    /// Counters for doubles. `finalized` is not maintained for doubles.
    pub doubles: KindStats,
    /// Arenas acquired from chunks.
    pub arenas_acquired: u64,
    /// Arenas returned to chunks.
    pub arenas_released: u64,
    /// Chunks currently allocated.
    pub chunks: usize,
    /// Bytes currently held in arenas.
    pub gc_bytes: usize,
    /// The arena bytes held after the last collection.
    pub last_bytes: usize,
    /// Cells deferred by the marker over the life of the heap.
    pub deferred: u64,
    /// The largest number of cells pending on the deferred stack at once.
    pub max_deferred: usize,
    /// Cells finalized by the last collection.
    pub last_finalized: usize,
    /// How long the last collection held the heap lock.
    pub last_pause: Duration,
    /// Lock calls.
    pub locks: u64,
    /// Unlock calls.
    pub unlocks: u64,
    /// Registered roots.
    pub roots: usize,
}

impl GcStats {
    /// Returns the counters for `kind`, or `None` if `kind` names an
    /// external string type beyond
    /// [`EXTERNAL_STRING_LIMIT`](crate::EXTERNAL_STRING_LIMIT).
    #[must_use]
    pub fn kind(&self, kind: FinalizeKind) -> Option<&KindStats> {
        self.kinds.get(kind.index())
    }

    pub(crate) fn kind_mut(&mut self, kind: FinalizeKind) -> &mut KindStats {
        &mut self.kinds[kind.index()]
    }

    /// Returns the number of arenas holding live cells.
    #[must_use]
    pub fn live_arenas(&self) -> usize {
        self.kinds.iter().map(|kind| kind.live_arenas).sum::<usize>() + self.doubles.live_arenas
    }
}

impl fmt::Display for GcStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} collections ({} last-ditch, {} cancelled, {} restarts), {} bytes in {} chunks",
            self.collections,
            self.last_ditch_collections,
            self.cancelled_collections,
            self.restarts,
            self.gc_bytes,
            self.chunks
        )?;
        writeln!(
            f,
            "{:<16} {:>10} {:>10} {:>6} {:>6} {:>10} {:>10} {:>8}",
            "kind", "alloc", "local", "retry", "fail", "live", "finalized", "arenas"
        )?;
        let rows = FinalizeKind::all()
            .map(|kind| (format!("{kind:?}"), &self.kinds[kind.index()]))
            .chain(std::iter::once((String::from("Double"), &self.doubles)));
        for (name, kind) in rows {
            writeln!(
                f,
                "{:<16} {:>10} {:>10} {:>6} {:>6} {:>10} {:>10} {:>8}",
                name,
                kind.alloc,
                kind.local_alloc,
                kind.retry,
                kind.fail,
                kind.live,
                kind.finalized,
                kind.live_arenas
            )?;
        }
        write!(
            f,
            "deferred {} (max {}), arenas acquired {} released {}, last pause {:?}",
            self.deferred,
            self.max_deferred,
            self.arenas_acquired,
            self.arenas_released,
            self.last_pause
        )
    }
}
