//! Heap tunables.

use crate::arena::ARENA_SIZE;

/// How chunks of arenas are obtained from the system.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChunkStrategy {
    /// Requests arena-aligned memory from the global allocator.
    Aligned,
    /// Over-allocates by one arena and rounds the start up to an arena
    /// boundary, recording the gap after the chunk so it can be freed.
    Oversized,
    /// Maps anonymous pages directly, trimming the mapping down to an
    /// arena-aligned run.
    #[cfg(unix)]
    Mapped,
}

impl Default for ChunkStrategy {
    /// Maps pages when the page size is a small multiple of the arena size,
    /// and over-allocates otherwise.
    fn default() -> Self {
        match arenas_per_page() {
            #[cfg(unix)]
            Some(_) => ChunkStrategy::Mapped,
            _ => ChunkStrategy::Oversized,
        }
    }
}

impl ChunkStrategy {
    fn default_arenas_per_chunk(self) -> usize {
        match self {
            ChunkStrategy::Aligned => 4,
            ChunkStrategy::Oversized => 7,
            #[cfg(unix)]
            ChunkStrategy::Mapped => arenas_per_page().map_or(MIN_MAPPED_ARENAS, |per_page| {
                per_page.max(MIN_MAPPED_ARENAS)
            }),
        }
    }
}

/// Paged chunks hold at least this many arenas to limit mapping calls.
const MIN_MAPPED_ARENAS: usize = 4;

/// Pages holding more arenas than this are not worth mapping one by one.
const ARENAS_PER_PAGE_LIMIT: usize = (256 * 1024) / ARENA_SIZE;

/// Returns the system page size.
#[must_use]
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: `sysconf` has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(ARENA_SIZE)
    }
    #[cfg(not(unix))]
    {
        ARENA_SIZE
    }
}

/// Returns how many arenas fit in a page, or `None` when pages are not a
/// usable multiple of the arena size.
fn arenas_per_page() -> Option<usize> {
    let page = page_size();
    debug_assert!(page.is_power_of_two(), "page size {page} is not a power of two");
    let per_page = page / ARENA_SIZE;
    (1..=ARENAS_PER_PAGE_LIMIT)
        .contains(&per_page)
        .then_some(per_page)
}

/// The smallest trigger factor. Lower values would collect before the heap
/// regained its post-collection size.
pub const MIN_TRIGGER_FACTOR: u32 = 100;

/// Configuration for a [`Heap`](crate::Heap).
///
/// ```rust
/// use sweepgc::{ChunkStrategy, HeapConfig};
///
/// let config = HeapConfig::default()
///     .with_max_bytes(64 * 1024 * 1024)
///     .with_trigger_factor(300)
///     .with_chunk_strategy(ChunkStrategy::Oversized);
/// assert_eq!(config.trigger_factor, 300);
/// ```
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// The hard limit on bytes held in arenas. Acquiring an arena beyond
    /// this limit fails.
    pub max_bytes: usize,
    /// Reported out-of-line allocation that forces a collection at the next
    /// allocation slow path.
    pub max_malloc_bytes: usize,
    /// Growth factor in percent: a collection is triggered once the heap
    /// holds `last_bytes * trigger_factor / 100` bytes. Values below 100
    /// are raised to 100.
    pub trigger_factor: u32,
    /// The value of `last_bytes` before the first collection. The trigger
    /// is never computed from less than this, so an emptied heap does not
    /// collect on every allocation.
    pub initial_last_bytes: usize,
    /// Arenas per chunk. Zero selects the default for the strategy: the
    /// arenas in one page but at least 4 when mapping, 7 when
    /// over-allocating.
    pub arenas_per_chunk: usize,
    /// How chunks are allocated.
    pub chunk_strategy: ChunkStrategy,
    /// Nesting depth at which the marker stops recursing and defers
    /// children instead.
    pub max_mark_depth: usize,
    /// Defers every marked object. Enabled by the `assume-low-stack`
    /// feature.
    pub always_defer: bool,
    /// Releases object slot storage on a background thread during sweep.
    pub background_free: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            max_bytes: u32::MAX as usize,
            max_malloc_bytes: u32::MAX as usize,
            trigger_factor: u32::MAX,
            initial_last_bytes: 8192,
            arenas_per_chunk: 0,
            chunk_strategy: ChunkStrategy::default(),
            max_mark_depth: 256,
            always_defer: cfg!(feature = "assume-low-stack"),
            background_free: false,
        }
    }
}

impl HeapConfig {
    /// Sets [`max_bytes`](Self::max_bytes).
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Sets [`max_malloc_bytes`](Self::max_malloc_bytes).
    #[must_use]
    pub fn with_max_malloc_bytes(mut self, max_malloc_bytes: usize) -> Self {
        self.max_malloc_bytes = max_malloc_bytes;
        self
    }

    /// Sets [`trigger_factor`](Self::trigger_factor).
    #[must_use]
    pub fn with_trigger_factor(mut self, percent: u32) -> Self {
        self.trigger_factor = percent.max(MIN_TRIGGER_FACTOR);
        self
    }

    /// Sets [`initial_last_bytes`](Self::initial_last_bytes).
    #[must_use]
    pub fn with_initial_last_bytes(mut self, bytes: usize) -> Self {
        self.initial_last_bytes = bytes;
        self
    }

    /// Sets [`arenas_per_chunk`](Self::arenas_per_chunk).
    #[must_use]
    pub fn with_arenas_per_chunk(mut self, arenas: usize) -> Self {
        self.arenas_per_chunk = arenas;
        self
    }

    /// Sets [`chunk_strategy`](Self::chunk_strategy).
    #[must_use]
    pub fn with_chunk_strategy(mut self, strategy: ChunkStrategy) -> Self {
        self.chunk_strategy = strategy;
        self
    }

    /// Sets [`max_mark_depth`](Self::max_mark_depth).
    #[must_use]
    pub fn with_max_mark_depth(mut self, depth: usize) -> Self {
        self.max_mark_depth = depth;
        self
    }

    /// Sets [`always_defer`](Self::always_defer).
    #[must_use]
    pub fn with_always_defer(mut self, always_defer: bool) -> Self {
        self.always_defer = always_defer;
        self
    }

    /// Sets [`background_free`](Self::background_free).
    #[must_use]
    pub fn with_background_free(mut self, background_free: bool) -> Self {
        self.background_free = background_free;
        self
    }

    pub(crate) fn resolved_arenas_per_chunk(&self) -> usize {
        if self.arenas_per_chunk == 0 {
            self.chunk_strategy.default_arenas_per_chunk()
        } else {
            self.arenas_per_chunk
        }
    }

    pub(crate) fn resolved_trigger_factor(&self) -> u32 {
        self.trigger_factor.max(MIN_TRIGGER_FACTOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_factor_is_at_least_one_hundred() {
        let config = HeapConfig::default().with_trigger_factor(50);
        assert_eq!(config.trigger_factor, MIN_TRIGGER_FACTOR);
        let config = HeapConfig {
            trigger_factor: 0,
            ..HeapConfig::default()
        };
        assert_eq!(config.resolved_trigger_factor(), MIN_TRIGGER_FACTOR);
        assert_eq!(
            HeapConfig::default()
                .with_trigger_factor(250)
                .resolved_trigger_factor(),
            250
        );
    }

    #[test]
    fn chunk_size_follows_the_page_size() {
        let page = page_size();
        assert!(page.is_power_of_two());
        let config = HeapConfig::default();
        let per_chunk = config.resolved_arenas_per_chunk();
        match config.chunk_strategy {
            #[cfg(unix)]
            ChunkStrategy::Mapped => {
                assert_eq!(per_chunk, (page / ARENA_SIZE).max(MIN_MAPPED_ARENAS));
                assert_eq!(per_chunk * ARENA_SIZE % page, 0);
            }
            ChunkStrategy::Oversized => assert_eq!(per_chunk, 7),
            ChunkStrategy::Aligned => unreachable!("never the default"),
        }
        let explicit = HeapConfig::default()
            .with_chunk_strategy(ChunkStrategy::Oversized)
            .with_arenas_per_chunk(3);
        assert_eq!(explicit.resolved_arenas_per_chunk(), 3);
    }
}
