//! Chunks of arenas obtained from the system allocator or mapped directly.
//!
//! A chunk is a run of `arenas_per_chunk` arenas. Chunks with at least one
//! free arena are kept on a doubly linked list whose nodes live inside one of
//! the chunk's own free arenas. The first arena of each chunk records which
//! arena holds that node, so releasing an arena finds its chunk's free list
//! in constant time.

use std::alloc::{self, Layout};
use std::mem;
use std::ptr::NonNull;

use tracing::{trace, warn};

use crate::arena::{Arena, ARENA_MASK, ARENA_SIZE, INFO_OFFSET};
use crate::config::ChunkStrategy;

/// The chunk info index recorded when a chunk has no free arenas.
pub(crate) const NO_FREE_ARENAS: u16 = u16::MAX;

#[repr(C)]
struct ChunkInfo {
    prev: Option<NonNull<ChunkInfo>>,
    next: Option<NonNull<ChunkInfo>>,
    last_free_arena: Option<Arena>,
    free_arenas: usize,
}

const _: () = assert!(mem::size_of::<ChunkInfo>() <= INFO_OFFSET);

pub(crate) struct ChunkAllocator {
    strategy: ChunkStrategy,
    arenas_per_chunk: usize,
    with_free_arenas: Option<NonNull<ChunkInfo>>,
    chunks: usize,
}

// SAFETY: The allocator only hands out raw memory it owns. It is always
// accessed through the heap lock.
unsafe impl Send for ChunkAllocator {}

impl ChunkAllocator {
    pub(crate) fn new(strategy: ChunkStrategy, arenas_per_chunk: usize) -> Self {
        let arenas_per_chunk = arenas_per_chunk.clamp(1, usize::from(NO_FREE_ARENAS - 1));
        Self {
            strategy,
            arenas_per_chunk,
            with_free_arenas: None,
            chunks: 0,
        }
    }

    pub(crate) fn chunks(&self) -> usize {
        self.chunks
    }

    pub(crate) fn arenas_per_chunk(&self) -> usize {
        self.arenas_per_chunk
    }

    /// Returns a free arena, carving a new chunk when no chunk has one.
    ///
    /// The returned arena's header is initialized but its cells and flags are
    /// not.
    pub(crate) fn acquire(&mut self) -> Option<Arena> {
        if self.arenas_per_chunk == 1 {
            let chunk = self.new_chunk()?;
            // SAFETY: `new_chunk` returns arena-aligned memory sized for one
            // arena.
            let arena = unsafe { Arena::from_start(chunk) };
            arena.init_in_chunk(0, None);
            return Some(arena);
        }

        if let Some(mut info) = self.with_free_arenas {
            // SAFETY: Chunk infos on the free list live in free arenas owned
            // by this allocator.
            let info = unsafe { info.as_mut() };
            let arena = info
                .last_free_arena
                .expect("chunks on the free list have a free arena");
            if let Some(prev) = arena.prev() {
                info.last_free_arena = Some(prev);
                info.free_arenas -= 1;
            } else {
                // The last free arena is the one holding the chunk info.
                debug_assert_eq!(info.free_arenas, 1);
                self.unlink(NonNull::from(info));
                // SAFETY: The chunk start is the first arena of this chunk.
                let first = unsafe { Arena::from_start(arena.chunk_start()) };
                first.set_chunk_info_index(NO_FREE_ARENAS);
            }
            return Some(arena);
        }

        let chunk = self.new_chunk()?;
        let mut prev = None;
        let mut last = None;
        for index in 0..self.arenas_per_chunk {
            // SAFETY: `new_chunk` returns `arenas_per_chunk` arena-aligned
            // arenas laid out back to back.
            let arena = unsafe {
                Arena::from_start(NonNull::new_unchecked(
                    chunk.as_ptr().add(index * ARENA_SIZE),
                ))
            };
            #[allow(clippy::cast_possible_truncation)] // clamped in `new`
            arena.init_in_chunk(index as u16, prev);
            prev = Some(arena);
            last = Some(arena);
        }
        let returned = last.expect("chunks have at least two arenas");
        let last_free = returned.prev();
        // SAFETY: Index zero is the start of the chunk.
        let first = unsafe { Arena::from_start(chunk) };
        first.set_chunk_info_index(0);
        let info = chunk.cast::<ChunkInfo>();
        // SAFETY: The first arena is free and large enough for the info.
        unsafe {
            info.as_ptr().write(ChunkInfo {
                prev: None,
                next: None,
                last_free_arena: last_free,
                free_arenas: self.arenas_per_chunk - 1,
            });
        }
        self.push(info);
        Some(returned)
    }

    /// Returns `arena` to its chunk, freeing the chunk once every arena in
    /// it is free.
    pub(crate) fn release(&mut self, arena: Arena) {
        arena.mark_free();
        #[cfg(debug_assertions)]
        // SAFETY: Everything below the header belongs to the arena.
        unsafe {
            std::ptr::write_bytes(arena.start(), crate::sweep::FREE_PATTERN, INFO_OFFSET);
        }

        let chunk = arena.chunk_start();
        if self.arenas_per_chunk == 1 {
            // SAFETY: Single-arena chunks are released as soon as their
            // arena is.
            unsafe { self.destroy_chunk(chunk) };
            return;
        }

        // SAFETY: The chunk start is the first arena of this chunk.
        let first = unsafe { Arena::from_start(chunk) };
        let info_index = first.chunk_info_index();
        if info_index == NO_FREE_ARENAS {
            #[allow(clippy::cast_possible_truncation)] // clamped in `new`
            first.set_chunk_info_index(arena.index() as u16);
            arena.set_prev(None);
            let info = arena.start_ptr().cast::<ChunkInfo>();
            // SAFETY: The arena was just freed and can hold the info.
            unsafe {
                info.as_ptr().write(ChunkInfo {
                    prev: None,
                    next: None,
                    last_free_arena: Some(arena),
                    free_arenas: 1,
                });
            }
            self.push(info);
            return;
        }

        // SAFETY: The info index names a free arena of this chunk holding the
        // chunk info.
        let mut info_ptr = unsafe {
            NonNull::new_unchecked(chunk.as_ptr().add(usize::from(info_index) * ARENA_SIZE))
                .cast::<ChunkInfo>()
        };
        // SAFETY: See above.
        let info = unsafe { info_ptr.as_mut() };
        if info.free_arenas == self.arenas_per_chunk - 1 {
            self.unlink(info_ptr);
            // SAFETY: Every arena of the chunk is now free.
            unsafe { self.destroy_chunk(chunk) };
        } else {
            arena.set_prev(info.last_free_arena);
            info.last_free_arena = Some(arena);
            info.free_arenas += 1;
        }
    }

    fn push(&mut self, mut info: NonNull<ChunkInfo>) {
        // SAFETY: `info` and the current head are valid chunk infos.
        unsafe {
            info.as_mut().prev = None;
            info.as_mut().next = self.with_free_arenas;
            if let Some(mut head) = self.with_free_arenas {
                head.as_mut().prev = Some(info);
            }
        }
        self.with_free_arenas = Some(info);
    }

    fn unlink(&mut self, info: NonNull<ChunkInfo>) {
        // SAFETY: `info` and its neighbors are valid chunk infos.
        unsafe {
            let ChunkInfo { prev, next, .. } = *info.as_ptr();
            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.with_free_arenas = next,
            }
            if let Some(mut next) = next {
                next.as_mut().prev = prev;
            }
        }
    }

    fn chunk_size(&self) -> usize {
        self.arenas_per_chunk * ARENA_SIZE
    }

    fn layout(&self) -> Option<Layout> {
        match self.strategy {
            ChunkStrategy::Aligned => Layout::from_size_align(self.chunk_size(), ARENA_SIZE).ok(),
            ChunkStrategy::Oversized => Layout::from_size_align(
                self.chunk_size() + ARENA_SIZE,
                mem::align_of::<u32>(),
            )
            .ok(),
            #[cfg(unix)]
            ChunkStrategy::Mapped => None,
        }
    }

    fn new_chunk(&mut self) -> Option<NonNull<u8>> {
        #[cfg(unix)]
        if self.strategy == ChunkStrategy::Mapped {
            let chunk = mapped::map(self.chunk_size())?;
            self.chunks += 1;
            trace!(chunk = ?chunk, arenas = self.arenas_per_chunk, "mapped chunk");
            return Some(chunk);
        }

        let layout = self.layout()?;
        // SAFETY: The layout has a non-zero size.
        let allocation = NonNull::new(unsafe { alloc::alloc(layout) })?;
        let chunk = match self.strategy {
            ChunkStrategy::Aligned => allocation,
            #[cfg(unix)]
            ChunkStrategy::Mapped => unreachable!("mapped chunks return early"),
            ChunkStrategy::Oversized => {
                let gap = (ARENA_SIZE - (allocation.as_ptr() as usize & ARENA_MASK)) & ARENA_MASK;
                // SAFETY: The allocation has an extra arena of room, so both
                // the rounded-up chunk and the gap record after it fit.
                unsafe {
                    let chunk = allocation.as_ptr().add(gap);
                    #[allow(clippy::cast_possible_truncation)] // gap < ARENA_SIZE
                    chunk
                        .add(self.chunk_size())
                        .cast::<u32>()
                        .write_unaligned(gap as u32);
                    NonNull::new_unchecked(chunk)
                }
            }
        };
        self.chunks += 1;
        trace!(chunk = ?chunk, arenas = self.arenas_per_chunk, "allocated chunk");
        Some(chunk)
    }

    /// # Safety
    ///
    /// `chunk` must have been returned by `new_chunk` and none of its arenas
    /// may be in use.
    unsafe fn destroy_chunk(&mut self, chunk: NonNull<u8>) {
        #[cfg(unix)]
        if self.strategy == ChunkStrategy::Mapped {
            mapped::unmap(chunk, self.chunk_size());
            self.chunks -= 1;
            trace!(chunk = ?chunk, "unmapped chunk");
            return;
        }

        let Some(layout) = self.layout() else {
            unreachable!("layout was valid when the chunk was allocated")
        };
        let allocation = match self.strategy {
            ChunkStrategy::Aligned => chunk.as_ptr(),
            #[cfg(unix)]
            ChunkStrategy::Mapped => unreachable!("mapped chunks return early"),
            ChunkStrategy::Oversized => {
                let gap = chunk
                    .as_ptr()
                    .add(self.chunk_size())
                    .cast::<u32>()
                    .read_unaligned();
                chunk.as_ptr().sub(gap as usize)
            }
        };
        alloc::dealloc(allocation, layout);
        self.chunks -= 1;
        trace!(chunk = ?chunk, "released chunk");
    }
}

impl Drop for ChunkAllocator {
    fn drop(&mut self) {
        if self.chunks > 0 {
            warn!(chunks = self.chunks, "heap dropped with chunks still allocated");
        }
    }
}

/// Anonymous page mappings aligned to the arena size.
#[cfg(unix)]
mod mapped {
    use std::ptr::{self, NonNull};

    use crate::arena::{ARENA_MASK, ARENA_SIZE};

    /// Maps `size` bytes starting on an arena boundary.
    ///
    /// `size` must be a multiple of the arena size. Mappings are only
    /// page-aligned, so one extra arena is mapped and the unaligned head and
    /// tail are unmapped again.
    pub(super) fn map(size: usize) -> Option<NonNull<u8>> {
        debug_assert_eq!(size & ARENA_MASK, 0);
        let padded = size.checked_add(ARENA_SIZE)?;
        // SAFETY: Anonymous private mappings have no preconditions.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                padded,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return None;
        }
        let base = base.cast::<u8>();
        let head = (ARENA_SIZE - (base as usize & ARENA_MASK)) & ARENA_MASK;
        let tail = ARENA_SIZE - head;
        // SAFETY: Both trims lie inside the mapping just created. The head
        // and tail are page multiples because the arena size is.
        unsafe {
            if head > 0 {
                libc::munmap(base.cast(), head);
            }
            let chunk = base.add(head);
            if tail > 0 {
                libc::munmap(chunk.add(size).cast(), tail);
            }
            Some(NonNull::new_unchecked(chunk))
        }
    }

    /// # Safety
    ///
    /// `chunk` must have been returned by [`map`] with the same `size`.
    pub(super) unsafe fn unmap(chunk: NonNull<u8>, size: usize) {
        libc::munmap(chunk.as_ptr().cast(), size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(strategy: ChunkStrategy, per_chunk: usize) {
        let mut chunks = ChunkAllocator::new(strategy, per_chunk);
        let arenas = (0..per_chunk * 3)
            .map(|_| chunks.acquire().expect("allocation failed"))
            .collect::<Vec<_>>();
        assert_eq!(chunks.chunks(), 3);
        for arena in &arenas {
            assert_eq!(arena.start() as usize & ARENA_MASK, 0);
        }

        let (firsts, rest): (Vec<Arena>, Vec<Arena>) =
            arenas.into_iter().partition(|arena| arena.index() == 0);
        assert_eq!(firsts.len(), 3);

        // Releasing all but one arena of each chunk keeps every chunk alive.
        for arena in rest {
            chunks.release(arena);
        }
        assert_eq!(chunks.chunks(), 3);

        // Reacquiring reuses the freed arenas rather than new chunks.
        let reused = (0..per_chunk - 1)
            .map(|_| chunks.acquire().expect("allocation failed"))
            .collect::<Vec<_>>();
        assert_eq!(chunks.chunks(), 3);
        for arena in reused {
            chunks.release(arena);
        }

        for arena in firsts {
            chunks.release(arena);
        }
        assert_eq!(chunks.chunks(), 0);
    }

    #[test]
    fn aligned_chunks() {
        exercise(ChunkStrategy::Aligned, 4);
    }

    #[test]
    fn oversized_chunks() {
        exercise(ChunkStrategy::Oversized, 7);
    }

    #[test]
    #[cfg(unix)]
    fn mapped_chunks() {
        exercise(ChunkStrategy::Mapped, 4);
        exercise(ChunkStrategy::Mapped, (crate::page_size() / ARENA_SIZE).max(2));
    }

    #[test]
    #[cfg(unix)]
    fn mapped_chunks_are_writable() {
        let mut chunks = ChunkAllocator::new(ChunkStrategy::Mapped, 1);
        let arena = chunks.acquire().expect("mapping failed");
        // SAFETY: The whole arena below the header belongs to the test.
        unsafe {
            std::ptr::write_bytes(arena.start(), 0xAB, INFO_OFFSET);
            assert_eq!(*arena.start().add(INFO_OFFSET - 1), 0xAB);
        }
        chunks.release(arena);
        assert_eq!(chunks.chunks(), 0);
    }

    #[test]
    fn single_arena_chunks() {
        let mut chunks = ChunkAllocator::new(ChunkStrategy::Aligned, 1);
        let a = chunks.acquire().expect("allocation failed");
        let b = chunks.acquire().expect("allocation failed");
        assert_eq!(chunks.chunks(), 2);
        chunks.release(a);
        chunks.release(b);
        assert_eq!(chunks.chunks(), 0);
    }
}
