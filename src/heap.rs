use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;
use std::{array, fmt};

use ahash::AHashSet;
use crossbeam_utils::CachePadded;
use kempt::Map;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::arena::{
    read_flag, thing_flag, write_flag, Arena, ArenaKind, ARENA_SIZE, FINAL, LOCK, MARK,
};
use crate::cell::{Cell, FinalizeKind, TraceKind, EXTERNAL_STRING_LIMIT};
use crate::chunk::ChunkAllocator;
use crate::config::{HeapConfig, MIN_TRIGGER_FACTOR};
use crate::context::{ContextId, ContextRoots, LocalFreeLists};
use crate::double::{self, DoubleArenaList};
use crate::error::{Error, Result};
use crate::list::{ArenaList, MAX_THREAD_LOCAL_THINGS};
use crate::lock::LockTable;
use crate::roots::{RootLocation, RootMapAction, RootTracer, RootTracerId, Roots};
use crate::stats::GcStats;
use crate::sweep::{Deallocator, ExternalFinalizers, ExternalStringFinalizer, Finalizer};
use crate::thing::string_data;
use crate::tracer::{Marker, Trace, Tracer};
use crate::StringData;

/// How a collection treats roots and weak references.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CollectMode {
    /// A regular collection. The requesting context's newborn slots are
    /// cleared first so the last allocations do not linger.
    Normal,
    /// A collection run because allocation failed. Newborn slots are kept,
    /// since the caller is likely mid-construction.
    LastDitch,
    /// The teardown collection. Roots, locks and newborns are ignored and
    /// every remaining cell is finalized. The heap refuses to allocate
    /// afterward.
    Final,
}

/// Receives notifications as collections progress.
///
/// `begin` and `end` run without the heap lock. `mark_end` and
/// `finalize_end` run while the heap is locked and must not call back into
/// it.
pub trait GcObserver: Send + Sync {
    /// Called before a collection starts. Returning `false` cancels any
    /// collection except [`CollectMode::Final`].
    fn begin(&self, mode: CollectMode) -> bool {
        let _ = mode;
        true
    }

    /// Called after marking, before anything is finalized. Weak tables
    /// should drop entries that are about to be finalized here.
    fn mark_end(&self, view: &MarkView<'_>) {
        let _ = view;
    }

    /// Called after every unreachable cell was finalized.
    fn finalize_end(&self) {}

    /// Called after the collection finished.
    fn end(&self, mode: CollectMode) {
        let _ = mode;
    }
}

/// The state of the heap between marking and sweeping.
pub struct MarkView<'a> {
    mode: CollectMode,
    _collection: PhantomData<&'a ()>,
}

impl MarkView<'_> {
    /// Returns the mode of the running collection.
    #[must_use]
    pub fn mode(&self) -> CollectMode {
        self.mode
    }

    /// Returns true if `cell` was not reached by marking and will be
    /// finalized by this collection.
    #[must_use]
    pub fn is_about_to_be_finalized(&self, cell: Cell) -> bool {
        if self.mode == CollectMode::Final {
            return true;
        }
        match cell.arena().kind() {
            ArenaKind::Things(kind) => {
                // SAFETY: The collector holds the heap lock and flags are not
                // modified between marking and sweeping.
                let flag = unsafe { read_flag(thing_flag(cell, kind)) };
                flag & (MARK | LOCK) == 0
            }
            ArenaKind::Doubles => !double::is_marked(cell),
            ArenaKind::Free => true,
        }
    }
}

/// The most mark and sweep passes a final collection runs.
const MAX_FINAL_PASSES: usize = 8;

/// A garbage-collected heap shared by any number of threads.
///
/// Each thread works through its own [`Context`](crate::Context), and
/// touches cells only inside a [`Request`](crate::Request). Collections wait
/// for every other request to end or yield before marking, so cells never
/// change under the marker.
pub struct Heap {
    config: HeapConfig,
    state: Mutex<HeapState>,
    gc_done: Condvar,
    requests_done: Condvar,
    gc_number: CachePadded<AtomicU64>,
    collection_requested: CachePadded<AtomicBool>,
    deallocator: Option<Deallocator>,
}

pub(crate) struct HeapState {
    lists: [ArenaList; FinalizeKind::COUNT],
    doubles: DoubleArenaList,
    chunks: ChunkAllocator,
    arenas: AHashSet<Arena>,
    roots: Roots,
    locks: LockTable,
    contexts: Map<ContextId, Arc<Mutex<ContextRoots>>>,
    observers: Vec<Arc<dyn GcObserver>>,
    external_finalizers: ExternalFinalizers,
    gc_bytes: usize,
    max_bytes: usize,
    last_bytes: usize,
    min_last_bytes: usize,
    trigger_factor: u32,
    trigger_bytes: usize,
    malloc_bytes: usize,
    max_malloc_bytes: usize,
    request_count: usize,
    gc_level: u32,
    gc_thread: Option<ThreadId>,
    poke: bool,
    finished: bool,
    stats: GcStats,
}

impl Heap {
    /// Returns a new heap.
    #[must_use]
    pub fn new(config: HeapConfig) -> Arc<Self> {
        let mut state = HeapState {
            lists: array::from_fn(|index| {
                ArenaList::new(
                    FinalizeKind::from_index(index).expect("index is less than the kind count"),
                )
            }),
            doubles: DoubleArenaList::default(),
            chunks: ChunkAllocator::new(config.chunk_strategy, config.resolved_arenas_per_chunk()),
            arenas: AHashSet::new(),
            roots: Roots::default(),
            locks: LockTable::default(),
            contexts: Map::new(),
            observers: Vec::new(),
            external_finalizers: [None; EXTERNAL_STRING_LIMIT],
            gc_bytes: 0,
            max_bytes: config.max_bytes,
            last_bytes: 0,
            min_last_bytes: config.initial_last_bytes,
            trigger_factor: config.resolved_trigger_factor(),
            trigger_bytes: 0,
            malloc_bytes: 0,
            max_malloc_bytes: config.max_malloc_bytes,
            request_count: 0,
            gc_level: 0,
            gc_thread: None,
            poke: false,
            finished: false,
            stats: GcStats::default(),
        };
        state.set_last_bytes(config.initial_last_bytes);
        let deallocator = if config.background_free {
            Deallocator::spawn()
        } else {
            None
        };
        debug!(
            max_bytes = config.max_bytes,
            arenas_per_chunk = state.chunks.arenas_per_chunk(),
            strategy = ?config.chunk_strategy,
            "created heap"
        );
        Arc::new(Self {
            config,
            state: Mutex::new(state),
            gc_done: Condvar::new(),
            requests_done: Condvar::new(),
            gc_number: CachePadded::new(AtomicU64::new(0)),
            collection_requested: CachePadded::new(AtomicBool::new(false)),
            deallocator,
        })
    }

    /// Returns the configuration this heap was created with.
    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Returns the number of collections started so far. Thread-local free
    /// lists filled under an older number are stale.
    pub(crate) fn gc_number(&self) -> u64 {
        self.gc_number.load(Ordering::Acquire)
    }

    /// Registers `location` as a root. Registering a location again
    /// replaces its name.
    ///
    /// Named roots that are still registered when the heap is finished are
    /// reported as leaks.
    pub fn register_root(&self, location: &RootLocation, name: Option<&'static str>) {
        let mut state = self.state.lock();
        debug_assert!(
            location
                .get()
                .cell()
                .map_or(true, |cell| state.is_live(cell)),
            "registered a root holding a dead cell"
        );
        state.roots.register(location, name);
    }

    /// Unregisters `location`. Returns false if it was not registered.
    ///
    /// Unregistering makes the next allocation slow path consider a
    /// collection.
    pub fn unregister_root(&self, location: &RootLocation) -> bool {
        let mut state = self.state.lock();
        let removed = state.roots.unregister(location);
        state.poke |= removed;
        removed
    }

    /// Visits every registered root. The returned action decides whether the
    /// root stays registered and whether to continue. Returns the number of
    /// roots visited.
    ///
    /// `visit` runs with the heap lock held.
    pub fn map_roots(
        &self,
        visit: impl FnMut(&RootLocation, Option<&'static str>) -> RootMapAction,
    ) -> usize {
        let mut state = self.state.lock();
        let before = state.roots.len();
        let visited = state.roots.map(visit);
        state.poke |= state.roots.len() != before;
        visited
    }

    /// Returns the names of all named roots.
    #[must_use]
    pub fn named_roots(&self) -> Vec<&'static str> {
        self.state.lock().roots.names().collect()
    }

    /// Adds a tracer consulted for roots at the start of every collection.
    pub fn add_root_tracer(&self, tracer: Arc<dyn RootTracer>) -> RootTracerId {
        self.state.lock().roots.add_tracer(tracer)
    }

    /// Removes a root tracer. Returns false if it was already removed.
    pub fn remove_root_tracer(&self, id: RootTracerId) -> bool {
        let mut state = self.state.lock();
        let removed = state.roots.remove_tracer(id);
        state.poke |= removed;
        removed
    }

    /// Keeps `cell` alive until a matching [`unlock`](Self::unlock),
    /// whether or not it is reachable. Locks nest.
    pub fn lock(&self, cell: Cell) {
        let mut state = self.state.lock();
        if !state.is_live(cell) {
            debug_assert!(false, "locked a dead cell");
            return;
        }
        state.stats.locks += 1;
        if let Some(flag) = shallow_lock_flag(cell) {
            // SAFETY: Flags of live cells may be updated under the heap lock.
            let value = unsafe { read_flag(flag) };
            if value & LOCK == 0 {
                // SAFETY: See above.
                unsafe { write_flag(flag, value | LOCK) };
                return;
            }
        }
        let count = state.locks.lock(cell);
        trace!(?cell, count, "locked");
    }

    /// Releases one lock on `cell`. Unlocking a cell that is not locked,
    /// or not live, does nothing.
    pub fn unlock(&self, cell: Cell) {
        let mut state = self.state.lock();
        if !state.is_live(cell) {
            return;
        }
        state.stats.unlocks += 1;
        let shallow = shallow_lock_flag(cell);
        if let Some(flag) = shallow {
            // SAFETY: Flags of live cells may be updated under the heap lock.
            if unsafe { read_flag(flag) } & LOCK == 0 {
                return;
            }
        }
        if state.locks.unlock(cell).is_none() {
            let Some(flag) = shallow else {
                return;
            };
            // SAFETY: See above.
            unsafe { write_flag(flag, read_flag(flag) & !LOCK) };
        }
        state.poke = true;
    }

    /// Adds an observer notified as collections progress.
    pub fn add_observer(&self, observer: Arc<dyn GcObserver>) {
        self.state.lock().observers.push(observer);
    }

    /// Claims the first unused external string type for `finalize`.
    /// Returns `None` when all types are taken.
    pub fn add_external_string_finalizer(&self, finalize: ExternalStringFinalizer) -> Option<u8> {
        let mut state = self.state.lock();
        let (index, slot) = state
            .external_finalizers
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())?;
        *slot = Some(finalize);
        u8::try_from(index).ok()
    }

    /// Releases external string type `index`, returning its finalizer.
    pub fn remove_external_string_finalizer(&self, index: u8) -> Option<ExternalStringFinalizer> {
        self.state
            .lock()
            .external_finalizers
            .get_mut(usize::from(index))?
            .take()
    }

    /// Sets the growth factor, in percent, used to compute the collection
    /// trigger from the bytes held after the last collection. Factors below
    /// [`MIN_TRIGGER_FACTOR`] are raised to it.
    pub fn set_trigger_factor(&self, percent: u32) {
        let mut state = self.state.lock();
        state.trigger_factor = percent.max(MIN_TRIGGER_FACTOR);
        let last_bytes = state.last_bytes;
        state.set_last_bytes(last_bytes);
    }

    /// Sets the hard limit on arena bytes.
    pub fn set_max_bytes(&self, max_bytes: usize) {
        self.state.lock().max_bytes = max_bytes;
    }

    /// Asks the next [`Request::maybe_collect`](crate::Request::maybe_collect)
    /// on any thread to collect.
    pub fn request_collection(&self) {
        self.collection_requested.store(true, Ordering::Release);
    }

    /// Returns the bytes currently held in arenas.
    #[must_use]
    pub fn gc_bytes(&self) -> usize {
        self.state.lock().gc_bytes
    }

    /// Returns a snapshot of the heap statistics.
    #[must_use]
    pub fn stats(&self) -> GcStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.chunks = state.chunks.chunks();
        stats.gc_bytes = state.gc_bytes;
        stats.last_bytes = state.last_bytes;
        stats.roots = state.roots.len();
        stats
    }

    /// Logs the heap statistics.
    pub fn dump_stats(&self) {
        info!("heap statistics\n{}", self.stats());
    }

    /// Returns true if `cell` is a live cell of this heap.
    #[must_use]
    pub fn owns(&self, cell: Cell) -> bool {
        self.state.lock().is_live(cell)
    }

    /// Returns true while a collection is pending or running.
    #[cfg(test)]
    pub(crate) fn collecting(&self) -> bool {
        self.state.lock().gc_level > 0
    }

    /// Returns the kind of arena holding `cell` if `cell` is live.
    pub(crate) fn live_kind(&self, cell: Cell) -> Option<ArenaKind> {
        let state = self.state.lock();
        state.is_live(cell).then(|| cell.arena().kind())
    }

    /// Returns true once the final collection has run.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Runs the final collection, finalizing every remaining cell.
    ///
    /// Afterward, allocation fails with [`Error::ShutDown`]. This must not
    /// be called from inside a request. Dropping the heap finishes it.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        self.collect_locked(&mut state, CollectMode::Final, None, false);
    }

    pub(crate) fn register_context(&self, id: ContextId, roots: Arc<Mutex<ContextRoots>>) {
        self.state.lock().contexts.insert(id, roots);
    }

    pub(crate) fn unregister_context(&self, id: ContextId) {
        let mut state = self.state.lock();
        drop(state.contexts.remove(&id));
        state.poke = true;
    }

    pub(crate) fn begin_request(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.gc_level > 0 && state.gc_thread != Some(me) {
            self.gc_done.wait(&mut state);
        }
        state.request_count += 1;
    }

    pub(crate) fn end_request(&self) {
        let mut state = self.state.lock();
        state.request_count -= 1;
        if state.request_count == 0 && state.gc_level > 0 {
            self.requests_done.notify_all();
        }
    }

    /// Suspends the calling request while a collection is pending or
    /// running on another thread.
    pub(crate) fn yield_request(&self) {
        let mut state = self.state.lock();
        if state.gc_level > 0 && state.gc_thread != Some(thread::current().id()) {
            self.wait_for_collection(&mut state, true);
        }
    }

    /// Collects from inside a request. Returns false if the collection was
    /// cancelled or satisfied by one running on another thread.
    pub(crate) fn collect(&self, mode: CollectMode, requester: ContextId) -> bool {
        let mut state = self.state.lock();
        self.collect_locked(&mut state, mode, Some(requester), true)
    }

    /// Collects if the heap was poked and has grown by more than a quarter
    /// since the last collection, if the trigger was reached, or if a
    /// collection was requested.
    pub(crate) fn maybe_collect(&self, requester: ContextId, local: &mut LocalFreeLists) -> bool {
        let mut state = self.state.lock();
        state.absorb_local(local);
        let grown = state.gc_bytes > state.last_bytes + state.last_bytes / 4;
        let requested = self.collection_requested.swap(false, Ordering::AcqRel);
        if (state.poke && grown) || state.threshold_reached() || requested {
            self.collect_locked(&mut state, CollectMode::Normal, Some(requester), true)
        } else {
            false
        }
    }

    /// Waits for the running collection, discounting the caller's request
    /// so the collector does not wait on it.
    fn wait_for_collection(&self, state: &mut MutexGuard<'_, HeapState>, in_request: bool) {
        let own_requests = usize::from(in_request);
        state.request_count -= own_requests;
        if state.request_count == 0 {
            self.requests_done.notify_all();
        }
        while state.gc_level > 0 {
            self.gc_done.wait(state);
        }
        state.request_count += own_requests;
    }

    fn collect_locked(
        &self,
        state: &mut MutexGuard<'_, HeapState>,
        mode: CollectMode,
        requester: Option<ContextId>,
        in_request: bool,
    ) -> bool {
        let me = thread::current().id();
        loop {
            if state.finished {
                return false;
            }
            if state.gc_level > 0 {
                if state.gc_thread == Some(me) {
                    return false;
                }
                // Make the running collection go around again so it sees
                // whatever this thread just dropped.
                state.gc_level += 1;
                self.wait_for_collection(state, in_request);
                if mode == CollectMode::Final {
                    continue;
                }
                return false;
            }

            if !state.observers.is_empty() {
                let observers = state.observers.clone();
                let proceed = MutexGuard::unlocked(state, || {
                    observers
                        .iter()
                        .fold(true, |proceed, observer| observer.begin(mode) && proceed)
                });
                if !proceed && mode != CollectMode::Final {
                    state.stats.cancelled_collections += 1;
                    debug!(?mode, "collection cancelled by observer");
                    return false;
                }
                if state.gc_level > 0 || state.finished {
                    // Another thread started collecting while unlocked.
                    continue;
                }
            }
            break;
        }

        self.run_collection(state, mode, requester, in_request);
        self.notify_end(state, mode);

        // Observers may drop the last references to roots while the heap
        // is torn down. Sweep until they stop.
        let mut passes = 1;
        while mode == CollectMode::Final && state.poke && passes < MAX_FINAL_PASSES {
            state.stats.restarts += 1;
            debug!(passes, "sweeping the finished heap again");
            self.run_collection(state, mode, requester, in_request);
            self.notify_end(state, mode);
            passes += 1;
        }
        true
    }

    /// Marks and sweeps once no other request is running, repeating while
    /// other threads asked for a collection or dropped roots before marking
    /// began.
    fn run_collection(
        &self,
        state: &mut MutexGuard<'_, HeapState>,
        mode: CollectMode,
        requester: Option<ContextId>,
        in_request: bool,
    ) {
        debug_assert_eq!(state.gc_level, 0);
        state.gc_level = 1;
        state.gc_thread = Some(thread::current().id());
        state.poke = false;
        loop {
            let own_requests = usize::from(in_request);
            state.request_count -= own_requests;
            while state.request_count > 0 {
                self.requests_done.wait(state);
            }
            state.request_count += own_requests;

            self.gc_number.fetch_add(1, Ordering::AcqRel);
            self.mark_and_sweep(state, mode, requester);
            if state.gc_level == 1 && !state.poke {
                break;
            }
            state.gc_level = 1;
            state.poke = false;
            state.stats.restarts += 1;
            debug!(?mode, "restarting collection");
        }

        if mode == CollectMode::Final && !state.finished {
            state.finished = true;
            for name in state.roots.names() {
                warn!(root = name, "root still registered when the heap finished");
            }
        }
        state.gc_level = 0;
        state.gc_thread = None;
        self.collection_requested.store(false, Ordering::Release);
        self.gc_done.notify_all();
    }

    fn notify_end(&self, state: &mut MutexGuard<'_, HeapState>, mode: CollectMode) {
        if !state.observers.is_empty() {
            let observers = state.observers.clone();
            MutexGuard::unlocked(state, || {
                for observer in &observers {
                    observer.end(mode);
                }
            });
        }
    }

    fn mark_and_sweep(&self, state: &mut HeapState, mode: CollectMode, requester: Option<ContextId>) {
        let start = Instant::now();
        let bytes_before = state.gc_bytes;

        state.doubles.begin_marking();
        let mut tracer = Tracer::marking(Marker::new(
            self.config.max_mark_depth,
            self.config.always_defer,
        ));
        if mode == CollectMode::Final {
            state.locks.clear();
            for roots in state.contexts.values() {
                roots.lock().clear();
            }
        } else {
            state.trace_roots(&mut tracer, mode, requester);
        }
        tracer.drain_deferred();
        let marker = tracer
            .into_marker()
            .expect("collections always use a marking tracer");
        state.stats.deferred += marker.deferred.total as u64;
        state.stats.max_deferred = state.stats.max_deferred.max(marker.deferred.max_pending);

        let view = MarkView {
            mode,
            _collection: PhantomData,
        };
        for observer in &state.observers {
            observer.mark_end(&view);
        }

        let final_sweep = mode == CollectMode::Final;
        let mut empty = Vec::new();
        let mut finalized = 0;
        {
            let finalizer = Finalizer::new(&state.external_finalizers, self.deallocator.as_ref());
            for list in &mut state.lists {
                let kind = list.kind();
                let counts = list.sweep(&finalizer, final_sweep, &mut empty);
                let stats = state.stats.kind_mut(kind);
                stats.live = counts.live;
                stats.live_arenas = counts.live_arenas;
                stats.finalized += counts.finalized as u64;
                finalized += counts.finalized;
            }
        }
        let (live_doubles, double_arenas) = state.doubles.sweep(final_sweep, &mut empty);
        state.stats.doubles.live = live_doubles;
        state.stats.doubles.live_arenas = double_arenas;

        for observer in &state.observers {
            observer.finalize_end();
        }

        let released = empty.len();
        for arena in empty {
            state.release_arena(arena);
        }

        let bytes_after = state.gc_bytes;
        state.set_last_bytes(bytes_after);
        state.malloc_bytes = 0;
        let pause = start.elapsed();
        state.stats.collections += 1;
        if mode == CollectMode::LastDitch {
            state.stats.last_ditch_collections += 1;
        }
        state.stats.last_finalized = finalized;
        state.stats.last_pause = pause;

        debug!(
            ?mode,
            bytes_before,
            bytes_after,
            marked = marker.marked,
            deferred = marker.deferred.total,
            finalized,
            released,
            ?pause,
            "collected"
        );
    }

    /// Allocates a finalizable cell after the thread-local free list ran
    /// dry, refilling that list when possible.
    ///
    /// The returned cell is flagged `FINAL` until its payload is written.
    pub(crate) fn allocate_slow(
        &self,
        kind: FinalizeKind,
        local: &mut LocalFreeLists,
        can_collect: bool,
    ) -> Result<Cell> {
        let mut state = self.state.lock();
        self.pause_for_collection(&mut state);
        state.absorb_local(local);
        if state.finished {
            return Err(Error::ShutDown);
        }
        state.stats.kind_mut(kind).alloc += 1;

        let index = kind.index();
        let mut collected = false;
        if can_collect && state.threshold_reached() {
            state.stats.kind_mut(kind).retry += 1;
            self.last_ditch(&mut state)?;
            collected = true;
        }
        loop {
            local.sync(self.gc_number());
            let refill = local.things[index].is_none() && !state.malloc_exhausted();
            if let Some(cell) = state.lists[index].pop_free() {
                if refill {
                    local.things[index] =
                        state.lists[index].take_free_batch(MAX_THREAD_LOCAL_THINGS);
                }
                return Ok(cell);
            }
            if let Some(cell) = state.lists[index].bump() {
                if refill {
                    local.things[index] = state.lists[index].claim_tail(MAX_THREAD_LOCAL_THINGS);
                }
                return Ok(cell);
            }

            if let Some(arena) = state.new_arena() {
                state.lists[index].push_arena(arena);
                continue;
            }
            if collected || !can_collect {
                state.stats.kind_mut(kind).fail += 1;
                warn!(?kind, gc_bytes = state.gc_bytes, "out of memory");
                return Err(Error::OutOfMemory);
            }
            state.stats.kind_mut(kind).retry += 1;
            self.last_ditch(&mut state)?;
            collected = true;
        }
    }

    /// Refills the thread-local double free list, returning its first cell.
    pub(crate) fn refill_doubles(
        &self,
        local: &mut LocalFreeLists,
        can_collect: bool,
    ) -> Result<Cell> {
        let mut state = self.state.lock();
        self.pause_for_collection(&mut state);
        state.absorb_local(local);
        if state.finished {
            return Err(Error::ShutDown);
        }
        state.stats.doubles.alloc += 1;

        let mut collected = false;
        if can_collect && state.threshold_reached() {
            state.stats.doubles.retry += 1;
            self.last_ditch(&mut state)?;
            collected = true;
        }
        loop {
            local.sync(self.gc_number());
            if let Some((head, count)) = state.doubles.refill_from_cursor() {
                trace!(count, "refilled doubles from a used arena");
                return Ok(head);
            }
            if let Some(arena) = state.new_arena() {
                let (head, count) = state.doubles.push_arena(arena);
                trace!(count, "refilled doubles from a new arena");
                return Ok(head);
            }
            if collected || !can_collect {
                state.stats.doubles.fail += 1;
                warn!(gc_bytes = state.gc_bytes, "out of memory allocating doubles");
                return Err(Error::OutOfMemory);
            }
            state.stats.doubles.retry += 1;
            self.last_ditch(&mut state)?;
            collected = true;
        }
    }

    /// Collects because an allocation could not be satisfied.
    fn last_ditch(&self, state: &mut MutexGuard<'_, HeapState>) -> Result<()> {
        self.collect_locked(state, CollectMode::LastDitch, None, true);
        if state.finished {
            Err(Error::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Lets a collection pending on another thread proceed before this
    /// request touches the heap.
    fn pause_for_collection(&self, state: &mut MutexGuard<'_, HeapState>) {
        if state.gc_level > 0 && state.gc_thread != Some(thread::current().id()) {
            self.wait_for_collection(state, true);
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.finish();
        let state = self.state.get_mut();
        debug_assert!(state.arenas.is_empty(), "arenas remain after the final collection");
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Heap")
            .field("gc_bytes", &state.gc_bytes)
            .field("last_bytes", &state.last_bytes)
            .field("trigger_bytes", &state.trigger_bytes)
            .field("arenas", &state.arenas.len())
            .field("roots", &state.roots.len())
            .field("locks", &state.locks.len())
            .field("finished", &state.finished)
            .finish_non_exhaustive()
    }
}

/// Returns the flag byte used to lock `cell` without the lock table. Only
/// flat strings qualify.
fn shallow_lock_flag(cell: Cell) -> Option<*mut u8> {
    let kind = cell.finalize_kind()?;
    if kind.trace_kind() != TraceKind::String {
        return None;
    }
    // SAFETY: The caller holds the heap lock and `cell` is a live string.
    match unsafe { string_data(cell) } {
        StringData::Flat(_) => Some(thing_flag(cell, kind)),
        StringData::Dependent { .. } | StringData::Rope { .. } => None,
    }
}

impl HeapState {
    fn new_arena(&mut self) -> Option<Arena> {
        if self.gc_bytes.saturating_add(ARENA_SIZE) > self.max_bytes {
            return None;
        }
        let arena = self.chunks.acquire()?;
        self.arenas.insert(arena);
        self.gc_bytes += ARENA_SIZE;
        self.stats.arenas_acquired += 1;
        trace!(arena = ?arena.start(), gc_bytes = self.gc_bytes, "acquired arena");
        Some(arena)
    }

    fn release_arena(&mut self, arena: Arena) {
        self.arenas.remove(&arena);
        self.gc_bytes -= ARENA_SIZE;
        self.stats.arenas_released += 1;
        self.chunks.release(arena);
    }

    /// Records the bytes held after a collection and recomputes the trigger.
    /// The trigger never drops below the one computed for the initial
    /// `last_bytes`.
    fn set_last_bytes(&mut self, last_bytes: usize) {
        self.last_bytes = last_bytes;
        let base = last_bytes.max(self.min_last_bytes);
        let trigger = u128::from(base as u64) * u128::from(self.trigger_factor) / 100;
        self.trigger_bytes = usize::try_from(trigger).unwrap_or(usize::MAX);
    }

    fn threshold_reached(&self) -> bool {
        self.malloc_exhausted() || self.gc_bytes >= self.trigger_bytes
    }

    fn malloc_exhausted(&self) -> bool {
        self.malloc_bytes >= self.max_malloc_bytes
    }

    fn absorb_local(&mut self, local: &mut LocalFreeLists) {
        self.malloc_bytes = self
            .malloc_bytes
            .saturating_add(std::mem::take(&mut local.malloc_bytes));
        for (kind, count) in local.local_allocs.iter_mut().enumerate() {
            self.stats.kinds[kind].local_alloc += std::mem::take(count);
        }
        self.stats.doubles.local_alloc += std::mem::take(&mut local.local_doubles);
    }

    /// Returns true if `cell` is an allocated cell of a live arena.
    fn is_live(&self, cell: Cell) -> bool {
        let arena = cell.arena();
        if !self.arenas.contains(&arena) {
            return false;
        }
        match arena.kind() {
            ArenaKind::Things(kind) => {
                // SAFETY: The arena is live and the heap lock is held.
                let flag = unsafe { read_flag(thing_flag(cell, kind)) };
                flag & FINAL == 0
            }
            ArenaKind::Doubles => true,
            ArenaKind::Free => false,
        }
    }

    fn trace_roots(&self, tracer: &mut Tracer<'_>, mode: CollectMode, requester: Option<ContextId>) {
        for value in self.roots.values() {
            debug_assert!(
                value.cell().map_or(true, |cell| self.is_live(cell)),
                "a registered root holds a dead cell: {value:?}"
            );
            tracer.trace_value(value);
        }
        self.roots.trace_tracers(tracer);

        for cell in self.locks.cells() {
            if let Some(kind) = cell.trace_kind() {
                tracer.trace(cell, kind);
            }
        }

        for roots in self.contexts.values() {
            let mut roots = roots.lock();
            if mode == CollectMode::Normal && Some(roots.id()) == requester {
                roots.clear_newborns();
            }
            roots.trace(tracer);
        }
    }
}
