//! Tests that depend on the arena layout. Behavior visible through the public
//! API is tested in the tests/ directory.

use std::sync::Arc;
use std::thread;

use ahash::AHashSet;

use crate::arena::{thing_size, things_per_arena};
use crate::double::DOUBLES_PER_ARENA;
use crate::list::MAX_THREAD_LOCAL_THINGS;
use crate::{
    CollectMode, Context, FinalizeKind, Heap, HeapConfig, Request, RootLocation, Value, ARENA_SIZE,
    OBJECT_CLASS,
};

fn objects_per_arena() -> usize {
    things_per_arena(thing_size(FinalizeKind::Object))
}

#[test]
fn local_lists_refill_in_batches() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();
    assert!(objects_per_arena() > MAX_THREAD_LOCAL_THINGS + 2);

    // The first allocation takes the slow path and claims a batch for the
    // context. The batch is used up before the heap is locked again.
    for _ in 0..MAX_THREAD_LOCAL_THINGS + 2 {
        request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    }

    let stats = heap.stats();
    let objects = stats.kind(FinalizeKind::Object).unwrap();
    assert_eq!(objects.alloc, 2);
    assert_eq!(objects.local_alloc, MAX_THREAD_LOCAL_THINGS as u64);
    assert_eq!(stats.arenas_acquired, 1);
    assert_eq!(stats.gc_bytes, ARENA_SIZE);
}

#[test]
fn freed_cells_are_reused() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();
    let per_arena = objects_per_arena();

    request.enter_local_root_scope();
    let mut kept = Vec::new();
    for i in 0..per_arena {
        let object = request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
        if i % 2 == 0 {
            kept.push(object);
        }
    }
    request.leave_local_root_scope();
    for object in &kept {
        request.push_local_root(Value::Object(*object));
    }

    assert!(request.collect(CollectMode::Normal));
    let stats = heap.stats();
    assert_eq!(stats.kind(FinalizeKind::Object).unwrap().live, kept.len());
    assert_eq!(stats.last_finalized, per_arena - kept.len());
    assert_eq!(stats.arenas_acquired, 1);

    // Every freed cell is handed out again before another arena is needed.
    for _ in 0..per_arena - kept.len() {
        request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    }
    assert_eq!(heap.stats().arenas_acquired, 1);
    request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    assert_eq!(heap.stats().arenas_acquired, 2);
}

#[test]
fn unmarked_double_arenas_are_released() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();

    for i in 0..=DOUBLES_PER_ARENA {
        request.new_double(i as f64).unwrap();
    }
    assert_eq!(heap.stats().arenas_acquired, 2);

    let kept = request.new_double(0.5).unwrap();
    request.push_local_root(Value::Double(kept));
    assert!(request.collect(CollectMode::Normal));

    let stats = heap.stats();
    assert_eq!(stats.doubles.live, 1);
    assert_eq!(stats.doubles.live_arenas, 1);
    assert_eq!(stats.live_arenas(), 1);
    assert_eq!(stats.arenas_released, 1);
    assert_eq!(request.double(kept), Some(0.5));

    // The surviving arena refills the thread-local list before a new arena
    // is acquired.
    for _ in 0..DOUBLES_PER_ARENA - 1 {
        request.new_double(1.0).unwrap();
    }
    assert_eq!(heap.stats().arenas_acquired, 2);
    assert_eq!(request.double(kept), Some(0.5));
}

#[test]
fn collections_are_counted() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();
    request.new_string("short lived").unwrap();
    assert!(request.collect(CollectMode::Normal));
    assert!(request.collect(CollectMode::LastDitch));

    let stats = heap.stats();
    assert_eq!(stats.collections, 2);
    assert_eq!(stats.last_ditch_collections, 1);
    assert_eq!(stats.kind(FinalizeKind::String).unwrap().finalized, 1);
    assert_eq!(stats.gc_bytes, 0);
}

#[test]
fn double_refill_hands_out_each_free_cell_once() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();

    // Fill one arena and leave a single double in a second one.
    for i in 0..=DOUBLES_PER_ARENA {
        request.new_double(i as f64).unwrap();
    }
    let kept = request.new_double(0.25).unwrap();
    request.push_local_root(Value::Double(kept));
    assert!(request.collect(CollectMode::Normal));
    let before = heap.stats();
    assert_eq!(before.doubles.live, 1);
    assert_eq!(before.arenas_acquired, 2);

    let handed_out = (0..DOUBLES_PER_ARENA - 1)
        .map(|i| request.new_double(i as f64).unwrap())
        .collect::<AHashSet<_>>();
    assert_eq!(handed_out.len(), DOUBLES_PER_ARENA - 1);
    assert!(!handed_out.contains(&kept));
    assert!(handed_out.iter().all(|cell| cell.arena() == kept.arena()));
    let after = heap.stats();
    assert_eq!(after.arenas_acquired, 2);
    assert_eq!(after.doubles.alloc, before.doubles.alloc + 1);
    assert_eq!(request.double(kept), Some(0.25));

    // The surviving arena is full now.
    let next = request.new_double(-1.0).unwrap();
    assert_ne!(next.arena(), kept.arena());
    assert_eq!(heap.stats().arenas_acquired, 3);
}

#[test]
fn emptied_heap_keeps_a_trigger() {
    let heap = Heap::new(HeapConfig::default().with_trigger_factor(100));
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();
    request.new_string("garbage").unwrap();
    request.new_string("more garbage").unwrap();
    assert!(request.collect(CollectMode::Normal));
    assert_eq!(heap.gc_bytes(), 0);
    assert!(!request.maybe_collect());

    // One arena is below the initial trigger, so allocation proceeds
    // without collecting.
    for _ in 0..objects_per_arena() {
        request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    }
    let stats = heap.stats();
    assert_eq!(stats.collections, 1);
    assert_eq!(stats.gc_bytes, ARENA_SIZE);
    assert!(!request.maybe_collect());

    // Garbage past the trigger is collected by the allocator.
    for _ in 0..objects_per_arena() * 3 {
        request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    }
    let stats = heap.stats();
    assert!(stats.last_ditch_collections > 0);
    assert!(stats.gc_bytes <= 3 * ARENA_SIZE);
}

/// Collects on this thread while another thread holds a request, running
/// `interrupt` on that thread once the collection is waiting for it.
fn collect_while_waiting<F>(heap: &Arc<Heap>, interrupt: F) -> bool
where
    F: FnOnce(&Arc<Heap>, &mut Request<'_>) -> bool + Send + 'static,
{
    let (started, has_started) = flume::bounded(1);
    let worker = {
        let heap = heap.clone();
        thread::spawn(move || {
            let mut context = Context::new(&heap);
            let mut request = context.begin_request();
            started.send(()).unwrap();
            while !heap.collecting() {
                thread::yield_now();
            }
            interrupt(&heap, &mut request)
        })
    };
    has_started.recv().unwrap();

    let mut context = Context::new(heap);
    let mut request = context.begin_request();
    assert!(request.collect(CollectMode::Normal));
    drop(request);
    worker.join().unwrap()
}

#[test]
fn dropped_roots_restart_a_waiting_collection() {
    let heap = Heap::new(HeapConfig::default());
    let root = RootLocation::default();
    heap.register_root(&root, None);

    let unregistered = collect_while_waiting(&heap, {
        let root = root.clone();
        move |heap, _request| heap.unregister_root(&root)
    });
    assert!(unregistered);
    let stats = heap.stats();
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.collections, 2);
}

#[test]
fn collection_requests_restart_a_waiting_collection() {
    let heap = Heap::new(HeapConfig::default());
    let collected = collect_while_waiting(&heap, |_heap, request| {
        request.collect(CollectMode::Normal)
    });
    // The request was folded into the running collection.
    assert!(!collected);
    let stats = heap.stats();
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.collections, 2);
}

#[test]
fn small_trigger_factors_are_raised() {
    let heap = Heap::new(HeapConfig::default());
    heap.set_trigger_factor(0);
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();
    request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    assert!(!request.maybe_collect());
    assert_eq!(heap.stats().collections, 0);
}
