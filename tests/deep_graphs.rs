use std::sync::Arc;

use parking_lot::Mutex;
use sweepgc::{
    Cell, CollectMode, Context, GcObserver, Heap, HeapConfig, MarkView, RootLocation, Value,
    OBJECT_CLASS,
};

const CHAIN_LENGTH: usize = 100_000;

/// Records whether each probed cell was about to be finalized during the
/// last collection.
#[derive(Default)]
struct Probe {
    cells: Mutex<Vec<Cell>>,
    doomed: Mutex<Vec<bool>>,
}

impl GcObserver for Probe {
    fn mark_end(&self, view: &MarkView<'_>) {
        let cells = self.cells.lock();
        *self.doomed.lock() = cells
            .iter()
            .map(|cell| view.is_about_to_be_finalized(*cell))
            .collect();
    }
}

#[test]
fn long_chains_are_marked_iteratively() {
    let heap = Heap::new(HeapConfig::default().with_max_mark_depth(64));
    let probe = Arc::new(Probe::default());
    heap.add_observer(probe.clone());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();

    // Each object refers to the previous one. Only the newest is rooted.
    let tail = request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    let mut head = tail;
    for _ in 1..CHAIN_LENGTH {
        head = request
            .new_object(&OBJECT_CLASS, vec![Value::Object(head)])
            .unwrap();
    }
    let root = RootLocation::new(Value::Object(head));
    heap.register_root(&root, Some("chain"));
    let garbage = request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    *probe.cells.lock() = vec![head, tail, garbage];

    assert!(request.collect(CollectMode::Normal));

    let stats = heap.stats();
    assert!(stats.deferred > 0);
    assert!(stats.max_deferred > 0);
    assert_eq!(stats.kind(sweepgc::FinalizeKind::Object).unwrap().live, CHAIN_LENGTH);
    assert_eq!(stats.last_finalized, 2);
    assert_eq!(*probe.doomed.lock(), [false, false, true]);

    let mut length = 1;
    let mut current = head;
    while let Some(Value::Object(next)) = request.object(current).unwrap().slot(0) {
        current = next;
        length += 1;
    }
    assert_eq!(length, CHAIN_LENGTH);
    assert_eq!(current, tail);
}

#[test]
fn always_defer() {
    let heap = Heap::new(HeapConfig::default().with_always_defer(true));
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();

    // A small tree where every node refers to its parent and a label.
    request.enter_local_root_scope();
    let mut level = vec![request.new_object(&OBJECT_CLASS, Vec::new()).unwrap()];
    let mut total = 1;
    for depth in 0..8 {
        let mut next = Vec::new();
        for parent in &level {
            for _ in 0..2 {
                let label = request.new_string(&format!("node {depth}")).unwrap();
                let node = request
                    .new_object(
                        &OBJECT_CLASS,
                        vec![Value::Object(*parent), Value::String(label)],
                    )
                    .unwrap();
                next.push(node);
                total += 1;
            }
        }
        level = next;
    }
    let leaves = level.clone();
    request.leave_local_root_scope();
    request.enter_local_root_scope();
    for leaf in &leaves {
        request.push_local_root(Value::Object(*leaf));
    }

    assert!(request.collect(CollectMode::Normal));
    let stats = heap.stats();
    assert_eq!(stats.deferred, total as u64);
    assert_eq!(stats.kind(sweepgc::FinalizeKind::Object).unwrap().live, total);
    assert_eq!(stats.kind(sweepgc::FinalizeKind::String).unwrap().live, total - 1);
    assert_eq!(stats.last_finalized, 0);
}

#[test]
fn long_ropes_are_marked_iteratively() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();

    let mut rope = request.new_string("a").unwrap();
    for _ in 0..CHAIN_LENGTH {
        let leaf = request.new_string("b").unwrap();
        rope = request.new_rope(rope, leaf).unwrap();
    }
    let root = RootLocation::new(Value::String(rope));
    heap.register_root(&root, None);
    request.new_string("replaces the newborn").unwrap();

    assert!(request.collect(CollectMode::Normal));
    let stats = heap.stats();
    assert_eq!(stats.last_finalized, 1);
    assert_eq!(
        stats.kind(sweepgc::FinalizeKind::String).unwrap().live,
        CHAIN_LENGTH * 2 + 1
    );

    let contents = request.string_contents(rope).unwrap();
    assert_eq!(contents.len(), CHAIN_LENGTH + 1);
    assert!(contents.starts_with("ab"));
    assert_eq!(request.string(rope).unwrap().len(), CHAIN_LENGTH + 1);

    // Taking a substring of a rope flattens it first.
    let middle = request.new_dependent_string(rope, 1, 3).unwrap();
    assert_eq!(request.string_contents(middle).as_deref(), Some("bbb"));
}
