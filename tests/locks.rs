use sweepgc::{CollectMode, Context, Heap, HeapConfig, OBJECT_CLASS};

#[test]
fn locked_objects_survive() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();

    let object = request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    heap.lock(object);
    heap.lock(object);
    request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();

    assert!(request.collect(CollectMode::Normal));
    assert!(heap.owns(object));

    heap.unlock(object);
    assert!(request.collect(CollectMode::Normal));
    assert!(heap.owns(object));

    heap.unlock(object);
    assert!(request.collect(CollectMode::Normal));
    assert!(!heap.owns(object));

    let stats = heap.stats();
    assert_eq!(stats.locks, 2);
    assert_eq!(stats.unlocks, 2);
}

#[test]
fn locked_objects_keep_their_references() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();

    let name = request.new_string("referenced").unwrap();
    let object = request
        .new_object(&OBJECT_CLASS, vec![sweepgc::Value::String(name)])
        .unwrap();
    heap.lock(object);
    request.new_string("replaces the newborn").unwrap();

    assert!(request.collect(CollectMode::Normal));
    assert_eq!(request.string_contents(name).as_deref(), Some("referenced"));
    heap.unlock(object);
}

#[test]
fn flat_strings_lock_through_their_flag() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();

    let string = request.new_string("locked").unwrap();
    // The first lock only sets the flag. Nested locks are counted.
    heap.lock(string);
    heap.lock(string);
    heap.lock(string);
    request.new_string("replaces the newborn").unwrap();

    for _ in 0..3 {
        assert!(request.collect(CollectMode::Normal));
        assert!(heap.owns(string));
        heap.unlock(string);
    }
    assert!(request.collect(CollectMode::Normal));
    assert!(!heap.owns(string));
}

#[test]
fn dependent_strings_lock_through_the_table() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();

    let base = request.new_string("base string").unwrap();
    let dependent = request.new_dependent_string(base, 5, 6).unwrap();
    heap.lock(dependent);
    request.new_string("replaces the newborn").unwrap();

    assert!(request.collect(CollectMode::Normal));
    assert!(heap.owns(base));
    assert_eq!(request.string_contents(dependent).as_deref(), Some("string"));

    heap.unlock(dependent);
    // Unlocking again is ignored.
    heap.unlock(dependent);
    assert!(request.collect(CollectMode::Normal));
    assert!(!heap.owns(dependent));
    assert!(!heap.owns(base));
}
