use nanorand::{Rng, WyRand};
use sweepgc::{CollectMode, Context, Heap, HeapConfig, RootLocation, Value, OBJECT_CLASS};

#[test]
fn rooted_doubles_survive() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();
    let mut rng = WyRand::new_seed(0x5EED);

    // Keep a pseudo-random subset of the doubles in an object's slots.
    let holder = request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    let root = RootLocation::new(Value::Object(holder));
    heap.register_root(&root, None);
    let mut kept = Vec::new();
    for i in 0..5_000_u32 {
        let number = f64::from(i) + 0.25;
        let cell = request.new_double(number).unwrap();
        if rng.generate_range(0_u8..4) == 0 {
            request
                .object(holder)
                .unwrap()
                .push_slot(Value::Double(cell));
            kept.push((cell, number));
        }
    }
    request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    request.new_double(-1.0).unwrap();

    assert!(request.collect(CollectMode::Normal));
    let stats = heap.stats();
    assert_eq!(stats.doubles.live, kept.len());
    for (cell, number) in &kept {
        assert_eq!(request.double(*cell), Some(*number));
    }

    // Refilling from surviving arenas does not disturb live doubles.
    for i in 0..5_000_u32 {
        request.new_double(-f64::from(i)).unwrap();
    }
    for (cell, number) in &kept {
        assert_eq!(request.double(*cell), Some(*number));
    }
}

#[test]
fn doubles_are_not_objects() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();

    let number = request.new_double(42.0).unwrap();
    assert_eq!(request.trace_kind(number), Some(sweepgc::TraceKind::Double));
    assert!(request.object(number).is_none());
    assert!(request.string(number).is_none());

    let string = request.new_string("42").unwrap();
    assert_eq!(request.double(string), None);
}
