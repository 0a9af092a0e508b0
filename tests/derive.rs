use std::sync::Arc;

use parking_lot::Mutex;
use sweepgc::{
    Cell, CollectMode, Context, Heap, HeapConfig, RootTracer, Trace, TraceKind, Tracer, Value,
    OBJECT_CLASS,
};

#[derive(Trace, Default)]
struct Frame {
    locals: Vec<Value>,
    this: Option<Value>,
    #[trace(ignore)]
    depth: Depth,
}

/// Holds no references and does not implement `Trace`.
#[derive(Default)]
struct Depth(usize);

#[derive(Trace)]
struct Pair(Value, #[trace(ignore)] usize, Value);

#[derive(Trace)]
enum Slot {
    Empty,
    Value(Value),
    Pair { first: Value, second: Value },
    #[trace(ignore)]
    Ignored(Value),
}

#[derive(Trace)]
struct Wrapper<T> {
    inner: T,
}

fn references(value: &impl Trace) -> Vec<Cell> {
    let mut cells = Vec::new();
    value.trace(&mut Tracer::visitor(&mut |cell, _kind: TraceKind| {
        cells.push(cell);
    }));
    cells
}

#[test]
fn derived_traces_visit_fields() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();
    request.enter_local_root_scope();

    let a = request.new_string("a").unwrap();
    let b = request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    let c = request.new_double(3.0).unwrap();

    let frame = Frame {
        locals: vec![Value::String(a), Value::Int(1)],
        this: Some(Value::Object(b)),
        depth: Depth(2),
    };
    assert_eq!(references(&frame), [a, b]);
    assert_eq!(frame.depth.0, 2);

    let pair = Pair(Value::String(a), 7, Value::Double(c));
    assert_eq!(references(&pair), [a, c]);
    assert_eq!(pair.1, 7);

    assert!(references(&Slot::Empty).is_empty());
    assert_eq!(references(&Slot::Value(Value::Object(b))), [b]);
    assert_eq!(
        references(&Slot::Pair {
            first: Value::Double(c),
            second: Value::String(a),
        }),
        [c, a]
    );
    assert!(references(&Slot::Ignored(Value::Object(b))).is_empty());

    let wrapper = Wrapper {
        inner: vec![Value::Object(b)],
    };
    assert_eq!(references(&wrapper), [b]);
}

#[test]
fn derived_root_tracers() {
    let heap = Heap::new(HeapConfig::default());
    let mut context = Context::new(&heap);
    let mut request = context.begin_request();

    let frame = Arc::new(Mutex::new(Frame::default()));
    let tracer: Arc<dyn RootTracer> = frame.clone();
    heap.add_root_tracer(tracer);

    let local = request.new_string("local").unwrap();
    let this = request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();
    {
        let mut frame = frame.lock();
        frame.locals.push(Value::String(local));
        frame.this = Some(Value::Object(this));
    }
    request.new_string("replaces the newborn").unwrap();
    request.new_object(&OBJECT_CLASS, Vec::new()).unwrap();

    assert!(request.collect(CollectMode::Normal));
    assert!(heap.owns(local));
    assert!(heap.owns(this));
    assert_eq!(heap.stats().last_finalized, 2);

    *frame.lock() = Frame::default();
    assert!(request.collect(CollectMode::Normal));
    assert!(!heap.owns(local));
    assert!(!heap.owns(this));
}
