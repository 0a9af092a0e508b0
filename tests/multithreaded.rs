use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

use flume::{Receiver, Sender};
use sweepgc::{
    CollectMode, Context, FinalizeKind, Heap, HeapConfig, RootLocation, Value, OBJECT_CLASS,
};

const CHAIN_LENGTH: usize = 2_000;
const COLLECT_EVERY: usize = 250;
const ROUNDS: i32 = 200;

#[test]
fn threads_collect_concurrently() {
    let threads = thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .clamp(2, 8);
    let heap = Heap::new(HeapConfig::default());

    let workers = (0..threads)
        .map(|index| {
            let heap = heap.clone();
            thread::Builder::new()
                .name(format!("chain-{index}"))
                .spawn(move || build_chain(&heap))
                .expect("error spawning thread")
        })
        .collect::<Vec<_>>();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let stats = heap.stats();
    assert!(stats.collections > 0);
    assert_eq!(stats.roots, 0);
}

fn build_chain(heap: &Arc<Heap>) {
    let mut context = Context::new(heap);
    let mut request = context.begin_request();
    let root = RootLocation::default();
    heap.register_root(&root, None);

    for i in 0..CHAIN_LENGTH {
        let label = request.new_string(&format!("link {i}")).unwrap();
        let link = request
            .new_object(&OBJECT_CLASS, vec![root.get(), Value::String(label)])
            .unwrap();
        root.set(Value::Object(link));
        // Garbage for the collector to find.
        request.new_double(i as f64).unwrap();

        if i % COLLECT_EVERY == 0 {
            request.collect(CollectMode::Normal);
        }
        request.yield_to_collector();
    }

    let mut length = 0;
    let mut current = root.get();
    while let Value::Object(link) = current {
        let object = request.object(link).unwrap();
        let label = object.slot(1).and_then(Value::as_string).unwrap();
        let expected = format!("link {}", CHAIN_LENGTH - 1 - length);
        assert_eq!(request.string_contents(label), Some(expected));
        current = object.slot(0).unwrap();
        length += 1;
    }
    assert_eq!(length, CHAIN_LENGTH);
    heap.unregister_root(&root);
}

#[test]
fn values_cross_threads() {
    let heap = Heap::new(HeapConfig::default());
    let location = RootLocation::default();
    heap.register_root(&location, Some("ball"));
    let mut context = Context::new(&heap);
    {
        let mut request = context.begin_request();
        let ball = request
            .new_object(&OBJECT_CLASS, vec![Value::Int(ROUNDS)])
            .unwrap();
        location.set(Value::Object(ball));
    }

    let (to_first, first_inbox) = flume::unbounded();
    let (to_second, second_inbox) = flume::unbounded();
    let first = {
        let heap = heap.clone();
        let to_second = to_second.clone();
        thread::spawn(move || rally(&heap, &first_inbox, &to_second))
    };
    let second = {
        let heap = heap.clone();
        thread::spawn(move || rally(&heap, &second_inbox, &to_first))
    };
    to_second.send(location.clone()).unwrap();
    drop(to_second);
    let hits = first.join().unwrap() + second.join().unwrap();
    assert_eq!(hits, ROUNDS);

    let mut request = context.begin_request();
    assert!(request.collect(CollectMode::Normal));
    let Value::Object(ball) = location.get() else {
        unreachable!("the ball is an object")
    };
    assert_eq!(request.object(ball).unwrap().slot(0), Some(Value::Int(0)));
    let stats = heap.stats();
    assert_eq!(stats.kind(FinalizeKind::Object).unwrap().live, 1);
    assert_eq!(stats.kind(FinalizeKind::String).unwrap().live, 1);
    heap.unregister_root(&location);
}

/// Replaces the ball with one holding a smaller count and passes it on.
/// Returns the number of times this thread hit the ball.
fn rally(heap: &Arc<Heap>, inbox: &Receiver<RootLocation>, outbox: &Sender<RootLocation>) -> i32 {
    let mut context = Context::new(heap);
    let mut hits = 0;
    while let Ok(location) = inbox.recv() {
        let mut request = context.begin_request();
        let Value::Object(ball) = location.get() else {
            unreachable!("the ball is an object")
        };
        let Some(Value::Int(remaining)) = request.object(ball).unwrap().slot(0) else {
            unreachable!("the ball holds a count")
        };
        if remaining == 0 {
            break;
        }

        let name = request
            .new_string(thread::current().name().unwrap_or("unnamed"))
            .unwrap();
        let next = request
            .new_object(
                &OBJECT_CLASS,
                vec![Value::Int(remaining - 1), Value::String(name)],
            )
            .unwrap();
        location.set(Value::Object(next));
        hits += 1;
        if remaining % 10 == 0 {
            request.collect(CollectMode::Normal);
        }
        drop(request);

        if outbox.send(location).is_err() {
            break;
        }
    }
    hits
}
