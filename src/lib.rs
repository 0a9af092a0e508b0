//! A non-moving, multi-threaded mark-and-sweep garbage collector.
//!
//! Things live in 4 KiB arenas carved out of larger chunks. Each arena holds
//! cells of a single kind: objects, functions, strings, external strings, or
//! boxed numbers. Cells are never moved, so a [`Cell`] is simply an address.
//!
//! Threads connect to a shared [`Heap`] through a [`Context`] and do all of
//! their work inside a [`Request`]. A collection waits until every other
//! request has ended or yielded, marks everything reachable from roots,
//! locks, and each context's newborn and local roots, then sweeps objects,
//! strings, and finally doubles.
//!
//! ```rust
//! use sweepgc::{CollectMode, Context, Heap, HeapConfig, RootLocation, Value, OBJECT_CLASS};
//!
//! let heap = Heap::new(HeapConfig::default());
//! let mut context = Context::new(&heap);
//! let mut request = context.begin_request();
//!
//! let name = request.new_string("answer").unwrap();
//! let object = request
//!     .new_object(&OBJECT_CLASS, vec![Value::String(name), Value::Int(42)])
//!     .unwrap();
//! let root = RootLocation::new(Value::Object(object));
//! request.heap().register_root(&root, Some("answer"));
//!
//! request.collect(CollectMode::Normal);
//! assert_eq!(request.string_contents(name).as_deref(), Some("answer"));
//! assert_eq!(request.object(object).unwrap().slot(1), Some(Value::Int(42)));
//!
//! request.heap().unregister_root(&root);
//! ```

mod arena;
mod cell;
mod chunk;
mod config;
mod context;
mod deferred;
mod double;
mod error;
mod heap;
mod list;
mod lock;
mod roots;
mod stats;
mod sweep;
mod thing;
mod tracer;

#[cfg(test)]
mod tests;

pub use arena::ARENA_SIZE;
pub use cell::{Cell, FinalizeKind, TraceKind, Value, EXTERNAL_STRING_LIMIT};
pub use config::{page_size, ChunkStrategy, HeapConfig, MIN_TRIGGER_FACTOR};
pub use context::{Context, ContextId, Request, Thing};
pub use error::{Error, Result};
pub use heap::{CollectMode, GcObserver, Heap, MarkView};
pub use roots::{RootLocation, RootMapAction, RootTracer, RootTracerId};
pub use stats::{GcStats, KindStats};
pub use sweep::ExternalStringFinalizer;
/// Derives [`Trace`] by tracing every field not marked `#[trace(ignore)]`.
pub use sweepgc_macros::Trace;
pub use thing::{Class, FunctionData, ObjectData, StringData, OBJECT_CLASS};
pub use tracer::{Trace, Tracer};
