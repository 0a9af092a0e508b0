use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::cell::Value;
use crate::tracer::{Trace, Tracer};

/// A shared location holding a [`Value`] that can be registered as a root.
///
/// Registered locations are read at the start of every collection, so a
/// value stored in one stays alive until it is overwritten or the location
/// is unregistered.
///
/// ```rust
/// use sweepgc::{RootLocation, Value};
///
/// let location = RootLocation::new(Value::Int(1));
/// let shared = location.clone();
/// shared.set(Value::Null);
/// assert_eq!(location.get(), Value::Null);
/// assert!(RootLocation::ptr_eq(&location, &shared));
/// ```
#[derive(Clone, Default, Debug)]
pub struct RootLocation(Arc<Mutex<Value>>);

impl RootLocation {
    /// Returns a new location holding `value`.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    /// Returns the stored value.
    #[must_use]
    pub fn get(&self) -> Value {
        *self.0.lock()
    }

    /// Replaces the stored value.
    pub fn set(&self, value: Value) {
        *self.0.lock() = value;
    }

    /// Returns true if both handles refer to the same location.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.0, &other.0)
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl Trace for RootLocation {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.trace_value(self.get());
    }
}

/// The action taken on each root visited by
/// [`Heap::map_roots`](crate::Heap::map_roots).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RootMapAction {
    /// Keep the root and continue.
    Next,
    /// Unregister the root and continue.
    Remove,
    /// Keep the root and stop.
    Stop,
    /// Unregister the root and stop.
    RemoveAndStop,
}

/// Traces references that are not stored in registered locations, such as
/// an interpreter's stack frames.
///
/// Root tracers run with the heap lock held and must not call back into the
/// heap.
pub trait RootTracer: Send + Sync {
    /// Reports every root to `tracer`.
    fn trace_roots(&self, tracer: &mut Tracer<'_>);
}

impl<T> RootTracer for T
where
    T: Trace + Send + Sync,
{
    fn trace_roots(&self, tracer: &mut Tracer<'_>) {
        self.trace(tracer);
    }
}

/// Identifies a root tracer added with
/// [`Heap::add_root_tracer`](crate::Heap::add_root_tracer).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RootTracerId(u64);

struct RootEntry {
    location: RootLocation,
    name: Option<&'static str>,
}

#[derive(Default)]
pub(crate) struct Roots {
    entries: AHashMap<usize, RootEntry>,
    tracers: Vec<(RootTracerId, Arc<dyn RootTracer>)>,
    next_tracer: u64,
}

impl Roots {
    /// Registers `location`, replacing the name of an existing registration.
    pub(crate) fn register(&mut self, location: &RootLocation, name: Option<&'static str>) {
        self.entries.insert(
            location.key(),
            RootEntry {
                location: location.clone(),
                name,
            },
        );
    }

    pub(crate) fn unregister(&mut self, location: &RootLocation) -> bool {
        self.entries.remove(&location.key()).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.entries.values().map(|entry| entry.location.get())
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.values().filter_map(|entry| entry.name)
    }

    /// Visits every root, applying the returned action. Returns the number
    /// of roots visited.
    pub(crate) fn map(
        &mut self,
        mut visit: impl FnMut(&RootLocation, Option<&'static str>) -> RootMapAction,
    ) -> usize {
        let mut visited = 0;
        let mut stopped = false;
        self.entries.retain(|_, entry| {
            if stopped {
                return true;
            }
            visited += 1;
            let action = visit(&entry.location, entry.name);
            stopped = matches!(action, RootMapAction::Stop | RootMapAction::RemoveAndStop);
            !matches!(action, RootMapAction::Remove | RootMapAction::RemoveAndStop)
        });
        visited
    }

    pub(crate) fn add_tracer(&mut self, tracer: Arc<dyn RootTracer>) -> RootTracerId {
        let id = RootTracerId(self.next_tracer);
        self.next_tracer += 1;
        self.tracers.push((id, tracer));
        id
    }

    pub(crate) fn remove_tracer(&mut self, id: RootTracerId) -> bool {
        let before = self.tracers.len();
        self.tracers.retain(|(existing, _)| *existing != id);
        self.tracers.len() != before
    }

    pub(crate) fn trace_tracers(&self, tracer: &mut Tracer<'_>) {
        for (_, root_tracer) in &self.tracers {
            root_tracer.trace_roots(tracer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_removes_and_stops() {
        let mut roots = Roots::default();
        let locations = (0..4)
            .map(|i| RootLocation::new(Value::Int(i)))
            .collect::<Vec<_>>();
        for location in &locations {
            roots.register(location, Some("local"));
        }
        // Registering twice keeps a single entry.
        roots.register(&locations[0], Some("renamed"));
        assert_eq!(roots.len(), 4);

        let visited = roots.map(|location, _| {
            if location.get() == Value::Int(1) {
                RootMapAction::Remove
            } else {
                RootMapAction::Next
            }
        });
        assert_eq!(visited, 4);
        assert_eq!(roots.len(), 3);

        let visited = roots.map(|_, _| RootMapAction::RemoveAndStop);
        assert_eq!(visited, 1);
        assert_eq!(roots.len(), 2);

        assert!(!roots.unregister(&RootLocation::default()));
        let names = roots.names().collect::<Vec<_>>();
        assert_eq!(names.len(), 2);
    }
}
