use std::ptr;
use std::thread::{self, JoinHandle};

use flume::Sender;
use tracing::warn;

use crate::cell::{Cell, FinalizeKind, Value, EXTERNAL_STRING_LIMIT};
use crate::thing::{FunctionData, ObjectData, StringData};

/// Written over freed memory in debug builds.
#[cfg_attr(not(debug_assertions), allow(dead_code))]
pub(crate) const FREE_PATTERN: u8 = 0xDA;

/// Releases the characters of an external string when it is finalized.
pub type ExternalStringFinalizer = fn(&str);

pub(crate) type ExternalFinalizers = [Option<ExternalStringFinalizer>; EXTERNAL_STRING_LIMIT];

/// Runs the per-kind finalizer of unreachable cells during sweep.
pub(crate) struct Finalizer<'a> {
    external: &'a ExternalFinalizers,
    deallocator: Option<&'a Deallocator>,
}

impl<'a> Finalizer<'a> {
    pub(crate) fn new(
        external: &'a ExternalFinalizers,
        deallocator: Option<&'a Deallocator>,
    ) -> Self {
        Self {
            external,
            deallocator,
        }
    }

    /// Finalizes and drops the payload of `cell`.
    ///
    /// # Safety
    ///
    /// `cell` must hold an initialized payload of `kind` that is unreachable
    /// and has not been finalized yet.
    pub(crate) unsafe fn finalize(&self, kind: FinalizeKind, cell: Cell) {
        match kind {
            FinalizeKind::Object => {
                let object = &mut *cell.as_ptr().cast::<ObjectData>();
                self.finalize_object(object);
                ptr::drop_in_place(object);
            }
            FinalizeKind::Function => {
                let function = &mut *cell.as_ptr().cast::<FunctionData>();
                self.finalize_object(function.object_mut());
                ptr::drop_in_place(function);
            }
            FinalizeKind::String => {
                ptr::drop_in_place(cell.as_ptr().cast::<StringData>());
            }
            FinalizeKind::ExternalString(external) => {
                let string = cell.as_ptr().cast::<StringData>();
                if let (Some(finalize), StringData::Flat(chars)) =
                    (self.external[usize::from(external)], &*string)
                {
                    finalize(chars);
                }
                ptr::drop_in_place(string);
            }
        }

        #[cfg(debug_assertions)]
        ptr::write_bytes(
            cell.as_ptr(),
            FREE_PATTERN,
            crate::arena::thing_size(kind),
        );
    }

    fn finalize_object(&self, object: &mut ObjectData) {
        if let Some(finalize) = object.class().finalize {
            finalize(object);
        }
        if let Some(deallocator) = self.deallocator {
            deallocator.free(object.take_slots());
        }
    }
}

/// Drops slot storage of finalized objects on a helper thread.
pub(crate) struct Deallocator {
    sender: Option<Sender<Vec<Value>>>,
    thread: Option<JoinHandle<()>>,
}

impl Deallocator {
    pub(crate) fn spawn() -> Option<Self> {
        let (sender, receiver) = flume::unbounded::<Vec<Value>>();
        match thread::Builder::new()
            .name(String::from("sweepgc-free"))
            .spawn(move || {
                while let Ok(slots) = receiver.recv() {
                    drop(slots);
                }
            }) {
            Ok(thread) => Some(Self {
                sender: Some(sender),
                thread: Some(thread),
            }),
            Err(err) => {
                warn!(%err, "unable to start background deallocator, freeing inline");
                None
            }
        }
    }

    fn free(&self, slots: Vec<Value>) {
        if slots.capacity() == 0 {
            return;
        }
        if let Some(sender) = &self.sender {
            if let Err(err) = sender.send(slots) {
                drop(err.into_inner());
            }
        }
    }
}

impl Drop for Deallocator {
    fn drop(&mut self) {
        // Disconnecting the channel stops the thread once it drains.
        drop(self.sender.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("background deallocator panicked");
            }
        }
    }
}
