//! A weak atom table for strings allocated by the sweepgc collector.
//!
//! Atomizing a string returns the same string cell for equal contents for as
//! long as that cell stays reachable. The table does not keep its atoms
//! alive: after each collection marks, entries whose strings are about to be
//! finalized are removed.

use std::hash::BuildHasher;
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashTable;
use parking_lot::Mutex;
use sweepgc::{Cell, CollectMode, GcObserver, Heap, MarkView, Request, Result};
use tracing::trace;

struct Atom {
    hash: u64,
    chars: Box<str>,
    cell: Cell,
}

/// Interns flat strings of one heap.
pub struct AtomTable {
    hasher: RandomState,
    atoms: Mutex<HashTable<Atom>>,
}

impl AtomTable {
    /// Returns a new, empty table that follows the collections of `heap`.
    #[must_use]
    pub fn new(heap: &Arc<Heap>) -> Arc<Self> {
        let table = Arc::new(Self {
            hasher: RandomState::new(),
            atoms: Mutex::new(HashTable::new()),
        });
        heap.add_observer(table.clone());
        table
    }

    /// Returns the atom for `chars`, allocating a new string if needed.
    ///
    /// Like any cell, the returned atom must be rooted to survive the next
    /// collection.
    ///
    /// # Errors
    ///
    /// Returns an error if allocating the string fails.
    pub fn atomize(&self, request: &mut Request<'_>, chars: &str) -> Result<Cell> {
        let hash = self.hasher.hash_one(chars);
        if let Some(cell) = self.lookup(hash, chars) {
            return Ok(cell);
        }

        // Allocating may collect, which locks the table.
        let cell = request.new_string(chars)?;

        let mut atoms = self.atoms.lock();
        if let Some(existing) = atoms.find(hash, |atom| &*atom.chars == chars) {
            // Another thread atomized the same characters first.
            return Ok(existing.cell);
        }
        atoms.insert_unique(
            hash,
            Atom {
                hash,
                chars: Box::from(chars),
                cell,
            },
            |atom| atom.hash,
        );
        Ok(cell)
    }

    /// Returns the existing atom for `chars`.
    #[must_use]
    pub fn get(&self, chars: &str) -> Option<Cell> {
        self.lookup(self.hasher.hash_one(chars), chars)
    }

    fn lookup(&self, hash: u64, chars: &str) -> Option<Cell> {
        self.atoms
            .lock()
            .find(hash, |atom| &*atom.chars == chars)
            .map(|atom| atom.cell)
    }

    /// Returns the number of atoms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.atoms.lock().len()
    }

    /// Returns true if the table holds no atoms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GcObserver for AtomTable {
    fn mark_end(&self, view: &MarkView<'_>) {
        let mut atoms = self.atoms.lock();
        let before = atoms.len();
        if view.mode() == CollectMode::Final {
            atoms.clear();
        } else {
            atoms.retain(|atom| !view.is_about_to_be_finalized(atom.cell));
        }
        trace!(removed = before - atoms.len(), "swept atoms");
    }
}
