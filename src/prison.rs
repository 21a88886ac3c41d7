// vim: tw=80
//! The bio prison: keyed serialization of in-flight block I/O
//!
//! Sometimes the engine can't deal with a bio straight away, because some
//! other operation on the same block is still in flight.  Such bios are
//! detained in a cell identified by a key until whoever holds the cell
//! releases it.  Virtual keys serialize provisioning of a logical block;
//! data keys serialize the breaking of sharing of a physical block.

use crate::{bio::Bio, types::*};
use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
};

/// Which address space a [`CellKey`] refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope {
    Virtual,
    Data,
}

/// Identifies the block an operation is working on.  Two operations with
/// equal keys must be serialized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CellKey {
    pub scope: Scope,
    pub dev: ThinId,
    pub block: BlockT,
}

impl CellKey {
    pub fn virt(dev: ThinId, block: BlockT) -> Self {
        CellKey { scope: Scope::Virtual, dev, block }
    }

    pub fn data(dev: ThinId, block: BlockT) -> Self {
        CellKey { scope: Scope::Data, dev, block }
    }
}

/// Handle to an occupied cell.  Valid until the cell is released or
/// failed, after which it must not be used again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CellId(usize);

/// Outcome of [`Prison::detain`].
#[derive(Debug)]
pub enum Detained {
    /// The key was free.  The caller now holds the cell and gets its bio
    /// back to process; it must eventually release or fail the cell.
    Holder(CellId, Bio),
    /// Another operation already holds this key; the bio joined the cell's
    /// queue and will be observed when the holder releases the cell.
    Queued,
}

struct Cell {
    key: CellKey,
    /// Detainers so far: the holder plus the queued waiters
    count: u32,
    waiters: VecDeque<Bio>,
}

struct Inner {
    /// Fixed open hash of occupied cells; values index `cells`
    buckets: Box<[Vec<usize>]>,
    hash_mask: u64,
    /// Fixed-capacity cell slab; `None` entries are free
    cells: Box<[Option<Cell>]>,
    free: Vec<usize>,
}

impl Inner {
    fn hash(&self, key: &CellKey) -> usize {
        const BIG_PRIME: u64 = 4_294_967_291;
        (key.block.wrapping_mul(BIG_PRIME) & self.hash_mask) as usize
    }

    fn find(&self, bucket: usize, key: &CellKey) -> Option<usize> {
        self.buckets[bucket].iter()
            .copied()
            .find(|id| self.cells[*id].as_ref().unwrap().key == *key)
    }

    /// Unlink a cell from its bucket and return its queued waiters.  After
    /// this no reference to the cell is valid.
    fn extract(&mut self, id: CellId) -> VecDeque<Bio> {
        let cell = self.cells[id.0].take().expect("cell already released");
        let bucket = self.hash(&cell.key);
        let pos = self.buckets[bucket].iter()
            .position(|c| *c == id.0)
            .expect("cell not in its bucket");
        self.buckets[bucket].swap_remove(pos);
        self.free.push(id.0);
        cell.waiters
    }
}

fn calc_nr_buckets(nr_cells: usize) -> usize {
    let target = (nr_cells / 4).min(8192);
    let mut n = 128;
    while n < target {
        n <<= 1;
    }
    n
}

/// A fixed-size population of cells, hashed by key.
///
/// `nr_cells` bounds the number of keys that may be detained
/// _concurrently_; don't confuse it with the number of distinct keys.
pub struct Prison {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl Prison {
    pub fn new(nr_cells: usize) -> Self {
        let nr_buckets = calc_nr_buckets(nr_cells);
        let buckets = vec![Vec::new(); nr_buckets].into_boxed_slice();
        let cells: Box<[Option<Cell>]> = (0..nr_cells).map(|_| None)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let free = (0..nr_cells).collect();
        Prison {
            inner: Mutex::new(Inner {
                buckets,
                hash_mask: (nr_buckets - 1) as u64,
                cells,
                free,
            }),
            cv: Condvar::new(),
        }
    }

    /// Detain `bio` under `key`.
    ///
    /// If every cell is in use this blocks until one is released, so it may
    /// only be called from contexts that can sleep.  The prison lock is
    /// dropped during the wait and the bucket re-checked afterwards, since
    /// another path may have inserted the cell in the meantime.
    pub fn detain(&self, key: CellKey, bio: Bio) -> Detained {
        let mut bio = Some(bio);
        let mut inner = self.inner.lock().unwrap();
        loop {
            let bucket = inner.hash(&key);
            if let Some(id) = inner.find(bucket, &key) {
                let cell = inner.cells[id].as_mut().unwrap();
                cell.count += 1;
                cell.waiters.push_back(bio.take().unwrap());
                return Detained::Queued;
            }
            if let Some(id) = inner.free.pop() {
                inner.cells[id] = Some(Cell {
                    key,
                    count: 1,
                    waiters: VecDeque::new(),
                });
                inner.buckets[bucket].push(id);
                return Detained::Holder(CellId(id), bio.take().unwrap());
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// Release a cell, returning its queued waiters for the caller to
    /// observe exactly once.
    pub fn release(&self, cell: CellId) -> VecDeque<Bio> {
        let mut inner = self.inner.lock().unwrap();
        let waiters = inner.extract(cell);
        self.cv.notify_one();
        waiters
    }

    /// Release a cell that the caller knows has attracted no waiters.
    ///
    /// # Panics
    ///
    /// Panics if any bio was queued behind the holder.
    pub fn release_singleton(&self, cell: CellId) {
        let waiters = self.release(cell);
        assert!(waiters.is_empty(), "cell was not a singleton");
    }

    /// Release a cell, completing every queued waiter with an I/O error.
    pub fn fail(&self, cell: CellId) {
        for bio in self.release(cell) {
            bio.complete(Err(Error::EIO));
        }
    }

    /// The number of distinct keys currently detained.
    #[cfg(test)]
    fn nr_occupied(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.cells.iter().filter(|c| c.is_some()).count()
    }
}
