// vim: tw=80
//! The deferred set: epoch-based gating of work behind in-flight reads
//!
//! The engine uses this to keep track of reads still outstanding against
//! shared data blocks.  A new mapping caused by a write must not be
//! installed until every such prior read has completed; otherwise the
//! install could retire the block those reads are aimed at.  Readers are
//! admitted into the current epoch; work items queue behind the epoch and
//! are released once every read admitted up to that point has drained.

use std::sync::Mutex;

/// Number of epoch slots in the ring
pub const DEFERRED_SET_SIZE: usize = 64;

/// Admission token returned by [`DeferredSet::inc`].  Redeem it with
/// [`DeferredSet::dec`] exactly once, when the admitted read completes.
#[derive(Debug)]
#[must_use]
pub struct Entry {
    index: usize,
}

struct Slot<T> {
    count: u32,
    work: Vec<T>,
}

struct Inner<T> {
    current: usize,
    sweeper: usize,
    slots: Vec<Slot<T>>,
}

impl<T> Inner<T> {
    fn sweep(&mut self, out: &mut Vec<T>) {
        while self.sweeper != self.current && self.slots[self.sweeper].count == 0
        {
            out.append(&mut self.slots[self.sweeper].work);
            self.sweeper = next(self.sweeper);
        }
        if self.sweeper == self.current && self.slots[self.sweeper].count == 0 {
            out.append(&mut self.slots[self.sweeper].work);
        }
    }
}

fn next(index: usize) -> usize {
    (index + 1) % DEFERRED_SET_SIZE
}

/// A bounded ring of epochs, each counting admitted reads and queueing
/// work items that must wait for them.
pub struct DeferredSet<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> DeferredSet<T> {
    pub fn new() -> Self {
        let slots = (0..DEFERRED_SET_SIZE)
            .map(|_| Slot { count: 0, work: Vec::new() })
            .collect();
        DeferredSet {
            inner: Mutex::new(Inner { current: 0, sweeper: 0, slots }),
        }
    }

    /// Admit a read into the current epoch.
    pub fn inc(&self) -> Entry {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.current;
        inner.slots[index].count += 1;
        Entry { index }
    }

    /// Retire an admitted read, sweeping any epochs that have now fully
    /// drained.  Released work items are appended to `out`.
    pub fn dec(&self, entry: Entry, out: &mut Vec<T>) {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.slots[entry.index].count > 0);
        inner.slots[entry.index].count -= 1;
        inner.sweep(out);
    }

    /// Queue `work` behind the reads admitted so far.
    ///
    /// Returns `Err(work)` without queueing if there is nothing to wait
    /// for.  Otherwise the item is queued and the current epoch is
    /// advanced, if the next slot is idle, so that later admissions don't
    /// extend this item's wait.
    pub fn add_work(&self, work: T) -> std::result::Result<(), T> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.current;
        if inner.sweeper == current && inner.slots[current].count == 0 {
            return Err(work);
        }
        inner.slots[current].work.push(work);
        let next_slot = next(current);
        if inner.slots[next_slot].count == 0 {
            inner.current = next_slot;
        }
        Ok(())
    }
}

impl<T> Default for DeferredSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
