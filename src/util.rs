// vim: tw=80
//! Common utility functions used throughout the engine

use std::sync::{Arc, Condvar, Mutex};

/// Divide, rounding up.
///
/// # Panics
///
/// Panics if `divisor` is 0.
pub fn div_roundup(dividend: u64, divisor: u64) -> u64 {
    (dividend + divisor - 1) / divisor
}

/// A bounded pool of identical resources, counted but not stored.
///
/// Serves the same purpose as a fixed-size object pool: it bounds the number
/// of a given structure that may be live at once so the data path can make
/// progress under memory pressure instead of allocating without limit.
/// Acquired capacity is returned when the [`Slot`] drops.
#[derive(Debug)]
pub struct Reservoir {
    avail: Mutex<usize>,
    cv: Condvar,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Reservoir {
            avail: Mutex::new(capacity),
            cv: Condvar::new(),
        })
    }

    /// Take one unit of capacity, blocking until some is available.
    ///
    /// Only callable from contexts that may sleep.
    pub fn acquire(self: &Arc<Self>) -> Slot {
        let mut avail = self.avail.lock().unwrap();
        while *avail == 0 {
            avail = self.cv.wait(avail).unwrap();
        }
        *avail -= 1;
        Slot { reservoir: self.clone() }
    }

    /// Take one unit of capacity, or fail immediately if none is available.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Slot> {
        let mut avail = self.avail.lock().unwrap();
        if *avail == 0 {
            None
        } else {
            *avail -= 1;
            Some(Slot { reservoir: self.clone() })
        }
    }

    fn release(&self) {
        let mut avail = self.avail.lock().unwrap();
        *avail += 1;
        self.cv.notify_one();
    }
}

/// One unit of a [`Reservoir`]'s capacity.
#[derive(Debug)]
pub struct Slot {
    reservoir: Arc<Reservoir>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.reservoir.release();
    }
}
