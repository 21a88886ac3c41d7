// vim: tw=80
//! The asynchronous bulk copy/zero engine consumed by the pool

use crate::types::*;
#[cfg(test)] use mockall::automock;

/// A contiguous run of sectors on the pool's data device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IoRegion {
    pub sector: SectorT,
    pub count: SectorT,
}

/// Completion callback for a copy or zero.  The two arguments are the read
/// error and the write error; both `None` on success.  Runs in completion
/// context: it may take the pool and deferred-set locks briefly but must
/// not sleep.
pub type CopyCallback = Box<dyn FnOnce(Option<Error>, Option<Error>) + Send>;

/// Bulk data mover.  `copy` and `zero` return once the operation has been
/// queued; the outcome arrives through the callback, possibly before the
/// submitting call returns.
#[cfg_attr(test, automock)]
pub trait CopyEngine: Send + Sync {
    fn copy(&self, from: IoRegion, to: IoRegion, cb: CopyCallback) -> Result;

    fn zero(&self, to: IoRegion, cb: CopyCallback) -> Result;
}
