// vim: tw=80
//! Block-device adapter traits consumed by the engine
//!
//! The engine never touches disks itself.  Callers supply a resolver that
//! turns constructor-table device names into [`Bdev`] handles, an
//! [`IoSubmitter`] that carries remapped I/O to the data device, and an
//! [`EventSink`] that receives pool-wide notifications.

use crate::{bio::Bio, types::*};
#[cfg(test)] use mockall::automock;
use std::sync::Arc;

/// An open block device.
#[cfg_attr(test, automock)]
pub trait Bdev: Send + Sync {
    /// The device's name, as it should appear in status lines.
    fn name(&self) -> String;

    /// The device's current capacity, in sectors.
    fn size_sectors(&self) -> SectorT;
}

/// Resolves the device names found in target constructor tables.
#[cfg_attr(test, automock)]
pub trait BdevOpener: Send + Sync {
    fn open(&self, name: &str) -> Result<Arc<dyn Bdev>>;
}

/// Issues remapped I/O to the pool's data device.
///
/// By the time a [`Bio`] reaches `submit` its sector has already been
/// rewritten into the data device's address space.  The implementation
/// performs the transfer, from any thread, and then calls
/// [`Bio::complete`] exactly once.
#[cfg_attr(test, automock)]
pub trait IoSubmitter: Send + Sync {
    fn submit(&self, bio: Bio);
}

/// Pool-wide conditions reported outside the data path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolEvent {
    /// Free data blocks crossed the configured low-water mark.  Raised at
    /// most once until the next resume.
    LowWater,
}

/// Receives [`PoolEvent`]s.  The callback must not block; it runs in
/// whatever context noticed the condition.
#[cfg_attr(test, automock)]
pub trait EventSink: Send + Sync {
    fn pool_event(&self, event: PoolEvent);
}
