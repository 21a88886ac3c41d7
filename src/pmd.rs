// vim: tw=80
//! The persistent metadata store consumed by the engine
//!
//! The store keeps one copy-on-write B-tree of `virtual block -> data block`
//! mappings per thin device plus the space maps for both devices.  The
//! engine treats it as opaque: all crash consistency below the mapping
//! level is the store's problem.  Every method here except `find_block`
//! with `can_block == false` may perform I/O and may therefore only be
//! called from worker context.

use crate::{bdev::Bdev, types::*};
#[cfg(test)] use mockall::automock;
use std::sync::Arc;

/// Outcome of a mapping lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FindResult {
    /// No mapping exists for this virtual block.
    NotFound,
    /// Answering would require I/O and the caller asked not to block.
    WouldBlock,
    /// The mapping exists.  `shared` is set if other thin devices may also
    /// reference `data_block`.  False positives are harmless (sharing gets
    /// broken once too often); false negatives are not tolerated.
    Found { data_block: BlockT, shared: bool },
}

/// Handle to an open pool metadata store.
#[cfg_attr(test, automock)]
pub trait MetadataStore: Send + Sync {
    /// Flush and close the store.  Called once, when the owning pool is
    /// torn down.
    fn close(&self) -> Result;

    /// Point the store at a (possibly reopened) metadata device.
    fn rebind(&self, bdev: Arc<dyn Bdev>) -> Result;

    /// Size of the data device recorded in the superblock, in blocks.
    fn get_data_dev_size(&self) -> Result<BlockT>;

    fn resize_data_dev(&self, new_size: BlockT) -> Result;

    /// Allocate one free data block.  Fails with `ENOSPC` when the data
    /// device is full.
    fn alloc_data_block(&self) -> Result<BlockT>;

    fn get_free_block_count(&self) -> Result<BlockT>;

    fn get_free_metadata_block_count(&self) -> Result<BlockT>;

    /// Root of the metadata snapshot held for userspace, if any.
    fn get_held_metadata_root(&self) -> Result<Option<BlockT>>;

    fn get_transaction_id(&self) -> Result<u64>;

    /// Compare-and-swap the userspace transaction id.
    fn set_transaction_id(&self, old: u64, new: u64) -> Result;

    fn create_thin(&self, dev: ThinId) -> Result;

    /// Create a snapshot of `origin`, sharing all of its data blocks.
    fn create_snap(&self, dev: ThinId, origin: ThinId) -> Result;

    fn delete_thin(&self, dev: ThinId) -> Result;

    /// Truncate a thin device's mapped size.  The engine validates and
    /// forwards; it does not release data blocks itself.
    fn trim_thin(&self, dev: ThinId, new_size: BlockT) -> Result;

    fn open_thin(&self, dev: ThinId) -> Result;

    fn close_thin(&self, dev: ThinId) -> Result;

    /// Look up the mapping for one virtual block.  With `can_block` unset
    /// this must not sleep; return `FindResult::WouldBlock` instead.
    fn find_block(&self, dev: ThinId, block: BlockT, can_block: bool)
        -> Result<FindResult>;

    fn insert_block(&self, dev: ThinId, block: BlockT, data_block: BlockT)
        -> Result;

    fn get_mapped_count(&self, dev: ThinId) -> Result<BlockT>;

    fn get_highest_mapped(&self, dev: ThinId) -> Result<Option<BlockT>>;

    /// Commit all outstanding metadata changes.
    fn commit(&self) -> Result;
}

/// Opens a [`MetadataStore`] over a metadata device.
#[cfg_attr(test, automock)]
pub trait MetadataOpener: Send + Sync {
    fn open(&self, bdev: Arc<dyn Bdev>, data_block_size: SectorT)
        -> Result<Arc<dyn MetadataStore>>;
}
