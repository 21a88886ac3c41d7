// vim: tw=80
//! Thin devices and the non-blocking fast path

use crate::{
    bio::Bio,
    pmd::FindResult,
    pool::Pool,
    types::*,
};
use std::sync::Arc;

/// How [`Thin::map`] disposed of a bio.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapResult {
    /// The bio was remapped in place and issued to the data device.
    Remapped,
    /// The engine took ownership; the bio will be processed by the worker.
    Deferred,
    /// The bio was completed with an error.
    Failed,
}

/// One thin device bound to a pool.
///
/// A thin device exposes a flat sequence of virtual blocks, sparsely
/// mapped onto the pool's data device.  All state beyond the id lives in
/// the metadata store; this is just the binding.
pub struct Thin {
    pub(crate) dev_id: ThinId,
    pub(crate) pool: Arc<Pool>,
}

impl Thin {
    pub(crate) fn new(pool: Arc<Pool>, dev_id: ThinId) -> Result<Arc<Self>> {
        pool.pmd.open_thin(dev_id)?;
        Ok(Arc::new(Thin { dev_id, pool }))
    }

    pub fn dev_id(&self) -> ThinId {
        self.dev_id
    }

    pub(crate) fn bio_block(&self, bio: &Bio) -> BlockT {
        bio.sector() >> self.pool.block_shift
    }

    /// Map one bio, without blocking.
    ///
    /// Anything that can't be resolved with a non-blocking metadata lookup
    /// is deferred onto the pool's worker: flush/FUA bios (they need an
    /// ordered commit first), unprovisioned blocks, lookups that would
    /// require I/O, and shared blocks.  Note that readahead gets deferred
    /// too.
    pub fn map(self: &Arc<Self>, mut bio: Bio) -> MapResult {
        bio.tc = Some(self.clone());

        if bio.is_flush_or_fua() {
            self.pool.defer_bio(bio);
            return MapResult::Deferred;
        }

        let block = self.bio_block(&bio);
        match self.pool.pmd.find_block(self.dev_id, block, false) {
            Ok(FindResult::Found { data_block, shared: false }) => {
                self.pool.remap(&mut bio, data_block);
                self.pool.submitter.submit(bio);
                MapResult::Remapped
            },
            Ok(FindResult::Found { shared: true, .. }) => {
                // The shared flag may be stale: a snapshot taken after the
                // lookup can introduce new sharing.  Quiescing the origin
                // before snapshotting is what actually closes that window;
                // deferring here keeps the worker as the only place that
                // breaks sharing.
                self.pool.defer_bio(bio);
                MapResult::Deferred
            },
            Ok(FindResult::NotFound) | Ok(FindResult::WouldBlock) => {
                self.pool.defer_bio(bio);
                MapResult::Deferred
            },
            Err(e) => {
                bio.complete(Err(e));
                MapResult::Failed
            },
        }
    }
}
