// vim: tw=80
//! In-flight provisioning and copy-on-write records

use crate::{
    bio::Bio,
    deferred::Entry,
    pool::Pool,
    prison::CellId,
    thin::Thin,
    types::*,
    util::Slot,
};
use std::sync::{Arc, Mutex, Weak};

/// Lifecycle of a [`NewMapping`].
///
/// `Scheduled` becomes `Prepared` once the underlying copy, zero, or
/// overwrite has finished *and* the deferred set has released the record.
/// `Failed` is terminal: the record's cell has been drained with errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MappingState {
    Created,
    Scheduled,
    Prepared,
    Committed,
    Released,
    Failed,
}

pub(crate) struct MappingInner {
    pub state: MappingState,
    /// The underlying copy/zero/overwrite has returned
    pub done: bool,
    /// The deferred set has no reads left that predate this record
    pub quiesced: bool,
    /// The whole block is being overwritten, so the detained bio was issued
    /// directly and commit must complete it rather than requeue it
    pub overwrite: bool,
    pub err: Option<Error>,
    /// The bio that instigated this mapping, held here until commit
    pub bio: Option<Bio>,
}

/// One in-flight new mapping: `(thin, virt_block) -> data_block`.
///
/// At most one of these exists per `(thin, virt_block)` at a time,
/// serialized by the virtual-key cell it holds.  Until the worker commits
/// it, `data_block` is reachable only through this record.
pub(crate) struct NewMapping {
    pub tc: Arc<Thin>,
    pub virt_block: BlockT,
    pub data_block: BlockT,
    pub cell: CellId,
    /// Mapping-pool reservation, returned when the record drops
    _slot: Slot,
    pub inner: Mutex<MappingInner>,
}

impl NewMapping {
    pub fn new(tc: Arc<Thin>, virt_block: BlockT, data_block: BlockT,
               cell: CellId, slot: Slot) -> Arc<Self>
    {
        Arc::new(NewMapping {
            tc,
            virt_block,
            data_block,
            cell,
            _slot: slot,
            inner: Mutex::new(MappingInner {
                state: MappingState::Created,
                done: false,
                quiesced: false,
                overwrite: false,
                err: None,
                bio: None,
            }),
        })
    }
}

/// End-I/O interceptor stored in a bio while the pipeline has business
/// with its completion.
pub(crate) enum EndioHook {
    /// The bio overwrites a whole block at a freshly chosen data block;
    /// its completion is what prepares the mapping.
    Overwrite { m: Arc<NewMapping> },
    /// The bio is a read remapped to a still-shared data block; its
    /// completion retires an admission from the deferred set.
    SharedRead { pool: Weak<Pool>, entry: Entry, slot: Slot },
}

impl EndioHook {
    /// Observe the completion of `bio`.
    pub fn fire(self, bio: Bio, result: Result) {
        match self {
            EndioHook::Overwrite { m } => {
                let pool = m.tc.pool.clone();
                {
                    let mut inner = m.inner.lock().unwrap();
                    if let Err(e) = result {
                        inner.err = Some(e);
                    }
                    inner.bio = Some(bio);
                    inner.done = true;
                }
                pool.maybe_add_mapping(&m);
            },
            EndioHook::SharedRead { pool, entry, slot } => {
                bio.finish(result);
                if let Some(pool) = pool.upgrade() {
                    pool.shared_read_endio(entry);
                }
                drop(slot);
            },
        }
    }
}
