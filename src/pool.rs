// vim: tw=80
//! Pool state and the worker that drives provisioning and copy-on-write
//!
//! How breaking sharing of a data block works
//! ==========================================
//!
//! The metadata store keeps one copy-on-write B-tree of mappings per thin
//! device.  Taking a snapshot clones the root of the origin's tree; after
//! that there is no distinction between origin and snapshot, just two
//! trees that happen to point at the same data blocks.  When a write
//! arrives for a block the store reports as shared:
//!
//! 1. further I/O to the block is detained in the prison,
//! 2. reads already in flight against the shared block are quiesced
//!    through the deferred set,
//! 3. the block is copied to a freshly allocated one (skipped when the
//!    write covers the whole block),
//! 4. the new mapping is inserted into that one device's tree,
//! 5. the detained I/O is released, including the write that started it.
//!
//! Steps 2 and 3 run in parallel.  The metadata does not need to be
//! committed before the write continues, because the write always lands
//! on a *new* block: after a crash either tree root is consistent.
//!
//! The store's sharing test errs on the side of reporting blocks shared,
//! so sharing may get broken once per device rather than once per block.
//! That only costs an extra copy; a missed sharing would cost data.

use crate::{
    bdev::{Bdev, EventSink, IoSubmitter, PoolEvent},
    bio::{Bio, Dir},
    copier::{CopyCallback, CopyEngine, IoRegion},
    deferred::{DeferredSet, Entry},
    mapping::{EndioHook, MappingState, NewMapping},
    pmd::{FindResult, MetadataStore},
    prison::{CellId, CellKey, Detained, Prison},
    thin::Thin,
    types::*,
    util::{Reservoir, Slot, div_roundup},
};
use futures::{
    StreamExt,
    channel::{mpsc, oneshot},
};
use lazy_static::lazy_static;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// Tunable constants
const PRISON_CELLS: usize = 1024;
const MAPPING_POOL_SIZE: usize = 1024;
const ENDIO_HOOK_POOL_SIZE: usize = 10240;

lazy_static! {
    /// Every live pool, keyed by the device name of the pool target bound
    /// to it, so that multiple thin targets can share one pool.
    static ref POOL_TABLE: Mutex<BTreeMap<String, Weak<Pool>>> =
        Mutex::new(BTreeMap::new());
}

enum WorkerMsg {
    Wake,
    /// Run one pass, then acknowledge.
    Drain(oneshot::Sender<()>),
}

/// Everything protected by the single pool lock
struct PoolLists {
    deferred_bios: VecDeque<Bio>,
    prepared_mappings: Vec<Arc<NewMapping>>,
    /// Bios that failed allocation for want of space, parked until the
    /// next resume
    retry_list: VecDeque<Bio>,
    /// A low-water event has been sent
    low_water_triggered: bool,
    /// Reservation for the next mapping record, so the worker never stalls
    /// on the mapping pool in the middle of processing a bio
    next_mapping: Option<Slot>,
}

/// A pool ties together a metadata store and a data device and provides
/// the machinery shared by every thin device built on them.
pub struct Pool {
    pub(crate) pmd: Arc<dyn MetadataStore>,
    copier: Arc<dyn CopyEngine>,
    pub(crate) submitter: Arc<dyn IoSubmitter>,
    events: Arc<dyn EventSink>,

    pub(crate) sectors_per_block: SectorT,
    pub(crate) block_shift: u32,
    offset_mask: SectorT,
    low_water_blocks: AtomicU64,
    zero_new_blocks: AtomicBool,
    /// Identity of the bound pool target; 0 when unbound
    bound: AtomicU64,

    prison: Prison,
    ds: DeferredSet<Arc<NewMapping>>,
    lock: Mutex<PoolLists>,
    mapping_pool: Arc<Reservoir>,
    endio_hook_pool: Arc<Reservoir>,
    tx: mpsc::UnboundedSender<WorkerMsg>,
    myself: Weak<Pool>,
}

impl Pool {
    /// Create a pool over an already-open metadata store.
    ///
    /// Spawns the pool's worker task, so a tokio runtime must be current.
    /// `data_block_size` is in sectors and must be a power of two; the
    /// target constructor validates the rest.
    pub(crate) fn create(
        pmd: Arc<dyn MetadataStore>,
        copier: Arc<dyn CopyEngine>,
        submitter: Arc<dyn IoSubmitter>,
        events: Arc<dyn EventSink>,
        data_block_size: SectorT,
    ) -> Arc<Self> {
        debug_assert!(data_block_size.is_power_of_two());
        let (tx, rx) = mpsc::unbounded();
        let pool = Arc::new_cyclic(|myself| Pool {
            pmd,
            copier,
            submitter,
            events,
            sectors_per_block: data_block_size,
            block_shift: data_block_size.trailing_zeros(),
            offset_mask: data_block_size - 1,
            low_water_blocks: AtomicU64::new(0),
            zero_new_blocks: AtomicBool::new(true),
            bound: AtomicU64::new(0),
            prison: Prison::new(PRISON_CELLS),
            ds: DeferredSet::new(),
            lock: Mutex::new(PoolLists {
                deferred_bios: VecDeque::new(),
                prepared_mappings: Vec::new(),
                retry_list: VecDeque::new(),
                low_water_triggered: false,
                next_mapping: None,
            }),
            mapping_pool: Reservoir::new(MAPPING_POOL_SIZE),
            endio_hook_pool: Reservoir::new(ENDIO_HOOK_POOL_SIZE),
            tx,
            myself: myself.clone(),
        });
        tokio::spawn(Pool::worker(Arc::downgrade(&pool), rx));
        pool
    }

    /// Look up the pool bound to `key`, or create it with `make` and
    /// remember it.
    pub(crate) fn find_or_create<F>(key: &str, make: F) -> Result<Arc<Pool>>
        where F: FnOnce() -> Result<Arc<Pool>>
    {
        let mut table = POOL_TABLE.lock().unwrap();
        if let Some(pool) = table.get(key).and_then(Weak::upgrade) {
            return Ok(pool);
        }
        let pool = make()?;
        table.insert(key.to_owned(), Arc::downgrade(&pool));
        Ok(pool)
    }

    /// Find an existing pool by the bound pool target's device name.
    pub(crate) fn lookup(key: &str) -> Option<Arc<Pool>> {
        POOL_TABLE.lock().unwrap().get(key).and_then(Weak::upgrade)
    }

    /// Latch a pool target's configuration onto the pool.
    pub(crate) fn bind(
        &self,
        target_id: u64,
        low_water_sectors: SectorT,
        zero_new_blocks: bool,
        metadata_dev: Arc<dyn Bdev>,
    ) -> Result {
        self.low_water_blocks.store(
            div_roundup(low_water_sectors, self.sectors_per_block),
            Ordering::Relaxed);
        self.zero_new_blocks.store(zero_new_blocks, Ordering::Relaxed);
        self.bound.store(target_id, Ordering::Relaxed);
        self.pmd.rebind(metadata_dev)
    }

    pub(crate) fn unbind(&self, target_id: u64) {
        let _ = self.bound.compare_exchange(target_id, 0, Ordering::Relaxed,
            Ordering::Relaxed);
    }

    /// The single worker task.  Holds only a weak reference so that
    /// dropping the last target tears the pool down; the channel closing
    /// ends the task.
    async fn worker(
        pool: Weak<Pool>,
        mut rx: mpsc::UnboundedReceiver<WorkerMsg>,
    ) {
        while let Some(msg) = rx.next().await {
            let Some(pool) = pool.upgrade() else { break };
            pool.process_prepared_mappings();
            pool.process_deferred_bios();
            if let WorkerMsg::Drain(done) = msg {
                let _ = done.send(());
            }
        }
    }

    fn wake_worker(&self) {
        let _ = self.tx.unbounded_send(WorkerMsg::Wake);
    }

    /// Wait for the worker to finish a full pass over its queues.
    pub(crate) async fn drain_worker(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.unbounded_send(WorkerMsg::Drain(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Hand a bio to the worker.
    pub(crate) fn defer_bio(&self, bio: Bio) {
        self.lock.lock().unwrap().deferred_bios.push_back(bio);
        self.wake_worker();
    }

    /// Rewrite a bio's sector into the data device's address space.
    pub(crate) fn remap(&self, bio: &mut Bio, block: BlockT) {
        let sector = (block << self.block_shift)
            | (bio.sector() & self.offset_mask);
        bio.set_sector(sector);
    }

    /// Remap a bio and send it to the data device.  Flush/FUA bios get a
    /// synchronous metadata commit first so they observe every mapping
    /// committed before them.
    fn remap_and_issue(&self, mut bio: Bio, block: BlockT) {
        if bio.is_flush_or_fua() {
            if let Err(e) = self.pmd.commit() {
                tracing::error!("metadata commit failed, error = {}", e);
                bio.complete(Err(Error::EIO));
                return;
            }
        }
        self.remap(&mut bio, block);
        self.submitter.submit(bio);
    }

    fn io_covers_block(&self, bio: &Bio) -> bool {
        (bio.sector() & self.offset_mask) == 0
            && bio.sectors() == self.sectors_per_block
    }

    /// Allocate a data block, raising the low-water event the first time
    /// free space sinks to the mark.
    fn alloc_data_block(&self) -> Result<BlockT> {
        let free_blocks = self.pmd.get_free_block_count()?;
        if free_blocks <= self.low_water_blocks.load(Ordering::Relaxed) {
            let raise = {
                let mut lists = self.lock.lock().unwrap();
                !std::mem::replace(&mut lists.low_water_triggered, true)
            };
            if raise {
                self.events.pool_event(PoolEvent::LowWater);
            }
        }
        self.pmd.alloc_data_block()
    }

    /// Make sure a mapping record is reserved before processing a bio that
    /// might need one.
    fn ensure_next_mapping(&self) -> Result {
        let mut lists = self.lock.lock().unwrap();
        if lists.next_mapping.is_none() {
            match self.mapping_pool.try_acquire() {
                Some(slot) => lists.next_mapping = Some(slot),
                None => return Err(Error::ENOMEM),
            }
        }
        Ok(())
    }

    fn get_next_mapping(
        &self,
        tc: Arc<Thin>,
        virt_block: BlockT,
        data_block: BlockT,
        cell: CellId,
    ) -> Arc<NewMapping> {
        let slot = self.lock.lock().unwrap().next_mapping.take()
            .expect("ensure_next_mapping was not called");
        NewMapping::new(tc, virt_block, data_block, cell, slot)
    }

    /// Post a record to the prepared queue once it is both quiesced and
    /// done.  Idempotent; callable from completion context.
    pub(crate) fn maybe_add_mapping(&self, m: &Arc<NewMapping>) {
        {
            let mut inner = m.inner.lock().unwrap();
            if inner.state != MappingState::Scheduled
                || !inner.done
                || !inner.quiesced
            {
                return;
            }
            inner.state = MappingState::Prepared;
        }
        self.lock.lock().unwrap().prepared_mappings.push(m.clone());
        self.wake_worker();
    }

    /// Retire a shared-block read's admission, releasing any mapping
    /// records that were waiting on it.
    pub(crate) fn shared_read_endio(&self, entry: Entry) {
        let mut released = Vec::new();
        self.ds.dec(entry, &mut released);
        for m in released {
            m.inner.lock().unwrap().quiesced = true;
            self.maybe_add_mapping(&m);
        }
    }

    fn copy_complete(
        m: Arc<NewMapping>,
        read_err: Option<Error>,
        write_err: Option<Error>,
    ) {
        let pool = m.tc.pool.clone();
        {
            let mut inner = m.inner.lock().unwrap();
            if read_err.is_some() || write_err.is_some() {
                inner.err = Some(Error::EIO);
            }
            inner.done = true;
        }
        pool.maybe_add_mapping(&m);
    }

    /// Error out an in-flight mapping: its instigating bio (if the caller
    /// recovered one) and everything detained behind it.
    fn fail_mapping(&self, m: &Arc<NewMapping>, bio: Option<Bio>) {
        m.inner.lock().unwrap().state = MappingState::Failed;
        if let Some(bio) = bio {
            bio.complete(Err(Error::EIO));
        }
        self.prison.fail(m.cell);
    }

    /// Issue a whole-block write straight to its new data block.  The
    /// write's own completion is what prepares the mapping, so no copy or
    /// zero is needed.
    fn issue_overwrite(&self, m: Arc<NewMapping>, mut bio: Bio,
                       data_block: BlockT)
    {
        {
            let mut inner = m.inner.lock().unwrap();
            inner.overwrite = true;
            inner.state = MappingState::Scheduled;
        }
        bio.hook = Some(EndioHook::Overwrite { m });
        self.remap_and_issue(bio, data_block);
    }

    fn schedule_copy(
        &self,
        tc: Arc<Thin>,
        virt_block: BlockT,
        data_origin: BlockT,
        data_dest: BlockT,
        cell: CellId,
        bio: Bio,
    ) {
        let m = self.get_next_mapping(tc, virt_block, data_dest, cell);
        if self.ds.add_work(m.clone()).is_err() {
            // No reads to wait for
            m.inner.lock().unwrap().quiesced = true;
        }

        if self.io_covers_block(&bio) {
            self.issue_overwrite(m, bio, data_dest);
        } else {
            {
                let mut inner = m.inner.lock().unwrap();
                inner.bio = Some(bio);
                inner.state = MappingState::Scheduled;
            }
            let from = IoRegion {
                sector: data_origin * self.sectors_per_block,
                count: self.sectors_per_block,
            };
            let to = IoRegion {
                sector: data_dest * self.sectors_per_block,
                count: self.sectors_per_block,
            };
            let mc = m.clone();
            let cb: CopyCallback = Box::new(move |read_err, write_err| {
                Pool::copy_complete(mc, read_err, write_err)
            });
            if self.copier.copy(from, to, cb).is_err() {
                tracing::error!("copy dispatch failed");
                let bio = m.inner.lock().unwrap().bio.take();
                self.fail_mapping(&m, bio);
            }
        }
    }

    fn schedule_zero(
        &self,
        tc: Arc<Thin>,
        virt_block: BlockT,
        data_block: BlockT,
        cell: CellId,
        bio: Bio,
    ) {
        let m = self.get_next_mapping(tc, virt_block, data_block, cell);
        // The new block is reachable only through this record until the
        // commit, so there are no reads to quiesce.
        m.inner.lock().unwrap().quiesced = true;

        if !self.zero_new_blocks.load(Ordering::Relaxed)
            || self.io_covers_block(&bio)
        {
            self.issue_overwrite(m, bio, data_block);
        } else {
            {
                let mut inner = m.inner.lock().unwrap();
                inner.bio = Some(bio);
                inner.state = MappingState::Scheduled;
            }
            let to = IoRegion {
                sector: data_block * self.sectors_per_block,
                count: self.sectors_per_block,
            };
            let mc = m.clone();
            let cb: CopyCallback = Box::new(move |read_err, write_err| {
                Pool::copy_complete(mc, read_err, write_err)
            });
            if self.copier.zero(to, cb).is_err() {
                tracing::error!("zero dispatch failed");
                let bio = m.inner.lock().unwrap().bio.take();
                self.fail_mapping(&m, bio);
            }
        }
    }

    /// Park a cell's population on the retry list until the pool grows.
    fn no_space(&self, cell: CellId, bio: Bio) {
        let waiters = self.prison.release(cell);
        let mut lists = self.lock.lock().unwrap();
        lists.retry_list.push_back(bio);
        lists.retry_list.extend(waiters);
    }

    fn break_sharing(
        &self,
        tc: Arc<Thin>,
        bio: Bio,
        block: BlockT,
        data_origin: BlockT,
        cell: CellId,
    ) {
        match self.alloc_data_block() {
            Ok(data_dest) => {
                self.schedule_copy(tc, block, data_origin, data_dest, cell,
                    bio);
            },
            Err(Error::ENOSPC) => self.no_space(cell, bio),
            Err(e) => {
                tracing::error!("data block allocation failed, error = {}", e);
                bio.complete(Err(Error::EIO));
                self.prison.fail(cell);
            },
        }
    }

    fn process_shared_bio(
        &self,
        tc: Arc<Thin>,
        bio: Bio,
        block: BlockT,
        data_block: BlockT,
    ) {
        // If the cell is already occupied, sharing is already in the
        // process of being broken, so there is nothing further to do here.
        let key = CellKey::data(tc.dev_id, data_block);
        let (cell, mut bio) = match self.prison.detain(key, bio) {
            Detained::Queued => return,
            Detained::Holder(cell, bio) => (cell, bio),
        };

        if bio.dir() == Dir::Write {
            self.break_sharing(tc, bio, block, data_block, cell);
        } else {
            let slot = self.endio_hook_pool.acquire();
            let entry = self.ds.inc();
            bio.hook = Some(EndioHook::SharedRead {
                pool: self.myself.clone(),
                entry,
                slot,
            });
            self.prison.release_singleton(cell);
            self.remap_and_issue(bio, data_block);
        }
    }

    fn provision_block(&self, tc: Arc<Thin>, block: BlockT, cell: CellId,
                       bio: Bio)
    {
        match self.alloc_data_block() {
            Ok(data_block) => {
                self.schedule_zero(tc, block, data_block, cell, bio);
            },
            Err(Error::ENOSPC) => self.no_space(cell, bio),
            Err(e) => {
                tracing::error!("data block allocation failed, error = {}", e);
                bio.complete(Err(Error::EIO));
                self.prison.fail(cell);
            },
        }
    }

    fn process_bio(&self, tc: Arc<Thin>, bio: Bio) {
        let block = tc.bio_block(&bio);

        // If the cell is already occupied, the block is already being
        // provisioned and this bio will be observed when that commits.
        let key = CellKey::virt(tc.dev_id, block);
        let (cell, bio) = match self.prison.detain(key, bio) {
            Detained::Queued => return,
            Detained::Holder(cell, bio) => (cell, bio),
        };

        match self.pmd.find_block(tc.dev_id, block, true) {
            Ok(FindResult::Found { data_block, shared }) => {
                // The worker is the only task that detains bios and there
                // were no predecessors, so the cell can go right away.
                self.prison.release_singleton(cell);
                if shared {
                    self.process_shared_bio(tc, bio, block, data_block);
                } else {
                    self.remap_and_issue(bio, data_block);
                }
            },
            Ok(FindResult::NotFound) => {
                self.provision_block(tc, block, cell, bio);
            },
            other => {
                tracing::error!("mapping lookup failed: {:?}", other);
                bio.complete(Err(Error::EIO));
                self.prison.fail(cell);
            },
        }
    }

    fn process_deferred_bios(&self) {
        let mut bios = {
            let mut lists = self.lock.lock().unwrap();
            std::mem::take(&mut lists.deferred_bios)
        };

        while let Some(bio) = bios.pop_front() {
            // If there are no free mapping records, and processing this
            // bio might need one, push the batch back and pause until some
            // prepared mappings retire.
            if self.ensure_next_mapping().is_err() {
                let mut lists = self.lock.lock().unwrap();
                lists.deferred_bios.push_back(bio);
                lists.deferred_bios.append(&mut bios);
                return;
            }
            let tc = bio.tc.clone().expect("deferred bio lost its thin");
            self.process_bio(tc, bio);
        }
    }

    fn process_prepared_mapping(&self, m: Arc<NewMapping>) {
        let (mut bio, overwrite, err) = {
            let mut inner = m.inner.lock().unwrap();
            (inner.bio.take(), inner.overwrite, inner.err)
        };

        if err.is_some() {
            self.fail_mapping(&m, bio);
            return;
        }

        // Commit the mapping.  This also breaks some sharing of B-tree
        // nodes with other devices, but only in this device's tree.
        if let Err(e) = self.pmd.insert_block(m.tc.dev_id, m.virt_block,
            m.data_block)
        {
            tracing::error!("mapping insert failed, error = {}", e);
            self.fail_mapping(&m, bio);
            return;
        }
        m.inner.lock().unwrap().state = MappingState::Committed;

        // Release the detained bios.  An overwrite already carried the
        // instigating write to the new block, so only its cellmates get
        // requeued and the write itself completes; otherwise everything,
        // instigator included, goes back for remapping against the new
        // mapping.
        let waiters = self.prison.release(m.cell);
        {
            let mut lists = self.lock.lock().unwrap();
            lists.deferred_bios.extend(waiters);
            if !overwrite {
                if let Some(bio) = bio.take() {
                    lists.deferred_bios.push_back(bio);
                }
            }
        }
        self.wake_worker();
        if overwrite {
            bio.expect("overwrite mapping lost its bio").complete(Ok(()));
        }
        m.inner.lock().unwrap().state = MappingState::Released;
    }

    fn process_prepared_mappings(&self) {
        let maps = {
            let mut lists = self.lock.lock().unwrap();
            std::mem::take(&mut lists.prepared_mappings)
        };
        for m in maps {
            self.process_prepared_mapping(m);
        }
    }

    /// Clear the low-water latch and give every bio that previously ran
    /// out of space another chance.
    pub(crate) fn resume(&self) {
        {
            let mut lists = self.lock.lock().unwrap();
            lists.low_water_triggered = false;
            let retries = std::mem::take(&mut lists.retry_list);
            lists.deferred_bios.extend(retries);
        }
        self.wake_worker();
    }

    pub(crate) fn is_congested(&self) -> bool {
        !self.lock.lock().unwrap().retry_list.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn deferred_len(&self) -> usize {
        self.lock.lock().unwrap().deferred_bios.len()
    }

    #[cfg(test)]
    pub(crate) fn retry_len(&self) -> usize {
        self.lock.lock().unwrap().retry_list.len()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.pmd.close().is_err() {
            tracing::warn!("metadata close failed");
        }
    }
}
