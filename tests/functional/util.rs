// vim: tw=80
//! In-memory fakes for the engine's external collaborators

use divbuf::DivBufShared;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};
use thinp::{
    bdev::{Bdev, BdevOpener, EventSink, IoSubmitter, PoolEvent},
    bio::{Bio, BioDone, Dir},
    copier::{CopyCallback, CopyEngine, IoRegion},
    pmd::{FindResult, MetadataOpener, MetadataStore},
    target::{PoolIo, PoolTarget, ThinTarget},
    types::*,
};
use tokio::task::yield_now;

pub const BS: SectorT = 128;
pub const BS_BYTES: usize = (BS as usize) << SECTOR_SHIFT;

/// Let the pool worker run until it goes idle.
pub async fn settle() {
    for _ in 0..64 {
        yield_now().await;
    }
}

#[derive(Default)]
struct PmdState {
    sb_data_size: BlockT,
    allocated: BTreeSet<BlockT>,
    thins: BTreeMap<ThinId, BTreeMap<BlockT, BlockT>>,
    /// How many thin mappings reference each data block; a block is
    /// shared while more than one does
    refs: BTreeMap<BlockT, u32>,
    open: BTreeSet<ThinId>,
    transaction_id: u64,
    commits: u64,
    alloc_calls: u64,
    fail_next_commit: bool,
}

/// A `HashMap`-backed metadata store.  Sharing is tracked by exact
/// reference counts, so unlike a production store it never reports false
/// positives; the engine must work either way.
pub struct RamPmd {
    state: Mutex<PmdState>,
}

/// Drop one reference to `d`, returning it to the free pool when nothing
/// maps it any more.
fn unref(state: &mut PmdState, d: BlockT) {
    if let Some(r) = state.refs.get_mut(&d) {
        *r -= 1;
        if *r == 0 {
            state.refs.remove(&d);
            state.allocated.remove(&d);
        }
    }
}

impl RamPmd {
    pub fn new() -> Arc<Self> {
        Arc::new(RamPmd { state: Mutex::new(PmdState::default()) })
    }

    pub fn alloc_calls(&self) -> u64 {
        self.state.lock().unwrap().alloc_calls
    }

    pub fn commits(&self) -> u64 {
        self.state.lock().unwrap().commits
    }

    pub fn fail_next_commit(&self) {
        self.state.lock().unwrap().fail_next_commit = true;
    }

    /// Peek at a committed mapping.
    pub fn mapping(&self, dev: ThinId, block: BlockT) -> Option<BlockT> {
        self.state.lock().unwrap()
            .thins.get(&dev)
            .and_then(|m| m.get(&block))
            .copied()
    }
}

impl MetadataStore for RamPmd {
    fn close(&self) -> Result {
        Ok(())
    }

    fn rebind(&self, _bdev: Arc<dyn Bdev>) -> Result {
        Ok(())
    }

    fn get_data_dev_size(&self) -> Result<BlockT> {
        Ok(self.state.lock().unwrap().sb_data_size)
    }

    fn resize_data_dev(&self, new_size: BlockT) -> Result {
        let mut state = self.state.lock().unwrap();
        if new_size < state.sb_data_size {
            return Err(Error::EINVAL);
        }
        state.sb_data_size = new_size;
        Ok(())
    }

    fn alloc_data_block(&self) -> Result<BlockT> {
        let mut state = self.state.lock().unwrap();
        state.alloc_calls += 1;
        let state = &mut *state;
        let d = (0..state.sb_data_size)
            .find(|d| !state.allocated.contains(d))
            .ok_or(Error::ENOSPC)?;
        state.allocated.insert(d);
        Ok(d)
    }

    fn get_free_block_count(&self) -> Result<BlockT> {
        let state = self.state.lock().unwrap();
        Ok(state.sb_data_size - state.allocated.len() as BlockT)
    }

    fn get_free_metadata_block_count(&self) -> Result<BlockT> {
        Ok(100)
    }

    fn get_held_metadata_root(&self) -> Result<Option<BlockT>> {
        Ok(None)
    }

    fn get_transaction_id(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().transaction_id)
    }

    fn set_transaction_id(&self, old: u64, new: u64) -> Result {
        let mut state = self.state.lock().unwrap();
        if state.transaction_id != old {
            return Err(Error::EINVAL);
        }
        state.transaction_id = new;
        Ok(())
    }

    fn create_thin(&self, dev: ThinId) -> Result {
        let mut state = self.state.lock().unwrap();
        if state.thins.contains_key(&dev) {
            return Err(Error::EEXIST);
        }
        state.thins.insert(dev, BTreeMap::new());
        Ok(())
    }

    fn create_snap(&self, dev: ThinId, origin: ThinId) -> Result {
        let mut state = self.state.lock().unwrap();
        if state.thins.contains_key(&dev) {
            return Err(Error::EEXIST);
        }
        let mappings = state.thins.get(&origin)
            .ok_or(Error::ENOENT)?
            .clone();
        for d in mappings.values() {
            *state.refs.entry(*d).or_insert(0) += 1;
        }
        state.thins.insert(dev, mappings);
        Ok(())
    }

    fn delete_thin(&self, dev: ThinId) -> Result {
        let mut state = self.state.lock().unwrap();
        let mappings = state.thins.remove(&dev).ok_or(Error::ENOENT)?;
        for d in mappings.values() {
            unref(&mut state, *d);
        }
        Ok(())
    }

    fn trim_thin(&self, dev: ThinId, new_size: BlockT) -> Result {
        let mut state = self.state.lock().unwrap();
        let mappings = state.thins.get_mut(&dev).ok_or(Error::ENOENT)?;
        let cut = mappings.range(new_size..)
            .map(|(v, d)| (*v, *d))
            .collect::<Vec<_>>();
        for (v, _) in &cut {
            mappings.remove(v);
        }
        for (_, d) in cut {
            unref(&mut state, d);
        }
        Ok(())
    }

    fn open_thin(&self, dev: ThinId) -> Result {
        let mut state = self.state.lock().unwrap();
        if !state.thins.contains_key(&dev) {
            return Err(Error::ENOENT);
        }
        state.open.insert(dev);
        Ok(())
    }

    fn close_thin(&self, dev: ThinId) -> Result {
        self.state.lock().unwrap().open.remove(&dev);
        Ok(())
    }

    fn find_block(&self, dev: ThinId, block: BlockT, _can_block: bool)
        -> Result<FindResult>
    {
        let state = self.state.lock().unwrap();
        let mappings = state.thins.get(&dev).ok_or(Error::ENODEV)?;
        match mappings.get(&block) {
            Some(d) => Ok(FindResult::Found {
                data_block: *d,
                shared: state.refs.get(d).copied().unwrap_or(0) > 1,
            }),
            None => Ok(FindResult::NotFound),
        }
    }

    fn insert_block(&self, dev: ThinId, block: BlockT, data_block: BlockT)
        -> Result
    {
        let mut state = self.state.lock().unwrap();
        let mappings = state.thins.get_mut(&dev).ok_or(Error::ENODEV)?;
        let old = mappings.insert(block, data_block);
        if old == Some(data_block) {
            return Ok(());
        }
        *state.refs.entry(data_block).or_insert(0) += 1;
        state.allocated.insert(data_block);
        if let Some(old) = old {
            unref(&mut state, old);
        }
        Ok(())
    }

    fn get_mapped_count(&self, dev: ThinId) -> Result<BlockT> {
        let state = self.state.lock().unwrap();
        let mappings = state.thins.get(&dev).ok_or(Error::ENODEV)?;
        Ok(mappings.len() as BlockT)
    }

    fn get_highest_mapped(&self, dev: ThinId) -> Result<Option<BlockT>> {
        let state = self.state.lock().unwrap();
        let mappings = state.thins.get(&dev).ok_or(Error::ENODEV)?;
        Ok(mappings.keys().next_back().copied())
    }

    fn commit(&self) -> Result {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_commit {
            state.fail_next_commit = false;
            return Err(Error::EIO);
        }
        state.commits += 1;
        Ok(())
    }
}

enum CopyOp {
    Copy { from: IoRegion, to: IoRegion, cb: CopyCallback },
    Zero { to: IoRegion, cb: CopyCallback },
}

/// A RAM-backed data device that doubles as submitter and copy engine.
/// Individual traffic classes can be held captive to stage the
/// interleavings the scenarios need.
pub struct RamDisk {
    buf: Mutex<Vec<u8>>,
    hold_reads: AtomicBool,
    hold_writes: AtomicBool,
    hold_copies: AtomicBool,
    held_bios: Mutex<Vec<Bio>>,
    held_copies: Mutex<Vec<CopyOp>>,
}

impl RamDisk {
    pub fn new(bytes: usize) -> Arc<Self> {
        Arc::new(RamDisk {
            buf: Mutex::new(vec![0u8; bytes]),
            hold_reads: AtomicBool::new(false),
            hold_writes: AtomicBool::new(false),
            hold_copies: AtomicBool::new(false),
            held_bios: Mutex::new(Vec::new()),
            held_copies: Mutex::new(Vec::new()),
        })
    }

    pub fn grow(&self, bytes: usize) {
        let mut buf = self.buf.lock().unwrap();
        assert!(bytes >= buf.len());
        buf.resize(bytes, 0);
    }

    pub fn hold_reads(&self, hold: bool) {
        self.hold_reads.store(hold, Ordering::Relaxed);
    }

    pub fn hold_writes(&self, hold: bool) {
        self.hold_writes.store(hold, Ordering::Relaxed);
    }

    pub fn hold_copies(&self, hold: bool) {
        self.hold_copies.store(hold, Ordering::Relaxed);
    }

    pub fn held_count(&self) -> usize {
        self.held_bios.lock().unwrap().len()
    }

    /// Perform and complete every held bio.
    pub fn release_bios(&self) {
        let held = std::mem::take(&mut *self.held_bios.lock().unwrap());
        for bio in held {
            self.perform(bio);
        }
    }

    /// Perform every held copy/zero and run its callback.
    pub fn release_copies(&self) {
        let held = std::mem::take(&mut *self.held_copies.lock().unwrap());
        for op in held {
            self.do_copy(op);
        }
    }

    /// Raw peek at the device contents.
    pub fn contents(&self, sector: SectorT, sectors: SectorT) -> Vec<u8> {
        let buf = self.buf.lock().unwrap();
        let offset = (sector as usize) << SECTOR_SHIFT;
        let len = (sectors as usize) << SECTOR_SHIFT;
        buf[offset..offset + len].to_vec()
    }

    fn perform(&self, mut bio: Bio) {
        let offset = (bio.sector() as usize) << SECTOR_SHIFT;
        let len = (bio.sectors() as usize) << SECTOR_SHIFT;
        {
            let mut buf = self.buf.lock().unwrap();
            if offset + len > buf.len() {
                drop(buf);
                bio.complete(Err(Error::EIO));
                return;
            }
            match bio.dir() {
                Dir::Write => {
                    if len > 0 {
                        buf[offset..offset + len]
                            .copy_from_slice(bio.payload());
                    }
                },
                Dir::Read => {
                    bio.payload_mut()
                        .copy_from_slice(&buf[offset..offset + len]);
                },
            }
        }
        bio.complete(Ok(()));
    }

    fn do_copy(&self, op: CopyOp) {
        match op {
            CopyOp::Copy { from, to, cb } => {
                let mut buf = self.buf.lock().unwrap();
                let src = (from.sector as usize) << SECTOR_SHIFT;
                let dst = (to.sector as usize) << SECTOR_SHIFT;
                let len = (from.count as usize) << SECTOR_SHIFT;
                buf.copy_within(src..src + len, dst);
                drop(buf);
                cb(None, None);
            },
            CopyOp::Zero { to, cb } => {
                let mut buf = self.buf.lock().unwrap();
                let dst = (to.sector as usize) << SECTOR_SHIFT;
                let len = (to.count as usize) << SECTOR_SHIFT;
                buf[dst..dst + len].fill(0);
                drop(buf);
                cb(None, None);
            },
        }
    }
}

impl IoSubmitter for RamDisk {
    fn submit(&self, bio: Bio) {
        let hold = match bio.dir() {
            Dir::Read => self.hold_reads.load(Ordering::Relaxed),
            Dir::Write => self.hold_writes.load(Ordering::Relaxed),
        };
        if hold {
            self.held_bios.lock().unwrap().push(bio);
        } else {
            self.perform(bio);
        }
    }
}

impl CopyEngine for RamDisk {
    fn copy(&self, from: IoRegion, to: IoRegion, cb: CopyCallback) -> Result {
        let op = CopyOp::Copy { from, to, cb };
        if self.hold_copies.load(Ordering::Relaxed) {
            self.held_copies.lock().unwrap().push(op);
        } else {
            self.do_copy(op);
        }
        Ok(())
    }

    fn zero(&self, to: IoRegion, cb: CopyCallback) -> Result {
        let op = CopyOp::Zero { to, cb };
        if self.hold_copies.load(Ordering::Relaxed) {
            self.held_copies.lock().unwrap().push(op);
        } else {
            self.do_copy(op);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingEvents {
    count: AtomicUsize,
}

impl CountingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(CountingEvents::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl EventSink for CountingEvents {
    fn pool_event(&self, _event: PoolEvent) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct RamBdev {
    name: String,
    size_sectors: AtomicU64,
}

impl RamBdev {
    pub fn new(name: &str, size_sectors: SectorT) -> Arc<Self> {
        Arc::new(RamBdev {
            name: name.to_owned(),
            size_sectors: AtomicU64::new(size_sectors),
        })
    }

    pub fn set_size_sectors(&self, size_sectors: SectorT) {
        self.size_sectors.store(size_sectors, Ordering::Relaxed);
    }
}

impl Bdev for RamBdev {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn size_sectors(&self) -> SectorT {
        self.size_sectors.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct DevMap {
    devs: Mutex<BTreeMap<String, Arc<RamBdev>>>,
}

impl DevMap {
    pub fn insert(&self, name: &str, bdev: Arc<RamBdev>) {
        self.devs.lock().unwrap().insert(name.to_owned(), bdev);
    }
}

impl BdevOpener for DevMap {
    fn open(&self, name: &str) -> Result<Arc<dyn Bdev>> {
        let bdev = self.devs.lock().unwrap()
            .get(name)
            .cloned()
            .ok_or(Error::ENOENT)?;
        Ok(bdev)
    }
}

struct FixedMetaOpener {
    pmd: Arc<RamPmd>,
}

impl MetadataOpener for FixedMetaOpener {
    fn open(&self, _bdev: Arc<dyn Bdev>, _data_block_size: SectorT)
        -> Result<Arc<dyn MetadataStore>>
    {
        Ok(self.pmd.clone())
    }
}

/// A fully wired pool target plus handles to all of its fakes.
pub struct Harness {
    pub name: &'static str,
    pub pool: PoolTarget,
    pub pmd: Arc<RamPmd>,
    pub disk: Arc<RamDisk>,
    pub events: Arc<CountingEvents>,
    pub data_dev: Arc<RamBdev>,
}

impl Harness {
    pub fn create_thin(&self, dev_id: ThinId) {
        self.pool.message(&["create_thin", &dev_id.to_string()]).unwrap();
    }

    pub fn create_snap(&self, dev_id: ThinId, origin: ThinId) {
        self.pool
            .message(&["create_snap", &dev_id.to_string(),
                &origin.to_string()])
            .unwrap();
    }

    pub fn thin(&self, dev_id: ThinId) -> ThinTarget {
        ThinTarget::new(&[self.name, &dev_id.to_string()]).unwrap()
    }

    /// Enlarge the data device and resume, picking up the new capacity.
    pub fn grow_data_dev(&self, blocks: BlockT) {
        self.data_dev.set_size_sectors(blocks * BS);
        self.disk.grow((blocks as usize) * BS_BYTES);
        self.pool.preresume().unwrap();
    }
}

pub struct PoolBuilder {
    name: &'static str,
    data_blocks: BlockT,
    low_water_sectors: SectorT,
    skip_block_zeroing: bool,
}

impl PoolBuilder {
    pub fn new(name: &'static str) -> Self {
        PoolBuilder {
            name,
            data_blocks: 16,
            low_water_sectors: BS,
            skip_block_zeroing: false,
        }
    }

    pub fn data_blocks(mut self, blocks: BlockT) -> Self {
        self.data_blocks = blocks;
        self
    }

    pub fn build(self) -> Harness {
        let pmd = RamPmd::new();
        let disk = RamDisk::new((self.data_blocks as usize) * BS_BYTES);
        let events = CountingEvents::new();
        let meta_dev = RamBdev::new("meta", 8192);
        let data_dev = RamBdev::new("data", self.data_blocks * BS);
        let devs = DevMap::default();
        devs.insert("meta", meta_dev);
        devs.insert("data", data_dev.clone());
        let io = PoolIo {
            bdevs: Arc::new(devs),
            meta: Arc::new(FixedMetaOpener { pmd: pmd.clone() }),
            copier: disk.clone(),
            submitter: disk.clone(),
            events: events.clone(),
        };
        let low_water = self.low_water_sectors.to_string();
        let mut args = vec!["meta", "data", "128", low_water.as_str()];
        if self.skip_block_zeroing {
            args.push("1");
            args.push("skip_block_zeroing");
        }
        let pool = PoolTarget::new(self.name, &args, &io).unwrap();
        pool.preresume().unwrap();
        Harness {
            name: self.name,
            pool,
            pmd,
            disk,
            events,
            data_dev,
        }
    }
}

/// Submit a write and hand back its completion.
pub fn start_write(tt: &ThinTarget, sector: SectorT, data: &[u8]) -> BioDone {
    let dbs = DivBufShared::from(data.to_vec());
    let (bio, done) = Bio::write(sector, dbs.try_const().unwrap());
    tt.map(bio);
    done
}

pub async fn write(tt: &ThinTarget, sector: SectorT, data: &[u8]) -> Result {
    start_write(tt, sector, data).await.unwrap()
}

pub async fn read(tt: &ThinTarget, sector: SectorT, sectors: SectorT)
    -> Result<Vec<u8>>
{
    let dbs = DivBufShared::from(
        vec![0u8; (sectors as usize) << SECTOR_SHIFT]);
    let (bio, done) = Bio::read(sector, dbs.try_mut().unwrap());
    tt.map(bio);
    done.await.unwrap()?;
    Ok(dbs.try_const().unwrap().to_vec())
}
