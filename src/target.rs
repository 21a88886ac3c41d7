// vim: tw=80
//! The pool and thin targets: construction, lifecycle, messages, status

use crate::{
    bdev::{Bdev, BdevOpener, EventSink, IoSubmitter},
    bio::Bio,
    copier::CopyEngine,
    pmd::MetadataOpener,
    pool::Pool,
    thin::{MapResult, Thin},
    types::*,
    util::div_roundup,
};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// The external collaborators targets are wired up with.
#[derive(Clone)]
pub struct PoolIo {
    pub bdevs: Arc<dyn BdevOpener>,
    pub meta: Arc<dyn MetadataOpener>,
    pub copier: Arc<dyn CopyEngine>,
    pub submitter: Arc<dyn IoSubmitter>,
    pub events: Arc<dyn EventSink>,
}

/// Which status line to format.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusType {
    Info,
    Table,
}

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

fn check_arg_count(argc: usize, required: usize) -> Result {
    if argc != required {
        tracing::warn!(
            "message received with {} arguments instead of {}",
            argc, required);
        return Err(Error::EINVAL);
    }
    Ok(())
}

fn read_dev_id(arg: &str, warning: bool) -> Result<ThinId> {
    match arg.parse::<ThinId>() {
        Ok(dev_id) if dev_id <= MAX_DEV_ID => Ok(dev_id),
        _ => {
            if warning {
                tracing::warn!(
                    "message received with invalid device id: {}", arg);
            }
            Err(Error::EINVAL)
        },
    }
}

struct PoolFeatures {
    zero_new_blocks: bool,
}

/// Parse the optional feature group: a count, 0 or 1, followed by that
/// many feature names.
fn parse_pool_features(args: &[&str]) -> Result<PoolFeatures> {
    let mut pf = PoolFeatures { zero_new_blocks: true };

    if args.is_empty() {
        return Ok(pf);
    }
    let argc = args[0].parse::<usize>().map_err(|_| Error::EINVAL)?;
    if argc > 1 || argc != args.len() - 1 {
        tracing::error!("invalid number of pool feature arguments");
        return Err(Error::EINVAL);
    }

    for arg in &args[1..] {
        if arg.eq_ignore_ascii_case("skip_block_zeroing") {
            pf.zero_new_blocks = false;
        } else {
            tracing::error!("unrecognised pool feature requested: {}", arg);
            return Err(Error::EINVAL);
        }
    }
    Ok(pf)
}

/// The pool target: binds a metadata device and a data device into a pool
/// and provides the control surface for creating and destroying thin
/// devices.
///
/// Construction is cheap and side-effect free on the metadata; call
/// [`PoolTarget::preresume`] to take control of the pool and start
/// servicing I/O.
pub struct PoolTarget {
    target_id: u64,
    pool: Arc<Pool>,
    metadata_dev: Arc<dyn Bdev>,
    data_dev: Arc<dyn Bdev>,
    low_water_sectors: SectorT,
    zero_new_blocks: bool,
}

impl PoolTarget {
    /// Construct a pool target.
    ///
    /// `pool_dev` is the name under which this target itself is presented;
    /// thin targets use it to find the pool, so several of them map onto
    /// one pool object.  `args` is the constructor table:
    ///
    /// ```text
    /// <metadata dev> <data dev>
    /// <data block size (sectors)>
    /// <low water mark (sectors)>
    /// [<#feature args> [<arg>]*]
    /// ```
    ///
    /// The only feature argument is `skip_block_zeroing`, which skips the
    /// zeroing of newly-provisioned blocks.
    pub fn new(pool_dev: &str, args: &[&str], io: &PoolIo) -> Result<Self> {
        if args.len() < 4 {
            tracing::error!("invalid argument count");
            return Err(Error::EINVAL);
        }

        let metadata_dev = io.bdevs.open(args[0])?;
        if metadata_dev.size_sectors() > METADATA_DEV_MAX_SECTORS {
            tracing::error!("metadata device is too large");
            return Err(Error::EINVAL);
        }

        let data_dev = io.bdevs.open(args[1])?;

        let block_size = args[2].parse::<SectorT>()
            .map_err(|_| Error::EINVAL)?;
        if block_size < DATA_BLOCK_SIZE_MIN_SECTORS
            || block_size > DATA_BLOCK_SIZE_MAX_SECTORS
            || !block_size.is_power_of_two()
        {
            tracing::error!("invalid block size");
            return Err(Error::EINVAL);
        }

        let low_water_sectors = args[3].parse::<SectorT>()
            .map_err(|_| Error::EINVAL)?;
        if low_water_sectors == 0 {
            tracing::error!("invalid low water mark");
            return Err(Error::EINVAL);
        }

        let pf = parse_pool_features(&args[4..])?;

        let pool = Pool::find_or_create(pool_dev, || {
            let pmd = io.meta.open(metadata_dev.clone(), block_size)?;
            Ok(Pool::create(pmd, io.copier.clone(), io.submitter.clone(),
                io.events.clone(), block_size))
        })?;

        Ok(PoolTarget {
            target_id: NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed),
            pool,
            metadata_dev,
            data_dev,
            low_water_sectors,
            zero_new_blocks: pf.zero_new_blocks,
        })
    }

    /// Take control of the pool and resume I/O.
    ///
    /// Compares the data device's size against the superblock's record of
    /// it, growing the store if the device has been enlarged.  This covers
    /// both opening a preallocated data device and a resume after
    /// userspace grew the device in response to a low-water event.
    /// Previously out-of-space I/O is requeued.
    pub fn preresume(&self) -> Result {
        self.pool.bind(self.target_id, self.low_water_sectors,
            self.zero_new_blocks, self.metadata_dev.clone())?;

        let data_size = self.data_dev.size_sectors() >> self.pool.block_shift;
        let sb_data_size = self.pool.pmd.get_data_dev_size()
            .map_err(|e| {
                tracing::error!("failed to retrieve data device size");
                e
            })?;
        if data_size < sb_data_size {
            tracing::error!(
                "pool target too small, is {} blocks (expected {})",
                data_size, sb_data_size);
            return Err(Error::EINVAL);
        } else if data_size > sb_data_size {
            self.pool.pmd.resize_data_dev(data_size).map_err(|e| {
                tracing::error!("failed to resize data device");
                e
            })?;
            self.pool.pmd.commit().map_err(|e| {
                tracing::error!("metadata commit failed, error = {}", e);
                e
            })?;
        }

        self.pool.resume();
        Ok(())
    }

    /// Quiesce the worker and commit outstanding metadata.
    pub async fn postsuspend(&self) {
        self.pool.drain_worker().await;
        if let Err(e) = self.pool.pmd.commit() {
            // The next flush or FUA bio will re-surface this
            tracing::error!("metadata commit failed, error = {}", e);
        }
    }

    /// I/O submitted to the pool device itself passes straight through to
    /// the data device.
    pub fn map(&self, bio: Bio) {
        self.pool.submitter.submit(bio);
    }

    /// Whether I/O is currently backed up waiting for the pool to grow.
    pub fn is_congested(&self) -> bool {
        self.pool.is_congested()
    }

    /// Handle a runtime message.  Supported:
    ///
    /// ```text
    /// create_thin        <dev id>
    /// create_snap        <dev id> <origin id>
    /// delete             <dev id>
    /// trim               <dev id> <new size in sectors>
    /// set_transaction_id <current trans id> <new trans id>
    /// ```
    ///
    /// Every successfully dispatched message is followed by a metadata
    /// commit.
    pub fn message(&self, argv: &[&str]) -> Result {
        let Some(cmd) = argv.first() else {
            return Err(Error::EINVAL);
        };

        if cmd.eq_ignore_ascii_case("create_thin") {
            self.create_thin_mesg(argv)?;
        } else if cmd.eq_ignore_ascii_case("create_snap") {
            self.create_snap_mesg(argv)?;
        } else if cmd.eq_ignore_ascii_case("delete") {
            self.delete_mesg(argv)?;
        } else if cmd.eq_ignore_ascii_case("trim") {
            self.trim_mesg(argv)?;
        } else if cmd.eq_ignore_ascii_case("set_transaction_id") {
            self.set_transaction_id_mesg(argv)?;
        } else {
            tracing::warn!(
                "unrecognised thin pool target message received: {}", cmd);
            return Err(Error::EINVAL);
        }

        self.pool.pmd.commit().map_err(|e| {
            tracing::error!("{} message: metadata commit failed, error = {}",
                cmd, e);
            e
        })
    }

    fn create_thin_mesg(&self, argv: &[&str]) -> Result {
        check_arg_count(argv.len(), 2)?;
        let dev_id = read_dev_id(argv[1], true)?;
        self.pool.pmd.create_thin(dev_id).map_err(|e| {
            tracing::warn!(
                "creation of new thinly-provisioned device with id {} failed",
                argv[1]);
            e
        })
    }

    fn create_snap_mesg(&self, argv: &[&str]) -> Result {
        check_arg_count(argv.len(), 3)?;
        let dev_id = read_dev_id(argv[1], true)?;
        let origin_id = read_dev_id(argv[2], true)?;
        self.pool.pmd.create_snap(dev_id, origin_id).map_err(|e| {
            tracing::warn!("creation of new snapshot {} of device {} failed",
                argv[1], argv[2]);
            e
        })
    }

    fn delete_mesg(&self, argv: &[&str]) -> Result {
        check_arg_count(argv.len(), 2)?;
        let dev_id = read_dev_id(argv[1], true)?;
        self.pool.pmd.delete_thin(dev_id).map_err(|e| {
            tracing::warn!("deletion of thin device {} failed", argv[1]);
            e
        })
    }

    fn trim_mesg(&self, argv: &[&str]) -> Result {
        check_arg_count(argv.len(), 3)?;
        let dev_id = read_dev_id(argv[1], true)?;
        let new_size = argv[2].parse::<SectorT>().map_err(|_| {
            tracing::warn!("trim device {}: invalid new size: {} sectors",
                argv[1], argv[2]);
            Error::EINVAL
        })?;
        self.pool.pmd
            .trim_thin(dev_id,
                div_roundup(new_size, self.pool.sectors_per_block))
            .map_err(|e| {
                tracing::warn!("attempt to trim thin device {} failed",
                    argv[1]);
                e
            })
    }

    fn set_transaction_id_mesg(&self, argv: &[&str]) -> Result {
        check_arg_count(argv.len(), 3)?;
        let old_id = argv[1].parse::<u64>().map_err(|_| {
            tracing::warn!("set_transaction_id message: unrecognised id {}",
                argv[1]);
            Error::EINVAL
        })?;
        let new_id = argv[2].parse::<u64>().map_err(|_| {
            tracing::warn!(
                "set_transaction_id message: unrecognised new id {}",
                argv[2]);
            Error::EINVAL
        })?;
        self.pool.pmd.set_transaction_id(old_id, new_id).map_err(|e| {
            tracing::warn!("failed to change transaction id from {} to {}",
                argv[1], argv[2]);
            e
        })
    }

    /// Format a status line.
    ///
    /// Info: `<transaction id> <free metadata space in sectors>
    /// <free data space in sectors> <held metadata root|->`
    pub fn status(&self, status_type: StatusType) -> Result<String> {
        match status_type {
            StatusType::Info => {
                let transaction_id = self.pool.pmd.get_transaction_id()?;
                let free_meta =
                    self.pool.pmd.get_free_metadata_block_count()?;
                let free_data = self.pool.pmd.get_free_block_count()?;
                let held_root = self.pool.pmd.get_held_metadata_root()?;
                let mut s = format!("{} {} {} ",
                    transaction_id,
                    free_meta * self.pool.sectors_per_block,
                    free_data * self.pool.sectors_per_block);
                match held_root {
                    Some(root) => s.push_str(&root.to_string()),
                    None => s.push('-'),
                }
                Ok(s)
            },
            StatusType::Table => {
                let nfeat = u32::from(!self.zero_new_blocks);
                let mut s = format!("{} {} {} {} {}",
                    self.metadata_dev.name(),
                    self.data_dev.name(),
                    self.pool.sectors_per_block,
                    self.low_water_sectors,
                    nfeat);
                if !self.zero_new_blocks {
                    s.push_str(" skip_block_zeroing");
                }
                Ok(s)
            },
        }
    }
}

impl Drop for PoolTarget {
    fn drop(&mut self) {
        self.pool.unbind(self.target_id);
    }
}

/// A thin target: one thin device presented out of a pool.
pub struct ThinTarget {
    tc: Option<Arc<Thin>>,
    pool_dev: String,
}

impl ThinTarget {
    /// Construct a thin target.  `args` is the constructor table:
    ///
    /// ```text
    /// <pool dev> <dev id>
    /// ```
    ///
    /// `pool_dev` names the pool target this device draws from, and
    /// `dev id` is the internal identifier from a `create_thin` or
    /// `create_snap` message.
    pub fn new(args: &[&str]) -> Result<Self> {
        if args.len() != 2 {
            tracing::error!("invalid argument count");
            return Err(Error::EINVAL);
        }
        let pool = Pool::lookup(args[0]).ok_or_else(|| {
            tracing::error!("couldn't find pool object");
            Error::EINVAL
        })?;
        let dev_id = read_dev_id(args[1], false)?;
        let tc = Thin::new(pool, dev_id)?;
        Ok(ThinTarget {
            tc: Some(tc),
            pool_dev: args[0].to_owned(),
        })
    }

    /// Map one bio through the non-blocking fast path.
    pub fn map(&self, bio: Bio) -> MapResult {
        match &self.tc {
            Some(tc) => tc.map(bio),
            None => {
                bio.complete(Err(Error::EIO));
                MapResult::Failed
            },
        }
    }

    /// Format a status line.
    ///
    /// Info: `<mapped sectors> <highest mapped sector|->`, or `-` if the
    /// device is unbound.
    pub fn status(&self, status_type: StatusType) -> Result<String> {
        let Some(tc) = &self.tc else {
            return Ok("-".to_owned());
        };
        match status_type {
            StatusType::Info => {
                let spb = tc.pool.sectors_per_block;
                let mapped = tc.pool.pmd.get_mapped_count(tc.dev_id())?;
                let highest = tc.pool.pmd.get_highest_mapped(tc.dev_id())?;
                let mut s = format!("{} ", mapped * spb);
                match highest {
                    Some(h) => s.push_str(&((h + 1) * spb - 1).to_string()),
                    None => s.push('-'),
                }
                Ok(s)
            },
            StatusType::Table => {
                Ok(format!("{} {}", self.pool_dev, tc.dev_id()))
            },
        }
    }
}

impl Drop for ThinTarget {
    fn drop(&mut self) {
        if let Some(tc) = self.tc.take() {
            if tc.pool.pmd.close_thin(tc.dev_id()).is_err() {
                tracing::warn!("failed to close thin device {}", tc.dev_id());
            }
        }
    }
}
