// vim: tw=80
//! Common type definitions used throughout the thin-provisioning engine

use enum_primitive_derive::Primitive;
use num_traits::ToPrimitive;
use std::fmt;

/// Indexes a 512-byte sector on a block device.
pub type SectorT = u64;

/// Indexes a block, either a virtual block within a thin device or a data
/// block within the pool's data device.
pub type BlockT = u64;

/// Identifies a thin device within its pool.  Restricted to 24 bits.
pub type ThinId = u64;

/// log2 of the sector size
pub const SECTOR_SHIFT: u32 = 9;

/// The block size of the device holding pool data must be between 64KB and
/// 1GB.
pub const DATA_BLOCK_SIZE_MIN_SECTORS: SectorT = (64 * 1024) >> SECTOR_SHIFT;
pub const DATA_BLOCK_SIZE_MAX_SECTORS: SectorT =
    (1024 * 1024 * 1024) >> SECTOR_SHIFT;

/// Upper bound on the size of the metadata device
pub const METADATA_DEV_MAX_SECTORS: SectorT = 255 * (1 << 14) * 8;

/// Device ids are restricted to 24 bits.
pub const MAX_DEV_ID: ThinId = (1 << 24) - 1;

/// The engine's error type.  Basically just an errno.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum Error {
    E2BIG       = libc::E2BIG as isize,
    EBUSY       = libc::EBUSY as isize,
    EEXIST      = libc::EEXIST as isize,
    EINVAL      = libc::EINVAL as isize,
    EIO         = libc::EIO as isize,
    ENODATA     = libc::ENODATA as isize,
    ENODEV      = libc::ENODEV as isize,
    ENOENT      = libc::ENOENT as isize,
    ENOMEM      = libc::ENOMEM as isize,
    ENOSPC      = libc::ENOSPC as isize,
    EWOULDBLOCK = libc::EWOULDBLOCK as isize,
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        e.to_i32().unwrap()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

pub type Result<T = ()> = std::result::Result<T, Error>;
