// vim: tw=80
//! A thin-provisioning block storage engine
//!
//! Many sparsely-populated *thin devices* map their virtual blocks onto
//! one shared pool of physical data blocks.  Blocks are allocated lazily
//! on first write, and writable snapshots cost only the copy-on-write of
//! the blocks that subsequently diverge.
//!
//! The persistent B-tree/space-map layer, the block-device access, and
//! the bulk copy engine are all consumed through traits ([`pmd`],
//! [`bdev`], [`copier`]); this crate is the machinery in between: the
//! [`prison`] that serializes per-block I/O, the [`deferred`] set that
//! holds mapping commits behind in-flight reads, and the [`pool`] worker
//! that drives provisioning and sharing-breaks to completion.

pub mod bdev;
pub mod bio;
pub mod copier;
pub mod deferred;
mod mapping;
pub mod pmd;
pub mod pool;
pub mod prison;
pub mod target;
pub mod thin;
pub mod types;
pub mod util;

pub use crate::types::*;
pub use crate::util::div_roundup;
