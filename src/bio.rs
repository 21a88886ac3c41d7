// vim: tw=80
//! The I/O descriptor passed through the engine

use crate::{mapping::EndioHook, thin::Thin, types::*};
use divbuf::{DivBuf, DivBufMut};
use futures::channel::oneshot;
use std::{fmt, sync::Arc};

/// Direction of a [`Bio`]'s data transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dir {
    Read,
    Write,
}

/// The bio's view of its issuer's buffer.  The issuer keeps the owning
/// `DivBufShared` and can take a fresh view once the bio completes.
enum Payload {
    /// Filled in by the submitter
    Read(DivBufMut),
    Write(DivBuf),
}

/// Resolves with the final status of a [`Bio`] once the engine completes
/// it.  Dropping the bio without completion resolves the receiver with
/// `Canceled`.
pub type BioDone = oneshot::Receiver<Result>;

/// One block I/O request.
///
/// A bio enters the engine addressed in a thin device's virtual sector
/// space and leaves it, remapped, addressed in the data device's sector
/// space.
pub struct Bio {
    dir: Dir,
    flush: bool,
    fua: bool,
    sector: SectorT,
    sectors: SectorT,
    payload: Payload,
    done: Option<oneshot::Sender<Result>>,
    /// End-I/O interceptor installed by the provisioning pipeline
    pub(crate) hook: Option<EndioHook>,
    /// The thin device this bio was submitted to, while it is being
    /// carried on the pool's queues
    pub(crate) tc: Option<Arc<Thin>>,
}

impl Bio {
    /// A read into `buf`, starting at virtual sector `sector`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not a whole number of sectors.
    pub fn read(sector: SectorT, buf: DivBufMut) -> (Self, BioDone) {
        assert_eq!(buf.len() % (1 << SECTOR_SHIFT), 0);
        let sectors = (buf.len() >> SECTOR_SHIFT) as SectorT;
        let (tx, rx) = oneshot::channel();
        let bio = Bio {
            dir: Dir::Read,
            flush: false,
            fua: false,
            sector,
            sectors,
            payload: Payload::Read(buf),
            done: Some(tx),
            hook: None,
            tc: None,
        };
        (bio, rx)
    }

    /// A write of `buf` starting at virtual sector `sector`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not a whole number of sectors.
    pub fn write(sector: SectorT, buf: DivBuf) -> (Self, BioDone) {
        assert_eq!(buf.len() % (1 << SECTOR_SHIFT), 0);
        let sectors = (buf.len() >> SECTOR_SHIFT) as SectorT;
        let (tx, rx) = oneshot::channel();
        let bio = Bio {
            dir: Dir::Write,
            flush: false,
            fua: false,
            sector,
            sectors,
            payload: Payload::Write(buf),
            done: Some(tx),
            hook: None,
            tc: None,
        };
        (bio, rx)
    }

    /// An empty barrier bio carrying only the flush flag.
    pub fn flush() -> (Self, BioDone) {
        let empty = divbuf::DivBufShared::from(Vec::new());
        let (mut bio, rx) = Bio::write(0, empty.try_const().unwrap());
        bio.flush = true;
        (bio, rx)
    }

    /// Set the FUA flag: the payload must reach stable storage, and all
    /// previously committed mappings must be observable, before this bio
    /// completes.
    pub fn fua(mut self) -> Self {
        self.fua = true;
        self
    }

    pub fn dir(&self) -> Dir {
        self.dir
    }

    /// The current target sector: virtual before remapping, physical
    /// after.
    pub fn sector(&self) -> SectorT {
        self.sector
    }

    pub fn sectors(&self) -> SectorT {
        self.sectors
    }

    pub fn is_flush_or_fua(&self) -> bool {
        self.flush || self.fua
    }

    /// The data to be written.
    ///
    /// # Panics
    ///
    /// Panics on a read bio.
    pub fn payload(&self) -> &[u8] {
        match &self.payload {
            Payload::Write(buf) => &buf[..],
            Payload::Read(_) => panic!("read bios have no write payload"),
        }
    }

    /// The buffer a read should land in.
    ///
    /// # Panics
    ///
    /// Panics on a write bio.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        match &mut self.payload {
            Payload::Read(buf) => &mut buf[..],
            Payload::Write(_) => panic!("write bios have no read buffer"),
        }
    }

    pub(crate) fn set_sector(&mut self, sector: SectorT) {
        self.sector = sector;
    }

    /// Complete the bio.  If an end-I/O hook is installed it observes the
    /// completion first and may withhold the final status until the
    /// associated mapping commits.
    pub fn complete(mut self, result: Result) {
        match self.hook.take() {
            None => self.finish(result),
            Some(hook) => hook.fire(self, result),
        }
    }

    /// Deliver the final status to the issuer, dropping the payload view
    /// so the issuer can take a new one.
    pub(crate) fn finish(mut self, result: Result) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(result);
        }
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("dir", &self.dir)
            .field("flush", &self.flush)
            .field("fua", &self.fua)
            .field("sector", &self.sector)
            .field("sectors", &self.sectors)
            .finish_non_exhaustive()
    }
}
