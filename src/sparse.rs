//! Sparse in-memory disk image for host side testing of filesystem code.

use crate::consts::BLOCK_SIZE;

use alloc::{boxed::Box, collections::BTreeMap};
use core::cell::RefCell;
use diskio::{DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status};

#[cfg(feature = "defmt-log")]
use defmt::trace;
#[cfg(feature = "log")]
use log::trace;

/// [`SparseDisk`] hardware errors.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseDiskError {
    /// Sector beyond the end of the image.
    OutOfRange(Lba),
}

type Result<T> = core::result::Result<T, DiskioError<SparseDiskError>>;

/// Disk image that only stores sectors holding non-zero bytes.
///
/// Unwritten sectors read back as zeroes, and writing an all-zero sector
/// drops whatever was stored for it. `CtrlTrim` takes a half-open sector
/// range and drops it too.
#[derive(Debug, Default)]
pub struct SparseDisk {
    sectors: RefCell<BTreeMap<Lba, Box<[u8; BLOCK_SIZE]>>>,
    sector_count: u64,
}

impl SparseDisk {
    /// Creates an image of `size_bytes` bytes, rounded down to whole sectors.
    pub fn new(size_bytes: u64) -> Self {
        SparseDisk {
            sectors: RefCell::new(BTreeMap::new()),
            sector_count: size_bytes / BLOCK_SIZE as u64,
        }
    }

    /// Number of sectors actually stored.
    pub fn stored_sectors(&self) -> usize {
        self.sectors.borrow().len()
    }

    /// Whether `lba` has a stored entry.
    pub fn is_stored(&self, lba: Lba) -> bool {
        self.sectors.borrow().contains_key(&lba)
    }

    fn check(&self, len: usize, lba: Lba) -> Result<usize> {
        if len == 0 || len % BLOCK_SIZE != 0 {
            return Err(DiskioError::InvalidArgument);
        }
        let count = len / BLOCK_SIZE;
        match lba.checked_add(count as Lba) {
            Some(end) if end <= self.sector_count => Ok(count),
            _ => Err(DiskioError::Hardware(SparseDiskError::OutOfRange(lba))),
        }
    }
}

impl DiskioDevice for SparseDisk {
    type HardwareError = SparseDiskError;

    fn status(&self) -> Status {
        Status::default()
    }

    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<()> {
        self.check(buf.len(), lba)?;
        trace!("sparse read {} sectors at {}", buf.len() / BLOCK_SIZE, lba);

        let sectors = self.sectors.borrow();
        for (i, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
            match sectors.get(&(lba + i as Lba)) {
                Some(sector) => chunk.copy_from_slice(&sector[..]),
                None => chunk.fill(0),
            }
        }

        Ok(())
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<()> {
        self.check(buf.len(), lba)?;
        trace!("sparse write {} sectors at {}", buf.len() / BLOCK_SIZE, lba);

        let mut sectors = self.sectors.borrow_mut();
        for (i, chunk) in buf.chunks(BLOCK_SIZE).enumerate() {
            let lba = lba + i as Lba;
            if chunk.iter().all(|&b| b == 0) {
                sectors.remove(&lba);
            } else {
                let mut sector = Box::new([0u8; BLOCK_SIZE]);
                sector.copy_from_slice(chunk);
                sectors.insert(lba, sector);
            }
        }

        Ok(())
    }

    fn ioctl(&self, cmd: IoctlCmd<'_>) -> Result<()> {
        match cmd {
            IoctlCmd::CtrlSync => {}
            IoctlCmd::GetSectorCount(count) => *count = self.sector_count,
            IoctlCmd::GetSectorSize(size) => *size = BLOCK_SIZE,
            IoctlCmd::GetBlockSize(size) => *size = 1,
            IoctlCmd::CtrlTrim(&(start, end)) => {
                if start > end || end > self.sector_count {
                    return Err(DiskioError::InvalidArgument);
                }
                self.sectors
                    .borrow_mut()
                    .retain(|lba, _| !(start..end).contains(lba));
            }
        }

        Ok(())
    }
}
