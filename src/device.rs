//! Block device interface
//!
//! Every storage backend (ATA, floppy, RAM) is presented as a uniform
//! sector-addressed read/write interface plus a small bundle of geometry
//! metadata. The filesystems above never see anything but LBAs.
//!
//! A short transfer is reported through the returned sector count, never by
//! panicking; the caller decides whether a partial operation is fatal.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::{FsError, SECTOR_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    ReadError,
    WriteError,
    NotPresent,
    Unsupported,
}

impl From<DeviceError> for FsError {
    fn from(_err: DeviceError) -> Self {
        FsError::DeviceError
    }
}

/// What kind of hardware sits behind the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Ata,
    Floppy,
    Ram,
    Cdrom,
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    /// Device name (e.g. "hda", "fd0")
    pub name: String,
    /// Model/description reported by the drive
    pub model: String,
    pub sector_size: u32,
    pub total_sectors: u32,
    /// CHS geometry; zero when the device is purely LBA-addressed.
    pub cylinders: u32,
    pub heads: u16,
    pub sectors_per_track: u16,
    pub present: bool,
    pub removable: bool,
    pub read_only: bool,
}

pub trait BlockDevice: Send + Sync {
    /// Read whole sectors starting at `lba` into `buf`.
    ///
    /// - `buf.len()` must be a multiple of [`SECTOR_SIZE`]
    /// - returns the number of sectors actually read
    fn read_sectors(&self, lba: u32, buf: &mut [u8]) -> Result<u32, DeviceError>;

    /// Write whole sectors starting at `lba` from `buf`.
    ///
    /// Synchronous: on return the data has reached at least the device's own
    /// cache; `sync` forces a deeper flush.
    fn write_sectors(&self, lba: u32, buf: &[u8]) -> Result<u32, DeviceError>;

    /// Flush any device-side cache. Backends whose writes are already
    /// synchronous (PIO) report success without doing anything.
    fn sync(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Eject the media; removable devices only.
    fn eject(&self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported)
    }

    fn info(&self) -> DeviceInfo;
}

/// A RAM-backed block device with a fixed sector count.
///
/// Serves both as a mountable volume living entirely in memory and as the
/// substrate the integration tests format and inspect.
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    total_sectors: u32,
}

impl MemDisk {
    pub fn new(total_sectors: u32) -> Self {
        Self {
            data: Mutex::new(vec![0u8; total_sectors as usize * SECTOR_SIZE]),
            total_sectors,
        }
    }

    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }
}

impl BlockDevice for MemDisk {
    fn read_sectors(&self, lba: u32, buf: &mut [u8]) -> Result<u32, DeviceError> {
        let want = (buf.len() / SECTOR_SIZE) as u32;
        if lba >= self.total_sectors {
            return Ok(0);
        }
        let count = want.min(self.total_sectors - lba);
        let start = lba as usize * SECTOR_SIZE;
        let len = count as usize * SECTOR_SIZE;
        let data = self.data.lock();
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(count)
    }

    fn write_sectors(&self, lba: u32, buf: &[u8]) -> Result<u32, DeviceError> {
        let want = (buf.len() / SECTOR_SIZE) as u32;
        if lba >= self.total_sectors {
            return Ok(0);
        }
        let count = want.min(self.total_sectors - lba);
        let start = lba as usize * SECTOR_SIZE;
        let len = count as usize * SECTOR_SIZE;
        let mut data = self.data.lock();
        data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(count)
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            kind: DeviceKind::Ram,
            name: String::from("rd0"),
            model: String::from("memory-backed disk"),
            sector_size: SECTOR_SIZE as u32,
            total_sectors: self.total_sectors,
            cylinders: 0,
            heads: 0,
            sectors_per_track: 0,
            present: true,
            removable: false,
            read_only: false,
        }
    }
}
