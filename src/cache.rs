//! Write-back sector cache
//!
//! Every mounted FAT12 volume owns one of these. Sector contents are kept in
//! 512-byte blocks behind an LRU map; reads and writes go through typed
//! closures so on-disk structures can be overlaid in place. A block is
//! written back when it is evicted, when the cache is synced, or when it is
//! dropped.

use alloc::{sync::Arc, vec, vec::Vec};
use lru::LruCache;
use spin::RwLock;

use crate::device::BlockDevice;
use crate::{FsError, SECTOR_CACHE_LIMIT, SECTOR_SIZE};

pub trait Cache {
    /// The read-only mapper to the cached sector
    ///
    /// - `offset`: offset in cache
    /// - `f`: a closure to read
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V;
    /// The mutable mapper to the cached sector
    ///
    /// - `offset`: offset in cache
    /// - `f`: a closure to write
    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V;
    /// Write the cached sector back if it was modified
    fn sync(&mut self) -> Result<(), FsError>;
}

pub struct SectorBlock {
    cache: Vec<u8>,
    // the sector id on the device, not within the cluster
    sector_id: usize,
    device: Arc<dyn BlockDevice>,
    modified: bool,
}

impl core::fmt::Debug for SectorBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SectorBlock")
            .field("sector_id", &self.sector_id)
            .field("modified", &self.modified)
            .finish()
    }
}

impl SectorBlock {
    // load a sector from the device
    pub fn new(sector_id: usize, device: Arc<dyn BlockDevice>) -> Result<Self, FsError> {
        let mut cache = vec![0u8; SECTOR_SIZE];
        if device.read_sectors(sector_id as u32, &mut cache)? != 1 {
            return Err(FsError::DeviceError);
        }
        Ok(Self {
            cache,
            sector_id,
            device,
            modified: false,
        })
    }

    fn addr_of_offset(&self, offset: usize) -> usize {
        &self.cache[offset] as *const _ as usize
    }

    fn get_ref<T>(&self, offset: usize) -> &T
    where
        T: Sized,
    {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= SECTOR_SIZE);
        let addr = self.addr_of_offset(offset);
        unsafe { &*(addr as *const T) }
    }

    fn get_mut<T>(&mut self, offset: usize) -> &mut T
    where
        T: Sized,
    {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= SECTOR_SIZE);
        self.modified = true;
        let addr = self.addr_of_offset(offset);
        unsafe { &mut *(addr as *mut T) }
    }
}

impl Cache for SectorBlock {
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    fn sync(&mut self) -> Result<(), FsError> {
        if self.modified {
            if self
                .device
                .write_sectors(self.sector_id as u32, &self.cache)?
                != 1
            {
                return Err(FsError::DeviceError);
            }
            self.modified = false;
        }
        Ok(())
    }
}

impl Drop for SectorBlock {
    fn drop(&mut self) {
        // Last chance to get a modified sector out; a device failure here has
        // no caller left to report to.
        if self.sync().is_err() {
            log::warn!("sector {} lost on drop", self.sector_id);
        }
    }
}

pub struct SectorCache {
    device: Arc<dyn BlockDevice>,
    lru: LruCache<usize, Arc<RwLock<SectorBlock>>>,
}

impl SectorCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            // eviction is handled by hand so a full cache can sync first
            lru: LruCache::unbounded(),
        }
    }

    /// Get a cached sector by id, loading it on a miss.
    pub fn get(&mut self, sector_id: usize) -> Result<Arc<RwLock<SectorBlock>>, FsError> {
        if let Some(pair) = self.lru.get(&sector_id) {
            return Ok(Arc::clone(pair));
        }

        if self.lru.len() == SECTOR_CACHE_LIMIT {
            if let Some((_, lru_block)) = self.lru.pop_lru() {
                lru_block.write().sync()?;
            }
        }

        let block = Arc::new(RwLock::new(SectorBlock::new(
            sector_id,
            Arc::clone(&self.device),
        )?));
        self.lru.put(sector_id, Arc::clone(&block));
        Ok(block)
    }

    /// Write every modified cached sector back to the device.
    pub fn sync_all(&mut self) -> Result<(), FsError> {
        for (_, block) in self.lru.iter() {
            block.write().sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    #[test]
    fn write_back_on_sync() {
        let disk = Arc::new(MemDisk::new(8));
        let mut cache = SectorCache::new(disk.clone());

        let block = cache.get(2).unwrap();
        block.write().modify(0, |bytes: &mut [u8; 4]| {
            bytes.copy_from_slice(&[1, 2, 3, 4]);
        });
        drop(block);

        // Not yet on the device.
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sectors(2, &mut raw).unwrap();
        assert_eq!(&raw[..4], &[0, 0, 0, 0]);

        cache.sync_all().unwrap();
        disk.read_sectors(2, &mut raw).unwrap();
        assert_eq!(&raw[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn read_your_writes_through_cache() {
        let disk = Arc::new(MemDisk::new(8));
        let mut cache = SectorCache::new(disk);

        cache.get(0).unwrap().write().modify(10, |b: &mut u8| *b = 0x42);
        let seen = cache.get(0).unwrap().read().read(10, |b: &u8| *b);
        assert_eq!(seen, 0x42);
    }

    #[test]
    fn eviction_flushes_lru_block() {
        let disk = Arc::new(MemDisk::new((SECTOR_CACHE_LIMIT + 8) as u32));
        let mut cache = SectorCache::new(disk.clone());

        cache.get(0).unwrap().write().modify(0, |b: &mut u8| *b = 0x99);
        // Touch enough other sectors to push sector 0 out.
        for id in 1..=SECTOR_CACHE_LIMIT {
            cache.get(id).unwrap();
        }

        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sectors(0, &mut raw).unwrap();
        assert_eq!(raw[0], 0x99);
    }

    #[test]
    fn out_of_range_sector_is_device_error() {
        let disk = Arc::new(MemDisk::new(4));
        let mut cache = SectorCache::new(disk);
        assert_eq!(cache.get(100).unwrap_err(), FsError::DeviceError);
    }
}
