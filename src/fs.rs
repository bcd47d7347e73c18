//! FAT12 volume state
//!
//! [`FatFs`] is everything one mounted FAT12 volume owns: the block device,
//! the BPB parsed at mount, the layout derived from it, the in-memory FAT
//! and the sector cache. Directory walking lives in [`crate::dir`], open
//! files in [`crate::file`]; both go through the accessors here.

use alloc::string::String;
use alloc::sync::Arc;
use spin::{Mutex, RwLock};

use crate::bpb::BiosParameterBlock;
use crate::cache::{Cache, SectorBlock, SectorCache};
use crate::device::BlockDevice;
use crate::fat::FatManager;
use crate::{FsError, SECTOR_SIZE};

pub struct FatFs {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) bpb: BiosParameterBlock,

    // Layout, fixed at mount.
    pub(crate) fat_start: u32,
    pub(crate) root_start: u32,
    pub(crate) root_sectors: u32,
    pub(crate) data_start: u32,
    pub(crate) total_sectors: u32,
    pub(crate) total_clusters: u32,

    pub(crate) fat: RwLock<FatManager>,
    pub(crate) cache: Mutex<SectorCache>,
}

impl FatFs {
    /// Mount a FAT12 volume: read the BPB, validate it, derive the layout
    /// and pull the FAT into memory. An invalid BPB fails with `Corrupt`
    /// and leaves nothing mounted.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Arc<Self>, FsError> {
        let mut cache = SectorCache::new(Arc::clone(&device));

        let bpb = cache
            .get(0)?
            .read()
            .read(0, |bpb: &BiosParameterBlock| *bpb);
        if !bpb.is_valid() {
            log::error!("not a FAT12 boot sector, refusing to mount");
            return Err(FsError::Corrupt);
        }

        let fat_start = bpb.fat_start();
        let root_start = bpb.root_start();
        let root_sectors = bpb.root_sectors();
        let data_start = bpb.data_start();
        let total_sectors = bpb.total_sector_count();
        if data_start >= total_sectors {
            log::error!("layout exceeds the device, refusing to mount");
            return Err(FsError::Corrupt);
        }
        let total_clusters = bpb.total_clusters();

        let fat = FatManager::load(
            Arc::clone(&device),
            fat_start,
            bpb.sectors_per_fat(),
            bpb.fat_count(),
            total_clusters,
        )?;

        log::debug!(
            "mounted fat12: {} sectors, {} clusters of {} bytes",
            total_sectors,
            total_clusters,
            bpb.cluster_size()
        );

        Ok(Arc::new(Self {
            device,
            bpb,
            fat_start,
            root_start,
            root_sectors,
            data_start,
            total_sectors,
            total_clusters,
            fat: RwLock::new(fat),
            cache: Mutex::new(cache),
        }))
    }

    pub fn cluster_size(&self) -> usize {
        self.bpb.cluster_size()
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        self.bpb.sectors_per_cluster()
    }

    pub fn total_clusters(&self) -> u32 {
        self.total_clusters
    }

    pub fn total_sector_count(&self) -> u32 {
        self.total_sectors
    }

    pub fn fat_start(&self) -> u32 {
        self.fat_start
    }

    pub fn data_start(&self) -> u32 {
        self.data_start
    }

    #[inline(always)]
    pub fn first_sector_of_cluster(&self, cluster: u16) -> u32 {
        assert!(cluster >= 2);
        self.data_start + (cluster as u32 - 2) * self.sectors_per_cluster()
    }

    /// Fetch a sector through the cache.
    pub(crate) fn sector(&self, sector_id: u32) -> Result<Arc<RwLock<SectorBlock>>, FsError> {
        self.cache.lock().get(sector_id as usize)
    }

    // ---- cluster bookkeeping -------------------------------------------

    pub(crate) fn alloc_cluster(&self) -> Result<u16, FsError> {
        match self.fat.write().alloc_cluster() {
            Some(cluster) => Ok(cluster),
            None => {
                log::warn!("volume full, no free cluster");
                Err(FsError::NoSpace)
            }
        }
    }

    pub(crate) fn extend_chain(&self, tail: u16) -> Result<u16, FsError> {
        self.fat.write().extend_chain(tail).ok_or(FsError::NoSpace)
    }

    pub(crate) fn free_chain(&self, head: u16) -> Result<u32, FsError> {
        self.fat.write().free_chain(head)
    }

    pub(crate) fn free_cluster_entry(&self, cluster: u16) {
        self.fat.write().write_entry(cluster, crate::CLUSTER_FREE);
    }

    pub(crate) fn next_in_chain(&self, cluster: u16) -> Result<u16, FsError> {
        self.fat.read().next_in_chain(cluster)
    }

    /// Zero every sector of a cluster; used when a directory grows one.
    pub(crate) fn clear_cluster(&self, cluster: u16) -> Result<(), FsError> {
        let first = self.first_sector_of_cluster(cluster);
        for i in 0..self.sectors_per_cluster() {
            self.sector(first + i)?
                .write()
                .modify(0, |data: &mut [u8; SECTOR_SIZE]| data.fill(0));
        }
        Ok(())
    }

    /// Flush the FAT to every copy on the device.
    pub fn sync_fat(&self) -> Result<(), FsError> {
        self.fat.write().sync()
    }

    /// Full flush: FAT copies, cached sectors, then the device itself.
    pub fn sync(&self) -> Result<(), FsError> {
        self.sync_fat()?;
        self.cache.lock().sync_all()?;
        self.device.sync()?;
        Ok(())
    }

    // ---- volume info ----------------------------------------------------

    /// Free space in bytes, counted from free FAT entries.
    pub fn free_space(&self) -> u32 {
        self.fat.read().free_clusters() * self.cluster_size() as u32
    }

    /// Capacity of the data region in bytes.
    pub fn total_space(&self) -> u32 {
        self.total_clusters * self.cluster_size() as u32
    }

    /// Volume label: the extended boot record when present, otherwise the
    /// volume-label entry in the root directory, otherwise empty.
    pub fn label(&self) -> Result<String, FsError> {
        if let Some(raw) = self.bpb.volume_label() {
            return Ok(trim_label(&raw));
        }

        let mut iter = crate::dir::DirIter::root(self);
        while let Some((entry, _pos)) = iter.next_entry()? {
            if entry.is_volume_label() {
                return Ok(trim_label(&entry.name_bytes()));
            }
        }
        Ok(String::new())
    }
}

fn trim_label(raw: &[u8; 11]) -> String {
    let end = raw
        .iter()
        .rposition(|&b| b != crate::SPACE)
        .map(|i| i + 1)
        .unwrap_or(0);
    let mut out = String::new();
    for &b in &raw[..end] {
        out.push(b as char);
    }
    out
}

// ---- dispatch-layer adapter ----------------------------------------------

use alloc::boxed::Box;

use crate::dir::{DirCursor, DirIter};
use crate::file::FatFile;
use crate::vfs::{
    DirOps, FileOps, FileSystem, NodeKind, NodePayload, OpenFlags, VfsDirent, VfsNode,
};
use crate::ATTR_ARCHIVE;

/// A mounted FAT12 volume behind the mount-table operation interface.
pub struct Fat12Volume {
    fs: Arc<FatFs>,
}

impl Fat12Volume {
    pub fn new(fs: Arc<FatFs>) -> Self {
        Self { fs }
    }

    pub fn fat_fs(&self) -> &Arc<FatFs> {
        &self.fs
    }
}

impl FileSystem for Fat12Volume {
    fn fs_name(&self) -> &'static str {
        "fat12"
    }

    fn lookup(&self, path: &str) -> Result<VfsNode, FsError> {
        match self.fs.lookup(path)? {
            None => Ok(VfsNode {
                name: String::from("/"),
                kind: NodeKind::Directory,
                size: 0,
                inode: 0,
                payload: NodePayload::Fat12 {
                    cluster: 0,
                    entry: None,
                },
            }),
            Some((entry, pos)) => Ok(VfsNode {
                name: entry.name(),
                kind: if entry.is_dir() {
                    NodeKind::Directory
                } else {
                    NodeKind::File
                },
                size: entry.file_size(),
                inode: entry.first_cluster() as u32,
                payload: NodePayload::Fat12 {
                    cluster: entry.first_cluster(),
                    entry: Some(pos),
                },
            }),
        }
    }

    fn create(&self, path: &str, kind: NodeKind) -> Result<(), FsError> {
        match kind {
            NodeKind::File => self.fs.create(path, ATTR_ARCHIVE),
            NodeKind::Directory => self.fs.mkdir(path),
            _ => Err(FsError::Unsupported),
        }
    }

    fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.fs.unlink(path)
    }

    fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        self.fs.rename(old_path, new_path)
    }

    fn mkdir(&self, path: &str) -> Result<(), FsError> {
        self.fs.mkdir(path)
    }

    fn rmdir(&self, path: &str) -> Result<(), FsError> {
        self.fs.rmdir(path)
    }

    fn open(&self, node: &VfsNode, _flags: OpenFlags) -> Result<Box<dyn FileOps>, FsError> {
        let pos = match node.payload {
            NodePayload::Fat12 {
                entry: Some(pos), ..
            } => pos,
            _ => return Err(FsError::InvalidArgument),
        };
        // the entry is re-read so the handle starts from the disk's truth
        let dirent = self.fs.read_dirent(&pos)?;
        Ok(Box::new(Fat12FileOps {
            file: FatFile::new(Arc::clone(&self.fs), dirent, pos),
        }))
    }

    fn opendir(&self, node: &VfsNode) -> Result<Box<dyn DirOps>, FsError> {
        let cluster = match node.payload {
            NodePayload::Fat12 { cluster, .. } => cluster,
            _ => return Err(FsError::InvalidArgument),
        };
        if node.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let cursor = if cluster < 2 {
            DirIter::root(&self.fs).cursor()
        } else {
            DirIter::subdir(&self.fs, cluster).cursor()
        };
        Ok(Box::new(Fat12DirOps {
            fs: Arc::clone(&self.fs),
            cursor,
            start_cluster: cluster,
        }))
    }

    fn statfs(&self) -> Result<(u32, u32), FsError> {
        Ok((self.fs.total_space(), self.fs.free_space()))
    }

    fn label(&self) -> Result<String, FsError> {
        self.fs.label()
    }

    fn sync(&self) -> Result<(), FsError> {
        self.fs.sync()
    }
}

struct Fat12FileOps {
    file: FatFile,
}

impl FileOps for Fat12FileOps {
    fn read_at(&mut self, pos: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        self.file.read_at(pos, buf)
    }

    fn write_at(&mut self, pos: u32, buf: &[u8]) -> Result<usize, FsError> {
        let written = self.file.write_at(pos, buf)?;
        // size and first cluster must reach the directory entry; the FAT is
        // synced along the way
        self.file.flush()?;
        Ok(written)
    }

    fn truncate(&mut self, size: u32) -> Result<(), FsError> {
        if size != 0 {
            // partial truncation has no user here
            return Err(FsError::Unsupported);
        }
        self.file.truncate()
    }

    fn flush(&mut self) -> Result<(), FsError> {
        self.file.flush()
    }

    fn size(&self) -> u32 {
        self.file.size()
    }
}

struct Fat12DirOps {
    fs: Arc<FatFs>,
    cursor: DirCursor,
    start_cluster: u16,
}

impl DirOps for Fat12DirOps {
    fn next(&mut self) -> Result<Option<VfsDirent>, FsError> {
        let mut iter = DirIter::resume(&self.fs, self.cursor);
        let item = iter.next_entry()?;
        self.cursor = iter.cursor();
        Ok(item.map(|(entry, _pos)| VfsDirent {
            name: entry.name(),
            inode: entry.first_cluster() as u32,
            kind: if entry.is_dir() {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            size: entry.file_size(),
        }))
    }

    fn rewind(&mut self) {
        self.cursor = if self.start_cluster < 2 {
            DirIter::root(&self.fs).cursor()
        } else {
            DirIter::subdir(&self.fs, self.start_cluster).cursor()
        };
    }
}
