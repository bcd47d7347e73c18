//! Directory traversal and entry edits
//!
//! The root directory is a fixed run of sectors laid down at format time;
//! it cannot grow. Subdirectories are cluster chains of 32-byte entries.
//! Iteration yields live entries only (deleted and long-name entries are
//! skipped) and stops at the first never-used slot. The free-slot search
//! walks the same ground but also takes deleted entries, and must return a
//! first-byte-0x00 slot immediately, since everything after it is unused
//! as well.
//!
//! Mutating operations accept a single name in the root directory; that is
//! the creation contract of this driver. Lookup descends subdirectories.

use crate::cache::Cache;
use crate::entry::{encode_name, DirEntry};
use crate::fat::is_eof;
use crate::fs::FatFs;
use crate::{is_illegal, FsError, ATTR_ARCHIVE, ATTR_DIRECTORY, DIRENTS_PER_SECTOR, DIRENT_SIZE};

/// Where a directory entry lives on disk; kept with every open file so the
/// entry can be rewritten when size or first cluster change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryPos {
    pub sector: u32,
    pub offset: usize,
}

/// Plain-data iterator state, small enough to park in an open-directory
/// handle and resume from later.
#[derive(Debug, Clone, Copy)]
pub struct DirCursor {
    sector: u32,
    entry: usize,
    cluster: u16,
    is_root: bool,
}

pub struct DirIter<'a> {
    fs: &'a FatFs,
    cursor: DirCursor,
}

impl<'a> DirIter<'a> {
    pub fn root(fs: &'a FatFs) -> Self {
        Self {
            fs,
            cursor: DirCursor {
                sector: fs.root_start,
                entry: 0,
                cluster: 0,
                is_root: true,
            },
        }
    }

    /// Iterate a subdirectory by its first cluster. Cluster 0 names the
    /// root directory (that is what ".." of a first-level directory holds).
    pub fn subdir(fs: &'a FatFs, cluster: u16) -> Self {
        if cluster < 2 {
            return Self::root(fs);
        }
        Self {
            fs,
            cursor: DirCursor {
                sector: fs.first_sector_of_cluster(cluster),
                entry: 0,
                cluster,
                is_root: false,
            },
        }
    }

    /// Resume iteration from a parked cursor.
    pub fn resume(fs: &'a FatFs, cursor: DirCursor) -> Self {
        Self { fs, cursor }
    }

    pub fn cursor(&self) -> DirCursor {
        self.cursor
    }

    /// The next undeleted, non-long-name entry, or `None` at the end of the
    /// directory (first-byte 0x00, root bound, or end of the chain).
    pub fn next_entry(&mut self) -> Result<Option<(DirEntry, DirEntryPos)>, FsError> {
        let fs = self.fs;
        loop {
            if self.cursor.is_root {
                if self.cursor.sector >= fs.root_start + fs.root_sectors {
                    return Ok(None);
                }
            } else {
                let cluster_end = fs.first_sector_of_cluster(self.cursor.cluster)
                    + fs.sectors_per_cluster();
                if self.cursor.sector >= cluster_end {
                    let next = fs.next_in_chain(self.cursor.cluster)?;
                    if is_eof(next) {
                        return Ok(None);
                    }
                    self.cursor.cluster = next;
                    self.cursor.sector = fs.first_sector_of_cluster(next);
                }
            }

            let offset = self.cursor.entry * DIRENT_SIZE;
            let pos = DirEntryPos {
                sector: self.cursor.sector,
                offset,
            };
            let entry = fs
                .sector(self.cursor.sector)?
                .read()
                .read(offset, |entry: &DirEntry| *entry);

            self.cursor.entry += 1;
            if self.cursor.entry >= DIRENTS_PER_SECTOR {
                self.cursor.entry = 0;
                self.cursor.sector += 1;
            }

            if entry.is_end() {
                return Ok(None);
            }
            if entry.is_deleted() || entry.is_long_name() {
                continue;
            }
            return Ok(Some((entry, pos)));
        }
    }

    /// Scan for a matching 8.3 name. Volume-label entries never match a
    /// file name even when the bytes collide.
    pub fn find(&mut self, name: &str) -> Result<Option<(DirEntry, DirEntryPos)>, FsError> {
        let (packed_name, packed_ext) = encode_name(name);
        while let Some((entry, pos)) = self.next_entry()? {
            if entry.is_volume_label() {
                continue;
            }
            if entry.matches(&packed_name, &packed_ext) {
                return Ok(Some((entry, pos)));
            }
        }
        Ok(None)
    }
}

/// Mutation paths take one component in the root directory; anything nested
/// or empty is rejected here before touching the disk.
fn root_component(path: &str) -> Result<&str, FsError> {
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.is_empty() || name.contains('/') || is_illegal(name) {
        return Err(FsError::InvalidArgument);
    }
    Ok(name)
}

impl FatFs {
    pub(crate) fn read_dirent(&self, pos: &DirEntryPos) -> Result<DirEntry, FsError> {
        Ok(self
            .sector(pos.sector)?
            .read()
            .read(pos.offset, |entry: &DirEntry| *entry))
    }

    pub(crate) fn write_dirent(&self, pos: &DirEntryPos, entry: &DirEntry) -> Result<(), FsError> {
        self.sector(pos.sector)?
            .write()
            .modify(pos.offset, |slot: &mut DirEntry| *slot = *entry);
        Ok(())
    }

    fn mark_deleted(&self, pos: &DirEntryPos) -> Result<(), FsError> {
        self.sector(pos.sector)?
            .write()
            .modify(pos.offset, |slot: &mut DirEntry| slot.delete());
        Ok(())
    }

    /// First reusable slot in a directory. Root directories cannot grow;
    /// a subdirectory whose chain is exhausted is likewise reported full,
    /// extending it is not done here.
    pub(crate) fn find_free_entry(&self, dir_cluster: u16) -> Result<DirEntryPos, FsError> {
        if dir_cluster == 0 {
            for sector in self.root_start..self.root_start + self.root_sectors {
                if let Some(pos) = self.scan_sector_for_free(sector)? {
                    return Ok(pos);
                }
            }
            Err(FsError::NoSpace)
        } else {
            let mut cluster = dir_cluster;
            loop {
                let first = self.first_sector_of_cluster(cluster);
                for sector in first..first + self.sectors_per_cluster() {
                    if let Some(pos) = self.scan_sector_for_free(sector)? {
                        return Ok(pos);
                    }
                }
                let next = self.next_in_chain(cluster)?;
                if is_eof(next) {
                    return Err(FsError::NoSpace);
                }
                cluster = next;
            }
        }
    }

    fn scan_sector_for_free(&self, sector: u32) -> Result<Option<DirEntryPos>, FsError> {
        let block = self.sector(sector)?;
        for i in 0..DIRENTS_PER_SECTOR {
            let offset = i * DIRENT_SIZE;
            let free = block.read().read(offset, |entry: &DirEntry| entry.is_free());
            if free {
                return Ok(Some(DirEntryPos { sector, offset }));
            }
        }
        Ok(None)
    }

    /// Resolve a slash-separated path from the root directory down.
    ///
    /// `Ok(None)` is the root directory itself. A missing component fails
    /// `NotFound`; descending through a file fails `NotADirectory`.
    pub fn lookup(&self, path: &str) -> Result<Option<(DirEntry, DirEntryPos)>, FsError> {
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        if components.peek().is_none() {
            return Ok(None);
        }

        let mut iter = DirIter::root(self);
        loop {
            // components is non-empty here by construction
            let component = match components.next() {
                Some(c) => c,
                None => return Err(FsError::NotFound),
            };
            match iter.find(component)? {
                None => return Err(FsError::NotFound),
                Some((entry, pos)) => {
                    if components.peek().is_none() {
                        return Ok(Some((entry, pos)));
                    }
                    if !entry.is_dir() {
                        return Err(FsError::NotADirectory);
                    }
                    iter = DirIter::subdir(self, entry.first_cluster());
                }
            }
        }
    }

    /// Create an empty file in the root directory.
    pub fn create(&self, path: &str, attr: u8) -> Result<(), FsError> {
        let name = root_component(path)?;
        if DirIter::root(self).find(name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let pos = self.find_free_entry(0)?;
        let attr = if attr == 0 { ATTR_ARCHIVE } else { attr };
        let entry = DirEntry::new(name, attr);
        self.write_dirent(&pos, &entry)?;
        self.sync_fat()?;
        Ok(())
    }

    /// Create a subdirectory in the root directory: one cluster is
    /// allocated up front, zeroed, and seeded with the "." and ".."
    /// entries before the FAT is flushed.
    pub fn mkdir(&self, path: &str) -> Result<(), FsError> {
        let name = root_component(path)?;
        if DirIter::root(self).find(name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let cluster = self.alloc_cluster()?;

        let pos = match self.find_free_entry(0) {
            Ok(pos) => pos,
            Err(err) => {
                self.free_cluster_entry(cluster);
                return Err(err);
            }
        };

        let mut entry = DirEntry::new(name, ATTR_DIRECTORY);
        entry.set_first_cluster(cluster);
        if let Err(err) = self.write_dirent(&pos, &entry) {
            self.free_cluster_entry(cluster);
            return Err(err);
        }

        self.clear_cluster(cluster)?;
        let first = self.first_sector_of_cluster(cluster);
        let block = self.sector(first)?;
        block
            .write()
            .modify(0, |slot: &mut DirEntry| *slot = DirEntry::dot(cluster));
        block.write().modify(DIRENT_SIZE, |slot: &mut DirEntry| {
            // parent is the root directory
            *slot = DirEntry::dotdot(0)
        });

        self.sync_fat()?;
        Ok(())
    }

    /// Delete a file: free its chain, then mark the entry deleted.
    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        let name = root_component(path)?;
        match DirIter::root(self).find(name)? {
            None => Err(FsError::NotFound),
            Some((entry, pos)) => {
                if entry.is_dir() {
                    return Err(FsError::InvalidArgument);
                }
                if entry.first_cluster() >= 2 {
                    self.free_chain(entry.first_cluster())?;
                }
                self.mark_deleted(&pos)?;
                self.sync_fat()?;
                Ok(())
            }
        }
    }

    /// Delete a subdirectory; it must hold nothing but "." and "..".
    pub fn rmdir(&self, path: &str) -> Result<(), FsError> {
        let name = root_component(path)?;
        match DirIter::root(self).find(name)? {
            None => Err(FsError::NotFound),
            Some((entry, pos)) => {
                if !entry.is_dir() {
                    return Err(FsError::NotADirectory);
                }

                let mut sub = DirIter::subdir(self, entry.first_cluster());
                while let Some((child, _)) = sub.next_entry()? {
                    if child.is_dot_entry() {
                        continue;
                    }
                    return Err(FsError::NotEmpty);
                }

                self.free_chain(entry.first_cluster())?;
                self.mark_deleted(&pos)?;
                self.sync_fat()?;
                Ok(())
            }
        }
    }

    /// Rename within the root directory: only the name and extension bytes
    /// of the entry are rewritten, everything else stays in place.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        let old_name = root_component(old_path)?;
        let new_name = root_component(new_path)?;

        if DirIter::root(self).find(new_name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        match DirIter::root(self).find(old_name)? {
            None => Err(FsError::NotFound),
            Some((_, pos)) => {
                let (packed_name, packed_ext) = encode_name(new_name);
                self.sector(pos.sector)?
                    .write()
                    .modify(pos.offset, |slot: &mut DirEntry| {
                        slot.set_name(packed_name, packed_ext)
                    });
                self.sync_fat()?;
                Ok(())
            }
        }
    }
}
