//! Open FAT12 files
//!
//! A [`FatFile`] pairs a copy of the directory entry with a walk position
//! (current cluster and intra-cluster byte offset) so sequential I/O never
//! re-walks the chain. Size and first-cluster changes happen on the copy
//! and reach the disk when [`FatFile::flush`] rewrites the entry at its
//! recorded location and syncs the FAT.

use alloc::sync::Arc;

use crate::cache::Cache;
use crate::dir::DirEntryPos;
use crate::entry::DirEntry;
use crate::fat::is_eof;
use crate::fs::FatFs;
use crate::{FsError, SECTOR_SIZE};

pub struct FatFile {
    fs: Arc<FatFs>,
    /// Copy of the on-disk entry; authoritative while the file is open.
    dirent: DirEntry,
    /// Where the entry lives, for flush.
    entry_pos: DirEntryPos,
    /// Current byte position.
    position: u32,
    /// Cluster the position falls in; 0 while the file has no data.
    cluster: u16,
    /// Byte offset of the position within `cluster`.
    cluster_offset: u32,
    /// Size or first cluster changed since the last flush.
    dirty: bool,
}

impl FatFile {
    pub fn new(fs: Arc<FatFs>, dirent: DirEntry, entry_pos: DirEntryPos) -> Self {
        let cluster = dirent.first_cluster();
        Self {
            fs,
            dirent,
            entry_pos,
            position: 0,
            cluster,
            cluster_offset: 0,
            dirty: false,
        }
    }

    pub fn size(&self) -> u32 {
        self.dirent.file_size()
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    /// Move to any byte offset within `[0, size]`. The cluster walk is
    /// re-derived from the chain start.
    pub fn seek(&mut self, position: u32) -> Result<(), FsError> {
        if position > self.size() {
            return Err(FsError::InvalidArgument);
        }

        let cluster_size = self.fs.cluster_size() as u32;
        self.cluster = self.dirent.first_cluster();
        self.position = 0;
        self.cluster_offset = 0;

        while self.cluster >= 2 && self.position + cluster_size <= position {
            let next = self.fs.next_in_chain(self.cluster)?;
            if is_eof(next) {
                break;
            }
            self.cluster = next;
            self.position += cluster_size;
        }

        self.cluster_offset = position - self.position;
        self.position = position;
        Ok(())
    }

    /// Read from the current position; the request is clamped to the bytes
    /// remaining before end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let cluster_size = self.fs.cluster_size() as u32;
        let file_size = self.size();
        if self.position >= file_size || buf.is_empty() {
            return Ok(0);
        }

        let mut remaining = (buf.len() as u32).min(file_size - self.position);
        let mut done = 0usize;

        while remaining > 0 {
            if self.cluster < 2 {
                break;
            }
            if self.cluster_offset >= cluster_size {
                let next = self.fs.next_in_chain(self.cluster)?;
                if is_eof(next) {
                    break;
                }
                self.cluster = next;
                self.cluster_offset = 0;
            }

            let sector = self.fs.first_sector_of_cluster(self.cluster)
                + self.cluster_offset / SECTOR_SIZE as u32;
            let offset = (self.cluster_offset % SECTOR_SIZE as u32) as usize;
            let chunk = (SECTOR_SIZE - offset).min(remaining as usize);

            self.fs
                .sector(sector)?
                .read()
                .read(0, |data: &[u8; SECTOR_SIZE]| {
                    buf[done..done + chunk].copy_from_slice(&data[offset..offset + chunk]);
                });

            done += chunk;
            remaining -= chunk as u32;
            self.position += chunk as u32;
            self.cluster_offset += chunk as u32;
        }

        Ok(done)
    }

    /// Write at the current position, allocating clusters as the chain runs
    /// out. When the volume fills mid-write the count written so far is
    /// returned; clusters already allocated stay with the file.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        let cluster_size = self.fs.cluster_size() as u32;
        let mut remaining = buf.len();
        let mut done = 0usize;

        while remaining > 0 {
            // an empty file gets its first cluster on the first write
            if self.cluster < 2 {
                match self.fs.alloc_cluster() {
                    Ok(cluster) => {
                        self.cluster = cluster;
                        self.cluster_offset = 0;
                        self.dirent.set_first_cluster(cluster);
                        self.dirty = true;
                    }
                    Err(FsError::NoSpace) => break,
                    Err(err) => return Err(err),
                }
            }

            if self.cluster_offset >= cluster_size {
                let mut next = self.fs.next_in_chain(self.cluster)?;
                if is_eof(next) {
                    match self.fs.extend_chain(self.cluster) {
                        Ok(cluster) => next = cluster,
                        Err(FsError::NoSpace) => break,
                        Err(err) => return Err(err),
                    }
                }
                self.cluster = next;
                self.cluster_offset = 0;
            }

            let sector = self.fs.first_sector_of_cluster(self.cluster)
                + self.cluster_offset / SECTOR_SIZE as u32;
            let offset = (self.cluster_offset % SECTOR_SIZE as u32) as usize;
            let chunk = (SECTOR_SIZE - offset).min(remaining);

            self.fs
                .sector(sector)?
                .write()
                .modify(0, |data: &mut [u8; SECTOR_SIZE]| {
                    data[offset..offset + chunk].copy_from_slice(&buf[done..done + chunk]);
                });

            done += chunk;
            remaining -= chunk;
            self.position += chunk as u32;
            self.cluster_offset += chunk as u32;

            if self.position > self.dirent.file_size() {
                self.dirent.set_file_size(self.position);
                self.dirty = true;
            }
        }

        Ok(done)
    }

    /// Position-first read used by the dispatch layer. Reading past the end
    /// is an empty read, not an error.
    pub fn read_at(&mut self, position: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        if position >= self.size() {
            return Ok(0);
        }
        if position != self.position {
            self.seek(position)?;
        }
        self.read(buf)
    }

    /// Position-first write. FAT12 has no sparse files, so a position past
    /// the current end cannot be written.
    pub fn write_at(&mut self, position: u32, buf: &[u8]) -> Result<usize, FsError> {
        if position != self.position {
            self.seek(position)?;
        }
        self.write(buf)
    }

    /// Rewrite the on-disk entry (size, first cluster) and sync the FAT.
    pub fn flush(&mut self) -> Result<(), FsError> {
        if self.dirty {
            let size = self.dirent.file_size();
            let first_cluster = self.dirent.first_cluster();
            self.fs
                .sector(self.entry_pos.sector)?
                .write()
                .modify(self.entry_pos.offset, |slot: &mut DirEntry| {
                    slot.set_file_size(size);
                    slot.set_first_cluster(first_cluster);
                });
            self.dirty = false;
        }
        self.fs.sync_fat()
    }

    /// Drop all content: free the chain, zero the size, flush.
    pub fn truncate(&mut self) -> Result<(), FsError> {
        let first_cluster = self.dirent.first_cluster();
        if first_cluster >= 2 {
            self.fs.free_chain(first_cluster)?;
        }
        self.dirent.set_first_cluster(0);
        self.dirent.set_file_size(0);
        self.position = 0;
        self.cluster = 0;
        self.cluster_offset = 0;
        self.dirty = true;
        self.flush()
    }
}
