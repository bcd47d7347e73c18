//! In-memory file store
//!
//! A flat table of up to `max_files` named files over one bump-allocated
//! arena. Spans are handed out in 4 KiB steps and never reclaimed; a file
//! that outgrows its span is copied to a fresh one and the old bytes are
//! left behind as fragmentation (reported in the statistics, compaction is
//! not attempted). Files persist until reboot, nothing here touches a
//! block device.
//!
//! Names are case-insensitive, at most 31 characters, with no directory
//! hierarchy. Timestamps are whatever the caller makes of the tick
//! counter; without a timer driving it they stay 0.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::RwLock;

use crate::vfs::{DirOps, FileOps, FileSystem, NodeKind, NodePayload, OpenFlags, VfsDirent, VfsNode};
use crate::FsError;

pub const RAMDISK_MAX_FILES: usize = 128;
pub const RAMDISK_MAX_NAME: usize = 31;
pub const RAMDISK_DEFAULT_SIZE: usize = 1024 * 1024;
/// Spans are allocated in these steps.
pub const RAMDISK_SPAN: u32 = 4096;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RamFlags: u32 {
        const USED       = 0x01;
        const DIRECTORY  = 0x02;
        const READONLY   = 0x04;
        const HIDDEN     = 0x08;
        const SYSTEM     = 0x10;
        const EXECUTABLE = 0x20;
        const BINARY     = 0x40;
    }
}

/// One slot of the file table.
#[derive(Debug, Clone)]
pub struct RamFile {
    pub name: String,
    pub size: u32,
    /// Offset of the file's span in the arena.
    pub offset: u32,
    /// Span length; at least `size`, usually more.
    pub allocated: u32,
    pub flags: RamFlags,
    pub created: u32,
    pub modified: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RamStats {
    pub total_size: u32,
    pub used_size: u32,
    pub free_size: u32,
    pub file_count: u32,
    pub max_files: u32,
    pub total_reads: u32,
    pub total_writes: u32,
    pub total_created: u32,
    pub total_deleted: u32,
    pub bytes_read: u32,
    pub bytes_written: u32,
    /// Arena bytes no live file accounts for.
    pub fragmented_bytes: u32,
}

struct RamInner {
    files: Vec<Option<RamFile>>,
    file_count: u32,
    data: Vec<u8>,
    data_used: u32,
    /// Next free arena offset; only ever moves forward.
    data_ptr: u32,
    total_reads: u32,
    total_writes: u32,
    total_created: u32,
    total_deleted: u32,
    bytes_read: u32,
    bytes_written: u32,
    ticks: u32,
}

pub struct RamDisk {
    inner: RwLock<RamInner>,
    max_files: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

impl RamDisk {
    pub fn new(max_files: usize, arena_size: usize) -> Self {
        let mut files = Vec::new();
        files.resize_with(max_files, || None);
        Self {
            inner: RwLock::new(RamInner {
                files,
                file_count: 0,
                data: vec![0u8; arena_size],
                data_used: 0,
                data_ptr: 0,
                total_reads: 0,
                total_writes: 0,
                total_created: 0,
                total_deleted: 0,
                bytes_read: 0,
                bytes_written: 0,
                ticks: 0,
            }),
            max_files,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RAMDISK_MAX_FILES, RAMDISK_DEFAULT_SIZE)
    }

    /// Advance the timestamp counter; wired to a timer tick by the caller.
    pub fn tick(&self) {
        self.inner.write().ticks += 1;
    }

    fn find(&self, name: &str) -> Option<usize> {
        let inner = self.inner.read();
        inner.files.iter().position(|slot| {
            slot.as_ref()
                .map(|f| f.name.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn count_files(&self) -> u32 {
        self.inner.read().file_count
    }

    pub fn create(&self, name: &str, flags: RamFlags) -> Result<(), FsError> {
        if name.is_empty() || name.len() > RAMDISK_MAX_NAME {
            return Err(FsError::InvalidArgument);
        }
        if self.exists(name) {
            return Err(FsError::AlreadyExists);
        }

        let mut inner = self.inner.write();
        let ticks = inner.ticks;
        let slot = inner
            .files
            .iter()
            .position(|s| s.is_none())
            .ok_or(FsError::NoSlots)?;
        inner.files[slot] = Some(RamFile {
            name: String::from(name),
            size: 0,
            offset: 0,
            allocated: 0,
            flags: RamFlags::USED | flags,
            created: ticks,
            modified: ticks,
        });
        inner.file_count += 1;
        inner.total_created += 1;
        Ok(())
    }

    /// Drop a file from the table. Its arena span is not reclaimed.
    pub fn delete(&self, name: &str) -> Result<(), FsError> {
        let slot = self.find(name).ok_or(FsError::NotFound)?;
        let mut inner = self.inner.write();
        if let Some(f) = &inner.files[slot] {
            if f.flags.contains(RamFlags::READONLY) {
                return Err(FsError::ReadOnly);
            }
        }
        inner.files[slot] = None;
        inner.file_count -= 1;
        inner.total_deleted += 1;
        Ok(())
    }

    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<(), FsError> {
        if new_name.is_empty() || new_name.len() > RAMDISK_MAX_NAME {
            return Err(FsError::InvalidArgument);
        }
        if self.exists(new_name) {
            return Err(FsError::AlreadyExists);
        }
        let slot = self.find(old_name).ok_or(FsError::NotFound)?;
        let mut inner = self.inner.write();
        let ticks = inner.ticks;
        if let Some(f) = inner.files[slot].as_mut() {
            f.name = String::from(new_name);
            f.modified = ticks;
        }
        Ok(())
    }

    pub fn stat(&self, name: &str) -> Result<RamFile, FsError> {
        let slot = self.find(name).ok_or(FsError::NotFound)?;
        let inner = self.inner.read();
        inner.files[slot].clone().ok_or(FsError::NotFound)
    }

    pub fn set_flags(&self, name: &str, flags: RamFlags) -> Result<(), FsError> {
        let slot = self.find(name).ok_or(FsError::NotFound)?;
        let mut inner = self.inner.write();
        if let Some(f) = inner.files[slot].as_mut() {
            f.flags = RamFlags::USED | (flags - RamFlags::USED);
        }
        Ok(())
    }

    pub fn clear_flags(&self, name: &str, flags: RamFlags) -> Result<(), FsError> {
        let slot = self.find(name).ok_or(FsError::NotFound)?;
        let mut inner = self.inner.write();
        if let Some(f) = inner.files[slot].as_mut() {
            f.flags -= flags;
            f.flags |= RamFlags::USED;
        }
        Ok(())
    }

    pub fn is_executable(&self, name: &str) -> bool {
        match self.stat(name) {
            Ok(f) => {
                f.flags.contains(RamFlags::EXECUTABLE)
                    || ["exe", "elf", "com", "bin"]
                        .iter()
                        .any(|ext| has_ext(name, ext))
            }
            Err(_) => false,
        }
    }

    pub fn stats(&self) -> RamStats {
        let inner = self.inner.read();
        let live: u32 = inner
            .files
            .iter()
            .flatten()
            .map(|f| f.size)
            .sum();
        RamStats {
            total_size: inner.data.len() as u32,
            used_size: inner.data_used,
            free_size: inner.data.len() as u32 - inner.data_used,
            file_count: inner.file_count,
            max_files: self.max_files as u32,
            total_reads: inner.total_reads,
            total_writes: inner.total_writes,
            total_created: inner.total_created,
            total_deleted: inner.total_deleted,
            bytes_read: inner.bytes_read,
            bytes_written: inner.bytes_written,
            fragmented_bytes: inner.data_used - live,
        }
    }

    // ---- handle plumbing -------------------------------------------------

    /// Open a file. A write-mode open of a missing file creates it; a
    /// read-only file rejects write-mode opens.
    pub fn open(disk: &Arc<Self>, name: &str, mode: OpenMode) -> Result<RamHandle, FsError> {
        let write_mode = mode != OpenMode::Read;

        let slot = match disk.find(name) {
            Some(slot) => slot,
            None if write_mode => {
                disk.create(name, RamFlags::empty())?;
                disk.find(name).ok_or(FsError::NotFound)?
            }
            None => return Err(FsError::NotFound),
        };

        let file = disk.inner.read().files[slot]
            .clone()
            .ok_or(FsError::NotFound)?;
        if write_mode && file.flags.contains(RamFlags::READONLY) {
            return Err(FsError::ReadOnly);
        }

        Ok(RamHandle {
            disk: Arc::clone(disk),
            slot,
            position: if mode == OpenMode::Append { file.size } else { 0 },
            write_mode,
            append_mode: mode == OpenMode::Append,
        })
    }

    pub(crate) fn slot_size(&self, slot: usize) -> u32 {
        self.inner
            .read()
            .files
            .get(slot)
            .and_then(|s| s.as_ref())
            .map(|f| f.size)
            .unwrap_or(0)
    }

    pub(crate) fn read_slot_at(&self, slot: usize, pos: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut inner = self.inner.write();
        let inner = &mut *inner;
        let f = inner.files[slot].as_ref().ok_or(FsError::NotFound)?;
        if pos >= f.size || buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u32).min(f.size - pos) as usize;
        let start = (f.offset + pos) as usize;
        buf[..len].copy_from_slice(&inner.data[start..start + len]);
        inner.total_reads += 1;
        inner.bytes_read += len as u32;
        Ok(len)
    }

    pub(crate) fn write_slot_at(&self, slot: usize, pos: u32, buf: &[u8]) -> Result<usize, FsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.write();
        let inner = &mut *inner;
        let ticks = inner.ticks;
        let f = inner.files[slot].as_mut().ok_or(FsError::NotFound)?;

        let new_end = pos + buf.len() as u32;
        if f.allocated == 0 || new_end > f.allocated {
            // Grow into a fresh span, dragging the old content along. The
            // old span stays where it is.
            let needed = new_end.div_ceil(RAMDISK_SPAN) * RAMDISK_SPAN;
            if inner.data_ptr + needed > inner.data.len() as u32 {
                return Err(FsError::NoSpace);
            }
            if f.size > 0 && f.allocated > 0 {
                let src = f.offset as usize;
                let len = f.size as usize;
                let dst = inner.data_ptr as usize;
                inner.data.copy_within(src..src + len, dst);
            }
            f.offset = inner.data_ptr;
            f.allocated = needed;
            inner.data_ptr += needed;
            inner.data_used += needed;
        }

        let start = (f.offset + pos) as usize;
        inner.data[start..start + buf.len()].copy_from_slice(buf);
        if new_end > f.size {
            f.size = new_end;
        }
        f.modified = ticks;
        inner.total_writes += 1;
        inner.bytes_written += buf.len() as u32;
        Ok(buf.len())
    }

    pub(crate) fn truncate_slot(&self, slot: usize, size: u32) -> Result<(), FsError> {
        let mut inner = self.inner.write();
        let ticks = inner.ticks;
        let f = inner.files[slot].as_mut().ok_or(FsError::NotFound)?;
        if size > f.size {
            return Err(FsError::InvalidArgument);
        }
        f.size = size;
        f.modified = ticks;
        Ok(())
    }

    // ---- whole-file convenience ------------------------------------------

    /// Read a whole file into `buf`; returns the bytes copied.
    pub fn read_file(&self, name: &str, buf: &mut [u8]) -> Result<usize, FsError> {
        let slot = self.find(name).ok_or(FsError::NotFound)?;
        self.read_slot_at(slot, 0, buf)
    }

    /// Create-or-overwrite a file with `data`.
    pub fn write_file(&self, name: &str, data: &[u8]) -> Result<usize, FsError> {
        match self.delete(name) {
            Ok(()) | Err(FsError::NotFound) => {}
            Err(err) => return Err(err),
        }
        self.create(name, RamFlags::empty())?;
        let slot = self.find(name).ok_or(FsError::NotFound)?;
        if data.is_empty() {
            return Ok(0);
        }
        self.write_slot_at(slot, 0, data)
    }

    /// Append `data`, creating the file if needed.
    pub fn append_file(&self, name: &str, data: &[u8]) -> Result<usize, FsError> {
        if !self.exists(name) {
            self.create(name, RamFlags::empty())?;
        }
        let slot = self.find(name).ok_or(FsError::NotFound)?;
        let size = self.slot_size(slot);
        if data.is_empty() {
            return Ok(0);
        }
        self.write_slot_at(slot, size, data)
    }

    /// Copy a file within the disk, 512 bytes at a time, carrying the
    /// source flags over.
    pub fn copy(disk: &Arc<Self>, src_name: &str, dst_name: &str) -> Result<(), FsError> {
        let src_stat = disk.stat(src_name)?;
        if disk.exists(dst_name) {
            return Err(FsError::AlreadyExists);
        }

        let mut src = RamDisk::open(disk, src_name, OpenMode::Read)?;
        let mut dst = RamDisk::open(disk, dst_name, OpenMode::Write)?;

        let mut chunk = [0u8; 512];
        loop {
            let read = src.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            if dst.write(&chunk[..read])? != read {
                return Err(FsError::NoSpace);
            }
        }

        disk.set_flags(dst_name, src_stat.flags - RamFlags::USED)?;
        Ok(())
    }

    /// Iterate the file table; hidden files are skipped unless asked for.
    pub fn readdir(disk: &Arc<Self>, show_hidden: bool) -> RamDirIter {
        RamDirIter {
            disk: Arc::clone(disk),
            index: 0,
            show_hidden,
        }
    }
}

/// Extension of a file name, empty when there is none.
pub fn file_ext(name: &str) -> &str {
    name.rfind('.').map(|i| &name[i + 1..]).unwrap_or("")
}

pub fn has_ext(name: &str, ext: &str) -> bool {
    file_ext(name).eq_ignore_ascii_case(ext)
}

/// A position-carrying handle over one slot.
pub struct RamHandle {
    disk: Arc<RamDisk>,
    slot: usize,
    position: u32,
    write_mode: bool,
    append_mode: bool,
}

impl RamHandle {
    pub fn size(&self) -> u32 {
        self.disk.slot_size(self.slot)
    }

    pub fn tell(&self) -> u32 {
        self.position
    }

    pub fn eof(&self) -> bool {
        self.position >= self.size()
    }

    pub fn is_append(&self) -> bool {
        self.append_mode
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let n = self.disk.read_slot_at(self.slot, self.position, buf)?;
        self.position += n as u32;
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        if !self.write_mode {
            return Err(FsError::ReadOnly);
        }
        let n = self.disk.write_slot_at(self.slot, self.position, buf)?;
        self.position += n as u32;
        Ok(n)
    }

    pub fn getc(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }

    pub fn putc(&mut self, c: u8) -> Result<(), FsError> {
        self.write(&[c]).map(|_| ())
    }

    pub fn puts(&mut self, s: &str) -> Result<usize, FsError> {
        self.write(s.as_bytes())
    }

    pub fn putline(&mut self, s: &str) -> Result<usize, FsError> {
        let written = self.puts(s)?;
        Ok(written + self.write(b"\n")?)
    }

    /// Next line without its terminator; carriage returns are dropped.
    /// `None` at end of file.
    pub fn getline(&mut self) -> Option<String> {
        if self.eof() {
            return None;
        }
        let mut line = String::new();
        while let Some(c) = self.getc() {
            match c {
                b'\n' => break,
                b'\r' => continue,
                c => line.push(c as char),
            }
        }
        Some(line)
    }

    /// In read mode the position may not pass the end of the file; in
    /// write mode it may (the gap is filled on the next write).
    pub fn seek(&mut self, position: u32) -> Result<(), FsError> {
        if !self.write_mode && position > self.size() {
            return Err(FsError::InvalidArgument);
        }
        self.position = position;
        Ok(())
    }

    pub fn seek_rel(&mut self, offset: i32) -> Result<(), FsError> {
        let target = (self.position as i64 + offset as i64).max(0) as u32;
        self.seek(target)
    }

    pub fn seek_end(&mut self) {
        self.position = self.size();
    }

    /// Cut the file off at the current position.
    pub fn truncate(&mut self) -> Result<(), FsError> {
        if !self.write_mode {
            return Err(FsError::ReadOnly);
        }
        self.disk.truncate_slot(self.slot, self.position.min(self.size()))
    }
}

pub struct RamDirIter {
    disk: Arc<RamDisk>,
    index: usize,
    show_hidden: bool,
}

impl Iterator for RamDirIter {
    type Item = RamFile;

    fn next(&mut self) -> Option<RamFile> {
        let inner = self.disk.inner.read();
        while self.index < inner.files.len() {
            let slot = self.index;
            self.index += 1;
            if let Some(f) = &inner.files[slot] {
                if !self.show_hidden && f.flags.contains(RamFlags::HIDDEN) {
                    continue;
                }
                return Some(f.clone());
            }
        }
        None
    }
}

// ---- dispatch-layer adapter ----------------------------------------------

/// The RAM disk behind the mount-table operation interface.
pub struct RamVolume {
    disk: Arc<RamDisk>,
}

impl RamVolume {
    pub fn new(disk: Arc<RamDisk>) -> Self {
        Self { disk }
    }

    pub fn disk(&self) -> &Arc<RamDisk> {
        &self.disk
    }
}

fn single_name(path: &str) -> Result<&str, FsError> {
    let name = path.trim_start_matches('/');
    if name.contains('/') {
        // there are no directories to descend through
        return Err(FsError::NotADirectory);
    }
    Ok(name)
}

impl FileSystem for RamVolume {
    fn fs_name(&self) -> &'static str {
        "ramdisk"
    }

    fn lookup(&self, path: &str) -> Result<VfsNode, FsError> {
        let name = single_name(path)?;
        if name.is_empty() {
            return Ok(VfsNode {
                name: String::from("/"),
                kind: NodeKind::Directory,
                size: 0,
                inode: 0,
                payload: NodePayload::None,
            });
        }
        let slot = self.disk.find(name).ok_or(FsError::NotFound)?;
        let file = self.disk.inner.read().files[slot]
            .clone()
            .ok_or(FsError::NotFound)?;
        Ok(VfsNode {
            name: file.name,
            kind: NodeKind::File,
            size: file.size,
            inode: slot as u32,
            payload: NodePayload::Ram { slot },
        })
    }

    fn create(&self, path: &str, kind: NodeKind) -> Result<(), FsError> {
        if kind != NodeKind::File {
            return Err(FsError::Unsupported);
        }
        self.disk.create(single_name(path)?, RamFlags::empty())
    }

    fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.disk.delete(single_name(path)?)
    }

    fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        self.disk.rename(single_name(old_path)?, single_name(new_path)?)
    }

    fn open(&self, node: &VfsNode, flags: OpenFlags) -> Result<Box<dyn FileOps>, FsError> {
        let slot = match node.payload {
            NodePayload::Ram { slot } => slot,
            _ => return Err(FsError::InvalidArgument),
        };
        let writable = flags.writable();
        if writable {
            let inner = self.disk.inner.read();
            let f = inner.files[slot].as_ref().ok_or(FsError::NotFound)?;
            if f.flags.contains(RamFlags::READONLY) {
                return Err(FsError::ReadOnly);
            }
        }
        Ok(Box::new(RamFileOps {
            disk: Arc::clone(&self.disk),
            slot,
        }))
    }

    fn opendir(&self, node: &VfsNode) -> Result<Box<dyn DirOps>, FsError> {
        if node.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok(Box::new(RamDirOps {
            disk: Arc::clone(&self.disk),
            index: 0,
        }))
    }

    fn statfs(&self) -> Result<(u32, u32), FsError> {
        let stats = self.disk.stats();
        Ok((stats.total_size, stats.free_size))
    }
}

struct RamFileOps {
    disk: Arc<RamDisk>,
    slot: usize,
}

impl FileOps for RamFileOps {
    fn read_at(&mut self, pos: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        self.disk.read_slot_at(self.slot, pos, buf)
    }

    fn write_at(&mut self, pos: u32, buf: &[u8]) -> Result<usize, FsError> {
        self.disk.write_slot_at(self.slot, pos, buf)
    }

    fn truncate(&mut self, size: u32) -> Result<(), FsError> {
        self.disk.truncate_slot(self.slot, size)
    }

    fn size(&self) -> u32 {
        self.disk.slot_size(self.slot)
    }
}

struct RamDirOps {
    disk: Arc<RamDisk>,
    index: usize,
}

impl DirOps for RamDirOps {
    fn next(&mut self) -> Result<Option<VfsDirent>, FsError> {
        let inner = self.disk.inner.read();
        while self.index < inner.files.len() {
            let slot = self.index;
            self.index += 1;
            if let Some(f) = &inner.files[slot] {
                return Ok(Some(VfsDirent {
                    name: f.name.clone(),
                    inode: slot as u32,
                    kind: NodeKind::File,
                    size: f.size,
                }));
            }
        }
        Ok(None)
    }

    fn rewind(&mut self) {
        self.index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_find_delete() {
        let disk = RamDisk::with_defaults();
        disk.create("notes.txt", RamFlags::empty()).unwrap();
        assert!(disk.exists("NOTES.TXT")); // case-insensitive
        assert_eq!(disk.count_files(), 1);
        assert_eq!(
            disk.create("notes.txt", RamFlags::empty()),
            Err(FsError::AlreadyExists)
        );

        disk.delete("notes.txt").unwrap();
        assert!(!disk.exists("notes.txt"));
        assert_eq!(disk.delete("notes.txt"), Err(FsError::NotFound));
    }

    #[test]
    fn name_validation() {
        let disk = RamDisk::with_defaults();
        assert_eq!(disk.create("", RamFlags::empty()), Err(FsError::InvalidArgument));
        let long = "x".repeat(RAMDISK_MAX_NAME + 1);
        assert_eq!(disk.create(&long, RamFlags::empty()), Err(FsError::InvalidArgument));
    }

    #[test]
    fn write_then_read_back() {
        let disk = Arc::new(RamDisk::with_defaults());
        let mut f = RamDisk::open(&disk, "data.bin", OpenMode::Write).unwrap();
        assert_eq!(f.write(b"hello ramdisk").unwrap(), 13);

        let mut f = RamDisk::open(&disk, "data.bin", OpenMode::Read).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(f.read(&mut buf).unwrap(), 13);
        assert_eq!(&buf[..13], b"hello ramdisk");
        assert!(f.eof());
    }

    #[test]
    fn write_open_creates_read_open_does_not() {
        let disk = Arc::new(RamDisk::with_defaults());
        assert_eq!(
            RamDisk::open(&disk, "nope", OpenMode::Read).err(),
            Some(FsError::NotFound)
        );
        RamDisk::open(&disk, "auto", OpenMode::Write).unwrap();
        assert!(disk.exists("auto"));
    }

    #[test]
    fn append_positions_at_end() {
        let disk = Arc::new(RamDisk::with_defaults());
        disk.write_file("log", b"one\n").unwrap();

        let mut f = RamDisk::open(&disk, "log", OpenMode::Append).unwrap();
        assert_eq!(f.tell(), 4);
        assert!(f.is_append());
        f.puts("two\n").unwrap();

        let mut buf = [0u8; 16];
        let n = disk.read_file("log", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"one\ntwo\n");
    }

    #[test]
    fn line_io() {
        let disk = Arc::new(RamDisk::with_defaults());
        let mut f = RamDisk::open(&disk, "lines", OpenMode::Write).unwrap();
        f.putline("first").unwrap();
        f.puts("sec").unwrap();
        f.putc(b'o').unwrap();
        f.putline("nd").unwrap();
        f.puts("tail").unwrap();

        let mut f = RamDisk::open(&disk, "lines", OpenMode::Read).unwrap();
        assert_eq!(f.getline().unwrap(), "first");
        assert_eq!(f.getline().unwrap(), "second");
        assert_eq!(f.getline().unwrap(), "tail");
        assert!(f.getline().is_none());
    }

    #[test]
    fn seek_tell_truncate() {
        let disk = Arc::new(RamDisk::with_defaults());
        let mut f = RamDisk::open(&disk, "s", OpenMode::Write).unwrap();
        f.write(b"0123456789").unwrap();

        f.seek(4).unwrap();
        assert_eq!(f.tell(), 4);
        f.truncate().unwrap();
        assert_eq!(f.size(), 4);

        let mut r = RamDisk::open(&disk, "s", OpenMode::Read).unwrap();
        assert_eq!(r.seek(100), Err(FsError::InvalidArgument));
        r.seek_end();
        assert_eq!(r.tell(), 4);
        r.seek_rel(-2).unwrap();
        assert_eq!(r.tell(), 2);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"23");
    }

    #[test]
    fn readonly_flag_blocks_writes_and_delete() {
        let disk = Arc::new(RamDisk::with_defaults());
        disk.write_file("locked", b"keep").unwrap();
        disk.set_flags("locked", RamFlags::READONLY).unwrap();

        assert_eq!(
            RamDisk::open(&disk, "locked", OpenMode::Write).err(),
            Some(FsError::ReadOnly)
        );
        assert_eq!(disk.delete("locked"), Err(FsError::ReadOnly));

        disk.clear_flags("locked", RamFlags::READONLY).unwrap();
        disk.delete("locked").unwrap();
    }

    #[test]
    fn slot_table_exhaustion() {
        let disk = RamDisk::new(3, 64 * 1024);
        disk.create("a", RamFlags::empty()).unwrap();
        disk.create("b", RamFlags::empty()).unwrap();
        disk.create("c", RamFlags::empty()).unwrap();
        assert_eq!(disk.create("d", RamFlags::empty()), Err(FsError::NoSlots));

        disk.delete("b").unwrap();
        disk.create("d", RamFlags::empty()).unwrap();
    }

    #[test]
    fn arena_exhaustion() {
        let disk = Arc::new(RamDisk::new(8, 8192));
        let mut f = RamDisk::open(&disk, "big", OpenMode::Write).unwrap();
        assert_eq!(f.write(&[0xAA; 5000]).unwrap(), 5000); // takes a 8192-byte span

        let mut g = RamDisk::open(&disk, "more", OpenMode::Write).unwrap();
        assert_eq!(g.write(b"x"), Err(FsError::NoSpace));
    }

    #[test]
    fn grow_copies_content_and_fragments_arena() {
        let disk = Arc::new(RamDisk::new(8, 64 * 1024));
        let mut f = RamDisk::open(&disk, "grow", OpenMode::Write).unwrap();
        f.write(&[1u8; 4096]).unwrap();
        // crossing the span boundary forces a copy to a new span
        f.write(&[2u8; 100]).unwrap();

        let mut buf = vec![0u8; 4196];
        assert_eq!(disk.read_file("grow", &mut buf).unwrap(), 4196);
        assert!(buf[..4096].iter().all(|&b| b == 1));
        assert!(buf[4096..].iter().all(|&b| b == 2));

        // the first 4 KiB span is now dead weight
        assert_eq!(disk.stats().fragmented_bytes, 4096 + 8192 - 4196);
    }

    #[test]
    fn fragmentation_counts_deleted_spans() {
        let disk = RamDisk::with_defaults();
        disk.write_file("gone", &[9u8; 100]).unwrap();
        assert_eq!(disk.stats().fragmented_bytes, 4096 - 100);
        disk.delete("gone").unwrap();
        assert_eq!(disk.stats().fragmented_bytes, 4096);
    }

    #[test]
    fn copy_carries_flags() {
        let disk = Arc::new(RamDisk::with_defaults());
        disk.write_file("src.bin", &[7u8; 1000]).unwrap();
        disk.set_flags("src.bin", RamFlags::EXECUTABLE).unwrap();

        RamDisk::copy(&disk, "src.bin", "dst.bin").unwrap();
        let dst = disk.stat("dst.bin").unwrap();
        assert_eq!(dst.size, 1000);
        assert!(dst.flags.contains(RamFlags::EXECUTABLE));
        assert_eq!(
            RamDisk::copy(&disk, "src.bin", "dst.bin"),
            Err(FsError::AlreadyExists)
        );

        let mut a = vec![0u8; 1000];
        let mut b = vec![0u8; 1000];
        disk.read_file("src.bin", &mut a).unwrap();
        disk.read_file("dst.bin", &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rename_keeps_content() {
        let disk = RamDisk::with_defaults();
        disk.write_file("old", b"payload").unwrap();
        disk.rename("old", "new").unwrap();
        assert!(!disk.exists("old"));

        let mut buf = [0u8; 16];
        assert_eq!(disk.read_file("new", &mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"payload");
    }

    #[test]
    fn readdir_hides_hidden_unless_asked() {
        let disk = Arc::new(RamDisk::with_defaults());
        disk.write_file("plain", b"1").unwrap();
        disk.write_file("secret", b"2").unwrap();
        disk.set_flags("secret", RamFlags::HIDDEN).unwrap();

        let visible: Vec<String> = RamDisk::readdir(&disk, false).map(|f| f.name).collect();
        assert_eq!(visible, vec![String::from("plain")]);

        let all: Vec<String> = RamDisk::readdir(&disk, true).map(|f| f.name).collect();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn extension_helpers() {
        assert_eq!(file_ext("prog.exe"), "exe");
        assert_eq!(file_ext("noext"), "");
        assert!(has_ext("prog.ELF", "elf"));

        let disk = RamDisk::with_defaults();
        disk.write_file("run.com", b"").unwrap();
        disk.write_file("doc.txt", b"").unwrap();
        assert!(disk.is_executable("run.com"));
        assert!(!disk.is_executable("doc.txt"));
    }

    #[test]
    fn tick_stamps_modification() {
        let disk = RamDisk::with_defaults();
        disk.write_file("t", b"a").unwrap();
        assert_eq!(disk.stat("t").unwrap().modified, 0);
        disk.tick();
        disk.tick();
        disk.append_file("t", b"b").unwrap();
        let stat = disk.stat("t").unwrap();
        assert_eq!(stat.created, 0);
        assert_eq!(stat.modified, 2);
    }
}
