//! Virtual file system layer
//!
//! One [`Vfs`] instance routes pathname operations to whichever filesystem
//! is mounted closest to the path:
//!
//! ```text
//! Vfs              - path normalization, mount table, handle pools
//!   |
//! FileSystem       - fat12, ramdisk (per-mount operation table)
//!   |
//! BlockDevice      - ATA, floppy, memory (sector read/write)
//! ```
//!
//! The kernel builds one `Vfs` at boot and threads it through; there is no
//! hidden global. Handle pools are fixed-size tables, so running out of
//! open files is a hard `NoSlots`, never an allocation failure. When a
//! mount is torn down every handle living on it is closed behind the
//! caller's back.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::device::BlockDevice;
use crate::dir::DirEntryPos;
use crate::FsError;

pub const VFS_MAX_MOUNTS: usize = 8;
pub const VFS_MAX_OPEN: usize = 32;
pub const VFS_MAX_PATH: usize = 256;
pub const VFS_MAX_NAME: usize = 64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0x0001;
        const WRONLY = 0x0002;
        const RDWR   = Self::RDONLY.bits() | Self::WRONLY.bits();
        const CREAT  = 0x0100;
        const TRUNC  = 0x0200;
        const APPEND = 0x0400;
    }
}

impl OpenFlags {
    pub fn readable(&self) -> bool {
        self.contains(Self::RDONLY)
    }

    pub fn writable(&self) -> bool {
        self.contains(Self::WRONLY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Device,
    Symlink,
}

/// Filesystem-private part of a resolved node; the dispatch layer carries
/// it back into the filesystem on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePayload {
    None,
    Fat12 {
        cluster: u16,
        /// Where the directory entry lives; `None` for the root directory.
        entry: Option<DirEntryPos>,
    },
    Ram {
        slot: usize,
    },
}

/// A resolved path: an ephemeral value, not a cached object.
#[derive(Debug, Clone)]
pub struct VfsNode {
    pub name: String,
    pub kind: NodeKind,
    pub size: u32,
    /// Inode-like identity; the starting cluster for FAT12.
    pub inode: u32,
    pub payload: NodePayload,
}

#[derive(Debug, Clone)]
pub struct VfsDirent {
    pub name: String,
    pub inode: u32,
    pub kind: NodeKind,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfsStat {
    pub size: u32,
    pub kind: NodeKind,
    /// Cosmetic on FAT; fixed 0755.
    pub permissions: u16,
    pub uid: u16,
    pub gid: u16,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub blocks: u32,
    pub block_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

/// Per-mount operation table. A filesystem implements what it has; the
/// defaults answer `Unsupported` the way a null slot would.
pub trait FileSystem: Send + Sync {
    fn fs_name(&self) -> &'static str;

    fn lookup(&self, path: &str) -> Result<VfsNode, FsError>;

    fn stat(&self, node: &VfsNode) -> Result<VfsStat, FsError> {
        Ok(VfsStat {
            size: node.size,
            kind: node.kind,
            permissions: 0o755,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            blocks: (node.size + 511) / 512,
            block_size: 512,
        })
    }

    fn create(&self, _path: &str, _kind: NodeKind) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn unlink(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn rename(&self, _old_path: &str, _new_path: &str) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn mkdir(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn rmdir(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn open(&self, node: &VfsNode, flags: OpenFlags) -> Result<Box<dyn FileOps>, FsError>;

    fn opendir(&self, node: &VfsNode) -> Result<Box<dyn DirOps>, FsError>;

    /// (total bytes, free bytes)
    fn statfs(&self) -> Result<(u32, u32), FsError> {
        Err(FsError::Unsupported)
    }

    fn label(&self) -> Result<String, FsError> {
        Err(FsError::Unsupported)
    }

    fn sync(&self) -> Result<(), FsError> {
        Ok(())
    }

    fn unmount(&self) -> Result<(), FsError> {
        self.sync()
    }
}

/// Open-file state the filesystem keeps behind a handle. Positions are
/// owned by the dispatch layer and passed in, so backends re-derive their
/// walk state only when the position actually jumped.
pub trait FileOps: Send {
    fn read_at(&mut self, pos: u32, buf: &mut [u8]) -> Result<usize, FsError>;

    fn write_at(&mut self, pos: u32, buf: &[u8]) -> Result<usize, FsError>;

    fn truncate(&mut self, _size: u32) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn flush(&mut self) -> Result<(), FsError> {
        Ok(())
    }

    fn size(&self) -> u32;
}

pub trait DirOps: Send {
    fn next(&mut self) -> Result<Option<VfsDirent>, FsError>;

    fn rewind(&mut self);
}

// ---- path handling --------------------------------------------------------

/// Normalize a path against a working directory.
///
/// The result is always absolute, `.` components are dropped, `..` pops
/// (a no-op at the root), empty components collapse, and only the lone
/// root keeps a trailing slash.
pub fn normalize_path(path: &str, cwd: &str) -> Result<String, FsError> {
    if path.len() > VFS_MAX_PATH {
        return Err(FsError::InvalidArgument);
    }

    let mut parts: Vec<&str> = Vec::new();
    if !path.starts_with('/') {
        for component in cwd.split('/') {
            if !component.is_empty() {
                parts.push(component);
            }
        }
    }

    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => {
                if name.len() > VFS_MAX_NAME {
                    return Err(FsError::InvalidArgument);
                }
                parts.push(name);
            }
        }
    }

    let mut out = String::from("/");
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(part);
    }
    if out.len() > VFS_MAX_PATH {
        return Err(FsError::InvalidArgument);
    }
    Ok(out)
}

// ---- mount and handle tables ----------------------------------------------

struct Mount {
    path: String,
    #[allow(dead_code)]
    device: Option<Arc<dyn BlockDevice>>,
    fs: Arc<dyn FileSystem>,
    read_only: bool,
}

struct OpenFile {
    mount: usize,
    flags: OpenFlags,
    position: u32,
    backend: Box<dyn FileOps>,
}

struct OpenDir {
    mount: usize,
    backend: Box<dyn DirOps>,
}

/// An open-file handle: an index into the fixed pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fd(usize);

/// An open-directory handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dd(usize);

pub struct Vfs {
    mounts: Vec<Option<Mount>>,
    files: Vec<Option<OpenFile>>,
    dirs: Vec<Option<OpenDir>>,
    root: Option<usize>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        let mut mounts = Vec::new();
        mounts.resize_with(VFS_MAX_MOUNTS, || None);
        let mut files = Vec::new();
        files.resize_with(VFS_MAX_OPEN, || None);
        let mut dirs = Vec::new();
        dirs.resize_with(VFS_MAX_OPEN, || None);
        Self {
            mounts,
            files,
            dirs,
            root: None,
        }
    }

    /// Bind a filesystem to a path prefix. The mount at "/" becomes the
    /// root mount every unmatched path falls back to.
    pub fn mount(
        &mut self,
        path: &str,
        device: Option<Arc<dyn BlockDevice>>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<(), FsError> {
        let path = normalize_path(path, "/")?;

        if self.mount_index_by_path(&path).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let slot = self
            .mounts
            .iter()
            .position(|m| m.is_none())
            .ok_or(FsError::NoSlots)?;

        let read_only = device
            .as_ref()
            .map(|dev| dev.info().read_only)
            .unwrap_or(false);

        log::debug!("mount {} at {}", fs.fs_name(), path);
        if path == "/" {
            self.root = Some(slot);
        }
        self.mounts[slot] = Some(Mount {
            path,
            device,
            fs,
            read_only,
        });
        Ok(())
    }

    /// Tear a mount down, force-closing every handle that lives on it.
    pub fn unmount(&mut self, path: &str) -> Result<(), FsError> {
        let path = normalize_path(path, "/")?;
        let slot = self
            .mount_index_by_path(&path)
            .ok_or(FsError::NotMounted)?;

        let mut orphaned = 0usize;
        for file in self.files.iter_mut() {
            if file.as_ref().map(|f| f.mount == slot).unwrap_or(false) {
                if let Some(mut f) = file.take() {
                    let _ = f.backend.flush();
                }
                orphaned += 1;
            }
        }
        for dir in self.dirs.iter_mut() {
            if dir.as_ref().map(|d| d.mount == slot).unwrap_or(false) {
                *dir = None;
                orphaned += 1;
            }
        }
        if orphaned > 0 {
            log::warn!("unmount {}: closed {} open handles", path, orphaned);
        }

        if let Some(mount) = &self.mounts[slot] {
            mount.fs.unmount()?;
        }
        self.mounts[slot] = None;
        if self.root == Some(slot) {
            self.root = None;
        }
        Ok(())
    }

    fn mount_index_by_path(&self, path: &str) -> Option<usize> {
        self.mounts.iter().position(|m| {
            m.as_ref().map(|m| m.path == path).unwrap_or(false)
        })
    }

    fn mount_at(&self, index: usize) -> Result<&Mount, FsError> {
        self.mounts
            .get(index)
            .and_then(|m| m.as_ref())
            .ok_or(FsError::NotMounted)
    }

    /// Longest-prefix mount match on component boundaries, with the root
    /// mount as the fallback. Returns the mount slot and the path relative
    /// to it.
    fn resolve(&self, path: &str) -> Result<(usize, String), FsError> {
        let normalized = normalize_path(path, "/")?;

        let mut best: Option<(usize, usize)> = None; // (slot, prefix len)
        for (slot, mount) in self.mounts.iter().enumerate() {
            let mount = match mount {
                Some(m) => m,
                None => continue,
            };
            let prefix = &mount.path;
            let matches = if prefix == "/" {
                true
            } else {
                normalized == *prefix
                    || (normalized.starts_with(prefix.as_str())
                        && normalized.as_bytes()[prefix.len()] == b'/')
            };
            if matches && best.map(|(_, len)| prefix.len() > len).unwrap_or(true) {
                best = Some((slot, prefix.len()));
            }
        }

        let (slot, prefix_len) = match best {
            Some(found) => found,
            None => (self.root.ok_or(FsError::NotMounted)?, 1),
        };
        let relative = normalized[prefix_len.min(normalized.len())..]
            .trim_start_matches('/')
            .into();
        Ok((slot, relative))
    }

    // ---- file operations -------------------------------------------------

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd, FsError> {
        let (mount_idx, relative) = self.resolve(path)?;
        let mount = self.mount_at(mount_idx)?;
        if mount.read_only && flags.writable() {
            return Err(FsError::ReadOnly);
        }
        let fs = Arc::clone(&mount.fs);

        let slot = self
            .files
            .iter()
            .position(|f| f.is_none())
            .ok_or(FsError::NoSlots)?;

        let node = match fs.lookup(&relative) {
            Ok(node) => node,
            Err(FsError::NotFound) if flags.contains(OpenFlags::CREAT) => {
                fs.create(&relative, NodeKind::File)?;
                fs.lookup(&relative)?
            }
            Err(err) => return Err(err),
        };
        if node.kind != NodeKind::File {
            return Err(FsError::InvalidArgument);
        }

        let mut backend = fs.open(&node, flags)?;
        if flags.contains(OpenFlags::TRUNC) && flags.writable() {
            backend.truncate(0)?;
        }
        let position = if flags.contains(OpenFlags::APPEND) {
            backend.size()
        } else {
            0
        };

        self.files[slot] = Some(OpenFile {
            mount: mount_idx,
            flags,
            position,
            backend,
        });
        Ok(Fd(slot))
    }

    fn file_mut(&mut self, fd: Fd) -> Result<&mut OpenFile, FsError> {
        self.files
            .get_mut(fd.0)
            .and_then(|f| f.as_mut())
            .ok_or(FsError::InvalidArgument)
    }

    pub fn close(&mut self, fd: Fd) -> Result<(), FsError> {
        let mut file = self
            .files
            .get_mut(fd.0)
            .and_then(|f| f.take())
            .ok_or(FsError::InvalidArgument)?;
        file.backend.flush()
    }

    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, FsError> {
        let file = self.file_mut(fd)?;
        if !file.flags.readable() {
            return Err(FsError::InvalidArgument);
        }
        let n = file.backend.read_at(file.position, buf)?;
        file.position += n as u32;
        Ok(n)
    }

    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize, FsError> {
        let file = self.file_mut(fd)?;
        if !file.flags.writable() {
            return Err(FsError::ReadOnly);
        }
        let n = file.backend.write_at(file.position, buf)?;
        file.position += n as u32;
        Ok(n)
    }

    /// Reposition a handle. Seeking past the end is allowed only on a
    /// writable open.
    pub fn seek(&mut self, fd: Fd, offset: i32, whence: SeekWhence) -> Result<u32, FsError> {
        let file = self.file_mut(fd)?;
        let base = match whence {
            SeekWhence::Set => 0i64,
            SeekWhence::Cur => file.position as i64,
            SeekWhence::End => file.backend.size() as i64,
        };
        let target = base + offset as i64;
        if target < 0 || target > u32::MAX as i64 {
            return Err(FsError::InvalidArgument);
        }
        let target = target as u32;
        if target > file.backend.size() && !file.flags.writable() {
            return Err(FsError::InvalidArgument);
        }
        file.position = target;
        Ok(target)
    }

    pub fn truncate(&mut self, fd: Fd, size: u32) -> Result<(), FsError> {
        let file = self.file_mut(fd)?;
        if !file.flags.writable() {
            return Err(FsError::ReadOnly);
        }
        file.backend.truncate(size)
    }

    pub fn tell(&self, fd: Fd) -> Result<u32, FsError> {
        self.files
            .get(fd.0)
            .and_then(|f| f.as_ref())
            .map(|f| f.position)
            .ok_or(FsError::InvalidArgument)
    }

    // ---- directory operations --------------------------------------------

    pub fn opendir(&mut self, path: &str) -> Result<Dd, FsError> {
        let (mount_idx, relative) = self.resolve(path)?;
        let fs = Arc::clone(&self.mount_at(mount_idx)?.fs);

        let slot = self
            .dirs
            .iter()
            .position(|d| d.is_none())
            .ok_or(FsError::NoSlots)?;

        let node = fs.lookup(&relative)?;
        if node.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let backend = fs.opendir(&node)?;

        self.dirs[slot] = Some(OpenDir {
            mount: mount_idx,
            backend,
        });
        Ok(Dd(slot))
    }

    pub fn closedir(&mut self, dd: Dd) -> Result<(), FsError> {
        self.dirs
            .get_mut(dd.0)
            .and_then(|d| d.take())
            .map(|_| ())
            .ok_or(FsError::InvalidArgument)
    }

    pub fn readdir(&mut self, dd: Dd) -> Result<Option<VfsDirent>, FsError> {
        let dir = self
            .dirs
            .get_mut(dd.0)
            .and_then(|d| d.as_mut())
            .ok_or(FsError::InvalidArgument)?;
        dir.backend.next()
    }

    pub fn rewinddir(&mut self, dd: Dd) -> Result<(), FsError> {
        let dir = self
            .dirs
            .get_mut(dd.0)
            .and_then(|d| d.as_mut())
            .ok_or(FsError::InvalidArgument)?;
        dir.backend.rewind();
        Ok(())
    }

    // ---- path operations -------------------------------------------------

    pub fn stat(&self, path: &str) -> Result<VfsStat, FsError> {
        let (mount_idx, relative) = self.resolve(path)?;
        let mount = self.mount_at(mount_idx)?;
        let node = mount.fs.lookup(&relative)?;
        mount.fs.stat(&node)
    }

    pub fn create(&mut self, path: &str) -> Result<(), FsError> {
        self.mutate(path, |fs, relative| fs.create(relative, NodeKind::File))
    }

    pub fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        self.mutate(path, |fs, relative| fs.unlink(relative))
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        self.mutate(path, |fs, relative| fs.mkdir(relative))
    }

    pub fn rmdir(&mut self, path: &str) -> Result<(), FsError> {
        self.mutate(path, |fs, relative| fs.rmdir(relative))
    }

    fn mutate(
        &mut self,
        path: &str,
        op: impl FnOnce(&dyn FileSystem, &str) -> Result<(), FsError>,
    ) -> Result<(), FsError> {
        let (mount_idx, relative) = self.resolve(path)?;
        let mount = self.mount_at(mount_idx)?;
        if mount.read_only {
            return Err(FsError::ReadOnly);
        }
        op(mount.fs.as_ref(), &relative)
    }

    /// Rename within one mount; crossing mounts is not a rename.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        let (old_mount, old_rel) = self.resolve(old_path)?;
        let (new_mount, new_rel) = self.resolve(new_path)?;
        if old_mount != new_mount {
            return Err(FsError::InvalidArgument);
        }
        let mount = self.mount_at(old_mount)?;
        if mount.read_only {
            return Err(FsError::ReadOnly);
        }
        mount.fs.rename(&old_rel, &new_rel)
    }

    pub fn statfs(&self, path: &str) -> Result<(u32, u32), FsError> {
        let (mount_idx, _) = self.resolve(path)?;
        self.mount_at(mount_idx)?.fs.statfs()
    }

    pub fn label(&self, path: &str) -> Result<String, FsError> {
        let (mount_idx, _) = self.resolve(path)?;
        self.mount_at(mount_idx)?.fs.label()
    }

    /// Flush every mounted filesystem; failures are logged, not raised.
    pub fn sync_all(&self) {
        for mount in self.mounts.iter().flatten() {
            if let Err(err) = mount.fs.sync() {
                log::warn!("sync of {} failed: {:?}", mount.path, err);
            }
        }
    }

    // ---- whole-file convenience ------------------------------------------

    /// Read a whole file into `buf`; returns the bytes read.
    pub fn read_file(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, FsError> {
        let fd = self.open(path, OpenFlags::RDONLY)?;
        let result = self.read(fd, buf);
        let _ = self.close(fd);
        result
    }

    /// Create-or-replace a file with `data`. The old file is unlinked
    /// first; this is not atomic.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<usize, FsError> {
        match self.unlink(path) {
            Ok(()) | Err(FsError::NotFound) => {}
            Err(err) => return Err(err),
        }
        let fd = self.open(path, OpenFlags::CREAT | OpenFlags::WRONLY)?;
        let result = self.write(fd, data);
        let _ = self.close(fd);
        result
    }

    /// Append `data` to a file, creating it when missing.
    pub fn append_file(&mut self, path: &str, data: &[u8]) -> Result<usize, FsError> {
        let fd = self.open(
            path,
            OpenFlags::CREAT | OpenFlags::WRONLY | OpenFlags::APPEND,
        )?;
        let result = self.write(fd, data);
        let _ = self.close(fd);
        result
    }
}
