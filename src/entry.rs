//! FAT 32-byte directory entries and 8.3 name coding
//!
//! Special notes about the first byte (`name[0]`) of a directory entry:
//! - 0xE5: the entry is free (deleted).
//! - 0x00: the entry is free, and no allocated entries follow it; a scan may
//!   stop here. A slot search must still examine deleted entries.
//! - 0x05: the real first character is 0xE5 (a valid KANJI lead byte).
//!
//! The name field is two parts: the 8-character main name and a 3-character
//! extension, both trailing-space padded with 0x20 and stored upper case.
//! There is an implied '.' between them that is not stored. Long-file-name
//! entries (attribute 0x0F) are skipped on read and never written.
//!
//! A directory entry with the directory attribute keeps its size field at 0;
//! directories are sized by following their cluster chain to the EOC mark.
//! Every subdirectory starts with the dot entry (pointing at itself) and the
//! dotdot entry (pointing at its parent, cluster 0 when the parent is the
//! root directory).

use alloc::string::String;

use crate::{
    ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_LONG_NAME, ATTR_VOLUME_ID, DIRENT_SIZE, DIR_ENTRY_DELETED,
    DIR_ENTRY_KANJI, DIR_ENTRY_LAST_AND_UNUSED, DOT, EPOCH_DATE, SPACE,
};

/// Encode a caller name into the packed (name, extension) pair.
///
/// Characters are upper-cased and space padded; anything past the 8/3 limits
/// is dropped, matching what every other FAT driver does to long inputs.
pub fn encode_name(name_str: &str) -> ([u8; 8], [u8; 3]) {
    let mut name = [SPACE; 8];
    let mut ext = [SPACE; 3];

    let bytes = name_str.as_bytes();
    let mut i = 0;
    let mut j = 0;
    while i < bytes.len() && bytes[i] != DOT && j < 8 {
        name[j] = bytes[i].to_ascii_uppercase();
        i += 1;
        j += 1;
    }

    // skip to the extension, dropping any over-length tail
    while i < bytes.len() && bytes[i] != DOT {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == DOT {
        i += 1;
        let mut j = 0;
        while i < bytes.len() && j < 3 {
            ext[j] = bytes[i].to_ascii_uppercase();
            i += 1;
            j += 1;
        }
    }

    (name, ext)
}

/// Decode a packed 8.3 name, trimming padding and inserting the '.' only
/// when the extension is non-empty.
pub fn decode_name(name: &[u8; 8], ext: &[u8; 3]) -> String {
    let mut out = String::new();
    for (i, &b) in name.iter().enumerate() {
        if b == SPACE {
            break;
        }
        if i == 0 && b == DIR_ENTRY_KANJI {
            out.push(DIR_ENTRY_DELETED as char);
        } else {
            out.push(b as char);
        }
    }
    if ext[0] != SPACE {
        out.push('.');
        for &b in ext.iter() {
            if b == SPACE {
                break;
            }
            out.push(b as char);
        }
    }
    out
}

/// FAT 32 Byte Directory Entry Structure
#[derive(Clone, Copy)]
#[repr(packed)]
pub struct DirEntry {
    /// Filename, space padded    Size: 8 bytes    Offset: 0x00
    name: [u8; 8],
    /// Extension, space padded    Size: 3 bytes    Offset: 0x08
    ext: [u8; 3],
    /// Attribute bits; 0x0F marks a long-name entry    Offset: 0x0B
    attr: u8,
    /// Reserved for Windows NT    Offset: 0x0C
    nt_reserved: u8,
    /// Creation time, tenths of a second (0-199)    Offset: 0x0D
    create_time_tenths: u8,
    /// Creation time, 2-second granularity    Offset: 0x0E
    create_time: u16,
    /// Creation date    Offset: 0x10
    create_date: u16,
    /// Last access date    Offset: 0x12
    access_date: u16,
    /// High 16 bits of the first cluster, always 0 on FAT12    Offset: 0x14
    cluster_high: u16,
    /// Last write time    Offset: 0x16
    modify_time: u16,
    /// Last write date    Offset: 0x18
    modify_date: u16,
    /// Low 16 bits of the first cluster    Offset: 0x1A
    cluster_low: u16,
    /// File size in bytes; always 0 for directories    Offset: 0x1C
    file_size: u32,
}

impl DirEntry {
    pub fn empty() -> Self {
        unsafe { core::mem::zeroed() }
    }

    /// Build a fresh entry for `create`; cluster 0, size 0, epoch stamps.
    pub fn new(name_str: &str, attr: u8) -> Self {
        let (name, ext) = encode_name(name_str);
        let mut item = Self::empty();
        item.name = name;
        item.ext = ext;
        item.attr = attr;
        item.cluster_low = 0;
        item.file_size = 0;
        item.create_date = EPOCH_DATE;
        item.modify_date = EPOCH_DATE;
        item.access_date = EPOCH_DATE;
        item
    }

    /// The volume-label entry placed in root slot 0 at format time.
    pub fn volume_label(label: &[u8; 11]) -> Self {
        let mut item = Self::empty();
        item.name.copy_from_slice(&label[0..8]);
        item.ext.copy_from_slice(&label[8..11]);
        item.attr = ATTR_VOLUME_ID;
        item.cluster_low = 0;
        item.file_size = 0;
        item.create_date = EPOCH_DATE;
        item.modify_date = EPOCH_DATE;
        item
    }

    /// The "." entry of a fresh subdirectory; points at the directory itself.
    pub fn dot(cluster: u16) -> Self {
        let mut item = Self::empty();
        item.name = [b'.', SPACE, SPACE, SPACE, SPACE, SPACE, SPACE, SPACE];
        item.ext = [SPACE; 3];
        item.attr = ATTR_DIRECTORY;
        item.cluster_low = cluster;
        item
    }

    /// The ".." entry; `parent` is 0 when the parent is the root directory.
    pub fn dotdot(parent: u16) -> Self {
        let mut item = Self::empty();
        item.name = [b'.', b'.', SPACE, SPACE, SPACE, SPACE, SPACE, SPACE];
        item.ext = [SPACE; 3];
        item.attr = ATTR_DIRECTORY;
        item.cluster_low = parent;
        item
    }

    pub fn attr(&self) -> u8 {
        self.attr
    }

    /// First byte 0x00: nothing used from here to the end of the directory.
    pub fn is_end(&self) -> bool {
        self.name[0] == DIR_ENTRY_LAST_AND_UNUSED
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == DIR_ENTRY_DELETED
    }

    /// Free for reuse: deleted, or never used.
    pub fn is_free(&self) -> bool {
        self.is_end() || self.is_deleted()
    }

    pub fn is_long_name(&self) -> bool {
        self.attr == ATTR_LONG_NAME
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attr == ATTR_VOLUME_ID
    }

    /// A dot or dotdot entry of a subdirectory.
    pub fn is_dot_entry(&self) -> bool {
        self.name[0] == b'.'
    }

    pub fn first_cluster(&self) -> u16 {
        self.cluster_low
    }

    pub fn set_first_cluster(&mut self, cluster: u16) {
        self.cluster_low = cluster;
        self.cluster_high = 0;
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn set_file_size(&mut self, size: u32) {
        self.file_size = size;
    }

    /// Compare against an already-encoded 8.3 pair; all 11 bytes must match.
    pub fn matches(&self, name: &[u8; 8], ext: &[u8; 3]) -> bool {
        self.name == *name && self.ext == *ext
    }

    /// Human-readable name, e.g. "FOO.TXT".
    pub fn name(&self) -> String {
        decode_name(&self.name, &self.ext)
    }

    /// The raw 11 packed name bytes, as stored.
    pub fn name_bytes(&self) -> [u8; 11] {
        let mut out = [0u8; 11];
        out[0..8].copy_from_slice(&self.name);
        out[8..11].copy_from_slice(&self.ext);
        out
    }

    /// Replace only the name and extension, used by rename.
    pub fn set_name(&mut self, name: [u8; 8], ext: [u8; 3]) {
        self.name = name;
        self.ext = ext;
    }

    /// Mark the entry deleted. The rest of the bytes stay behind.
    pub fn delete(&mut self) {
        self.name[0] = DIR_ENTRY_DELETED;
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, DIRENT_SIZE) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self as *mut Self as *mut u8, DIRENT_SIZE) }
    }
}
