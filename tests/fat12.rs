//! End-to-end FAT12 tests over a memory-backed block device.
//!
//! Every mutating scenario finishes with an integrity scan of the raw disk
//! image: directory entries must point at legal clusters, chains must
//! terminate, no two chains may share a cluster, both FAT copies must be
//! byte-identical, and every subdirectory must start with its dot entries.

use std::collections::HashSet;
use std::sync::Arc;

use retrofs::device::{BlockDevice, MemDisk};
use retrofs::format::{mkfs, FormatParams};
use retrofs::fs::{Fat12Volume, FatFs};
use retrofs::vfs::{NodeKind, OpenFlags, SeekWhence, Vfs};
use retrofs::FsError;

const SECTOR: usize = 512;

fn setup(sectors: u32, label: &str) -> (Arc<MemDisk>, Vfs) {
    let disk = Arc::new(MemDisk::new(sectors));
    let dev: Arc<dyn BlockDevice> = disk.clone();
    mkfs(&dev, sectors, Some(label)).unwrap();

    let fs = FatFs::mount(dev.clone()).unwrap();
    let mut vfs = Vfs::new();
    vfs.mount("/", Some(dev), Arc::new(Fat12Volume::new(fs))).unwrap();
    (disk, vfs)
}

// ---- raw on-disk readers --------------------------------------------------

fn read_sector(disk: &MemDisk, lba: u32) -> [u8; SECTOR] {
    let mut buf = [0u8; SECTOR];
    assert_eq!(disk.read_sectors(lba, &mut buf).unwrap(), 1);
    buf
}

fn le16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

struct RawLayout {
    fat_start: u32,
    sectors_per_fat: u32,
    num_fats: u32,
    root_start: u32,
    root_sectors: u32,
    data_start: u32,
    sectors_per_cluster: u32,
    total_clusters: u32,
}

fn raw_layout(disk: &MemDisk) -> RawLayout {
    let boot = read_sector(disk, 0);
    assert_eq!(boot[510], 0x55);
    assert_eq!(boot[511], 0xAA);
    let reserved = le16(&boot, 14) as u32;
    let num_fats = boot[16] as u32;
    let sectors_per_fat = le16(&boot, 22) as u32;
    let root_entries = le16(&boot, 17) as u32;
    let spc = boot[13] as u32;
    let total = {
        let t16 = le16(&boot, 19) as u32;
        if t16 != 0 {
            t16
        } else {
            u32::from_le_bytes([boot[32], boot[33], boot[34], boot[35]])
        }
    };

    let root_start = reserved + num_fats * sectors_per_fat;
    let root_sectors = (root_entries * 32 + 511) / 512;
    let data_start = root_start + root_sectors;
    RawLayout {
        fat_start: reserved,
        sectors_per_fat,
        num_fats,
        root_start,
        root_sectors,
        data_start,
        sectors_per_cluster: spc,
        total_clusters: (total - data_start) / spc,
    }
}

fn raw_fat(disk: &MemDisk, layout: &RawLayout, copy: u32) -> Vec<u8> {
    let mut fat = Vec::new();
    let start = layout.fat_start + copy * layout.sectors_per_fat;
    for s in 0..layout.sectors_per_fat {
        fat.extend_from_slice(&read_sector(disk, start + s));
    }
    fat
}

fn fat_entry(fat: &[u8], cluster: u16) -> u16 {
    let off = cluster as usize + cluster as usize / 2;
    let word = le16(fat, off);
    if cluster & 1 == 1 {
        word >> 4
    } else {
        word & 0x0FFF
    }
}

#[derive(Clone)]
struct RawEntry {
    name: [u8; 11],
    attr: u8,
    cluster: u16,
    size: u32,
}

fn entries_in_sectors(disk: &MemDisk, start: u32, count: u32) -> (Vec<RawEntry>, bool) {
    let mut out = Vec::new();
    for s in 0..count {
        let sector = read_sector(disk, start + s);
        for i in 0..16 {
            let raw = &sector[i * 32..(i + 1) * 32];
            if raw[0] == 0x00 {
                return (out, true);
            }
            if raw[0] == 0xE5 || raw[11] == 0x0F {
                continue;
            }
            let mut name = [0u8; 11];
            name.copy_from_slice(&raw[0..11]);
            out.push(RawEntry {
                name,
                attr: raw[11],
                cluster: le16(raw, 26),
                size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
            });
        }
    }
    (out, false)
}

/// Walk one directory (root or a subdirectory chain) and return its live
/// entries.
fn read_dir_raw(disk: &MemDisk, layout: &RawLayout, fat: &[u8], cluster: u16) -> Vec<RawEntry> {
    if cluster == 0 {
        return entries_in_sectors(disk, layout.root_start, layout.root_sectors).0;
    }
    let mut out = Vec::new();
    let mut cluster = cluster;
    let mut steps = 0;
    while (2..0xFF8).contains(&cluster) {
        assert!(steps <= layout.total_clusters, "directory chain does not end");
        let first = layout.data_start + (cluster as u32 - 2) * layout.sectors_per_cluster;
        let (entries, ended) = entries_in_sectors(disk, first, layout.sectors_per_cluster);
        out.extend(entries);
        if ended {
            return out;
        }
        cluster = fat_entry(fat, cluster);
        steps += 1;
    }
    out
}

/// The universal invariants, checked against the raw image. Callers sync
/// the volume first.
fn integrity_scan(disk: &MemDisk) {
    let layout = raw_layout(disk);
    let fat = raw_fat(disk, &layout, 0);

    // every FAT copy byte-identical
    for copy in 1..layout.num_fats {
        assert_eq!(fat, raw_fat(disk, &layout, copy), "FAT copy {} differs", copy);
    }

    let mut claimed: HashSet<u16> = HashSet::new();
    // (directory cluster, entries); root is cluster 0
    let mut pending = vec![0u16];
    let mut seen_dirs = HashSet::new();

    while let Some(dir_cluster) = pending.pop() {
        if !seen_dirs.insert(dir_cluster) {
            continue;
        }
        let entries = read_dir_raw(disk, &layout, &fat, dir_cluster);
        for entry in &entries {
            if entry.attr == 0x08 {
                continue; // volume label owns no clusters
            }
            let dot = entry.name[0] == b'.';

            // invariant 1: cluster 0 or within the volume
            assert!(
                entry.cluster == 0 || (2..layout.total_clusters as u16 + 2).contains(&entry.cluster),
                "entry {:?} points at cluster {}",
                entry.name,
                entry.cluster
            );

            if entry.cluster >= 2 && !dot {
                // invariant 2: the chain ends within total_clusters steps
                let mut cluster = entry.cluster;
                let mut steps = 0u32;
                while (2..0xFF8).contains(&cluster) {
                    assert!(
                        steps <= layout.total_clusters,
                        "chain of {:?} does not terminate",
                        entry.name
                    );
                    // invariant 3: no cluster belongs to two chains
                    assert!(
                        claimed.insert(cluster),
                        "cluster {} claimed twice (by {:?})",
                        cluster,
                        entry.name
                    );
                    cluster = fat_entry(&fat, cluster);
                    steps += 1;
                }
                assert!(cluster >= 0xFF8, "chain of {:?} hit value {}", entry.name, cluster);
            }

            if entry.attr & 0x10 != 0 && !dot {
                // invariant 5: dot entries of every subdirectory
                let children = read_dir_raw(disk, &layout, &fat, entry.cluster);
                assert!(children.len() >= 2, "{:?} lacks dot entries", entry.name);
                assert_eq!(&children[0].name[..2], b". ");
                assert_eq!(children[0].cluster, entry.cluster);
                assert_eq!(&children[1].name[..2], b"..");
                assert_eq!(children[1].cluster, dir_cluster);
                pending.push(entry.cluster);
            }
        }
    }
}

// ---- scenarios ------------------------------------------------------------

#[test]
fn s1_format_then_list() {
    let (disk, mut vfs) = setup(2880, "HELLO");

    let dd = vfs.opendir("/").unwrap();
    let first = vfs.readdir(dd).unwrap().expect("volume label entry");
    assert_eq!(first.name, "HELLO");
    assert!(vfs.readdir(dd).unwrap().is_none(), "root should hold nothing else");
    vfs.closedir(dd).unwrap();

    vfs.sync_all();
    integrity_scan(&disk);
}

#[test]
fn s2_write_close_reopen_read() {
    let (disk, mut vfs) = setup(2880, "S2");
    let payload = b"Hello World!\n";

    let fd = vfs.open("/A.TXT", OpenFlags::CREAT | OpenFlags::WRONLY).unwrap();
    assert_eq!(vfs.write(fd, payload).unwrap(), payload.len());
    vfs.close(fd).unwrap();

    let fd = vfs.open("/A.TXT", OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 512];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), payload.len());
    assert_eq!(&buf[..payload.len()], payload);
    vfs.close(fd).unwrap();

    vfs.sync_all();
    integrity_scan(&disk);
}

#[test]
fn s3_cluster_boundary_write() {
    let (disk, mut vfs) = setup(2880, "S3");

    let fd = vfs.open("/B.BIN", OpenFlags::CREAT | OpenFlags::WRONLY).unwrap();
    assert_eq!(vfs.write(fd, &[0xAB; 1024]).unwrap(), 1024);
    vfs.close(fd).unwrap();
    vfs.sync_all();

    // with one sector per cluster the chain must span at least two clusters
    let layout = raw_layout(&disk);
    assert_eq!(layout.sectors_per_cluster, 1);
    let fat = raw_fat(&disk, &layout, 0);
    let entries = read_dir_raw(&disk, &layout, &fat, 0);
    let entry = entries
        .iter()
        .find(|e| &e.name == b"B       BIN")
        .expect("B.BIN in root");
    assert_eq!(entry.size, 1024);

    let first = entry.cluster;
    let second = fat_entry(&fat, first);
    assert!((2..0xFF8).contains(&second), "chain too short");
    assert!(fat_entry(&fat, second) >= 0xFF8, "chain must end after 1024 bytes");

    for (sector, offset) in [(first, 0u32), (second, 0)] {
        let lba = layout.data_start + (sector as u32 - 2) + offset;
        assert!(read_sector(&disk, lba).iter().all(|&b| b == 0xAB));
    }

    let mut back = vec![0u8; 2048];
    assert_eq!(vfs.read_file("/B.BIN", &mut back).unwrap(), 1024);
    assert!(back[..1024].iter().all(|&b| b == 0xAB));

    integrity_scan(&disk);
}

#[test]
fn s4_unlink_reclaims_space() {
    let (disk, mut vfs) = setup(2880, "S4");

    let (_, free_before) = vfs.statfs("/").unwrap();
    vfs.write_file("/C.DAT", &[7u8; 4096]).unwrap();
    let (_, free_with_file) = vfs.statfs("/").unwrap();
    assert!(free_with_file < free_before);
    assert_eq!(free_before - free_with_file, 4096);

    vfs.unlink("/C.DAT").unwrap();
    let (_, free_after) = vfs.statfs("/").unwrap();
    assert_eq!(free_after, free_before);

    // delete-restore impossibility
    assert_eq!(
        vfs.open("/C.DAT", OpenFlags::RDONLY).err(),
        Some(FsError::NotFound)
    );

    vfs.sync_all();
    integrity_scan(&disk);
}

#[test]
fn s5_mkdir_and_rmdir() {
    let (disk, mut vfs) = setup(2880, "S5");

    vfs.mkdir("/DIR1").unwrap();
    let dir_cluster = {
        let stat = vfs.stat("/DIR1").unwrap();
        assert_eq!(stat.kind, NodeKind::Directory);
        vfs.sync_all();
        let layout = raw_layout(&disk);
        let fat = raw_fat(&disk, &layout, 0);
        read_dir_raw(&disk, &layout, &fat, 0)
            .iter()
            .find(|e| &e.name == b"DIR1       ")
            .expect("DIR1 in root")
            .cluster
    };

    let dd = vfs.opendir("/DIR1").unwrap();
    let dot = vfs.readdir(dd).unwrap().unwrap();
    assert_eq!(dot.name, ".");
    assert_eq!(dot.inode, dir_cluster as u32);
    let dotdot = vfs.readdir(dd).unwrap().unwrap();
    assert_eq!(dotdot.name, "..");
    assert_eq!(dotdot.inode, 0);
    assert!(vfs.readdir(dd).unwrap().is_none());
    vfs.closedir(dd).unwrap();

    // creation stays single-level
    assert_eq!(vfs.create("/DIR1/X"), Err(FsError::InvalidArgument));

    vfs.rmdir("/DIR1").unwrap();
    assert_eq!(vfs.stat("/DIR1").err(), Some(FsError::NotFound));

    vfs.sync_all();
    integrity_scan(&disk);
}

#[test]
fn mkdir_twice_fails_rmdir_of_populated_fails() {
    let (disk, mut vfs) = setup(2880, "DIRS");

    vfs.mkdir("/WORK").unwrap();
    assert_eq!(vfs.mkdir("/WORK"), Err(FsError::AlreadyExists));

    // a populated root cannot be rmdir'd through a file name either
    vfs.write_file("/KEEP.TXT", b"data").unwrap();
    assert_eq!(vfs.rmdir("/KEEP.TXT"), Err(FsError::NotADirectory));
    assert_eq!(vfs.unlink("/WORK"), Err(FsError::InvalidArgument));

    vfs.sync_all();
    integrity_scan(&disk);
}

#[test]
fn rename_in_root() {
    let (disk, mut vfs) = setup(2880, "REN");

    vfs.write_file("/FOO.TXT", b"renamed payload").unwrap();
    vfs.write_file("/OTHER.TXT", b"x").unwrap();

    assert_eq!(vfs.rename("/FOO.TXT", "/OTHER.TXT"), Err(FsError::AlreadyExists));
    vfs.rename("/FOO.TXT", "/BAR.TXT").unwrap();

    assert_eq!(vfs.stat("/FOO.TXT").err(), Some(FsError::NotFound));
    let mut buf = [0u8; 64];
    let n = vfs.read_file("/BAR.TXT", &mut buf).unwrap();
    assert_eq!(&buf[..n], b"renamed payload");

    vfs.sync_all();
    integrity_scan(&disk);
}

#[test]
fn seek_whence_round_trip() {
    let (_, mut vfs) = setup(2880, "SEEK");

    let mut pattern = [0u8; 600];
    for (i, b) in pattern.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    vfs.write_file("/P.BIN", &pattern).unwrap();

    let fd = vfs.open("/P.BIN", OpenFlags::RDONLY).unwrap();
    assert_eq!(vfs.seek(fd, 520, SeekWhence::Set).unwrap(), 520);
    let mut buf = [0u8; 16];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 16);
    assert_eq!(&buf, &pattern[520..536]);

    assert_eq!(vfs.seek(fd, -8, SeekWhence::Cur).unwrap(), 528);
    assert_eq!(vfs.seek(fd, -10, SeekWhence::End).unwrap(), 590);
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 10);
    assert_eq!(&buf[..10], &pattern[590..600]);

    // read-only opens may not pass the end
    assert_eq!(vfs.seek(fd, 1, SeekWhence::End).err(), Some(FsError::InvalidArgument));
    assert_eq!(vfs.seek(fd, -601, SeekWhence::End).err(), Some(FsError::InvalidArgument));
    vfs.close(fd).unwrap();
}

#[test]
fn append_grows_file() {
    let (disk, mut vfs) = setup(2880, "APP");

    vfs.write_file("/LOG.TXT", b"one\n").unwrap();
    vfs.append_file("/LOG.TXT", b"two\n").unwrap();
    vfs.append_file("/LOG.TXT", b"three\n").unwrap();

    let mut buf = [0u8; 64];
    let n = vfs.read_file("/LOG.TXT", &mut buf).unwrap();
    assert_eq!(&buf[..n], b"one\ntwo\nthree\n");

    vfs.sync_all();
    integrity_scan(&disk);
}

#[test]
fn trunc_open_releases_clusters() {
    let (disk, mut vfs) = setup(2880, "TRUNC");

    let (_, free_before) = vfs.statfs("/").unwrap();
    vfs.write_file("/T.BIN", &[1u8; 2048]).unwrap();
    assert!(vfs.statfs("/").unwrap().1 < free_before);

    let fd = vfs.open("/T.BIN", OpenFlags::WRONLY | OpenFlags::TRUNC).unwrap();
    vfs.close(fd).unwrap();

    assert_eq!(vfs.stat("/T.BIN").unwrap().size, 0);
    assert_eq!(vfs.statfs("/").unwrap().1, free_before);

    vfs.sync_all();
    integrity_scan(&disk);
}

#[test]
fn root_directory_fills_up() {
    let (disk, mut vfs) = setup(2880, "FULL");

    // 224 root slots, one taken by the volume label
    for i in 0..223 {
        vfs.create(&format!("/F{}", i)).unwrap();
    }
    assert_eq!(vfs.create("/LAST"), Err(FsError::NoSpace));

    // deleting one makes room again, and the freed slot is found
    vfs.unlink("/F42").unwrap();
    vfs.create("/LAST").unwrap();

    vfs.sync_all();
    integrity_scan(&disk);
}

#[test]
fn mount_rejects_garbage() {
    let dev: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(64));
    assert!(matches!(FatFs::mount(dev), Err(FsError::Corrupt)));
}

#[test]
fn label_comes_from_the_boot_record() {
    let (_, vfs) = setup(2880, "MYDISK");
    assert_eq!(vfs.label("/").unwrap(), "MYDISK");
}

#[test]
fn statfs_reports_data_region() {
    let (_, vfs) = setup(2880, "STATS");
    let (total, free) = vfs.statfs("/").unwrap();
    // 2847 data clusters of 512 bytes on a fresh floppy
    assert_eq!(total, 2847 * 512);
    assert_eq!(free, total);
}

#[test]
fn stat_fields_are_fat_shaped() {
    let (_, mut vfs) = setup(2880, "STAT");
    vfs.write_file("/S.TXT", &[9u8; 700]).unwrap();

    let stat = vfs.stat("/S.TXT").unwrap();
    assert_eq!(stat.size, 700);
    assert_eq!(stat.kind, NodeKind::File);
    assert_eq!(stat.permissions, 0o755);
    assert_eq!((stat.uid, stat.gid), (0, 0));
    assert_eq!((stat.atime, stat.mtime, stat.ctime), (0, 0, 0));
    assert_eq!(stat.blocks, 2);
    assert_eq!(stat.block_size, 512);
}

#[test]
fn larger_volume_with_bigger_clusters() {
    let sectors = 16384u32;
    let params = FormatParams::auto(sectors);
    assert!(params.sectors_per_cluster > 1);

    let (disk, mut vfs) = setup(sectors, "BIGDISK");

    let mut pattern = vec![0u8; 100_000];
    for (i, b) in pattern.iter_mut().enumerate() {
        *b = (i * 31 % 253) as u8;
    }
    vfs.write_file("/BIG.DAT", &pattern).unwrap();

    let mut back = vec![0u8; pattern.len()];
    assert_eq!(vfs.read_file("/BIG.DAT", &mut back).unwrap(), pattern.len());
    assert_eq!(back, pattern);

    vfs.sync_all();
    integrity_scan(&disk);
}

#[test]
fn mixed_workload_keeps_the_image_sane() {
    let (disk, mut vfs) = setup(2880, "MIX");

    vfs.write_file("/A.TXT", &[1u8; 300]).unwrap();
    vfs.write_file("/B.BIN", &[2u8; 1500]).unwrap();
    vfs.mkdir("/SUB").unwrap();
    vfs.write_file("/C.DAT", &[3u8; 5000]).unwrap();
    vfs.unlink("/B.BIN").unwrap();
    vfs.write_file("/D.TXT", &[4u8; 777]).unwrap();
    vfs.rename("/A.TXT", "/AA.TXT").unwrap();
    vfs.append_file("/D.TXT", &[5u8; 900]).unwrap();

    let mut buf = vec![0u8; 2048];
    let n = vfs.read_file("/D.TXT", &mut buf).unwrap();
    assert_eq!(n, 777 + 900);
    assert!(buf[..777].iter().all(|&b| b == 4));
    assert!(buf[777..n].iter().all(|&b| b == 5));

    vfs.sync_all();
    integrity_scan(&disk);
}
