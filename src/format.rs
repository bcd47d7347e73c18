//! FAT12 formatting (mkfs)
//!
//! Lays down a boot sector, the FAT copies and the fixed root directory on
//! a raw block device. Geometry is picked from the device size: cluster
//! size starts at one sector and doubles until the data-cluster count fits
//! the FAT12 bound of 4084. Devices past 32 MiB get only their first
//! 65536 sectors formatted.
//!
//! Formatting is destructive and not atomic; if the write stream fails
//! partway the volume is undefined. Confirmation prompts belong to the
//! caller.

use alloc::sync::Arc;

use crate::device::BlockDevice;
use crate::entry::DirEntry;
use crate::{FsError, MAX_CLUSTER_FAT12, SECTOR_SIZE};

/// Largest formattable volume: 65536 sectors, 32 MiB.
pub const MAX_FORMAT_SECTORS: u32 = 65536;

/// Fallback serial number when the caller has no entropy source.
const DEFAULT_VOLUME_ID: u32 = 0x1234_5678;

#[derive(Debug, Clone, Copy)]
pub struct FormatParams {
    pub total_sectors: u32,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub sectors_per_fat: u16,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub media_type: u8,
    pub volume_label: [u8; 11],
    pub volume_id: u32,
}

impl FormatParams {
    /// Pick parameters for a device of `total_sectors`, using the classic
    /// presets: floppy geometry up to 2880 sectors, fixed-disk geometry
    /// above that.
    pub fn auto(total_sectors: u32) -> Self {
        let total_sectors = total_sectors.min(MAX_FORMAT_SECTORS);

        let (mut sectors_per_cluster, root_entry_count, sectors_per_track, num_heads, media_type) =
            if total_sectors <= 2880 {
                (1u8, 224u16, 18u16, 2u16, 0xF0u8)
            } else if total_sectors <= 8192 {
                (1, 512, 32, 16, 0xF8)
            } else if total_sectors <= 16384 {
                (2, 512, 32, 16, 0xF8)
            } else {
                (4, 512, 63, 16, 0xF8)
            };

        let reserved_sectors = 1u16;
        let num_fats = 2u8;
        let root_sectors =
            (root_entry_count as u32 * 32 + (SECTOR_SIZE as u32 - 1)) / SECTOR_SIZE as u32;

        // Double the cluster size until the cluster count is a legal FAT12
        // count; each round recomputes the FAT size for the new geometry.
        let sectors_per_fat = loop {
            let avail = total_sectors - reserved_sectors as u32 - root_sectors;
            let est_clusters = avail / sectors_per_cluster as u32;
            // 12-bit entries: each FAT copy needs 3*n+3 half-bytes.
            let sectors_per_fat = (3 * est_clusters + 3 + 1023) / 1024;
            let data_sectors = avail - num_fats as u32 * sectors_per_fat;
            let clusters = data_sectors / sectors_per_cluster as u32;
            if clusters <= MAX_CLUSTER_FAT12 || sectors_per_cluster >= 64 {
                break sectors_per_fat as u16;
            }
            sectors_per_cluster *= 2;
        };

        let mut params = Self {
            total_sectors,
            bytes_per_sector: SECTOR_SIZE as u16,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            root_entry_count,
            sectors_per_fat,
            sectors_per_track,
            num_heads,
            media_type,
            volume_label: [0; 11],
            volume_id: DEFAULT_VOLUME_ID,
        };
        copy_padded(&mut params.volume_label, "NO NAME");
        params
    }

    pub fn with_label(mut self, label: &str) -> Self {
        copy_padded(&mut self.volume_label, label);
        self
    }

    /// Data clusters the formatted volume will carry.
    pub fn cluster_count(&self) -> u32 {
        let root_sectors =
            (self.root_entry_count as u32 * 32 + (SECTOR_SIZE as u32 - 1)) / SECTOR_SIZE as u32;
        let data_start = self.reserved_sectors as u32
            + self.num_fats as u32 * self.sectors_per_fat as u32
            + root_sectors;
        (self.total_sectors - data_start) / self.sectors_per_cluster as u32
    }
}

/// Upper-case and space-pad into a fixed field.
fn copy_padded(dst: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    for (i, slot) in dst.iter_mut().enumerate() {
        *slot = if i < bytes.len() {
            bytes[i].to_ascii_uppercase()
        } else {
            b' '
        };
    }
}

fn write_one(device: &Arc<dyn BlockDevice>, lba: u32, sector: &[u8]) -> Result<(), FsError> {
    if device.write_sectors(lba, sector)? != 1 {
        return Err(FsError::DeviceError);
    }
    Ok(())
}

/// Format a device with the given parameters.
pub fn format(device: &Arc<dyn BlockDevice>, params: &FormatParams) -> Result<(), FsError> {
    let mut sector = [0u8; SECTOR_SIZE];

    // ---- boot sector ----------------------------------------------------

    sector[0] = 0xEB;
    sector[1] = 0x3C;
    sector[2] = 0x90;
    copy_padded(&mut sector[3..11], "RETROFS");

    sector[11..13].copy_from_slice(&params.bytes_per_sector.to_le_bytes());
    sector[13] = params.sectors_per_cluster;
    sector[14..16].copy_from_slice(&params.reserved_sectors.to_le_bytes());
    sector[16] = params.num_fats;
    sector[17..19].copy_from_slice(&params.root_entry_count.to_le_bytes());
    if params.total_sectors < 65536 {
        sector[19..21].copy_from_slice(&(params.total_sectors as u16).to_le_bytes());
        sector[32..36].copy_from_slice(&0u32.to_le_bytes());
    } else {
        sector[19..21].copy_from_slice(&0u16.to_le_bytes());
        sector[32..36].copy_from_slice(&params.total_sectors.to_le_bytes());
    }
    sector[21] = params.media_type;
    sector[22..24].copy_from_slice(&params.sectors_per_fat.to_le_bytes());
    sector[24..26].copy_from_slice(&params.sectors_per_track.to_le_bytes());
    sector[26..28].copy_from_slice(&params.num_heads.to_le_bytes());
    sector[28..32].copy_from_slice(&0u32.to_le_bytes()); // hidden sectors

    sector[36] = 0x00; // drive number
    sector[37] = 0x00;
    sector[38] = 0x29; // extended boot signature
    sector[39..43].copy_from_slice(&params.volume_id.to_le_bytes());
    sector[43..54].copy_from_slice(&params.volume_label);
    copy_padded(&mut sector[54..62], "FAT12");

    // boot code placeholder: jmp $
    sector[62] = 0xEB;
    sector[63] = 0xFE;

    sector[510] = 0x55;
    sector[511] = 0xAA;

    write_one(device, 0, &sector)?;

    // ---- FAT copies ------------------------------------------------------

    let fat_start = params.reserved_sectors as u32;
    for copy in 0..params.num_fats as u32 {
        let fat_lba = fat_start + copy * params.sectors_per_fat as u32;
        for s in 0..params.sectors_per_fat as u32 {
            sector.fill(0);
            if s == 0 {
                // FAT[0] = media | 0xF00, FAT[1] = end-of-chain
                sector[0] = params.media_type;
                sector[1] = 0xFF;
                sector[2] = 0xFF;
            }
            write_one(device, fat_lba + s, &sector)?;
        }
    }

    // ---- root directory --------------------------------------------------

    let root_start = fat_start + params.num_fats as u32 * params.sectors_per_fat as u32;
    let root_sectors =
        (params.root_entry_count as u32 * 32 + (SECTOR_SIZE as u32 - 1)) / SECTOR_SIZE as u32;

    for s in 0..root_sectors {
        sector.fill(0);
        if s == 0 {
            let label = DirEntry::volume_label(&params.volume_label);
            sector[0..32].copy_from_slice(label.as_bytes());
        }
        write_one(device, root_start + s, &sector)?;
    }

    // ---- first data cluster ----------------------------------------------

    let data_start = root_start + root_sectors;
    sector.fill(0);
    for s in 0..params.sectors_per_cluster as u32 {
        write_one(device, data_start + s, &sector)?;
    }

    log::debug!(
        "formatted {} sectors, {} clusters of {} sectors",
        params.total_sectors,
        params.cluster_count(),
        params.sectors_per_cluster
    );
    Ok(())
}

/// One-call mkfs: auto geometry for `total_sectors`, optional label.
pub fn mkfs(
    device: &Arc<dyn BlockDevice>,
    total_sectors: u32,
    label: Option<&str>,
) -> Result<(), FsError> {
    let mut params = FormatParams::auto(total_sectors);
    if let Some(label) = label {
        params = params.with_label(label);
    }
    format(device, &params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floppy_params_match_the_classic_layout() {
        let params = FormatParams::auto(2880);
        assert_eq!(params.sectors_per_cluster, 1);
        assert_eq!(params.root_entry_count, 224);
        assert_eq!(params.sectors_per_fat, 9);
        assert_eq!(params.media_type, 0xF0);
        assert_eq!(params.sectors_per_track, 18);
        assert_eq!(params.num_heads, 2);
        assert_eq!(params.cluster_count(), 2847);
    }

    #[test]
    fn cluster_count_stays_within_fat12_bound() {
        for sectors in [720, 2880, 8192, 16384, 32768, 65536, 1_000_000] {
            let params = FormatParams::auto(sectors);
            assert!(
                params.cluster_count() <= MAX_CLUSTER_FAT12,
                "{} sectors -> {} clusters",
                sectors,
                params.cluster_count()
            );
        }
    }

    #[test]
    fn oversized_devices_are_capped() {
        let params = FormatParams::auto(1_000_000);
        assert_eq!(params.total_sectors, MAX_FORMAT_SECTORS);
    }

    #[test]
    fn label_is_uppercased_and_padded() {
        let params = FormatParams::auto(2880).with_label("hello");
        assert_eq!(&params.volume_label, b"HELLO      ");
    }
}
