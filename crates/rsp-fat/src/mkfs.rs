//! Minimal FAT32 formatter.
//!
//! Produces a volume this crate can mount: boot sector plus backup, FSInfo
//! with unknown free counts, zeroed FATs with the media and root-directory
//! marks, and an empty root directory cluster.

use crate::bpb::{BOOT_SIGNATURE, FatBpb, encode_boot_sector};
use crate::{FAT_EOC, FAT_ENTRY_MASK};
use rsp_block::SectorDevice;
use rsp_error::{Result, RspError};
use rsp_types::{LunNbr, SECTOR_SIZE, SectorNbr};
use tracing::info;

const RESERVED_SECTORS: u16 = 32;
const NUM_FATS: u8 = 2;
const MEDIA_FIXED: u8 = 0xF8;

/// Formatting knobs. `Default` picks a cluster size from the volume size.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    /// Sectors per cluster; 0 selects automatically.
    pub sectors_per_cluster: u8,
    pub volume_label: [u8; 11],
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            sectors_per_cluster: 0,
            volume_label: *b"RAWSPOOL   ",
        }
    }
}

fn auto_sectors_per_cluster(total_sectors: u32) -> u8 {
    // 1 sector per cluster below 64 MiB keeps small test volumes dense;
    // 4 KiB clusters beyond that.
    if total_sectors < 131_072 { 1 } else { 8 }
}

/// Format the whole of `lun` as one FAT32 volume.
pub fn format_volume<D: SectorDevice>(device: &D, lun: LunNbr, options: FormatOptions) -> Result<()> {
    if device.sector_size() != SECTOR_SIZE {
        return Err(RspError::Format(format!(
            "device sector size {} does not match {SECTOR_SIZE}",
            device.sector_size()
        )));
    }
    let total_sectors = u32::try_from(device.num_sectors(lun)?)
        .map_err(|_| RspError::Format("volume exceeds 32-bit sector addressing".to_owned()))?;

    let spc = if options.sectors_per_cluster == 0 {
        auto_sectors_per_cluster(total_sectors)
    } else {
        options.sectors_per_cluster
    };
    if !spc.is_power_of_two() {
        return Err(RspError::Format(format!(
            "sectors per cluster {spc} is not a power of two"
        )));
    }

    // First estimate ignores the FAT region, then the region is carved out.
    // The FAT ends up marginally oversized, which is valid.
    let usable = total_sectors.saturating_sub(u32::from(RESERVED_SECTORS));
    let clusters_est = usable / u32::from(spc);
    let fat_size_sectors = (clusters_est + 2).div_ceil((SECTOR_SIZE / 4) as u32);
    let data_start =
        u32::from(RESERVED_SECTORS) + u32::from(NUM_FATS) * fat_size_sectors;
    if data_start + u32::from(spc) > total_sectors {
        return Err(RspError::Format(format!(
            "{total_sectors} sectors is too small for a FAT32 volume"
        )));
    }
    let cluster_count = (total_sectors - data_start) / u32::from(spc);

    let bpb = FatBpb {
        bytes_per_sector: SECTOR_SIZE as u16,
        sectors_per_cluster: spc,
        reserved_sectors: RESERVED_SECTORS,
        num_fats: NUM_FATS,
        media: MEDIA_FIXED,
        total_sectors,
        fat_size_sectors,
        root_cluster: 2,
        fsinfo_sector: 1,
        backup_boot_sector: 6,
        volume_id: volume_id_from(&options.volume_label, total_sectors),
        volume_label: options.volume_label,
        fat_start_sector: u32::from(RESERVED_SECTORS),
        data_start_sector: data_start,
        cluster_count,
    };

    let boot = encode_boot_sector(&bpb);
    device.write_sectors(lun, SectorNbr(0), &boot)?;
    device.write_sectors(lun, SectorNbr(u32::from(bpb.backup_boot_sector)), &boot)?;

    let fsinfo = encode_fsinfo_sector();
    device.write_sectors(lun, SectorNbr(u32::from(bpb.fsinfo_sector)), &fsinfo)?;
    device.write_sectors(
        lun,
        SectorNbr(u32::from(bpb.backup_boot_sector) + 1),
        &fsinfo,
    )?;

    // Zero both FAT copies, then set the reserved entries and the root
    // directory chain in each.
    let zero = vec![0_u8; SECTOR_SIZE];
    for copy in 0..u32::from(NUM_FATS) {
        let first = bpb.fat_start_sector + copy * fat_size_sectors;
        for sector in 0..fat_size_sectors {
            device.write_sectors(lun, SectorNbr(first + sector), &zero)?;
        }
        let mut head = vec![0_u8; SECTOR_SIZE];
        head[0..4].copy_from_slice(&(0x0FFF_FF00 | u32::from(MEDIA_FIXED)).to_le_bytes());
        head[4..8].copy_from_slice(&FAT_ENTRY_MASK.to_le_bytes());
        head[8..12].copy_from_slice(&FAT_EOC.to_le_bytes());
        device.write_sectors(lun, SectorNbr(first), &head)?;
    }

    // Empty root directory.
    for sector in 0..u32::from(spc) {
        device.write_sectors(lun, SectorNbr(data_start + sector), &zero)?;
    }

    info!(
        event = "volume_formatted",
        total_sectors,
        sectors_per_cluster = spc,
        cluster_count,
        fat_size_sectors
    );
    Ok(())
}

fn encode_fsinfo_sector() -> Vec<u8> {
    let mut sector = vec![0_u8; SECTOR_SIZE];
    sector[0..4].copy_from_slice(&0x4161_5252_u32.to_le_bytes());
    sector[484..488].copy_from_slice(&0x6141_7272_u32.to_le_bytes());
    // Free count and next-free hint left unknown; readers recompute.
    sector[488..492].copy_from_slice(&u32::MAX.to_le_bytes());
    sector[492..496].copy_from_slice(&u32::MAX.to_le_bytes());
    sector[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
    sector
}

fn volume_id_from(label: &[u8; 11], total_sectors: u32) -> u32 {
    // FNV-1a over the label, mixed with the geometry. Deterministic ids
    // keep test images reproducible.
    let mut hash = 0x811C_9DC5_u32;
    for byte in label {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash ^ total_sectors
}
