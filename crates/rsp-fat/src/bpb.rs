//! FAT32 BIOS parameter block: parsing, validation, and derived geometry.

use rsp_error::{Result, RspError};
use rsp_types::{ParseError, SECTOR_SIZE, SectorNbr, read_fixed, read_le_u16, read_le_u32};
use serde::Serialize;

// Boot-sector field offsets.
const BPB_BYTES_PER_SECTOR: usize = 11;
const BPB_SECTORS_PER_CLUSTER: usize = 13;
const BPB_RESERVED_SECTORS: usize = 14;
const BPB_NUM_FATS: usize = 16;
const BPB_ROOT_ENTRIES_16: usize = 17;
const BPB_TOTAL_SECTORS_16: usize = 19;
const BPB_MEDIA: usize = 21;
const BPB_FAT_SIZE_16: usize = 22;
const BPB_TOTAL_SECTORS_32: usize = 32;
const BPB_FAT_SIZE_32: usize = 36;
const BPB_FS_VERSION: usize = 42;
const BPB_ROOT_CLUSTER: usize = 44;
const BPB_FSINFO_SECTOR: usize = 48;
const BPB_BACKUP_BOOT_SECTOR: usize = 50;
const BPB_VOLUME_ID: usize = 67;
const BPB_VOLUME_LABEL: usize = 71;
const BPB_SIGNATURE: usize = 510;

pub(crate) const BOOT_SIGNATURE: u16 = 0xAA55;

/// Parsed FAT32 BIOS parameter block with derived geometry.
///
/// Only FAT32 layouts are accepted: `fat_size_16` and the FAT16 root
/// directory fields must be zero, and the cluster heap must be addressable
/// through the 32-bit FAT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatBpb {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub media: u8,
    pub total_sectors: u32,
    pub fat_size_sectors: u32,
    pub root_cluster: u32,
    pub fsinfo_sector: u16,
    pub backup_boot_sector: u16,
    pub volume_id: u32,
    pub volume_label: [u8; 11],

    // ── Derived geometry ─────────────────────────────────────────────────
    /// First sector of the first FAT copy.
    pub fat_start_sector: u32,
    /// First sector of the cluster heap (FatFs calls this `database`).
    pub data_start_sector: u32,
    /// Number of data clusters (cluster numbers 2..2+count).
    pub cluster_count: u32,
}

impl FatBpb {
    /// Parse and validate a boot sector.
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < SECTOR_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SECTOR_SIZE,
                offset: 0,
                actual: sector.len(),
            }
            .into());
        }

        let signature = read_le_u16(sector, BPB_SIGNATURE)?;
        if signature != BOOT_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(BOOT_SIGNATURE),
                actual: u64::from(signature),
            }
            .into());
        }

        let bytes_per_sector = read_le_u16(sector, BPB_BYTES_PER_SECTOR)?;
        if usize::from(bytes_per_sector) != SECTOR_SIZE {
            return Err(RspError::Format(format!(
                "volume sector size {bytes_per_sector} does not match the block layer's {SECTOR_SIZE}"
            )));
        }

        let sectors_per_cluster = sector[BPB_SECTORS_PER_CLUSTER];
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectors_per_cluster",
                reason: "must be a power of two",
            }
            .into());
        }

        let fat_size_16 = read_le_u16(sector, BPB_FAT_SIZE_16)?;
        let root_entries_16 = read_le_u16(sector, BPB_ROOT_ENTRIES_16)?;
        let total_sectors_16 = read_le_u16(sector, BPB_TOTAL_SECTORS_16)?;
        if fat_size_16 != 0 || root_entries_16 != 0 || total_sectors_16 != 0 {
            return Err(RspError::Format(
                "volume is FAT12/FAT16; only FAT32 is supported".to_owned(),
            ));
        }

        let fs_version = read_le_u16(sector, BPB_FS_VERSION)?;
        if fs_version != 0 {
            return Err(ParseError::InvalidField {
                field: "fs_version",
                reason: "unsupported FAT32 revision",
            }
            .into());
        }

        let reserved_sectors = read_le_u16(sector, BPB_RESERVED_SECTORS)?;
        let num_fats = sector[BPB_NUM_FATS];
        if reserved_sectors == 0 || num_fats == 0 {
            return Err(ParseError::InvalidField {
                field: "reserved_sectors",
                reason: "reserved region and FAT count must be nonzero",
            }
            .into());
        }

        let total_sectors = read_le_u32(sector, BPB_TOTAL_SECTORS_32)?;
        let fat_size_sectors = read_le_u32(sector, BPB_FAT_SIZE_32)?;
        let root_cluster = read_le_u32(sector, BPB_ROOT_CLUSTER)?;
        if root_cluster < 2 {
            return Err(ParseError::InvalidField {
                field: "root_cluster",
                reason: "must be at least 2",
            }
            .into());
        }

        let fat_start_sector = u32::from(reserved_sectors);
        let fat_region = u32::from(num_fats)
            .checked_mul(fat_size_sectors)
            .ok_or(ParseError::InvalidField {
                field: "fat_size_32",
                reason: "FAT region overflows",
            })?;
        let data_start_sector =
            fat_start_sector
                .checked_add(fat_region)
                .ok_or(ParseError::InvalidField {
                    field: "fat_size_32",
                    reason: "data region start overflows",
                })?;
        if data_start_sector >= total_sectors {
            return Err(ParseError::InvalidField {
                field: "total_sectors_32",
                reason: "no room for a cluster heap",
            }
            .into());
        }

        let cluster_count = (total_sectors - data_start_sector) / u32::from(sectors_per_cluster);
        if cluster_count == 0 {
            return Err(ParseError::InvalidField {
                field: "total_sectors_32",
                reason: "cluster heap is empty",
            }
            .into());
        }
        // Every cluster must be addressable through the 32-bit FAT.
        let fat_capacity = fat_size_sectors
            .saturating_mul((SECTOR_SIZE / 4) as u32)
            .saturating_sub(2);
        if cluster_count > fat_capacity {
            return Err(ParseError::InvalidField {
                field: "fat_size_32",
                reason: "FAT too small for the cluster heap",
            }
            .into());
        }

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            media: sector[BPB_MEDIA],
            total_sectors,
            fat_size_sectors,
            root_cluster,
            fsinfo_sector: read_le_u16(sector, BPB_FSINFO_SECTOR)?,
            backup_boot_sector: read_le_u16(sector, BPB_BACKUP_BOOT_SECTOR)?,
            volume_id: read_le_u32(sector, BPB_VOLUME_ID)?,
            volume_label: read_fixed(sector, BPB_VOLUME_LABEL)?,
            fat_start_sector,
            data_start_sector,
            cluster_count,
        })
    }

    /// Bytes per cluster.
    #[must_use]
    pub fn cluster_bytes(&self) -> u32 {
        u32::from(self.bytes_per_sector) * u32::from(self.sectors_per_cluster)
    }

    /// First LBA of a data cluster (`data_start + spc · (cluster − 2)`).
    #[must_use]
    pub fn cluster_to_lba(&self, cluster: u32) -> SectorNbr {
        debug_assert!(cluster >= 2);
        SectorNbr(self.data_start_sector + u32::from(self.sectors_per_cluster) * (cluster - 2))
    }

    /// Highest valid cluster number plus one.
    #[must_use]
    pub fn cluster_limit(&self) -> u32 {
        2 + self.cluster_count
    }
}

/// Serialize a boot sector from geometry chosen by `mkfs`.
pub(crate) fn encode_boot_sector(bpb: &FatBpb) -> Vec<u8> {
    let mut sector = vec![0_u8; SECTOR_SIZE];
    // Jump stub and OEM name keep picky host drivers from rejecting the
    // volume.
    sector[0] = 0xEB;
    sector[1] = 0x58;
    sector[2] = 0x90;
    sector[3..11].copy_from_slice(b"RAWSPOOL");

    sector[BPB_BYTES_PER_SECTOR..BPB_BYTES_PER_SECTOR + 2]
        .copy_from_slice(&bpb.bytes_per_sector.to_le_bytes());
    sector[BPB_SECTORS_PER_CLUSTER] = bpb.sectors_per_cluster;
    sector[BPB_RESERVED_SECTORS..BPB_RESERVED_SECTORS + 2]
        .copy_from_slice(&bpb.reserved_sectors.to_le_bytes());
    sector[BPB_NUM_FATS] = bpb.num_fats;
    sector[BPB_MEDIA] = bpb.media;
    sector[BPB_TOTAL_SECTORS_32..BPB_TOTAL_SECTORS_32 + 4]
        .copy_from_slice(&bpb.total_sectors.to_le_bytes());
    sector[BPB_FAT_SIZE_32..BPB_FAT_SIZE_32 + 4]
        .copy_from_slice(&bpb.fat_size_sectors.to_le_bytes());
    sector[BPB_ROOT_CLUSTER..BPB_ROOT_CLUSTER + 4]
        .copy_from_slice(&bpb.root_cluster.to_le_bytes());
    sector[BPB_FSINFO_SECTOR..BPB_FSINFO_SECTOR + 2]
        .copy_from_slice(&bpb.fsinfo_sector.to_le_bytes());
    sector[BPB_BACKUP_BOOT_SECTOR..BPB_BACKUP_BOOT_SECTOR + 2]
        .copy_from_slice(&bpb.backup_boot_sector.to_le_bytes());
    sector[64] = 0x80; // drive number
    sector[66] = 0x29; // extended boot signature
    sector[BPB_VOLUME_ID..BPB_VOLUME_ID + 4].copy_from_slice(&bpb.volume_id.to_le_bytes());
    sector[BPB_VOLUME_LABEL..BPB_VOLUME_LABEL + 11].copy_from_slice(&bpb.volume_label);
    sector[82..90].copy_from_slice(b"FAT32   ");
    sector[BPB_SIGNATURE..BPB_SIGNATURE + 2].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
    sector
}
