#![forbid(unsafe_code)]
//! FAT32 volume layer for RawSpool.
//!
//! Implements the slice of a FAT filesystem the partial-file writer needs:
//! mounting, 8.3 path resolution, exact-size contiguous allocation,
//! chain-contiguity testing, cluster→LBA resolution, and descriptor pins
//! that hold files against deletion while re-identifying the medium on
//! every poke. Long names, FAT12/16, and general read/write file I/O are
//! out of scope; payload bytes reach the medium through the raw sector
//! path, not through this crate.

pub mod bpb;
pub mod dir;
mod mkfs;

pub use mkfs::{FormatOptions, format_volume};

use crate::bpb::FatBpb;
use crate::dir::{
    ATTR_ARCHIVE, ATTR_DIRECTORY, DIR_ENTRY_SIZE, ENTRY_DELETED, RawDirEntry, ShortName,
};
use parking_lot::Mutex;
use rsp_block::SectorDevice;
use rsp_core::{ExtentFs, FileExtent, MediumPin};
use rsp_error::{Result, RspError};
use rsp_types::{LunNbr, MediumId, SECTOR_SIZE, SectorNbr};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const FAT_FREE: u32 = 0;
const FAT_BAD: u32 = 0x0FFF_FFF7;
/// End-of-chain mark written by this crate; anything `>= 0x0FFF_FFF8` reads
/// as end of chain.
pub(crate) const FAT_EOC: u32 = 0x0FFF_FFFF;
const FAT_EOC_MIN: u32 = 0x0FFF_FFF8;
/// FAT32 entries carry 28 significant bits; the top nibble is preserved.
pub(crate) const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;
const FAT_ENTRIES_PER_SECTOR: u32 = (SECTOR_SIZE / 4) as u32;

/// Largest file size the on-disk format can record.
const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// Location of a 32-byte directory entry on the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DirEntryLocation {
    sector: SectorNbr,
    offset: usize,
}

/// An open file: where its directory entry lives and what it says.
#[derive(Debug, Clone)]
pub struct FatFileDesc {
    path: String,
    entry: DirEntryLocation,
    first_cluster: u32,
    size: u64,
}

impl FatFileDesc {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }
}

/// Read-only descriptor pinning one file.
///
/// While alive, `remove` on the same path is refused, so the file's extent
/// cannot be freed and reallocated under an in-progress raw write. `poke`
/// re-reads the medium identity and compares it with the identity recorded
/// at mount, which is what invalidates the pin across an unplug.
pub struct FatPin<D: SectorDevice> {
    device: Arc<D>,
    lun: LunNbr,
    recorded: MediumId,
    path: String,
    pins: Arc<Mutex<HashMap<String, usize>>>,
}

impl<D: SectorDevice> MediumPin for FatPin<D> {
    fn poke(&self) -> Result<()> {
        let current = self.device.medium_id(self.lun)?;
        if current != self.recorded {
            warn!(
                event = "medium_identity_mismatch",
                recorded = %self.recorded,
                current = %current
            );
            return Err(RspError::MediumChanged);
        }
        Ok(())
    }
}

impl<D: SectorDevice> Drop for FatPin<D> {
    fn drop(&mut self) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&self.path) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.path);
            }
        }
    }
}

impl<D: SectorDevice> std::fmt::Debug for FatPin<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FatPin")
            .field("path", &self.path)
            .field("recorded", &self.recorded)
            .finish_non_exhaustive()
    }
}

/// A mounted FAT32 volume.
pub struct FatVolume<D: SectorDevice> {
    device: Arc<D>,
    lun: LunNbr,
    bpb: FatBpb,
    medium: MediumId,
    pins: Arc<Mutex<HashMap<String, usize>>>,
}

impl<D: SectorDevice> FatVolume<D> {
    /// Mount the volume on `lun`, recording the medium identity.
    pub fn mount(device: Arc<D>, lun: LunNbr) -> Result<Self> {
        if device.sector_size() != SECTOR_SIZE {
            return Err(RspError::Format(format!(
                "device sector size {} does not match {SECTOR_SIZE}",
                device.sector_size()
            )));
        }

        let mut boot = vec![0_u8; SECTOR_SIZE];
        device.read_sectors(lun, SectorNbr(0), &mut boot)?;
        let bpb = FatBpb::parse(&boot)?;
        if u64::from(bpb.total_sectors) > device.num_sectors(lun)? {
            return Err(RspError::Format(format!(
                "volume claims {} sectors but the medium has {}",
                bpb.total_sectors,
                device.num_sectors(lun)?
            )));
        }

        let medium = device.medium_id(lun)?;
        info!(
            event = "volume_mounted",
            lun = %lun,
            medium = %medium,
            cluster_count = bpb.cluster_count,
            sectors_per_cluster = bpb.sectors_per_cluster
        );
        Ok(Self {
            device,
            lun,
            bpb,
            medium,
            pins: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    #[must_use]
    pub fn bpb(&self) -> &FatBpb {
        &self.bpb
    }

    #[must_use]
    pub fn lun(&self) -> LunNbr {
        self.lun
    }

    // ── Sector I/O ──────────────────────────────────────────────────────

    fn read_sector(&self, sector: SectorNbr) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; SECTOR_SIZE];
        self.device.read_sectors(self.lun, sector, &mut buf)?;
        Ok(buf)
    }

    fn write_sector(&self, sector: SectorNbr, buf: &[u8]) -> Result<()> {
        self.device.write_sectors(self.lun, sector, buf)
    }

    // ── FAT access ──────────────────────────────────────────────────────

    fn fat_location(&self, cluster: u32) -> (SectorNbr, usize) {
        let sector = self.bpb.fat_start_sector + cluster / FAT_ENTRIES_PER_SECTOR;
        let offset = (cluster % FAT_ENTRIES_PER_SECTOR) as usize * 4;
        (SectorNbr(sector), offset)
    }

    fn fat_entry(&self, cluster: u32) -> Result<u32> {
        let (sector, offset) = self.fat_location(cluster);
        let buf = self.read_sector(sector)?;
        let raw = u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]);
        Ok(raw & FAT_ENTRY_MASK)
    }

    /// Write a FAT entry, keeping every FAT copy in step and preserving the
    /// reserved top nibble.
    fn set_fat_entry(&self, cluster: u32, value: u32) -> Result<()> {
        let (first_copy, offset) = self.fat_location(cluster);
        for copy in 0..u32::from(self.bpb.num_fats) {
            let sector = SectorNbr(first_copy.0 + copy * self.bpb.fat_size_sectors);
            let mut buf = self.read_sector(sector)?;
            let old = u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]);
            let new = (old & !FAT_ENTRY_MASK) | (value & FAT_ENTRY_MASK);
            buf[offset..offset + 4].copy_from_slice(&new.to_le_bytes());
            self.write_sector(sector, &buf)?;
        }
        Ok(())
    }

    /// Next cluster in the chain, `None` at end of chain.
    fn next_in_chain(&self, cluster: u32) -> Result<Option<u32>> {
        let entry = self.fat_entry(cluster)?;
        if entry >= FAT_EOC_MIN {
            return Ok(None);
        }
        if entry == FAT_BAD || entry < 2 || entry >= self.bpb.cluster_limit() {
            return Err(RspError::Format(format!(
                "corrupt FAT chain: cluster {cluster} points at {entry:#x}"
            )));
        }
        Ok(Some(entry))
    }

    /// Whether a chain occupies consecutive cluster numbers.
    ///
    /// Empty files are trivially contiguous. The walk is bounded by the
    /// cluster count so a cyclic chain reports corruption instead of
    /// spinning.
    pub fn is_chain_contiguous(&self, first_cluster: u32) -> Result<bool> {
        if first_cluster == 0 {
            return Ok(true);
        }
        let mut cluster = first_cluster;
        let mut steps = 0_u32;
        while let Some(next) = self.next_in_chain(cluster)? {
            if next != cluster + 1 {
                return Ok(false);
            }
            cluster = next;
            steps += 1;
            if steps > self.bpb.cluster_count {
                return Err(RspError::Format(format!(
                    "FAT chain starting at {first_cluster} exceeds the cluster count"
                )));
            }
        }
        Ok(true)
    }

    /// Allocate a run of `count` consecutive free clusters and link it,
    /// terminating with the end-of-chain mark. Scans the FAT one sector at
    /// a time; fails with `NoSpace` when no run is long enough.
    fn alloc_contiguous_clusters(&self, count: u32) -> Result<u32> {
        debug_assert!(count > 0);
        let limit = self.bpb.cluster_limit();
        let mut run_start = 0_u32;
        let mut run_len = 0_u32;
        let mut loaded_sector = u32::MAX;
        let mut buf = Vec::new();

        for cluster in 2..limit {
            let sector_index = cluster / FAT_ENTRIES_PER_SECTOR;
            if sector_index != loaded_sector {
                buf = self.read_sector(SectorNbr(self.bpb.fat_start_sector + sector_index))?;
                loaded_sector = sector_index;
            }
            let offset = (cluster % FAT_ENTRIES_PER_SECTOR) as usize * 4;
            let entry = u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
                & FAT_ENTRY_MASK;

            if entry == FAT_FREE {
                if run_len == 0 {
                    run_start = cluster;
                }
                run_len += 1;
                if run_len == count {
                    for i in 0..count {
                        let value = if i + 1 == count { FAT_EOC } else { run_start + i + 1 };
                        self.set_fat_entry(run_start + i, value)?;
                    }
                    debug!(event = "extent_allocated", first_cluster = run_start, clusters = count);
                    return Ok(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        Err(RspError::NoSpace)
    }

    fn free_chain(&self, first_cluster: u32) -> Result<()> {
        let mut cluster = first_cluster;
        let mut steps = 0_u32;
        loop {
            let next = self.next_in_chain(cluster)?;
            self.set_fat_entry(cluster, FAT_FREE)?;
            match next {
                Some(next) => cluster = next,
                None => return Ok(()),
            }
            steps += 1;
            if steps > self.bpb.cluster_count {
                return Err(RspError::Format(format!(
                    "FAT chain starting at {first_cluster} exceeds the cluster count"
                )));
            }
        }
    }

    // ── Directories ─────────────────────────────────────────────────────

    fn dir_chain(&self, first_cluster: u32) -> Result<Vec<u32>> {
        let mut clusters = vec![first_cluster];
        let mut cluster = first_cluster;
        while let Some(next) = self.next_in_chain(cluster)? {
            clusters.push(next);
            cluster = next;
            if clusters.len() as u32 > self.bpb.cluster_count {
                return Err(RspError::Format("cyclic directory chain".to_owned()));
            }
        }
        Ok(clusters)
    }

    fn find_in_dir(
        &self,
        dir_cluster: u32,
        name: &ShortName,
    ) -> Result<Option<(DirEntryLocation, RawDirEntry)>> {
        for cluster in self.dir_chain(dir_cluster)? {
            let base = self.bpb.cluster_to_lba(cluster);
            for sector_index in 0..u32::from(self.bpb.sectors_per_cluster) {
                let sector = SectorNbr(base.0 + sector_index);
                let buf = self.read_sector(sector)?;
                for offset in (0..SECTOR_SIZE).step_by(DIR_ENTRY_SIZE) {
                    let entry = RawDirEntry::parse(&buf[offset..offset + DIR_ENTRY_SIZE])?;
                    if entry.is_end() {
                        return Ok(None);
                    }
                    if entry.is_deleted() || entry.is_long_name() || entry.is_volume_label() {
                        continue;
                    }
                    if entry.name == *name {
                        return Ok(Some((DirEntryLocation { sector, offset }, entry)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// First reusable slot in the directory, extending the chain by one
    /// zeroed cluster when it is full.
    fn find_free_dir_slot(&self, dir_cluster: u32) -> Result<DirEntryLocation> {
        let chain = self.dir_chain(dir_cluster)?;
        for &cluster in &chain {
            let base = self.bpb.cluster_to_lba(cluster);
            for sector_index in 0..u32::from(self.bpb.sectors_per_cluster) {
                let sector = SectorNbr(base.0 + sector_index);
                let buf = self.read_sector(sector)?;
                for offset in (0..SECTOR_SIZE).step_by(DIR_ENTRY_SIZE) {
                    let first_byte = buf[offset];
                    if first_byte == ENTRY_DELETED || first_byte == dir::ENTRY_END {
                        return Ok(DirEntryLocation { sector, offset });
                    }
                }
            }
        }

        let grown = self.alloc_contiguous_clusters(1)?;
        self.zero_cluster(grown)?;
        let last = *chain.last().unwrap_or(&dir_cluster);
        self.set_fat_entry(last, grown)?;
        Ok(DirEntryLocation {
            sector: self.bpb.cluster_to_lba(grown),
            offset: 0,
        })
    }

    fn zero_cluster(&self, cluster: u32) -> Result<()> {
        let zero = vec![0_u8; SECTOR_SIZE];
        let base = self.bpb.cluster_to_lba(cluster);
        for sector_index in 0..u32::from(self.bpb.sectors_per_cluster) {
            self.write_sector(SectorNbr(base.0 + sector_index), &zero)?;
        }
        Ok(())
    }

    fn write_dir_entry(&self, location: DirEntryLocation, entry: &RawDirEntry) -> Result<()> {
        let mut buf = self.read_sector(location.sector)?;
        buf[location.offset..location.offset + DIR_ENTRY_SIZE].copy_from_slice(&entry.encode());
        self.write_sector(location.sector, &buf)
    }

    fn read_dir_entry(&self, location: DirEntryLocation) -> Result<RawDirEntry> {
        let buf = self.read_sector(location.sector)?;
        RawDirEntry::parse(&buf[location.offset..location.offset + DIR_ENTRY_SIZE])
    }

    /// Split a path into parent components and the final name.
    fn split_path(path: &str) -> Result<(Vec<&str>, &str)> {
        let mut components: Vec<&str> = path
            .split('/')
            .filter(|component| !component.is_empty())
            .collect();
        let Some(name) = components.pop() else {
            return Err(RspError::Format(format!("empty path {path:?}")));
        };
        Ok((components, name))
    }

    /// Walk parent components from the root, returning the directory's
    /// first cluster.
    fn resolve_dir(&self, components: &[&str]) -> Result<u32> {
        let mut cluster = self.bpb.root_cluster;
        for component in components {
            let name = ShortName::encode(component)?;
            let Some((_, entry)) = self.find_in_dir(cluster, &name)? else {
                return Err(RspError::NotFound((*component).to_owned()));
            };
            if !entry.is_directory() {
                return Err(RspError::Format(format!("{component} is not a directory")));
            }
            // A ".."-style zero cluster refers back to the root.
            cluster = if entry.first_cluster < 2 {
                self.bpb.root_cluster
            } else {
                entry.first_cluster
            };
        }
        Ok(cluster)
    }

    // ── Files ───────────────────────────────────────────────────────────

    /// Look up an existing file.
    pub fn lookup(&self, path: &str) -> Result<FatFileDesc> {
        let (parents, name) = Self::split_path(path)?;
        let dir_cluster = self.resolve_dir(&parents)?;
        let short = ShortName::encode(name)?;
        let Some((location, entry)) = self.find_in_dir(dir_cluster, &short)? else {
            return Err(RspError::NotFound(path.to_owned()));
        };
        if entry.is_directory() {
            return Err(RspError::Format(format!("{path} is a directory")));
        }
        Ok(FatFileDesc {
            path: path.to_owned(),
            entry: location,
            first_cluster: entry.first_cluster,
            size: u64::from(entry.size),
        })
    }

    /// Create a file, truncating an existing unpinned one.
    pub fn create_file(&self, path: &str) -> Result<FatFileDesc> {
        if self.pins.lock().contains_key(path) {
            return Err(RspError::Pinned(path.to_owned()));
        }
        let (parents, name) = Self::split_path(path)?;
        let dir_cluster = self.resolve_dir(&parents)?;
        let short = ShortName::encode(name)?;

        let location = match self.find_in_dir(dir_cluster, &short)? {
            Some((location, entry)) => {
                if entry.is_directory() {
                    return Err(RspError::Format(format!("{path} is a directory")));
                }
                if entry.first_cluster >= 2 {
                    self.free_chain(entry.first_cluster)?;
                }
                location
            }
            None => self.find_free_dir_slot(dir_cluster)?,
        };

        let entry = RawDirEntry {
            name: short,
            attr: ATTR_ARCHIVE,
            first_cluster: 0,
            size: 0,
        };
        self.write_dir_entry(location, &entry)?;
        debug!(event = "file_created", path);
        Ok(FatFileDesc {
            path: path.to_owned(),
            entry: location,
            first_cluster: 0,
            size: 0,
        })
    }

    /// Create a subdirectory with its `.` and `..` entries.
    pub fn create_dir(&self, path: &str) -> Result<()> {
        let (parents, name) = Self::split_path(path)?;
        let parent_cluster = self.resolve_dir(&parents)?;
        let short = ShortName::encode(name)?;
        if self.find_in_dir(parent_cluster, &short)?.is_some() {
            return Err(RspError::Exists);
        }

        let cluster = self.alloc_contiguous_clusters(1)?;
        self.zero_cluster(cluster)?;

        let dot = RawDirEntry {
            name: ShortName(*b".          "),
            attr: ATTR_DIRECTORY,
            first_cluster: cluster,
            size: 0,
        };
        // ".." pointing at the root is recorded as cluster 0.
        let parent_ref = if parent_cluster == self.bpb.root_cluster {
            0
        } else {
            parent_cluster
        };
        let dotdot = RawDirEntry {
            name: ShortName(*b"..         "),
            attr: ATTR_DIRECTORY,
            first_cluster: parent_ref,
            size: 0,
        };
        let base = self.bpb.cluster_to_lba(cluster);
        let mut buf = self.read_sector(base)?;
        buf[..DIR_ENTRY_SIZE].copy_from_slice(&dot.encode());
        buf[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(&dotdot.encode());
        self.write_sector(base, &buf)?;

        let location = self.find_free_dir_slot(parent_cluster)?;
        let entry = RawDirEntry {
            name: short,
            attr: ATTR_DIRECTORY,
            first_cluster: cluster,
            size: 0,
        };
        self.write_dir_entry(location, &entry)?;
        debug!(event = "directory_created", path);
        Ok(())
    }

    /// Remove a file: free its chain and mark the entry deleted.
    ///
    /// Refused while any descriptor pin is held on the path.
    pub fn remove_file(&self, path: &str) -> Result<()> {
        if self.pins.lock().contains_key(path) {
            warn!(event = "remove_refused_pinned", path);
            return Err(RspError::Pinned(path.to_owned()));
        }
        let desc = self.lookup(path)?;
        if desc.first_cluster >= 2 {
            self.free_chain(desc.first_cluster)?;
        }
        let mut entry = self.read_dir_entry(desc.entry)?;
        entry.name.0[0] = ENTRY_DELETED;
        self.write_dir_entry(desc.entry, &entry)?;
        debug!(event = "file_removed", path);
        Ok(())
    }

    /// Allocate exactly `size` bytes of contiguous space for a still-empty
    /// file and record the size in its directory entry, so the extent is
    /// committed before any payload byte arrives.
    pub fn allocate_file_contiguous(&self, desc: &mut FatFileDesc, size: u64) -> Result<()> {
        if desc.first_cluster != 0 {
            return Err(RspError::Format(format!(
                "{} already has an allocation",
                desc.path
            )));
        }
        if size == 0 {
            return Err(RspError::Format("cannot allocate an empty extent".to_owned()));
        }
        if size > MAX_FILE_SIZE {
            return Err(RspError::NoSpace);
        }

        let clusters = u32::try_from(size.div_ceil(u64::from(self.bpb.cluster_bytes())))
            .map_err(|_| RspError::NoSpace)?;
        let first_cluster = self.alloc_contiguous_clusters(clusters)?;

        let mut entry = self.read_dir_entry(desc.entry)?;
        entry.first_cluster = first_cluster;
        entry.size = size as u32;
        self.write_dir_entry(desc.entry, &entry)?;

        desc.first_cluster = first_cluster;
        desc.size = size;
        Ok(())
    }

    /// Resolve (LUN, first LBA, size) from the cluster bookkeeping.
    pub fn file_extent(&self, desc: &FatFileDesc) -> Result<FileExtent> {
        if desc.first_cluster < 2 {
            return Err(RspError::Format(format!("{} has no allocation", desc.path)));
        }
        Ok(FileExtent {
            lun: self.lun,
            first_sector: self.bpb.cluster_to_lba(desc.first_cluster),
            size_bytes: desc.size,
        })
    }

    /// Take a read-only descriptor pin on `path`.
    pub fn pin(&self, path: &str) -> Result<FatPin<D>> {
        // Existence check doubles as a directory rejection.
        let _ = self.lookup(path)?;
        *self.pins.lock().entry(path.to_owned()).or_insert(0) += 1;
        Ok(FatPin {
            device: Arc::clone(&self.device),
            lun: self.lun,
            recorded: self.medium,
            path: path.to_owned(),
            pins: Arc::clone(&self.pins),
        })
    }
}

impl<D: SectorDevice> std::fmt::Debug for FatVolume<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FatVolume")
            .field("lun", &self.lun)
            .field("medium", &self.medium)
            .field("cluster_count", &self.bpb.cluster_count)
            .finish_non_exhaustive()
    }
}

impl<D: SectorDevice> ExtentFs for FatVolume<D> {
    type File = FatFileDesc;
    type Pin = FatPin<D>;

    fn create(&self, path: &str) -> Result<Self::File> {
        self.create_file(path)
    }

    fn open_rw(&self, path: &str) -> Result<Self::File> {
        self.lookup(path)
    }

    fn allocate_contiguous(&self, file: &mut Self::File, size: u64) -> Result<()> {
        self.allocate_file_contiguous(file, size)
    }

    fn is_contiguous(&self, file: &Self::File) -> Result<bool> {
        self.is_chain_contiguous(file.first_cluster)
    }

    fn extent_of(&self, file: &Self::File) -> Result<FileExtent> {
        self.file_extent(file)
    }

    fn close(&self, _file: Self::File) -> Result<()> {
        Ok(())
    }

    fn pin_read_only(&self, path: &str) -> Result<Self::Pin> {
        self.pin(path)
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.remove_file(path)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rsp_block::MemSectorDevice;

    fn fresh_volume(sectors: u64) -> FatVolume<MemSectorDevice> {
        let device = Arc::new(MemSectorDevice::new(sectors));
        format_volume(device.as_ref(), LunNbr(0), FormatOptions::default()).unwrap();
        FatVolume::mount(device, LunNbr(0)).unwrap()
    }

    #[test]
    fn format_then_mount_round_trips_geometry() {
        let volume = fresh_volume(2048);
        let bpb = volume.bpb();
        assert_eq!(bpb.sectors_per_cluster, 1);
        assert_eq!(bpb.root_cluster, 2);
        assert!(bpb.cluster_count > 0);
        assert_eq!(
            bpb.data_start_sector,
            u32::from(bpb.reserved_sectors) + u32::from(bpb.num_fats) * bpb.fat_size_sectors
        );
    }

    #[test]
    fn create_allocate_resolves_extent_lba() {
        let volume = fresh_volume(2048);
        let mut desc = volume.create_file("job.gco").unwrap();
        volume.allocate_file_contiguous(&mut desc, 1500).unwrap();

        // 1500 bytes in 512-byte clusters: three clusters, first one is the
        // lowest free cluster after the root directory.
        assert_eq!(desc.first_cluster(), 3);
        let extent = volume.file_extent(&desc).unwrap();
        assert_eq!(extent.size_bytes, 1500);
        assert_eq!(
            extent.first_sector,
            volume.bpb().cluster_to_lba(desc.first_cluster())
        );
        assert!(volume.is_chain_contiguous(desc.first_cluster()).unwrap());

        // The directory entry records the allocation.
        let reloaded = volume.lookup("job.gco").unwrap();
        assert_eq!(reloaded.first_cluster(), 3);
        assert_eq!(reloaded.size(), 1500);
    }

    #[test]
    fn allocation_skips_occupied_runs() {
        let volume = fresh_volume(2048);
        let mut first = volume.create_file("a.gco").unwrap();
        volume.allocate_file_contiguous(&mut first, 1024).unwrap();
        let mut second = volume.create_file("b.gco").unwrap();
        volume.allocate_file_contiguous(&mut second, 1024).unwrap();

        assert_eq!(first.first_cluster(), 3);
        assert_eq!(second.first_cluster(), 5);
        assert!(volume.is_chain_contiguous(second.first_cluster()).unwrap());
    }

    #[test]
    fn allocation_refuses_when_no_run_fits() {
        let volume = fresh_volume(256);
        let free_bytes = u64::from(volume.bpb().cluster_count) * 512;
        let mut desc = volume.create_file("big.gco").unwrap();
        let err = volume
            .allocate_file_contiguous(&mut desc, free_bytes + 512)
            .unwrap_err();
        assert!(matches!(err, RspError::NoSpace));
    }

    #[test]
    fn fragmented_chain_is_detected() {
        let volume = fresh_volume(2048);
        let mut desc = volume.create_file("frag.bin").unwrap();
        volume.allocate_file_contiguous(&mut desc, 1024).unwrap();
        assert!(volume.is_chain_contiguous(desc.first_cluster()).unwrap());

        // Splice a detour into the chain: first → far cluster → original
        // second cluster.
        let first = desc.first_cluster();
        volume.set_fat_entry(first, 40).unwrap();
        volume.set_fat_entry(40, first + 1).unwrap();
        assert!(!volume.is_chain_contiguous(first).unwrap());
    }

    #[test]
    fn removed_file_frees_its_clusters_for_reuse() {
        let volume = fresh_volume(2048);
        let mut desc = volume.create_file("tmp.bin").unwrap();
        volume.allocate_file_contiguous(&mut desc, 2048).unwrap();
        let reused_cluster = desc.first_cluster();
        volume.remove_file("tmp.bin").unwrap();
        assert!(matches!(
            volume.lookup("tmp.bin"),
            Err(RspError::NotFound(_))
        ));

        let mut next = volume.create_file("next.bin").unwrap();
        volume.allocate_file_contiguous(&mut next, 512).unwrap();
        assert_eq!(next.first_cluster(), reused_cluster);
    }

    #[test]
    fn create_truncates_existing_file() {
        let volume = fresh_volume(2048);
        let mut desc = volume.create_file("job.gco").unwrap();
        volume.allocate_file_contiguous(&mut desc, 4096).unwrap();

        let recreated = volume.create_file("job.gco").unwrap();
        assert_eq!(recreated.first_cluster(), 0);
        assert_eq!(recreated.size(), 0);
        // The freed run is allocatable again.
        let mut other = volume.create_file("other.gco").unwrap();
        volume.allocate_file_contiguous(&mut other, 4096).unwrap();
        assert_eq!(other.first_cluster(), 3);
    }

    #[test]
    fn nested_directories_resolve() {
        let volume = fresh_volume(4096);
        volume.create_dir("jobs").unwrap();
        volume.create_dir("jobs/queue").unwrap();
        let mut desc = volume.create_file("jobs/queue/part.gco").unwrap();
        volume.allocate_file_contiguous(&mut desc, 512).unwrap();

        let found = volume.lookup("jobs/queue/part.gco").unwrap();
        assert_eq!(found.first_cluster(), desc.first_cluster());
        assert!(matches!(
            volume.lookup("jobs/missing/part.gco"),
            Err(RspError::NotFound(_))
        ));
        assert!(matches!(volume.lookup("jobs"), Err(RspError::Format(_))));
    }

    #[test]
    fn directory_grows_past_one_cluster() {
        let volume = fresh_volume(8192);
        // One 512-byte cluster holds 16 entries; create more than that.
        for i in 0..40 {
            volume.create_file(&format!("f{i}.bin")).unwrap();
        }
        for i in 0..40 {
            volume.lookup(&format!("f{i}.bin")).unwrap();
        }
    }

    #[test]
    fn deleted_slots_are_reused_before_growing() {
        let volume = fresh_volume(2048);
        volume.create_file("a.bin").unwrap();
        volume.create_file("b.bin").unwrap();
        volume.remove_file("a.bin").unwrap();
        volume.create_file("c.bin").unwrap();
        // Both survivors resolve; the volume did not need a second
        // directory cluster for three ever-created names.
        volume.lookup("b.bin").unwrap();
        volume.lookup("c.bin").unwrap();
    }

    #[test]
    fn pin_refuses_removal_and_poke_tracks_medium() {
        let device = Arc::new(MemSectorDevice::new(2048));
        format_volume(device.as_ref(), LunNbr(0), FormatOptions::default()).unwrap();
        let volume = FatVolume::mount(Arc::clone(&device), LunNbr(0)).unwrap();
        let mut desc = volume.create_file("job.gco").unwrap();
        volume.allocate_file_contiguous(&mut desc, 512).unwrap();

        let pin = volume.pin("job.gco").unwrap();
        assert!(matches!(
            volume.remove_file("job.gco"),
            Err(RspError::Pinned(_))
        ));
        pin.poke().unwrap();

        device.swap_medium();
        assert!(matches!(pin.poke(), Err(RspError::MediumChanged)));

        drop(pin);
        volume.remove_file("job.gco").unwrap();
    }

    #[test]
    fn mount_rejects_oversized_bpb_claim() {
        let device = Arc::new(MemSectorDevice::new(512));
        format_volume(device.as_ref(), LunNbr(0), FormatOptions::default()).unwrap();
        // Remount against a smaller medium than the BPB records.
        let small = Arc::new(MemSectorDevice::new(64));
        let mut boot = vec![0_u8; SECTOR_SIZE];
        device.read_sectors(LunNbr(0), SectorNbr(0), &mut boot).unwrap();
        small.write_sectors(LunNbr(0), SectorNbr(0), &boot).unwrap();
        assert!(FatVolume::mount(small, LunNbr(0)).is_err());
    }
}
