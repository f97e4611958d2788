#![forbid(unsafe_code)]
//! RawSpool public API facade.
//!
//! Re-exports the partial-file writer, the block layer, and the FAT32
//! volume through a stable external interface. This is the crate downstream
//! consumers (CLI, integrations) depend on.

pub use rsp_block::{
    FileSectorDevice, MemSectorDevice, POOL_SLOTS, PoolConfig, SECTOR_RW_MAX_DELAY, SectorDevice,
    SectorPool, SectorRequest,
};
pub use rsp_core::{ExtentFs, FileExtent, MediumPin, PartialFile, render_progress_bar};
pub use rsp_error::{Result, RspError};
pub use rsp_fat::{FatVolume, FormatOptions, format_volume};
pub use rsp_types::{
    LunNbr, MediumId, SECTOR_SIZE, SectorNbr, TransferState, ValidPart,
};
