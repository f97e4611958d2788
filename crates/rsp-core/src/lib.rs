#![forbid(unsafe_code)]
//! Partial-file writer core.
//!
//! `PartialFile` streams a transfer that arrives as arbitrary byte ranges
//! directly onto the sectors of a contiguously allocated file, bypassing the
//! filesystem write path while keeping a read-only descriptor pinned so the
//! extent cannot be reallocated underneath it. Progress is tracked as a
//! valid head and valid tail byte range, which together describe how much of
//! the file can be trusted after a resume.
//!
//! The filesystem is abstracted behind the [`ExtentFs`] capability set; the
//! FAT32 implementation lives in `rsp-fat`.

use rsp_block::{PoolConfig, SectorDevice, SectorPool, SectorRequest};
use rsp_error::{Result, RspError};
use rsp_types::{SECTOR_SIZE, SectorNbr, TransferState, ValidPart};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Width of the rendered progress bar, in cells.
const PROGRESS_BAR_WIDTH: u64 = 40;

// ── Filesystem contract ─────────────────────────────────────────────────────

/// Physical location of an open file's contiguous extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileExtent {
    pub lun: rsp_types::LunNbr,
    pub first_sector: SectorNbr,
    pub size_bytes: u64,
}

/// A held read-only descriptor that pins a file's extent in place.
///
/// `poke` is the cheap medium re-identification: it forces the filesystem
/// layer to verify that the medium backing the descriptor is still the one
/// recorded when the pin was taken. A position query would short-circuit
/// that check, so the pin exposes no position at all.
pub trait MediumPin: Send + Sync {
    fn poke(&self) -> Result<()>;
}

/// Capability set the writer needs from a filesystem.
///
/// Deliberately small: allocate a contiguous extent of exact size, test
/// contiguity, resolve (LUN, first LBA, size), and pin the file against
/// deletion. Everything else the filesystem can do is out of scope here.
pub trait ExtentFs {
    type File;
    type Pin: MediumPin;

    /// Create a new file in write mode.
    fn create(&self, path: &str) -> Result<Self::File>;

    /// Open an existing file read-write.
    fn open_rw(&self, path: &str) -> Result<Self::File>;

    /// Pre-allocate exactly `size` bytes of contiguous space, immediately.
    /// `NoSpace` means no contiguous run of that size exists.
    fn allocate_contiguous(&self, file: &mut Self::File, size: u64) -> Result<()>;

    /// Whether the file's data occupies consecutive sectors.
    fn is_contiguous(&self, file: &Self::File) -> Result<bool>;

    /// Resolve the file's extent from the filesystem's cluster bookkeeping.
    fn extent_of(&self, file: &Self::File) -> Result<FileExtent>;

    /// Close an open file handle.
    fn close(&self, file: Self::File) -> Result<()>;

    /// Take a read-only descriptor that pins the file's extent for the
    /// descriptor's lifetime.
    fn pin_read_only(&self, path: &str) -> Result<Self::Pin>;

    /// Remove a file. Fails with `Pinned` while a descriptor pin is held.
    fn remove(&self, path: &str) -> Result<()>;
}

// ── Valid-range maintenance ─────────────────────────────────────────────────

/// Fold a newly written range into head/tail bookkeeping.
///
/// Rules, in order: grow the head (or start it at 0), grow the tail (or
/// start it past the head), promote a head that reached the end, and unify
/// head and tail once they overlap or touch.
pub fn extend_state(state: &mut TransferState, new_part: ValidPart) {
    if let Some(head) = state.valid_head.as_mut() {
        head.merge(new_part);
    } else if new_part.start == 0 {
        state.valid_head = Some(new_part);
    }
    let head_end = state.valid_head.map_or(0, |p| p.end);

    if let Some(tail) = state.valid_tail.as_mut() {
        tail.merge(new_part);
    } else if new_part.start > head_end {
        state.valid_tail = Some(new_part);
    }

    // A head reaching the end covers the tail's job on its own.
    if let Some(head) = state.valid_head
        && head.end == state.total_size
    {
        state.valid_tail = Some(head);
    }

    if let (Some(mut head), Some(mut tail)) = (state.valid_head, state.valid_tail) {
        head.merge(tail);
        tail.merge(head);
        state.valid_head = Some(head);
        state.valid_tail = Some(tail);
    }
}

/// Render the 40-cell progress bar: leading `#`s for the head fraction,
/// trailing `#`s for the tail fraction (each rounded down), `-` elsewhere.
#[must_use]
pub fn render_progress_bar(state: &TransferState) -> String {
    let mut cells = ['-'; PROGRESS_BAR_WIDTH as usize];
    if state.total_size > 0 {
        let head_end = state.valid_head.map_or(0, |p| p.end);
        let tail_start = state.valid_tail.map_or(state.total_size, |p| p.start);
        let head_cells = (head_end * PROGRESS_BAR_WIDTH / state.total_size) as usize;
        let tail_cells =
            ((state.total_size - tail_start) * PROGRESS_BAR_WIDTH / state.total_size) as usize;
        for cell in cells.iter_mut().take(head_cells) {
            *cell = '#';
        }
        for i in 0..tail_cells {
            cells[cells.len() - 1 - i] = '#';
        }
    }
    cells.iter().collect()
}

// ── Partial file ────────────────────────────────────────────────────────────

/// Writer for one partially valid file on a raw sector device.
///
/// Single-writer: one thread calls `seek`/`write`/`sync`; sector completions
/// arrive from the device's own context and only touch the pool. Dropping
/// the writer discards any unsubmitted sector, drains in-flight writes, and
/// releases the descriptor pin, in that order.
pub struct PartialFile<D: SectorDevice, P: MediumPin> {
    device: Arc<D>,
    sector_pool: SectorPool,
    first_sector_nbr: SectorNbr,
    current_sector: Option<SectorRequest>,
    current_dirty: bool,
    current_offset: u64,
    state: TransferState,
    last_progress_percent: i32,
    pin: P,
}

impl<D: SectorDevice, P: MediumPin> PartialFile<D, P> {
    /// Create `path` with a freshly allocated contiguous extent of exactly
    /// `size` bytes and return a writer with empty progress state.
    pub fn create<F>(fs: &F, device: Arc<D>, path: &str, size: u64) -> Result<Self>
    where
        F: ExtentFs<Pin = P>,
    {
        let mut file = match fs.create(path) {
            Ok(file) => file,
            Err(err) => {
                error!(event = "partial_file_create_failed", path, error = %err);
                return Err(RspError::WriteLocation);
            }
        };

        if let Err(err) = fs.allocate_contiguous(&mut file, size) {
            error!(event = "extent_allocation_failed", path, size, error = %err);
            let _ = fs.close(file);
            let _ = fs.remove(path);
            return Err(match err {
                RspError::NoSpace => RspError::DriveFull,
                _ => RspError::PrepareFile,
            });
        }

        Self::convert(fs, device, path, file, TransferState::default())
    }

    /// Resume `path` with caller-supplied progress state. The stored
    /// `total_size` is overwritten with the file's actual size.
    pub fn open<F>(fs: &F, device: Arc<D>, path: &str, state: TransferState) -> Result<Self>
    where
        F: ExtentFs<Pin = P>,
    {
        let file = match fs.open_rw(path) {
            Ok(file) => file,
            Err(err) => {
                error!(event = "partial_file_open_failed", path, error = %err);
                return Err(RspError::OpenFile);
            }
        };
        Self::convert(fs, device, path, file, state)
    }

    fn convert<F>(
        fs: &F,
        device: Arc<D>,
        path: &str,
        file: F::File,
        mut state: TransferState,
    ) -> Result<Self>
    where
        F: ExtentFs<Pin = P>,
    {
        let sector_size = device.sector_size();
        if sector_size != SECTOR_SIZE {
            error!(event = "sector_size_mismatch", sector_size, expected = SECTOR_SIZE);
            panic!("block layer sector size {sector_size} does not match {SECTOR_SIZE}");
        }

        match fs.is_contiguous(&file) {
            Ok(true) => {}
            Ok(false) => {
                let _ = fs.close(file);
                return Err(RspError::NotContiguous);
            }
            Err(err) => {
                warn!(event = "contiguity_check_failed", path, error = %err);
                let _ = fs.close(file);
                return Err(RspError::ContiguityCheck);
            }
        }

        let extent = match fs.extent_of(&file) {
            Ok(extent) => extent,
            Err(err) => {
                warn!(event = "extent_resolution_failed", path, error = %err);
                let _ = fs.close(file);
                return Err(RspError::OpenFile);
            }
        };
        state.total_size = extent.size_bytes;

        // The read-write handle must be closed before the read-only pin can
        // be taken. An external remove + recreate in that window would pin a
        // different extent; the window is short and callers accept it.
        fs.close(file)?;
        let pin = fs.pin_read_only(path).map_err(|err| {
            warn!(event = "descriptor_pin_failed", path, error = %err);
            RspError::LockFile
        })?;

        let sector_pool = SectorPool::new(extent.lun, PoolConfig::default())?;
        debug!(
            event = "partial_file_ready",
            path,
            lun = %extent.lun,
            first_sector = %extent.first_sector,
            total_size = state.total_size
        );

        Ok(Self {
            device,
            sector_pool,
            first_sector_nbr: extent.first_sector,
            current_sector: None,
            current_dirty: false,
            current_offset: 0,
            state,
            last_progress_percent: -1,
            pin,
        })
    }

    // ── Sector mapping ──────────────────────────────────────────────────

    /// LBA containing `offset`. For `offset` at or past the end of the
    /// file, one is added so the result never aliases the last data sector.
    #[must_use]
    pub fn get_sector_nbr(&self, offset: u64) -> SectorNbr {
        let mut delta = offset / SECTOR_SIZE as u64;
        if offset >= self.state.total_size {
            delta += 1;
        }
        let delta = u32::try_from(delta).unwrap_or(u32::MAX);
        self.first_sector_nbr
            .checked_add(delta)
            .unwrap_or(SectorNbr(u32::MAX))
    }

    fn get_offset(&self, sector_nbr: SectorNbr) -> u64 {
        u64::from(sector_nbr.0 - self.first_sector_nbr.0) * SECTOR_SIZE as u64
    }

    // ── Writer operations ───────────────────────────────────────────────

    /// Move the logical write position.
    ///
    /// The buffered sector is retained when the new offset maps to the same
    /// LBA; otherwise it is discarded unsubmitted and its content is lost.
    pub fn seek(&mut self, offset: u64) {
        if let Some(current) = &self.current_sector {
            if current.sector_nbr() == self.get_sector_nbr(offset) {
                self.current_offset = offset;
                return;
            }
            warn!(event = "buffered_sector_discarded", sector = %current.sector_nbr());
        }
        self.current_offset = offset;
        self.discard_current_sector();
    }

    fn discard_current_sector(&mut self) {
        if let Some(request) = self.current_sector.take() {
            self.sector_pool.discard(request);
            self.current_dirty = false;
        }
    }

    /// Stream `data` at the current offset, submitting each sector as its
    /// boundary is crossed.
    ///
    /// Fails fast once an earlier completion reported failure; a request to
    /// extend past the end of the extent aborts, because it means the
    /// byte accounting is corrupt.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        if self.sector_pool.write_error() {
            return Err(RspError::DeviceFault(
                "an earlier sector write failed".to_owned(),
            ));
        }

        while !data.is_empty() {
            let mut current = match self.current_sector.take() {
                Some(current) => current,
                None => {
                    if self.current_offset >= self.state.total_size {
                        error!(
                            event = "write_past_end",
                            offset = self.current_offset,
                            total_size = self.state.total_size
                        );
                        return Err(RspError::Format("write past end of file".to_owned()));
                    }
                    let sector_nbr = self.get_sector_nbr(self.current_offset);
                    let mut request = self.sector_pool.acquire()?;
                    request.set_sector_nbr(sector_nbr);
                    request
                }
            };

            let sector_offset = (self.current_offset % SECTOR_SIZE as u64) as usize;
            let write_size = data.len().min(SECTOR_SIZE - sector_offset);
            current.data_mut()[sector_offset..sector_offset + write_size]
                .copy_from_slice(&data[..write_size]);
            self.current_dirty = true;

            let next_offset = self.current_offset + write_size as u64;
            if next_offset > self.state.total_size {
                error!(
                    event = "write_overruns_extent",
                    next_offset,
                    total_size = self.state.total_size
                );
                panic!("request to write past the end of the file");
            }

            if self.get_sector_nbr(next_offset) != current.sector_nbr() {
                self.write_current_sector(current)?;
                self.current_dirty = false;
            } else {
                self.current_sector = Some(current);
            }

            self.seek(next_offset);
            data = &data[write_size..];
        }

        Ok(())
    }

    /// Submit one filled sector to the device.
    ///
    /// Between construction and this call the medium may have been swapped
    /// for another drive; the raw write bypasses the filesystem, so the
    /// pinned descriptor is poked to re-identify the medium before anything
    /// touches the bus. The valid range is extended on submission, not on
    /// completion — an asynchronous failure later sets the sticky error
    /// flag but does not retract the range.
    fn write_current_sector(&mut self, request: SectorRequest) -> Result<()> {
        debug!(event = "sector_submit", sector = %request.sector_nbr());
        if let Err(err) = self.pin.poke() {
            warn!(event = "medium_poke_failed", error = %err);
            self.sector_pool.discard(request);
            return Err(RspError::MediumChanged);
        }

        let sector_nbr = request.sector_nbr();
        if let Err(failed) = self.device.submit(request) {
            warn!(event = "sector_submit_refused", sector = %sector_nbr, error = %failed.error);
            self.sector_pool.discard(failed.request);
            return Err(failed.error);
        }

        let start = self.get_offset(sector_nbr);
        let end = (start + SECTOR_SIZE as u64).min(self.state.total_size);
        self.extend_valid_part(ValidPart::new(start, end));
        Ok(())
    }

    /// Make all submitted sectors durable and flush the present content of
    /// a partially filled current sector.
    ///
    /// The current sector is double-buffered: a copy takes its place so the
    /// buffer handed to the driver is never appended to afterwards. A
    /// second `sync` with no intervening `write` re-submits nothing.
    pub fn sync(&mut self) -> Result<()> {
        let sync_avoid = usize::from(self.current_sector.is_some());

        if self.current_dirty
            && let Some(current) = self.current_sector.take()
        {
            let mut copy = match self.sector_pool.acquire() {
                Ok(copy) => copy,
                Err(err) => {
                    self.current_sector = Some(current);
                    return Err(err);
                }
            };
            copy.data_mut().copy_from_slice(current.data());
            copy.set_sector_nbr(current.sector_nbr());

            let submitted = self.write_current_sector(current);
            self.current_sector = Some(copy);
            match submitted {
                // The copy holds exactly what was just submitted; nothing
                // left to flush until the next write dirties it again.
                Ok(()) => self.current_dirty = false,
                // The sector never reached the bus: the copy still carries
                // unflushed data, so it stays dirty and a later sync or
                // boundary crossing retries it.
                Err(err) => {
                    error!(event = "sync_submit_failed", error = %err);
                    return Err(err);
                }
            }
        }

        self.sector_pool.sync(sync_avoid)?;
        if self.sector_pool.write_error() {
            return Err(RspError::DeviceFault(
                "an earlier sector write failed".to_owned(),
            ));
        }
        Ok(())
    }

    // ── Progress ────────────────────────────────────────────────────────

    fn extend_valid_part(&mut self, new_part: ValidPart) {
        extend_state(&mut self.state, new_part);

        let percent = self.state.percent_valid();
        if percent != self.last_progress_percent {
            info!(
                event = "transfer_progress",
                bar = %render_progress_bar(&self.state),
                percent
            );
            self.last_progress_percent = percent;
        }
    }

    /// True iff at least the first `bytes` of the file hold written data.
    #[must_use]
    pub fn has_valid_head(&self, bytes: u64) -> bool {
        self.state.has_valid_head(bytes)
    }

    /// True iff at least the last `bytes` of the file hold written data.
    #[must_use]
    pub fn has_valid_tail(&self, bytes: u64) -> bool {
        self.state.has_valid_tail(bytes)
    }

    /// Snapshot of the progress state for persistence.
    #[must_use]
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// LBA of the sector currently being filled, if one is buffered.
    #[must_use]
    pub fn current_sector_nbr(&self) -> Option<SectorNbr> {
        self.current_sector.as_ref().map(SectorRequest::sector_nbr)
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.state.total_size
    }

    #[must_use]
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// True once any completion has reported failure.
    #[must_use]
    pub fn write_error(&self) -> bool {
        self.sector_pool.write_error()
    }
}

impl<D: SectorDevice, P: MediumPin> Drop for PartialFile<D, P> {
    fn drop(&mut self) {
        // The current sector may hold incomplete content; it must not
        // overwrite data that is already valid on the medium.
        self.discard_current_sector();
        // In-flight completions reference pool slots; drain them before the
        // pool goes away. The pin is released after this body runs.
        if self.sector_pool.sync(0).is_err() {
            warn!(event = "teardown_drain_timeout");
        }
    }
}

impl<D: SectorDevice, P: MediumPin> std::fmt::Debug for PartialFile<D, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartialFile")
            .field("first_sector_nbr", &self.first_sector_nbr)
            .field("current_offset", &self.current_offset)
            .field("state", &self.state)
            .field("write_error", &self.write_error())
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
