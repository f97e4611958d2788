#![forbid(unsafe_code)]
//! Sector-level block layer for RawSpool.
//!
//! Defines the `SectorDevice` contract (synchronous metadata I/O plus
//! asynchronous single-sector write submission with completion delivery),
//! the fixed-cardinality `SectorPool` of DMA-capable sector buffers, and two
//! device implementations: a file-backed device with a submission worker
//! thread and an in-memory device for tests.

use parking_lot::{Condvar, Mutex};
use rsp_error::{Result, RspError};
use rsp_types::{LunNbr, MediumId, SECTOR_SIZE, SectorNbr};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Number of sector buffers in a [`SectorPool`] unless configured otherwise.
pub const POOL_SLOTS: usize = 4;

/// Upper bound on any single wait for a pool slot or a pool drain.
///
/// Starvation across waiters is not prevented, only bounded by this timeout.
pub const SECTOR_RW_MAX_DELAY: Duration = Duration::from_secs(10);

/// Alignment of sector buffers handed to the device layer.
const DMA_ALIGNMENT: usize = 512;

// ── Sector buffer ───────────────────────────────────────────────────────────

/// Owned sector-sized buffer whose exposed slice starts at DMA alignment.
///
/// Remains fully safe by keeping the backing allocation and exposing an
/// aligned subslice of exactly [`SECTOR_SIZE`] bytes.
#[derive(Debug)]
pub struct SectorBuf {
    storage: Vec<u8>,
    start: usize,
}

impl SectorBuf {
    #[must_use]
    pub fn zeroed() -> Self {
        let storage = vec![0_u8; SECTOR_SIZE + DMA_ALIGNMENT - 1];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (DMA_ALIGNMENT - 1);
        let start = if misalignment == 0 {
            0
        } else {
            DMA_ALIGNMENT - misalignment
        };
        Self { storage, start }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + SECTOR_SIZE]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        &mut self.storage[start..start + SECTOR_SIZE]
    }

    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

// ── Requests and completion ─────────────────────────────────────────────────

/// Operation carried by a [`SectorRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorOp {
    Write,
}

/// Outcome of an asynchronously submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Ok,
    Error,
}

/// Receiver of request completions.
///
/// Implemented by the pool that owns the request's slot. `complete` runs in
/// the device's completion context (worker thread), must not block beyond a
/// short lock, and returns the buffer to the slot it came from.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, status: CompletionStatus, slot: usize, buf: SectorBuf);
}

/// A single-sector write request occupying one pool slot.
///
/// Produced by [`SectorPool::acquire`]; consumed either by
/// [`SectorDevice::submit`] (which later finishes it from the completion
/// context) or by [`SectorPool::discard`] (slot released, nothing hits the
/// bus).
pub struct SectorRequest {
    op: SectorOp,
    lun: LunNbr,
    sector_count: u32,
    sector_nbr: SectorNbr,
    data: SectorBuf,
    slot: usize,
    completion: Arc<dyn CompletionSink>,
}

impl SectorRequest {
    #[must_use]
    pub fn op(&self) -> SectorOp {
        self.op
    }

    #[must_use]
    pub fn lun(&self) -> LunNbr {
        self.lun
    }

    #[must_use]
    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    #[must_use]
    pub fn sector_nbr(&self) -> SectorNbr {
        self.sector_nbr
    }

    pub fn set_sector_nbr(&mut self, nbr: SectorNbr) {
        self.sector_nbr = nbr;
    }

    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }

    /// Deliver the completion for this request, returning its buffer to the
    /// owning pool. Called by device implementations exactly once per
    /// submitted request.
    pub fn finish(self, status: CompletionStatus) {
        let Self {
            data,
            slot,
            completion,
            ..
        } = self;
        completion.complete(status, slot, data);
    }
}

impl std::fmt::Debug for SectorRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorRequest")
            .field("op", &self.op)
            .field("lun", &self.lun)
            .field("sector_nbr", &self.sector_nbr)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// A synchronously refused submission: the request is handed back so the
/// caller can discard the slot instead of leaking it.
#[derive(Debug)]
pub struct FailedSubmit {
    pub request: SectorRequest,
    pub error: RspError,
}

// ── Device contract ─────────────────────────────────────────────────────────

/// Block-device capability set.
///
/// Synchronous `read_sectors`/`write_sectors` serve filesystem metadata;
/// `submit` is the asynchronous single-sector write path used by the partial
/// file writer. Per-LUN submission order is preserved by implementations.
pub trait SectorDevice: Send + Sync {
    /// Fixed sector size in bytes. Must equal [`SECTOR_SIZE`].
    fn sector_size(&self) -> usize;

    /// Total sectors addressable on `lun`.
    fn num_sectors(&self, lun: LunNbr) -> Result<u64>;

    /// Identity of the currently inserted medium. Changes on every replug.
    fn medium_id(&self, lun: LunNbr) -> Result<MediumId>;

    /// Read `buf.len() / SECTOR_SIZE` sectors starting at `first`.
    fn read_sectors(&self, lun: LunNbr, first: SectorNbr, buf: &mut [u8]) -> Result<()>;

    /// Write `buf.len() / SECTOR_SIZE` sectors starting at `first`.
    fn write_sectors(&self, lun: LunNbr, first: SectorNbr, buf: &[u8]) -> Result<()>;

    /// Queue an asynchronous single-sector write. On synchronous refusal the
    /// request is handed back untouched; otherwise its completion is
    /// delivered later through the request's sink.
    fn submit(&self, request: SectorRequest) -> std::result::Result<(), FailedSubmit>;
}

fn check_sector_multiple(len: usize) -> Result<()> {
    if len == 0 || len % SECTOR_SIZE != 0 {
        return Err(RspError::Format(format!(
            "buffer length {len} is not a positive multiple of {SECTOR_SIZE}"
        )));
    }
    Ok(())
}

// ── Sector pool ─────────────────────────────────────────────────────────────

/// Geometry and patience of a [`SectorPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Number of pre-allocated sector buffers (1..=32).
    pub slots: usize,
    /// Upper bound on a single acquire or drain wait.
    pub max_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slots: POOL_SLOTS,
            max_delay: SECTOR_RW_MAX_DELAY,
        }
    }
}

impl PoolConfig {
    pub fn validate(self) -> Result<Self> {
        if self.slots == 0 || self.slots > 32 {
            return Err(RspError::Format(format!(
                "pool slots must be in 1..=32, got {}",
                self.slots
            )));
        }
        Ok(self)
    }
}

struct PoolInner {
    /// Bit `i` set means slot `i` is in use. Bits at and above the slot
    /// count are pre-set so "nothing free" probes as "no clear bit below
    /// the count".
    slot_mask: u32,
    /// Buffers parked in their slots while not handed out.
    parked: Vec<Option<SectorBuf>>,
}

impl PoolInner {
    fn free_slot(&self, slots: usize) -> Option<usize> {
        let candidate = self.slot_mask.trailing_ones() as usize;
        (candidate < slots).then_some(candidate)
    }

    fn busy_count(&self, slots: usize) -> usize {
        let low = if slots == 32 {
            u32::MAX
        } else {
            (1_u32 << slots) - 1
        };
        (self.slot_mask & low).count_ones() as usize
    }
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    freed: Condvar,
    /// Sticky: set by the first failed completion, never cleared.
    write_error: AtomicBool,
    slots: usize,
}

impl CompletionSink for PoolShared {
    fn complete(&self, status: CompletionStatus, slot: usize, buf: SectorBuf) {
        if status == CompletionStatus::Error {
            error!(event = "sector_write_failed", slot);
            self.write_error.store(true, Ordering::Release);
        }
        self.release(slot, buf);
    }
}

impl PoolShared {
    fn release(&self, slot: usize, buf: SectorBuf) {
        let mut inner = self.inner.lock();
        inner.parked[slot] = Some(buf);
        inner.slot_mask &= !(1 << slot);
        self.freed.notify_all();
        drop(inner);
        trace!(event = "slot_released", slot);
    }
}

/// Fixed pool of sector buffers with asynchronous release via I/O
/// completion.
///
/// The writer thread acquires slots and hands them to the device; the
/// device's completion context releases them through the [`CompletionSink`].
/// The mutex guards only the slot mask and is never held across a
/// submission or a wait.
pub struct SectorPool {
    shared: Arc<PoolShared>,
    lun: LunNbr,
    max_delay: Duration,
}

impl SectorPool {
    pub fn new(lun: LunNbr, config: PoolConfig) -> Result<Self> {
        let config = config.validate()?;
        let mask_init = if config.slots == 32 {
            0
        } else {
            u32::MAX << config.slots
        };
        let parked = (0..config.slots).map(|_| Some(SectorBuf::zeroed())).collect();
        Ok(Self {
            shared: Arc::new(PoolShared {
                inner: Mutex::new(PoolInner {
                    slot_mask: mask_init,
                    parked,
                }),
                freed: Condvar::new(),
                write_error: AtomicBool::new(false),
                slots: config.slots,
            }),
            lun,
            max_delay: config.max_delay,
        })
    }

    #[must_use]
    pub fn slots(&self) -> usize {
        self.shared.slots
    }

    /// True once any completion has reported failure. Sticky for the life
    /// of the pool.
    #[must_use]
    pub fn write_error(&self) -> bool {
        self.shared.write_error.load(Ordering::Acquire)
    }

    /// Obtain an exclusive slot with a zeroed buffer.
    ///
    /// The lowest-indexed free slot is chosen. Blocks until a slot frees up,
    /// or returns `Err(Timeout)` once `max_delay` elapses.
    pub fn acquire(&self) -> Result<SectorRequest> {
        let deadline = Instant::now() + self.max_delay;
        let mut inner = self.shared.inner.lock();
        let slot = loop {
            if let Some(slot) = inner.free_slot(self.shared.slots) {
                break slot;
            }
            if self.shared.freed.wait_until(&mut inner, deadline).timed_out() {
                match inner.free_slot(self.shared.slots) {
                    Some(slot) => break slot,
                    None => {
                        drop(inner);
                        warn!(event = "slot_acquire_timeout", delay_ms = self.max_delay.as_millis() as u64);
                        return Err(RspError::Timeout);
                    }
                }
            }
        };
        inner.slot_mask |= 1 << slot;
        let Some(mut buf) = inner.parked[slot].take() else {
            error!(event = "pool_invariant_violated", slot);
            panic!("sector pool slot {slot} marked free but holds no parked buffer");
        };
        drop(inner);

        buf.zero();
        trace!(event = "slot_acquired", slot);
        Ok(SectorRequest {
            op: SectorOp::Write,
            lun: self.lun,
            sector_count: 1,
            sector_nbr: SectorNbr(0),
            data: buf,
            slot,
            completion: Arc::clone(&self.shared) as Arc<dyn CompletionSink>,
        })
    }

    /// Release an unsubmitted request's slot. Never blocks; the buffered
    /// content is dropped without touching the bus.
    pub fn discard(&self, request: SectorRequest) {
        let SectorRequest { data, slot, .. } = request;
        debug!(event = "slot_discarded", slot);
        self.shared.release(slot, data);
    }

    /// Wait until all but `avoid` slots are free.
    ///
    /// `avoid == 1` excludes the slot the caller retains for
    /// double-buffering. Returns `Err(Timeout)` if the pool does not drain
    /// within `max_delay`.
    pub fn sync(&self, avoid: usize) -> Result<()> {
        debug_assert!(avoid <= self.shared.slots);
        let deadline = Instant::now() + self.max_delay;
        let mut inner = self.shared.inner.lock();
        while inner.busy_count(self.shared.slots) > avoid {
            if self.shared.freed.wait_until(&mut inner, deadline).timed_out() {
                if inner.busy_count(self.shared.slots) <= avoid {
                    break;
                }
                drop(inner);
                warn!(event = "pool_drain_timeout", avoid);
                return Err(RspError::Timeout);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SectorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("SectorPool")
            .field("lun", &self.lun)
            .field("slots", &self.shared.slots)
            .field("busy", &inner.busy_count(self.shared.slots))
            .field("write_error", &self.write_error())
            .finish()
    }
}

// ── In-memory device (for testing) ──────────────────────────────────────────

/// In-memory sector device for unit tests.
///
/// Completions are delivered inline on the submitting thread. Supports
/// injected completion failures, a one-shot synchronous refusal, and medium
/// swap to simulate an unplug/replug cycle.
pub struct MemSectorDevice {
    store: Mutex<Vec<u8>>,
    medium: Mutex<MediumId>,
    submitted: Mutex<Vec<SectorNbr>>,
    submit_seq: AtomicU64,
    fail_completions: Mutex<Vec<u64>>,
    refuse_next: AtomicBool,
}

impl MemSectorDevice {
    #[must_use]
    pub fn new(sectors: u64) -> Self {
        let len = usize::try_from(sectors).unwrap_or(0) * SECTOR_SIZE;
        Self {
            store: Mutex::new(vec![0_u8; len]),
            medium: Mutex::new(MediumId(0x5000_0001)),
            submitted: Mutex::new(Vec::new()),
            submit_seq: AtomicU64::new(0),
            fail_completions: Mutex::new(Vec::new()),
            refuse_next: AtomicBool::new(false),
        }
    }

    /// Arrange for the `nth` (0-based) submission to complete with a failed
    /// status and no effect on the store.
    pub fn fail_completion_at(&self, nth: u64) {
        self.fail_completions.lock().push(nth);
    }

    /// Refuse the next submission synchronously, handing the request back.
    pub fn refuse_next_submit(&self) {
        self.refuse_next.store(true, Ordering::Release);
    }

    /// Simulate unplugging the medium and plugging a different one in.
    pub fn swap_medium(&self) {
        let mut medium = self.medium.lock();
        *medium = MediumId(medium.0.wrapping_add(1));
    }

    /// Ordered record of successfully queued submissions.
    #[must_use]
    pub fn submitted_sectors(&self) -> Vec<SectorNbr> {
        self.submitted.lock().clone()
    }

    /// Copy of one sector's current content.
    #[must_use]
    pub fn sector_data(&self, nbr: SectorNbr) -> Vec<u8> {
        let start = nbr.0 as usize * SECTOR_SIZE;
        self.store.lock()[start..start + SECTOR_SIZE].to_vec()
    }

    fn check_range(&self, first: SectorNbr, sectors: usize) -> Result<usize> {
        let start = first.0 as usize * SECTOR_SIZE;
        let end = start + sectors * SECTOR_SIZE;
        if end > self.store.lock().len() {
            return Err(RspError::Format(format!(
                "sector range [{}, {}) out of bounds",
                first.0,
                first.0 as usize + sectors
            )));
        }
        Ok(start)
    }
}

impl SectorDevice for MemSectorDevice {
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn num_sectors(&self, _lun: LunNbr) -> Result<u64> {
        Ok((self.store.lock().len() / SECTOR_SIZE) as u64)
    }

    fn medium_id(&self, _lun: LunNbr) -> Result<MediumId> {
        Ok(*self.medium.lock())
    }

    fn read_sectors(&self, _lun: LunNbr, first: SectorNbr, buf: &mut [u8]) -> Result<()> {
        check_sector_multiple(buf.len())?;
        let start = self.check_range(first, buf.len() / SECTOR_SIZE)?;
        buf.copy_from_slice(&self.store.lock()[start..start + buf.len()]);
        Ok(())
    }

    fn write_sectors(&self, _lun: LunNbr, first: SectorNbr, buf: &[u8]) -> Result<()> {
        check_sector_multiple(buf.len())?;
        let start = self.check_range(first, buf.len() / SECTOR_SIZE)?;
        self.store.lock()[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn submit(&self, request: SectorRequest) -> std::result::Result<(), FailedSubmit> {
        if self.refuse_next.swap(false, Ordering::AcqRel) {
            return Err(FailedSubmit {
                request,
                error: RspError::DeviceFault("injected refusal".to_owned()),
            });
        }

        let seq = self.submit_seq.fetch_add(1, Ordering::AcqRel);
        self.submitted.lock().push(request.sector_nbr());

        let fail = self.fail_completions.lock().contains(&seq);
        if fail {
            request.finish(CompletionStatus::Error);
            return Ok(());
        }

        match self.check_range(request.sector_nbr(), 1) {
            Ok(start) => {
                self.store.lock()[start..start + SECTOR_SIZE].copy_from_slice(request.data());
                request.finish(CompletionStatus::Ok);
            }
            Err(_) => request.finish(CompletionStatus::Error),
        }
        Ok(())
    }
}

// ── File-backed device ──────────────────────────────────────────────────────

/// Image-file device exposing a single LUN.
///
/// Metadata I/O uses `pread`/`pwrite` style positioned calls. Asynchronous
/// submissions are queued to a named worker thread over a channel, which
/// preserves submission order and delivers completions from its own
/// context. Dropping the device closes the queue and joins the worker,
/// completing everything already submitted.
pub struct FileSectorDevice {
    file: Arc<File>,
    num_sectors: u64,
    medium: MediumId,
    tx: Option<Sender<SectorRequest>>,
    join: Option<JoinHandle<()>>,
}

impl FileSectorDevice {
    /// Open an image file as LUN 0.
    ///
    /// The image length must be a whole number of sectors.
    pub fn open(path: impl AsRef<Path>, medium: MediumId) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len % SECTOR_SIZE as u64 != 0 {
            return Err(RspError::Format(format!(
                "image length {len} is not sector-aligned"
            )));
        }

        let file = Arc::new(file);
        let worker_file = Arc::clone(&file);
        let (tx, rx) = mpsc::channel::<SectorRequest>();
        let join = thread::Builder::new()
            .name("rsp-sector-writer".to_owned())
            .spawn(move || {
                for request in rx {
                    let offset = u64::from(request.sector_nbr().0) * SECTOR_SIZE as u64;
                    let status = if offset + SECTOR_SIZE as u64 > len {
                        error!(
                            event = "submission_out_of_range",
                            sector = %request.sector_nbr(),
                            image_len = len
                        );
                        CompletionStatus::Error
                    } else {
                        match worker_file.write_all_at(request.data(), offset) {
                            Ok(()) => CompletionStatus::Ok,
                            Err(err) => {
                                error!(event = "submission_io_failed", sector = %request.sector_nbr(), error = %err);
                                CompletionStatus::Error
                            }
                        }
                    };
                    request.finish(status);
                }
            })
            .map_err(RspError::Io)?;

        Ok(Self {
            file,
            num_sectors: len / SECTOR_SIZE as u64,
            medium,
            tx: Some(tx),
            join: Some(join),
        })
    }

    /// Flush queued submissions and file content to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn check_lun(lun: LunNbr) -> Result<()> {
        if lun.0 != 0 {
            return Err(RspError::DeviceFault(format!("unknown lun {lun}")));
        }
        Ok(())
    }

    fn check_range(&self, first: SectorNbr, sectors: usize) -> Result<u64> {
        let end = u64::from(first.0) + sectors as u64;
        if end > self.num_sectors {
            return Err(RspError::Format(format!(
                "sector range [{}, {end}) exceeds {} sectors",
                first.0, self.num_sectors
            )));
        }
        Ok(u64::from(first.0) * SECTOR_SIZE as u64)
    }
}

impl SectorDevice for FileSectorDevice {
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn num_sectors(&self, lun: LunNbr) -> Result<u64> {
        Self::check_lun(lun)?;
        Ok(self.num_sectors)
    }

    fn medium_id(&self, lun: LunNbr) -> Result<MediumId> {
        Self::check_lun(lun)?;
        Ok(self.medium)
    }

    fn read_sectors(&self, lun: LunNbr, first: SectorNbr, buf: &mut [u8]) -> Result<()> {
        Self::check_lun(lun)?;
        check_sector_multiple(buf.len())?;
        let offset = self.check_range(first, buf.len() / SECTOR_SIZE)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_sectors(&self, lun: LunNbr, first: SectorNbr, buf: &[u8]) -> Result<()> {
        Self::check_lun(lun)?;
        check_sector_multiple(buf.len())?;
        let offset = self.check_range(first, buf.len() / SECTOR_SIZE)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn submit(&self, request: SectorRequest) -> std::result::Result<(), FailedSubmit> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(FailedSubmit {
                request,
                error: RspError::DeviceFault("submission worker stopped".to_owned()),
            });
        };
        match tx.send(request) {
            Ok(()) => Ok(()),
            Err(send_err) => Err(FailedSubmit {
                request: send_err.0,
                error: RspError::DeviceFault("submission worker stopped".to_owned()),
            }),
        }
    }
}

impl Drop for FileSectorDevice {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what was already
        // queued, then exit.
        drop(self.tx.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl std::fmt::Debug for FileSectorDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSectorDevice")
            .field("num_sectors", &self.num_sectors)
            .field("medium", &self.medium)
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(slots: usize) -> SectorPool {
        SectorPool::new(
            LunNbr(0),
            PoolConfig {
                slots,
                max_delay: Duration::from_millis(50),
            },
        )
        .unwrap()
    }

    #[test]
    fn acquire_hands_out_lowest_free_slot() {
        let pool = small_pool(4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a.slot(), 0);
        assert_eq!(b.slot(), 1);

        pool.discard(a);
        let c = pool.acquire().unwrap();
        assert_eq!(c.slot(), 0);
        pool.discard(b);
        pool.discard(c);
    }

    #[test]
    fn acquire_zeroes_the_buffer() {
        let pool = small_pool(1);
        let mut req = pool.acquire().unwrap();
        req.data_mut().fill(0xAA);
        pool.discard(req);

        let req = pool.acquire().unwrap();
        assert!(req.data().iter().all(|b| *b == 0));
        pool.discard(req);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = small_pool(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(RspError::Timeout)));
        pool.discard(a);
        pool.discard(b);
    }

    #[test]
    fn release_from_another_thread_wakes_acquirer() {
        let pool = Arc::new(
            SectorPool::new(
                LunNbr(0),
                PoolConfig {
                    slots: 1,
                    max_delay: Duration::from_secs(5),
                },
            )
            .unwrap(),
        );
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|r| r.slot()))
        };
        thread::sleep(Duration::from_millis(20));
        pool.discard(held);
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn sync_waits_for_drain_and_respects_avoid() {
        let pool = small_pool(4);
        let held = pool.acquire().unwrap();
        // One slot busy: a full drain times out, avoid=1 succeeds at once.
        assert!(matches!(pool.sync(0), Err(RspError::Timeout)));
        pool.sync(1).unwrap();
        pool.discard(held);
        pool.sync(0).unwrap();
    }

    #[test]
    fn completion_failure_sets_sticky_write_error() {
        let pool = small_pool(2);
        let device = MemSectorDevice::new(16);
        device.fail_completion_at(0);

        let mut req = pool.acquire().unwrap();
        req.set_sector_nbr(SectorNbr(3));
        device.submit(req).unwrap();

        assert!(pool.write_error());
        // The slot came back despite the failure.
        pool.sync(0).unwrap();
        // Sticky across further successful completions.
        let mut req = pool.acquire().unwrap();
        req.set_sector_nbr(SectorNbr(4));
        device.submit(req).unwrap();
        assert!(pool.write_error());
    }

    #[test]
    fn mem_device_applies_submitted_write() {
        let pool = small_pool(2);
        let device = MemSectorDevice::new(16);

        let mut req = pool.acquire().unwrap();
        req.set_sector_nbr(SectorNbr(5));
        req.data_mut()[..4].copy_from_slice(b"data");
        device.submit(req).unwrap();

        assert_eq!(device.submitted_sectors(), vec![SectorNbr(5)]);
        assert_eq!(&device.sector_data(SectorNbr(5))[..4], b"data");
        pool.sync(0).unwrap();
    }

    #[test]
    fn mem_device_refusal_hands_request_back() {
        let pool = small_pool(1);
        let device = MemSectorDevice::new(16);
        device.refuse_next_submit();

        let mut req = pool.acquire().unwrap();
        req.set_sector_nbr(SectorNbr(2));
        let failed = device.submit(req).unwrap_err();
        assert_eq!(failed.request.sector_nbr(), SectorNbr(2));
        assert!(device.submitted_sectors().is_empty());

        // Discarding the handed-back request frees the only slot.
        pool.discard(failed.request);
        let req = pool.acquire().unwrap();
        pool.discard(req);
    }

    #[test]
    fn mem_device_out_of_range_submission_fails_completion() {
        let pool = small_pool(1);
        let device = MemSectorDevice::new(4);

        let mut req = pool.acquire().unwrap();
        req.set_sector_nbr(SectorNbr(9));
        device.submit(req).unwrap();
        assert!(pool.write_error());
    }

    #[test]
    fn mem_device_medium_swap_changes_identity() {
        let device = MemSectorDevice::new(4);
        let before = device.medium_id(LunNbr(0)).unwrap();
        device.swap_medium();
        assert_ne!(device.medium_id(LunNbr(0)).unwrap(), before);
    }

    #[test]
    fn mem_device_sync_roundtrip() {
        let device = MemSectorDevice::new(8);
        let mut out = vec![0x42_u8; SECTOR_SIZE * 2];
        device.write_sectors(LunNbr(0), SectorNbr(3), &out).unwrap();
        out.fill(0);
        device.read_sectors(LunNbr(0), SectorNbr(3), &mut out).unwrap();
        assert!(out.iter().all(|b| *b == 0x42));
        assert!(device.read_sectors(LunNbr(0), SectorNbr(7), &mut out).is_err());
    }

    #[test]
    fn file_device_submission_lands_in_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0_u8; SECTOR_SIZE * 8]).unwrap();

        let device = FileSectorDevice::open(&path, MediumId(7)).unwrap();
        let pool = small_pool(2);

        let mut req = pool.acquire().unwrap();
        req.set_sector_nbr(SectorNbr(3));
        req.data_mut()[..5].copy_from_slice(b"hello");
        device.submit(req).unwrap();

        pool.sync(0).unwrap();
        assert!(!pool.write_error());

        let mut sector = vec![0_u8; SECTOR_SIZE];
        device.read_sectors(LunNbr(0), SectorNbr(3), &mut sector).unwrap();
        assert_eq!(&sector[..5], b"hello");
        drop(device);

        let image = std::fs::read(&path).unwrap();
        assert_eq!(&image[3 * SECTOR_SIZE..3 * SECTOR_SIZE + 5], b"hello");
    }

    #[test]
    fn file_device_preserves_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0_u8; SECTOR_SIZE * 16]).unwrap();

        let device = FileSectorDevice::open(&path, MediumId(7)).unwrap();
        let pool = small_pool(4);

        // Same sector written repeatedly: the last submitted payload wins
        // only if order is preserved.
        for round in 0..12_u8 {
            let mut req = pool.acquire().unwrap();
            req.set_sector_nbr(SectorNbr(1));
            req.data_mut().fill(round);
            device.submit(req).unwrap();
        }
        pool.sync(0).unwrap();

        let mut sector = vec![0_u8; SECTOR_SIZE];
        device.read_sectors(LunNbr(0), SectorNbr(1), &mut sector).unwrap();
        assert!(sector.iter().all(|b| *b == 11));
    }

    #[test]
    fn file_device_rejects_misaligned_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.img");
        std::fs::write(&path, vec![0_u8; SECTOR_SIZE + 17]).unwrap();
        assert!(FileSectorDevice::open(&path, MediumId(7)).is_err());
    }

    #[test]
    fn sector_buf_is_aligned_and_sector_sized() {
        let buf = SectorBuf::zeroed();
        assert_eq!(buf.as_slice().len(), SECTOR_SIZE);
        assert_eq!(buf.as_slice().as_ptr() as usize % DMA_ALIGNMENT, 0);
    }

    #[test]
    fn pool_config_rejects_bad_geometry() {
        assert!(PoolConfig {
            slots: 0,
            max_delay: SECTOR_RW_MAX_DELAY
        }
        .validate()
        .is_err());
        assert!(PoolConfig {
            slots: 33,
            max_delay: SECTOR_RW_MAX_DELAY
        }
        .validate()
        .is_err());
    }
}
