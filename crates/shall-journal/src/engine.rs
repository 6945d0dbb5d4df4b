//! The commit engine.
//!
//! One mutex guards the whole engine state: the read side (cursors and
//! buffer pointers, saved and restored wholesale by the consumer on error)
//! and the write side (commit scalars and the commit buffer). The mutex is
//! held for short, bounded work only; the flush loop records each write
//! intent under the mutex, stages the chunk, and releases the mutex for
//! the physical device write.

use crate::creds::current_credentials;
use crate::interrupt::{Interrupt, wait_interruptible};
use crate::options::{DataMode, MountOptions, OverflowPolicy, TooBigPolicy};
use crate::overflow::LogQueue;
use crate::ring::{self, DevPtr};
use crate::sbio;
use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use shall_block::ByteDevice;
use shall_error::{Result, ShallError};
use shall_ondisk::record::{
    Acl, DATA_SLICE_MAX, OpCode, Payload, RECORD_HEADER_SIZE, RecordSpec, Region, Timestamp,
    Xattr, content_digest, encode_record,
};
use shall_ondisk::superblock::{SB_DIRTY, Superblock};
use shall_types::{ByteOffset, DEV_BLOCK_SIZE, align_up};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Why a flush ran; each reason is counted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The commit buffer filled up.
    Size = 0,
    /// The background commit task's cadence expired.
    Time = 1,
    /// An explicit commit barrier.
    Forced = 2,
}

/// Read-side state: the cursors a consumer saves and restores as one blob.
#[derive(Debug, Clone)]
struct ReadSide {
    /// Logical ring offset of the oldest unread byte.
    data_start: u64,
    /// Bytes in the journal, on device and buffered together.
    data_length: u64,
    /// On-device bytes not yet consumed.
    committed: u64,
    /// Physical position of `data_start`.
    start_ptr: DevPtr,
    /// Physical position where the next on-device byte lands.
    commit_ptr: DevPtr,
    /// Bytes appended to the commit buffer.
    buffer_written: usize,
    /// Buffered bytes already flushed to device or consumed.
    buffer_read: usize,
}

/// Write-side scalars; same mutex, but never touched by cursor rollback.
struct WriteSide {
    last_commit: Instant,
    last_sb_written: u32,
    max_length: u64,
    version: u64,
    logged: u64,
    commit_count: [u64; 3],
    sb_flags: u32,
    commit_buffer: Vec<u8>,
}

struct EngineState {
    read: ReadSide,
    other: WriteSide,
}

/// Immutable per-mount geometry.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    device_size: u64,
    data_space: u64,
    alignment: u32,
    num_superblocks: u32,
    max_ptr: DevPtr,
}

/// Cooperative stop channel shared with the commit task; lives outside the
/// engine so the sleeping task holds no strong reference to it.
struct TaskControl {
    stop: Mutex<bool>,
    cond: Condvar,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            stop: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn request_stop(&self) {
        *self.stop.lock() = true;
        self.cond.notify_all();
    }

    fn stopped(&self) -> bool {
        *self.stop.lock()
    }

    /// Sleep up to `timeout`; true when a stop was requested.
    fn wait_stop_for(&self, timeout: Duration) -> bool {
        let mut stop = self.stop.lock();
        if *stop {
            return true;
        }
        let _ = self.cond.wait_for(&mut stop, timeout);
        *stop
    }
}

struct JournalInner {
    dev: Arc<dyn ByteDevice>,
    geo: Geometry,
    options: ArcSwap<MountOptions>,
    state: Mutex<EngineState>,
    /// Consumers waiting for records; paired with `state`.
    data_cond: Condvar,
    /// Producers waiting for space, barriers waiting out a commit.
    lq: LogQueue,
    allow_commit_task: AtomicBool,
    inside_commit: AtomicBool,
    some_data: AtomicBool,
    logs_valid: AtomicBool,
    logs_reading: AtomicBool,
    logs_writing: AtomicU32,
    unmounted: AtomicBool,
    task_ctl: Arc<TaskControl>,
    task: Mutex<Option<JoinHandle<()>>>,
    mounted_at: Instant,
}

impl fmt::Debug for JournalInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalInner")
            .field("geo", &self.geo)
            .field("logs_valid", &self.logs_valid.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for JournalInner {
    fn drop(&mut self) {
        // A dropped-without-unmount journal leaves the device dirty (that
        // is the crash story); only the background task is shut down.
        self.task_ctl.request_stop();
    }
}

/// A mounted journal engine. Cheap to clone; all clones share one engine.
#[derive(Debug, Clone)]
pub struct Journal {
    inner: Arc<JournalInner>,
}

enum StoreOutcome {
    Stored,
    Dropped,
    /// The commit buffer shrank under us; re-encode and retry.
    Shrunk,
}

impl Journal {
    /// Mount: select the best superblock, mark the device dirty, start the
    /// background commit task.
    pub fn open(dev: Arc<dyn ByteDevice>, options: MountOptions) -> Result<Self> {
        let sb = sbio::select_superblock(&*dev)?;
        Self::open_with_superblock(dev, sb, options)
    }

    /// Mount a device whose active superblock the caller already selected
    /// and validated (fsck, tests, recovery tooling).
    pub fn open_with_superblock(
        dev: Arc<dyn ByteDevice>,
        sb: Superblock,
        options: MountOptions,
    ) -> Result<Self> {
        options.validate()?;
        if sb.alignment < 8 || sb.alignment % 8 != 0 || u64::from(sb.alignment) > DEV_BLOCK_SIZE {
            return Err(ShallError::Format(format!(
                "superblock carries invalid alignment {}",
                sb.alignment
            )));
        }
        if sb.data_space == 0 || sb.data_start >= sb.data_space || sb.data_length > sb.data_space {
            return Err(ShallError::Format(
                "superblock carries inconsistent ring geometry".into(),
            ));
        }

        let geo = Geometry {
            device_size: sb.device_size,
            data_space: sb.data_space,
            alignment: sb.alignment,
            num_superblocks: sb.num_superblocks,
            max_ptr: ring::max_ptr(sb.device_size, sb.num_superblocks),
        };
        let mut data_end = sb.data_start + sb.data_length;
        if data_end >= geo.data_space {
            data_end -= geo.data_space;
        }
        let read = ReadSide {
            data_start: sb.data_start,
            data_length: sb.data_length,
            committed: sb.data_length,
            start_ptr: ring::locate(sb.data_start, geo.num_superblocks),
            commit_ptr: ring::locate(data_end, geo.num_superblocks),
            buffer_written: 0,
            buffer_read: 0,
        };
        let other = WriteSide {
            last_commit: Instant::now(),
            last_sb_written: 0,
            max_length: sb.max_length,
            version: sb.version,
            logged: 0,
            commit_count: [0; 3],
            sb_flags: sb.flags | SB_DIRTY,
            commit_buffer: vec![0_u8; options.commit_size],
        };

        let inner = Arc::new(JournalInner {
            dev,
            geo,
            options: ArcSwap::from_pointee(options),
            state: Mutex::new(EngineState { read, other }),
            data_cond: Condvar::new(),
            lq: LogQueue::new(),
            allow_commit_task: AtomicBool::new(true),
            inside_commit: AtomicBool::new(false),
            some_data: AtomicBool::new(sb.data_length > 0),
            logs_valid: AtomicBool::new(true),
            logs_reading: AtomicBool::new(false),
            logs_writing: AtomicU32::new(0),
            unmounted: AtomicBool::new(false),
            task_ctl: Arc::new(TaskControl::new()),
            task: Mutex::new(None),
            mounted_at: Instant::now(),
        });

        // Mark the device dirty before any append can land.
        {
            let mut state = inner.state.lock();
            state.other.version += 1;
            let image = inner.superblock_snapshot(&state);
            drop(state);
            let next = sbio::write_spread_superblocks(&*inner.dev, &image)?;
            inner.state.lock().other.last_sb_written = next;
        }

        let weak = Arc::downgrade(&inner);
        let ctl = Arc::clone(&inner.task_ctl);
        let handle = thread::Builder::new()
            .name("shall-commit".into())
            .spawn(move || run_commit_task(&weak, &ctl))
            .map_err(ShallError::Io)?;
        *inner.task.lock() = Some(handle);

        info!(
            target: "shall::engine",
            device_size = geo.device_size,
            data_space = geo.data_space,
            num_superblocks = geo.num_superblocks,
            alignment = geo.alignment,
            data_length = sb.data_length,
            version = sb.version,
            "journal_mounted"
        );
        Ok(Self { inner })
    }

    /// Current mount options.
    #[must_use]
    pub fn options(&self) -> MountOptions {
        let guard = self.inner.options.load();
        (**guard).clone()
    }

    /// Usable ring capacity in bytes.
    #[must_use]
    pub fn data_space(&self) -> u64 {
        self.inner.geo.data_space
    }

    /// Quick data-available check without taking the mutex.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.inner.some_data.load(Ordering::Acquire)
    }

    // ── Producer path ───────────────────────────────────────────────────

    /// Append one record. `operation` is signed: negative for before-op
    /// records, positive for after-op. Credentials and the request
    /// timestamp are captured here.
    pub fn append_record(
        &self,
        intr: &Interrupt,
        operation: i32,
        result: i32,
        file1: Option<&[u8]>,
        file2: Option<&[u8]>,
        payload: &Payload,
    ) -> Result<()> {
        let creds = current_credentials();
        let timestamp = Timestamp::now();
        let alignment = self.inner.geo.alignment;
        let mut converted: Option<usize> = None;
        loop {
            let marker_payload;
            let spec = match converted {
                None => RecordSpec {
                    operation,
                    result,
                    timestamp,
                    creds: Some(&creds),
                    file1,
                    file2,
                    payload,
                },
                Some(required) => {
                    marker_payload = Payload::Size(required as u64);
                    RecordSpec {
                        operation: OpCode::TooBig.after(),
                        result: 0,
                        timestamp,
                        creds: Some(&creds),
                        file1: None,
                        file2: None,
                        payload: &marker_payload,
                    }
                }
            };
            let next_header = spec.encoded_len(alignment);
            let commit_size = self.inner.options.load().commit_size;
            if next_header > commit_size {
                if converted.is_some() {
                    // A microscopic buffer: even the marker does not fit.
                    return Err(ShallError::TooBig {
                        required: next_header,
                        commit_size,
                    });
                }
                error!(
                    target: "shall::engine",
                    required = next_header,
                    commit_size,
                    "record does not fit in the commit buffer"
                );
                if self.inner.options.load().too_big == TooBigPolicy::Error {
                    return Err(ShallError::TooBig {
                        required: next_header,
                        commit_size,
                    });
                }
                converted = Some(next_header);
                continue;
            }
            let bytes = encode_record(&spec, alignment).map_err(ShallError::Invalid)?;
            match self.store_record(intr, &bytes, converted.is_some())? {
                StoreOutcome::Stored | StoreOutcome::Dropped => return Ok(()),
                StoreOutcome::Shrunk => {
                    if converted.is_some() {
                        // Don't re-report a marker that stopped fitting.
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Store an already-encoded record, handling the space gates.
    fn store_record(
        &self,
        intr: &Interrupt,
        bytes: &[u8],
        is_marker: bool,
    ) -> Result<StoreOutcome> {
        let inner = &*self.inner;
        let next_header = bytes.len();
        let required = align_up(RECORD_HEADER_SIZE, inner.geo.alignment) + next_header;

        let mut state = inner.state.lock();

        // A remount barrier may be in progress; wait it out on the log
        // queue, which is notified when commits are re-allowed.
        while !inner.allow_commit_task.load(Ordering::Acquire) {
            drop(state);
            {
                let mut q = inner.lq.lock.lock();
                wait_interruptible(&inner.lq.cond, &mut q, intr, |_| {
                    inner.allow_commit_task.load(Ordering::Acquire)
                })?;
            }
            state = inner.state.lock();
        }

        // The remount we just waited for may have shrunk the buffer.
        if next_header > inner.options.load().commit_size {
            drop(state);
            return Ok(StoreOutcome::Shrunk);
        }

        // Device-space gate, always reserving one bare-header slot for the
        // OVERFLOW marker.
        if required as u64 + state.read.data_length > inner.geo.data_space {
            state = self.log_overflow(state, next_header as u64)?;
            if inner.options.load().overflow == OverflowPolicy::Drop {
                drop(state);
                return Ok(StoreOutcome::Dropped);
            }
            loop {
                drop(state);
                {
                    let mut q = inner.lq.lock.lock();
                    wait_interruptible(&inner.lq.cond, &mut q, intr, |q| {
                        q.num_dropped == 0
                            || inner.options.load().overflow == OverflowPolicy::Drop
                    })?;
                }
                if inner.options.load().overflow == OverflowPolicy::Drop {
                    return Ok(StoreOutcome::Dropped);
                }
                state = inner.state.lock();
                if inner.options.load().overflow == OverflowPolicy::Drop {
                    drop(state);
                    return Ok(StoreOutcome::Dropped);
                }
                if next_header > inner.options.load().commit_size {
                    drop(state);
                    return Ok(StoreOutcome::Shrunk);
                }
                if required as u64 + state.read.data_length <= inner.geo.data_space {
                    break;
                }
            }
        }

        // Space in the device and the mutex in hand; make room in the
        // buffer if needed, then stage the record.
        if state.read.buffer_written + next_header > inner.options.load().commit_size {
            state = inner.flush_buffer(state, FlushReason::Size, false)?;
        }
        let start = state.read.buffer_written;
        state.other.commit_buffer[start..start + next_header].copy_from_slice(bytes);
        state.read.buffer_written += next_header;
        state.read.data_length += next_header as u64;
        state.other.logged += 1;
        if state.other.max_length < state.read.data_length {
            state.other.max_length = state.read.data_length;
        }
        trace!(
            target: "shall::engine",
            len = next_header,
            data_length = state.read.data_length,
            buffered = state.read.buffer_written,
            marker = is_marker,
            "record_appended"
        );
        drop(state);
        inner.some_data.store(true, Ordering::Release);
        inner.data_cond.notify_all();
        Ok(StoreOutcome::Stored)
    }

    /// Account an overflow and, on the first one, emit the OVERFLOW marker
    /// from the reserved slot. Engine mutex held on entry and exit.
    fn log_overflow<'a>(
        &'a self,
        state: MutexGuard<'a, EngineState>,
        space: u64,
    ) -> Result<MutexGuard<'a, EngineState>> {
        let inner = &*self.inner;
        let previous = inner.lq.record_drop(space);
        if previous > 0 {
            // Somebody else already reported this overflow episode.
            return Ok(state);
        }
        warn!(
            target: "shall::overflow",
            required = space,
            data_length = state.read.data_length,
            data_space = inner.geo.data_space,
            "journal_overflow"
        );
        let next_header = align_up(RECORD_HEADER_SIZE, inner.geo.alignment);
        if next_header as u64 + state.read.data_length > inner.geo.data_space {
            error!(
                target: "shall::overflow",
                "internal error: reserved overflow slot missing"
            );
            return Ok(state);
        }
        let spec = RecordSpec {
            operation: OpCode::Overflow.after(),
            result: 0,
            timestamp: Timestamp::now(),
            creds: None,
            file1: None,
            file2: None,
            payload: &Payload::None,
        };
        let bytes = encode_record(&spec, inner.geo.alignment).map_err(ShallError::Invalid)?;
        self.push_marker(state, &bytes)
    }

    /// Emit a RECOVER marker if an overflow episode is pending and there is
    /// room for the marker plus the reserved slot. Engine mutex held.
    fn log_recovery<'a>(
        &'a self,
        state: MutexGuard<'a, EngineState>,
    ) -> Result<MutexGuard<'a, EngineState>> {
        let inner = &*self.inner;
        let alignment = inner.geo.alignment;
        let next_header = align_up(RECORD_HEADER_SIZE + 8, alignment);
        let required = next_header + align_up(RECORD_HEADER_SIZE, alignment);
        if required as u64 + state.read.data_length > inner.geo.data_space {
            return Ok(state);
        }
        let Some(counters) = inner.lq.take() else {
            return Ok(state);
        };
        info!(
            target: "shall::overflow",
            num_dropped = counters.num_dropped,
            extra_space = counters.extra_space,
            "journal_recovered"
        );
        let spec = RecordSpec {
            operation: OpCode::Recover.after(),
            result: i32::try_from(counters.num_dropped).unwrap_or(i32::MAX),
            timestamp: Timestamp::now(),
            creds: None,
            file1: None,
            file2: None,
            payload: &Payload::Size(counters.extra_space),
        };
        let bytes = encode_record(&spec, alignment).map_err(ShallError::Invalid)?;
        self.push_marker(state, &bytes)
    }

    /// Stage a marker record directly into the commit buffer.
    fn push_marker<'a>(
        &'a self,
        mut state: MutexGuard<'a, EngineState>,
        bytes: &[u8],
    ) -> Result<MutexGuard<'a, EngineState>> {
        let inner = &*self.inner;
        let commit_size = inner.options.load().commit_size;
        if state.read.buffer_written + bytes.len() > commit_size {
            state = inner.flush_buffer(state, FlushReason::Size, false)?;
        }
        let start = state.read.buffer_written;
        state.other.commit_buffer[start..start + bytes.len()].copy_from_slice(bytes);
        state.read.buffer_written += bytes.len();
        state.read.data_length += bytes.len() as u64;
        state.other.logged += 1;
        if state.other.max_length < state.read.data_length {
            state.other.max_length = state.read.data_length;
        }
        if state.read.buffer_written >= commit_size {
            state = inner.flush_buffer(state, FlushReason::Size, false)?;
        }
        inner.some_data.store(true, Ordering::Release);
        inner.data_cond.notify_all();
        Ok(state)
    }

    // ── Commit barrier ──────────────────────────────────────────────────

    /// Synchronous full flush plus superblock rotation: a durability
    /// boundary for everything appended before the call.
    pub fn commit(&self, intr: &Interrupt) -> Result<()> {
        self.commit_with(intr, |_| Ok(()))
    }

    /// Commit barrier with a caller-provided step run under the engine
    /// mutex before commits are re-allowed (remount uses this to swap
    /// options and the commit buffer).
    fn commit_with<F>(&self, intr: &Interrupt, under_mutex: F) -> Result<()>
    where
        F: FnOnce(&mut EngineState) -> Result<()>,
    {
        let inner = &*self.inner;
        let allow = inner.allow_commit_task.swap(false, Ordering::SeqCst);
        let outcome = (|| {
            // Wait out any commit already in flight; the log queue is
            // notified whenever one finishes.
            {
                let mut q = inner.lq.lock.lock();
                wait_interruptible(&inner.lq.cond, &mut q, intr, |_| {
                    !inner.inside_commit.load(Ordering::Acquire)
                })?;
            }
            let mut state = inner.state.lock();
            state = inner.flush_buffer(state, FlushReason::Forced, true)?;
            // The barrier itself is a durability point even when nothing
            // was drained: bump the version and rotate a superblock.
            state.other.version += 1;
            state.other.last_commit = Instant::now();
            state.other.commit_count[FlushReason::Forced as usize] += 1;
            let slot = inner.next_sb_slot(state.other.last_sb_written);
            state.other.last_sb_written = slot;
            let image = inner.superblock_snapshot(&state);
            drop(state);
            inner.dev.sync()?;
            sbio::write_superblock(&*inner.dev, &image, slot, true)?;
            let mut state = inner.state.lock();
            under_mutex(&mut state)?;
            drop(state);
            Ok(())
        })();
        if allow {
            inner.allow_commit_task.store(true, Ordering::SeqCst);
        }
        inner.lq.cond.notify_all();
        outcome
    }

    /// Swap mount options; a commit barrier makes the change atomic with
    /// respect to producers and the commit task. Moving from `wait` to
    /// `drop` releases every producer stuck in the overflow gate.
    pub fn remount(&self, intr: &Interrupt, options: MountOptions) -> Result<()> {
        options.validate()?;
        let inner = &*self.inner;
        let was_wait = inner.options.load().overflow == OverflowPolicy::Wait;
        let new_options = options.clone();
        self.commit_with(intr, move |state| {
            if state.other.commit_buffer.len() != new_options.commit_size {
                state.other.commit_buffer = vec![0_u8; new_options.commit_size];
            }
            Ok(())
        })?;
        let wake_waiters = was_wait && options.overflow == OverflowPolicy::Drop;
        inner.options.store(Arc::new(options));
        info!(
            target: "shall::engine",
            options = %inner.options.load(),
            "journal_remounted"
        );
        if wake_waiters {
            inner.lq.cond.notify_all();
        }
        Ok(())
    }

    // ── Snapshot hooks (freeze/unfreeze) ────────────────────────────────

    /// Commit everything and mark the device clean for a snapshot; the
    /// caller guarantees no appends until [`Self::unfreeze`].
    pub fn freeze(&self, intr: &Interrupt) -> Result<()> {
        let inner = &*self.inner;
        self.commit_with(intr, |state| {
            state.other.sb_flags &= !SB_DIRTY;
            Ok(())
        })?;
        let mut state = inner.state.lock();
        state.other.version += 1;
        let slot = state.other.last_sb_written;
        state.other.last_sb_written = 0;
        let image = inner.superblock_snapshot(&state);
        drop(state);
        sbio::write_superblock(&*inner.dev, &image, slot, false)?;
        sbio::write_superblock(&*inner.dev, &image, 0, true)?;
        Ok(())
    }

    /// Resume after a snapshot: re-dirty the superblocks.
    pub fn unfreeze(&self) -> Result<()> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        state.other.sb_flags |= SB_DIRTY;
        state.other.version += 1;
        state.other.last_sb_written = 1;
        let image = inner.superblock_snapshot(&state);
        drop(state);
        sbio::write_superblock(&*inner.dev, &image, 0, false)?;
        sbio::write_superblock(&*inner.dev, &image, 1, true)?;
        Ok(())
    }

    // ── Consumer path ───────────────────────────────────────────────────

    /// Drain complete records into `buf`, committed device bytes first,
    /// then the uncommitted buffer tail. The cursor only advances past
    /// records that were fully delivered.
    pub fn read_records(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        let mut done = 0_usize;
        let mut failure: Option<ShallError> = None;

        while buf.len() - done >= RECORD_HEADER_SIZE {
            let save = state.read.clone();
            let mut header_bytes = [0_u8; RECORD_HEADER_SIZE];
            match inner.consume(&mut state, RECORD_HEADER_SIZE, Some(&mut header_bytes)) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    state.read = save;
                    failure = Some(err);
                    break;
                }
            }
            let header = match shall_ondisk::parse_header(&header_bytes) {
                Ok(header) => header,
                Err(err) => {
                    state.read = save;
                    failure = Some(ShallError::Invalid(err));
                    break;
                }
            };
            let next_header = header.next_header as usize;
            let remainder = next_header - RECORD_HEADER_SIZE;
            if remainder as u64 > state.read.data_length {
                state.read = save;
                failure = Some(ShallError::Invalid(shall_types::ParseError::InvalidField {
                    field: "next_header",
                    reason: "record runs past the end of the journal",
                }));
                break;
            }
            if buf.len() - done < next_header {
                state.read = save;
                if done == 0 {
                    failure = Some(ShallError::Format(format!(
                        "record of {next_header} bytes does not fit in a {} byte buffer",
                        buf.len()
                    )));
                }
                break;
            }
            buf[done..done + RECORD_HEADER_SIZE].copy_from_slice(&header_bytes);
            if remainder > 0 {
                match inner.consume(
                    &mut state,
                    remainder,
                    Some(&mut buf[done + RECORD_HEADER_SIZE..done + next_header]),
                ) {
                    Ok(n) if n == remainder => {}
                    Ok(_) => {
                        state.read = save;
                        failure = Some(ShallError::Invalid(
                            shall_types::ParseError::InvalidField {
                                field: "next_header",
                                reason: "record body truncated",
                            },
                        ));
                        break;
                    }
                    Err(err) => {
                        state.read = save;
                        failure = Some(err);
                        break;
                    }
                }
            }
            done += next_header;
        }

        self.finish_drain(state);
        match (done, failure) {
            (0, Some(err)) => Err(err),
            (done, _) => Ok(done),
        }
    }

    /// Discard up to `len` bytes of whole records without copying them out;
    /// a partial record at the tail is not consumed.
    pub fn discard(&self, len: u64) -> Result<u64> {
        if len < RECORD_HEADER_SIZE as u64 {
            return Ok(0);
        }
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        let mut remaining = len;
        let mut done = 0_u64;
        let mut failure: Option<ShallError> = None;

        while remaining >= RECORD_HEADER_SIZE as u64 {
            let save = state.read.clone();
            let mut header_bytes = [0_u8; RECORD_HEADER_SIZE];
            match inner.consume(&mut state, RECORD_HEADER_SIZE, Some(&mut header_bytes)) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    state.read = save;
                    failure = Some(err);
                    break;
                }
            }
            let header = match shall_ondisk::parse_header(&header_bytes) {
                Ok(header) => header,
                Err(err) => {
                    state.read = save;
                    failure = Some(ShallError::Invalid(err));
                    break;
                }
            };
            let record_len = header.next_header as u64;
            if remaining < record_len {
                state.read = save;
                break;
            }
            let remainder = record_len as usize - RECORD_HEADER_SIZE;
            if remainder > 0 {
                match inner.consume(&mut state, remainder, None) {
                    Ok(n) if n == remainder => {}
                    Ok(_) | Err(_) => {
                        state.read = save;
                        failure = Some(ShallError::Invalid(
                            shall_types::ParseError::InvalidField {
                                field: "next_header",
                                reason: "record body truncated",
                            },
                        ));
                        break;
                    }
                }
            }
            remaining -= record_len;
            done += record_len;
        }

        self.finish_drain(state);
        match (done, failure) {
            (0, Some(err)) => Err(err),
            (done, _) => Ok(done),
        }
    }

    /// Common tail of every drain: refresh `some_data`, try to close a
    /// pending overflow episode, wake producers waiting for space.
    fn finish_drain(&self, state: MutexGuard<'_, EngineState>) {
        let inner = &*self.inner;
        inner.some_data.store(
            state.read.data_length >= RECORD_HEADER_SIZE as u64,
            Ordering::Release,
        );
        match self.log_recovery(state) {
            Ok(guard) => drop(guard),
            Err(err) => {
                error!(target: "shall::overflow", error = %err, "recovery marker failed");
            }
        }
        inner.lq.cond.notify_all();
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Unmount: stop the commit task, flush everything, clear DIRTY and
    /// refresh a spread of superblocks. Waits a bounded time for open
    /// reader/control handles to close.
    pub fn unmount(&self, intr: &Interrupt) -> Result<()> {
        let inner = &*self.inner;
        if inner.unmounted.swap(true, Ordering::SeqCst) {
            return Err(ShallError::NotMounted("journal already unmounted".into()));
        }

        // Tell readers the stream is over; they see end-of-file.
        inner.logs_valid.store(false, Ordering::SeqCst);
        inner.data_cond.notify_all();
        let mut retry = 10;
        while inner.has_open_handles() && retry > 0 {
            thread::sleep(Duration::from_millis(100));
            retry -= 1;
        }

        inner.allow_commit_task.store(false, Ordering::SeqCst);
        {
            let mut q = inner.lq.lock.lock();
            wait_interruptible(&inner.lq.cond, &mut q, intr, |_| {
                !inner.inside_commit.load(Ordering::Acquire)
            })?;
        }
        inner.task_ctl.request_stop();
        if let Some(handle) = inner.task.lock().take() {
            let _ = handle.join();
        }

        let mut state = inner.state.lock();
        state = inner.flush_buffer(state, FlushReason::Forced, true)?;
        state.other.version += 1;
        state.other.sb_flags &= !SB_DIRTY;
        let image = inner.superblock_snapshot(&state);
        drop(state);
        inner.dev.sync()?;
        let next = sbio::write_spread_superblocks(&*inner.dev, &image)?;
        inner.state.lock().other.last_sb_written = next;
        info!(target: "shall::engine", version = image.version, "journal_unmounted");
        Ok(())
    }

    /// Observability snapshot, the `info` contract.
    #[must_use]
    pub fn info(&self) -> InfoSnapshot {
        let inner = &*self.inner;
        let state = inner.state.lock();
        InfoSnapshot {
            mounted_secs: inner.mounted_at.elapsed().as_secs(),
            logged: state.other.logged,
            maxsize: state.other.max_length,
            size: state.read.data_length,
            space: inner.geo.data_space,
            devsize: inner.geo.device_size,
            start: state.read.data_start,
            commit_size: state.other.commit_count[FlushReason::Size as usize],
            commit_time: state.other.commit_count[FlushReason::Time as usize],
            commit_forced: state.other.commit_count[FlushReason::Forced as usize],
            version: state.other.version,
            flags: state.other.sb_flags,
            nsuper: inner.geo.num_superblocks,
            align: inner.geo.alignment,
        }
    }

    pub(crate) fn logs_valid(&self) -> &AtomicBool {
        &self.inner.logs_valid
    }

    pub(crate) fn logs_reading(&self) -> &AtomicBool {
        &self.inner.logs_reading
    }

    pub(crate) fn logs_writing(&self) -> &AtomicU32 {
        &self.inner.logs_writing
    }

    pub(crate) fn some_data_flag(&self) -> &AtomicBool {
        &self.inner.some_data
    }

    /// Wait until records are available, the journal is unmounted, or the
    /// interrupt fires. Returns false at end-of-stream.
    pub(crate) fn wait_for_data(&self, intr: &Interrupt) -> Result<bool> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        wait_interruptible(&inner.data_cond, &mut state, intr, |_| {
            inner.some_data.load(Ordering::Acquire) || !inner.logs_valid.load(Ordering::Acquire)
        })?;
        Ok(inner.logs_valid.load(Ordering::Acquire))
    }
}

impl JournalInner {
    fn has_open_handles(&self) -> bool {
        self.logs_reading.load(Ordering::Acquire) || self.logs_writing.load(Ordering::Acquire) > 0
    }

    /// Next rotation slot: round-robin in `[1, N)`, copy 0 being reserved
    /// for clean unmount and freeze points. A single-superblock geometry
    /// has no choice but to reuse copy 0.
    fn next_sb_slot(&self, last: u32) -> u32 {
        if self.geo.num_superblocks <= 1 {
            return 0;
        }
        let next = last + 1;
        if next >= self.geo.num_superblocks { 1 } else { next }
    }

    /// Superblock image of the current state; engine mutex held.
    fn superblock_snapshot(&self, state: &EngineState) -> Superblock {
        Superblock {
            device_size: self.geo.device_size,
            data_space: self.geo.data_space,
            data_start: state.read.data_start,
            data_length: state.read.data_length,
            max_length: state.other.max_length,
            version: state.other.version,
            flags: state.other.sb_flags,
            alignment: self.geo.alignment,
            num_superblocks: self.geo.num_superblocks,
            this_superblock: 0,
            new_size: 0,
            new_alignment: 0,
            new_superblocks: 0,
        }
    }

    /// Write the unflushed portion of the commit buffer to the ring.
    ///
    /// Each iteration records the intent under the mutex (cursor advance
    /// plus a staged copy of the chunk), releases the mutex for the
    /// physical write, and reacquires it. Producers may append into the
    /// freed head of the buffer while a chunk write is in flight; chunk
    /// ranges can never overlap because `commit_ptr` advances before the
    /// mutex is released. On full drain the version is bumped and one
    /// superblock rotates.
    fn flush_buffer<'a>(
        &'a self,
        mut state: MutexGuard<'a, EngineState>,
        reason: FlushReason,
        sync: bool,
    ) -> Result<MutexGuard<'a, EngineState>> {
        let mut wrote_any = false;
        loop {
            if state.read.committed >= state.read.data_length {
                state.other.last_commit = Instant::now();
                state.read.buffer_read = 0;
                state.read.buffer_written = 0;
                if wrote_any {
                    state.other.version += 1;
                    let slot = self.next_sb_slot(state.other.last_sb_written);
                    state.other.last_sb_written = slot;
                    if reason != FlushReason::Forced {
                        state.other.commit_count[reason as usize] += 1;
                    }
                    let version = state.other.version;
                    let image = self.superblock_snapshot(&state);
                    drop(state);
                    if sync {
                        // Data must be durable before the superblock
                        // claims it.
                        self.dev.sync()?;
                    }
                    sbio::write_superblock(&*self.dev, &image, slot, sync)?;
                    debug!(
                        target: "shall::commit",
                        version,
                        slot,
                        reason = reason as usize,
                        sync,
                        "commit_complete"
                    );
                    state = self.state.lock();
                }
                return Ok(state);
            }

            let offset = u64::from(state.read.commit_ptr.offset);
            let block = state.read.commit_ptr.block;
            let pending = state.read.data_length - state.read.committed;
            let todo = (DEV_BLOCK_SIZE - offset).min(pending) as usize;
            let start = state.read.buffer_read;
            // Stage the chunk before unlocking: a parallel flush may drain
            // the rest of the buffer and let producers reuse this region.
            let chunk = state.other.commit_buffer[start..start + todo].to_vec();
            state.read.buffer_read += todo;
            state.read.committed += todo as u64;
            state.read.commit_ptr.offset += todo as u32;
            if state.read.commit_ptr.offset >= DEV_BLOCK_SIZE as u32 {
                state.read.commit_ptr.offset -= DEV_BLOCK_SIZE as u32;
                let max = self.geo.max_ptr;
                state.read.commit_ptr.advance_block(&max);
            }
            drop(state);
            self.dev
                .write_all_at(ByteOffset(block * DEV_BLOCK_SIZE + offset), &chunk)?;
            wrote_any = true;
            state = self.state.lock();
        }
    }

    /// Move `len` journal bytes past the cursor: committed device bytes
    /// first, then the uncommitted buffer tail. `dest` of `None` skips the
    /// copy (and the device reads) while advancing identically.
    ///
    /// Returns 0 without touching anything when fewer than `len` bytes are
    /// in the journal. Engine mutex held throughout.
    fn consume(
        &self,
        state: &mut EngineState,
        len: usize,
        mut dest: Option<&mut [u8]>,
    ) -> Result<usize> {
        if len == 0 {
            return Ok(0);
        }
        if len as u64 > state.read.data_length {
            return Ok(0);
        }
        state.read.data_length -= len as u64;
        let mut pos = 0_usize;

        if state.read.committed > 0 {
            let mut offset = u64::from(state.read.start_ptr.offset);
            while pos < len && state.read.committed > 0 {
                let todo = ((len - pos) as u64)
                    .min(state.read.committed)
                    .min(DEV_BLOCK_SIZE - offset) as usize;
                if let Some(dest) = dest.as_deref_mut() {
                    let block = state.read.start_ptr.block;
                    self.dev.read_exact_at(
                        ByteOffset(block * DEV_BLOCK_SIZE + offset),
                        &mut dest[pos..pos + todo],
                    )?;
                }
                state.read.data_start += todo as u64;
                if state.read.data_start >= self.geo.data_space {
                    state.read.data_start -= self.geo.data_space;
                }
                pos += todo;
                state.read.committed -= todo as u64;
                offset += todo as u64;
                if offset >= DEV_BLOCK_SIZE {
                    offset -= DEV_BLOCK_SIZE;
                    let max = self.geo.max_ptr;
                    state.read.start_ptr.advance_block(&max);
                }
            }
            state.read.start_ptr.offset = offset as u32;
        }

        if pos < len {
            // The remainder lives in the commit buffer and has never been
            // written out; the commit position skips over it along with
            // the start of the journal.
            let rest = len - pos;
            let start = state.read.buffer_read;
            if let Some(dest) = dest.as_deref_mut() {
                dest[pos..].copy_from_slice(&state.other.commit_buffer[start..start + rest]);
            }
            state.read.buffer_read += rest;
            state.read.data_start += rest as u64;
            if state.read.data_start >= self.geo.data_space {
                state.read.data_start -= self.geo.data_space;
            }
            let max = self.geo.max_ptr;
            state.read.start_ptr.offset += rest as u32;
            while state.read.start_ptr.offset >= DEV_BLOCK_SIZE as u32 {
                state.read.start_ptr.offset -= DEV_BLOCK_SIZE as u32;
                state.read.start_ptr.advance_block(&max);
            }
            state.read.commit_ptr.offset += rest as u32;
            while state.read.commit_ptr.offset >= DEV_BLOCK_SIZE as u32 {
                state.read.commit_ptr.offset -= DEV_BLOCK_SIZE as u32;
                state.read.commit_ptr.advance_block(&max);
            }
            if state.read.buffer_read >= state.read.buffer_written {
                state.read.buffer_read = 0;
                state.read.buffer_written = 0;
            }
        }
        Ok(len)
    }
}

/// Background commit task: sleep out the cadence, run a full synchronous
/// flush, repeat. Holds only a weak reference so an engine dropped without
/// unmount is not kept alive.
fn run_commit_task(weak: &Weak<JournalInner>, ctl: &Arc<TaskControl>) {
    debug!(target: "shall::commit", "commit_task_started");
    loop {
        if ctl.stopped() {
            break;
        }
        let delay = {
            let Some(inner) = weak.upgrade() else { break };
            let commit_interval =
                Duration::from_secs(inner.options.load().commit_seconds.max(1));
            let since = inner.state.lock().other.last_commit.elapsed();
            if since < commit_interval {
                commit_interval - since
            } else if !inner.allow_commit_task.load(Ordering::Acquire) {
                // Asked not to commit; sleep a full cycle.
                commit_interval
            } else if inner.inside_commit.swap(true, Ordering::SeqCst) {
                // A commit is running right now; no point waiting less.
                commit_interval
            } else {
                let state = inner.state.lock();
                match inner.flush_buffer(state, FlushReason::Time, true) {
                    Ok(guard) => drop(guard),
                    Err(err) => {
                        error!(target: "shall::commit", error = %err, "timed_commit_failed");
                    }
                }
                inner.inside_commit.store(false, Ordering::SeqCst);
                inner.lq.cond.notify_all();
                continue;
            }
        };
        if ctl.wait_stop_for(delay) {
            break;
        }
    }
    debug!(target: "shall::commit", "commit_task_stopped");
}

/// Point-in-time view of the engine counters, the `info` contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoSnapshot {
    pub mounted_secs: u64,
    pub logged: u64,
    pub maxsize: u64,
    pub size: u64,
    pub space: u64,
    pub devsize: u64,
    pub start: u64,
    pub commit_size: u64,
    pub commit_time: u64,
    pub commit_forced: u64,
    pub version: u64,
    pub flags: u32,
    pub nsuper: u32,
    pub align: u32,
}

impl fmt::Display for InfoSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mounted: {}", self.mounted_secs)?;
        writeln!(f, "logged: {}", self.logged)?;
        writeln!(f, "maxsize: {}", self.maxsize)?;
        writeln!(f, "size: {}", self.size)?;
        writeln!(f, "space: {}", self.space)?;
        writeln!(f, "devsize: {}", self.devsize)?;
        writeln!(f, "start: {}", self.start)?;
        writeln!(f, "commit_size: {}", self.commit_size)?;
        writeln!(f, "commit_time: {}", self.commit_time)?;
        writeln!(f, "commit_forced: {}", self.commit_forced)?;
        writeln!(f, "version: {}", self.version)?;
        writeln!(f, "flags: {}", self.flags)?;
        writeln!(f, "nsuper: {}", self.nsuper)?;
        writeln!(f, "align: {}", self.align)
    }
}

// ── Typed append helpers ────────────────────────────────────────────────

impl Journal {
    /// Log an event with no names and no payload.
    pub fn log_plain(&self, intr: &Interrupt, operation: i32, result: i32) -> Result<()> {
        self.append_record(intr, operation, result, None, None, &Payload::None)
    }

    /// Log an event with one name.
    pub fn log_name(
        &self,
        intr: &Interrupt,
        operation: i32,
        name: &[u8],
        result: i32,
    ) -> Result<()> {
        self.append_record(intr, operation, result, Some(name), None, &Payload::None)
    }

    /// Log an event with two names (MOVE, SWAP, LINK).
    pub fn log_two_names(
        &self,
        intr: &Interrupt,
        operation: i32,
        name1: &[u8],
        name2: &[u8],
        result: i32,
    ) -> Result<()> {
        self.append_record(
            intr,
            operation,
            result,
            Some(name1),
            Some(name2),
            &Payload::None,
        )
    }

    /// Log an event carrying a file id (OPEN, CLOSE, COMMIT).
    pub fn log_fileid(
        &self,
        intr: &Interrupt,
        operation: i32,
        fileid: u32,
        result: i32,
    ) -> Result<()> {
        self.append_record(intr, operation, result, None, None, &Payload::FileId(fileid))
    }

    /// Log an attribute change with one name.
    pub fn log_name_attr(
        &self,
        intr: &Interrupt,
        operation: i32,
        name: &[u8],
        attr: shall_ondisk::record::Attr,
        result: i32,
    ) -> Result<()> {
        self.append_record(intr, operation, result, Some(name), None, &Payload::Attr(attr))
    }

    /// Log an ACL change.
    pub fn log_acl(
        &self,
        intr: &Interrupt,
        operation: i32,
        name: &[u8],
        acl: Acl,
        result: i32,
    ) -> Result<()> {
        self.append_record(intr, operation, result, Some(name), None, &Payload::Acl(acl))
    }

    /// Log an extended-attribute change.
    pub fn log_xattr(
        &self,
        intr: &Interrupt,
        operation: i32,
        name: &[u8],
        xattr: Xattr,
        result: i32,
    ) -> Result<()> {
        self.append_record(intr, operation, result, Some(name), None, &Payload::Xattr(xattr))
    }

    /// Log a write to a file region, honouring the `data=` mount mode:
    /// region only, region plus content hash, or the raw bytes sliced
    /// across records.
    pub fn log_write(
        &self,
        intr: &Interrupt,
        region: Region,
        data: &[u8],
        result: i32,
    ) -> Result<()> {
        let operation = OpCode::Write.after();
        match self.inner.options.load().data {
            DataMode::None => self.append_record(
                intr,
                operation,
                result,
                None,
                None,
                &Payload::Region(region),
            ),
            DataMode::Hash => self.append_record(
                intr,
                operation,
                result,
                None,
                None,
                &Payload::Hash {
                    region,
                    digest: content_digest(data),
                },
            ),
            DataMode::Full => {
                let mut offset = 0_usize;
                loop {
                    let todo = (data.len() - offset).min(DATA_SLICE_MAX);
                    let slice = Region {
                        start: region.start + offset as u64,
                        length: todo as u64,
                        fileid: region.fileid,
                    };
                    self.append_record(
                        intr,
                        operation,
                        result,
                        None,
                        None,
                        &Payload::Data {
                            region: slice,
                            bytes: data[offset..offset + todo].to_vec(),
                        },
                    )?;
                    offset += todo;
                    if offset >= data.len() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Log a user-supplied message (the `userlog` control command); the
    /// text is truncated to 128 bytes.
    pub fn log_userlog(&self, intr: &Interrupt, text: &[u8]) -> Result<()> {
        let text = &text[..text.len().min(128)];
        self.log_name(intr, OpCode::UserLog.after(), text, 0)
    }
}
