//! Shared-memory command segment.
//!
//! A single request/response slot living in a memory-mapped file, shared by
//! the daemon (which creates it) and every client (which open it). Access to
//! the slot is serialized by an advisory lock word holding the pid of the
//! client currently using it.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────┬──────────────────────┬──────────────────────┐
//! │ header (64 B)    │ request area (8 KiB) │ response area (8 KiB)│
//! └──────────────────┴──────────────────────┴──────────────────────┘
//! ```
//!
//! # Slot states
//!
//! ```text
//! EMPTY ──client──▶ COMMAND ──daemon──▶ EXECUTING ──daemon──▶ RESPONSE
//!   ▲                  │                                         │
//!   └──── withdraw ────┘◀──────────────── client ────────────────┘
//! ```
//!
//! Payload bytes are only touched by the side that currently owns the slot
//! state; the state word is stored with `Release` after a write and loaded
//! with `Acquire` before a read.

use std::ffi::c_void;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use thiserror::Error;
use tracing::debug;

/// Identifies a texshare command segment ("TXSH").
pub const SEGMENT_MAGIC: u32 = 0x5458_5348;

/// Bumped whenever the header or area layout changes.
pub const LAYOUT_VERSION: u32 = 1;

/// Capacity of each payload area in bytes.
pub const SLOT_CAPACITY: usize = 8192;

const HEADER_SIZE: usize = 64;
const REQUEST_OFFSET: usize = HEADER_SIZE;
const RESPONSE_OFFSET: usize = REQUEST_OFFSET + SLOT_CAPACITY;

/// Total size of the mapped segment.
pub const SEGMENT_SIZE: usize = RESPONSE_OFFSET + SLOT_CAPACITY;

const MAX_POLL_INTERVAL: Duration = Duration::from_millis(2);
const MIN_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// How often either side re-reads the slot while waiting up to `wait`.
pub fn poll_interval(wait: Duration) -> Duration {
    (wait / 10).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

#[repr(C)]
struct SegmentHeader {
    magic: AtomicU32,
    layout_version: AtomicU32,
    /// Pid of the client holding the slot, 0 when free
    lock_owner: AtomicU32,
    state: AtomicU32,
    next_seq: AtomicU64,
    request_seq: AtomicU64,
    response_seq: AtomicU64,
    request_len: AtomicU32,
    response_len: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() <= HEADER_SIZE);

/// State of the request/response slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    Empty = 0,
    Command = 1,
    Executing = 2,
    Response = 3,
}

impl SlotState {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Empty),
            1 => Some(Self::Command),
            2 => Some(Self::Executing),
            3 => Some(Self::Response),
            _ => None,
        }
    }
}

/// A mapped command segment.
pub struct ShmSegment {
    base: *mut u8,
    path: PathBuf,
    /// Keeps the descriptor open for the lifetime of the mapping
    _file: File,
    /// The creating side removes the backing file on drop
    owner: bool,
}

// SAFETY: header fields are only accessed through atomics and payload areas
// are only touched by the side that owns the current slot state.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Creates (or recreates) the segment at `path` and initializes it.
    ///
    /// Any previous content is discarded. The file is removed again when
    /// the returned segment is dropped.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| SegmentError::io(&path, e))?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| SegmentError::io(&path, e))?;
        file.set_len(SEGMENT_SIZE as u64)
            .map_err(|e| SegmentError::io(&path, e))?;

        let segment = Self {
            base: map_file(&file, &path)?,
            path,
            _file: file,
            owner: true,
        };

        let header = segment.header();
        header.layout_version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header.lock_owner.store(0, Ordering::Relaxed);
        header.state.store(SlotState::Empty as u32, Ordering::Relaxed);
        header.next_seq.store(0, Ordering::Relaxed);
        header.magic.store(SEGMENT_MAGIC, Ordering::Release);

        debug!(path = %segment.path.display(), size = SEGMENT_SIZE, "Command segment created");
        Ok(segment)
    }

    /// Opens a segment previously created by the daemon.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| SegmentError::io(&path, e))?;
        let size = file
            .metadata()
            .map_err(|e| SegmentError::io(&path, e))?
            .len();
        if size < SEGMENT_SIZE as u64 {
            return Err(SegmentError::TooSmall {
                size,
                expected: SEGMENT_SIZE as u64,
            });
        }

        let segment = Self {
            base: map_file(&file, &path)?,
            path,
            _file: file,
            owner: false,
        };

        let header = segment.header();
        if header.magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
            return Err(SegmentError::BadMagic {
                path: segment.path.clone(),
            });
        }
        let found = header.layout_version.load(Ordering::Relaxed);
        if found != LAYOUT_VERSION {
            return Err(SegmentError::LayoutMismatch {
                found,
                expected: LAYOUT_VERSION,
            });
        }

        Ok(segment)
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is page aligned and at least SEGMENT_SIZE long.
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    // ========================================================================
    // Advisory Lock
    // ========================================================================

    /// Attempts to take the slot lock for `pid` without waiting.
    pub fn try_lock(&self, pid: u32) -> bool {
        pid != 0
            && self
                .header()
                .lock_owner
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Releases the lock if `pid` holds it.
    pub fn release_lock(&self, pid: u32) -> bool {
        self.header()
            .lock_owner
            .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns the pid currently holding the lock.
    pub fn lock_owner(&self) -> Option<u32> {
        match self.header().lock_owner.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Clears a lock presumed orphaned by `owner`.
    ///
    /// Only succeeds if `owner` still holds the lock, so a lock that changed
    /// hands since the caller looked is left alone.
    pub fn clear_stale_lock(&self, owner: u32) -> bool {
        let cleared = self.release_lock(owner);
        if cleared {
            debug!(owner, path = %self.path.display(), "Cleared command segment lock");
        }
        cleared
    }

    // ========================================================================
    // Slot
    // ========================================================================

    /// Current slot state. Unknown raw values read as `Empty`.
    pub fn state(&self) -> SlotState {
        SlotState::from_raw(self.header().state.load(Ordering::Acquire)).unwrap_or(SlotState::Empty)
    }

    /// Allocates a fresh sequence number.
    pub fn next_seq(&self) -> u64 {
        self.header()
            .next_seq
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// Writes a request and marks the slot `Command`.
    ///
    /// Must only be called by the lock holder while the slot is `Empty` or
    /// holds an orphaned `Response`.
    pub fn submit_request(&self, seq: u64, bytes: &[u8]) -> Result<(), SegmentError> {
        check_payload(bytes)?;
        let header = self.header();
        // SAFETY: the request area lies inside the mapping and the lock holder
        // is its only writer while the slot is not `Command`/`Executing`.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(REQUEST_OFFSET), bytes.len()) };
        header.request_len.store(bytes.len() as u32, Ordering::Relaxed);
        header.request_seq.store(seq, Ordering::Relaxed);
        header.state.store(SlotState::Command as u32, Ordering::Release);
        Ok(())
    }

    /// Withdraws a request the daemon has not picked up yet.
    pub fn withdraw_request(&self) -> bool {
        self.transition(SlotState::Command, SlotState::Empty)
    }

    /// Takes a pending request, moving the slot to `Executing`.
    pub fn take_request(&self) -> Option<(u64, Vec<u8>)> {
        if !self.transition(SlotState::Command, SlotState::Executing) {
            return None;
        }
        let header = self.header();
        let len = (header.request_len.load(Ordering::Relaxed) as usize).min(SLOT_CAPACITY);
        let seq = header.request_seq.load(Ordering::Relaxed);
        Some((seq, self.read_area(REQUEST_OFFSET, len)))
    }

    /// Writes the response to the request being executed.
    pub fn publish_response(&self, seq: u64, bytes: &[u8]) -> Result<(), SegmentError> {
        check_payload(bytes)?;
        let header = self.header();
        // SAFETY: the response area lies inside the mapping; the daemon owns
        // it while the slot is `Executing`.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(RESPONSE_OFFSET), bytes.len()) };
        header.response_len.store(bytes.len() as u32, Ordering::Relaxed);
        header.response_seq.store(seq, Ordering::Relaxed);
        header.state.store(SlotState::Response as u32, Ordering::Release);
        Ok(())
    }

    /// Takes the response for `seq`, returning the slot to `Empty`.
    pub fn take_response(&self, seq: u64) -> Option<Vec<u8>> {
        if self.state() != SlotState::Response {
            return None;
        }
        let header = self.header();
        if header.response_seq.load(Ordering::Relaxed) != seq {
            return None;
        }
        let len = (header.response_len.load(Ordering::Relaxed) as usize).min(SLOT_CAPACITY);
        let bytes = self.read_area(RESPONSE_OFFSET, len);
        self.transition(SlotState::Response, SlotState::Empty);
        Some(bytes)
    }

    /// Discards a response nobody is waiting for any more.
    pub fn discard_response(&self) -> bool {
        self.transition(SlotState::Response, SlotState::Empty)
    }

    fn transition(&self, from: SlotState, to: SlotState) -> bool {
        self.header()
            .state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn read_area(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        // SAFETY: offset + len stays within the mapping (len <= SLOT_CAPACITY).
        unsafe { ptr::copy_nonoverlapping(self.base.add(offset), out.as_mut_ptr(), len) };
        out
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: base was returned by a successful mmap of SEGMENT_SIZE bytes
        // and no reference into the mapping outlives `self`.
        if let Err(e) = unsafe { munmap(self.base.cast::<c_void>(), SEGMENT_SIZE) } {
            debug!(path = %self.path.display(), error = %e, "Failed to unmap command segment");
        }
        if self.owner {
            if let Err(e) = fs::remove_file(&self.path) {
                debug!(path = %self.path.display(), error = %e, "Failed to remove command segment");
            }
        }
    }
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("path", &self.path)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("lock_owner", &self.lock_owner())
            .finish()
    }
}

fn map_file(file: &File, path: &Path) -> Result<*mut u8, SegmentError> {
    // SAFETY: a fresh shared mapping of a file we hold open and sized to at
    // least SEGMENT_SIZE; it aliases no Rust object.
    let base = unsafe {
        mmap(
            ptr::null_mut(),
            SEGMENT_SIZE,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            file,
            0,
        )
    }
    .map_err(|errno| SegmentError::io(path, errno.into()))?;
    Ok(base.cast())
}

fn check_payload(bytes: &[u8]) -> Result<(), SegmentError> {
    if bytes.len() > SLOT_CAPACITY {
        return Err(SegmentError::PayloadTooLarge {
            size: bytes.len(),
            max: SLOT_CAPACITY,
        });
    }
    Ok(())
}

/// Errors raised by segment setup and slot access.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("I/O error on {path}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("{path} is not a texshare command segment")]
    BadMagic { path: PathBuf },

    #[error("Segment layout version {found}, expected {expected}")]
    LayoutMismatch { found: u32, expected: u32 },

    #[error("Segment is {size} bytes, expected at least {expected}")]
    TooSmall { size: u64, expected: u64 },

    #[error("Payload of {size} bytes exceeds slot capacity {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

impl SegmentError {
    fn io(path: &Path, error: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_pair() -> (tempfile::TempDir, ShmSegment, ShmSegment) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd");
        let daemon = ShmSegment::create(&path).unwrap();
        let client = ShmSegment::open(&path).unwrap();
        (dir, daemon, client)
    }

    #[test]
    fn test_lock_is_exclusive() {
        let (_dir, daemon, client) = segment_pair();

        assert!(client.try_lock(100));
        assert!(!client.try_lock(200));
        assert_eq!(daemon.lock_owner(), Some(100));

        assert!(!client.release_lock(200));
        assert!(client.release_lock(100));
        assert_eq!(daemon.lock_owner(), None);
        assert!(!client.try_lock(0));
    }

    #[test]
    fn test_clear_stale_lock_only_clears_named_owner() {
        let (_dir, daemon, client) = segment_pair();
        assert!(client.try_lock(100));

        assert!(!daemon.clear_stale_lock(999));
        assert_eq!(daemon.lock_owner(), Some(100));

        assert!(daemon.clear_stale_lock(100));
        assert_eq!(daemon.lock_owner(), None);
    }

    #[test]
    fn test_request_response_cycle_across_mappings() {
        let (_dir, daemon, client) = segment_pair();

        let seq = client.next_seq();
        client.submit_request(seq, b"hello").unwrap();
        assert_eq!(daemon.state(), SlotState::Command);

        let (got_seq, bytes) = daemon.take_request().unwrap();
        assert_eq!(got_seq, seq);
        assert_eq!(bytes, b"hello");
        assert_eq!(client.state(), SlotState::Executing);
        assert!(!client.withdraw_request());

        daemon.publish_response(seq, b"world").unwrap();
        assert_eq!(client.take_response(seq + 1), None);
        assert_eq!(client.take_response(seq).unwrap(), b"world");
        assert_eq!(daemon.state(), SlotState::Empty);
    }

    #[test]
    fn test_withdrawn_request_is_not_taken() {
        let (_dir, daemon, client) = segment_pair();

        client.submit_request(1, b"late").unwrap();
        assert!(client.withdraw_request());
        assert_eq!(daemon.take_request(), None);
        assert_eq!(daemon.state(), SlotState::Empty);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let (_dir, daemon, client) = segment_pair();
        let a = client.next_seq();
        let b = daemon.next_seq();
        assert!(b > a);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (_dir, _daemon, client) = segment_pair();
        let big = vec![b'x'; SLOT_CAPACITY + 1];
        assert!(matches!(
            client.submit_request(1, &big),
            Err(SegmentError::PayloadTooLarge { .. })
        ));
        assert_eq!(client.state(), SlotState::Empty);
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-segment");
        fs::write(&path, vec![0u8; SEGMENT_SIZE]).unwrap();
        assert!(matches!(
            ShmSegment::open(&path),
            Err(SegmentError::BadMagic { .. })
        ));

        fs::write(&path, b"short").unwrap();
        assert!(matches!(
            ShmSegment::open(&path),
            Err(SegmentError::TooSmall { .. })
        ));
    }

    #[test]
    fn test_poll_interval_bounds() {
        assert_eq!(poll_interval(Duration::from_secs(1)), Duration::from_millis(2));
        assert_eq!(poll_interval(Duration::from_millis(10)), Duration::from_millis(1));
        assert_eq!(poll_interval(Duration::ZERO), Duration::from_micros(100));
    }

    #[test]
    fn test_owner_removes_file_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd");
        let daemon = ShmSegment::create(&path).unwrap();
        let client = ShmSegment::open(&path).unwrap();
        drop(client);
        assert!(path.exists());
        drop(daemon);
        assert!(!path.exists());
    }
}
