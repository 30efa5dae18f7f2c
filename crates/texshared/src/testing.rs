//! In-memory fakes for exercising the daemon without real processes or GPUs.
//!
//! Both fakes are cheap to clone and share their state between clones, so a
//! test can hand one copy to the dispatcher and keep another to drive and
//! inspect it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use texshare_core::{ExternalHandles, ImageDescriptor, ProcessId, ProcessProbe, RawHandle};

use crate::gpu::{GpuBackend, GpuError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Fake Process Table
// ============================================================================

/// Process table keyed by pid, holding a start time per running process.
#[derive(Debug, Clone, Default)]
pub struct FakeProbe {
    table: Arc<Mutex<HashMap<ProcessId, u64>>>,
    clock: Arc<AtomicU64>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Starts a process under `pid`.
    pub fn spawn(&self, pid: ProcessId) {
        let started = self.tick();
        lock(&self.table).insert(pid, started);
    }

    /// Terminates the process under `pid`.
    pub fn kill(&self, pid: ProcessId) {
        lock(&self.table).remove(&pid);
    }

    /// Replaces the process under `pid` with a new one (pid reuse).
    pub fn reuse(&self, pid: ProcessId) {
        self.spawn(pid);
    }
}

impl ProcessProbe for FakeProbe {
    fn start_time(&self, pid: ProcessId) -> Option<u64> {
        lock(&self.table).get(&pid).copied()
    }
}

// ============================================================================
// Counting GPU Backend
// ============================================================================

/// Allocation handed out by [`CountingBackend`].
#[derive(Debug)]
pub struct CountedAllocation {
    serial: u64,
}

impl CountedAllocation {
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

#[derive(Debug, Default)]
struct Ledger {
    allocated: u64,
    /// Release count per allocation serial
    releases: HashMap<u64, u32>,
}

/// GPU backend that records every allocation and release.
#[derive(Debug, Clone, Default)]
pub struct CountingBackend {
    ledger: Arc<Mutex<Ledger>>,
    fail_next: Arc<AtomicBool>,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next allocation fail.
    pub fn fail_next_allocation(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }

    pub fn allocated(&self) -> u64 {
        lock(&self.ledger).allocated
    }

    /// Number of distinct allocations released at least once.
    pub fn released(&self) -> u64 {
        lock(&self.ledger).releases.len() as u64
    }

    /// Allocations not yet released.
    pub fn live(&self) -> u64 {
        self.allocated().saturating_sub(self.released())
    }

    /// How many times the allocation with `serial` was released.
    pub fn release_count(&self, serial: u64) -> u32 {
        lock(&self.ledger)
            .releases
            .get(&serial)
            .copied()
            .unwrap_or(0)
    }

    /// True if any allocation was released more than once.
    pub fn any_double_release(&self) -> bool {
        lock(&self.ledger).releases.values().any(|count| *count > 1)
    }
}

impl GpuBackend for CountingBackend {
    type Allocation = CountedAllocation;

    fn allocate_shared_image(
        &mut self,
        descriptor: &ImageDescriptor,
    ) -> Result<(CountedAllocation, ExternalHandles), GpuError> {
        if self.fail_next.swap(false, Ordering::Relaxed) {
            return Err(GpuError::Unsupported {
                descriptor: *descriptor,
                reason: "injected allocation failure".to_string(),
            });
        }

        let mut ledger = lock(&self.ledger);
        ledger.allocated += 1;
        let serial = ledger.allocated;
        let base = i64::try_from(serial).unwrap_or(i64::MAX / 4).saturating_mul(3);

        let handles = ExternalHandles {
            owner_pid: ProcessId::current(),
            memory: RawHandle::new(base),
            semaphore_read: RawHandle::new(base + 1),
            semaphore_write: RawHandle::new(base + 2),
            allocation_size: descriptor.byte_size(),
        };
        Ok((CountedAllocation { serial }, handles))
    }

    fn release_shared_image(&mut self, allocation: CountedAllocation) {
        *lock(&self.ledger)
            .releases
            .entry(allocation.serial)
            .or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use texshare_core::ImageFormat;

    #[test]
    fn test_fake_probe_reuse_changes_start_time() {
        let probe = FakeProbe::new();
        let pid = ProcessId::new(4).unwrap();
        assert_eq!(probe.start_time(pid), None);

        probe.spawn(pid);
        let first = probe.start_time(pid).unwrap();
        probe.clone().reuse(pid);
        assert_ne!(probe.start_time(pid), Some(first));

        probe.kill(pid);
        assert_eq!(probe.start_time(pid), None);
    }

    #[test]
    fn test_counting_backend_tracks_releases() {
        let mut backend = CountingBackend::new();
        let observer = backend.clone();
        let d = ImageDescriptor::new(2, 2, ImageFormat::R8G8B8A8).unwrap();

        let (a, handles) = backend.allocate_shared_image(&d).unwrap();
        assert!(handles.is_complete());
        assert_eq!(observer.live(), 1);

        let serial = a.serial();
        backend.release_shared_image(a);
        assert_eq!(observer.release_count(serial), 1);
        assert_eq!(observer.live(), 0);
        assert!(!observer.any_double_release());

        observer.fail_next_allocation();
        assert!(backend.allocate_shared_image(&d).is_err());
        assert!(backend.allocate_shared_image(&d).is_ok());
    }
}
