//! GPU allocation backend.
//!
//! The dispatcher never talks to a graphics API directly. It asks a
//! [`GpuBackend`] for an image plus its exportable handles, and later gives
//! the allocation back. Because [`GpuBackend::release_shared_image`] takes
//! the allocation by value and allocations cannot be cloned, every image is
//! released at most once.
//!
//! [`HostMemoryBackend`] is the default backend: it exports an anonymous
//! memory file for the pixel data and two eventfds standing in for the
//! read/write semaphores, all of which a client can duplicate with
//! `pidfd_getfd(2)`.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use rustix::event::{eventfd, EventfdFlags};
use rustix::fs::{ftruncate, memfd_create, MemfdFlags};
use thiserror::Error;
use tracing::{debug, trace};

use texshare_core::{ExternalHandles, ImageDescriptor, ProcessId, RawHandle};

/// Errors raised by a GPU backend.
#[derive(Debug, Error)]
pub enum GpuError {
    /// The backend cannot represent this image.
    #[error("unsupported image {descriptor}: {reason}")]
    Unsupported {
        descriptor: ImageDescriptor,
        reason: String,
    },

    /// An OS call failed while allocating.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl GpuError {
    fn os(op: &'static str) -> impl FnOnce(rustix::io::Errno) -> Self {
        move |errno| Self::Os {
            op,
            source: io::Error::from(errno),
        }
    }
}

/// Allocates and releases shareable images.
pub trait GpuBackend: Send {
    /// Backend-owned resources of one image. Dropping it without calling
    /// [`release_shared_image`](Self::release_shared_image) must still be
    /// memory safe, but may skip backend bookkeeping.
    type Allocation: Send + 'static;

    /// Allocates an image and exports its memory and semaphore handles.
    fn allocate_shared_image(
        &mut self,
        descriptor: &ImageDescriptor,
    ) -> Result<(Self::Allocation, ExternalHandles), GpuError>;

    /// Releases everything behind `allocation`.
    fn release_shared_image(&mut self, allocation: Self::Allocation);
}

// ============================================================================
// Host Memory Backend
// ============================================================================

/// Descriptors backing one host-memory image.
#[derive(Debug)]
pub struct HostAllocation {
    memory: OwnedFd,
    semaphore_read: OwnedFd,
    semaphore_write: OwnedFd,
    size: u64,
}

impl HostAllocation {
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Backend exporting memfd-backed images with eventfd semaphores.
#[derive(Debug, Default)]
pub struct HostMemoryBackend {
    live: usize,
}

impl HostMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocations not yet released.
    pub fn live_allocations(&self) -> usize {
        self.live
    }
}

impl GpuBackend for HostMemoryBackend {
    type Allocation = HostAllocation;

    fn allocate_shared_image(
        &mut self,
        descriptor: &ImageDescriptor,
    ) -> Result<(HostAllocation, ExternalHandles), GpuError> {
        let size = descriptor.byte_size();
        if i64::try_from(size).is_err() {
            return Err(GpuError::Unsupported {
                descriptor: *descriptor,
                reason: format!("{size} bytes exceeds the file size limit"),
            });
        }

        let memory =
            memfd_create(MEMFD_NAME, MemfdFlags::CLOEXEC).map_err(GpuError::os("memfd_create"))?;
        ftruncate(&memory, size).map_err(GpuError::os("ftruncate"))?;
        let semaphore_read = semaphore()?;
        let semaphore_write = semaphore()?;

        let handles = ExternalHandles {
            owner_pid: ProcessId::current(),
            memory: RawHandle::new(i64::from(memory.as_raw_fd())),
            semaphore_read: RawHandle::new(i64::from(semaphore_read.as_raw_fd())),
            semaphore_write: RawHandle::new(i64::from(semaphore_write.as_raw_fd())),
            allocation_size: size,
        };
        self.live += 1;
        debug!(%descriptor, size, memory = %handles.memory, "Allocated host image");

        Ok((
            HostAllocation {
                memory,
                semaphore_read,
                semaphore_write,
                size,
            },
            handles,
        ))
    }

    fn release_shared_image(&mut self, allocation: HostAllocation) {
        self.live = self.live.saturating_sub(1);
        trace!(
            memory = allocation.memory.as_raw_fd(),
            read = allocation.semaphore_read.as_raw_fd(),
            write = allocation.semaphore_write.as_raw_fd(),
            "Releasing host image"
        );
        drop(allocation);
    }
}

const MEMFD_NAME: &str = "texshare-image";

fn semaphore() -> Result<OwnedFd, GpuError> {
    eventfd(0, EventfdFlags::CLOEXEC).map_err(GpuError::os("eventfd"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use texshare_core::ImageFormat;

    #[test]
    fn test_host_backend_allocates_sized_memory() {
        let mut backend = HostMemoryBackend::new();
        let descriptor = ImageDescriptor::new(16, 8, ImageFormat::R8G8B8A8).unwrap();

        let (allocation, handles) = backend.allocate_shared_image(&descriptor).unwrap();
        assert!(handles.is_complete());
        assert_eq!(handles.owner_pid, ProcessId::current());
        assert_eq!(handles.allocation_size, 16 * 8 * 4);
        assert_eq!(allocation.size(), 512);

        let meta = std::fs::metadata(format!("/proc/self/fd/{}", handles.memory)).unwrap();
        assert_eq!(meta.len(), 512);
        assert_eq!(backend.live_allocations(), 1);

        backend.release_shared_image(allocation);
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_handles_are_distinct() {
        let mut backend = HostMemoryBackend::new();
        let descriptor = ImageDescriptor::new(1, 1, ImageFormat::B8G8R8).unwrap();
        let (a, ha) = backend.allocate_shared_image(&descriptor).unwrap();
        let (b, hb) = backend.allocate_shared_image(&descriptor).unwrap();

        assert_ne!(ha.memory, hb.memory);
        assert_ne!(ha.semaphore_read, ha.semaphore_write);

        backend.release_shared_image(a);
        backend.release_shared_image(b);
    }
}
