//! Importing exported handles into the calling process.
//!
//! Handle values in an [`ExternalHandles`] are file descriptors of the daemon.
//! They are duplicated into this process with `pidfd_open(2)` followed by
//! `pidfd_getfd(2)`, which requires ptrace access to the daemon (same user,
//! subject to the Yama `ptrace_scope` setting).

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use rustix::io::fcntl_dupfd_cloexec;
use rustix::process::{pidfd_getfd, pidfd_open, Pid, PidfdFlags, PidfdGetfdFlags};
use tracing::debug;

use texshare_core::{ExternalHandles, ProcessId, RawHandle};

use crate::error::ClientError;

/// Local duplicates of one image's memory and semaphore handles.
#[derive(Debug)]
pub struct ImportedImage {
    pub memory: OwnedFd,
    pub semaphore_read: OwnedFd,
    pub semaphore_write: OwnedFd,
    pub allocation_size: u64,
}

/// Duplicates every handle in `handles` into the calling process.
pub fn import_handles(handles: &ExternalHandles) -> Result<ImportedImage, ClientError> {
    if !handles.is_complete() {
        return Err(ClientError::Import("incomplete handle set".to_string()));
    }

    let source = HandleSource::open(handles.owner_pid)?;
    let imported = ImportedImage {
        memory: source.duplicate(handles.memory)?,
        semaphore_read: source.duplicate(handles.semaphore_read)?,
        semaphore_write: source.duplicate(handles.semaphore_write)?,
        allocation_size: handles.allocation_size,
    };
    debug!(
        owner = %handles.owner_pid,
        memory = imported.memory.as_raw_fd(),
        size = imported.allocation_size,
        "Imported image handles"
    );
    Ok(imported)
}

enum HandleSource {
    /// The handles already live in this process
    Local,
    Remote(OwnedFd),
}

impl HandleSource {
    fn open(owner: ProcessId) -> Result<Self, ClientError> {
        if owner == ProcessId::current() {
            return Ok(Self::Local);
        }
        let pid = i32::try_from(owner.get())
            .ok()
            .and_then(Pid::from_raw)
            .ok_or_else(|| ClientError::Import(format!("pid {owner} out of range")))?;
        let pidfd = pidfd_open(pid, PidfdFlags::empty()).map_err(import_error("pidfd_open"))?;
        Ok(Self::Remote(pidfd))
    }

    fn duplicate(&self, handle: RawHandle) -> Result<OwnedFd, ClientError> {
        let target = RawFd::try_from(handle.get())
            .map_err(|_| ClientError::Import(format!("handle {handle} out of range")))?;

        match self {
            Self::Local => {
                // SAFETY: only used for the duration of the fcntl call; a
                // closed descriptor makes it fail with EBADF.
                let fd = unsafe { BorrowedFd::borrow_raw(target) };
                fcntl_dupfd_cloexec(fd, 0).map_err(import_error("fcntl"))
            }
            Self::Remote(pidfd) => pidfd_getfd(pidfd.as_fd(), target, PidfdGetfdFlags::empty())
                .map_err(import_error("pidfd_getfd")),
        }
    }
}

fn import_error(op: &'static str) -> impl FnOnce(rustix::io::Errno) -> ClientError {
    move |errno| ClientError::Import(format!("{op}: {errno}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_handles_rejected() {
        let handles = ExternalHandles {
            owner_pid: ProcessId::current(),
            memory: RawHandle::INVALID,
            semaphore_read: RawHandle::new(0),
            semaphore_write: RawHandle::new(0),
            allocation_size: 0,
        };
        assert!(matches!(import_handles(&handles), Err(ClientError::Import(_))));
    }

    #[test]
    fn test_import_from_own_process() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(128).unwrap();
        let raw = RawHandle::new(i64::from(file.as_raw_fd()));
        let handles = ExternalHandles {
            owner_pid: ProcessId::current(),
            memory: raw,
            semaphore_read: raw,
            semaphore_write: raw,
            allocation_size: 128,
        };

        let imported = import_handles(&handles).unwrap();
        assert_ne!(imported.memory.as_raw_fd(), file.as_raw_fd());
        let dup = std::fs::File::from(imported.memory);
        assert_eq!(dup.metadata().unwrap().len(), 128);
    }

    #[test]
    fn test_closed_handle_fails() {
        let handles = ExternalHandles {
            owner_pid: ProcessId::current(),
            memory: RawHandle::new(1_000_000),
            semaphore_read: RawHandle::new(1_000_000),
            semaphore_write: RawHandle::new(1_000_000),
            allocation_size: 1,
        };
        assert!(matches!(import_handles(&handles), Err(ClientError::Import(_))));
    }
}
