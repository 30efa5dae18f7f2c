//! Exportable GPU handles as they travel over the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::process::ProcessId;

/// Opaque OS-level handle value (a file descriptor on Linux).
///
/// Only meaningful inside the process named by
/// [`ExternalHandles::owner_pid`]; the registry forwards it untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawHandle(i64);

impl RawHandle {
    pub const INVALID: RawHandle = RawHandle(-1);

    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The exported memory and semaphore handles of one shared image.
///
/// `semaphore_read` is signaled when new content is ready to read,
/// `semaphore_write` when the consumer is done and the producer may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalHandles {
    /// Process in which the raw values are valid (the daemon).
    pub owner_pid: ProcessId,
    pub memory: RawHandle,
    pub semaphore_read: RawHandle,
    pub semaphore_write: RawHandle,
    /// Size in bytes of the memory allocation.
    pub allocation_size: u64,
}

impl ExternalHandles {
    /// True when every handle holds a usable value.
    pub fn is_complete(&self) -> bool {
        self.memory.is_valid() && self.semaphore_read.is_valid() && self.semaphore_write.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_completeness() {
        let mut handles = ExternalHandles {
            owner_pid: ProcessId::new(1).unwrap(),
            memory: RawHandle::new(3),
            semaphore_read: RawHandle::new(4),
            semaphore_write: RawHandle::new(5),
            allocation_size: 16,
        };
        assert!(handles.is_complete());

        handles.semaphore_write = RawHandle::INVALID;
        assert!(!handles.is_complete());
    }

    #[test]
    fn test_raw_handle_is_transparent_on_the_wire() {
        let json = serde_json::to_string(&RawHandle::new(12)).unwrap();
        assert_eq!(json, "12");
    }
}
