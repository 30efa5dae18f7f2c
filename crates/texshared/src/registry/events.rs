//! Registry errors and events.
//!
//! This module defines:
//! - `RegistryError`: failures of a single command, each mapped to a wire `Status`
//! - `ImageEvent`: state changes published to in-process subscribers
//! - `DestroyReason`: why an image's resources were released

use texshare_core::{ImageDescriptor, ImageId, ImageName, ProcessId};
use texshare_protocol::Status;
use thiserror::Error;

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur while executing a command against the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry has reached its maximum image capacity.
    #[error("registry is full (max: {max} images)")]
    RegistryFull { max: usize },

    /// The liveness set has reached its maximum process capacity.
    #[error("too many registered processes (max: {max})")]
    TooManyProcesses { max: usize },

    /// No image is published under this name.
    #[error("image not found: {0}")]
    ImageNotFound(ImageName),

    /// A join asked for different dimensions or format.
    #[error("image {name} exists as {existing}, requested {requested}")]
    DefinitionMismatch {
        name: ImageName,
        existing: ImageDescriptor,
        requested: ImageDescriptor,
    },

    /// A rename target is already in use.
    #[error("image name already in use: {0}")]
    NameTaken(ImageName),

    /// The requester never joined the image.
    #[error("process {pid} does not hold image {name}")]
    NotOwner { name: ImageName, pid: ProcessId },

    /// The command carried invalid values.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The GPU backend failed to allocate the image.
    #[error("allocation failed: {0}")]
    Allocation(String),
}

impl RegistryError {
    /// Wire status reported to the client for this failure.
    pub fn status(&self) -> Status {
        match self {
            Self::RegistryFull { .. } | Self::TooManyProcesses { .. } => Status::CapacityExceeded,
            Self::ImageNotFound(_) => Status::NotFound,
            Self::DefinitionMismatch { .. } | Self::NameTaken(_) => Status::Conflict,
            Self::NotOwner { .. } => Status::PermissionDenied,
            Self::Invalid(_) => Status::MalformedRequest,
            Self::Allocation(_) => Status::AllocationFailed,
        }
    }
}

// ============================================================================
// Image Events
// ============================================================================

/// Events published by the dispatcher after each state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageEvent {
    /// A process entered the liveness set.
    ProcessRegistered { pid: ProcessId },

    /// A new image was allocated.
    Created {
        id: ImageId,
        name: ImageName,
        pid: ProcessId,
    },

    /// A process attached to an existing image.
    Joined {
        id: ImageId,
        name: ImageName,
        pid: ProcessId,
    },

    /// An image changed its name.
    Renamed {
        id: ImageId,
        old_name: ImageName,
        new_name: ImageName,
    },

    /// An image's resources were released.
    Destroyed {
        id: ImageId,
        name: ImageName,
        reason: DestroyReason,
    },

    /// A process left the liveness set.
    ProcessRemoved { pid: ProcessId },
}

/// Reason why an image was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// Every process holding the image died.
    ProcessDied,

    /// The daemon is shutting down.
    Shutdown,
}

impl std::fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProcessDied => write!(f, "all holders died"),
            Self::Shutdown => write!(f, "daemon shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use texshare_core::ImageFormat;

    fn name(s: &str) -> ImageName {
        ImageName::new(s).unwrap()
    }

    #[test]
    fn test_registry_error_status_mapping() {
        let d = ImageDescriptor::new(1, 1, ImageFormat::R8G8B8A8).unwrap();
        let cases = [
            (RegistryError::RegistryFull { max: 2 }, Status::CapacityExceeded),
            (RegistryError::TooManyProcesses { max: 2 }, Status::CapacityExceeded),
            (RegistryError::ImageNotFound(name("a")), Status::NotFound),
            (
                RegistryError::DefinitionMismatch {
                    name: name("a"),
                    existing: d,
                    requested: d,
                },
                Status::Conflict,
            ),
            (RegistryError::NameTaken(name("a")), Status::Conflict),
            (
                RegistryError::NotOwner {
                    name: name("a"),
                    pid: ProcessId::new(3).unwrap(),
                },
                Status::PermissionDenied,
            ),
            (RegistryError::Invalid("x".into()), Status::MalformedRequest),
            (RegistryError::Allocation("x".into()), Status::AllocationFailed),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::RegistryFull { max: 100 };
        assert_eq!(err.to_string(), "registry is full (max: 100 images)");

        let err = RegistryError::NotOwner {
            name: name("tex"),
            pid: ProcessId::new(12).unwrap(),
        };
        assert_eq!(err.to_string(), "process 12 does not hold image tex");
    }

    #[test]
    fn test_destroy_reason_display() {
        assert_eq!(DestroyReason::ProcessDied.to_string(), "all holders died");
        assert_eq!(DestroyReason::Shutdown.to_string(), "daemon shutdown");
    }
}
