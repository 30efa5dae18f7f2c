//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors raised while validating domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Image name is empty, too long or contains a NUL byte
    #[error("Invalid image name {name:?}: {reason}")]
    InvalidImageName { name: String, reason: String },

    /// Width or height outside the supported range
    #[error("Invalid image dimensions {width}x{height} (each must be 1..={max})")]
    InvalidDimensions { width: u32, height: u32, max: u32 },

    /// Process id 0 never names a real client
    #[error("Invalid process id: {0}")]
    InvalidProcessId(u32),
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
