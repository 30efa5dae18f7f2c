//! texshare core - shared domain types for GPU image brokering
//!
//! This crate provides the value types shared between the daemon
//! (texshared), the wire protocol and client processes.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod handles;
pub mod image;
pub mod process;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use handles::{ExternalHandles, RawHandle};
pub use image::{
    ImageDescriptor, ImageFormat, ImageId, ImageName, MAX_IMAGE_DIMENSION, MAX_IMAGE_NAME_LEN,
};
pub use process::{ProcessId, ProcessIdentity, ProcessProbe, ProcfsProbe};
